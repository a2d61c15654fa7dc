use serde::Serialize;
use servbench_analysis::{Configuration, MetricMap, MetricStats, ResultEntry};
use std::collections::{BTreeMap, BTreeSet};

/// Metrics of one successful trial.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialResult {
    pub run_name: String,
    pub ordinal: usize,
    pub metrics: MetricMap,
}

/// Successful trials of one (model, configuration) session together with
/// their aggregate, which is rebuilt on every append.
#[derive(Debug, Clone, PartialEq)]
pub struct RunRecord {
    model: String,
    configuration: Configuration,
    trials: Vec<TrialResult>,
    aggregate: BTreeMap<String, MetricStats>,
}

impl RunRecord {
    pub fn new(model: &str, configuration: Configuration) -> Self {
        Self {
            model: model.to_string(),
            configuration,
            trials: Vec::new(),
            aggregate: BTreeMap::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn configuration(&self) -> Configuration {
        self.configuration
    }

    pub fn trials(&self) -> &[TrialResult] {
        &self.trials
    }

    pub fn aggregate(&self) -> &BTreeMap<String, MetricStats> {
        &self.aggregate
    }

    pub fn push(&mut self, trial: TrialResult) {
        self.trials.push(trial);
        self.recompute();
    }

    fn recompute(&mut self) {
        let names: BTreeSet<&String> = self.trials.iter().flat_map(|t| t.metrics.keys()).collect();
        let mut aggregate = BTreeMap::new();
        for name in names {
            let values: Vec<f64> = self
                .trials
                .iter()
                .filter_map(|t| t.metrics.get(name).copied())
                .collect();
            if let Some(stats) = MetricStats::from_values(&values) {
                aggregate.insert(name.clone(), stats);
            }
        }
        self.aggregate = aggregate;
    }

    pub fn entries(&self) -> Vec<ResultEntry> {
        self.trials
            .iter()
            .map(|t| ResultEntry::new(&t.run_name, self.configuration, t.metrics.clone()))
            .collect()
    }
}
