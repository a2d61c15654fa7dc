use crate::catalog::ReportCatalog;
use crate::entries::ResultEntry;
use crate::naming::canonical_model_name;
use crate::stats::MetricStats;
use crate::{Configuration, OUTPUT_THROUGHPUT};
use std::collections::BTreeMap;
use tracing::debug;

/// All entries sharing one (configuration, logical model) key. Each entry is
/// one equally weighted sample, whichever session produced it.
#[derive(Debug, Clone)]
pub struct ModelGroup {
    pub model: String,
    pub entries: Vec<ResultEntry>,
}

impl ModelGroup {
    pub fn values(&self, metric: &str) -> Vec<f64> {
        self.entries.iter().filter_map(|e| e.metric(metric)).collect()
    }

    pub fn stats(&self, metric: &str) -> Option<MetricStats> {
        MetricStats::from_values(&self.values(metric))
    }

    /// Ranking key; a group without output throughput ranks as zero.
    pub fn mean_output_throughput(&self) -> f64 {
        self.stats(OUTPUT_THROUGHPUT).map(|s| s.mean).unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub skipped_models: usize,
    pub skipped_configs: usize,
}

/// Entries grouped by configuration, then by logical model name. Models keep
/// first-seen input order inside a configuration.
#[derive(Debug, Clone, Default)]
pub struct GroupedReport {
    pub configs: BTreeMap<Configuration, Vec<ModelGroup>>,
}

impl GroupedReport {
    pub fn build(entries: &[ResultEntry]) -> Self {
        let mut report = Self::default();
        for entry in entries {
            report.insert(canonical_model_name(&entry.run_name), entry.clone());
        }
        report
    }

    /// Like `build`, restricted to the catalog's models and configurations.
    pub fn build_selected(entries: &[ResultEntry], catalog: &ReportCatalog) -> (Self, Exclusions) {
        let mut report = Self::default();
        let mut exclusions = Exclusions::default();
        for entry in entries {
            let model = canonical_model_name(&entry.run_name);
            if !catalog.has_model(&model) {
                debug!(run_name = %entry.run_name, model = %model, "model not in catalog");
                exclusions.skipped_models += 1;
                continue;
            }
            if !catalog.has_configuration(&entry.configuration) {
                debug!(run_name = %entry.run_name, config = %entry.configuration, "configuration not in catalog");
                exclusions.skipped_configs += 1;
                continue;
            }
            report.insert(model, entry.clone());
        }
        (report, exclusions)
    }

    fn insert(&mut self, model: String, entry: ResultEntry) {
        let groups = self.configs.entry(entry.configuration).or_default();
        match groups.iter_mut().find(|g| g.model == model) {
            Some(group) => group.entries.push(entry),
            None => groups.push(ModelGroup {
                model,
                entries: vec![entry],
            }),
        }
    }

    pub fn group(&self, config: &Configuration, model: &str) -> Option<&ModelGroup> {
        self.configs
            .get(config)
            .and_then(|groups| groups.iter().find(|g| g.model == model))
    }

    /// Groups of one configuration by descending mean output throughput; the
    /// sort is stable so ties keep input order.
    pub fn ranked(&self, config: &Configuration) -> Vec<&ModelGroup> {
        let mut groups: Vec<&ModelGroup> = self
            .configs
            .get(config)
            .map(|g| g.iter().collect())
            .unwrap_or_default();
        groups.sort_by(|a, b| {
            b.mean_output_throughput()
                .partial_cmp(&a.mean_output_throughput())
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        groups
    }

    pub fn entry_count(&self) -> usize {
        self.configs
            .values()
            .flat_map(|groups| groups.iter())
            .map(|g| g.entries.len())
            .sum()
    }
}
