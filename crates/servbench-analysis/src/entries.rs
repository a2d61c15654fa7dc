use crate::{Configuration, MetricMap};
use anyhow::{anyhow, Result};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use tracing::warn;

const RESERVED_FIELDS: [&str; 4] = ["run_name", "batch_size", "input_len", "output_len"];

/// One line of `result.jsonl`: a single trial's metrics tagged with its run
/// identifier and configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultEntry {
    pub run_name: String,
    pub configuration: Configuration,
    pub metrics: MetricMap,
}

impl ResultEntry {
    pub fn new(run_name: &str, configuration: Configuration, metrics: MetricMap) -> Self {
        Self {
            run_name: run_name.to_string(),
            configuration,
            metrics,
        }
    }

    pub fn metric(&self, name: &str) -> Option<f64> {
        self.metrics.get(name).copied()
    }

    pub fn from_json(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| anyhow!("result entry is not a JSON object"))?;
        let run_name = obj
            .get("run_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| anyhow!("result entry missing run_name"))?
            .to_string();
        let dim = |key: &str| -> Result<u64> {
            obj.get(key)
                .and_then(|v| v.as_u64())
                .ok_or_else(|| anyhow!("result entry {} missing integer {}", run_name, key))
        };
        let configuration = Configuration::new(
            dim("batch_size")?,
            dim("input_len")?,
            dim("output_len")?,
        );
        let mut metrics = MetricMap::new();
        for (key, v) in obj.iter() {
            if RESERVED_FIELDS.contains(&key.as_str()) {
                continue;
            }
            if let Some(n) = v.as_f64() {
                metrics.insert(key.clone(), n);
            }
        }
        Ok(Self {
            run_name,
            configuration,
            metrics,
        })
    }

    pub fn to_json(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("run_name".to_string(), Value::from(self.run_name.clone()));
        obj.insert(
            "batch_size".to_string(),
            Value::from(self.configuration.batch_size),
        );
        obj.insert(
            "input_len".to_string(),
            Value::from(self.configuration.input_len),
        );
        obj.insert(
            "output_len".to_string(),
            Value::from(self.configuration.output_len),
        );
        for (k, v) in self.metrics.iter() {
            obj.insert(k.clone(), Value::from(*v));
        }
        Value::Object(obj)
    }
}

#[derive(Debug, Default)]
pub struct LoadedEntries {
    pub entries: Vec<ResultEntry>,
    pub malformed: usize,
}

pub fn load_result_entries(path: &Path) -> Result<LoadedEntries> {
    if !path.exists() {
        return Err(anyhow!("results file not found: {}", path.display()));
    }
    let raw = fs::read_to_string(path)?;
    Ok(parse_result_lines(&raw))
}

pub fn parse_result_lines(raw: &str) -> LoadedEntries {
    let mut loaded = LoadedEntries::default();
    for (idx, line) in raw.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let parsed = serde_json::from_str::<Value>(line)
            .map_err(anyhow::Error::from)
            .and_then(|v| ResultEntry::from_json(&v));
        match parsed {
            Ok(entry) => loaded.entries.push(entry),
            Err(err) => {
                warn!(line = idx + 1, error = %err, "skipping malformed result line");
                loaded.malformed += 1;
            }
        }
    }
    loaded
}
