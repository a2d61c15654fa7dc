use crate::plan::SessionConfig;
use crate::record::RunRecord;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use servbench_analysis::ResultEntry;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const RESULTS_FILE: &str = "result.jsonl";

pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path)
        .map_err(|e| anyhow!("failed to create directory {}: {}", path.display(), e))
}

fn temp_sibling(path: &Path) -> PathBuf {
    let ts = chrono::Utc::now().timestamp_micros();
    let pid = std::process::id();
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tmpfile");
    path.with_file_name(format!(".{}.tmp.{}.{}", name, pid, ts))
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    Ok(())
}

pub fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    let tmp = temp_sibling(path);
    write_synced(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = fs::File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Publishes `bytes` under `<stem>.<ext>` in `dir`, or `<stem>_<n>.<ext>`
/// when that name is taken. The file never exists half-written and an
/// existing file is never replaced. Returns the chosen stem and path.
pub fn create_new_with_contents(
    dir: &Path,
    stem: &str,
    ext: &str,
    bytes: &[u8],
) -> Result<(String, PathBuf)> {
    ensure_dir(dir)?;
    let tmp = temp_sibling(&dir.join(format!("{}.{}", stem, ext)));
    write_synced(&tmp, bytes)?;
    let mut n = 1usize;
    let result = loop {
        let candidate_stem = if n == 1 {
            stem.to_string()
        } else {
            format!("{}_{}", stem, n)
        };
        let candidate = dir.join(format!("{}.{}", candidate_stem, ext));
        match fs::hard_link(&tmp, &candidate) {
            Ok(()) => break Ok((candidate_stem, candidate)),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => n += 1,
            Err(e) => break Err(e.into()),
        }
    };
    let _ = fs::remove_file(&tmp);
    result
}

#[derive(Debug, Clone)]
pub struct PersistedPaths {
    pub record: PathBuf,
    pub summary: PathBuf,
    pub raw_logs: Vec<PathBuf>,
}

/// On-disk layout shared by every session: per-model record directories,
/// server logs, and the flat `result.jsonl`.
#[derive(Debug, Clone)]
pub struct ResultStore {
    root: PathBuf,
}

impl ResultStore {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn results_file(&self) -> PathBuf {
        self.root.join(RESULTS_FILE)
    }

    pub fn result_dir(&self, model: &str) -> PathBuf {
        self.root.join("result_logs").join(model)
    }

    pub fn server_log_path(&self, model: &str, timestamp: &str, port: u16) -> Result<PathBuf> {
        let dir = self.root.join("server_logs").join(model);
        ensure_dir(&dir)?;
        Ok(dir.join(format!("server_{}_{}.log", timestamp, port)))
    }

    /// Appends one line per entry. Each line goes out in a single write on an
    /// append-mode handle, so concurrent sessions never interleave within a line.
    pub fn append_entries(&self, entries: &[ResultEntry]) -> Result<()> {
        ensure_dir(&self.root)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.results_file())?;
        for entry in entries {
            let mut line = serde_json::to_string(&entry.to_json())?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
        }
        file.sync_all()?;
        Ok(())
    }

    pub fn persist_session(
        &self,
        config: &SessionConfig,
        record: &RunRecord,
        raw_outputs: &[String],
        timestamp: &str,
    ) -> Result<PersistedPaths> {
        let dir = self.result_dir(record.model());
        let payload = session_json(config, record, raw_outputs.len(), timestamp);
        let bytes = serde_json::to_vec_pretty(&payload)?;
        let (stem, record_path) =
            create_new_with_contents(&dir, &format!("benchmark_{}", timestamp), "json", &bytes)?;

        let mut raw_logs = Vec::new();
        for (idx, output) in raw_outputs.iter().enumerate() {
            let path = dir.join(format!("{}_run{}.log", stem, idx + 1));
            atomic_write_bytes(&path, output.as_bytes())?;
            raw_logs.push(path);
        }

        let summary = dir.join(format!("{}_summary.txt", stem));
        atomic_write_bytes(
            &summary,
            session_summary_text(config, record, timestamp).as_bytes(),
        )?;

        self.append_entries(&record.entries())?;
        info!(model = record.model(), path = %record_path.display(), "results saved");
        Ok(PersistedPaths {
            record: record_path,
            summary,
            raw_logs,
        })
    }

    /// Newest `benchmark_*.json` per model directory under `result_logs/`.
    pub fn load_latest_records(&self) -> Result<BTreeMap<String, Value>> {
        let base = self.root.join("result_logs");
        let mut candidates: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
        if !base.exists() {
            return Ok(BTreeMap::new());
        }
        for entry in WalkDir::new(&base).min_depth(2).max_depth(2) {
            let entry = entry?;
            let path = entry.path();
            let name = match path.file_name().and_then(|s| s.to_str()) {
                Some(n) => n,
                None => continue,
            };
            if !(name.starts_with("benchmark_") && name.ends_with(".json")) {
                continue;
            }
            let model = match path
                .parent()
                .and_then(|p| p.file_name())
                .and_then(|s| s.to_str())
            {
                Some(m) => m.to_string(),
                None => continue,
            };
            candidates.entry(model).or_default().push(path.to_path_buf());
        }

        let mut latest = BTreeMap::new();
        for (model, mut paths) in candidates {
            paths.sort_by_cached_key(|p| record_order_key(p));
            for path in paths.iter().rev() {
                match fs::read(path)
                    .map_err(anyhow::Error::from)
                    .and_then(|b| serde_json::from_slice::<Value>(&b).map_err(Into::into))
                {
                    Ok(value) => {
                        latest.insert(model.clone(), value);
                        break;
                    }
                    Err(err) => {
                        warn!(path = %path.display(), error = %err, "unreadable record");
                    }
                }
            }
        }
        debug!(models = latest.len(), "loaded latest records");
        Ok(latest)
    }
}

/// `benchmark_<date>_<time>[_<n>].json` orders by timestamp, then by the
/// numeric collision suffix (an unsuffixed file counts as 1).
fn record_order_key(path: &Path) -> (String, u64) {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    let stamp = stem.strip_prefix("benchmark_").unwrap_or(stem);
    let parts: Vec<&str> = stamp.split('_').collect();
    if parts.len() == 3 {
        if let Ok(n) = parts[2].parse::<u64>() {
            return (format!("{}_{}", parts[0], parts[1]), n);
        }
    }
    (stamp.to_string(), 1)
}

fn session_json(
    config: &SessionConfig,
    record: &RunRecord,
    attempted: usize,
    timestamp: &str,
) -> Value {
    let configuration = record.configuration();
    let individual: Vec<Value> = record
        .trials()
        .iter()
        .map(|t| {
            json!({
                "run_name": t.run_name,
                "ordinal": t.ordinal,
                "metrics": t.metrics,
            })
        })
        .collect();
    json!({
        "schema_version": "benchmark_record_v1",
        "timestamp": timestamp,
        "model_name": record.model(),
        "config": {
            "model_path": config.model.path,
            "quantization": config.model.quantization,
            "label": config.scenario.label,
            "batch_size": configuration.batch_size,
            "input_len": configuration.input_len,
            "output_len": configuration.output_len,
            "repeats": config.repeats,
            "port": config.slot.port,
            "resource_unit": config.slot.resource_unit,
        },
        "succeeded": record.trials().len(),
        "attempted": attempted,
        "individual_runs": individual,
        "average": record.aggregate(),
    })
}

pub fn session_summary_text(config: &SessionConfig, record: &RunRecord, timestamp: &str) -> String {
    let rule = "=".repeat(70);
    let configuration = record.configuration();
    let mut out = String::new();
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Performance Benchmark Summary - {}", record.model());
    let _ = writeln!(out, "Timestamp: {}", timestamp);
    let _ = writeln!(out, "{}\n", rule);
    let _ = writeln!(out, "Configuration:");
    let _ = writeln!(out, "  Batch Size: {}", configuration.batch_size);
    let _ = writeln!(out, "  Input Length: {}", configuration.input_len);
    let _ = writeln!(out, "  Output Length: {}", configuration.output_len);
    let _ = writeln!(out, "  Repeats: {}", config.repeats);
    let _ = writeln!(
        out,
        "  Succeeded: {}/{}\n",
        record.trials().len(),
        config.repeats
    );
    let _ = writeln!(out, "Average Results:");
    for (name, stats) in record.aggregate() {
        let _ = writeln!(out, "  {}: {:.2} ± {:.2}", name, stats.mean, stats.std);
    }
    let _ = writeln!(out, "\n{}", rule);
    out
}

const VIEW_METRICS: [(&str, &str); 6] = [
    ("output_throughput", "Output Throughput (tok/s)"),
    ("overall_throughput", "Overall Throughput (tok/s)"),
    ("latency", "Latency (s)"),
    ("ttft", "Time to First Token (s)"),
    ("input_throughput", "Input Throughput (tok/s)"),
    ("last_gen_throughput", "Last Gen Throughput (tok/s)"),
];

/// Side-by-side table of the latest averaged metrics per model.
pub fn render_comparison(records: &BTreeMap<String, Value>) -> String {
    let mut out = String::new();
    let rule = "=".repeat(100);
    let _ = writeln!(out, "{}", rule);
    let _ = writeln!(out, "Performance Benchmark Results Comparison");
    let _ = writeln!(out, "{}", rule);
    let _ = write!(out, "\n{:<30}", "Metric");
    for model in records.keys() {
        let _ = write!(out, "{:<25}", model);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", "-".repeat(100));
    for (key, label) in VIEW_METRICS {
        let _ = write!(out, "{:<30}", label);
        for record in records.values() {
            let stats = record.pointer(&format!("/average/{}", key));
            let cell = match stats.and_then(|s| s.get("mean")).and_then(|v| v.as_f64()) {
                Some(mean) => {
                    let std = stats
                        .and_then(|s| s.get("std"))
                        .and_then(|v| v.as_f64())
                        .unwrap_or(0.0);
                    format!("{:.2} ± {:.2}", mean, std)
                }
                None => "N/A".to_string(),
            };
            let _ = write!(out, "{:<25}", cell);
        }
        let _ = writeln!(out);
    }
    let _ = writeln!(out, "\n{}", rule);
    let _ = writeln!(out, "\nTest Details:");
    for (model, record) in records {
        let field = |ptr: &str| {
            record
                .pointer(ptr)
                .map(|v| match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                })
                .unwrap_or_else(|| "unknown".to_string())
        };
        let runs = record
            .get("individual_runs")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0);
        let _ = writeln!(out, "\n  {}:", model);
        let _ = writeln!(out, "    Timestamp: {}", field("/timestamp"));
        let _ = writeln!(out, "    Number of runs: {}", runs);
        let _ = writeln!(
            out,
            "    Config: batch_size={}, input_len={}, output_len={}",
            field("/config/batch_size"),
            field("/config/input_len"),
            field("/config/output_len")
        );
    }
    out
}
