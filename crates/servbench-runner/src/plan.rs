use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use servbench_analysis::Configuration;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PlanError {
    #[error("plan lists no models")]
    NoModels,
    #[error("plan lists no configurations")]
    NoConfigurations,
    #[error("plan lists no device slots")]
    NoDevices,
    #[error("repeats must be at least 1")]
    ZeroRepeats,
    #[error("configuration has a zero dimension: {0}")]
    InvalidConfiguration(Configuration),
    #[error("{0} command is empty")]
    EmptyCommand(&'static str),
    #[error("port {0} is assigned to more than one device slot")]
    DuplicatePort(u16),
    #[error("resource unit {0} is assigned to more than one device slot")]
    DuplicateResourceUnit(u32),
}

/// Program plus leading arguments; benchmark flags are appended per call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: &str, args: &[&str]) -> Self {
        Self {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_words(words: &[String]) -> Result<Self> {
        let (program, args) = words
            .split_first()
            .ok_or_else(|| anyhow!("command must name a program"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }

    pub fn default_server() -> Self {
        Self::new("python", &["-m", "sglang.launch_server"])
    }

    pub fn default_workload() -> Self {
        Self::new("python", &["-m", "sglang.bench_one_batch_server"])
    }

    pub fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(|s| s.as_str()))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

mod duration_secs {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(D::Error::custom)
    }
}

/// Every delay and ceiling a session observes, in seconds on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    #[serde(with = "duration_secs")]
    pub startup_grace: Duration,
    #[serde(with = "duration_secs")]
    pub probe_interval: Duration,
    #[serde(with = "duration_secs")]
    pub ready_deadline: Duration,
    #[serde(with = "duration_secs")]
    pub probe_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub trial_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub terminate_grace: Duration,
    #[serde(with = "duration_secs")]
    pub settle: Duration,
    #[serde(with = "duration_secs")]
    pub inter_trial_pause: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            startup_grace: Duration::from_secs(20),
            probe_interval: Duration::from_secs(5),
            ready_deadline: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(2),
            trial_timeout: Duration::from_secs(300),
            retry_backoff: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(10),
            settle: Duration::from_secs(5),
            inter_trial_pause: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerSettings {
    #[serde(default = "CommandSpec::default_server")]
    pub command: CommandSpec,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_resource_env")]
    pub resource_env: String,
    /// Write server output to `server_logs/`; discarded otherwise.
    #[serde(default = "default_true")]
    pub capture_logs: bool,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            command: CommandSpec::default_server(),
            host: default_host(),
            resource_env: default_resource_env(),
            capture_logs: true,
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_resource_env() -> String {
    "CUDA_VISIBLE_DEVICES".to_string()
}

fn default_true() -> bool {
    true
}

fn default_repeats() -> usize {
    3
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("logs/performance_logs")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSpec {
    pub name: String,
    pub path: String,
    #[serde(default)]
    pub quantization: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scenario {
    #[serde(default)]
    pub label: Option<String>,
    #[serde(flatten)]
    pub configuration: Configuration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSlot {
    pub resource_unit: u32,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchPlan {
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub server: ServerSettings,
    #[serde(default = "CommandSpec::default_workload")]
    pub workload: CommandSpec,
    #[serde(default = "default_repeats")]
    pub repeats: usize,
    #[serde(default)]
    pub parallel: bool,
    #[serde(default)]
    pub timings: Timings,
    pub models: Vec<ModelSpec>,
    pub configurations: Vec<Scenario>,
    pub devices: Vec<DeviceSlot>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub model: ModelSpec,
    pub scenario: Scenario,
    pub slot: DeviceSlot,
}

impl BatchPlan {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|e| anyhow!("failed to read plan {}: {}", path.display(), e))?;
        let mut plan: BatchPlan = serde_yaml::from_str(&raw)?;
        if plan.output_dir.is_relative() {
            let base = path.parent().unwrap_or(Path::new("."));
            plan.output_dir = base.join(&plan.output_dir);
        }
        Ok(plan)
    }

    pub fn validate(&self, parallel: bool) -> Result<(), PlanError> {
        if self.models.is_empty() {
            return Err(PlanError::NoModels);
        }
        if self.configurations.is_empty() {
            return Err(PlanError::NoConfigurations);
        }
        if self.devices.is_empty() {
            return Err(PlanError::NoDevices);
        }
        if self.repeats == 0 {
            return Err(PlanError::ZeroRepeats);
        }
        if self.server.command.program.trim().is_empty() {
            return Err(PlanError::EmptyCommand("server"));
        }
        if self.workload.program.trim().is_empty() {
            return Err(PlanError::EmptyCommand("workload"));
        }
        for scenario in self.configurations.iter() {
            if !scenario.configuration.is_valid() {
                return Err(PlanError::InvalidConfiguration(scenario.configuration));
            }
        }
        if parallel {
            validate_disjoint_slots(&self.devices)?;
        }
        Ok(())
    }

    /// Models × configurations, model-major. Parallel plans spread
    /// assignments round-robin over the device slots; sequential plans reuse
    /// the first slot.
    pub fn assignments(&self, parallel: bool) -> Vec<Assignment> {
        let mut out = Vec::new();
        if self.devices.is_empty() {
            return out;
        }
        for model in self.models.iter() {
            for scenario in self.configurations.iter() {
                let slot = if parallel {
                    self.devices[out.len() % self.devices.len()]
                } else {
                    self.devices[0]
                };
                out.push(Assignment {
                    model: model.clone(),
                    scenario: scenario.clone(),
                    slot,
                });
            }
        }
        out
    }

    pub fn session_config(&self, assignment: &Assignment) -> SessionConfig {
        SessionConfig {
            model: assignment.model.clone(),
            scenario: assignment.scenario.clone(),
            slot: assignment.slot,
            repeats: self.repeats,
            server: self.server.clone(),
            workload: self.workload.clone(),
            timings: self.timings.clone(),
            output_dir: self.output_dir.clone(),
        }
    }
}

pub fn validate_disjoint_slots(slots: &[DeviceSlot]) -> Result<(), PlanError> {
    let mut ports = BTreeSet::new();
    let mut units = BTreeSet::new();
    for slot in slots {
        if !ports.insert(slot.port) {
            return Err(PlanError::DuplicatePort(slot.port));
        }
        if !units.insert(slot.resource_unit) {
            return Err(PlanError::DuplicateResourceUnit(slot.resource_unit));
        }
    }
    Ok(())
}

/// Everything one session needs, owned by that session alone.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub model: ModelSpec,
    pub scenario: Scenario,
    pub slot: DeviceSlot,
    pub repeats: usize,
    pub server: ServerSettings,
    pub workload: CommandSpec,
    pub timings: Timings,
    pub output_dir: PathBuf,
}

impl SessionConfig {
    pub fn configuration(&self) -> Configuration {
        self.scenario.configuration
    }

    pub fn run_name(&self, ordinal: usize) -> String {
        match self.scenario.label.as_deref() {
            Some(label) if !label.is_empty() => {
                format!("{}_{}_run{}", self.model.name, label, ordinal)
            }
            _ => format!("{}_run{}", self.model.name, ordinal),
        }
    }
}

pub const PLAN_TEMPLATE: &str = "\
output_dir: logs/performance_logs
repeats: 3                           # trials per (model, configuration)
parallel: false                      # true: one worker per device slot
server:
  command: { program: python, args: [-m, sglang.launch_server] }
  host: 0.0.0.0
  resource_env: CUDA_VISIBLE_DEVICES
  capture_logs: true
workload:
  program: python
  args: [-m, sglang.bench_one_batch_server]
timings:                             # seconds
  startup_grace: 20
  probe_interval: 5
  ready_deadline: 300
  probe_timeout: 2
  trial_timeout: 300
  retry_backoff: 2
  terminate_grace: 10
  settle: 5
  inter_trial_pause: 5
models:
  - name: original                   # REQUIRED
    path: ''                         # REQUIRED: model path or hub id
    quantization: null
configurations:
  - label: base
    batch_size: 32
    input_len: 256
    output_len: 32
devices:
  - resource_unit: 0
    port: 30000
";
