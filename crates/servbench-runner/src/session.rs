use crate::plan::SessionConfig;
use crate::record::{RunRecord, TrialResult};
use crate::server::{HttpHealthProbe, ReadinessProbe, ServerHandle, ServerLaunch, StartupError};
use crate::store::{PersistedPaths, ResultStore};
use crate::trial::{TrialOutcome, TrialRunner};
use anyhow::Result;
use serde_json::{json, Value};
use std::thread;
use tracing::{info, info_span, warn};

#[derive(Debug)]
pub enum SessionOutcome {
    Completed {
        record: RunRecord,
        paths: PersistedPaths,
        attempted: usize,
    },
    StartupFailed(StartupError),
    NoSuccessfulTrials {
        attempted: usize,
    },
}

impl SessionOutcome {
    pub fn succeeded(&self) -> bool {
        matches!(self, SessionOutcome::Completed { .. })
    }

    pub fn kind(&self) -> &'static str {
        match self {
            SessionOutcome::Completed { .. } => "completed",
            SessionOutcome::StartupFailed(_) => "startup_failed",
            SessionOutcome::NoSuccessfulTrials { .. } => "no_successful_trials",
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            SessionOutcome::Completed {
                record,
                paths,
                attempted,
            } => json!({
                "outcome": self.kind(),
                "succeeded": record.trials().len(),
                "attempted": attempted,
                "average": record.aggregate(),
                "record_path": paths.record.display().to_string(),
                "summary_path": paths.summary.display().to_string(),
            }),
            SessionOutcome::StartupFailed(err) => json!({
                "outcome": self.kind(),
                "error": err.to_string(),
            }),
            SessionOutcome::NoSuccessfulTrials { attempted } => json!({
                "outcome": self.kind(),
                "succeeded": 0,
                "attempted": attempted,
            }),
        }
    }
}

/// Runs one session with the HTTP health probe.
pub fn run_session(config: &SessionConfig) -> Result<SessionOutcome> {
    let probe = HttpHealthProbe::new(config.timings.probe_timeout)?;
    execute(config, &probe)
}

/// Brings a server up on the session's slot, runs the configured number of
/// trials against it, and persists the record when at least one trial
/// produced metrics. The server is stopped before this returns, including
/// when a trial errors out.
pub fn execute(config: &SessionConfig, probe: &dyn ReadinessProbe) -> Result<SessionOutcome> {
    let configuration = config.configuration();
    let span = info_span!(
        "session",
        model = %config.model.name,
        port = config.slot.port,
        config = %configuration
    );
    let _guard = span.enter();

    let store = ResultStore::new(&config.output_dir);
    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S").to_string();
    let log_path = if config.server.capture_logs {
        Some(store.server_log_path(&config.model.name, &timestamp, config.slot.port)?)
    } else {
        None
    };

    let mut server = ServerHandle::new(
        ServerLaunch::for_session(config, log_path),
        config.timings.clone(),
    );
    if let Err(err) = server.launch(probe) {
        warn!(error = %err, "server failed to start, skipping session");
        server.shutdown();
        return Ok(SessionOutcome::StartupFailed(err));
    }

    let runner = TrialRunner::new(config.workload.clone(), &config.timings);
    let endpoint = server.endpoint();
    let mut record = RunRecord::new(&config.model.name, configuration);
    let mut raw_outputs = Vec::with_capacity(config.repeats);

    for ordinal in 1..=config.repeats {
        let run_name = config.run_name(ordinal);
        info!(run_name = %run_name, ordinal, repeats = config.repeats, "running trial");
        let outcome = runner.run(&endpoint, &config.model.path, configuration, &run_name)?;
        match outcome.metrics() {
            Some(metrics) => {
                record.push(TrialResult {
                    run_name: run_name.clone(),
                    ordinal,
                    metrics: metrics.clone(),
                });
            }
            None => match &outcome {
                TrialOutcome::Completed(_) => {
                    warn!(run_name = %run_name, "no metrics found in workload output");
                }
                TrialOutcome::Exhausted { last_failure, .. } => {
                    warn!(run_name = %run_name, reason = last_failure.as_str(), "trial failed");
                }
            },
        }
        raw_outputs.push(outcome.raw().to_string());
        if ordinal < config.repeats {
            thread::sleep(config.timings.inter_trial_pause);
        }
    }

    server.shutdown();

    let attempted = config.repeats;
    if record.trials().is_empty() {
        warn!(attempted, "no successful trials");
        return Ok(SessionOutcome::NoSuccessfulTrials { attempted });
    }
    let paths = store.persist_session(config, &record, &raw_outputs, &timestamp)?;
    info!(succeeded = record.trials().len(), attempted, "session complete");
    Ok(SessionOutcome::Completed {
        record,
        paths,
        attempted,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::plan::{CommandSpec, DeviceSlot, ModelSpec, Scenario, ServerSettings, Timings};
    use servbench_analysis::{load_result_entries, Configuration};
    use std::cell::Cell;
    use std::fs;
    use std::path::{Path, PathBuf};
    use std::time::Duration;

    struct FixedProbe {
        ready: bool,
        calls: Cell<usize>,
    }

    impl ReadinessProbe for FixedProbe {
        fn is_ready(&self, _port: u16) -> bool {
            self.calls.set(self.calls.get() + 1);
            self.ready
        }
    }

    fn probe(ready: bool) -> FixedProbe {
        FixedProbe {
            ready,
            calls: Cell::new(0),
        }
    }

    fn temp_root(tag: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "servbench_session_{}_{}_{}",
            tag,
            std::process::id(),
            chrono::Utc::now().timestamp_micros()
        ));
        fs::create_dir_all(&root).expect("temp root");
        root
    }

    fn config(root: &Path, workload: &str, repeats: usize) -> SessionConfig {
        SessionConfig {
            model: ModelSpec {
                name: "m".to_string(),
                path: "/models/m".to_string(),
                quantization: None,
            },
            scenario: Scenario {
                label: Some("base".to_string()),
                configuration: Configuration::new(32, 256, 32),
            },
            slot: DeviceSlot {
                resource_unit: 0,
                port: 30000,
            },
            repeats,
            server: ServerSettings {
                command: CommandSpec::new("sh", &["-c", "exec sleep 30", "server"]),
                host: "127.0.0.1".to_string(),
                resource_env: "SERVBENCH_TEST_UNIT".to_string(),
                capture_logs: true,
            },
            workload: CommandSpec::new("sh", &["-c", workload, "workload"]),
            timings: Timings {
                startup_grace: Duration::from_millis(10),
                probe_interval: Duration::from_millis(10),
                ready_deadline: Duration::from_millis(200),
                probe_timeout: Duration::from_millis(100),
                trial_timeout: Duration::from_secs(5),
                retry_backoff: Duration::from_millis(10),
                terminate_grace: Duration::from_millis(500),
                settle: Duration::from_millis(10),
                inter_trial_pause: Duration::from_millis(10),
            },
            output_dir: root.to_path_buf(),
        }
    }

    /// Swaps in a server script that records its pid in `<root>/server.pid`.
    fn record_server_pid(cfg: &mut SessionConfig, root: &Path) -> PathBuf {
        let pid_file = root.join("server.pid");
        cfg.server.command = CommandSpec::new("sh", &["-c", "echo $$ > \"$0\"; exec sleep 30"]);
        cfg.server.command.args.push(pid_file.display().to_string());
        cfg.timings.startup_grace = Duration::from_millis(300);
        pid_file
    }

    fn assert_server_stopped(pid_file: &Path) {
        let pid: i32 = fs::read_to_string(pid_file)
            .expect("pid file")
            .trim()
            .parse()
            .expect("pid");
        assert_ne!(unsafe { libc::kill(pid, 0) }, 0, "server {} still running", pid);
    }

    #[test]
    fn completed_session_persists_record_and_results() {
        let root = temp_root("completed");
        let workload = "echo 'latency: 1.5 s'; echo 'output throughput: 100 tok/s'";
        let mut cfg = config(&root, workload, 3);
        let pid_file = record_server_pid(&mut cfg, &root);
        let outcome = execute(&cfg, &probe(true)).expect("session");
        assert_server_stopped(&pid_file);
        match &outcome {
            SessionOutcome::Completed {
                record,
                paths,
                attempted,
            } => {
                assert_eq!(*attempted, 3);
                assert_eq!(record.trials().len(), 3);
                assert_eq!(record.trials()[2].run_name, "m_base_run3");
                assert_eq!(record.aggregate()["output_throughput"].std, 0.0);
                assert!(paths.record.exists());
                assert_eq!(paths.raw_logs.len(), 3);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(outcome.succeeded());
        let loaded = load_result_entries(&root.join("result.jsonl")).expect("jsonl");
        assert_eq!(loaded.entries.len(), 3);
        assert!(root.join("server_logs").join("m").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn partial_success_keeps_only_trials_with_metrics() {
        let root = temp_root("partial");
        let workload = "case \"$*\" in *m_base_run2*) echo 'garbage';; *) echo 'output throughput: 50 tok/s';; esac";
        let outcome = execute(&config(&root, workload, 3), &probe(true)).expect("session");
        match outcome {
            SessionOutcome::Completed {
                record, attempted, ..
            } => {
                assert_eq!(attempted, 3);
                let names: Vec<&str> = record.trials().iter().map(|t| t.run_name.as_str()).collect();
                assert_eq!(names, vec!["m_base_run1", "m_base_run3"]);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn startup_failure_runs_no_trials_and_persists_nothing() {
        let root = temp_root("startup");
        let marker = root.join("workload_ran");
        let workload = format!("touch '{}'", marker.display());
        let mut cfg = config(&root, &workload, 2);
        let pid_file = record_server_pid(&mut cfg, &root);
        let outcome = execute(&cfg, &probe(false)).expect("session");
        assert!(matches!(
            outcome,
            SessionOutcome::StartupFailed(StartupError::DeadlineExceeded { .. })
        ));
        assert_server_stopped(&pid_file);
        assert!(!marker.exists());
        assert!(!root.join("result.jsonl").exists());
        assert!(!root.join("result_logs").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn zero_metric_trials_are_reported_without_persisting() {
        let root = temp_root("nometrics");
        let outcome = execute(&config(&root, "echo nothing", 2), &probe(true)).expect("session");
        assert!(matches!(
            outcome,
            SessionOutcome::NoSuccessfulTrials { attempted: 2 }
        ));
        assert!(!outcome.succeeded());
        assert!(!root.join("result.jsonl").exists());
        let _ = fs::remove_dir_all(root);
    }

    #[test]
    fn workload_spawn_failure_still_stops_server() {
        let root = temp_root("spawnfail");
        let mut cfg = config(&root, "true", 1);
        cfg.workload = CommandSpec::new("/nonexistent/servbench-workload", &[]);
        let pid_file = record_server_pid(&mut cfg, &root);
        assert!(execute(&cfg, &probe(true)).is_err());
        assert_server_stopped(&pid_file);
        let _ = fs::remove_dir_all(root);
    }
}
