use crate::extract::extract_metrics;
use crate::plan::{CommandSpec, Timings};
use crate::process::run_bounded;
use anyhow::Result;
use servbench_analysis::{Configuration, MetricMap};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

/// Emitted by the workload driver when a request races server warm-up.
pub const TRANSIENT_FAILURE_SIGNATURE: &str = "ZeroDivisionError";

pub const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptFailure {
    TimedOut,
    TransientFault,
}

impl AttemptFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptFailure::TimedOut => "timeout",
            AttemptFailure::TransientFault => "transient_fault",
        }
    }
}

/// Output of the attempt that ran to completion. `metrics` may be empty;
/// callers count such a trial as failed.
#[derive(Debug, Clone, PartialEq)]
pub struct TrialOutput {
    pub run_name: String,
    pub raw: String,
    pub metrics: MetricMap,
    pub attempts: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrialOutcome {
    Completed(TrialOutput),
    Exhausted {
        attempts: usize,
        last_failure: AttemptFailure,
        raw: String,
    },
}

impl TrialOutcome {
    /// The metric mapping when the trial produced at least one metric.
    pub fn metrics(&self) -> Option<&MetricMap> {
        match self {
            TrialOutcome::Completed(out) if !out.metrics.is_empty() => Some(&out.metrics),
            _ => None,
        }
    }

    pub fn raw(&self) -> &str {
        match self {
            TrialOutcome::Completed(out) => &out.raw,
            TrialOutcome::Exhausted { raw, .. } => raw,
        }
    }
}

/// Drives the workload client against a live server, retrying once on a
/// timeout or the transient fault signature.
#[derive(Debug, Clone)]
pub struct TrialRunner {
    command: CommandSpec,
    timeout: Duration,
    backoff: Duration,
}

impl TrialRunner {
    pub fn new(command: CommandSpec, timings: &Timings) -> Self {
        Self {
            command,
            timeout: timings.trial_timeout,
            backoff: timings.retry_backoff,
        }
    }

    pub fn run(
        &self,
        endpoint: &str,
        model_path: &str,
        configuration: Configuration,
        run_name: &str,
    ) -> Result<TrialOutcome> {
        let mut last_failure = AttemptFailure::TimedOut;
        let mut last_raw = String::new();
        for attempt in 1..=MAX_ATTEMPTS {
            let mut cmd = self.command.to_command();
            cmd.arg("--base-url")
                .arg(endpoint)
                .arg("--model-path")
                .arg(model_path)
                .arg("--batch-size")
                .arg(configuration.batch_size.to_string())
                .arg("--input-len")
                .arg(configuration.input_len.to_string())
                .arg("--output-len")
                .arg(configuration.output_len.to_string())
                .arg("--run-name")
                .arg(run_name);
            debug!(run_name, attempt, "starting workload");
            let output = run_bounded(cmd, self.timeout)?;
            last_raw = output.combined();

            let failure = if output.timed_out {
                Some(AttemptFailure::TimedOut)
            } else if output.contains(TRANSIENT_FAILURE_SIGNATURE) {
                Some(AttemptFailure::TransientFault)
            } else {
                None
            };

            match failure {
                None => {
                    if let Some(status) = output.status {
                        if !status.success() {
                            warn!(run_name, %status, "workload exited non-zero");
                        }
                    }
                    let metrics = extract_metrics(&last_raw);
                    return Ok(TrialOutcome::Completed(TrialOutput {
                        run_name: run_name.to_string(),
                        raw: last_raw,
                        metrics,
                        attempts: attempt,
                    }));
                }
                Some(kind) => {
                    last_failure = kind;
                    if attempt < MAX_ATTEMPTS {
                        warn!(run_name, attempt, reason = kind.as_str(), "trial attempt failed, retrying");
                        thread::sleep(self.backoff);
                    } else {
                        warn!(run_name, attempts = attempt, reason = kind.as_str(), "trial failed");
                    }
                }
            }
        }
        Ok(TrialOutcome::Exhausted {
            attempts: MAX_ATTEMPTS,
            last_failure,
            raw: last_raw,
        })
    }
}
