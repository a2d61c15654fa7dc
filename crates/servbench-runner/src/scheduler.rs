use crate::plan::{Assignment, BatchPlan, SessionConfig};
use crate::session::SessionOutcome;
use anyhow::{anyhow, Result};
use serde_json::{json, Value};
use std::panic::{self, AssertUnwindSafe};
use std::thread;
use tracing::{error, info};

#[derive(Debug)]
pub struct SessionReport {
    pub assignment: Assignment,
    pub outcome: Result<SessionOutcome>,
}

impl SessionReport {
    pub fn succeeded(&self) -> bool {
        matches!(&self.outcome, Ok(outcome) if outcome.succeeded())
    }

    pub fn to_json(&self) -> Value {
        let outcome = match &self.outcome {
            Ok(outcome) => outcome.to_json(),
            Err(err) => json!({ "outcome": "error", "error": format!("{:#}", err) }),
        };
        json!({
            "model": self.assignment.model.name,
            "label": self.assignment.scenario.label,
            "configuration": self.assignment.scenario.configuration,
            "resource_unit": self.assignment.slot.resource_unit,
            "port": self.assignment.slot.port,
            "result": outcome,
        })
    }

    pub fn describe(&self) -> String {
        let status = match &self.outcome {
            Ok(SessionOutcome::Completed {
                record, attempted, ..
            }) => format!("ok ({}/{} trials)", record.trials().len(), attempted),
            Ok(SessionOutcome::StartupFailed(err)) => format!("startup failed: {}", err),
            Ok(SessionOutcome::NoSuccessfulTrials { attempted }) => {
                format!("no successful trials (0/{})", attempted)
            }
            Err(err) => format!("error: {:#}", err),
        };
        format!(
            "{} [{}] port {} unit {}: {}",
            self.assignment.model.name,
            self.assignment.scenario.configuration,
            self.assignment.slot.port,
            self.assignment.slot.resource_unit,
            status
        )
    }
}

/// Reports in plan order, whatever order the workers finished in.
#[derive(Debug)]
pub struct BatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub reports: Vec<SessionReport>,
}

impl BatchSummary {
    fn from_reports(reports: Vec<SessionReport>) -> Self {
        Self {
            attempted: reports.len(),
            succeeded: reports.iter().filter(|r| r.succeeded()).count(),
            reports,
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "attempted": self.attempted,
            "succeeded": self.succeeded,
            "sessions": self.reports.iter().map(|r| r.to_json()).collect::<Vec<_>>(),
        })
    }
}

/// Runs every assignment of `plan` through `session`. Sequential plans use
/// the first device slot in order; parallel plans get one worker per slot,
/// each draining its own queue. A failing session never stops the others.
pub fn run_batch<F>(plan: &BatchPlan, parallel: bool, session: F) -> Result<BatchSummary>
where
    F: Fn(&SessionConfig) -> Result<SessionOutcome> + Sync,
{
    plan.validate(parallel)?;
    let assignments = plan.assignments(parallel);
    info!(
        sessions = assignments.len(),
        slots = if parallel { plan.devices.len() } else { 1 },
        "starting batch"
    );

    let reports = if parallel {
        run_parallel(plan, assignments, &session)?
    } else {
        assignments
            .into_iter()
            .map(|assignment| run_one(plan, assignment, &session))
            .collect()
    };

    let summary = BatchSummary::from_reports(reports);
    info!(
        succeeded = summary.succeeded,
        attempted = summary.attempted,
        "batch finished"
    );
    Ok(summary)
}

fn run_one<F>(plan: &BatchPlan, assignment: Assignment, session: &F) -> SessionReport
where
    F: Fn(&SessionConfig) -> Result<SessionOutcome>,
{
    let config = plan.session_config(&assignment);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| session(&config)))
        .unwrap_or_else(|payload| Err(anyhow!("session panicked: {}", panic_message(&*payload))));
    if let Err(err) = &outcome {
        error!(model = %assignment.model.name, error = %format!("{:#}", err), "session aborted");
    }
    SessionReport {
        assignment,
        outcome,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn run_parallel<F>(
    plan: &BatchPlan,
    assignments: Vec<Assignment>,
    session: &F,
) -> Result<Vec<SessionReport>>
where
    F: Fn(&SessionConfig) -> Result<SessionOutcome> + Sync,
{
    let slots = plan.devices.len();
    let mut queues: Vec<Vec<(usize, Assignment)>> = (0..slots).map(|_| Vec::new()).collect();
    for (idx, assignment) in assignments.into_iter().enumerate() {
        queues[idx % slots].push((idx, assignment));
    }

    let mut indexed: Vec<(usize, SessionReport)> = thread::scope(|scope| {
        let handles: Vec<_> = queues
            .into_iter()
            .filter(|queue| !queue.is_empty())
            .map(|queue| {
                scope.spawn(move || {
                    queue
                        .into_iter()
                        .map(|(idx, assignment)| (idx, run_one(plan, assignment, session)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        let mut out = Vec::new();
        for handle in handles {
            let reports = handle
                .join()
                .map_err(|_| anyhow!("scheduler worker panicked"))?;
            out.extend(reports);
        }
        Ok::<_, anyhow::Error>(out)
    })?;
    indexed.sort_by_key(|(idx, _)| *idx);
    Ok(indexed.into_iter().map(|(_, report)| report).collect())
}
