pub mod extract;
pub mod plan;
pub mod process;
pub mod record;
pub mod scheduler;
pub mod server;
pub mod session;
pub mod store;
pub mod trial;

pub use extract::extract_metrics;
pub use plan::{
    validate_disjoint_slots, Assignment, BatchPlan, CommandSpec, DeviceSlot, ModelSpec, PlanError,
    Scenario, ServerSettings, SessionConfig, Timings, PLAN_TEMPLATE,
};
pub use record::{RunRecord, TrialResult};
pub use scheduler::{run_batch, BatchSummary, SessionReport};
pub use server::{HttpHealthProbe, ReadinessProbe, ServerHandle, ServerLaunch, ServerState, StartupError};
pub use session::{execute, run_session, SessionOutcome};
pub use store::{render_comparison, PersistedPaths, ResultStore};
pub use trial::{AttemptFailure, TrialOutcome, TrialOutput, TrialRunner};
