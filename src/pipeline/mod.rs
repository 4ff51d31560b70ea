//! Capture cycle state machine.
//!
//! A cycle moves `Idle → Capturing → MetadataReady → Inferring →
//! TelemetryReporting → Detached` and then back to `Idle`. Failures before
//! telemetry end the cycle; failures after it never roll telemetry back.

mod detached;
mod naming;
mod orchestrator;
mod types;

#[cfg(test)]
mod tests;

pub use detached::{DetachedJob, DetachedSupervisor, DrainReport};
pub use naming::{check_location_id, derive_filename, normalize_timestamp};
pub use orchestrator::{PipelineComponents, PipelineOrchestrator};
pub use types::{
    CycleOutcome, CycleReport, DetachedOutcome, DetachedReport, DetachedStage, PipelineState,
    StageFailure, TelemetryStatus,
};
