use crate::inference::InferenceOutcome;
use crate::publish::CleanupReport;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main-path states of a capture cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipelineState {
    Idle,
    Capturing,
    MetadataReady,
    Inferring,
    TelemetryReporting,
    Detached,
}

/// Stages of the detached redact/publish branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DetachedStage {
    Redacting,
    Publishing,
    CleaningUp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Every stage succeeded
    Completed,
    /// The cycle ran to the end but a non-fatal stage failed
    Partial,
    /// A fatal stage failed; nothing after it ran
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageFailure {
    pub stage: PipelineState,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TelemetryStatus {
    Sent,
    Failed { reason: String },
    /// The cycle failed before telemetry was attempted
    Skipped,
}

/// Result of one main-path run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub location_id: String,
    pub outcome: CycleOutcome,
    pub failed_stage: Option<PipelineState>,
    pub derived_filename: Option<String>,
    pub inference: Option<InferenceOutcome>,
    pub telemetry: TelemetryStatus,
    /// Whether a redact/publish branch was handed to the supervisor
    pub detached: bool,
    /// Working directory of the cycle, kept on disk until the branch cleans it up
    pub workspace_dir: Option<PathBuf>,
    pub errors: Vec<StageFailure>,
    pub duration_ms: u64,
}

impl CycleReport {
    pub fn is_failed(&self) -> bool {
        self.outcome == CycleOutcome::Failed
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum DetachedOutcome {
    /// Artifact uploaded; `redacted` is false when the unredacted fallback was used
    Published { redacted: bool },
    /// Face blurring failed and nothing was uploaded
    RedactionFailed { reason: String },
    /// Upload failed; local files were left in place
    PublishFailed { reason: String },
}

impl DetachedOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, DetachedOutcome::Published { .. })
    }
}

/// Result of one detached branch
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedReport {
    pub cycle_id: String,
    pub blob_name: String,
    pub outcome: DetachedOutcome,
    /// Present only when the branch reached the cleanup stage
    pub cleanup: Option<CleanupReport>,
}
