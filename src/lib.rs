pub mod app;
pub mod capture;
pub mod config;
pub mod error;
pub mod events;
pub mod inference;
pub mod metadata;
pub mod pipeline;
pub(crate) mod process;
pub mod publish;
pub mod redaction;
pub mod telemetry;
pub mod workspace;

#[cfg(test)]
pub(crate) mod test_support;

pub use app::{ComponentState, PipelineRuntime, ShutdownReason, TriggerHandle};
pub use capture::{CaptureAdapter, CaptureResult, NetworkCaptureAdapter, UsbCaptureAdapter};
pub use config::OccucamConfig;
pub use error::{OccucamError, Result};
pub use events::{EventBus, PipelineEvent};
pub use inference::{InferenceOutcome, InferenceResult, InferenceRunner, InferenceStatus};
pub use metadata::{GpsFix, ImageMetadata, MetadataExtractor};
pub use pipeline::{
    CycleOutcome, CycleReport, DetachedOutcome, DetachedReport, PipelineOrchestrator,
    PipelineState,
};
pub use publish::{ArtifactPublisher, BlobStore, CleanupReport};
pub use redaction::Redactor;
pub use telemetry::{TelemetryEnvelope, TelemetryReporter};
pub use workspace::{Workspace, WorkspaceArena};
