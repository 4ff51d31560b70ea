use super::detached::{DetachedJob, DetachedSupervisor};
use super::naming::{check_location_id, derive_filename};
use super::types::{
    CycleOutcome, CycleReport, PipelineState, StageFailure, TelemetryStatus,
};
use crate::capture::{CaptureAdapter, CaptureResult};
use crate::config::InferenceFailurePolicy;
use crate::events::{EventBus, PipelineEvent};
use crate::inference::{InferenceOutcome, InferenceRunner};
use crate::metadata::{timestamp_iso_from_raw, GpsFix, ImageMetadata, MetadataExtractor};
use crate::telemetry::{TelemetryEnvelope, TelemetryReporter};
use crate::workspace::{Workspace, WorkspaceArena};
use std::sync::{Arc, Mutex};
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Collaborators used on the main path
pub struct PipelineComponents {
    pub capture: Arc<dyn CaptureAdapter>,
    pub metadata: MetadataExtractor,
    pub inference: InferenceRunner,
    pub telemetry: Arc<TelemetryReporter>,
}

/// Drives capture cycles through the state machine.
///
/// Only one cycle runs on the main path at a time; callers serialize through the
/// command worker. Detached branches are handed to the [`DetachedSupervisor`].
pub struct PipelineOrchestrator {
    components: PipelineComponents,
    arena: WorkspaceArena,
    supervisor: Arc<DetachedSupervisor>,
    events: EventBus,
    failure_policy: InferenceFailurePolicy,
    state: Arc<Mutex<PipelineState>>,
}

/// Timestamp and position settled from the capture result and EXIF
struct ResolvedMetadata {
    raw_timestamp: String,
    timestamp_iso: String,
    gps: Option<GpsFix>,
}

/// Report under construction
struct CycleProgress {
    report: CycleReport,
    started: Instant,
}

impl CycleProgress {
    fn new(cycle_id: &str, location_id: &str) -> Self {
        Self {
            report: CycleReport {
                cycle_id: cycle_id.to_string(),
                location_id: location_id.to_string(),
                outcome: CycleOutcome::Completed,
                failed_stage: None,
                derived_filename: None,
                inference: None,
                telemetry: TelemetryStatus::Skipped,
                detached: false,
                workspace_dir: None,
                errors: Vec::new(),
                duration_ms: 0,
            },
            started: Instant::now(),
        }
    }

    /// Non-fatal failure; the cycle continues and ends Partial
    fn degrade(&mut self, stage: PipelineState, message: String) {
        warn!("{:?} degraded: {}", stage, message);
        if self.report.failed_stage.is_none() {
            self.report.failed_stage = Some(stage);
        }
        self.report.outcome = CycleOutcome::Partial;
        self.report.errors.push(StageFailure { stage, message });
    }

    /// Fatal failure; nothing after `stage` runs
    fn fail(&mut self, stage: PipelineState, message: String) {
        error!("Cycle failed at {:?}: {}", stage, message);
        self.report.failed_stage = Some(stage);
        self.report.outcome = CycleOutcome::Failed;
        self.report.errors.push(StageFailure { stage, message });
    }

    fn finish(mut self) -> CycleReport {
        self.report.duration_ms = self.started.elapsed().as_millis() as u64;
        self.report
    }
}

impl PipelineOrchestrator {
    pub fn new(
        components: PipelineComponents,
        arena: WorkspaceArena,
        supervisor: Arc<DetachedSupervisor>,
        events: EventBus,
        failure_policy: InferenceFailurePolicy,
    ) -> Self {
        Self {
            components,
            arena,
            supervisor,
            events,
            failure_policy,
            state: Arc::new(Mutex::new(PipelineState::Idle)),
        }
    }

    /// Current main-path state
    pub fn state(&self) -> PipelineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(PipelineState::Idle)
    }

    pub fn supervisor(&self) -> &Arc<DetachedSupervisor> {
        &self.supervisor
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Run one capture cycle for `location_id`. Returns once the main path is done;
    /// the redact/publish branch may still be running.
    pub async fn run_cycle(&self, location_id: &str) -> CycleReport {
        let cycle_id = WorkspaceArena::next_cycle_id();
        let span = info_span!("cycle", id = %cycle_id, location = %location_id);

        let report = self
            .execute_cycle(&cycle_id, location_id)
            .instrument(span)
            .await;

        self.set_state(&cycle_id, PipelineState::Idle);
        self.events.publish(PipelineEvent::CycleFinished {
            cycle_id: report.cycle_id.clone(),
            outcome: report.outcome,
            failed_stage: report.failed_stage,
        });
        report
    }

    async fn execute_cycle(&self, cycle_id: &str, location_id: &str) -> CycleReport {
        let mut progress = CycleProgress::new(cycle_id, location_id);
        info!("Starting capture cycle");
        self.events.publish(PipelineEvent::CycleStarted {
            cycle_id: cycle_id.to_string(),
            location_id: location_id.to_string(),
            timestamp: SystemTime::now(),
        });

        if let Err(e) = check_location_id(location_id) {
            progress.fail(PipelineState::Idle, e.to_string());
            return progress.finish();
        }

        let pruned = self.arena.prune().await;
        for e in &pruned.errors {
            warn!("Workspace pruning: {}", e);
        }

        self.set_state(cycle_id, PipelineState::Capturing);
        let workspace = match self.arena.create(cycle_id).await {
            Ok(workspace) => workspace,
            Err(e) => {
                progress.fail(PipelineState::Capturing, e.to_string());
                return progress.finish();
            }
        };
        progress.report.workspace_dir = Some(workspace.dir().to_path_buf());

        let capture = match self.components.capture.capture(&workspace).await {
            Ok(capture) => capture,
            Err(e) => {
                progress.fail(PipelineState::Capturing, e.to_string());
                return progress.finish();
            }
        };
        info!("Captured {}", capture.source_image_path.display());

        self.set_state(cycle_id, PipelineState::MetadataReady);
        let metadata = match self.resolve_metadata(&capture, &mut progress).await {
            Some(metadata) => metadata,
            None => return progress.finish(),
        };

        self.set_state(cycle_id, PipelineState::Inferring);
        let inference = self
            .components
            .inference
            .infer(&capture.source_image_path, &workspace)
            .await;
        progress.report.inference = Some(inference.clone());
        if let Some(reason) = failure_reason(&inference) {
            match self.failure_policy {
                InferenceFailurePolicy::AbortCycle => {
                    progress.fail(PipelineState::Inferring, reason);
                    return progress.finish();
                }
                InferenceFailurePolicy::ZeroCounts => {
                    progress.degrade(PipelineState::Inferring, reason);
                }
            }
        }

        let extension = capture.extension();
        let blob_name =
            match derive_filename(location_id, &metadata.raw_timestamp, extension.as_deref()) {
                Ok(name) => name,
                Err(e) => {
                    progress.fail(PipelineState::Inferring, e.to_string());
                    return progress.finish();
                }
            };
        info!("Derived file name {}", blob_name);
        progress.report.derived_filename = Some(blob_name.clone());

        self.set_state(cycle_id, PipelineState::TelemetryReporting);
        let envelope = TelemetryEnvelope::new(
            blob_name.clone(),
            location_id,
            &inference.result,
            metadata.timestamp_iso.clone(),
            metadata.gps,
        );
        progress.report.telemetry = match self.components.telemetry.report(&envelope).await {
            Ok(()) => TelemetryStatus::Sent,
            Err(e) => {
                progress.degrade(PipelineState::TelemetryReporting, e.to_string());
                TelemetryStatus::Failed {
                    reason: e.to_string(),
                }
            }
        };

        self.set_state(cycle_id, PipelineState::Detached);
        let job = detached_job(workspace, &capture, blob_name).await;
        self.supervisor.spawn(job).await;
        progress.report.detached = true;

        progress.finish()
    }

    /// Settle timestamp and GPS. Returns `None` after recording a fatal failure.
    async fn resolve_metadata(
        &self,
        capture: &CaptureResult,
        progress: &mut CycleProgress,
    ) -> Option<ResolvedMetadata> {
        let extractor = self.components.metadata.clone();
        let path = capture.source_image_path.clone();
        let exif: Result<ImageMetadata, String> =
            match tokio::task::spawn_blocking(move || extractor.extract(&path)).await {
                Ok(result) => result.map_err(|e| e.to_string()),
                Err(e) => Err(format!("metadata task failed: {}", e)),
            };

        if let Err(e) = &exif {
            debug!("EXIF metadata unavailable: {}", e);
        }

        // Camera clock with zone first, then the embedded original time
        let from_capture = capture.capture_timestamp.as_deref().and_then(|raw| {
            match timestamp_iso_from_raw(raw) {
                Ok(iso) => Some((raw.to_string(), iso)),
                Err(e) => {
                    warn!("Ignoring camera timestamp: {}", e);
                    None
                }
            }
        });
        let timestamp = from_capture.or_else(|| {
            exif.as_ref()
                .ok()
                .map(|m| (m.raw_timestamp.clone(), m.timestamp_iso.clone()))
        });

        let Some((raw_timestamp, timestamp_iso)) = timestamp else {
            let reason = match &exif {
                Err(e) => e.clone(),
                Ok(_) => "no capture timestamp available".to_string(),
            };
            progress.fail(PipelineState::MetadataReady, reason);
            return None;
        };

        let gps = exif.ok().and_then(|m| m.gps).or(capture.gps);
        if gps.is_none() {
            warn!("No GPS position for this capture; reporting zeros");
        }

        debug!("Timestamp {} ({}), GPS {:?}", raw_timestamp, timestamp_iso, gps);
        Some(ResolvedMetadata {
            raw_timestamp,
            timestamp_iso,
            gps,
        })
    }

    fn set_state(&self, cycle_id: &str, state: PipelineState) {
        if let Ok(mut current) = self.state.lock() {
            if *current == state {
                return;
            }
            *current = state;
        }
        debug!("Pipeline state -> {:?}", state);
        self.events.publish(PipelineEvent::StageEntered {
            cycle_id: cycle_id.to_string(),
            state,
        });
    }
}

fn failure_reason(outcome: &InferenceOutcome) -> Option<String> {
    match &outcome.status {
        crate::inference::InferenceStatus::Failed { reason } => Some(reason.clone()),
        _ => None,
    }
}

async fn detached_job(workspace: Workspace, capture: &CaptureResult, blob_name: String) -> DetachedJob {
    let annotated = workspace.annotated_image(&capture.source_image_path);
    let redaction_source = if tokio::fs::try_exists(&annotated).await.unwrap_or(false) {
        annotated
    } else {
        debug!("No annotated image, redacting the raw capture");
        capture.source_image_path.clone()
    };

    DetachedJob {
        raw_image: capture.source_image_path.clone(),
        redaction_source,
        blob_name,
        workspace,
    }
}
