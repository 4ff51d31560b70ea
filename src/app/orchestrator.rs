use super::types::{ComponentState, ShutdownReason, TriggerCommand};
use super::worker::TriggerHandle;
use crate::capture::adapter_from_config;
use crate::config::OccucamConfig;
use crate::error::Result;
use crate::events::EventBus;
use crate::inference::{InferenceRunner, YoloDetector};
use crate::metadata::MetadataExtractor;
use crate::pipeline::{DetachedReport, DetachedSupervisor, PipelineComponents, PipelineOrchestrator};
use crate::publish::{ArtifactPublisher, AzureBlobStore, BlobStore};
use crate::redaction::{FaceBlurRedactor, Redactor};
use crate::telemetry::TelemetryReporter;
use crate::workspace::WorkspaceArena;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, Level};

/// Owns the pipeline and everything that feeds it: trigger server, command
/// worker, detached result logger, signal handling and shutdown.
pub struct PipelineRuntime {
    pub(super) config: OccucamConfig,
    pub(super) events: EventBus,
    pub(super) orchestrator: Arc<PipelineOrchestrator>,
    pub(super) trigger: TriggerHandle,

    // Taken when the corresponding task starts
    pub(super) commands: Option<mpsc::Receiver<TriggerCommand>>,
    pub(super) results: Option<mpsc::Receiver<DetachedReport>>,

    // Lifecycle management
    pub(super) component_states: Arc<Mutex<HashMap<String, ComponentState>>>,
    pub(super) tasks: HashMap<String, JoinHandle<()>>,
    pub(super) trigger_address: Option<SocketAddr>,
    pub(super) shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    pub(super) shutdown_receiver: Option<oneshot::Receiver<ShutdownReason>>,
    pub(super) cancellation_token: CancellationToken,
    pub(super) results_token: CancellationToken,
}

impl PipelineRuntime {
    /// Build the runtime with the production adapters selected in `config`
    pub async fn new(config: OccucamConfig) -> Result<Self> {
        let events = if tracing::enabled!(Level::DEBUG) {
            EventBus::with_debug_logging(config.pipeline.event_bus_capacity)
        } else {
            EventBus::new(config.pipeline.event_bus_capacity)
        };

        let components = PipelineComponents {
            capture: adapter_from_config(&config.camera)?,
            metadata: MetadataExtractor::new(),
            inference: InferenceRunner::new(Arc::new(YoloDetector::from_config(
                &config.inference,
            ))),
            telemetry: Arc::new(TelemetryReporter::from_config(&config.telemetry)?),
        };
        let redactor = Arc::new(FaceBlurRedactor::from_config(&config.redaction));
        let store = Arc::new(AzureBlobStore::from_config(&config.storage)?);

        info!(
            "Using {} capture, blob container '{}'",
            components.capture.name(),
            config.storage.container
        );

        Ok(Self::from_parts(config, components, redactor, store, events))
    }

    /// Build the runtime around caller-supplied collaborators
    pub fn from_parts(
        config: OccucamConfig,
        components: PipelineComponents,
        redactor: Arc<dyn Redactor>,
        store: Arc<dyn BlobStore>,
        events: EventBus,
    ) -> Self {
        let (supervisor, results) = DetachedSupervisor::new(
            redactor,
            ArtifactPublisher::new(store),
            events.clone(),
            config.pipeline.max_detached_branches,
            config.pipeline.upload_unredacted_on_redaction_failure,
        );
        let arena = WorkspaceArena::new(
            config.pipeline.work_root(),
            config.pipeline.max_retained_workspaces,
        );
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            components,
            arena,
            Arc::new(supervisor),
            events.clone(),
            config.inference.failure_policy,
        ));
        let (trigger, commands) = TriggerHandle::channel(config.pipeline.command_queue_capacity);
        let (shutdown_sender, shutdown_receiver) = oneshot::channel();

        Self {
            config,
            events,
            orchestrator,
            trigger,
            commands: Some(commands),
            results: Some(results),
            component_states: Arc::new(Mutex::new(HashMap::new())),
            tasks: HashMap::new(),
            trigger_address: None,
            shutdown_sender: Arc::new(Mutex::new(Some(shutdown_sender))),
            shutdown_receiver: Some(shutdown_receiver),
            cancellation_token: CancellationToken::new(),
            results_token: CancellationToken::new(),
        }
    }

    pub fn orchestrator(&self) -> &Arc<PipelineOrchestrator> {
        &self.orchestrator
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Handle for queueing cycles from outside the trigger server
    pub fn trigger_handle(&self) -> TriggerHandle {
        self.trigger.clone()
    }

    /// Address the trigger server is listening on, once started
    pub fn trigger_address(&self) -> Option<SocketAddr> {
        self.trigger_address
    }

    /// Ask a running [`run`](Self::run) loop to shut down. Returns false if a
    /// shutdown was already requested.
    pub async fn request_shutdown(&self, reason: ShutdownReason) -> bool {
        match self.shutdown_sender.lock().await.take() {
            Some(sender) => sender.send(reason).is_ok(),
            None => false,
        }
    }
}
