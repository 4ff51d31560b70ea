//! In-process fakes for the pipeline seams, shared by unit tests.

use crate::capture::{CaptureAdapter, CaptureResult};
use crate::config::InferenceFailurePolicy;
use crate::error::{
    CaptureError, InferenceError, ProvisioningError, PublishError, RedactionError, TelemetryError,
};
use crate::events::EventBus;
use crate::inference::{Detector, InferenceRunner};
use crate::metadata::{GpsFix, MetadataExtractor};
use crate::pipeline::{
    DetachedReport, DetachedSupervisor, PipelineComponents, PipelineOrchestrator,
};
use crate::publish::{ArtifactPublisher, BlobStore};
use crate::redaction::Redactor;
use crate::telemetry::{
    DeviceIdentity, IdentitySource, Provisioner, TelemetryMessage, TelemetryReporter,
    TelemetryTransport,
};
use crate::workspace::{Workspace, WorkspaceArena};
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

pub(crate) const CAMERA_TIMESTAMP: &str = "2022:05:13 18:20:14-04:00";

pub(crate) struct FakeCamera {
    pub(crate) fail: bool,
    /// Report the camera clock; without it the cycle falls back to EXIF
    pub(crate) reports_timestamp: bool,
    pub(crate) calls: AtomicUsize,
}

#[async_trait]
impl CaptureAdapter for FakeCamera {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn capture(&self, workspace: &Workspace) -> Result<CaptureResult, CaptureError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(CaptureError::DeviceUnavailable {
                details: "camera unplugged".to_string(),
            });
        }
        let path = workspace.image_path("IMG01.JPG");
        tokio::fs::write(&path, b"raw image").await?;
        Ok(CaptureResult {
            source_image_path: path,
            capture_timestamp: self
                .reports_timestamp
                .then(|| CAMERA_TIMESTAMP.to_string()),
            gps: Some(GpsFix {
                latitude: 40.5,
                longitude: -73.25,
                altitude: 0.0,
            }),
        })
    }
}

/// Writes an annotated image and a label file with 3 persons and 2 chairs
pub(crate) struct FakeDetector {
    pub(crate) fail: bool,
}

#[async_trait]
impl Detector for FakeDetector {
    async fn detect(&self, image: &Path, workspace: &Workspace) -> Result<(), InferenceError> {
        if self.fail {
            return Err(InferenceError::Timeout { seconds: 600 });
        }
        let labels = workspace.label_path(image);
        tokio::fs::create_dir_all(labels.parent().unwrap()).await.unwrap();
        tokio::fs::write(
            &labels,
            "0 0.1 0.1 0.1 0.1\n0 0.2 0.2 0.1 0.1\n0 0.3 0.3 0.1 0.1\n56 0.4 0.4 0.1 0.1\n56 0.5 0.5 0.1 0.1\n",
        )
        .await
        .unwrap();
        tokio::fs::write(workspace.annotated_image(image), b"annotated")
            .await
            .unwrap();
        Ok(())
    }
}

pub(crate) struct FakeProvisioner {
    pub(crate) status: &'static str,
}

#[async_trait]
impl Provisioner for FakeProvisioner {
    async fn register(&self) -> Result<DeviceIdentity, ProvisioningError> {
        if self.status != "assigned" {
            return Err(ProvisioningError::NotAssigned {
                status: self.status.to_string(),
            });
        }
        Ok(DeviceIdentity {
            hub_host: "hub.example.net".to_string(),
            device_id: "cam-1".to_string(),
            shared_access_key: "a2V5".to_string(),
        })
    }
}

#[derive(Default)]
pub(crate) struct RecordingTransport {
    pub(crate) sent: Mutex<Vec<String>>,
}

#[async_trait]
impl TelemetryTransport for RecordingTransport {
    async fn connect(&self, _identity: &DeviceIdentity) -> Result<(), TelemetryError> {
        Ok(())
    }

    async fn send(&self, message: &TelemetryMessage) -> Result<(), TelemetryError> {
        self.sent.lock().unwrap().push(message.body.clone());
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TelemetryError> {
        Ok(())
    }
}

/// Copies the source to the output, tagging which file was redacted. With a
/// gate it waits for a notification first.
pub(crate) struct FakeRedactor {
    pub(crate) fail: bool,
    pub(crate) gate: Option<Arc<Notify>>,
}

#[async_trait]
impl Redactor for FakeRedactor {
    async fn redact(&self, source: &Path, output: &Path) -> Result<(), RedactionError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail {
            return Err(RedactionError::ExitStatus {
                status: "exit status: 1".to_string(),
            });
        }
        let mut contents = tokio::fs::read(source).await.unwrap();
        contents.extend_from_slice(b" blurred");
        tokio::fs::write(output, contents).await.unwrap();
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MemoryStore {
    pub(crate) reject: bool,
    pub(crate) blobs: Mutex<Vec<(String, Vec<u8>)>>,
}

#[async_trait]
impl BlobStore for MemoryStore {
    async fn put_file(&self, local_path: &Path, blob_name: &str) -> Result<(), PublishError> {
        if self.reject {
            return Err(PublishError::Rejected {
                blob: blob_name.to_string(),
                status: 500,
                body: "InternalError".to_string(),
            });
        }
        let contents = tokio::fs::read(local_path).await.unwrap();
        self.blobs
            .lock()
            .unwrap()
            .push((blob_name.to_string(), contents));
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) _root: tempfile::TempDir,
    pub(crate) orchestrator: PipelineOrchestrator,
    pub(crate) results: mpsc::Receiver<DetachedReport>,
    pub(crate) camera: Arc<FakeCamera>,
    pub(crate) transport: Arc<RecordingTransport>,
    pub(crate) store: Arc<MemoryStore>,
    pub(crate) events: EventBus,
}

#[derive(Default)]
pub(crate) struct Scenario {
    pub(crate) capture_fails: bool,
    pub(crate) detector_fails: bool,
    pub(crate) redaction_fails: bool,
    pub(crate) upload_unredacted: bool,
    pub(crate) publish_fails: bool,
    pub(crate) abort_on_inference_failure: bool,
    pub(crate) provisioning_status: Option<&'static str>,
    pub(crate) no_camera_timestamp: bool,
    pub(crate) redaction_gate: Option<Arc<Notify>>,
}

pub(crate) fn harness(scenario: Scenario) -> Harness {
    let root = tempfile::tempdir().unwrap();
    let events = EventBus::new(64);

    let camera = Arc::new(FakeCamera {
        fail: scenario.capture_fails,
        reports_timestamp: !scenario.no_camera_timestamp,
        calls: AtomicUsize::new(0),
    });
    let transport = Arc::new(RecordingTransport::default());
    let store = Arc::new(MemoryStore {
        reject: scenario.publish_fails,
        ..Default::default()
    });

    let telemetry = TelemetryReporter::new(
        IdentitySource::Provisioned(Arc::new(FakeProvisioner {
            status: scenario.provisioning_status.unwrap_or("assigned"),
        })),
        transport.clone(),
        Duration::ZERO,
    );

    let (supervisor, results) = DetachedSupervisor::new(
        Arc::new(FakeRedactor {
            fail: scenario.redaction_fails,
            gate: scenario.redaction_gate,
        }),
        ArtifactPublisher::new(store.clone()),
        events.clone(),
        2,
        scenario.upload_unredacted,
    );

    let policy = if scenario.abort_on_inference_failure {
        InferenceFailurePolicy::AbortCycle
    } else {
        InferenceFailurePolicy::ZeroCounts
    };

    let orchestrator = PipelineOrchestrator::new(
        PipelineComponents {
            capture: camera.clone(),
            metadata: MetadataExtractor::new(),
            inference: InferenceRunner::new(Arc::new(FakeDetector {
                fail: scenario.detector_fails,
            })),
            telemetry: Arc::new(telemetry),
        },
        WorkspaceArena::new(root.path(), 5),
        Arc::new(supervisor),
        events.clone(),
        policy,
    );

    Harness {
        _root: root,
        orchestrator,
        results,
        camera,
        transport,
        store,
        events,
    }
}

pub(crate) async fn drain(harness: &mut Harness) -> Vec<DetachedReport> {
    harness
        .orchestrator
        .supervisor()
        .drain(Duration::from_secs(5))
        .await;
    let mut reports = Vec::new();
    while let Ok(report) = harness.results.try_recv() {
        reports.push(report);
    }
    reports
}

