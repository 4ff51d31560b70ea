use super::*;
use crate::config::OccucamConfig;
use crate::error::TriggerError;
use crate::events::EventBus;
use crate::inference::InferenceRunner;
use crate::metadata::MetadataExtractor;
use crate::pipeline::{CycleOutcome, PipelineComponents, PipelineState};
use crate::telemetry::{IdentitySource, TelemetryReporter};
use crate::test_support::{
    harness, FakeCamera, FakeDetector, FakeProvisioner, FakeRedactor, MemoryStore,
    RecordingTransport, Scenario,
};
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn test_config(work_root: &std::path::Path) -> OccucamConfig {
    let mut config = OccucamConfig::default();
    config.pipeline.work_root = work_root.to_string_lossy().into_owned();
    config.pipeline.drain_timeout_seconds = 5;
    config.trigger.ip = "127.0.0.1".to_string();
    config.trigger.port = 0;
    config
}

fn test_runtime(work_root: &std::path::Path) -> (PipelineRuntime, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::default());
    let telemetry = TelemetryReporter::new(
        IdentitySource::Provisioned(Arc::new(FakeProvisioner { status: "assigned" })),
        Arc::new(RecordingTransport::default()),
        Duration::ZERO,
    );
    let components = PipelineComponents {
        capture: Arc::new(FakeCamera {
            fail: false,
            reports_timestamp: true,
            calls: AtomicUsize::new(0),
        }),
        metadata: MetadataExtractor::new(),
        inference: InferenceRunner::new(Arc::new(FakeDetector { fail: false })),
        telemetry: Arc::new(telemetry),
    };

    let runtime = PipelineRuntime::from_parts(
        test_config(work_root),
        components,
        Arc::new(FakeRedactor {
            fail: false,
            gate: None,
        }),
        store.clone(),
        EventBus::new(64),
    );
    (runtime, store)
}

#[test]
fn test_parse_location_id() {
    assert_eq!(parse_location_id("7").unwrap(), "7");
    assert_eq!(parse_location_id(" 7.0 ").unwrap(), "7");
    assert_eq!(parse_location_id("7.5").unwrap(), "7.5");
    assert_eq!(parse_location_id("\"lobby\"").unwrap(), "lobby");
    assert_eq!(parse_location_id("\"07\"").unwrap(), "07");

    assert!(matches!(
        parse_location_id("{}"),
        Err(TriggerError::InvalidLocation { .. })
    ));
    assert!(matches!(
        parse_location_id("\"  \""),
        Err(TriggerError::InvalidLocation { .. })
    ));
    assert!(matches!(
        parse_location_id("not json"),
        Err(TriggerError::InvalidLocation { .. })
    ));
}

#[tokio::test]
async fn test_location_ids_with_path_syntax_are_rejected() {
    for payload in [
        "\"../../../../x\"",
        "\"floor2/room7\"",
        "\"..\\\\lobby\"",
        "\"lobby\\u0000\"",
    ] {
        assert!(
            matches!(
                parse_location_id(payload),
                Err(TriggerError::InvalidLocation { .. })
            ),
            "{} should be rejected",
            payload
        );
    }

    // Rejected before it reaches the queue
    let (handle, _commands) = TriggerHandle::channel(1);
    assert!(matches!(
        handle.trigger("floor2/room7").await,
        Err(TriggerError::InvalidLocation { .. })
    ));
    assert_eq!(handle.pending(), 0);

    let root = tempfile::tempdir().unwrap();
    let (mut runtime, store) = test_runtime(root.path());
    runtime.initialize().await.unwrap();
    assert!(runtime.run_once("../../../../x").await.is_err());
    assert!(store.blobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_worker_runs_queued_cycles() {
    let h = harness(Scenario::default());
    let orchestrator = Arc::new(h.orchestrator);
    let (handle, commands) = TriggerHandle::channel(4);
    let token = CancellationToken::new();
    let worker = tokio::spawn(run_command_worker(
        orchestrator.clone(),
        commands,
        token.clone(),
    ));

    let report = handle.trigger("7").await.unwrap();
    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(report.location_id, "7");

    let second = handle.trigger("8").await.unwrap();
    assert_ne!(report.cycle_id, second.cycle_id);

    token.cancel();
    worker.await.unwrap();
    assert!(matches!(
        handle.trigger("9").await,
        Err(TriggerError::ShuttingDown)
    ));

    orchestrator.supervisor().drain(Duration::from_secs(5)).await;
}

#[tokio::test]
async fn test_trigger_rejected_when_queue_full() {
    let (handle, commands) = TriggerHandle::channel(1);

    let first = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.trigger("7").await })
    };
    while handle.pending() < 1 {
        tokio::task::yield_now().await;
    }

    assert!(matches!(
        handle.trigger("8").await,
        Err(TriggerError::QueueFull { capacity: 1 })
    ));
    assert!(matches!(
        handle.trigger("  ").await,
        Err(TriggerError::InvalidLocation { .. })
    ));

    // The queued caller is released once the queue goes away
    drop(commands);
    assert!(matches!(
        first.await.unwrap(),
        Err(TriggerError::ShuttingDown)
    ));
}

#[tokio::test]
async fn test_run_once_drains_detached_branch() {
    let root = tempfile::tempdir().unwrap();
    let (mut runtime, store) = test_runtime(root.path());
    runtime.initialize().await.unwrap();

    let report = runtime.run_once("7").await.unwrap();

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert_eq!(
        report.derived_filename.as_deref(),
        Some("7_20220513_182014-04:00.JPG")
    );
    let blobs = store.blobs.lock().unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].0, "7_20220513_182014-04:00.JPG");
}

#[tokio::test]
async fn test_shutdown_request_stops_components() {
    let root = tempfile::tempdir().unwrap();
    let (mut runtime, _store) = test_runtime(root.path());
    runtime.initialize().await.unwrap();
    runtime.start().await.unwrap();

    assert_eq!(
        runtime.get_component_state("worker").await,
        Some(ComponentState::Running)
    );

    assert!(runtime.request_shutdown(ShutdownReason::UserRequest).await);
    assert!(!runtime.request_shutdown(ShutdownReason::UserRequest).await);

    let exit_code = runtime.run().await.unwrap();
    assert_eq!(exit_code, 0);

    let states = runtime.get_all_component_states().await;
    assert!(states.values().all(|s| *s == ComponentState::Stopped));
}

#[cfg(feature = "http-trigger")]
mod http {
    use super::*;
    use serde_json::Value;

    #[tokio::test]
    async fn test_method_invocation_runs_cycle() {
        let root = tempfile::tempdir().unwrap();
        let (mut runtime, store) = test_runtime(root.path());
        runtime.initialize().await.unwrap();
        runtime.start().await.unwrap();
        let base = format!("http://{}", runtime.trigger_address().unwrap());
        let client = reqwest::Client::new();

        let response = client
            .post(format!("{}/methods/RunWIP", base))
            .body("7")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["result"], true);
        assert_eq!(body["data"], "some data");

        let response = client
            .post(format!("{}/methods/Reboot", base))
            .body("7")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 404);

        let response = client
            .post(format!("{}/methods/RunWIP", base))
            .body("[1, 2]")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let response = client
            .post(format!("{}/methods/RunWIP", base))
            .body("\"../../../../x\"")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 400);

        let health: Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["status"], "ok");
        assert_eq!(health["pipeline_state"], "Idle");
        assert_eq!(health["components"]["trigger"], "Running");

        runtime.request_shutdown(ShutdownReason::UserRequest).await;
        assert_eq!(runtime.run().await.unwrap(), 0);
        assert_eq!(runtime.orchestrator().state(), PipelineState::Idle);

        // Shutdown drained the branch started by the first invocation
        assert_eq!(store.blobs.lock().unwrap().len(), 1);
    }
}
