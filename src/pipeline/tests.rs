use super::*;
use crate::events::PipelineEvent;
use crate::inference::{InferenceResult, InferenceStatus};
use crate::test_support::{drain, harness, Scenario};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tokio::sync::Notify;

#[tokio::test]
async fn test_end_to_end_cycle() {
    let mut h = harness(Scenario::default());

    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Completed, "{:?}", report.errors);
    assert_eq!(report.failed_stage, None);
    assert_eq!(
        report.derived_filename.as_deref(),
        Some("7_20220513_182014-04:00.JPG")
    );
    let inference = report.inference.clone().unwrap();
    assert_eq!(
        inference.result,
        InferenceResult {
            person_count: 3,
            chair_count: 2
        }
    );
    assert_eq!(inference.status, InferenceStatus::Detected);
    assert_eq!(report.telemetry, TelemetryStatus::Sent);
    assert!(report.detached);
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);

    let sent = h.transport.sent.lock().unwrap().clone();
    assert_eq!(sent.len(), 1);
    let message: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(message["FileName"], "7_20220513_182014-04:00.JPG");
    assert_eq!(message["LocationID"], 7.0);
    assert_eq!(message["NumberOfPersons"], 3);
    assert_eq!(message["NumberOfEmptySeats"], 2);
    assert_eq!(message["DateTime"], "2022-05-13T18:20:14-04:00");
    assert_eq!(message["GPS_Latitude"], 40.5);

    let reports = drain(&mut h).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].outcome,
        DetachedOutcome::Published { redacted: true }
    );
    assert!(reports[0].cleanup.as_ref().unwrap().is_clean());

    let blobs = h.store.blobs.lock().unwrap();
    assert_eq!(blobs.len(), 1);
    assert_eq!(blobs[0].0, "7_20220513_182014-04:00.JPG");
    // The annotated detector output is what gets redacted
    assert_eq!(blobs[0].1, b"annotated blurred");

    assert!(!report.workspace_dir.unwrap().exists());
}

#[tokio::test]
async fn test_capture_failure_skips_everything_else() {
    let mut h = harness(Scenario {
        capture_fails: true,
        ..Default::default()
    });

    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.failed_stage, Some(PipelineState::Capturing));
    assert_eq!(report.telemetry, TelemetryStatus::Skipped);
    assert!(!report.detached);
    assert!(report.inference.is_none());
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
    assert_eq!(h.camera.calls.load(Ordering::SeqCst), 1);
    assert!(h.transport.sent.lock().unwrap().is_empty());

    assert!(drain(&mut h).await.is_empty());
    assert!(h.store.blobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_publish_failure_preserves_local_files() {
    let mut h = harness(Scenario {
        publish_fails: true,
        ..Default::default()
    });

    let report = h.orchestrator.run_cycle("7").await;
    assert_eq!(report.outcome, CycleOutcome::Completed);

    let reports = drain(&mut h).await;
    assert_eq!(reports.len(), 1);
    assert!(matches!(
        reports[0].outcome,
        DetachedOutcome::PublishFailed { .. }
    ));
    assert!(reports[0].cleanup.is_none());

    let workspace_dir = report.workspace_dir.unwrap();
    assert!(workspace_dir.join("IMG01.JPG").exists());
    assert!(workspace_dir
        .join("runs/detect/exp/7_20220513_182014-04:00.JPG")
        .exists());
}

#[tokio::test]
async fn test_provisioning_failure_is_partial_and_still_detaches() {
    let mut h = harness(Scenario {
        provisioning_status: Some("failed"),
        ..Default::default()
    });

    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert_eq!(report.failed_stage, Some(PipelineState::TelemetryReporting));
    assert!(matches!(report.telemetry, TelemetryStatus::Failed { .. }));
    assert!(report.detached);
    assert!(h.transport.sent.lock().unwrap().is_empty());

    let reports = drain(&mut h).await;
    assert_eq!(reports.len(), 1);
    assert!(reports[0].outcome.is_success());
}

#[tokio::test]
async fn test_inference_failure_degrades_to_zero_counts() {
    let mut h = harness(Scenario {
        detector_fails: true,
        ..Default::default()
    });

    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Partial);
    assert_eq!(report.failed_stage, Some(PipelineState::Inferring));
    assert_eq!(report.telemetry, TelemetryStatus::Sent);
    let sent = h.transport.sent.lock().unwrap().clone();
    let message: serde_json::Value = serde_json::from_str(&sent[0]).unwrap();
    assert_eq!(message["NumberOfPersons"], 0);
    assert_eq!(message["NumberOfEmptySeats"], 0);

    // Without an annotated image the raw capture is redacted
    drain(&mut h).await;
    assert_eq!(h.store.blobs.lock().unwrap()[0].1, b"raw image blurred");
}

#[tokio::test]
async fn test_inference_failure_aborts_under_abort_policy() {
    let mut h = harness(Scenario {
        detector_fails: true,
        abort_on_inference_failure: true,
        ..Default::default()
    });

    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.failed_stage, Some(PipelineState::Inferring));
    assert_eq!(report.telemetry, TelemetryStatus::Skipped);
    assert!(!report.detached);
    assert!(drain(&mut h).await.is_empty());
}

#[tokio::test]
async fn test_redaction_failure_uploads_nothing_by_default() {
    let mut h = harness(Scenario {
        redaction_fails: true,
        ..Default::default()
    });

    h.orchestrator.run_cycle("7").await;
    let reports = drain(&mut h).await;

    assert!(matches!(
        reports[0].outcome,
        DetachedOutcome::RedactionFailed { .. }
    ));
    assert!(h.store.blobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_redaction_failure_can_upload_unredacted() {
    let mut h = harness(Scenario {
        redaction_fails: true,
        upload_unredacted: true,
        ..Default::default()
    });

    h.orchestrator.run_cycle("7").await;
    let reports = drain(&mut h).await;

    assert_eq!(
        reports[0].outcome,
        DetachedOutcome::Published { redacted: false }
    );
    assert_eq!(h.store.blobs.lock().unwrap()[0].1, b"annotated");
}

#[tokio::test]
async fn test_consecutive_cycles_use_separate_workspaces() {
    let mut h = harness(Scenario {
        publish_fails: true,
        ..Default::default()
    });

    let first = h.orchestrator.run_cycle("7").await;
    let second = h.orchestrator.run_cycle("8").await;

    assert_ne!(first.cycle_id, second.cycle_id);
    assert_ne!(first.workspace_dir, second.workspace_dir);
    assert_eq!(drain(&mut h).await.len(), 2);
}

#[tokio::test]
async fn test_stage_events_are_published_in_order() {
    let h = harness(Scenario::default());
    let mut receiver = h.events.subscribe();

    h.orchestrator.run_cycle("7").await;

    let mut states = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let PipelineEvent::StageEntered { state, .. } = event {
            states.push(state);
        }
    }
    assert_eq!(
        states,
        vec![
            PipelineState::Capturing,
            PipelineState::MetadataReady,
            PipelineState::Inferring,
            PipelineState::TelemetryReporting,
            PipelineState::Detached,
            PipelineState::Idle,
        ]
    );
}

#[tokio::test]
async fn test_run_cycle_returns_while_branch_is_running() {
    let gate = Arc::new(Notify::new());
    let mut h = harness(Scenario {
        redaction_gate: Some(gate.clone()),
        ..Default::default()
    });

    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Completed);
    assert!(report.detached);
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
    assert_eq!(h.orchestrator.supervisor().outstanding().await, 1);
    assert!(h.store.blobs.lock().unwrap().is_empty());
    assert!(report.workspace_dir.as_ref().unwrap().exists());

    gate.notify_one();
    let reports = drain(&mut h).await;
    assert_eq!(reports.len(), 1);
    assert_eq!(
        reports[0].outcome,
        DetachedOutcome::Published { redacted: true }
    );
    assert_eq!(h.orchestrator.supervisor().outstanding().await, 0);
    assert_eq!(h.store.blobs.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_location_with_path_syntax_fails_before_capture() {
    let mut h = harness(Scenario::default());

    for location in ["../../../../escaped", "floor2/room7"] {
        let report = h.orchestrator.run_cycle(location).await;

        assert_eq!(report.outcome, CycleOutcome::Failed);
        assert_eq!(report.failed_stage, Some(PipelineState::Idle));
        assert_eq!(report.derived_filename, None);
        assert_eq!(report.workspace_dir, None);
        assert!(!report.detached);
    }

    assert_eq!(h.camera.calls.load(Ordering::SeqCst), 0);
    assert!(h.transport.sent.lock().unwrap().is_empty());
    assert!(drain(&mut h).await.is_empty());
    assert!(h.store.blobs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_timestamp_fails_at_metadata() {
    let mut h = harness(Scenario {
        no_camera_timestamp: true,
        ..Default::default()
    });

    // The fake capture carries no EXIF, so no timestamp source is left
    let report = h.orchestrator.run_cycle("7").await;

    assert_eq!(report.outcome, CycleOutcome::Failed);
    assert_eq!(report.failed_stage, Some(PipelineState::MetadataReady));
    assert!(report.inference.is_none());
    assert_eq!(report.derived_filename, None);
    assert_eq!(report.telemetry, TelemetryStatus::Skipped);
    assert!(!report.detached);
    assert_eq!(h.orchestrator.state(), PipelineState::Idle);
    assert!(drain(&mut h).await.is_empty());
}
