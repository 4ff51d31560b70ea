//! Supervision of the redact → publish → cleanup branch.
//!
//! The main path hands each branch over and returns to idle immediately. Branches
//! run on a `JoinSet`, at most `max_branches` at a time, and report through a
//! result channel and the event bus. `drain` waits for whatever is still running
//! at shutdown.

use super::types::{DetachedOutcome, DetachedReport, DetachedStage};
use crate::events::{EventBus, PipelineEvent};
use crate::publish::ArtifactPublisher;
use crate::redaction::Redactor;
use crate::workspace::Workspace;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};

/// Work handed from the main path to a detached branch
#[derive(Debug)]
pub struct DetachedJob {
    pub workspace: Workspace,
    pub raw_image: PathBuf,
    /// Image to redact: the annotated detector output when present, else the raw capture
    pub redaction_source: PathBuf,
    pub blob_name: String,
}

/// Outcome of waiting for branches at shutdown
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub completed: usize,
    pub panicked: usize,
    pub aborted: usize,
}

struct BranchContext {
    redactor: Arc<dyn Redactor>,
    publisher: ArtifactPublisher,
    events: EventBus,
    upload_unredacted_on_redaction_failure: bool,
}

pub struct DetachedSupervisor {
    context: Arc<BranchContext>,
    permits: Arc<Semaphore>,
    tasks: Mutex<JoinSet<DetachedReport>>,
    results: mpsc::Sender<DetachedReport>,
}

impl DetachedSupervisor {
    /// Returns the supervisor and the receiving end of its result channel
    pub fn new(
        redactor: Arc<dyn Redactor>,
        publisher: ArtifactPublisher,
        events: EventBus,
        max_branches: usize,
        upload_unredacted_on_redaction_failure: bool,
    ) -> (Self, mpsc::Receiver<DetachedReport>) {
        let (results, receiver) = mpsc::channel(64);
        let supervisor = Self {
            context: Arc::new(BranchContext {
                redactor,
                publisher,
                events,
                upload_unredacted_on_redaction_failure,
            }),
            permits: Arc::new(Semaphore::new(max_branches.max(1))),
            tasks: Mutex::new(JoinSet::new()),
            results,
        };
        (supervisor, receiver)
    }

    /// Start a branch. Returns once it is queued; it waits for a permit on its own.
    pub async fn spawn(&self, job: DetachedJob) {
        let context = Arc::clone(&self.context);
        let permits = Arc::clone(&self.permits);
        let results = self.results.clone();
        let span = info_span!("detached", id = %job.workspace.cycle_id());

        let mut tasks = self.tasks.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!("Detached branch terminated abnormally: {}", e);
            }
        }

        tasks.spawn(
            async move {
                // Closed only if the supervisor is gone, in which case run anyway
                let _permit = permits.acquire_owned().await.ok();
                let report = run_branch(&context, job).await;

                context.events.publish(PipelineEvent::DetachedFinished {
                    cycle_id: report.cycle_id.clone(),
                    blob_name: report.blob_name.clone(),
                    outcome: report.outcome.clone(),
                });
                if results.try_send(report.clone()).is_err() {
                    warn!("Detached result channel full or closed; report only logged");
                }
                report
            }
            .instrument(span),
        );
    }

    /// Branches not yet reaped, finished or not
    pub async fn outstanding(&self) -> usize {
        self.tasks.lock().await.len()
    }

    /// Wait up to `limit` for every branch; anything still running afterwards is aborted
    pub async fn drain(&self, limit: Duration) -> DrainReport {
        let mut report = DrainReport::default();
        let deadline = Instant::now() + limit;
        let mut tasks = self.tasks.lock().await;

        if !tasks.is_empty() {
            info!("Waiting for {} detached branch(es)", tasks.len());
        }

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok(_))) => report.completed += 1,
                Ok(Some(Err(e))) => {
                    error!("Detached branch terminated abnormally: {}", e);
                    report.panicked += 1;
                }
                Ok(None) => break,
                Err(_) => {
                    report.aborted = tasks.len();
                    warn!(
                        "Drain timed out after {:?}; aborting {} branch(es)",
                        limit, report.aborted
                    );
                    tasks.abort_all();
                    while tasks.join_next().await.is_some() {}
                    break;
                }
            }
        }

        report
    }
}

fn enter(context: &BranchContext, cycle_id: &str, stage: DetachedStage) {
    context.events.publish(PipelineEvent::DetachedStageEntered {
        cycle_id: cycle_id.to_string(),
        stage,
    });
}

async fn run_branch(context: &BranchContext, job: DetachedJob) -> DetachedReport {
    let cycle_id = job.workspace.cycle_id().to_string();

    enter(context, &cycle_id, DetachedStage::Redacting);
    let redaction = match job.workspace.redacted_output(&job.blob_name) {
        Ok(output) => context
            .redactor
            .redact(&job.redaction_source, &output)
            .await
            .map(|()| output),
        Err(e) => Err(e),
    };
    let (upload_path, redacted) = match redaction {
        Ok(output) => (output, true),
        Err(e) if context.upload_unredacted_on_redaction_failure => {
            warn!("Face blur failed, uploading unredacted image: {}", e);
            (job.redaction_source.clone(), false)
        }
        Err(e) => {
            error!("Could not blur faces in {}: {}", job.redaction_source.display(), e);
            return DetachedReport {
                cycle_id,
                blob_name: job.blob_name,
                outcome: DetachedOutcome::RedactionFailed {
                    reason: e.to_string(),
                },
                cleanup: None,
            };
        }
    };

    enter(context, &cycle_id, DetachedStage::Publishing);
    if let Err(e) = context.publisher.publish(&upload_path, &job.blob_name).await {
        error!("Upload of {} failed, keeping local files: {}", job.blob_name, e);
        return DetachedReport {
            cycle_id,
            blob_name: job.blob_name,
            outcome: DetachedOutcome::PublishFailed {
                reason: e.to_string(),
            },
            cleanup: None,
        };
    }

    enter(context, &cycle_id, DetachedStage::CleaningUp);
    let cleanup = context
        .publisher
        .cleanup(&job.raw_image, job.workspace.dir())
        .await;

    DetachedReport {
        cycle_id,
        blob_name: job.blob_name,
        outcome: DetachedOutcome::Published { redacted },
        cleanup: Some(cleanup),
    }
}
