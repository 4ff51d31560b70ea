use super::worker::run_command_worker;
use super::{ComponentState, PipelineRuntime};
use crate::error::{OccucamError, Result};
use crate::pipeline::{DetachedOutcome, DetachedReport};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub(super) const WORKER: &str = "worker";
pub(super) const RESULTS: &str = "results";
pub(super) const TRIGGER: &str = "trigger";

impl PipelineRuntime {
    /// Initialize all system components
    pub async fn initialize(&mut self) -> Result<()> {
        info!("Initializing occucam components");

        let mut states = self.component_states.lock().await;
        states.insert(WORKER.to_string(), ComponentState::Stopped);
        states.insert(RESULTS.to_string(), ComponentState::Stopped);
        if cfg!(feature = "http-trigger") {
            states.insert(TRIGGER.to_string(), ComponentState::Stopped);
        }
        drop(states);

        tokio::fs::create_dir_all(self.config.pipeline.work_root()).await?;

        info!(
            "Work root {} ready",
            self.config.pipeline.work_root().display()
        );
        Ok(())
    }

    /// Start the result logger, the command worker and the trigger server
    pub async fn start(&mut self) -> Result<()> {
        info!("Starting occucam");

        let results = self
            .results
            .take()
            .ok_or_else(|| OccucamError::system("Detached result channel already taken"))?;
        self.set_component_state(RESULTS, ComponentState::Starting)
            .await;
        let token = self.results_token.clone();
        self.tasks.insert(
            RESULTS.to_string(),
            tokio::spawn(log_detached_results(results, token)),
        );
        self.set_component_state(RESULTS, ComponentState::Running)
            .await;

        let commands = self
            .commands
            .take()
            .ok_or_else(|| OccucamError::system("Command queue already taken"))?;
        self.set_component_state(WORKER, ComponentState::Starting)
            .await;
        self.tasks.insert(
            WORKER.to_string(),
            tokio::spawn(run_command_worker(
                self.orchestrator.clone(),
                commands,
                self.cancellation_token.clone(),
            )),
        );
        self.set_component_state(WORKER, ComponentState::Running)
            .await;

        #[cfg(feature = "http-trigger")]
        {
            self.set_component_state(TRIGGER, ComponentState::Starting)
                .await;

            let server = super::trigger::TriggerServer::new(
                self.config.trigger.clone(),
                self.trigger.clone(),
                self.orchestrator.clone(),
                self.component_states.clone(),
            );
            match server.start(self.cancellation_token.clone()).await {
                Ok((address, handle)) => {
                    self.trigger_address = Some(address);
                    self.tasks.insert(TRIGGER.to_string(), handle);
                    self.set_component_state(TRIGGER, ComponentState::Running)
                        .await;
                }
                Err(e) => {
                    error!("Failed to start trigger server: {}", e);
                    self.set_component_state(TRIGGER, ComponentState::Failed)
                        .await;
                    return Err(e);
                }
            }
        }

        info!("All components started");
        Ok(())
    }
}

/// Log detached outcomes until `token` is cancelled, then flush what is queued
pub(super) async fn log_detached_results(
    mut results: mpsc::Receiver<DetachedReport>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            report = results.recv() => match report {
                Some(report) => log_detached_report(&report),
                None => break,
            },
        }
    }
    while let Ok(report) = results.try_recv() {
        log_detached_report(&report);
    }
}

pub(super) fn log_detached_report(report: &DetachedReport) {
    match &report.outcome {
        DetachedOutcome::Published { redacted: true } => {
            info!("Cycle {}: published {}", report.cycle_id, report.blob_name)
        }
        DetachedOutcome::Published { redacted: false } => warn!(
            "Cycle {}: published {} without face redaction",
            report.cycle_id, report.blob_name
        ),
        DetachedOutcome::RedactionFailed { reason } => error!(
            "Cycle {}: {} not published, redaction failed: {}",
            report.cycle_id, report.blob_name, reason
        ),
        DetachedOutcome::PublishFailed { reason } => error!(
            "Cycle {}: upload of {} failed, local files kept: {}",
            report.cycle_id, report.blob_name, reason
        ),
    }

    if let Some(cleanup) = &report.cleanup {
        for e in &cleanup.errors {
            warn!("Cycle {}: cleanup incomplete: {}", report.cycle_id, e);
        }
    }
}
