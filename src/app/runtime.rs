use super::startup::log_detached_report;
use super::{PipelineRuntime, ShutdownReason};
use crate::error::{OccucamError, Result};
use crate::events::PipelineEvent;
use crate::pipeline::{check_location_id, CycleReport};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::signal;
use tokio::sync::{oneshot, Mutex};
use tracing::{error, info, warn};

impl PipelineRuntime {
    /// Serve triggers until a signal or a shutdown request arrives, then shut
    /// down gracefully. Returns the process exit code.
    pub async fn run(&mut self) -> Result<i32> {
        info!("occucam is running");

        let shutdown_receiver = self
            .shutdown_receiver
            .take()
            .ok_or_else(|| OccucamError::system("Shutdown receiver already taken"))?;

        self.setup_signal_handlers(Arc::clone(&self.shutdown_sender));

        let shutdown_reason = shutdown_receiver
            .await
            .map_err(|_| OccucamError::system("Shutdown channel closed unexpectedly"))?;

        info!("Shutdown initiated: {:?}", shutdown_reason);
        self.events.publish(PipelineEvent::ShutdownRequested {
            timestamp: SystemTime::now(),
            reason: shutdown_reason.describe(),
        });

        let mut exit_code = self.shutdown().await?;
        if matches!(shutdown_reason, ShutdownReason::Error(_)) {
            exit_code = 1;
        }

        info!("occucam shutdown complete");
        Ok(exit_code)
    }

    /// Run a single cycle without the trigger server and wait for its detached
    /// branch before returning.
    pub async fn run_once(&mut self, location_id: &str) -> Result<CycleReport> {
        let location_id = location_id.trim();
        check_location_id(location_id)?;
        info!("Running a single cycle for location {}", location_id);

        let report = self.orchestrator.run_cycle(location_id).await;

        let drained = self
            .orchestrator
            .supervisor()
            .drain(self.config.pipeline.drain_timeout())
            .await;
        if drained.aborted > 0 {
            warn!("{} detached branch(es) did not finish in time", drained.aborted);
        }

        if let Some(results) = self.results.as_mut() {
            while let Ok(detached) = results.try_recv() {
                log_detached_report(&detached);
            }
        }

        Ok(report)
    }

    /// Set up signal handlers for graceful shutdown
    fn setup_signal_handlers(
        &self,
        shutdown_sender: Arc<Mutex<Option<oneshot::Sender<ShutdownReason>>>>,
    ) {
        // Handle SIGTERM (systemd stop) - Unix only
        #[cfg(unix)]
        {
            let shutdown_sender_sigterm = Arc::clone(&shutdown_sender);
            tokio::spawn(async move {
                let mut sigterm = match signal::unix::signal(signal::unix::SignalKind::terminate())
                {
                    Ok(sigterm) => sigterm,
                    Err(e) => {
                        error!("Failed to register SIGTERM handler: {}", e);
                        return;
                    }
                };
                if sigterm.recv().await.is_some() {
                    info!("Received SIGTERM signal");
                    if let Some(sender) = shutdown_sender_sigterm.lock().await.take() {
                        let _ = sender.send(ShutdownReason::Signal("SIGTERM".to_string()));
                    }
                }
            });
        }

        // Handle SIGINT (Ctrl+C) - Cross-platform
        let shutdown_sender_sigint = Arc::clone(&shutdown_sender);
        tokio::spawn(async move {
            if let Ok(()) = signal::ctrl_c().await {
                info!("Received SIGINT signal (Ctrl+C)");
                if let Some(sender) = shutdown_sender_sigint.lock().await.take() {
                    let _ = sender.send(ShutdownReason::Signal("SIGINT".to_string()));
                }
            }
        });
    }
}
