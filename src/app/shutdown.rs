use super::startup::{RESULTS, TRIGGER, WORKER};
use super::{ComponentState, PipelineRuntime};
use crate::error::{OccucamError, Result};
use std::time::Duration;
use tokio::time::timeout;
use tracing::{error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

impl PipelineRuntime {
    /// Stop accepting triggers, let the in-flight cycle finish, drain detached
    /// branches and stop the result logger. Returns the exit code.
    pub async fn shutdown(&mut self) -> Result<i32> {
        info!("Beginning graceful shutdown");

        self.cancellation_token.cancel();

        let mut exit_code = 0;
        let drain_timeout = self.config.pipeline.drain_timeout();

        // The worker finishes its current cycle before the server stops waiting on it
        if let Err(e) = self.stop_component(WORKER, drain_timeout).await {
            error!("Error stopping worker: {}", e);
            exit_code = 1;
        }

        if let Err(e) = self.stop_component(TRIGGER, STOP_TIMEOUT).await {
            error!("Error stopping trigger server: {}", e);
            exit_code = 1;
        }

        let drained = self.orchestrator.supervisor().drain(drain_timeout).await;
        info!(
            "Detached branches drained: {} completed, {} panicked, {} aborted",
            drained.completed, drained.panicked, drained.aborted
        );
        if drained.aborted > 0 || drained.panicked > 0 {
            warn!("Some detached branches did not finish cleanly");
            exit_code = 1;
        }

        self.results_token.cancel();
        if let Err(e) = self.stop_component(RESULTS, STOP_TIMEOUT).await {
            error!("Error stopping result logger: {}", e);
            exit_code = 1;
        }

        info!("Graceful shutdown completed with exit code: {}", exit_code);
        Ok(exit_code)
    }

    /// Wait up to `limit` for a component task to exit, aborting it afterwards
    async fn stop_component(&mut self, component: &str, limit: Duration) -> Result<()> {
        let Some(handle) = self.tasks.remove(component) else {
            if self.get_component_state(component).await.is_some() {
                self.set_component_state(component, ComponentState::Stopped)
                    .await;
            }
            return Ok(());
        };

        info!("Stopping {} component", component);
        self.set_component_state(component, ComponentState::Stopping)
            .await;

        let abort = handle.abort_handle();
        match timeout(limit, handle).await {
            Ok(Ok(())) => {
                self.set_component_state(component, ComponentState::Stopped)
                    .await;
                info!("{} component stopped", component);
                Ok(())
            }
            Ok(Err(e)) => {
                self.set_component_state(component, ComponentState::Failed)
                    .await;
                Err(OccucamError::component(
                    component.to_string(),
                    format!("task ended abnormally: {}", e),
                ))
            }
            Err(_) => {
                abort.abort();
                self.set_component_state(component, ComponentState::Failed)
                    .await;
                error!("{} component stop timeout", component);
                Err(OccucamError::component(
                    component.to_string(),
                    format!("did not stop within {:?}", limit),
                ))
            }
        }
    }
}
