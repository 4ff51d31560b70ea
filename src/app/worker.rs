//! Serialized execution of trigger commands.
//!
//! Every trigger source (HTTP method, CLI) goes through a [`TriggerHandle`]. The
//! command worker pulls from the queue and runs one cycle at a time, so the camera
//! and the detector never see two cycles at once.

use super::types::TriggerCommand;
use crate::error::TriggerError;
use crate::pipeline::{check_location_id, CycleReport, PipelineOrchestrator};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Cloneable sender side of the command queue
#[derive(Clone)]
pub struct TriggerHandle {
    sender: mpsc::Sender<TriggerCommand>,
    capacity: usize,
}

impl TriggerHandle {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<TriggerCommand>) {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender, capacity }, receiver)
    }

    /// Queue a cycle for `location_id` and wait for its main path to finish.
    /// Fails immediately when the queue is full instead of piling up callers.
    pub async fn trigger(&self, location_id: &str) -> Result<CycleReport, TriggerError> {
        let location_id = location_id.trim();
        check_location_id(location_id)?;

        let (reply, response) = oneshot::channel();
        let command = TriggerCommand {
            location_id: location_id.to_string(),
            reply,
        };

        self.sender.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!("Rejecting trigger for {}: queue full", location_id);
                TriggerError::QueueFull {
                    capacity: self.capacity,
                }
            }
            mpsc::error::TrySendError::Closed(_) => TriggerError::ShuttingDown,
        })?;
        debug!("Queued trigger for location {}", location_id);

        response.await.map_err(|_| TriggerError::ShuttingDown)
    }

    /// Commands waiting for the worker
    pub fn pending(&self) -> usize {
        self.capacity - self.sender.capacity()
    }
}

/// Run queued cycles until `token` is cancelled or every handle is gone. A cycle
/// that already started is finished before the worker exits; commands still
/// queued at that point are dropped and their callers see `ShuttingDown`.
pub async fn run_command_worker(
    orchestrator: Arc<PipelineOrchestrator>,
    mut commands: mpsc::Receiver<TriggerCommand>,
    token: CancellationToken,
) {
    info!("Command worker started");

    loop {
        let command = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            command = commands.recv() => match command {
                Some(command) => command,
                None => break,
            },
        };

        let report = orchestrator.run_cycle(&command.location_id).await;
        if command.reply.send(report).is_err() {
            debug!("Trigger caller went away before the cycle finished");
        }
    }

    commands.close();
    let mut dropped = 0;
    while commands.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        warn!("Dropped {} queued trigger(s) at shutdown", dropped);
    }
    info!("Command worker stopped");
}

/// Location id carried by a trigger payload: a JSON number or string. Integral
/// numbers are rendered without a fractional part.
pub fn parse_location_id(payload: &str) -> Result<String, TriggerError> {
    let value: Value =
        serde_json::from_str(payload.trim()).map_err(|e| TriggerError::InvalidLocation {
            details: format!("payload is not JSON: {}", e),
        })?;

    let location_id = match value {
        Value::Number(number) => {
            if let Some(i) = number.as_i64() {
                i.to_string()
            } else if let Some(u) = number.as_u64() {
                u.to_string()
            } else {
                match number.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => {
                        (f as i64).to_string()
                    }
                    Some(f) => f.to_string(),
                    None => number.to_string(),
                }
            }
        }
        Value::String(s) => s.trim().to_string(),
        other => {
            return Err(TriggerError::InvalidLocation {
                details: format!("expected a number or string, got {}", other),
            })
        }
    };

    check_location_id(&location_id)?;
    Ok(location_id)
}
