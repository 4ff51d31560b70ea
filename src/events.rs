use crate::pipeline::{CycleOutcome, DetachedOutcome, DetachedStage, PipelineState};
use serde::Serialize;
use std::time::SystemTime;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Events that can occur while the pipeline runs
#[derive(Debug, Clone, Serialize)]
pub enum PipelineEvent {
    /// A trigger started a new capture cycle
    CycleStarted {
        cycle_id: String,
        location_id: String,
        timestamp: SystemTime,
    },
    /// The main cycle entered a new state
    StageEntered {
        cycle_id: String,
        state: PipelineState,
    },
    /// The main cycle returned control to its caller
    CycleFinished {
        cycle_id: String,
        outcome: CycleOutcome,
        failed_stage: Option<PipelineState>,
    },
    /// A detached redact/publish branch entered a new stage
    DetachedStageEntered {
        cycle_id: String,
        stage: DetachedStage,
    },
    /// A detached branch finished
    DetachedFinished {
        cycle_id: String,
        blob_name: String,
        outcome: DetachedOutcome,
    },
    /// System shutdown requested
    ShutdownRequested {
        timestamp: SystemTime,
        reason: String,
    },
}

impl PipelineEvent {
    /// Get a human-readable description of the event
    pub fn description(&self) -> String {
        match self {
            PipelineEvent::CycleStarted {
                cycle_id,
                location_id,
                ..
            } => format!("Cycle {} started for location {}", cycle_id, location_id),
            PipelineEvent::StageEntered { cycle_id, state } => {
                format!("Cycle {} entered {:?}", cycle_id, state)
            }
            PipelineEvent::CycleFinished {
                cycle_id,
                outcome,
                failed_stage,
            } => match failed_stage {
                Some(stage) => format!(
                    "Cycle {} finished {:?} (failed at {:?})",
                    cycle_id, outcome, stage
                ),
                None => format!("Cycle {} finished {:?}", cycle_id, outcome),
            },
            PipelineEvent::DetachedStageEntered { cycle_id, stage } => {
                format!("Detached branch {} entered {:?}", cycle_id, stage)
            }
            PipelineEvent::DetachedFinished {
                cycle_id,
                blob_name,
                outcome,
            } => format!(
                "Detached branch {} for {} finished: {:?}",
                cycle_id, blob_name, outcome
            ),
            PipelineEvent::ShutdownRequested { reason, .. } => {
                format!("Shutdown requested: {}", reason)
            }
        }
    }

    /// Get the event type as a string for filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            PipelineEvent::CycleStarted { .. } => "cycle_started",
            PipelineEvent::StageEntered { .. } => "stage_entered",
            PipelineEvent::CycleFinished { .. } => "cycle_finished",
            PipelineEvent::DetachedStageEntered { .. } => "detached_stage_entered",
            PipelineEvent::DetachedFinished { .. } => "detached_finished",
            PipelineEvent::ShutdownRequested { .. } => "shutdown_requested",
        }
    }
}

/// Async event bus for component coordination using broadcast channels
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
    debug_logging: bool,
}

impl EventBus {
    /// Create a new event bus with the specified channel capacity
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            debug_logging: false,
        }
    }

    /// Create a new event bus with debug logging enabled
    pub fn with_debug_logging(capacity: usize) -> Self {
        let mut bus = Self::new(capacity);
        bus.debug_logging = true;
        bus
    }

    /// Subscribe to events and get a receiver
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish an event to all subscribers. Returns the number of receivers reached;
    /// having none is not an error.
    pub fn publish(&self, event: PipelineEvent) -> usize {
        match &event {
            PipelineEvent::CycleFinished {
                outcome: CycleOutcome::Failed,
                ..
            } => {
                error!("{}", event.description());
            }
            PipelineEvent::CycleFinished {
                outcome: CycleOutcome::Partial,
                ..
            } => {
                warn!("{}", event.description());
            }
            PipelineEvent::DetachedFinished { outcome, .. } if !outcome.is_success() => {
                warn!("{}", event.description());
            }
            PipelineEvent::CycleFinished { .. }
            | PipelineEvent::DetachedFinished { .. }
            | PipelineEvent::ShutdownRequested { .. } => {
                info!("{}", event.description());
            }
            _ => {
                if self.debug_logging {
                    debug!("Event: {}", event.description());
                }
            }
        }

        self.sender.send(event).unwrap_or(0)
    }

    /// Get the number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Clone for EventBus {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            debug_logging: self.debug_logging,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new(16);
        let mut receiver = bus.subscribe();

        let delivered = bus.publish(PipelineEvent::StageEntered {
            cycle_id: "c1".to_string(),
            state: PipelineState::Capturing,
        });
        assert_eq!(delivered, 1);

        let event = timeout(Duration::from_millis(100), receiver.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.event_type(), "stage_entered");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::new(4);
        let delivered = bus.publish(PipelineEvent::ShutdownRequested {
            timestamp: SystemTime::now(),
            reason: "test".to_string(),
        });
        assert_eq!(delivered, 0);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_descriptions() {
        let event = PipelineEvent::CycleFinished {
            cycle_id: "abc".to_string(),
            outcome: CycleOutcome::Failed,
            failed_stage: Some(PipelineState::Capturing),
        };
        assert_eq!(
            event.description(),
            "Cycle abc finished Failed (failed at Capturing)"
        );
    }
}
