use crate::pipeline::CycleReport;
use serde::Serialize;
use tokio::sync::oneshot;

/// Component lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ComponentState {
    Stopped,
    Starting,
    Running,
    Stopping,
    Failed,
}

/// System shutdown reason
#[derive(Debug, Clone)]
pub enum ShutdownReason {
    Signal(String),
    Error(String),
    UserRequest,
}

impl ShutdownReason {
    pub fn describe(&self) -> String {
        match self {
            ShutdownReason::Signal(name) => format!("signal {}", name),
            ShutdownReason::Error(message) => format!("error: {}", message),
            ShutdownReason::UserRequest => "user request".to_string(),
        }
    }
}

/// Request to run one capture cycle, answered once the main path is done
#[derive(Debug)]
pub struct TriggerCommand {
    pub location_id: String,
    pub reply: oneshot::Sender<CycleReport>,
}
