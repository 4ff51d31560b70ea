mod orchestrator;
mod runtime;
mod shutdown;
mod startup;
mod state;
#[cfg(feature = "http-trigger")]
mod trigger;
mod types;
mod worker;

#[cfg(test)]
mod tests;

pub use orchestrator::PipelineRuntime;
#[cfg(feature = "http-trigger")]
pub use trigger::TriggerServer;
pub use types::{ComponentState, ShutdownReason, TriggerCommand};
pub use worker::{parse_location_id, run_command_worker, TriggerHandle};
