use super::types::ComponentState;
use super::worker::{parse_location_id, TriggerHandle};
use crate::config::TriggerConfig;
use crate::error::{OccucamError, Result, TriggerError};
use crate::pipeline::PipelineOrchestrator;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Shared state for the trigger endpoint
#[derive(Clone)]
pub(crate) struct TriggerState {
    trigger: TriggerHandle,
    method_name: Arc<str>,
    orchestrator: Arc<PipelineOrchestrator>,
    components: Arc<Mutex<HashMap<String, ComponentState>>>,
}

/// HTTP endpoint that turns remote method invocations into capture cycles
pub struct TriggerServer {
    config: TriggerConfig,
    state: TriggerState,
}

impl TriggerServer {
    pub fn new(
        config: TriggerConfig,
        trigger: TriggerHandle,
        orchestrator: Arc<PipelineOrchestrator>,
        components: Arc<Mutex<HashMap<String, ComponentState>>>,
    ) -> Self {
        let state = TriggerState {
            trigger,
            method_name: Arc::from(config.method_name.as_str()),
            orchestrator,
            components,
        };
        Self { config, state }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/methods/:method_name", post(method_handler))
            .route("/health", get(health_handler))
            .with_state(self.state.clone())
    }

    /// Bind and serve until `token` is cancelled. Returns the bound address, which
    /// differs from the configured one when port 0 was requested.
    pub async fn start(self, token: CancellationToken) -> Result<(SocketAddr, JoinHandle<()>)> {
        let app = self.router();
        let addr = self.config.bind_address();

        info!("Starting trigger server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr).await.map_err(|e| {
            OccucamError::component("trigger".to_string(), format!("bind {}: {}", addr, e))
        })?;
        let local_addr = listener.local_addr()?;

        info!(
            "Trigger server listening on {} (method {})",
            local_addr, self.config.method_name
        );

        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(token.cancelled_owned())
                .await
            {
                error!("Trigger server error: {}", e);
            }
            info!("Trigger server stopped");
        });

        Ok((local_addr, handle))
    }
}

async fn method_handler(
    State(state): State<TriggerState>,
    Path(method_name): Path<String>,
    body: String,
) -> Response {
    if method_name != *state.method_name {
        warn!("Unknown method '{}' invoked", method_name);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "result": false, "data": format!("unknown method '{}'", method_name) })),
        )
            .into_response();
    }

    let location_id = match parse_location_id(&body) {
        Ok(location_id) => location_id,
        Err(e) => return trigger_error_response(e),
    };
    info!("Method {} invoked for location {}", method_name, location_id);

    match state.trigger.trigger(&location_id).await {
        Ok(report) => {
            info!(
                "Cycle {} for location {} returned {:?}",
                report.cycle_id, location_id, report.outcome
            );
            (
                StatusCode::OK,
                Json(json!({ "result": true, "data": "some data" })),
            )
                .into_response()
        }
        Err(e) => trigger_error_response(e),
    }
}

fn trigger_error_response(e: TriggerError) -> Response {
    let status = match e {
        TriggerError::InvalidLocation { .. } => StatusCode::BAD_REQUEST,
        TriggerError::QueueFull { .. } | TriggerError::ShuttingDown => {
            StatusCode::SERVICE_UNAVAILABLE
        }
    };
    warn!("Trigger rejected: {}", e);
    (
        status,
        Json(json!({ "result": false, "data": e.to_string() })),
    )
        .into_response()
}

async fn health_handler(State(state): State<TriggerState>) -> impl IntoResponse {
    let components: BTreeMap<String, ComponentState> = state
        .components
        .lock()
        .await
        .iter()
        .map(|(name, s)| (name.clone(), *s))
        .collect();

    Json(json!({
        "status": "ok",
        "pipeline_state": state.orchestrator.state(),
        "components": components,
        "pending_triggers": state.trigger.pending(),
        "detached_outstanding": state.orchestrator.supervisor().outstanding().await,
        "subscribers": state.orchestrator.events().subscriber_count(),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}
