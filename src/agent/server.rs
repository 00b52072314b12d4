//! Agent HTTP surface: command execution and message proxying.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Router,
};
use tower_http::trace::TraceLayer;

use super::Agent;
use crate::executor::ExecError;

/// Build the agent router.
pub fn create_router(agent: Arc<Agent>) -> Router {
    Router::new()
        .route("/execute/:command", get(execute))
        .route("/message/*path", post(proxy_message))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(agent)
}

async fn health_check() -> &'static str {
    "OK"
}

/// HTTP status for an execution outcome.
pub fn status_for(result: &Result<(), ExecError>) -> StatusCode {
    match result {
        Ok(()) => StatusCode::OK,
        Err(ExecError::NotFound(_)) => StatusCode::NOT_FOUND,
        Err(ExecError::PermissionDenied { .. }) => StatusCode::FORBIDDEN,
        Err(ExecError::Timeout(_)) => StatusCode::GATEWAY_TIMEOUT,
        Err(ExecError::ExecutionFailed { .. }) | Err(ExecError::Spawn { .. }) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

/// `GET /execute/<command>?from=<sender>&args=<a1>&args=<a2>`.
async fn execute(
    State(agent): State<Arc<Agent>>,
    Path(command): Path<String>,
    Query(params): Query<Vec<(String, String)>>,
) -> (StatusCode, String) {
    let mut sender = String::new();
    let mut args = Vec::new();
    for (key, value) in params {
        match key.as_str() {
            "from" => sender = value,
            "args" => args.push(value),
            _ => tracing::debug!("Ignoring query parameter {}", key),
        }
    }

    let execution = agent.executor().execute(&command, &args, &sender).await;
    (status_for(&execution.result), execution.render())
}

/// `POST /message/<path>`: forward to the hub, mirroring its answer.
async fn proxy_message(
    State(agent): State<Arc<Agent>>,
    Path(path): Path<String>,
    body: Bytes,
) -> (StatusCode, String) {
    let url = match agent.message_url(&path) {
        Ok(url) => url,
        Err(e) => return (StatusCode::BAD_GATEWAY, format!("{}\n", e)),
    };

    let response = match agent.http().post(url.clone()).body(body).send().await {
        Ok(response) => response,
        Err(e) => {
            tracing::warn!("Proxy to {} failed: {}", url, e);
            return (StatusCode::BAD_GATEWAY, format!("{}\n", e));
        }
    };

    let status = StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    match response.text().await {
        Ok(text) => (status, text),
        Err(e) => (StatusCode::BAD_GATEWAY, format!("{}\n", e)),
    }
}
