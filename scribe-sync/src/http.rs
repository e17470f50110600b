//! The daemon's HTTP control plane.
//!
//! | Method | Path                | Semantics                      |
//! |--------|---------------------|--------------------------------|
//! | GET    | `/health`           | liveness, always `200 OK\n`    |
//! | GET    | `/ready`            | `200` iff credentials on disk  |
//! | GET    | `/status`           | JSON status snapshot           |
//! | POST   | `/api/sync/trigger` | `202`, `409` unless idle       |
//! | POST   | `/api/sync/cancel`  | `200`, `409` unless syncing    |
//!
//! Handlers run on per-request contexts independent of the daemon's
//! lifetime; the server itself shuts down gracefully with the daemon.

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use scribe_tokio::{NamedTask, ShutdownChannel};
use tracing::info;

use crate::daemon::{ControlShared, DaemonState};

pub(crate) fn router(shared: Arc<ControlShared>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/status", get(status))
        .route("/api/sync/trigger", post(trigger))
        .route("/api/sync/cancel", post(cancel))
        .with_state(shared)
}

/// Serve the control API until `shutdown` fires.
pub(crate) fn spawn_control_server(
    listener: tokio::net::TcpListener,
    shared: Arc<ControlShared>,
    shutdown: ShutdownChannel,
) -> NamedTask<()> {
    let app = router(shared);
    NamedTask::spawn("control-server", async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.recv_owned())
            .await;
        if let Err(e) = result {
            tracing::error!("Control server failed: {e:#}");
        }
    })
}

async fn health() -> &'static str {
    "OK\n"
}

async fn ready(State(shared): State<Arc<ControlShared>>) -> Response {
    if shared.runner.is_ready() {
        (StatusCode::OK, "ready\n").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not registered\n")
            .into_response()
    }
}

async fn status(State(shared): State<Arc<ControlShared>>) -> Response {
    Json(shared.snapshot()).into_response()
}

async fn trigger(State(shared): State<Arc<ControlShared>>) -> Response {
    let state = {
        let status = shared.status.lock().expect("status lock poisoned");
        status.state
    };
    if state != DaemonState::Idle {
        return conflict(format!("daemon is {state}, not idle"));
    }
    match shared.trigger_tx.try_send(()) {
        Ok(()) => {
            info!("Accepted sync trigger");
            (
                StatusCode::ACCEPTED,
                Json(serde_json::json!({"status": "accepted"})),
            )
                .into_response()
        }
        // A trigger is already queued.
        Err(_) => conflict("a sync request is already pending".to_owned()),
    }
}

async fn cancel(State(shared): State<Arc<ControlShared>>) -> Response {
    let cancel = {
        let status = shared.status.lock().expect("status lock poisoned");
        if status.state != DaemonState::Syncing {
            return conflict(format!(
                "daemon is {}, nothing to cancel",
                status.state
            ));
        }
        status.current_cancel.clone()
    };
    match cancel {
        Some(cancel) => {
            info!("Cancelling in-flight sync via control API");
            cancel.send();
            (
                StatusCode::OK,
                Json(serde_json::json!({"status": "cancelling"})),
            )
                .into_response()
        }
        None => conflict("no cancellable sync in flight".to_owned()),
    }
}

fn conflict(message: String) -> Response {
    (
        StatusCode::CONFLICT,
        Json(serde_json::json!({"error": message})),
    )
        .into_response()
}
