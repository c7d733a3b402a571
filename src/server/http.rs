//! Admin HTTP surface for deploy tooling.
//!
//! `POST /update/init?component=<name>` broadcasts `CTRL:UPDATE_<NAME>` to
//! every connected client; `GET /status` reports uptime and the current
//! peer directory. The registry handle is passed in at construction —
//! handlers hold no ambient global state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::error::{Error, Result};
use crate::protocol::control::ControlMessage;
use crate::server::registry::PeerRegistry;
use crate::types::Shutdown;

#[derive(Clone)]
pub struct AdminState {
    registry: Arc<PeerRegistry>,
    started_at: Instant,
}

impl AdminState {
    pub fn new(registry: Arc<PeerRegistry>) -> Self {
        Self {
            registry,
            started_at: Instant::now(),
        }
    }
}

pub fn router(state: AdminState) -> Router {
    Router::new()
        .route("/status", get(status_handler))
        .route("/update/init", post(update_init_handler))
        .with_state(state)
}

/// Serve the admin surface until shutdown.
pub async fn serve(addr: SocketAddr, state: AdminState, shutdown: Shutdown) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Config(format!("bind admin surface on {addr}: {e}")))?;

    tracing::info!(addr = %addr, "admin surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
        .map_err(Error::Io)
}

async fn status_handler(State(state): State<AdminState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "version": crate::VERSION,
        "uptime_seconds": state.started_at.elapsed().as_secs(),
        "peers": state.registry.snapshot(),
    }))
}

async fn update_init_handler(
    State(state): State<AdminState>,
    Query(params): Query<HashMap<String, String>>,
) -> String {
    let component = params
        .get("component")
        .map_or("all", String::as_str)
        .to_string();

    let token = component.to_uppercase();
    tracing::info!(component = %component, "broadcasting update notification");
    state.registry.broadcast(&ControlMessage::Update(token));

    format!("Update initiated for component: {component}\n")
}
