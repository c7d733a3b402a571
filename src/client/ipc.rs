//! Loopback HTTP surface for out-of-process extensions.
//!
//! Extensions inject and receive signaling here without any crypto or
//! tunnel access of their own. Loopback is the security boundary; there
//! is no authentication. Failures on this surface return 4xx/5xx to the
//! caller and never affect the tunnel.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;

use crate::client::signals::{out_path, SignalEnvelope};
use crate::client::ClientState;
use crate::error::{Error, Result};
use crate::types::Shutdown;

#[derive(Clone)]
pub struct IpcState {
    state: Arc<ClientState>,
}

impl IpcState {
    pub fn new(state: Arc<ClientState>) -> Self {
        Self { state }
    }
}

pub fn router(state: IpcState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/peers", get(peers_handler))
        .route("/signal/send", post(signal_send_handler))
        .route("/signal/poll", get(signal_poll_handler))
        .with_state(state)
}

/// Serve the IPC surface on an already-bound loopback listener.
pub async fn serve(
    listener: tokio::net::TcpListener,
    state: IpcState,
    shutdown: Shutdown,
) -> Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(addr = %addr, "IPC surface listening");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.triggered().await })
        .await
        .map_err(Error::Io)
}

async fn health_handler(State(ipc): State<IpcState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "enabled": ipc.state.enabled(),
    }))
}

async fn peers_handler(State(ipc): State<IpcState>) -> Json<Vec<crate::types::PeerInfo>> {
    Json(ipc.state.peers())
}

#[derive(Debug, Deserialize)]
struct SendSignalRequest {
    peer: String,
    data: String,
}

async fn signal_send_handler(
    State(ipc): State<IpcState>,
    Json(req): Json<SendSignalRequest>,
) -> std::result::Result<Json<serde_json::Value>, (StatusCode, String)> {
    if req.peer.parse::<Ipv4Addr>().is_err() {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("invalid peer address: {}", req.peer),
        ));
    }

    // Same file-drop path the watcher polls; extensions writing files
    // directly and extensions using this route converge here.
    let signal_dir = ipc.state.signal_dir();
    if let Err(e) = std::fs::create_dir_all(signal_dir) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("signal dir unavailable: {e}"),
        ));
    }

    let path = out_path(signal_dir, &req.peer);
    let content = format!("{}:{}", req.peer, req.data);
    if let Err(e) = std::fs::write(&path, content) {
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to write signal: {e}"),
        ));
    }

    tracing::debug!(peer = %req.peer, "signal accepted for sending");
    Ok(Json(serde_json::json!({ "status": "sent" })))
}

async fn signal_poll_handler(
    State(ipc): State<IpcState>,
    Query(params): Query<HashMap<String, String>>,
) -> std::result::Result<Json<Vec<SignalEnvelope>>, (StatusCode, String)> {
    let Some(extension) = params.get("extension").filter(|e| !e.is_empty()) else {
        return Err((
            StatusCode::BAD_REQUEST,
            "extension name required".to_string(),
        ));
    };

    Ok(Json(ipc.state.queues().drain(extension)))
}
