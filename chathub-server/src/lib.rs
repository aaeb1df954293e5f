//! Server backend for the chathub realtime messaging service.
//!
//! A single process owns all conversation state: users, direct chats,
//! groups, messages, reactions, pins, blocks and presence. Clients attach
//! over a WebSocket carrying JSON envelopes and receive state-change events
//! in real time; the whole state is persisted to one JSON document.

#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tower_http::cors::CorsLayer;

mod account;
mod direct;
mod group;
mod hub;
mod protocol;
pub mod store;

use crate::hub::Hub;
use crate::store::Store;

/// The shared state of the server, accessible from within request handlers.
pub struct ServerState {
    hub: Arc<Hub>,
}

impl ServerState {
    /// Load the persisted document from `storage` and build the hub.
    pub async fn new(storage: PathBuf) -> Result<Self> {
        let store = Store::new(storage).await?;
        let doc = store.load().await;
        Ok(Self { hub: Arc::new(Hub::new(store, doc)) })
    }

    /// Construct a server state with temporary storage for testing.
    pub async fn temporary() -> Result<Self> {
        let store = Store::temporary().await?;
        let doc = store.load().await;
        Ok(Self { hub: Arc::new(Hub::new(store, doc)) })
    }

    /// Flush the current document; called once more on graceful shutdown.
    pub async fn persist(&self) {
        self.hub.persist().await;
    }
}

/// Liveness probe payload.
#[derive(Serialize)]
struct Health {
    status: &'static str,
    users: usize,
    online: usize,
}

/// Builds the server router: the WebSocket hub, the health probe, and a
/// permissive CORS layer. Anything else is a 404.
pub fn server(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    let hub = Arc::clone(&state.hub);
    ws.on_upgrade(move |socket| async move { hub.on_connection(socket).await })
}

async fn health_handler(State(state): State<Arc<ServerState>>) -> Json<Health> {
    let (users, online) = state.hub.stats().await;
    Json(Health { status: "ok", users, online })
}
