use std::net::SocketAddr;

use anyhow::{Result, anyhow, ensure};
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// A test WebSocket client that sends and receives JSON envelopes.
pub struct JsonSocket(WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>);

impl JsonSocket {
    pub async fn send(&mut self, msg: &Value) {
        self.0.send(msg.to_string().into()).await.unwrap();
    }

    /// Send one `{ type, data }` command frame.
    pub async fn command(&mut self, kind: &str, data: Value) {
        self.send(&json!({ "type": kind, "data": data })).await;
    }

    pub async fn recv(&mut self) -> Result<Value> {
        let msg = self
            .0
            .next()
            .await
            .ok_or_else(|| anyhow!("WebSocket closed"))??;
        let msg = msg.to_text().map_err(|_| anyhow!("non-string message"))?;
        Ok(serde_json::from_str(msg)?)
    }

    /// Receive the next event, assert its envelope type, and return `data`.
    pub async fn expect(&mut self, kind: &str) -> Result<Value> {
        let msg = self.recv().await?;
        let got = msg["type"].as_str().unwrap_or_default();
        ensure!(got == kind, "expected {kind}, got {got}: {msg}");
        Ok(msg.get("data").cloned().unwrap_or(Value::Null))
    }

    /// Prove the inbound queue is empty: a heartbeat must be answered with
    /// nothing queued ahead of it.
    pub async fn expect_idle(&mut self) -> Result<()> {
        self.send(&json!({ "type": "heartbeat" })).await;
        self.expect("heartbeat_ack").await?;
        Ok(())
    }
}

pub struct TestClient {
    client: reqwest::Client,
    addr: SocketAddr,
}

impl TestClient {
    pub async fn start(router: axum::Router) -> Result<Self> {
        let listener = tokio::net::TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], 0)))
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(axum::serve(listener, router.layer(TraceLayer::new_for_http())).into_future());
        let client = reqwest::Client::new();
        Ok(Self { client, addr })
    }

    pub async fn health(&self) -> Result<Value> {
        let url = format!("http://{}/health", self.addr);
        info!("GET {}", url);
        let resp = self.client.get(&url).send().await?;
        ensure!(resp.status().is_success(), "health returned {}", resp.status());
        Ok(resp.json().await?)
    }

    /// Open a socket and consume the `connected` greeting.
    pub async fn connect(&self) -> Result<JsonSocket> {
        let (socket, _response) =
            tokio_tungstenite::connect_async(format!("ws://{}/ws", self.addr))
                .await
                .unwrap();
        let mut socket = JsonSocket(socket);
        socket.expect("connected").await?;
        Ok(socket)
    }

    /// Register a user (username = id) and return the bound socket with the
    /// `register_success` payload.
    pub async fn register(&self, id: &str) -> Result<(JsonSocket, Value)> {
        let mut socket = self.connect().await?;
        socket
            .command(
                "register",
                json!({ "id": id, "username": id, "displayName": format!("{id} Display") }),
            )
            .await;
        let data = socket.expect("register_success").await?;
        Ok((socket, data))
    }

    /// Log an existing user in and return the bound socket with the
    /// `login_success` payload.
    pub async fn login(&self, id: &str) -> Result<(JsonSocket, Value)> {
        let mut socket = self.connect().await?;
        socket.command("login", json!({ "userId": id })).await;
        let data = socket.expect("login_success").await?;
        Ok((socket, data))
    }

    /// Register several users in order, draining the presence events each
    /// earlier socket receives for the later arrivals.
    pub async fn register_all(&self, ids: &[&str]) -> Result<Vec<JsonSocket>> {
        let mut sockets: Vec<JsonSocket> = Vec::new();
        for id in ids {
            let (socket, _) = self.register(id).await?;
            for earlier in sockets.iter_mut() {
                earlier.expect("user_joined").await?;
                earlier.expect("user_online").await?;
            }
            sockets.push(socket);
        }
        Ok(sockets)
    }
}

pub fn logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!("{}=debug,tower_http=debug", env!("CARGO_CRATE_NAME")).into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().without_time())
        .try_init()
        .ok();
}
