#![forbid(unsafe_code)]

// Reference echo servers - protocol targets for manual testing, not under
// test themselves. Variant (a) answers ping with pong; variant (b) also
// counts connections/messages and delays its answers to model blocking work.

use crate::protocol::{ClientEvent, ServerEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

async fn send_frame(socket: &mut WebSocket, frame: &ServerEvent) -> bool {
    match serde_json::to_string(frame) {
        Ok(json) => socket.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!("failed to serialize frame: {}", e);
            false
        }
    }
}

/// Completes the namespace handshake: the first frame must be `connect`,
/// acknowledged with `connected {sid}`.
async fn handshake(socket: &mut WebSocket, sid: &str) -> bool {
    let text = match socket.recv().await {
        Some(Ok(Message::Text(text))) => text,
        _ => return false,
    };
    match serde_json::from_str::<ClientEvent>(&text) {
        Ok(ClientEvent::Connect { namespace, .. }) => {
            debug!("connection {} opened namespace {}", sid, namespace);
        }
        _ => {
            send_frame(
                socket,
                &ServerEvent::Error {
                    message: "expected connect frame".to_string(),
                },
            )
            .await;
            return false;
        }
    }
    send_frame(
        socket,
        &ServerEvent::Connected {
            sid: sid.to_string(),
        },
    )
    .await
}

async fn bind_and_serve(router: Router, port: u16) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{port}");
    info!("listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

// --- Variant (a): plain ping/pong echo ---

#[derive(Clone, Default)]
pub struct EchoServer {
    connections: Arc<AtomicU64>,
}

impl EchoServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_count(&self) -> u64 {
        self.connections.load(Relaxed)
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(echo_ws_handler))
            .route("/health", get(echo_health_handler))
            .with_state(self.clone())
    }

    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let router = self.router();
        bind_and_serve(router, port).await
    }
}

async fn echo_health_handler(State(server): State<EchoServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": server.connection_count(),
    }))
}

async fn echo_ws_handler(ws: WebSocketUpgrade, State(server): State<EchoServer>) -> Response {
    ws.on_upgrade(move |socket| echo_connection(socket, server))
}

async fn echo_connection(mut socket: WebSocket, server: EchoServer) {
    let sid = Uuid::new_v4().simple().to_string();
    if !handshake(&mut socket, &sid).await {
        return;
    }
    server.connections.fetch_add(1, Relaxed);

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::Ping) => {
                    // pong goes back on the same connection only
                    if !send_frame(&mut socket, &ServerEvent::Pong).await {
                        break;
                    }
                }
                Ok(other) => debug!("connection {}: ignoring {:?}", sid, other),
                Err(e) => warn!("connection {}: bad frame: {}", sid, e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    server.connections.fetch_sub(1, Relaxed);
    debug!("connection {} closed", sid);
}

// --- Variant (b): connection counting, first-ping reset, artificial delay ---

pub const DEFAULT_PONG_DELAY: Duration = Duration::from_millis(100);

struct StatsState {
    /// Per-connection message counts, keyed by sid
    counts: Mutex<HashMap<String, u64>>,
    /// The designated "first" connection, whose ping resets the counts.
    /// Re-assigned to the next handshake once the holder disconnects.
    first_sid: Mutex<Option<String>>,
    messages_total: AtomicU64,
}

#[derive(Clone)]
pub struct EchoStatsServer {
    state: Arc<StatsState>,
    delay: Duration,
}

impl EchoStatsServer {
    pub fn new(delay: Duration) -> Self {
        Self {
            state: Arc::new(StatsState {
                counts: Mutex::new(HashMap::new()),
                first_sid: Mutex::new(None),
                messages_total: AtomicU64::new(0),
            }),
            delay,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.lock_counts().len()
    }

    pub fn message_total(&self) -> u64 {
        self.state.messages_total.load(Relaxed)
    }

    fn lock_counts(&self) -> std::sync::MutexGuard<'_, HashMap<String, u64>> {
        self.state.counts.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_first(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.state
            .first_sid
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(stats_ws_handler))
            .route("/health", get(stats_health_handler))
            .with_state(self.clone())
    }

    pub async fn serve(self, port: u16) -> anyhow::Result<()> {
        let router = self.router();
        bind_and_serve(router, port).await
    }
}

async fn stats_health_handler(State(server): State<EchoStatsServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "connections": server.connection_count(),
        "messages": server.message_total(),
    }))
}

async fn stats_ws_handler(ws: WebSocketUpgrade, State(server): State<EchoStatsServer>) -> Response {
    ws.on_upgrade(move |socket| stats_connection(socket, server))
}

async fn stats_connection(mut socket: WebSocket, server: EchoStatsServer) {
    let sid = Uuid::new_v4().simple().to_string();
    if !handshake(&mut socket, &sid).await {
        return;
    }

    server.lock_counts().insert(sid.clone(), 0);
    {
        let mut first = server.lock_first();
        if first.is_none() {
            debug!("connection {} designated first", sid);
            *first = Some(sid.clone());
        }
    }

    while let Some(Ok(message)) = socket.recv().await {
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                Ok(ClientEvent::Ping) => {
                    let is_first = server.lock_first().as_deref() == Some(sid.as_str());
                    if is_first {
                        // the first connection's ping resets the statistics,
                        // with its own ping counted
                        let mut counts = server.lock_counts();
                        for count in counts.values_mut() {
                            *count = 0;
                        }
                        counts.insert(sid.clone(), 1);
                        server.state.messages_total.store(1, Relaxed);
                    } else {
                        *server.lock_counts().entry(sid.clone()).or_insert(0) += 1;
                        server.state.messages_total.fetch_add(1, Relaxed);
                    }

                    // artificial blocking-work stand-in before answering
                    tokio::time::sleep(server.delay).await;
                    if !send_frame(&mut socket, &ServerEvent::Pong).await {
                        break;
                    }
                }
                Ok(other) => debug!("connection {}: ignoring {:?}", sid, other),
                Err(e) => warn!("connection {}: bad frame: {}", sid, e),
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    server.lock_counts().remove(&sid);
    let mut first = server.lock_first();
    if first.as_deref() == Some(sid.as_str()) {
        *first = None;
    }
    debug!("connection {} closed", sid);
}
