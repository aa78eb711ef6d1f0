#![forbid(unsafe_code)]

// Event-channel client - one WebSocket connection to a named namespace,
// driven as an explicit state machine instead of callback-registered handlers

use crate::protocol::{
    Auth, ClientEvent, Destination, ServerEvent, UnknownDestination, WAITING_ROOM, WS_PATH,
};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Fixed handshake timeout. No retries anywhere; timing out is fatal for the
/// user that owned this connection.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    WaitingForRedirect,
    InChatroom,
    Closed,
}

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("handshake on {namespace} timed out")]
    ConnectTimeout { namespace: String },
    #[error("handshake on {namespace} failed: {reason}")]
    Handshake { namespace: String, reason: String },
    #[error("{op} is invalid in state {state:?}")]
    State {
        op: &'static str,
        state: ChannelState,
    },
    #[error("channel closed before redirect")]
    ClosedBeforeRedirect,
    #[error("server error: {0}")]
    Server(String),
    #[error(transparent)]
    Destination(#[from] UnknownDestination),
    #[error("transport error: {0}")]
    Transport(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("malformed frame: {0}")]
    Frame(#[from] serde_json::Error),
}

/// One event-protocol connection to a single namespace.
pub struct EventChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    state: ChannelState,
    namespace: String,
    sid: String,
}

impl EventChannel {
    /// Opens the WebSocket at `{base}/ws`, sends the `connect` frame for
    /// `namespace` and awaits the `connected` acknowledgement under
    /// [`CONNECT_TIMEOUT`].
    pub async fn connect(
        base_url: &str,
        namespace: &str,
        token: Option<&str>,
    ) -> Result<Self, ChannelError> {
        let url = ws_url(base_url);
        debug!("connecting to {} namespace {}", url, namespace);

        let handshake = async {
            let (mut stream, _) = connect_async(&url).await?;

            let connect = ClientEvent::Connect {
                namespace: namespace.to_string(),
                auth: token.map(|t| Auth {
                    token: t.to_string(),
                }),
            };
            let json = serde_json::to_string(&connect)?;
            stream.send(Message::Text(json.into())).await?;

            loop {
                match stream.next().await {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerEvent>(&text)? {
                            ServerEvent::Connected { sid } => return Ok((stream, sid)),
                            ServerEvent::Error { message } => {
                                return Err(ChannelError::Handshake {
                                    namespace: namespace.to_string(),
                                    reason: message,
                                })
                            }
                            other => {
                                return Err(ChannelError::Handshake {
                                    namespace: namespace.to_string(),
                                    reason: format!("unexpected first frame: {other:?}"),
                                })
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(ChannelError::Handshake {
                            namespace: namespace.to_string(),
                            reason: "closed during handshake".to_string(),
                        })
                    }
                    Some(Ok(_)) => continue, // transport ping/pong
                    Some(Err(e)) => return Err(e.into()),
                }
            }
        };

        let (stream, sid) = tokio::time::timeout(CONNECT_TIMEOUT, handshake)
            .await
            .map_err(|_| ChannelError::ConnectTimeout {
                namespace: namespace.to_string(),
            })??;

        let state = if namespace == WAITING_ROOM {
            ChannelState::WaitingForRedirect
        } else {
            ChannelState::InChatroom
        };
        debug!("connected to {} as sid {}", namespace, sid);

        Ok(Self {
            stream,
            state,
            namespace: namespace.to_string(),
            sid,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn sid(&self) -> &str {
        &self.sid
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Receive loop until the server pushes `redirect`, returning the parsed
    /// destination. Valid only in `WaitingForRedirect`.
    pub async fn await_redirect(&mut self) -> Result<Destination, ChannelError> {
        if self.state != ChannelState::WaitingForRedirect {
            return Err(ChannelError::State {
                op: "await_redirect",
                state: self.state,
            });
        }
        loop {
            match self.next_event().await? {
                Some(ServerEvent::Redirect { to }) => return Ok(Destination::parse(&to)?),
                Some(ServerEvent::Disconnect { .. }) | None => {
                    return Err(ChannelError::ClosedBeforeRedirect)
                }
                Some(ServerEvent::Error { message }) => return Err(ChannelError::Server(message)),
                Some(other) => {
                    debug!("ignoring frame while waiting for redirect: {:?}", other);
                }
            }
        }
    }

    /// Send a client frame. Invalid once the channel is closed.
    pub async fn emit(&mut self, event: &ClientEvent) -> Result<(), ChannelError> {
        if self.state == ChannelState::Closed {
            return Err(ChannelError::State {
                op: "emit",
                state: self.state,
            });
        }
        let json = serde_json::to_string(event)?;
        self.stream.send(Message::Text(json.into())).await?;
        Ok(())
    }

    pub async fn emit_message(&mut self, body: &str) -> Result<(), ChannelError> {
        self.emit(&ClientEvent::Message {
            body: body.to_string(),
        })
        .await
    }

    pub async fn emit_ping(&mut self) -> Result<(), ChannelError> {
        self.emit(&ClientEvent::Ping).await
    }

    /// Receive the next server frame, skipping transport-level ping/pong.
    /// Returns `None` at stream end (the channel is then `Closed`).
    pub async fn next_event(&mut self) -> Result<Option<ServerEvent>, ChannelError> {
        if self.state == ChannelState::Closed {
            return Ok(None);
        }
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(serde_json::from_str(&text)?));
                }
                Some(Ok(Message::Close(_))) | None => {
                    self.state = ChannelState::Closed;
                    return Ok(None);
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    self.state = ChannelState::Closed;
                    return Err(e.into());
                }
            }
        }
    }

    /// Best-effort close; the server may already have gone away.
    pub async fn close(&mut self) {
        if self.state != ChannelState::Closed {
            let _ = self.stream.send(Message::Close(None)).await;
            self.state = ChannelState::Closed;
        }
    }
}

/// Maps a base URL onto the WebSocket mount point, swapping http(s) schemes
/// for ws(s) and defaulting a scheme-less base to ws://.
fn ws_url(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}{WS_PATH}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}{WS_PATH}")
    } else if base.contains("://") {
        format!("{base}{WS_PATH}")
    } else {
        format!("ws://{base}{WS_PATH}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ROOT;
    use crate::server::EchoServer;
    use axum::extract::ws::{Message as AxumMessage, WebSocket, WebSocketUpgrade};
    use axum::response::Response;
    use axum::routing::get;
    use axum::Router;

    async fn spawn_router(router: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    async fn send_frame(socket: &mut WebSocket, frame: &ServerEvent) {
        let json = serde_json::to_string(frame).unwrap();
        let _ = socket.send(AxumMessage::Text(json)).await;
    }

    #[test]
    fn ws_url_swaps_scheme_and_appends_mount() {
        assert_eq!(ws_url("http://localhost:8080"), "ws://localhost:8080/ws");
        assert_eq!(ws_url("https://example.com/"), "wss://example.com/ws");
        assert_eq!(ws_url("ws://example.com"), "ws://example.com/ws");
        // a bare host:port gets a usable scheme instead of passing through
        assert_eq!(ws_url("localhost:8080"), "ws://localhost:8080/ws");
    }

    #[tokio::test]
    async fn handshake_succeeds_and_ping_gets_pong() {
        let server = EchoServer::new();
        let base = spawn_router(server.router()).await;

        let mut chan = EventChannel::connect(&base, ROOT, None).await.unwrap();
        assert_eq!(chan.state(), ChannelState::InChatroom);
        assert!(!chan.sid().is_empty());

        chan.emit_ping().await.unwrap();
        match chan.next_event().await.unwrap() {
            Some(ServerEvent::Pong) => {}
            other => panic!("expected pong, got {other:?}"),
        }
        chan.close().await;
    }

    #[tokio::test]
    async fn await_redirect_in_wrong_state_is_a_state_error() {
        let server = EchoServer::new();
        let base = spawn_router(server.router()).await;

        let mut chan = EventChannel::connect(&base, ROOT, None).await.unwrap();
        match chan.await_redirect().await {
            Err(ChannelError::State { op, state }) => {
                assert_eq!(op, "await_redirect");
                assert_eq!(state, ChannelState::InChatroom);
            }
            other => panic!("expected state error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn error_frame_during_handshake_is_rejection() {
        async fn handler(ws: WebSocketUpgrade) -> Response {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.recv().await;
                send_frame(
                    &mut socket,
                    &ServerEvent::Error {
                        message: "bad token".to_string(),
                    },
                )
                .await;
            })
        }
        let base = spawn_router(Router::new().route("/ws", get(handler))).await;

        match EventChannel::connect(&base, WAITING_ROOM, Some("nope")).await {
            Err(ChannelError::Handshake { namespace, reason }) => {
                assert_eq!(namespace, WAITING_ROOM);
                assert_eq!(reason, "bad token");
            }
            other => panic!("expected handshake rejection, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn close_before_redirect_is_an_error() {
        async fn handler(ws: WebSocketUpgrade) -> Response {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.recv().await;
                send_frame(
                    &mut socket,
                    &ServerEvent::Connected {
                        sid: "s1".to_string(),
                    },
                )
                .await;
                // drop the socket without ever pushing a redirect
            })
        }
        let base = spawn_router(Router::new().route("/ws", get(handler))).await;

        let mut chan = EventChannel::connect(&base, WAITING_ROOM, Some("tok"))
            .await
            .unwrap();
        match chan.await_redirect().await {
            Err(ChannelError::ClosedBeforeRedirect) => {}
            other => panic!("expected closed-before-redirect, got {other:?}"),
        }
        assert_eq!(chan.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn unknown_destination_is_an_explicit_error() {
        async fn handler(ws: WebSocketUpgrade) -> Response {
            ws.on_upgrade(|mut socket| async move {
                let _ = socket.recv().await;
                send_frame(
                    &mut socket,
                    &ServerEvent::Connected {
                        sid: "s1".to_string(),
                    },
                )
                .await;
                send_frame(
                    &mut socket,
                    &ServerEvent::Redirect {
                        to: "lobby".to_string(),
                    },
                )
                .await;
            })
        }
        let base = spawn_router(Router::new().route("/ws", get(handler))).await;

        let mut chan = EventChannel::connect(&base, WAITING_ROOM, Some("tok"))
            .await
            .unwrap();
        match chan.await_redirect().await {
            Err(ChannelError::Destination(UnknownDestination(name))) => {
                assert_eq!(name, "lobby");
            }
            other => panic!("expected unknown destination, got {other:?}"),
        }
    }
}
