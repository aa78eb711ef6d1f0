#![forbid(unsafe_code)]

// Event protocol - JSON frames exchanged over the WebSocket transport

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Base path the event transport is mounted at, on both the platform and the
/// reference echo servers.
pub const WS_PATH: &str = "/ws";

/// Namespace for users queued for pairing.
pub const WAITING_ROOM: &str = "/waiting-room";
/// Namespace for paired users exchanging messages.
pub const CHATROOM: &str = "/chatroom";
/// Root namespace, served by the echo servers.
pub const ROOT: &str = "/";

/// Auth payload carried on the connect handshake.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auth {
    pub token: String,
}

/// Client-to-server frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Open a namespace. Must be the first frame on every connection.
    Connect {
        namespace: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<Auth>,
    },
    /// Free-text chat message (chatroom namespace)
    Message { body: String },
    /// Echo-protocol request
    Ping,
}

/// Server-to-client frames
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    /// Handshake acknowledgement; `sid` is the session id assigned by the server
    Connected { sid: String },
    /// Waiting-room push naming the next stage for this user
    Redirect { to: String },
    /// Batch/history push
    Messages { messages: Vec<ChatMessage> },
    /// Single message with sender id
    NewMessage { message: ChatMessage },
    /// Echo-protocol response
    Pong,
    /// Lifecycle notification before a server-side close
    Disconnect { reason: String },
    /// Protocol-level error push
    Error { message: String },
}

/// Chat message payload shape, shared by batch and single pushes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender_id: i64,
    pub body: String,
}

/// Redirect targets the platform is known to push. Closed-world: anything
/// else is an explicit unknown-destination error, never a silent fallthrough.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Destination {
    Chatroom,
    View,
}

#[derive(Debug, Error)]
#[error("unknown redirect destination: {0:?}")]
pub struct UnknownDestination(pub String);

impl Destination {
    pub fn parse(name: &str) -> Result<Self, UnknownDestination> {
        match name {
            "chatroom" => Ok(Self::Chatroom),
            "view" => Ok(Self::View),
            other => Err(UnknownDestination(other.to_string())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chatroom => "chatroom",
            Self::View => "view",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn redirect_frame_wire_format() {
        let frame = ServerEvent::Redirect {
            to: "chatroom".to_string(),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "redirect");
        assert_eq!(json["to"], "chatroom");
    }

    #[test]
    fn connect_frame_carries_namespace_and_auth() {
        let frame = ClientEvent::Connect {
            namespace: WAITING_ROOM.to_string(),
            auth: Some(Auth {
                token: "abc123".to_string(),
            }),
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["event"], "connect");
        assert_eq!(json["namespace"], "/waiting-room");
        assert_eq!(json["auth"]["token"], "abc123");
    }

    #[test]
    fn connect_frame_omits_absent_auth() {
        let frame = ClientEvent::Connect {
            namespace: ROOT.to_string(),
            auth: None,
        };
        let json = serde_json::to_value(&frame).unwrap();
        assert!(json.get("auth").is_none());
    }

    #[test]
    fn event_tags_are_snake_case() {
        let json = serde_json::to_value(ServerEvent::NewMessage {
            message: ChatMessage {
                sender_id: 7,
                body: "hi".to_string(),
            },
        })
        .unwrap();
        assert_eq!(json["event"], "new_message");
        assert_eq!(json["message"]["sender_id"], 7);
        assert_eq!(json["message"]["body"], "hi");

        let json = serde_json::to_value(ClientEvent::Ping).unwrap();
        assert_eq!(json["event"], "ping");
        let json = serde_json::to_value(ServerEvent::Pong).unwrap();
        assert_eq!(json["event"], "pong");
    }

    #[test]
    fn messages_batch_round_trips() {
        let text = r#"{"event":"messages","messages":[{"sender_id":1,"body":"a"},{"sender_id":2,"body":"b"}]}"#;
        match serde_json::from_str::<ServerEvent>(text).unwrap() {
            ServerEvent::Messages { messages } => {
                assert_eq!(messages.len(), 2);
                assert_eq!(messages[0].sender_id, 1);
                assert_eq!(messages[1].body, "b");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn destination_parse_is_closed_world() {
        assert_eq!(Destination::parse("chatroom").unwrap(), Destination::Chatroom);
        assert_eq!(Destination::parse("view").unwrap(), Destination::View);
        let err = Destination::parse("lobby").unwrap_err();
        assert_eq!(err.0, "lobby");
        assert!(err.to_string().contains("lobby"));
    }
}
