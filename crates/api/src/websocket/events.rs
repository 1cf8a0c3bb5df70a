//! WebSocket frame types
//!
//! All frames are JSON objects tagged by `type` in snake_case. Client frame
//! parsing failures produce an `error` frame, never a disconnect.

use chatwire_shared::{EffectiveStatus, LifecycleEvent, Message, MessageKind, ReadCursor};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frames sent from client to server
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// First frame on connections that did not pass a query token
    Auth { token: String },

    /// Subscribe to a conversation's traffic
    Sub { conversation_id: Uuid },

    Unsub { conversation_id: Uuid },

    /// Submit a message; `client_msg_id` keys the delivery acknowledgement
    MsgSend {
        conversation_id: Uuid,
        client_msg_id: String,
        #[serde(default)]
        kind: Option<MessageKind>,
        body: String,
        #[serde(default)]
        attachment_id: Option<Uuid>,
    },

    /// Advance the caller's read cursor
    MsgRead {
        conversation_id: Uuid,
        message_id: Uuid,
    },

    /// Ephemeral typing signal; never persisted
    Typing { conversation_id: Uuid, on: bool },

    /// Replay history and lifecycle events after a reconnect
    Sync {
        conversation_id: Uuid,
        #[serde(default)]
        after_msg_id: Option<Uuid>,
        #[serde(default)]
        limit: Option<i64>,
    },

    /// Keepalive; doubles as the presence heartbeat
    Ping,
}

/// Frames sent from server to client
#[derive(Debug, Serialize, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    AuthOk {
        session_id: Uuid,
        user_id: Uuid,
    },

    SubOk {
        conversation_id: Uuid,
    },

    UnsubOk {
        conversation_id: Uuid,
    },

    /// Acknowledgement to the sender; `duplicate` marks a resend
    MsgAck {
        client_msg_id: String,
        message: Message,
        duplicate: bool,
    },

    /// A message from someone else in a subscribed conversation
    Msg {
        message: Message,
    },

    MsgReadOk {
        cursor: ReadCursor,
    },

    /// Another participant's read cursor moved
    Read {
        conversation_id: Uuid,
        user_id: Uuid,
        message_id: Uuid,
    },

    Typing {
        conversation_id: Uuid,
        user_id: Uuid,
        on: bool,
    },

    SyncRes {
        conversation_id: Uuid,
        messages: Vec<Message>,
        events: Vec<LifecycleEvent>,
        /// True when the sync cursor was dangling and replay restarted
        reset: bool,
    },

    Pong,

    /// A persisted lifecycle event relevant to this connection
    Event {
        event: LifecycleEvent,
    },

    /// A staff member's effective availability changed
    PresenceUpdate {
        user_id: Uuid,
        status: EffectiveStatus,
    },

    Error {
        code: String,
        message: String,
    },
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frames_parse() {
        let id = Uuid::new_v4();
        let frame: ClientEvent = serde_json::from_str(&format!(
            r#"{{"type":"msg_send","conversation_id":"{id}","client_msg_id":"c-1","body":"hi"}}"#
        ))
        .unwrap();
        match frame {
            ClientEvent::MsgSend {
                conversation_id,
                client_msg_id,
                kind,
                body,
                attachment_id,
            } => {
                assert_eq!(conversation_id, id);
                assert_eq!(client_msg_id, "c-1");
                assert!(kind.is_none());
                assert_eq!(body, "hi");
                assert!(attachment_id.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(matches!(
            serde_json::from_str::<ClientEvent>(r#"{"type":"ping"}"#).unwrap(),
            ClientEvent::Ping
        ));
        assert!(serde_json::from_str::<ClientEvent>(r#"{"type":"bogus"}"#).is_err());
    }

    #[test]
    fn test_server_frames_tag_snake_case() {
        let json = serde_json::to_value(ServerEvent::Pong).unwrap();
        assert_eq!(json["type"], "pong");

        let json = serde_json::to_value(ServerEvent::AuthOk {
            session_id: Uuid::nil(),
            user_id: Uuid::nil(),
        })
        .unwrap();
        assert_eq!(json["type"], "auth_ok");

        let json = serde_json::to_value(ServerEvent::Error {
            code: "forbidden".into(),
            message: "nope".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "forbidden");
    }
}
