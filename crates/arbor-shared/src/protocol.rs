//! Realtime wire protocol.
//!
//! JSON-tagged events exchanged over a live connection. Clients must
//! de-duplicate by message id: a message can legitimately appear both in a
//! `subscribed` history and as a later `message` event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{MessageId, ThreadId, UserId};

/// Body shown in place of a message the holder cannot decrypt.
pub const DECRYPT_FAILED_PLACEHOLDER: &str = "[unable to decrypt message]";

/// Body shown while the session holds no private key.
pub const LOCKED_PLACEHOLDER: &str = "Unlock to reveal this message.";

/// Requests a client may send over the socket.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientRequest {
    Subscribe { thread_id: ThreadId },
    Unsubscribe { thread_id: ThreadId },
    /// Re-read the session's cached private key (after unlock/lock).
    Refresh,
    Ping,
}

/// A message rendered for one specific connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MessagePayload {
    pub id: MessageId,
    pub body: String,
    pub created_at: DateTime<Utc>,
    pub created_label: String,
    pub sender_id: UserId,
    pub is_self: bool,
    pub locked: bool,
    pub can_delete: bool,
}

/// Events pushed from the server to a connection.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Welcome {
        locked: bool,
    },
    Subscribed {
        thread_id: ThreadId,
        messages: Vec<MessagePayload>,
        locked: bool,
        display_name: String,
        is_group: bool,
        owner_id: UserId,
    },
    Unsubscribed {
        thread_id: ThreadId,
    },
    Message {
        thread_id: ThreadId,
        message: MessagePayload,
    },
    MessageDeleted {
        thread_id: ThreadId,
        message_id: MessageId,
    },
    Refreshed {
        locked: bool,
    },
    Error {
        message: String,
    },
    Pong,
}

impl ServerEvent {
    /// Serialize for the socket.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

impl ClientRequest {
    /// Parse an inbound socket frame.
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_request_roundtrip() {
        let parsed =
            ClientRequest::from_json(r#"{"action":"subscribe","thread_id":42}"#).unwrap();
        assert_eq!(
            parsed,
            ClientRequest::Subscribe {
                thread_id: ThreadId(42)
            }
        );

        assert_eq!(
            ClientRequest::from_json(r#"{"action":"ping"}"#).unwrap(),
            ClientRequest::Ping
        );
    }

    #[test]
    fn test_unknown_action_rejected() {
        assert!(ClientRequest::from_json(r#"{"action":"shout"}"#).is_err());
    }

    #[test]
    fn test_server_event_tagging() {
        let event = ServerEvent::MessageDeleted {
            thread_id: ThreadId(7),
            message_id: MessageId(99),
        };
        let json = event.to_json().unwrap();
        assert!(json.contains(r#""type":"message_deleted""#));

        let back: ServerEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
