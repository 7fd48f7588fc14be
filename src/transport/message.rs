//! Wire types for the gateway and the consumer protocol.

use serde::{Deserialize, Serialize};

use crate::broker::message::QueuedEntry;

pub const ADDED_TO_TOPIC: &str = "message added to topic";

fn default_max_messages() -> usize {
    1
}

/// Requests sent by a remote worker over the consumer WebSocket.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "receive")]
    Receive {
        queue: String,
        #[serde(default = "default_max_messages")]
        max_messages: usize,
        #[serde(default)]
        wait_time_ms: u64,
    },
    #[serde(rename = "ack")]
    Ack { queue: String, entry_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "messages")]
    Messages {
        queue: String,
        entries: Vec<QueuedEntry>,
    },
    #[serde(rename = "ack_result")]
    AckResult { entry_id: String, found: bool },
    #[serde(rename = "error")]
    Error { message: String },
}

/// `200` body of `POST /SendEvent`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AcceptedResponse {
    pub message: String,
}

impl Default for AcceptedResponse {
    fn default() -> Self {
        Self {
            message: ADDED_TO_TOPIC.to_string(),
        }
    }
}

/// Error body shared by every non-2xx gateway response.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ErrorResponse {
    pub state: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            state: "error".to_string(),
            message: message.into(),
        }
    }
}
