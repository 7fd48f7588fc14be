//! Message definitions for the broker
//!
//! `Message` is what the topic receives at publish time. It is never mutated
//! afterwards; every matching queue stores its own copy wrapped in a
//! `QueuedEntry`, which carries the per-queue delivery state.
//!
//! Notes on fields:
//! - `id`: UUID v4 assigned at publish
//! - `body`: opaque payload text; the broker never inspects it
//! - `attributes`: routing metadata, at minimum `status`
//! - `published_at` / `enqueued_at` / `visible_at`: milliseconds since UNIX epoch

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type Attributes = BTreeMap<String, String>;

/// Storage key of a queued entry, unique within its queue.
pub type EntryId = String;

pub const STATUS_ATTRIBUTE: &str = "status";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub body: String,
    pub attributes: Attributes,
    pub published_at: i64,
}

impl Message {
    pub fn new(body: impl Into<String>, attributes: Attributes) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            body: body.into(),
            attributes,
            published_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// A message classified by a single `status` attribute.
    pub fn with_status(body: impl Into<String>, status: impl Into<String>) -> Self {
        Self::new(
            body,
            Attributes::from([(STATUS_ATTRIBUTE.to_string(), status.into())]),
        )
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedEntry {
    pub id: EntryId,
    pub message: Message,
    pub receive_count: u32,
    pub visible_at: i64,
    pub enqueued_at: i64,
}

impl QueuedEntry {
    pub fn is_visible(&self, now: i64) -> bool {
        self.visible_at <= now
    }
}
