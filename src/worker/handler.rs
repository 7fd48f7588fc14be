//! Message handlers run by subscriber workers.

use async_trait::async_trait;
use tracing::info;

use crate::broker::message::Attributes;

/// What a handler wants done with the entry it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processed; delete the entry.
    Ack,
    /// Not processed; let the lease run out so it is redelivered.
    Nack,
}

/// Handlers may see the same message more than once and must be idempotent.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, body: &str, attributes: &Attributes) -> Disposition;
}

/// Logs every message it sees and acknowledges it.
#[derive(Debug, Clone)]
pub struct LoggingHandler {
    label: String,
}

impl LoggingHandler {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

#[async_trait]
impl MessageHandler for LoggingHandler {
    async fn handle(&self, body: &str, attributes: &Attributes) -> Disposition {
        info!(
            handler = %self.label,
            status = attributes.get("status").map(String::as_str).unwrap_or(""),
            "received event: {body}"
        );
        Disposition::Ack
    }
}

/// Adapts a plain closure into a handler.
pub struct FnHandler<F>(F);

pub fn handler_fn<F>(f: F) -> FnHandler<F>
where
    F: Fn(&str, &Attributes) -> Disposition + Send + Sync,
{
    FnHandler(f)
}

#[async_trait]
impl<F> MessageHandler for FnHandler<F>
where
    F: Fn(&str, &Attributes) -> Disposition + Send + Sync,
{
    async fn handle(&self, body: &str, attributes: &Attributes) -> Disposition {
        (self.0)(body, attributes)
    }
}
