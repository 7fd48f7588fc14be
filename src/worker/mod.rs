//! Subscriber workers
//!
//! A worker runs the receive → handle → ack loop against one queue source.
//! Only an explicit `Disposition::Ack` deletes an entry. A `Nack` or a
//! panicking handler leaves the entry leased, so it comes back after the
//! visibility timeout and eventually lands in the dead-letter sink.
//!
//! Workers are generic over `QueueSource`, so the same loop drives an
//! in-process `DurableQueue` or a `RemoteQueue` talking to another process.
//! Running several workers against one queue is the normal case.

pub mod handler;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::message::QueuedEntry;
use crate::broker::queue::{AckOutcome, DurableQueue};
use crate::utils::error::Result;

pub use handler::{Disposition, LoggingHandler, MessageHandler, handler_fn};

const ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// The receive/ack half of a durable queue.
#[async_trait]
pub trait QueueSource: Send + Sync {
    fn name(&self) -> &str;

    async fn receive(&self, max_messages: usize, wait_time: Duration)
    -> Result<Vec<QueuedEntry>>;

    async fn acknowledge(&self, entry_id: &str) -> Result<AckOutcome>;
}

#[async_trait]
impl QueueSource for DurableQueue {
    fn name(&self) -> &str {
        DurableQueue::name(self)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<QueuedEntry>> {
        DurableQueue::receive(self, max_messages, wait_time).await
    }

    async fn acknowledge(&self, entry_id: &str) -> Result<AckOutcome> {
        DurableQueue::acknowledge(self, entry_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
    pub received: usize,
    pub acked: usize,
    pub nacked: usize,
}

pub struct Worker {
    id: String,
    source: Arc<dyn QueueSource>,
    handler: Arc<dyn MessageHandler>,
    max_messages: usize,
    wait_time: Duration,
}

impl Worker {
    pub fn new(source: Arc<dyn QueueSource>, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            id: format!("worker-{}", Uuid::new_v4()),
            source,
            handler,
            max_messages: 10,
            wait_time: Duration::from_secs(20),
        }
    }

    pub fn with_batch(mut self, max_messages: usize, wait_time: Duration) -> Self {
        self.max_messages = max_messages;
        self.wait_time = wait_time;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// One receive call and the handling of whatever it returned.
    pub async fn poll_once(&self) -> Result<PollStats> {
        let entries = self
            .source
            .receive(self.max_messages, self.wait_time)
            .await?;
        let mut stats = PollStats {
            received: entries.len(),
            ..PollStats::default()
        };

        for entry in entries {
            match self.dispatch(&entry).await {
                Disposition::Ack => {
                    if self.source.acknowledge(&entry.id).await? == AckOutcome::NotFound {
                        // Lease expired and someone else finished it first.
                        debug!(worker = %self.id, entry_id = %entry.id, "ack for entry already gone");
                    }
                    stats.acked += 1;
                }
                Disposition::Nack => stats.nacked += 1,
            }
        }
        Ok(stats)
    }

    /// Poll until `shutdown` fires. An in-flight long poll is abandoned;
    /// unacknowledged entries simply expire back to visible.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(worker = %self.id, queue = self.source.name(), "worker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                result = self.poll_once() => {
                    if let Err(e) = result {
                        error!(worker = %self.id, queue = self.source.name(), "poll failed: {e}");
                        tokio::select! {
                            _ = shutdown.cancelled() => break,
                            _ = tokio::time::sleep(ERROR_BACKOFF) => {}
                        }
                    }
                }
            }
        }
        info!(worker = %self.id, queue = self.source.name(), "worker stopped");
    }

    /// Run the handler on its own task so a panic is contained and counts
    /// as a nack.
    async fn dispatch(&self, entry: &QueuedEntry) -> Disposition {
        let handler = self.handler.clone();
        let body = entry.message.body.clone();
        let attributes = entry.message.attributes.clone();

        match tokio::spawn(async move { handler.handle(&body, &attributes).await }).await {
            Ok(Disposition::Nack) => {
                warn!(
                    worker = %self.id,
                    entry_id = %entry.id,
                    receive_count = entry.receive_count,
                    "handler rejected entry"
                );
                Disposition::Nack
            }
            Ok(disposition) => disposition,
            Err(e) => {
                warn!(worker = %self.id, entry_id = %entry.id, "handler panicked: {e}");
                Disposition::Nack
            }
        }
    }
}

#[cfg(test)]
mod tests;
