//! Dead-letter sink
//!
//! Terminal store for entries that exhausted their receive budget. Dead
//! letters are append-only and never reprocessed automatically; the only
//! way out is an operator `replay` or the retention purge.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use sled::Transactional;
use sled::Tree;
use sled::transaction::ConflictableTransactionResult;
use tracing::info;

use crate::broker::clock::{SharedClock, duration_millis};
use crate::broker::message::{EntryId, Message};
use crate::broker::queue::DurableQueue;
use crate::persistence::Store;
use crate::persistence::sled_store::{decode, encode, key_floor, timestamped_key};
use crate::utils::error::{BrokerError, Result};

/// The original message plus where it came from and how often it was tried.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub id: String,
    pub message: Message,
    pub original_queue: String,
    pub final_receive_count: u32,
    pub moved_at: i64,
}

#[derive(Clone)]
pub struct DeadLetterSink {
    tree: Tree,
    retention: Duration,
    clock: SharedClock,
}

impl DeadLetterSink {
    pub fn open(store: &Store, retention: Duration, clock: SharedClock) -> Result<Self> {
        Ok(Self {
            tree: store.dead_letter_tree()?,
            retention,
            clock,
        })
    }

    pub fn enqueue(
        &self,
        message: Message,
        original_queue: &str,
        final_receive_count: u32,
    ) -> Result<DeadLetter> {
        let letter = self.record(message, original_queue, final_receive_count);
        self.tree.insert(letter.id.as_bytes(), encode(&letter)?)?;
        Ok(letter)
    }

    /// Build a dead letter stamped with the current time without storing it.
    pub(crate) fn record(
        &self,
        message: Message,
        original_queue: &str,
        final_receive_count: u32,
    ) -> DeadLetter {
        let now = self.clock.now_millis();
        DeadLetter {
            id: timestamped_key(now),
            message,
            original_queue: original_queue.to_string(),
            final_receive_count,
            moved_at: now,
        }
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    /// Every dead letter, oldest first.
    pub fn list(&self) -> Result<Vec<DeadLetter>> {
        self.tree
            .iter()
            .values()
            .map(|raw| decode(&raw?))
            .collect()
    }

    pub fn get(&self, id: &str) -> Result<Option<DeadLetter>> {
        match self.tree.get(id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub fn retention(&self) -> Duration {
        self.retention
    }

    /// Drop dead letters older than the retention period.
    pub fn purge_expired(&self) -> Result<usize> {
        let cutoff = self
            .clock
            .now_millis()
            .saturating_sub(duration_millis(self.retention));
        let old_keys: Vec<_> = self
            .tree
            .range(..key_floor(cutoff).into_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;

        for key in &old_keys {
            self.tree.remove(key)?;
        }
        if !old_keys.is_empty() {
            info!(purged = old_keys.len(), "purged expired dead letters");
        }
        Ok(old_keys.len())
    }

    /// Put a dead letter's message back onto `queue` with a fresh receive
    /// count. The dead letter is removed in the same transaction.
    pub fn replay(&self, id: &str, queue: &DurableQueue) -> Result<EntryId> {
        let letter = self
            .get(id)?
            .ok_or_else(|| BrokerError::NotFound(format!("dead letter {id}")))?;
        let entry = queue.new_entry(letter.message);
        let entry_bytes = encode(&entry)?;

        let replayed = (queue.tree(), &self.tree).transaction(
            |(q, dlq)| -> ConflictableTransactionResult<bool, BrokerError> {
                if dlq.remove(id.as_bytes())?.is_none() {
                    return Ok(false);
                }
                q.insert(entry.id.as_bytes(), entry_bytes.clone())?;
                Ok(true)
            },
        )?;

        if !replayed {
            return Err(BrokerError::NotFound(format!("dead letter {id}")));
        }
        queue.wake_receivers();
        info!(
            dead_letter = id,
            queue = queue.name(),
            entry_id = %entry.id,
            "dead letter replayed"
        );
        Ok(entry.id)
    }
}

impl std::fmt::Debug for DeadLetterSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeadLetterSink")
            .field("retention", &self.retention)
            .finish()
    }
}
