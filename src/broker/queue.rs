//! Durable queue
//!
//! A lease-based message store on top of one sled tree. Entries are keyed by
//! `{enqueued_at:020}_{uuid}` so a tree scan is oldest-first.
//!
//! Concurrency notes:
//! - There is no queue-wide lock. `receive` claims each entry with a sled
//!   compare-and-swap on the exact bytes it read; a worker that loses the
//!   race simply skips the entry. Many workers may poll one queue at once.
//! - A claim is a soft lease: once `visible_at` passes, the entry can be
//!   claimed again, so consumers must tolerate duplicates.
//! - Long polls park on a `Notify` that `enqueue` signals, and otherwise
//!   sleep until the nearest lease expires or the wait time runs out.
//!   Neither blocks enqueuers or other receivers.

use std::time::Duration;

use sled::Transactional;
use sled::transaction::ConflictableTransactionResult;
use sled::{IVec, Tree};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::broker::clock::{SharedClock, duration_millis};
use crate::broker::dead_letter::DeadLetterSink;
use crate::broker::message::{EntryId, Message, QueuedEntry};
use crate::config::QueueSettings;
use crate::persistence::Store;
use crate::persistence::sled_store::{decode, encode, timestamped_key};
use crate::utils::error::{BrokerError, Result};

/// Fallback for wait times too large to add to an `Instant`.
const MAX_DEADLINE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub max_receive_count: u32,
}

impl From<&QueueSettings> for QueueConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            visibility_timeout: Duration::from_secs(settings.visibility_timeout_secs),
            max_receive_count: settings.max_receive_count,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            max_receive_count: 5,
        }
    }
}

pub struct DurableQueue {
    name: String,
    tree: Tree,
    config: QueueConfig,
    quarantine: Tree,
    dead_letters: DeadLetterSink,
    clock: SharedClock,
    notify: Notify,
}

impl DurableQueue {
    pub fn open(
        store: &Store,
        name: &str,
        config: QueueConfig,
        dead_letters: DeadLetterSink,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(Self {
            name: name.to_string(),
            tree: store.queue_tree(name)?,
            quarantine: store.quarantine_tree()?,
            config,
            dead_letters,
            clock,
            notify: Notify::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }

    /// Append a copy of `message`, visible immediately.
    pub fn enqueue(&self, message: Message) -> Result<EntryId> {
        let entry = self.new_entry(message);
        self.tree.insert(entry.id.as_bytes(), encode(&entry)?)?;
        self.wake_receivers();
        debug!(queue = %self.name, entry_id = %entry.id, "entry enqueued");
        Ok(entry.id)
    }

    /// Claim up to `max_messages` visible entries, waiting up to `wait_time`
    /// for one to appear when none is visible right now.
    pub async fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> Result<Vec<QueuedEntry>> {
        if max_messages == 0 {
            return Ok(Vec::new());
        }
        let start = Instant::now();
        let deadline = start
            .checked_add(wait_time)
            .unwrap_or_else(|| start + MAX_DEADLINE);

        loop {
            // Register interest before scanning so an enqueue that lands
            // between the scan and the wait is not missed.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let claimed = self.try_receive(max_messages)?;
            let now = Instant::now();
            if !claimed.is_empty() || now >= deadline {
                return Ok(claimed);
            }

            let mut wait = deadline - now;
            if let Some(next) = self.next_visible_in()? {
                wait = wait.min(next);
            }

            tokio::select! {
                _ = &mut notified => {}
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    /// One non-blocking pass over the queue.
    ///
    /// Entries claimed before a storage error are still returned: their
    /// leases are already taken, so dropping them would only delay them.
    pub fn try_receive(&self, max_messages: usize) -> Result<Vec<QueuedEntry>> {
        let mut claimed = Vec::new();
        let mut exhausted = false;
        let scan = self.claim_visible(max_messages, &mut claimed, &mut exhausted);

        if exhausted {
            if let Err(e) = self.migrate_expired() {
                // The sweep loop picks these up again.
                warn!(queue = %self.name, "dead-letter migration failed: {e}");
            }
        }

        match scan {
            Ok(()) => Ok(claimed),
            Err(e) if !claimed.is_empty() => {
                warn!(
                    queue = %self.name,
                    claimed = claimed.len(),
                    "receive scan stopped early: {e}"
                );
                Ok(claimed)
            }
            Err(e) => Err(e),
        }
    }

    fn claim_visible(
        &self,
        max_messages: usize,
        claimed: &mut Vec<QueuedEntry>,
        exhausted: &mut bool,
    ) -> Result<()> {
        let now = self.clock.now_millis();
        let lease = duration_millis(self.config.visibility_timeout);

        for item in self.tree.iter() {
            if claimed.len() >= max_messages {
                break;
            }
            let (key, raw) = item?;
            let Some(entry) = self.decode_entry(&key, &raw)? else {
                continue;
            };
            if !entry.is_visible(now) {
                continue;
            }
            if entry.receive_count > self.config.max_receive_count {
                // Already over the limit, waiting for migration.
                *exhausted = true;
                continue;
            }

            let mut next = entry.clone();
            next.receive_count += 1;
            let delivering = entry.receive_count < self.config.max_receive_count;
            if delivering {
                next.visible_at = now.saturating_add(lease);
            }

            match self
                .tree
                .compare_and_swap(&key, Some(&raw), Some(encode(&next)?))?
            {
                Ok(()) if delivering => claimed.push(next),
                Ok(()) => *exhausted = true,
                Err(_) => {
                    debug!(queue = %self.name, entry_id = %entry.id, "lost claim race");
                }
            }
        }
        Ok(())
    }

    /// Remove an entry. Acknowledging an id that is gone is not an error.
    pub fn acknowledge(&self, entry_id: &str) -> Result<AckOutcome> {
        match self.tree.remove(entry_id.as_bytes())? {
            Some(_) => {
                debug!(queue = %self.name, entry_id, "entry acknowledged");
                Ok(AckOutcome::Acknowledged)
            }
            None => Ok(AckOutcome::NotFound),
        }
    }

    /// Entries whose receive count has passed `max_receive_count`.
    pub fn peek_expired_for_dlq(&self) -> Result<Vec<QueuedEntry>> {
        Ok(self
            .expired_raw()?
            .into_iter()
            .map(|(_, _, entry)| entry)
            .collect())
    }

    /// Move every expired entry to the dead-letter sink. Each move is one
    /// transaction over both trees and only fires if the entry is unchanged
    /// since it was read, so concurrent sweeps cannot move an entry twice.
    pub fn migrate_expired(&self) -> Result<usize> {
        let mut moved = 0;
        for (key, raw, entry) in self.expired_raw()? {
            let letter = self.dead_letters.record(
                entry.message.clone(),
                &self.name,
                entry.receive_count,
            );
            let letter_bytes = encode(&letter)?;

            let done = (&self.tree, self.dead_letters.tree()).transaction(
                |(queue, dlq)| -> ConflictableTransactionResult<bool, BrokerError> {
                    match queue.get(&key)? {
                        Some(current) if current == raw => {
                            queue.remove(&key)?;
                            dlq.insert(letter.id.as_bytes(), letter_bytes.clone())?;
                            Ok(true)
                        }
                        _ => Ok(false),
                    }
                },
            )?;

            if done {
                moved += 1;
                warn!(
                    queue = %self.name,
                    entry_id = %entry.id,
                    message_id = %entry.message.id,
                    receive_count = entry.receive_count,
                    "entry moved to dead letters"
                );
            }
        }
        Ok(moved)
    }

    pub fn get(&self, entry_id: &str) -> Result<Option<QueuedEntry>> {
        match self.tree.get(entry_id.as_bytes())? {
            Some(raw) => Ok(Some(decode(&raw)?)),
            None => Ok(None),
        }
    }

    /// All entries, oldest first, leased or not.
    pub fn entries(&self) -> Result<Vec<QueuedEntry>> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (key, raw) = item?;
            if let Some(entry) = self.decode_entry(&key, &raw)? {
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    pub(crate) fn new_entry(&self, message: Message) -> QueuedEntry {
        let now = self.clock.now_millis();
        QueuedEntry {
            id: timestamped_key(now),
            message,
            receive_count: 0,
            visible_at: now,
            enqueued_at: now,
        }
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    pub(crate) fn wake_receivers(&self) {
        self.notify.notify_waiters();
    }

    fn expired_raw(&self) -> Result<Vec<(IVec, IVec, QueuedEntry)>> {
        let mut expired = Vec::new();
        for item in self.tree.iter() {
            let (key, raw) = item?;
            if let Some(entry) = self.decode_entry(&key, &raw)? {
                if entry.receive_count > self.config.max_receive_count {
                    expired.push((key, raw, entry));
                }
            }
        }
        Ok(expired)
    }

    /// Time until the earliest leased entry becomes visible again.
    fn next_visible_in(&self) -> Result<Option<Duration>> {
        let now = self.clock.now_millis();
        let mut earliest: Option<i64> = None;
        for item in self.tree.iter() {
            let (key, raw) = item?;
            if let Some(entry) = self.decode_entry(&key, &raw)? {
                if entry.visible_at > now {
                    earliest = Some(earliest.map_or(entry.visible_at, |e| e.min(entry.visible_at)));
                }
            }
        }
        Ok(earliest.map(|at| Duration::from_millis((at - now) as u64)))
    }

    /// Decode a stored entry. Bytes that do not decode are moved to the
    /// quarantine tree under `{queue}/{key}`, so they are neither rescanned
    /// nor counted by `len`.
    fn decode_entry(&self, key: &IVec, raw: &IVec) -> Result<Option<QueuedEntry>> {
        let err = match decode::<QueuedEntry>(raw) {
            Ok(entry) => return Ok(Some(entry)),
            Err(e) => e,
        };

        let mut quarantine_key = format!("{}/", self.name).into_bytes();
        quarantine_key.extend_from_slice(key);
        let moved = (&self.tree, &self.quarantine).transaction(
            |(queue, quarantine)| -> ConflictableTransactionResult<bool, BrokerError> {
                match queue.get(key)? {
                    Some(current) if current == *raw => {
                        queue.remove(key.clone())?;
                        quarantine.insert(quarantine_key.clone(), raw.clone())?;
                        Ok(true)
                    }
                    _ => Ok(false),
                }
            },
        )?;

        if moved {
            warn!(
                queue = %self.name,
                key = %String::from_utf8_lossy(key),
                "quarantined undecodable entry: {err}"
            );
        }
        Ok(None)
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish()
    }
}
