//! Broker engine
//!
//! Wires the persistent store, the durable queues, the dead-letter sink and
//! the topic together from a `Settings` value.
//!
//! Concurrency and usage notes:
//! - A `Broker` is immutable after construction and is shared as
//!   `Arc<Broker>`. There is no broker-wide lock; every queue handles its own
//!   claims with per-entry compare-and-swap.
//! - The sweep loop is designed to run as a background task. It migrates
//!   entries that exhausted their receive budget and purges dead letters
//!   older than the retention period.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::broker::clock::{SharedClock, system_clock};
use crate::broker::dead_letter::DeadLetterSink;
use crate::broker::filter::FilterPolicy;
use crate::broker::message::{EntryId, Message};
use crate::broker::queue::{DurableQueue, QueueConfig};
use crate::broker::topic::{PublishReport, Subscription, Topic};
use crate::config::Settings;
use crate::persistence::Store;
use crate::utils::error::{BrokerError, Result};

pub const TOPIC_NAME: &str = "ApiGWFanTopic";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub migrated: usize,
    pub purged: usize,
}

#[derive(Debug)]
pub struct Broker {
    store: Store,
    topic: Topic,
    queues: BTreeMap<String, Arc<DurableQueue>>,
    dead_letters: DeadLetterSink,
}

impl Broker {
    /// Open the store at `settings.storage.path` and build the broker on it.
    pub fn open(settings: &Settings) -> Result<Self> {
        let store = Store::open(&settings.storage.path)?;
        Self::with_store(store, settings, system_clock())
    }

    pub fn with_store(store: Store, settings: &Settings, clock: SharedClock) -> Result<Self> {
        let dead_letters = DeadLetterSink::open(
            &store,
            Duration::from_secs(settings.dead_letter.retention_secs),
            clock.clone(),
        )?;
        let queue_config = QueueConfig::from(&settings.queue);

        let mut queues: BTreeMap<String, Arc<DurableQueue>> = BTreeMap::new();
        let mut topic = Topic::new(TOPIC_NAME);
        for sub in &settings.subscriptions {
            let queue = match queues.get(&sub.queue) {
                Some(queue) => queue.clone(),
                None => {
                    let queue = Arc::new(DurableQueue::open(
                        &store,
                        &sub.queue,
                        queue_config,
                        dead_letters.clone(),
                        clock.clone(),
                    )?);
                    queues.insert(sub.queue.clone(), queue.clone());
                    queue
                }
            };
            topic = topic.with_subscription(Subscription::new(
                &sub.name,
                queue,
                FilterPolicy::from(&sub.filter),
            ));
        }

        info!(
            topic = TOPIC_NAME,
            subscriptions = settings.subscriptions.len(),
            queues = queues.len(),
            "broker ready"
        );

        Ok(Self {
            store,
            topic,
            queues,
            dead_letters,
        })
    }

    pub fn publish(&self, message: Message) -> PublishReport {
        self.topic.publish(&message)
    }

    pub fn queue(&self, name: &str) -> Result<Arc<DurableQueue>> {
        self.queues
            .get(name)
            .cloned()
            .ok_or_else(|| BrokerError::UnknownQueue(name.to_string()))
    }

    pub fn queues(&self) -> impl Iterator<Item = &Arc<DurableQueue>> {
        self.queues.values()
    }

    /// Queue name -> number of entries, leased or not.
    pub fn queue_depths(&self) -> BTreeMap<String, usize> {
        self.queues
            .iter()
            .map(|(name, queue)| (name.clone(), queue.len()))
            .collect()
    }

    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    pub fn dead_letters(&self) -> &DeadLetterSink {
        &self.dead_letters
    }

    /// Replay onto `queue`, or onto the queue the letter came from.
    pub fn replay_dead_letter(&self, id: &str, queue: Option<&str>) -> Result<EntryId> {
        let target = match queue {
            Some(name) => name.to_string(),
            None => {
                self.dead_letters
                    .get(id)?
                    .ok_or_else(|| BrokerError::NotFound(format!("dead letter {id}")))?
                    .original_queue
            }
        };
        let queue = self.queue(&target)?;
        self.dead_letters.replay(id, &queue)
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        let mut report = SweepReport::default();
        for queue in self.queues.values() {
            report.migrated += queue.migrate_expired()?;
        }
        report.purged = self.dead_letters.purge_expired()?;
        Ok(report)
    }

    pub async fn start_sweep_loop(
        broker: Arc<Broker>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }

            if let Err(e) = broker.sweep() {
                error!("sweep failed: {e}");
            }
        }
    }

    pub async fn flush(&self) -> Result<()> {
        self.store.flush().await
    }
}
