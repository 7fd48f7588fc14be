//! Topic and filtered fan-out
//!
//! A `Topic` owns a fixed list of subscriptions. Publishing evaluates every
//! subscription's filter and enqueues a copy of the message into each match.
//! Branches are independent: a failed enqueue is recorded in the report and
//! the remaining subscriptions still get their copy. Nothing is rolled back.

use std::sync::Arc;

use tracing::{error, info};

use crate::broker::filter::FilterPolicy;
use crate::broker::message::{EntryId, Message};
use crate::broker::queue::DurableQueue;
use crate::utils::error::{PublishError, Result};

/// Anything a subscription can deliver into.
pub trait MessageSink: Send + Sync {
    fn name(&self) -> &str;
    fn enqueue(&self, message: Message) -> Result<EntryId>;
}

impl MessageSink for DurableQueue {
    fn name(&self) -> &str {
        DurableQueue::name(self)
    }

    fn enqueue(&self, message: Message) -> Result<EntryId> {
        DurableQueue::enqueue(self, message)
    }
}

pub struct Subscription {
    pub name: String,
    pub queue: Arc<dyn MessageSink>,
    pub filter: FilterPolicy,
}

impl Subscription {
    pub fn new(name: &str, queue: Arc<dyn MessageSink>, filter: FilterPolicy) -> Self {
        Self {
            name: name.to_string(),
            queue,
            filter,
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("queue", &self.queue.name())
            .field("filter", &self.filter)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered(EntryId),
    Filtered,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionResult {
    pub subscription: String,
    pub queue: String,
    pub outcome: DeliveryOutcome,
}

/// Per-subscription outcome of one publish call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub message_id: String,
    pub results: Vec<SubscriptionResult>,
}

impl PublishReport {
    pub fn delivered(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, DeliveryOutcome::Delivered(_)))
            .count()
    }

    pub fn failures(&self) -> Vec<(String, String)> {
        self.results
            .iter()
            .filter_map(|r| match &r.outcome {
                DeliveryOutcome::Failed(e) => Some((r.subscription.clone(), e.clone())),
                _ => None,
            })
            .collect()
    }

    pub fn delivered_to(&self, queue: &str) -> Option<&EntryId> {
        self.results.iter().find_map(|r| match &r.outcome {
            DeliveryOutcome::Delivered(id) if r.queue == queue => Some(id),
            _ => None,
        })
    }

    /// Collapse the report: any failed branch, or no delivery at all, is an error.
    pub fn into_result(self) -> std::result::Result<PublishReport, PublishError> {
        let failed = self.failures();
        if !failed.is_empty() {
            return Err(PublishError::PartialFailure {
                failed,
                delivered: self.delivered(),
            });
        }
        if self.delivered() == 0 {
            return Err(PublishError::NoMatchingSubscription);
        }
        Ok(self)
    }
}

#[derive(Debug, Default)]
pub struct Topic {
    pub name: String,
    subscriptions: Vec<Subscription>,
}

impl Topic {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            subscriptions: Vec::new(),
        }
    }

    pub fn with_subscription(mut self, subscription: Subscription) -> Self {
        self.subscriptions.push(subscription);
        self
    }

    pub fn subscriptions(&self) -> &[Subscription] {
        &self.subscriptions
    }

    pub fn publish(&self, message: &Message) -> PublishReport {
        let results: Vec<_> = self
            .subscriptions
            .iter()
            .map(|sub| {
                let outcome = if !sub.filter.matches(&message.attributes) {
                    DeliveryOutcome::Filtered
                } else {
                    match sub.queue.enqueue(message.clone()) {
                        Ok(entry_id) => DeliveryOutcome::Delivered(entry_id),
                        Err(e) => {
                            error!(
                                topic = %self.name,
                                subscription = %sub.name,
                                message_id = %message.id,
                                "enqueue failed: {e}"
                            );
                            DeliveryOutcome::Failed(e.to_string())
                        }
                    }
                };
                SubscriptionResult {
                    subscription: sub.name.clone(),
                    queue: sub.queue.name().to_string(),
                    outcome,
                }
            })
            .collect();

        let report = PublishReport {
            message_id: message.id.clone(),
            results,
        };
        info!(
            topic = %self.name,
            message_id = %message.id,
            delivered = report.delivered(),
            "message published"
        );
        report
    }
}
