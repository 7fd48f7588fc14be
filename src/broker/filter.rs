//! Subscription filter policies
//!
//! A policy is a set of per-attribute string conditions that must all hold.
//! An empty policy matches every message. A condition on an attribute the
//! message does not carry never matches, whichever list it uses.

use std::collections::{BTreeMap, HashSet};

use crate::broker::message::Attributes;
use crate::config::ConditionSettings;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Condition {
    /// Matches when the value is one of these.
    Allow(HashSet<String>),
    /// Matches when the value is none of these.
    Deny(HashSet<String>),
}

impl Condition {
    pub fn matches(&self, value: &str) -> bool {
        match self {
            Condition::Allow(values) => values.contains(value),
            Condition::Deny(values) => !values.contains(value),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FilterPolicy {
    conditions: BTreeMap<String, Condition>,
}

impl FilterPolicy {
    pub fn match_all() -> Self {
        Self::default()
    }

    pub fn allowlist<I, S>(attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with(
            attribute,
            Condition::Allow(values.into_iter().map(Into::into).collect()),
        )
    }

    pub fn denylist<I, S>(attribute: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::default().with(
            attribute,
            Condition::Deny(values.into_iter().map(Into::into).collect()),
        )
    }

    /// Add (or replace) the condition on `attribute`.
    pub fn with(mut self, attribute: &str, condition: Condition) -> Self {
        self.conditions.insert(attribute.to_string(), condition);
        self
    }

    pub fn matches(&self, attributes: &Attributes) -> bool {
        self.conditions
            .iter()
            .all(|(key, condition)| match attributes.get(key) {
                Some(value) => condition.matches(value),
                None => false,
            })
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

impl From<&BTreeMap<String, ConditionSettings>> for FilterPolicy {
    fn from(settings: &BTreeMap<String, ConditionSettings>) -> Self {
        let mut policy = FilterPolicy::default();
        for (attribute, condition) in settings {
            // Config validation guarantees exactly one list is present.
            if let Some(allow) = &condition.allowlist {
                policy = policy.with(attribute, Condition::Allow(allow.iter().cloned().collect()));
            } else if let Some(deny) = &condition.denylist {
                policy = policy.with(attribute, Condition::Deny(deny.iter().cloned().collect()));
            }
        }
        policy
    }
}
