use std::collections::BTreeMap;

use serde::Deserialize;

/// Top-level configuration settings for the application.
///
/// Loaded once at startup. Nothing here is mutated afterwards; the broker is
/// built from a `Settings` value and the subscription set stays fixed for the
/// life of the process.
#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub queue: QueueSettings,
    pub dead_letter: DeadLetterSettings,
    pub storage: StorageSettings,
    pub workers: WorkerSettings,
    pub logging: LoggingSettings,
    pub subscriptions: Vec<SubscriptionSettings>,
}

/// Listen addresses for the ingestion gateway and the consumer endpoint.
#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    pub consumer_port: u16,
}

/// Delivery parameters shared by every durable queue.
#[derive(Debug, Deserialize, Clone)]
pub struct QueueSettings {
    pub visibility_timeout_secs: u64,
    pub max_receive_count: u32,
    /// Long-poll wait used by in-process workers.
    pub wait_time_ms: u64,
    pub max_messages: usize,
    /// How often expired entries are migrated and old dead letters purged.
    pub sweep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DeadLetterSettings {
    pub retention_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageSettings {
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkerSettings {
    /// In-process logging workers started per subscription queue by `serve`.
    pub per_queue: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    pub level: String,
}

/// One subscription on the topic: a target queue and its filter policy.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct SubscriptionSettings {
    pub name: String,
    pub queue: String,
    /// Attribute name -> condition. Every condition must match.
    #[serde(default)]
    pub filter: BTreeMap<String, ConditionSettings>,
}

/// A string condition on one attribute. Exactly one list should be set.
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct ConditionSettings {
    pub allowlist: Option<Vec<String>>,
    pub denylist: Option<Vec<String>>,
}

/// Partial configuration settings loaded from files or environment.
///
/// Settings as read from file and environment; anything missing falls back to the defaults.
#[derive(Debug, Deserialize, Default)]
pub struct PartialSettings {
    pub server: Option<PartialServerSettings>,
    pub queue: Option<PartialQueueSettings>,
    pub dead_letter: Option<PartialDeadLetterSettings>,
    pub storage: Option<PartialStorageSettings>,
    pub workers: Option<PartialWorkerSettings>,
    pub logging: Option<PartialLoggingSettings>,
    pub subscriptions: Option<Vec<SubscriptionSettings>>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialServerSettings {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub consumer_port: Option<u16>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialQueueSettings {
    pub visibility_timeout_secs: Option<u64>,
    pub max_receive_count: Option<u32>,
    pub wait_time_ms: Option<u64>,
    pub max_messages: Option<usize>,
    pub sweep_interval_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialDeadLetterSettings {
    pub retention_secs: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialStorageSettings {
    pub path: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialWorkerSettings {
    pub per_queue: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
pub struct PartialLoggingSettings {
    pub level: Option<String>,
}

pub const CREATED_QUEUE: &str = "BigFanTopicStatusCreatedSubscriberQueue";
pub const OTHER_QUEUE: &str = "BigFanTopicAnyOtherStatusSubscriberQueue";

/// Provides default values for `Settings`.
///
/// The default subscriptions split the topic on `status`: `created` goes to
/// one queue, everything else to the other.
impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                host: "127.0.0.1".to_string(),
                port: 8080,
                consumer_port: 8081,
            },
            queue: QueueSettings {
                visibility_timeout_secs: 300,
                max_receive_count: 5,
                wait_time_ms: 20_000,
                max_messages: 10,
                sweep_interval_ms: 1000,
            },
            dead_letter: DeadLetterSettings {
                retention_secs: 14 * 24 * 60 * 60,
            },
            storage: StorageSettings {
                path: "bigfan_db".to_string(),
            },
            workers: WorkerSettings { per_queue: 1 },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
            subscriptions: default_subscriptions(),
        }
    }
}

fn default_subscriptions() -> Vec<SubscriptionSettings> {
    let status_condition = |allow: bool| {
        let values = Some(vec!["created".to_string()]);
        let condition = if allow {
            ConditionSettings {
                allowlist: values,
                denylist: None,
            }
        } else {
            ConditionSettings {
                allowlist: None,
                denylist: values,
            }
        };
        BTreeMap::from([("status".to_string(), condition)])
    };

    vec![
        SubscriptionSettings {
            name: "status-created".to_string(),
            queue: CREATED_QUEUE.to_string(),
            filter: status_condition(true),
        },
        SubscriptionSettings {
            name: "status-other".to_string(),
            queue: OTHER_QUEUE.to_string(),
            filter: status_condition(false),
        },
    ]
}
