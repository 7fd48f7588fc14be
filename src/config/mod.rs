mod settings;

use crate::config::settings::PartialSettings;
use config::{Config, ConfigError, Environment, File};

use crate::utils::error::Result;

pub use settings::{
    CREATED_QUEUE, ConditionSettings, DeadLetterSettings, LoggingSettings, OTHER_QUEUE,
    QueueSettings, ServerSettings, Settings, StorageSettings, SubscriptionSettings,
    WorkerSettings,
};

const DEFAULT_CONFIG_FILE: &str = "config/default";

/// Longest lease a queue may hand out (12 hours).
pub const MAX_VISIBILITY_TIMEOUT_SECS: u64 = 12 * 60 * 60;
/// Longest a dead letter may be kept (one year).
pub const MAX_RETENTION_SECS: u64 = 365 * 24 * 60 * 60;
/// Longest long poll a worker may ask for.
pub const MAX_WAIT_TIME_MS: u64 = 20_000;

/// Loads the configuration from the default file and environment variables.
pub fn load_config() -> Result<Settings> {
    load_config_from(DEFAULT_CONFIG_FILE)
}

/// Loads `path` (any format the `config` crate understands, extension optional)
/// plus `BIGFAN_*` environment variables, and merges the result over the
/// defaults. Nested keys use `__`, e.g. `BIGFAN_QUEUE__MAX_RECEIVE_COUNT=3`.
pub fn load_config_from(path: &str) -> Result<Settings> {
    let builder = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(
            Environment::with_prefix("BIGFAN")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

    let config = builder.build()?;

    // Try to deserialize what is available
    let partial: PartialSettings = config.try_deserialize()?;
    let settings = merge(partial, Settings::default());
    validate(&settings)?;
    Ok(settings)
}

fn merge(partial: PartialSettings, default: Settings) -> Settings {
    let server = partial.server.unwrap_or_default();
    let queue = partial.queue.unwrap_or_default();
    let dead_letter = partial.dead_letter.unwrap_or_default();
    let storage = partial.storage.unwrap_or_default();
    let workers = partial.workers.unwrap_or_default();
    let logging = partial.logging.unwrap_or_default();

    Settings {
        server: ServerSettings {
            host: server.host.unwrap_or(default.server.host),
            port: server.port.unwrap_or(default.server.port),
            consumer_port: server.consumer_port.unwrap_or(default.server.consumer_port),
        },
        queue: QueueSettings {
            visibility_timeout_secs: queue
                .visibility_timeout_secs
                .unwrap_or(default.queue.visibility_timeout_secs),
            max_receive_count: queue
                .max_receive_count
                .unwrap_or(default.queue.max_receive_count),
            wait_time_ms: queue.wait_time_ms.unwrap_or(default.queue.wait_time_ms),
            max_messages: queue.max_messages.unwrap_or(default.queue.max_messages),
            sweep_interval_ms: queue
                .sweep_interval_ms
                .unwrap_or(default.queue.sweep_interval_ms),
        },
        dead_letter: DeadLetterSettings {
            retention_secs: dead_letter
                .retention_secs
                .unwrap_or(default.dead_letter.retention_secs),
        },
        storage: StorageSettings {
            path: storage.path.unwrap_or(default.storage.path),
        },
        workers: WorkerSettings {
            per_queue: workers.per_queue.unwrap_or(default.workers.per_queue),
        },
        logging: LoggingSettings {
            level: logging.level.unwrap_or(default.logging.level),
        },
        subscriptions: partial.subscriptions.unwrap_or(default.subscriptions),
    }
}

/// Rejects subscription sets the router could not evaluate unambiguously.
fn validate(settings: &Settings) -> std::result::Result<(), ConfigError> {
    if settings.queue.max_messages == 0 {
        return Err(ConfigError::Message(
            "queue.max_messages must be at least 1".to_string(),
        ));
    }

    if settings.queue.max_receive_count == 0 {
        return Err(ConfigError::Message(
            "queue.max_receive_count must be at least 1".to_string(),
        ));
    }

    if settings.queue.visibility_timeout_secs > MAX_VISIBILITY_TIMEOUT_SECS {
        return Err(ConfigError::Message(format!(
            "queue.visibility_timeout_secs must be at most {MAX_VISIBILITY_TIMEOUT_SECS}"
        )));
    }

    if settings.queue.wait_time_ms > MAX_WAIT_TIME_MS {
        return Err(ConfigError::Message(format!(
            "queue.wait_time_ms must be at most {MAX_WAIT_TIME_MS}"
        )));
    }

    if settings.dead_letter.retention_secs > MAX_RETENTION_SECS {
        return Err(ConfigError::Message(format!(
            "dead_letter.retention_secs must be at most {MAX_RETENTION_SECS}"
        )));
    }

    let mut names = std::collections::HashSet::new();
    for sub in &settings.subscriptions {
        if !names.insert(sub.name.as_str()) {
            return Err(ConfigError::Message(format!(
                "duplicate subscription name '{}'",
                sub.name
            )));
        }
        for (attribute, condition) in &sub.filter {
            match (&condition.allowlist, &condition.denylist) {
                (Some(_), None) | (None, Some(_)) => {}
                _ => {
                    return Err(ConfigError::Message(format!(
                        "subscription '{}': condition on '{attribute}' needs exactly one of allowlist or denylist",
                        sub.name
                    )));
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests;
