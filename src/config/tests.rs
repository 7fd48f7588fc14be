use super::settings::Settings;
use super::{CREATED_QUEUE, MAX_VISIBILITY_TIMEOUT_SECS, OTHER_QUEUE, load_config_from};
use crate::utils::error::BrokerError;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.server.port, 8080);
    assert_eq!(settings.queue.visibility_timeout_secs, 300);
    assert_eq!(settings.queue.max_receive_count, 5);
    assert_eq!(settings.dead_letter.retention_secs, 1_209_600);
    assert_eq!(settings.subscriptions.len(), 2);
    assert_eq!(settings.subscriptions[0].queue, CREATED_QUEUE);
    assert_eq!(settings.subscriptions[1].queue, OTHER_QUEUE);
}

#[test]
#[serial]
fn load_config_from_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("bigfan.toml");
    let toml = r#"
        [server]
        host = "0.0.0.0"
        port = 9000

        [queue]
        visibility_timeout_secs = 30
        max_receive_count = 3

        [[subscriptions]]
        name = "everything"
        queue = "audit"

        [[subscriptions]]
        name = "shipped"
        queue = "shipping"
        [subscriptions.filter.status]
        allowlist = ["shipped", "delivered"]
    "#;
    fs::write(&path, toml).expect("write config file");

    let cfg = load_config_from(path.to_str().unwrap()).expect("load_config failed");
    assert_eq!(cfg.server.host, "0.0.0.0");
    assert_eq!(cfg.server.port, 9000);
    assert_eq!(cfg.server.consumer_port, 8081);
    assert_eq!(cfg.queue.visibility_timeout_secs, 30);
    assert_eq!(cfg.queue.max_receive_count, 3);
    assert_eq!(cfg.queue.max_messages, 10);

    assert_eq!(cfg.subscriptions.len(), 2);
    assert!(cfg.subscriptions[0].filter.is_empty());
    let status = &cfg.subscriptions[1].filter["status"];
    assert_eq!(
        status.allowlist.as_deref(),
        Some(&["shipped".to_string(), "delivered".to_string()][..])
    );
    assert!(status.denylist.is_none());
}

#[test]
#[serial]
fn environment_overrides_file_values() {
    temp_env::with_vars(
        [
            ("BIGFAN_QUEUE__MAX_RECEIVE_COUNT", Some("7")),
            ("BIGFAN_STORAGE__PATH", Some("/tmp/bigfan-env")),
        ],
        || {
            let cfg = load_config_from("does/not/exist").expect("load_config failed");
            assert_eq!(cfg.queue.max_receive_count, 7);
            assert_eq!(cfg.storage.path, "/tmp/bigfan-env");
            assert_eq!(cfg.server.port, 8080);
        },
    );
}

#[test]
#[serial]
fn condition_with_both_lists_is_rejected() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("bad.toml");
    let toml = r#"
        [[subscriptions]]
        name = "confused"
        queue = "q"
        [subscriptions.filter.status]
        allowlist = ["a"]
        denylist = ["b"]
    "#;
    fs::write(&path, toml).expect("write config file");

    let err = load_config_from(path.to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("exactly one of allowlist or denylist"));
}

#[test]
#[serial]
fn duplicate_subscription_names_are_rejected() {
    let tmp = TempDir::new().expect("create tempdir");
    let path = tmp.path().join("dup.toml");
    let toml = r#"
        [[subscriptions]]
        name = "twice"
        queue = "a"

        [[subscriptions]]
        name = "twice"
        queue = "b"
    "#;
    fs::write(&path, toml).expect("write config file");

    let err = load_config_from(path.to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("duplicate subscription name"));
}

#[test]
#[serial]
fn oversized_durations_are_rejected() {
    let huge_lease = (u64::MAX / 1000).to_string();
    temp_env::with_var(
        "BIGFAN_QUEUE__VISIBILITY_TIMEOUT_SECS",
        Some(huge_lease.as_str()),
        || {
            let err = load_config_from("does/not/exist").unwrap_err();
            assert!(matches!(err, BrokerError::Config(_)));
            assert!(err.to_string().contains("visibility_timeout_secs"));
        },
    );

    let at_limit = MAX_VISIBILITY_TIMEOUT_SECS.to_string();
    temp_env::with_var(
        "BIGFAN_QUEUE__VISIBILITY_TIMEOUT_SECS",
        Some(at_limit.as_str()),
        || {
            let cfg = load_config_from("does/not/exist").expect("limit is allowed");
            assert_eq!(cfg.queue.visibility_timeout_secs, MAX_VISIBILITY_TIMEOUT_SECS);
        },
    );

    temp_env::with_var("BIGFAN_DEAD_LETTER__RETENTION_SECS", Some("999999999999"), || {
        let err = load_config_from("does/not/exist").unwrap_err();
        assert!(err.to_string().contains("retention_secs"));
    });

    temp_env::with_var("BIGFAN_QUEUE__WAIT_TIME_MS", Some("60000"), || {
        let err = load_config_from("does/not/exist").unwrap_err();
        assert!(err.to_string().contains("wait_time_ms"));
    });
}
