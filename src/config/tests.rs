use std::fs;
use std::time::Duration;

use serial_test::serial;
use tempfile::TempDir;

use super::settings::{DispatchSetting, Settings};
use super::load_config_from;
use crate::channel::DispatchMode;
use crate::utils::error::BridgeError;

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.pubsub.subscription, "testSubscription");
    assert_eq!(settings.pubsub.topic, "testTopic");
    assert_eq!(settings.bridge.input_channel, "pubsubInputChannel");
    assert_eq!(settings.bridge.output_channel, "pubsubOutputChannel");
    assert_eq!(settings.bridge.dispatch, DispatchSetting::Direct);
    assert_eq!(settings.logging.level, "info");
    assert!(settings.validate().is_ok());
}

#[test]
#[serial]
fn test_missing_file_yields_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    let settings = load_config_from(tmp.path()).expect("load_config failed");
    assert_eq!(settings, Settings::default());
}

#[test]
#[serial]
fn test_file_overrides_defaults() {
    let tmp = TempDir::new().expect("create tempdir");
    fs::create_dir_all(tmp.path().join("config")).expect("create config dir");
    let toml = r#"
        [server]
        port = 9000

        [pubsub]
        topic = "orders"
        ack_deadline_ms = 2500

        [bridge]
        dispatch = "concurrent"
        max_in_flight = 4
    "#;
    fs::write(tmp.path().join("config/default.toml"), toml).expect("write config file");

    let settings = load_config_from(tmp.path()).expect("load_config failed");
    assert_eq!(settings.server.port, 9000);
    assert_eq!(settings.server.host, "127.0.0.1");
    assert_eq!(settings.pubsub.topic, "orders");
    assert_eq!(settings.pubsub.subscription, "testSubscription");
    assert_eq!(settings.ack_deadline(), Duration::from_millis(2500));
    assert_eq!(
        settings.dispatch_mode(),
        DispatchMode::Concurrent { max_in_flight: 4 }
    );
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let tmp = TempDir::new().expect("create tempdir");
    fs::create_dir_all(tmp.path().join("config")).expect("create config dir");
    fs::write(
        tmp.path().join("config/default.toml"),
        "[pubsub]\nsubscription = \"fromFile\"\n",
    )
    .expect("write config file");

    temp_env::with_vars(
        [
            ("PUBSUB_BRIDGE__PUBSUB__SUBSCRIPTION", Some("fromEnv")),
            ("PUBSUB_BRIDGE__BRIDGE__PUBLISH_TIMEOUT_MS", Some("750")),
            ("PUBSUB_BRIDGE__LOGGING__LEVEL", Some("debug")),
        ],
        || {
            let settings = load_config_from(tmp.path()).expect("load_config failed");
            assert_eq!(settings.pubsub.subscription, "fromEnv");
            assert_eq!(settings.publish_timeout(), Duration::from_millis(750));
            assert_eq!(settings.logging.level, "debug");
        },
    );
}

#[test]
#[serial]
fn test_unknown_dispatch_mode_is_rejected() {
    let tmp = TempDir::new().expect("create tempdir");
    temp_env::with_var("PUBSUB_BRIDGE__BRIDGE__DISPATCH", Some("sideways"), || {
        assert!(load_config_from(tmp.path()).is_err());
    });
}

#[test]
fn test_validate_rejects_empty_names_and_zero_limits() {
    let mut settings = Settings::default();
    settings.pubsub.subscription = " ".to_string();
    assert!(matches!(
        settings.validate(),
        Err(BridgeError::Config(ref msg)) if msg.contains("pubsub.subscription")
    ));

    let mut settings = Settings::default();
    settings.bridge.max_in_flight = 0;
    assert!(matches!(
        settings.validate(),
        Err(BridgeError::Config(ref msg)) if msg.contains("bridge.max_in_flight")
    ));

    let mut settings = Settings::default();
    settings.bridge.reconnect_max_backoff_ms = 10;
    settings.bridge.reconnect_initial_backoff_ms = 100;
    assert!(settings.validate().is_err());
}

#[test]
fn test_reconnect_policy_from_settings() {
    let mut settings = Settings::default();
    settings.bridge.reconnect_initial_backoff_ms = 50;
    settings.bridge.reconnect_max_backoff_ms = 400;
    let policy = settings.reconnect_policy();
    assert_eq!(policy.delay(1), Duration::from_millis(50));
    assert_eq!(policy.delay(10), Duration::from_millis(400));
    assert_eq!(settings.server_addr(), "127.0.0.1:8085");
}
