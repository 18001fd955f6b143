//! Configuration loading, validation and environment overrides

mod common;

use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use peerlink::config::PeerlinkConfig;
use peerlink::transport::FailoverUri;
use peerlink::Error;
use tempfile::TempDir;

struct ConfigFixture {
    _temp_dir: TempDir,
    config_path: PathBuf,
}

impl ConfigFixture {
    fn new(content: &str) -> Self {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("peerlink.toml");
        fs::write(&config_path, content).unwrap();
        Self {
            _temp_dir: temp_dir,
            config_path,
        }
    }

    fn path(&self) -> &str {
        self.config_path.to_str().unwrap()
    }
}

#[test]
fn test_load_valid_fixture() {
    let path = common::valid_config_fixture();
    let config = PeerlinkConfig::load(path.to_str()).unwrap();

    assert_eq!(config.server_id(), "fixture-node");
    assert_eq!(config.plugin_id(), "acme_sync");
    assert_eq!(config.coordination.ping_rate_secs, 30);
    assert_eq!(config.coordination.event_queue_size, 64);
    assert_eq!(config.relay.listen, "0.0.0.0:7400");

    let policy = config.failover_policy();
    assert_eq!(policy.startup_max_reconnect_attempts, 4);
    assert_eq!(policy.max_reconnect_attempts, 8);
    assert_eq!(config.connect_timeout(), Duration::from_millis(2000));

    // parameters on the address win over the [broker] section
    let uri = FailoverUri::from_address(config.broker.address.as_deref().unwrap(), &policy).unwrap();
    assert_eq!(uri.urls, vec!["ws://10.0.0.1:7400", "ws://10.0.0.2:7400"]);
    assert_eq!(uri.policy.initial_reconnect_delay, Duration::from_millis(250));
    assert_eq!(uri.policy.max_reconnect_attempts, 8);
}

#[test]
fn test_load_invalid_fixture() {
    let path = common::invalid_config_fixture();
    let err = PeerlinkConfig::load(path.to_str()).unwrap_err();
    assert!(matches!(err, Error::ConfigValidation { .. }), "{:?}", err);
    assert_eq!(err.exit_code(), 10);
}

#[test]
fn test_missing_explicit_file() {
    let err = PeerlinkConfig::load(Some("/nonexistent/dir/peerlink.toml")).unwrap_err();
    assert!(matches!(err, Error::ConfigNotFound { .. }));
}

#[test]
fn test_malformed_toml() {
    let fixture = ConfigFixture::new("[broker\naddress = ");
    let err = PeerlinkConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(err, Error::ConfigParse { .. }));
}

#[test]
fn test_empty_file_uses_defaults() {
    let fixture = ConfigFixture::new("");
    let config = PeerlinkConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.broker.service_id, "message_broker");
    assert_eq!(config.coordination.settle_delay_ms, 1000);
}

#[test]
fn test_empty_plugin_handle_rejected() {
    let fixture = ConfigFixture::new(
        r#"
[node]
plugin_handle = ""
"#,
    );
    let err = PeerlinkConfig::load(Some(fixture.path())).unwrap_err();
    assert!(matches!(err, Error::ConfigValidation { field: Some(ref f), .. } if f == "node.plugin_handle"));
}

#[test]
fn test_memory_broker_accepted() {
    let fixture = ConfigFixture::new(
        r#"
[broker]
address = "memory://local"
"#,
    );
    let config = PeerlinkConfig::load(Some(fixture.path())).unwrap();
    assert_eq!(config.broker.address.as_deref(), Some("memory://local"));
}

#[test]
fn test_log_file_path_expanded() {
    let fixture = ConfigFixture::new(
        r#"
[logging]
file = "~/peerlink-test/node.log"
"#,
    );
    let config = PeerlinkConfig::load(Some(fixture.path())).unwrap();
    assert!(!config.logging.file.unwrap().contains('~'));
}
