//! Config loading and defaults integration tests

use std::path::PathBuf;
use std::time::Duration;

use edge_agent::Config;
use tempfile::TempDir;

#[test]
fn test_default_config_values() {
    let config = Config::default();

    assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/edge-agent"));
    assert_eq!(config.policy.max_agreements, 5);
    assert_eq!(config.policy.default_service_ram_mb, 128);
    assert_eq!(config.workers.resource_idle_secs, 3600);
    assert_eq!(config.arch.canonical("x86_64"), "amd64");
    assert_eq!(
        config.database_path(),
        PathBuf::from("/var/lib/edge-agent/agent.db")
    );
    assert_eq!(
        config.policy_dir(),
        PathBuf::from("/var/lib/edge-agent/policy.d")
    );
}

#[test]
fn test_config_with_all_fields() {
    let toml_str = r#"
[node]
data_dir = "/srv/agent"

[exchange]
url = "https://exchange.example.com/v1"
request_timeout_secs = 5

[policy]
policy_path = "/etc/agent/policy.d"
max_agreements = 2
default_service_ram_mb = 256

[workers]
resource_idle_secs = 60
gc_retention_secs = 120

[arch]
armv7l = "arm"
"#;

    let config: Config = toml::from_str(toml_str).expect("valid config");

    assert_eq!(config.exchange.url, "https://exchange.example.com/v1");
    assert_eq!(config.request_timeout(), Duration::from_secs(5));
    assert_eq!(config.policy.max_agreements, 2);
    assert_eq!(config.policy.default_service_ram_mb, 256);
    assert_eq!(config.resource_idle_timeout(), Duration::from_secs(60));
    assert_eq!(config.gc_retention(), Duration::from_secs(120));
    // Absolute policy paths are not moved under the data directory
    assert_eq!(config.policy_dir(), PathBuf::from("/etc/agent/policy.d"));
    // An explicit table replaces the built-in synonyms
    assert_eq!(config.arch.canonical("armv7l"), "arm");
    assert_eq!(config.arch.canonical("x86_64"), "x86_64");
}

#[test]
fn test_partial_config_uses_defaults() {
    let toml_str = r#"
[policy]
max_agreements = 0
"#;

    let config: Config = toml::from_str(toml_str).expect("valid config");

    assert_eq!(config.policy.max_agreements, 0);
    assert_eq!(config.policy.default_service_ram_mb, 128);
    assert_eq!(config.node.data_dir, PathBuf::from("/var/lib/edge-agent"));
    assert_eq!(config.exchange.request_timeout_secs, 30);
    assert_eq!(config.arch.canonical("aarch64"), "arm64");
}

#[test]
fn test_load_missing_file_gives_defaults() {
    let dir = TempDir::new().unwrap();
    let config = Config::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.policy.max_agreements, 5);
}

#[test]
fn test_load_from_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("edge-agent.toml");
    std::fs::write(&path, "[node]\ndata_dir = \"/tmp/agent\"\n").unwrap();

    let config = Config::load(&path).unwrap();
    assert_eq!(config.node.data_dir, PathBuf::from("/tmp/agent"));
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("edge-agent.toml");
    std::fs::write(&path, "[policy]\nmax_agreements = \"many\"\n").unwrap();

    assert!(Config::load(&path).is_err());
}
