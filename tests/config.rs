use relaygate::config::{
    ConfigError, ConfigOverrides, GatewayConfig, ListenerConfig, LogOutput, ProviderKind,
};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::TempDir;

const FULL: &str = r#"
use_tls = true
cert_file = "cert.pem"
key_file = "key.pem"
connection_timeout_secs = 45

[log]
level = "debug"
output = "file"
format = "pretty"
file_path = "logs/relaygate.log"
rotation = "hourly"
max_files = 3

[[listeners]]
interface = "0.0.0.0"
port = "8443"

[upstreams.primary]
type = "openai"
model = "gpt-3.5-turbo"
priority = 1
apiKey = "sk-primary"

[upstreams.backup]
type = "azure"
url = "https://example.openai.azure.com"
model = "gpt-35-turbo"
priority = 2
api_key = "azure-key"

[[interceptors]]
name = "cap_max_tokens"
[interceptors.config]
max = 512
"#;

fn write_config(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("config.toml");
    std::fs::write(&path, text).expect("write config");
    path
}

#[test]
fn loads_full_config_from_disk() {
    let dir = TempDir::new().expect("temp dir");
    let path = write_config(&dir, FULL);
    let cfg = GatewayConfig::load(&path, ConfigOverrides::default()).expect("load");

    assert_eq!(cfg.upstreams.len(), 2);
    assert_eq!(cfg.upstreams["backup"].kind, ProviderKind::Azure);
    assert_eq!(cfg.upstreams["backup"].api_version, "2023-05-15");
    assert_eq!(cfg.connection_timeout, Duration::from_secs(45));
    assert_eq!(cfg.log.output, LogOutput::File);
    assert_eq!(cfg.log.max_files, 3);
    let tls = cfg.tls.expect("tls enabled");
    assert_eq!(tls.cert_file, PathBuf::from("cert.pem"));
    assert_eq!(cfg.interceptors.len(), 1);
    assert_eq!(cfg.interceptors[0].name, "cap_max_tokens");
    assert_eq!(cfg.metrics_path, "/metrics");
}

#[test]
fn cli_overrides_apply_before_validation() {
    let dir = TempDir::new().expect("temp dir");
    let text = FULL
        .replace("cert_file = \"cert.pem\"\n", "")
        .replace("key_file = \"key.pem\"\n", "");
    let path = write_config(&dir, &text);

    let err = GatewayConfig::load(&path, ConfigOverrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::MissingTlsFile("cert_file")));

    let overrides = ConfigOverrides {
        listeners: Some(vec![ListenerConfig {
            interface: "127.0.0.1".to_string(),
            port: "9000".to_string(),
        }]),
        log_level: Some("warn".to_string()),
        disable_tls: true,
        ..ConfigOverrides::default()
    };
    let cfg = GatewayConfig::load(&path, overrides).expect("load with overrides");
    assert!(cfg.tls.is_none());
    assert_eq!(cfg.log.level, "warn");
    assert_eq!(cfg.listeners[0].address(), "127.0.0.1:9000");
}

#[test]
fn missing_file_reports_path() {
    let dir = TempDir::new().expect("temp dir");
    let path = dir.path().join("absent.toml");
    let err = GatewayConfig::load(&path, ConfigOverrides::default()).unwrap_err();
    assert!(matches!(err, ConfigError::Read { .. }));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn unknown_interceptor_fails_state_load() {
    let dir = TempDir::new().expect("temp dir");
    let text = FULL
        .replace("use_tls = true", "use_tls = false")
        .replace("name = \"cap_max_tokens\"", "name = \"translate\"")
        .replace("[interceptors.config]\nmax = 512\n", "");
    let path = write_config(&dir, &text);
    let cfg = GatewayConfig::load(&path, ConfigOverrides::default()).expect("load");
    let err = relaygate::app::load_state(cfg).err().expect("unknown interceptor");
    assert!(err.message.contains("translate"));
}
