// ============================================================================
// CONFIGURATION
// ============================================================================
// Precedence, lowest first:
//
//   built-in defaults -> config file (TOML or JSON) -> SYNAPSE_AGENT_* /
//   SYNAPSE_SERVER_* environment -> command-line flags
//
// Nested keys use `__` in the environment, e.g. SYNAPSE_SERVER_LOGGING__LEVEL.
// Durations are humantime strings ("10s", "100ms").
// ============================================================================

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{ArgAction, Args};
use figment::providers::{Env, Format, Json, Serialized, Toml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::access::AccessGuard;
use crate::error::ConfigError;
use crate::logging::{LoggingConfig, LOG_FORMATS};
use crate::store::StoreKind;
use crate::transport::TransportKind;

pub const AGENT_ENV_PREFIX: &str = "SYNAPSE_AGENT_";
pub const SERVER_ENV_PREFIX: &str = "SYNAPSE_SERVER_";

// ----------------------------------------------------------------------------
// Loading
// ----------------------------------------------------------------------------

fn load<T, O>(defaults: T, path: Option<&Path>, prefix: &str, overrides: &O) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned,
    O: Serialize,
{
    let mut figment = Figment::from(Serialized::defaults(defaults));

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        figment = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => figment.merge(Json::file(path)),
            _ => figment.merge(Toml::file(path)),
        };
    }

    figment
        .merge(Env::prefixed(prefix).split("__"))
        .merge(Serialized::defaults(overrides))
        .extract()
        .map_err(|e| ConfigError::ParseError { message: e.to_string() })
}

/// `ab****yz`; short secrets are masked entirely
pub fn mask_sensitive(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    match chars.len() {
        0 => String::new(),
        1..=4 => "****".into(),
        n => format!(
            "{}****{}",
            chars[..2].iter().collect::<String>(),
            chars[n - 2..].iter().collect::<String>()
        ),
    }
}

/// Integer seconds or a humantime string, normalised to humantime
pub fn parse_interval(raw: &str) -> Result<String, String> {
    let raw = raw.trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Ok(format!("{secs}s"));
    }
    humantime::parse_duration(raw)
        .map(|_| raw.to_string())
        .map_err(|e| format!("invalid duration '{raw}': {e}"))
}

fn non_empty_path(path: &Option<PathBuf>) -> Option<&Path> {
    path.as_deref().filter(|p| !p.as_os_str().is_empty())
}

fn require_non_zero(field: &str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::invalid_value(field, "must be greater than zero"));
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    if !LOG_FORMATS.contains(&logging.format.as_str()) {
        return Err(ConfigError::invalid_value(
            "logging.format",
            format!("expected one of {}", LOG_FORMATS.join(", ")),
        ));
    }
    Ok(())
}

/// `Vec<Duration>` as a list of humantime strings
mod duration_list {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(delays: &[Duration], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(delays.iter().map(|d| humantime::format_duration(*d).to_string()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<Duration>, D::Error> {
        let raw = Vec::<String>::deserialize(deserializer)?;
        raw.iter()
            .map(|s| humantime::parse_duration(s).map_err(serde::de::Error::custom))
            .collect()
    }
}

// ============================================================================
// AGENT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentConfig {
    /// HTTP server `host:port`
    #[serde(default = "default_agent_address")]
    pub address: String,

    #[serde(default)]
    pub transport: TransportKind,

    /// RPC server `host:port`; falls back to `address`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_address: Option<String>,

    #[serde(with = "humantime_serde", default = "default_poll_interval")]
    pub poll_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_report_interval")]
    pub report_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_health_interval")]
    pub health_interval: Duration,

    /// Queue capacity and worker count
    #[serde(default = "default_rate_limit")]
    pub rate_limit: usize,

    /// HMAC secret; empty disables signing
    #[serde(default)]
    pub key: String,

    /// Public key PEM used to encrypt outgoing payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    #[serde(with = "duration_list", default = "default_retry_delays")]
    pub retry_delays: Vec<Duration>,

    #[serde(with = "humantime_serde", default = "default_final_flush_timeout")]
    pub final_flush_timeout: Duration,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: default_agent_address(),
            transport: TransportKind::default(),
            rpc_address: None,
            poll_interval: default_poll_interval(),
            report_interval: default_report_interval(),
            health_interval: default_health_interval(),
            rate_limit: default_rate_limit(),
            key: String::new(),
            crypto_key: None,
            request_timeout: default_request_timeout(),
            retry_delays: default_retry_delays(),
            final_flush_timeout: default_final_flush_timeout(),
            logging: LoggingConfig::default(),
        }
    }
}

fn default_agent_address() -> String {
    "localhost:8080".into()
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(2)
}

fn default_report_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_health_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_rate_limit() -> usize {
    5
}

fn default_request_timeout() -> Duration {
    crate::transport::http::DEFAULT_REQUEST_TIMEOUT
}

fn default_retry_delays() -> Vec<Duration> {
    vec![Duration::from_secs(1), Duration::from_secs(3), Duration::from_secs(5)]
}

fn default_final_flush_timeout() -> Duration {
    crate::pipeline::DEFAULT_FINAL_FLUSH_TIMEOUT
}

/// Agent flags, applied over file and environment
#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct AgentOverrides {
    /// Server address (host:port)
    #[arg(short = 'a', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Report interval, seconds or humantime
    #[arg(short = 'r', long = "report", value_parser = parse_interval)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_interval: Option<String>,

    /// Poll interval, seconds or humantime
    #[arg(short = 'p', long = "poll", value_parser = parse_interval)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,

    /// HMAC signing key
    #[arg(short = 'k', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Concurrent outgoing batches
    #[arg(short = 'l', long = "rate-limit")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<usize>,

    /// Public key PEM for payload encryption
    #[arg(long = "crypto-key")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,

    /// Use the gRPC transport
    #[arg(long, action = ArgAction::SetTrue)]
    #[serde(skip)]
    pub rpc: bool,

    /// RPC server address (host:port)
    #[arg(long = "rpc-address")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_address: Option<String>,
}

impl AgentConfig {
    pub fn load(path: Option<&Path>, overrides: &AgentOverrides) -> Result<Self, ConfigError> {
        let mut config: Self = load(Self::default(), path, AGENT_ENV_PREFIX, overrides)?;
        if overrides.rpc {
            config.transport = TransportKind::Rpc;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid_value("address", "must not be empty"));
        }
        require_non_zero("poll_interval", self.poll_interval)?;
        require_non_zero("report_interval", self.report_interval)?;
        require_non_zero("health_interval", self.health_interval)?;
        require_non_zero("request_timeout", self.request_timeout)?;
        if self.rate_limit == 0 {
            return Err(ConfigError::invalid_value("rate_limit", "must be at least 1"));
        }
        if self.retry_delays.is_empty() {
            return Err(ConfigError::invalid_value("retry_delays", "must list at least one delay"));
        }
        validate_logging(&self.logging)
    }

    pub fn rpc_target(&self) -> &str {
        self.rpc_address.as_deref().filter(|a| !a.is_empty()).unwrap_or(&self.address)
    }

    pub fn crypto_key_path(&self) -> Option<&Path> {
        non_empty_path(&self.crypto_key)
    }

    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    /// Human-readable summary with secrets masked
    pub fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("address", self.address.clone()),
            ("transport", format!("{:?}", self.transport).to_lowercase()),
            ("rpc_address", self.rpc_target().to_string()),
            ("poll_interval", humantime::format_duration(self.poll_interval).to_string()),
            ("report_interval", humantime::format_duration(self.report_interval).to_string()),
            ("rate_limit", self.rate_limit.to_string()),
            ("key", mask_sensitive(&self.key)),
            (
                "crypto_key",
                self.crypto_key_path().map(|p| p.display().to_string()).unwrap_or_default(),
            ),
        ]
    }
}

// ============================================================================
// SERVER
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP bind address; `:8080` binds every interface
    #[serde(default = "default_server_address")]
    pub address: String,

    /// RPC bind address; RPC is disabled when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rpc_address: Option<String>,

    /// Snapshot period for the in-memory backend; zero disables it
    #[serde(with = "humantime_serde", default = "default_store_interval")]
    pub store_interval: Duration,

    #[serde(default = "default_file_storage_path")]
    pub file_storage_path: PathBuf,

    /// Load the snapshot at startup
    #[serde(default)]
    pub restore: bool,

    /// SQLite file; selects the transactional backend when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    #[serde(default)]
    pub key: String,

    /// Private key PEM used to decrypt payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,

    /// CIDR allowed to write; unset allows everyone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trusted_subnet: Option<String>,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: default_server_address(),
            rpc_address: None,
            store_interval: default_store_interval(),
            file_storage_path: default_file_storage_path(),
            restore: false,
            database_path: None,
            key: String::new(),
            crypto_key: None,
            trusted_subnet: None,
            logging: LoggingConfig::default(),
        }
    }
}

fn default_server_address() -> String {
    "0.0.0.0:8080".into()
}

fn default_store_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_file_storage_path() -> PathBuf {
    PathBuf::from("./saved_metrics.json")
}

/// Server flags, applied over file and environment
#[derive(Debug, Clone, Default, Args, Serialize)]
pub struct ServerOverrides {
    /// HTTP bind address
    #[arg(short = 'a', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Snapshot interval, seconds or humantime; 0 disables
    #[arg(short = 'i', long = "store-interval", value_parser = parse_interval)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store_interval: Option<String>,

    /// Snapshot file
    #[arg(short = 'f', long = "file")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_storage_path: Option<PathBuf>,

    /// Restore the snapshot at startup
    #[arg(short = 'r', long, num_args = 0..=1, default_missing_value = "true")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restore: Option<bool>,

    /// SQLite database file
    #[arg(short = 'd', long = "database")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,

    /// HMAC signing key
    #[arg(short = 'k', long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,

    /// Private key PEM for payload decryption
    #[arg(long = "crypto-key")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crypto_key: Option<PathBuf>,

    /// Trusted subnet in CIDR form
    #[arg(short = 't', long = "trusted-subnet")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trusted_subnet: Option<String>,

    /// RPC bind address
    #[arg(long = "rpc-address")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rpc_address: Option<String>,
}

impl ServerConfig {
    pub fn load(path: Option<&Path>, overrides: &ServerOverrides) -> Result<Self, ConfigError> {
        let config: Self = load(Self::default(), path, SERVER_ENV_PREFIX, overrides)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(source: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(source).map_err(|e| ConfigError::ParseError { message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.trim().is_empty() {
            return Err(ConfigError::invalid_value("address", "must not be empty"));
        }
        AccessGuard::new(self.trusted_subnet.as_deref())?;
        validate_logging(&self.logging)
    }

    /// `:8080` becomes `0.0.0.0:8080`
    pub fn bind_address(&self) -> String {
        normalize_bind(&self.address)
    }

    pub fn rpc_bind_address(&self) -> Option<String> {
        self.rpc_address
            .as_deref()
            .filter(|a| !a.trim().is_empty())
            .map(normalize_bind)
    }

    pub fn crypto_key_path(&self) -> Option<&Path> {
        non_empty_path(&self.crypto_key)
    }

    /// SQLite when a database path is set, in-memory otherwise
    pub fn store_kind(&self) -> StoreKind {
        match non_empty_path(&self.database_path) {
            Some(path) => StoreKind::Sqlite { path: path.to_path_buf() },
            None => StoreKind::Memory {
                snapshot_path: Some(self.file_storage_path.clone()).filter(|p| !p.as_os_str().is_empty()),
            },
        }
    }

    pub fn generate_default_config() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }

    pub fn summary(&self) -> Vec<(&'static str, String)> {
        vec![
            ("address", self.bind_address()),
            ("rpc_address", self.rpc_bind_address().unwrap_or_default()),
            ("store", format!("{:?}", self.store_kind())),
            ("store_interval", humantime::format_duration(self.store_interval).to_string()),
            ("restore", self.restore.to_string()),
            ("key", mask_sensitive(&self.key)),
            ("trusted_subnet", self.trusted_subnet.clone().unwrap_or_default()),
        ]
    }
}

fn normalize_bind(address: &str) -> String {
    let address = address.trim();
    if address.starts_with(':') {
        format!("0.0.0.0{address}")
    } else {
        address.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn test_mask_sensitive() {
        assert_eq!(mask_sensitive(""), "");
        assert_eq!(mask_sensitive("abcd"), "****");
        assert_eq!(mask_sensitive("abcdefgh"), "ab****gh");
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("10").unwrap(), "10s");
        assert_eq!(parse_interval("250ms").unwrap(), "250ms");
        assert!(parse_interval("soon").is_err());
    }

    #[test]
    fn test_agent_defaults() {
        let config = AgentConfig::default();
        config.validate().unwrap();
        assert_eq!(config.address, "localhost:8080");
        assert_eq!(config.rate_limit, 5);
        assert_eq!(config.retry_delays, default_retry_delays());
        assert_eq!(config.final_flush_timeout, Duration::from_millis(100));
        assert_eq!(config.rpc_target(), "localhost:8080");
    }

    #[test]
    fn test_generated_config_round_trips() {
        let agent = AgentConfig::from_toml(&AgentConfig::generate_default_config()).unwrap();
        assert_eq!(agent, AgentConfig::default());
        let server = ServerConfig::from_toml(&ServerConfig::generate_default_config()).unwrap();
        assert_eq!(server, ServerConfig::default());
    }

    #[test]
    fn test_agent_validation() {
        let mut config = AgentConfig::default();
        config.rate_limit = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { field, .. }) if field == "rate_limit"));

        let mut config = AgentConfig::default();
        config.retry_delays.clear();
        assert!(config.validate().is_err());

        let mut config = AgentConfig::default();
        config.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_env_and_flags_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "agent.toml",
                r#"
                address = "collector:9000"
                report_interval = "30s"
                retry_delays = ["10ms", "20ms"]
                rate_limit = 2
                "#,
            )?;
            jail.set_env("SYNAPSE_AGENT_RATE_LIMIT", "7");
            jail.set_env("SYNAPSE_AGENT_LOGGING__LEVEL", "debug");

            let overrides = AgentOverrides {
                poll_interval: Some("1s".into()),
                rpc: true,
                ..AgentOverrides::default()
            };
            let config = AgentConfig::load(Some(Path::new("agent.toml")), &overrides).map_err(|e| e.to_string())?;

            assert_eq!(config.address, "collector:9000");
            assert_eq!(config.report_interval, Duration::from_secs(30));
            assert_eq!(config.retry_delays, vec![Duration::from_millis(10), Duration::from_millis(20)]);
            assert_eq!(config.rate_limit, 7);
            assert_eq!(config.logging.level, "debug");
            assert_eq!(config.poll_interval, Duration::from_secs(1));
            assert_eq!(config.transport, TransportKind::Rpc);
            Ok(())
        });
    }

    #[test]
    fn test_json_server_file() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "server.json",
                r#"{"address": ":9090", "store_interval": "0s", "database_path": "metrics.db"}"#,
            )?;
            let overrides = ServerOverrides {
                restore: Some(true),
                ..ServerOverrides::default()
            };
            let config = ServerConfig::load(Some(Path::new("server.json")), &overrides).map_err(|e| e.to_string())?;

            assert_eq!(config.bind_address(), "0.0.0.0:9090");
            assert!(config.store_interval.is_zero());
            assert!(config.restore);
            assert_eq!(config.store_kind(), StoreKind::Sqlite { path: "metrics.db".into() });
            Ok(())
        });
    }

    #[test]
    fn test_missing_file_and_bad_subnet() {
        assert!(matches!(
            ServerConfig::load(Some(Path::new("/definitely/not/here.toml")), &ServerOverrides::default()),
            Err(ConfigError::FileNotFound { .. })
        ));

        let config = ServerConfig {
            trusted_subnet: Some("10.0.0.0/40".into()),
            ..ServerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_server_store_kind_defaults_to_memory() {
        assert_eq!(
            ServerConfig::default().store_kind(),
            StoreKind::Memory {
                snapshot_path: Some(PathBuf::from("./saved_metrics.json"))
            }
        );
    }
}
