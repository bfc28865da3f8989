//! Server configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via RIPPLEDB_CONFIG or --config)
//! 3. Environment variables

use crate::auth::Action;
use rippledb_protocol::{ReplicaId, DEFAULT_PORT};
use rippledb_wal::WalConfig;
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub network: NetworkConfig,
    pub storage: StorageConfig,
    pub instance: InstanceConfig,
    pub replication: ReplicationConfig,
    pub auth: AuthConfig,
    pub metrics: MetricsConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("RIPPLEDB_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_env_overrides();
        config.load_secrets()?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Self::from_yaml(&content).map_err(|e| match e {
            ConfigError::ParseError(_, msg) => ConfigError::ParseError(path.to_path_buf(), msg),
            other => other,
        })
    }

    /// Parses configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigError::ParseError(PathBuf::from("<inline>"), e.to_string()))
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.storage.apply_env_overrides();
        self.instance.apply_env_overrides();
        self.replication.apply_env_overrides();
        self.auth.apply_env_overrides();
        self.metrics.apply_env_overrides();
    }

    /// Loads user credentials from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        self.auth.load_secrets()
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance.id == 0 {
            return Err(ConfigError::ValidationError(
                "instance.id must be non-zero".to_string(),
            ));
        }
        if let Some(source) = &self.replication.source {
            if !source.contains(':') {
                return Err(ConfigError::ValidationError(format!(
                    "replication.source must be host:port, got '{source}'"
                )));
            }
        }
        if self.replication.user.is_some() != self.replication.token.is_some() {
            return Err(ConfigError::ValidationError(
                "replication.user and replication.token must be set together".to_string(),
            ));
        }
        if self.storage.wal_segment_size_mb == 0 {
            return Err(ConfigError::ValidationError(
                "storage.wal_segment_size_mb must be positive".to_string(),
            ));
        }
        self.auth.validate()
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Idle connection timeout in seconds.
    pub idle_timeout_secs: u64,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            idle_timeout_secs: 300,
            max_connections: 1000,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(addr) = env_parse("RIPPLEDB_BIND") {
            self.bind_addr = addr;
        }
        if let Some(secs) = env_parse("RIPPLEDB_IDLE_TIMEOUT") {
            self.idle_timeout_secs = secs;
        }
        if let Some(n) = env_parse("RIPPLEDB_MAX_CONNECTIONS") {
            self.max_connections = n;
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

/// Storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub wal_segment_size_mb: u64,
    pub fsync_policy: FsyncPolicy,
}

/// Fsync policy for WAL writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FsyncPolicy {
    EveryWrite,
    EveryN(u32),
    Never,
}

impl FsyncPolicy {
    fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "every_write" | "everywrite" => Some(FsyncPolicy::EveryWrite),
            "never" => Some(FsyncPolicy::Never),
            s => s
                .strip_prefix("every_n:")
                .and_then(|n| n.parse().ok())
                .map(FsyncPolicy::EveryN),
        }
    }
}

impl From<FsyncPolicy> for rippledb_wal::FsyncPolicy {
    fn from(policy: FsyncPolicy) -> Self {
        match policy {
            FsyncPolicy::EveryWrite => rippledb_wal::FsyncPolicy::EveryWrite,
            FsyncPolicy::EveryN(n) => rippledb_wal::FsyncPolicy::EveryN(n),
            FsyncPolicy::Never => rippledb_wal::FsyncPolicy::Never,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            wal_segment_size_mb: 64,
            fsync_policy: FsyncPolicy::EveryWrite,
        }
    }
}

impl StorageConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(dir) = std::env::var("RIPPLEDB_DATA") {
            self.data_dir = PathBuf::from(dir);
        }
        if let Some(mb) = env_parse("RIPPLEDB_WAL_SEGMENT_SIZE_MB") {
            self.wal_segment_size_mb = mb;
        }
        if let Ok(policy) = std::env::var("RIPPLEDB_FSYNC_POLICY") {
            match FsyncPolicy::parse(&policy) {
                Some(parsed) => self.fsync_policy = parsed,
                None => tracing::warn!("Ignoring unknown RIPPLEDB_FSYNC_POLICY '{}'", policy),
            }
        }
    }

    pub fn wal_segment_size(&self) -> u64 {
        self.wal_segment_size_mb * 1024 * 1024
    }

    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn wal_config(&self) -> WalConfig {
        WalConfig::new(self.wal_dir())
            .with_segment_size(self.wal_segment_size())
            .with_fsync_policy(self.fsync_policy.into())
    }
}

/// Identity of this instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    /// Replica id stamped on local writes. Must be unique in the cluster.
    pub id: ReplicaId,
    /// Generated at startup when absent.
    pub uuid: Option<Uuid>,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self { id: 1, uuid: None }
    }
}

impl InstanceConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(id) = env_parse("RIPPLEDB_INSTANCE_ID") {
            self.id = id;
        }
        if let Some(uuid) = env_parse("RIPPLEDB_INSTANCE_UUID") {
            self.uuid = Some(uuid);
        }
    }

    /// Returns the configured uuid, or a fresh one.
    pub fn resolve_uuid(&self) -> Uuid {
        self.uuid.unwrap_or_else(Uuid::new_v4)
    }
}

/// Replica-side replication settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Master address (`host:port`). Unset on a master.
    pub source: Option<String>,
    pub user: Option<String>,
    pub token: Option<String>,
    pub connect_timeout_ms: u64,
    pub reconnect_interval_ms: u64,
    /// How long startup waits for the applier to reach streaming.
    pub start_timeout_secs: u64,
    pub ack_interval_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            source: None,
            user: None,
            token: None,
            connect_timeout_ms: 1000,
            reconnect_interval_ms: 200,
            start_timeout_secs: 30,
            ack_interval_ms: 100,
        }
    }
}

impl ReplicationConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(source) = std::env::var("RIPPLEDB_REPLICATION_SOURCE") {
            self.source = (!source.is_empty()).then_some(source);
        }
        if let Ok(user) = std::env::var("RIPPLEDB_REPLICATION_USER") {
            self.user = Some(user);
        }
        if let Ok(token) = std::env::var("RIPPLEDB_REPLICATION_TOKEN") {
            self.token = Some(token);
        }
        if let Some(ms) = env_parse("RIPPLEDB_REPLICATION_RECONNECT_MS") {
            self.reconnect_interval_ms = ms;
        }
        if let Some(secs) = env_parse("RIPPLEDB_REPLICATION_START_TIMEOUT") {
            self.start_timeout_secs = secs;
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_timeout_secs)
    }

    pub fn ack_interval(&self) -> Duration {
        Duration::from_millis(self.ack_interval_ms)
    }
}

/// A named user and its capabilities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConfig {
    pub name: String,
    /// SHA-256 hex of the user's token.
    /// Generate with: `rippledb-cli hash-token <your-token>`
    pub token_hash: String,
    #[serde(default = "default_user_grants")]
    pub grants: Vec<Action>,
}

fn default_user_grants() -> Vec<Action> {
    vec![Action::Read, Action::Write]
}

/// Authentication and capability configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Capabilities of unauthenticated sessions.
    pub guest_grants: Vec<Action>,
    pub users: Vec<UserConfig>,
    /// File with one `name:token_hash[:grant,grant]` entry per line.
    pub secrets_file: Option<PathBuf>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            guest_grants: vec![Action::Read, Action::Write],
            users: Vec::new(),
            secrets_file: None,
        }
    }
}

impl AuthConfig {
    fn apply_env_overrides(&mut self) {
        if env_flag("RIPPLEDB_GUEST_REPLICATION") == Some(true)
            && !self.guest_grants.contains(&Action::Replication)
        {
            self.guest_grants.push(Action::Replication);
        }
        if let Ok(path) = std::env::var("RIPPLEDB_AUTH_SECRETS_FILE") {
            self.secrets_file = Some(PathBuf::from(path));
        }
    }

    /// Loads users from the secrets file if configured.
    pub fn load_secrets(&mut self) -> Result<(), ConfigError> {
        let Some(path) = self.secrets_file.clone() else {
            return Ok(());
        };
        let content =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::IoError(path.clone(), e))?;
        for (lineno, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let mut parts = line.splitn(3, ':');
            let (Some(name), Some(hash)) = (parts.next(), parts.next()) else {
                return Err(ConfigError::ParseError(
                    path.clone(),
                    format!("line {}: expected name:token_hash", lineno + 1),
                ));
            };
            let grants = match parts.next() {
                Some(list) => list
                    .split(',')
                    .map(|g| {
                        g.trim().parse::<Action>().map_err(|e| {
                            ConfigError::ParseError(path.clone(), format!("line {}: {e}", lineno + 1))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?,
                None => default_user_grants(),
            };
            self.users.push(UserConfig {
                name: name.to_string(),
                token_hash: hash.to_string(),
                grants,
            });
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for user in &self.users {
            if user.name.is_empty() || user.name == crate::auth::GUEST {
                return Err(ConfigError::ValidationError(format!(
                    "invalid user name '{}'",
                    user.name
                )));
            }
            let valid_hash = user.token_hash.len() == 64
                && user.token_hash.chars().all(|c| c.is_ascii_hexdigit());
            if !valid_hash {
                return Err(ConfigError::ValidationError(format!(
                    "user '{}': token_hash must be 64 hex characters",
                    user.name
                )));
            }
        }
        Ok(())
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_env_overrides(&mut self) {
        if let Some(enabled) = env_flag("RIPPLEDB_METRICS_ENABLED") {
            self.enabled = enabled;
        }
        if let Some(addr) = env_parse("RIPPLEDB_METRICS_BIND") {
            self.bind_addr = addr;
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{}': {}", .0.display(), .1)]
    IoError(PathBuf, std::io::Error),

    #[error("failed to parse config file '{}': {}", .0.display(), .1)]
    ParseError(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), 3301);
        assert_eq!(config.storage.wal_segment_size(), 64 * 1024 * 1024);
        assert_eq!(config.instance.id, 1);
        assert!(config.replication.source.is_none());
        assert!(!config.auth.guest_grants.contains(&Action::Replication));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_storage_paths() {
        let config = StorageConfig::default();
        assert_eq!(config.wal_dir(), PathBuf::from("./data/wal"));
        assert_eq!(config.wal_config().dir, PathBuf::from("./data/wal"));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.storage.fsync_policy, config.storage.fsync_policy);
    }

    #[test]
    fn test_yaml_replica() {
        let yaml = r#"
instance:
  id: 2
replication:
  source: "127.0.0.1:3301"
  reconnect_interval_ms: 50
storage:
  fsync_policy:
    every_n: 10
auth:
  guest_grants: [read, write, replication]
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.instance.id, 2);
        assert_eq!(config.replication.source.as_deref(), Some("127.0.0.1:3301"));
        assert_eq!(
            config.replication.reconnect_interval(),
            Duration::from_millis(50)
        );
        assert_eq!(config.storage.fsync_policy, FsyncPolicy::EveryN(10));
        assert!(config.auth.guest_grants.contains(&Action::Replication));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_errors() {
        let mut config = Config::default();
        config.instance.id = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ValidationError(_))
        ));

        let mut config = Config::default();
        config.replication.source = Some("nohost".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.replication.user = Some("repl".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.auth.users.push(UserConfig {
            name: "repl".to_string(),
            token_hash: "abc".to_string(),
            grants: vec![Action::Replication],
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_fsync_policy_parse() {
        assert_eq!(FsyncPolicy::parse("never"), Some(FsyncPolicy::Never));
        assert_eq!(FsyncPolicy::parse("EVERY_WRITE"), Some(FsyncPolicy::EveryWrite));
        assert_eq!(FsyncPolicy::parse("every_n:5"), Some(FsyncPolicy::EveryN(5)));
        assert_eq!(FsyncPolicy::parse("sometimes"), None);
    }

    #[test]
    fn test_load_secrets() {
        let hash = "a".repeat(64);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# users").unwrap();
        writeln!(file, "repl:{hash}:replication").unwrap();
        writeln!(file, "app:{hash}").unwrap();

        let mut auth = AuthConfig {
            secrets_file: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        auth.load_secrets().unwrap();
        assert_eq!(auth.users.len(), 2);
        assert_eq!(auth.users[0].grants, vec![Action::Replication]);
        assert_eq!(auth.users[1].grants, vec![Action::Read, Action::Write]);
        assert!(auth.validate().is_ok());
    }
}
