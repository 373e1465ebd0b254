//! Nominee Configuration
//!
//! Configuration structures for electors and observers. Configuration can be
//! read from a TOML file, from `NOMINEE_*` environment variables, or both
//! (environment wins). Validation is eager: a node that cannot name its
//! cluster or reach a backend must not start.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Path of a TOML file loaded before environment overrides
pub const ENV_CONF_FILE: &str = "NOMINEE_CONF_FILE";
/// Cluster name
pub const ENV_CLUSTER_NAME: &str = "NOMINEE_CLUSTER_NAME";
/// Domain name
pub const ENV_DOMAIN_NAME: &str = "NOMINEE_DOMAIN_NAME";
/// Comma separated backend endpoints
pub const ENV_ETCD_ENDPOINTS: &str = "NOMINEE_ETCD_ENDPOINTS";
/// Backend username
pub const ENV_ETCD_USERNAME: &str = "NOMINEE_ETCD_USERNAME";
/// Backend password
pub const ENV_ETCD_PASSWORD: &str = "NOMINEE_ETCD_PASSWORD";
/// Log format (text, json)
pub const ENV_LOGS_FORMAT: &str = "NOMINEE_OBS_LOGS_FORMAT";

/// Root of every election identifier
const ELECTION_ROOT: &str = "nominee";

/// Main Nominee configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NomineeConfig {
    /// Which election this process takes part in
    #[serde(default)]
    pub election: ElectionConfig,

    /// Coordination backend connection
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session-loss reconnect policy
    #[serde(default)]
    pub reconnect: ReconnectConfig,

    /// Observer publish settings
    #[serde(default)]
    pub observer: ObserverConfig,

    /// Process lifecycle settings
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Election identity
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Domain name (e.g. the managed service: postgres, haproxy)
    #[serde(default)]
    pub domain: String,

    /// Cluster name
    #[serde(default)]
    pub cluster: String,
}

/// Coordination backend configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// Backend endpoints (host:port)
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Optional username
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password
    #[serde(default)]
    pub password: Option<String>,

    /// Session TTL in seconds
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,
}

/// Reconnect policy applied when the coordination session is lost
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Attempts before giving up (0 = retry forever)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

/// Observer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserverConfig {
    /// How often the publish loop checks for pending membership changes
    #[serde(default = "default_publish_interval_ms")]
    pub publish_interval_ms: u64,
}

/// Lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Install SIGINT/SIGTERM handling when a component starts
    #[serde(default = "default_true")]
    pub handle_signals: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (text, pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_session_ttl_secs() -> u64 {
    1
}

fn default_initial_backoff_ms() -> u64 {
    250
}

fn default_max_backoff_ms() -> u64 {
    5000
}

fn default_max_retries() -> u32 {
    10
}

fn default_publish_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            username: None,
            password: None,
            session_ttl_secs: default_session_ttl_secs(),
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            publish_interval_ms: default_publish_interval_ms(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            handle_signals: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl BackendConfig {
    /// Endpoints joined for display and error messages
    pub fn endpoints_display(&self) -> String {
        self.endpoints.join(",")
    }

    /// Session TTL as Duration
    pub fn session_ttl(&self) -> Duration {
        Duration::from_secs(self.session_ttl_secs)
    }
}

impl ReconnectConfig {
    /// First backoff delay as Duration
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    /// Backoff cap as Duration
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

impl ObserverConfig {
    /// Publish interval as Duration
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}

impl NomineeConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = Self::parse_file(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: NomineeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    ///
    /// If `NOMINEE_CONF_FILE` is set the file is read first, then every
    /// non-empty `NOMINEE_*` variable overrides the matching field.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match non_empty(&lookup, ENV_CONF_FILE) {
            Some(path) => Self::parse_file(Path::new(&path))?,
            None => Self::default(),
        };

        if let Some(cluster) = non_empty(&lookup, ENV_CLUSTER_NAME) {
            config.election.cluster = cluster;
        }
        if let Some(domain) = non_empty(&lookup, ENV_DOMAIN_NAME) {
            config.election.domain = domain;
        }
        if let Some(endpoints) = non_empty(&lookup, ENV_ETCD_ENDPOINTS) {
            config.backend.endpoints = endpoints
                .split(',')
                .map(|e| e.trim().to_string())
                .filter(|e| !e.is_empty())
                .collect();
        }
        if let Some(username) = non_empty(&lookup, ENV_ETCD_USERNAME) {
            config.backend.username = Some(username);
        }
        if let Some(password) = non_empty(&lookup, ENV_ETCD_PASSWORD) {
            config.backend.password = Some(password);
        }
        if let Some(format) = non_empty(&lookup, ENV_LOGS_FORMAT) {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }

    fn parse_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.election.cluster.trim().is_empty() {
            return Err(Error::Config(format!(
                "election.cluster cannot be empty (set {})",
                ENV_CLUSTER_NAME
            )));
        }

        if self.election.domain.trim().is_empty() {
            return Err(Error::Config(format!(
                "election.domain cannot be empty (set {})",
                ENV_DOMAIN_NAME
            )));
        }

        if self.backend.endpoints.iter().all(|e| e.trim().is_empty()) {
            return Err(Error::Config(format!(
                "backend.endpoints cannot be empty (set {})",
                ENV_ETCD_ENDPOINTS
            )));
        }

        if self.backend.password.is_some() && self.backend.username.is_none() {
            return Err(Error::Config(
                "backend.password is set but backend.username is not".into(),
            ));
        }

        if self.backend.session_ttl_secs == 0 {
            return Err(Error::Config("backend.session_ttl_secs must be positive".into()));
        }

        if self.reconnect.initial_backoff_ms == 0
            || self.reconnect.initial_backoff_ms > self.reconnect.max_backoff_ms
        {
            return Err(Error::Config(
                "reconnect.initial_backoff_ms must be positive and not above max_backoff_ms".into(),
            ));
        }

        if self.observer.publish_interval_ms == 0 {
            return Err(Error::Config("observer.publish_interval_ms must be positive".into()));
        }

        match self.logging.format.as_str() {
            "text" | "pretty" | "json" => {}
            other => {
                return Err(Error::Config(format!("unknown log format: {}", other)));
            }
        }

        Ok(())
    }

    /// Election identifier shared by every participant of this domain/cluster
    pub fn election_key(&self) -> String {
        election_key(&self.election.domain, &self.election.cluster)
    }

    /// Copy of this configuration safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.backend.password.is_some() {
            config.backend.password = Some("********".to_string());
        }
        config
    }
}

/// Build the election identifier for a domain and cluster
pub fn election_key(domain: &str, cluster: &str) -> String {
    format!("{}/domain/{}/cluster/{}", ELECTION_ROOT, domain, cluster)
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key).filter(|v| !v.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[election]
domain = "postgres"
cluster = "billing"

[backend]
endpoints = ["etcd-1:2379", "etcd-2:2379"]
username = "nominee"
password = "secret"

[observer]
publish_interval_ms = 250
"#;

        let config = NomineeConfig::from_str(toml).unwrap();
        assert_eq!(config.election.cluster, "billing");
        assert_eq!(config.backend.endpoints.len(), 2);
        assert_eq!(config.backend.session_ttl_secs, 1);
        assert_eq!(config.observer.publish_interval(), Duration::from_millis(250));
        assert_eq!(config.reconnect.max_retries, 10);
        assert!(config.lifecycle.handle_signals);
        assert_eq!(config.election_key(), "nominee/domain/postgres/cluster/billing");
    }

    #[test]
    fn test_election_key_format() {
        assert_eq!(
            election_key("haproxy", "edge"),
            "nominee/domain/haproxy/cluster/edge"
        );
    }

    #[test]
    fn test_from_env_variables() {
        let lookup = lookup_from(&[
            (ENV_CLUSTER_NAME, "orders"),
            (ENV_DOMAIN_NAME, "postgres"),
            (ENV_ETCD_ENDPOINTS, "10.0.0.1:2379, 10.0.0.2:2379,"),
            (ENV_LOGS_FORMAT, "json"),
        ]);

        let config = NomineeConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.election.cluster, "orders");
        assert_eq!(
            config.backend.endpoints,
            vec!["10.0.0.1:2379".to_string(), "10.0.0.2:2379".to_string()]
        );
        assert_eq!(config.logging.format, "json");
        assert!(config.backend.username.is_none());
    }

    #[test]
    fn test_missing_cluster_names_variable() {
        let lookup = lookup_from(&[
            (ENV_DOMAIN_NAME, "postgres"),
            (ENV_ETCD_ENDPOINTS, "10.0.0.1:2379"),
        ]);

        let err = NomineeConfig::from_lookup(lookup).unwrap_err();
        assert!(err.to_string().contains(ENV_CLUSTER_NAME));
    }

    #[test]
    fn test_missing_endpoints() {
        let lookup = lookup_from(&[
            (ENV_CLUSTER_NAME, "orders"),
            (ENV_DOMAIN_NAME, "postgres"),
            (ENV_ETCD_ENDPOINTS, " , "),
        ]);

        let err = NomineeConfig::from_lookup(lookup).unwrap_err();
        assert!(err.to_string().contains(ENV_ETCD_ENDPOINTS));
    }

    #[test]
    fn test_password_requires_username() {
        let lookup = lookup_from(&[
            (ENV_CLUSTER_NAME, "orders"),
            (ENV_DOMAIN_NAME, "postgres"),
            (ENV_ETCD_ENDPOINTS, "10.0.0.1:2379"),
            (ENV_ETCD_PASSWORD, "secret"),
        ]);

        assert!(NomineeConfig::from_lookup(lookup).is_err());
    }

    #[test]
    fn test_unknown_log_format() {
        let lookup = lookup_from(&[
            (ENV_CLUSTER_NAME, "orders"),
            (ENV_DOMAIN_NAME, "postgres"),
            (ENV_ETCD_ENDPOINTS, "10.0.0.1:2379"),
            (ENV_LOGS_FORMAT, "xml"),
        ]);

        let err = NomineeConfig::from_lookup(lookup).unwrap_err();
        assert!(err.to_string().contains("xml"));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[election]
domain = "haproxy"
cluster = "edge"

[backend]
endpoints = ["file-etcd:2379"]
session_ttl_secs = 5
"#
        )
        .unwrap();

        let path = file.path().to_string_lossy().to_string();
        let lookup = lookup_from(&[(ENV_CONF_FILE, path.as_str()), (ENV_CLUSTER_NAME, "edge-2")]);

        let config = NomineeConfig::from_lookup(lookup).unwrap();
        assert_eq!(config.election.domain, "haproxy");
        assert_eq!(config.election.cluster, "edge-2");
        assert_eq!(config.backend.endpoints, vec!["file-etcd:2379".to_string()]);
        assert_eq!(config.backend.session_ttl(), Duration::from_secs(5));
    }

    #[test]
    fn test_redacted_hides_password() {
        let mut config = NomineeConfig::default();
        config.backend.username = Some("nominee".into());
        config.backend.password = Some("secret".into());
        let redacted = config.redacted();
        assert_eq!(redacted.backend.password.as_deref(), Some("********"));
        assert_eq!(config.backend.password.as_deref(), Some("secret"));
    }
}
