//! Configuration loading and types for leaderwatch.
//!
//! Configuration is read from a YAML file and deserialized into the
//! [`Config`] struct.  Each subsection governs a different part of the
//! system: networking, cluster identity, leader fault detection, logging,
//! and metrics.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// HTTP server settings.
    #[serde(default)]
    pub server: ServerConfig,

    /// Cluster identity and static peer list.
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Leader fault detection settings.
    #[serde(default)]
    pub fault_detection: FaultDetectionConfig,

    /// Logging settings.
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Observability settings.
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

/// HTTP listener configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Graceful shutdown timeout in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
        }
    }
}

/// Cluster identity configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    /// Cluster name sent with every ping.
    #[serde(default = "default_cluster_name")]
    pub name: String,

    /// This node's unique identifier.
    #[serde(default = "default_node_id")]
    pub node_id: String,

    /// Identifier of the elected leader.  Leader election is external; the
    /// value here is what this node believes.
    #[serde(default)]
    pub leader_id: Option<String>,

    /// Static list of cluster members, including this node.
    #[serde(default)]
    pub peers: Vec<PeerConfig>,

    /// Timeout for handshake and reconnect requests, in milliseconds.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Delay between peer handshake rounds, in milliseconds.
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            name: default_cluster_name(),
            node_id: default_node_id(),
            leader_id: None,
            peers: Vec::new(),
            connect_timeout_ms: default_connect_timeout_ms(),
            discovery_interval_ms: default_discovery_interval_ms(),
        }
    }
}

impl ClusterConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }
}

/// A statically configured cluster member.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    /// Node identifier.
    pub id: String,
    /// Base URL of the node's HTTP listener, e.g. `http://10.0.0.2:9301`.
    pub address: String,
}

/// Leader fault detection settings.
///
/// Total detection latency after the leader goes silent is bounded by
/// `ping_retries * ping_timeout`; `ping_interval` only spaces out
/// successful pings.
#[derive(Debug, Clone, Deserialize)]
pub struct FaultDetectionConfig {
    /// Delay between successful pings, and before the first ping of a session.
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    /// Deadline for a single ping attempt.
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,

    /// Consecutive failed attempts before the leader is declared failed.
    #[serde(default = "default_ping_retries")]
    pub ping_retries: u32,

    /// Reconnect to the leader on transport disconnect before failing it.
    #[serde(default)]
    pub connect_on_network_disconnect: bool,

    /// Subscribe to the transport's disconnect notifications.
    #[serde(default = "default_true")]
    pub register_connection_listener: bool,
}

impl Default for FaultDetectionConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            ping_timeout_ms: default_ping_timeout_ms(),
            ping_retries: default_ping_retries(),
            connect_on_network_disconnect: false,
            register_connection_listener: true,
        }
    }
}

impl FaultDetectionConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: text or json.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Observability settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

impl Config {
    /// Check cross-field constraints serde cannot express.
    pub fn validate(&self) -> anyhow::Result<()> {
        anyhow::ensure!(
            self.fault_detection.ping_retries >= 1,
            "fault_detection.ping_retries must be at least 1"
        );
        anyhow::ensure!(
            self.fault_detection.ping_interval_ms > 0,
            "fault_detection.ping_interval_ms must be greater than 0"
        );
        anyhow::ensure!(
            self.fault_detection.ping_timeout_ms > 0,
            "fault_detection.ping_timeout_ms must be greater than 0"
        );
        anyhow::ensure!(
            self.cluster.discovery_interval_ms > 0,
            "cluster.discovery_interval_ms must be greater than 0"
        );
        anyhow::ensure!(
            !self.cluster.node_id.is_empty(),
            "cluster.node_id must not be empty"
        );
        if let Some(leader_id) = &self.cluster.leader_id {
            anyhow::ensure!(
                self.cluster.peers.iter().any(|p| &p.id == leader_id),
                "cluster.leader_id [{leader_id}] is not listed in cluster.peers"
            );
        }
        Ok(())
    }

    /// Address other nodes reach this node on.
    ///
    /// Uses this node's entry in `cluster.peers` when present, otherwise the
    /// bind address.
    pub fn advertise_address(&self) -> String {
        self.cluster
            .peers
            .iter()
            .find(|p| p.id == self.cluster.node_id)
            .map(|p| p.address.clone())
            .unwrap_or_else(|| format!("http://{}:{}", self.server.host, self.server.port))
    }
}

// -- Defaults ----------------------------------------------------------------

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    9301
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_cluster_name() -> String {
    "leaderwatch".to_string()
}

fn default_node_id() -> String {
    "node-1".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_discovery_interval_ms() -> u64 {
    5_000
}

fn default_ping_interval_ms() -> u64 {
    1_000
}

fn default_ping_timeout_ms() -> u64 {
    30_000
}

fn default_ping_retries() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

// -- Loader ------------------------------------------------------------------

/// Load and parse configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    let config: Config = serde_yaml::from_str(&contents)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config: Config = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.server.port, 9301);
        assert_eq!(config.cluster.name, "leaderwatch");
        assert_eq!(config.cluster.discovery_interval(), Duration::from_secs(5));
        assert_eq!(config.fault_detection.ping_interval(), Duration::from_secs(1));
        assert_eq!(config.fault_detection.ping_timeout(), Duration::from_secs(30));
        assert_eq!(config.fault_detection.ping_retries, 3);
        assert!(!config.fault_detection.connect_on_network_disconnect);
        assert!(config.fault_detection.register_connection_listener);
        assert!(config.observability.metrics);
    }

    #[test]
    fn test_load_config_from_file() {
        let yaml = r#"
cluster:
  name: prod
  node_id: node-2
  leader_id: node-1
  peers:
    - id: node-1
      address: http://10.0.0.1:9301
    - id: node-2
      address: http://10.0.0.2:9301
fault_detection:
  ping_interval_ms: 500
  ping_timeout_ms: 2000
  ping_retries: 5
  connect_on_network_disconnect: true
logging:
  format: json
"#;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(yaml.as_bytes()).unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.cluster.name, "prod");
        assert_eq!(config.cluster.leader_id.as_deref(), Some("node-1"));
        assert_eq!(config.cluster.peers.len(), 2);
        assert_eq!(config.fault_detection.ping_retries, 5);
        assert!(config.fault_detection.connect_on_network_disconnect);
        assert_eq!(config.logging.format, "json");
        assert_eq!(config.advertise_address(), "http://10.0.0.2:9301");
        config.validate().unwrap();
    }

    #[test]
    fn test_load_config_missing_file() {
        assert!(load_config("/nonexistent/leaderwatch.yaml").is_err());
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let mut config = Config::default();
        config.fault_detection.ping_retries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut config = Config::default();
        config.fault_detection.ping_interval_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ping_interval_ms"));
    }

    #[test]
    fn test_validate_rejects_unknown_leader() {
        let mut config = Config::default();
        config.cluster.leader_id = Some("ghost".to_string());
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn test_advertise_address_falls_back_to_bind_address() {
        let config = Config::default();
        assert_eq!(config.advertise_address(), "http://0.0.0.0:9301");
    }
}
