//! Node configuration loaded from a JSON file.
//!
//! Every field has a default, so `{}` (or no file at all) is a valid
//! single-node configuration with rebalancing disabled.
//!
//! | Key                                  | Default          |
//! |--------------------------------------|------------------|
//! | `server.listen_addr`                 | `0.0.0.0:8000`   |
//! | `server.health_addr`                 | `0.0.0.0:8002`   |
//! | `server.gossip_addr`                 | `0.0.0.0:8003`   |
//! | `server.advertise_addr`              | `listen_addr`    |
//! | `server.grace_period_seconds`        | `60`             |
//! | `cluster.node_id` / `node_id_prefix` | random           |
//! | `cluster.join`                       | `[]`             |
//! | `cluster.join_timeout_seconds`       | `60`             |
//! | `cluster.abort_if_join_fails`        | `true`           |
//! | `cluster.gossip.interval_ms`         | `100`            |
//! | `cluster.gossip.max_packet_size`     | `1400`           |
//! | `cluster.rebalance.threshold`        | `0` (disabled)   |
//! | `cluster.rebalance.shed_rate`        | `0.005`          |
//! | `cluster.rebalance.min_conns`        | `100`            |
//! | `cluster.rebalance.tick_ms`          | `1000`           |
//! | `cluster.rebalance.staleness_ms`     | `max(3 × gossip interval, 1s)` |
//! | `cluster.rebalance.suppress_when_stale` | `true`        |
//! | `upstream.max_connections`           | `0` (unlimited)  |
//! | `log.level`                          | `info`           |
//! | `log.subsystems`                     | `[]`             |

use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::{JoinAttempt, NodeId};
use crate::rebalance::RebalanceConfig;

/// Environment variable naming the config file when no argument is given.
pub const CONFIG_ENV: &str = "BURROW_CONFIG";

const LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Configuration errors. Validation failures read `section: reason`.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("{section}: {reason}")]
    Invalid {
        section: &'static str,
        reason: String,
    },
}

fn invalid(section: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        section,
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Proxy listener; served by the proxy front end, not by this crate.
    pub listen_addr: String,
    /// Health and status endpoints.
    pub health_addr: String,
    pub gossip_addr: String,
    /// Address other nodes use to reach this one. Defaults to `listen_addr`.
    pub advertise_addr: Option<String>,
    pub grace_period_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8000".to_string(),
            health_addr: "0.0.0.0:8002".to_string(),
            gossip_addr: "0.0.0.0:8003".to_string(),
            advertise_addr: None,
            grace_period_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GossipConfig {
    pub interval_ms: u64,
    pub max_packet_size: usize,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            interval_ms: 100,
            max_packet_size: 1400,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceSection {
    pub threshold: f64,
    pub shed_rate: f64,
    pub min_conns: usize,
    pub tick_ms: u64,
    /// Unset means `max(3 × gossip interval, 1s)`.
    pub staleness_ms: Option<u64>,
    pub suppress_when_stale: bool,
}

impl Default for RebalanceSection {
    fn default() -> Self {
        let defaults = RebalanceConfig::default();
        Self {
            threshold: defaults.threshold,
            shed_rate: defaults.shed_rate,
            min_conns: defaults.min_conns,
            tick_ms: defaults.tick.as_millis() as u64,
            staleness_ms: None,
            suppress_when_stale: defaults.suppress_when_stale,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub node_id: Option<String>,
    pub node_id_prefix: Option<String>,
    /// `host:port` of existing members.
    pub join: Vec<String>,
    pub join_timeout_seconds: u64,
    pub abort_if_join_fails: bool,
    pub gossip: GossipConfig,
    pub rebalance: RebalanceSection,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            node_id_prefix: None,
            join: Vec::new(),
            join_timeout_seconds: 60,
            abort_if_join_fails: true,
            gossip: GossipConfig::default(),
            rebalance: RebalanceSection::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Per-node connection ceiling; 0 means unlimited.
    pub max_connections: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Subsystems logged at debug regardless of `level`.
    pub subsystems: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            subsystems: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub cluster: ClusterConfig,
    pub upstream: UpstreamConfig,
    pub log: LogConfig,
}

impl Config {
    /// Loads the config file at `path`, or the defaults when `None`.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Checks every section, returning the first problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_server()?;
        self.validate_cluster()?;
        self.validate_log()?;
        Ok(())
    }

    fn validate_server(&self) -> Result<(), ConfigError> {
        let server = &self.server;
        for (name, value) in [
            ("listen addr", &server.listen_addr),
            ("gossip addr", &server.gossip_addr),
            ("health addr", &server.health_addr),
        ] {
            if value.is_empty() {
                return Err(invalid("server", format!("missing {}", name)));
            }
            if value.parse::<SocketAddr>().is_err() {
                return Err(invalid("server", format!("invalid {}: {}", name, value)));
            }
        }
        if matches!(&server.advertise_addr, Some(addr) if addr.is_empty()) {
            return Err(invalid("server", "empty advertise addr"));
        }
        Ok(())
    }

    fn validate_cluster(&self) -> Result<(), ConfigError> {
        let cluster = &self.cluster;
        if cluster.node_id.is_some() && cluster.node_id_prefix.is_some() {
            return Err(invalid("cluster", "node_id and node_id_prefix are mutually exclusive"));
        }
        if !cluster.join.is_empty() && cluster.join_timeout_seconds == 0 {
            return Err(invalid("cluster", "missing join timeout"));
        }
        if cluster.gossip.interval_ms == 0 {
            return Err(invalid("cluster", "gossip interval must be positive"));
        }
        if cluster.gossip.max_packet_size == 0 {
            return Err(invalid("cluster", "gossip max packet size must be positive"));
        }

        let rebalance = &cluster.rebalance;
        if !rebalance.threshold.is_finite() || rebalance.threshold < 0.0 {
            return Err(invalid(
                "cluster",
                format!("rebalance threshold must be >= 0, got {}", rebalance.threshold),
            ));
        }
        if !(0.0..=1.0).contains(&rebalance.shed_rate) {
            return Err(invalid(
                "cluster",
                format!("rebalance shed rate must be within [0, 1], got {}", rebalance.shed_rate),
            ));
        }
        if rebalance.tick_ms == 0 {
            return Err(invalid("cluster", "rebalance tick must be positive"));
        }
        if rebalance.staleness_ms == Some(0) {
            return Err(invalid("cluster", "rebalance staleness must be positive"));
        }
        Ok(())
    }

    fn validate_log(&self) -> Result<(), ConfigError> {
        if self.log.level.is_empty() {
            return Err(invalid("log", "missing level"));
        }
        if !LOG_LEVELS.contains(&self.log.level.as_str()) {
            return Err(invalid("log", format!("unknown level: {}", self.log.level)));
        }
        Ok(())
    }

    pub fn node_id(&self) -> NodeId {
        NodeId::from_config(
            self.cluster.node_id.as_deref(),
            self.cluster.node_id_prefix.as_deref(),
        )
    }

    pub fn advertise_addr(&self) -> &str {
        self.server
            .advertise_addr
            .as_deref()
            .unwrap_or(&self.server.listen_addr)
    }

    pub fn gossip_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.gossip.interval_ms)
    }

    /// Age after which a directory entry stops counting.
    pub fn staleness(&self) -> Duration {
        match self.cluster.rebalance.staleness_ms {
            Some(ms) => Duration::from_millis(ms),
            None => (self.gossip_interval() * 3).max(Duration::from_secs(1)),
        }
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.server.grace_period_seconds)
    }

    pub fn max_connections(&self) -> Option<usize> {
        match self.upstream.max_connections {
            0 => None,
            n => Some(n),
        }
    }

    pub fn rebalance(&self) -> RebalanceConfig {
        let section = &self.cluster.rebalance;
        RebalanceConfig {
            threshold: section.threshold,
            shed_rate: section.shed_rate,
            min_conns: section.min_conns,
            tick: Duration::from_millis(section.tick_ms),
            suppress_when_stale: section.suppress_when_stale,
        }
    }

    pub fn join_attempt(&self) -> JoinAttempt {
        JoinAttempt {
            targets: self.cluster.join.clone(),
            timeout: Duration::from_secs(self.cluster.join_timeout_seconds),
            abort_on_failure: self.cluster.abort_if_join_fails,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(json: &str) -> Config {
        serde_json::from_str(json).unwrap()
    }

    fn reason(config: &Config) -> String {
        config.validate().unwrap_err().to_string()
    }

    // ========== Defaults ==========

    #[test]
    fn test_empty_object_is_valid_defaults() {
        let config = parse("{}");
        assert_eq!(config, Config::default());
        config.validate().unwrap();

        assert_eq!(config.cluster.rebalance.threshold, 0.0);
        assert_eq!(config.cluster.rebalance.shed_rate, 0.005);
        assert_eq!(config.cluster.rebalance.min_conns, 100);
        assert_eq!(config.cluster.join_timeout_seconds, 60);
        assert!(config.cluster.abort_if_join_fails);
        assert_eq!(config.grace_period(), Duration::from_secs(60));
        assert_eq!(config.max_connections(), None);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = parse(r#"{"cluster": {"rebalance": {"threshold": 0.2}}}"#);
        assert_eq!(config.cluster.rebalance.threshold, 0.2);
        assert_eq!(config.cluster.rebalance.shed_rate, 0.005);
        assert_eq!(config.cluster.gossip.interval_ms, 100);
    }

    #[test]
    fn test_advertise_addr_defaults_to_listen_addr() {
        let config = parse(r#"{"server": {"listen_addr": "10.0.0.5:9000"}}"#);
        assert_eq!(config.advertise_addr(), "10.0.0.5:9000");

        let config = parse(r#"{"server": {"advertise_addr": "proxy-1.internal:9000"}}"#);
        assert_eq!(config.advertise_addr(), "proxy-1.internal:9000");
    }

    #[test]
    fn test_staleness_derived_from_gossip_interval() {
        assert_eq!(parse("{}").staleness(), Duration::from_secs(1));

        let config = parse(r#"{"cluster": {"gossip": {"interval_ms": 500}}}"#);
        assert_eq!(config.staleness(), Duration::from_millis(1500));

        let config = parse(r#"{"cluster": {"rebalance": {"staleness_ms": 250}}}"#);
        assert_eq!(config.staleness(), Duration::from_millis(250));
    }

    #[test]
    fn test_max_connections_zero_is_unlimited() {
        assert_eq!(parse(r#"{"upstream": {"max_connections": 0}}"#).max_connections(), None);
        assert_eq!(
            parse(r#"{"upstream": {"max_connections": 5000}}"#).max_connections(),
            Some(5000)
        );
    }

    #[test]
    fn test_rebalance_and_join_conversion() {
        let config = parse(
            r#"{"cluster": {
                "join": ["10.0.0.1:8003", "10.0.0.2:8003"],
                "join_timeout_seconds": 10,
                "abort_if_join_fails": false,
                "rebalance": {"threshold": 0.2, "shed_rate": 0.1, "min_conns": 50, "tick_ms": 250}
            }}"#,
        );

        let rebalance = config.rebalance();
        assert_eq!(rebalance.threshold, 0.2);
        assert_eq!(rebalance.shed_rate, 0.1);
        assert_eq!(rebalance.min_conns, 50);
        assert_eq!(rebalance.tick, Duration::from_millis(250));

        let attempt = config.join_attempt();
        assert_eq!(attempt.targets.len(), 2);
        assert_eq!(attempt.timeout, Duration::from_secs(10));
        assert!(!attempt.abort_on_failure);
    }

    #[test]
    fn test_node_id_from_config() {
        let config = parse(r#"{"cluster": {"node_id": "proxy-a"}}"#);
        assert_eq!(config.node_id().as_str(), "proxy-a");

        let config = parse(r#"{"cluster": {"node_id_prefix": "eu"}}"#);
        assert!(config.node_id().as_str().starts_with("eu-"));
    }

    // ========== Validation ==========

    #[test]
    fn test_validate_rejects_negative_threshold() {
        let config = parse(r#"{"cluster": {"rebalance": {"threshold": -0.1}}}"#);
        assert!(reason(&config).starts_with("cluster: rebalance threshold"));
    }

    #[test]
    fn test_validate_rejects_non_finite_threshold() {
        let mut config = Config::default();
        config.cluster.rebalance.threshold = f64::NAN;
        assert!(config.validate().is_err());
        config.cluster.rebalance.threshold = f64::INFINITY;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_shed_rate_bounds() {
        for rate in [0.0, 0.5, 1.0] {
            let mut config = Config::default();
            config.cluster.rebalance.shed_rate = rate;
            assert!(config.validate().is_ok(), "rate {}", rate);
        }
        for rate in [-0.01, 1.01] {
            let mut config = Config::default();
            config.cluster.rebalance.shed_rate = rate;
            assert!(reason(&config).contains("shed rate"), "rate {}", rate);
        }
    }

    #[test]
    fn test_validate_rejects_bad_addresses() {
        let config = parse(r#"{"server": {"listen_addr": ""}}"#);
        assert_eq!(reason(&config), "server: missing listen addr");

        let config = parse(r#"{"server": {"gossip_addr": "not-an-addr"}}"#);
        assert_eq!(reason(&config), "server: invalid gossip addr: not-an-addr");
    }

    #[test]
    fn test_validate_rejects_both_node_id_forms() {
        let config = parse(r#"{"cluster": {"node_id": "a", "node_id_prefix": "b"}}"#);
        assert!(reason(&config).contains("mutually exclusive"));
    }

    #[test]
    fn test_validate_join_timeout_only_with_targets() {
        let config = parse(r#"{"cluster": {"join_timeout_seconds": 0}}"#);
        assert!(config.validate().is_ok());

        let config = parse(r#"{"cluster": {"join": ["a:1"], "join_timeout_seconds": 0}}"#);
        assert_eq!(reason(&config), "cluster: missing join timeout");
    }

    #[test]
    fn test_validate_zero_intervals() {
        let config = parse(r#"{"cluster": {"gossip": {"interval_ms": 0}}}"#);
        assert!(reason(&config).contains("gossip interval"));
        let config = parse(r#"{"cluster": {"rebalance": {"tick_ms": 0}}}"#);
        assert!(reason(&config).contains("tick"));
    }

    #[test]
    fn test_validate_log_level() {
        let config = parse(r#"{"log": {"level": "verbose"}}"#);
        assert_eq!(reason(&config), "log: unknown level: verbose");
        let config = parse(r#"{"log": {"level": ""}}"#);
        assert_eq!(reason(&config), "log: missing level");
    }

    // ========== Loading ==========

    #[test]
    fn test_load_none_is_default() {
        assert_eq!(Config::load(None).unwrap(), Config::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"cluster": {{"node_id": "file-node"}}, "log": {{"subsystems": ["rebalance"]}}}}"#
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.cluster.node_id.as_deref(), Some("file-node"));
        assert_eq!(config.log.subsystems, vec!["rebalance".to_string()]);
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load(Some(&dir.path().join("absent.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_malformed_json() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        let err = Config::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_unknown_fields_are_ignored() {
        let config = parse(r#"{"proxy": {"timeout_seconds": 5}}"#);
        assert!(config.validate().is_ok());
    }
}
