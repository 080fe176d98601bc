//! Node configuration, loaded from TOML or JSON.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tollgate_limits::{AdmissionConfig, BucketConfig, QuotaDefinition, RetentionPolicy, RuleSpec, ThrottleConfig};
use tollgate_repl::ReplicatorConfig;
use tollgate_reputation::clock::{HOUR_MS, MINUTE_MS};
use tollgate_reputation::{DecayPolicy, TierPolicy};

/// Identity and listener of this node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeSection {
    /// Unique node id; stamped on every locally recorded event.
    pub node_id: String,
    /// Address of the replication listener; `None` runs without one.
    pub listen_addr: Option<String>,
    /// Sample CPU/memory from `/proc` to drive the auto-throttle.
    pub load_sampling: bool,
}

impl Default for NodeSection {
    fn default() -> Self {
        Self {
            node_id: "node-1".to_string(),
            listen_addr: Some("0.0.0.0:7400".to_string()),
            load_sampling: true,
        }
    }
}

/// Admission settings plus the bucket store they drive.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionSection {
    /// Failure policy, store wait, idempotency, strikes, credit, fallback.
    #[serde(flatten)]
    pub controller: AdmissionConfig,
    /// Bucket grace period and sliding-window blend.
    pub buckets: BucketConfig,
}

/// Reputation tiers and decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReputationSection {
    /// Tier thresholds and multipliers.
    pub tiers: TierPolicy,
    /// Decay interval and rate.
    pub decay: DecayPolicy,
    /// How often the decay job looks for due users.
    pub decay_check_interval_ms: u64,
}

impl Default for ReputationSection {
    fn default() -> Self {
        Self {
            tiers: TierPolicy::default(),
            decay: DecayPolicy::default(),
            decay_check_interval_ms: HOUR_MS,
        }
    }
}

/// A peer known at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Peer node id.
    pub node_id: String,
    /// Peer replication listener address.
    pub endpoint: String,
}

/// Replication settings and bootstrap peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationSection {
    /// Sync cadence, thresholds, timeouts, batching.
    #[serde(flatten)]
    pub sync: ReplicatorConfig,
    /// Peers registered on startup.
    pub peers: Vec<PeerConfig>,
    /// How often node views are checked for conflicts.
    pub conflict_check_interval_ms: u64,
}

impl Default for ReplicationSection {
    fn default() -> Self {
        Self {
            sync: ReplicatorConfig::default(),
            peers: Vec::new(),
            conflict_check_interval_ms: MINUTE_MS,
        }
    }
}

/// Retention windows and cleanup cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSection {
    /// How long each kind of record is kept.
    #[serde(flatten)]
    pub policy: RetentionPolicy,
    /// How often the bucket sweep runs.
    pub sweep_interval_ms: u64,
    /// How often the retention cleanup runs.
    pub cleanup_interval_ms: u64,
}

impl Default for RetentionSection {
    fn default() -> Self {
        Self {
            policy: RetentionPolicy::default(),
            sweep_interval_ms: MINUTE_MS,
            cleanup_interval_ms: HOUR_MS,
        }
    }
}

/// Log output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Filter used when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            json: false,
            level: "info".to_string(),
        }
    }
}

/// Complete node configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Identity and listener.
    pub node: NodeSection,
    /// Admission and buckets.
    pub admission: AdmissionSection,
    /// Reputation.
    pub reputation: ReputationSection,
    /// Auto-throttle.
    pub throttle: ThrottleConfig,
    /// Replication.
    pub replication: ReplicationSection,
    /// Retention.
    pub retention: RetentionSection,
    /// Rules created on startup.
    pub rules: Vec<RuleSpec>,
    /// Quotas defined on startup.
    pub quotas: Vec<QuotaDefinition>,
    /// Logging.
    pub logging: LoggingConfig,
}

impl NodeConfig {
    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load `path`, or fall back to defaults when it does not exist.
    ///
    /// Returns whether the file was found.
    pub fn load_or_default(path: &Path) -> anyhow::Result<(Self, bool)> {
        if path.exists() {
            Ok((Self::from_file(path)?, true))
        } else {
            Ok((Self::default(), false))
        }
    }

    /// Reject values that cannot work.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.node_id.trim().is_empty() {
            anyhow::bail!("node.node_id must not be empty");
        }
        self.reputation
            .tiers
            .validate()
            .map_err(|e| anyhow::anyhow!("reputation.tiers: {}", e))?;
        self.reputation.decay.validate()?;
        self.throttle
            .validate()
            .map_err(|e| anyhow::anyhow!("throttle: {}", e))?;
        self.replication
            .sync
            .validate()
            .map_err(|e| anyhow::anyhow!("replication: {}", e))?;
        let mut seen = HashSet::new();
        for peer in &self.replication.peers {
            if peer.node_id == self.node.node_id {
                anyhow::bail!("replication.peers lists this node ({})", peer.node_id);
            }
            if !seen.insert(peer.node_id.as_str()) {
                anyhow::bail!("replication.peers lists {} twice", peer.node_id);
            }
        }
        for interval in [
            self.reputation.decay_check_interval_ms,
            self.replication.conflict_check_interval_ms,
            self.retention.sweep_interval_ms,
            self.retention.cleanup_interval_ms,
            self.throttle.sample_interval_ms,
        ] {
            if interval == 0 {
                anyhow::bail!("job intervals must be positive");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;
    use tollgate_limits::{FailurePolicy, LimitType, QuotaPeriod, Scope};

    #[test]
    fn test_default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.node.node_id, "node-1");
        assert_eq!(config.admission.controller.failure_policy, FailurePolicy::Closed);
        assert_eq!(config.replication.sync.failure_threshold, 3);
        assert!(config.replication.peers.is_empty());
        assert!(config.rules.is_empty());
        assert!(!config.logging.json);
        config.validate().unwrap();
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
[node]
node_id = "edge-7"
listen_addr = "127.0.0.1:7401"

[admission]
failure_policy = "open"
store_wait_ms = 20

[admission.buckets]
sliding_blend = true

[replication]
sync_frequency_ms = 2000
failure_threshold = 5

[[replication.peers]]
node_id = "edge-8"
endpoint = "10.0.0.8:7400"

[[rules]]
system = "api"
scope = "ip"
limit_type = "per_minute"
limit_value = 5

[[quotas]]
system = "api"
scope = "user"
period = "daily"
limit = 1000

[logging]
json = true
            "#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.node_id, "edge-7");
        assert_eq!(config.admission.controller.failure_policy, FailurePolicy::Open);
        assert_eq!(config.admission.controller.store_wait_ms, 20);
        assert!(config.admission.buckets.sliding_blend);
        assert_eq!(config.replication.sync.sync_frequency_ms, 2000);
        assert_eq!(config.replication.sync.failure_threshold, 5);
        assert_eq!(config.replication.sync.batch_size, ReplicatorConfig::default().batch_size);
        assert_eq!(config.replication.peers[0].endpoint, "10.0.0.8:7400");
        assert_eq!(config.rules[0].scope, Scope::Ip);
        assert_eq!(config.rules[0].limit_type, LimitType::PerMinute);
        assert!(config.rules[0].enabled);
        assert_eq!(config.quotas[0].period, QuotaPeriod::Daily);
        assert!(config.logging.json);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(
            file,
            r#"{{
                "node": {{ "node_id": "edge-9", "listen_addr": null }},
                "throttle": {{ "critical_multiplier": 0.25 }}
            }}"#
        )
        .unwrap();

        let config = NodeConfig::from_file(file.path()).unwrap();
        assert_eq!(config.node.node_id, "edge-9");
        assert!(config.node.listen_addr.is_none());
        assert!((config.throttle.critical_multiplier - 0.25).abs() < 1e-9);
        assert!((config.throttle.high_multiplier - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        assert!(NodeConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let (config, found) = NodeConfig::load_or_default(&dir.path().join("absent.toml")).unwrap();
        assert!(!found);
        assert_eq!(config, NodeConfig::default());
    }

    #[test]
    fn test_rejects_self_as_peer() {
        let mut config = NodeConfig::default();
        config.replication.peers.push(PeerConfig {
            node_id: "node-1".into(),
            endpoint: "x:1".into(),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_peer() {
        let mut config = NodeConfig::default();
        for _ in 0..2 {
            config.replication.peers.push(PeerConfig {
                node_id: "node-2".into(),
                endpoint: "x:1".into(),
            });
        }
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_decay_rate() {
        let mut config = NodeConfig::default();
        config.reputation.decay.rate = 1.5;
        assert!(config.validate().is_err());
    }
}
