use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::Path;
use std::time::Duration;

use crate::detector::Thresholds;
use crate::detector::monitor::DEFAULT_SWEEP_INTERVAL;
use crate::membership::types::ServerId;
use crate::network::reliable::DeliveryPolicy;
use crate::replication::ReplicationSettings;

/// Per-process configuration of an HQ server, loaded from JSON.
///
/// Every section falls back to its defaults, so an empty `{}` is a valid file.
/// Durations are milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationConfig {
    pub server_id: u32,
    /// Interface the session listener binds to.
    pub bind_host: String,
    /// Session port; `0` lets the OS pick one.
    pub tcp_port: u16,
    /// Host peers should use to reach this server (sent in `JOIN`).
    pub advertise_host: String,
    pub tokens: TokenConfig,
    pub discovery: DiscoveryConfig,
    pub registry: RegistryConfig,
    pub replication: ReplicationConfig,
    pub delivery: DeliveryConfig,
    pub detector: DetectorConfig,
    /// Statically configured peers; pinned and never expired.
    pub peers: Vec<PeerConfig>,
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            server_id: 1,
            bind_host: "0.0.0.0".to_string(),
            tcp_port: 5000,
            advertise_host: "127.0.0.1".to_string(),
            tokens: TokenConfig::default(),
            discovery: DiscoveryConfig::default(),
            registry: RegistryConfig::default(),
            replication: ReplicationConfig::default(),
            delivery: DeliveryConfig::default(),
            detector: DetectorConfig::default(),
            peers: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenConfig {
    /// Shared secret of field-node clients.
    pub client: String,
    /// Shared secret of HQ peers.
    pub peer: String,
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            client: "GRID_SEC_2025".to_string(),
            peer: "SERVER_2025".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    pub enabled: bool,
    pub group: Ipv4Addr,
    pub port: u16,
    pub interval_ms: u64,
    pub ttl: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: Ipv4Addr::new(239, 0, 0, 1),
            port: 4446,
            interval_ms: 5_000,
            ttl: 2,
        }
    }
}

impl DiscoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub sweep_interval_ms: u64,
    pub expiry_ms: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 5_000,
            expiry_ms: 7_000,
        }
    }
}

impl RegistryConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn expiry(&self) -> Duration {
        Duration::from_millis(self.expiry_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub reply_timeout_ms: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_ms: 2_000,
            connect_timeout_ms: 5_000,
            reply_timeout_ms: 3_000,
        }
    }
}

impl ReplicationConfig {
    pub fn settings(&self) -> ReplicationSettings {
        ReplicationSettings {
            attempts: self.attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            reply_timeout: Duration::from_millis(self.reply_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub attempts: u32,
    pub retry_delay_ms: u64,
    pub ack_timeout_ms: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            retry_delay_ms: 1_000,
            ack_timeout_ms: 3_000,
        }
    }
}

impl DeliveryConfig {
    pub fn policy(&self) -> DeliveryPolicy {
        DeliveryPolicy {
            attempts: self.attempts,
            retry_delay: Duration::from_millis(self.retry_delay_ms),
            ack_timeout: Duration::from_millis(self.ack_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    pub interval_ms: u64,
    pub suspect_after_ms: u64,
    pub offline_after_ms: u64,
    pub recovered_grace_ms: u64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        let thresholds = Thresholds::default();
        Self {
            interval_ms: DEFAULT_SWEEP_INTERVAL.as_millis() as u64,
            suspect_after_ms: thresholds.suspect_after_ms,
            offline_after_ms: thresholds.offline_after_ms,
            recovered_grace_ms: thresholds.recovered_grace_ms,
        }
    }
}

impl DetectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            suspect_after_ms: self.suspect_after_ms,
            offline_after_ms: self.offline_after_ms,
            recovered_grace_ms: self.recovered_grace_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerConfig {
    pub id: u32,
    pub host: String,
    pub port: u16,
}

impl PeerConfig {
    /// Parses the `--peer` form `<id>@<host>:<port>`.
    pub fn parse(raw: &str) -> Result<Self> {
        let (id, address) = raw
            .split_once('@')
            .with_context(|| format!("peer '{}' is not <id>@<host>:<port>", raw))?;
        let (host, port) = address
            .rsplit_once(':')
            .with_context(|| format!("peer '{}' has no port", raw))?;

        Ok(Self {
            id: id.trim().parse().with_context(|| format!("invalid peer id in '{}'", raw))?,
            host: host.trim().to_string(),
            port: port
                .trim()
                .parse()
                .with_context(|| format!("invalid peer port in '{}'", raw))?,
        })
    }
}

impl CoordinationConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn server_id(&self) -> ServerId {
        ServerId(self.server_id)
    }

    pub fn validate(&self) -> Result<()> {
        let detector = &self.detector;
        if detector.suspect_after_ms == 0 || detector.interval_ms == 0 {
            bail!("detector interval and suspect threshold must be positive");
        }
        if detector.offline_after_ms <= detector.suspect_after_ms {
            bail!(
                "detector offline threshold ({}ms) must exceed the suspect threshold ({}ms)",
                detector.offline_after_ms,
                detector.suspect_after_ms
            );
        }
        if self.registry.expiry_ms == 0 || self.registry.sweep_interval_ms == 0 {
            bail!("registry expiry and sweep interval must be positive");
        }
        if self.discovery.interval_ms == 0 {
            bail!("discovery interval must be positive");
        }
        if self.discovery.enabled && self.discovery.interval_ms >= self.registry.expiry_ms {
            bail!(
                "discovery interval ({}ms) must be shorter than the peer expiry ({}ms)",
                self.discovery.interval_ms,
                self.registry.expiry_ms
            );
        }
        if self.replication.attempts == 0 || self.delivery.attempts == 0 {
            bail!("retry attempts must be at least 1");
        }
        if self.replication.retry_delay_ms == 0 || self.delivery.retry_delay_ms == 0 {
            bail!("retry delays must be positive");
        }
        if self.tokens.client.is_empty() || self.tokens.peer.is_empty() {
            bail!("client and peer tokens must be set");
        }
        if self.tokens.client == self.tokens.peer {
            bail!("client and peer tokens must differ");
        }
        if let Some(peer) = self.peers.iter().find(|peer| peer.id == self.server_id) {
            bail!("peer list contains this server's own id {}", peer.id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinationConfig::default();

        assert!(config.validate().is_ok());
        assert_eq!(config.discovery.group, Ipv4Addr::new(239, 0, 0, 1));
        assert_eq!(config.registry.expiry(), Duration::from_secs(7));
        assert_eq!(config.detector.thresholds().offline_after_ms, 30_000);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: CoordinationConfig =
            serde_json::from_str(r#"{"server_id": 3, "detector": {"interval_ms": 500}}"#).unwrap();

        assert_eq!(config.server_id(), ServerId(3));
        assert_eq!(config.detector.interval(), Duration::from_millis(500));
        assert_eq!(config.detector.suspect_after_ms, 15_000);
        assert_eq!(config.tokens.peer, "SERVER_2025");
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut config = CoordinationConfig::default();
        config.detector.offline_after_ms = 10_000;

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        let mut config = CoordinationConfig::default();
        config.discovery.interval_ms = 0;
        assert!(config.validate().is_err());

        // Still rejected when discovery is switched off.
        config.discovery.enabled = false;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.replication.retry_delay_ms = 0;
        assert!(config.validate().is_err());

        let mut config = CoordinationConfig::default();
        config.delivery.retry_delay_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_self_in_peer_list_rejected() {
        let mut config = CoordinationConfig::default();
        config.peers.push(PeerConfig {
            id: 1,
            host: "127.0.0.1".to_string(),
            port: 5001,
        });

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_peer_argument_parsing() {
        assert_eq!(
            PeerConfig::parse("2@10.0.0.2:5002").unwrap(),
            PeerConfig {
                id: 2,
                host: "10.0.0.2".to_string(),
                port: 5002,
            }
        );
        assert!(PeerConfig::parse("10.0.0.2:5002").is_err());
        assert!(PeerConfig::parse("x@10.0.0.2:5002").is_err());
    }
}
