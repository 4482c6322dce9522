//! Configuration for gossipd

use crate::engine::EngineConfig;
use crate::registry::BackoffPolicy;
use clap::Parser;
use gossip_store_net::messages::MessageLimits;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// gossipd - signed record store kept in sync by gossip
#[derive(Parser, Debug, Clone)]
#[command(name = "gossipd")]
#[command(about = "Signed content-addressed record store with gossip sync")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, env = "GOSSIPD_LISTEN", default_value = "0.0.0.0:9100")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, env = "GOSSIPD_DATA_DIR", default_value = "./data/gossipd")]
    pub data_dir: PathBuf,

    /// Seed peers (comma-separated addresses)
    #[arg(long, env = "GOSSIPD_PEERS", value_delimiter = ',')]
    pub peers: Vec<SocketAddr>,

    /// Address other peers reach us at; never gossiped with
    #[arg(long, env = "GOSSIPD_ADVERTISE")]
    pub advertise: Option<SocketAddr>,

    /// Seconds between scheduler ticks
    #[arg(long, default_value = "30")]
    pub gossip_interval_secs: u64,

    /// Concurrent gossip sessions
    #[arg(long, default_value = "4")]
    pub max_sessions: usize,

    /// Deadline for a whole round, in seconds
    #[arg(long, default_value = "60")]
    pub round_deadline_secs: u64,

    /// Backoff after the first failure, in milliseconds
    #[arg(long, default_value = "1000")]
    pub base_backoff_ms: u64,

    /// Backoff ceiling, in seconds
    #[arg(long, default_value = "60")]
    pub max_backoff_secs: u64,

    /// Consecutive failures before a peer is quarantined
    #[arg(long, default_value = "10")]
    pub quarantine_threshold: u32,

    /// Strikes before a peer is quarantined
    #[arg(long, default_value = "5")]
    pub strike_threshold: u32,

    /// Hashes per fetch request
    #[arg(long, default_value = "64")]
    pub fetch_batch_size: usize,

    /// Hashes per inventory summary
    #[arg(long, default_value = "4096")]
    pub max_inventory_hashes: usize,

    /// Successful rounds between full inventory resyncs (0 = never)
    #[arg(long, default_value = "100")]
    pub full_resync_rounds: u64,

    /// Files to sign and store at startup
    #[arg(long)]
    pub publish: Vec<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_sessions == 0 {
            anyhow::bail!("max_sessions must be at least 1");
        }
        if self.fetch_batch_size == 0 {
            anyhow::bail!("fetch_batch_size must be at least 1");
        }
        if self.max_inventory_hashes == 0 {
            anyhow::bail!("max_inventory_hashes must be at least 1");
        }
        if self.max_inventory_hashes > MessageLimits::default().max_hashes {
            anyhow::bail!(
                "max_inventory_hashes exceeds the wire limit of {}",
                MessageLimits::default().max_hashes
            );
        }
        if self.gossip_interval_secs == 0 || self.round_deadline_secs == 0 {
            anyhow::bail!("Intervals and deadlines must be non-zero");
        }
        if Duration::from_millis(self.base_backoff_ms) > Duration::from_secs(self.max_backoff_secs)
        {
            anyhow::bail!("base_backoff_ms exceeds max_backoff_secs");
        }
        if !matches!(self.log_format.as_str(), "json" | "pretty") {
            anyhow::bail!("Unknown log format: {}", self.log_format);
        }
        if self.advertise.is_some_and(|a| self.peers.contains(&a)) {
            anyhow::bail!("Own advertised address is listed as a peer");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            gossip_interval: Duration::from_secs(self.gossip_interval_secs),
            max_sessions: self.max_sessions,
            round_deadline: Duration::from_secs(self.round_deadline_secs),
            fetch_batch_size: self.fetch_batch_size,
            max_inventory_hashes: self.max_inventory_hashes,
            full_resync_rounds: self.full_resync_rounds,
        }
    }

    pub fn backoff_policy(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(self.base_backoff_ms),
            max: Duration::from_secs(self.max_backoff_secs),
            quarantine_threshold: self.quarantine_threshold,
            strike_threshold: self.strike_threshold,
        }
    }

    pub fn message_limits(&self) -> MessageLimits {
        MessageLimits::default()
    }

    /// Address used to keep ourselves out of the peer set
    pub fn self_address(&self) -> SocketAddr {
        self.advertise.unwrap_or(self.listen)
    }
}

/// Persisted node state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeState {
    /// Identity seed (deterministic recovery)
    pub identity_seed: [u8; 32],
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn test_config() -> Config {
        Config::parse_from(["gossipd", "--listen", "127.0.0.1:0"])
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = test_config();
        config.validate().unwrap();

        let policy = config.backoff_policy();
        assert_eq!(policy.base, Duration::from_secs(1));
        assert_eq!(policy.max, Duration::from_secs(60));
        assert_eq!(config.engine_config().max_sessions, 4);
    }

    #[test]
    fn test_peer_list() {
        let config = Config::parse_from([
            "gossipd",
            "--peers",
            "10.0.0.1:9100,10.0.0.2:9100",
            "--advertise",
            "10.0.0.3:9100",
        ]);
        assert_eq!(config.peers.len(), 2);
        assert_eq!(config.self_address(), "10.0.0.3:9100".parse().unwrap());
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut config = test_config();
        config.max_sessions = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.fetch_batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.base_backoff_ms = 120_000;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.log_format = "xml".into();
        assert!(config.validate().is_err());
    }
}
