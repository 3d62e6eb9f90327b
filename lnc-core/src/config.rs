use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use bitcoin::Network;
use serde::{Deserialize, Serialize};

use crate::util::log_utils::parse_log_level_filter;
use crate::util::transaction_utils::{FEERATE_FLOOR_SATS_PER_KW, MIN_CHAN_DUST_LIMIT_SATOSHIS};

/// Channel parameters we offer and the limits we accept from peers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Relative delay, in blocks, we impose on the counterparty's to-self output
    pub to_self_delay: u16,
    /// Largest delay we accept on our own to-self output
    pub max_to_self_delay: u16,
    /// Confirmations we require on funding before the channel locks
    pub minimum_depth: u32,
    /// Largest confirmation requirement we accept from a peer
    pub max_minimum_depth: u32,
    /// Outputs below this are trimmed from our commitment transactions
    pub dust_limit_sat: u64,
    /// Channel reserve we ask the peer to keep, in thousandths of the capacity
    pub reserve_per_mille: u64,
    /// Smallest channel we open or accept
    pub min_funding_sat: u64,
    /// Largest channel we open or accept
    pub max_funding_sat: u64,
    /// Maximum channels still waiting for funding confirmation
    pub max_pending_channels: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        ChannelConfig {
            to_self_delay: 144,
            max_to_self_delay: 2016,
            minimum_depth: 3,
            max_minimum_depth: 144,
            dust_limit_sat: MIN_CHAN_DUST_LIMIT_SATOSHIS,
            reserve_per_mille: 10,
            min_funding_sat: 20_000,
            max_funding_sat: (1 << 24) - 1,
            max_pending_channels: 5,
        }
    }
}

/// How we estimate, bound and negotiate fee rates
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeePolicy {
    /// Confirmation target, in blocks, given to the fee estimator
    pub confirmation_target: u16,
    /// Used when the estimator has no answer
    pub fallback_feerate_per_kw: u32,
    /// Never propose or accept less than this
    pub min_feerate_per_kw: u32,
    /// A peer's proposal must be within this factor of our estimate
    pub max_feerate_ratio: u32,
    /// Relative drift from our estimate, in percent, that calls for an update
    pub update_threshold_percent: u32,
    /// Polls before giving up on a fee update settling
    pub convergence_max_attempts: u32,
    /// Counter-proposals before giving up on a cooperative close fee
    pub closing_max_rounds: u32,
}

impl Default for FeePolicy {
    fn default() -> Self {
        FeePolicy {
            confirmation_target: 6,
            fallback_feerate_per_kw: 2500,
            min_feerate_per_kw: FEERATE_FLOOR_SATS_PER_KW,
            max_feerate_ratio: 10,
            update_threshold_percent: 20,
            convergence_max_attempts: 10,
            closing_max_rounds: 8,
        }
    }
}

/// Node configuration, passed to [`crate::node::Node::new`]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// The chain channels live on
    pub network: Network,
    /// Channel parameters
    pub channel: ChannelConfig,
    /// Fee policy
    pub fees: FeePolicy,
    /// Interval between chain polls, in milliseconds
    pub poll_interval_ms: u64,
    /// Feature bits we announce in `init`
    #[serde(with = "hex::serde")]
    pub features: Vec<u8>,
    /// Log level name for embedders that set up logging from this file
    pub log_level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            network: Network::Regtest,
            channel: ChannelConfig::default(),
            fees: FeePolicy::default(),
            poll_interval_ms: 1000,
            features: Vec::new(),
            log_level: "INFO".to_string(),
        }
    }
}

impl NodeConfig {
    /// Parse a TOML document, missing fields take their defaults
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(s).context("invalid node config")?;
        config.validate()?;
        Ok(config)
    }

    /// Read a TOML config file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        Self::from_toml_str(&contents)
    }

    /// Reject settings that cannot work
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.channel.dust_limit_sat >= MIN_CHAN_DUST_LIMIT_SATOSHIS,
            "dust limit {} below {}",
            self.channel.dust_limit_sat,
            MIN_CHAN_DUST_LIMIT_SATOSHIS
        );
        anyhow::ensure!(
            self.channel.min_funding_sat <= self.channel.max_funding_sat,
            "min_funding_sat above max_funding_sat"
        );
        anyhow::ensure!(self.channel.to_self_delay > 0, "to_self_delay must be positive");
        anyhow::ensure!(self.fees.max_feerate_ratio >= 1, "max_feerate_ratio must be at least 1");
        anyhow::ensure!(self.poll_interval_ms > 0, "poll_interval_ms must be positive");
        parse_log_level_filter(&self.log_level)?;
        Ok(())
    }

    /// The poll interval as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// The configured log level
    pub fn log_level_filter(&self) -> log::LevelFilter {
        parse_log_level_filter(&self.log_level).unwrap_or(log::LevelFilter::Info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn defaults_are_valid_test() {
        NodeConfig::default().validate().unwrap();
    }

    #[test]
    fn partial_toml_test() {
        let config = NodeConfig::from_toml_str(
            r#"
            network = "testnet"
            poll_interval_ms = 50
            features = "0a08"
            log_level = "debug"

            [channel]
            minimum_depth = 6

            [fees]
            max_feerate_ratio = 4
            "#,
        )
        .unwrap();
        assert_eq!(config.network, Network::Testnet);
        assert_eq!(config.poll_interval(), Duration::from_millis(50));
        assert_eq!(config.features, vec![0x0a, 0x08]);
        assert_eq!(config.channel.minimum_depth, 6);
        assert_eq!(config.channel.to_self_delay, 144);
        assert_eq!(config.fees.max_feerate_ratio, 4);
        assert_eq!(config.fees.convergence_max_attempts, 10);
        assert_eq!(config.log_level_filter(), log::LevelFilter::Debug);
    }

    #[test]
    fn invalid_toml_test() {
        assert!(NodeConfig::from_toml_str("[channel]\ndust_limit_sat = 100\n").is_err());
        assert!(NodeConfig::from_toml_str("log_level = \"chatty\"\n").is_err());
        assert!(NodeConfig::from_toml_str("poll_interval_ms = \"soon\"\n").is_err());
    }
}
