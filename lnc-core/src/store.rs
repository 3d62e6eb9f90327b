use std::sync::Arc;

use bitcoin::secp256k1::{All, Secp256k1};
use bitcoin::{OutPoint, Transaction, Txid};
use serde::Serialize;
use tracing::*;

use crate::chain::ChainSource;
use crate::channel::{Channel, ChannelId, ChannelStatus, PeerIdentity};
use crate::config::FeePolicy;
use crate::error::{Error, Result};
use crate::fee::{estimate_feerate, feerate_drift_exceeds};
use crate::keys::KeysManager;
use crate::persist::ChannelPersist;

/// A read-only view of a channel, taken from its last persisted record
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ChannelSnapshot {
    pub id: ChannelId,
    pub peer: PeerIdentity,
    pub status: ChannelStatus,
    /// We funded the channel
    pub is_outbound: bool,
    pub channel_value_sat: u64,
    pub funding_outpoint: OutPoint,
    pub minimum_depth: u32,
    /// Our off-chain balance
    pub local_balance_sat: u64,
    /// The counterparty's off-chain balance
    pub remote_balance_sat: u64,
    /// What we can still send
    pub spendable_sat: u64,
    pub feerate_per_kw: u32,
    /// Number of our current commitment
    pub commitment_number: u64,
    /// Txid of our current commitment
    pub commitment_txid: Txid,
    /// Delay on our to-local output
    pub to_self_delay: u16,
}

impl From<&Channel> for ChannelSnapshot {
    fn from(channel: &Channel) -> Self {
        let current = channel.current_holder();
        ChannelSnapshot {
            id: channel.id,
            peer: channel.peer.clone(),
            status: channel.status.clone(),
            is_outbound: channel.setup.is_outbound,
            channel_value_sat: channel.setup.channel_value_sat,
            funding_outpoint: channel.setup.funding_outpoint,
            minimum_depth: channel.setup.minimum_depth,
            local_balance_sat: current.to_holder_sat,
            remote_balance_sat: current.to_counterparty_sat,
            spendable_sat: channel.spendable_sat(),
            feerate_per_kw: current.feerate_per_kw,
            commitment_number: current.number,
            commitment_txid: current.txid,
            to_self_delay: channel.setup.counterparty_selected_contest_delay,
        }
    }
}

/// Load and save channels, and project them into snapshots
#[derive(Clone)]
pub struct ChannelStore {
    persister: Arc<dyn ChannelPersist>,
    secp_ctx: Secp256k1<All>,
}

impl ChannelStore {
    /// Wrap a persister
    pub fn new(persister: Arc<dyn ChannelPersist>) -> Self {
        ChannelStore { persister, secp_ctx: Secp256k1::new() }
    }

    /// Load a channel, failing if unknown
    pub fn load(&self, id: &ChannelId) -> Result<Channel> {
        self.persister.get_channel(id)?.ok_or_else(|| {
            debug!("channel {} not found", id);
            Error::ChannelNotFound(*id)
        })
    }

    /// Whether a channel is stored
    pub fn contains(&self, id: &ChannelId) -> Result<bool> {
        Ok(self.persister.get_channel(id)?.is_some())
    }

    /// Write a channel
    pub fn save(&self, channel: &Channel) -> Result<()> {
        trace!("saving channel {} status {}", channel.id, channel.status.name());
        self.persister.put_channel(channel)?;
        Ok(())
    }

    /// Snapshot of one channel
    pub fn channel_info(&self, id: &ChannelId) -> Result<ChannelSnapshot> {
        Ok(ChannelSnapshot::from(&self.load(id)?))
    }

    /// Snapshots of every stored channel
    pub fn list_channels(&self) -> Result<Vec<ChannelSnapshot>> {
        let channels = self.persister.list_channels()?;
        Ok(channels.iter().map(ChannelSnapshot::from).collect())
    }

    /// A fresh fee estimate, if the channel's fee rate has drifted from it
    /// by more than the policy threshold
    pub async fn fee_update_required(
        &self,
        id: &ChannelId,
        chain: &dyn ChainSource,
        policy: &FeePolicy,
    ) -> Result<Option<u32>> {
        let channel = self.load(id)?;
        if channel.status != ChannelStatus::Active {
            return Ok(None);
        }
        let current = channel.current_holder().feerate_per_kw;
        let estimate = estimate_feerate(chain, policy).await;
        if feerate_drift_exceeds(current, estimate, policy.update_threshold_percent) {
            info!("channel {} feerate {} drifted from estimate {}", id, current, estimate);
            Ok(Some(estimate))
        } else {
            Ok(None)
        }
    }

    /// Our current commitment, fully signed
    pub fn get_commitment_tx(&self, id: &ChannelId, keys: &KeysManager) -> Result<Transaction> {
        let channel = self.load(id)?;
        let number = channel.current_holder().number;
        self.signed_commitment(&channel, keys, number)
    }

    /// One of our recorded commitments, fully signed, including superseded
    /// ones
    pub fn get_commitment_tx_at(
        &self,
        id: &ChannelId,
        keys: &KeysManager,
        number: u64,
    ) -> Result<Transaction> {
        let channel = self.load(id)?;
        self.signed_commitment(&channel, keys, number)
    }

    fn signed_commitment(
        &self,
        channel: &Channel,
        keys: &KeysManager,
        number: u64,
    ) -> Result<Transaction> {
        let record = channel.holder_commitment(number).ok_or_else(|| {
            Error::Policy(format!("no commitment {} for channel {}", number, channel.id))
        })?;
        let channel_keys = keys.channel_keys(&channel.keys_id)?;
        channel.signed_holder_commitment(&self.secp_ctx, &channel_keys, record)
    }
}
