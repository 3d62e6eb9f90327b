use bitcoin::blockdata::constants::ChainHash;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{OutPoint, Transaction, Txid};
use lnc_protocol::msgs::{
    AcceptChannel, ChannelReady, ErrorMessage, FundingCreated, FundingSigned, OpenChannel,
};
use tracing::*;

use super::{check_channel_id, expect_message, Node};
use crate::channel::{
    Channel, ChannelId, ChannelSetup, ChannelStatus, CommitmentState, CommitmentValues,
    CounterpartyCommitmentRecord, HolderCommitmentRecord,
};
use crate::error::{internal_error, policy_error, protocol_error, Error, Result};
use crate::fee::{check_feerate_bounds, estimate_feerate};
use crate::keys::{ChannelKeys, ChannelPoints, KeysId};
use crate::peer::PeerConnection;
use crate::store::ChannelSnapshot;
use crate::tx::p2wsh_script;
use crate::util::transaction_utils::{commitment_fee_sat, MIN_CHAN_DUST_LIMIT_SATOSHIS};

/// Error data understood by peers as "too many pending channels"
const ERROR_TOO_MANY_PENDING: u8 = 1;
/// Error data understood by peers as "channel capacity too large"
const ERROR_CAPACITY_TOO_LARGE: u8 = 3;

/// Fee rates for opening a channel.  Unset rates come from the chain's
/// estimate.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FundingFees {
    /// Fee rate of the funding transaction
    pub funding_feerate_per_kw: Option<u32>,
    /// Initial fee rate of the commitment transactions
    pub commitment_feerate_per_kw: Option<u32>,
}

/// A channel whose funding transaction is signed by both sides but not
/// broadcast yet
pub struct PendingChannel<'a> {
    node: &'a Node,
    channel: Channel,
    funding_tx: Transaction,
}

impl<'a> PendingChannel<'a> {
    /// The channel's final id
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }

    /// The funding transaction that [`PendingChannel::accept`] broadcasts
    pub fn funding_tx(&self) -> &Transaction {
        &self.funding_tx
    }

    /// Persist the channel and broadcast the funding transaction
    pub async fn accept(mut self) -> Result<ChannelId> {
        let id = self.channel.id;
        let _guard = self.node.lock_channel(&id).await;
        self.channel.funding_tx = Some(self.funding_tx.clone());
        self.node.store.save(&self.channel)?;
        let txid = self.node.chain.broadcast_transaction(&self.funding_tx).await?;
        info!("channel {} funding {} broadcast", id, txid);
        Ok(id)
    }
}

fn chain_hash(node: &Node) -> [u8; 32] {
    ChainHash::using_genesis_block(node.config.network).to_bytes()
}

fn reserve_for(node: &Node, funding_sat: u64) -> u64 {
    let reserve = funding_sat * node.config.channel.reserve_per_mille / 1000;
    reserve.max(node.config.channel.dust_limit_sat)
}

fn points_of(
    funding_pubkey: PublicKey,
    revocation_basepoint: PublicKey,
    payment_point: PublicKey,
    delayed_payment_basepoint: PublicKey,
) -> ChannelPoints {
    ChannelPoints { funding_pubkey, revocation_basepoint, payment_point, delayed_payment_basepoint }
}

/// Send an `error` for a refused channel proposal, then fail
async fn refuse_channel(
    conn: PeerConnection,
    temporary_channel_id: [u8; 32],
    data: Vec<u8>,
    reason: String,
) -> Result<(PeerConnection, ChannelId, ChannelSnapshot)> {
    warn!("refusing channel {}: {}", hex::encode(temporary_channel_id), reason);
    conn.send(ErrorMessage { channel_id: temporary_channel_id, data }).await?;
    Err(Error::Policy(reason))
}

impl Node {
    fn count_pending_inbound(&self) -> Result<usize> {
        let pending = self
            .store
            .list_channels()?
            .into_iter()
            .filter(|c| {
                !c.is_outbound
                    && matches!(c.status, ChannelStatus::FundingBroadcastButNotLocked { .. })
            })
            .count();
        Ok(pending)
    }

    fn initial_state(
        &self,
        setup: &ChannelSetup,
        keys: &ChannelKeys,
        values: CommitmentValues,
        counterparty_sig: bitcoin::secp256k1::ecdsa::Signature,
        counterparty_first_point: PublicKey,
    ) -> Result<CommitmentState> {
        let holder_points = keys.points(&self.secp_ctx);
        let holder_tx = setup.build_holder_commitment(&self.secp_ctx, keys, 0, &values)?;
        setup.verify_counterparty_funding_sig(
            &self.secp_ctx,
            &holder_points,
            &holder_tx.tx,
            &counterparty_sig,
            "initial commitment",
        )?;
        let counterparty_tx = setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            0,
            &counterparty_first_point,
            &values,
        );
        Ok(CommitmentState {
            holder_current: HolderCommitmentRecord {
                number: 0,
                to_holder_sat: values.to_holder_sat,
                to_counterparty_sat: values.to_counterparty_sat,
                feerate_per_kw: values.feerate_per_kw,
                counterparty_sig,
                txid: holder_tx.tx.compute_txid(),
            },
            holder_previous: Vec::new(),
            counterparty_commitment_number: 0,
            counterparty_point: counterparty_first_point,
            counterparty_next_point: None,
            counterparty_commitments: vec![CounterpartyCommitmentRecord {
                number: 0,
                txid: counterparty_tx.tx.compute_txid(),
            }],
            revealed_secrets: Vec::new(),
            pending_update: None,
        })
    }

    /// Propose a channel funded with `funding_sat` from our wallet.
    ///
    /// The funding transaction is built and signed, and the peer's
    /// signature over our first commitment checked.  Nothing is persisted
    /// or broadcast until [`PendingChannel::accept`].
    #[instrument(skip(self, conn, password))]
    pub async fn open_channel(
        &self,
        conn: PeerConnection,
        funding_sat: u64,
        fees: FundingFees,
        password: &str,
    ) -> Result<(PeerConnection, PendingChannel<'_>)> {
        let config = &self.config.channel;
        if funding_sat < config.min_funding_sat || funding_sat > config.max_funding_sat {
            return Err(policy_error(format!(
                "funding {} outside [{}, {}]",
                funding_sat, config.min_funding_sat, config.max_funding_sat
            )));
        }
        let estimate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
        let commitment_feerate = fees.commitment_feerate_per_kw.unwrap_or(estimate);
        let funding_feerate = fees.funding_feerate_per_kw.unwrap_or(estimate);

        let keys_id = KeysId::random();
        let keys = self.keys.channel_keys(&keys_id)?;
        let holder_points = keys.points(&self.secp_ctx);
        let temporary_channel_id = ChannelId::temporary();
        let counterparty_reserve = reserve_for(self, funding_sat);

        let open = OpenChannel {
            chain_hash: chain_hash(self),
            temporary_channel_id: temporary_channel_id.0,
            funding_satoshis: funding_sat,
            dust_limit_satoshis: config.dust_limit_sat,
            channel_reserve_satoshis: counterparty_reserve,
            feerate_per_kw: commitment_feerate,
            to_self_delay: config.to_self_delay,
            funding_pubkey: holder_points.funding_pubkey,
            revocation_basepoint: holder_points.revocation_basepoint,
            payment_basepoint: holder_points.payment_point,
            delayed_payment_basepoint: holder_points.delayed_payment_basepoint,
            first_per_commitment_point: keys.per_commitment_point(&self.secp_ctx, 0)?,
        };
        let conn = conn.send(open).await?;

        let (conn, accept) = expect_message!(conn, AcceptChannel);
        check_channel_id(&temporary_channel_id, &accept.temporary_channel_id)?;
        if accept.minimum_depth > config.max_minimum_depth {
            return Err(policy_error(format!("minimum depth {} too large", accept.minimum_depth)));
        }
        if accept.to_self_delay > config.max_to_self_delay {
            return Err(policy_error(format!("to_self_delay {} too large", accept.to_self_delay)));
        }
        if accept.dust_limit_satoshis < MIN_CHAN_DUST_LIMIT_SATOSHIS {
            return Err(protocol_error(format!("dust limit {} too low", accept.dust_limit_satoshis)));
        }
        let holder_reserve = accept.channel_reserve_satoshis;
        match holder_reserve.checked_add(commitment_fee_sat(commitment_feerate)) {
            Some(locked) if locked < funding_sat => {}
            _ => return Err(policy_error(format!("reserve {} leaves nothing to spend", holder_reserve))),
        }

        let funding_script = p2wsh_script(&lightning::ln::chan_utils::make_funding_redeemscript(
            &holder_points.funding_pubkey,
            &accept.funding_pubkey,
        ));
        let funding_tx = self
            .wallet
            .fund_channel(funding_script.clone(), funding_sat, funding_feerate, password)
            .await?;
        let vout = funding_tx
            .output
            .iter()
            .position(|o| o.script_pubkey == funding_script && o.value.to_sat() == funding_sat)
            .ok_or_else(|| internal_error("wallet transaction does not pay the funding output"))?;
        let funding_outpoint = OutPoint { txid: funding_tx.compute_txid(), vout: vout as u32 };
        let id = ChannelId::from_funding_outpoint(&funding_outpoint);

        let setup = ChannelSetup {
            is_outbound: true,
            channel_value_sat: funding_sat,
            funding_outpoint,
            minimum_depth: accept.minimum_depth,
            holder_selected_contest_delay: config.to_self_delay,
            counterparty_selected_contest_delay: accept.to_self_delay,
            holder_dust_limit_sat: config.dust_limit_sat,
            counterparty_dust_limit_sat: accept.dust_limit_satoshis,
            holder_reserve_sat: holder_reserve,
            counterparty_reserve_sat: counterparty_reserve,
            counterparty_points: points_of(
                accept.funding_pubkey,
                accept.revocation_basepoint,
                accept.payment_basepoint,
                accept.delayed_payment_basepoint,
            ),
            holder_shutdown_script: None,
            counterparty_shutdown_script: None,
        };
        let values = CommitmentValues {
            to_holder_sat: funding_sat,
            to_counterparty_sat: 0,
            feerate_per_kw: commitment_feerate,
        };
        let counterparty_tx = setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            0,
            &accept.first_per_commitment_point,
            &values,
        );
        let signature = setup.sign_funding_spend(&self.secp_ctx, &keys, &counterparty_tx.tx)?;
        let created = FundingCreated {
            temporary_channel_id: temporary_channel_id.0,
            funding_txid: funding_outpoint.txid.to_byte_array(),
            funding_output_index: vout as u16,
            signature,
        };
        let conn = conn.send(created).await?;

        let (conn, signed) = expect_message!(conn, FundingSigned);
        check_channel_id(&id, &signed.channel_id)?;
        let commitments = self.initial_state(
            &setup,
            &keys,
            values,
            signed.signature,
            accept.first_per_commitment_point,
        )?;
        let channel = Channel {
            id,
            peer: conn.peer().clone(),
            keys_id,
            setup,
            status: ChannelStatus::FundingBroadcastButNotLocked {
                funding_txid: funding_outpoint.txid,
                remaining_confirmations: accept.minimum_depth,
            },
            commitments,
            funding_tx: None,
        };
        info!("channel {} negotiated with {}", id, channel.peer.node_id);
        Ok((conn, PendingChannel { node: self, channel, funding_tx }))
    }

    /// Wait for a channel proposal from the peer and take part as fundee.
    ///
    /// The channel is persisted before we hand over our signature of the
    /// funder's first commitment.
    #[instrument(skip(self, conn))]
    pub async fn accept_channel(
        &self,
        conn: PeerConnection,
    ) -> Result<(PeerConnection, ChannelId, ChannelSnapshot)> {
        let config = &self.config.channel;
        let (conn, open) = expect_message!(conn, OpenChannel);
        let temp_id = open.temporary_channel_id;

        if open.chain_hash != chain_hash(self) {
            return refuse_channel(conn, temp_id, b"unknown chain".to_vec(), "chain hash mismatch".into())
                .await;
        }
        if open.funding_satoshis > config.max_funding_sat {
            let reason = format!("funding {} above {}", open.funding_satoshis, config.max_funding_sat);
            return refuse_channel(conn, temp_id, vec![ERROR_CAPACITY_TOO_LARGE], reason).await;
        }
        if open.funding_satoshis < config.min_funding_sat {
            let reason = format!("funding {} below {}", open.funding_satoshis, config.min_funding_sat);
            return refuse_channel(conn, temp_id, reason.as_bytes().to_vec(), reason).await;
        }
        if self.count_pending_inbound()? >= config.max_pending_channels {
            let reason = "too many pending channels".to_string();
            return refuse_channel(conn, temp_id, vec![ERROR_TOO_MANY_PENDING], reason).await;
        }
        let estimate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
        if let Err(reason) = check_feerate_bounds(open.feerate_per_kw, estimate, &self.config.fees) {
            return refuse_channel(conn, temp_id, reason.as_bytes().to_vec(), reason).await;
        }
        if open.to_self_delay > config.max_to_self_delay {
            let reason = format!("to_self_delay {} too large", open.to_self_delay);
            return refuse_channel(conn, temp_id, reason.as_bytes().to_vec(), reason).await;
        }
        if open.dust_limit_satoshis < MIN_CHAN_DUST_LIMIT_SATOSHIS {
            let reason = format!("dust limit {} too low", open.dust_limit_satoshis);
            return refuse_channel(conn, temp_id, reason.as_bytes().to_vec(), reason).await;
        }
        if open.channel_reserve_satoshis >= open.funding_satoshis {
            let reason = format!("reserve {} exceeds funding", open.channel_reserve_satoshis);
            return refuse_channel(conn, temp_id, reason.as_bytes().to_vec(), reason).await;
        }

        let keys_id = KeysId::random();
        let keys = self.keys.channel_keys(&keys_id)?;
        let holder_points = keys.points(&self.secp_ctx);
        let counterparty_reserve = reserve_for(self, open.funding_satoshis);
        let accept = AcceptChannel {
            temporary_channel_id: temp_id,
            dust_limit_satoshis: config.dust_limit_sat,
            channel_reserve_satoshis: counterparty_reserve,
            minimum_depth: config.minimum_depth,
            to_self_delay: config.to_self_delay,
            funding_pubkey: holder_points.funding_pubkey,
            revocation_basepoint: holder_points.revocation_basepoint,
            payment_basepoint: holder_points.payment_point,
            delayed_payment_basepoint: holder_points.delayed_payment_basepoint,
            first_per_commitment_point: keys.per_commitment_point(&self.secp_ctx, 0)?,
        };
        let conn = conn.send(accept).await?;

        let (conn, created) = expect_message!(conn, FundingCreated);
        if created.temporary_channel_id != temp_id {
            return Err(protocol_error("funding_created for another channel"));
        }
        let funding_outpoint = OutPoint {
            txid: Txid::from_byte_array(created.funding_txid),
            vout: created.funding_output_index as u32,
        };
        let id = ChannelId::from_funding_outpoint(&funding_outpoint);
        if self.store.contains(&id)? {
            return Err(protocol_error(format!("channel {} already exists", id)));
        }
        let setup = ChannelSetup {
            is_outbound: false,
            channel_value_sat: open.funding_satoshis,
            funding_outpoint,
            minimum_depth: config.minimum_depth,
            holder_selected_contest_delay: config.to_self_delay,
            counterparty_selected_contest_delay: open.to_self_delay,
            holder_dust_limit_sat: config.dust_limit_sat,
            counterparty_dust_limit_sat: open.dust_limit_satoshis,
            holder_reserve_sat: open.channel_reserve_satoshis,
            counterparty_reserve_sat: counterparty_reserve,
            counterparty_points: points_of(
                open.funding_pubkey,
                open.revocation_basepoint,
                open.payment_basepoint,
                open.delayed_payment_basepoint,
            ),
            holder_shutdown_script: None,
            counterparty_shutdown_script: None,
        };
        let values = CommitmentValues {
            to_holder_sat: 0,
            to_counterparty_sat: open.funding_satoshis,
            feerate_per_kw: open.feerate_per_kw,
        };
        let commitments = self.initial_state(
            &setup,
            &keys,
            values,
            created.signature,
            open.first_per_commitment_point,
        )?;
        let counterparty_tx = setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            0,
            &open.first_per_commitment_point,
            &values,
        );
        let signature = setup.sign_funding_spend(&self.secp_ctx, &keys, &counterparty_tx.tx)?;
        let channel = Channel {
            id,
            peer: conn.peer().clone(),
            keys_id,
            setup,
            status: ChannelStatus::FundingBroadcastButNotLocked {
                funding_txid: funding_outpoint.txid,
                remaining_confirmations: config.minimum_depth,
            },
            commitments,
            funding_tx: None,
        };
        {
            let _guard = self.lock_channel(&id).await;
            self.store.save(&channel)?;
        }
        let conn = conn.send(FundingSigned { channel_id: id.0, signature }).await?;
        info!("accepted channel {} from {}", id, channel.peer.node_id);
        Ok((conn, id, ChannelSnapshot::from(&channel)))
    }

    /// Exchange `channel_ready` and activate the channel.
    ///
    /// Fails with [`Error::FundingNotLocked`], changing nothing, while the
    /// funding transaction lacks confirmations.
    #[instrument(skip(self, conn))]
    pub async fn lock_channel_funding(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
    ) -> Result<PeerConnection> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        let funding_txid = match channel.status {
            ChannelStatus::FundingBroadcastButNotLocked { funding_txid, .. } => funding_txid,
            _ => return Err(channel.invalid_state("FundingBroadcastButNotLocked")),
        };
        let confirmations = self.chain.get_confirmations(&funding_txid).await?.unwrap_or(0);
        let remaining = channel.setup.minimum_depth.saturating_sub(confirmations);
        if remaining > 0 {
            debug!("channel {} funding needs {} more confirmations", id, remaining);
            return Err(Error::FundingNotLocked { remaining });
        }

        let keys = self.channel_keys(&channel)?;
        let ready = ChannelReady {
            channel_id: id.0,
            second_per_commitment_point: keys.per_commitment_point(&self.secp_ctx, 1)?,
        };
        let conn = conn.send(ready).await?;
        let (conn, their_ready) = expect_message!(conn, ChannelReady);
        check_channel_id(id, &their_ready.channel_id)?;

        channel.commitments.counterparty_next_point = Some(their_ready.second_per_commitment_point);
        channel.status = ChannelStatus::Active;
        self.store.save(&channel)?;
        info!("channel {} active", id);
        Ok(conn)
    }
}
