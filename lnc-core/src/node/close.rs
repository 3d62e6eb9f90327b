use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, SecretKey};
use bitcoin::{OutPoint, Transaction, Txid};
use lightning::ln::chan_utils::{derive_private_key, derive_private_revocation_key};
use lnc_protocol::msgs::{ClosingSigned, Shutdown};
use tracing::*;

use super::{check_channel_id, expect_message, send_warning, Node};
use crate::channel::{
    Channel, ChannelId, ChannelStatus, CloseKind, CommitmentValues, HolderCommitmentRecord,
};
use crate::error::{internal_error, policy_error, protocol_error, Result};
use crate::fee::{closing_fee_acceptable, estimate_feerate, next_closing_fee};
use crate::keys::ChannelKeys;
use crate::peer::PeerConnection;
use crate::store::ChannelSnapshot;
use crate::tx::closing::{build_closing_tx, closing_fee_sat, ClosingParams};
use crate::tx::commitment::CommitmentKeys;
use crate::tx::sweep::{build_sweep_tx, SpendPath, SweepInput};
use crate::tx::{p2wpkh_script, p2wsh_script};
use crate::util::transaction_utils::decode_commitment_number;

/// What spent a channel's funding output, with the transaction we answer
/// it with where there is something to claim
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClosingSpend {
    /// A mutually signed closing transaction
    Cooperative { closing_tx: Transaction },
    /// One of our own commitments
    LocalCommitment { commitment_tx: Transaction },
    /// The counterparty's current commitment.  `claim_tx` takes our
    /// to-remote output, `None` if it was trimmed.
    CounterpartyCommitment { commitment_tx: Transaction, claim_tx: Option<Transaction> },
    /// A counterparty commitment whose secret it revealed.  `justice_tx`
    /// takes its to-local output through the revocation path, together
    /// with our to-remote output.
    RevokedCommitment {
        commitment_tx: Transaction,
        commitment_number: u64,
        justice_tx: Option<Transaction>,
    },
}

impl ClosingSpend {
    /// The transaction that spent the funding output
    pub fn spending_tx(&self) -> &Transaction {
        match self {
            ClosingSpend::Cooperative { closing_tx } => closing_tx,
            ClosingSpend::LocalCommitment { commitment_tx }
            | ClosingSpend::CounterpartyCommitment { commitment_tx, .. }
            | ClosingSpend::RevokedCommitment { commitment_tx, .. } => commitment_tx,
        }
    }

    /// Our answer to the spend, if any
    pub fn response_tx(&self) -> Option<&Transaction> {
        match self {
            ClosingSpend::CounterpartyCommitment { claim_tx, .. } => claim_tx.as_ref(),
            ClosingSpend::RevokedCommitment { justice_tx, .. } => justice_tx.as_ref(),
            _ => None,
        }
    }

    /// How the channel ends with this spend
    pub fn kind(&self) -> CloseKind {
        match self {
            ClosingSpend::Cooperative { .. } => CloseKind::Cooperative,
            ClosingSpend::LocalCommitment { .. } => CloseKind::LocalForceClose,
            ClosingSpend::CounterpartyCommitment { .. } => CloseKind::CounterpartyForceClose,
            ClosingSpend::RevokedCommitment { .. } => CloseKind::Breach,
        }
    }
}

struct Offer {
    fee_sat: u64,
    signature: Signature,
}

impl Node {
    fn closing_params(&self, channel: &Channel) -> Result<ClosingParams> {
        let setup = &channel.setup;
        let values = channel.current_values();
        let holder_script = setup
            .holder_shutdown_script
            .clone()
            .ok_or_else(|| internal_error("no holder shutdown script"))?;
        let counterparty_script = setup
            .counterparty_shutdown_script
            .clone()
            .ok_or_else(|| internal_error("no counterparty shutdown script"))?;
        Ok(ClosingParams {
            funding_outpoint: setup.funding_outpoint,
            to_holder_sat: values.to_holder_sat,
            to_counterparty_sat: values.to_counterparty_sat,
            holder_script,
            counterparty_script,
            holder_is_funder: setup.is_outbound,
            dust_limit_sat: setup.holder_dust_limit_sat.max(setup.counterparty_dust_limit_sat),
        })
    }

    fn sign_closing(
        &self,
        channel: &Channel,
        keys: &ChannelKeys,
        params: &ClosingParams,
        fee_sat: u64,
    ) -> Result<Offer> {
        let tx = build_closing_tx(params, fee_sat);
        let signature = channel.setup.sign_funding_spend(&self.secp_ctx, keys, &tx)?;
        Ok(Offer { fee_sat, signature })
    }

    /// Exchange `closing_signed` until both sides signed the same fee.
    /// The side that spoke first passes its opening offer.
    async fn negotiate_closing(
        &self,
        mut conn: PeerConnection,
        channel: &Channel,
        keys: &ChannelKeys,
        params: &ClosingParams,
        opening: Option<u64>,
    ) -> Result<(PeerConnection, Transaction)> {
        let holder_points = keys.points(&self.secp_ctx);
        let feerate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
        let our_fee = closing_fee_sat(params, feerate);
        let mut last_offer = opening;
        let max_rounds = self.config.fees.closing_max_rounds;

        for round in 0..=max_rounds {
            let (c, closing_signed) = expect_message!(conn, ClosingSigned);
            conn = c;
            check_channel_id(&channel.id, &closing_signed.channel_id)?;
            let their_fee = closing_signed.fee_satoshis;
            if their_fee > params.funder_balance_sat() {
                let reason = format!(
                    "closing fee {} exceeds funder balance {}",
                    their_fee,
                    params.funder_balance_sat()
                );
                send_warning(conn, &channel.id, &reason).await?;
                return Err(protocol_error(reason));
            }
            let mut tx = build_closing_tx(params, their_fee);
            channel.setup.verify_counterparty_funding_sig(
                &self.secp_ctx,
                &holder_points,
                &tx,
                &closing_signed.signature,
                "closing",
            )?;
            debug!("channel {} round {} closing fee offered {}", channel.id, round, their_fee);

            let agreed = if last_offer == Some(their_fee) {
                true
            } else {
                let reply = if closing_fee_acceptable(their_fee, our_fee, &self.config.fees) {
                    their_fee
                } else {
                    next_closing_fee(last_offer.unwrap_or(our_fee), their_fee)
                };
                if round == max_rounds && reply != their_fee {
                    send_warning(conn, &channel.id, "closing fee negotiation did not converge")
                        .await?;
                    return Err(policy_error(format!(
                        "closing fee negotiation for channel {} did not converge",
                        channel.id
                    )));
                }
                let offer = self.sign_closing(channel, keys, params, reply)?;
                conn = conn
                    .send(ClosingSigned {
                        channel_id: channel.id.0,
                        fee_satoshis: offer.fee_sat,
                        signature: offer.signature,
                    })
                    .await?;
                last_offer = Some(reply);
                reply == their_fee
            };
            if agreed {
                channel.setup.add_funding_witness(
                    &self.secp_ctx,
                    keys,
                    &mut tx,
                    closing_signed.signature,
                )?;
                info!("channel {} closing fee agreed at {}", channel.id, their_fee);
                return Ok((conn, tx));
            }
        }
        Err(internal_error("closing negotiation loop exited"))
    }

    /// Close the channel cooperatively, broadcasting the agreed closing
    /// transaction
    #[instrument(skip(self, conn))]
    pub async fn close_channel(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
    ) -> Result<(PeerConnection, Txid)> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_settled()?;
        let keys = self.channel_keys(&channel)?;

        let our_script = self.wallet.sweep_script();
        let conn = conn.send(Shutdown { channel_id: id.0, scriptpubkey: our_script.clone() }).await?;
        let (conn, shutdown) = expect_message!(conn, Shutdown);
        check_channel_id(id, &shutdown.channel_id)?;
        channel.setup.holder_shutdown_script = Some(our_script);
        channel.setup.counterparty_shutdown_script = Some(shutdown.scriptpubkey);

        let params = self.closing_params(&channel)?;
        let feerate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
        let offer = self.sign_closing(&channel, &keys, &params, closing_fee_sat(&params, feerate))?;
        let conn = conn
            .send(ClosingSigned {
                channel_id: id.0,
                fee_satoshis: offer.fee_sat,
                signature: offer.signature,
            })
            .await?;
        let (conn, closing_tx) =
            self.negotiate_closing(conn, &channel, &keys, &params, Some(offer.fee_sat)).await?;

        channel.status = ChannelStatus::Closing { closing_tx: closing_tx.clone() };
        self.store.save(&channel)?;
        let txid = self.chain.broadcast_transaction(&closing_tx).await?;
        info!("channel {} closing tx {} broadcast", id, txid);
        Ok((conn, txid))
    }

    /// Take part in a cooperative close started by the peer
    #[instrument(skip(self, conn))]
    pub async fn accept_close_channel(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
    ) -> Result<(PeerConnection, Txid)> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_settled()?;
        let keys = self.channel_keys(&channel)?;

        let (conn, shutdown) = expect_message!(conn, Shutdown);
        check_channel_id(id, &shutdown.channel_id)?;
        let our_script = self.wallet.sweep_script();
        let conn = conn.send(Shutdown { channel_id: id.0, scriptpubkey: our_script.clone() }).await?;
        channel.setup.holder_shutdown_script = Some(our_script);
        channel.setup.counterparty_shutdown_script = Some(shutdown.scriptpubkey);

        let params = self.closing_params(&channel)?;
        let (conn, closing_tx) = self.negotiate_closing(conn, &channel, &keys, &params, None).await?;
        let txid = closing_tx.compute_txid();
        channel.status = ChannelStatus::Closing { closing_tx };
        self.store.save(&channel)?;
        info!("channel {} closing with {}", id, txid);
        Ok((conn, txid))
    }

    /// The status after our commitment `record` went to chain: the signed
    /// commitment and the sweep of our delayed output
    pub(crate) async fn local_close_status(
        &self,
        channel: &Channel,
        keys: &ChannelKeys,
        record: &HolderCommitmentRecord,
    ) -> Result<ChannelStatus> {
        let commitment_tx = channel.signed_holder_commitment(&self.secp_ctx, keys, record)?;
        let built = channel.setup.build_holder_commitment(
            &self.secp_ctx,
            keys,
            record.number,
            &CommitmentValues {
                to_holder_sat: record.to_holder_sat,
                to_counterparty_sat: record.to_counterparty_sat,
                feerate_per_kw: record.feerate_per_kw,
            },
        )?;
        let to_self_delay = channel.setup.counterparty_selected_contest_delay;
        let sweep_tx = match built.to_local_vout {
            Some(vout) => {
                let point = keys.per_commitment_point(&self.secp_ctx, record.number)?;
                let key = derive_private_key(&self.secp_ctx, &point, &keys.delayed_payment_base_key);
                let input = SweepInput {
                    outpoint: OutPoint { txid: record.txid, vout },
                    value_sat: commitment_tx.output[vout as usize].value.to_sat(),
                    path: SpendPath::Delayed {
                        redeemscript: built.to_local_redeemscript,
                        to_self_delay,
                        key,
                    },
                };
                let feerate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
                build_sweep_tx(&self.secp_ctx, &[input], self.wallet.sweep_script(), feerate)?
            }
            None => None,
        };
        Ok(ChannelStatus::LocallyForceClosed { to_self_delay, commitment_tx, sweep_tx })
    }

    /// Broadcast our latest commitment.  Our output comes back through the
    /// recorded sweep once the delay has passed.
    #[instrument(skip(self))]
    pub async fn force_close(&self, id: &ChannelId) -> Result<Txid> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_active()?;
        let keys = self.channel_keys(&channel)?;
        let record = channel.current_holder().clone();
        let status = self.local_close_status(&channel, &keys, &record).await?;
        let commitment_tx = match &status {
            ChannelStatus::LocallyForceClosed { commitment_tx, .. } => commitment_tx.clone(),
            _ => return Err(internal_error("unexpected force close status")),
        };
        channel.status = status;
        self.store.save(&channel)?;
        let txid = self.chain.broadcast_transaction(&commitment_tx).await?;
        warn!("channel {} force closed with commitment {} ({})", id, record.number, txid);
        Ok(txid)
    }

    /// Classify what spent the funding output, `None` while it is unspent
    #[instrument(skip(self))]
    pub async fn check_for_closing_tx(&self, id: &ChannelId) -> Result<Option<ClosingSpend>> {
        let channel = self.store.load(id)?;
        self.classify_funding_spend(&channel).await
    }

    pub(crate) async fn classify_funding_spend(&self, channel: &Channel) -> Result<Option<ClosingSpend>> {
        let spend = match self.chain.get_spending_tx(&channel.setup.funding_outpoint).await? {
            Some(tx) => tx,
            None => return Ok(None),
        };
        let txid = spend.compute_txid();
        if let ChannelStatus::Closing { closing_tx } = &channel.status {
            if closing_tx.compute_txid() == txid {
                return Ok(Some(ClosingSpend::Cooperative { closing_tx: spend }));
            }
        }
        let keys = self.channel_keys(channel)?;
        let holder_points = keys.points(&self.secp_ctx);
        let obscure_factor = channel.setup.obscure_factor(&holder_points);
        let number = match decode_commitment_number(&spend, obscure_factor) {
            Some(number) => number,
            None => return Ok(Some(ClosingSpend::Cooperative { closing_tx: spend })),
        };
        let is_ours = channel.current_holder().txid == txid
            || channel.commitments.holder_previous.iter().any(|r| r.txid == txid);
        if is_ours {
            return Ok(Some(ClosingSpend::LocalCommitment { commitment_tx: spend }));
        }

        let feerate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
        let destination = self.wallet.sweep_script();
        let to_remote_script = p2wpkh_script(&holder_points.payment_point);
        let mut inputs: Vec<SweepInput> = spend
            .output
            .iter()
            .enumerate()
            .filter(|(_, out)| out.script_pubkey == to_remote_script)
            .map(|(vout, out)| SweepInput {
                outpoint: OutPoint { txid, vout: vout as u32 },
                value_sat: out.value.to_sat(),
                path: SpendPath::ToRemote { key: keys.payment_key },
            })
            .collect();

        match channel.revealed_secret(number) {
            Some(secret) => {
                error!("channel {} revoked commitment {} broadcast by peer", channel.id, number);
                let secret_key = SecretKey::from_slice(&secret)
                    .map_err(|_| protocol_error("stored revocation secret is not a valid key"))?;
                let their_point = PublicKey::from_secret_key(&self.secp_ctx, &secret_key);
                let commitment_keys = CommitmentKeys::derive(
                    &self.secp_ctx,
                    &their_point,
                    &channel.setup.counterparty_points,
                    &holder_points,
                );
                let redeemscript =
                    commitment_keys.to_local_redeemscript(channel.setup.holder_selected_contest_delay);
                let to_local_script = p2wsh_script(&redeemscript);
                let revocation_key =
                    derive_private_revocation_key(&self.secp_ctx, &secret_key, &keys.revocation_base_key);
                for (vout, out) in spend.output.iter().enumerate() {
                    if out.script_pubkey == to_local_script {
                        inputs.push(SweepInput {
                            outpoint: OutPoint { txid, vout: vout as u32 },
                            value_sat: out.value.to_sat(),
                            path: SpendPath::Revocation {
                                redeemscript: redeemscript.clone(),
                                key: revocation_key,
                            },
                        });
                    }
                }
                let justice_tx = build_sweep_tx(&self.secp_ctx, &inputs, destination, feerate)?;
                Ok(Some(ClosingSpend::RevokedCommitment {
                    commitment_tx: spend,
                    commitment_number: number,
                    justice_tx,
                }))
            }
            None => {
                warn!("channel {} counterparty commitment {} on chain", channel.id, number);
                let claim_tx = build_sweep_tx(&self.secp_ctx, &inputs, destination, feerate)?;
                Ok(Some(ClosingSpend::CounterpartyCommitment { commitment_tx: spend, claim_tx }))
            }
        }
    }

    /// Whether nothing is left to do on chain for the channel
    pub async fn check_closing_finished(&self, snapshot: &ChannelSnapshot) -> Result<bool> {
        match &snapshot.status {
            ChannelStatus::Closed { .. } => Ok(true),
            ChannelStatus::Closing { closing_tx } => {
                let confirmations =
                    self.chain.get_confirmations(&closing_tx.compute_txid()).await?.unwrap_or(0);
                Ok(confirmations > 0)
            }
            _ => Ok(false),
        }
    }
}
