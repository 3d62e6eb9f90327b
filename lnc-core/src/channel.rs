use core::fmt;

use bitcoin::hashes::Hash;
use bitcoin::secp256k1::{ecdsa::Signature, All, PublicKey, Secp256k1, SecretKey};
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use lightning::ln::chan_utils::{
    get_commitment_transaction_number_obscure_factor, make_funding_redeemscript,
};
use serde::{Deserialize, Serialize};
use serde_with::{hex::Hex, serde_as};
use tracing::*;

use crate::error::{internal_error, invalid_signature, policy_error, protocol_error, Error, Result};
use crate::keys::{ChannelKeys, ChannelPoints, KeysId};
use crate::tx::commitment::{build_commitment_tx, BuiltCommitment, CommitmentKeys, CommitmentParams};
use crate::tx::p2wsh_sighash;
use crate::util::crypto_utils::{generate_seed, sign_digest, verify_digest};
use crate::util::transaction_utils::{add_funding_sigs, commitment_fee_sat};

/// Identifies a channel, derived from the funding outpoint
#[serde_as]
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChannelId(#[serde_as(as = "Hex")] pub [u8; 32]);

impl ChannelId {
    /// The funding txid with the output index xored into the last two bytes
    pub fn from_funding_outpoint(outpoint: &OutPoint) -> Self {
        let mut id = outpoint.txid.to_byte_array();
        id[30] ^= (outpoint.vout >> 8) as u8;
        id[31] ^= (outpoint.vout & 0xff) as u8;
        ChannelId(id)
    }

    /// A random id used until the funding outpoint is known
    pub fn temporary() -> Self {
        ChannelId(generate_seed())
    }

    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// A peer's node key and where it was reached
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerIdentity {
    /// Node identity key
    pub node_id: PublicKey,
    /// Network address
    pub address: String,
}

/// How a channel ended
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseKind {
    /// Mutually signed closing transaction
    Cooperative,
    /// We broadcast our commitment and swept our output
    LocalForceClose,
    /// The peer broadcast its latest commitment
    CounterpartyForceClose,
    /// The peer broadcast a revoked commitment and we took everything
    Breach,
}

/// Lifecycle of a channel.  Transitions only move forward.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Funding is signed and (for the funder) broadcast, waiting for depth
    FundingBroadcastButNotLocked {
        /// The funding transaction
        funding_txid: Txid,
        /// Confirmations still missing at the last observation
        remaining_confirmations: u32,
    },
    /// Usable for payments
    Active,
    /// A cooperative close was signed and broadcast
    Closing {
        /// The mutually signed closing transaction
        closing_tx: Transaction,
    },
    /// We broadcast our commitment and wait for the delay to sweep
    LocallyForceClosed {
        /// Relative delay on our to-local output
        to_self_delay: u16,
        /// The commitment we broadcast
        commitment_tx: Transaction,
        /// Signed sweep of our to-local output, valid once the delay
        /// has passed.  `None` if our output was trimmed.
        sweep_tx: Option<Transaction>,
    },
    /// Nothing left to do on chain
    Closed {
        /// The transaction that spent the funding output
        closing_txid: Txid,
        /// How the channel closed
        kind: CloseKind,
    },
}

impl ChannelStatus {
    /// Short name for logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            ChannelStatus::FundingBroadcastButNotLocked { .. } => "FundingBroadcastButNotLocked",
            ChannelStatus::Active => "Active",
            ChannelStatus::Closing { .. } => "Closing",
            ChannelStatus::LocallyForceClosed { .. } => "LocallyForceClosed",
            ChannelStatus::Closed { .. } => "Closed",
        }
    }

    /// Whether the funding output may have been spent by us
    pub fn is_closing_or_closed(&self) -> bool {
        matches!(
            self,
            ChannelStatus::Closing { .. }
                | ChannelStatus::LocallyForceClosed { .. }
                | ChannelStatus::Closed { .. }
        )
    }
}

/// Parameters fixed when the channel was negotiated
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSetup {
    /// We funded the channel
    pub is_outbound: bool,
    /// Funding amount
    pub channel_value_sat: u64,
    /// The 2-of-2 output
    pub funding_outpoint: OutPoint,
    /// Confirmations required before locking
    pub minimum_depth: u32,
    /// Delay we impose on the counterparty's to-local output
    pub holder_selected_contest_delay: u16,
    /// Delay the counterparty imposes on our to-local output
    pub counterparty_selected_contest_delay: u16,
    /// Dust limit of our commitments
    pub holder_dust_limit_sat: u64,
    /// Dust limit of the counterparty's commitments
    pub counterparty_dust_limit_sat: u64,
    /// Reserve we must keep, requested by the counterparty
    pub holder_reserve_sat: u64,
    /// Reserve the counterparty must keep, requested by us
    pub counterparty_reserve_sat: u64,
    /// The counterparty's keys
    pub counterparty_points: ChannelPoints,
    /// Where our cooperative close output goes
    pub holder_shutdown_script: Option<ScriptBuf>,
    /// Where the counterparty's cooperative close output goes
    pub counterparty_shutdown_script: Option<ScriptBuf>,
}

/// One of our commitments, with the counterparty's signature
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HolderCommitmentRecord {
    pub number: u64,
    pub to_holder_sat: u64,
    pub to_counterparty_sat: u64,
    pub feerate_per_kw: u32,
    pub counterparty_sig: Signature,
    pub txid: Txid,
}

/// A counterparty commitment we signed
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CounterpartyCommitmentRecord {
    pub number: u64,
    pub txid: Txid,
}

/// A counterparty per-commitment secret it gave up
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedSecret {
    pub number: u64,
    #[serde_as(as = "Hex")]
    pub secret: [u8; 32],
}

/// Commitment bookkeeping of both sides
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentState {
    /// Our current commitment
    pub holder_current: HolderCommitmentRecord,
    /// Our superseded commitments, oldest first
    pub holder_previous: Vec<HolderCommitmentRecord>,
    /// Number of the counterparty's current commitment
    pub counterparty_commitment_number: u64,
    /// Counterparty per-commitment point of the current commitment
    pub counterparty_point: PublicKey,
    /// Counterparty per-commitment point of the next commitment
    pub counterparty_next_point: Option<PublicKey>,
    /// Counterparty commitments we signed
    pub counterparty_commitments: Vec<CounterpartyCommitmentRecord>,
    /// Secrets of revoked counterparty commitments
    pub revealed_secrets: Vec<RevealedSecret>,
    /// Values of a commitment we signed for the counterparty and whose
    /// exchange has not reached our side yet
    #[serde(default)]
    pub pending_update: Option<CommitmentValues>,
}

/// A payment channel with one peer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    pub id: ChannelId,
    pub peer: PeerIdentity,
    pub keys_id: KeysId,
    pub setup: ChannelSetup,
    pub status: ChannelStatus,
    pub commitments: CommitmentState,
    /// Kept by the funder for rebroadcast
    pub funding_tx: Option<Transaction>,
}

/// A balance split and fee rate, for one commitment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitmentValues {
    pub to_holder_sat: u64,
    pub to_counterparty_sat: u64,
    pub feerate_per_kw: u32,
}

impl ChannelSetup {
    /// Factor hiding the commitment number in sequence and lock time
    pub fn obscure_factor(&self, holder_points: &ChannelPoints) -> u64 {
        get_commitment_transaction_number_obscure_factor(
            &holder_points.payment_point,
            &self.counterparty_points.payment_point,
            self.is_outbound,
        )
    }

    /// The 2-of-2 witness script
    pub fn funding_redeemscript(&self, holder_points: &ChannelPoints) -> ScriptBuf {
        make_funding_redeemscript(&holder_points.funding_pubkey, &self.counterparty_points.funding_pubkey)
    }

    /// Build our commitment `number`
    pub fn build_holder_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        number: u64,
        values: &CommitmentValues,
    ) -> Result<BuiltCommitment> {
        let holder_points = keys.points(secp_ctx);
        let point = keys.per_commitment_point(secp_ctx, number)?;
        let commitment_keys =
            CommitmentKeys::derive(secp_ctx, &point, &holder_points, &self.counterparty_points);
        let params = CommitmentParams {
            funding_outpoint: self.funding_outpoint,
            commitment_number: number,
            obscure_factor: self.obscure_factor(&holder_points),
            to_broadcaster_sat: values.to_holder_sat,
            to_countersignatory_sat: values.to_counterparty_sat,
            broadcaster_is_funder: self.is_outbound,
            feerate_per_kw: values.feerate_per_kw,
            dust_limit_sat: self.holder_dust_limit_sat,
            contest_delay: self.counterparty_selected_contest_delay,
        };
        Ok(build_commitment_tx(&params, &commitment_keys))
    }

    /// Build the counterparty's commitment `number`, using their
    /// per-commitment point
    pub fn build_counterparty_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        holder_points: &ChannelPoints,
        number: u64,
        per_commitment_point: &PublicKey,
        values: &CommitmentValues,
    ) -> BuiltCommitment {
        let commitment_keys = CommitmentKeys::derive(
            secp_ctx,
            per_commitment_point,
            &self.counterparty_points,
            holder_points,
        );
        let params = CommitmentParams {
            funding_outpoint: self.funding_outpoint,
            commitment_number: number,
            obscure_factor: self.obscure_factor(holder_points),
            to_broadcaster_sat: values.to_counterparty_sat,
            to_countersignatory_sat: values.to_holder_sat,
            broadcaster_is_funder: !self.is_outbound,
            feerate_per_kw: values.feerate_per_kw,
            dust_limit_sat: self.counterparty_dust_limit_sat,
            contest_delay: self.holder_selected_contest_delay,
        };
        build_commitment_tx(&params, &commitment_keys)
    }

    fn funding_sighash(&self, holder_points: &ChannelPoints, tx: &Transaction) -> Result<[u8; 32]> {
        let redeemscript = self.funding_redeemscript(holder_points);
        p2wsh_sighash(tx, 0, &redeemscript, self.channel_value_sat)
    }

    /// Our funding key signature over a transaction spending the funding output
    pub fn sign_funding_spend(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        tx: &Transaction,
    ) -> Result<Signature> {
        let sighash = self.funding_sighash(&keys.points(secp_ctx), tx)?;
        Ok(sign_digest(secp_ctx, sighash, &keys.funding_key))
    }

    /// Check the counterparty's funding key signature over a transaction
    /// spending the funding output
    pub fn verify_counterparty_funding_sig(
        &self,
        secp_ctx: &Secp256k1<All>,
        holder_points: &ChannelPoints,
        tx: &Transaction,
        sig: &Signature,
        what: &str,
    ) -> Result<()> {
        let sighash = self.funding_sighash(holder_points, tx)?;
        if !verify_digest(secp_ctx, sighash, sig, &self.counterparty_points.funding_pubkey) {
            return Err(invalid_signature(format!(
                "{} signature verify failed for {}",
                what,
                tx.compute_txid()
            )));
        }
        Ok(())
    }

    /// Finalize a funding spend with both signatures
    pub fn add_funding_witness(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        tx: &mut Transaction,
        counterparty_sig: Signature,
    ) -> Result<()> {
        let holder_sig = self.sign_funding_spend(secp_ctx, keys, tx)?;
        let holder_points = keys.points(secp_ctx);
        add_funding_sigs(
            tx,
            holder_sig,
            counterparty_sig,
            &holder_points.funding_pubkey,
            &self.counterparty_points.funding_pubkey,
        );
        Ok(())
    }
}

impl Channel {
    /// Our current commitment
    pub fn current_holder(&self) -> &HolderCommitmentRecord {
        &self.commitments.holder_current
    }

    /// Our commitment `number`, current or superseded
    pub fn holder_commitment(&self, number: u64) -> Option<&HolderCommitmentRecord> {
        if self.commitments.holder_current.number == number {
            return Some(&self.commitments.holder_current);
        }
        self.commitments.holder_previous.iter().find(|r| r.number == number)
    }

    /// Make `record` the current commitment
    pub fn push_holder_commitment(&mut self, record: HolderCommitmentRecord) {
        let previous = core::mem::replace(&mut self.commitments.holder_current, record);
        self.commitments.holder_previous.push(previous);
    }

    /// Current balance split and fee rate
    pub fn current_values(&self) -> CommitmentValues {
        let current = self.current_holder();
        CommitmentValues {
            to_holder_sat: current.to_holder_sat,
            to_counterparty_sat: current.to_counterparty_sat,
            feerate_per_kw: current.feerate_per_kw,
        }
    }

    /// What we can still send: balance minus reserve, minus the commitment
    /// fee when we are the funder
    pub fn spendable_sat(&self) -> u64 {
        let values = self.current_values();
        let fee = if self.setup.is_outbound { commitment_fee_sat(values.feerate_per_kw) } else { 0 };
        values.to_holder_sat.saturating_sub(self.setup.holder_reserve_sat).saturating_sub(fee)
    }

    /// What the counterparty can still send to us
    pub fn counterparty_spendable_sat(&self) -> u64 {
        let values = self.current_values();
        let fee = if self.setup.is_outbound { 0 } else { commitment_fee_sat(values.feerate_per_kw) };
        values
            .to_counterparty_sat
            .saturating_sub(self.setup.counterparty_reserve_sat)
            .saturating_sub(fee)
    }

    /// Fail unless the status is `Active`
    pub fn ensure_active(&self) -> Result<()> {
        match self.status {
            ChannelStatus::Active => Ok(()),
            _ => Err(self.invalid_state("Active")),
        }
    }

    /// Whether a commitment exchange was interrupted and must be resumed
    /// with the peer before the next update
    pub fn exchange_in_flight(&self) -> bool {
        let state = &self.commitments;
        let last_signed = state.counterparty_commitments.last().map_or(0, |r| r.number);
        state.pending_update.is_some()
            || self.current_holder().number != state.counterparty_commitment_number
            || last_signed != state.counterparty_commitment_number
    }

    /// Fail unless the channel is `Active` with both sides on the same
    /// commitment
    pub fn ensure_settled(&self) -> Result<()> {
        self.ensure_active()?;
        if self.exchange_in_flight() {
            return Err(self.invalid_state("a reestablished channel"));
        }
        Ok(())
    }

    pub(crate) fn invalid_state(&self, expected: &'static str) -> Error {
        warn!("channel {} is {}, expected {}", self.id, self.status.name(), expected);
        Error::InvalidState { channel_id: self.id, status: self.status.name().to_string(), expected }
    }

    /// The fully signed transaction for one of our recorded commitments
    pub fn signed_holder_commitment(
        &self,
        secp_ctx: &Secp256k1<All>,
        keys: &ChannelKeys,
        record: &HolderCommitmentRecord,
    ) -> Result<Transaction> {
        let values = CommitmentValues {
            to_holder_sat: record.to_holder_sat,
            to_counterparty_sat: record.to_counterparty_sat,
            feerate_per_kw: record.feerate_per_kw,
        };
        let mut tx = self.setup.build_holder_commitment(secp_ctx, keys, record.number, &values)?.tx;
        if tx.compute_txid() != record.txid {
            return Err(internal_error(format!(
                "rebuilt commitment {} does not match recorded txid",
                record.number
            )));
        }
        self.setup.add_funding_witness(secp_ctx, keys, &mut tx, record.counterparty_sig)?;
        Ok(tx)
    }

    /// Release the secret of our commitment `number`.  Only allowed once a
    /// counterparty-signed commitment `number + 1` is recorded.
    pub fn release_holder_secret(&self, keys: &ChannelKeys, number: u64) -> Result<[u8; 32]> {
        let current = self.current_holder().number;
        if number >= current {
            return Err(policy_error(format!(
                "refusing to revoke commitment {} of channel {}, current is {}",
                number, self.id, current
            )));
        }
        Ok(keys.per_commitment_secret(number))
    }

    /// Check a revealed counterparty secret against the point we hold for
    /// its current commitment, then advance to the next point
    pub fn apply_counterparty_revocation(
        &mut self,
        secp_ctx: &Secp256k1<All>,
        secret: [u8; 32],
        next_point: PublicKey,
    ) -> Result<()> {
        let state = &mut self.commitments;
        let key = SecretKey::from_slice(&secret)
            .map_err(|_| protocol_error("revocation secret is not a valid key"))?;
        if PublicKey::from_secret_key(secp_ctx, &key) != state.counterparty_point {
            return Err(protocol_error(format!(
                "revocation secret for commitment {} does not match its point",
                state.counterparty_commitment_number
            )));
        }
        let current_point = state
            .counterparty_next_point
            .ok_or_else(|| protocol_error("revocation before the next commitment was signed"))?;
        state.revealed_secrets.push(RevealedSecret {
            number: state.counterparty_commitment_number,
            secret,
        });
        state.counterparty_commitment_number += 1;
        state.counterparty_point = current_point;
        state.counterparty_next_point = Some(next_point);
        Ok(())
    }

    /// The secret the counterparty revealed for its commitment `number`
    pub fn revealed_secret(&self, number: u64) -> Option<[u8; 32]> {
        self.commitments.revealed_secrets.iter().find(|s| s.number == number).map(|s| s.secret)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn channel_id_from_outpoint_test() {
        let txid = Txid::from_byte_array([0x11; 32]);
        let id = ChannelId::from_funding_outpoint(&OutPoint { txid, vout: 0x0102 });
        let mut expected = [0x11; 32];
        expected[30] = 0x11 ^ 0x01;
        expected[31] = 0x11 ^ 0x02;
        assert_eq!(id.0, expected);
        assert_eq!(ChannelId::from_funding_outpoint(&OutPoint { txid, vout: 0 }).0, [0x11; 32]);
        assert_eq!(id.to_string().len(), 64);
    }

    #[test]
    fn status_serde_test() {
        let status = ChannelStatus::FundingBroadcastButNotLocked {
            funding_txid: Txid::from_byte_array([2; 32]),
            remaining_confirmations: 3,
        };
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(serde_json::from_str::<ChannelStatus>(&json).unwrap(), status);
        assert_eq!(status.name(), "FundingBroadcastButNotLocked");
        assert!(!status.is_closing_or_closed());
    }
}
