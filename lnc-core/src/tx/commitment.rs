use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};
use lightning::ln::chan_utils::get_revokeable_redeemscript;
use lightning::ln::channel_keys::{
    DelayedPaymentBasepoint, DelayedPaymentKey, RevocationBasepoint, RevocationKey,
};

use super::{p2wpkh_script, p2wsh_script};
use crate::keys::ChannelPoints;
use crate::util::transaction_utils::{
    commitment_fee_sat, obscured_sequence_and_locktime, sort_outputs,
};

/// Keys of one commitment transaction, tweaked by the broadcaster's
/// per-commitment point
#[derive(Clone, Debug)]
pub struct CommitmentKeys {
    /// Lets the countersignatory take the to-local output once revoked
    pub revocation_key: RevocationKey,
    /// Broadcaster's key for the delayed to-local output
    pub broadcaster_delayed_payment_key: DelayedPaymentKey,
    /// Countersignatory's untweaked payment key
    pub countersignatory_payment_key: PublicKey,
}

impl CommitmentKeys {
    /// Derive the keys of a commitment broadcast by `broadcaster`
    pub fn derive(
        secp_ctx: &Secp256k1<All>,
        per_commitment_point: &PublicKey,
        broadcaster: &ChannelPoints,
        countersignatory: &ChannelPoints,
    ) -> Self {
        let revocation_key = RevocationKey::from_basepoint(
            secp_ctx,
            &RevocationBasepoint(countersignatory.revocation_basepoint),
            per_commitment_point,
        );
        let broadcaster_delayed_payment_key = DelayedPaymentKey::from_basepoint(
            secp_ctx,
            &DelayedPaymentBasepoint(broadcaster.delayed_payment_basepoint),
            per_commitment_point,
        );
        CommitmentKeys {
            revocation_key,
            broadcaster_delayed_payment_key,
            countersignatory_payment_key: countersignatory.payment_point,
        }
    }

    /// The witness script of the to-local output
    pub fn to_local_redeemscript(&self, contest_delay: u16) -> ScriptBuf {
        get_revokeable_redeemscript(
            &self.revocation_key,
            contest_delay,
            &self.broadcaster_delayed_payment_key,
        )
    }
}

/// What goes into a commitment transaction
#[derive(Clone, Debug)]
pub struct CommitmentParams {
    pub funding_outpoint: OutPoint,
    pub commitment_number: u64,
    pub obscure_factor: u64,
    /// Broadcaster balance before fees
    pub to_broadcaster_sat: u64,
    /// Countersignatory balance before fees
    pub to_countersignatory_sat: u64,
    /// The funder pays the commitment fee
    pub broadcaster_is_funder: bool,
    pub feerate_per_kw: u32,
    /// The broadcaster's dust limit
    pub dust_limit_sat: u64,
    /// Delay on the broadcaster's to-local output, chosen by the countersignatory
    pub contest_delay: u16,
}

/// A built, unsigned commitment transaction
#[derive(Clone, Debug)]
pub struct BuiltCommitment {
    pub tx: Transaction,
    /// Index of the broadcaster's delayed output, unless trimmed
    pub to_local_vout: Option<u32>,
    /// Witness script of the to-local output
    pub to_local_redeemscript: ScriptBuf,
    /// Index of the countersignatory's output, unless trimmed
    pub to_remote_vout: Option<u32>,
}

/// Build a commitment transaction without HTLC outputs
pub fn build_commitment_tx(params: &CommitmentParams, keys: &CommitmentKeys) -> BuiltCommitment {
    let fee = commitment_fee_sat(params.feerate_per_kw);
    let (to_broadcaster, to_countersignatory) = if params.broadcaster_is_funder {
        (params.to_broadcaster_sat.saturating_sub(fee), params.to_countersignatory_sat)
    } else {
        (params.to_broadcaster_sat, params.to_countersignatory_sat.saturating_sub(fee))
    };

    let to_local_redeemscript = keys.to_local_redeemscript(params.contest_delay);
    let to_local_spk = p2wsh_script(&to_local_redeemscript);
    let to_remote_spk = p2wpkh_script(&keys.countersignatory_payment_key);

    let mut outputs = Vec::with_capacity(2);
    if to_broadcaster >= params.dust_limit_sat {
        outputs.push(TxOut {
            value: Amount::from_sat(to_broadcaster),
            script_pubkey: to_local_spk.clone(),
        });
    }
    if to_countersignatory >= params.dust_limit_sat {
        outputs.push(TxOut {
            value: Amount::from_sat(to_countersignatory),
            script_pubkey: to_remote_spk.clone(),
        });
    }
    sort_outputs(&mut outputs);

    let find = |spk: &ScriptBuf| {
        outputs.iter().position(|o| &o.script_pubkey == spk).map(|i| i as u32)
    };
    let to_local_vout = find(&to_local_spk);
    let to_remote_vout = find(&to_remote_spk);

    let (sequence, locktime) =
        obscured_sequence_and_locktime(params.commitment_number, params.obscure_factor);
    let tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::from_consensus(locktime),
        input: vec![TxIn {
            previous_output: params.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence(sequence),
            witness: Witness::new(),
        }],
        output: outputs,
    };
    BuiltCommitment { tx, to_local_vout, to_local_redeemscript, to_remote_vout }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeysId, KeysManager};
    use crate::util::transaction_utils::decode_commitment_number;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn points(i: u8) -> ChannelPoints {
        let secp_ctx = Secp256k1::new();
        KeysManager::new(&[i; 32], "").unwrap().channel_keys(&KeysId([i; 32])).unwrap().points(&secp_ctx)
    }

    fn params(to_broadcaster: u64, to_countersignatory: u64, funder: bool) -> CommitmentParams {
        CommitmentParams {
            funding_outpoint: OutPoint { txid: Txid::all_zeros(), vout: 1 },
            commitment_number: 7,
            obscure_factor: 0x1234_5678,
            to_broadcaster_sat: to_broadcaster,
            to_countersignatory_sat: to_countersignatory,
            broadcaster_is_funder: funder,
            feerate_per_kw: 1000,
            dust_limit_sat: 354,
            contest_delay: 144,
        }
    }

    #[test]
    fn funder_pays_fee_test() {
        let secp_ctx = Secp256k1::new();
        let keys = CommitmentKeys::derive(&secp_ctx, &points(3).funding_pubkey, &points(1), &points(2));
        let built = build_commitment_tx(&params(600_000, 400_000, true), &keys);
        let to_local = built.tx.output[built.to_local_vout.unwrap() as usize].value.to_sat();
        let to_remote = built.tx.output[built.to_remote_vout.unwrap() as usize].value.to_sat();
        assert_eq!(to_local, 600_000 - 724);
        assert_eq!(to_remote, 400_000);
        // outputs are ordered by value
        assert_eq!(built.to_remote_vout, Some(0));
        assert_eq!(decode_commitment_number(&built.tx, 0x1234_5678), Some(7));

        let built = build_commitment_tx(&params(600_000, 400_000, false), &keys);
        let to_remote = built.tx.output[built.to_remote_vout.unwrap() as usize].value.to_sat();
        assert_eq!(to_remote, 400_000 - 724);
    }

    #[test]
    fn dust_is_trimmed_test() {
        let secp_ctx = Secp256k1::new();
        let keys = CommitmentKeys::derive(&secp_ctx, &points(3).funding_pubkey, &points(1), &points(2));
        let built = build_commitment_tx(&params(0, 1_000_000, false), &keys);
        assert_eq!(built.tx.output.len(), 1);
        assert_eq!(built.to_local_vout, None);
        assert_eq!(built.to_remote_vout, Some(0));
    }
}
