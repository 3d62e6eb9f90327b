use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use super::{p2wpkh_script, p2wpkh_sighash, p2wsh_sighash};
use crate::error::Result;
use crate::util::crypto_utils::{sign_digest, signature_to_bitcoin_vec};
use crate::util::transaction_utils::{
    fee_for_weight, MIN_DUST_LIMIT_SATOSHIS, P2WPKH_WITNESS_WEIGHT, REVOKEABLE_WITNESS_WEIGHT,
    SEGWIT_MARKER_WEIGHT,
};

/// How an output is spent
pub enum SpendPath {
    /// Our to-local output after the relative delay
    Delayed { redeemscript: ScriptBuf, to_self_delay: u16, key: SecretKey },
    /// A revoked to-local output, with the derived revocation secret
    Revocation { redeemscript: ScriptBuf, key: SecretKey },
    /// A P2WPKH to-remote output paying our payment key
    ToRemote { key: SecretKey },
}

/// An output to sweep
pub struct SweepInput {
    pub outpoint: OutPoint,
    pub value_sat: u64,
    pub path: SpendPath,
}

impl SweepInput {
    fn sequence(&self) -> Sequence {
        match &self.path {
            SpendPath::Delayed { to_self_delay, .. } => Sequence::from_height(*to_self_delay),
            _ => Sequence::ENABLE_LOCKTIME_NO_RBF,
        }
    }

    fn witness_weight(&self) -> u64 {
        match &self.path {
            SpendPath::Delayed { .. } | SpendPath::Revocation { .. } => REVOKEABLE_WITNESS_WEIGHT,
            SpendPath::ToRemote { .. } => P2WPKH_WITNESS_WEIGHT,
        }
    }
}

/// Build and sign a transaction moving every input to `destination`.
///
/// Returns `None` when what is left after the fee would be dust.
pub fn build_sweep_tx(
    secp_ctx: &Secp256k1<All>,
    inputs: &[SweepInput],
    destination: ScriptBuf,
    feerate_per_kw: u32,
) -> Result<Option<Transaction>> {
    if inputs.is_empty() {
        return Ok(None);
    }
    let total: u64 = inputs.iter().map(|i| i.value_sat).sum();
    let mut tx = Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|i| TxIn {
                previous_output: i.outpoint,
                script_sig: ScriptBuf::new(),
                sequence: i.sequence(),
                witness: Witness::new(),
            })
            .collect(),
        output: vec![TxOut { value: Amount::ZERO, script_pubkey: destination }],
    };
    let weight = tx.weight().to_wu()
        + SEGWIT_MARKER_WEIGHT
        + inputs.iter().map(SweepInput::witness_weight).sum::<u64>();
    let fee = fee_for_weight(feerate_per_kw, weight);
    if total < fee + MIN_DUST_LIMIT_SATOSHIS {
        return Ok(None);
    }
    tx.output[0].value = Amount::from_sat(total - fee);

    let mut witnesses = Vec::with_capacity(inputs.len());
    for (idx, input) in inputs.iter().enumerate() {
        let witness = match &input.path {
            SpendPath::Delayed { redeemscript, key, .. } => {
                let sighash = p2wsh_sighash(&tx, idx, redeemscript, input.value_sat)?;
                let sig = sign_digest(secp_ctx, sighash, key);
                Witness::from_slice(&[
                    signature_to_bitcoin_vec(sig),
                    Vec::new(),
                    redeemscript.to_bytes(),
                ])
            }
            SpendPath::Revocation { redeemscript, key } => {
                let sighash = p2wsh_sighash(&tx, idx, redeemscript, input.value_sat)?;
                let sig = sign_digest(secp_ctx, sighash, key);
                Witness::from_slice(&[
                    signature_to_bitcoin_vec(sig),
                    vec![1],
                    redeemscript.to_bytes(),
                ])
            }
            SpendPath::ToRemote { key } => {
                let pubkey = PublicKey::from_secret_key(secp_ctx, key);
                let spk = p2wpkh_script(&pubkey);
                let sighash = p2wpkh_sighash(&tx, idx, &spk, input.value_sat)?;
                let sig = sign_digest(secp_ctx, sighash, key);
                Witness::from_slice(&[signature_to_bitcoin_vec(sig), pubkey.serialize().to_vec()])
            }
        };
        witnesses.push(witness);
    }
    for (txin, witness) in tx.input.iter_mut().zip(witnesses) {
        txin.witness = witness;
    }
    Ok(Some(tx))
}
