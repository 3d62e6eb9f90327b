use bitcoin::hashes::Hash;
use bitcoin::key::CompressedPublicKey;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::{EcdsaSighashType, SighashCache};
use bitcoin::{Amount, Script, ScriptBuf, Transaction};

use crate::error::{internal_error, Result};

/// Cooperative closing transactions
pub mod closing;
/// Commitment transactions
pub mod commitment;
/// Transactions spending commitment outputs
pub mod sweep;

/// The P2WPKH script paying to `pubkey`
pub fn p2wpkh_script(pubkey: &PublicKey) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&CompressedPublicKey(*pubkey).wpubkey_hash())
}

/// The P2WSH script committing to `redeemscript`
pub fn p2wsh_script(redeemscript: &Script) -> ScriptBuf {
    ScriptBuf::new_p2wsh(&redeemscript.wscript_hash())
}

/// BIP143 sighash (SIGHASH_ALL) of a P2WSH input
pub(crate) fn p2wsh_sighash(
    tx: &Transaction,
    input: usize,
    redeemscript: &Script,
    value_sat: u64,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .p2wsh_signature_hash(input, redeemscript, Amount::from_sat(value_sat), EcdsaSighashType::All)
        .map_err(|e| internal_error(format!("p2wsh sighash: {}", e)))?;
    Ok(sighash.to_byte_array())
}

/// BIP143 sighash (SIGHASH_ALL) of a P2WPKH input
pub(crate) fn p2wpkh_sighash(
    tx: &Transaction,
    input: usize,
    script_pubkey: &Script,
    value_sat: u64,
) -> Result<[u8; 32]> {
    let sighash = SighashCache::new(tx)
        .p2wpkh_signature_hash(input, script_pubkey, Amount::from_sat(value_sat), EcdsaSighashType::All)
        .map_err(|e| internal_error(format!("p2wpkh sighash: {}", e)))?;
    Ok(sighash.to_byte_array())
}
