use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::{Transaction, TxOut};
use lightning::ln::chan_utils::make_funding_redeemscript;

use super::crypto_utils::signature_to_bitcoin_vec;

/// The minimum value of an output that relay policy accepts, for any
/// script type we produce
pub const MIN_DUST_LIMIT_SATOSHIS: u64 = 330;

/// The minimum dust limit a peer may ask for
pub const MIN_CHAN_DUST_LIMIT_SATOSHIS: u64 = 354;

/// Weight of a commitment transaction with no HTLC outputs
pub const COMMITMENT_TX_BASE_WEIGHT: u64 = 724;

/// Floor for fee rates in sat per 1000 weight units
pub const FEERATE_FLOOR_SATS_PER_KW: u32 = 253;

/// Witness weight of a revocable to-local spend, either branch
/// (`<sig> <0 or 1> <script>`)
pub const REVOKEABLE_WITNESS_WEIGHT: u64 = 1 + 1 + 73 + 1 + 1 + 1 + 77;

/// Witness weight of a p2wpkh spend
pub const P2WPKH_WITNESS_WEIGHT: u64 = 1 + 1 + 73 + 1 + 33;

/// Segwit marker and flag
pub const SEGWIT_MARKER_WEIGHT: u64 = 2;

pub(crate) fn commitment_fee_sat(feerate_per_kw: u32) -> u64 {
    feerate_per_kw as u64 * COMMITMENT_TX_BASE_WEIGHT / 1000
}

pub(crate) fn mutual_close_tx_weight(unsigned_tx: &Transaction) -> u64 {
    // 72 byte signatures assume low-S, peers using 73 pay slightly more
    const EXPECTED_MUTUAL_CLOSE_WITNESS_WEIGHT: u64 = //
        2 + 1 + 4 + // witness-marker-and-flag witness-element-count 4-element-lengths
        72 + 72 + // <signature_for_pubkey1> <signature_for_pubkey2>
        1 + 1 + 33 + 1 + 33 + 1 + 1; // 2 <pubkey1> <pubkey2> 2 OP_CHECKMULTISIG
    unsigned_tx.weight().to_wu() + EXPECTED_MUTUAL_CLOSE_WITNESS_WEIGHT
}

pub(crate) fn fee_for_weight(feerate_per_kw: u32, weight: u64) -> u64 {
    feerate_per_kw as u64 * weight / 1000
}

pub(crate) fn estimate_feerate_per_kw(total_fee: u64, weight: u64) -> u32 {
    (total_fee * 1000 / weight) as u32
}

/// Attach both funding signatures to the first input, in the order the
/// 2-of-2 script expects
pub(crate) fn add_funding_sigs(
    tx: &mut Transaction,
    holder_sig: Signature,
    counterparty_sig: Signature,
    holder_funding_key: &PublicKey,
    counterparty_funding_key: &PublicKey,
) {
    let funding_redeemscript =
        make_funding_redeemscript(holder_funding_key, counterparty_funding_key);

    let witness = &mut tx.input[0].witness;
    witness.clear();
    // CHECKMULTISIG pops one extra element
    witness.push(Vec::new());
    let ser_holder_sig = signature_to_bitcoin_vec(holder_sig);
    let ser_cp_sig = signature_to_bitcoin_vec(counterparty_sig);

    let holder_sig_first =
        holder_funding_key.serialize()[..] < counterparty_funding_key.serialize()[..];

    if holder_sig_first {
        witness.push(ser_holder_sig);
        witness.push(ser_cp_sig);
    } else {
        witness.push(ser_cp_sig);
        witness.push(ser_holder_sig);
    }

    witness.push(funding_redeemscript.as_bytes());
}

/// BIP69 output ordering, ties broken by the script bytes
pub(crate) fn sort_outputs(outputs: &mut [TxOut]) {
    outputs.sort_by(|a, b| {
        a.value.cmp(&b.value).then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });
}

/// Split an obscured commitment number into the input sequence and the
/// lock time
pub(crate) fn obscured_sequence_and_locktime(commitment_number: u64, obscure_factor: u64) -> (u32, u32) {
    let obscured = (commitment_number ^ obscure_factor) & 0xffff_ffff_ffff;
    let sequence = (0x80 << 24) | ((obscured >> 24) as u32);
    let locktime = (0x20 << 24) | ((obscured & 0xff_ffff) as u32);
    (sequence, locktime)
}

/// Recover the commitment number from a transaction spending the funding
/// outpoint, if it has the shape of a commitment transaction
pub fn decode_commitment_number(tx: &Transaction, obscure_factor: u64) -> Option<u64> {
    // a commitment tx has exactly the funding input
    if tx.input.len() != 1 {
        return None;
    }

    let sequence = tx.input[0].sequence.0;
    let locktime = tx.lock_time.to_consensus_u32();
    if (sequence >> 24) as u8 != 0x80 || (locktime >> 24) as u8 != 0x20 {
        return None;
    }

    let obscured = ((sequence as u64 & 0xff_ffff) << 24) | (locktime as u64 & 0xff_ffff);
    Some(obscured ^ (obscure_factor & 0xffff_ffff_ffff))
}
