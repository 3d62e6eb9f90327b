use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Witness};

use crate::util::transaction_utils::{fee_for_weight, mutual_close_tx_weight, sort_outputs};

/// Balances and destinations of a cooperative close
#[derive(Clone, Debug)]
pub struct ClosingParams {
    pub funding_outpoint: OutPoint,
    pub to_holder_sat: u64,
    pub to_counterparty_sat: u64,
    pub holder_script: ScriptBuf,
    pub counterparty_script: ScriptBuf,
    /// The funder pays the closing fee
    pub holder_is_funder: bool,
    /// Outputs below this are dropped
    pub dust_limit_sat: u64,
}

impl ClosingParams {
    /// The balance the closing fee comes out of
    pub fn funder_balance_sat(&self) -> u64 {
        if self.holder_is_funder {
            self.to_holder_sat
        } else {
            self.to_counterparty_sat
        }
    }
}

/// Build the closing transaction paying `fee_sat`.  Both sides build the
/// same transaction from their own view.
pub fn build_closing_tx(params: &ClosingParams, fee_sat: u64) -> Transaction {
    let (to_holder, to_counterparty) = if params.holder_is_funder {
        (params.to_holder_sat.saturating_sub(fee_sat), params.to_counterparty_sat)
    } else {
        (params.to_holder_sat, params.to_counterparty_sat.saturating_sub(fee_sat))
    };
    let mut outputs = Vec::with_capacity(2);
    if to_holder >= params.dust_limit_sat {
        outputs.push(TxOut {
            value: Amount::from_sat(to_holder),
            script_pubkey: params.holder_script.clone(),
        });
    }
    if to_counterparty >= params.dust_limit_sat {
        outputs.push(TxOut {
            value: Amount::from_sat(to_counterparty),
            script_pubkey: params.counterparty_script.clone(),
        });
    }
    sort_outputs(&mut outputs);
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: vec![TxIn {
            previous_output: params.funding_outpoint,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        }],
        output: outputs,
    }
}

/// The fee of the closing transaction at `feerate_per_kw`
pub fn closing_fee_sat(params: &ClosingParams, feerate_per_kw: u32) -> u64 {
    let weight = mutual_close_tx_weight(&build_closing_tx(params, 0));
    fee_for_weight(feerate_per_kw, weight).min(params.funder_balance_sat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use bitcoin::Txid;

    fn params(holder_is_funder: bool) -> ClosingParams {
        ClosingParams {
            funding_outpoint: OutPoint { txid: Txid::all_zeros(), vout: 0 },
            to_holder_sat: 700_000,
            to_counterparty_sat: 300_000,
            holder_script: ScriptBuf::from_bytes(vec![0x51]),
            counterparty_script: ScriptBuf::from_bytes(vec![0x52]),
            holder_is_funder,
            dust_limit_sat: 354,
        }
    }

    #[test]
    fn funder_pays_closing_fee_test() {
        let tx = build_closing_tx(&params(true), 1_000);
        let values: Vec<u64> = tx.output.iter().map(|o| o.value.to_sat()).collect();
        assert_eq!(values, vec![300_000, 699_000]);
        let tx = build_closing_tx(&params(false), 1_000);
        let values: Vec<u64> = tx.output.iter().map(|o| o.value.to_sat()).collect();
        assert_eq!(values, vec![299_000, 700_000]);
    }

    #[test]
    fn fee_scales_with_feerate_test() {
        let low = closing_fee_sat(&params(true), 253);
        let high = closing_fee_sat(&params(true), 2530);
        assert!(low > 0);
        assert!(high >= low * 10 && high <= low * 10 + 10);
    }

    #[test]
    fn fee_capped_at_funder_balance_test() {
        let mut poor = params(false);
        poor.to_counterparty_sat = 500;
        assert_eq!(poor.funder_balance_sat(), 500);
        assert_eq!(params(true).funder_balance_sat(), 700_000);
        assert_eq!(closing_fee_sat(&poor, 100_000), 500);
    }
}
