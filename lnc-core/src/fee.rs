use tracing::*;

use crate::chain::ChainSource;
use crate::config::FeePolicy;

/// Ask the chain for a fee rate, falling back to the configured rate.
/// Never below the policy floor.
pub async fn estimate_feerate(chain: &dyn ChainSource, policy: &FeePolicy) -> u32 {
    let estimate = match chain.estimate_feerate_per_kw(policy.confirmation_target).await {
        Some(rate) => rate,
        None => {
            debug!("no fee estimate, using fallback {}", policy.fallback_feerate_per_kw);
            policy.fallback_feerate_per_kw
        }
    };
    estimate.max(policy.min_feerate_per_kw)
}

/// Whether `current` has drifted from `estimate` by more than the threshold
pub fn feerate_drift_exceeds(current: u32, estimate: u32, threshold_percent: u32) -> bool {
    let diff = (current as u64).abs_diff(estimate as u64);
    diff * 100 > current as u64 * threshold_percent as u64
}

/// Check a fee rate proposed by the peer against our estimate
pub fn check_feerate_bounds(proposed: u32, estimate: u32, policy: &FeePolicy) -> Result<(), String> {
    if proposed < policy.min_feerate_per_kw {
        return Err(format!(
            "feerate {} below minimum {}",
            proposed, policy.min_feerate_per_kw
        ));
    }
    let ratio = policy.max_feerate_ratio as u64;
    if (proposed as u64) * ratio < estimate as u64 {
        return Err(format!("feerate {} too low, estimate is {}", proposed, estimate));
    }
    if proposed as u64 > estimate as u64 * ratio {
        return Err(format!("feerate {} too high, estimate is {}", proposed, estimate));
    }
    Ok(())
}

/// Whether a closing fee offered by the peer is close enough to ours
pub fn closing_fee_acceptable(offered_sat: u64, ours_sat: u64, policy: &FeePolicy) -> bool {
    let ratio = policy.max_feerate_ratio as u64;
    offered_sat.saturating_mul(ratio) >= ours_sat && offered_sat <= ours_sat.saturating_mul(ratio)
}

/// A counter-proposal strictly between our last offer and theirs, moving
/// toward theirs.  Equal to theirs once the two are adjacent.
pub fn next_closing_fee(ours_sat: u64, theirs_sat: u64) -> u64 {
    let mid = ours_sat.min(theirs_sat) + ours_sat.abs_diff(theirs_sat) / 2;
    if mid == ours_sat {
        theirs_sat
    } else {
        mid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ChainError;
    use async_trait::async_trait;
    use bitcoin::{OutPoint, Transaction, Txid};

    struct FixedEstimate(Option<u32>);

    #[async_trait]
    impl ChainSource for FixedEstimate {
        async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, ChainError> {
            Ok(tx.compute_txid())
        }
        async fn estimate_feerate_per_kw(&self, _target: u16) -> Option<u32> {
            self.0
        }
        async fn get_confirmations(&self, _txid: &Txid) -> Result<Option<u32>, ChainError> {
            Ok(None)
        }
        async fn get_spending_tx(&self, _op: &OutPoint) -> Result<Option<Transaction>, ChainError> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn estimate_fallback_test() {
        let policy = FeePolicy::default();
        assert_eq!(estimate_feerate(&FixedEstimate(Some(5000)), &policy).await, 5000);
        assert_eq!(estimate_feerate(&FixedEstimate(Some(100)), &policy).await, 253);
        assert_eq!(estimate_feerate(&FixedEstimate(None), &policy).await, 2500);
    }

    #[test]
    fn drift_test() {
        assert!(!feerate_drift_exceeds(1000, 1200, 20));
        assert!(feerate_drift_exceeds(1000, 1201, 20));
        assert!(feerate_drift_exceeds(1000, 799, 20));
        assert!(!feerate_drift_exceeds(1000, 1000, 0));
    }

    #[test]
    fn bounds_test() {
        let policy = FeePolicy::default();
        assert!(check_feerate_bounds(4000, 1000, &policy).is_ok());
        assert!(check_feerate_bounds(10_000, 1000, &policy).is_ok());
        assert!(check_feerate_bounds(10_001, 1000, &policy).is_err());
        assert!(check_feerate_bounds(253, 5000, &policy).is_err());
        assert!(check_feerate_bounds(200, 200, &policy).is_err());
    }

    #[test]
    fn closing_fee_convergence_test() {
        let (mut ours, theirs) = (1000u64, 2000u64);
        let mut rounds = 0;
        while ours != theirs {
            ours = next_closing_fee(ours, theirs);
            rounds += 1;
        }
        assert!(rounds <= 11);
        assert_eq!(next_closing_fee(1000, 1001), 1001);
        assert_eq!(next_closing_fee(2000, 1000), 1500);
        assert!(closing_fee_acceptable(1500, 1000, &FeePolicy::default()));
        assert!(!closing_fee_acceptable(50, 1000, &FeePolicy::default()));
    }

    #[test]
    fn closing_fee_extremes_test() {
        let policy = FeePolicy::default();
        assert!(!closing_fee_acceptable(u64::MAX, 1000, &policy));
        assert!(closing_fee_acceptable(u64::MAX, u64::MAX, &policy));
        assert!(!closing_fee_acceptable(1, u64::MAX, &policy));
        assert_eq!(next_closing_fee(1000, u64::MAX), 1000 + (u64::MAX - 1000) / 2);
        assert_eq!(next_closing_fee(u64::MAX, u64::MAX - 1), u64::MAX - 1);
        assert_eq!(next_closing_fee(u64::MAX - 1, u64::MAX), u64::MAX);
    }
}
