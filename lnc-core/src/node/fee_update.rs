use lnc_protocol::msgs::UpdateFee;
use tracing::*;

use super::commitment::Exchange;
use super::{check_channel_id, expect_message, send_warning, Node};
use crate::channel::{Channel, ChannelId, CommitmentValues};
use crate::error::{policy_error, Result};
use crate::fee::{check_feerate_bounds, estimate_feerate};
use crate::peer::PeerConnection;
use crate::util::transaction_utils::commitment_fee_sat;

/// How a fee update ended.  A refusal leaves the channel usable at its
/// previous fee rate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeeUpdateOutcome {
    /// Both commitments now use the new rate
    Accepted,
    /// One side refused the rate, nothing changed
    Rejected(String),
}

/// Whether the funder can pay the commitment fee at `feerate_per_kw` and
/// keep its reserve
fn funder_can_afford(channel: &Channel, feerate_per_kw: u32) -> core::result::Result<(), String> {
    let values = channel.current_values();
    let (balance, reserve) = if channel.setup.is_outbound {
        (values.to_holder_sat, channel.setup.holder_reserve_sat)
    } else {
        (values.to_counterparty_sat, channel.setup.counterparty_reserve_sat)
    };
    let fee = commitment_fee_sat(feerate_per_kw);
    if balance < fee + reserve {
        return Err(format!(
            "funder balance {} cannot pay fee {} and keep reserve {}",
            balance, fee, reserve
        ));
    }
    Ok(())
}

impl Node {
    /// Move the channel to a new commitment fee rate.  Only the funder
    /// proposes fee rates.
    #[instrument(skip(self, conn))]
    pub async fn update_fee(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
        feerate_per_kw: u32,
    ) -> Result<(PeerConnection, FeeUpdateOutcome)> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_settled()?;
        if !channel.setup.is_outbound {
            return Err(policy_error(format!("channel {} was funded by the peer", id)));
        }
        if feerate_per_kw < self.config.fees.min_feerate_per_kw {
            return Err(policy_error(format!(
                "feerate {} below minimum {}",
                feerate_per_kw, self.config.fees.min_feerate_per_kw
            )));
        }
        funder_can_afford(&channel, feerate_per_kw).map_err(policy_error)?;
        let keys = self.channel_keys(&channel)?;
        let values = CommitmentValues { feerate_per_kw, ..channel.current_values() };

        let conn = conn.send(UpdateFee { channel_id: id.0, feerate_per_kw }).await?;
        match self.initiate_commitment_exchange(conn, &mut channel, &keys, values).await? {
            Exchange::Completed(conn) => {
                info!("channel {} feerate now {}", id, feerate_per_kw);
                Ok((conn, FeeUpdateOutcome::Accepted))
            }
            Exchange::Rejected(conn, reason) => Ok((conn, FeeUpdateOutcome::Rejected(reason))),
        }
    }

    /// Take part in a fee update proposed by the funder.
    ///
    /// A rate too far from our estimate, or one the funder cannot afford,
    /// is refused with a warning and yields [`FeeUpdateOutcome::Rejected`].
    #[instrument(skip(self, conn))]
    pub async fn accept_update_fee(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
    ) -> Result<(PeerConnection, FeeUpdateOutcome)> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_settled()?;
        let (conn, update) = expect_message!(conn, UpdateFee);
        check_channel_id(id, &update.channel_id)?;
        let (conn, commitment_signed) = expect_message!(conn, CommitmentSigned);
        check_channel_id(id, &commitment_signed.channel_id)?;

        let proposed = update.feerate_per_kw;
        let estimate = estimate_feerate(self.chain.as_ref(), &self.config.fees).await;
        let checked = if channel.setup.is_outbound {
            Err("only the funder may update the fee".to_string())
        } else {
            check_feerate_bounds(proposed, estimate, &self.config.fees)
                .and_then(|_| funder_can_afford(&channel, proposed))
        };
        if let Err(reason) = checked {
            let conn = send_warning(conn, id, &reason).await?;
            return Ok((conn, FeeUpdateOutcome::Rejected(reason)));
        }

        let keys = self.channel_keys(&channel)?;
        let values = CommitmentValues { feerate_per_kw: proposed, ..channel.current_values() };
        let number = channel.current_holder().number + 1;
        let record =
            match self.verify_holder_commitment(&channel, &keys, number, values, &commitment_signed) {
                Ok(record) => record,
                Err(e) => {
                    send_warning(conn, id, "invalid commitment signature").await?;
                    return Err(e);
                }
            };
        let conn = self.respond_commitment_exchange(conn, &mut channel, &keys, record).await?;
        info!("channel {} feerate now {}", id, proposed);
        Ok((conn, FeeUpdateOutcome::Accepted))
    }

    /// Poll stored state until the channel's fee rate equals `target`.
    /// Gives up after the configured number of attempts.
    pub async fn await_fee_convergence(&self, id: &ChannelId, target: u32) -> Result<bool> {
        for attempt in 0..self.config.fees.convergence_max_attempts {
            let snapshot = self.store.channel_info(id)?;
            if snapshot.feerate_per_kw == target {
                return Ok(true);
            }
            trace!("channel {} feerate {} != {}, attempt {}", id, snapshot.feerate_per_kw, target, attempt);
            self.sleeper.sleep(self.config.poll_interval()).await;
        }
        Ok(self.store.channel_info(id)?.feerate_per_kw == target)
    }
}
