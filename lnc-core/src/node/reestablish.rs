use lnc_protocol::msgs::{ChannelReestablish, CommitmentSigned};
use tracing::*;

use super::{check_channel_id, expect_message, Node};
use crate::channel::{Channel, ChannelId, CounterpartyCommitmentRecord};
use crate::error::{internal_error, protocol_error, Result};
use crate::keys::ChannelKeys;
use crate::peer::PeerConnection;

/// What each side still owes the other after a reconnection.
///
/// Both sides end on the higher of the two holder commitment numbers.  The
/// side that is behind gets the lost `commitment_signed` again, and every
/// revocation the other side has not seen is sent again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Resync {
    /// Holder commitment number of both sides once done
    pub settled_number: u64,
    pub resend_commitment_signed: bool,
    pub expect_commitment_signed: bool,
    pub send_revocation: bool,
    pub expect_revocation: bool,
}

impl Resync {
    /// `holder` and `counterparty` are our current commitment number and
    /// our view of theirs.  `their_holder` and `their_counterparty` are the
    /// same from the peer's side.  `None` if the two states are more than
    /// one exchange apart.
    pub fn plan(holder: u64, counterparty: u64, their_holder: u64, their_counterparty: u64) -> Option<Resync> {
        if holder.abs_diff(their_holder) > 1 {
            return None;
        }
        let settled_number = holder.max(their_holder);
        let in_reach = |view: u64| view == settled_number || view + 1 == settled_number;
        if !in_reach(counterparty) || !in_reach(their_counterparty) {
            return None;
        }
        Some(Resync {
            settled_number,
            resend_commitment_signed: their_holder + 1 == holder,
            expect_commitment_signed: holder + 1 == their_holder,
            send_revocation: their_counterparty + 1 == settled_number,
            expect_revocation: counterparty + 1 == settled_number,
        })
    }
}

impl Node {
    /// Bring the channel back in step with the peer after a lost
    /// connection.  Both sides call this on the new connection before any
    /// other update.
    ///
    /// An exchange interrupted before the peer stored anything is dropped,
    /// one the peer already stored is completed.
    #[instrument(skip(self, conn))]
    pub async fn reestablish_channel(&self, conn: PeerConnection, id: &ChannelId) -> Result<PeerConnection> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_active()?;
        let keys = self.channel_keys(&channel)?;
        let holder = channel.current_holder().number;
        let counterparty = channel.commitments.counterparty_commitment_number;

        let conn = conn
            .send(ChannelReestablish {
                channel_id: id.0,
                next_commitment_number: holder + 1,
                next_revocation_number: counterparty,
            })
            .await?;
        let (mut conn, theirs) = expect_message!(conn, ChannelReestablish);
        check_channel_id(id, &theirs.channel_id)?;
        let their_holder = theirs
            .next_commitment_number
            .checked_sub(1)
            .ok_or_else(|| protocol_error("channel_reestablish with next_commitment_number 0"))?;
        let plan = match Resync::plan(holder, counterparty, their_holder, theirs.next_revocation_number) {
            Some(plan) => plan,
            None => {
                error!(
                    "channel {} at {}/{} cannot resume with peer at {}/{}",
                    id, holder, counterparty, their_holder, theirs.next_revocation_number
                );
                return Err(channel.invalid_state("commitments within one exchange of the peer"));
            }
        };
        debug!("channel {} resync {:?}", id, plan);

        if plan.resend_commitment_signed {
            conn = self.resend_commitment_signed(conn, &channel, &keys).await?;
        }
        if plan.expect_commitment_signed {
            conn = self.complete_interrupted_exchange(conn, &mut channel, &keys).await?;
        } else if channel.commitments.pending_update.take().is_some() {
            info!("channel {} dropping update the peer never stored", id);
            self.store.save(&channel)?;
        }
        if plan.send_revocation {
            conn = self.send_revocation(conn, &channel, &keys, plan.settled_number - 1).await?;
        }
        if plan.expect_revocation {
            let (c, revoke) = expect_message!(conn, RevokeAndAck);
            conn = c;
            check_channel_id(id, &revoke.channel_id)?;
            channel.apply_counterparty_revocation(
                &self.secp_ctx,
                revoke.per_commitment_secret,
                revoke.next_per_commitment_point,
            )?;
            self.store.save(&channel)?;
        }
        info!("channel {} reestablished at commitment {}", id, plan.settled_number);
        Ok(conn)
    }

    /// Sign again the counterparty commitment we stored during the
    /// exchange the peer lost
    async fn resend_commitment_signed(
        &self,
        conn: PeerConnection,
        channel: &Channel,
        keys: &ChannelKeys,
    ) -> Result<PeerConnection> {
        let holder_points = keys.points(&self.secp_ctx);
        let number = channel.current_holder().number;
        let recorded = channel
            .commitments
            .counterparty_commitments
            .iter()
            .find(|r| r.number == number)
            .ok_or_else(|| internal_error(format!("no signed counterparty commitment {}", number)))?;
        let point = channel
            .commitments
            .counterparty_next_point
            .ok_or_else(|| internal_error("no counterparty point for the next commitment"))?;
        let built = channel.setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            number,
            &point,
            &channel.current_values(),
        );
        if built.tx.compute_txid() != recorded.txid {
            return Err(internal_error(format!(
                "rebuilt counterparty commitment {} does not match recorded txid",
                number
            )));
        }
        let signature = channel.setup.sign_funding_spend(&self.secp_ctx, keys, &built.tx)?;
        debug!("channel {} resending signature of counterparty commitment {}", channel.id, number);
        Ok(conn.send(CommitmentSigned { channel_id: channel.id.0, signature }).await?)
    }

    /// Receive the peer's signature over the commitment we proposed before
    /// the connection was lost, and record both new commitments
    async fn complete_interrupted_exchange(
        &self,
        conn: PeerConnection,
        channel: &mut Channel,
        keys: &ChannelKeys,
    ) -> Result<PeerConnection> {
        let values = match channel.commitments.pending_update {
            Some(values) => values,
            None => return Err(channel.invalid_state("a stored pending update")),
        };
        let (conn, commitment_signed) = expect_message!(conn, CommitmentSigned);
        check_channel_id(&channel.id, &commitment_signed.channel_id)?;
        let number = channel.current_holder().number + 1;
        let record = self.verify_holder_commitment(channel, keys, number, values, &commitment_signed)?;

        let holder_points = keys.points(&self.secp_ctx);
        let counterparty_number = channel.commitments.counterparty_commitment_number + 1;
        let point = channel
            .commitments
            .counterparty_next_point
            .ok_or_else(|| internal_error("no counterparty point for the next commitment"))?;
        let counterparty_tx = channel.setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            counterparty_number,
            &point,
            &values,
        );
        channel.push_holder_commitment(record);
        channel.commitments.counterparty_commitments.push(CounterpartyCommitmentRecord {
            number: counterparty_number,
            txid: counterparty_tx.tx.compute_txid(),
        });
        channel.commitments.pending_update = None;
        self.store.save(channel)?;
        info!("channel {} completed interrupted exchange at commitment {}", channel.id, number);
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn plan(holder: u64, counterparty: u64, their_holder: u64, their_counterparty: u64) -> Option<Resync> {
        Resync::plan(holder, counterparty, their_holder, their_counterparty)
    }

    #[test]
    fn in_step_test() {
        let settled = plan(4, 4, 4, 4).unwrap();
        assert_eq!(settled.settled_number, 4);
        assert!(!settled.resend_commitment_signed && !settled.expect_commitment_signed);
        assert!(!settled.send_revocation && !settled.expect_revocation);
    }

    #[test]
    fn initiator_lost_everything_test() {
        // the responder stored commitment 5 and revoked 4, we never saw it
        let ours = plan(4, 4, 5, 4).unwrap();
        assert!(ours.expect_commitment_signed && ours.send_revocation && ours.expect_revocation);
        assert!(!ours.resend_commitment_signed);
        let theirs = plan(5, 4, 4, 4).unwrap();
        assert!(theirs.resend_commitment_signed && theirs.send_revocation && theirs.expect_revocation);
        assert_eq!(ours.settled_number, theirs.settled_number);
    }

    #[test]
    fn revocations_missing_test() {
        // neither revocation arrived
        let both = plan(5, 4, 5, 4).unwrap();
        assert!(both.send_revocation && both.expect_revocation);
        // only ours is missing at the peer
        let ours = plan(5, 5, 5, 4).unwrap();
        assert!(ours.send_revocation && !ours.expect_revocation);
        let theirs = plan(5, 4, 5, 5).unwrap();
        assert!(!theirs.send_revocation && theirs.expect_revocation);
    }

    #[test]
    fn unreachable_states_test() {
        assert_eq!(plan(3, 3, 5, 5), None);
        assert_eq!(plan(5, 3, 5, 5), None);
        assert_eq!(plan(5, 5, 5, 6), None);
    }
}
