use lnc_protocol::msgs::{ChannelMessage, CommitmentSigned, RevokeAndAck};
use tracing::*;

use super::{check_channel_id, expect_message, unexpected_message, Node};
use crate::channel::{Channel, CommitmentValues, CounterpartyCommitmentRecord, HolderCommitmentRecord};
use crate::error::{internal_error, Result};
use crate::keys::ChannelKeys;
use crate::peer::{describe_error_data, PeerConnection};

/// How the initiator's side of an exchange ended
pub(crate) enum Exchange {
    /// Both sides signed the new commitments and revoked the old ones
    Completed(PeerConnection),
    /// The peer answered with a warning, nothing changed
    Rejected(PeerConnection, String),
}

impl Node {
    /// Sign the counterparty's next commitment with `values` and run the
    /// exchange to the end.  The update message that motivates it must
    /// already be sent.
    ///
    /// Our own revocation goes out last, after the peer's signature on our
    /// new commitment and its revocation were both checked.
    pub(crate) async fn initiate_commitment_exchange(
        &self,
        conn: PeerConnection,
        channel: &mut Channel,
        keys: &ChannelKeys,
        values: CommitmentValues,
    ) -> Result<Exchange> {
        let holder_points = keys.points(&self.secp_ctx);
        let counterparty_number = channel.commitments.counterparty_commitment_number + 1;
        let counterparty_point = channel
            .commitments
            .counterparty_next_point
            .ok_or_else(|| internal_error("no counterparty point for the next commitment"))?;
        let counterparty_tx = channel.setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            counterparty_number,
            &counterparty_point,
            &values,
        );
        let signature = channel.setup.sign_funding_spend(&self.secp_ctx, keys, &counterparty_tx.tx)?;
        channel.commitments.pending_update = Some(values);
        self.store.save(channel)?;
        let conn = conn.send(CommitmentSigned { channel_id: channel.id.0, signature }).await?;

        let (conn, msg) = conn.receive_channel_message().await?;
        let commitment_signed = match msg {
            ChannelMessage::CommitmentSigned(m) => m,
            ChannelMessage::Warning(w) => {
                let reason = describe_error_data(&w.data);
                warn!("channel {} update rejected by peer: {}", channel.id, reason);
                channel.commitments.pending_update = None;
                self.store.save(channel)?;
                return Ok(Exchange::Rejected(conn, reason));
            }
            other => return Err(unexpected_message("CommitmentSigned", other)),
        };
        check_channel_id(&channel.id, &commitment_signed.channel_id)?;

        let old_number = channel.current_holder().number;
        let record = self.verify_holder_commitment(
            channel,
            keys,
            old_number + 1,
            values,
            &commitment_signed,
        )?;
        channel.push_holder_commitment(record);
        channel.commitments.counterparty_commitments.push(CounterpartyCommitmentRecord {
            number: counterparty_number,
            txid: counterparty_tx.tx.compute_txid(),
        });
        channel.commitments.pending_update = None;
        self.store.save(channel)?;

        let (conn, revoke) = expect_message!(conn, RevokeAndAck);
        check_channel_id(&channel.id, &revoke.channel_id)?;
        channel.apply_counterparty_revocation(
            &self.secp_ctx,
            revoke.per_commitment_secret,
            revoke.next_per_commitment_point,
        )?;
        self.store.save(channel)?;

        let conn = self.send_revocation(conn, channel, keys, old_number).await?;
        debug!("channel {} now at commitment {}", channel.id, old_number + 1);
        Ok(Exchange::Completed(conn))
    }

    /// Check the counterparty's signature over our next commitment, as
    /// received with an update.  Nothing is changed.
    pub(crate) fn verify_holder_commitment(
        &self,
        channel: &Channel,
        keys: &ChannelKeys,
        number: u64,
        values: CommitmentValues,
        commitment_signed: &CommitmentSigned,
    ) -> Result<HolderCommitmentRecord> {
        let holder_points = keys.points(&self.secp_ctx);
        let built = channel.setup.build_holder_commitment(&self.secp_ctx, keys, number, &values)?;
        channel.setup.verify_counterparty_funding_sig(
            &self.secp_ctx,
            &holder_points,
            &built.tx,
            &commitment_signed.signature,
            "commitment",
        )?;
        Ok(HolderCommitmentRecord {
            number,
            to_holder_sat: values.to_holder_sat,
            to_counterparty_sat: values.to_counterparty_sat,
            feerate_per_kw: values.feerate_per_kw,
            counterparty_sig: commitment_signed.signature,
            txid: built.tx.compute_txid(),
        })
    }

    /// Responder side of the exchange, once the peer's signature over our
    /// next commitment was verified into `record`.
    ///
    /// The new commitment is persisted before we sign theirs and revoke our
    /// previous one.
    pub(crate) async fn respond_commitment_exchange(
        &self,
        conn: PeerConnection,
        channel: &mut Channel,
        keys: &ChannelKeys,
        record: HolderCommitmentRecord,
    ) -> Result<PeerConnection> {
        let holder_points = keys.points(&self.secp_ctx);
        let values = CommitmentValues {
            to_holder_sat: record.to_holder_sat,
            to_counterparty_sat: record.to_counterparty_sat,
            feerate_per_kw: record.feerate_per_kw,
        };
        let old_number = channel.current_holder().number;
        let counterparty_number = channel.commitments.counterparty_commitment_number + 1;
        let counterparty_point = channel
            .commitments
            .counterparty_next_point
            .ok_or_else(|| internal_error("no counterparty point for the next commitment"))?;
        let counterparty_tx = channel.setup.build_counterparty_commitment(
            &self.secp_ctx,
            &holder_points,
            counterparty_number,
            &counterparty_point,
            &values,
        );
        let signature = channel.setup.sign_funding_spend(&self.secp_ctx, keys, &counterparty_tx.tx)?;

        channel.push_holder_commitment(record);
        channel.commitments.counterparty_commitments.push(CounterpartyCommitmentRecord {
            number: counterparty_number,
            txid: counterparty_tx.tx.compute_txid(),
        });
        self.store.save(channel)?;

        let conn = conn.send(CommitmentSigned { channel_id: channel.id.0, signature }).await?;
        let conn = self.send_revocation(conn, channel, keys, old_number).await?;

        let (conn, revoke) = expect_message!(conn, RevokeAndAck);
        check_channel_id(&channel.id, &revoke.channel_id)?;
        channel.apply_counterparty_revocation(
            &self.secp_ctx,
            revoke.per_commitment_secret,
            revoke.next_per_commitment_point,
        )?;
        self.store.save(channel)?;
        debug!("channel {} now at commitment {}", channel.id, old_number + 1);
        Ok(conn)
    }

    pub(crate) async fn send_revocation(
        &self,
        conn: PeerConnection,
        channel: &Channel,
        keys: &ChannelKeys,
        revoked_number: u64,
    ) -> Result<PeerConnection> {
        let per_commitment_secret = channel.release_holder_secret(keys, revoked_number)?;
        let next_per_commitment_point =
            keys.per_commitment_point(&self.secp_ctx, revoked_number + 2)?;
        let revoke = RevokeAndAck {
            channel_id: channel.id.0,
            per_commitment_secret,
            next_per_commitment_point,
        };
        Ok(conn.send(revoke).await?)
    }
}
