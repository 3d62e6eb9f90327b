use lnc_protocol::msgs::UpdatePayment;
use tracing::*;

use super::commitment::Exchange;
use super::{check_channel_id, expect_message, send_warning, Node};
use crate::channel::{ChannelId, CommitmentValues};
use crate::error::{Error, Result};
use crate::peer::PeerConnection;

impl Node {
    /// Pay `amount_sat` to the peer over the channel.
    ///
    /// The amount must not exceed what we can spend while keeping our
    /// reserve and, as funder, the commitment fee.
    #[instrument(skip(self, conn))]
    pub async fn send_monohop_payment(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
        amount_sat: u64,
    ) -> Result<PeerConnection> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_settled()?;
        let available = channel.spendable_sat();
        if amount_sat == 0 || amount_sat > available {
            warn!("channel {} cannot send {} sat, {} available", id, amount_sat, available);
            return Err(Error::InsufficientFunds { requested_sat: amount_sat, available_sat: available });
        }
        let keys = self.channel_keys(&channel)?;
        let current = channel.current_values();
        let values = CommitmentValues {
            to_holder_sat: current.to_holder_sat - amount_sat,
            to_counterparty_sat: current.to_counterparty_sat + amount_sat,
            feerate_per_kw: current.feerate_per_kw,
        };

        let conn = conn.send(UpdatePayment { channel_id: id.0, amount_satoshis: amount_sat }).await?;
        match self.initiate_commitment_exchange(conn, &mut channel, &keys, values).await? {
            Exchange::Completed(conn) => {
                info!("channel {} sent {} sat", id, amount_sat);
                Ok(conn)
            }
            Exchange::Rejected(_, reason) => Err(Error::PeerRejected(reason)),
        }
    }

    /// Receive a payment from the peer, returning the amount.
    ///
    /// A payment larger than the peer can spend is refused with a warning.
    #[instrument(skip(self, conn))]
    pub async fn receive_monohop_payment(
        &self,
        conn: PeerConnection,
        id: &ChannelId,
    ) -> Result<(PeerConnection, u64)> {
        let _guard = self.lock_channel(id).await;
        let mut channel = self.store.load(id)?;
        channel.ensure_settled()?;
        let (conn, update) = expect_message!(conn, UpdatePayment);
        check_channel_id(id, &update.channel_id)?;
        let (conn, commitment_signed) = expect_message!(conn, CommitmentSigned);
        check_channel_id(id, &commitment_signed.channel_id)?;

        let amount_sat = update.amount_satoshis;
        let available = channel.counterparty_spendable_sat();
        if amount_sat == 0 || amount_sat > available {
            let reason = format!("payment of {} sat exceeds the {} sat you can send", amount_sat, available);
            send_warning(conn, id, &reason).await?;
            return Err(Error::PeerProtocol(reason));
        }
        let keys = self.channel_keys(&channel)?;
        let current = channel.current_values();
        let values = CommitmentValues {
            to_holder_sat: current.to_holder_sat + amount_sat,
            to_counterparty_sat: current.to_counterparty_sat - amount_sat,
            feerate_per_kw: current.feerate_per_kw,
        };
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
        info!("channel {} received {} sat", id, amount_sat);
        Ok((conn, amount_sat))
    }
}
