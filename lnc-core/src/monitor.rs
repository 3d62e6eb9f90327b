use bitcoin::{Transaction, Txid};
use tracing::*;

use crate::channel::{Channel, ChannelId, ChannelStatus, CloseKind};
use crate::error::{Error, Result};
use crate::node::{ClosingSpend, Node};

/// What a [`ChainWatcher::poll`] observed or did
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    /// Nothing changed
    Nothing,
    /// The funding transaction still needs confirmations
    FundingConfirmations { remaining: u32 },
    /// Our delayed output becomes spendable after this many blocks
    WaitingForTimelock { remaining_blocks: u32 },
    /// The sweep of our delayed output was broadcast
    SweepBroadcast { txid: Txid },
    /// A claim or justice transaction answering the peer's commitment was
    /// broadcast
    ResponseBroadcast { kind: CloseKind, txid: Txid },
    /// The channel reached `Closed`
    Closed { closing_txid: Txid, kind: CloseKind },
}

/// Reconciles stored channels with the chain
pub struct ChainWatcher<'a> {
    node: &'a Node,
}

impl<'a> ChainWatcher<'a> {
    pub(crate) fn new(node: &'a Node) -> Self {
        ChainWatcher { node }
    }

    async fn confirmations(&self, txid: &Txid) -> Result<u32> {
        Ok(self.node.chain.get_confirmations(txid).await?.unwrap_or(0))
    }

    /// Broadcast, treating a lost race against a conflicting spend as done
    async fn broadcast(&self, tx: &Transaction) -> Result<Txid> {
        match self.node.chain.broadcast_transaction(tx).await {
            Ok(txid) => Ok(txid),
            Err(e) => {
                let err = Error::from(e);
                if err.is_broadcast_race() {
                    warn!("broadcast of {} lost a race: {}", tx.compute_txid(), err);
                    Ok(tx.compute_txid())
                } else {
                    Err(err)
                }
            }
        }
    }

    /// Record the remaining funding confirmations in the status.  The
    /// funding transaction is rebroadcast if the chain does not know it.
    async fn update_remaining(&self, channel: &mut Channel) -> Result<u32> {
        let funding_txid = match channel.status {
            ChannelStatus::FundingBroadcastButNotLocked { funding_txid, .. } => funding_txid,
            _ => return Ok(0),
        };
        let confirmations = match self.node.chain.get_confirmations(&funding_txid).await? {
            Some(n) => n,
            None => {
                if let Some(tx) = &channel.funding_tx {
                    info!("channel {} rebroadcasting funding {}", channel.id, funding_txid);
                    self.broadcast(tx).await?;
                }
                0
            }
        };
        let remaining = channel.setup.minimum_depth.saturating_sub(confirmations);
        let status =
            ChannelStatus::FundingBroadcastButNotLocked { funding_txid, remaining_confirmations: remaining };
        if channel.status != status {
            channel.status = status;
            self.node.store.save(channel)?;
        }
        Ok(remaining)
    }

    /// Confirmations the funding transaction still needs, zero once the
    /// channel is past funding
    #[instrument(skip(self))]
    pub async fn get_remaining_confirmations(&self, id: &ChannelId) -> Result<u32> {
        let _guard = self.node.lock_channel(id).await;
        let mut channel = self.node.store.load(id)?;
        self.update_remaining(&mut channel).await
    }

    /// Poll until the funding transaction is deep enough, at most
    /// `max_attempts` times
    pub async fn wait_for_funding_confirmations(&self, id: &ChannelId, max_attempts: u32) -> Result<bool> {
        for _ in 0..max_attempts {
            let remaining = self.get_remaining_confirmations(id).await?;
            if remaining == 0 {
                return Ok(true);
            }
            debug!("channel {} waiting for {} confirmations", id, remaining);
            self.node.sleeper.sleep(self.node.config.poll_interval()).await;
        }
        Ok(self.get_remaining_confirmations(id).await? == 0)
    }

    /// A spend of the funding output that is neither our cooperative close
    /// nor one of our commitments
    pub async fn detect_foreign_spend(&self, id: &ChannelId) -> Result<Option<ClosingSpend>> {
        let channel = self.node.store.load(id)?;
        let spend = self.node.classify_funding_spend(&channel).await?;
        Ok(spend.filter(|s| is_foreign(&channel, s)))
    }

    /// Blocks until our delayed output can be swept, `None` unless we force
    /// closed
    pub async fn timelock_remaining(&self, id: &ChannelId) -> Result<Option<u32>> {
        let channel = self.node.store.load(id)?;
        match &channel.status {
            ChannelStatus::LocallyForceClosed { to_self_delay, commitment_tx, .. } => {
                let confirmations = self.confirmations(&commitment_tx.compute_txid()).await?;
                Ok(Some(blocks_until_spendable(*to_self_delay, confirmations)))
            }
            _ => Ok(None),
        }
    }

    /// Observe the chain once for the channel and act on it
    #[instrument(skip(self))]
    pub async fn poll(&self, id: &ChannelId) -> Result<WatchEvent> {
        let _guard = self.node.lock_channel(id).await;
        let mut channel = self.node.store.load(id)?;
        match channel.status.clone() {
            ChannelStatus::FundingBroadcastButNotLocked { .. } => {
                let remaining = self.update_remaining(&mut channel).await?;
                Ok(WatchEvent::FundingConfirmations { remaining })
            }
            ChannelStatus::Active => match self.node.classify_funding_spend(&channel).await? {
                Some(spend) => self.respond(&mut channel, spend).await,
                None => Ok(WatchEvent::Nothing),
            },
            ChannelStatus::Closing { closing_tx } => {
                match self.node.classify_funding_spend(&channel).await? {
                    None => {
                        self.broadcast(&closing_tx).await?;
                        Ok(WatchEvent::Nothing)
                    }
                    Some(spend) => self.respond(&mut channel, spend).await,
                }
            }
            ChannelStatus::LocallyForceClosed { to_self_delay, commitment_tx, sweep_tx } => {
                let commitment_txid = commitment_tx.compute_txid();
                match self.node.classify_funding_spend(&channel).await? {
                    None => {
                        self.broadcast(&commitment_tx).await?;
                        return Ok(WatchEvent::WaitingForTimelock {
                            remaining_blocks: to_self_delay as u32,
                        });
                    }
                    Some(spend) if spend.spending_tx().compute_txid() != commitment_txid => {
                        warn!("channel {} funding spent by another transaction", id);
                        return self.respond(&mut channel, spend).await;
                    }
                    Some(_) => {}
                }
                self.advance_local_close(&mut channel, to_self_delay, commitment_txid, sweep_tx).await
            }
            ChannelStatus::Closed { .. } => Ok(WatchEvent::Nothing),
        }
    }

    async fn advance_local_close(
        &self,
        channel: &mut Channel,
        to_self_delay: u16,
        commitment_txid: Txid,
        sweep_tx: Option<Transaction>,
    ) -> Result<WatchEvent> {
        let confirmations = self.confirmations(&commitment_txid).await?;
        let sweep_tx = match sweep_tx {
            Some(tx) => tx,
            None => {
                if confirmations == 0 {
                    return Ok(WatchEvent::Nothing);
                }
                return self.mark_closed(channel, commitment_txid, CloseKind::LocalForceClose);
            }
        };
        let remaining_blocks = blocks_until_spendable(to_self_delay, confirmations);
        if remaining_blocks > 0 {
            return Ok(WatchEvent::WaitingForTimelock { remaining_blocks });
        }
        let sweep_txid = sweep_tx.compute_txid();
        if self.confirmations(&sweep_txid).await? > 0 {
            return self.mark_closed(channel, commitment_txid, CloseKind::LocalForceClose);
        }
        let txid = self.broadcast(&sweep_tx).await?;
        info!("channel {} sweep {} broadcast", channel.id, txid);
        Ok(WatchEvent::SweepBroadcast { txid })
    }

    async fn respond(&self, channel: &mut Channel, spend: ClosingSpend) -> Result<WatchEvent> {
        let spending_txid = spend.spending_tx().compute_txid();
        let kind = spend.kind();
        match spend {
            ClosingSpend::Cooperative { .. } => {
                if self.confirmations(&spending_txid).await? > 0 {
                    return self.mark_closed(channel, spending_txid, kind);
                }
                Ok(WatchEvent::Nothing)
            }
            ClosingSpend::LocalCommitment { commitment_tx } => {
                let record = channel.current_holder().clone();
                if record.txid == spending_txid {
                    let keys = self.node.channel_keys(channel)?;
                    let status = self.node.local_close_status(channel, &keys, &record).await?;
                    channel.status = status;
                    self.node.store.save(channel)?;
                    warn!("channel {} our commitment {} is on chain", channel.id, spending_txid);
                    let to_self_delay = channel.setup.counterparty_selected_contest_delay;
                    let confirmations = self.confirmations(&spending_txid).await?;
                    return Ok(WatchEvent::WaitingForTimelock {
                        remaining_blocks: blocks_until_spendable(to_self_delay, confirmations),
                    });
                }
                error!("channel {} revoked commitment {} of ours is on chain", channel.id, spending_txid);
                if self.confirmations(&commitment_tx.compute_txid()).await? > 0 {
                    return self.mark_closed(channel, spending_txid, kind);
                }
                Ok(WatchEvent::Nothing)
            }
            ClosingSpend::CounterpartyCommitment { claim_tx: response, .. }
            | ClosingSpend::RevokedCommitment { justice_tx: response, .. } => {
                let response = match response {
                    Some(tx) => tx,
                    None => {
                        if self.confirmations(&spending_txid).await? > 0 {
                            return self.mark_closed(channel, spending_txid, kind);
                        }
                        return Ok(WatchEvent::Nothing);
                    }
                };
                if self.is_settled(&response).await? {
                    return self.mark_closed(channel, spending_txid, kind);
                }
                let txid = self.broadcast(&response).await?;
                info!("channel {} {:?} answered with {}", channel.id, kind, txid);
                Ok(WatchEvent::ResponseBroadcast { kind, txid })
            }
        }
    }

    /// Every input of `tx` is spent by a confirmed transaction, ours or a
    /// competing one
    async fn is_settled(&self, tx: &Transaction) -> Result<bool> {
        for input in &tx.input {
            match self.node.chain.get_spending_tx(&input.previous_output).await? {
                Some(spender) if self.confirmations(&spender.compute_txid()).await? > 0 => {}
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    fn mark_closed(&self, channel: &mut Channel, closing_txid: Txid, kind: CloseKind) -> Result<WatchEvent> {
        channel.status = ChannelStatus::Closed { closing_txid, kind };
        self.node.store.save(channel)?;
        info!("channel {} closed ({:?}) by {}", channel.id, kind, closing_txid);
        Ok(WatchEvent::Closed { closing_txid, kind })
    }
}

fn is_foreign(channel: &Channel, spend: &ClosingSpend) -> bool {
    match spend {
        ClosingSpend::LocalCommitment { .. } => false,
        ClosingSpend::Cooperative { closing_tx } => match &channel.status {
            ChannelStatus::Closing { closing_tx: ours } => ours != closing_tx,
            _ => true,
        },
        _ => true,
    }
}

/// A CSV-locked output of a transaction with `confirmations` can be spent
/// in the next block once `confirmations >= to_self_delay`
fn blocks_until_spendable(to_self_delay: u16, confirmations: u32) -> u32 {
    if confirmations == 0 {
        return to_self_delay as u32;
    }
    (to_self_delay as u32).saturating_sub(confirmations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn blocks_until_spendable_test() {
        assert_eq!(blocks_until_spendable(144, 0), 144);
        assert_eq!(blocks_until_spendable(144, 1), 143);
        assert_eq!(blocks_until_spendable(144, 144), 0);
        assert_eq!(blocks_until_spendable(5, 200), 0);
    }
}
