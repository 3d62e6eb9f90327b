use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bitcoin::secp256k1::{All, PublicKey, Secp256k1};
use bitcoin::Transaction;
use lnc_protocol::msgs::{ChannelMessage, Warning};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::*;

use crate::chain::{ChainSource, Wallet};
use crate::channel::{Channel, ChannelId};
use crate::clock::Sleeper;
use crate::config::NodeConfig;
use crate::error::{protocol_error, ConnectError, Error, Result};
use crate::keys::{ChannelKeys, KeysManager};
use crate::monitor::ChainWatcher;
use crate::peer::{describe_error_data, PeerConnection};
use crate::persist::ChannelPersist;
use crate::store::{ChannelSnapshot, ChannelStore};
use crate::transport::{Connector, Listener};

/// Receive the next channel message and require it to be `$variant`.  A
/// warning instead means the peer rejected what we sent.
macro_rules! expect_message {
    ($conn:expr, $variant:ident) => {{
        let (conn, msg) = $conn.receive_channel_message().await?;
        match msg {
            lnc_protocol::msgs::ChannelMessage::$variant(m) => (conn, m),
            other => return Err($crate::node::unexpected_message(stringify!($variant), other)),
        }
    }};
}
pub(crate) use expect_message;

/// Cooperative and unilateral closes, and reactions to the peer's closes
pub mod close;
/// The commitment signing and revocation exchange
pub mod commitment;
/// Fee rate updates
pub mod fee_update;
/// Channel opening, funding and locking
pub mod funding;
/// Direct payments
pub mod payment;
/// Resuming channels after a lost connection
pub mod reestablish;

pub use close::ClosingSpend;
pub use fee_update::FeeUpdateOutcome;
pub use funding::{FundingFees, PendingChannel};

pub(crate) fn unexpected_message(expected: &str, msg: ChannelMessage) -> Error {
    match msg {
        ChannelMessage::Warning(warning) => {
            let reason = describe_error_data(&warning.data);
            warn!("peer rejected with warning: {}", reason);
            Error::PeerRejected(reason)
        }
        other => protocol_error(format!("expected {}, got {}", expected, other.name())),
    }
}

pub(crate) fn check_channel_id(expected: &ChannelId, got: &[u8; 32]) -> Result<()> {
    if expected.as_bytes() != got {
        return Err(protocol_error(format!(
            "message for channel {}, expected {}",
            hex::encode(got),
            expected
        )));
    }
    Ok(())
}

/// Tell the peer we refuse its update
pub(crate) async fn send_warning(
    conn: PeerConnection,
    channel_id: &ChannelId,
    reason: &str,
) -> Result<PeerConnection> {
    warn!("rejecting update on channel {}: {}", channel_id, reason);
    let warning = Warning { channel_id: channel_id.0, data: reason.as_bytes().to_vec() };
    Ok(conn.send(warning).await?)
}

/// A Lightning node driving channels with its peers.
///
/// Every operation that changes a channel holds that channel's lock for
/// its whole duration, so at most one transition per channel is in flight.
pub struct Node {
    pub(crate) config: NodeConfig,
    pub(crate) keys: KeysManager,
    pub(crate) store: ChannelStore,
    pub(crate) chain: Arc<dyn ChainSource>,
    pub(crate) wallet: Arc<dyn Wallet>,
    pub(crate) sleeper: Arc<dyn Sleeper>,
    pub(crate) secp_ctx: Secp256k1<All>,
    channel_locks: Mutex<HashMap<ChannelId, Arc<AsyncMutex<()>>>>,
}

impl Node {
    /// Create a node
    pub fn new(
        config: NodeConfig,
        keys: KeysManager,
        persister: Arc<dyn ChannelPersist>,
        chain: Arc<dyn ChainSource>,
        wallet: Arc<dyn Wallet>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        info!("node {} on {}", keys.node_id(), config.network);
        Node {
            config,
            keys,
            store: ChannelStore::new(persister),
            chain,
            wallet,
            sleeper,
            secp_ctx: Secp256k1::new(),
            channel_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Our identity
    pub fn node_id(&self) -> PublicKey {
        self.keys.node_id()
    }

    /// The configuration this node runs with
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Read access to stored channels
    pub fn store(&self) -> &ChannelStore {
        &self.store
    }

    /// Chain reconciliation for this node's channels
    pub fn watcher(&self) -> ChainWatcher<'_> {
        ChainWatcher::new(self)
    }

    /// Snapshot of one channel
    pub fn channel_info(&self, id: &ChannelId) -> Result<ChannelSnapshot> {
        self.store.channel_info(id)
    }

    /// Snapshots of every channel
    pub fn list_channels(&self) -> Result<Vec<ChannelSnapshot>> {
        self.store.list_channels()
    }

    /// Our current commitment transaction, fully signed
    pub fn get_commitment_tx(&self, id: &ChannelId) -> Result<Transaction> {
        self.store.get_commitment_tx(id, &self.keys)
    }

    /// One of our recorded commitments, fully signed
    pub fn get_commitment_tx_at(&self, id: &ChannelId, number: u64) -> Result<Transaction> {
        self.store.get_commitment_tx_at(id, &self.keys, number)
    }

    /// A new fee rate for the channel, if the current one has drifted
    pub async fn fee_update_required(&self, id: &ChannelId) -> Result<Option<u32>> {
        self.store.fee_update_required(id, self.chain.as_ref(), &self.config.fees).await
    }

    /// Connect to a peer
    pub async fn connect(
        &self,
        connector: &dyn Connector,
        node_id: &PublicKey,
        address: &str,
    ) -> core::result::Result<PeerConnection, ConnectError> {
        PeerConnection::connect(
            connector,
            self.keys.node_secret(),
            node_id,
            address,
            &self.config.features,
        )
        .await
    }

    /// Accept a connection, optionally only from `expected`
    pub async fn accept_peer(
        &self,
        listener: &mut dyn Listener,
        expected: Option<&PublicKey>,
    ) -> core::result::Result<PeerConnection, ConnectError> {
        PeerConnection::accept(listener, expected, &self.config.features).await
    }

    pub(crate) async fn lock_channel(&self, id: &ChannelId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.channel_locks.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(locks.entry(*id).or_default())
        };
        lock.lock_owned().await
    }

    pub(crate) fn channel_keys(&self, channel: &Channel) -> Result<ChannelKeys> {
        self.keys.channel_keys(&channel.keys_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_utils::make_node;
    use test_log::test;

    #[test(tokio::test)]
    async fn channel_lock_serializes_test() {
        let (node, _chain) = make_node(1);
        let id = ChannelId([5; 32]);
        let guard = node.lock_channel(&id).await;
        let other = ChannelId([6; 32]);
        // a different channel is not blocked
        drop(node.lock_channel(&other).await);
        let second = tokio::time::timeout(std::time::Duration::from_millis(20), node.lock_channel(&id));
        assert!(second.await.is_err());
        drop(guard);
        drop(node.lock_channel(&id).await);
    }

    #[test]
    fn unexpected_message_test() {
        let warning = ChannelMessage::Warning(Warning { channel_id: [0; 32], data: b"no".to_vec() });
        assert!(matches!(unexpected_message("CommitmentSigned", warning), Error::PeerRejected(r) if r == "no"));
        let other = ChannelMessage::UpdateFee(lnc_protocol::msgs::UpdateFee {
            channel_id: [0; 32],
            feerate_per_kw: 1000,
        });
        assert!(matches!(unexpected_message("CommitmentSigned", other), Error::PeerProtocol(_)));
        assert!(check_channel_id(&ChannelId([1; 32]), &[2; 32]).is_err());
    }
}
