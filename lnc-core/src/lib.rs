#![forbid(unsafe_code)]
#![warn(rustdoc::broken_intra_doc_links)]
#![warn(missing_docs)]

//! A Lightning channel client.
//!
//! Drives direct (mono-hop) payment channels with a single peer: opening and
//! funding, locking, balance updates, fee updates, cooperative and forced
//! closes, and the on-chain reactions those require, including penalty
//! transactions against revoked commitments.
//!
//! The wallet, the chain backend, durable storage and the encrypted transport
//! are capabilities supplied by the embedder, see [`chain`], [`persist`] and
//! [`transport`].

pub use bitcoin;
pub use lightning;
pub use lnc_protocol as protocol;

/// On-chain capabilities: broadcast, fee estimation, observation, wallet
pub mod chain;
/// Channel entity and commitment bookkeeping
pub mod channel;
/// Injectable time
pub mod clock;
/// Node configuration
pub mod config;
/// Error types
pub mod error;
/// Fee rate policy
pub mod fee;
/// Node and channel key material
pub mod keys;
/// Chain reconciliation for channels
pub mod monitor;
/// The channel state machine
pub mod node;
/// Authenticated peer connection
pub mod peer;
/// Channel persistence capability
pub mod persist;
/// Read side of the channel state
pub mod store;
/// Transport capability and built-in transports
pub mod transport;
/// Transaction construction
pub mod tx;
/// Various utilities
pub mod util;

/// Commonly used imports
pub mod prelude {
    pub use crate::channel::{ChannelId, ChannelStatus, PeerIdentity};
    pub use crate::config::NodeConfig;
    pub use crate::error::Error;
    pub use crate::node::{Node, PendingChannel};
    pub use crate::peer::PeerConnection;
    pub use crate::store::ChannelSnapshot;

    pub use std::sync::{Arc, Mutex, MutexGuard};
}
