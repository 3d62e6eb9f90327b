use bitcoin::secp256k1::PublicKey;
use thiserror::Error;
use tracing::error;

use crate::chain::{ChainError, WalletError};
use crate::channel::ChannelId;
use crate::persist;

/// Failure of the underlying transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("connection closed by peer")]
    Closed,
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("frame too large: {0} bytes")]
    FrameTooLarge(usize),
    #[error("no listener at {0}")]
    Unreachable(String),
}

/// Establishing a peer connection failed
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("remote identity {actual} does not match expected {expected}")]
    IdentityMismatch { expected: PublicKey, actual: PublicKey },
    #[error("init exchange failed: {0}")]
    Init(#[from] RecvError),
}

/// Receiving a channel message failed.  The connection is gone.
#[derive(Debug, Error)]
pub enum RecvError {
    #[error("transport: {0}")]
    Transport(#[from] TransportError),
    #[error("undecodable message: {0}")]
    Decode(#[from] lnc_protocol::Error),
    #[error("peer sent error for channel {channel_id}: {description}")]
    ReceivedPeerErrorMessage { channel_id: String, description: String },
    #[error("pong received without an outstanding ping")]
    UnsolicitedPong,
    #[error("init received after the connection was established")]
    UnexpectedInit,
    #[error("expected init, got message type {0}")]
    MissingInit(u16),
}

/// Errors from channel operations
#[derive(Debug, Error)]
pub enum Error {
    #[error("connect: {0}")]
    Connect(#[from] ConnectError),
    #[error("receive: {0}")]
    Recv(#[from] RecvError),
    #[error("send: {0}")]
    Send(#[from] TransportError),
    /// The peer deviated from the protocol
    #[error("peer protocol violation: {0}")]
    PeerProtocol(String),
    /// The peer declined our update with a warning
    #[error("peer rejected update: {0}")]
    PeerRejected(String),
    #[error("insufficient funds: requested {requested_sat} sat, available {available_sat} sat")]
    InsufficientFunds { requested_sat: u64, available_sat: u64 },
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("chain observation: {0}")]
    ChainObservation(#[from] ChainError),
    #[error("channel {channel_id} is {status}, operation needs {expected}")]
    InvalidState { channel_id: ChannelId, status: String, expected: &'static str },
    #[error("funding not locked, {remaining} confirmations remaining")]
    FundingNotLocked { remaining: u32 },
    #[error("channel {0} not found")]
    ChannelNotFound(ChannelId),
    #[error("persist: {0}")]
    Persist(#[from] persist::Error),
    #[error("wallet: {0}")]
    Wallet(#[from] WalletError),
    /// A local policy refused the operation
    #[error("policy: {0}")]
    Policy(String),
    #[error("internal: {0}")]
    Internal(String),
}

impl Error {
    /// A broadcast lost a race against a conflicting transaction, which is
    /// expected when both sides react to the same close
    pub fn is_broadcast_race(&self) -> bool {
        matches!(self, Error::ChainObservation(e) if e.is_conflict())
    }
}

/// Construct a protocol violation error, logging it
pub fn protocol_error(msg: impl Into<String>) -> Error {
    let msg = msg.into();
    error!("PEER PROTOCOL: {}", msg);
    Error::PeerProtocol(msg)
}

/// Construct an invalid signature error, logging it
pub fn invalid_signature(msg: impl Into<String>) -> Error {
    let msg = msg.into();
    error!("INVALID SIGNATURE: {}", msg);
    Error::InvalidSignature(msg)
}

/// Construct a policy error, logging it
pub fn policy_error(msg: impl Into<String>) -> Error {
    let msg = msg.into();
    error!("POLICY: {}", msg);
    Error::Policy(msg)
}

/// Construct an internal error, logging it
pub fn internal_error(msg: impl Into<String>) -> Error {
    let msg = msg.into();
    error!("INTERNAL ERROR: {}", msg);
    Error::Internal(msg)
}

/// Result with the channel [`Error`]
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broadcast_race_test() {
        let race: Error = ChainError::Rejected("txn-mempool-conflict".into()).into();
        assert!(race.is_broadcast_race());
        let down: Error = ChainError::Unavailable("timeout".into()).into();
        assert!(!down.is_broadcast_race());
        assert!(!internal_error("x").is_broadcast_race());
    }
}
