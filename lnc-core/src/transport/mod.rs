//! Frame transports between two authenticated nodes.
//!
//! A transport carries whole wire messages as frames and knows the identity
//! key of the node at the other end.  Encryption, if any, is the business of
//! the transport implementation.

use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, SecretKey};

use crate::error::TransportError;

/// In-process transport over tokio channels
pub mod loopback;
/// TCP transport with a signed identity handshake
#[cfg(feature = "tcp")]
pub mod tcp;

/// An established, authenticated link to one peer
#[async_trait]
pub trait Transport: Send {
    /// Send one frame
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError>;

    /// Wait for the next frame
    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError>;

    /// The authenticated identity of the peer
    fn remote_pubkey(&self) -> PublicKey;

    /// Where the peer is, if the transport knows
    fn remote_address(&self) -> Option<String> {
        None
    }
}

/// Opens outbound transports
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to `address`, proving ownership of `local_key`
    async fn connect(
        &self,
        local_key: &SecretKey,
        address: &str,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

/// Yields inbound transports
#[async_trait]
pub trait Listener: Send {
    /// Wait for the next authenticated inbound transport
    async fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError>;
}
