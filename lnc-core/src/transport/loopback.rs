use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use lnc_protocol::MAX_MESSAGE_SIZE;
use tokio::sync::mpsc;
use tracing::*;

use super::{Connector, Listener, Transport};
use crate::error::TransportError;

type Incoming = mpsc::UnboundedSender<LoopbackTransport>;

/// A registry of in-process listeners, addressed by name
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    listeners: Arc<Mutex<BTreeMap<String, (PublicKey, Incoming)>>>,
}

impl LoopbackNetwork {
    /// An empty network
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener at `address` with the identity of `local_key`
    pub fn listen(
        &self,
        local_key: &SecretKey,
        address: &str,
    ) -> Result<LoopbackListener, TransportError> {
        let pubkey = PublicKey::from_secret_key(&Secp256k1::signing_only(), local_key);
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut listeners = self.listeners.lock().unwrap_or_else(|e| e.into_inner());
        if listeners.contains_key(address) {
            return Err(TransportError::Handshake(format!("address {} in use", address)));
        }
        listeners.insert(address.to_string(), (pubkey, sender));
        debug!("loopback listening at {} as {}", address, pubkey);
        Ok(LoopbackListener { incoming: receiver })
    }

    /// A connector into this network
    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector { network: self.clone() }
    }
}

/// Connects to listeners of a [`LoopbackNetwork`]
#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

#[async_trait]
impl Connector for LoopbackConnector {
    async fn connect(
        &self,
        local_key: &SecretKey,
        address: &str,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let local_pubkey = PublicKey::from_secret_key(&Secp256k1::signing_only(), local_key);
        let (remote_pubkey, incoming) = {
            let listeners = self.network.listeners.lock().unwrap_or_else(|e| e.into_inner());
            listeners
                .get(address)
                .cloned()
                .ok_or_else(|| TransportError::Unreachable(address.to_string()))?
        };
        let (mut ours, theirs) = LoopbackTransport::pair(local_pubkey, remote_pubkey);
        ours.address = Some(address.to_string());
        incoming.send(theirs).map_err(|_| TransportError::Unreachable(address.to_string()))?;
        Ok(Box::new(ours))
    }
}

/// Inbound side of a loopback address
pub struct LoopbackListener {
    incoming: mpsc::UnboundedReceiver<LoopbackTransport>,
}

#[async_trait]
impl Listener for LoopbackListener {
    async fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        let transport = self.incoming.recv().await.ok_or(TransportError::Closed)?;
        Ok(Box::new(transport))
    }
}

/// One end of an in-process link
pub struct LoopbackTransport {
    sender: mpsc::UnboundedSender<Vec<u8>>,
    receiver: mpsc::UnboundedReceiver<Vec<u8>>,
    remote: PublicKey,
    address: Option<String>,
}

impl LoopbackTransport {
    /// Two connected ends.  The first end talks to `b`, the second to `a`.
    pub fn pair(a: PublicKey, b: PublicKey) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            LoopbackTransport { sender: a_tx, receiver: a_rx, remote: b, address: None },
            LoopbackTransport { sender: b_tx, receiver: b_rx, remote: a, address: None },
        )
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        if frame.len() > MAX_MESSAGE_SIZE {
            return Err(TransportError::FrameTooLarge(frame.len()));
        }
        self.sender.send(frame.to_vec()).map_err(|_| TransportError::Closed)
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        self.receiver.recv().await.ok_or(TransportError::Closed)
    }

    fn remote_pubkey(&self) -> PublicKey {
        self.remote
    }

    fn remote_address(&self) -> Option<String> {
        self.address.clone()
    }
}
