use std::io::ErrorKind;

use async_trait::async_trait;
use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::{PublicKey, Secp256k1, SecretKey};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener as TokioTcpListener, TcpStream, ToSocketAddrs};
use tracing::*;

use super::{Connector, Listener, Transport};
use crate::error::TransportError;
use crate::util::crypto_utils::{generate_seed, tagged_message};

const HANDSHAKE_TAG: &str = "lnc-handshake";
const HELLO_LEN: usize = 33 + 32;

async fn write_frame(stream: &mut TcpStream, frame: &[u8]) -> Result<(), TransportError> {
    let len = u16::try_from(frame.len()).map_err(|_| TransportError::FrameTooLarge(frame.len()))?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(frame).await?;
    stream.flush().await?;
    Ok(())
}

async fn read_frame(stream: &mut TcpStream) -> Result<Vec<u8>, TransportError> {
    let mut len = [0u8; 2];
    match stream.read_exact(&mut len).await {
        Ok(_) => {}
        Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Err(TransportError::Closed),
        Err(e) => return Err(e.into()),
    }
    let mut frame = vec![0u8; u16::from_be_bytes(len) as usize];
    stream.read_exact(&mut frame).await.map_err(|e| match e.kind() {
        ErrorKind::UnexpectedEof => TransportError::Closed,
        _ => e.into(),
    })?;
    Ok(frame)
}

/// Each side sends its key and a fresh nonce, then signs the other side's
/// nonce together with its own key
async fn handshake(
    stream: &mut TcpStream,
    local_key: &SecretKey,
) -> Result<PublicKey, TransportError> {
    let secp_ctx = Secp256k1::new();
    let local_pubkey = PublicKey::from_secret_key(&secp_ctx, local_key);
    let nonce = generate_seed();

    let mut hello = Vec::with_capacity(HELLO_LEN);
    hello.extend_from_slice(&local_pubkey.serialize());
    hello.extend_from_slice(&nonce);
    write_frame(stream, &hello).await?;

    let peer_hello = read_frame(stream).await?;
    if peer_hello.len() != HELLO_LEN {
        return Err(TransportError::Handshake(format!("bad hello length {}", peer_hello.len())));
    }
    let remote_pubkey = PublicKey::from_slice(&peer_hello[..33])
        .map_err(|_| TransportError::Handshake("bad remote key".into()))?;
    let peer_nonce = &peer_hello[33..];

    let msg = tagged_message(HANDSHAKE_TAG, &[peer_nonce, &local_pubkey.serialize()]);
    let proof = secp_ctx.sign_ecdsa(&msg, local_key);
    write_frame(stream, &proof.serialize_compact()).await?;

    let peer_proof = read_frame(stream).await?;
    let sig = Signature::from_compact(&peer_proof)
        .map_err(|_| TransportError::Handshake("bad proof encoding".into()))?;
    let expected = tagged_message(HANDSHAKE_TAG, &[&nonce, &remote_pubkey.serialize()]);
    secp_ctx
        .verify_ecdsa(&expected, &sig, &remote_pubkey)
        .map_err(|_| TransportError::Handshake(format!("proof from {} did not verify", remote_pubkey)))?;
    Ok(remote_pubkey)
}

/// A TCP stream after the identity handshake
pub struct TcpTransport {
    stream: TcpStream,
    remote: PublicKey,
}

impl TcpTransport {
    /// Run the handshake over an open stream
    pub async fn establish(
        mut stream: TcpStream,
        local_key: &SecretKey,
    ) -> Result<Self, TransportError> {
        let remote = handshake(&mut stream, local_key).await?;
        Ok(TcpTransport { stream, remote })
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send_frame(&mut self, frame: &[u8]) -> Result<(), TransportError> {
        write_frame(&mut self.stream, frame).await
    }

    async fn recv_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        read_frame(&mut self.stream).await
    }

    fn remote_pubkey(&self) -> PublicKey {
        self.remote
    }

    fn remote_address(&self) -> Option<String> {
        self.stream.peer_addr().ok().map(|a| a.to_string())
    }
}

/// Opens TCP transports to `host:port` addresses
#[derive(Clone, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        local_key: &SecretKey,
        address: &str,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let stream = TcpStream::connect(address).await.map_err(|e| {
            warn!("connection failed to {} - {}", address, e);
            TransportError::Unreachable(address.to_string())
        })?;
        stream.set_nodelay(true)?;
        Ok(Box::new(TcpTransport::establish(stream, local_key).await?))
    }
}

/// Accepts TCP transports.  Inbound connections failing the handshake are
/// dropped.
pub struct TcpListener {
    listener: TokioTcpListener,
    local_key: SecretKey,
}

impl TcpListener {
    /// Bind to `address`
    pub async fn bind<A: ToSocketAddrs>(address: A, local_key: SecretKey) -> Result<Self, TransportError> {
        let listener = TokioTcpListener::bind(address).await?;
        Ok(TcpListener { listener, local_key })
    }

    /// The bound address
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Listener for TcpListener {
    async fn accept(&mut self) -> Result<Box<dyn Transport>, TransportError> {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            match TcpTransport::establish(stream, &self.local_key).await {
                Ok(transport) => return Ok(Box::new(transport)),
                Err(e) => warn!("handshake with {} failed: {}", peer_addr, e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u8) -> SecretKey {
        SecretKey::from_slice(&[i; 32]).unwrap()
    }

    #[tokio::test]
    async fn tcp_handshake_test() {
        let secp_ctx = Secp256k1::new();
        let mut listener = TcpListener::bind("127.0.0.1:0", key(1)).await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = tokio::spawn(async move {
            let mut transport = listener.accept().await.unwrap();
            let frame = transport.recv_frame().await.unwrap();
            transport.send_frame(&frame).await.unwrap();
            transport.remote_pubkey()
        });
        let mut client = TcpConnector.connect(&key(2), &addr).await.unwrap();
        assert_eq!(client.remote_pubkey(), PublicKey::from_secret_key(&secp_ctx, &key(1)));
        client.send_frame(b"hello").await.unwrap();
        assert_eq!(client.recv_frame().await.unwrap(), b"hello".to_vec());
        assert_eq!(server.await.unwrap(), PublicKey::from_secret_key(&secp_ctx, &key(2)));
        drop(client);
    }

    #[tokio::test]
    async fn tcp_unreachable_test() {
        let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let err = TcpConnector.connect(&key(2), &addr).await.err().unwrap();
        assert!(matches!(err, TransportError::Unreachable(_)));
    }
}
