use bitcoin::secp256k1::{PublicKey, SecretKey};
use lnc_protocol::msgs::{self, ChannelMessage, ErrorMessage, Init, Message, Ping, Pong};
use tracing::*;

use crate::channel::PeerIdentity;
use crate::error::{ConnectError, RecvError, TransportError};
use crate::transport::{Connector, Listener, Transport};

/// Pings asking for this many bytes or more must not be answered
pub const MAX_PONG_REPLY_BYTES: u16 = 65532;

/// An authenticated message stream to one peer, after the `init` exchange.
///
/// Sending and receiving consume the connection and hand it back, so only
/// one caller drives it at a time.  On error the connection is gone.
pub struct PeerConnection {
    transport: Box<dyn Transport>,
    peer: PeerIdentity,
    remote_features: Vec<u8>,
    outstanding_ping: Option<u16>,
}

impl PeerConnection {
    /// Connect to `address` and check that the node there is `expected`
    pub async fn connect(
        connector: &dyn Connector,
        local_key: &SecretKey,
        expected: &PublicKey,
        address: &str,
        local_features: &[u8],
    ) -> Result<Self, ConnectError> {
        let transport = connector.connect(local_key, address).await?;
        let actual = transport.remote_pubkey();
        if actual != *expected {
            warn!("connected to {} at {}, expected {}", actual, address, expected);
            return Err(ConnectError::IdentityMismatch { expected: *expected, actual });
        }
        let peer = PeerIdentity { node_id: actual, address: address.to_string() };
        Self::exchange_init(transport, peer, local_features).await
    }

    /// Wait for an inbound connection.  Connections from peers other than
    /// `expected` are dropped and accepting continues.
    pub async fn accept(
        listener: &mut dyn Listener,
        expected: Option<&PublicKey>,
        local_features: &[u8],
    ) -> Result<Self, ConnectError> {
        loop {
            let transport = listener.accept().await?;
            let actual = transport.remote_pubkey();
            if let Some(expected) = expected {
                if actual != *expected {
                    warn!("dropping connection from unexpected peer {}", actual);
                    continue;
                }
            }
            let address = transport.remote_address().unwrap_or_default();
            let peer = PeerIdentity { node_id: actual, address };
            return Self::exchange_init(transport, peer, local_features).await;
        }
    }

    async fn exchange_init(
        mut transport: Box<dyn Transport>,
        peer: PeerIdentity,
        local_features: &[u8],
    ) -> Result<Self, ConnectError> {
        let init = Init { global_features: Vec::new(), features: local_features.to_vec() };
        transport.send_frame(&msgs::encode(&init.into())).await?;
        let frame = transport.recv_frame().await?;
        let remote_features = match msgs::decode(&frame).map_err(RecvError::from)? {
            Message::Init(init) => init.features,
            other => return Err(RecvError::MissingInit(other.message_type()).into()),
        };
        info!("connected to {} features {}", peer.node_id, hex::encode(&remote_features));
        Ok(PeerConnection { transport, peer, remote_features, outstanding_ping: None })
    }

    /// The peer at the other end
    pub fn peer(&self) -> &PeerIdentity {
        &self.peer
    }

    /// Feature bits the peer sent in `init`
    pub fn remote_features(&self) -> &[u8] {
        &self.remote_features
    }

    /// Send a message
    pub async fn send(mut self, msg: impl Into<Message>) -> Result<Self, TransportError> {
        let msg = msg.into();
        debug!("sending type {} to {}", msg.message_type(), self.peer.node_id);
        self.transport.send_frame(&msgs::encode(&msg)).await?;
        Ok(self)
    }

    /// Send a ping.  The matching pong is absorbed by
    /// [`PeerConnection::receive_channel_message`].
    pub async fn send_ping(mut self, num_pong_bytes: u16) -> Result<Self, TransportError> {
        self.outstanding_ping = Some(num_pong_bytes);
        self.send(Ping { num_pong_bytes, ignored: Vec::new() }).await
    }

    /// Wait for the next channel message.
    ///
    /// Pings are answered, solicited pongs, gossip and unknown odd messages
    /// are dropped.
    pub async fn receive_channel_message(mut self) -> Result<(Self, ChannelMessage), RecvError> {
        loop {
            let frame = self.transport.recv_frame().await?;
            match msgs::decode(&frame)? {
                Message::Channel(msg) => {
                    debug!("received {} from {}", msg.name(), self.peer.node_id);
                    return Ok((self, msg));
                }
                Message::Ping(ping) =>
                    if ping.num_pong_bytes < MAX_PONG_REPLY_BYTES {
                        let pong = Pong { ignored: vec![0; ping.num_pong_bytes as usize] };
                        self.transport.send_frame(&msgs::encode(&pong.into())).await?;
                    },
                Message::Pong(pong) => match self.outstanding_ping.take() {
                    Some(expected) if expected as usize != pong.ignored.len() => warn!(
                        "pong of {} bytes, asked for {}",
                        pong.ignored.len(),
                        expected
                    ),
                    Some(_) => trace!("pong from {}", self.peer.node_id),
                    None => return Err(RecvError::UnsolicitedPong),
                },
                Message::Gossip(gossip) => {
                    trace!("discarding gossip type {}", gossip.message_type)
                }
                Message::Unknown(unknown) => {
                    debug!("ignoring unknown odd message type {}", unknown.message_type)
                }
                Message::Init(_) => return Err(RecvError::UnexpectedInit),
                Message::Error(err) => {
                    let err = peer_error(&err);
                    error!("{}", err);
                    return Err(err);
                }
            }
        }
    }
}

fn peer_error(msg: &ErrorMessage) -> RecvError {
    RecvError::ReceivedPeerErrorMessage {
        channel_id: hex::encode(msg.channel_id),
        description: describe_error_data(&msg.data),
    }
}

/// Human readable text for the data of an `error` message
pub fn describe_error_data(data: &[u8]) -> String {
    match data {
        [1] => "too many pending channels".to_string(),
        [2] => "chain not synced".to_string(),
        [3] => "channel capacity too large".to_string(),
        _ if data.iter().all(|b| b.is_ascii_graphic() || *b == b' ') =>
            String::from_utf8_lossy(data).into_owned(),
        _ => hex::encode(data),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::loopback::{LoopbackNetwork, LoopbackTransport};
    use bitcoin::secp256k1::Secp256k1;
    use lnc_protocol::msgs::{Gossip, Unknown, Warning};
    use test_log::test;

    fn key(i: u8) -> SecretKey {
        SecretKey::from_slice(&[i; 32]).unwrap()
    }

    fn pubkey(i: u8) -> PublicKey {
        PublicKey::from_secret_key(&Secp256k1::new(), &key(i))
    }

    fn connection() -> (PeerConnection, LoopbackTransport) {
        let (ours, theirs) = LoopbackTransport::pair(pubkey(1), pubkey(2));
        let conn = PeerConnection {
            transport: Box::new(ours),
            peer: PeerIdentity { node_id: pubkey(2), address: "test".into() },
            remote_features: Vec::new(),
            outstanding_ping: None,
        };
        (conn, theirs)
    }

    async fn send_raw(transport: &mut LoopbackTransport, msg: impl Into<Message>) {
        transport.send_frame(&msgs::encode(&msg.into())).await.unwrap();
    }

    fn warning() -> Warning {
        Warning { channel_id: [7; 32], data: b"hi".to_vec() }
    }

    #[test(tokio::test)]
    async fn ping_gossip_unknown_absorbed_test() {
        let (conn, mut raw) = connection();
        send_raw(&mut raw, Ping { num_pong_bytes: MAX_PONG_REPLY_BYTES, ignored: vec![] }).await;
        send_raw(&mut raw, Ping { num_pong_bytes: 4, ignored: vec![1, 2] }).await;
        send_raw(&mut raw, Message::Gossip(Gossip { message_type: 258, payload: vec![0; 10] })).await;
        send_raw(&mut raw, Message::Unknown(Unknown { message_type: 32769, payload: vec![] })).await;
        send_raw(&mut raw, warning()).await;

        let (_conn, msg) = conn.receive_channel_message().await.unwrap();
        assert_eq!(msg, ChannelMessage::Warning(warning()));
        // only the small ping was answered
        let reply = msgs::decode(&raw.recv_frame().await.unwrap()).unwrap();
        assert_eq!(reply, Message::Pong(Pong { ignored: vec![0; 4] }));
    }

    #[test(tokio::test)]
    async fn unsolicited_pong_test() {
        let (conn, mut raw) = connection();
        send_raw(&mut raw, Pong { ignored: vec![] }).await;
        assert!(matches!(conn.receive_channel_message().await, Err(RecvError::UnsolicitedPong)));
    }

    #[test(tokio::test)]
    async fn solicited_pong_test() {
        let (conn, mut raw) = connection();
        let conn = conn.send_ping(8).await.unwrap();
        assert!(matches!(msgs::decode(&raw.recv_frame().await.unwrap()).unwrap(), Message::Ping(_)));
        send_raw(&mut raw, Pong { ignored: vec![0; 8] }).await;
        send_raw(&mut raw, warning()).await;
        let (conn, _) = conn.receive_channel_message().await.unwrap();
        // a second pong is no longer expected
        send_raw(&mut raw, Pong { ignored: vec![0; 8] }).await;
        assert!(matches!(conn.receive_channel_message().await, Err(RecvError::UnsolicitedPong)));
    }

    #[test(tokio::test)]
    async fn unknown_even_type_test() {
        let (conn, mut raw) = connection();
        raw.send_frame(&[0x80, 0x02, 0x00]).await.unwrap();
        assert!(matches!(
            conn.receive_channel_message().await,
            Err(RecvError::Decode(lnc_protocol::Error::UnknownEvenType(0x8002)))
        ));
    }

    #[test(tokio::test)]
    async fn late_init_test() {
        let (conn, mut raw) = connection();
        send_raw(&mut raw, Init { global_features: vec![], features: vec![] }).await;
        assert!(matches!(conn.receive_channel_message().await, Err(RecvError::UnexpectedInit)));
    }

    #[test(tokio::test)]
    async fn peer_error_test() {
        let (conn, mut raw) = connection();
        send_raw(&mut raw, ErrorMessage { channel_id: [0; 32], data: vec![2] }).await;
        match conn.receive_channel_message().await {
            Err(RecvError::ReceivedPeerErrorMessage { description, .. }) =>
                assert_eq!(description, "chain not synced"),
            _ => panic!("expected peer error"),
        }
    }

    #[test]
    fn describe_error_data_test() {
        assert_eq!(describe_error_data(&[1]), "too many pending channels");
        assert_eq!(describe_error_data(&[3]), "channel capacity too large");
        assert_eq!(describe_error_data(b"funding too low"), "funding too low");
        assert_eq!(describe_error_data(&[0xff, 0x00]), "ff00");
    }

    #[test(tokio::test)]
    async fn connect_identity_test() {
        let network = LoopbackNetwork::new();
        let mut listener = network.listen(&key(1), "alice").unwrap();
        let connector = network.connector();

        let err = PeerConnection::connect(&connector, &key(2), &pubkey(3), "alice", &[])
            .await
            .err()
            .unwrap();
        assert!(matches!(err, ConnectError::IdentityMismatch { .. }));
        // drain the dropped attempt
        drop(listener.accept().await.unwrap());

        let (local_key, remote_pubkey, expected_pubkey) = (key(2), pubkey(1), pubkey(2));
        let (outbound, inbound) = tokio::join!(
            PeerConnection::connect(&connector, &local_key, &remote_pubkey, "alice", &[0x02]),
            PeerConnection::accept(&mut listener, Some(&expected_pubkey), &[0x08]),
        );
        let (outbound, inbound) = (outbound.unwrap(), inbound.unwrap());
        assert_eq!(outbound.remote_features(), &[0x08]);
        assert_eq!(inbound.remote_features(), &[0x02]);
        assert_eq!(inbound.peer().node_id, pubkey(2));
        assert_eq!(outbound.peer().address, "alice");
    }

    #[test(tokio::test)]
    async fn accept_skips_unexpected_peer_test() {
        let network = LoopbackNetwork::new();
        let mut listener = network.listen(&key(1), "alice").unwrap();
        let connector = network.connector();
        // the stranger's transport is accepted and dropped before init
        let stranger = connector.connect(&key(4), "alice").await.unwrap();
        let (local_key, remote_pubkey, expected_pubkey) = (key(2), pubkey(1), pubkey(2));
        let (outbound, inbound) = tokio::join!(
            PeerConnection::connect(&connector, &local_key, &remote_pubkey, "alice", &[]),
            PeerConnection::accept(&mut listener, Some(&expected_pubkey), &[]),
        );
        assert!(outbound.is_ok());
        assert_eq!(inbound.unwrap().peer().node_id, pubkey(2));
        drop(stranger);
    }
}
