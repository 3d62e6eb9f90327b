//! Peer message structs and the closed message sum types.

use bitcoin::secp256k1::ecdsa::Signature;
use bitcoin::secp256k1::PublicKey;
use bitcoin::ScriptBuf;
use log::trace;

use crate::error::{Error, Result};
use crate::ser::{Reader, WireField, Writer};
use crate::MAX_MESSAGE_SIZE;

/// First gossip message type (channel_announcement)
pub const GOSSIP_TYPE_MIN: u16 = 256;
/// Last gossip message type (gossip_timestamp_filter)
pub const GOSSIP_TYPE_MAX: u16 = 265;

/// A message with a fixed type and a body made of wire fields
pub trait WireMessage: Sized {
    /// The message type
    const TYPE: u16;
    /// Human readable name used in logs and errors
    const NAME: &'static str;
    /// Append the body
    fn write_body(&self, w: &mut Writer);
    /// Decode the body.  Trailing bytes are tolerated, they may carry
    /// extensions we do not understand.
    fn read_body(r: &mut Reader) -> Result<Self>;
}

macro_rules! wire_message {
    (
        $(#[$attr:meta])*
        $name:ident = $ty:expr, $wire_name:literal {
            $( $(#[$fattr:meta])* $field:ident : $fty:ty ),* $(,)?
        }
    ) => {
        $(#[$attr])*
        #[derive(Clone, Debug, PartialEq, Eq)]
        #[allow(missing_docs)]
        pub struct $name {
            $( $(#[$fattr])* pub $field: $fty ),*
        }

        impl WireMessage for $name {
            const TYPE: u16 = $ty;
            const NAME: &'static str = $wire_name;

            fn write_body(&self, _w: &mut Writer) {
                $( self.$field.write_to(_w); )*
            }

            fn read_body(_r: &mut Reader) -> Result<Self> {
                Ok(Self { $( $field: <$fty as WireField>::read_from(_r)? ),* })
            }
        }
    };
}

wire_message!(
    /// Non-fatal complaint about a channel or the connection
    Warning = 1, "warning" {
        channel_id: [u8; 32],
        data: Vec<u8>,
    }
);

wire_message!(
    /// Feature negotiation, sent once right after the transport handshake
    Init = 16, "init" {
        global_features: Vec<u8>,
        features: Vec<u8>,
    }
);

wire_message!(
    /// Fatal error, the sender considers the channel (or all channels) failed
    ErrorMessage = 17, "error" {
        channel_id: [u8; 32],
        data: Vec<u8>,
    }
);

wire_message!(
    Ping = 18, "ping" {
        num_pong_bytes: u16,
        ignored: Vec<u8>,
    }
);

wire_message!(
    Pong = 19, "pong" {
        ignored: Vec<u8>,
    }
);

wire_message!(
    /// Funder proposes a channel
    OpenChannel = 32, "open_channel" {
        chain_hash: [u8; 32],
        temporary_channel_id: [u8; 32],
        funding_satoshis: u64,
        dust_limit_satoshis: u64,
        channel_reserve_satoshis: u64,
        feerate_per_kw: u32,
        to_self_delay: u16,
        funding_pubkey: PublicKey,
        revocation_basepoint: PublicKey,
        payment_basepoint: PublicKey,
        delayed_payment_basepoint: PublicKey,
        first_per_commitment_point: PublicKey,
    }
);

wire_message!(
    /// Fundee accepts the proposal and states its own parameters
    AcceptChannel = 33, "accept_channel" {
        temporary_channel_id: [u8; 32],
        dust_limit_satoshis: u64,
        channel_reserve_satoshis: u64,
        minimum_depth: u32,
        to_self_delay: u16,
        funding_pubkey: PublicKey,
        revocation_basepoint: PublicKey,
        payment_basepoint: PublicKey,
        delayed_payment_basepoint: PublicKey,
        first_per_commitment_point: PublicKey,
    }
);

wire_message!(
    FundingCreated = 34, "funding_created" {
        temporary_channel_id: [u8; 32],
        funding_txid: [u8; 32],
        funding_output_index: u16,
        signature: Signature,
    }
);

wire_message!(
    FundingSigned = 35, "funding_signed" {
        channel_id: [u8; 32],
        signature: Signature,
    }
);

wire_message!(
    ChannelReady = 36, "channel_ready" {
        channel_id: [u8; 32],
        second_per_commitment_point: PublicKey,
    }
);

wire_message!(
    Shutdown = 38, "shutdown" {
        channel_id: [u8; 32],
        scriptpubkey: ScriptBuf,
    }
);

wire_message!(
    ClosingSigned = 39, "closing_signed" {
        channel_id: [u8; 32],
        fee_satoshis: u64,
        signature: Signature,
    }
);

wire_message!(
    /// Signature over the receiver's next commitment transaction
    CommitmentSigned = 132, "commitment_signed" {
        channel_id: [u8; 32],
        signature: Signature,
    }
);

wire_message!(
    RevokeAndAck = 133, "revoke_and_ack" {
        channel_id: [u8; 32],
        per_commitment_secret: [u8; 32],
        next_per_commitment_point: PublicKey,
    }
);

wire_message!(
    UpdateFee = 134, "update_fee" {
        channel_id: [u8; 32],
        feerate_per_kw: u32,
    }
);

wire_message!(
    /// Sent on reconnection: the commitment number each side expects to
    /// be signed next, and the counterparty commitment it expects revoked
    ChannelReestablish = 136, "channel_reestablish" {
        channel_id: [u8; 32],
        next_commitment_number: u64,
        next_revocation_number: u64,
    }
);

wire_message!(
    /// Direct transfer of balance to the receiver, settled by the
    /// commitment exchange that follows
    UpdatePayment = 32768, "update_payment" {
        channel_id: [u8; 32],
        amount_satoshis: u64,
    }
);

/// A gossip message, carried opaquely
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Gossip {
    /// The message type, within the gossip range
    pub message_type: u16,
    /// The undecoded body
    pub payload: Vec<u8>,
}

/// An odd message type we do not understand
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Unknown {
    /// The message type
    pub message_type: u16,
    /// The undecoded body
    pub payload: Vec<u8>,
}

/// Messages that drive a channel
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum ChannelMessage {
    Warning(Warning),
    OpenChannel(OpenChannel),
    AcceptChannel(AcceptChannel),
    FundingCreated(FundingCreated),
    FundingSigned(FundingSigned),
    ChannelReady(ChannelReady),
    Shutdown(Shutdown),
    ClosingSigned(ClosingSigned),
    CommitmentSigned(CommitmentSigned),
    RevokeAndAck(RevokeAndAck),
    UpdateFee(UpdateFee),
    ChannelReestablish(ChannelReestablish),
    UpdatePayment(UpdatePayment),
}

/// Any peer message
#[derive(Clone, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Message {
    Init(Init),
    Error(ErrorMessage),
    Ping(Ping),
    Pong(Pong),
    Gossip(Gossip),
    Unknown(Unknown),
    Channel(ChannelMessage),
}

macro_rules! into_channel_message {
    ($($name:ident),*) => {
        $(
            impl From<$name> for ChannelMessage {
                fn from(m: $name) -> Self {
                    ChannelMessage::$name(m)
                }
            }

            impl From<$name> for Message {
                fn from(m: $name) -> Self {
                    Message::Channel(ChannelMessage::$name(m))
                }
            }
        )*

        impl ChannelMessage {
            /// The wire name of the message
            pub fn name(&self) -> &'static str {
                match self {
                    $( ChannelMessage::$name(_) => $name::NAME, )*
                }
            }

            /// The message type
            pub fn message_type(&self) -> u16 {
                match self {
                    $( ChannelMessage::$name(_) => $name::TYPE, )*
                }
            }

            fn write_body(&self, w: &mut Writer) {
                match self {
                    $( ChannelMessage::$name(m) => m.write_body(w), )*
                }
            }
        }
    };
}

into_channel_message!(
    Warning,
    OpenChannel,
    AcceptChannel,
    FundingCreated,
    FundingSigned,
    ChannelReady,
    Shutdown,
    ClosingSigned,
    CommitmentSigned,
    RevokeAndAck,
    UpdateFee,
    ChannelReestablish,
    UpdatePayment
);

impl From<ChannelMessage> for Message {
    fn from(m: ChannelMessage) -> Self {
        Message::Channel(m)
    }
}

impl From<Init> for Message {
    fn from(m: Init) -> Self {
        Message::Init(m)
    }
}

impl From<ErrorMessage> for Message {
    fn from(m: ErrorMessage) -> Self {
        Message::Error(m)
    }
}

impl From<Ping> for Message {
    fn from(m: Ping) -> Self {
        Message::Ping(m)
    }
}

impl From<Pong> for Message {
    fn from(m: Pong) -> Self {
        Message::Pong(m)
    }
}

impl ChannelMessage {
    /// The channel (or temporary channel) this message refers to
    pub fn channel_id(&self) -> [u8; 32] {
        match self {
            ChannelMessage::Warning(m) => m.channel_id,
            ChannelMessage::OpenChannel(m) => m.temporary_channel_id,
            ChannelMessage::AcceptChannel(m) => m.temporary_channel_id,
            ChannelMessage::FundingCreated(m) => m.temporary_channel_id,
            ChannelMessage::FundingSigned(m) => m.channel_id,
            ChannelMessage::ChannelReady(m) => m.channel_id,
            ChannelMessage::Shutdown(m) => m.channel_id,
            ChannelMessage::ClosingSigned(m) => m.channel_id,
            ChannelMessage::CommitmentSigned(m) => m.channel_id,
            ChannelMessage::RevokeAndAck(m) => m.channel_id,
            ChannelMessage::UpdateFee(m) => m.channel_id,
            ChannelMessage::ChannelReestablish(m) => m.channel_id,
            ChannelMessage::UpdatePayment(m) => m.channel_id,
        }
    }
}

impl Message {
    /// The message type
    pub fn message_type(&self) -> u16 {
        match self {
            Message::Init(_) => Init::TYPE,
            Message::Error(_) => ErrorMessage::TYPE,
            Message::Ping(_) => Ping::TYPE,
            Message::Pong(_) => Pong::TYPE,
            Message::Gossip(g) => g.message_type,
            Message::Unknown(u) => u.message_type,
            Message::Channel(m) => m.message_type(),
        }
    }
}

/// Serialize a message, type first
pub fn encode(msg: &Message) -> Vec<u8> {
    let mut w = Writer::new();
    msg.message_type().write_to(&mut w);
    match msg {
        Message::Init(m) => m.write_body(&mut w),
        Message::Error(m) => m.write_body(&mut w),
        Message::Ping(m) => m.write_body(&mut w),
        Message::Pong(m) => m.write_body(&mut w),
        Message::Gossip(g) => w.put_slice(&g.payload),
        Message::Unknown(u) => w.put_slice(&u.payload),
        Message::Channel(m) => m.write_body(&mut w),
    }
    w.into_inner()
}

fn read_channel<M: WireMessage + Into<ChannelMessage>>(r: &mut Reader) -> Result<Message> {
    Ok(Message::Channel(M::read_body(r)?.into()))
}

/// Deserialize a message.
///
/// Unknown odd types are returned as [`Message::Unknown`], unknown even
/// types are an error.
pub fn decode(bytes: &[u8]) -> Result<Message> {
    if bytes.len() > MAX_MESSAGE_SIZE {
        return Err(Error::MessageTooLarge);
    }
    let mut r = Reader::new(bytes);
    let message_type = u16::read_from(&mut r)?;
    let r = &mut r;
    let message = match message_type {
        Init::TYPE => Message::Init(Init::read_body(r)?),
        ErrorMessage::TYPE => Message::Error(ErrorMessage::read_body(r)?),
        Ping::TYPE => Message::Ping(Ping::read_body(r)?),
        Pong::TYPE => Message::Pong(Pong::read_body(r)?),
        Warning::TYPE => read_channel::<Warning>(r)?,
        OpenChannel::TYPE => read_channel::<OpenChannel>(r)?,
        AcceptChannel::TYPE => read_channel::<AcceptChannel>(r)?,
        FundingCreated::TYPE => read_channel::<FundingCreated>(r)?,
        FundingSigned::TYPE => read_channel::<FundingSigned>(r)?,
        ChannelReady::TYPE => read_channel::<ChannelReady>(r)?,
        Shutdown::TYPE => read_channel::<Shutdown>(r)?,
        ClosingSigned::TYPE => read_channel::<ClosingSigned>(r)?,
        CommitmentSigned::TYPE => read_channel::<CommitmentSigned>(r)?,
        RevokeAndAck::TYPE => read_channel::<RevokeAndAck>(r)?,
        UpdateFee::TYPE => read_channel::<UpdateFee>(r)?,
        ChannelReestablish::TYPE => read_channel::<ChannelReestablish>(r)?,
        UpdatePayment::TYPE => read_channel::<UpdatePayment>(r)?,
        GOSSIP_TYPE_MIN..=GOSSIP_TYPE_MAX =>
            Message::Gossip(Gossip { message_type, payload: r.remaining().to_vec() }),
        t if t % 2 == 1 => Message::Unknown(Unknown { message_type, payload: r.remaining().to_vec() }),
        t => return Err(Error::UnknownEvenType(t)),
    };
    trace!("decoded message type {}", message_type);
    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::{Message as SecpMessage, Secp256k1, SecretKey};
    use test_log::test;

    fn pubkey(i: u8) -> PublicKey {
        let secp = Secp256k1::signing_only();
        PublicKey::from_secret_key(&secp, &SecretKey::from_slice(&[i; 32]).unwrap())
    }

    fn signature() -> Signature {
        let secp = Secp256k1::signing_only();
        let key = SecretKey::from_slice(&[7; 32]).unwrap();
        secp.sign_ecdsa(&SecpMessage::from_digest([3; 32]), &key)
    }

    #[test]
    fn ping_encoding_test() {
        let ping = Ping { num_pong_bytes: 4, ignored: vec![0xaa] };
        let bytes = encode(&ping.clone().into());
        assert_eq!(hex::encode(&bytes), "001200040001aa");
        assert_eq!(decode(&bytes).unwrap(), Message::Ping(ping));
    }

    #[test]
    fn open_channel_decode_test() {
        let open = OpenChannel {
            chain_hash: [1; 32],
            temporary_channel_id: [2; 32],
            funding_satoshis: 10_000_000,
            dust_limit_satoshis: 354,
            channel_reserve_satoshis: 100_000,
            feerate_per_kw: 253,
            to_self_delay: 144,
            funding_pubkey: pubkey(1),
            revocation_basepoint: pubkey(2),
            payment_basepoint: pubkey(3),
            delayed_payment_basepoint: pubkey(4),
            first_per_commitment_point: pubkey(5),
        };
        let bytes = encode(&open.clone().into());
        assert_eq!(&bytes[..2], &[0, 32]);
        let decoded = decode(&bytes).unwrap();
        match decoded {
            Message::Channel(ChannelMessage::OpenChannel(m)) => assert_eq!(m, open),
            m => panic!("unexpected {:?}", m),
        }
    }

    #[test]
    fn channel_reestablish_encoding_test() {
        let msg = ChannelReestablish {
            channel_id: [0xab; 32],
            next_commitment_number: 2,
            next_revocation_number: 1,
        };
        let bytes = encode(&msg.clone().into());
        assert_eq!(hex::encode(&bytes[..2]), "0088");
        assert_eq!(hex::encode(&bytes[34..]), "00000000000000020000000000000001");
        assert_eq!(decode(&bytes).unwrap(), msg.into());
    }

    #[test]
    fn trailing_extension_is_ignored_test() {
        let msg = CommitmentSigned { channel_id: [9; 32], signature: signature() };
        let mut bytes = encode(&msg.clone().into());
        bytes.extend_from_slice(&[1, 2, 3]);
        assert_eq!(decode(&bytes).unwrap(), msg.into());
    }

    #[test]
    fn unknown_types_test() {
        assert_eq!(
            decode(&[0x01, 0x01, 0xde, 0xad]).unwrap(),
            Message::Gossip(Gossip { message_type: 257, payload: vec![0xde, 0xad] })
        );
        assert_eq!(
            decode(&[0x7f, 0xf1, 0x00]).unwrap(),
            Message::Unknown(Unknown { message_type: 0x7ff1, payload: vec![0] })
        );
        assert_eq!(decode(&[0x7f, 0xf0]), Err(Error::UnknownEvenType(0x7ff0)));
    }

    #[test]
    fn gossip_test() {
        let decoded = decode(&[0x01, 0x02, 0x55]).unwrap();
        assert_eq!(decoded, Message::Gossip(Gossip { message_type: 258, payload: vec![0x55] }));
        assert_eq!(encode(&decoded), vec![0x01, 0x02, 0x55]);
    }

    #[test]
    fn short_body_test() {
        let msg = RevokeAndAck {
            channel_id: [1; 32],
            per_commitment_secret: [2; 32],
            next_per_commitment_point: pubkey(3),
        };
        let bytes = encode(&msg.into());
        assert_eq!(decode(&bytes[..bytes.len() - 1]), Err(Error::ShortRead));
    }

    #[test]
    fn too_large_test() {
        let bytes = vec![0u8; MAX_MESSAGE_SIZE + 1];
        assert_eq!(decode(&bytes), Err(Error::MessageTooLarge));
    }
}
