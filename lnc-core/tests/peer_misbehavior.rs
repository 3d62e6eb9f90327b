//! A peer that sends malformed or abusive messages.  The peer side is
//! driven by hand over the node's own connection.

use lightning_client::bitcoin::secp256k1::ecdsa::Signature;
use lightning_client::bitcoin::secp256k1::{Message, Secp256k1, SecretKey};
use lightning_client::channel::{ChannelId, ChannelStatus};
use lightning_client::error::{Error, RecvError};
use lightning_client::node::FundingFees;
use lightning_client::peer::PeerConnection;
use lightning_client::protocol::msgs::{
    AcceptChannel, ChannelMessage, ClosingSigned, CommitmentSigned, OpenChannel, Shutdown,
    UpdateFee, UpdatePayment,
};
use lightning_client::util::test_utils::{TestPair, TEST_PASSWORD};

use test_log::test;

const FUNDING_SAT: u64 = 10_000_000;

fn bogus_signature() -> Signature {
    let secp = Secp256k1::signing_only();
    secp.sign_ecdsa(&Message::from_digest([1; 32]), &SecretKey::from_slice(&[3; 32]).unwrap())
}

async fn next_message(conn: PeerConnection) -> (PeerConnection, ChannelMessage) {
    conn.receive_channel_message().await.unwrap()
}

async fn open_with_payment(pair: &TestPair) -> (PeerConnection, PeerConnection, ChannelId) {
    let (a, b) = pair.connect().await;
    let (a, b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    let (a, b) = pair.pay(a, b, &id, 1_000_000).await;
    (a, b, id)
}

#[test(tokio::test)]
async fn closing_fee_above_funder_balance_test() {
    let pair = TestPair::new();
    let (a, b, id) = open_with_payment(&pair).await;
    let before = pair.funder.channel_info(&id).unwrap();

    let peer = async move {
        let (b, msg) = next_message(b).await;
        let scriptpubkey = match msg {
            ChannelMessage::Shutdown(shutdown) => shutdown.scriptpubkey,
            other => panic!("unexpected {:?}", other),
        };
        let b = b.send(Shutdown { channel_id: id.0, scriptpubkey }).await.unwrap();
        let (b, msg) = next_message(b).await;
        let offer = match msg {
            ChannelMessage::ClosingSigned(offer) => offer,
            other => panic!("unexpected {:?}", other),
        };
        let b = b.send(ClosingSigned { fee_satoshis: u64::MAX, ..offer }).await.unwrap();
        next_message(b).await.1
    };
    let (closed, reply) = tokio::join!(pair.funder.close_channel(a, &id), peer);
    assert!(matches!(closed, Err(Error::PeerProtocol(_))));
    assert!(matches!(reply, ChannelMessage::Warning(_)));
    assert_eq!(pair.funder.channel_info(&id).unwrap(), before);
}

#[test(tokio::test)]
async fn accept_with_huge_reserve_test() {
    let pair = TestPair::new();
    let wallet_before = pair.funder_wallet.balance();
    let minimum_depth = pair.funder.config().channel.minimum_depth;
    let (a, b) = pair.connect().await;

    let peer = async move {
        let (b, msg) = next_message(b).await;
        let open = match msg {
            ChannelMessage::OpenChannel(open) => open,
            other => panic!("unexpected {:?}", other),
        };
        b.send(AcceptChannel {
            temporary_channel_id: open.temporary_channel_id,
            dust_limit_satoshis: open.dust_limit_satoshis,
            channel_reserve_satoshis: u64::MAX,
            minimum_depth,
            to_self_delay: open.to_self_delay,
            funding_pubkey: open.funding_pubkey,
            revocation_basepoint: open.revocation_basepoint,
            payment_basepoint: open.payment_basepoint,
            delayed_payment_basepoint: open.delayed_payment_basepoint,
            first_per_commitment_point: open.first_per_commitment_point,
        })
        .await
        .unwrap()
    };
    let (opened, _b) =
        tokio::join!(pair.funder.open_channel(a, FUNDING_SAT, FundingFees::default(), TEST_PASSWORD), peer);
    assert!(matches!(opened, Err(Error::Policy(_))));
    assert_eq!(pair.funder_wallet.balance(), wallet_before);
}

#[test(tokio::test)]
async fn open_with_reserve_above_funding_test() {
    let pair = TestPair::new();
    // the funder's proposal is intercepted and altered on its way
    let (a, intercept) = pair.connect().await;
    let (forged, b) = pair.connect().await;

    let peer = async move {
        let (intercept, msg) = next_message(intercept).await;
        let open = match msg {
            ChannelMessage::OpenChannel(open) => open,
            other => panic!("unexpected {:?}", other),
        };
        let forged = forged
            .send(OpenChannel { channel_reserve_satoshis: open.funding_satoshis, ..open })
            .await
            .unwrap();
        let refusal = forged.receive_channel_message().await;
        drop(intercept);
        refusal
    };
    let (opened, accepted, refusal) = tokio::join!(
        pair.funder.open_channel(a, FUNDING_SAT, FundingFees::default(), TEST_PASSWORD),
        pair.fundee.accept_channel(b),
        peer,
    );
    assert!(opened.is_err());
    assert!(matches!(accepted, Err(Error::Policy(_))));
    match refusal {
        Err(RecvError::ReceivedPeerErrorMessage { description, .. }) =>
            assert!(description.contains("exceeds funding"), "{}", description),
        Err(e) => panic!("unexpected error {}", e),
        Ok(_) => panic!("expected a refusal"),
    }
    assert!(pair.fundee.list_channels().unwrap().is_empty());
}

#[test(tokio::test)]
async fn payment_with_invalid_signature_test() {
    let pair = TestPair::new();
    let (a, b, id) = open_with_payment(&pair).await;
    let before = pair.fundee.channel_info(&id).unwrap();

    let peer = async move {
        let a = a.send(UpdatePayment { channel_id: id.0, amount_satoshis: 100_000 }).await.unwrap();
        let a = a.send(CommitmentSigned { channel_id: id.0, signature: bogus_signature() }).await.unwrap();
        next_message(a).await.1
    };
    let (received, reply) = tokio::join!(pair.fundee.receive_monohop_payment(b, &id), peer);
    assert!(matches!(received, Err(Error::InvalidSignature(_))));
    assert!(matches!(reply, ChannelMessage::Warning(_)));
    let after = pair.fundee.channel_info(&id).unwrap();
    assert_eq!(after.status, ChannelStatus::Active);
    assert_eq!(after, before);

    // the funder never saw any of it and the channel goes on
    let (a, b) = pair.connect().await;
    let (_a, _b) = pair.pay(a, b, &id, 100_000).await;
    assert_eq!(pair.fundee.channel_info(&id).unwrap().local_balance_sat, before.local_balance_sat + 100_000);
}

#[test(tokio::test)]
async fn fee_update_with_invalid_signature_test() {
    let pair = TestPair::new();
    let (a, b, id) = open_with_payment(&pair).await;
    let before = pair.fundee.channel_info(&id).unwrap();

    let feerate_per_kw = before.feerate_per_kw;
    let peer = async move {
        let a = a.send(UpdateFee { channel_id: id.0, feerate_per_kw }).await.unwrap();
        let a = a.send(CommitmentSigned { channel_id: id.0, signature: bogus_signature() }).await.unwrap();
        next_message(a).await.1
    };
    let (accepted, reply) = tokio::join!(pair.fundee.accept_update_fee(b, &id), peer);
    assert!(matches!(accepted, Err(Error::InvalidSignature(_))));
    assert!(matches!(reply, ChannelMessage::Warning(_)));
    assert_eq!(pair.fundee.channel_info(&id).unwrap(), before);
}

#[test(tokio::test)]
async fn oversized_payment_test() {
    let pair = TestPair::new();
    let (a, b, id) = open_with_payment(&pair).await;
    let before = pair.fundee.channel_info(&id).unwrap();

    let peer = async move {
        let a = a.send(UpdatePayment { channel_id: id.0, amount_satoshis: FUNDING_SAT }).await.unwrap();
        let a = a.send(CommitmentSigned { channel_id: id.0, signature: bogus_signature() }).await.unwrap();
        next_message(a).await.1
    };
    let (received, reply) = tokio::join!(pair.fundee.receive_monohop_payment(b, &id), peer);
    assert!(matches!(received, Err(Error::PeerProtocol(_))));
    match reply {
        ChannelMessage::Warning(warning) =>
            assert!(String::from_utf8_lossy(&warning.data).contains("exceeds")),
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(pair.fundee.channel_info(&id).unwrap(), before);
}
