use lightning_client::chain::ChainSource;
use lightning_client::channel::{ChannelId, ChannelStatus, CloseKind};
use lightning_client::error::{Error, RecvError};
use lightning_client::monitor::WatchEvent;
use lightning_client::node::{ClosingSpend, FundingFees, Node};
use lightning_client::util::test_utils::{test_config, TestPair, TEST_PASSWORD};
use lightning_client::bitcoin::{Transaction, Txid};
use lightning_client::config::NodeConfig;
use lightning_client::tx::closing::{closing_fee_sat, ClosingParams};

use test_log::test;

const FUNDING_SAT: u64 = 10_000_000;
const MAX_FEES_SAT: u64 = 100_000;

/// Script-verify a fully signed commitment against the funding output
fn assert_commitment_valid(pair: &TestPair, node: &Node, id: &ChannelId) -> Transaction {
    let tx = node.get_commitment_tx(id).unwrap();
    let funding_outpoint = node.channel_info(id).unwrap().funding_outpoint;
    let funding_tx = pair.chain.get_tx(&funding_outpoint.txid).unwrap();
    tx.verify(|op| {
        assert_eq!(*op, funding_outpoint);
        funding_tx.output.get(op.vout as usize).cloned()
    })
    .unwrap();
    tx
}

async fn poll_until_closed(pair: &TestPair, node: &Node, id: &ChannelId, max_blocks: u32) -> CloseKind {
    for _ in 0..max_blocks {
        if let WatchEvent::Closed { kind, .. } = node.watcher().poll(id).await.unwrap() {
            return kind;
        }
        pair.chain.mine_block();
    }
    panic!("channel {} did not close", id);
}

#[test(tokio::test)]
async fn funder_scenario_test() {
    let pair = TestPair::new();
    let funder_before = pair.funder_wallet.balance();
    let fundee_before = pair.fundee_wallet.balance();

    let (a, b) = pair.connect().await;
    let (a, b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    let info = pair.funder.channel_info(&id).unwrap();
    assert_eq!(info.status, ChannelStatus::Active);
    assert_eq!(info.local_balance_sat, FUNDING_SAT);
    assert_eq!(pair.fundee.channel_info(&id).unwrap().remote_balance_sat, FUNDING_SAT);

    let (a, b) = pair.pay(a, b, &id, 1_000_000).await;
    assert_eq!(pair.funder.channel_info(&id).unwrap().local_balance_sat, 9_000_000);
    let (_a, _b) = pair.pay(a, b, &id, 1_500_000).await;

    for (node, local, remote) in
        [(&pair.funder, 7_500_000, 2_500_000), (&pair.fundee, 2_500_000, 7_500_000)]
    {
        let info = node.channel_info(&id).unwrap();
        assert_eq!(info.local_balance_sat, local);
        assert_eq!(info.remote_balance_sat, remote);
        assert_eq!(info.local_balance_sat + info.remote_balance_sat, FUNDING_SAT);
        assert_eq!(info.commitment_number, 2);
    }
    let funder_commitment = assert_commitment_valid(&pair, &pair.funder, &id);
    assert_commitment_valid(&pair, &pair.fundee, &id);

    let txid = pair.funder.force_close(&id).await.unwrap();
    assert_eq!(txid, funder_commitment.compute_txid());
    match pair.funder.channel_info(&id).unwrap().status {
        ChannelStatus::LocallyForceClosed { to_self_delay, sweep_tx, .. } => {
            assert_eq!(to_self_delay, test_config().channel.to_self_delay);
            assert!(sweep_tx.is_some());
        }
        other => panic!("unexpected status {:?}", other),
    }
    // the sweep is not valid before the delay
    assert_eq!(
        pair.funder.watcher().timelock_remaining(&id).await.unwrap(),
        Some(test_config().channel.to_self_delay as u32)
    );

    match pair.fundee.watcher().poll(&id).await.unwrap() {
        WatchEvent::ResponseBroadcast { kind, .. } => assert_eq!(kind, CloseKind::CounterpartyForceClose),
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(poll_until_closed(&pair, &pair.funder, &id, 20).await, CloseKind::LocalForceClose);
    assert_eq!(poll_until_closed(&pair, &pair.fundee, &id, 5).await, CloseKind::CounterpartyForceClose);
    pair.chain.mine_block();

    let funder_spent = funder_before - pair.funder_wallet.balance();
    assert!(funder_spent >= 2_500_000);
    assert!(funder_spent - 2_500_000 < MAX_FEES_SAT, "fees {}", funder_spent - 2_500_000);
    let fundee_gained = pair.fundee_wallet.balance() - fundee_before;
    assert!(fundee_gained <= 2_500_000 && 2_500_000 - fundee_gained < MAX_FEES_SAT);
}

#[test(tokio::test)]
async fn open_and_force_close_restores_funds_test() {
    let pair = TestPair::new();
    let before = pair.funder_wallet.balance();
    let (a, b) = pair.connect().await;
    let (_a, _b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    assert!(before - pair.funder_wallet.balance() >= FUNDING_SAT);

    pair.funder.force_close(&id).await.unwrap();
    // not ours to force close twice
    assert!(matches!(pair.funder.force_close(&id).await, Err(Error::InvalidState { .. })));
    assert_eq!(poll_until_closed(&pair, &pair.funder, &id, 20).await, CloseKind::LocalForceClose);
    pair.chain.mine_block();
    let after = pair.funder_wallet.balance();
    assert!(before - after < MAX_FEES_SAT, "lost {}", before - after);
}

#[test(tokio::test)]
async fn lock_requires_confirmations_test() {
    let pair = TestPair::new();
    let (a, b) = pair.connect().await;
    let (opened, accepted) = tokio::join!(
        pair.funder.open_channel(a, FUNDING_SAT, FundingFees::default(), TEST_PASSWORD),
        pair.fundee.accept_channel(b),
    );
    let (a, pending) = opened.unwrap();
    let (_b, id, info) = accepted.unwrap();
    assert!(matches!(info.status, ChannelStatus::FundingBroadcastButNotLocked { .. }));
    // nothing stored on the funder side before accept
    assert!(matches!(pair.funder.channel_info(&id), Err(Error::ChannelNotFound(_))));
    pending.accept().await.unwrap();

    let err = pair.funder.lock_channel_funding(a, &id).await.err().unwrap();
    assert!(matches!(err, Error::FundingNotLocked { remaining: 3 }));
    assert!(matches!(
        pair.funder.channel_info(&id).unwrap().status,
        ChannelStatus::FundingBroadcastButNotLocked { .. }
    ));

    let watcher = pair.funder.watcher();
    pair.chain.mine_block();
    assert_eq!(watcher.get_remaining_confirmations(&id).await.unwrap(), 2);
    assert_eq!(
        pair.funder.channel_info(&id).unwrap().status,
        ChannelStatus::FundingBroadcastButNotLocked {
            funding_txid: info.funding_outpoint.txid,
            remaining_confirmations: 2
        }
    );
    assert!(watcher.wait_for_funding_confirmations(&id, 5).await.unwrap());
    assert_eq!(watcher.get_remaining_confirmations(&id).await.unwrap(), 0);
}

#[test(tokio::test)]
async fn wrong_wallet_password_test() {
    let pair = TestPair::new();
    let (a, b) = pair.connect().await;
    let (opened, _accepted) = tokio::join!(
        pair.funder.open_channel(a, FUNDING_SAT, FundingFees::default(), "not the password"),
        pair.fundee.accept_channel(b),
    );
    assert!(matches!(opened.err().unwrap(), Error::Wallet(_)));
    assert!(pair.funder.list_channels().unwrap().is_empty());
}

#[test(tokio::test)]
async fn fundee_refuses_large_channel_test() {
    let mut fundee_config = test_config();
    fundee_config.channel.max_funding_sat = 5_000_000;
    let pair = TestPair::with_configs(test_config(), fundee_config);
    let (a, b) = pair.connect().await;
    let (opened, accepted) = tokio::join!(
        pair.funder.open_channel(a, FUNDING_SAT, FundingFees::default(), TEST_PASSWORD),
        pair.fundee.accept_channel(b),
    );
    assert!(matches!(accepted.err().unwrap(), Error::Policy(_)));
    match opened.err().unwrap() {
        Error::Recv(RecvError::ReceivedPeerErrorMessage { description, .. }) => {
            assert_eq!(description, "channel capacity too large")
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(pair.fundee.list_channels().unwrap().is_empty());
}

#[test(tokio::test)]
async fn insufficient_funds_test() {
    let pair = TestPair::new();
    let (a, b) = pair.connect().await;
    let (a, _b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    let spendable = pair.funder.channel_info(&id).unwrap().spendable_sat;
    assert!(spendable < FUNDING_SAT);
    match pair.funder.send_monohop_payment(a, &id, FUNDING_SAT).await {
        Err(Error::InsufficientFunds { requested_sat, available_sat }) => {
            assert_eq!(requested_sat, FUNDING_SAT);
            assert_eq!(available_sat, spendable);
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
    assert_eq!(pair.funder.channel_info(&id).unwrap().local_balance_sat, FUNDING_SAT);
}

#[test(tokio::test)]
async fn cooperative_close_test() {
    let pair = TestPair::new();
    let fundee_before = pair.fundee_wallet.balance();
    let (a, b) = pair.connect().await;
    let (a, b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    let (a, b) = pair.pay(a, b, &id, 1_000_000).await;

    assert_eq!(pair.funder.check_for_closing_tx(&id).await.unwrap(), None);
    assert_eq!(pair.funder.watcher().poll(&id).await.unwrap(), WatchEvent::Nothing);

    let (closed, accepted) =
        tokio::join!(pair.funder.close_channel(a, &id), pair.fundee.accept_close_channel(b, &id));
    let (_a, txid) = closed.unwrap();
    let (_b, fundee_txid) = accepted.unwrap();
    assert_eq!(txid, fundee_txid);

    let snapshot = pair.fundee.channel_info(&id).unwrap();
    assert!(matches!(snapshot.status, ChannelStatus::Closing { .. }));
    assert!(!pair.fundee.check_closing_finished(&snapshot).await.unwrap());
    match pair.fundee.check_for_closing_tx(&id).await.unwrap() {
        Some(ClosingSpend::Cooperative { closing_tx }) => assert_eq!(closing_tx.compute_txid(), txid),
        other => panic!("unexpected spend {:?}", other),
    }
    assert_eq!(pair.fundee.watcher().detect_foreign_spend(&id).await.unwrap(), None);

    pair.chain.mine_block();
    assert!(pair.fundee.check_closing_finished(&snapshot).await.unwrap());
    for node in [&pair.funder, &pair.fundee] {
        assert_eq!(
            node.watcher().poll(&id).await.unwrap(),
            WatchEvent::Closed { closing_txid: txid, kind: CloseKind::Cooperative }
        );
        assert_eq!(node.watcher().poll(&id).await.unwrap(), WatchEvent::Nothing);
    }
    // the funder paid the closing fee
    assert_eq!(pair.fundee_wallet.balance() - fundee_before, 1_000_000);
    assert!(pair.chain.get_confirmations(&txid).await.unwrap().unwrap() > 0);
}

/// The fundee will not go below its fallback rate and tolerates only a
/// factor of two, the funder follows the chain estimate
fn disagreeing_configs(fundee_closing_rounds: u32) -> (NodeConfig, NodeConfig) {
    let mut fundee = test_config();
    fundee.fees.min_feerate_per_kw = fundee.fees.fallback_feerate_per_kw;
    fundee.fees.max_feerate_ratio = 2;
    fundee.fees.closing_max_rounds = fundee_closing_rounds;
    (test_config(), fundee)
}

#[test(tokio::test)]
async fn cooperative_close_counter_offer_test() {
    let (funder_config, fundee_config) = disagreeing_configs(8);
    let fundee_rate = fundee_config.fees.min_feerate_per_kw;
    let pair = TestPair::with_configs(funder_config, fundee_config);
    let (a, b) = pair.connect().await;
    let (a, b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    let (a, b) = pair.pay(a, b, &id, 1_000_000).await;
    let floor = pair.funder.config().fees.min_feerate_per_kw;
    pair.chain.set_feerate(Some(floor));

    let params = ClosingParams {
        funding_outpoint: pair.funder.channel_info(&id).unwrap().funding_outpoint,
        to_holder_sat: FUNDING_SAT - 1_000_000,
        to_counterparty_sat: 1_000_000,
        holder_script: pair.funder_wallet.script(),
        counterparty_script: pair.fundee_wallet.script(),
        holder_is_funder: true,
        dust_limit_sat: pair.funder.config().channel.dust_limit_sat,
    };
    let funder_fee = closing_fee_sat(&params, floor);
    let fundee_fee = closing_fee_sat(&params, fundee_rate);

    let (closed, accepted) =
        tokio::join!(pair.funder.close_channel(a, &id), pair.fundee.accept_close_channel(b, &id));
    let (_a, txid) = closed.unwrap();
    let (_b, fundee_txid) = accepted.unwrap();
    assert_eq!(txid, fundee_txid);

    // the fundee countered with a fee between both opening offers
    let closing_tx = pair.chain.get_tx(&txid).unwrap();
    let fee = FUNDING_SAT - closing_tx.output.iter().map(|o| o.value.to_sat()).sum::<u64>();
    assert!(funder_fee < fee && fee < fundee_fee, "{} < {} < {}", funder_fee, fee, fundee_fee);
    assert_closed_cooperatively(&pair, &id, txid).await;
}

async fn assert_closed_cooperatively(pair: &TestPair, id: &ChannelId, txid: Txid) {
    pair.chain.mine_block();
    for node in [&pair.funder, &pair.fundee] {
        assert_eq!(
            node.watcher().poll(id).await.unwrap(),
            WatchEvent::Closed { closing_txid: txid, kind: CloseKind::Cooperative }
        );
    }
}

#[test(tokio::test)]
async fn cooperative_close_no_convergence_test() {
    let (funder_config, fundee_config) = disagreeing_configs(0);
    let pair = TestPair::with_configs(funder_config, fundee_config);
    let (a, b) = pair.connect().await;
    let (a, b, id) = pair.open_channel(a, b, FUNDING_SAT).await;
    let (a, b) = pair.pay(a, b, &id, 1_000_000).await;
    pair.chain.set_feerate(Some(pair.funder.config().fees.min_feerate_per_kw));

    let (closed, accepted) =
        tokio::join!(pair.funder.close_channel(a, &id), pair.fundee.accept_close_channel(b, &id));
    assert!(matches!(closed, Err(Error::PeerRejected(_))));
    assert!(matches!(accepted, Err(Error::Policy(_))));
    for node in [&pair.funder, &pair.fundee] {
        assert_eq!(node.channel_info(&id).unwrap().status, ChannelStatus::Active);
    }
    assert_eq!(pair.chain.mempool_len(), 0);
}
