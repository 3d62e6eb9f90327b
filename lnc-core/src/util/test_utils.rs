use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::secp256k1::{All, PublicKey, Secp256k1, SecretKey};
use bitcoin::transaction::Version;
use bitcoin::{
    relative, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};

use crate::chain::{ChainError, ChainSource, Wallet, WalletError};
use crate::channel::{Channel, ChannelId};
use crate::clock::Sleeper;
use crate::config::NodeConfig;
use crate::keys::KeysManager;
use crate::node::{FundingFees, Node};
use crate::peer::PeerConnection;
use crate::persist::{self, ChannelPersist};
use crate::transport::loopback::LoopbackNetwork;
use crate::tx::{p2wpkh_script, p2wpkh_sighash};
use crate::util::crypto_utils::{sign_digest, signature_to_bitcoin_vec};
use crate::util::transaction_utils::{
    fee_for_weight, MIN_DUST_LIMIT_SATOSHIS, P2WPKH_WITNESS_WEIGHT, SEGWIT_MARKER_WEIGHT,
};

/// Password of test wallets and key managers
pub const TEST_PASSWORD: &str = "correct horse battery staple";
/// Initial funds of each test wallet
pub const TEST_WALLET_FUNDS_SAT: u64 = 100_000_000;

#[derive(Default)]
struct ChainState {
    height: u32,
    txs: HashMap<Txid, Transaction>,
    heights: HashMap<Txid, u32>,
    mempool: Vec<Txid>,
    spends: HashMap<OutPoint, Txid>,
    coinbase_count: u32,
}

impl ChainState {
    fn confirmations(&self, txid: &Txid) -> Option<u32> {
        match self.heights.get(txid) {
            Some(h) => Some(self.height - h + 1),
            None => self.txs.get(txid).map(|_| 0),
        }
    }

    fn prevout(&self, outpoint: &OutPoint) -> Option<TxOut> {
        self.txs.get(&outpoint.txid).and_then(|tx| tx.output.get(outpoint.vout as usize)).cloned()
    }
}

/// An in-memory chain with a mempool.
///
/// Transactions are script-verified, conflicting spends are rejected, and
/// BIP68 relative height locks are enforced: an output with a delay of `n`
/// can be spent once its transaction has `n` confirmations.  Time-based
/// locks are ignored.
pub struct MockChain {
    state: Mutex<ChainState>,
    feerate: Mutex<Option<u32>>,
}

impl MockChain {
    pub fn new() -> Self {
        MockChain { state: Mutex::new(ChainState::default()), feerate: Mutex::new(None) }
    }

    fn state(&self) -> MutexGuard<'_, ChainState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn height(&self) -> u32 {
        self.state().height
    }

    /// Set what fee estimation returns
    pub fn set_feerate(&self, feerate_per_kw: Option<u32>) {
        *self.feerate.lock().unwrap_or_else(|e| e.into_inner()) = feerate_per_kw;
    }

    /// Create a confirmed output paying `script_pubkey`
    pub fn fund(&self, script_pubkey: ScriptBuf, amount_sat: u64) -> OutPoint {
        let mut state = self.state();
        state.coinbase_count += 1;
        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::null(),
                script_sig: ScriptBuf::from_bytes(state.coinbase_count.to_le_bytes().to_vec()),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut { value: Amount::from_sat(amount_sat), script_pubkey }],
        };
        let txid = tx.compute_txid();
        let height = state.height;
        state.txs.insert(txid, tx);
        state.heights.insert(txid, height);
        OutPoint { txid, vout: 0 }
    }

    /// Confirm everything in the mempool in a new block
    pub fn mine_block(&self) {
        let mut state = self.state();
        state.height += 1;
        let height = state.height;
        let mempool = std::mem::take(&mut state.mempool);
        for txid in mempool {
            state.heights.insert(txid, height);
        }
    }

    pub fn mine_blocks(&self, count: u32) {
        for _ in 0..count {
            self.mine_block();
        }
    }

    pub fn get_tx(&self, txid: &Txid) -> Option<Transaction> {
        self.state().txs.get(txid).cloned()
    }

    pub fn is_confirmed(&self, txid: &Txid) -> bool {
        self.state().heights.contains_key(txid)
    }

    pub fn mempool_len(&self) -> usize {
        self.state().mempool.len()
    }

    /// Confirmed outputs paying `script_pubkey` that nothing spends
    pub fn unspent(&self, script_pubkey: &Script) -> Vec<(OutPoint, TxOut)> {
        let state = self.state();
        let mut utxos = Vec::new();
        for txid in state.heights.keys() {
            let tx = &state.txs[txid];
            for (vout, out) in tx.output.iter().enumerate() {
                let outpoint = OutPoint { txid: *txid, vout: vout as u32 };
                if out.script_pubkey.as_script() == script_pubkey && !state.spends.contains_key(&outpoint) {
                    utxos.push((outpoint, out.clone()));
                }
            }
        }
        utxos.sort_by_key(|(outpoint, _)| *outpoint);
        utxos
    }

    /// Sum of [`MockChain::unspent`]
    pub fn balance(&self, script_pubkey: &Script) -> u64 {
        self.unspent(script_pubkey).iter().map(|(_, out)| out.value.to_sat()).sum()
    }

    fn accept(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        let txid = tx.compute_txid();
        let mut state = self.state();
        if state.txs.contains_key(&txid) {
            return Ok(txid);
        }
        if let LockTime::Blocks(height) = tx.lock_time {
            let final_sequences = tx.input.iter().all(|i| i.sequence == Sequence::MAX);
            if height.to_consensus_u32() > state.height && !final_sequences {
                return Err(ChainError::Invalid("non-final".into()));
            }
        }
        let mut input_sat = 0;
        for input in &tx.input {
            let prevout = state
                .prevout(&input.previous_output)
                .ok_or_else(|| ChainError::Invalid("missing-inputs".into()))?;
            if let Some(spender) = state.spends.get(&input.previous_output) {
                return Err(ChainError::Rejected(format!("txn-mempool-conflict with {}", spender)));
            }
            if tx.version.0 >= 2 {
                if let Some(relative::LockTime::Blocks(delay)) = input.sequence.to_relative_lock_time() {
                    let confirmations =
                        state.confirmations(&input.previous_output.txid).unwrap_or(0);
                    if delay.value() > 0 && confirmations < delay.value() as u32 {
                        return Err(ChainError::Invalid("non-BIP68-final".into()));
                    }
                }
            }
            input_sat += prevout.value.to_sat();
        }
        let output_sat: u64 = tx.output.iter().map(|o| o.value.to_sat()).sum();
        if output_sat > input_sat {
            return Err(ChainError::Invalid("bad-txns-in-belowout".into()));
        }
        tx.verify(|outpoint| state.prevout(outpoint))
            .map_err(|e| ChainError::Invalid(format!("script verification failed: {}", e)))?;

        for input in &tx.input {
            state.spends.insert(input.previous_output, txid);
        }
        state.txs.insert(txid, tx.clone());
        state.mempool.push(txid);
        Ok(txid)
    }
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainSource for MockChain {
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, ChainError> {
        self.accept(tx)
    }

    async fn estimate_feerate_per_kw(&self, _confirmation_target: u16) -> Option<u32> {
        *self.feerate.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn get_confirmations(&self, txid: &Txid) -> Result<Option<u32>, ChainError> {
        Ok(self.state().confirmations(txid))
    }

    async fn get_spending_tx(&self, outpoint: &OutPoint) -> Result<Option<Transaction>, ChainError> {
        let state = self.state();
        Ok(state.spends.get(outpoint).and_then(|txid| state.txs.get(txid)).cloned())
    }
}

/// A single-key P2WPKH wallet on a [`MockChain`]
pub struct MockWallet {
    chain: Arc<MockChain>,
    key: SecretKey,
    password: String,
    secp_ctx: Secp256k1<All>,
}

impl MockWallet {
    pub fn new(chain: Arc<MockChain>, seed: u8, password: &str) -> Self {
        let key = SecretKey::from_slice(&[seed.wrapping_add(0x40); 32]).expect("wallet key");
        MockWallet { chain, key, password: password.to_string(), secp_ctx: Secp256k1::new() }
    }

    pub fn script(&self) -> ScriptBuf {
        p2wpkh_script(&PublicKey::from_secret_key(&self.secp_ctx, &self.key))
    }

    pub fn balance(&self) -> u64 {
        self.chain.balance(&self.script())
    }
}

#[async_trait]
impl Wallet for MockWallet {
    async fn fund_channel(
        &self,
        script_pubkey: ScriptBuf,
        amount_sat: u64,
        feerate_per_kw: u32,
        password: &str,
    ) -> Result<Transaction, WalletError> {
        if password != self.password {
            return Err(WalletError::BadPassword);
        }
        let own_script = self.script();
        let utxos = self.chain.unspent(&own_script);
        let available_sat: u64 = utxos.iter().map(|(_, out)| out.value.to_sat()).sum();
        let mut tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: utxos
                .iter()
                .map(|(outpoint, _)| TxIn {
                    previous_output: *outpoint,
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
                .collect(),
            output: vec![
                TxOut { value: Amount::from_sat(amount_sat), script_pubkey },
                TxOut { value: Amount::ZERO, script_pubkey: own_script.clone() },
            ],
        };
        let weight = tx.weight().to_wu() + SEGWIT_MARKER_WEIGHT + P2WPKH_WITNESS_WEIGHT * utxos.len() as u64;
        let fee = fee_for_weight(feerate_per_kw, weight);
        if available_sat < amount_sat + fee {
            return Err(WalletError::InsufficientFunds { needed_sat: amount_sat + fee, available_sat });
        }
        let change = available_sat - amount_sat - fee;
        if change < MIN_DUST_LIMIT_SATOSHIS {
            tx.output.pop();
        } else {
            tx.output[1].value = Amount::from_sat(change);
        }

        let pubkey = PublicKey::from_secret_key(&self.secp_ctx, &self.key);
        let mut witnesses = Vec::with_capacity(utxos.len());
        for (idx, (_, prevout)) in utxos.iter().enumerate() {
            let sighash = p2wpkh_sighash(&tx, idx, &own_script, prevout.value.to_sat())
                .map_err(|e| WalletError::Other(e.to_string()))?;
            let sig = sign_digest(&self.secp_ctx, sighash, &self.key);
            witnesses.push(Witness::from_slice(&[signature_to_bitcoin_vec(sig), pubkey.serialize().to_vec()]));
        }
        for (input, witness) in tx.input.iter_mut().zip(witnesses) {
            input.witness = witness;
        }
        Ok(tx)
    }

    fn sweep_script(&self) -> ScriptBuf {
        self.script()
    }
}

/// Simulated time: every sleep mines a block
pub struct MiningSleeper {
    chain: Arc<MockChain>,
}

impl MiningSleeper {
    pub fn new(chain: Arc<MockChain>) -> Self {
        MiningSleeper { chain }
    }
}

#[async_trait]
impl Sleeper for MiningSleeper {
    async fn sleep(&self, _duration: Duration) {
        self.chain.mine_block();
        tokio::task::yield_now().await;
    }
}

/// Channel storage in a map
#[derive(Default)]
pub struct InMemoryPersister {
    channels: Mutex<BTreeMap<ChannelId, Channel>>,
}

impl InMemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> MutexGuard<'_, BTreeMap<ChannelId, Channel>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl ChannelPersist for InMemoryPersister {
    fn put_channel(&self, channel: &Channel) -> Result<(), persist::Error> {
        self.channels().insert(channel.id, channel.clone());
        Ok(())
    }

    fn get_channel(&self, id: &ChannelId) -> Result<Option<Channel>, persist::Error> {
        Ok(self.channels().get(id).cloned())
    }

    fn list_channels(&self) -> Result<Vec<Channel>, persist::Error> {
        Ok(self.channels().values().cloned().collect())
    }

    fn delete_channel(&self, id: &ChannelId) -> Result<(), persist::Error> {
        self.channels()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| persist::Error::NotFound(id.to_string()))
    }
}

/// Configuration for tests: short polls, three confirmations, a short delay
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig { poll_interval_ms: 10, ..NodeConfig::default() };
    config.channel.to_self_delay = 6;
    config
}

/// A node with a funded wallet on `chain`
pub fn make_node_on(
    seed: u8,
    chain: &Arc<MockChain>,
    config: NodeConfig,
    persister: Arc<dyn ChannelPersist>,
) -> (Node, Arc<MockWallet>) {
    let wallet = Arc::new(MockWallet::new(Arc::clone(chain), seed, TEST_PASSWORD));
    chain.fund(wallet.script(), TEST_WALLET_FUNDS_SAT);
    let keys = KeysManager::new(&[seed; 32], TEST_PASSWORD).expect("keys");
    let node = Node::new(
        config,
        keys,
        persister,
        Arc::clone(chain) as Arc<dyn ChainSource>,
        Arc::clone(&wallet) as Arc<dyn Wallet>,
        Arc::new(MiningSleeper::new(Arc::clone(chain))),
    );
    (node, wallet)
}

/// A node on a fresh chain
pub fn make_node(seed: u8) -> (Node, Arc<MockChain>) {
    let chain = Arc::new(MockChain::new());
    let (node, _wallet) = make_node_on(seed, &chain, test_config(), Arc::new(InMemoryPersister::new()));
    (node, chain)
}

/// Two nodes on one chain and one loopback network.  `funder` opens
/// channels to `fundee`.
pub struct TestPair {
    pub chain: Arc<MockChain>,
    pub funder: Node,
    pub funder_wallet: Arc<MockWallet>,
    pub fundee: Node,
    pub fundee_wallet: Arc<MockWallet>,
    network: LoopbackNetwork,
    connections: AtomicU32,
}

impl TestPair {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: NodeConfig) -> Self {
        Self::with_configs(config.clone(), config)
    }

    pub fn with_configs(funder_config: NodeConfig, fundee_config: NodeConfig) -> Self {
        Self::with_persisters(
            funder_config,
            fundee_config,
            Arc::new(InMemoryPersister::new()),
            Arc::new(InMemoryPersister::new()),
        )
    }

    /// A pair whose nodes store channels in the given persisters
    pub fn with_persisters(
        funder_config: NodeConfig,
        fundee_config: NodeConfig,
        funder_persister: Arc<dyn ChannelPersist>,
        fundee_persister: Arc<dyn ChannelPersist>,
    ) -> Self {
        let chain = Arc::new(MockChain::new());
        let (funder, funder_wallet) = make_node_on(1, &chain, funder_config, funder_persister);
        let (fundee, fundee_wallet) = make_node_on(2, &chain, fundee_config, fundee_persister);
        TestPair {
            chain,
            funder,
            funder_wallet,
            fundee,
            fundee_wallet,
            network: LoopbackNetwork::new(),
            connections: AtomicU32::new(0),
        }
    }

    /// Connect the funder to the fundee.  Returns the funder's side first.
    pub async fn connect(&self) -> (PeerConnection, PeerConnection) {
        let n = self.connections.fetch_add(1, Ordering::SeqCst);
        let address = format!("fundee-{}", n);
        let mut listener =
            self.network.listen(self.fundee.keys.node_secret(), &address).expect("listen");
        let connector = self.network.connector();
        let fundee_id = self.fundee.node_id();
        let funder_id = self.funder.node_id();
        let (a, b) = tokio::join!(
            self.funder.connect(&connector, &fundee_id, &address),
            self.fundee.accept_peer(&mut listener, Some(&funder_id)),
        );
        (a.expect("connect"), b.expect("accept"))
    }

    /// Open, fund, confirm and lock a channel
    pub async fn open_channel(
        &self,
        a: PeerConnection,
        b: PeerConnection,
        funding_sat: u64,
    ) -> (PeerConnection, PeerConnection, ChannelId) {
        let (opened, accepted) = tokio::join!(
            self.funder.open_channel(a, funding_sat, FundingFees::default(), TEST_PASSWORD),
            self.fundee.accept_channel(b),
        );
        let (a, pending) = opened.expect("open_channel");
        let (b, id, _) = accepted.expect("accept_channel");
        assert_eq!(pending.channel_id(), id);
        pending.accept().await.expect("accept pending");
        self.chain.mine_blocks(self.funder.config().channel.minimum_depth);
        let (a, b) = tokio::join!(
            self.funder.lock_channel_funding(a, &id),
            self.fundee.lock_channel_funding(b, &id),
        );
        (a.expect("lock funder"), b.expect("lock fundee"), id)
    }

    /// Pay from the funder to the fundee
    pub async fn pay(
        &self,
        a: PeerConnection,
        b: PeerConnection,
        id: &ChannelId,
        amount_sat: u64,
    ) -> (PeerConnection, PeerConnection) {
        let (sent, received) = tokio::join!(
            self.funder.send_monohop_payment(a, id, amount_sat),
            self.fundee.receive_monohop_payment(b, id),
        );
        let (b, received_sat) = received.expect("receive payment");
        assert_eq!(received_sat, amount_sat);
        (sent.expect("send payment"), b)
    }
}

impl Default for TestPair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_chain_relative_lock_test() {
        let chain = Arc::new(MockChain::new());
        let wallet = MockWallet::new(Arc::clone(&chain), 1, "pw");
        chain.fund(wallet.script(), 1_000_000);
        let funding = wallet.fund_channel(ScriptBuf::from_bytes(vec![0x51]), 10_000, 253, "pw").await.unwrap();
        assert!(chain.broadcast_transaction(&funding).await.is_ok());
        // rebroadcast is fine, a conflicting spend is not
        assert!(chain.broadcast_transaction(&funding).await.is_ok());
        assert_eq!(chain.get_confirmations(&funding.compute_txid()).await.unwrap(), Some(0));
        chain.mine_block();
        assert_eq!(chain.get_confirmations(&funding.compute_txid()).await.unwrap(), Some(1));
        assert!(matches!(
            wallet.fund_channel(ScriptBuf::new(), 0, 253, "wrong").await,
            Err(WalletError::BadPassword)
        ));
    }
}
