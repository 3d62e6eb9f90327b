use async_trait::async_trait;
use bitcoin::{OutPoint, ScriptBuf, Transaction, Txid};
use thiserror::Error;

/// Errors reported by the chain backend
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChainError {
    /// The backend refused the transaction, typically because a conflicting
    /// transaction is already known
    #[error("transaction rejected: {0}")]
    Rejected(String),
    /// The transaction is invalid or not yet valid
    #[error("invalid transaction: {0}")]
    Invalid(String),
    /// The backend could not be reached or did not answer
    #[error("chain backend unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    /// Whether the broadcast lost to a conflicting spend
    pub fn is_conflict(&self) -> bool {
        matches!(self, ChainError::Rejected(_))
    }
}

/// Errors reported by the wallet
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("wrong password")]
    BadPassword,
    #[error("insufficient wallet funds: need {needed_sat} sat, have {available_sat} sat")]
    InsufficientFunds { needed_sat: u64, available_sat: u64 },
    #[error("wallet: {0}")]
    Other(String),
}

/// Access to the blockchain
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Submit a transaction.  Rebroadcasting a known transaction succeeds.
    async fn broadcast_transaction(&self, tx: &Transaction) -> Result<Txid, ChainError>;

    /// Fee rate, in sat per 1000 weight units, to confirm within the target
    /// number of blocks.  `None` if the backend has no estimate.
    async fn estimate_feerate_per_kw(&self, confirmation_target: u16) -> Option<u32>;

    /// Confirmations of a transaction: `None` if unknown, `Some(0)` if it is
    /// only in the mempool
    async fn get_confirmations(&self, txid: &Txid) -> Result<Option<u32>, ChainError>;

    /// The transaction spending an outpoint, in the mempool or confirmed
    async fn get_spending_tx(&self, outpoint: &OutPoint) -> Result<Option<Transaction>, ChainError>;
}

/// The on-chain wallet that funds channels and receives closed channel funds
#[async_trait]
pub trait Wallet: Send + Sync {
    /// Build and sign a transaction paying `amount_sat` to `script_pubkey`.
    /// Must not broadcast.  Spending is gated by the wallet password.
    async fn fund_channel(
        &self,
        script_pubkey: ScriptBuf,
        amount_sat: u64,
        feerate_per_kw: u32,
        password: &str,
    ) -> Result<Transaction, WalletError>;

    /// Destination for funds coming back from channels
    fn sweep_script(&self) -> ScriptBuf;
}
