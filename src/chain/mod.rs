//! Chain daemon interfaces.
//!
//! Each distinction engine talks to its chain through one of these traits;
//! the concrete clients (`eth`, `utxod`, `xrpl`) implement them over the
//! daemon's wire dialect. Implementations classify failures: transport/RPC
//! trouble surfaces as [`ProxyError::ChainRpc`] (latches the adapter),
//! a refusal of a specific submission as [`ProxyError::ChainReject`]
//! (rejects that payout and continues).
//!
//! Tests swap in in-memory mock nodes, so nothing above this module ever
//! opens a socket.

pub mod eth;
pub mod utxod;
pub mod xrpl;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::Value;

use crate::error::ProxyResult;

/// Confirmation depth for account-model balance reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Depth {
    Pending,
    Latest,
    /// `latest − n` blocks.
    Confirmed(u64),
}

/// Which transaction-count view to read for the race check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceKind {
    Pending,
    Latest,
}

/// Result of sweeping a derived address into the root account.
#[derive(Debug, Clone)]
pub struct SweepOutcome {
    pub tx_hash: String,
    pub block_hash: Option<String>,
    pub block_height: u64,
    pub block_time: i64,
}

/// Account-model chain with HD-derived per-user deposit addresses.
#[async_trait]
pub trait AccountNode: Send + Sync {
    /// The managed root account address.
    fn root_address(&self) -> &str;

    /// Deterministic derivation at `index`. Pure; index 0 is the root.
    fn address_at(&self, index: u32) -> ProxyResult<String>;

    fn is_address(&self, candidate: &str) -> bool;

    /// Balance in minimal units at the given depth.
    async fn balance(&self, address: &str, depth: Depth) -> ProxyResult<Decimal>;

    /// Current gas price in minimal units per gas unit.
    async fn gas_price(&self) -> ProxyResult<Decimal>;

    /// Root-account transaction count.
    async fn nonce(&self, kind: NonceKind) -> ProxyResult<u64>;

    /// Sign a transfer of `value` from the address derived at `index` to the
    /// root, submit it, wait for the receipt and resolve the enclosing block.
    async fn sweep(&self, index: u32, value: Decimal, gas_price: Decimal)
        -> ProxyResult<SweepOutcome>;

    /// Sign and submit a transfer of `value` from the root to `to`; returns
    /// the transaction hash. A refusal is `ChainReject`.
    async fn pay(&self, to: &str, value: Decimal, gas_price: Decimal) -> ProxyResult<String>;
}

/// One record from a UTXO wallet daemon's transaction listing.
#[derive(Debug, Clone)]
pub struct WalletTx {
    pub category: String,
    pub address: String,
    /// Value in coin units (the daemon's own decimal representation).
    pub amount: Decimal,
    pub confirmations: i64,
    pub txid: String,
    pub vout: Option<i64>,
    pub block_hash: Option<String>,
    pub block_height: Option<u64>,
    pub block_time: Option<i64>,
}

/// UTXO wallet daemon.
#[async_trait]
pub trait UtxoNode: Send + Sync {
    async fn new_address(&self, label: &str) -> ProxyResult<String>;

    /// Page of wallet transactions in daemon order.
    async fn list_transactions(
        &self,
        label: &str,
        count: u32,
        skip: u32,
    ) -> ProxyResult<Vec<WalletTx>>;

    async fn block_height(&self, block_hash: &str) -> ProxyResult<u64>;

    /// Spendable wallet balance in coin units.
    async fn wallet_balance(&self) -> ProxyResult<Decimal>;

    async fn validate_address(&self, address: &str) -> ProxyResult<bool>;

    /// `sendtoaddress`; amount in coin units. Errors are transport-level and
    /// latch the adapter.
    async fn send_to_address(&self, address: &str, amount: Decimal) -> ProxyResult<String>;

    async fn unlock_wallet(&self, passphrase: &str, timeout_secs: u64) -> ProxyResult<()>;
}

/// One ERC-20 `Transfer` observed on chain, destination already filtered to
/// the root address.
#[derive(Debug, Clone)]
pub struct TokenTransfer {
    /// Token value in minimal units.
    pub value: Decimal,
    pub tx_hash: String,
    pub block_hash: String,
    pub block_height: u64,
    pub block_time: i64,
}

/// Fungible token contract on an account-model chain.
#[async_trait]
pub trait TokenNode: Send + Sync {
    fn root_address(&self) -> &str;

    fn is_address(&self, candidate: &str) -> bool;

    async fn latest_block(&self) -> ProxyResult<u64>;

    /// `Transfer` events into the root address over `[from_block, to_block]`,
    /// ascending.
    async fn transfers_to_root(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> ProxyResult<Vec<TokenTransfer>>;

    /// `balanceOf(root)` in minimal units.
    async fn root_token_balance(&self) -> ProxyResult<Decimal>;

    /// Token transfer from the root; returns the transaction hash. A refusal
    /// is `ChainReject`.
    async fn transfer(&self, to: &str, value: Decimal) -> ProxyResult<String>;
}

/// One transaction from a tag-addressed ledger's account history.
#[derive(Debug, Clone)]
pub struct TaggedTx {
    pub hash: String,
    pub destination: String,
    pub tag: Option<u64>,
    /// `delivered_amount` in minimal units, when the ledger reports one.
    pub delivered: Option<Decimal>,
    pub ledger_index: u64,
    pub validated: bool,
    pub success: bool,
    /// Whether the transaction's final meta node actually credited an
    /// account root (i.e. funds moved).
    pub credits_account: bool,
    pub time: i64,
}

/// One page of descending account history.
#[derive(Debug, Clone)]
pub struct TaggedPage {
    pub txs: Vec<TaggedTx>,
    /// Opaque resume marker; `None` when the server has no more pages.
    pub marker: Option<Value>,
}

/// Tag-addressed ledger server.
#[async_trait]
pub trait TaggedNode: Send + Sync {
    fn root_address(&self) -> &str;

    fn is_address(&self, candidate: &str) -> bool;

    /// Account history for the root, newest first, resumed at `marker`.
    async fn account_tx(&self, marker: Option<Value>) -> ProxyResult<TaggedPage>;

    /// Root account balance in minimal units.
    async fn root_balance(&self) -> ProxyResult<Decimal>;

    /// Submit a payment signed by the configured secret. Non-success replies
    /// are `ChainRpc` — the ledger gives no reliable way to tell a bad
    /// destination from server trouble at submit time.
    async fn submit_payment(
        &self,
        to: &str,
        value: Decimal,
        tag: Option<u64>,
    ) -> ProxyResult<String>;
}
