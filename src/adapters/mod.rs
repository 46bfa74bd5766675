//! The capability surface every coin engine presents to the reconciler and
//! the request dispatcher.
//!
//! Engines implement the distinction-specific operations; the read-mostly API
//! surface (`proxy_info`, `account_info`, history paging, withdrawal
//! admission) is provided here once, on top of the engine's store and params.

pub mod account;
pub mod tagged;
pub mod token;
pub mod utxo;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::sync::Arc;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{CoinKind, CoinOptions};
use crate::error::{ProxyError, ProxyResult};
use crate::models::{Distinction, HandleRow, PendingPayout, UserId};
use crate::store::outbox::OutboxEvent;
use crate::store::CoinStore;
use crate::units::{self, Rounding, MAX_DECIMALS};

/// Page size for transaction-history listings.
pub const HISTORY_PAGE: i64 = 10;

/// Per-coin parameters shared by every engine.
#[derive(Debug, Clone)]
pub struct CoinParams {
    pub coin: String,
    pub kind: CoinKind,
    pub decimals: u32,
    /// Smallest deposit worth crediting, in minimal units.
    pub minimum_units: Decimal,
    /// Flat payout fee, in minimal units.
    pub static_fee_units: Decimal,
    pub confirmations: u64,
    pub rounding: Rounding,
}

impl CoinParams {
    pub fn from_options(name: &str, kind: CoinKind, options: &CoinOptions) -> ProxyResult<Self> {
        if options.decimals > MAX_DECIMALS {
            return Err(ProxyError::Config(format!(
                "{name}: decimals {} exceeds the supported maximum {MAX_DECIMALS}",
                options.decimals
            )));
        }
        let minimum_units =
            units::to_units(&options.minimum_amount, options.decimals, options.rounding)?;
        let static_fee_units =
            units::to_units(&options.static_fee, options.decimals, options.rounding)?;
        Ok(CoinParams {
            coin: name.to_string(),
            kind,
            decimals: options.decimals,
            minimum_units,
            static_fee_units,
            confirmations: options.confirmations,
            rounding: options.rounding,
        })
    }

    /// Parse a caller-supplied decimal string into minimal units.
    pub fn units(&self, text: &str) -> ProxyResult<Decimal> {
        units::to_units(text, self.decimals, self.rounding)
    }

    /// Render minimal units for the API boundary.
    pub fn display(&self, units: Decimal) -> String {
        units::to_decimal_string(units, self.decimals)
    }
}

/// Sticky fatal-error state. Once set, background work and mutating API calls
/// short-circuit until an operator clears it.
#[derive(Default)]
pub struct Latch {
    cell: Mutex<Option<String>>,
}

impl Latch {
    pub fn new() -> Self {
        Latch::default()
    }

    /// Record the first fatal error seen; later ones are ignored.
    pub fn set(&self, coin: &str, err: &ProxyError) {
        let mut cell = self.cell.lock().expect("latch poisoned");
        if cell.is_none() {
            error!(coin, error = %err, "adapter latched, operator intervention required");
            *cell = Some(err.to_string());
        }
    }

    pub fn check(&self) -> ProxyResult<()> {
        match self.cell.lock().expect("latch poisoned").as_ref() {
            Some(message) => Err(ProxyError::Latched(message.clone())),
            None => Ok(()),
        }
    }

    pub fn is_set(&self) -> bool {
        self.cell.lock().expect("latch poisoned").is_some()
    }

    pub fn message(&self) -> Option<String> {
        self.cell.lock().expect("latch poisoned").clone()
    }

    /// Operator reset. Returns whether anything was latched.
    pub fn clear(&self) -> bool {
        self.cell.lock().expect("latch poisoned").take().is_some()
    }
}

/// Events accumulated during one reconciliation pass, flushed to the outbox
/// by the scheduler at tick end.
#[derive(Default)]
pub struct EventSink {
    events: Vec<OutboxEvent>,
}

impl EventSink {
    pub fn new() -> Self {
        EventSink::default()
    }

    pub fn push(&mut self, coin: &str, user: &UserId, payload: Value) {
        self.events.push(OutboxEvent {
            coin: coin.to_string(),
            user: user.clone(),
            payload,
        });
    }

    pub fn drain(&mut self) -> Vec<OutboxEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
pub trait ChainAdapter: Send + Sync {
    fn params(&self) -> &CoinParams;
    fn store(&self) -> &CoinStore;
    fn latch(&self) -> &Latch;
    fn distinction(&self) -> Distinction;

    /// The shared root address, for models that have one.
    fn root_address(&self) -> Option<String> {
        None
    }

    /// Startup sanity pass; a latching error here disables the adapter
    /// without taking the process down.
    async fn init(&self) -> ProxyResult<()> {
        Ok(())
    }

    /// Format-check a payout destination (and tag where applicable).
    fn validate_destination(&self, address: &str, tag: Option<u64>) -> ProxyResult<()>;

    /// Create-or-return the user's deposit handle. `amount` only applies to
    /// amount-distinction coins.
    async fn resolve_deposit_handle(
        &self,
        user: &UserId,
        amount: Option<&str>,
    ) -> ProxyResult<Value>;

    /// Cancel a user's awaiting deposits. A no-op for every distinction
    /// except amount-based.
    async fn cancel_awaiting_deposits(&self, user: &UserId) -> ProxyResult<bool> {
        let _ = user;
        Ok(false)
    }

    /// One deposit-reconciliation pass.
    async fn poll_deposits(&self, processed: &mut EventSink) -> ProxyResult<()>;

    /// One payout pass over the pending queue.
    async fn process_pending(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &CancellationToken,
    ) -> ProxyResult<()>;

    // ---------- provided operations ----------

    fn handle_payload(&self, handle: &HandleRow) -> Value {
        match self.distinction() {
            Distinction::Address | Distinction::UtxoAddress => {
                json!({ "address": handle.address })
            }
            Distinction::Tag => json!({
                "address": self.root_address(),
                "tag": handle.tag,
            }),
            Distinction::Amount => json!({
                "address": self.root_address(),
                "amount": handle.amount.map(|a| self.params().display(a)),
            }),
        }
    }

    async fn list_awaiting_deposits(&self, user: &UserId) -> ProxyResult<Vec<Value>> {
        let handle = self.store().lookup_handle(user).await?;
        Ok(handle.iter().map(|h| self.handle_payload(h)).collect())
    }

    async fn proxy_info(&self) -> ProxyResult<Value> {
        let params = self.params();
        let totals = self.store().global_totals().await?;
        let balance = self.store().backend_balance().await?;
        let mut info = json!({
            "coinType": params.kind.as_str(),
            "coinDecimals": params.decimals,
            "distinction": self.distinction().as_str(),
            "globalStats": {
                "deposit": params.display(totals.deposited),
                "withdrawal": params.display(totals.withdrawn),
                "balance": params.display(balance),
            },
        });
        if let Some(message) = self.latch().message() {
            info["error"] = json!(message);
        }
        Ok(info)
    }

    async fn account_info(&self, user: &UserId) -> ProxyResult<Value> {
        let params = self.params();
        let totals = self.store().account_totals(user).await?;
        let pending = self.lookup_pending(user).await?;
        Ok(json!({
            "deposit": params.display(totals.deposited),
            "withdrawal": params.display(totals.withdrawn),
            "pending": pending,
        }))
    }

    async fn lookup_pending(&self, user: &UserId) -> ProxyResult<Option<Value>> {
        let pending = self.store().pending_for(user).await?;
        Ok(pending.map(|p| self.pending_payload(&p)))
    }

    fn pending_payload(&self, pending: &PendingPayout) -> Value {
        let mut payload = json!({
            "address": pending.address,
            "amount": self.params().display(pending.amount),
        });
        if let Some(tag) = pending.tag {
            payload["tag"] = json!(tag);
        }
        payload
    }

    async fn list_deposit_log(&self, user: &UserId, skip: i64) -> ProxyResult<Vec<Value>> {
        let records = self.store().list_deposits(user, skip, HISTORY_PAGE).await?;
        Ok(records
            .iter()
            .map(|r| {
                json!({
                    "amount": self.params().display(r.amount),
                    "txHash": r.tx_hash,
                    "vout": r.vout,
                    "blockHash": r.block_hash,
                    "blockHeight": r.block_height,
                    "blockTime": r.block_time,
                })
            })
            .collect())
    }

    async fn list_withdrawal_log(&self, user: &UserId, skip: i64) -> ProxyResult<Vec<Value>> {
        let records = self
            .store()
            .list_withdrawals(user, skip, HISTORY_PAGE)
            .await?;
        Ok(records
            .iter()
            .map(|r| {
                json!({
                    "amount": self.params().display(r.amount),
                    "txHash": r.tx_hash,
                    "address": r.address,
                    "blockHash": r.block_hash,
                    "blockHeight": r.block_height,
                    "timestamp": r.timestamp,
                })
            })
            .collect())
    }

    /// Admission-checked insertion into the pending-payout queue.
    async fn schedule_withdrawal(
        &self,
        user: &UserId,
        address: &str,
        amount_text: &str,
        tag: Option<u64>,
    ) -> ProxyResult<Value> {
        self.latch().check()?;
        let params = self.params();
        let store = self.store();

        let amount = params.units(amount_text)?;
        self.validate_destination(address, tag)?;
        if amount < params.minimum_units + params.static_fee_units {
            return Err(ProxyError::InvalidAmount(format!(
                "amount {amount_text} is below the minimum plus fee"
            )));
        }
        if store.lookup_by_address(address).await?.is_some()
            || self.root_address().as_deref() == Some(address)
        {
            return Err(ProxyError::InvalidAddress(
                "destination is a managed address".into(),
            ));
        }

        // the state checks and the insert form one atomic unit; a failed
        // check rolls the transaction back untouched
        let mut tx = store.begin().await?;
        if store.pending_for_tx(&mut tx, user).await?.is_some() {
            return Err(ProxyError::PendingExists);
        }
        let available =
            store.backend_balance_tx(&mut tx).await? - store.pending_sum_tx(&mut tx).await?;
        if amount > available {
            return Err(ProxyError::InsufficientBackendBalance {
                requested: params.display(amount),
                available: params.display(available.max(Decimal::ZERO)),
            });
        }

        let payout = PendingPayout {
            user: user.clone(),
            amount,
            address: address.to_string(),
            tag,
        };
        store.insert_pending(&mut tx, &payout).await?;
        tx.commit().await?;
        Ok(self.pending_payload(&payout))
    }
}

/// Name-keyed adapter collection; iteration preserves registration order,
/// which is also the reconciler's processing order.
#[derive(Default)]
pub struct AdapterRegistry {
    adapters: Vec<(String, Arc<dyn ChainAdapter>)>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        AdapterRegistry::default()
    }

    pub fn register(&mut self, name: &str, adapter: Arc<dyn ChainAdapter>) {
        info!(coin = name, "registering chain adapter");
        self.adapters.push((name.to_string(), adapter));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChainAdapter>> {
        self.adapters
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, a)| a.clone())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn ChainAdapter>)> {
        self.adapters.iter().map(|(n, a)| (n.as_str(), a))
    }

    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}
