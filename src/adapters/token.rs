//! Amount-based engine for fungible tokens on a shared root address.
//!
//! Attribution key is the transferred value itself: each deposit intent
//! reserves a coin-wide unique amount, perturbed by a few minimal units when
//! the requested value is already taken. Polling scans the contract's
//! `Transfer` log over the confirmed window above the watermark.

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use rust_decimal::Decimal;
use serde_json::json;
use sqlx::{Sqlite, Transaction};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{ChainAdapter, CoinParams, EventSink, Latch};
use crate::chain::TokenNode;
use crate::error::{ErrorKind, ProxyError, ProxyResult};
use crate::models::{DepositRecord, Distinction, HandleRow, UserId, WithdrawalRecord};
use crate::store::CoinStore;

/// Perturbation draw bounds, in minimal units.
const PERTURB_MIN: i64 = -128;
const PERTURB_MAX: i64 = 127;
/// Bounded uniqueness attempts before the request fails.
const MAX_RESERVE_ATTEMPTS: u32 = 8;

pub struct TokenEngine {
    params: CoinParams,
    store: CoinStore,
    latch: Latch,
    node: Arc<dyn TokenNode>,
}

impl TokenEngine {
    pub fn new(params: CoinParams, store: CoinStore, node: Arc<dyn TokenNode>) -> Self {
        TokenEngine {
            params,
            store,
            latch: Latch::new(),
            node,
        }
    }

    /// Find a coin-wide unique amount at or near `base`. Runs against the
    /// transaction that will insert the handle, so the uniqueness probe and
    /// the reservation are one atomic unit.
    async fn reserve_amount(
        &self,
        tx: &mut Transaction<'_, Sqlite>,
        base: Decimal,
    ) -> ProxyResult<Decimal> {
        for attempt in 0..MAX_RESERVE_ATTEMPTS {
            let candidate = if attempt == 0 {
                base
            } else {
                let delta: i64 = rand::thread_rng().gen_range(PERTURB_MIN..=PERTURB_MAX);
                base + Decimal::from(delta)
            };
            if candidate <= Decimal::ZERO {
                continue;
            }
            if self.store.lookup_by_amount_tx(tx, candidate).await?.is_none() {
                return Ok(candidate);
            }
        }
        Err(ProxyError::AmountCollision)
    }
}

#[async_trait]
impl ChainAdapter for TokenEngine {
    fn params(&self) -> &CoinParams {
        &self.params
    }

    fn store(&self) -> &CoinStore {
        &self.store
    }

    fn latch(&self) -> &Latch {
        &self.latch
    }

    fn distinction(&self) -> Distinction {
        Distinction::Amount
    }

    fn root_address(&self) -> Option<String> {
        Some(self.node.root_address().to_string())
    }

    async fn init(&self) -> ProxyResult<()> {
        self.node.root_token_balance().await?;
        Ok(())
    }

    fn validate_destination(&self, address: &str, _tag: Option<u64>) -> ProxyResult<()> {
        if !self.node.is_address(address) {
            return Err(ProxyError::InvalidAddress(address.to_string()));
        }
        Ok(())
    }

    async fn resolve_deposit_handle(
        &self,
        user: &UserId,
        amount: Option<&str>,
    ) -> ProxyResult<serde_json::Value> {
        self.latch.check()?;
        if let Some(existing) = self.store.lookup_handle(user).await? {
            return Ok(self.handle_payload(&existing));
        }
        let text = amount.ok_or_else(|| {
            ProxyError::InvalidAmount("amount is required for this coin".into())
        })?;
        let base = self.params.units(text)?;
        if base < self.params.minimum_units {
            return Err(ProxyError::InvalidAmount(format!(
                "amount {text} is below the minimum"
            )));
        }

        let mut tx = self.store.begin().await?;
        let effective = self.reserve_amount(&mut tx, base).await?;
        let handle = HandleRow::amount(user.clone(), effective);
        self.store.insert_handle(&mut tx, &handle).await?;
        tx.commit().await?;
        info!(
            coin = %self.params.coin,
            user = %user,
            amount = %self.params.display(effective),
            "reserved deposit amount"
        );
        Ok(self.handle_payload(&handle))
    }

    async fn cancel_awaiting_deposits(&self, user: &UserId) -> ProxyResult<bool> {
        self.latch.check()?;
        let mut tx = self.store.begin().await?;
        let deleted = self.store.delete_amount_handle(&mut tx, user).await?;
        tx.commit().await?;
        Ok(deleted)
    }

    async fn poll_deposits(&self, processed: &mut EventSink) -> ProxyResult<()> {
        let head = self.node.latest_block().await?;
        let upper = head.saturating_sub(self.params.confirmations);
        let lower = self
            .store
            .watermark()
            .await?
            .map(|w| w as u64 + 1)
            .unwrap_or(0);
        if upper < lower {
            return Ok(());
        }

        let transfers = self.node.transfers_to_root(lower, upper).await?;
        let mut credits: Vec<DepositRecord> = Vec::new();
        for transfer in transfers {
            if self.store.transaction_exists(&transfer.tx_hash).await? {
                continue;
            }
            let Some(handle) = self.store.lookup_by_amount(transfer.value).await? else {
                continue;
            };
            credits.push(DepositRecord {
                entry_id: 0,
                user: handle.user,
                amount: transfer.value,
                tx_hash: transfer.tx_hash,
                vout: None,
                block_hash: Some(transfer.block_hash),
                block_height: transfer.block_height as i64,
                block_time: transfer.block_time,
            });
        }

        let balance = self.node.root_token_balance().await?;

        let mut tx = self.store.begin().await?;
        for credit in &credits {
            self.store
                .update_account_totals(&mut tx, &credit.user, credit.amount, Decimal::ZERO)
                .await?;
            self.store
                .update_global_totals(&mut tx, credit.amount, Decimal::ZERO)
                .await?;
            self.store.insert_transaction(&mut tx, credit).await?;
            self.store
                .delete_handle_by_amount(&mut tx, credit.amount)
                .await?;
        }
        self.store
            .record_processed_block(&mut tx, upper as i64, None)
            .await?;
        self.store.update_backend_balance(&mut tx, balance).await?;
        tx.commit().await?;

        for credit in credits {
            processed.push(
                &self.params.coin,
                &credit.user,
                json!({
                    "amount": self.params.display(credit.amount),
                    "txHash": credit.tx_hash,
                    "blockHeight": credit.block_height,
                }),
            );
        }
        Ok(())
    }

    async fn process_pending(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &CancellationToken,
    ) -> ProxyResult<()> {
        for payout in self.store.all_pending().await? {
            if shutdown.is_cancelled() {
                break;
            }

            let transfer_value = payout.amount - self.params.static_fee_units;
            if transfer_value <= Decimal::ZERO {
                let mut tx = self.store.begin().await?;
                self.store.delete_pending(&mut tx, &payout.user).await?;
                tx.commit().await?;
                rejected.push(
                    &self.params.coin,
                    &payout.user,
                    json!({
                        "amount": self.params.display(payout.amount),
                        "address": payout.address,
                        "reason": "amount does not cover the fee",
                    }),
                );
                continue;
            }

            match self.node.transfer(&payout.address, transfer_value).await {
                Ok(tx_hash) => {
                    let already_recorded = self.store.withdrawal_exists(&tx_hash).await?;
                    let mut tx = self.store.begin().await?;
                    if !already_recorded {
                        self.store
                            .update_account_totals(
                                &mut tx,
                                &payout.user,
                                Decimal::ZERO,
                                payout.amount,
                            )
                            .await?;
                        self.store
                            .update_global_totals(&mut tx, Decimal::ZERO, payout.amount)
                            .await?;
                        self.store
                            .insert_withdrawal(
                                &mut tx,
                                &WithdrawalRecord {
                                    entry_id: 0,
                                    user: payout.user.clone(),
                                    amount: payout.amount,
                                    tx_hash: tx_hash.clone(),
                                    block_hash: None,
                                    block_height: None,
                                    address: payout.address.clone(),
                                    timestamp: Utc::now().timestamp(),
                                },
                            )
                            .await?;
                    }
                    self.store.delete_pending(&mut tx, &payout.user).await?;
                    tx.commit().await?;
                    processed.push(
                        &self.params.coin,
                        &payout.user,
                        json!({
                            "amount": self.params.display(payout.amount),
                            "txHash": tx_hash,
                            "address": payout.address,
                        }),
                    );
                }
                Err(e) if e.kind() == ErrorKind::AdapterReject => {
                    let mut tx = self.store.begin().await?;
                    self.store.delete_pending(&mut tx, &payout.user).await?;
                    tx.commit().await?;
                    rejected.push(
                        &self.params.coin,
                        &payout.user,
                        json!({
                            "amount": self.params.display(payout.amount),
                            "address": payout.address,
                            "reason": e.to_string(),
                        }),
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::TokenTransfer;
    use crate::config::CoinKind;
    use crate::store::Store;
    use crate::units::Rounding;
    use rust_decimal_macros::dec;
    use std::str::FromStr;
    use tokio::sync::Mutex;

    struct MockTokenNode {
        head: Mutex<u64>,
        transfers: Mutex<Vec<TokenTransfer>>,
        balance: Mutex<Decimal>,
        reject_transfers: bool,
    }

    impl MockTokenNode {
        fn new() -> Self {
            MockTokenNode {
                head: Mutex::new(100),
                transfers: Mutex::new(Vec::new()),
                balance: Mutex::new(dec!(100000000)),
                reject_transfers: false,
            }
        }
    }

    #[async_trait]
    impl TokenNode for MockTokenNode {
        fn root_address(&self) -> &str {
            "0xroot"
        }

        fn is_address(&self, candidate: &str) -> bool {
            candidate.starts_with("0x")
        }

        async fn latest_block(&self) -> ProxyResult<u64> {
            Ok(*self.head.lock().await)
        }

        async fn transfers_to_root(
            &self,
            from_block: u64,
            to_block: u64,
        ) -> ProxyResult<Vec<TokenTransfer>> {
            let transfers = self.transfers.lock().await;
            Ok(transfers
                .iter()
                .filter(|t| t.block_height >= from_block && t.block_height <= to_block)
                .cloned()
                .collect())
        }

        async fn root_token_balance(&self) -> ProxyResult<Decimal> {
            Ok(*self.balance.lock().await)
        }

        async fn transfer(&self, to: &str, value: Decimal) -> ProxyResult<String> {
            if self.reject_transfers {
                return Err(ProxyError::ChainReject("transfer reverted".into()));
            }
            Ok(format!("tok-{to}-{value}"))
        }
    }

    fn params() -> CoinParams {
        CoinParams {
            coin: "usdt".to_string(),
            kind: CoinKind::Erc20,
            decimals: 6,
            minimum_units: dec!(1000), // 0.001
            static_fee_units: dec!(100),
            confirmations: 12,
            rounding: Rounding::Truncate,
        }
    }

    async fn engine(node: Arc<MockTokenNode>) -> TokenEngine {
        let store = Store::in_memory().await.unwrap();
        let coin = store.coin("usdt").unwrap();
        coin.migrate(Distinction::Amount).await.unwrap();
        TokenEngine::new(params(), coin, node)
    }

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn colliding_amounts_are_perturbed_within_bounds() {
        let engine = engine(Arc::new(MockTokenNode::new())).await;
        let first = engine
            .resolve_deposit_handle(&user("aa"), Some("1.000000"))
            .await
            .unwrap();
        assert_eq!(first["address"], "0xroot");
        assert_eq!(first["amount"], "1.000000");

        let second = engine
            .resolve_deposit_handle(&user("bb"), Some("1.000000"))
            .await
            .unwrap();
        let effective = second["amount"].as_str().unwrap();
        assert_ne!(effective, "1.000000");
        let delta = Decimal::from_str(effective).unwrap() - dec!(1);
        assert!(delta.abs() <= dec!(0.000128), "delta {delta} out of bounds");

        // idempotent for the same user while the handle is live
        let again = engine
            .resolve_deposit_handle(&user("aa"), Some("2.000000"))
            .await
            .unwrap();
        assert_eq!(again["amount"], "1.000000");
    }

    #[tokio::test]
    async fn cancel_frees_the_reserved_amount() {
        let engine = engine(Arc::new(MockTokenNode::new())).await;
        engine
            .resolve_deposit_handle(&user("aa"), Some("1.000000"))
            .await
            .unwrap();
        assert!(engine.cancel_awaiting_deposits(&user("aa")).await.unwrap());
        assert!(!engine.cancel_awaiting_deposits(&user("aa")).await.unwrap());

        let reclaimed = engine
            .resolve_deposit_handle(&user("bb"), Some("1.000000"))
            .await
            .unwrap();
        assert_eq!(reclaimed["amount"], "1.000000");
    }

    #[tokio::test]
    async fn matching_transfer_is_attributed_and_consumes_handle() {
        let node = Arc::new(MockTokenNode::new());
        let engine = engine(node.clone()).await;
        engine
            .resolve_deposit_handle(&user("aa"), Some("1.000000"))
            .await
            .unwrap();

        node.transfers.lock().await.push(TokenTransfer {
            value: dec!(1000000),
            tx_hash: "tt1".to_string(),
            block_hash: "bh1".to_string(),
            block_height: 80,
            block_time: 1_700_000_000,
        });
        // an unmatched value is ignored
        node.transfers.lock().await.push(TokenTransfer {
            value: dec!(777),
            tx_hash: "tt2".to_string(),
            block_hash: "bh1".to_string(),
            block_height: 80,
            block_time: 1_700_000_000,
        });

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        assert_eq!(sink.drain().len(), 1);
        let info = engine.account_info(&user("aa")).await.unwrap();
        assert_eq!(info["deposit"], "1.000000");
        assert!(engine.store.lookup_handle(&user("aa")).await.unwrap().is_none());
        // watermark advanced to head - confirmations
        assert_eq!(engine.store.watermark().await.unwrap(), Some(88));

        // replaying the window cannot double-credit
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(
            engine.account_info(&user("aa")).await.unwrap()["deposit"],
            "1.000000"
        );
    }

    #[tokio::test]
    async fn admission_requires_backend_headroom() {
        let node = Arc::new(MockTokenNode::new());
        let engine = engine(node).await;

        // snapshot 1.0, existing pending of 0.9
        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .update_backend_balance(&mut tx, dec!(1000000))
            .await
            .unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &crate::models::PendingPayout {
                    user: user("aa"),
                    amount: dec!(900000),
                    address: "0xfeed".to_string(),
                    tag: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let err = engine
            .schedule_withdrawal(&user("bb"), "0xbeef", "0.2", None)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
        assert!(engine.store.pending_for(&user("bb")).await.unwrap().is_none());

        // 0.1 minus fees still fits
        engine
            .schedule_withdrawal(&user("bb"), "0xbeef", "0.1", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn rejected_transfer_drops_pending_and_continues() {
        let mut raw = MockTokenNode::new();
        raw.reject_transfers = true;
        let engine = engine(Arc::new(raw)).await;

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &crate::models::PendingPayout {
                    user: user("aa"),
                    amount: dec!(500000),
                    address: "0xdead".to_string(),
                    tag: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        engine
            .process_pending(&mut processed, &mut rejected, &CancellationToken::new())
            .await
            .unwrap();
        assert!(processed.is_empty());
        assert_eq!(rejected.drain().len(), 1);
        assert!(engine.store.pending_for(&user("aa")).await.unwrap().is_none());
        assert!(!engine.latch.is_set());
    }
}
