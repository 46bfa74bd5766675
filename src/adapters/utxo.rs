//! UTXO engine.
//!
//! Deposit handles are wallet-issued addresses under a configured label.
//! Polling pages the daemon's transaction listing newest-batch-first and
//! walks each page in reverse, stopping at the processed-block watermark;
//! all credits land in one outer atomic unit together with the watermark and
//! the backend-balance snapshot.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{ChainAdapter, CoinParams, EventSink, Latch};
use crate::chain::UtxoNode;
use crate::error::{ProxyError, ProxyResult};
use crate::models::{DepositRecord, Distinction, HandleRow, UserId, WithdrawalRecord};
use crate::store::CoinStore;
use crate::units::{scale_to_units, units_to_coins};

/// Daemon listing page size.
const PAGE: u32 = 10;
/// Seconds the wallet stays unlocked for a payout pass.
const UNLOCK_TIMEOUT_SECS: u64 = 30;

pub struct UtxoEngine {
    params: CoinParams,
    store: CoinStore,
    latch: Latch,
    node: Arc<dyn UtxoNode>,
    label: String,
    unlock_password: Option<String>,
}

impl UtxoEngine {
    pub fn new(
        params: CoinParams,
        store: CoinStore,
        node: Arc<dyn UtxoNode>,
        label: String,
        unlock_password: Option<String>,
    ) -> Self {
        UtxoEngine {
            params,
            store,
            latch: Latch::new(),
            node,
            label,
            unlock_password,
        }
    }
}

#[async_trait]
impl ChainAdapter for UtxoEngine {
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
        Distinction::UtxoAddress
    }

    async fn init(&self) -> ProxyResult<()> {
        self.node.wallet_balance().await?;
        Ok(())
    }

    fn validate_destination(&self, address: &str, _tag: Option<u64>) -> ProxyResult<()> {
        // format sanity only; the daemon has the last word during the payout
        // pass
        let plausible = (26..=90).contains(&address.len())
            && address.chars().all(|c| c.is_ascii_alphanumeric());
        if !plausible {
            return Err(ProxyError::InvalidAddress(address.to_string()));
        }
        Ok(())
    }

    async fn resolve_deposit_handle(
        &self,
        user: &UserId,
        _amount: Option<&str>,
    ) -> ProxyResult<serde_json::Value> {
        self.latch.check()?;
        if let Some(existing) = self.store.lookup_handle(user).await? {
            return Ok(self.handle_payload(&existing));
        }
        let address = self.node.new_address(&self.label).await?;
        let handle = HandleRow::address(user.clone(), None, address);
        let mut tx = self.store.begin().await?;
        self.store.insert_handle(&mut tx, &handle).await?;
        tx.commit().await?;
        info!(coin = %self.params.coin, user = %user, "assigned wallet deposit address");
        Ok(self.handle_payload(&handle))
    }

    async fn poll_deposits(&self, processed: &mut EventSink) -> ProxyResult<()> {
        let mut skip = 0u32;
        let mut header_cache: HashMap<String, u64> = HashMap::new();
        let mut credits: Vec<DepositRecord> = Vec::new();

        'pages: loop {
            let page = self
                .node
                .list_transactions(&self.label, PAGE, skip)
                .await?;
            if page.is_empty() {
                break;
            }
            let page_len = page.len();

            // newest confirmed records first
            for record in page.iter().rev() {
                if record.category != "receive" {
                    continue;
                }
                let amount = scale_to_units(record.amount, self.params.decimals);
                if amount < self.params.minimum_units {
                    continue;
                }
                if record.confirmations < self.params.confirmations as i64 {
                    continue;
                }
                let Some(handle) = self.store.lookup_by_address(&record.address).await? else {
                    continue;
                };
                if self.store.transaction_exists(&record.txid).await? {
                    continue;
                }

                let height = match record.block_height {
                    Some(height) => height,
                    None => {
                        let hash = record.block_hash.as_deref().ok_or_else(|| {
                            ProxyError::MalformedResponse(format!(
                                "confirmed transaction {} carries no block hash",
                                record.txid
                            ))
                        })?;
                        match header_cache.get(hash) {
                            Some(height) => *height,
                            None => {
                                let height = self.node.block_height(hash).await?;
                                header_cache.insert(hash.to_string(), height);
                                height
                            }
                        }
                    }
                };

                let already_done = match record.block_hash.as_deref() {
                    Some(hash) => self.store.block_processed_hash(hash).await?,
                    None => self.store.block_processed_height(height as i64).await?,
                };
                if already_done {
                    // everything older is accounted for
                    break 'pages;
                }

                credits.push(DepositRecord {
                    entry_id: 0,
                    user: handle.user,
                    amount,
                    tx_hash: record.txid.clone(),
                    vout: record.vout,
                    block_hash: record.block_hash.clone(),
                    block_height: height as i64,
                    block_time: record.block_time.unwrap_or(0),
                });
            }

            if page_len < PAGE as usize {
                break;
            }
            skip += PAGE;
        }

        let balance = scale_to_units(self.node.wallet_balance().await?, self.params.decimals);

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
                .record_processed_block(&mut tx, credit.block_height, credit.block_hash.as_deref())
                .await?;
        }
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
        if self.store.all_pending().await?.is_empty() {
            return Ok(());
        }
        if let Some(passphrase) = &self.unlock_password {
            self.node
                .unlock_wallet(passphrase, UNLOCK_TIMEOUT_SECS)
                .await?;
        }

        for payout in self.store.all_pending().await? {
            if shutdown.is_cancelled() {
                break;
            }

            if !self.node.validate_address(&payout.address).await? {
                let mut tx = self.store.begin().await?;
                self.store.delete_pending(&mut tx, &payout.user).await?;
                tx.commit().await?;
                rejected.push(
                    &self.params.coin,
                    &payout.user,
                    json!({
                        "amount": self.params.display(payout.amount),
                        "address": payout.address,
                        "reason": "destination address rejected by wallet",
                    }),
                );
                continue;
            }

            let send_units = payout.amount - self.params.static_fee_units;
            if send_units <= Decimal::ZERO {
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

            // submission RPC errors latch; only address validation rejects
            let txid = self
                .node
                .send_to_address(
                    &payout.address,
                    units_to_coins(send_units, self.params.decimals),
                )
                .await?;

            let already_recorded = self.store.withdrawal_exists(&txid).await?;
            let mut tx = self.store.begin().await?;
            if !already_recorded {
                self.store
                    .update_account_totals(&mut tx, &payout.user, Decimal::ZERO, payout.amount)
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
                            tx_hash: txid.clone(),
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
                    "txHash": txid,
                    "address": payout.address,
                }),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::WalletTx;
    use crate::config::CoinKind;
    use crate::models::PendingPayout;
    use crate::store::Store;
    use crate::units::Rounding;
    use rust_decimal_macros::dec;
    use tokio::sync::Mutex;

    struct MockUtxoNode {
        listing: Mutex<Vec<WalletTx>>,
        balance: Decimal,
        valid_addresses: Vec<String>,
        unlocks: Mutex<u32>,
        sends: Mutex<Vec<(String, Decimal)>>,
        fail_send: bool,
    }

    impl MockUtxoNode {
        fn new() -> Self {
            MockUtxoNode {
                listing: Mutex::new(Vec::new()),
                balance: dec!(1.0),
                valid_addresses: vec!["validdestinationaddress0000".to_string()],
                unlocks: Mutex::new(0),
                sends: Mutex::new(Vec::new()),
                fail_send: false,
            }
        }
    }

    fn receive(txid: &str, address: &str, amount: Decimal, confirmations: i64) -> WalletTx {
        WalletTx {
            category: "receive".to_string(),
            address: address.to_string(),
            amount,
            confirmations,
            txid: txid.to_string(),
            vout: Some(0),
            block_hash: Some(format!("block-{txid}")),
            block_height: None,
            block_time: Some(1_700_000_000),
        }
    }

    #[async_trait]
    impl UtxoNode for MockUtxoNode {
        async fn new_address(&self, _label: &str) -> ProxyResult<String> {
            Ok("depositaddressforuseraa0000".to_string())
        }

        async fn list_transactions(
            &self,
            _label: &str,
            count: u32,
            skip: u32,
        ) -> ProxyResult<Vec<WalletTx>> {
            let listing = self.listing.lock().await;
            Ok(listing
                .iter()
                .skip(skip as usize)
                .take(count as usize)
                .cloned()
                .collect())
        }

        async fn block_height(&self, block_hash: &str) -> ProxyResult<u64> {
            // deterministic: "block-tN" maps to height 100+N
            let n: u64 = block_hash
                .rsplit('t')
                .next()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            Ok(100 + n)
        }

        async fn wallet_balance(&self) -> ProxyResult<Decimal> {
            Ok(self.balance)
        }

        async fn validate_address(&self, address: &str) -> ProxyResult<bool> {
            Ok(self.valid_addresses.iter().any(|a| a == address))
        }

        async fn send_to_address(&self, address: &str, amount: Decimal) -> ProxyResult<String> {
            if self.fail_send {
                return Err(ProxyError::ChainRpc("wallet refused".into()));
            }
            self.sends.lock().await.push((address.to_string(), amount));
            Ok(format!("wd-{address}-{amount}"))
        }

        async fn unlock_wallet(&self, _passphrase: &str, _timeout_secs: u64) -> ProxyResult<()> {
            *self.unlocks.lock().await += 1;
            Ok(())
        }
    }

    fn params() -> CoinParams {
        CoinParams {
            coin: "btc".to_string(),
            kind: CoinKind::Satoshi,
            decimals: 8,
            minimum_units: dec!(1000), // 0.00001
            static_fee_units: dec!(500),
            confirmations: 3,
            rounding: Rounding::Truncate,
        }
    }

    async fn engine(node: Arc<MockUtxoNode>, unlock: Option<String>) -> UtxoEngine {
        let store = Store::in_memory().await.unwrap();
        let coin = store.coin("btc").unwrap();
        coin.migrate(Distinction::UtxoAddress).await.unwrap();
        UtxoEngine::new(params(), coin, node, "proxy".to_string(), unlock)
    }

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn confirmed_deposit_is_credited_once() {
        let node = Arc::new(MockUtxoNode::new());
        let engine = engine(node.clone(), None).await;
        let payload = engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();
        let address = payload["address"].as_str().unwrap().to_string();

        node.listing
            .lock()
            .await
            .push(receive("t1", &address, dec!(0.00005), 5));

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        let info = engine.account_info(&user("aa")).await.unwrap();
        assert_eq!(info["deposit"], "0.00005000");
        assert_eq!(info["withdrawal"], "0.00000000");
        assert_eq!(sink.drain().len(), 1);

        // snapshot and watermark recorded in the same pass
        assert_eq!(
            engine.store.backend_balance().await.unwrap(),
            dec!(100000000)
        );
        assert!(engine.store.block_processed_hash("block-t1").await.unwrap());

        // replay: watermark stops the pager, nothing is re-credited
        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(
            engine.account_info(&user("aa")).await.unwrap()["deposit"],
            "0.00005000"
        );
    }

    #[tokio::test]
    async fn unconfirmed_small_and_foreign_records_are_skipped() {
        let node = Arc::new(MockUtxoNode::new());
        let engine = engine(node.clone(), None).await;
        let payload = engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();
        let address = payload["address"].as_str().unwrap().to_string();

        {
            let mut listing = node.listing.lock().await;
            listing.push(receive("t1", &address, dec!(0.00005), 1)); // too shallow
            listing.push(receive("t2", &address, dec!(0.000001), 9)); // below minimum
            listing.push(receive("t3", "someoneelse", dec!(0.5), 9)); // unknown address
            let mut send = receive("t4", &address, dec!(0.5), 9);
            send.category = "send".to_string();
            listing.push(send);
        }

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(
            engine.store.account_totals(&user("aa")).await.unwrap().deposited,
            Decimal::ZERO
        );
    }

    #[tokio::test]
    async fn invalid_destination_rejects_without_latch() {
        let node = Arc::new(MockUtxoNode::new());
        let engine = engine(node.clone(), Some("hunter2".to_string())).await;

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &PendingPayout {
                    user: user("aa"),
                    amount: dec!(100000),
                    address: "notintheacceptlist00000000".to_string(),
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
        assert_eq!(*node.unlocks.lock().await, 1);
        assert!(!engine.latch.is_set());
    }

    #[tokio::test]
    async fn successful_payout_deducts_fee_on_the_wire() {
        let node = Arc::new(MockUtxoNode::new());
        let engine = engine(node.clone(), None).await;

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &PendingPayout {
                    user: user("aa"),
                    amount: dec!(100000),
                    address: "validdestinationaddress0000".to_string(),
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

        assert_eq!(processed.drain().len(), 1);
        assert!(rejected.is_empty());
        // 100000 sat pending, 500 sat fee: 0.00099500 on the wire
        let sends = node.sends.lock().await;
        assert_eq!(sends[0].1, dec!(0.00099500));
        // the ledger debits the full pending amount
        let totals = engine.store.account_totals(&user("aa")).await.unwrap();
        assert_eq!(totals.withdrawn, dec!(100000));
    }

    #[tokio::test]
    async fn full_tick_lands_one_event_in_the_outbox() {
        use crate::adapters::AdapterRegistry;
        use crate::reconciler::Reconciler;
        use crate::rpc::Dispatcher;
        use crate::store::Store;
        use serde_json::json;
        use std::time::Duration;

        let store = Store::in_memory().await.unwrap();
        let outbox = store.outbox();
        outbox.migrate().await.unwrap();
        let coin = store.coin("btc").unwrap();
        coin.migrate(Distinction::UtxoAddress).await.unwrap();

        let node = Arc::new(MockUtxoNode::new());
        let engine = UtxoEngine::new(params(), coin, node.clone(), "proxy".to_string(), None);
        let payload = engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();
        let address = payload["address"].as_str().unwrap().to_string();
        node.listing
            .lock()
            .await
            .push(receive("t1", &address, dec!(0.00005), 5));

        let mut registry = AdapterRegistry::new();
        registry.register("btc", Arc::new(engine));
        let registry = Arc::new(registry);

        let reconciler = Reconciler::new(
            registry.clone(),
            outbox.clone(),
            Duration::from_secs(10),
            CancellationToken::new(),
        );
        reconciler.tick_once().await.unwrap();

        let dispatcher = Dispatcher::new(registry.clone(), outbox);
        let stats = dispatcher
            .dispatch("getStats", &json!({"coin": "btc", "user": "aa"}))
            .await
            .unwrap();
        assert_eq!(stats["deposit"], "0.00005000");
        assert_eq!(stats["withdrawal"], "0.00000000");

        let events = dispatcher
            .dispatch(
                "listProcessedDeposits",
                &json!({"coin": "btc", "user": "aa"}),
            )
            .await
            .unwrap();
        assert_eq!(events.as_array().unwrap().len(), 1);
        assert_eq!(events[0]["amount"], "0.00005000");

        let emptied = dispatcher
            .dispatch(
                "listProcessedDeposits",
                &json!({"coin": "btc", "user": "aa"}),
            )
            .await
            .unwrap();
        assert_eq!(emptied, json!([]));

        // a tick with no new chain activity changes nothing
        reconciler.tick_once().await.unwrap();
        let still_empty = dispatcher
            .dispatch(
                "listProcessedDeposits",
                &json!({"coin": "btc", "user": "aa"}),
            )
            .await
            .unwrap();
        assert_eq!(still_empty, json!([]));
    }

    #[tokio::test]
    async fn send_failure_latches() {
        let mut raw = MockUtxoNode::new();
        raw.fail_send = true;
        raw.valid_addresses = vec!["validdestinationaddress0000".to_string()];
        let node = Arc::new(raw);
        let engine = engine(node, None).await;

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &PendingPayout {
                    user: user("aa"),
                    amount: dec!(100000),
                    address: "validdestinationaddress0000".to_string(),
                    tag: None,
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut processed = EventSink::new();
        let mut rejected = EventSink::new();
        let err = engine
            .process_pending(&mut processed, &mut rejected, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(err.is_latching());
        // the pending row survives for the operator
        assert!(engine.store.pending_for(&user("aa")).await.unwrap().is_some());
    }
}
