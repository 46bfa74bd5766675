//! Tag-based engine for ledgers with destination tags.
//!
//! Every user gets the shared root address plus a monotonically allocated
//! integer tag. Polling walks the root's transaction history newest-first
//! and stops at the processed-ledger watermark; payouts are signed
//! server-side by the configured secret.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::{ChainAdapter, CoinParams, EventSink, Latch};
use crate::chain::TaggedNode;
use crate::error::{ProxyError, ProxyResult};
use crate::models::{DepositRecord, Distinction, HandleRow, UserId, WithdrawalRecord};
use crate::store::CoinStore;

pub struct TaggedEngine {
    params: CoinParams,
    store: CoinStore,
    latch: Latch,
    node: Arc<dyn TaggedNode>,
}

impl TaggedEngine {
    pub fn new(params: CoinParams, store: CoinStore, node: Arc<dyn TaggedNode>) -> Self {
        TaggedEngine {
            params,
            store,
            latch: Latch::new(),
            node,
        }
    }
}

#[async_trait]
impl ChainAdapter for TaggedEngine {
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
        Distinction::Tag
    }

    fn root_address(&self) -> Option<String> {
        Some(self.node.root_address().to_string())
    }

    async fn init(&self) -> ProxyResult<()> {
        self.node.root_balance().await?;
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
        _amount: Option<&str>,
    ) -> ProxyResult<serde_json::Value> {
        self.latch.check()?;
        if let Some(existing) = self.store.lookup_handle(user).await? {
            return Ok(self.handle_payload(&existing));
        }
        // tag allocation and insert share one transaction
        let mut tx = self.store.begin().await?;
        let tag = self.store.top_tag_tx(&mut tx).await?.unwrap_or(0) + 1;
        let handle = HandleRow::tag(user.clone(), tag);
        self.store.insert_handle(&mut tx, &handle).await?;
        tx.commit().await?;
        info!(coin = %self.params.coin, user = %user, tag, "allocated destination tag");
        Ok(self.handle_payload(&handle))
    }

    async fn poll_deposits(&self, processed: &mut EventSink) -> ProxyResult<()> {
        let watermark = self.store.watermark().await?;
        let root = self.node.root_address().to_string();

        let mut marker = None;
        let mut credits: Vec<DepositRecord> = Vec::new();
        let mut top_validated: Option<u64> = None;

        'pages: loop {
            let page = self.node.account_tx(marker.take()).await?;
            for tx in &page.txs {
                if !tx.validated {
                    continue;
                }
                top_validated = Some(top_validated.map_or(tx.ledger_index, |t: u64| {
                    t.max(tx.ledger_index)
                }));
                if watermark.is_some_and(|w| tx.ledger_index as i64 <= w) {
                    // at or below the reconciled frontier
                    break 'pages;
                }
                if !tx.success || tx.destination != root || !tx.credits_account {
                    continue;
                }
                let Some(tag) = tx.tag else {
                    continue;
                };
                let Some(handle) = self.store.lookup_by_tag(tag).await? else {
                    continue;
                };
                let Some(amount) = tx.delivered else {
                    continue;
                };
                if amount < self.params.minimum_units {
                    continue;
                }
                if self.store.transaction_exists(&tx.hash).await? {
                    continue;
                }
                credits.push(DepositRecord {
                    entry_id: 0,
                    user: handle.user,
                    amount,
                    tx_hash: tx.hash.clone(),
                    vout: None,
                    block_hash: None,
                    block_height: tx.ledger_index as i64,
                    block_time: tx.time,
                });
            }
            match page.marker {
                Some(next) => marker = Some(next),
                None => break,
            }
        }

        let balance = self.node.root_balance().await?;

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
                .record_processed_block(&mut tx, credit.block_height, None)
                .await?;
        }
        if let Some(top) = top_validated {
            self.store
                .record_processed_block(&mut tx, top as i64, None)
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
                    "ledgerIndex": credit.block_height,
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

            let value = payout.amount - self.params.static_fee_units;
            if value <= Decimal::ZERO {
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

            // non-success replies latch; the pending row stays for the next
            // pass after the operator clears the latch
            let tx_hash = self
                .node
                .submit_payment(&payout.address, value, payout.tag)
                .await?;

            let already_recorded = self.store.withdrawal_exists(&tx_hash).await?;
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
                    "tag": payout.tag,
                }),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{TaggedPage, TaggedTx};
    use crate::config::CoinKind;
    use crate::models::PendingPayout;
    use crate::store::Store;
    use crate::units::Rounding;
    use rust_decimal_macros::dec;
    use serde_json::Value;
    use tokio::sync::Mutex;

    struct MockTaggedNode {
        /// Pages returned in order; the marker chains them together.
        pages: Mutex<Vec<Vec<TaggedTx>>>,
        balance: Decimal,
        fail_submit: bool,
        submissions: Mutex<Vec<(String, Decimal, Option<u64>)>>,
    }

    impl MockTaggedNode {
        fn new(pages: Vec<Vec<TaggedTx>>) -> Self {
            MockTaggedNode {
                pages: Mutex::new(pages),
                balance: dec!(500000000),
                fail_submit: false,
                submissions: Mutex::new(Vec::new()),
            }
        }
    }

    fn payment(hash: &str, tag: Option<u64>, drops: Decimal, ledger: u64) -> TaggedTx {
        TaggedTx {
            hash: hash.to_string(),
            destination: "rRoot".to_string(),
            tag,
            delivered: Some(drops),
            ledger_index: ledger,
            validated: true,
            success: true,
            credits_account: true,
            time: 1_700_000_000,
        }
    }

    #[async_trait]
    impl TaggedNode for MockTaggedNode {
        fn root_address(&self) -> &str {
            "rRoot"
        }

        fn is_address(&self, candidate: &str) -> bool {
            candidate.starts_with('r') && candidate.len() >= 25
        }

        async fn account_tx(&self, marker: Option<Value>) -> ProxyResult<TaggedPage> {
            let pages = self.pages.lock().await;
            let index = marker.and_then(|m| m.as_u64()).unwrap_or(0) as usize;
            let txs = pages.get(index).cloned().unwrap_or_default();
            let marker = if index + 1 < pages.len() {
                Some(json!(index as u64 + 1))
            } else {
                None
            };
            Ok(TaggedPage { txs, marker })
        }

        async fn root_balance(&self) -> ProxyResult<Decimal> {
            Ok(self.balance)
        }

        async fn submit_payment(
            &self,
            to: &str,
            value: Decimal,
            tag: Option<u64>,
        ) -> ProxyResult<String> {
            if self.fail_submit {
                return Err(ProxyError::ChainRpc("payment submission returned tecPATH_DRY".into()));
            }
            self.submissions
                .lock()
                .await
                .push((to.to_string(), value, tag));
            Ok(format!("pay-{to}-{value}"))
        }
    }

    fn params() -> CoinParams {
        CoinParams {
            coin: "xrp".to_string(),
            kind: CoinKind::Ripple,
            decimals: 6,
            minimum_units: dec!(1000),
            static_fee_units: dec!(10),
            confirmations: 1,
            rounding: Rounding::Truncate,
        }
    }

    async fn engine(node: Arc<MockTaggedNode>) -> TaggedEngine {
        let store = Store::in_memory().await.unwrap();
        let coin = store.coin("xrp").unwrap();
        coin.migrate(Distinction::Tag).await.unwrap();
        TaggedEngine::new(params(), coin, node)
    }

    fn user(id: &str) -> UserId {
        UserId::parse(id).unwrap()
    }

    #[tokio::test]
    async fn tags_allocate_monotonically() {
        let engine = engine(Arc::new(MockTaggedNode::new(vec![]))).await;
        let first = engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();
        assert_eq!(first["address"], "rRoot");
        assert_eq!(first["tag"], 1);

        let second = engine
            .resolve_deposit_handle(&user("bb"), None)
            .await
            .unwrap();
        assert_eq!(second["tag"], 2);

        // stable per user
        let again = engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();
        assert_eq!(again["tag"], 1);
    }

    #[tokio::test]
    async fn tagged_payment_credits_the_mapped_user() {
        let node = Arc::new(MockTaggedNode::new(vec![vec![
            payment("h1", Some(1), dec!(10000000), 900),
            payment("h2", Some(99), dec!(5000000), 899), // unknown tag
            payment("h3", None, dec!(5000000), 898),     // no tag
        ]]));
        let engine = engine(node).await;
        engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        assert_eq!(sink.drain().len(), 1);
        let info = engine.account_info(&user("aa")).await.unwrap();
        assert_eq!(info["deposit"], "10.000000");
        assert_eq!(engine.store.watermark().await.unwrap(), Some(900));
        assert_eq!(
            engine.store.backend_balance().await.unwrap(),
            dec!(500000000)
        );
    }

    #[tokio::test]
    async fn paging_stops_at_the_watermark() {
        let node = Arc::new(MockTaggedNode::new(vec![
            vec![payment("h5", Some(1), dec!(3000000), 905)],
            vec![payment("h4", Some(1), dec!(2000000), 890)], // below watermark
        ]));
        let engine = engine(node).await;
        engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .record_processed_block(&mut tx, 900, None)
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();

        // only the record above the watermark was credited
        assert_eq!(sink.drain().len(), 1);
        let info = engine.account_info(&user("aa")).await.unwrap();
        assert_eq!(info["deposit"], "3.000000");
    }

    #[tokio::test]
    async fn replayed_history_is_not_recredited() {
        let pages = vec![vec![payment("h1", Some(1), dec!(10000000), 900)]];
        let node = Arc::new(MockTaggedNode::new(pages));
        let engine = engine(node.clone()).await;
        engine
            .resolve_deposit_handle(&user("aa"), None)
            .await
            .unwrap();

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert_eq!(sink.drain().len(), 1);

        let mut sink = EventSink::new();
        engine.poll_deposits(&mut sink).await.unwrap();
        assert!(sink.is_empty());
        assert_eq!(
            engine.account_info(&user("aa")).await.unwrap()["deposit"],
            "10.000000"
        );
    }

    #[tokio::test]
    async fn payout_carries_the_destination_tag() {
        let node = Arc::new(MockTaggedNode::new(vec![]));
        let engine = engine(node.clone()).await;

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &PendingPayout {
                    user: user("aa"),
                    amount: dec!(2000000),
                    address: "rDestinationAccount0000000".to_string(),
                    tag: Some(42),
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
        let submissions = node.submissions.lock().await;
        assert_eq!(submissions[0].1, dec!(2000000) - dec!(10));
        assert_eq!(submissions[0].2, Some(42));
        assert_eq!(
            engine.store.account_totals(&user("aa")).await.unwrap().withdrawn,
            dec!(2000000)
        );
    }

    #[tokio::test]
    async fn stats_expose_the_pending_payout() {
        let engine = engine(Arc::new(MockTaggedNode::new(vec![]))).await;
        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &PendingPayout {
                    user: user("aa"),
                    amount: dec!(2000000),
                    address: "rDestinationAccount0000000".to_string(),
                    tag: Some(9),
                },
            )
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let info = engine.account_info(&user("aa")).await.unwrap();
        assert_eq!(info["pending"]["amount"], "2.000000");
        assert_eq!(info["pending"]["tag"], 9);
        assert_eq!(info["deposit"], "0.000000");
    }

    #[tokio::test]
    async fn failed_submission_latches_and_keeps_pending() {
        let mut raw = MockTaggedNode::new(vec![]);
        raw.fail_submit = true;
        let engine = engine(Arc::new(raw)).await;

        let mut tx = engine.store.begin().await.unwrap();
        engine
            .store
            .insert_pending(
                &mut tx,
                &PendingPayout {
                    user: user("aa"),
                    amount: dec!(2000000),
                    address: "rDestinationAccount0000000".to_string(),
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
        assert!(engine.store.pending_for(&user("aa")).await.unwrap().is_some());
        assert!(rejected.is_empty());
    }
}
