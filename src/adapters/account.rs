//! Address-based engine for account-model chains.
//!
//! Every user gets a fresh HD-derived deposit address. Deposits are swept to
//! the root account once the address balance is identical at pending, latest
//! and confirmed depths; payouts are signed from the root after a nonce race
//! check.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::adapters::{ChainAdapter, CoinParams, EventSink, Latch};
use crate::chain::{AccountNode, Depth, NonceKind};
use crate::error::{ErrorKind, ProxyError, ProxyResult};
use crate::models::{DepositRecord, Distinction, HandleRow, UserId, WithdrawalRecord};
use crate::store::CoinStore;

pub struct AccountEngine {
    params: CoinParams,
    store: CoinStore,
    latch: Latch,
    node: Arc<dyn AccountNode>,
    gas_units: Decimal,
}

impl AccountEngine {
    pub fn new(
        params: CoinParams,
        store: CoinStore,
        node: Arc<dyn AccountNode>,
        gas_units: u64,
    ) -> Self {
        AccountEngine {
            params,
            store,
            latch: Latch::new(),
            node,
            gas_units: Decimal::from(gas_units),
        }
    }

    fn check_derivation(&self, handle: &HandleRow) -> ProxyResult<(u32, String)> {
        let index = handle.derivation_index.ok_or_else(|| {
            ProxyError::Invariant(format!("handle for {} has no derivation index", handle.user))
        })?;
        let stored = handle.address.clone().ok_or_else(|| {
            ProxyError::Invariant(format!("handle for {} has no address", handle.user))
        })?;
        let derived = self.node.address_at(index)?;
        if derived != stored {
            return Err(ProxyError::Invariant(format!(
                "derived address mismatch at index {index}: stored {stored}, derived {derived}"
            )));
        }
        Ok((index, stored))
    }
}

#[async_trait]
impl ChainAdapter for AccountEngine {
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
        Distinction::Address
    }

    fn root_address(&self) -> Option<String> {
        Some(self.node.root_address().to_string())
    }

    async fn init(&self) -> ProxyResult<()> {
        // connectivity probe, then re-verify every stored derivation
        self.node.gas_price().await?;
        for handle in self.store.all_handles().await? {
            self.check_derivation(&handle)?;
        }
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
        // index allocation and insert share one transaction
        let mut tx = self.store.begin().await?;
        let index = self
            .store
            .top_derivation_index_tx(&mut tx)
            .await?
            .unwrap_or(0)
            + 1;
        let address = self.node.address_at(index)?;
        let handle = HandleRow::address(user.clone(), Some(index), address);
        self.store.insert_handle(&mut tx, &handle).await?;
        tx.commit().await?;
        info!(coin = %self.params.coin, user = %user, index, "assigned deposit address");
        Ok(self.handle_payload(&handle))
    }

    async fn poll_deposits(&self, processed: &mut EventSink) -> ProxyResult<()> {
        for handle in self.store.all_handles().await? {
            let (index, address) = self.check_derivation(&handle)?;

            let pending = self.node.balance(&address, Depth::Pending).await?;
            let latest = self.node.balance(&address, Depth::Latest).await?;
            let confirmed = self
                .node
                .balance(&address, Depth::Confirmed(self.params.confirmations))
                .await?;
            // only sweep settled balances
            if pending != latest || latest != confirmed || latest < self.params.minimum_units {
                continue;
            }

            let gas_price = self.node.gas_price().await?;
            let value = latest - self.gas_units * gas_price;
            if value <= Decimal::ZERO {
                continue;
            }

            let outcome = self.node.sweep(index, value, gas_price).await?;
            if self.store.transaction_exists(&outcome.tx_hash).await? {
                continue;
            }

            let record = DepositRecord {
                entry_id: 0,
                user: handle.user.clone(),
                amount: value,
                tx_hash: outcome.tx_hash.clone(),
                vout: None,
                block_hash: outcome.block_hash.clone(),
                block_height: outcome.block_height as i64,
                block_time: outcome.block_time,
            };
            let mut tx = self.store.begin().await?;
            self.store
                .update_account_totals(&mut tx, &handle.user, value, Decimal::ZERO)
                .await?;
            self.store
                .update_global_totals(&mut tx, value, Decimal::ZERO)
                .await?;
            self.store.insert_transaction(&mut tx, &record).await?;
            tx.commit().await?;

            processed.push(
                &self.params.coin,
                &handle.user,
                json!({
                    "amount": self.params.display(value),
                    "txHash": outcome.tx_hash,
                    "blockHeight": outcome.block_height,
                }),
            );
            info!(coin = %self.params.coin, user = %handle.user, tx = %record.tx_hash, "swept deposit");
        }
        Ok(())
    }

    async fn process_pending(
        &self,
        processed: &mut EventSink,
        rejected: &mut EventSink,
        shutdown: &CancellationToken,
    ) -> ProxyResult<()> {
        // another writer may be racing the root account
        let pending_nonce = self.node.nonce(NonceKind::Pending).await?;
        let latest_nonce = self.node.nonce(NonceKind::Latest).await?;
        if pending_nonce != latest_nonce {
            debug!(coin = %self.params.coin, "root nonce in flight, deferring payouts");
            return Ok(());
        }

        let root = self.node.root_address().to_string();
        let root_balance = self.node.balance(&root, Depth::Latest).await?;

        for payout in self.store.all_pending().await? {
            if shutdown.is_cancelled() {
                break;
            }
            if payout.amount >= root_balance {
                return Err(ProxyError::Invariant(format!(
                    "pending payout for {} exceeds root balance",
                    payout.user
                )));
            }

            let gas_price = self.node.gas_price().await?;
            let transfer =
                payout.amount - self.gas_units * gas_price - self.params.static_fee_units;
            if transfer <= Decimal::ZERO {
                let mut tx = self.store.begin().await?;
                self.store.delete_pending(&mut tx, &payout.user).await?;
                tx.commit().await?;
                rejected.push(
                    &self.params.coin,
                    &payout.user,
                    json!({
                        "amount": self.params.display(payout.amount),
                        "address": payout.address,
                        "reason": "amount does not cover gas and fee",
                    }),
                );
                continue;
            }

            match self.node.pay(&payout.address, transfer, gas_price).await {
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
