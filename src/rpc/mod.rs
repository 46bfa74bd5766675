//! Request dispatcher: the single caller-facing entry point.
//!
//! Validates identifiers, resolves the coin adapter, routes each method to
//! the matching adapter operation and marshals results as JSON values. The
//! transport (JSON-RPC 2.0 over HTTP, see [`server`]) stays a thin shell
//! around [`Dispatcher::dispatch`].

pub mod server;

use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::adapters::{AdapterRegistry, ChainAdapter};
use crate::error::{ProxyError, ProxyResult};
use crate::models::UserId;
use crate::store::outbox::{Outbox, OutboxKind};

pub struct Dispatcher {
    registry: Arc<AdapterRegistry>,
    outbox: Outbox,
}

impl Dispatcher {
    pub fn new(registry: Arc<AdapterRegistry>, outbox: Outbox) -> Self {
        Dispatcher { registry, outbox }
    }

    pub async fn dispatch(&self, method: &str, params: &Value) -> ProxyResult<Value> {
        let result = self.route(method, params).await;
        // a latching failure on the API path disables the adapter exactly
        // like one on the reconciler path
        if let Err(e) = &result {
            if e.is_latching() {
                if let Some(coin) = params.get("coin").and_then(Value::as_str) {
                    if let Some(adapter) = self.registry.get(coin) {
                        adapter.latch().set(coin, e);
                    }
                }
            }
        }
        result
    }

    async fn route(&self, method: &str, params: &Value) -> ProxyResult<Value> {
        match method {
            "getProxyInfo" => {
                let (_, adapter) = self.adapter(params)?;
                adapter.proxy_info().await
            }
            "getStats" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                adapter.account_info(&user).await
            }
            "getAllCoinStats" => {
                let user = self.user(params)?;
                let mut stats = Map::new();
                for (name, adapter) in self.registry.iter() {
                    stats.insert(name.to_string(), adapter.account_info(&user).await?);
                }
                Ok(Value::Object(stats))
            }
            "setDeposit" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                let amount = params.get("amount").and_then(Value::as_str);
                adapter.resolve_deposit_handle(&user, amount).await
            }
            "getDeposit" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                Ok(Value::Array(adapter.list_awaiting_deposits(&user).await?))
            }
            "deleteDeposit" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                Ok(json!(adapter.cancel_awaiting_deposits(&user).await?))
            }
            "setPending" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                let address = required_str(params, "address")?;
                let amount = required_str(params, "amount")?;
                let tag = optional_tag(params)?;
                adapter.schedule_withdrawal(&user, address, amount, tag).await
            }
            "getPending" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                Ok(adapter.lookup_pending(&user).await?.unwrap_or(Value::Null))
            }
            "listDeposits" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                let skip = optional_skip(params)?;
                Ok(Value::Array(adapter.list_deposit_log(&user, skip).await?))
            }
            "listWithdrawals" => {
                let (_, adapter) = self.adapter(params)?;
                let user = self.user(params)?;
                let skip = optional_skip(params)?;
                Ok(Value::Array(adapter.list_withdrawal_log(&user, skip).await?))
            }
            "listProcessedDeposits" => {
                self.drain(params, OutboxKind::ProcessedDeposits).await
            }
            "listProcessedWithdrawals" => {
                self.drain(params, OutboxKind::ProcessedWithdrawals).await
            }
            "listRejectedWithdrawals" => {
                self.drain(params, OutboxKind::RejectedWithdrawals).await
            }
            "listAllProcessedDeposits" => {
                self.drain_all(params, OutboxKind::ProcessedDeposits).await
            }
            "listAllProcessedWithdrawals" => {
                self.drain_all(params, OutboxKind::ProcessedWithdrawals).await
            }
            "listAllRejectedWithdrawals" => {
                self.drain_all(params, OutboxKind::RejectedWithdrawals).await
            }
            "clearLatch" => {
                let (_, adapter) = self.adapter(params)?;
                Ok(json!(adapter.latch().clear()))
            }
            other => Err(ProxyError::MethodNotFound(other.to_string())),
        }
    }

    fn adapter(&self, params: &Value) -> ProxyResult<(String, Arc<dyn ChainAdapter>)> {
        let coin = required_str(params, "coin")?;
        let adapter = self
            .registry
            .get(coin)
            .ok_or_else(|| ProxyError::UnknownCoin(coin.to_string()))?;
        Ok((coin.to_string(), adapter))
    }

    fn user(&self, params: &Value) -> ProxyResult<UserId> {
        UserId::parse(required_str(params, "user")?)
    }

    async fn drain(&self, params: &Value, kind: OutboxKind) -> ProxyResult<Value> {
        let (coin, _) = self.adapter(params)?;
        let user = self.user(params)?;
        Ok(Value::Array(self.outbox.drain(kind, &coin, &user).await?))
    }

    async fn drain_all(&self, params: &Value, kind: OutboxKind) -> ProxyResult<Value> {
        let (coin, _) = self.adapter(params)?;
        Ok(Value::Array(self.outbox.drain_all(kind, &coin).await?))
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> ProxyResult<&'a str> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| ProxyError::InvalidRequest(format!("missing parameter: {key}")))
}

fn optional_tag(params: &Value) -> ProxyResult<Option<u64>> {
    match params.get("tag") {
        None | Some(Value::Null) => Ok(None),
        Some(value) => value
            .as_u64()
            .map(Some)
            .ok_or_else(|| ProxyError::InvalidTag(value.to_string())),
    }
}

fn optional_skip(params: &Value) -> ProxyResult<i64> {
    match params.get("skip") {
        None | Some(Value::Null) => Ok(0),
        Some(value) => value
            .as_u64()
            .map(|v| v as i64)
            .ok_or_else(|| ProxyError::InvalidRequest(format!("bad skip: {value}"))),
    }
}
