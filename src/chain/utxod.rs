//! JSON-RPC client for Satoshi-style wallet daemons.
//!
//! Thin wrapper: every method is one daemon call, errors are surfaced as
//! `ChainRpc` so the calling engine latches on daemon trouble.

use async_trait::async_trait;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::chain::{UtxoNode, WalletTx};
use crate::config::UtxoBackendOptions;
use crate::error::{ProxyError, ProxyResult};

pub struct UtxoDaemon {
    http: reqwest::Client,
    url: String,
    username: String,
    password: String,
}

impl UtxoDaemon {
    pub fn new(options: &UtxoBackendOptions) -> Self {
        UtxoDaemon {
            http: reqwest::Client::new(),
            url: format!("http://{}:{}", options.host, options.port),
            username: options.username.clone(),
            password: options.password.clone(),
        }
    }

    async fn call(&self, method: &str, params: Value) -> ProxyResult<Value> {
        let body = json!({
            "jsonrpc": "1.0",
            "id": "coin-proxy",
            "method": method,
            "params": params,
        });
        let response = self
            .http
            .post(&self.url)
            .basic_auth(&self.username, Some(&self.password))
            .json(&body)
            .send()
            .await?;
        let reply: Value = response.json().await?;
        if let Some(err) = reply.get("error").filter(|e| !e.is_null()) {
            return Err(ProxyError::ChainRpc(format!("{method} failed: {err}")));
        }
        Ok(reply.get("result").cloned().unwrap_or(Value::Null))
    }
}

fn number_field(record: &Value, field: &str) -> ProxyResult<Decimal> {
    let raw = record
        .get(field)
        .and_then(Value::as_f64)
        .ok_or_else(|| ProxyError::MalformedResponse(format!("missing numeric {field}")))?;
    Decimal::from_f64(raw)
        .ok_or_else(|| ProxyError::MalformedResponse(format!("unrepresentable {field}: {raw}")))
}

#[async_trait]
impl UtxoNode for UtxoDaemon {
    async fn new_address(&self, label: &str) -> ProxyResult<String> {
        let result = self.call("getnewaddress", json!([label])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProxyError::MalformedResponse("getnewaddress returned no string".into()))
    }

    async fn list_transactions(
        &self,
        label: &str,
        count: u32,
        skip: u32,
    ) -> ProxyResult<Vec<WalletTx>> {
        let result = self
            .call("listtransactions", json!([label, count, skip]))
            .await?;
        let records = result.as_array().ok_or_else(|| {
            ProxyError::MalformedResponse("listtransactions returned no array".into())
        })?;
        let mut page = Vec::with_capacity(records.len());
        for record in records {
            page.push(WalletTx {
                category: record
                    .get("category")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                address: record
                    .get("address")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                amount: number_field(record, "amount")?,
                confirmations: record
                    .get("confirmations")
                    .and_then(Value::as_i64)
                    .unwrap_or(0),
                txid: record
                    .get("txid")
                    .and_then(Value::as_str)
                    .ok_or_else(|| {
                        ProxyError::MalformedResponse("transaction record without txid".into())
                    })?
                    .to_string(),
                vout: record.get("vout").and_then(Value::as_i64),
                block_hash: record
                    .get("blockhash")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                block_height: record.get("blockheight").and_then(Value::as_u64),
                block_time: record.get("blocktime").and_then(Value::as_i64),
            });
        }
        Ok(page)
    }

    async fn block_height(&self, block_hash: &str) -> ProxyResult<u64> {
        let result = self.call("getblockheader", json!([block_hash])).await?;
        result
            .get("height")
            .and_then(Value::as_u64)
            .ok_or_else(|| ProxyError::MalformedResponse("block header without height".into()))
    }

    async fn wallet_balance(&self) -> ProxyResult<Decimal> {
        let result = self.call("getbalance", json!([])).await?;
        let raw = result
            .as_f64()
            .ok_or_else(|| ProxyError::MalformedResponse("getbalance returned no number".into()))?;
        Decimal::from_f64(raw)
            .ok_or_else(|| ProxyError::MalformedResponse(format!("unrepresentable balance: {raw}")))
    }

    async fn validate_address(&self, address: &str) -> ProxyResult<bool> {
        let result = self.call("validateaddress", json!([address])).await?;
        Ok(result
            .get("isvalid")
            .and_then(Value::as_bool)
            .unwrap_or(false))
    }

    async fn send_to_address(&self, address: &str, amount: Decimal) -> ProxyResult<String> {
        use rust_decimal::prelude::ToPrimitive;
        let value = amount.to_f64().ok_or_else(|| {
            ProxyError::InvalidAmount(format!("amount not representable: {amount}"))
        })?;
        let result = self.call("sendtoaddress", json!([address, value])).await?;
        result
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ProxyError::MalformedResponse("sendtoaddress returned no txid".into()))
    }

    async fn unlock_wallet(&self, passphrase: &str, timeout_secs: u64) -> ProxyResult<()> {
        self.call("walletpassphrase", json!([passphrase, timeout_secs]))
            .await?;
        Ok(())
    }
}
