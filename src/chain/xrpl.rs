//! JSON-RPC client for tag-addressed ledger servers (XRPL dialect).

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::str::FromStr;

use crate::chain::{TaggedNode, TaggedPage, TaggedTx};
use crate::error::{ProxyError, ProxyResult};

/// Offset between the ledger's epoch (2000-01-01) and the Unix epoch.
const LEDGER_EPOCH_OFFSET: i64 = 946_684_800;

pub struct XrplServer {
    http: reqwest::Client,
    url: String,
    root: String,
    secret: String,
    page_limit: u32,
}

impl XrplServer {
    /// Connect and resolve the root account for the configured secret via
    /// the server's `wallet_propose`.
    pub async fn connect(url: &str, secret: &str) -> ProxyResult<Self> {
        let mut server = XrplServer {
            http: reqwest::Client::new(),
            url: url.to_string(),
            root: String::new(),
            secret: secret.to_string(),
            page_limit: 10,
        };
        let proposed = server
            .call("wallet_propose", json!({ "passphrase": secret }))
            .await?;
        server.root = proposed
            .get("account_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ProxyError::MalformedResponse("wallet_propose returned no account_id".into())
            })?
            .to_string();
        Ok(server)
    }

    async fn call(&self, method: &str, params: Value) -> ProxyResult<Value> {
        let body = json!({ "method": method, "params": [params] });
        let reply: Value = self.http.post(&self.url).json(&body).send().await?.json().await?;
        let result = reply
            .get("result")
            .cloned()
            .ok_or_else(|| ProxyError::MalformedResponse(format!("{method}: reply without result")))?;
        if result.get("status").and_then(Value::as_str) == Some("error") {
            let reason = result
                .get("error_message")
                .or_else(|| result.get("error"))
                .and_then(Value::as_str)
                .unwrap_or("unknown error");
            return Err(ProxyError::ChainRpc(format!("{method} failed: {reason}")));
        }
        Ok(result)
    }
}

/// `delivered_amount` is a drops string for the native asset; issued-currency
/// objects are not ours to credit.
fn delivered_units(meta: &Value) -> Option<Decimal> {
    meta.get("delivered_amount")
        .and_then(Value::as_str)
        .and_then(|s| Decimal::from_str(s).ok())
}

/// The transaction only moved funds if its final meta node modified an
/// account root.
fn credits_account(meta: &Value) -> bool {
    meta.get("AffectedNodes")
        .and_then(Value::as_array)
        .and_then(|nodes| nodes.last())
        .and_then(|node| node.get("ModifiedNode"))
        .and_then(|n| n.get("LedgerEntryType"))
        .and_then(Value::as_str)
        == Some("AccountRoot")
}

fn parse_entry(entry: &Value) -> Option<TaggedTx> {
    let tx = entry.get("tx")?;
    if tx.get("TransactionType").and_then(Value::as_str) != Some("Payment") {
        return None;
    }
    let meta = entry.get("meta")?;
    Some(TaggedTx {
        hash: tx.get("hash")?.as_str()?.to_string(),
        destination: tx
            .get("Destination")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        tag: tx.get("DestinationTag").and_then(Value::as_u64),
        delivered: delivered_units(meta),
        ledger_index: tx.get("ledger_index").and_then(Value::as_u64)?,
        validated: entry.get("validated").and_then(Value::as_bool).unwrap_or(false),
        success: meta.get("TransactionResult").and_then(Value::as_str) == Some("tesSUCCESS"),
        credits_account: credits_account(meta),
        time: tx
            .get("date")
            .and_then(Value::as_i64)
            .map(|d| d + LEDGER_EPOCH_OFFSET)
            .unwrap_or(0),
    })
}

#[async_trait]
impl TaggedNode for XrplServer {
    fn root_address(&self) -> &str {
        &self.root
    }

    fn is_address(&self, candidate: &str) -> bool {
        let len_ok = (25..=35).contains(&candidate.len());
        candidate.starts_with('r')
            && len_ok
            && candidate
                .chars()
                .all(|c| c.is_ascii_alphanumeric() && c != '0' && c != 'O' && c != 'I' && c != 'l')
    }

    async fn account_tx(&self, marker: Option<Value>) -> ProxyResult<TaggedPage> {
        let mut params = json!({
            "account": self.root,
            "binary": false,
            "forward": false,
            "limit": self.page_limit,
        });
        if let Some(marker) = marker {
            params["marker"] = marker;
        }
        let result = self.call("account_tx", params).await?;
        let entries = result
            .get("transactions")
            .and_then(Value::as_array)
            .ok_or_else(|| {
                ProxyError::MalformedResponse("account_tx returned no transactions".into())
            })?;
        let txs = entries.iter().filter_map(parse_entry).collect();
        Ok(TaggedPage {
            txs,
            marker: result.get("marker").filter(|m| !m.is_null()).cloned(),
        })
    }

    async fn root_balance(&self) -> ProxyResult<Decimal> {
        let result = self
            .call(
                "account_info",
                json!({ "account": self.root, "ledger_index": "validated" }),
            )
            .await?;
        let balance = result
            .get("account_data")
            .and_then(|d| d.get("Balance"))
            .and_then(Value::as_str)
            .ok_or_else(|| ProxyError::MalformedResponse("account_info without Balance".into()))?;
        Decimal::from_str(balance)
            .map_err(|_| ProxyError::MalformedResponse(format!("bad Balance: {balance}")))
    }

    async fn submit_payment(
        &self,
        to: &str,
        value: Decimal,
        tag: Option<u64>,
    ) -> ProxyResult<String> {
        let mut tx_json = json!({
            "TransactionType": "Payment",
            "Account": self.root,
            "Destination": to,
            "Amount": value.normalize().to_string(),
        });
        if let Some(tag) = tag {
            tx_json["DestinationTag"] = json!(tag);
        }
        let result = self
            .call("submit", json!({ "secret": self.secret, "tx_json": tx_json }))
            .await?;
        let engine_result = result
            .get("engine_result")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        if engine_result != "tesSUCCESS" {
            return Err(ProxyError::ChainRpc(format!(
                "payment submission returned {engine_result}"
            )));
        }
        result
            .get("tx_json")
            .and_then(|t| t.get("hash"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ProxyError::MalformedResponse("submit reply without hash".into()))
    }
}
