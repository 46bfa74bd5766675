use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ProxyError, ProxyResult};

/// How an incoming chain transfer is attributed to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Distinction {
    Address,
    Tag,
    Amount,
    UtxoAddress,
}

impl Distinction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Distinction::Address => "address",
            Distinction::Tag => "tag",
            Distinction::Amount => "amount",
            Distinction::UtxoAddress => "utxo-address",
        }
    }
}

impl fmt::Display for Distinction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Validated caller identifier: non-empty lowercase hex of even length,
/// the textual form of the user's byte-sequence id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> ProxyResult<Self> {
        if raw.is_empty() || raw.len() % 2 != 0 {
            return Err(ProxyError::InvalidUserId(raw.to_string()));
        }
        if raw.chars().any(|c| c.is_ascii_uppercase()) {
            return Err(ProxyError::InvalidUserId(raw.to_string()));
        }
        hex::decode(raw).map_err(|_| ProxyError::InvalidUserId(raw.to_string()))?;
        Ok(UserId(raw.to_string()))
    }

    /// For rows read back from our own store, which only ever holds
    /// validated ids.
    pub fn from_stored(raw: String) -> Self {
        UserId(raw)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A deposit handle row. Which fields are populated depends on the coin's
/// distinction model; the unique indexes created per distinction enforce the
/// shape.
#[derive(Debug, Clone)]
pub struct HandleRow {
    pub user: UserId,
    pub derivation_index: Option<u32>,
    pub address: Option<String>,
    pub tag: Option<u64>,
    /// Reserved amount in minimal units (amount-based coins).
    pub amount: Option<Decimal>,
}

impl HandleRow {
    pub fn address(user: UserId, derivation_index: Option<u32>, address: String) -> Self {
        HandleRow {
            user,
            derivation_index,
            address: Some(address),
            tag: None,
            amount: None,
        }
    }

    pub fn tag(user: UserId, tag: u64) -> Self {
        HandleRow {
            user,
            derivation_index: None,
            address: None,
            tag: Some(tag),
            amount: None,
        }
    }

    pub fn amount(user: UserId, amount: Decimal) -> Self {
        HandleRow {
            user,
            derivation_index: None,
            address: None,
            tag: None,
            amount: Some(amount),
        }
    }
}

/// A confirmed deposit, append-only.
#[derive(Debug, Clone)]
pub struct DepositRecord {
    pub entry_id: i64,
    pub user: UserId,
    /// Minimal units.
    pub amount: Decimal,
    pub tx_hash: String,
    pub vout: Option<i64>,
    pub block_hash: Option<String>,
    pub block_height: i64,
    pub block_time: i64,
}

/// A completed withdrawal, append-only.
#[derive(Debug, Clone)]
pub struct WithdrawalRecord {
    pub entry_id: i64,
    pub user: UserId,
    /// Minimal units.
    pub amount: Decimal,
    pub tx_hash: String,
    pub block_hash: Option<String>,
    pub block_height: Option<i64>,
    pub address: String,
    pub timestamp: i64,
}

/// A scheduled payout awaiting broadcast. At most one per user per coin.
#[derive(Debug, Clone)]
pub struct PendingPayout {
    pub user: UserId,
    /// Minimal units.
    pub amount: Decimal,
    pub address: String,
    pub tag: Option<u64>,
}

/// Cumulative per-user totals in minimal units.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccountTotals {
    pub deposited: Decimal,
    pub withdrawn: Decimal,
}

/// Cumulative per-coin totals in minimal units.
#[derive(Debug, Clone, Copy, Default)]
pub struct GlobalTotals {
    pub deposited: Decimal,
    pub withdrawn: Decimal,
}
