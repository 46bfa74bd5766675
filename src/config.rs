use serde::Deserialize;
use std::path::Path;

use crate::units::Rounding;

/// Which family of chain daemon backs a coin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum CoinKind {
    /// UTXO wallet daemon (`listtransactions` / `sendtoaddress`).
    Satoshi,
    /// Account-model chain with HD-derived per-user addresses.
    Buterin,
    /// Fungible token contract on a shared root address.
    #[serde(rename = "ERC20")]
    Erc20,
    /// Tag-addressed ledger (`account_tx` / destination tags).
    Ripple,
}

impl CoinKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CoinKind::Satoshi => "Satoshi",
            CoinKind::Buterin => "Buterin",
            CoinKind::Erc20 => "ERC20",
            CoinKind::Ripple => "Ripple",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// One SQLite file shared by every coin and the outbox; coin isolation
    /// is by table-name prefix.
    pub database_path: String,
    #[serde(default = "default_tick_seconds")]
    pub tick_seconds: u64,
    pub coins: Vec<CoinConfig>,
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_tick_seconds() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinConfig {
    /// Short ticker, also the store table prefix. Lowercase alphanumeric.
    pub name: String,
    #[serde(rename = "type")]
    pub kind: CoinKind,
    pub options: CoinOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CoinOptions {
    pub decimals: u32,
    /// Decimal string in coin units.
    pub minimum_amount: String,
    pub confirmations: u64,
    /// Decimal string in coin units, deducted from every payout.
    pub static_fee: String,
    #[serde(default)]
    pub rounding: Rounding,

    // Satoshi
    pub backend_options: Option<UtxoBackendOptions>,
    pub label: Option<String>,

    // Buterin / ERC20
    pub web3_url: Option<String>,
    pub mnemonic: Option<String>,
    pub contract_address: Option<String>,
    /// Gas units per transfer; defaults to a plain value transfer.
    pub gas_units: Option<u64>,

    // Ripple
    pub backend_url: Option<String>,
    /// Signing secret handed to the ledger server's submit call.
    pub passphrase: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UtxoBackendOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub unlock_password: Option<String>,
}

impl Config {
    /// Load from a TOML file, with `COINPROXY_*` environment overrides for
    /// the scalar top-level settings.
    pub fn load(path: &Path) -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(config::File::from(path))
            .add_source(config::Environment::with_prefix("COINPROXY"))
            .build()?
            .try_deserialize()
    }
}
