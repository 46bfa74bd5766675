//! Wires configuration into running components: storage, node clients,
//! engines, the dispatcher and the reconciler.

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::adapters::account::AccountEngine;
use crate::adapters::tagged::TaggedEngine;
use crate::adapters::token::TokenEngine;
use crate::adapters::utxo::UtxoEngine;
use crate::adapters::{AdapterRegistry, ChainAdapter, CoinParams};
use crate::chain::eth::{Erc20Node, EthNode};
use crate::chain::utxod::UtxoDaemon;
use crate::chain::xrpl::XrplServer;
use crate::config::{CoinConfig, CoinKind, Config};
use crate::error::{ProxyError, ProxyResult};
use crate::models::Distinction;
use crate::reconciler::Reconciler;
use crate::rpc::server::AppState;
use crate::rpc::Dispatcher;
use crate::store::Store;

/// Default gas units for a plain value transfer.
const DEFAULT_GAS_UNITS: u64 = 21_000;

pub struct App {
    pub state: AppState,
    pub reconciler: Reconciler,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish()
    }
}

pub async fn initialize(config: &Config, shutdown: CancellationToken) -> ProxyResult<App> {
    if config.coins.is_empty() {
        return Err(ProxyError::Config("no coins configured".into()));
    }

    let store = Store::open(&config.database_path).await?;
    let outbox = store.outbox();
    outbox.migrate().await?;

    let mut registry = AdapterRegistry::new();
    for coin in &config.coins {
        let adapter = build_adapter(&store, coin).await?;
        // a failing sanity pass latches the adapter instead of taking the
        // process down; read-only API calls and outbox draining stay up
        if let Err(e) = adapter.init().await {
            if e.is_latching() {
                adapter.latch().set(&coin.name, &e);
            } else {
                return Err(e);
            }
        }
        registry.register(&coin.name, adapter);
    }
    let registry = Arc::new(registry);

    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), outbox.clone()));
    let reconciler = Reconciler::new(
        registry.clone(),
        outbox,
        Duration::from_secs(config.tick_seconds),
        shutdown,
    );
    info!(coins = registry.iter().count(), "proxy initialized");

    Ok(App {
        state: AppState {
            dispatcher,
            registry,
        },
        reconciler,
    })
}

async fn build_adapter(store: &Store, coin: &CoinConfig) -> ProxyResult<Arc<dyn ChainAdapter>> {
    let params = CoinParams::from_options(&coin.name, coin.kind, &coin.options)?;
    let coin_store = store.coin(&coin.name)?;
    let options = &coin.options;

    Ok(match coin.kind {
        CoinKind::Satoshi => {
            coin_store.migrate(Distinction::UtxoAddress).await?;
            let backend = options.backend_options.as_ref().ok_or_else(|| {
                ProxyError::Config(format!("{}: backend_options are required", coin.name))
            })?;
            let label = options.label.clone().unwrap_or_else(|| coin.name.clone());
            let node = Arc::new(UtxoDaemon::new(backend));
            Arc::new(UtxoEngine::new(
                params,
                coin_store,
                node,
                label,
                backend.unlock_password.clone(),
            ))
        }
        CoinKind::Buterin => {
            coin_store.migrate(Distinction::Address).await?;
            let url = require(&coin.name, "web3_url", &options.web3_url)?;
            let mnemonic = require(&coin.name, "mnemonic", &options.mnemonic)?;
            let gas_units = options.gas_units.unwrap_or(DEFAULT_GAS_UNITS);
            let node = Arc::new(EthNode::connect(url, mnemonic, gas_units).await?);
            Arc::new(AccountEngine::new(params, coin_store, node, gas_units))
        }
        CoinKind::Erc20 => {
            coin_store.migrate(Distinction::Amount).await?;
            let url = require(&coin.name, "web3_url", &options.web3_url)?;
            let mnemonic = require(&coin.name, "mnemonic", &options.mnemonic)?;
            let contract = require(&coin.name, "contract_address", &options.contract_address)?;
            let node = Arc::new(Erc20Node::connect(url, mnemonic, contract).await?);
            Arc::new(TokenEngine::new(params, coin_store, node))
        }
        CoinKind::Ripple => {
            coin_store.migrate(Distinction::Tag).await?;
            let url = require(&coin.name, "backend_url", &options.backend_url)?;
            let secret = options
                .passphrase
                .as_deref()
                .or(options.mnemonic.as_deref())
                .ok_or_else(|| {
                    ProxyError::Config(format!(
                        "{}: a passphrase or mnemonic is required",
                        coin.name
                    ))
                })?;
            let node = Arc::new(XrplServer::connect(url, secret).await?);
            Arc::new(TaggedEngine::new(params, coin_store, node))
        }
    })
}

fn require<'a>(coin: &str, key: &str, value: &'a Option<String>) -> ProxyResult<&'a str> {
    value
        .as_deref()
        .ok_or_else(|| ProxyError::Config(format!("{coin}: {key} is required")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CoinOptions, UtxoBackendOptions};
    use crate::units::Rounding;

    fn satoshi_coin(name: &str) -> CoinConfig {
        CoinConfig {
            name: name.to_string(),
            kind: CoinKind::Satoshi,
            options: CoinOptions {
                decimals: 8,
                minimum_amount: "0.00001".to_string(),
                confirmations: 3,
                static_fee: "0.0001".to_string(),
                rounding: Rounding::Truncate,
                backend_options: Some(UtxoBackendOptions {
                    // nothing listens here; init must latch, not abort
                    host: "127.0.0.1".to_string(),
                    port: 1,
                    username: "rpc".to_string(),
                    password: "rpc".to_string(),
                    unlock_password: None,
                }),
                label: Some("proxy".to_string()),
                web3_url: None,
                mnemonic: None,
                contract_address: None,
                gas_units: None,
                backend_url: None,
                passphrase: None,
            },
        }
    }

    #[tokio::test]
    async fn unreachable_daemon_latches_instead_of_aborting() {
        let db = std::env::temp_dir().join(format!("coin-proxy-boot-{}.db", std::process::id()));
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_path: db.to_string_lossy().to_string(),
            tick_seconds: 10,
            coins: vec![satoshi_coin("btc")],
        };

        let app = initialize(&config, CancellationToken::new()).await.unwrap();
        let adapter = app.state.registry.get("btc").unwrap();
        assert!(adapter.latch().is_set());

        // read-only surface still answers
        let info = app
            .state
            .dispatcher
            .dispatch("getProxyInfo", &serde_json::json!({"coin": "btc"}))
            .await
            .unwrap();
        assert_eq!(info["coinType"], "Satoshi");
        assert!(info["error"].is_string());

        let _ = std::fs::remove_file(&db);
    }

    #[tokio::test]
    async fn empty_coin_set_is_a_config_error() {
        let config = Config {
            bind_address: "127.0.0.1:0".to_string(),
            database_path: ":memory:".to_string(),
            tick_seconds: 10,
            coins: vec![],
        };
        let err = initialize(&config, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::Config(_)));
    }
}
