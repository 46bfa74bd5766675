use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use coin_proxy::{bootstrap, config::Config, rpc::server};

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info,coin_proxy=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    dotenvy::dotenv().ok();

    let config_path =
        std::env::var("COINPROXY_CONFIG").unwrap_or_else(|_| "coin-proxy.toml".to_string());
    let config = Config::load(Path::new(&config_path))?;
    info!(config = %config_path, coins = config.coins.len(), "starting coin proxy");

    let shutdown = CancellationToken::new();
    let app = bootstrap::initialize(&config, shutdown.clone()).await?;

    let reconciler = app.reconciler.spawn();
    let router = server::create_app(app.state);

    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_token.cancel();
        }
    });

    server::run_server(router, &config.bind_address, shutdown.clone()).await?;

    // quiesce background work before exiting
    shutdown.cancel();
    let _ = reconciler.await;
    info!("coin proxy stopped");
    Ok(())
}
