use anyhow::Result;
use axum::Router;
use std::{io::ErrorKind, sync::Arc};
use tokio::{net::TcpListener, time};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use handlers::AppState;
use services::{
    dispatcher::Dispatcher,
    local::{LocalConfig, LocalStorage},
    storage::Storage,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = config::AppConfig::from_env_and_args()?;
    tracing::info!("Starting clawio with config: {:?}", cfg);

    // --- Backends ---
    let local = Arc::new(
        LocalStorage::open(LocalConfig {
            verify_client_checksum: cfg.verify_client_checksum,
            send_checksum: cfg.send_checksum,
            ..LocalConfig::new(&cfg.local_prefix, &cfg.data_dir, &cfg.tmp_dir)
        })
        .await?,
    );

    let dispatcher = Arc::new(Dispatcher::with_root(vec![local.clone() as Arc<dyn Storage>])?);
    for storage in dispatcher.get_all_storages() {
        tracing::info!("registered backend `{}`", storage.prefix());
    }

    // --- Abandoned chunk janitor ---
    let ttl = cfg.chunk_ttl;
    let mut ticker = time::interval(cfg.sweep_interval);
    tokio::spawn(async move {
        loop {
            ticker.tick().await;
            if let Err(e) = local.sweep_abandoned(ttl).await {
                tracing::warn!("chunk sweep failed: {}", e);
            }
        }
    });

    // --- Build router ---
    let state = AppState {
        dispatcher,
        probe_dir: cfg.tmp_dir.clone(),
    };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
