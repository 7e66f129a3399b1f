//! # Fleet Sync Server
//!
//! Runs one sync engine against the configured tracking provider and exposes
//! the control/read API. Persistence is optional: PostgreSQL when a database
//! URL is set, Redis for the snapshot cache when a Redis URL is set, otherwise
//! a snapshot file next to the binary.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;

use lib_fleetsync::configs::{CredentialStore, EnvCredentialStore, JsonFileCredentialStore};
use lib_fleetsync::connections::cache_redis::{DEFAULT_SNAPSHOT_KEY, RedisSnapshotCache};
use lib_fleetsync::connections::db_postgres::PostgresSink;
use lib_fleetsync::connections::FileSnapshotCache;
use lib_fleetsync::{HttpProvider, SnapshotCache, SyncConfig, SyncEngine, init_logging};

mod fleetsync_logic;
use fleetsync_logic::{api, config};

/// Base URL used only to build the client when credentials are unusable. The
/// engine refuses to contact the provider in that state.
const UNCONFIGURED_BASE_URL: &str = "http://127.0.0.1/";

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let settings = config::load_config()?;
    let _log_guard = init_logging(&settings.log)?;
    tracing::info!(port = settings.port, "Fleet sync server booting");

    // --- Engine configuration ---
    let sync_config = match &settings.sync_config_path {
        Some(path) => SyncConfig::load(path)?,
        None => SyncConfig::default(),
    };

    let store: Box<dyn CredentialStore> = match &settings.credentials_path {
        Some(path) => Box::new(JsonFileCredentialStore::new(path)),
        None => Box::new(EnvCredentialStore::default()),
    };
    let credentials = store.load();
    if let Err(e) = &credentials {
        tracing::error!(error = %e, "Credentials unavailable, serving cached data only");
    }

    let base_url = credentials
        .as_ref()
        .map(|c| c.base_url.as_str())
        .unwrap_or(UNCONFIGURED_BASE_URL);
    let provider = HttpProvider::new(base_url, settings.request_timeout)?;

    // --- Persistence ---
    let mut builder = SyncEngine::builder(sync_config, Arc::new(provider)).credentials_from(credentials);

    if let Some(url) = &settings.database_url {
        let sink = PostgresSink::connect(url, 5).await.context("connecting the PostgreSQL sink")?;
        sink.migrate().await.context("creating sink tables")?;
        tracing::info!("PostgreSQL sink ready");
        builder = builder.sink(Arc::new(sink));
    }

    let cache: Arc<dyn SnapshotCache> = match &settings.redis_url {
        Some(url) => Arc::new(
            RedisSnapshotCache::connect(url, DEFAULT_SNAPSHOT_KEY)
                .await
                .context("connecting the Redis snapshot cache")?,
        ),
        None => Arc::new(FileSnapshotCache::new(&settings.snapshot_path)),
    };
    builder = builder.cache(cache);

    // --- Engine and API ---
    let engine = builder.build()?;
    let handle = engine.start().await;

    let listener = TcpListener::bind(("0.0.0.0", settings.port))
        .await
        .with_context(|| format!("binding port {}", settings.port))?;
    api::serve(listener, handle, shutdown_signal()).await?;

    tracing::info!("API closed, waiting for the sync engine");
    engine.stop().await;
    tracing::info!("Shutdown complete.");
    Ok(())
}

/// Resolves on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Ctrl-C handler unavailable");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "SIGTERM handler unavailable");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Ctrl-C received, initiating shutdown."),
        _ = terminate => tracing::info!("SIGTERM received, initiating shutdown."),
    }
}
