//! # capsule-server
//!
//! HTTP server for Time Capsule Cloud.
//!
//! This binary provides:
//! - **REST API** (axum) to create, list, edit, delete, unlock, download and
//!   preview capsules, plus in-app release notifications
//! - **Unlock scheduler** that releases due capsules on a fixed cadence
//!   without any request driving it
//! - **Admin API** to inspect the scheduler and force a scan
//!
//! Payloads are encrypted with the master key from `ENCRYPTION_KEY` before
//! they reach the payload store.

mod api;
mod config;
mod error;

use std::sync::Arc;

use anyhow::Context;
use capsule_core::{
    shared, CapsuleService, FsPayloadStore, NotificationCenter, PayloadStore, SharedDb,
    SqlitePayloadStore, SqliteRecords, UnlockEngine, UnlockScheduler,
};
use capsule_shared::constants::APP_NAME;
use capsule_store::Database;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::{PayloadBackend, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,capsule_server=debug,capsule_core=debug")),
        )
        .init();

    info!("Starting {APP_NAME} server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let key = config
        .master_key()
        .context("ENCRYPTION_KEY must be 64 hex characters (32 bytes)")?;

    // -----------------------------------------------------------------------
    // 3. Initialize storage
    // -----------------------------------------------------------------------
    let database = Database::open_at(&config.database_path)
        .with_context(|| format!("opening {}", config.database_path.display()))?;
    info!(path = ?database.path(), "Database opened");
    let db = shared(database);

    let payloads = open_payload_store(&config, &db).await?;
    info!(backend = ?config.payload_backend, "Payload store ready");

    // -----------------------------------------------------------------------
    // 4. Wire the unlock engine, service and scheduler
    // -----------------------------------------------------------------------
    let notifications = NotificationCenter::new(db.clone());
    let engine = Arc::new(
        UnlockEngine::new(Arc::new(SqliteRecords::new(db)), payloads, key)
            .with_listener(Arc::new(notifications.clone()))
            .with_concurrency(config.scan_concurrency)
            .with_item_timeout(config.item_timeout),
    );
    let service = Arc::new(
        CapsuleService::new(engine.clone(), key).with_max_payload_size(config.max_payload_size),
    );
    let scheduler = Arc::new(UnlockScheduler::new(engine, config.scan_interval));

    let http_addr = config.http_addr;
    let app_state = AppState {
        service,
        scheduler: scheduler.clone(),
        notifications,
        config: Arc::new(config),
    };

    // -----------------------------------------------------------------------
    // 5. Spawn the unlock scheduler (first scan runs immediately)
    // -----------------------------------------------------------------------
    scheduler.start();

    // -----------------------------------------------------------------------
    // 6. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, http_addr) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    scheduler.stop().await;

    if let Err(e) = &result {
        tracing::error!(error = %e, "HTTP server failed");
    }
    result
}

async fn open_payload_store(
    config: &ServerConfig,
    db: &SharedDb,
) -> anyhow::Result<Arc<dyn PayloadStore>> {
    Ok(match config.payload_backend {
        PayloadBackend::Fs => {
            let dir = &config.payload_storage_path;
            let store = FsPayloadStore::new(dir.clone())
                .await
                .with_context(|| format!("preparing payload directory {}", dir.display()))?;
            Arc::new(store)
        }
        PayloadBackend::Sqlite => Arc::new(SqlitePayloadStore::new(db.clone())),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fs_backend_writes_under_storage_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            payload_backend: PayloadBackend::Fs,
            payload_storage_path: dir.path().join("payloads"),
            ..ServerConfig::default()
        };
        let db = shared(Database::open_at(&dir.path().join("capsules.db")).unwrap());

        let store = open_payload_store(&config, &db).await.unwrap();
        let payload = store.put(b"sealed bytes").await.unwrap();

        let on_disk = std::fs::read_dir(dir.path().join("payloads")).unwrap().count();
        assert_eq!(on_disk, 1);
        assert_eq!(store.get(&payload).await.unwrap(), b"sealed bytes");
    }

    #[tokio::test]
    async fn sqlite_backend_shares_the_database() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            payload_backend: PayloadBackend::Sqlite,
            payload_storage_path: dir.path().join("unused"),
            ..ServerConfig::default()
        };
        let db = shared(Database::open_at(&dir.path().join("capsules.db")).unwrap());

        let store = open_payload_store(&config, &db).await.unwrap();
        let payload = store.put(b"sealed bytes").await.unwrap();

        assert!(!dir.path().join("unused").exists());
        assert_eq!(store.get(&payload).await.unwrap(), b"sealed bytes");
    }
}
