//! Revisioned annotation storage and mask services for DIVE datasets.
//!
//! [`Engine`] wires the services over one storage backend:
//! [`store::pg::PgStore`] in production, [`store::memory::MemoryStore`] for
//! tests and embedded use.

use std::sync::Arc;

use dive_core::error::CoreError;

pub mod blob;
pub mod config;
pub mod datasets;
pub mod error;
pub mod import;
pub mod masks;
pub mod store;
pub mod versioning;

use blob::{BlobStore, LocalBlobStore};
use config::EngineConfig;
use datasets::DatasetService;
use masks::MaskService;
use store::pg::PgStore;
use store::Store;
use versioning::VersioningEngine;

/// The services of one backend, sharing its store and blob store.
#[derive(Clone)]
pub struct Engine<S> {
    pub versioning: VersioningEngine<S>,
    pub masks: MaskService<S>,
    pub datasets: DatasetService<S>,
}

impl<S: Store> Engine<S> {
    pub fn new(store: S, blobs: Arc<dyn BlobStore>, config: &EngineConfig) -> Self {
        let masks = MaskService::new(store.clone(), blobs, config.reconcile_concurrency);
        Self {
            versioning: VersioningEngine::new(
                store.clone(),
                masks.clone(),
                config.default_page_limit,
            ),
            datasets: DatasetService::new(store, masks.clone()),
            masks,
        }
    }
}

impl Engine<PgStore> {
    /// Connect to PostgreSQL, apply migrations and use the local blob store
    /// under `BLOB_ROOT`.
    pub async fn connect(config: &EngineConfig) -> Result<Self, CoreError> {
        let pool = dive_db::create_pool(&config.database_url, config.db_max_connections)
            .await
            .map_err(|e| CoreError::Internal(format!("database connection failed: {e}")))?;
        dive_db::health_check(&pool)
            .await
            .map_err(|e| CoreError::Internal(format!("database health check failed: {e}")))?;
        dive_db::run_migrations(&pool)
            .await
            .map_err(|e| CoreError::Internal(format!("migrations failed: {e}")))?;
        tracing::info!(blob_root = %config.blob_root.display(), "Engine connected");

        let blobs: Arc<dyn BlobStore> = Arc::new(LocalBlobStore::new(config.blob_root.clone()));
        Ok(Self::new(PgStore::new(pool), blobs, config))
    }
}
