//! Wiring of the production collaborators: SQLite stores, the filesystem
//! source directory, local extraction and the configured embedder.

use std::sync::Arc;

use anyhow::{Context, Result};
use sqlx::SqlitePool;

use corpus_harness_core::manifest::ManifestStore;
use corpus_harness_core::store::CorpusStore;

use crate::config::Config;
use crate::db;
use crate::embedding::create_provider;
use crate::extract::ExtractBackend;
use crate::integrity::ReportCache;
use crate::migrate::migrate_pool;
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::source_fs::FsSourceDirectory;
use crate::sqlite_store::{SqliteCorpusStore, SqliteManifestStore};

pub struct App {
    pub pool: SqlitePool,
    pub manifest: Arc<dyn ManifestStore>,
    pub store: Arc<dyn CorpusStore>,
    pub orchestrator: Orchestrator,
}

impl App {
    /// Connect to the database (applying migrations) and build the
    /// orchestrator over it.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config)
            .await
            .with_context(|| format!("Failed to open database {}", config.db.path.display()))?;
        migrate_pool(&pool).await?;

        let manifest: Arc<dyn ManifestStore> = Arc::new(SqliteManifestStore::new(pool.clone()));
        let store: Arc<dyn CorpusStore> = Arc::new(SqliteCorpusStore::new(pool.clone()));
        let source = Arc::new(FsSourceDirectory::new(&config.source)?);
        let backend = Arc::new(ExtractBackend::new(config.refine.max_file_bytes));
        let embedder = create_provider(&config.embedding)?;

        let orchestrator = Orchestrator::new(
            config,
            Collaborators {
                manifest: manifest.clone(),
                store: store.clone(),
                source,
                backend,
                embedder,
                cache: Arc::new(ReportCache::new()),
            },
        );

        Ok(Self {
            pool,
            manifest,
            store,
            orchestrator,
        })
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
