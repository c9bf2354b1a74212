use crate::backup::{
    BackupMetrics, BackupOrchestrator, BackupScheduler, BackupSpec, CatalogStore,
    DefaultKeyResolver, DefaultStorageResolver, FileCatalog, FsComponentStore, KeyResolver,
    MemoryCatalog, PostgresCatalog, RestoreOrchestrator, SnapshotCollector, StorageResolver,
};
use crate::config::{CatalogBackend, Config};
use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Dependency injection container for the application
pub struct DependencyContainer {
    // Core configuration
    pub config: Config,
    pub specs: Vec<BackupSpec>,

    // Persistence
    pub db_pool: Option<Arc<PgPool>>,
    pub catalog: Arc<dyn CatalogStore>,

    // Collaborators
    pub storage: Arc<dyn StorageResolver>,
    pub keys: Arc<dyn KeyResolver>,
    pub components: Arc<FsComponentStore>,

    // Services
    pub metrics: Arc<BackupMetrics>,
    pub orchestrator: Arc<BackupOrchestrator>,
    pub restorer: Arc<RestoreOrchestrator>,
    pub scheduler: Arc<BackupScheduler>,
}

impl DependencyContainer {
    pub async fn new(config: Config) -> Result<Self> {
        info!("🔧 Initializing dependency container...");

        let specs = config.load_specs()?;
        info!("Loaded {} backup definitions", specs.len());

        let (db_pool, catalog) = Self::create_catalog(&config).await?;

        let storage: Arc<dyn StorageResolver> =
            Arc::new(DefaultStorageResolver::new(config.retry_config()));
        let keys: Arc<dyn KeyResolver> =
            Arc::new(DefaultKeyResolver::new(config.key_directory.clone()));
        let components = Arc::new(FsComponentStore::new(&config.component_data_root));
        let metrics = Arc::new(BackupMetrics::new()?);
        let timeouts = config.stage_timeouts();

        let orchestrator = Arc::new(BackupOrchestrator::new(
            catalog.clone(),
            storage.clone(),
            keys.clone(),
            SnapshotCollector::new(components.clone(), timeouts.capture),
            metrics.clone(),
            timeouts.clone(),
        ));
        let restorer = Arc::new(RestoreOrchestrator::new(
            catalog.clone(),
            storage.clone(),
            keys.clone(),
            components.clone(),
            metrics.clone(),
            timeouts,
        ));
        let scheduler = Arc::new(
            BackupScheduler::new(orchestrator.clone(), metrics.clone())
                .await
                .context("Failed to create backup scheduler")?,
        );

        info!("✅ Dependency container initialized successfully");

        Ok(Self {
            config,
            specs,
            db_pool,
            catalog,
            storage,
            keys,
            components,
            metrics,
            orchestrator,
            restorer,
            scheduler,
        })
    }

    async fn create_catalog(
        config: &Config,
    ) -> Result<(Option<Arc<PgPool>>, Arc<dyn CatalogStore>)> {
        match &config.catalog {
            CatalogBackend::Memory => {
                warn!("⚠️  Using in-memory catalog, records will not survive a restart");
                Ok((None, Arc::new(MemoryCatalog::new())))
            }
            CatalogBackend::File(dir) => {
                let catalog = FileCatalog::open(dir)
                    .await
                    .with_context(|| format!("Failed to open catalog at {}", dir.display()))?;
                Ok((None, Arc::new(catalog)))
            }
            CatalogBackend::Postgres(url) => {
                let pool = Arc::new(
                    PgPoolOptions::new()
                        .max_connections(config.max_db_connections)
                        .acquire_timeout(Duration::from_secs(10))
                        .idle_timeout(Some(Duration::from_secs(300)))
                        .connect(url)
                        .await
                        .with_context(|| {
                            format!("Failed to connect to {}", config.catalog.describe())
                        })?,
                );
                let catalog = PostgresCatalog::new(pool.clone());
                catalog.initialize().await?;
                Ok((Some(pool), Arc::new(catalog)))
            }
        }
    }

    pub fn spec(&self, lineage: &str) -> Result<&BackupSpec> {
        self.specs
            .iter()
            .find(|s| s.lineage == lineage)
            .ok_or_else(|| anyhow::anyhow!("No backup definition for lineage {lineage}"))
    }

    pub async fn health_check(&self) -> Result<bool> {
        if let Some(pool) = &self.db_pool {
            if let Err(e) = sqlx::query("SELECT 1").execute(pool.as_ref()).await {
                warn!("Catalog database is unreachable: {}", e);
                return Ok(false);
            }
        }
        Ok(true)
    }
}
