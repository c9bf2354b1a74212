//! Shared fixtures for the backup integration tests: fake component
//! collaborators, recording wrappers around storage and catalog, and a
//! fully wired environment on top of in-memory object storage.

#![allow(dead_code)]

use async_trait::async_trait;
use observability_backup::backup::{
    sha256_hex, BackupError, BackupMetrics, BackupOrchestrator, BackupRecord, BackupSpec,
    BackupStatus, CatalogStore, ComponentExport, ComponentExporter, ComponentImporter,
    ComponentReader, FixedStorageResolver, KeyResolver, MemoryCatalog, ObjectStoreProvider,
    ProviderKind, RestoreOrchestrator, Result, RetentionPolicy, SnapshotCollector,
    StageTimeouts, StaticKeyResolver, StatusUpdate, StorageLocation, StorageProvider,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;

pub const TEST_KEY_REF: &str = "file:test-backup.key";

/// Shared, ordered log of side effects across wrappers.
#[derive(Debug, Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    pub fn push(&self, event: String) {
        self.0.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<String> {
        self.0.lock().unwrap().clone()
    }

    pub fn position(&self, event: &str) -> Option<usize> {
        self.events().iter().position(|e| e == event)
    }
}

/// Exporter and importer for tests. Components may be told to hang or fail.
#[derive(Debug, Default)]
pub struct FakeComponents {
    data: Mutex<HashMap<String, Vec<u8>>>,
    hanging: Mutex<HashSet<String>>,
    failing: Mutex<HashSet<String>>,
    imported: Mutex<Vec<(String, Vec<u8>)>>,
    pub export_calls: AtomicUsize,
}

impl FakeComponents {
    pub fn with_data(entries: &[(&str, &str)]) -> Arc<Self> {
        let fake = Self::default();
        {
            let mut data = fake.data.lock().unwrap();
            for (component, bytes) in entries {
                data.insert(component.to_string(), bytes.as_bytes().to_vec());
            }
        }
        Arc::new(fake)
    }

    pub fn hang(&self, component: &str) {
        self.hanging.lock().unwrap().insert(component.to_string());
    }

    pub fn fail(&self, component: &str) {
        self.failing.lock().unwrap().insert(component.to_string());
    }

    pub fn heal(&self, component: &str) {
        self.hanging.lock().unwrap().remove(component);
        self.failing.lock().unwrap().remove(component);
    }

    pub fn set(&self, component: &str, bytes: &[u8]) {
        self.data
            .lock()
            .unwrap()
            .insert(component.to_string(), bytes.to_vec());
    }

    pub fn imported(&self) -> Vec<(String, Vec<u8>)> {
        self.imported.lock().unwrap().clone()
    }
}

#[async_trait]
impl ComponentExporter for FakeComponents {
    async fn export(&self, component: &str, _deadline: Instant) -> Result<ComponentExport> {
        self.export_calls.fetch_add(1, Ordering::SeqCst);
        let hangs = self.hanging.lock().unwrap().contains(component);
        if hangs {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        }
        if self.failing.lock().unwrap().contains(component) {
            return Err(BackupError::Component {
                component: component.to_string(),
                message: "export endpoint returned 503".to_string(),
            });
        }
        let data = self
            .data
            .lock()
            .unwrap()
            .get(component)
            .cloned()
            .ok_or_else(|| BackupError::Component {
                component: component.to_string(),
                message: "unknown component".to_string(),
            })?;
        Ok(ComponentExport::from_bytes(data))
    }
}

#[async_trait]
impl ComponentImporter for FakeComponents {
    async fn import(
        &self,
        component: &str,
        mut reader: ComponentReader,
        expected_checksum: &str,
    ) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;
        if sha256_hex(&data) != expected_checksum {
            return Err(BackupError::Corrupt {
                message: format!("import of {component} failed its checksum"),
            });
        }
        self.imported
            .lock()
            .unwrap()
            .push((component.to_string(), data.clone()));
        self.data
            .lock()
            .unwrap()
            .insert(component.to_string(), data);
        Ok(())
    }
}

/// Storage provider that counts uploads and logs deletes. It can also hand
/// back truncated objects, like a backend that acknowledged a short write.
#[derive(Debug)]
pub struct RecordingProvider {
    inner: ObjectStoreProvider,
    log: EventLog,
    pub uploads: AtomicUsize,
    truncate_downloads: AtomicBool,
}

impl RecordingProvider {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: ObjectStoreProvider::memory().unwrap(),
            log,
            uploads: AtomicUsize::new(0),
            truncate_downloads: AtomicBool::new(false),
        }
    }

    pub fn truncate_downloads(&self) {
        self.truncate_downloads.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl StorageProvider for RecordingProvider {
    fn name(&self) -> &str {
        "recording"
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<()> {
        self.uploads.fetch_add(1, Ordering::SeqCst);
        self.log.push(format!("storage.upload:{key}"));
        self.inner.upload(key, data).await
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let mut data = self.inner.download(key).await?;
        if self.truncate_downloads.load(Ordering::SeqCst) {
            data.truncate(data.len() / 2);
        }
        Ok(data)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.log.push(format!("storage.delete:{key}"));
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.inner.list(prefix).await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.inner.exists(key).await
    }
}

/// Catalog that logs removals on top of the in-memory catalog. Status
/// writes can be slowed down, and writes of `Failed` can be made to fail.
#[derive(Debug)]
pub struct RecordingCatalog {
    inner: MemoryCatalog,
    log: EventLog,
    update_delay_ms: AtomicU64,
    rejected_failure_writes: AtomicUsize,
}

impl RecordingCatalog {
    pub fn new(log: EventLog) -> Self {
        Self {
            inner: MemoryCatalog::new(),
            log,
            update_delay_ms: AtomicU64::new(0),
            rejected_failure_writes: AtomicUsize::new(0),
        }
    }

    pub fn slow_updates(&self, delay: Duration) {
        self.update_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Reject the next `count` attempts to mark a record `Failed`.
    pub fn reject_failure_writes(&self, count: usize) {
        self.rejected_failure_writes.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl CatalogStore for RecordingCatalog {
    async fn create(&self, record: &BackupRecord) -> Result<()> {
        self.inner.create(record).await
    }

    async fn update_status(
        &self,
        backup_id: &str,
        expected_revision: u64,
        update: &StatusUpdate,
    ) -> Result<BackupRecord> {
        let delay = self.update_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if update.status == BackupStatus::Failed
            && self
                .rejected_failure_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
        {
            self.log.push(format!("catalog.rejected:{backup_id}"));
            return Err(BackupError::Transient {
                message: "catalog unavailable".to_string(),
            });
        }
        self.inner
            .update_status(backup_id, expected_revision, update)
            .await
    }

    async fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        self.inner.get(backup_id).await
    }

    async fn list(&self, lineage: &str) -> Result<Vec<BackupRecord>> {
        self.inner.list(lineage).await
    }

    async fn remove(&self, backup_id: &str) -> Result<()> {
        self.log.push(format!("catalog.remove:{backup_id}"));
        self.inner.remove(backup_id).await
    }

    async fn try_acquire_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        self.inner.try_acquire_lease(lineage, holder).await
    }

    async fn release_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        self.inner.release_lease(lineage, holder).await
    }
}

pub fn short_timeouts() -> StageTimeouts {
    StageTimeouts {
        capture: Duration::from_millis(300),
        upload: Duration::from_secs(5),
        download: Duration::from_secs(5),
        import: Duration::from_secs(5),
    }
}

pub fn test_spec(lineage: &str, components: &[&str], retention: RetentionPolicy) -> BackupSpec {
    BackupSpec::new(
        lineage,
        components.iter().map(|c| c.to_string()).collect(),
        StorageLocation::new(ProviderKind::S3, "obs-backups", "cluster-a"),
        retention,
    )
}

/// Everything needed to run and restore backups against in-memory backends.
pub struct TestEnv {
    pub log: EventLog,
    pub components: Arc<FakeComponents>,
    pub provider: Arc<RecordingProvider>,
    pub catalog: Arc<RecordingCatalog>,
    pub keys: Arc<dyn KeyResolver>,
    pub metrics: Arc<BackupMetrics>,
    pub orchestrator: Arc<BackupOrchestrator>,
    pub restorer: Arc<RestoreOrchestrator>,
}

impl TestEnv {
    pub fn new(components: Arc<FakeComponents>) -> Self {
        let keys = StaticKeyResolver::new().with_key(TEST_KEY_REF, b"correct horse battery staple".to_vec());
        Self::with_keys(components, Arc::new(keys))
    }

    pub fn with_keys(components: Arc<FakeComponents>, keys: Arc<dyn KeyResolver>) -> Self {
        Self::build(components, keys, short_timeouts())
    }

    pub fn with_timeouts(components: Arc<FakeComponents>, timeouts: StageTimeouts) -> Self {
        let keys = StaticKeyResolver::new().with_key(TEST_KEY_REF, b"correct horse battery staple".to_vec());
        Self::build(components, Arc::new(keys), timeouts)
    }

    fn build(
        components: Arc<FakeComponents>,
        keys: Arc<dyn KeyResolver>,
        timeouts: StageTimeouts,
    ) -> Self {
        let log = EventLog::default();
        let provider = Arc::new(RecordingProvider::new(log.clone()));
        let catalog = Arc::new(RecordingCatalog::new(log.clone()));
        let metrics = Arc::new(BackupMetrics::new().unwrap());
        let storage = Arc::new(FixedStorageResolver::new(provider.clone()));

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
            storage,
            keys.clone(),
            components.clone(),
            metrics.clone(),
            timeouts,
        ));

        Self {
            log,
            components,
            provider,
            catalog,
            keys,
            metrics,
            orchestrator,
            restorer,
        }
    }

    /// A second restorer over the same catalog and storage but other keys.
    pub fn restorer_with_keys(&self, keys: Arc<dyn KeyResolver>) -> RestoreOrchestrator {
        RestoreOrchestrator::new(
            self.catalog.clone(),
            Arc::new(FixedStorageResolver::new(self.provider.clone())),
            keys,
            self.components.clone(),
            self.metrics.clone(),
            short_timeouts(),
        )
    }
}
