use super::catalog::CatalogStore;
use super::components::{ComponentImporter, ComponentReader};
use super::compression::decompress;
use super::encryption::{codec_for, KeyResolver};
use super::metrics::BackupMetrics;
use super::orchestrator::StageTimeouts;
use super::storage::StorageResolver;
use super::{
    bounded, sha256_hex, BackupError, BackupRecord, BackupStatus, ComponentId, ManifestEntry,
    Result, SnapshotBundle,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub restored: Vec<ComponentId>,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiedComponent {
    pub component_id: ComponentId,
    pub length: u64,
    pub checksum: String,
}

/// Outcome of checking a committed backup end to end without importing it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub backup_id: String,
    pub storage_key: String,
    pub manifest_checksum: String,
    pub stored_bytes: u64,
    pub components: Vec<VerifiedComponent>,
}

/// Inverse pipeline: download, open, verify, then hand each component's
/// bytes to its importer. Never writes to the catalog or the backend.
#[derive(Debug, Clone)]
pub struct RestoreOrchestrator {
    catalog: Arc<dyn CatalogStore>,
    storage: Arc<dyn StorageResolver>,
    keys: Arc<dyn KeyResolver>,
    importer: Arc<dyn ComponentImporter>,
    metrics: Arc<BackupMetrics>,
    timeouts: StageTimeouts,
}

impl RestoreOrchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        storage: Arc<dyn StorageResolver>,
        keys: Arc<dyn KeyResolver>,
        importer: Arc<dyn ComponentImporter>,
        metrics: Arc<BackupMetrics>,
        timeouts: StageTimeouts,
    ) -> Self {
        Self {
            catalog,
            storage,
            keys,
            importer,
            metrics,
            timeouts,
        }
    }

    /// Restore `backup_id`, optionally limited to `components`. Every
    /// requested component must be in the manifest, and every selected entry
    /// must pass its checksum, before the first import starts.
    #[instrument(skip(self, components, cancel))]
    pub async fn restore(
        &self,
        backup_id: &str,
        components: Option<&[ComponentId]>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let result = self.restore_inner(backup_id, components, cancel).await;
        match &result {
            Ok(report) => {
                self.metrics.record_restore("succeeded");
                info!(
                    backup_id,
                    components = report.restored.len(),
                    "✅ Restore complete"
                );
            }
            Err(e) => {
                let outcome = if e.is_cancelled() { "cancelled" } else { "failed" };
                self.metrics.record_restore(outcome);
                error!(backup_id, "❌ Restore failed: {}", e);
            }
        }
        result
    }

    async fn restore_inner(
        &self,
        backup_id: &str,
        components: Option<&[ComponentId]>,
        cancel: &CancellationToken,
    ) -> Result<RestoreReport> {
        let record = self.committed_record(backup_id).await?;
        let bundle = self.load(&record, cancel).await?;

        let selected = select_entries(&bundle, backup_id, components)?;
        let mut payloads = Vec::with_capacity(selected.len());
        for entry in &selected {
            payloads.push(bundle.component_bytes(entry)?);
        }

        let mut report = RestoreReport {
            backup_id: backup_id.to_string(),
            restored: Vec::with_capacity(selected.len()),
            bytes: 0,
        };
        for (entry, data) in selected.iter().zip(payloads) {
            let reader: ComponentReader = Box::new(std::io::Cursor::new(data.to_vec()));
            bounded(
                cancel,
                self.timeouts.import,
                "import",
                self.importer.import(&entry.component_id, reader, &entry.checksum),
            )
            .await?;
            debug!(component = %entry.component_id, bytes = entry.length, "Component restored");
            report.restored.push(entry.component_id.clone());
            report.bytes += entry.length;
        }
        Ok(report)
    }

    /// Download and fully check a committed backup without importing it.
    #[instrument(skip(self, cancel))]
    pub async fn verify(&self, backup_id: &str, cancel: &CancellationToken) -> Result<VerificationReport> {
        let record = self.committed_record(backup_id).await?;
        let bundle = self.load(&record, cancel).await?;

        let mut components = Vec::with_capacity(bundle.manifest.entries.len());
        for entry in &bundle.manifest.entries {
            bundle.component_bytes(entry)?;
            components.push(VerifiedComponent {
                component_id: entry.component_id.clone(),
                length: entry.length,
                checksum: entry.checksum.clone(),
            });
        }

        info!(backup_id, components = components.len(), "Backup verified");
        Ok(VerificationReport {
            backup_id: record.id,
            storage_key: record.storage_key,
            manifest_checksum: record.manifest_checksum.unwrap_or_default(),
            stored_bytes: record.size_bytes,
            components,
        })
    }

    async fn committed_record(&self, backup_id: &str) -> Result<BackupRecord> {
        let record = self.catalog.get(backup_id).await?;
        if record.status != BackupStatus::Committed {
            return Err(BackupError::NotRestorable {
                backup_id: backup_id.to_string(),
                status: record.status.to_string(),
            });
        }
        Ok(record)
    }

    async fn load(&self, record: &BackupRecord, cancel: &CancellationToken) -> Result<SnapshotBundle> {
        let expected = record.manifest_checksum.as_deref().ok_or_else(|| {
            BackupError::corrupt(format!("record {} has no manifest checksum", record.id))
        })?;

        let provider = self.storage.provider_for(&record.spec.storage_location)?;
        let stored = bounded(
            cancel,
            self.timeouts.download,
            "download",
            provider.download(&record.storage_key),
        )
        .await?;

        let codec = codec_for(record.spec.encryption.as_ref(), self.keys.as_ref()).await?;
        let opened = codec.decrypt(&stored)?;
        let encoded = decompress(record.spec.compression.as_ref(), &opened)?;

        let actual = sha256_hex(&encoded);
        if actual != expected {
            return Err(BackupError::corrupt(format!(
                "backup {} hashes to {actual}, catalog says {expected}",
                record.id
            )));
        }
        SnapshotBundle::decode(&encoded)
    }
}

/// Entries to restore, in manifest order. Fails before anything is imported
/// if a requested component is absent.
fn select_entries(
    bundle: &SnapshotBundle,
    backup_id: &str,
    components: Option<&[ComponentId]>,
) -> Result<Vec<ManifestEntry>> {
    let Some(requested) = components else {
        return Ok(bundle.manifest.entries.clone());
    };

    for component in requested {
        if bundle.manifest.entry(component).is_none() {
            return Err(BackupError::ComponentMissingFromBackup {
                backup_id: backup_id.to_string(),
                component: component.clone(),
            });
        }
    }

    Ok(bundle
        .manifest
        .entries
        .iter()
        .filter(|e| requested.contains(&e.component_id))
        .cloned()
        .collect())
}
