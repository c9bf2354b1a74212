use super::catalog::CatalogStore;
use super::collector::{CaptureTarget, SnapshotCollector};
use super::compression::{compress, decompress};
use super::encryption::{codec_for, EncryptionCodec, KeyResolver};
use super::metrics::{BackupMetrics, RunTimer};
use super::retention::{RetentionEnforcer, RetentionReport};
use super::storage::{StorageProvider, StorageResolver};
use super::{
    bounded, sha256_hex, BackupError, BackupRecord, BackupSpec, BackupStatus, FailureCause,
    FailureReason, Result, StatusUpdate,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Per-stage time budgets. Uploads and downloads get more room than capture
/// since large payloads legitimately take longer to move.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTimeouts {
    pub capture: Duration,
    pub upload: Duration,
    pub download: Duration,
    pub import: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            capture: Duration::from_secs(300),
            upload: Duration::from_secs(1800),
            download: Duration::from_secs(1800),
            import: Duration::from_secs(600),
        }
    }
}

/// Result of one orchestration run that got as far as creating a record.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub record: BackupRecord,
    pub retention: Option<RetentionReport>,

    /// Set when retention could not run at all after a commit
    pub retention_error: Option<String>,
}

impl RunOutcome {
    pub fn is_committed(&self) -> bool {
        self.record.status == BackupStatus::Committed
    }
}

/// Drives one backup run through `Pending → Capturing → Uploading →
/// Committed`, or to `Failed` from any earlier state.
#[derive(Debug, Clone)]
pub struct BackupOrchestrator {
    catalog: Arc<dyn CatalogStore>,
    storage: Arc<dyn StorageResolver>,
    keys: Arc<dyn KeyResolver>,
    collector: SnapshotCollector,
    retention: RetentionEnforcer,
    metrics: Arc<BackupMetrics>,
    timeouts: StageTimeouts,
}

/// Mutable state of a run in progress: the latest stored record and the
/// stage that is executing.
struct RunState {
    record: BackupRecord,
    stage: &'static str,
    upload_started: bool,
}

impl BackupOrchestrator {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        storage: Arc<dyn StorageResolver>,
        keys: Arc<dyn KeyResolver>,
        collector: SnapshotCollector,
        metrics: Arc<BackupMetrics>,
        timeouts: StageTimeouts,
    ) -> Self {
        let retention =
            RetentionEnforcer::new(catalog.clone(), storage.clone()).with_metrics(metrics.clone());
        Self {
            catalog,
            storage,
            keys,
            collector,
            retention,
            metrics,
            timeouts,
        }
    }

    pub fn catalog(&self) -> Arc<dyn CatalogStore> {
        self.catalog.clone()
    }

    pub fn retention(&self) -> &RetentionEnforcer {
        &self.retention
    }

    /// Run one backup of `spec`.
    ///
    /// Errors are returned only when no record was created: an invalid spec,
    /// a busy lineage, or a catalog failure on create. Once the record exists
    /// every failure ends in a `Failed` record inside the returned outcome.
    #[instrument(skip(self, spec, cancel), fields(lineage = %spec.lineage, spec_id = %spec.id))]
    pub async fn run(&self, spec: &BackupSpec, cancel: &CancellationToken) -> Result<RunOutcome> {
        spec.validate()?;

        let record = BackupRecord::new_pending(spec, Utc::now());
        self.catalog
            .try_acquire_lease(&spec.lineage, &record.id)
            .await?;

        let outcome = self.run_leased(spec, record.clone(), cancel).await;

        if let Err(e) = self.catalog.release_lease(&spec.lineage, &record.id).await {
            error!(backup_id = %record.id, "Failed to release lineage lease: {}", e);
        }
        outcome
    }

    async fn run_leased(
        &self,
        spec: &BackupSpec,
        record: BackupRecord,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome> {
        self.catalog.create(&record).await?;
        info!(backup_id = %record.id, key = %record.storage_key, "🚀 Starting backup run");

        let timer = RunTimer::new(self.metrics.clone());
        let mut state = RunState {
            record,
            stage: "capture",
            upload_started: false,
        };

        match self.execute(spec, &mut state, cancel).await {
            Ok(()) => {
                let record = state.record;
                self.metrics
                    .record_run(&spec.lineage, "committed", timer.start());
                self.metrics.record_commit(
                    &spec.lineage,
                    record.size_bytes,
                    record.completed_at.unwrap_or_else(Utc::now),
                );
                info!(
                    backup_id = %record.id,
                    bytes = record.size_bytes,
                    "✅ Backup committed"
                );

                let (retention, retention_error) =
                    match self.retention.enforce(&spec.lineage, &spec.retention_policy).await {
                        Ok(report) => (Some(report), None),
                        Err(e) => {
                            warn!(lineage = %spec.lineage, "Retention failed after commit: {}", e);
                            (None, Some(e.to_string()))
                        }
                    };

                Ok(RunOutcome {
                    record,
                    retention,
                    retention_error,
                })
            }
            Err(e) => {
                let record = self.fail(spec, state, &e).await;
                let outcome = match record.failure.as_ref().map(|f| f.cause) {
                    Some(FailureCause::Cancelled) => "cancelled",
                    _ => "failed",
                };
                self.metrics.record_run(&spec.lineage, outcome, timer.start());
                Ok(RunOutcome {
                    record,
                    retention: None,
                    retention_error: None,
                })
            }
        }
    }

    async fn execute(
        &self,
        spec: &BackupSpec,
        state: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let backup_id = state.record.id.clone();
        let key = state.record.storage_key.clone();

        self.transition(state, StatusUpdate::to(BackupStatus::Capturing))
            .await?;
        let codec = codec_for(spec.encryption.as_ref(), self.keys.as_ref()).await?;
        let bundle = self
            .collector
            .capture(
                CaptureTarget {
                    backup_id: &backup_id,
                    lineage: &spec.lineage,
                    spec_id: &spec.id,
                },
                &spec.components,
                cancel,
            )
            .await?;

        state.stage = "packaging";
        let encoded = bundle.encode()?;
        let checksum = sha256_hex(&encoded);
        let compressed = compress(spec.compression.as_ref(), &encoded)?;
        let sealed = codec.encrypt(&compressed)?;
        let size = sealed.len() as u64;

        state.stage = "upload";
        self.transition(state, StatusUpdate::uploading(checksum.clone(), size))
            .await?;
        let provider = self.storage.provider_for(&spec.storage_location)?;
        state.upload_started = true;
        bounded(cancel, self.timeouts.upload, "upload", provider.upload(&key, &sealed)).await?;
        debug!(backup_id = %backup_id, bytes = size, "Upload finished, verifying");

        state.stage = "verification";
        self.verify_stored(spec, provider.as_ref(), codec.as_ref(), &key, &checksum, cancel)
            .await?;

        state.stage = "commit";
        self.transition(state, StatusUpdate::committed(checksum, size))
            .await?;
        Ok(())
    }

    /// Re-read the uploaded object and check it decodes to the bundle we sealed.
    async fn verify_stored(
        &self,
        spec: &BackupSpec,
        provider: &dyn StorageProvider,
        codec: &dyn EncryptionCodec,
        key: &str,
        checksum: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let stored = bounded(
            cancel,
            self.timeouts.download,
            "verification download",
            provider.download(key),
        )
        .await?;
        let opened = codec.decrypt(&stored)?;
        let bundle = decompress(spec.compression.as_ref(), &opened)?;
        let actual = sha256_hex(&bundle);
        if actual != checksum {
            return Err(BackupError::corrupt(format!(
                "stored object {key} hashes to {actual}, expected {checksum}"
            )));
        }
        Ok(())
    }

    async fn transition(&self, state: &mut RunState, update: StatusUpdate) -> Result<()> {
        state.record = self
            .catalog
            .update_status(&state.record.id, state.record.revision, &update)
            .await?;
        debug!(backup_id = %state.record.id, status = %state.record.status, "Status updated");
        Ok(())
    }

    /// Mark the run failed and clean up anything it may have written.
    async fn fail(&self, spec: &BackupSpec, state: RunState, error: &BackupError) -> BackupRecord {
        let reason = FailureReason::from_error(state.stage, error);
        match reason.cause {
            FailureCause::Cancelled => {
                warn!(backup_id = %state.record.id, "Backup cancelled during {}", state.stage)
            }
            FailureCause::Error => error!(
                backup_id = %state.record.id,
                "❌ Backup failed during {}: {}",
                state.stage,
                error
            ),
        }

        let conflict = matches!(error, BackupError::KeyConflict { .. });
        if state.upload_started && !conflict {
            match self.storage.provider_for(&spec.storage_location) {
                Ok(provider) => {
                    if let Err(e) = provider.delete(&state.record.storage_key).await {
                        warn!(key = %state.record.storage_key, "Could not remove object of failed run: {}", e);
                    }
                }
                Err(e) => warn!("Could not resolve provider for cleanup: {}", e),
            }
        }

        if state.record.status.is_terminal() {
            return state.record;
        }

        let update = StatusUpdate::failed(reason.clone());
        let backup_id = state.record.id.clone();
        let written = match self
            .catalog
            .update_status(&backup_id, state.record.revision, &update)
            .await
        {
            Ok(record) => return record,
            Err(e) => {
                warn!(
                    backup_id = %backup_id,
                    stage = state.stage,
                    "Recording failure in catalog failed, retrying once: {}",
                    e
                );
                // Re-read so the retry carries the stored revision
                match self.catalog.get(&backup_id).await {
                    Ok(current) if current.status.is_terminal() => return current,
                    Ok(current) => {
                        self.catalog
                            .update_status(&backup_id, current.revision, &update)
                            .await
                    }
                    Err(e) => Err(e),
                }
            }
        };

        match written {
            Ok(record) => record,
            Err(e) => {
                error!(
                    backup_id = %backup_id,
                    stage = state.stage,
                    status = %state.record.status,
                    "Could not record failure in catalog: {}. The record stays non-terminal and \
                     retention will skip it; mark it Failed in the catalog once it is reachable",
                    e
                );
                let mut record = state.record;
                record.status = BackupStatus::Failed;
                record.failure = Some(reason);
                record
            }
        }
    }
}
