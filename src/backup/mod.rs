//! Backup and restore orchestration for the observability stack.
//!
//! A run captures every component named by a [`BackupSpec`] into one
//! [`SnapshotBundle`], compresses and optionally encrypts it, uploads it under
//! a deterministic key, and records its lifecycle in a [`catalog::CatalogStore`].
//! Restores reverse the pipeline and verify every checksum before importing.

pub mod catalog;
pub mod collector;
pub mod components;
pub mod compression;
pub mod encryption;
pub mod error;
pub mod manifest;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod storage;

pub use catalog::{reconcile, CatalogStore, FileCatalog, MemoryCatalog, PostgresCatalog, ReconcileReport};
pub use collector::{CaptureTarget, SnapshotCollector};
pub use components::{ComponentExport, ComponentExporter, ComponentImporter, ComponentReader, FsComponentStore};
pub use encryption::{
    codec_for, AesGcmCodec, DefaultKeyResolver, EncryptionCodec, KeyResolver, NoopCodec,
    StaticKeyResolver,
};
pub use error::{BackupError, ErrorKind, Result};
pub use manifest::{sha256_hex, BundleBuilder, Manifest, ManifestEntry, SnapshotBundle};
pub use metrics::BackupMetrics;
pub use models::*;
pub use orchestrator::{BackupOrchestrator, RunOutcome, StageTimeouts};
pub use restore::{RestoreOrchestrator, RestoreReport, VerificationReport, VerifiedComponent};
pub use retention::{select_expired, RetentionEnforcer, RetentionReport};
pub use scheduler::{BackupScheduler, ScheduleInfo, ScheduleStatistics};
pub use storage::{
    DefaultStorageResolver, FilesystemProvider, FixedStorageResolver, ObjectStoreProvider,
    RetryConfig, StorageProvider, StorageResolver,
};

use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Run `fut` under a time budget, giving up early if `cancel` fires.
pub(crate) async fn bounded<T>(
    cancel: &CancellationToken,
    limit: Duration,
    operation: &str,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(BackupError::Cancelled {
            operation: operation.to_string(),
        }),
        result = tokio::time::timeout(limit, fut) => match result {
            Ok(inner) => inner,
            Err(_) => Err(BackupError::Timeout {
                operation: operation.to_string(),
                seconds: limit.as_secs(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_bounded_passes_result_through() {
        let cancel = CancellationToken::new();
        let value = bounded(&cancel, Duration::from_secs(1), "op", async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_times_out() {
        let cancel = CancellationToken::new();
        let result: Result<()> = bounded(&cancel, Duration::from_secs(5), "upload", async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BackupError::Timeout { seconds: 5, .. })));
    }

    #[tokio::test]
    async fn test_bounded_observes_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = bounded(&cancel, Duration::from_secs(5), "download", async {
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(BackupError::Cancelled { .. })));
    }
}
