//! Durable record of backup attempts, independent of any storage backend.

pub mod file;
pub mod memory;
pub mod postgres;

pub use file::FileCatalog;
pub use memory::MemoryCatalog;
pub use postgres::PostgresCatalog;

use super::storage::StorageProvider;
use super::{lineage_prefix, BackupError, BackupRecord, BackupStatus, Result, StatusUpdate};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::{info, warn};

/// Leases older than this are considered abandoned by a crashed holder.
pub const DEFAULT_LEASE_TTL_SECONDS: i64 = 6 * 60 * 60;

#[async_trait]
pub trait CatalogStore: Send + Sync + std::fmt::Debug {
    /// Insert a new record. Fails with `KeyConflict` if the id is taken.
    async fn create(&self, record: &BackupRecord) -> Result<()>;

    /// Apply `update` if the stored revision equals `expected_revision`.
    /// Returns the record as stored after the update.
    async fn update_status(
        &self,
        backup_id: &str,
        expected_revision: u64,
        update: &StatusUpdate,
    ) -> Result<BackupRecord>;

    async fn get(&self, backup_id: &str) -> Result<BackupRecord>;

    /// All records of a lineage, newest first.
    async fn list(&self, lineage: &str) -> Result<Vec<BackupRecord>>;

    /// Delete a terminal record. Removing an unknown id is a no-op.
    async fn remove(&self, backup_id: &str) -> Result<()>;

    /// Claim the lineage for one run. Fails with `LineageBusy` while another
    /// holder has an unexpired lease.
    async fn try_acquire_lease(&self, lineage: &str, holder: &str) -> Result<()>;

    /// Release a lease held by `holder`; a lease owned by someone else is left alone.
    async fn release_lease(&self, lineage: &str, holder: &str) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Lease {
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

impl Lease {
    pub fn new(holder: &str) -> Self {
        Self {
            holder: holder.to_string(),
            acquired_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, ttl: Duration, now: DateTime<Utc>) -> bool {
        now - self.acquired_at > ttl
    }
}

pub(crate) fn sort_newest_first(records: &mut [BackupRecord]) {
    records.sort_by(|a, b| {
        b.started_at
            .cmp(&a.started_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

pub(crate) fn ensure_removable(record: &BackupRecord) -> Result<()> {
    if record.status.is_terminal() {
        Ok(())
    } else {
        Err(BackupError::IllegalTransition {
            backup_id: record.id.clone(),
            from: record.status.to_string(),
            to: "Removed".to_string(),
        })
    }
}

pub(crate) fn check_revision(record: &BackupRecord, expected_revision: u64) -> Result<()> {
    if record.revision == expected_revision {
        Ok(())
    } else {
        Err(BackupError::RevisionConflict {
            backup_id: record.id.clone(),
            expected: expected_revision,
            actual: record.revision,
        })
    }
}

/// Differences between the catalog and a backend for one lineage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReconcileReport {
    pub lineage: String,

    /// Backend keys no catalog record points at
    pub orphaned_objects: Vec<String>,

    /// Committed records whose object is gone
    pub dangling_records: Vec<String>,

    pub records_checked: usize,
    pub objects_checked: usize,
}

impl ReconcileReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned_objects.is_empty() && self.dangling_records.is_empty()
    }
}

/// Compare catalog entries of `lineage` with the objects stored under
/// `{prefix}/{lineage}/`. Read-only: nothing is deleted.
pub async fn reconcile(
    catalog: &dyn CatalogStore,
    provider: &dyn StorageProvider,
    lineage: &str,
    prefix: &str,
) -> Result<ReconcileReport> {
    let records = catalog.list(lineage).await?;
    let listed_prefix = lineage_prefix(prefix, lineage);
    let objects = provider.list(&listed_prefix).await?;

    let known: HashSet<&str> = records.iter().map(|r| r.storage_key.as_str()).collect();
    let stored: HashSet<&str> = objects.iter().map(String::as_str).collect();

    let orphaned_objects: Vec<String> = objects
        .iter()
        .filter(|key| !known.contains(key.as_str()))
        .cloned()
        .collect();

    let dangling_records: Vec<String> = records
        .iter()
        .filter(|r| r.status == BackupStatus::Committed)
        .filter(|r| r.storage_key.starts_with(&listed_prefix))
        .filter(|r| !stored.contains(r.storage_key.as_str()))
        .map(|r| r.id.clone())
        .collect();

    if orphaned_objects.is_empty() && dangling_records.is_empty() {
        info!(lineage, "Catalog and backend agree");
    } else {
        warn!(
            lineage,
            orphaned = orphaned_objects.len(),
            dangling = dangling_records.len(),
            "Catalog and backend disagree"
        );
    }

    Ok(ReconcileReport {
        lineage: lineage.to_string(),
        orphaned_objects,
        dangling_records,
        records_checked: records.len(),
        objects_checked: objects.len(),
    })
}
