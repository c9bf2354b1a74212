use super::{
    check_revision, ensure_removable, sort_newest_first, CatalogStore, Lease,
    DEFAULT_LEASE_TTL_SECONDS,
};
use crate::backup::{BackupError, BackupRecord, Result, StatusUpdate};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// In-process catalog. State is lost on restart.
#[derive(Debug)]
pub struct MemoryCatalog {
    records: RwLock<HashMap<String, BackupRecord>>,
    leases: Mutex<HashMap<String, Lease>>,
    lease_ttl: Duration,
}

impl Default for MemoryCatalog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::with_lease_ttl(Duration::seconds(DEFAULT_LEASE_TTL_SECONDS))
    }

    pub fn with_lease_ttl(lease_ttl: Duration) -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            leases: Mutex::new(HashMap::new()),
            lease_ttl,
        }
    }
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create(&self, record: &BackupRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(BackupError::KeyConflict {
                key: record.id.clone(),
            });
        }
        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn update_status(
        &self,
        backup_id: &str,
        expected_revision: u64,
        update: &StatusUpdate,
    ) -> Result<BackupRecord> {
        let mut records = self.records.write().await;
        let record = records
            .get_mut(backup_id)
            .ok_or_else(|| BackupError::RecordNotFound {
                backup_id: backup_id.to_string(),
            })?;
        check_revision(record, expected_revision)?;

        // Apply to a copy so a rejected update leaves the stored record intact
        let mut updated = record.clone();
        updated.apply(update, Utc::now())?;
        *record = updated.clone();
        Ok(updated)
    }

    async fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        self.records
            .read()
            .await
            .get(backup_id)
            .cloned()
            .ok_or_else(|| BackupError::RecordNotFound {
                backup_id: backup_id.to_string(),
            })
    }

    async fn list(&self, lineage: &str) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .records
            .read()
            .await
            .values()
            .filter(|r| r.lineage == lineage)
            .cloned()
            .collect();
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn remove(&self, backup_id: &str) -> Result<()> {
        let mut records = self.records.write().await;
        if let Some(record) = records.get(backup_id) {
            ensure_removable(record)?;
            records.remove(backup_id);
        }
        Ok(())
    }

    async fn try_acquire_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if let Some(existing) = leases.get(lineage) {
            if existing.holder != holder && !existing.is_expired(self.lease_ttl, Utc::now()) {
                return Err(BackupError::LineageBusy {
                    lineage: lineage.to_string(),
                    holder: existing.holder.clone(),
                });
            }
            debug!(lineage, previous = %existing.holder, "Taking over lease");
        }
        leases.insert(lineage.to_string(), Lease::new(holder));
        Ok(())
    }

    async fn release_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        let mut leases = self.leases.lock().await;
        if leases.get(lineage).is_some_and(|l| l.holder == holder) {
            leases.remove(lineage);
        }
        Ok(())
    }
}
