use super::catalog::CatalogStore;
use super::metrics::BackupMetrics;
use super::storage::StorageResolver;
use super::{BackupRecord, BackupStatus, Result, RetentionPolicy};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Records of a lineage that violate `policy` at `now`, oldest first.
///
/// Only `Committed` and `Failed` records are ever selected. Committed records
/// beyond the newest `max_count` are selected, failed records beyond the
/// newest `max_failed` (or `max_count`) likewise, and any terminal record
/// older than `max_age` is selected regardless of count.
pub fn select_expired(
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> Vec<BackupRecord> {
    let cutoff = policy.max_age_duration().map(|age| now - age);

    let mut expired = Vec::new();
    for (status, limit) in [
        (BackupStatus::Committed, policy.max_count),
        (BackupStatus::Failed, policy.failed_limit()),
    ] {
        let mut group: Vec<&BackupRecord> =
            records.iter().filter(|r| r.status == status).collect();
        group.sort_by_key(|r| (Reverse(r.started_at), Reverse(r.id.clone())));

        for (rank, record) in group.into_iter().enumerate() {
            let over_count = limit.is_some_and(|limit| rank >= limit as usize);
            let too_old = cutoff.is_some_and(|cutoff| record.started_at < cutoff);
            if over_count || too_old {
                expired.push(record.clone());
            }
        }
    }

    expired.sort_by(|a, b| a.started_at.cmp(&b.started_at));
    expired
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetentionFailure {
    pub backup_id: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionReport {
    pub lineage: String,
    pub examined: usize,
    pub deleted: Vec<String>,
    pub failures: Vec<RetentionFailure>,
}

/// Applies a retention policy to one lineage. Each expired backup has its
/// object deleted before its catalog entry, so an interruption leaves a
/// catalog entry pointing at nothing rather than an uncatalogued object.
#[derive(Debug, Clone)]
pub struct RetentionEnforcer {
    catalog: Arc<dyn CatalogStore>,
    storage: Arc<dyn StorageResolver>,
    metrics: Option<Arc<BackupMetrics>>,
}

impl RetentionEnforcer {
    pub fn new(catalog: Arc<dyn CatalogStore>, storage: Arc<dyn StorageResolver>) -> Self {
        Self {
            catalog,
            storage,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<BackupMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Delete everything `policy` no longer allows. Per-record failures are
    /// collected in the report; only a failure to list the catalog aborts.
    #[instrument(skip(self, policy))]
    pub async fn enforce(&self, lineage: &str, policy: &RetentionPolicy) -> Result<RetentionReport> {
        let records = self.catalog.list(lineage).await?;
        let expired = select_expired(&records, policy, Utc::now());

        let mut report = RetentionReport {
            lineage: lineage.to_string(),
            examined: records.len(),
            ..Default::default()
        };

        for record in expired {
            match self.delete_one(&record).await {
                Ok(()) => {
                    debug!(backup_id = %record.id, status = %record.status, "Retention removed backup");
                    report.deleted.push(record.id);
                }
                Err(e) => {
                    warn!(backup_id = %record.id, "Retention could not remove backup: {}", e);
                    report.failures.push(RetentionFailure {
                        backup_id: record.id,
                        message: e.to_string(),
                    });
                }
            }
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_retention(lineage, report.deleted.len(), report.failures.len());
        }
        if !report.deleted.is_empty() {
            info!(
                lineage,
                deleted = report.deleted.len(),
                "🧹 Retention pass complete"
            );
        }
        Ok(report)
    }

    async fn delete_one(&self, record: &BackupRecord) -> Result<()> {
        let provider = self.storage.provider_for(&record.spec.storage_location)?;
        provider.delete(&record.storage_key).await?;
        self.catalog.remove(&record.id).await
    }
}
