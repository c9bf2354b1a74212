use super::{ensure_removable, CatalogStore, DEFAULT_LEASE_TTL_SECONDS};
use crate::backup::{
    BackupError, BackupRecord, BackupSpec, BackupStatus, FailureReason, Result, StatusUpdate,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tracing::debug;

/// Catalog in PostgreSQL. Revision checks happen inside the `UPDATE` so
/// concurrent writers on different hosts are serialized by the database.
#[derive(Debug)]
pub struct PostgresCatalog {
    db_pool: Arc<PgPool>,
    lease_ttl: Duration,
}

impl PostgresCatalog {
    pub fn new(db_pool: Arc<PgPool>) -> Self {
        Self {
            db_pool,
            lease_ttl: Duration::seconds(DEFAULT_LEASE_TTL_SECONDS),
        }
    }

    pub fn with_lease_ttl(mut self, lease_ttl: Duration) -> Self {
        self.lease_ttl = lease_ttl;
        self
    }

    /// Create the catalog tables if they don't exist.
    pub async fn initialize(&self) -> Result<()> {
        debug!("Initializing backup catalog tables");

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_records (
                id VARCHAR PRIMARY KEY,
                lineage VARCHAR NOT NULL,
                spec JSONB NOT NULL,
                status VARCHAR NOT NULL,
                revision BIGINT NOT NULL DEFAULT 0,
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                manifest_checksum VARCHAR,
                size_bytes BIGINT NOT NULL DEFAULT 0,
                storage_key TEXT NOT NULL,
                failure JSONB
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_backup_records_lineage ON backup_records (lineage, started_at DESC)",
        )
        .execute(self.db_pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS backup_lineage_leases (
                lineage VARCHAR PRIMARY KEY,
                holder VARCHAR NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL
            )
        "#,
        )
        .execute(self.db_pool.as_ref())
        .await?;

        debug!("Backup catalog tables ready");
        Ok(())
    }

    fn row_to_record(row: &PgRow) -> Result<BackupRecord> {
        let status: String = row.try_get("status")?;
        let status = BackupStatus::parse(&status)
            .ok_or_else(|| BackupError::corrupt(format!("unknown status {status} in catalog")))?;
        let spec: serde_json::Value = row.try_get("spec")?;
        let spec: BackupSpec = serde_json::from_value(spec)?;
        let failure: Option<serde_json::Value> = row.try_get("failure")?;
        let failure: Option<FailureReason> = failure.map(serde_json::from_value).transpose()?;
        let revision: i64 = row.try_get("revision")?;
        let size_bytes: i64 = row.try_get("size_bytes")?;

        Ok(BackupRecord {
            id: row.try_get("id")?,
            lineage: row.try_get("lineage")?,
            spec,
            status,
            revision: revision.max(0) as u64,
            started_at: row.try_get::<DateTime<Utc>, _>("started_at")?,
            completed_at: row.try_get::<Option<DateTime<Utc>>, _>("completed_at")?,
            manifest_checksum: row.try_get("manifest_checksum")?,
            size_bytes: size_bytes.max(0) as u64,
            storage_key: row.try_get("storage_key")?,
            failure,
        })
    }
}

#[async_trait]
impl CatalogStore for PostgresCatalog {
    async fn create(&self, record: &BackupRecord) -> Result<()> {
        let failure = record.failure.as_ref().map(serde_json::to_value).transpose()?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO backup_records (
                id, lineage, spec, status, revision, started_at, completed_at,
                manifest_checksum, size_bytes, storage_key, failure
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (id) DO NOTHING
        "#,
        )
        .bind(&record.id)
        .bind(&record.lineage)
        .bind(serde_json::to_value(&record.spec)?)
        .bind(record.status.as_str())
        .bind(record.revision as i64)
        .bind(record.started_at)
        .bind(record.completed_at)
        .bind(&record.manifest_checksum)
        .bind(record.size_bytes as i64)
        .bind(&record.storage_key)
        .bind(failure)
        .execute(self.db_pool.as_ref())
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(BackupError::KeyConflict {
                key: record.id.clone(),
            });
        }
        Ok(())
    }

    async fn update_status(
        &self,
        backup_id: &str,
        expected_revision: u64,
        update: &StatusUpdate,
    ) -> Result<BackupRecord> {
        let mut record = self.get(backup_id).await?;
        if record.revision != expected_revision {
            return Err(BackupError::RevisionConflict {
                backup_id: backup_id.to_string(),
                expected: expected_revision,
                actual: record.revision,
            });
        }
        record.apply(update, Utc::now())?;

        let failure = record.failure.as_ref().map(serde_json::to_value).transpose()?;
        let updated = sqlx::query(
            r#"
            UPDATE backup_records SET
                status = $3, revision = $4, completed_at = $5,
                manifest_checksum = $6, size_bytes = $7, failure = $8
            WHERE id = $1 AND revision = $2
        "#,
        )
        .bind(backup_id)
        .bind(expected_revision as i64)
        .bind(record.status.as_str())
        .bind(record.revision as i64)
        .bind(record.completed_at)
        .bind(&record.manifest_checksum)
        .bind(record.size_bytes as i64)
        .bind(failure)
        .execute(self.db_pool.as_ref())
        .await?;

        if updated.rows_affected() == 0 {
            let actual = self.get(backup_id).await?.revision;
            return Err(BackupError::RevisionConflict {
                backup_id: backup_id.to_string(),
                expected: expected_revision,
                actual,
            });
        }
        Ok(record)
    }

    async fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        let row = sqlx::query("SELECT * FROM backup_records WHERE id = $1")
            .bind(backup_id)
            .fetch_optional(self.db_pool.as_ref())
            .await?
            .ok_or_else(|| BackupError::RecordNotFound {
                backup_id: backup_id.to_string(),
            })?;
        Self::row_to_record(&row)
    }

    async fn list(&self, lineage: &str) -> Result<Vec<BackupRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM backup_records WHERE lineage = $1 ORDER BY started_at DESC, id DESC",
        )
        .bind(lineage)
        .fetch_all(self.db_pool.as_ref())
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn remove(&self, backup_id: &str) -> Result<()> {
        let record = match self.get(backup_id).await {
            Ok(record) => record,
            Err(BackupError::RecordNotFound { .. }) => return Ok(()),
            Err(e) => return Err(e),
        };
        ensure_removable(&record)?;

        sqlx::query("DELETE FROM backup_records WHERE id = $1 AND status IN ('Committed', 'Failed')")
            .bind(backup_id)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }

    async fn try_acquire_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        let now = Utc::now();
        let stale_before = now - self.lease_ttl;

        let acquired = sqlx::query(
            r#"
            INSERT INTO backup_lineage_leases (lineage, holder, acquired_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (lineage) DO UPDATE
                SET holder = EXCLUDED.holder, acquired_at = EXCLUDED.acquired_at
                WHERE backup_lineage_leases.acquired_at < $4
                   OR backup_lineage_leases.holder = EXCLUDED.holder
        "#,
        )
        .bind(lineage)
        .bind(holder)
        .bind(now)
        .bind(stale_before)
        .execute(self.db_pool.as_ref())
        .await?;

        if acquired.rows_affected() > 0 {
            return Ok(());
        }

        let current: Option<String> =
            sqlx::query("SELECT holder FROM backup_lineage_leases WHERE lineage = $1")
                .bind(lineage)
                .fetch_optional(self.db_pool.as_ref())
                .await?
                .map(|row| row.try_get("holder"))
                .transpose()?;

        Err(BackupError::LineageBusy {
            lineage: lineage.to_string(),
            holder: current.unwrap_or_else(|| "unknown".to_string()),
        })
    }

    async fn release_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        sqlx::query("DELETE FROM backup_lineage_leases WHERE lineage = $1 AND holder = $2")
            .bind(lineage)
            .bind(holder)
            .execute(self.db_pool.as_ref())
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{ProviderKind, RetentionPolicy, StorageLocation};
    use chrono::SubsecRound;
    use sqlx::postgres::PgPoolOptions;

    /// Runs only when TEST_DATABASE_URL points at a scratch database.
    async fn test_catalog() -> Option<PostgresCatalog> {
        let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set, skipping PostgreSQL catalog test");
            return None;
        };
        let pool = PgPoolOptions::new()
            .max_connections(4)
            .connect(&database_url)
            .await
            .unwrap();
        let catalog = PostgresCatalog::new(Arc::new(pool));
        catalog.initialize().await.unwrap();
        Some(catalog)
    }

    fn record(lineage: &str) -> BackupRecord {
        let spec = BackupSpec::new(
            lineage,
            vec!["metrics-store".to_string(), "dashboard-store".to_string()],
            StorageLocation::new(ProviderKind::S3, "obs-backups", "cluster-a")
                .with_config("region", "eu-west-1"),
            RetentionPolicy::keep_last(5),
        );
        let mut record = BackupRecord::new_pending(&spec, Utc::now());
        // PostgreSQL keeps microseconds
        record.started_at = record.started_at.trunc_subsecs(6);
        record
    }

    fn unique_lineage() -> String {
        format!("pg-test-{}", uuid::Uuid::new_v4().simple())
    }

    #[tokio::test]
    async fn test_create_get_and_list_round_trip() {
        let Some(catalog) = test_catalog().await else {
            return;
        };
        let lineage = unique_lineage();
        let rec = record(&lineage);

        catalog.create(&rec).await.unwrap();
        assert_eq!(catalog.get(&rec.id).await.unwrap(), rec);
        assert_eq!(catalog.list(&lineage).await.unwrap(), vec![rec.clone()]);
        assert!(matches!(
            catalog.create(&rec).await,
            Err(BackupError::KeyConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_stale_revision_is_rejected() {
        let Some(catalog) = test_catalog().await else {
            return;
        };
        let rec = record(&unique_lineage());
        catalog.create(&rec).await.unwrap();

        let capturing = catalog
            .update_status(&rec.id, 0, &StatusUpdate::to(BackupStatus::Capturing))
            .await
            .unwrap();
        assert_eq!(capturing.revision, 1);

        match catalog
            .update_status(&rec.id, 0, &StatusUpdate::to(BackupStatus::Uploading))
            .await
        {
            Err(BackupError::RevisionConflict {
                expected, actual, ..
            }) => {
                assert_eq!(expected, 0);
                assert_eq!(actual, 1);
            }
            other => panic!("expected RevisionConflict, got {other:?}"),
        }
        assert_eq!(
            catalog.get(&rec.id).await.unwrap().status,
            BackupStatus::Capturing
        );
    }

    #[tokio::test]
    async fn test_lease_exclusivity_and_expiry() {
        let Some(catalog) = test_catalog().await else {
            return;
        };
        let lineage = unique_lineage();

        catalog.try_acquire_lease(&lineage, "run-a").await.unwrap();
        match catalog.try_acquire_lease(&lineage, "run-b").await {
            Err(BackupError::LineageBusy { holder, .. }) => assert_eq!(holder, "run-a"),
            other => panic!("expected LineageBusy, got {other:?}"),
        }

        // Only the holder can release
        catalog.release_lease(&lineage, "run-b").await.unwrap();
        assert!(catalog.try_acquire_lease(&lineage, "run-b").await.is_err());

        let impatient = PostgresCatalog::new(catalog.db_pool.clone())
            .with_lease_ttl(Duration::zero());
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        impatient.try_acquire_lease(&lineage, "run-c").await.unwrap();
        assert!(catalog.try_acquire_lease(&lineage, "run-a").await.is_err());

        catalog.release_lease(&lineage, "run-c").await.unwrap();
        catalog.try_acquire_lease(&lineage, "run-a").await.unwrap();
        catalog.release_lease(&lineage, "run-a").await.unwrap();
    }

    #[tokio::test]
    async fn test_remove_only_terminal_records() {
        let Some(catalog) = test_catalog().await else {
            return;
        };
        let rec = record(&unique_lineage());
        catalog.create(&rec).await.unwrap();

        assert!(matches!(
            catalog.remove(&rec.id).await,
            Err(BackupError::IllegalTransition { .. })
        ));

        let reason = FailureReason::from_error("capture", &BackupError::transient("export 503"));
        let failed = catalog
            .update_status(&rec.id, 0, &StatusUpdate::failed(reason.clone()))
            .await
            .unwrap();
        assert_eq!(failed.failure, Some(reason));
        assert_eq!(catalog.get(&rec.id).await.unwrap().failure, failed.failure);

        catalog.remove(&rec.id).await.unwrap();
        assert!(matches!(
            catalog.get(&rec.id).await,
            Err(BackupError::RecordNotFound { .. })
        ));
        catalog.remove(&rec.id).await.unwrap();
    }
}
