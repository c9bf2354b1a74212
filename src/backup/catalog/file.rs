use super::{
    check_revision, ensure_removable, sort_newest_first, CatalogStore, Lease,
    DEFAULT_LEASE_TTL_SECONDS,
};
use crate::backup::{BackupError, BackupRecord, Result, StatusUpdate};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Catalog kept as one JSON document per record under `{root}/records`,
/// plus one lease file per busy lineage under `{root}/leases`.
#[derive(Debug)]
pub struct FileCatalog {
    root: PathBuf,
    lease_ttl: Duration,
    write_lock: Mutex<()>,
    lease_lock: Mutex<()>,
}

/// What a lease path holds. A file that exists but does not parse is never
/// treated as free.
#[derive(Debug)]
enum LeaseFile {
    Missing,
    Unreadable,
    Held { lease: Lease, bytes: Vec<u8> },
}

impl FileCatalog {
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_lease_ttl(root, Duration::seconds(DEFAULT_LEASE_TTL_SECONDS)).await
    }

    pub async fn open_with_lease_ttl(root: impl AsRef<Path>, lease_ttl: Duration) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("records")).await?;
        fs::create_dir_all(root.join("leases")).await?;
        info!("Opened file catalog at {}", root.display());
        Ok(Self {
            root,
            lease_ttl,
            write_lock: Mutex::new(()),
            lease_lock: Mutex::new(()),
        })
    }

    fn record_path(&self, backup_id: &str) -> Result<PathBuf> {
        Ok(self.root.join("records").join(format!("{}.json", safe_name(backup_id)?)))
    }

    fn lease_path(&self, lineage: &str) -> Result<PathBuf> {
        Ok(self.root.join("leases").join(format!("{}.lease", safe_name(lineage)?)))
    }

    async fn read_record(&self, path: &Path) -> Result<Option<BackupRecord>> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_record(&self, record: &BackupRecord) -> Result<()> {
        let path = self.record_path(&record.id)?;
        let temp = path.with_extension(format!("json.tmp-{}", Uuid::new_v4()));
        let bytes = serde_json::to_vec_pretty(record)?;

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = fs::rename(&temp, &path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn read_lease(&self, path: &Path) -> Result<LeaseFile> {
        match fs::read(path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(lease) => Ok(LeaseFile::Held { lease, bytes }),
                Err(_) => Ok(LeaseFile::Unreadable),
            },
            Err(e) if e.kind() == IoErrorKind::NotFound => Ok(LeaseFile::Missing),
            Err(e) => Err(e.into()),
        }
    }

    /// Write the lease to a private temp file, then hard-link it into place.
    /// The link fails if a lease already exists, so readers never see a
    /// partially written lease. Returns false when the lineage is taken.
    async fn publish_lease(&self, path: &Path, lease: &Lease) -> Result<bool> {
        let temp = path.with_extension(format!("lease.tmp-{}", Uuid::new_v4()));
        let bytes = serde_json::to_vec(lease)?;

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        let linked = fs::hard_link(&temp, path).await;
        let _ = fs::remove_file(&temp).await;
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Move an expired lease out of the way. The rename is the
    /// compare-and-swap: the moved file must still hold `expected`, otherwise
    /// a fresh lease was caught and is linked back.
    async fn retire_expired(&self, path: &Path, expected: &[u8]) -> Result<bool> {
        let retired = path.with_extension(format!("lease.stale-{}", Uuid::new_v4()));
        match fs::rename(path, &retired).await {
            Ok(()) => {}
            Err(e) if e.kind() == IoErrorKind::NotFound => return Ok(true),
            Err(e) => return Err(e.into()),
        }

        let moved = fs::read(&retired).await?;
        if moved == expected {
            let _ = fs::remove_file(&retired).await;
            return Ok(true);
        }

        if let Err(e) = fs::hard_link(&retired, path).await {
            warn!(
                "Could not put back lease {} after a takeover race: {}",
                path.display(),
                e
            );
        }
        let _ = fs::remove_file(&retired).await;
        Ok(false)
    }
}

fn lineage_busy(lineage: &str, holder: &str) -> BackupError {
    BackupError::LineageBusy {
        lineage: lineage.to_string(),
        holder: holder.to_string(),
    }
}

fn safe_name(value: &str) -> Result<&str> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !value.starts_with('.');
    if valid {
        Ok(value)
    } else {
        Err(BackupError::invalid_spec(format!(
            "'{value}' cannot be used as a catalog file name"
        )))
    }
}

#[async_trait]
impl CatalogStore for FileCatalog {
    async fn create(&self, record: &BackupRecord) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(&record.id)?;
        if fs::try_exists(&path).await? {
            return Err(BackupError::KeyConflict {
                key: record.id.clone(),
            });
        }
        self.write_record(record).await?;
        debug!(backup_id = %record.id, "Created catalog record");
        Ok(())
    }

    async fn update_status(
        &self,
        backup_id: &str,
        expected_revision: u64,
        update: &StatusUpdate,
    ) -> Result<BackupRecord> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(backup_id)?;
        let mut record = self
            .read_record(&path)
            .await?
            .ok_or_else(|| BackupError::RecordNotFound {
                backup_id: backup_id.to_string(),
            })?;
        check_revision(&record, expected_revision)?;
        record.apply(update, Utc::now())?;
        self.write_record(&record).await?;
        Ok(record)
    }

    async fn get(&self, backup_id: &str) -> Result<BackupRecord> {
        let path = self.record_path(backup_id)?;
        self.read_record(&path)
            .await?
            .ok_or_else(|| BackupError::RecordNotFound {
                backup_id: backup_id.to_string(),
            })
    }

    async fn list(&self, lineage: &str) -> Result<Vec<BackupRecord>> {
        let mut records = Vec::new();
        let mut entries = fs::read_dir(self.root.join("records")).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match self.read_record(&path).await {
                Ok(Some(record)) if record.lineage == lineage => records.push(record),
                Ok(_) => {}
                Err(e) => warn!("Skipping unreadable catalog file {}: {}", path.display(), e),
            }
        }
        sort_newest_first(&mut records);
        Ok(records)
    }

    async fn remove(&self, backup_id: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let path = self.record_path(backup_id)?;
        if let Some(record) = self.read_record(&path).await? {
            ensure_removable(&record)?;
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == IoErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn try_acquire_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        let _guard = self.lease_lock.lock().await;
        let path = self.lease_path(lineage)?;
        let lease = Lease::new(holder);

        // Two attempts: the second runs after retiring an expired lease
        for _ in 0..2 {
            if self.publish_lease(&path, &lease).await? {
                return match self.read_lease(&path).await? {
                    LeaseFile::Held { lease: stored, .. } if stored.holder == holder => Ok(()),
                    LeaseFile::Held { lease: stored, .. } => {
                        Err(lineage_busy(lineage, &stored.holder))
                    }
                    _ => Err(lineage_busy(lineage, "unknown")),
                };
            }

            match self.read_lease(&path).await? {
                // Released between our link attempt and the read
                LeaseFile::Missing => continue,
                LeaseFile::Unreadable => {
                    warn!(
                        lineage,
                        "Lease file {} is unreadable, treating lineage as busy",
                        path.display()
                    );
                    return Err(lineage_busy(lineage, "unknown"));
                }
                LeaseFile::Held { lease: existing, .. } if existing.holder == holder => {
                    return Ok(());
                }
                LeaseFile::Held {
                    lease: existing,
                    bytes,
                } => {
                    if !existing.is_expired(self.lease_ttl, Utc::now()) {
                        return Err(lineage_busy(lineage, &existing.holder));
                    }
                    if !self.retire_expired(&path, &bytes).await? {
                        return Err(lineage_busy(lineage, "unknown"));
                    }
                    warn!(lineage, previous = %existing.holder, "Took over expired lineage lease");
                }
            }
        }

        Err(lineage_busy(lineage, "unknown"))
    }

    async fn release_lease(&self, lineage: &str, holder: &str) -> Result<()> {
        let _guard = self.lease_lock.lock().await;
        let path = self.lease_path(lineage)?;
        if let LeaseFile::Held { lease: existing, .. } = self.read_lease(&path).await? {
            if existing.holder == holder {
                match fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == IoErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Ok(())
    }
}
