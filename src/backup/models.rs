use super::{BackupError, ErrorKind, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use uuid::Uuid;

/// Identifier of a platform component (metrics-store, dashboard-store, ...).
pub type ComponentId = String;

/// File extension of every snapshot object written to a backend.
pub const SNAPSHOT_EXTENSION: &str = "snapshot";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProviderKind {
    S3,
    #[serde(rename = "GCS", alias = "Gcs")]
    Gcs,
    AzureBlob,
    #[serde(alias = "Local")]
    Filesystem,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::S3 => "s3",
            ProviderKind::Gcs => "gcs",
            ProviderKind::AzureBlob => "azure-blob",
            ProviderKind::Filesystem => "filesystem",
        };
        f.write_str(name)
    }
}

/// Fully qualifies one destination for snapshot objects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageLocation {
    pub provider: ProviderKind,

    /// Bucket or container name; for the filesystem provider, the root directory
    pub bucket: String,

    #[serde(default)]
    pub prefix: String,

    /// Provider-specific settings (region, endpoint, credentials, ...)
    #[serde(default)]
    pub backend_config: HashMap<String, String>,
}

impl StorageLocation {
    pub fn new(provider: ProviderKind, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            provider,
            bucket: bucket.into(),
            prefix: prefix.into(),
            backend_config: HashMap::new(),
        }
    }

    pub fn with_config(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.backend_config.insert(key.into(), value.into());
        self
    }

    pub fn config_value(&self, key: &str) -> Option<&str> {
        self.backend_config
            .get(key)
            .map(String::as_str)
            .filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EncryptionAlgorithm {
    #[serde(rename = "AES256GCM", alias = "aes-256-gcm")]
    Aes256Gcm,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptionConfig {
    pub algorithm: EncryptionAlgorithm,

    /// Reference resolved by a key resolver (`env:NAME`, `file:name`)
    pub key_reference: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    None,
    Zstd,
    Gzip,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,

    #[serde(default = "default_compression_level")]
    pub level: i32,
}

fn default_compression_level() -> i32 {
    3
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            algorithm: CompressionAlgorithm::Zstd,
            level: default_compression_level(),
        }
    }
}

/// Governs which historical backups of a lineage are eligible for deletion.
/// A record is deleted when it violates any configured bound.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Keep at most this many committed backups
    #[serde(default)]
    pub max_count: Option<u32>,

    /// Drop terminal records older than this many seconds
    #[serde(default)]
    pub max_age_seconds: Option<u64>,

    /// Keep at most this many failed records (defaults to `max_count`)
    #[serde(default)]
    pub max_failed: Option<u32>,
}

impl RetentionPolicy {
    pub fn keep_last(count: u32) -> Self {
        Self {
            max_count: Some(count),
            ..Self::default()
        }
    }

    pub fn max_age(duration: chrono::Duration) -> Self {
        Self {
            max_age_seconds: Some(duration.num_seconds().max(0) as u64),
            ..Self::default()
        }
    }

    pub fn with_max_age(mut self, duration: chrono::Duration) -> Self {
        self.max_age_seconds = Some(duration.num_seconds().max(0) as u64);
        self
    }

    pub fn with_max_failed(mut self, count: u32) -> Self {
        self.max_failed = Some(count);
        self
    }

    pub fn max_age_duration(&self) -> Option<chrono::Duration> {
        self.max_age_seconds
            .map(|secs| chrono::Duration::seconds(secs.min(i64::MAX as u64) as i64))
    }

    pub fn failed_limit(&self) -> Option<u32> {
        self.max_failed.or(self.max_count)
    }

    fn validate(&self) -> Result<()> {
        if self.max_count.is_none() && self.max_age_seconds.is_none() {
            return Err(BackupError::invalid_spec(
                "retention policy needs max_count, max_age or both",
            ));
        }
        if self.max_count == Some(0) {
            return Err(BackupError::invalid_spec("max_count must be at least 1"));
        }
        if self.max_age_seconds == Some(0) {
            return Err(BackupError::invalid_spec("max_age must be positive"));
        }
        Ok(())
    }
}

/// Immutable descriptor of what to back up and where. Editing a definition
/// produces a new spec through [`BackupSpec::revised`]; past records keep the
/// copy they were created with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSpec {
    #[serde(default = "new_id")]
    pub id: String,

    /// Logical identity shared by every revision of this backup definition
    pub lineage: String,

    pub components: Vec<ComponentId>,

    pub storage_location: StorageLocation,

    #[serde(default)]
    pub encryption: Option<EncryptionConfig>,

    #[serde(default)]
    pub compression: Option<CompressionConfig>,

    pub retention_policy: RetentionPolicy,

    /// Cron expression; absent means manual-only
    #[serde(default)]
    pub schedule: Option<String>,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

impl BackupSpec {
    pub fn new(
        lineage: impl Into<String>,
        components: Vec<ComponentId>,
        storage_location: StorageLocation,
        retention_policy: RetentionPolicy,
    ) -> Self {
        Self {
            id: new_id(),
            lineage: lineage.into(),
            components,
            storage_location,
            encryption: None,
            compression: None,
            retention_policy,
            schedule: None,
        }
    }

    pub fn with_encryption(mut self, encryption: EncryptionConfig) -> Self {
        self.encryption = Some(encryption);
        self
    }

    pub fn with_compression(mut self, compression: CompressionConfig) -> Self {
        self.compression = Some(compression);
        self
    }

    pub fn with_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    /// A new effective spec for the same lineage, with a fresh id.
    pub fn revised(&self) -> Self {
        Self {
            id: new_id(),
            ..self.clone()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(BackupError::invalid_spec("spec id must not be empty"));
        }
        validate_key_segment("lineage", &self.lineage)?;

        if self.components.is_empty() {
            return Err(BackupError::invalid_spec("component set must not be empty"));
        }
        let mut seen = HashSet::new();
        for component in &self.components {
            validate_key_segment("component", component)?;
            if !seen.insert(component.as_str()) {
                return Err(BackupError::invalid_spec(format!(
                    "component {component} listed more than once"
                )));
            }
        }

        if self.storage_location.bucket.trim().is_empty() {
            return Err(BackupError::invalid_spec(
                "storage location needs a bucket, container or root directory",
            ));
        }
        if self.storage_location.prefix.split('/').any(|s| s == "..") {
            return Err(BackupError::invalid_spec("prefix must not contain '..'"));
        }

        if let Some(encryption) = &self.encryption {
            if encryption.key_reference.trim().is_empty() {
                return Err(BackupError::invalid_spec("encryption needs a key reference"));
            }
        }

        self.retention_policy.validate()
    }
}

fn validate_key_segment(what: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && value != "."
        && value != "..";
    if valid {
        Ok(())
    } else {
        Err(BackupError::invalid_spec(format!(
            "{what} '{value}' must be non-empty and use only [A-Za-z0-9._-]"
        )))
    }
}

/// Backend key of a snapshot: `{prefix}/{lineage}/{backup_id}.snapshot`.
/// Depends only on its inputs so catalog and backend can be reconciled.
pub fn storage_key(prefix: &str, lineage: &str, backup_id: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{lineage}/{backup_id}.{SNAPSHOT_EXTENSION}")
    } else {
        format!("{prefix}/{lineage}/{backup_id}.{SNAPSHOT_EXTENSION}")
    }
}

/// Key prefix under which every snapshot of a lineage lives.
pub fn lineage_prefix(prefix: &str, lineage: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{lineage}/")
    } else {
        format!("{prefix}/{lineage}/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupStatus {
    Pending,
    Capturing,
    Uploading,
    Committed,
    Failed,
}

impl BackupStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Committed | BackupStatus::Failed)
    }

    pub fn can_transition_to(&self, next: BackupStatus) -> bool {
        use BackupStatus::*;
        match (self, next) {
            (Pending, Capturing) | (Capturing, Uploading) | (Uploading, Committed) => true,
            (Pending | Capturing | Uploading, Failed) => true,
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "Pending",
            BackupStatus::Capturing => "Capturing",
            BackupStatus::Uploading => "Uploading",
            BackupStatus::Committed => "Committed",
            BackupStatus::Failed => "Failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Pending" => Some(BackupStatus::Pending),
            "Capturing" => Some(BackupStatus::Capturing),
            "Uploading" => Some(BackupStatus::Uploading),
            "Committed" => Some(BackupStatus::Committed),
            "Failed" => Some(BackupStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    Cancelled,
    Error,
}

/// Why a run ended in `Failed`. `message` is meant for alerts and status
/// pages; `kind` is the machine-readable classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    pub cause: FailureCause,
    pub kind: ErrorKind,
    pub message: String,
}

impl FailureReason {
    pub fn from_error(stage: &str, error: &BackupError) -> Self {
        if error.is_cancelled() {
            return Self {
                cause: FailureCause::Cancelled,
                kind: ErrorKind::Cancelled,
                message: format!("Backup was cancelled during {stage}"),
            };
        }
        Self {
            cause: FailureCause::Error,
            kind: error.kind(),
            message: format!("Backup failed during {stage}: {error}"),
        }
    }
}

/// The catalog's unit: one backup attempt and its outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub id: String,
    pub lineage: String,
    pub spec: BackupSpec,
    pub status: BackupStatus,

    /// Incremented on every status update; guards concurrent writers
    pub revision: u64,

    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub manifest_checksum: Option<String>,
    pub size_bytes: u64,
    pub storage_key: String,
    pub failure: Option<FailureReason>,
}

impl BackupRecord {
    pub fn new_pending(spec: &BackupSpec, started_at: DateTime<Utc>) -> Self {
        let id = new_id();
        let storage_key = storage_key(&spec.storage_location.prefix, &spec.lineage, &id);
        Self {
            id,
            lineage: spec.lineage.clone(),
            spec: spec.clone(),
            status: BackupStatus::Pending,
            revision: 0,
            started_at,
            completed_at: None,
            manifest_checksum: None,
            size_bytes: 0,
            storage_key,
            failure: None,
        }
    }

    /// Apply a status update in place, enforcing the transition rules.
    pub fn apply(&mut self, update: &StatusUpdate, now: DateTime<Utc>) -> Result<()> {
        if !self.status.can_transition_to(update.status) {
            return Err(BackupError::IllegalTransition {
                backup_id: self.id.clone(),
                from: self.status.to_string(),
                to: update.status.to_string(),
            });
        }

        match update.status {
            BackupStatus::Committed => {
                let checksum = update.manifest_checksum.as_ref().ok_or_else(|| {
                    BackupError::corrupt(format!(
                        "commit of {} is missing its manifest checksum",
                        self.id
                    ))
                })?;
                self.manifest_checksum = Some(checksum.clone());
                self.size_bytes = update.size_bytes.unwrap_or(self.size_bytes);
                self.failure = None;
            }
            BackupStatus::Failed => {
                self.failure = update.failure.clone();
                if let Some(checksum) = &update.manifest_checksum {
                    self.manifest_checksum = Some(checksum.clone());
                }
            }
            _ => {
                if let Some(checksum) = &update.manifest_checksum {
                    self.manifest_checksum = Some(checksum.clone());
                }
                if let Some(size) = update.size_bytes {
                    self.size_bytes = size;
                }
            }
        }

        self.status = update.status;
        if self.status.is_terminal() {
            self.completed_at = Some(now);
        }
        self.revision += 1;
        Ok(())
    }
}

/// One atomic change to a record: status, checksum and size travel together.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub status: BackupStatus,
    pub manifest_checksum: Option<String>,
    pub size_bytes: Option<u64>,
    pub failure: Option<FailureReason>,
}

impl StatusUpdate {
    pub fn to(status: BackupStatus) -> Self {
        Self {
            status,
            manifest_checksum: None,
            size_bytes: None,
            failure: None,
        }
    }

    pub fn uploading(manifest_checksum: String, size_bytes: u64) -> Self {
        Self {
            status: BackupStatus::Uploading,
            manifest_checksum: Some(manifest_checksum),
            size_bytes: Some(size_bytes),
            failure: None,
        }
    }

    pub fn committed(manifest_checksum: String, size_bytes: u64) -> Self {
        Self {
            status: BackupStatus::Committed,
            manifest_checksum: Some(manifest_checksum),
            size_bytes: Some(size_bytes),
            failure: None,
        }
    }

    pub fn failed(reason: FailureReason) -> Self {
        Self {
            status: BackupStatus::Failed,
            manifest_checksum: None,
            size_bytes: None,
            failure: Some(reason),
        }
    }
}
