use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Transient storage error: {message}")]
    Transient { message: String },

    #[error("Key conflict: {key} already holds different content")]
    KeyConflict { key: String },

    #[error("Decryption failed: {message}")]
    DecryptionFailed { message: String },

    #[error("Component {component} is missing from backup {backup_id}")]
    ComponentMissingFromBackup { backup_id: String, component: String },

    #[error("Timeout error: {operation} timed out after {seconds} seconds")]
    Timeout { operation: String, seconds: u64 },

    #[error("Operation cancelled: {operation}")]
    Cancelled { operation: String },

    #[error("Invalid backup spec: {message}")]
    InvalidSpec { message: String },

    #[error("Backup {backup_id} is not restorable in status {status}")]
    NotRestorable { backup_id: String, status: String },

    #[error("Corrupt backup: {message}")]
    Corrupt { message: String },

    #[error("Illegal status transition for {backup_id}: {from} -> {to}")]
    IllegalTransition {
        backup_id: String,
        from: String,
        to: String,
    },

    #[error("Revision conflict for {backup_id}: expected {expected}, found {actual}")]
    RevisionConflict {
        backup_id: String,
        expected: u64,
        actual: u64,
    },

    #[error("Lineage {lineage} already has a run in flight (held by {holder})")]
    LineageBusy { lineage: String, holder: String },

    #[error("Backup record not found: {backup_id}")]
    RecordNotFound { backup_id: String },

    #[error("Component {component} failed: {message}")]
    Component { component: String, message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Stable classification of a [`BackupError`], used for metrics labels and
/// for the failure reason stored on a `Failed` record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Transient,
    KeyConflict,
    DecryptionFailed,
    ComponentMissingFromBackup,
    Timeout,
    Cancelled,
    InvalidSpec,
    NotRestorable,
    Corrupt,
    IllegalTransition,
    RevisionConflict,
    LineageBusy,
    Component,
    Configuration,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "not_found",
            ErrorKind::Transient => "transient",
            ErrorKind::KeyConflict => "key_conflict",
            ErrorKind::DecryptionFailed => "decryption_failed",
            ErrorKind::ComponentMissingFromBackup => "component_missing_from_backup",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::InvalidSpec => "invalid_spec",
            ErrorKind::NotRestorable => "not_restorable",
            ErrorKind::Corrupt => "corrupt",
            ErrorKind::IllegalTransition => "illegal_transition",
            ErrorKind::RevisionConflict => "revision_conflict",
            ErrorKind::LineageBusy => "lineage_busy",
            ErrorKind::Component => "component",
            ErrorKind::Configuration => "configuration",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl BackupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BackupError::NotFound { .. } | BackupError::RecordNotFound { .. } => {
                ErrorKind::NotFound
            }
            BackupError::Transient { .. } => ErrorKind::Transient,
            BackupError::KeyConflict { .. } => ErrorKind::KeyConflict,
            BackupError::DecryptionFailed { .. } => ErrorKind::DecryptionFailed,
            BackupError::ComponentMissingFromBackup { .. } => {
                ErrorKind::ComponentMissingFromBackup
            }
            BackupError::Timeout { .. } => ErrorKind::Timeout,
            BackupError::Cancelled { .. } => ErrorKind::Cancelled,
            BackupError::InvalidSpec { .. } => ErrorKind::InvalidSpec,
            BackupError::NotRestorable { .. } => ErrorKind::NotRestorable,
            BackupError::Corrupt { .. } => ErrorKind::Corrupt,
            BackupError::IllegalTransition { .. } => ErrorKind::IllegalTransition,
            BackupError::RevisionConflict { .. } => ErrorKind::RevisionConflict,
            BackupError::LineageBusy { .. } => ErrorKind::LineageBusy,
            BackupError::Component { .. } => ErrorKind::Component,
            BackupError::Configuration { .. } => ErrorKind::Configuration,
            BackupError::Io(_) => ErrorKind::Transient,
            BackupError::Serialization(_) => ErrorKind::Corrupt,
            BackupError::Database(_) => ErrorKind::Internal,
        }
    }

    /// Only transient and timeout failures are worth retrying with the same inputs.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transient | ErrorKind::Timeout)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, BackupError::Cancelled { .. })
    }

    pub(crate) fn transient(message: impl Into<String>) -> Self {
        BackupError::Transient {
            message: message.into(),
        }
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        BackupError::Corrupt {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_spec(message: impl Into<String>) -> Self {
        BackupError::InvalidSpec {
            message: message.into(),
        }
    }

    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        BackupError::Configuration {
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
