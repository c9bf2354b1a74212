pub mod application;
pub mod backup;
pub mod config;

pub use config::Config;

// Re-export the core backup types for convenience
pub use backup::{
    BackupError, BackupMetrics, BackupOrchestrator, BackupRecord, BackupScheduler, BackupSpec,
    BackupStatus, CatalogStore, RestoreOrchestrator, RetentionPolicy, StorageLocation,
    StorageProvider,
};
