//! Contracts for the per-component data export and import collaborators,
//! plus a directory-backed implementation of both.

use super::{sha256_hex, BackupError, Result};
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

pub type ComponentReader = Box<dyn AsyncRead + Send + Unpin>;

/// A serialized snapshot of one component's persistent state.
pub struct ComponentExport {
    pub reader: ComponentReader,

    /// SHA-256 the exporter declares for the streamed bytes
    pub checksum: String,
}

impl std::fmt::Debug for ComponentExport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentExport")
            .field("checksum", &self.checksum)
            .finish_non_exhaustive()
    }
}

impl ComponentExport {
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let checksum = sha256_hex(&data);
        Self {
            reader: Box::new(std::io::Cursor::new(data)),
            checksum,
        }
    }
}

#[async_trait]
pub trait ComponentExporter: Send + Sync + std::fmt::Debug {
    /// Stream the component's state. Implementations should give up by `deadline`.
    async fn export(&self, component: &str, deadline: Instant) -> Result<ComponentExport>;
}

#[async_trait]
pub trait ComponentImporter: Send + Sync + std::fmt::Debug {
    /// Restore the component from `reader`, verifying `expected_checksum`
    /// before anything is committed.
    async fn import(
        &self,
        component: &str,
        reader: ComponentReader,
        expected_checksum: &str,
    ) -> Result<()>;
}

/// Component state kept as `{root}/{component}.dat`. Import writes through a
/// temp file and renames, so a failed import leaves the previous state.
#[derive(Debug, Clone)]
pub struct FsComponentStore {
    root: PathBuf,
}

impl FsComponentStore {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn data_path(&self, component: &str) -> PathBuf {
        self.root.join(format!("{component}.dat"))
    }
}

#[async_trait]
impl ComponentExporter for FsComponentStore {
    async fn export(&self, component: &str, _deadline: Instant) -> Result<ComponentExport> {
        let path = self.data_path(component);
        let data = fs::read(&path).await.map_err(|e| BackupError::Component {
            component: component.to_string(),
            message: if e.kind() == IoErrorKind::NotFound {
                format!("no data at {}", path.display())
            } else {
                e.to_string()
            },
        })?;
        debug!(component, bytes = data.len(), "Exported component data");
        Ok(ComponentExport::from_bytes(data))
    }
}

#[async_trait]
impl ComponentImporter for FsComponentStore {
    async fn import(
        &self,
        component: &str,
        mut reader: ComponentReader,
        expected_checksum: &str,
    ) -> Result<()> {
        let mut data = Vec::new();
        reader.read_to_end(&mut data).await?;

        let actual = sha256_hex(&data);
        if actual != expected_checksum {
            return Err(BackupError::corrupt(format!(
                "component {component}: expected checksum {expected_checksum}, got {actual}"
            )));
        }

        fs::create_dir_all(&self.root).await?;
        let target = self.data_path(component);
        let temp = self
            .root
            .join(format!(".{component}.import-{}", Uuid::new_v4()));

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&data).await?;
        file.sync_all().await?;
        drop(file);
        if let Err(e) = fs::rename(&temp, &target).await {
            let _ = fs::remove_file(&temp).await;
            return Err(e.into());
        }

        info!(component, bytes = data.len(), "Imported component data");
        Ok(())
    }
}
