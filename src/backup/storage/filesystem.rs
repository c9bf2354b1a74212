use super::retry::{RetryConfig, RetryPolicy};
use super::StorageProvider;
use crate::backup::{BackupError, Result};
use async_trait::async_trait;
use std::io::ErrorKind as IoErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

const TEMP_MARKER: &str = ".partial-";

/// Snapshot objects as files under a root directory. Writes go to a temp file
/// in the target directory and are hard-linked into place once synced, so an
/// existing object is never replaced. I/O failures (NFS hiccups, full disks
/// being cleaned up) are retried by the provider's own policy.
#[derive(Debug, Clone)]
pub struct FilesystemProvider {
    root: PathBuf,
    retry: RetryPolicy,
}

impl FilesystemProvider {
    pub fn new(root: impl AsRef<Path>, retry: RetryConfig) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            retry: RetryPolicy::new(retry),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let relative = Path::new(key);
        let escapes = key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)));
        if escapes {
            return Err(BackupError::invalid_spec(format!(
                "storage key '{key}' is not a relative path inside the backend root"
            )));
        }
        Ok(self.root.join(relative))
    }

    fn key_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(parts.join("/"))
    }

    /// Publish `data` at `path` unless something is already there. Returns
    /// false when the path was taken.
    async fn write_exclusive(&self, path: &Path, data: &[u8]) -> Result<bool> {
        let parent = path
            .parent()
            .ok_or_else(|| BackupError::invalid_spec("storage key has no parent directory"))?;
        fs::create_dir_all(parent).await?;

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp_path = parent.join(format!(".{file_name}{TEMP_MARKER}{}", Uuid::new_v4()));

        let write = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::hard_link(&temp_path, path).await
        };
        let linked = write.await;

        if let Err(cleanup) = fs::remove_file(&temp_path).await {
            if cleanup.kind() != IoErrorKind::NotFound {
                warn!("Failed to remove temp file {}: {}", temp_path.display(), cleanup);
            }
        }
        match linked {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn upload_once(&self, key: &str, path: &Path, data: &[u8]) -> Result<()> {
        if self.write_exclusive(path, data).await? {
            debug!(key, bytes = data.len(), "Wrote object");
            return Ok(());
        }

        let existing = fs::read(path).await?;
        if existing == data {
            debug!(key, "Object already present with identical content");
            Ok(())
        } else {
            Err(BackupError::KeyConflict {
                key: key.to_string(),
            })
        }
    }

    async fn list_once(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pending = vec![self.root.clone()];

        while let Some(dir) = pending.pop() {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == IoErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            };
            while let Some(entry) = entries.next_entry().await? {
                let path = entry.path();
                if entry.file_type().await?.is_dir() {
                    pending.push(path);
                    continue;
                }
                if path
                    .file_name()
                    .is_some_and(|n| n.to_string_lossy().contains(TEMP_MARKER))
                {
                    continue;
                }
                if let Some(key) = self.key_for(&path) {
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }

        keys.sort();
        Ok(keys)
    }
}

#[async_trait]
impl StorageProvider for FilesystemProvider {
    fn name(&self) -> &str {
        "filesystem"
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = &self.resolve(key)?;
        self.retry
            .execute("upload", || self.upload_once(key, path, data))
            .await
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let path = &self.resolve(key)?;
        self.retry
            .execute("download", || async move {
                match fs::read(path).await {
                    Ok(data) => Ok(data),
                    Err(e) if e.kind() == IoErrorKind::NotFound => Err(BackupError::NotFound {
                        key: key.to_string(),
                    }),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = &self.resolve(key)?;
        self.retry
            .execute("delete", || async move {
                match fs::remove_file(path).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == IoErrorKind::NotFound => Ok(()),
                    Err(e) => Err(e.into()),
                }
            })
            .await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.retry
            .execute("list", || self.list_once(prefix))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let path = &self.resolve(key)?;
        self.retry
            .execute("exists", || async move { Ok(fs::try_exists(path).await?) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_upload_download_and_idempotence() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemProvider::new(dir.path(), RetryConfig::none());

        provider.upload("prod/nightly/a.snapshot", b"bundle").await.unwrap();
        provider.upload("prod/nightly/a.snapshot", b"bundle").await.unwrap();
        assert_eq!(
            provider.download("prod/nightly/a.snapshot").await.unwrap(),
            b"bundle"
        );

        let conflict = provider.upload("prod/nightly/a.snapshot", b"other").await;
        assert!(matches!(conflict, Err(BackupError::KeyConflict { .. })));
        assert_eq!(
            provider.download("prod/nightly/a.snapshot").await.unwrap(),
            b"bundle"
        );
    }

    #[tokio::test]
    async fn test_missing_and_delete() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemProvider::new(dir.path(), RetryConfig::none());

        assert!(matches!(
            provider.download("nope.snapshot").await,
            Err(BackupError::NotFound { .. })
        ));
        provider.delete("nope.snapshot").await.unwrap();

        provider.upload("x/1.snapshot", b"1").await.unwrap();
        assert!(provider.exists("x/1.snapshot").await.unwrap());
        provider.delete("x/1.snapshot").await.unwrap();
        assert!(!provider.exists("x/1.snapshot").await.unwrap());
    }

    #[tokio::test]
    async fn test_list_by_prefix_skips_partial_files() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemProvider::new(dir.path(), RetryConfig::none());

        provider.upload("prod/nightly/b.snapshot", b"b").await.unwrap();
        provider.upload("prod/nightly/a.snapshot", b"a").await.unwrap();
        provider.upload("prod/weekly/c.snapshot", b"c").await.unwrap();
        tokio::fs::write(
            dir.path().join("prod/nightly/.d.snapshot.partial-123"),
            b"half",
        )
        .await
        .unwrap();

        let keys = provider.list("prod/nightly/").await.unwrap();
        assert_eq!(keys, vec!["prod/nightly/a.snapshot", "prod/nightly/b.snapshot"]);
    }

    #[tokio::test]
    async fn test_concurrent_uploads_never_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let provider = std::sync::Arc::new(FilesystemProvider::new(
            dir.path(),
            RetryConfig::none(),
        ));

        let mut tasks = Vec::new();
        for i in 0..8u8 {
            let provider = provider.clone();
            tasks.push(tokio::spawn(async move {
                provider.upload("prod/nightly/race.snapshot", &[i; 64]).await
            }));
        }
        let mut stored = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(()) => stored += 1,
                Err(BackupError::KeyConflict { .. }) => {}
                Err(e) => panic!("unexpected upload error: {e}"),
            }
        }
        assert_eq!(stored, 1);

        let data = provider.download("prod/nightly/race.snapshot").await.unwrap();
        assert_eq!(data.len(), 64);
        assert!(data.iter().all(|b| *b == data[0]));
        assert_eq!(
            provider.list("prod/nightly/").await.unwrap(),
            vec!["prod/nightly/race.snapshot"]
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn test_transient_io_errors_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemProvider::new(
            dir.path(),
            RetryConfig {
                max_attempts: 3,
                initial_delay: std::time::Duration::from_millis(5),
                jitter: false,
                ..RetryConfig::default()
            },
        );
        // A directory where the object should be makes every read fail with
        // a non-NotFound I/O error
        tokio::fs::create_dir_all(dir.path().join("prod/nightly/a.snapshot"))
            .await
            .unwrap();

        let result = provider.download("prod/nightly/a.snapshot").await;
        assert!(matches!(result, Err(BackupError::Io(_))));
        assert!(result.unwrap_err().is_retryable());
        assert!(logs_contain("all 3 attempts exhausted"));
    }

    #[tokio::test]
    async fn test_keys_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FilesystemProvider::new(dir.path(), RetryConfig::none());

        assert!(provider.upload("../outside.snapshot", b"x").await.is_err());
        assert!(provider.download("/etc/passwd").await.is_err());
    }
}
