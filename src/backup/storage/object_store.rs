use super::retry::{transient, RetryConfig, RetryPolicy};
use super::StorageProvider;
use crate::backup::{BackupError, Result, StorageLocation};
use async_trait::async_trait;
use opendal::Operator;
use tracing::debug;

/// S3, GCS and Azure Blob access through one opendal operator. Failures
/// opendal marks as temporary are retried by the provider's own policy;
/// whatever is left after that surfaces as `Transient` (or `NotFound`).
#[derive(Debug, Clone)]
pub struct ObjectStoreProvider {
    name: &'static str,
    op: Operator,
    retry: RetryPolicy,
}

impl ObjectStoreProvider {
    /// AWS S3 or an S3-compatible endpoint (MinIO, Ceph).
    pub fn s3(location: &StorageLocation, retry: RetryConfig) -> Result<Self> {
        let mut builder = opendal::services::S3::default()
            .bucket(&location.bucket)
            .region(location.config_value("region").unwrap_or("us-east-1"))
            .root("/");
        if let Some(endpoint) = location.config_value("endpoint") {
            builder = builder.endpoint(endpoint);
        }
        if let Some(key_id) = location.config_value("access_key_id") {
            builder = builder.access_key_id(key_id);
        }
        if let Some(secret) = location.config_value("secret_access_key") {
            builder = builder.secret_access_key(secret);
        }
        let op = Operator::new(builder)
            .map_err(|e| init_error("s3", e))?
            .finish();
        Ok(Self::from_operator("s3", op, retry))
    }

    pub fn gcs(location: &StorageLocation, retry: RetryConfig) -> Result<Self> {
        let mut builder = opendal::services::Gcs::default()
            .bucket(&location.bucket)
            .root("/");
        if let Some(endpoint) = location.config_value("endpoint") {
            builder = builder.endpoint(endpoint);
        }
        if let Some(credential) = location.config_value("credential") {
            builder = builder.credential(credential);
        }
        if let Some(path) = location.config_value("credential_path") {
            builder = builder.credential_path(path);
        }
        let op = Operator::new(builder)
            .map_err(|e| init_error("gcs", e))?
            .finish();
        Ok(Self::from_operator("gcs", op, retry))
    }

    pub fn azure_blob(location: &StorageLocation, retry: RetryConfig) -> Result<Self> {
        let account_name = location.config_value("account_name");
        let endpoint = match (location.config_value("endpoint"), account_name) {
            (Some(endpoint), _) => endpoint.to_string(),
            (None, Some(account)) => format!("https://{account}.blob.core.windows.net"),
            (None, None) => {
                return Err(BackupError::configuration(
                    "azure blob storage needs an endpoint or account_name",
                ))
            }
        };

        let mut builder = opendal::services::Azblob::default()
            .container(&location.bucket)
            .endpoint(&endpoint)
            .root("/");
        if let Some(account) = account_name {
            builder = builder.account_name(account);
        }
        if let Some(key) = location.config_value("account_key") {
            builder = builder.account_key(key);
        }
        let op = Operator::new(builder)
            .map_err(|e| init_error("azure-blob", e))?
            .finish();
        Ok(Self::from_operator("azure-blob", op, retry))
    }

    /// Process-local store, used in tests.
    pub fn memory() -> Result<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| init_error("memory", e))?
            .finish();
        Ok(Self::from_operator("memory", op, RetryConfig::none()))
    }

    pub fn from_operator(name: &'static str, op: Operator, retry: RetryConfig) -> Self {
        Self {
            name,
            op,
            retry: RetryPolicy::new(retry),
        }
    }

    async fn read_once(&self, key: &str) -> opendal::Result<Vec<u8>> {
        self.op.read(key).await.map(|buf| buf.to_vec())
    }

    /// Conditional create where the backend has it. Elsewhere the caller has
    /// already checked the key is free.
    async fn write_once(
        &self,
        key: &str,
        data: &[u8],
        conditional: bool,
    ) -> opendal::Result<()> {
        let write = self.op.write_with(key, data.to_vec());
        if conditional {
            write.if_not_exists(true).await.map(|_| ())
        } else {
            write.await.map(|_| ())
        }
    }
}

fn init_error(backend: &str, e: opendal::Error) -> BackupError {
    BackupError::configuration(format!("opendal {backend} init: {e}"))
}

/// Anything but a missing key is transient to callers, permission and
/// network failures alike; opendal's own `is_temporary` only drives the
/// in-provider retries.
fn map_error(operation: &str, key: &str, e: opendal::Error) -> BackupError {
    match e.kind() {
        opendal::ErrorKind::NotFound => BackupError::NotFound {
            key: key.to_string(),
        },
        _ => transient(operation, key, e),
    }
}

fn same_or_conflict(key: &str, existing: &[u8], data: &[u8]) -> Result<()> {
    if existing == data {
        debug!(key, "Object already present with identical content");
        Ok(())
    } else {
        Err(BackupError::KeyConflict {
            key: key.to_string(),
        })
    }
}

#[async_trait]
impl StorageProvider for ObjectStoreProvider {
    fn name(&self) -> &str {
        self.name
    }

    async fn upload(&self, key: &str, data: &[u8]) -> Result<()> {
        let conditional = self.op.info().full_capability().write_with_if_not_exists;
        if !conditional {
            match self.download(key).await {
                Ok(existing) => return same_or_conflict(key, &existing, data),
                Err(BackupError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        let written = self
            .retry
            .execute_when("upload", opendal::Error::is_temporary, || {
                self.write_once(key, data, conditional)
            })
            .await;
        match written {
            Ok(()) => {
                debug!(key, bytes = data.len(), backend = self.name, "Wrote object");
                Ok(())
            }
            // Someone else created the key first
            Err(e) if e.kind() == opendal::ErrorKind::ConditionNotMatch => {
                let existing = self.download(key).await?;
                same_or_conflict(key, &existing, data)
            }
            Err(e) => Err(map_error("upload", key, e)),
        }
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        self.retry
            .execute_when("download", opendal::Error::is_temporary, || {
                self.read_once(key)
            })
            .await
            .map_err(|e| map_error("download", key, e))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.retry
            .execute_when("delete", opendal::Error::is_temporary, || async move {
                match self.op.delete(key).await {
                    Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
                    other => other,
                }
            })
            .await
            .map_err(|e| map_error("delete", key, e))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        // opendal lists directories, so list the parent and filter
        let dir = match prefix.rfind('/') {
            Some(idx) => &prefix[..=idx],
            None => "",
        };

        let entries = self
            .retry
            .execute_when("list", opendal::Error::is_temporary, || async move {
                match self.op.list_with(dir).recursive(true).await {
                    Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(Vec::new()),
                    other => other,
                }
            })
            .await
            .map_err(|e| map_error("list", prefix, e))?;

        let mut keys: Vec<String> = entries
            .into_iter()
            .map(|entry| entry.path().trim_start_matches('/').to_string())
            .filter(|path| !path.ends_with('/') && path.starts_with(prefix))
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.retry
            .execute_when("exists", opendal::Error::is_temporary, || async move {
                match self.op.stat(key).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(false),
                    Err(e) => Err(e),
                }
            })
            .await
            .map_err(|e| map_error("exists", key, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_upload_semantics() {
        let provider = ObjectStoreProvider::memory().unwrap();

        provider.upload("prod/n/1.snapshot", b"one").await.unwrap();
        provider.upload("prod/n/1.snapshot", b"one").await.unwrap();
        assert!(matches!(
            provider.upload("prod/n/1.snapshot", b"two").await,
            Err(BackupError::KeyConflict { .. })
        ));
        assert_eq!(provider.download("prod/n/1.snapshot").await.unwrap(), b"one");
        assert_eq!(
            provider.checksum("prod/n/1.snapshot").await.unwrap(),
            crate::backup::sha256_hex(b"one")
        );
    }

    #[tokio::test]
    async fn test_memory_store_listing_and_delete() {
        let provider = ObjectStoreProvider::memory().unwrap();
        provider.upload("prod/n/2.snapshot", b"2").await.unwrap();
        provider.upload("prod/n/1.snapshot", b"1").await.unwrap();
        provider.upload("prod/w/3.snapshot", b"3").await.unwrap();

        assert_eq!(
            provider.list("prod/n/").await.unwrap(),
            vec!["prod/n/1.snapshot", "prod/n/2.snapshot"]
        );

        provider.delete("prod/n/1.snapshot").await.unwrap();
        provider.delete("prod/n/1.snapshot").await.unwrap();
        assert!(!provider.exists("prod/n/1.snapshot").await.unwrap());
        assert!(matches!(
            provider.download("prod/n/1.snapshot").await,
            Err(BackupError::NotFound { .. })
        ));
    }

    #[test]
    fn test_backend_errors_map_to_transient_or_not_found() {
        let missing = map_error(
            "download",
            "k",
            opendal::Error::new(opendal::ErrorKind::NotFound, "no such key"),
        );
        assert!(matches!(missing, BackupError::NotFound { ref key } if key == "k"));

        for kind in [
            opendal::ErrorKind::PermissionDenied,
            opendal::ErrorKind::RateLimited,
            opendal::ErrorKind::Unexpected,
        ] {
            let error = map_error("download", "k", opendal::Error::new(kind, "backend said no"));
            assert!(matches!(error, BackupError::Transient { .. }), "{kind:?}");
            assert!(error.is_retryable());
        }

        let flaky = opendal::Error::new(opendal::ErrorKind::Unexpected, "reset").set_temporary();
        assert!(flaky.is_temporary());
        assert!(matches!(
            map_error("list", "prod/", flaky),
            BackupError::Transient { .. }
        ));
    }

    #[test]
    fn test_azure_requires_account_or_endpoint() {
        let location = StorageLocation::new(
            crate::backup::ProviderKind::AzureBlob,
            "backups",
            "",
        );
        assert!(ObjectStoreProvider::azure_blob(&location, RetryConfig::none()).is_err());
    }
}
