//! Backends that hold snapshot objects.

pub mod filesystem;
pub mod object_store;
pub mod retry;

pub use filesystem::FilesystemProvider;
pub use object_store::ObjectStoreProvider;
pub use retry::{RetryConfig, RetryPolicy};

use super::{sha256_hex, ProviderKind, Result, StorageLocation};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Uniform access to one backend.
///
/// `upload` is atomic (readers see the whole object or nothing) and
/// idempotent: re-uploading identical bytes succeeds, different bytes under an
/// existing key fail with `KeyConflict`. `delete` of a missing key succeeds.
#[async_trait]
pub trait StorageProvider: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &str;

    async fn upload(&self, key: &str, data: &[u8]) -> Result<()>;

    async fn download(&self, key: &str) -> Result<Vec<u8>>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Keys under `prefix`, in lexicographic order.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// SHA-256 of the stored object.
    async fn checksum(&self, key: &str) -> Result<String> {
        let data = self.download(key).await?;
        Ok(sha256_hex(&data))
    }
}

/// Maps a storage location to the provider that serves it.
pub trait StorageResolver: Send + Sync + std::fmt::Debug {
    fn provider_for(&self, location: &StorageLocation) -> Result<Arc<dyn StorageProvider>>;
}

/// Builds real providers from a location and caches them by location.
#[derive(Debug, Default)]
pub struct DefaultStorageResolver {
    retry: RetryConfig,
    cache: Mutex<HashMap<String, Arc<dyn StorageProvider>>>,
}

impl DefaultStorageResolver {
    pub fn new(retry: RetryConfig) -> Self {
        Self {
            retry,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn cache_key(location: &StorageLocation) -> String {
        let mut config: Vec<_> = location.backend_config.iter().collect();
        config.sort();
        format!("{}|{}|{:?}", location.provider, location.bucket, config)
    }
}

impl StorageResolver for DefaultStorageResolver {
    fn provider_for(&self, location: &StorageLocation) -> Result<Arc<dyn StorageProvider>> {
        let key = Self::cache_key(location);
        if let Ok(cache) = self.cache.lock() {
            if let Some(provider) = cache.get(&key) {
                return Ok(provider.clone());
            }
        }

        debug!(
            "Creating {} provider for bucket {}",
            location.provider, location.bucket
        );
        let provider = provider_for(location, &self.retry)?;
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, provider.clone());
        }
        Ok(provider)
    }
}

/// Serves every location from one provider. Used by tests and by single
/// backend deployments.
#[derive(Debug, Clone)]
pub struct FixedStorageResolver {
    provider: Arc<dyn StorageProvider>,
}

impl FixedStorageResolver {
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self { provider }
    }
}

impl StorageResolver for FixedStorageResolver {
    fn provider_for(&self, _location: &StorageLocation) -> Result<Arc<dyn StorageProvider>> {
        Ok(self.provider.clone())
    }
}

/// Construct the provider for a location.
pub fn provider_for(
    location: &StorageLocation,
    retry: &RetryConfig,
) -> Result<Arc<dyn StorageProvider>> {
    let provider: Arc<dyn StorageProvider> = match location.provider {
        ProviderKind::S3 => Arc::new(ObjectStoreProvider::s3(location, retry.clone())?),
        ProviderKind::Gcs => Arc::new(ObjectStoreProvider::gcs(location, retry.clone())?),
        ProviderKind::AzureBlob => {
            Arc::new(ObjectStoreProvider::azure_blob(location, retry.clone())?)
        }
        ProviderKind::Filesystem => {
            Arc::new(FilesystemProvider::new(&location.bucket, retry.clone()))
        }
    };
    Ok(provider)
}
