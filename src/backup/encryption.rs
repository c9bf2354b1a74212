//! Symmetric encryption of snapshot bundles.
//!
//! Envelope layout: `OBSE | version | key fingerprint (4) | nonce (12) | ciphertext+tag`.
//! The first nine bytes are authenticated as associated data, so a swapped
//! fingerprint or version is rejected just like a tampered ciphertext.

use super::{BackupError, EncryptionAlgorithm, EncryptionConfig, Result};
use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

const ENVELOPE_MAGIC: &[u8; 4] = b"OBSE";
const ENVELOPE_VERSION: u8 = 1;
const FINGERPRINT_LEN: usize = 4;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const HEADER_LEN: usize = 4 + 1 + FINGERPRINT_LEN;

pub trait EncryptionCodec: Send + Sync + std::fmt::Debug {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn name(&self) -> &'static str;
}

/// Identity codec for specs without an encryption block.
#[derive(Debug, Default, Clone)]
pub struct NoopCodec;

impl EncryptionCodec for NoopCodec {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn name(&self) -> &'static str {
        "none"
    }
}

pub struct AesGcmCodec {
    cipher: Aes256Gcm,
    fingerprint: [u8; FINGERPRINT_LEN],
}

impl std::fmt::Debug for AesGcmCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmCodec")
            .field("fingerprint", &hex::encode(self.fingerprint))
            .finish()
    }
}

impl AesGcmCodec {
    /// Keys that are not exactly 32 bytes are stretched with SHA-256.
    pub fn new(key_material: &[u8]) -> Result<Self> {
        if key_material.is_empty() {
            return Err(BackupError::configuration("encryption key is empty"));
        }
        let mut key = [0u8; 32];
        if key_material.len() == 32 {
            key.copy_from_slice(key_material);
        } else {
            key.copy_from_slice(&Sha256::digest(key_material));
        }

        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| BackupError::configuration(format!("invalid AES-256 key: {e}")))?;

        let digest = Sha256::digest(key);
        let mut fingerprint = [0u8; FINGERPRINT_LEN];
        fingerprint.copy_from_slice(&digest[..FINGERPRINT_LEN]);

        Ok(Self {
            cipher,
            fingerprint,
        })
    }

    pub fn fingerprint(&self) -> String {
        hex::encode(self.fingerprint)
    }

    fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[..4].copy_from_slice(ENVELOPE_MAGIC);
        header[4] = ENVELOPE_VERSION;
        header[5..].copy_from_slice(&self.fingerprint);
        header
    }
}

impl EncryptionCodec for AesGcmCodec {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let header = self.header();
        let ciphertext = self
            .cipher
            .encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &header,
                },
            )
            .map_err(|e| BackupError::Component {
                component: "encryption".to_string(),
                message: format!("AES-GCM encrypt: {e}"),
            })?;

        let mut out = Vec::with_capacity(HEADER_LEN + NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&header);
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < HEADER_LEN + NONCE_LEN + TAG_LEN || &data[..4] != ENVELOPE_MAGIC {
            return Err(BackupError::DecryptionFailed {
                message: "object is not an encrypted snapshot envelope".to_string(),
            });
        }
        if data[4] != ENVELOPE_VERSION {
            return Err(BackupError::DecryptionFailed {
                message: format!("unsupported envelope version {}", data[4]),
            });
        }
        if data[5..HEADER_LEN] != self.fingerprint {
            return Err(BackupError::DecryptionFailed {
                message: format!(
                    "snapshot was sealed with key {}, configured key is {}",
                    hex::encode(&data[5..HEADER_LEN]),
                    self.fingerprint()
                ),
            });
        }

        let (header, rest) = data.split_at(HEADER_LEN);
        let (nonce_bytes, ciphertext) = rest.split_at(NONCE_LEN);
        self.cipher
            .decrypt(
                Nonce::from_slice(nonce_bytes),
                Payload {
                    msg: ciphertext,
                    aad: header,
                },
            )
            .map_err(|_| BackupError::DecryptionFailed {
                message: "authentication tag mismatch".to_string(),
            })
    }

    fn name(&self) -> &'static str {
        "aes-256-gcm"
    }
}

/// Turns a key reference into key material.
#[async_trait]
pub trait KeyResolver: Send + Sync + std::fmt::Debug {
    async fn resolve(&self, key_reference: &str) -> Result<Vec<u8>>;
}

/// Resolves `env:NAME` from the process environment and `file:name` from a
/// key directory. A bare reference is treated as `file:`.
#[derive(Debug, Clone, Default)]
pub struct DefaultKeyResolver {
    key_dir: Option<PathBuf>,
}

impl DefaultKeyResolver {
    pub fn new(key_dir: Option<PathBuf>) -> Self {
        Self { key_dir }
    }
}

#[async_trait]
impl KeyResolver for DefaultKeyResolver {
    async fn resolve(&self, key_reference: &str) -> Result<Vec<u8>> {
        if let Some(name) = key_reference.strip_prefix("env:") {
            return std::env::var(name)
                .map(String::into_bytes)
                .map_err(|_| {
                    BackupError::configuration(format!("key variable {name} is not set"))
                });
        }

        let name = key_reference.strip_prefix("file:").unwrap_or(key_reference);
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(BackupError::configuration(format!(
                "invalid key file name '{name}'"
            )));
        }
        let dir = self.key_dir.as_ref().ok_or_else(|| {
            BackupError::configuration("no key directory configured for file key references")
        })?;
        let path = dir.join(name);
        debug!("Loading encryption key from {}", path.display());

        let mut material = tokio::fs::read(&path).await.map_err(|e| {
            BackupError::configuration(format!("cannot read key {}: {e}", path.display()))
        })?;
        while material.last().is_some_and(|b| b.is_ascii_whitespace()) {
            material.pop();
        }
        Ok(material)
    }
}

/// Fixed set of keys, mainly for tests and embedded use.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyResolver {
    keys: HashMap<String, Vec<u8>>,
}

impl StaticKeyResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, reference: impl Into<String>, material: impl Into<Vec<u8>>) -> Self {
        self.keys.insert(reference.into(), material.into());
        self
    }
}

#[async_trait]
impl KeyResolver for StaticKeyResolver {
    async fn resolve(&self, key_reference: &str) -> Result<Vec<u8>> {
        self.keys
            .get(key_reference)
            .cloned()
            .ok_or_else(|| BackupError::configuration(format!("unknown key {key_reference}")))
    }
}

/// Builds the codec a spec's encryption block asks for.
pub async fn codec_for(
    encryption: Option<&EncryptionConfig>,
    resolver: &dyn KeyResolver,
) -> Result<Arc<dyn EncryptionCodec>> {
    match encryption {
        None => Ok(Arc::new(NoopCodec)),
        Some(config) => match config.algorithm {
            EncryptionAlgorithm::Aes256Gcm => {
                let material = resolver.resolve(&config.key_reference).await?;
                Ok(Arc::new(AesGcmCodec::new(&material)?))
            }
        },
    }
}
