use super::{BackupError, ComponentId, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Leading bytes of every snapshot bundle.
pub const BUNDLE_MAGIC: &[u8; 4] = b"OBSB";

pub const BUNDLE_FORMAT_VERSION: u8 = 1;

/// magic + version + u32 manifest length
const HEADER_LEN: usize = 4 + 1 + 4;

/// Hex-encoded SHA-256, the checksum used for bundles and component payloads.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub component_id: ComponentId,
    pub captured_at: DateTime<Utc>,

    /// Byte offset of this component's payload within the bundle payload
    pub offset: u64,
    pub length: u64,

    /// SHA-256 of the component payload
    pub checksum: String,
}

impl ManifestEntry {
    fn end(&self) -> u64 {
        self.offset.saturating_add(self.length)
    }
}

/// Index of a snapshot: one entry per component, sorted by component id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u8,
    pub backup_id: String,
    pub lineage: String,
    pub spec_id: String,
    pub created_at: DateTime<Utc>,
    pub entries: Vec<ManifestEntry>,
}

impl Manifest {
    pub fn entry(&self, component: &str) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.component_id.as_str().cmp(component))
            .ok()
            .map(|idx| &self.entries[idx])
    }

    pub fn component_ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.component_id.as_str())
    }

    /// Checks ordering, uniqueness, bounds and non-overlap of entries.
    pub fn validate(&self, payload_len: u64) -> Result<()> {
        if self.format_version != BUNDLE_FORMAT_VERSION {
            return Err(BackupError::corrupt(format!(
                "unsupported manifest version {}",
                self.format_version
            )));
        }

        for pair in self.entries.windows(2) {
            if pair[0].component_id >= pair[1].component_id {
                return Err(BackupError::corrupt(format!(
                    "manifest entries out of order or duplicated at {}",
                    pair[1].component_id
                )));
            }
        }

        let mut ranges: Vec<(u64, u64)> = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            if entry.offset.checked_add(entry.length).is_none() || entry.end() > payload_len {
                return Err(BackupError::corrupt(format!(
                    "entry {} points outside the payload",
                    entry.component_id
                )));
            }
            ranges.push((entry.offset, entry.end()));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            if pair[0].1 > pair[1].0 {
                return Err(BackupError::corrupt("manifest entries overlap"));
            }
        }

        Ok(())
    }
}

/// Accumulates captured components in capture order.
#[derive(Debug, Default)]
pub struct BundleBuilder {
    entries: Vec<ManifestEntry>,
    payload: Vec<u8>,
}

impl BundleBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, component: &str) -> bool {
        self.entries.iter().any(|e| e.component_id == component)
    }

    pub fn add_component(
        &mut self,
        component_id: impl Into<ComponentId>,
        captured_at: DateTime<Utc>,
        data: &[u8],
    ) -> Result<()> {
        let component_id = component_id.into();
        if self.contains(&component_id) {
            return Err(BackupError::corrupt(format!(
                "component {component_id} captured twice"
            )));
        }
        let offset = self.payload.len() as u64;
        self.payload.extend_from_slice(data);
        self.entries.push(ManifestEntry {
            component_id,
            captured_at,
            offset,
            length: data.len() as u64,
            checksum: sha256_hex(data),
        });
        Ok(())
    }

    pub fn finish(
        mut self,
        backup_id: impl Into<String>,
        lineage: impl Into<String>,
        spec_id: impl Into<String>,
    ) -> SnapshotBundle {
        self.entries
            .sort_by(|a, b| a.component_id.cmp(&b.component_id));
        SnapshotBundle {
            manifest: Manifest {
                format_version: BUNDLE_FORMAT_VERSION,
                backup_id: backup_id.into(),
                lineage: lineage.into(),
                spec_id: spec_id.into(),
                created_at: Utc::now(),
                entries: self.entries,
            },
            payload: self.payload,
        }
    }
}

/// A manifest plus the concatenated component payloads it indexes.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotBundle {
    pub manifest: Manifest,
    pub payload: Vec<u8>,
}

impl SnapshotBundle {
    pub fn encode(&self) -> Result<Vec<u8>> {
        let manifest = serde_json::to_vec(&self.manifest)?;
        let manifest_len = u32::try_from(manifest.len())
            .map_err(|_| BackupError::corrupt("manifest exceeds 4 GiB"))?;

        let mut out = Vec::with_capacity(HEADER_LEN + manifest.len() + self.payload.len());
        out.extend_from_slice(BUNDLE_MAGIC);
        out.push(BUNDLE_FORMAT_VERSION);
        out.extend_from_slice(&manifest_len.to_be_bytes());
        out.extend_from_slice(&manifest);
        out.extend_from_slice(&self.payload);
        Ok(out)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != BUNDLE_MAGIC {
            return Err(BackupError::corrupt("not a snapshot bundle"));
        }
        if bytes[4] != BUNDLE_FORMAT_VERSION {
            return Err(BackupError::corrupt(format!(
                "unsupported bundle version {}",
                bytes[4]
            )));
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[5..HEADER_LEN]);
        let manifest_len = u32::from_be_bytes(len_bytes) as usize;

        let manifest_end = HEADER_LEN
            .checked_add(manifest_len)
            .filter(|end| *end <= bytes.len())
            .ok_or_else(|| BackupError::corrupt("truncated manifest"))?;

        let manifest: Manifest = serde_json::from_slice(&bytes[HEADER_LEN..manifest_end])?;
        let payload = bytes[manifest_end..].to_vec();
        manifest.validate(payload.len() as u64)?;

        Ok(Self { manifest, payload })
    }

    /// The payload slice of one entry, verified against its sub-checksum.
    pub fn component_bytes(&self, entry: &ManifestEntry) -> Result<&[u8]> {
        let start = entry.offset as usize;
        let end = entry.end() as usize;
        let data = self
            .payload
            .get(start..end)
            .ok_or_else(|| BackupError::corrupt(format!("entry {} out of bounds", entry.component_id)))?;
        if sha256_hex(data) != entry.checksum {
            return Err(BackupError::corrupt(format!(
                "checksum mismatch for component {}",
                entry.component_id
            )));
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn bundle_of(components: &[(&str, &str)]) -> SnapshotBundle {
        let mut builder = BundleBuilder::new();
        for (id, data) in components {
            builder
                .add_component(*id, Utc::now(), data.as_bytes())
                .unwrap();
        }
        builder.finish("backup-1", "nightly", "spec-1")
    }

    #[test]
    fn test_entries_sorted_regardless_of_capture_order() {
        let bundle = bundle_of(&[
            ("metrics-store", "metrics"),
            ("dashboard-store", "dashboards"),
            ("log-store", "logs"),
        ]);
        let ids: Vec<_> = bundle.manifest.component_ids().collect();
        assert_eq!(ids, vec!["dashboard-store", "log-store", "metrics-store"]);

        let dashboards = bundle.manifest.entry("dashboard-store").unwrap();
        assert_eq!(bundle.component_bytes(dashboards).unwrap(), b"dashboards".as_slice());
        assert!(bundle.manifest.entry("traces").is_none());
    }

    #[test]
    fn test_decode_rejects_garbage_and_truncation() {
        assert!(SnapshotBundle::decode(b"nope").is_err());

        let encoded = bundle_of(&[("metrics-store", "0123456789")]).encode().unwrap();
        let truncated = &encoded[..encoded.len() - 3];
        assert!(matches!(
            SnapshotBundle::decode(truncated),
            Err(BackupError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_tampered_component_detected() {
        let mut bundle = bundle_of(&[("metrics-store", "series")]);
        bundle.payload[0] ^= 0xff;
        let entry = bundle.manifest.entries[0].clone();
        assert!(bundle.component_bytes(&entry).is_err());
    }

    #[test]
    fn test_overlapping_entries_rejected() {
        let mut bundle = bundle_of(&[("a", "aaaa"), ("b", "bbbb")]);
        bundle.manifest.entries[1].offset = 2;
        assert!(bundle.manifest.validate(bundle.payload.len() as u64).is_err());
    }

    #[test]
    fn test_duplicate_component_rejected() {
        let mut builder = BundleBuilder::new();
        builder.add_component("a", Utc::now(), b"1").unwrap();
        assert!(builder.add_component("a", Utc::now(), b"2").is_err());
    }

    proptest! {
        #[test]
        fn prop_manifest_invariants_hold(
            components in proptest::collection::btree_map("[a-z]{1,8}", proptest::collection::vec(any::<u8>(), 0..64), 1..6)
        ) {
            let mut builder = BundleBuilder::new();
            // Capture in reverse order to exercise the sort.
            for (id, data) in components.iter().rev() {
                builder.add_component(id.clone(), Utc::now(), data).unwrap();
            }
            let bundle = builder.finish("b", "l", "s");
            let decoded = SnapshotBundle::decode(&bundle.encode().unwrap()).unwrap();

            prop_assert_eq!(decoded.manifest.entries.len(), components.len());
            for (id, data) in &components {
                let entry = decoded.manifest.entry(id).unwrap();
                prop_assert_eq!(decoded.component_bytes(entry).unwrap(), data.as_slice());
            }
        }
    }
}
