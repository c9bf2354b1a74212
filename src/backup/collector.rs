use super::components::ComponentExporter;
use super::{sha256_hex, BackupError, BundleBuilder, ComponentId, Result, SnapshotBundle};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Captures every component of a spec into one bundle. Components are
/// exported one after another, so the result is near-consistent rather than
/// a simultaneous snapshot. Any component failure aborts the whole capture.
#[derive(Debug, Clone)]
pub struct SnapshotCollector {
    exporter: Arc<dyn ComponentExporter>,
    capture_timeout: Duration,
}

/// Identity stamped into the manifest of a capture.
#[derive(Debug, Clone, Copy)]
pub struct CaptureTarget<'a> {
    pub backup_id: &'a str,
    pub lineage: &'a str,
    pub spec_id: &'a str,
}

impl SnapshotCollector {
    pub fn new(exporter: Arc<dyn ComponentExporter>, capture_timeout: Duration) -> Self {
        Self {
            exporter,
            capture_timeout,
        }
    }

    #[instrument(skip(self, components, cancel), fields(backup_id = target.backup_id))]
    pub async fn capture(
        &self,
        target: CaptureTarget<'_>,
        components: &[ComponentId],
        cancel: &CancellationToken,
    ) -> Result<SnapshotBundle> {
        let mut builder = BundleBuilder::new();

        for component in components {
            let data = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    warn!(component = %component, "Capture cancelled");
                    return Err(BackupError::Cancelled {
                        operation: format!("export of {component}"),
                    });
                }
                result = tokio::time::timeout(self.capture_timeout, self.capture_one(component)) => {
                    match result {
                        Ok(data) => data?,
                        Err(_) => {
                            warn!(component = %component, "Component export timed out");
                            return Err(BackupError::Timeout {
                                operation: format!("export of {component}"),
                                seconds: self.capture_timeout.as_secs(),
                            });
                        }
                    }
                }
            };

            builder.add_component(component.clone(), Utc::now(), &data)?;
        }

        let bundle = builder.finish(target.backup_id, target.lineage, target.spec_id);
        info!(
            components = bundle.manifest.entries.len(),
            bytes = bundle.payload.len(),
            "Captured snapshot"
        );
        Ok(bundle)
    }

    async fn capture_one(&self, component: &str) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.capture_timeout;
        let mut export = self.exporter.export(component, deadline).await?;

        let mut data = Vec::new();
        export
            .reader
            .read_to_end(&mut data)
            .await
            .map_err(|e| BackupError::Component {
                component: component.to_string(),
                message: format!("reading export stream: {e}"),
            })?;

        let actual = sha256_hex(&data);
        if actual != export.checksum {
            return Err(BackupError::Component {
                component: component.to_string(),
                message: format!(
                    "export declared checksum {} but stream hashed to {}",
                    export.checksum, actual
                ),
            });
        }

        debug!(component, bytes = data.len(), "Component exported");
        Ok(data)
    }
}
