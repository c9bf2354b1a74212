use crate::application::{ApplicationLifecycle, DependencyContainer};
use crate::backup::{reconcile, BackupStatus, CatalogStore, ComponentId, StorageResolver};
use anyhow::Result;
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancellation token that fires on Ctrl+C, so one-shot commands leave
/// their records in a terminal state when interrupted.
fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            child.cancel();
        }
    });
    token
}

pub struct BackupCommandHandler {
    container: Arc<DependencyContainer>,
}

impl BackupCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn run(&self, lineage: &str) -> Result<()> {
        let spec = self.container.spec(lineage)?;
        let outcome = self
            .container
            .orchestrator
            .run(spec, &interrupt_token())
            .await?;

        print_json(&outcome.record)?;
        if let Some(retention) = &outcome.retention {
            if !retention.deleted.is_empty() {
                info!("🧹 Retention removed {} backups", retention.deleted.len());
            }
        }
        if outcome.is_committed() {
            info!("✅ Backup committed: {}", outcome.record.id);
            Ok(())
        } else {
            let message = outcome
                .record
                .failure
                .map(|f| f.message)
                .unwrap_or_else(|| "unknown failure".to_string());
            Err(anyhow::anyhow!("Backup {} failed: {}", outcome.record.id, message))
        }
    }

    pub async fn list(&self, lineage: &str) -> Result<()> {
        let records = self.container.catalog.list(lineage).await?;
        let committed = records
            .iter()
            .filter(|r| r.status == BackupStatus::Committed)
            .count();
        info!(
            "📊 {} records for {}, {} committed",
            records.len(),
            lineage,
            committed
        );
        print_json(&records)
    }

    pub async fn prune(&self, lineage: &str) -> Result<()> {
        let spec = self.container.spec(lineage)?;
        let report = self
            .container
            .orchestrator
            .retention()
            .enforce(lineage, &spec.retention_policy)
            .await?;
        for failure in &report.failures {
            error!("❌ Could not remove {}: {}", failure.backup_id, failure.message);
        }
        print_json(&report)
    }

    pub async fn reconcile(&self, lineage: &str) -> Result<()> {
        let spec = self.container.spec(lineage)?;
        let provider = self
            .container
            .storage
            .provider_for(&spec.storage_location)?;
        let report = reconcile(
            self.container.catalog.as_ref(),
            provider.as_ref(),
            lineage,
            &spec.storage_location.prefix,
        )
        .await?;
        if report.is_consistent() {
            info!("✅ Catalog and storage agree for {}", lineage);
        } else {
            warn!(
                "⚠️  {} orphaned objects, {} dangling records",
                report.orphaned_objects.len(),
                report.dangling_records.len()
            );
        }
        print_json(&report)
    }

    pub fn metrics(&self) -> Result<()> {
        print!("{}", self.container.metrics.gather_text());
        Ok(())
    }
}

pub struct RestoreCommandHandler {
    container: Arc<DependencyContainer>,
}

impl RestoreCommandHandler {
    pub fn new(container: Arc<DependencyContainer>) -> Self {
        Self { container }
    }

    pub async fn restore(&self, backup_id: &str, components: Vec<ComponentId>) -> Result<()> {
        let filter = (!components.is_empty()).then_some(components);
        let report = self
            .container
            .restorer
            .restore(backup_id, filter.as_deref(), &interrupt_token())
            .await?;
        print_json(&report)
    }

    pub async fn verify(&self, backup_id: &str) -> Result<()> {
        let report = self
            .container
            .restorer
            .verify(backup_id, &interrupt_token())
            .await?;
        info!(
            "✅ Backup {} verified: {} components intact",
            backup_id,
            report.components.len()
        );
        print_json(&report)
    }
}

pub struct DaemonCommandHandler {
    container: Arc<DependencyContainer>,
    lifecycle: Arc<ApplicationLifecycle>,
}

impl DaemonCommandHandler {
    pub fn new(container: Arc<DependencyContainer>, lifecycle: Arc<ApplicationLifecycle>) -> Self {
        Self {
            container,
            lifecycle,
        }
    }

    /// Register every scheduled definition and run until a shutdown signal.
    pub async fn run(&self) -> Result<()> {
        let scheduler = &self.container.scheduler;
        let mut registered = 0;
        for spec in &self.container.specs {
            if spec.schedule.is_none() {
                info!("Lineage {} has no schedule, manual runs only", spec.lineage);
                continue;
            }
            scheduler.register(spec.clone()).await?;
            registered += 1;
        }
        if registered == 0 {
            warn!("⚠️  No scheduled backups defined");
        }

        scheduler.start().await?;
        info!("🚀 Backup daemon running with {} schedules", registered);

        self.lifecycle.wait_for_shutdown().await;
        self.lifecycle.shutdown().await
    }
}
