//! Cron-driven backup runs, one registered schedule per lineage.
//!
//! A trigger that fires while the lineage still has a run in flight is
//! skipped and counted as a missed run; it is never queued.

use super::metrics::BackupMetrics;
use super::orchestrator::{BackupOrchestrator, RunOutcome};
use super::{BackupError, BackupSpec, BackupStatus, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// How long `shutdown` waits for cancelled runs to record their failure.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScheduleStatistics {
    pub runs: u64,
    pub successes: u64,
    pub failures: u64,
    /// Triggers skipped because the lineage was busy
    pub missed: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<LastOutcome>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastOutcome {
    pub backup_id: Option<String>,
    pub status: Option<BackupStatus>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleInfo {
    pub lineage: String,
    pub spec_id: String,
    pub cron: String,
    pub suspended: bool,
    pub statistics: ScheduleStatistics,
}

#[derive(Debug)]
struct ScheduleEntry {
    spec: BackupSpec,
    cron: String,
    job_id: Uuid,
    suspended: bool,
    statistics: ScheduleStatistics,
}

/// State shared between the scheduler handle and its cron jobs
#[derive(Debug)]
struct Shared {
    orchestrator: Arc<BackupOrchestrator>,
    metrics: Arc<BackupMetrics>,
    entries: RwLock<HashMap<String, ScheduleEntry>>,
    shutdown: CancellationToken,
    /// Every run started by cron or a manual trigger
    runs: TaskTracker,
}

pub struct BackupScheduler {
    scheduler: Arc<Mutex<JobScheduler>>,
    shared: Arc<Shared>,
    drain_timeout: Duration,
}

/// Accepts standard five-field cron (`min hour dom mon dow`) as well as the
/// six-field form with seconds and `@daily` style shortcuts.
pub fn normalize_cron(expression: &str) -> Result<String> {
    let trimmed = expression.trim();
    if trimmed.starts_with('@') {
        return Ok(trimmed.to_string());
    }
    match trimmed.split_whitespace().count() {
        5 => Ok(format!("0 {trimmed}")),
        6 | 7 => Ok(trimmed.to_string()),
        n => Err(BackupError::invalid_spec(format!(
            "cron expression '{expression}' has {n} fields, expected 5 or 6"
        ))),
    }
}

fn scheduler_error(context: &str, e: impl std::fmt::Display) -> BackupError {
    BackupError::Component {
        component: "scheduler".to_string(),
        message: format!("{context}: {e}"),
    }
}

impl BackupScheduler {
    pub async fn new(
        orchestrator: Arc<BackupOrchestrator>,
        metrics: Arc<BackupMetrics>,
    ) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| scheduler_error("Failed to initialize job scheduler", e))?;

        Ok(Self {
            scheduler: Arc::new(Mutex::new(scheduler)),
            shared: Arc::new(Shared {
                orchestrator,
                metrics,
                entries: RwLock::new(HashMap::new()),
                shutdown: CancellationToken::new(),
                runs: TaskTracker::new(),
            }),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
        })
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    pub async fn start(&self) -> Result<()> {
        let scheduler = self.scheduler.lock().await;
        scheduler
            .start()
            .await
            .map_err(|e| scheduler_error("Failed to start job scheduler", e))?;
        info!("Backup scheduler started");
        Ok(())
    }

    /// Register or replace the schedule of `spec.lineage`. Replacing keeps
    /// the accumulated statistics.
    #[instrument(skip(self, spec), fields(lineage = %spec.lineage))]
    pub async fn register(&self, spec: BackupSpec) -> Result<()> {
        spec.validate()?;
        let expression = spec.schedule.as_deref().ok_or_else(|| {
            BackupError::invalid_spec(format!("spec for {} has no schedule", spec.lineage))
        })?;
        let cron = normalize_cron(expression)?;

        let lineage = spec.lineage.clone();
        let shared = self.shared.clone();
        let job_lineage = lineage.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let shared = shared.clone();
            let lineage = job_lineage.clone();
            Box::pin(async move {
                Self::fire(&shared, &lineage).await;
            })
        })
        .map_err(|e| BackupError::invalid_spec(format!("invalid cron '{cron}': {e}")))?;

        let job_id = {
            let scheduler = self.scheduler.lock().await;
            scheduler
                .add(job)
                .await
                .map_err(|e| scheduler_error("Failed to add job", e))?
        };

        let previous = {
            let mut entries = self.shared.entries.write().await;
            let statistics = entries
                .get(&lineage)
                .map(|e| e.statistics.clone())
                .unwrap_or_default();
            entries.insert(
                lineage.clone(),
                ScheduleEntry {
                    spec,
                    cron: cron.clone(),
                    job_id,
                    suspended: false,
                    statistics,
                },
            )
        };

        if let Some(previous) = previous {
            self.remove_job(previous.job_id).await;
            info!(cron = %cron, "Replaced backup schedule");
        } else {
            info!(cron = %cron, "Registered backup schedule");
        }
        self.refresh_gauges().await;
        Ok(())
    }

    pub async fn unregister(&self, lineage: &str) -> Result<()> {
        let removed = self.shared.entries.write().await.remove(lineage);
        match removed {
            Some(entry) => {
                self.remove_job(entry.job_id).await;
                info!(lineage, "Unregistered backup schedule");
                self.refresh_gauges().await;
                Ok(())
            }
            None => Err(not_registered(lineage)),
        }
    }

    pub async fn suspend(&self, lineage: &str) -> Result<()> {
        self.set_suspended(lineage, true).await
    }

    pub async fn resume(&self, lineage: &str) -> Result<()> {
        self.set_suspended(lineage, false).await
    }

    /// Run a registered lineage now, outside its schedule. A busy lineage is
    /// reported to the caller as `LineageBusy`.
    pub async fn trigger(&self, lineage: &str) -> Result<RunOutcome> {
        let spec = {
            let entries = self.shared.entries.read().await;
            entries
                .get(lineage)
                .map(|e| e.spec.clone())
                .ok_or_else(|| not_registered(lineage))?
        };
        let result = Self::run_tracked(&self.shared, spec).await;
        Self::record(&self.shared, lineage, &result).await;
        result
    }

    /// What a cron tick does for `lineage`.
    pub async fn fire_now(&self, lineage: &str) {
        Self::fire(&self.shared, lineage).await;
    }

    pub async fn list(&self) -> Vec<ScheduleInfo> {
        let entries = self.shared.entries.read().await;
        let mut infos: Vec<ScheduleInfo> = entries
            .iter()
            .map(|(lineage, entry)| ScheduleInfo {
                lineage: lineage.clone(),
                spec_id: entry.spec.id.clone(),
                cron: entry.cron.clone(),
                suspended: entry.suspended,
                statistics: entry.statistics.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.lineage.cmp(&b.lineage));
        infos
    }

    pub async fn statistics(&self, lineage: &str) -> Option<ScheduleStatistics> {
        self.shared
            .entries
            .read()
            .await
            .get(lineage)
            .map(|e| e.statistics.clone())
    }

    /// Cancel in-flight runs, stop the cron loop and wait (bounded by the
    /// drain timeout) until every cancelled run has recorded its outcome.
    pub async fn shutdown(&self) -> Result<()> {
        info!("Shutting down backup scheduler");
        self.shared.shutdown.cancel();
        let stopped = {
            let mut scheduler = self.scheduler.lock().await;
            scheduler
                .shutdown()
                .await
                .map_err(|e| scheduler_error("Failed to stop job scheduler", e))
        };

        self.shared.runs.close();
        if tokio::time::timeout(self.drain_timeout, self.shared.runs.wait())
            .await
            .is_err()
        {
            warn!(
                in_flight = self.shared.runs.len(),
                "Timed out waiting for in-flight backup runs to finish"
            );
        } else {
            debug!("All in-flight backup runs finished");
        }
        stopped
    }

    /// Runs on a task owned by the tracker, so a dropped cron job future
    /// cannot abandon a run half way through.
    async fn run_tracked(shared: &Arc<Shared>, spec: BackupSpec) -> Result<RunOutcome> {
        let orchestrator = shared.orchestrator.clone();
        let cancel = shared.shutdown.child_token();
        let handle = shared
            .runs
            .spawn(async move { orchestrator.run(&spec, &cancel).await });
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(scheduler_error("Backup run task failed", e)),
        }
    }

    async fn fire(shared: &Arc<Shared>, lineage: &str) {
        if shared.shutdown.is_cancelled() {
            debug!(lineage, "Shutdown in progress, skipping scheduled run");
            return;
        }

        let spec = {
            let entries = shared.entries.read().await;
            match entries.get(lineage) {
                Some(entry) if entry.suspended => {
                    debug!(lineage, "Schedule suspended, skipping run");
                    return;
                }
                Some(entry) => entry.spec.clone(),
                None => return,
            }
        };

        let result = Self::run_tracked(shared, spec).await;
        Self::record(shared, lineage, &result).await;
    }

    async fn record(shared: &Shared, lineage: &str, result: &Result<RunOutcome>) {
        let mut entries = shared.entries.write().await;
        let Some(entry) = entries.get_mut(lineage) else {
            return;
        };
        let stats = &mut entry.statistics;

        match result {
            Err(BackupError::LineageBusy { holder, .. }) => {
                stats.missed += 1;
                shared.metrics.record_missed_run(lineage);
                warn!(lineage, holder = %holder, "⏭️ Missed run: previous run still in flight");
                return;
            }
            Ok(outcome) => {
                stats.runs += 1;
                stats.last_run_at = Some(Utc::now());
                let message = match &outcome.record.failure {
                    Some(reason) => reason.message.clone(),
                    None => "Backup committed".to_string(),
                };
                if outcome.is_committed() {
                    stats.successes += 1;
                } else {
                    stats.failures += 1;
                }
                stats.last_outcome = Some(LastOutcome {
                    backup_id: Some(outcome.record.id.clone()),
                    status: Some(outcome.record.status),
                    message,
                });
            }
            Err(e) => {
                stats.runs += 1;
                stats.failures += 1;
                stats.last_run_at = Some(Utc::now());
                stats.last_outcome = Some(LastOutcome {
                    backup_id: None,
                    status: None,
                    message: e.to_string(),
                });
                error!(lineage, "Scheduled run could not start: {}", e);
            }
        }
    }

    async fn set_suspended(&self, lineage: &str, suspended: bool) -> Result<()> {
        {
            let mut entries = self.shared.entries.write().await;
            let entry = entries
                .get_mut(lineage)
                .ok_or_else(|| not_registered(lineage))?;
            entry.suspended = suspended;
        }
        info!(lineage, suspended, "Schedule state changed");
        self.refresh_gauges().await;
        Ok(())
    }

    async fn remove_job(&self, job_id: Uuid) {
        let scheduler = self.scheduler.lock().await;
        if let Err(e) = scheduler.remove(&job_id).await {
            warn!(job_id = %job_id, "Failed to remove cron job: {}", e);
        }
    }

    async fn refresh_gauges(&self) {
        let entries = self.shared.entries.read().await;
        let suspended = entries.values().filter(|e| e.suspended).count();
        self.shared
            .metrics
            .update_schedule_counts(entries.len() - suspended, suspended);
    }
}

fn not_registered(lineage: &str) -> BackupError {
    BackupError::invalid_spec(format!("no schedule registered for lineage {lineage}"))
}
