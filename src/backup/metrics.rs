use prometheus::{
    exponential_buckets, GaugeVec, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry,
};
use std::sync::Arc;
use std::time::Instant;
use tracing::error;

/// Prometheus metrics for backup, restore and retention activity
pub struct BackupMetrics {
    registry: Arc<Registry>,

    // Run metrics
    pub runs_total: IntCounterVec,
    pub run_duration_seconds: HistogramVec,
    pub runs_in_flight: IntGauge,
    pub missed_runs_total: IntCounterVec,
    pub last_success_timestamp_seconds: GaugeVec,
    pub uploaded_bytes_total: IntCounterVec,

    // Restore metrics
    pub restores_total: IntCounterVec,

    // Retention metrics
    pub retention_deletions_total: IntCounterVec,
    pub retention_errors_total: IntCounterVec,

    // Scheduler metrics
    pub active_schedules: IntGaugeVec,
}

impl std::fmt::Debug for BackupMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupMetrics").finish_non_exhaustive()
    }
}

impl BackupMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let runs_total = IntCounterVec::new(
            Opts::new("backup_runs_total", "Backup runs by lineage and outcome"),
            &["lineage", "outcome"],
        )?;
        registry.register(Box::new(runs_total.clone()))?;

        let run_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "backup_run_duration_seconds",
                "Duration of backup runs in seconds",
            )
            .buckets(exponential_buckets(0.5, 2.0, 14)?),
            &["lineage"],
        )?;
        registry.register(Box::new(run_duration_seconds.clone()))?;

        let runs_in_flight = IntGauge::with_opts(Opts::new(
            "backup_runs_in_flight",
            "Number of backup runs currently executing",
        ))?;
        registry.register(Box::new(runs_in_flight.clone()))?;

        let missed_runs_total = IntCounterVec::new(
            Opts::new(
                "backup_missed_runs_total",
                "Scheduled runs skipped because the lineage was busy",
            ),
            &["lineage"],
        )?;
        registry.register(Box::new(missed_runs_total.clone()))?;

        let last_success_timestamp_seconds = GaugeVec::new(
            Opts::new(
                "backup_last_success_timestamp_seconds",
                "Unix time of the last committed backup",
            ),
            &["lineage"],
        )?;
        registry.register(Box::new(last_success_timestamp_seconds.clone()))?;

        let uploaded_bytes_total = IntCounterVec::new(
            Opts::new("backup_uploaded_bytes_total", "Bytes of committed snapshots"),
            &["lineage"],
        )?;
        registry.register(Box::new(uploaded_bytes_total.clone()))?;

        let restores_total = IntCounterVec::new(
            Opts::new("backup_restores_total", "Restore attempts by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(restores_total.clone()))?;

        let retention_deletions_total = IntCounterVec::new(
            Opts::new(
                "backup_retention_deletions_total",
                "Backups deleted by retention",
            ),
            &["lineage"],
        )?;
        registry.register(Box::new(retention_deletions_total.clone()))?;

        let retention_errors_total = IntCounterVec::new(
            Opts::new(
                "backup_retention_errors_total",
                "Retention deletions that failed",
            ),
            &["lineage"],
        )?;
        registry.register(Box::new(retention_errors_total.clone()))?;

        let active_schedules = IntGaugeVec::new(
            Opts::new("backup_active_schedules", "Registered backup schedules"),
            &["state"],
        )?;
        registry.register(Box::new(active_schedules.clone()))?;

        Ok(Self {
            registry,
            runs_total,
            run_duration_seconds,
            runs_in_flight,
            missed_runs_total,
            last_success_timestamp_seconds,
            uploaded_bytes_total,
            restores_total,
            retention_deletions_total,
            retention_errors_total,
            active_schedules,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    /// Record the end of a run. `outcome` is `committed`, `failed` or `cancelled`.
    pub fn record_run(&self, lineage: &str, outcome: &str, start_time: Instant) {
        self.runs_total.with_label_values(&[lineage, outcome]).inc();
        self.run_duration_seconds
            .with_label_values(&[lineage])
            .observe(start_time.elapsed().as_secs_f64());
    }

    pub fn record_commit(
        &self,
        lineage: &str,
        size_bytes: u64,
        committed_at: chrono::DateTime<chrono::Utc>,
    ) {
        self.uploaded_bytes_total
            .with_label_values(&[lineage])
            .inc_by(size_bytes);
        self.last_success_timestamp_seconds
            .with_label_values(&[lineage])
            .set(committed_at.timestamp() as f64);
    }

    pub fn record_missed_run(&self, lineage: &str) {
        self.missed_runs_total.with_label_values(&[lineage]).inc();
    }

    pub fn record_restore(&self, outcome: &str) {
        self.restores_total.with_label_values(&[outcome]).inc();
    }

    pub fn record_retention(&self, lineage: &str, deleted: usize, errors: usize) {
        self.retention_deletions_total
            .with_label_values(&[lineage])
            .inc_by(deleted as u64);
        self.retention_errors_total
            .with_label_values(&[lineage])
            .inc_by(errors as u64);
    }

    pub fn update_schedule_counts(&self, active: usize, suspended: usize) {
        self.active_schedules
            .with_label_values(&["active"])
            .set(active as i64);
        self.active_schedules
            .with_label_values(&["suspended"])
            .set(suspended as i64);
    }

    /// Get metrics in Prometheus text format
    pub fn gather_text(&self) -> String {
        use prometheus::TextEncoder;
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        encoder
            .encode_to_string(&metric_families)
            .unwrap_or_else(|e| {
                error!("Failed to encode metrics: {}", e);
                String::new()
            })
    }
}

/// Tracks one run in the in-flight gauge until dropped
pub struct RunTimer {
    start: Instant,
    metrics: Arc<BackupMetrics>,
}

impl RunTimer {
    pub fn new(metrics: Arc<BackupMetrics>) -> Self {
        metrics.runs_in_flight.inc();
        Self {
            start: Instant::now(),
            metrics,
        }
    }

    pub fn start(&self) -> Instant {
        self.start
    }
}

impl Drop for RunTimer {
    fn drop(&mut self) {
        self.metrics.runs_in_flight.dec();
    }
}
