use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::export::health::HealthMetrics;
use crate::sink::manifest::ManifestBuilder;

use super::exporter::FileExporter;
use super::store::AggregationStore;

/// Why a flush ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushTrigger {
    Periodic,
    Shutdown,
}

impl FlushTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Periodic => "periodic",
            Self::Shutdown => "shutdown",
        }
    }
}

impl fmt::Display for FlushTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one flush cycle across all applications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
    pub trigger: FlushTrigger,
    /// Manifests written successfully.
    pub written: usize,
    /// Applications whose manifest could not be written this cycle.
    pub failed: usize,
}

impl FlushReport {
    fn new(trigger: FlushTrigger) -> Self {
        Self {
            trigger,
            written: 0,
            failed: 0,
        }
    }
}

/// Writes a manifest for every known application on a fixed interval, and
/// once more when its [`FlushHandle`] is finished.
pub struct FlushScheduler {
    store: Arc<AggregationStore>,
    builder: ManifestBuilder,
    exporter: FileExporter,
    interval: Duration,
    health: Option<Arc<HealthMetrics>>,
}

impl FlushScheduler {
    pub fn new(
        store: Arc<AggregationStore>,
        builder: ManifestBuilder,
        exporter: FileExporter,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            builder,
            exporter,
            interval,
            health: None,
        }
    }

    /// Record flush metrics into `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Snapshot every application and write its manifest.
    ///
    /// A failure for one application is logged and counted; the remaining
    /// applications are still written.
    pub async fn flush_all(&self, trigger: FlushTrigger) -> FlushReport {
        let timer = self.health.as_ref().map(|h| h.flush_duration.start_timer());
        let snapshots = self.store.snapshot_all();
        let generated_at = Utc::now();
        let mut report = FlushReport::new(trigger);

        for (app, snapshot) in &snapshots {
            let manifest = self.builder.build(app, snapshot, generated_at);

            match self.exporter.export(&manifest).await {
                Ok(_) => report.written += 1,
                Err(e) => {
                    report.failed += 1;
                    if let Some(h) = &self.health {
                        h.manifest_write_errors.inc();
                    }
                    warn!(
                        exporter = self.exporter.name(),
                        app = %app,
                        error = %e,
                        "manifest export failed",
                    );
                }
            }
        }

        if let Some(timer) = timer {
            timer.observe_duration();
        }
        if let Some(h) = &self.health {
            h.manifest_flushes.with_label_values(&[trigger.as_str()]).inc();
            h.applications_tracked.set(snapshots.len() as f64);
        }

        if report.written > 0 || report.failed > 0 {
            info!(
                trigger = %trigger,
                written = report.written,
                failed = report.failed,
                "flushed manifests"
            );
        } else {
            debug!(trigger = %trigger, "nothing to flush");
        }

        report
    }

    /// Start the periodic flush task.
    ///
    /// The first periodic flush happens one interval after start.
    pub fn spawn(self) -> FlushHandle {
        let cancel = CancellationToken::new();
        let ctx = cancel.clone();

        info!(interval = ?self.interval, "flush scheduler started");

        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut ticker = tokio::time::interval_at(start, self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        return self.flush_all(FlushTrigger::Shutdown).await;
                    }
                    _ = ticker.tick() => {
                        self.flush_all(FlushTrigger::Periodic).await;
                    }
                }
            }
        });

        FlushHandle { cancel, task }
    }
}

/// Handle to a running [`FlushScheduler`].
pub struct FlushHandle {
    cancel: CancellationToken,
    task: JoinHandle<FlushReport>,
}

impl FlushHandle {
    /// Stop periodic flushing and run the final flush.
    ///
    /// A periodic flush already in progress completes first; the final flush
    /// then runs exactly once.
    pub async fn finish(self) -> Result<FlushReport> {
        self.cancel.cancel();
        self.task.await.context("flush task failed")
    }
}
