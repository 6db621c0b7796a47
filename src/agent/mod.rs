pub mod ingest;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::ClockAnchor;
use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::pid::IdentityResolver;
use crate::sink::aggregated::{AggregationStore, FileExporter, FlushScheduler};
use crate::sink::manifest::ManifestBuilder;
use crate::tracer::stats::EventStats;
use crate::tracer::Transport;

pub use ingest::{IngestSummary, IngestionLoop, LoopState};

/// Agent wires the ingestion loop, aggregation store, flush scheduler and
/// health server together.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    store: Arc<AggregationStore>,
    resolver: Arc<IdentityResolver>,
    stats: Arc<EventStats>,
    ingest_task: Option<JoinHandle<IngestSummary>>,
    cancel: CancellationToken,
    done: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);
        let resolver = Arc::new(IdentityResolver::from_proc(
            cfg.identity.proc_root.clone(),
            cfg.identity.env_var.clone(),
        ));

        Ok(Self {
            cfg,
            health,
            store: Arc::new(AggregationStore::new()),
            resolver,
            stats: Arc::new(EventStats::new()),
            ingest_task: None,
            cancel: CancellationToken::new(),
            done: CancellationToken::new(),
        })
    }

    /// Replace the identity resolver. Must be called before [`Agent::start`].
    pub fn with_resolver(mut self, resolver: IdentityResolver) -> Self {
        self.resolver = Arc::new(resolver);
        self
    }

    /// Shared aggregation state.
    pub fn store(&self) -> &Arc<AggregationStore> {
        &self.store
    }

    pub fn health(&self) -> &Arc<HealthMetrics> {
        &self.health
    }

    /// Start consuming `transport`.
    pub async fn start<T>(&mut self, transport: T) -> Result<()>
    where
        T: Transport + 'static,
    {
        if self.ingest_task.is_some() {
            bail!("agent already started");
        }

        // 1. Health server (optional; metrics are recorded regardless).
        if self.cfg.health.enabled {
            self.health
                .start()
                .await
                .context("starting health metrics server")?;
        }

        // 2. Flush scheduler.
        let anchor = ClockAnchor::capture(self.cfg.timestamps);
        let builder = ManifestBuilder::new(self.cfg.output.sort_entries, anchor);
        let exporter = FileExporter::new(self.cfg.output.dir.clone(), self.cfg.output.format);
        let flush = FlushScheduler::new(
            Arc::clone(&self.store),
            builder,
            exporter,
            self.cfg.flush_interval,
        )
        .with_health(Arc::clone(&self.health))
        .spawn();

        // 3. Ingestion loop.
        let mut ingest = IngestionLoop::new(
            transport,
            Arc::clone(&self.resolver),
            Arc::clone(&self.store),
            Arc::clone(&self.stats),
        )
        .with_health(Arc::clone(&self.health));

        let cancel = self.cancel.child_token();
        let done = self.done.clone();
        self.ingest_task = Some(tokio::spawn(async move {
            let summary = ingest.run(cancel, Some(flush)).await;
            done.cancel();
            summary
        }));

        // 4. Background reporter.
        self.spawn_event_stats_reporter();

        info!(
            output_dir = %self.cfg.output.dir.display(),
            format = self.cfg.output.format.extension(),
            flush_interval = ?self.cfg.flush_interval,
            timestamps = ?self.cfg.timestamps,
            offset_ns = anchor.offset_ns(),
            "agent started"
        );

        Ok(())
    }

    /// Resolves once the ingestion loop has stopped on its own (transport
    /// closed) or after [`Agent::stop`].
    pub async fn wait_for_ingest_end(&self) {
        self.done.cancelled().await;
    }

    /// Signal shutdown, wait for the ingestion loop to drain and the final
    /// flush to complete.
    pub async fn stop(&mut self) -> Result<IngestSummary> {
        self.cancel.cancel();

        let joined = match self.ingest_task.take() {
            Some(task) => task.await,
            None => Ok(IngestSummary::default()),
        };

        // The health server goes down even when ingestion panicked.
        self.health.stop().await?;

        let summary = joined.context("ingestion task failed")?;
        if let Some(report) = &summary.final_flush {
            if report.failed > 0 {
                warn!(failed = report.failed, "final flush left manifests unwritten");
            }
        }

        info!("agent stopped");

        Ok(summary)
    }

    /// Spawn background event stats reporter.
    fn spawn_event_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.stats);
        let health = Arc::clone(&self.health);
        let store = Arc::clone(&self.store);
        let resolver = Arc::clone(&self.resolver);
        let interval = self.cfg.stats_interval;

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        health.applications_tracked.set(store.app_count() as f64);
                        health.identity_cache_entries.set(resolver.cached_len() as f64);

                        let snapshot = stats.snapshot();
                        if snapshot.is_empty() {
                            continue;
                        }

                        info!(
                            decoded = snapshot.decoded(),
                            decode_errors = snapshot.decode_errors,
                            unattributed = snapshot.unattributed,
                            window = ?interval,
                            "event stats"
                        );

                        for (hook, count) in &snapshot.by_hook {
                            debug!(hook = %hook, count, "  by hook");
                        }
                    }
                }
            }
        });
    }
}
