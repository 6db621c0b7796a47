use std::sync::Arc;

use prometheus::Counter;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::export::health::HealthMetrics;
use crate::pid::IdentityResolver;
use crate::sink::aggregated::{AggregationStore, FlushHandle, FlushReport, MergeOutcome};
use crate::tracer::event::{HookKind, MAX_HOOK_KIND};
use crate::tracer::parse;
use crate::tracer::stats::EventStats;
use crate::tracer::Transport;

/// Lifecycle of an [`IngestionLoop`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Pulling, decoding and merging records.
    Running,
    /// No longer pulling records; waiting for the final flush.
    Draining,
    /// Final flush done.
    Stopped,
}

/// Totals for one run of the ingestion loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub received: u64,
    pub decode_errors: u64,
    pub unattributed: u64,
    pub merged: u64,
    /// Merged events that created a new aggregate entry.
    pub created: u64,
    /// Attributed events whose aggregation key was empty.
    pub skipped: u64,
    /// Result of the shutdown flush, if a scheduler was attached.
    pub final_flush: Option<FlushReport>,
}

/// Per-hook prometheus counters resolved once at startup.
struct HookCounters {
    merged: Vec<Option<Counter>>,
    created: Vec<Option<Counter>>,
}

impl HookCounters {
    fn new(health: &HealthMetrics) -> Self {
        let mut merged = vec![None; MAX_HOOK_KIND + 1];
        let mut created = vec![None; MAX_HOOK_KIND + 1];

        for &hook in HookKind::all() {
            if let Some(slot) = merged.get_mut(hook as usize) {
                *slot = Some(health.events_merged.with_label_values(&[hook.as_str()]));
            }
            if let Some(slot) = created.get_mut(hook as usize) {
                *slot = Some(health.entries_created.with_label_values(&[hook.as_str()]));
            }
        }

        Self { merged, created }
    }

    fn inc(counters: &[Option<Counter>], hook: HookKind) {
        if let Some(Some(counter)) = counters.get(hook as usize) {
            counter.inc();
        }
    }
}

/// Sequential decode → resolve → merge driver.
///
/// One loop per transport keeps each application's events in arrival order.
/// Cancellation is only observed while waiting for the next record, so a
/// merge always runs to completion.
pub struct IngestionLoop<T> {
    transport: T,
    resolver: Arc<IdentityResolver>,
    store: Arc<AggregationStore>,
    stats: Arc<EventStats>,
    health: Option<(Arc<HealthMetrics>, HookCounters)>,
    state: LoopState,
}

impl<T: Transport> IngestionLoop<T> {
    pub fn new(
        transport: T,
        resolver: Arc<IdentityResolver>,
        store: Arc<AggregationStore>,
        stats: Arc<EventStats>,
    ) -> Self {
        Self {
            transport,
            resolver,
            store,
            stats,
            health: None,
            state: LoopState::Running,
        }
    }

    /// Record ingestion metrics into `health`.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        let counters = HookCounters::new(&health);
        self.health = Some((health, counters));
        self
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// Run until `cancel` fires or the transport closes, then drain.
    ///
    /// While draining, `flush` is finished so the final manifests include
    /// every event merged before the loop stopped.
    pub async fn run(
        &mut self,
        cancel: CancellationToken,
        flush: Option<FlushHandle>,
    ) -> IngestSummary {
        let mut summary = IngestSummary::default();
        self.state = LoopState::Running;

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("shutdown requested, draining");
                    break;
                }
                next = self.transport.next_record() => next,
            };

            match next {
                Ok(Some(record)) => self.process(&record, &mut summary),
                Ok(None) => {
                    info!("transport closed, draining");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "transport failed, draining");
                    break;
                }
            }
        }

        self.state = LoopState::Draining;

        if let Some(flush) = flush {
            match flush.finish().await {
                Ok(report) => summary.final_flush = Some(report),
                Err(e) => error!(error = %e, "final flush failed"),
            }
        }

        self.state = LoopState::Stopped;

        info!(
            received = summary.received,
            decode_errors = summary.decode_errors,
            unattributed = summary.unattributed,
            merged = summary.merged,
            skipped = summary.skipped,
            "ingestion stopped"
        );

        summary
    }

    fn process(&self, record: &[u8], summary: &mut IngestSummary) {
        summary.received += 1;
        if let Some((h, _)) = &self.health {
            h.events_received.inc();
        }

        let event = match parse::decode(record) {
            Ok(event) => event,
            Err(e) => {
                summary.decode_errors += 1;
                self.stats.record_decode_error();
                if let Some((h, _)) = &self.health {
                    h.event_decode_errors.with_label_values(&[e.label()]).inc();
                }
                debug!(error = %e, size = record.len(), "dropping undecodable record");
                return;
            }
        };

        self.stats.record(event.hook);

        let identity = self.resolver.resolve(event.pid);
        let Some(app) = identity.app() else {
            summary.unattributed += 1;
            self.stats.record_unattributed();
            if let Some((h, _)) = &self.health {
                h.events_unattributed.inc();
            }
            return;
        };

        match self.store.merge(app, &event) {
            MergeOutcome::Created => {
                summary.merged += 1;
                summary.created += 1;
                if let Some((_, c)) = &self.health {
                    HookCounters::inc(&c.merged, event.hook);
                    HookCounters::inc(&c.created, event.hook);
                }
            }
            MergeOutcome::Updated => {
                summary.merged += 1;
                if let Some((_, c)) = &self.health {
                    HookCounters::inc(&c.merged, event.hook);
                }
            }
            MergeOutcome::Skipped => summary.skipped += 1,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io;
    use std::time::Duration;

    use crate::clock::ClockAnchor;
    use crate::pid::EnvironSource;
    use crate::sink::aggregated::{FileExporter, FlushScheduler, FlushTrigger, ManifestFormat};
    use crate::sink::manifest::ManifestBuilder;
    use crate::tracer::parse::{RECORD_SIZE, TEXT1_LEN};
    use crate::tracer::transport;

    struct StaticEnviron;

    impl EnvironSource for StaticEnviron {
        fn read_environ(&self, pid: u32) -> io::Result<Vec<u8>> {
            match pid {
                100 => Ok(b"CODEINT_SERVICE=orders\0".to_vec()),
                200 => Ok(b"PATH=/bin\0".to_vec()),
                _ => Err(io::Error::from(io::ErrorKind::NotFound)),
            }
        }
    }

    fn record(ts: u64, pid: u32, hook: u32, num2: u64, text: &str) -> Vec<u8> {
        let mut buf = Vec::with_capacity(RECORD_SIZE);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&pid.to_le_bytes());
        buf.extend_from_slice(&pid.to_le_bytes());
        buf.extend_from_slice(&hook.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&num2.to_le_bytes());
        let mut t1 = [0u8; TEXT1_LEN];
        t1[..text.len()].copy_from_slice(text.as_bytes());
        buf.extend_from_slice(&t1);
        buf.resize(RECORD_SIZE, 0);
        buf
    }

    fn parts() -> (Arc<IdentityResolver>, Arc<AggregationStore>, Arc<EventStats>) {
        (
            Arc::new(IdentityResolver::new(Box::new(StaticEnviron), "CODEINT_SERVICE")),
            Arc::new(AggregationStore::new()),
            Arc::new(EventStats::new()),
        )
    }

    #[tokio::test]
    async fn test_run_until_transport_closes() {
        let (resolver, store, stats) = parts();
        let (tx, rx) = transport::channel(16);

        tx.send(record(0, 100, 2, 0, "/etc/passwd")).await.unwrap();
        tx.send(record(5, 100, 2, 0, "/etc/passwd")).await.unwrap();
        tx.send(record(6, 100, 3, 0, "")).await.unwrap();
        tx.send(record(7, 200, 1, 5432, "")).await.unwrap();
        tx.send(record(8, 300, 1, 5432, "")).await.unwrap();
        tx.send(vec![0u8; 10]).await.unwrap();
        tx.send(record(9, 100, 7, 0, "")).await.unwrap();
        drop(tx);

        let health = Arc::new(HealthMetrics::new(":0").unwrap());
        let mut ingest = IngestionLoop::new(rx, resolver, Arc::clone(&store), Arc::clone(&stats))
            .with_health(Arc::clone(&health));
        let summary = ingest.run(CancellationToken::new(), None).await;

        assert_eq!(ingest.state(), LoopState::Stopped);
        assert_eq!(summary.received, 7);
        assert_eq!(summary.decode_errors, 2);
        assert_eq!(summary.unattributed, 2);
        assert_eq!(summary.merged, 2);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.skipped, 1);
        assert!(summary.final_flush.is_none());

        let snap = store.snapshot("orders").unwrap();
        assert_eq!(snap.filesystem.len(), 1);
        assert_eq!(snap.filesystem[0].seen.count, 2);
        assert_eq!(store.app_count(), 1);

        assert_eq!(
            health.events_merged.with_label_values(&["openat"]).get() as u64,
            2
        );
        assert_eq!(
            health
                .event_decode_errors
                .with_label_values(&["unknown_hook"])
                .get() as u64,
            1
        );

        let s = stats.snapshot();
        assert_eq!(s.decoded(), 5);
        assert_eq!(s.unattributed, 2);
    }

    #[tokio::test]
    async fn test_cancel_unblocks_idle_wait_and_flushes() {
        let (resolver, store, stats) = parts();
        let (tx, rx) = transport::channel(16);
        tx.send(record(1, 100, 3, 0, "SELECT 1")).await.unwrap();

        let tmp = tempfile::tempdir().unwrap();
        let flush = FlushScheduler::new(
            Arc::clone(&store),
            ManifestBuilder::new(true, ClockAnchor::default()),
            FileExporter::new(tmp.path(), ManifestFormat::Yaml),
            Duration::from_secs(3600),
        )
        .spawn();

        let cancel = CancellationToken::new();
        let mut ingest = IngestionLoop::new(rx, resolver, store, stats);
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { ingest.run(cancel, Some(flush)).await })
        };

        // Give the loop time to consume the record and block on the idle queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let summary = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary.merged, 1);
        let report = summary.final_flush.unwrap();
        assert_eq!(report.trigger, FlushTrigger::Shutdown);
        assert_eq!(report.written, 1);
        assert!(tmp.path().join("orders.integrations.yaml").exists());
        drop(tx);
    }
}
