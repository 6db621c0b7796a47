use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, Opts, Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "codeint";

/// Prometheus metrics for agent health and observability.
///
/// All metrics use the "codeint" namespace. The registry is always populated;
/// the HTTP server exposing it is optional.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,

    /// Total raw records pulled from the transport.
    pub events_received: Counter,
    /// Records rejected by the decoder, by error_type.
    pub event_decode_errors: CounterVec,
    /// Decoded events from processes without an identity.
    pub events_unattributed: Counter,
    /// Events folded into the store, by hook.
    pub events_merged: CounterVec,
    /// New aggregate entries created, by hook.
    pub entries_created: CounterVec,
    /// Applications with aggregation state.
    pub applications_tracked: Gauge,
    /// Pids with a cached identity result.
    pub identity_cache_entries: Gauge,
    /// Completed flush cycles, by trigger (periodic/shutdown).
    pub manifest_flushes: CounterVec,
    /// Manifests that failed to serialize or write.
    pub manifest_write_errors: Counter,
    /// Duration of a full flush cycle (1ms-5s buckets).
    pub flush_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = Counter::with_opts(
            Opts::new(
                "events_received_total",
                "Total raw records received from the transport.",
            )
            .namespace(NAMESPACE),
        )?;
        let event_decode_errors = CounterVec::new(
            Opts::new(
                "event_decode_errors_total",
                "Records rejected by the decoder by error type.",
            )
            .namespace(NAMESPACE),
            &["error_type"],
        )?;
        let events_unattributed = Counter::with_opts(
            Opts::new(
                "events_unattributed_total",
                "Events dropped because the process has no application identity.",
            )
            .namespace(NAMESPACE),
        )?;
        let events_merged = CounterVec::new(
            Opts::new(
                "events_merged_total",
                "Events merged into the aggregation store by hook.",
            )
            .namespace(NAMESPACE),
            &["hook"],
        )?;
        let entries_created = CounterVec::new(
            Opts::new(
                "entries_created_total",
                "Distinct aggregate entries created by hook.",
            )
            .namespace(NAMESPACE),
            &["hook"],
        )?;
        let applications_tracked = Gauge::with_opts(
            Opts::new(
                "applications_tracked",
                "Number of applications with aggregation state.",
            )
            .namespace(NAMESPACE),
        )?;
        let identity_cache_entries = Gauge::with_opts(
            Opts::new(
                "identity_cache_entries",
                "Number of pids with a cached identity lookup.",
            )
            .namespace(NAMESPACE),
        )?;
        let manifest_flushes = CounterVec::new(
            Opts::new("manifest_flushes_total", "Completed flush cycles by trigger.")
                .namespace(NAMESPACE),
            &["trigger"],
        )?;
        let manifest_write_errors = Counter::with_opts(
            Opts::new(
                "manifest_write_errors_total",
                "Manifests that failed to serialize or write.",
            )
            .namespace(NAMESPACE),
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Duration of a full manifest flush cycle.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![
                0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0,
            ]),
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(event_decode_errors.clone()))?;
        registry.register(Box::new(events_unattributed.clone()))?;
        registry.register(Box::new(events_merged.clone()))?;
        registry.register(Box::new(entries_created.clone()))?;
        registry.register(Box::new(applications_tracked.clone()))?;
        registry.register(Box::new(identity_cache_entries.clone()))?;
        registry.register(Box::new(manifest_flushes.clone()))?;
        registry.register(Box::new(manifest_write_errors.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            local_addr: parking_lot::Mutex::new(None),
            events_received,
            event_decode_errors,
            events_unattributed,
            events_merged,
            entries_created,
            applications_tracked,
            identity_cache_entries,
            manifest_flushes,
            manifest_write_errors,
            flush_duration,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn gather_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Address the server is bound to, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let addr = if self.addr.is_empty() {
            ":9090"
        } else {
            &self.addr
        };

        // Parse address, handling ":port" shorthand.
        let bind_addr = if addr.starts_with(':') {
            format!("0.0.0.0{addr}")
        } else {
            addr.to_string()
        };

        let app_state = Arc::new(AppState {
            registry: self.registry.clone(),
        });

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/healthz", get(healthz_handler))
            .with_state(app_state);

        let listener = TcpListener::bind(&bind_addr)
            .await
            .with_context(|| format!("listening on {bind_addr}"))?;

        let local_addr = listener.local_addr().context("getting local address")?;
        *self.local_addr.lock() = Some(local_addr);

        let cancel = CancellationToken::new();
        *self.shutdown.lock() = Some(cancel.clone());

        tokio::spawn(async move {
            tracing::info!(addr = %local_addr, "health metrics server started");

            let result = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
            })
            .await;

            if let Err(e) = result {
                tracing::error!(error = %e, "health metrics server error");
            }
        });

        Ok(())
    }

    /// Whether the HTTP server has been started and not yet stopped.
    pub fn is_running(&self) -> bool {
        self.shutdown.lock().is_some()
    }

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;
    String::from_utf8(buffer).context("converting metrics to string")
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode_registry(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "encoding metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "encoding error".to_string(),
            )
        }
    }
}

/// GET /healthz - Simple health check.
async fn healthz_handler() -> &'static str {
    "ok"
}
