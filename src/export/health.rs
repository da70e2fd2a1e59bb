use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "tallyd";

/// Prometheus metrics for the agent and collector.
///
/// Both roles register the full set; each only moves the metrics on its own
/// path, so a scrape of an agent shows zeroed collector series and vice versa.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Agent ===
    /// Valid submissions decoded from the socket.
    pub events_received: Counter,
    /// Submissions dropped after decoding, by reason (clock_skew, queue_full).
    pub events_dropped: CounterVec,
    /// Datagrams rejected by the decoder, by error type.
    pub malformed_datagrams: CounterVec,
    /// Non-empty tables swapped out and queued for transmission.
    pub snapshots_flushed: Counter,
    /// Snapshots accepted by the collector.
    pub snapshots_sent: Counter,
    /// Snapshots lost to uplink failures.
    pub transmit_errors: Counter,
    /// Keys in the most recently flushed table.
    pub table_keys: Gauge,
    /// Uplink round-trip duration.
    pub transmit_duration: Histogram,

    // === Collector ===
    /// Snapshots merged into the window cache.
    pub snapshots_merged: Counter,
    /// Snapshot bodies rejected at the HTTP ingress, by error type.
    pub ingest_errors: CounterVec,
    /// Time the merge worker holds the write lock per snapshot.
    pub merge_duration: Histogram,
    /// Keys with a live window.
    pub windows_tracked: Gauge,
    /// Windows rebuilt because a snapshot overflowed them.
    pub reanchors: Counter,
    /// Windows made durable by the idle sweep.
    pub idle_flushes: Counter,
    /// Rows written to the durable store.
    pub rows_persisted: Counter,
    /// Persist batches dropped after exhausting retries.
    pub persist_errors: Counter,
    /// Evictions waiting for the persist worker.
    pub persist_queue_length: Gauge,
    /// Chart queries by status (ok, error).
    pub queries: CounterVec,
    /// Chart query duration.
    pub query_duration: Histogram,

    // === Store ===
    /// Whether the last ClickHouse call succeeded (1=yes, 0=no).
    pub clickhouse_connected: Gauge,
    /// ClickHouse call duration by operation (insert, select).
    pub clickhouse_duration: HistogramVec,
}

fn counter(name: &str, help: &str) -> prometheus::Result<Counter> {
    Counter::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> prometheus::Result<CounterVec> {
    CounterVec::new(Opts::new(name, help).namespace(NAMESPACE), labels)
}

fn gauge(name: &str, help: &str) -> prometheus::Result<Gauge> {
    Gauge::with_opts(Opts::new(name, help).namespace(NAMESPACE))
}

fn histogram(name: &str, help: &str, buckets: Vec<f64>) -> prometheus::Result<Histogram> {
    Histogram::with_opts(
        HistogramOpts::new(name, help)
            .namespace(NAMESPACE)
            .buckets(buckets),
    )
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let events_received = counter(
            "events_received_total",
            "Valid submissions decoded from the agent socket.",
        )?;
        let events_dropped = counter_vec(
            "events_dropped_total",
            "Submissions dropped after decoding, by reason.",
            &["reason"],
        )?;
        let malformed_datagrams = counter_vec(
            "malformed_datagrams_total",
            "Datagrams rejected by the decoder, by error type.",
            &["error_type"],
        )?;
        let snapshots_flushed = counter(
            "snapshots_flushed_total",
            "Non-empty tables swapped out for transmission.",
        )?;
        let snapshots_sent = counter(
            "snapshots_sent_total",
            "Snapshots accepted by the collector.",
        )?;
        let transmit_errors = counter(
            "transmit_errors_total",
            "Snapshots lost to uplink failures.",
        )?;
        let table_keys = gauge("table_keys", "Keys in the most recently flushed table.")?;
        let transmit_duration = histogram(
            "transmit_duration_seconds",
            "Uplink round-trip duration.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0],
        )?;

        let snapshots_merged = counter(
            "snapshots_merged_total",
            "Snapshots merged into the window cache.",
        )?;
        let ingest_errors = counter_vec(
            "ingest_errors_total",
            "Snapshot bodies rejected at the HTTP ingress, by error type.",
            &["error_type"],
        )?;
        let merge_duration = histogram(
            "merge_duration_seconds",
            "Time spent applying one snapshot under the window lock.",
            vec![0.00001, 0.0001, 0.001, 0.01, 0.1],
        )?;
        let windows_tracked = gauge("windows_tracked", "Keys with a live window.")?;
        let reanchors = counter(
            "reanchors_total",
            "Windows rebuilt because a snapshot overflowed them.",
        )?;
        let idle_flushes = counter(
            "idle_flushes_total",
            "Windows made durable by the idle sweep.",
        )?;
        let rows_persisted = counter(
            "rows_persisted_total",
            "Rows written to the durable store.",
        )?;
        let persist_errors = counter(
            "persist_errors_total",
            "Persist batches dropped after exhausting retries.",
        )?;
        let persist_queue_length = gauge(
            "persist_queue_length",
            "Evictions waiting for the persist worker.",
        )?;
        let queries = counter_vec("queries_total", "Chart queries by status.", &["status"])?;
        let query_duration = histogram(
            "query_duration_seconds",
            "Chart query duration.",
            vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0],
        )?;

        let clickhouse_connected = gauge(
            "clickhouse_connected",
            "Whether the last ClickHouse call succeeded (1=yes, 0=no).",
        )?;
        let clickhouse_duration = HistogramVec::new(
            HistogramOpts::new(
                "clickhouse_duration_seconds",
                "ClickHouse call duration by operation.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
            &["operation"],
        )?;

        registry.register(Box::new(events_received.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(malformed_datagrams.clone()))?;
        registry.register(Box::new(snapshots_flushed.clone()))?;
        registry.register(Box::new(snapshots_sent.clone()))?;
        registry.register(Box::new(transmit_errors.clone()))?;
        registry.register(Box::new(table_keys.clone()))?;
        registry.register(Box::new(transmit_duration.clone()))?;

        registry.register(Box::new(snapshots_merged.clone()))?;
        registry.register(Box::new(ingest_errors.clone()))?;
        registry.register(Box::new(merge_duration.clone()))?;
        registry.register(Box::new(windows_tracked.clone()))?;
        registry.register(Box::new(reanchors.clone()))?;
        registry.register(Box::new(idle_flushes.clone()))?;
        registry.register(Box::new(rows_persisted.clone()))?;
        registry.register(Box::new(persist_errors.clone()))?;
        registry.register(Box::new(persist_queue_length.clone()))?;
        registry.register(Box::new(queries.clone()))?;
        registry.register(Box::new(query_duration.clone()))?;

        registry.register(Box::new(clickhouse_connected.clone()))?;
        registry.register(Box::new(clickhouse_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            events_received,
            events_dropped,
            malformed_datagrams,
            snapshots_flushed,
            snapshots_sent,
            transmit_errors,
            table_keys,
            transmit_duration,
            snapshots_merged,
            ingest_errors,
            merge_duration,
            windows_tracked,
            reanchors,
            idle_flushes,
            rows_persisted,
            persist_errors,
            persist_queue_length,
            queries,
            query_duration,
            clickhouse_connected,
            clickhouse_duration,
        })
    }

    /// Renders the registry in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode_registry(&self.registry)
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        let bind_addr = bind_address(&self.addr, ":9090");

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

    /// Gracefully shuts down the health metrics server.
    pub async fn stop(&self) -> Result<()> {
        if let Some(cancel) = self.shutdown.lock().take() {
            cancel.cancel();
        }

        Ok(())
    }
}

/// Expands the `":port"` shorthand to all interfaces.
pub fn bind_address(addr: &str, fallback: &str) -> String {
    let addr = if addr.is_empty() { fallback } else { addr };
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
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
