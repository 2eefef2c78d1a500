use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    CounterVec, Encoder, Gauge, Histogram, HistogramOpts, HistogramVec, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

/// Prometheus metrics for pipeline health and observability.
///
/// All metrics use the "statespan" namespace. Per-stage metrics are
/// labelled with the configured stage name.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    /// Source rows consumed by stage.
    pub rows_read: CounterVec,
    /// Interval records emitted by stage.
    pub intervals_emitted: CounterVec,
    /// Stage failures by stage and error kind.
    pub stage_failures: CounterVec,
    /// Whether the warehouse connection is established (1=yes, 0=no).
    pub warehouse_connected: Gauge,
    /// Wall-clock stage duration by stage.
    pub stage_duration: HistogramVec,
    /// Interval records per sink batch.
    pub sink_batch_size: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let rows_read = CounterVec::new(
            Opts::new("rows_read_total", "Total source rows consumed by stage.")
                .namespace("statespan"),
            &["stage"],
        )?;
        let intervals_emitted = CounterVec::new(
            Opts::new(
                "intervals_emitted_total",
                "Total interval records emitted by stage.",
            )
            .namespace("statespan"),
            &["stage"],
        )?;
        let stage_failures = CounterVec::new(
            Opts::new(
                "stage_failures_total",
                "Total stage failures by stage and error kind.",
            )
            .namespace("statespan"),
            &["stage", "kind"],
        )?;
        let warehouse_connected = Gauge::with_opts(
            Opts::new(
                "warehouse_connected",
                "Whether the warehouse connection is established (1=yes, 0=no).",
            )
            .namespace("statespan"),
        )?;
        let stage_duration = HistogramVec::new(
            HistogramOpts::new(
                "stage_duration_seconds",
                "Wall-clock duration of a stage run.",
            )
            .namespace("statespan")
            .buckets(vec![0.1, 0.5, 1.0, 5.0, 10.0, 60.0, 300.0]),
            &["stage"],
        )?;
        let sink_batch_size = Histogram::with_opts(
            HistogramOpts::new("sink_batch_size", "Interval records per sink batch.")
                .namespace("statespan")
                .buckets(vec![100.0, 500.0, 1000.0, 5000.0, 10000.0, 25000.0]),
        )?;

        registry.register(Box::new(rows_read.clone()))?;
        registry.register(Box::new(intervals_emitted.clone()))?;
        registry.register(Box::new(stage_failures.clone()))?;
        registry.register(Box::new(warehouse_connected.clone()))?;
        registry.register(Box::new(stage_duration.clone()))?;
        registry.register(Box::new(sink_batch_size.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            rows_read,
            intervals_emitted,
            stage_failures,
            warehouse_connected,
            stage_duration,
            sink_batch_size,
        })
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

        let registry = self.registry.clone();
        let app_state = Arc::new(AppState { registry });

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

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = state.registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "encoding metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "encoding error".to_string(),
        );
    }

    match String::from_utf8(buffer) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "converting metrics to string");
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
