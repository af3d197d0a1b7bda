use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, Opts, Registry,
    TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const NAMESPACE: &str = "pingtrack";

/// Prometheus metrics for the tracker.
///
/// All metrics use the "pingtrack" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Rounds ===
    /// Completed polling rounds.
    pub rounds_total: Counter,
    /// Wall time of one polling round.
    pub round_duration: Histogram,
    /// Ticks rejected because the previous round was still running.
    pub rounds_rejected: Counter,

    // === Servers ===
    /// Failed pings by server.
    pub ping_failures: CounterVec,
    /// Last observed player count by server.
    pub player_count: GaugeVec,
    /// Raw counts outside the valid range that were recorded as 0.
    pub player_counts_clamped: Counter,

    // === Storage ===
    /// Whether the storage provider is open (1=yes, 0=no).
    pub storage_connected: Gauge,
    /// Points handed to the storage provider.
    pub points_written: Counter,
    /// Storage failures by operation.
    pub storage_errors: CounterVec,
    /// Retention sweeps that completed.
    pub retention_runs: Counter,
    /// Retention sweep duration.
    pub retention_duration: Histogram,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        let rounds_total = Counter::with_opts(
            Opts::new("rounds_total", "Completed polling rounds.").namespace(NAMESPACE),
        )?;
        let round_duration = Histogram::with_opts(
            HistogramOpts::new(
                "round_duration_seconds",
                "Wall time of one polling round.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let rounds_rejected = Counter::with_opts(
            Opts::new(
                "rounds_rejected_total",
                "Ticks rejected because the previous round was still running.",
            )
            .namespace(NAMESPACE),
        )?;

        let ping_failures = CounterVec::new(
            Opts::new("ping_failures_total", "Failed pings by server.").namespace(NAMESPACE),
            &["server"],
        )?;
        let player_count = GaugeVec::new(
            Opts::new("player_count", "Last observed player count by server.")
                .namespace(NAMESPACE),
            &["server"],
        )?;
        let player_counts_clamped = Counter::with_opts(
            Opts::new(
                "player_counts_clamped_total",
                "Raw player counts outside the valid range that were recorded as 0.",
            )
            .namespace(NAMESPACE),
        )?;

        let storage_connected = Gauge::with_opts(
            Opts::new(
                "storage_connected",
                "Whether the storage provider is open (1=yes, 0=no).",
            )
            .namespace(NAMESPACE),
        )?;
        let points_written = Counter::with_opts(
            Opts::new(
                "points_written_total",
                "Ping points handed to the storage provider.",
            )
            .namespace(NAMESPACE),
        )?;
        let storage_errors = CounterVec::new(
            Opts::new("storage_errors_total", "Storage failures by operation.")
                .namespace(NAMESPACE),
            &["operation"],
        )?;
        let retention_runs = Counter::with_opts(
            Opts::new("retention_runs_total", "Retention sweeps that completed.")
                .namespace(NAMESPACE),
        )?;
        let retention_duration = Histogram::with_opts(
            HistogramOpts::new(
                "retention_duration_seconds",
                "Retention sweep duration.",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.01, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;

        registry.register(Box::new(rounds_total.clone()))?;
        registry.register(Box::new(round_duration.clone()))?;
        registry.register(Box::new(rounds_rejected.clone()))?;
        registry.register(Box::new(ping_failures.clone()))?;
        registry.register(Box::new(player_count.clone()))?;
        registry.register(Box::new(player_counts_clamped.clone()))?;
        registry.register(Box::new(storage_connected.clone()))?;
        registry.register(Box::new(points_written.clone()))?;
        registry.register(Box::new(storage_errors.clone()))?;
        registry.register(Box::new(retention_runs.clone()))?;
        registry.register(Box::new(retention_duration.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            rounds_total,
            round_duration,
            rounds_rejected,
            ping_failures,
            player_count,
            player_counts_clamped,
            storage_connected,
            points_written,
            storage_errors,
            retention_runs,
            retention_duration,
        })
    }

    /// Renders all metrics in Prometheus text format.
    pub fn render(&self) -> Result<String> {
        encode(&self.registry)
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

fn encode(registry: &Registry) -> Result<String> {
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&registry.gather(), &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
}

/// GET /metrics - Prometheus text format.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match encode(&state.registry) {
        Ok(text) => (StatusCode::OK, text),
        Err(e) => {
            tracing::error!(error = %e, "rendering metrics");
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
