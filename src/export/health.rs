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

/// Prometheus metrics for pipeline health.
///
/// All metrics use the "metricsense" namespace.
pub struct HealthMetrics {
    registry: Registry,
    addr: String,
    shutdown: parking_lot::Mutex<Option<CancellationToken>>,

    // === Source ===
    /// Total input records read.
    pub records_received: Counter,
    /// Records that produced no event, by reason.
    pub records_dropped: CounterVec,

    // === Sink ===
    /// Events currently buffered for the next flush.
    pub events_buffered: Gauge,
    /// Events dropped because the redelivery buffer was full.
    pub events_overflowed: Counter,
    /// Buffered events discarded after the last redelivery attempt failed.
    pub events_discarded: Counter,
    /// Flushes by outcome (ok/error).
    pub flushes: CounterVec,
    /// Flush duration including the exporter write (1ms-30s buckets).
    pub flush_duration: Histogram,
    /// Aggregate rows handed to the exporter.
    pub rows_exported: Counter,
    /// Export errors by exporter.
    pub export_errors: CounterVec,

    // === Row store ===
    /// Dictionary table reloads by dictionary (metric/segment).
    pub dictionary_reloads: CounterVec,
    /// Row creation statements skipped by the suppression ring.
    pub row_creations_suppressed: Counter,
    /// Row creation statements issued.
    pub row_creations: Counter,
    /// Minute deltas skipped because they were not finite.
    pub deltas_rejected: Counter,
}

impl HealthMetrics {
    /// Creates a new health metrics instance with all metrics registered.
    pub fn new(addr: &str) -> Result<Self> {
        let registry = Registry::new();

        // === Source ===
        let records_received = Counter::with_opts(
            Opts::new("records_received_total", "Total input records read.")
                .namespace("metricsense"),
        )?;
        let records_dropped = CounterVec::new(
            Opts::new(
                "records_dropped_total",
                "Input records that produced no event, by reason.",
            )
            .namespace("metricsense"),
            &["reason"],
        )?;

        // === Sink ===
        let events_buffered = Gauge::with_opts(
            Opts::new(
                "events_buffered",
                "Events currently buffered for the next flush.",
            )
            .namespace("metricsense"),
        )?;
        let events_overflowed = Counter::with_opts(
            Opts::new(
                "events_overflowed_total",
                "Events dropped because the redelivery buffer was full.",
            )
            .namespace("metricsense"),
        )?;
        let events_discarded = Counter::with_opts(
            Opts::new(
                "events_discarded_total",
                "Buffered events discarded after redelivery attempts ran out.",
            )
            .namespace("metricsense"),
        )?;
        let flushes = CounterVec::new(
            Opts::new("flushes_total", "Aggregation flushes by outcome.")
                .namespace("metricsense"),
            &["status"],
        )?;
        let flush_duration = Histogram::with_opts(
            HistogramOpts::new(
                "flush_duration_seconds",
                "Flush duration including the exporter write.",
            )
            .namespace("metricsense")
            .buckets(vec![0.001, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]),
        )?;
        let rows_exported = Counter::with_opts(
            Opts::new(
                "rows_exported_total",
                "Aggregate rows handed to the exporter.",
            )
            .namespace("metricsense"),
        )?;
        let export_errors = CounterVec::new(
            Opts::new("export_errors_total", "Export errors by exporter.")
                .namespace("metricsense"),
            &["exporter"],
        )?;

        // === Row store ===
        let dictionary_reloads = CounterVec::new(
            Opts::new(
                "dictionary_reloads_total",
                "Dictionary table reloads by dictionary.",
            )
            .namespace("metricsense"),
            &["dictionary"],
        )?;
        let row_creations_suppressed = Counter::with_opts(
            Opts::new(
                "row_creations_suppressed_total",
                "Row creation statements skipped by the suppression ring.",
            )
            .namespace("metricsense"),
        )?;
        let row_creations = Counter::with_opts(
            Opts::new("row_creations_total", "Row creation statements issued.")
                .namespace("metricsense"),
        )?;
        let deltas_rejected = Counter::with_opts(
            Opts::new(
                "deltas_rejected_total",
                "Minute deltas skipped because they were not finite.",
            )
            .namespace("metricsense"),
        )?;

        registry.register(Box::new(records_received.clone()))?;
        registry.register(Box::new(records_dropped.clone()))?;
        registry.register(Box::new(events_buffered.clone()))?;
        registry.register(Box::new(events_overflowed.clone()))?;
        registry.register(Box::new(events_discarded.clone()))?;
        registry.register(Box::new(flushes.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(rows_exported.clone()))?;
        registry.register(Box::new(export_errors.clone()))?;
        registry.register(Box::new(dictionary_reloads.clone()))?;
        registry.register(Box::new(row_creations_suppressed.clone()))?;
        registry.register(Box::new(row_creations.clone()))?;
        registry.register(Box::new(deltas_rejected.clone()))?;

        Ok(Self {
            registry,
            addr: addr.to_string(),
            shutdown: parking_lot::Mutex::new(None),
            records_received,
            records_dropped,
            events_buffered,
            events_overflowed,
            events_discarded,
            flushes,
            flush_duration,
            rows_exported,
            export_errors,
            dictionary_reloads,
            row_creations_suppressed,
            row_creations,
            deltas_rejected,
        })
    }

    /// Returns true if the HTTP server is configured to run.
    pub fn enabled(&self) -> bool {
        !self.addr.is_empty()
    }

    /// Starts the HTTP server serving /metrics and /healthz.
    pub async fn start(&self) -> Result<()> {
        if !self.enabled() {
            tracing::info!("health metrics server disabled");
            return Ok(());
        }

        // Parse address, handling ":port" shorthand.
        let bind_addr = if self.addr.starts_with(':') {
            format!("0.0.0.0{}", self.addr)
        } else {
            self.addr.clone()
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

    /// Render all registered metrics in Prometheus text format.
    #[cfg(test)]
    pub(crate) fn encode_text(&self) -> Result<String> {
        encode_registry(&self.registry)
    }
}

/// Shared state for axum handlers.
struct AppState {
    registry: Registry,
}

fn encode_registry(registry: &Registry) -> Result<String> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .context("encoding metrics")?;

    String::from_utf8(buffer).context("converting metrics to string")
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_registered_with_namespace() {
        let health = HealthMetrics::new("").expect("metrics should register");
        health.records_received.inc();
        health.records_dropped.with_label_values(&["zero"]).inc();
        health.flushes.with_label_values(&["ok"]).inc();

        let text = health.encode_text().expect("encode");
        assert!(text.contains("metricsense_records_received_total 1"));
        assert!(text.contains("metricsense_records_dropped_total{reason=\"zero\"} 1"));
        assert!(text.contains("metricsense_flushes_total{status=\"ok\"} 1"));
    }

    #[tokio::test]
    async fn test_disabled_server_start_is_noop() {
        let health = HealthMetrics::new("").expect("metrics should register");
        assert!(!health.enabled());
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let health = HealthMetrics::new("127.0.0.1:0").expect("metrics should register");
        health.start().await.expect("start");
        health.stop().await.expect("stop");
    }
}
