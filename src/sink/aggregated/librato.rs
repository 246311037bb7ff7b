use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::LibratoConfig;
use crate::export::health::HealthMetrics;
use crate::source::event::{UpdateMode, Value};

use super::http::{build_client, send};
use super::metric::{AggregateBatch, AggregateRow};

const EXPORTER_NAME: &str = "librato";

/// Gauges sent per request.
pub const LIBRATO_SLICE_SIZE: usize = 50;

#[derive(Debug, Serialize)]
struct GaugesPayload<'a> {
    gauges: Vec<Gauge<'a>>,
}

#[derive(Debug, Serialize)]
struct Gauge<'a> {
    name: String,
    measure_time: i64,
    value: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<&'a str>,
}

/// Pushes aggregate rows to Librato as gauges, declaring each metric's
/// summarization function before its first use.
pub struct LibratoExporter {
    cfg: LibratoConfig,
    client: Option<reqwest::Client>,
    initialized: HashSet<String>,
    health: Option<Arc<HealthMetrics>>,
}

impl LibratoExporter {
    pub fn new(cfg: LibratoConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            client: None,
            initialized: HashSet::new(),
            health,
        }
    }

    pub fn name(&self) -> &str {
        EXPORTER_NAME
    }

    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        self.client = Some(build_client(self.cfg.timeout)?);
        Ok(())
    }

    pub async fn export(&mut self, batch: &AggregateBatch) -> Result<()> {
        let client = self
            .client
            .clone()
            .ok_or_else(|| anyhow!("librato exporter not started"))?;

        let url = format!("{}/v1/metrics", self.cfg.endpoint.trim_end_matches('/'));

        for slice in batch.rows.chunks(LIBRATO_SLICE_SIZE) {
            let mut gauges = Vec::with_capacity(slice.len());
            for row in slice {
                let gauge = gauge(row);
                self.ensure_initialized(&client, &gauge.name, row.update_mode)
                    .await?;
                gauges.push(gauge);
            }

            trace!(gauges = gauges.len(), "librato metrics");

            let request = client
                .post(&url)
                .basic_auth(&self.cfg.user, Some(&self.cfg.token))
                .json(&GaugesPayload { gauges });

            if send(EXPORTER_NAME, request).await {
                if let Some(h) = &self.health {
                    h.rows_exported.inc_by(slice.len() as f64);
                }
            } else {
                self.record_error();
            }
        }

        Ok(())
    }

    /// Declares the metric once per process. A failed declaration is
    /// retried on the metric's next appearance.
    async fn ensure_initialized(
        &mut self,
        client: &reqwest::Client,
        name: &str,
        mode: UpdateMode,
    ) -> Result<()> {
        if self.initialized.contains(name) {
            return Ok(());
        }

        let mut url = reqwest::Url::parse(&self.cfg.endpoint)
            .with_context(|| format!("parsing librato endpoint {}", self.cfg.endpoint))?;
        url.path_segments_mut()
            .map_err(|()| anyhow!("librato endpoint cannot be a base: {}", self.cfg.endpoint))?
            .pop_if_empty()
            .extend(["v1", "metrics", name]);

        debug!(metric = name, mode = %mode, "librato initialize metric");

        let request = client
            .put(url)
            .basic_auth(&self.cfg.user, Some(&self.cfg.token))
            .json(&metric_attributes(mode));

        if send(EXPORTER_NAME, request).await {
            self.initialized.insert(name.to_string());
        } else {
            self.record_error();
        }

        Ok(())
    }

    fn record_error(&self) {
        if let Some(h) = &self.health {
            h.export_errors.with_label_values(&[EXPORTER_NAME]).inc();
        }
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

fn gauge(row: &AggregateRow) -> Gauge<'_> {
    match row.segment() {
        Some((key, value)) => Gauge {
            name: format!("{}:{key}", row.tag),
            measure_time: row.time,
            value: row.value,
            source: Some(value),
        },
        None => Gauge {
            name: row.tag.clone(),
            measure_time: row.time,
            value: row.value,
            source: None,
        },
    }
}

fn metric_attributes(mode: UpdateMode) -> serde_json::Value {
    match mode {
        UpdateMode::Add => json!({
            "type": "gauge",
            "attributes": { "source_aggregate": true, "summarize_function": "sum" },
        }),
        UpdateMode::Max => json!({
            "type": "gauge",
            "attributes": { "summarize_function": "max" },
        }),
        UpdateMode::Average => json!({
            "type": "gauge",
            "attributes": { "summarize_function": "average" },
        }),
    }
}
