use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::DatadogConfig;
use crate::export::health::HealthMetrics;
use crate::source::event::Value;

use super::http::{build_client, compress, content_encoding, send};
use super::metric::{AggregateBatch, AggregateRow};

const EXPORTER_NAME: &str = "datadog";

/// Tag attached to series without a segment.
const SIMPLE_SEGMENT_TAG: &str = "simple";

#[derive(Debug, Serialize)]
struct SeriesPayload<'a> {
    series: Vec<Series<'a>>,
}

#[derive(Debug, Serialize)]
struct Series<'a> {
    metric: &'a str,
    points: Vec<(i64, Value)>,
    #[serde(rename = "type")]
    kind: &'static str,
    tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    host: Option<&'a str>,
}

/// Pushes aggregate rows to the Datadog series API as gauges.
pub struct DatadogExporter {
    cfg: DatadogConfig,
    client: Option<reqwest::Client>,
    health: Option<Arc<HealthMetrics>>,
}

impl DatadogExporter {
    pub fn new(cfg: DatadogConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        Self {
            cfg,
            client: None,
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

    /// Sends the batch in slices of `batch_size` rows, one request each.
    /// Failed requests are logged and counted.
    pub async fn export(&mut self, batch: &AggregateBatch) -> Result<()> {
        let Some(client) = &self.client else {
            anyhow::bail!("datadog exporter not started");
        };

        let url = format!("{}/api/v1/series", self.cfg.endpoint.trim_end_matches('/'));

        for slice in batch.rows.chunks(self.cfg.batch_size.max(1)) {
            let payload = build_payload(&self.cfg, slice);
            debug!(series = payload.series.len(), rows = slice.len(), "datadog emit");

            let body = serde_json::to_vec(&payload).context("encoding datadog series")?;
            let body = compress(&body, &self.cfg.compression)?;

            let mut request = client
                .post(&url)
                .header("Content-Type", "application/json")
                .header("DD-API-KEY", &self.cfg.api_key)
                .body(body);
            if !self.cfg.app_key.is_empty() {
                request = request.header("DD-APPLICATION-KEY", &self.cfg.app_key);
            }
            if let Some(encoding) = content_encoding(&self.cfg.compression) {
                request = request.header("Content-Encoding", encoding);
            }

            if send(EXPORTER_NAME, request).await {
                if let Some(h) = &self.health {
                    h.rows_exported.inc_by(slice.len() as f64);
                }
            } else if let Some(h) = &self.health {
                h.export_errors.with_label_values(&[EXPORTER_NAME]).inc();
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        self.client = None;
        Ok(())
    }
}

/// Groups one slice into a series per metric and segment.
fn build_payload<'a>(cfg: &'a DatadogConfig, rows: &'a [AggregateRow]) -> SeriesPayload<'a> {
    let mut points: BTreeMap<(&str, Option<(&str, &str)>), Vec<(i64, Value)>> = BTreeMap::new();
    for row in rows {
        points
            .entry((row.tag.as_str(), row.segment()))
            .or_default()
            .push((row.time, row.value));
    }

    let series = points
        .into_iter()
        .map(|((metric, segment), points)| {
            let mut tags = cfg.tags.clone();
            match segment {
                Some((key, value)) => {
                    tags.push(format!("{key}:{value}"));
                    tags.push(key.to_string());
                }
                None => tags.push(SIMPLE_SEGMENT_TAG.to_string()),
            }

            Series {
                metric,
                points,
                kind: "gauge",
                tags,
                host: cfg.host.as_deref(),
            }
        })
        .collect();

    SeriesPayload { series }
}
