use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use crate::config::BackendConfig;
use crate::export::health::HealthMetrics;

use super::datadog::DatadogExporter;
use super::librato::LibratoExporter;
use super::metric::AggregateBatch;
use super::rdb::RdbExporter;
use super::stdout::StdoutExporter;

/// Exporter dispatches aggregate batches to the configured backend.
///
/// Uses enum dispatch rather than trait objects so the async methods need
/// no boxing.
pub enum Exporter {
    Rdb(RdbExporter),
    Datadog(DatadogExporter),
    Librato(LibratoExporter),
    Stdout(StdoutExporter),
}

impl Exporter {
    /// Builds the exporter selected by `backend.type`.
    pub fn from_config(cfg: &BackendConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        Ok(match cfg {
            BackendConfig::Rdb(c) => Self::Rdb(RdbExporter::new(c.clone(), health)?),
            BackendConfig::Datadog(c) => Self::Datadog(DatadogExporter::new(c.clone(), health)),
            BackendConfig::Librato(c) => Self::Librato(LibratoExporter::new(c.clone(), health)),
            BackendConfig::Stdout => Self::Stdout(StdoutExporter::new()),
        })
    }

    /// Returns the exporter name for logging.
    pub fn name(&self) -> &str {
        match self {
            Self::Rdb(e) => e.name(),
            Self::Datadog(e) => e.name(),
            Self::Librato(e) => e.name(),
            Self::Stdout(e) => e.name(),
        }
    }

    /// Initialize the exporter.
    pub async fn start(&mut self, ctx: CancellationToken) -> Result<()> {
        match self {
            Self::Rdb(e) => e.start(ctx).await,
            Self::Datadog(e) => e.start(ctx).await,
            Self::Librato(e) => e.start(ctx).await,
            Self::Stdout(e) => e.start(ctx).await,
        }
    }

    /// Export one flush worth of rows.
    pub async fn export(&mut self, batch: &AggregateBatch) -> Result<()> {
        match self {
            Self::Rdb(e) => e.export(batch).await,
            Self::Datadog(e) => e.export(batch).await,
            Self::Librato(e) => e.export(batch).await,
            Self::Stdout(e) => e.export(batch).await,
        }
    }

    /// Shut down the exporter.
    pub async fn stop(&mut self) -> Result<()> {
        match self {
            Self::Rdb(e) => e.stop().await,
            Self::Datadog(e) => e.stop().await,
            Self::Librato(e) => e.stop().await,
            Self::Stdout(e) => e.stop().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DatadogConfig, RdbConfig};

    #[test]
    fn test_from_config_selects_backend() {
        let exp = Exporter::from_config(&BackendConfig::Stdout, None).expect("stdout");
        assert_eq!(exp.name(), "stdout");

        let exp = Exporter::from_config(&BackendConfig::Datadog(DatadogConfig::default()), None)
            .expect("datadog");
        assert_eq!(exp.name(), "datadog");

        let rdb = RdbConfig {
            rdb_url: "sqlite://metrics.db".to_string(),
            rdb_table_prefix: "ms".to_string(),
            row_layout: Default::default(),
        };
        let exp = Exporter::from_config(&BackendConfig::Rdb(rdb), None).expect("rdb");
        assert_eq!(exp.name(), "rdb");
    }

    #[test]
    fn test_from_config_rejects_bad_rdb_url() {
        let rdb = RdbConfig {
            rdb_url: "mysql://localhost/metrics".to_string(),
            rdb_table_prefix: "ms".to_string(),
            row_layout: Default::default(),
        };
        assert!(Exporter::from_config(&BackendConfig::Rdb(rdb), None).is_err());
    }
}
