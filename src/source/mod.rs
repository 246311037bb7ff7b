pub mod event;
pub mod normalize;
pub mod parse;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::InputConfig;
use crate::export::health::HealthMetrics;

use self::event::CanonicalEvent;
use self::normalize::Normalizer;
use self::parse::parse_line;
use self::stats::SourceStats;

/// Reads newline-delimited JSON records, normalizes them and forwards the
/// resulting events to the sink channel.
pub struct LineSource {
    path: Option<PathBuf>,
    normalizer: Normalizer,
    stats: Arc<SourceStats>,
    health: Option<Arc<HealthMetrics>>,
}

impl LineSource {
    /// Creates a new line source. Reads stdin when no path is configured.
    pub fn new(cfg: &InputConfig, normalizer: Normalizer, stats: Arc<SourceStats>) -> Self {
        Self {
            path: cfg.path.clone(),
            normalizer,
            stats,
            health: None,
        }
    }

    /// Report record counters to the health metrics.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Read until end of input or cancellation. Returns the number of lines read.
    pub async fn run(
        &self,
        ctx: CancellationToken,
        tx: mpsc::Sender<CanonicalEvent>,
    ) -> Result<u64> {
        let lines = match &self.path {
            Some(path) => {
                let file = tokio::fs::File::open(path)
                    .await
                    .with_context(|| format!("opening input {}", path.display()))?;
                info!(path = %path.display(), "reading records from file");
                self.pump(BufReader::new(file), ctx, tx).await?
            }
            None => {
                info!("reading records from stdin");
                self.pump(BufReader::new(tokio::io::stdin()), ctx, tx)
                    .await?
            }
        };

        info!(lines, "input finished");

        Ok(lines)
    }

    /// Forward every event produced by `reader` until EOF, cancellation, or
    /// the sink closing its channel.
    pub async fn pump<R>(
        &self,
        reader: R,
        ctx: CancellationToken,
        tx: mpsc::Sender<CanonicalEvent>,
    ) -> Result<u64>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut reader = reader.lines();
        let mut count = 0u64;

        loop {
            let line = tokio::select! {
                biased;
                _ = ctx.cancelled() => break,
                line = reader.next_line() => line.context("reading input line")?,
            };

            let Some(line) = line else {
                break;
            };
            count += 1;

            let Some(event) = self.process_line(&line, chrono::Utc::now().timestamp()) else {
                continue;
            };

            if tx.send(event).await.is_err() {
                debug!("sink channel closed, stopping input");
                break;
            }
        }

        Ok(count)
    }

    /// Parse and normalize a single line, updating counters. Blank lines are
    /// ignored without counting.
    pub fn process_line(&self, line: &str, now: i64) -> Option<CanonicalEvent> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        if let Some(health) = &self.health {
            health.records_received.inc();
        }

        let raw = match parse_line(line, now) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(error = %e, "skipping malformed line");
                self.stats.record_malformed();
                if let Some(health) = &self.health {
                    health.records_dropped.with_label_values(&["malformed"]).inc();
                }
                return None;
            }
        };

        match self.normalizer.normalize(raw) {
            Ok(event) => {
                self.stats.record_accepted();
                Some(event)
            }
            Err(reason) => {
                self.stats.record_dropped(reason);
                if let Some(health) = &self.health {
                    health
                        .records_dropped
                        .with_label_values(&[reason.as_str()])
                        .inc();
                }
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NormalizeConfig;

    fn source() -> LineSource {
        LineSource::new(
            &InputConfig::default(),
            Normalizer::new(&NormalizeConfig::default()),
            Arc::new(SourceStats::new()),
        )
    }

    #[test]
    fn test_process_line_counts_outcomes() {
        let src = source();

        assert!(src
            .process_line(r#"{"tag":"t","time":60,"record":{"value":1}}"#, 0)
            .is_some());
        assert!(src.process_line("{oops", 0).is_none());
        assert!(src
            .process_line(r#"{"tag":"t","record":{"value":0}}"#, 0)
            .is_none());
        assert!(src.process_line("   ", 0).is_none());

        let snap = src.stats.snapshot();
        assert_eq!(snap.accepted, 1);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.zero, 1);
    }

    #[tokio::test]
    async fn test_pump_forwards_events_until_eof() {
        let src = source();
        let input = concat!(
            r#"{"tag":"a","time":60,"record":{"value":1}}"#,
            "\n",
            "\n",
            r#"{"tag":"b","time":120,"record":{"value":2.5}}"#,
            "\n",
        );
        let (tx, mut rx) = mpsc::channel(8);

        let lines = src
            .pump(input.as_bytes(), CancellationToken::new(), tx)
            .await
            .expect("pump");
        assert_eq!(lines, 3);

        let first = rx.recv().await.expect("first event");
        let second = rx.recv().await.expect("second event");
        assert_eq!(first.tag, "a");
        assert_eq!(second.tag, "b");
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_pump_stops_on_cancellation() {
        let src = source();
        let ctx = CancellationToken::new();
        ctx.cancel();
        let (tx, _rx) = mpsc::channel(1);

        let lines = src
            .pump(&b"{\"tag\":\"a\",\"record\":{\"value\":1}}\n"[..], ctx, tx)
            .await
            .expect("pump");
        assert_eq!(lines, 0);
    }
}
