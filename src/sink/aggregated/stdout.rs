use std::io::Write;

use anyhow::{Context, Result};
use chrono::DateTime;
use tokio_util::sync::CancellationToken;

use super::metric::{AggregateBatch, AggregateRow};

/// Prints one line per aggregate row to standard output.
#[derive(Debug, Default)]
pub struct StdoutExporter;

impl StdoutExporter {
    pub fn new() -> Self {
        Self
    }

    pub fn name(&self) -> &str {
        "stdout"
    }

    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        Ok(())
    }

    pub async fn export(&mut self, batch: &AggregateBatch) -> Result<()> {
        let stdout = std::io::stdout();
        let mut out = stdout.lock();
        for row in &batch.rows {
            writeln!(out, "{}", format_row(row)).context("writing to stdout")?;
        }
        out.flush().context("flushing stdout")
    }

    pub async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

fn format_time(time: i64) -> String {
    match DateTime::from_timestamp(time, 0) {
        Some(t) => t.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
        None => time.to_string(),
    }
}

/// `<time> <tag>: <value>`, with `[<key>=<value>]` before the colon for
/// segmented rows.
pub fn format_row(row: &AggregateRow) -> String {
    let time = format_time(row.time);
    match row.segment() {
        Some((key, value)) => format!("{time} {} [{key}={value}]: {}", row.tag, row.value),
        None => format!("{time} {}: {}", row.tag, row.value),
    }
}
