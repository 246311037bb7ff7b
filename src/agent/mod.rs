use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::sink::aggregated::exporter::Exporter;
use crate::sink::aggregated::AggregatedSink;
use crate::sink::Sink;
use crate::source::normalize::Normalizer;
use crate::source::stats::SourceStats;
use crate::source::LineSource;

/// Agent orchestrates all components: record source, aggregated sink,
/// exporter and health server.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    sink: Option<AggregatedSink>,
    source_task: Option<JoinHandle<Result<u64>>>,
    source_stats: Arc<SourceStats>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            sink: None,
            source_task: None,
            source_stats: Arc::new(SourceStats::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Start all components and begin reading records.
    pub async fn start(&mut self) -> Result<()> {
        // 1. Health server first so health checks respond during backend setup.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 2. Exporter for the configured backend.
        let exporter = Exporter::from_config(&self.cfg.backend, Some(Arc::clone(&self.health)))
            .with_context(|| format!("configuring {} backend", self.cfg.backend.name()))?;
        info!(backend = self.cfg.backend.name(), "exporter configured");

        // 3. Aggregated sink (starts the exporter and spawns the flush loop).
        let mut sink = AggregatedSink::new(
            self.cfg.aggregation.clone(),
            self.cfg.input.channel_capacity,
        )
        .with_health(Arc::clone(&self.health));
        sink.set_exporter(exporter);

        sink.start(self.cancel.child_token())
            .await
            .with_context(|| format!("starting {} sink", sink.name()))?;

        // 4. Record source feeding the sink.
        let source = LineSource::new(
            &self.cfg.input,
            Normalizer::new(&self.cfg.normalize),
            Arc::clone(&self.source_stats),
        )
        .with_health(Arc::clone(&self.health));

        let tx = sink.sender();
        let ctx = self.cancel.child_token();
        self.source_task = Some(tokio::spawn(async move { source.run(ctx, tx).await }));

        self.sink = Some(sink);

        // 5. Background monitors.
        self.spawn_source_stats_reporter();

        info!("agent fully started");

        Ok(())
    }

    /// Waits until the record source reaches end of input.
    ///
    /// Returns immediately if the source already finished.
    pub async fn wait_for_input(&mut self) -> Result<()> {
        let Some(task) = self.source_task.as_mut() else {
            return Ok(());
        };

        let result = task.await;
        self.source_task = None;

        match result {
            Ok(Ok(lines)) => {
                debug!(lines, "record source finished");
                Ok(())
            }
            Ok(Err(e)) => Err(e.context("reading records")),
            Err(e) => Err(anyhow!("record source task failed: {e}")),
        }
    }

    /// Gracefully stop all components.
    pub async fn stop(&mut self) -> Result<()> {
        // Signal all background tasks to stop.
        self.cancel.cancel();

        // The source stops forwarding before the sink performs its final flush.
        if let Some(task) = self.source_task.take() {
            match task.await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "record source stopped with error"),
                Err(e) => tracing::warn!(error = %e, "record source task join failed"),
            }
        }

        // Wait for sink task to finish final flush/export shutdown.
        if let Some(sink) = &self.sink {
            sink.wait_for_shutdown().await;
        }

        // Stop health metrics server.
        self.health.stop().await?;

        Ok(())
    }

    /// Spawn background source stats reporter.
    fn spawn_source_stats_reporter(&self) {
        let cancel = self.cancel.clone();
        let stats = Arc::clone(&self.source_stats);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let snapshot = stats.snapshot();

                        if snapshot.accepted == 0 && snapshot.dropped() == 0 {
                            continue;
                        }

                        info!(
                            accepted = snapshot.accepted,
                            dropped = snapshot.dropped(),
                            "source stats (60s)",
                        );
                        debug!(
                            malformed = snapshot.malformed,
                            missing_value = snapshot.missing_value,
                            non_numeric = snapshot.non_numeric,
                            zero = snapshot.zero,
                            "  dropped by reason (60s)",
                        );
                    }
                }
            }
        });
    }
}
