pub mod aggregate;
pub mod buffer;
pub mod collector;
pub mod dimension;
pub mod exporter;
pub mod metric;

pub mod datadog;
pub mod http;
pub mod librato;
pub mod rdb;
pub mod stdout;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::AggregationConfig;
use crate::export::health::HealthMetrics;
use crate::sink::Sink;
use crate::source::event::CanonicalEvent;

use self::buffer::Buffer;
use self::collector::Collector;
use self::exporter::Exporter;

/// Events drained from the channel per wakeup.
const BATCH_SIZE: usize = 256;

/// Buffer and flush bookkeeping owned by the sink run task.
struct FlushState {
    interval_secs: i64,
    collector: Collector,
    buffer: Buffer,
    max_buffered_events: usize,
    max_redelivery_attempts: u32,
    /// The buffer still holds events of a failed export.
    redelivering: bool,
    /// Consecutive failed flushes of the retained buffer.
    failed_attempts: u32,
    /// Events dropped since the last flush because the buffer was full.
    overflowed: u64,
    health: Option<Arc<HealthMetrics>>,
}

impl FlushState {
    fn new(cfg: &AggregationConfig, health: Option<Arc<HealthMetrics>>) -> Self {
        let interval_secs = cfg.aggregate_interval_secs();
        Self {
            interval_secs,
            collector: Collector::new(interval_secs),
            buffer: Buffer::new(interval_secs),
            max_buffered_events: cfg.max_buffered_events,
            max_redelivery_attempts: cfg.max_redelivery_attempts.max(1),
            redelivering: false,
            failed_attempts: 0,
            overflowed: 0,
            health,
        }
    }

    /// Folds an event into the buffer. While a failed export is pending
    /// redelivery the buffer is capped and excess events are dropped.
    fn add(&mut self, event: &CanonicalEvent) {
        if self.redelivering && self.buffer.event_count() >= self.max_buffered_events {
            self.overflowed += 1;
            if let Some(h) = &self.health {
                h.events_overflowed.inc();
            }
            return;
        }

        self.buffer.add(event);
    }

    /// Aggregates the buffer and hands the rows to the exporter.
    ///
    /// On success the buffer is replaced. On failure it is kept, so the next
    /// flush re-aggregates these events together with newer ones, until
    /// `max_redelivery_attempts` failures in a row discard it.
    async fn flush(&mut self, exporter: &mut Exporter) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let started = Instant::now();
        let batch = self.collector.collect(&self.buffer);
        let result = exporter.export(&batch).await;
        let elapsed = started.elapsed();

        let status = match &result {
            Ok(()) => {
                debug!(
                    exporter = exporter.name(),
                    events = batch.metadata.events,
                    rows = batch.len(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "buffer flushed",
                );
                self.reset_buffer();
                "ok"
            }
            Err(e) => {
                self.redelivering = true;
                self.failed_attempts += 1;
                if let Some(h) = &self.health {
                    h.export_errors.with_label_values(&[exporter.name()]).inc();
                }

                if self.failed_attempts >= self.max_redelivery_attempts {
                    let events = self.buffer.event_count();
                    error!(
                        exporter = exporter.name(),
                        events,
                        attempts = self.failed_attempts,
                        error = %format!("{e:#}"),
                        "redelivery attempts exhausted, discarding buffered events",
                    );
                    if let Some(h) = &self.health {
                        h.events_discarded.inc_by(events as f64);
                    }
                    self.reset_buffer();
                }
                "error"
            }
        };

        if self.overflowed > 0 {
            warn!(
                dropped = self.overflowed,
                max_buffered_events = self.max_buffered_events,
                "redelivery buffer full, dropped events",
            );
            self.overflowed = 0;
        }

        if let Some(h) = &self.health {
            h.flushes.with_label_values(&[status]).inc();
            h.flush_duration.observe(elapsed.as_secs_f64());
            h.events_buffered.set(self.buffer.event_count() as f64);
        }

        result
    }

    fn reset_buffer(&mut self) {
        self.buffer = Buffer::new(self.interval_secs);
        self.redelivering = false;
        self.failed_attempts = 0;
    }
}

/// Aggregated metrics sink: buffers canonical events and periodically
/// writes their window aggregates through one exporter.
pub struct AggregatedSink {
    cfg: AggregationConfig,
    exporter: Option<Exporter>,
    health: Option<Arc<HealthMetrics>>,

    /// Event channel sender for the processing loop.
    event_tx: mpsc::Sender<CanonicalEvent>,
    /// Event channel receiver, taken by `start`.
    event_rx: Option<mpsc::Receiver<CanonicalEvent>>,

    /// Handle for the sink run task.
    run_task: Arc<tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl AggregatedSink {
    /// Creates a new aggregated sink with an event channel of the given size.
    pub fn new(cfg: AggregationConfig, channel_capacity: usize) -> Self {
        let (event_tx, event_rx) = mpsc::channel(channel_capacity.max(1));

        Self {
            cfg,
            exporter: None,
            health: None,
            event_tx,
            event_rx: Some(event_rx),
            run_task: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Reports buffer and flush metrics to the health registry.
    pub fn with_health(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    /// Sets the exporter that receives every flush.
    pub fn set_exporter(&mut self, exporter: Exporter) {
        self.exporter = Some(exporter);
    }

    /// Sender for producers that wait for channel capacity instead of
    /// dropping events.
    pub fn sender(&self) -> mpsc::Sender<CanonicalEvent> {
        self.event_tx.clone()
    }

    /// Waits for the sink run task to finish.
    pub async fn wait_for_shutdown(&self) {
        let run_task = { self.run_task.lock().await.take() };
        if let Some(run_task) = run_task {
            if let Err(e) = run_task.await {
                warn!(error = %e, "aggregated sink task join failed");
            }
        }
    }
}

impl Sink for AggregatedSink {
    fn name(&self) -> &str {
        "aggregated"
    }

    async fn start(&mut self, ctx: tokio_util::sync::CancellationToken) -> Result<()> {
        let mut event_rx = self
            .event_rx
            .take()
            .context("aggregated sink started more than once")?;
        let mut exporter = self
            .exporter
            .take()
            .context("aggregated sink has no exporter")?;

        exporter.start(ctx.clone()).await?;
        info!(exporter = exporter.name(), "exporter started");

        let mut state = FlushState::new(&self.cfg, self.health.clone());
        let interval_secs = state.interval_secs;
        let flush_interval = self.cfg.flush_interval;

        let run_task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ctx.cancelled() => {
                        // Fold whatever producers queued before shutdown.
                        while let Ok(event) = event_rx.try_recv() {
                            state.add(&event);
                        }

                        let events = state.buffer.event_count();
                        match state.flush(&mut exporter).await {
                            Ok(()) => info!(events, "final flush"),
                            Err(e) => error!(
                                exporter = exporter.name(),
                                events,
                                error = %format!("{e:#}"),
                                "final export failed, buffered events lost",
                            ),
                        }

                        if let Err(e) = exporter.stop().await {
                            error!(
                                exporter = exporter.name(),
                                error = %e,
                                "exporter stop failed",
                            );
                        }

                        return;
                    }

                    Some(event) = event_rx.recv() => {
                        state.add(&event);

                        // Drain up to BATCH_SIZE-1 more events without blocking.
                        for _ in 0..BATCH_SIZE - 1 {
                            match event_rx.try_recv() {
                                Ok(event) => state.add(&event),
                                Err(_) => break,
                            }
                        }
                    }

                    _ = ticker.tick() => {
                        if let Err(e) = state.flush(&mut exporter).await {
                            error!(
                                exporter = exporter.name(),
                                retained = state.buffer.event_count(),
                                error = %format!("{e:#}"),
                                "export failed",
                            );
                        }
                    }
                }
            }
        });

        *self.run_task.lock().await = Some(run_task);

        info!(
            interval_secs,
            flush_interval = ?flush_interval,
            "aggregated sink started"
        );

        Ok(())
    }

}
