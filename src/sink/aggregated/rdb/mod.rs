//! Relational row store for aggregated series.
//!
//! Each data row holds sixty float columns `m0..m59` for one
//! `(base_time, metric_id, segment_id)` key. Writes only ever add to those
//! columns, so redelivering a batch doubles its contribution rather than
//! failing, and several writer processes may share the tables.

pub mod connection;
pub mod dialect;
pub mod dictionary;
pub mod layout;
pub mod ring;
pub mod schema;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RdbConfig;
use crate::export::health::HealthMetrics;

use self::connection::{RdbConnection, SqlParam};
use self::dialect::DatabaseUrl;
use self::dictionary::{Dictionary, DictionaryStore};
use self::ring::InsertSuppressionRing;
use self::schema::Statements;

use super::metric::{AggregateBatch, AggregateRow};

/// Metric dictionary key: `(metric_name, segment_name)`, with an empty
/// segment name for unsegmented series.
pub type MetricKey = (String, String);

/// Primary key of one data row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RowKey {
    pub base_time: i64,
    pub metric_id: i64,
    pub segment_id: i64,
}

impl RowKey {
    fn params(&self) -> [SqlParam; 3] {
        [
            SqlParam::Int(self.base_time),
            SqlParam::Int(self.metric_id),
            SqlParam::Int(self.segment_id),
        ]
    }
}

/// Segment id stored for rows without a segment.
pub const NO_SEGMENT_ID: i64 = 0;

/// Per-slot deltas grouped by row key.
type RowDeltas = BTreeMap<RowKey, BTreeMap<usize, f64>>;

/// Dictionary access to the metric tags table over one connection.
struct MetricTagStore<'a> {
    conn: &'a mut RdbConnection,
    statements: &'a Statements,
}

impl DictionaryStore<MetricKey> for MetricTagStore<'_> {
    async fn load_all(&mut self) -> Result<Vec<(MetricKey, i64)>> {
        let rows = self
            .conn
            .query_id_rows(&self.statements.select_metric_tags(), 2)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, mut texts)| {
                let segment = texts.pop()?;
                let metric = texts.pop()?;
                Some(((metric, segment), id))
            })
            .collect())
    }

    async fn insert(&mut self, key: &MetricKey) -> Result<Option<i64>> {
        self.conn
            .insert_returning_id(
                &self.statements.insert_metric_tag(),
                &[SqlParam::Text(key.0.clone()), SqlParam::Text(key.1.clone())],
            )
            .await
    }
}

/// Dictionary access to the segment values table over one connection.
struct SegmentValueStore<'a> {
    conn: &'a mut RdbConnection,
    statements: &'a Statements,
}

impl DictionaryStore<String> for SegmentValueStore<'_> {
    async fn load_all(&mut self) -> Result<Vec<(String, i64)>> {
        let rows = self
            .conn
            .query_id_rows(&self.statements.select_segment_values(), 1)
            .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, mut texts)| texts.pop().map(|name| (name, id)))
            .collect())
    }

    async fn insert(&mut self, key: &String) -> Result<Option<i64>> {
        self.conn
            .insert_returning_id(
                &self.statements.insert_segment_value(),
                &[SqlParam::Text(key.clone())],
            )
            .await
    }
}

/// Writes aggregate rows into a SQLite or PostgreSQL row store.
pub struct RdbExporter {
    cfg: RdbConfig,
    url: DatabaseUrl,
    statements: Statements,
    metrics: Dictionary<MetricKey>,
    segments: Dictionary<String>,
    ring: InsertSuppressionRing<RowKey>,
    health: Option<Arc<HealthMetrics>>,
}

impl RdbExporter {
    /// Creates an exporter. The database is not contacted until `start`.
    pub fn new(cfg: RdbConfig, health: Option<Arc<HealthMetrics>>) -> Result<Self> {
        let url = DatabaseUrl::parse(&cfg.rdb_url).context("parsing rdb_url")?;
        let statements = Statements::new(url.dialect, &cfg.rdb_table_prefix);

        let mut metrics = Dictionary::new("metric");
        let mut segments = Dictionary::new("segment");
        if let Some(h) = &health {
            metrics = metrics.with_reload_counter(h.dictionary_reloads.with_label_values(&["metric"]));
            segments =
                segments.with_reload_counter(h.dictionary_reloads.with_label_values(&["segment"]));
        }

        Ok(Self {
            cfg,
            url,
            statements,
            metrics,
            segments,
            ring: InsertSuppressionRing::default(),
            health,
        })
    }

    pub fn name(&self) -> &str {
        "rdb"
    }

    /// Creates the tables if needed and loads both dictionaries.
    pub async fn start(&mut self, _ctx: CancellationToken) -> Result<()> {
        if self.cfg.row_layout.is_lossy() {
            warn!(
                row_layout = self.cfg.row_layout.as_str(),
                "row layout folds every hour of a day into the same 60 columns",
            );
        }

        let mut conn = RdbConnection::open(&self.url).await?;
        let result = self.init_schema(&mut conn).await;
        close_connection(conn).await;
        result?;

        info!(
            dialect = %self.url.dialect,
            prefix = %self.cfg.rdb_table_prefix,
            metrics = self.metrics.len(),
            segments = self.segments.len(),
            "rdb row store ready",
        );

        Ok(())
    }

    async fn init_schema(&mut self, conn: &mut RdbConnection) -> Result<()> {
        for ddl in self.statements.create_tables() {
            conn.batch_execute(&ddl)
                .await
                .context("creating rdb tables")?;
        }

        self.metrics
            .reload(&mut MetricTagStore {
                conn: &mut *conn,
                statements: &self.statements,
            })
            .await?;
        self.segments
            .reload(&mut SegmentValueStore {
                conn,
                statements: &self.statements,
            })
            .await?;

        Ok(())
    }

    /// Adds every row of the batch to its minute column.
    ///
    /// Opens one connection for the call. Errors propagate after the
    /// increment transaction is rolled back; nothing is retried here.
    pub async fn export(&mut self, batch: &AggregateBatch) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut conn = RdbConnection::open(&self.url).await?;
        let result = self.write(&mut conn, &batch.rows).await;
        close_connection(conn).await;

        if let (Ok(()), Some(h)) = (&result, &self.health) {
            h.rows_exported.inc_by(batch.len() as f64);
        }

        result
    }

    async fn write(&mut self, conn: &mut RdbConnection, rows: &[AggregateRow]) -> Result<()> {
        let deltas = self.group_deltas(conn, rows).await?;
        self.create_rows(conn, &deltas).await?;

        conn.begin().await?;
        match self.increment_rows(conn, &deltas).await {
            Ok(()) => conn.commit().await.context("committing increments"),
            Err(e) => {
                if let Err(rollback_err) = conn.rollback().await {
                    warn!(error = %rollback_err, "rdb rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Resolves ids and sums deltas that land on the same row and slot.
    async fn group_deltas(
        &mut self,
        conn: &mut RdbConnection,
        rows: &[AggregateRow],
    ) -> Result<RowDeltas> {
        let mut deltas = RowDeltas::new();

        for row in rows {
            let metric_key = (
                row.tag.clone(),
                row.segment_key.clone().unwrap_or_default(),
            );
            let metric_id = self
                .metrics
                .get_or_create(
                    &mut MetricTagStore {
                        conn: &mut *conn,
                        statements: &self.statements,
                    },
                    &metric_key,
                )
                .await?;

            let segment_id = match &row.segment_value {
                Some(value) => {
                    self.segments
                        .get_or_create(
                            &mut SegmentValueStore {
                                conn: &mut *conn,
                                statements: &self.statements,
                            },
                            value,
                        )
                        .await?
                }
                None => NO_SEGMENT_ID,
            };

            let addr = self.cfg.row_layout.address(row.time);
            let key = RowKey {
                base_time: addr.base_time,
                metric_id,
                segment_id,
            };

            *deltas
                .entry(key)
                .or_default()
                .entry(addr.slot)
                .or_insert(0.0) += row.value.as_f64();
        }

        self.reject_non_finite(&mut deltas);

        Ok(deltas)
    }

    /// Drops slot deltas that overflowed to infinity or NaN. The columns are
    /// `NOT NULL` and SQLite binds NaN as NULL.
    fn reject_non_finite(&self, deltas: &mut RowDeltas) {
        let mut rejected = 0u64;
        for slots in deltas.values_mut() {
            slots.retain(|_, delta| {
                let finite = delta.is_finite();
                rejected += u64::from(!finite);
                finite
            });
        }
        deltas.retain(|_, slots| !slots.is_empty());

        if rejected > 0 {
            warn!(rejected, "skipping non-finite minute deltas");
            if let Some(h) = &self.health {
                h.deltas_rejected.inc_by(rejected as f64);
            }
        }
    }

    /// Makes sure every touched row exists. Keys seen recently are skipped.
    async fn create_rows(&mut self, conn: &mut RdbConnection, deltas: &RowDeltas) -> Result<()> {
        let pending: Vec<RowKey> = deltas
            .keys()
            .filter(|key| !self.ring.contains(key))
            .copied()
            .collect();

        let suppressed = deltas.len() - pending.len();
        if let Some(h) = &self.health {
            h.row_creations_suppressed.inc_by(suppressed as f64);
        }

        for chunk in pending.chunks(self.statements.max_rows_per_insert()) {
            let sql = self.statements.create_data_rows(chunk.len());
            let params: Vec<SqlParam> = chunk.iter().flat_map(RowKey::params).collect();

            conn.execute(&sql, &params)
                .await
                .context("creating data rows")?;

            for key in chunk {
                self.ring.insert(*key);
            }
            if let Some(h) = &self.health {
                h.row_creations.inc_by(chunk.len() as f64);
            }
        }

        debug!(
            rows = deltas.len(),
            created = pending.len(),
            suppressed,
            "rdb rows ensured",
        );

        Ok(())
    }

    async fn increment_rows(&self, conn: &mut RdbConnection, deltas: &RowDeltas) -> Result<()> {
        for (key, slots) in deltas {
            let columns: Vec<usize> = slots.keys().copied().collect();
            let sql = self.statements.increment_slots(&columns);

            let mut params: Vec<SqlParam> = slots.values().map(|v| SqlParam::Float(*v)).collect();
            params.extend(key.params());

            let updated = conn
                .execute(&sql, &params)
                .await
                .with_context(|| format!("incrementing data row {key:?}"))?;
            if updated == 0 {
                warn!(row = ?key, "data row missing, increment lost");
            }
        }

        Ok(())
    }

    pub async fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

async fn close_connection(conn: RdbConnection) {
    if let Err(e) = conn.close().await {
        warn!(error = %e, "closing rdb connection failed");
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::layout::RowLayout;
    use super::*;
    use crate::sink::aggregated::metric::BatchMetadata;
    use crate::source::event::{UpdateMode, Value};

    fn row(tag: &str, time: i64, value: Value, segment: Option<(&str, &str)>) -> AggregateRow {
        AggregateRow {
            tag: tag.to_string(),
            time,
            value,
            segment_key: segment.map(|(k, _)| k.to_string()),
            segment_value: segment.map(|(_, v)| v.to_string()),
            update_mode: UpdateMode::Add,
        }
    }

    fn batch(rows: Vec<AggregateRow>) -> AggregateBatch {
        AggregateBatch {
            metadata: BatchMetadata::default(),
            rows,
        }
    }

    fn exporter(dir: &TempDir, layout: RowLayout) -> (RdbExporter, String) {
        let path = dir.path().join("metrics.db");
        let path = path.to_string_lossy().to_string();
        let cfg = RdbConfig {
            rdb_url: format!("sqlite://{path}"),
            rdb_table_prefix: "ms".to_string(),
            row_layout: layout,
        };
        (RdbExporter::new(cfg, None).expect("exporter"), path)
    }

    fn slot_value(path: impl AsRef<std::path::Path>, key: RowKey, slot: usize) -> f64 {
        let conn = rusqlite::Connection::open(path).expect("open");
        conn.query_row(
            &format!(
                "SELECT m{slot} FROM ms_data WHERE base_time = ?1 AND metric_id = ?2 AND segment_id = ?3"
            ),
            [key.base_time, key.metric_id, key.segment_id],
            |r| r.get(0),
        )
        .expect("query")
    }

    fn count(path: &str, table: &str) -> i64 {
        let conn = rusqlite::Connection::open(path).expect("open");
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .expect("count")
    }

    #[tokio::test]
    async fn test_start_creates_tables_idempotently() {
        let dir = TempDir::new().expect("tempdir");
        let (mut exp, path) = exporter(&dir, RowLayout::Daily);

        exp.start(CancellationToken::new()).await.expect("start");
        exp.start(CancellationToken::new()).await.expect("restart");

        assert_eq!(count(&path, "ms_data"), 0);
        assert_eq!(count(&path, "ms_metric_tags"), 0);
        assert_eq!(count(&path, "ms_segment_values"), 0);
    }

    #[tokio::test]
    async fn test_export_writes_simple_and_segmented_rows() {
        let dir = TempDir::new().expect("tempdir");
        let (mut exp, path) = exporter(&dir, RowLayout::Daily);
        exp.start(CancellationToken::new()).await.expect("start");

        // 1970-01-02 00:03:00 UTC
        let time = 86_400 + 180;
        exp.export(&batch(vec![
            row("api.hits", time, Value::Int(3), None),
            row("api.hits", time, Value::Float(1.5), Some(("path", "/a"))),
        ]))
        .await
        .expect("export");

        let simple_metric = exp.metrics.get(&("api.hits".into(), String::new())).expect("id");
        let seg_metric = exp.metrics.get(&("api.hits".into(), "path".into())).expect("id");
        let seg_value = exp.segments.get(&"/a".to_string()).expect("id");
        assert_ne!(simple_metric, seg_metric);

        let simple = RowKey {
            base_time: 1,
            metric_id: simple_metric,
            segment_id: NO_SEGMENT_ID,
        };
        let segmented = RowKey {
            base_time: 1,
            metric_id: seg_metric,
            segment_id: seg_value,
        };
        assert_eq!(slot_value(&path, simple, 3), 3.0);
        assert_eq!(slot_value(&path, simple, 4), 0.0);
        assert_eq!(slot_value(&path, segmented, 3), 1.5);
        assert_eq!(count(&path, "ms_data"), 2);
    }

    #[tokio::test]
    async fn test_redelivery_doubles_values() {
        let dir = TempDir::new().expect("tempdir");
        let (mut exp, path) = exporter(&dir, RowLayout::Hourly);
        exp.start(CancellationToken::new()).await.expect("start");

        let b = batch(vec![row("t", 3_600 + 120, Value::Int(5), None)]);
        exp.export(&b).await.expect("first");
        exp.export(&b).await.expect("second");

        let metric_id = exp.metrics.get(&("t".into(), String::new())).expect("id");
        let key = RowKey {
            base_time: 1,
            metric_id,
            segment_id: NO_SEGMENT_ID,
        };
        assert_eq!(slot_value(&path, key, 2), 10.0);
        assert_eq!(count(&path, "ms_data"), 1);
    }

    #[tokio::test]
    async fn test_daily_layout_sums_colliding_hours() {
        let dir = TempDir::new().expect("tempdir");
        let (mut exp, path) = exporter(&dir, RowLayout::Daily);
        exp.start(CancellationToken::new()).await.expect("start");

        exp.export(&batch(vec![
            row("t", 5 * 60, Value::Int(1), None),
            row("t", 3_600 + 5 * 60, Value::Int(2), None),
        ]))
        .await
        .expect("export");

        let metric_id = exp.metrics.get(&("t".into(), String::new())).expect("id");
        let key = RowKey {
            base_time: 0,
            metric_id,
            segment_id: NO_SEGMENT_ID,
        };
        assert_eq!(slot_value(&path, key, 5), 3.0);
    }

    #[tokio::test]
    async fn test_second_process_reuses_dictionary_ids() {
        let dir = TempDir::new().expect("tempdir");
        let (mut first, path) = exporter(&dir, RowLayout::Daily);
        first.start(CancellationToken::new()).await.expect("start");

        // A second writer starts before the first creates anything.
        let (mut second, _) = exporter(&dir, RowLayout::Daily);
        second.start(CancellationToken::new()).await.expect("start");

        let b = batch(vec![row("t", 60, Value::Int(1), Some(("host", "a")))]);
        first.export(&b).await.expect("first export");
        second.export(&b).await.expect("second export");

        assert_eq!(
            first.metrics.get(&("t".into(), "host".into())),
            second.metrics.get(&("t".into(), "host".into()))
        );
        assert_eq!(count(&path, "ms_metric_tags"), 1);
        assert_eq!(count(&path, "ms_segment_values"), 1);
        assert_eq!(count(&path, "ms_data"), 1);
    }

    #[tokio::test]
    async fn test_recent_rows_skip_creation() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("metrics.db");
        let health = Arc::new(HealthMetrics::new("").expect("health"));
        let cfg = RdbConfig {
            rdb_url: format!("sqlite://{}", path.to_string_lossy()),
            rdb_table_prefix: "ms".to_string(),
            row_layout: RowLayout::Daily,
        };
        let mut exp = RdbExporter::new(cfg, Some(Arc::clone(&health))).expect("exporter");
        exp.start(CancellationToken::new()).await.expect("start");

        let b = batch(vec![row("t", 60, Value::Int(1), None)]);
        exp.export(&b).await.expect("first");
        exp.export(&b).await.expect("second");

        assert_eq!(health.row_creations.get() as u64, 1);
        assert_eq!(health.row_creations_suppressed.get() as u64, 1);
        assert_eq!(health.rows_exported.get() as u64, 2);
    }

    #[tokio::test]
    async fn test_export_failure_propagates() {
        let dir = TempDir::new().expect("tempdir");
        let (mut exp, path) = exporter(&dir, RowLayout::Daily);
        exp.start(CancellationToken::new()).await.expect("start");

        let conn = rusqlite::Connection::open(&path).expect("open");
        conn.execute_batch("DROP TABLE ms_data").expect("drop");
        drop(conn);

        let result = exp
            .export(&batch(vec![row("t", 60, Value::Int(1), None)]))
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_non_finite_deltas_are_skipped() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("metrics.db");
        let health = Arc::new(HealthMetrics::new("").expect("health"));
        let cfg = RdbConfig {
            rdb_url: format!("sqlite://{}", path.to_string_lossy()),
            rdb_table_prefix: "ms".to_string(),
            row_layout: RowLayout::Daily,
        };
        let mut exp = RdbExporter::new(cfg, Some(Arc::clone(&health))).expect("exporter");
        exp.start(CancellationToken::new()).await.expect("start");

        exp.export(&batch(vec![
            row("big", 300, Value::Float(f64::MAX), None),
            row("big", 3_900, Value::Float(f64::MAX), None),
            row("big", 360, Value::Int(4), None),
        ]))
        .await
        .expect("export");

        let metric_id = exp.metrics.get(&("big".into(), String::new())).expect("id");
        let key = RowKey {
            base_time: 0,
            metric_id,
            segment_id: NO_SEGMENT_ID,
        };
        assert_eq!(slot_value(&path, key, 6), 4.0);
        assert_eq!(slot_value(&path, key, 5), 0.0);
        assert_eq!(health.deltas_rejected.get() as u64, 1);
    }

    #[tokio::test]
    async fn test_increment_of_missing_row_is_not_an_error() {
        let dir = TempDir::new().expect("tempdir");
        let (mut exp, path) = exporter(&dir, RowLayout::Hourly);
        exp.start(CancellationToken::new()).await.expect("start");

        let b = batch(vec![row("t", 60, Value::Int(1), None)]);
        exp.export(&b).await.expect("first");

        // The ring still remembers the row, so it is not recreated.
        let conn = rusqlite::Connection::open(&path).expect("open");
        conn.execute_batch("DELETE FROM ms_data").expect("delete");
        drop(conn);

        exp.export(&b).await.expect("second");
        assert_eq!(count(&path, "ms_data"), 0);
    }

    #[tokio::test]
    async fn test_empty_batch_is_noop() {
        // Never opened: the path does not exist.
        let cfg = RdbConfig {
            rdb_url: "sqlite:///nonexistent/dir/metrics.db".to_string(),
            rdb_table_prefix: "ms".to_string(),
            row_layout: RowLayout::Daily,
        };
        let mut exp = RdbExporter::new(cfg, None).expect("exporter");
        exp.export(&AggregateBatch::default()).await.expect("noop");
    }
}
