use std::collections::HashMap;
use std::time::SystemTime;

use crate::config::AggregationConfig;
use crate::source::event::CanonicalEvent;

use super::aggregate::Reducer;
use super::buffer::Buffer;
use super::dimension::AggregationKey;
use super::metric::{AggregateBatch, AggregateRow, BatchMetadata};

/// Resolves a buffer's reducers into flat aggregate rows.
///
/// Segmented counters are summed into a segmented total per tag and bucket.
/// Totals lose to segmented counters, which lose to simple counters, so a
/// tag that received unsegmented events in a bucket reports those instead
/// of the total of its segments.
#[derive(Debug, Clone, Copy)]
pub struct Collector {
    minutes_per_bucket: i64,
}

impl Collector {
    /// Creates a new collector for buckets `interval_secs` wide.
    pub fn new(interval_secs: i64) -> Self {
        Self {
            minutes_per_bucket: AggregationConfig::minutes_in(interval_secs),
        }
    }

    /// Resolves the buffer into a new batch. The buffer is left untouched
    /// so a failed write can be retried.
    pub fn collect(&self, buf: &Buffer) -> AggregateBatch {
        let mut merged: HashMap<AggregationKey, Reducer> =
            HashMap::with_capacity(buf.simple.len() + buf.segmented.len() * 2);

        // Segmented totals.
        for entry in buf.segmented.iter() {
            merged
                .entry(entry.key().to_simple())
                .or_insert_with(Reducer::segmented_total)
                .fold(entry.value());
        }

        // Segmented counters, then simple counters on top.
        for entry in buf.segmented.iter() {
            merged.insert(entry.key().clone(), *entry.value());
        }
        for entry in buf.simple.iter() {
            merged.insert(entry.key().clone(), *entry.value());
        }

        let mut entries: Vec<(AggregationKey, Reducer)> = merged.into_iter().collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        let rows = entries
            .into_iter()
            .map(|(key, reducer)| AggregateRow {
                value: reducer.normalized_value(self.minutes_per_bucket),
                update_mode: reducer.mode(),
                tag: key.tag,
                time: key.time_bucket,
                segment_key: key.segment_key,
                segment_value: key.segment_value,
            })
            .collect();

        AggregateBatch {
            metadata: BatchMetadata {
                updated_time: SystemTime::now(),
                events: buf.event_count(),
                interval_secs: buf.interval_secs(),
            },
            rows,
        }
    }
}

/// Aggregates one batch of events in a single call.
pub fn aggregate(events: &[CanonicalEvent], interval_secs: i64) -> Vec<AggregateRow> {
    let buf = Buffer::new(interval_secs);
    for event in events {
        buf.add(event);
    }

    Collector::new(interval_secs).collect(&buf).rows
}
