use std::time::SystemTime;

use crate::source::event::{UpdateMode, Value};

/// Metadata common to all aggregate batches.
#[derive(Debug, Clone, Copy)]
pub struct BatchMetadata {
    /// Time when this batch was collected.
    pub updated_time: SystemTime,
    /// Number of events aggregated into the batch.
    pub events: usize,
    /// Bucket width in seconds.
    pub interval_secs: i64,
}

impl Default for BatchMetadata {
    fn default() -> Self {
        Self {
            updated_time: SystemTime::UNIX_EPOCH,
            events: 0,
            interval_secs: 60,
        }
    }
}

/// One aggregate emitted at flush end.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateRow {
    pub tag: String,
    /// Bucket start in unix seconds.
    pub time: i64,
    /// Normalized value.
    pub value: Value,
    pub segment_key: Option<String>,
    pub segment_value: Option<String>,
    pub update_mode: UpdateMode,
}

impl AggregateRow {
    /// Returns the segment pair if this row is segmented.
    pub fn segment(&self) -> Option<(&str, &str)> {
        match (&self.segment_key, &self.segment_value) {
            (Some(key), Some(value)) => Some((key.as_str(), value.as_str())),
            _ => None,
        }
    }
}

/// Rows produced by one flush, handed to the exporter in a single write.
#[derive(Debug, Clone, Default)]
pub struct AggregateBatch {
    pub metadata: BatchMetadata,
    pub rows: Vec<AggregateRow>,
}

impl AggregateBatch {
    /// Returns true if the batch carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }
}
