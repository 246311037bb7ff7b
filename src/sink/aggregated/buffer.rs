use std::sync::atomic::{AtomicUsize, Ordering};

use dashmap::DashMap;

use crate::source::event::CanonicalEvent;

use super::aggregate::Reducer;
use super::dimension::{time_bucket, AggregationKey};

/// Aggregation buffer that folds events into per-key reducers over one
/// flush window.
///
/// Uses `DashMap` for concurrent map access. Each map entry is
/// independently lockable.
pub struct Buffer {
    /// Bucket width in seconds.
    interval_secs: i64,
    /// Events folded into the buffer.
    events: AtomicUsize,

    /// Reducers for unsegmented events, keyed with `segment_key == None`.
    pub simple: DashMap<AggregationKey, Reducer>,
    /// Reducers for each segment pair of segmented events.
    pub segmented: DashMap<AggregationKey, Reducer>,
}

impl Buffer {
    /// Creates a new empty buffer.
    pub fn new(interval_secs: i64) -> Self {
        Self {
            interval_secs,
            events: AtomicUsize::new(0),
            simple: DashMap::new(),
            segmented: DashMap::new(),
        }
    }

    pub fn interval_secs(&self) -> i64 {
        self.interval_secs
    }

    /// Number of events folded in since creation.
    pub fn event_count(&self) -> usize {
        self.events.load(Ordering::Relaxed)
    }

    /// Returns true if no events were added.
    pub fn is_empty(&self) -> bool {
        self.event_count() == 0
    }

    /// Folds one event into its reducers.
    ///
    /// An unsegmented event updates the simple reducer of its bucket. A
    /// segmented event updates one reducer per segment pair and leaves the
    /// simple reducer untouched. A reducer keeps the mode of the event that
    /// created it.
    pub fn add(&self, event: &CanonicalEvent) {
        let bucket = time_bucket(event.time, self.interval_secs);

        if event.segments.is_empty() {
            self.simple
                .entry(AggregationKey::simple(&event.tag, bucket))
                .or_insert_with(|| Reducer::for_mode(event.update_mode))
                .add(event.value);
        } else {
            for (seg_key, seg_val) in &event.segments {
                self.segmented
                    .entry(AggregationKey::segmented(&event.tag, bucket, seg_key, seg_val))
                    .or_insert_with(|| Reducer::for_mode(event.update_mode))
                    .add(event.value);
            }
        }

        self.events.fetch_add(1, Ordering::Relaxed);
    }
}
