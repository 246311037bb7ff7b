use std::sync::atomic::{AtomicU64, Ordering};

use super::normalize::DropReason;

/// Lock-free counters for the record source.
///
/// `snapshot()` atomically reads and resets all counters, making it
/// suitable for periodic reporting without contention.
#[derive(Debug, Default)]
pub struct SourceStats {
    accepted: AtomicU64,
    malformed: AtomicU64,
    missing_value: AtomicU64,
    non_numeric: AtomicU64,
    zero: AtomicU64,
}

/// Point-in-time view of the source counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceStatsSnapshot {
    pub accepted: u64,
    pub malformed: u64,
    pub missing_value: u64,
    pub non_numeric: u64,
    pub zero: u64,
}

impl SourceStatsSnapshot {
    /// Total records dropped for any reason.
    pub fn dropped(&self) -> u64 {
        self.malformed + self.missing_value + self.non_numeric + self.zero
    }
}

impl SourceStats {
    /// Create a new zeroed SourceStats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a record that produced an event.
    pub fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a line that could not be parsed.
    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a record dropped during normalization.
    pub fn record_dropped(&self, reason: DropReason) {
        let counter = match reason {
            DropReason::MissingValue => &self.missing_value,
            DropReason::NonNumeric => &self.non_numeric,
            DropReason::Zero => &self.zero,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Atomically read and reset all counters.
    pub fn snapshot(&self) -> SourceStatsSnapshot {
        SourceStatsSnapshot {
            accepted: self.accepted.swap(0, Ordering::Relaxed),
            malformed: self.malformed.swap(0, Ordering::Relaxed),
            missing_value: self.missing_value.swap(0, Ordering::Relaxed),
            non_numeric: self.non_numeric.swap(0, Ordering::Relaxed),
            zero: self.zero.swap(0, Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_snapshot() {
        let stats = SourceStats::new();
        stats.record_accepted();
        stats.record_accepted();
        stats.record_malformed();
        stats.record_dropped(DropReason::Zero);
        stats.record_dropped(DropReason::NonNumeric);

        let snap = stats.snapshot();
        assert_eq!(snap.accepted, 2);
        assert_eq!(snap.malformed, 1);
        assert_eq!(snap.zero, 1);
        assert_eq!(snap.non_numeric, 1);
        assert_eq!(snap.missing_value, 0);
        assert_eq!(snap.dropped(), 3);
    }

    #[test]
    fn test_snapshot_resets_counters() {
        let stats = SourceStats::new();
        stats.record_dropped(DropReason::MissingValue);

        assert_eq!(stats.snapshot().dropped(), 1);
        assert_eq!(stats.snapshot(), SourceStatsSnapshot::default());
    }
}
