/// Grouping key for one reducer: tag, time bucket and optional segment.
///
/// Simple counters and segmented totals use `segment_key == None`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AggregationKey {
    pub tag: String,
    /// Bucket start in unix seconds.
    pub time_bucket: i64,
    pub segment_key: Option<String>,
    pub segment_value: Option<String>,
}

impl AggregationKey {
    /// Key for the unsegmented aggregate of a tag.
    pub fn simple(tag: &str, time_bucket: i64) -> Self {
        Self {
            tag: tag.to_string(),
            time_bucket,
            segment_key: None,
            segment_value: None,
        }
    }

    /// Key for one segment pair of a tag.
    pub fn segmented(tag: &str, time_bucket: i64, segment_key: &str, segment_value: &str) -> Self {
        Self {
            tag: tag.to_string(),
            time_bucket,
            segment_key: Some(segment_key.to_string()),
            segment_value: Some(segment_value.to_string()),
        }
    }

    /// The unsegmented key with the same tag and bucket.
    pub fn to_simple(&self) -> Self {
        Self::simple(&self.tag, self.time_bucket)
    }
}

/// Start of the bucket containing `time` for buckets `interval_secs` wide.
/// Saturates at `i64::MIN` when the bucket start is not representable.
pub fn time_bucket(time: i64, interval_secs: i64) -> i64 {
    time.saturating_sub(time.rem_euclid(interval_secs))
}
