use std::fmt;

use serde::{Serialize, Serializer};
use serde_json::{Map, Value as JsonValue};

/// UpdateMode selects how repeated values for one aggregation key combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum UpdateMode {
    /// Values are summed and normalized per minute.
    #[default]
    Add = 0,
    /// The largest value wins.
    Max = 1,
    /// Combined like `Max`, reported as an average to sinks that can
    /// summarize it.
    Average = 2,
}

impl UpdateMode {
    /// Returns the canonical label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Max => "max",
            Self::Average => "average",
        }
    }

    /// Resolve the mode named by a record field. Anything other than
    /// "max" or "average" means `Add`.
    pub fn from_field(field: Option<&JsonValue>) -> Self {
        match field.and_then(JsonValue::as_str) {
            Some("max") => Self::Max,
            Some("average") => Self::Average,
            _ => Self::Add,
        }
    }
}

impl fmt::Display for UpdateMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A metric value. Integral inputs are kept as `Int` so sums stay exact.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
}

// Bounds of the f64 range that converts to i64 without saturating.
const I64_MIN_F: f64 = -9_223_372_036_854_775_808.0;
const I64_MAX_F: f64 = 9_223_372_036_854_775_808.0;

impl Value {
    /// Build a value from a float, choosing `Int` when truncation is exact.
    pub fn from_f64(v: f64) -> Self {
        if v.trunc() == v && (I64_MIN_F..I64_MAX_F).contains(&v) {
            Self::Int(v as i64)
        } else {
            Self::Float(v)
        }
    }

    pub fn as_f64(self) -> f64 {
        match self {
            Self::Int(v) => v as f64,
            Self::Float(v) => v,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
        }
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Int(v) => serializer.serialize_i64(*v),
            Self::Float(v) => serializer.serialize_f64(*v),
        }
    }
}

/// A record as delivered by the input, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub tag: String,
    /// Unix seconds.
    pub time: i64,
    pub record: Map<String, JsonValue>,
}

/// A normalized metric event, ready for aggregation.
#[derive(Debug, Clone, PartialEq)]
pub struct CanonicalEvent {
    pub tag: String,
    /// Unix seconds.
    pub time: i64,
    /// Never zero.
    pub value: Value,
    /// Segment (key, value) pairs in extraction order.
    pub segments: Vec<(String, String)>,
    pub update_mode: UpdateMode,
}
