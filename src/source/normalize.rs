use serde_json::Value as JsonValue;

use crate::config::{NormalizeConfig, SegmentationMode};

use super::event::{CanonicalEvent, RawRecord, UpdateMode, Value};

/// Why a record produced no event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// The value field is absent.
    MissingValue,
    /// The value field is not a finite number or numeric string.
    NonNumeric,
    /// The value is zero.
    Zero,
}

impl DropReason {
    /// Returns the canonical label name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::MissingValue => "missing_value",
            Self::NonNumeric => "non_numeric",
            Self::Zero => "zero",
        }
    }
}

/// Turns raw records into canonical events.
#[derive(Debug, Clone)]
pub struct Normalizer {
    value_key: String,
    update_mode_key: String,
    mode: SegmentationMode,
    include: Vec<String>,
    exclude: Vec<String>,
    remove_tag_prefix: Option<String>,
    add_tag_prefix: Option<String>,
}

impl Normalizer {
    /// Creates a new normalizer from configuration.
    pub fn new(cfg: &NormalizeConfig) -> Self {
        Self {
            value_key: cfg.value_key.clone(),
            update_mode_key: cfg.update_mode_key.clone(),
            mode: cfg.segmentation.mode,
            include: cfg.segmentation.keys.clone(),
            exclude: cfg.segmentation.exclude.clone(),
            remove_tag_prefix: cfg.remove_tag_prefix.clone().filter(|p| !p.is_empty()),
            add_tag_prefix: cfg.add_tag_prefix.clone().filter(|p| !p.is_empty()),
        }
    }

    /// Normalize one record. Records without a usable non-zero value are
    /// dropped with the reason.
    pub fn normalize(&self, raw: RawRecord) -> Result<CanonicalEvent, DropReason> {
        let RawRecord {
            tag,
            time,
            mut record,
        } = raw;

        let value = record
            .shift_remove(&self.value_key)
            .ok_or(DropReason::MissingValue)?;
        let value = coerce_f64(&value).ok_or(DropReason::NonNumeric)?;
        if value == 0.0 {
            return Err(DropReason::Zero);
        }

        let update_mode = UpdateMode::from_field(record.shift_remove(&self.update_mode_key).as_ref());

        let mut segments: Vec<(String, String)> = match self.mode {
            SegmentationMode::None => Vec::new(),
            SegmentationMode::Include => self
                .include
                .iter()
                .filter_map(|key| {
                    record
                        .get(key)
                        .and_then(segment_value)
                        .map(|val| (key.clone(), val))
                })
                .collect(),
            SegmentationMode::All => record
                .iter()
                .filter_map(|(key, val)| segment_value(val).map(|val| (key.clone(), val)))
                .collect(),
        };

        if !self.exclude.is_empty() {
            segments.retain(|(key, _)| !self.exclude.contains(key));
        }

        Ok(CanonicalEvent {
            tag: self.rewrite_tag(tag),
            time,
            value: Value::from_f64(value),
            segments,
            update_mode,
        })
    }

    fn rewrite_tag(&self, tag: String) -> String {
        let tag = match &self.remove_tag_prefix {
            Some(prefix) => match tag.strip_prefix(prefix.as_str()) {
                Some("") => String::new(),
                Some(rest) => match rest.strip_prefix('.') {
                    Some(stripped) => stripped.to_string(),
                    None => tag,
                },
                None => tag,
            },
            None => tag,
        };

        match &self.add_tag_prefix {
            Some(prefix) => format!("{prefix}.{tag}"),
            None => tag,
        }
    }
}

/// Coerce a JSON scalar to a finite float.
fn coerce_f64(value: &JsonValue) -> Option<f64> {
    let v = match value {
        JsonValue::Number(n) => n.as_f64()?,
        JsonValue::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };

    v.is_finite().then_some(v)
}

/// Render a JSON scalar as a segment value. Null and nested values are skipped.
fn segment_value(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        JsonValue::Bool(b) => Some(b.to_string()),
        JsonValue::Null | JsonValue::Array(_) | JsonValue::Object(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::config::SegmentationConfig;
    use crate::source::parse::record_from_pairs;

    fn raw(tag: &str, pairs: Vec<(&str, JsonValue)>) -> RawRecord {
        RawRecord {
            tag: tag.to_string(),
            time: 1_700_000_000,
            record: record_from_pairs(pairs),
        }
    }

    fn normalizer(mode: SegmentationMode, keys: &[&str], exclude: &[&str]) -> Normalizer {
        Normalizer::new(&NormalizeConfig {
            segmentation: SegmentationConfig {
                mode,
                keys: keys.iter().map(|k| k.to_string()).collect(),
                exclude: exclude.iter().map(|k| k.to_string()).collect(),
            },
            ..Default::default()
        })
    }

    #[test]
    fn test_integral_value_becomes_int() {
        let n = normalizer(SegmentationMode::None, &[], &[]);
        let event = n
            .normalize(raw("t", vec![("value", json!(3.0))]))
            .expect("event");
        assert_eq!(event.value, Value::Int(3));

        let event = n
            .normalize(raw("t", vec![("value", json!("2.5"))]))
            .expect("event");
        assert_eq!(event.value, Value::Float(2.5));
    }

    #[test]
    fn test_drop_reasons() {
        let n = normalizer(SegmentationMode::None, &[], &[]);

        assert_eq!(
            n.normalize(raw("t", vec![("value", json!(0))])),
            Err(DropReason::Zero)
        );
        assert_eq!(
            n.normalize(raw("t", vec![("value", json!("0.0"))])),
            Err(DropReason::Zero)
        );
        assert_eq!(
            n.normalize(raw("t", vec![("value", json!("abc"))])),
            Err(DropReason::NonNumeric)
        );
        assert_eq!(
            n.normalize(raw("t", vec![("value", json!([1]))])),
            Err(DropReason::NonNumeric)
        );
        assert_eq!(
            n.normalize(raw("t", vec![("count", json!(1))])),
            Err(DropReason::MissingValue)
        );
    }

    #[test]
    fn test_update_mode_field_is_consumed() {
        let n = normalizer(SegmentationMode::All, &[], &[]);
        let event = n
            .normalize(raw(
                "t",
                vec![("value", json!(5)), ("update_mode", json!("max"))],
            ))
            .expect("event");

        assert_eq!(event.update_mode, UpdateMode::Max);
        assert!(event.segments.is_empty());
    }

    #[test]
    fn test_segmentation_all_keeps_record_order() {
        let n = normalizer(SegmentationMode::All, &[], &[]);
        let event = n
            .normalize(raw(
                "t",
                vec![
                    ("value", json!(1)),
                    ("user_id", json!(23456)),
                    ("path", json!("/auth/login")),
                    ("extra", json!(null)),
                ],
            ))
            .expect("event");

        assert_eq!(
            event.segments,
            vec![
                ("user_id".to_string(), "23456".to_string()),
                ("path".to_string(), "/auth/login".to_string()),
            ]
        );
    }

    #[test]
    fn test_segmentation_include_uses_list_order_and_skips_absent() {
        let n = normalizer(SegmentationMode::Include, &["path", "missing", "user_id"], &[]);
        let event = n
            .normalize(raw(
                "t",
                vec![
                    ("value", json!(1)),
                    ("user_id", json!("u1")),
                    ("path", json!("/a")),
                    ("host", json!("web-1")),
                ],
            ))
            .expect("event");

        assert_eq!(
            event.segments,
            vec![
                ("path".to_string(), "/a".to_string()),
                ("user_id".to_string(), "u1".to_string()),
            ]
        );
    }

    #[test]
    fn test_segmentation_exclude_applies_after_extraction() {
        let n = normalizer(SegmentationMode::All, &[], &["host"]);
        let event = n
            .normalize(raw(
                "t",
                vec![
                    ("value", json!(1)),
                    ("host", json!("web-1")),
                    ("ok", json!(true)),
                ],
            ))
            .expect("event");

        assert_eq!(event.segments, vec![("ok".to_string(), "true".to_string())]);
    }

    #[test]
    fn test_remove_tag_prefix_only_on_boundary() {
        let n = Normalizer::new(&NormalizeConfig {
            remove_tag_prefix: Some("app".to_string()),
            ..Default::default()
        });

        let strip = |tag: &str| {
            n.normalize(raw(tag, vec![("value", json!(1))]))
                .expect("event")
                .tag
        };

        assert_eq!(strip("app.requests"), "requests");
        assert_eq!(strip("app"), "");
        assert_eq!(strip("apple.requests"), "apple.requests");
        assert_eq!(strip("web.app.requests"), "web.app.requests");
    }

    #[test]
    fn test_add_tag_prefix_after_remove() {
        let n = Normalizer::new(&NormalizeConfig {
            remove_tag_prefix: Some("raw".to_string()),
            add_tag_prefix: Some("prod".to_string()),
            ..Default::default()
        });

        let event = n
            .normalize(raw("raw.login", vec![("value", json!(1))]))
            .expect("event");
        assert_eq!(event.tag, "prod.login");
    }
}
