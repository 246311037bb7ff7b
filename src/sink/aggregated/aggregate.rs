use crate::source::event::{UpdateMode, Value};

/// Arithmetic used to combine values within one reducer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arithmetic {
    /// Running sum, normalized per minute.
    Sum,
    /// Running maximum, never normalized.
    Max,
}

/// Accumulates the values of one aggregation key during a flush.
///
/// The reported update mode travels with the accumulator: `Average` uses
/// max arithmetic, and segmented totals use sum arithmetic while reporting
/// the mode of the counters folded into them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reducer {
    arithmetic: Arithmetic,
    mode: UpdateMode,
    value: Option<Value>,
}

impl Reducer {
    /// Creates the reducer for events carrying `mode`.
    pub fn for_mode(mode: UpdateMode) -> Self {
        let arithmetic = match mode {
            UpdateMode::Add => Arithmetic::Sum,
            UpdateMode::Max | UpdateMode::Average => Arithmetic::Max,
        };

        Self {
            arithmetic,
            mode,
            value: None,
        }
    }

    /// Creates a segmented-total reducer. Each folded counter overwrites the
    /// mode, so the total reports the mode of the last one.
    pub fn segmented_total() -> Self {
        Self {
            arithmetic: Arithmetic::Sum,
            mode: UpdateMode::Add,
            value: None,
        }
    }

    pub fn arithmetic(&self) -> Arithmetic {
        self.arithmetic
    }

    pub fn mode(&self) -> UpdateMode {
        self.mode
    }

    /// Combines one value into the accumulator.
    pub fn add(&mut self, value: Value) {
        self.value = Some(match (self.arithmetic, self.value) {
            (_, None) => value,
            (Arithmetic::Sum, Some(current)) => sum_values(current, value),
            (Arithmetic::Max, Some(current)) => max_value(current, value),
        });
    }

    /// Folds another reducer's raw value into this one, adopting its mode.
    pub fn fold(&mut self, other: &Reducer) {
        self.add(other.raw_value());
        self.mode = other.mode;
    }

    /// The accumulated value before normalization.
    pub fn raw_value(&self) -> Value {
        self.value.unwrap_or(Value::Int(0))
    }

    /// The value reported for a bucket spanning `minutes` minutes.
    ///
    /// Sums are divided by `minutes` when it exceeds one, staying integral
    /// when the division is exact. Maxima are reported as is.
    pub fn normalized_value(&self, minutes: i64) -> Value {
        let raw = self.raw_value();
        if self.arithmetic == Arithmetic::Max || minutes <= 1 {
            return raw;
        }

        match raw {
            Value::Int(sum) if sum % minutes == 0 => Value::Int(sum / minutes),
            Value::Int(sum) => Value::Float(sum as f64 / minutes as f64),
            Value::Float(sum) => Value::Float(sum / minutes as f64),
        }
    }
}

/// Adds two values, promoting to float on mixed input or i64 overflow.
fn sum_values(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Int(x), Value::Int(y)) => match x.checked_add(y) {
            Some(sum) => Value::Int(sum),
            None => Value::Float(x as f64 + y as f64),
        },
        _ => Value::Float(a.as_f64() + b.as_f64()),
    }
}

fn max_value(a: Value, b: Value) -> Value {
    if b.as_f64() > a.as_f64() {
        b
    } else {
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sum_reducer() {
        let mut r = Reducer::for_mode(UpdateMode::Add);
        r.add(Value::Int(3));
        r.add(Value::Int(4));

        assert_eq!(r.arithmetic(), Arithmetic::Sum);
        assert_eq!(r.raw_value(), Value::Int(7));
        assert_eq!(r.normalized_value(1), Value::Int(7));
    }

    #[test]
    fn test_sum_normalization_over_minutes() {
        let mut r = Reducer::for_mode(UpdateMode::Add);
        r.add(Value::Int(10));
        assert_eq!(r.normalized_value(5), Value::Int(2));
        assert_eq!(r.normalized_value(4), Value::Float(2.5));

        let mut f = Reducer::for_mode(UpdateMode::Add);
        f.add(Value::Float(3.0));
        assert_eq!(f.normalized_value(2), Value::Float(1.5));
    }

    #[test]
    fn test_sum_mixed_values_become_float() {
        let mut r = Reducer::for_mode(UpdateMode::Add);
        r.add(Value::Int(1));
        r.add(Value::Float(0.5));
        assert_eq!(r.raw_value(), Value::Float(1.5));
    }

    #[test]
    fn test_sum_overflow_promotes_to_float() {
        let mut r = Reducer::for_mode(UpdateMode::Add);
        r.add(Value::Int(i64::MAX));
        r.add(Value::Int(1));
        assert!(matches!(r.raw_value(), Value::Float(v) if v > 9.2e18));
    }

    #[test]
    fn test_max_reducer_ignores_minutes() {
        let mut r = Reducer::for_mode(UpdateMode::Max);
        r.add(Value::Int(3));
        r.add(Value::Int(9));
        r.add(Value::Float(4.5));

        assert_eq!(r.normalized_value(1), Value::Int(9));
        assert_eq!(r.normalized_value(10), Value::Int(9));
    }

    #[test]
    fn test_max_reducer_with_negative_values() {
        let mut r = Reducer::for_mode(UpdateMode::Max);
        r.add(Value::Int(-5));
        r.add(Value::Int(-2));
        assert_eq!(r.raw_value(), Value::Int(-2));
    }

    #[test]
    fn test_average_behaves_as_max() {
        let mut r = Reducer::for_mode(UpdateMode::Average);
        r.add(Value::Int(2));
        r.add(Value::Int(8));

        assert_eq!(r.arithmetic(), Arithmetic::Max);
        assert_eq!(r.mode(), UpdateMode::Average);
        assert_eq!(r.normalized_value(3), Value::Int(8));
    }

    #[test]
    fn test_segmented_total_sums_and_carries_mode() {
        let mut a = Reducer::for_mode(UpdateMode::Max);
        a.add(Value::Int(4));
        let mut b = Reducer::for_mode(UpdateMode::Max);
        b.add(Value::Int(6));

        let mut total = Reducer::segmented_total();
        total.fold(&a);
        total.fold(&b);

        assert_eq!(total.arithmetic(), Arithmetic::Sum);
        assert_eq!(total.mode(), UpdateMode::Max);
        assert_eq!(total.normalized_value(1), Value::Int(10));
        assert_eq!(total.normalized_value(2), Value::Int(5));
    }

    #[test]
    fn test_segmented_total_reports_last_folded_mode() {
        let mut max = Reducer::for_mode(UpdateMode::Max);
        max.add(Value::Int(1));
        let mut add = Reducer::for_mode(UpdateMode::Add);
        add.add(Value::Int(2));

        let mut total = Reducer::segmented_total();
        total.fold(&max);
        total.fold(&add);
        assert_eq!(total.mode(), UpdateMode::Add);

        total.fold(&max);
        assert_eq!(total.mode(), UpdateMode::Max);
        assert_eq!(total.raw_value(), Value::Int(4));
    }
}
