//! Forward conversion: ColumnValue → MySQLValue
//!
//! Converts decoded values back into parameters for statements run against
//! either instance.

use chrono::{Datelike, Timelike};
use mysql_async::{Params, Value};
use sync_core::{ColumnValue, KeyValue};

/// MySQL value wrapper for type-safe conversions.
#[derive(Debug, Clone, PartialEq)]
pub struct MySQLValue(pub Value);

impl MySQLValue {
    /// Get the inner mysql_async::Value.
    pub fn into_inner(self) -> Value {
        self.0
    }
}

impl From<&ColumnValue> for MySQLValue {
    fn from(value: &ColumnValue) -> Self {
        MySQLValue(match value {
            ColumnValue::Null => Value::NULL,
            ColumnValue::Int(i) => Value::Int(*i),
            ColumnValue::UInt(u) => Value::UInt(*u),
            ColumnValue::Float(f) => Value::Double(*f),
            // Decimal travels as text to keep its precision
            ColumnValue::Decimal(d) => Value::Bytes(d.to_string().into_bytes()),
            ColumnValue::Text(s) => Value::Bytes(s.clone().into_bytes()),
            ColumnValue::Bytes(b) => Value::Bytes(b.clone()),
            ColumnValue::Bool(b) => Value::Int(*b as i64),
            ColumnValue::DateTime(dt) => Value::Date(
                dt.year() as u16,
                dt.month() as u8,
                dt.day() as u8,
                dt.hour() as u8,
                dt.minute() as u8,
                dt.second() as u8,
                dt.nanosecond() / 1000,
            ),
            ColumnValue::Time(micros) => {
                let negative = *micros < 0;
                let abs = micros.unsigned_abs();
                let secs = abs / 1_000_000;
                Value::Time(
                    negative,
                    (secs / 86_400) as u32,
                    ((secs / 3600) % 24) as u8,
                    ((secs / 60) % 60) as u8,
                    (secs % 60) as u8,
                    (abs % 1_000_000) as u32,
                )
            }
        })
    }
}

impl From<ColumnValue> for MySQLValue {
    fn from(value: ColumnValue) -> Self {
        MySQLValue::from(&value)
    }
}

/// Positional parameters from a sequence of values.
pub fn to_params<'a>(values: impl IntoIterator<Item = &'a ColumnValue>) -> Params {
    let values: Vec<Value> = values
        .into_iter()
        .map(|v| MySQLValue::from(v).into_inner())
        .collect();
    if values.is_empty() {
        Params::Empty
    } else {
        Params::Positional(values)
    }
}

/// Parameters binding one key tuple.
pub fn key_params(key: &KeyValue) -> Params {
    to_params(key.values())
}

/// Parameters binding a closed range: the `min` values then the `max` values.
pub fn range_params(min: &KeyValue, max: &KeyValue) -> Params {
    to_params(min.values().chain(max.values()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(MySQLValue::from(&ColumnValue::Null).0, Value::NULL);
        assert_eq!(MySQLValue::from(&ColumnValue::Int(-3)).0, Value::Int(-3));
        assert_eq!(
            MySQLValue::from(&ColumnValue::UInt(u64::MAX)).0,
            Value::UInt(u64::MAX)
        );
        assert_eq!(
            MySQLValue::from(&ColumnValue::Decimal(Decimal::from_str("1.50").unwrap())).0,
            Value::Bytes(b"1.50".to_vec())
        );
        assert_eq!(
            MySQLValue::from(&ColumnValue::from("hi")).0,
            Value::Bytes(b"hi".to_vec())
        );
    }

    #[test]
    fn test_datetime_keeps_microseconds() {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_micro_opt(23, 59, 58, 123_456)
            .unwrap();
        assert_eq!(
            MySQLValue::from(&ColumnValue::DateTime(dt)).0,
            Value::Date(2024, 2, 29, 23, 59, 58, 123_456)
        );
    }

    #[test]
    fn test_time_splits_days() {
        let micros = -((26 * 3600 + 61) * 1_000_000 + 7);
        assert_eq!(
            MySQLValue::from(&ColumnValue::Time(micros)).0,
            Value::Time(true, 1, 2, 1, 1, 7)
        );
    }

    #[test]
    fn test_range_params_order() {
        let min = KeyValue::from_parts(["a", "b"], vec![1i64.into(), 2i64.into()]);
        let max = KeyValue::from_parts(["a", "b"], vec![3i64.into(), 4i64.into()]);
        assert_eq!(
            range_params(&min, &max),
            Params::Positional(vec![
                Value::Int(1),
                Value::Int(2),
                Value::Int(3),
                Value::Int(4)
            ])
        );
        assert_eq!(to_params(std::iter::empty()), Params::Empty);
    }
}
