//! Reverse conversion: MySQL values → ColumnValue
//!
//! Values arrive from three places: text-protocol result sets (almost
//! everything is `Value::Bytes`), binary-protocol result sets (typed) and
//! binlog row images (typed, but integers are always signed and ENUM/SET
//! carry their index or bitmask). The declared [`Column`] decides how each
//! one is read.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use mysql_async::Value;
use rust_decimal::Decimal;
use std::str::FromStr;
use sync_core::{Column, ColumnType, ColumnValue, Row};
use thiserror::Error;

/// Error during MySQL value conversion.
#[derive(Debug, Error, PartialEq)]
pub enum ConversionError {
    #[error("Column '{column}': expected {expected}, got {actual}")]
    TypeMismatch {
        column: String,
        expected: &'static str,
        actual: String,
    },
    #[error("Column '{column}': invalid UTF-8 in string")]
    InvalidUtf8 { column: String },
    #[error("Column '{column}': invalid number '{text}'")]
    InvalidNumber { column: String, text: String },
    #[error("Column '{column}': invalid date/time value '{text}'")]
    InvalidDateTime { column: String, text: String },
    #[error("Column '{column}': enum index {index} out of range")]
    EnumIndexOutOfRange { column: String, index: i64 },
    #[error("Row has {actual} values but the table has {expected} columns")]
    ColumnCountMismatch { expected: usize, actual: usize },
}

/// Decode a row whose values line up with `columns`.
pub fn decode_row(values: Vec<Value>, columns: &[Column]) -> Result<Row, ConversionError> {
    if values.len() != columns.len() {
        return Err(ConversionError::ColumnCountMismatch {
            expected: columns.len(),
            actual: values.len(),
        });
    }
    values
        .into_iter()
        .zip(columns)
        .map(|(value, column)| decode_value(value, column))
        .collect()
}

/// Decode a single value of `column`.
pub fn decode_value(value: Value, column: &Column) -> Result<ColumnValue, ConversionError> {
    match value {
        Value::NULL => Ok(ColumnValue::Null),
        Value::Int(i) => decode_int(i, column),
        Value::UInt(u) => match column.column_type {
            ColumnType::Enum | ColumnType::Set => decode_int(u as i64, column),
            _ => Ok(ColumnValue::UInt(u)),
        },
        Value::Float(f) => Ok(ColumnValue::Float(f as f64)),
        Value::Double(d) => Ok(ColumnValue::Float(d)),
        Value::Date(year, month, day, hour, minute, second, micros) => {
            Ok(decode_date(year, month, day, hour, minute, second, micros))
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total = ((days as i64 * 24 + hours as i64) * 3600
                + minutes as i64 * 60
                + seconds as i64)
                * 1_000_000
                + micros as i64;
            Ok(ColumnValue::Time(if negative { -total } else { total }))
        }
        Value::Bytes(bytes) => decode_bytes(bytes, column),
    }
}

fn decode_int(i: i64, column: &Column) -> Result<ColumnValue, ConversionError> {
    match column.column_type {
        ColumnType::Enum => {
            if i == 0 {
                // Invalid values are stored as index 0 and read back as ''.
                return Ok(ColumnValue::Text(String::new()));
            }
            column
                .enum_values
                .get((i - 1) as usize)
                .filter(|_| i > 0)
                .map(|label| ColumnValue::Text(label.clone()))
                .ok_or_else(|| ConversionError::EnumIndexOutOfRange {
                    column: column.name.clone(),
                    index: i,
                })
        }
        ColumnType::Set => {
            let mask = i as u64;
            let members: Vec<&str> = column
                .set_values
                .iter()
                .enumerate()
                .filter(|(bit, _)| *bit < 64 && mask & (1u64 << bit) != 0)
                .map(|(_, label)| label.as_str())
                .collect();
            Ok(ColumnValue::Text(members.join(",")))
        }
        ColumnType::Bit => Ok(ColumnValue::UInt(i as u64)),
        ColumnType::Decimal => Ok(ColumnValue::Decimal(Decimal::from(i))),
        ColumnType::Float | ColumnType::Double => Ok(ColumnValue::Float(i as f64)),
        _ if column.unsigned => {
            let width = column.column_type.int_width().unwrap_or(64);
            let unsigned = if width >= 64 {
                i as u64
            } else {
                (i as u64) & ((1u64 << width) - 1)
            };
            Ok(ColumnValue::UInt(unsigned))
        }
        _ => Ok(ColumnValue::Int(i)),
    }
}

fn decode_date(
    year: u16,
    month: u8,
    day: u8,
    hour: u8,
    minute: u8,
    second: u8,
    micros: u32,
) -> ColumnValue {
    let date = NaiveDate::from_ymd_opt(year as i32, month as u32, day as u32);
    let time =
        NaiveTime::from_hms_micro_opt(hour as u32, minute as u32, second as u32, micros);
    match (date, time) {
        (Some(date), Some(time)) => ColumnValue::DateTime(NaiveDateTime::new(date, time)),
        // Zero dates and dates with zero parts are kept verbatim.
        _ => ColumnValue::Text(format!(
            "{year:04}-{month:02}-{day:02} {hour:02}:{minute:02}:{second:02}"
        )),
    }
}

fn decode_bytes(bytes: Vec<u8>, column: &Column) -> Result<ColumnValue, ConversionError> {
    let column_type = &column.column_type;

    if column_type.is_binary() || matches!(column_type, ColumnType::Other(_)) {
        return Ok(ColumnValue::Bytes(bytes));
    }

    if *column_type == ColumnType::Bit {
        let value = bytes
            .iter()
            .rev()
            .take(8)
            .enumerate()
            .fold(0u64, |acc, (i, b)| acc | ((*b as u64) << (8 * i)));
        return Ok(ColumnValue::UInt(value));
    }

    let text = String::from_utf8(bytes).map_err(|_| ConversionError::InvalidUtf8 {
        column: column.name.clone(),
    })?;

    if column_type.is_textual() {
        return Ok(ColumnValue::Text(text));
    }

    let invalid_number = || ConversionError::InvalidNumber {
        column: column.name.clone(),
        text: text.clone(),
    };

    match column_type {
        ColumnType::TinyInt
        | ColumnType::SmallInt
        | ColumnType::MediumInt
        | ColumnType::Int
        | ColumnType::BigInt
        | ColumnType::Year => {
            if column.unsigned {
                text.parse::<u64>()
                    .map(ColumnValue::UInt)
                    .map_err(|_| invalid_number())
            } else {
                text.parse::<i64>()
                    .map(ColumnValue::Int)
                    .map_err(|_| invalid_number())
            }
        }
        ColumnType::Float | ColumnType::Double => text
            .parse::<f64>()
            .map(ColumnValue::Float)
            .map_err(|_| invalid_number()),
        ColumnType::Decimal => Decimal::from_str(&text)
            .or_else(|_| Decimal::from_scientific(&text))
            .map(ColumnValue::Decimal)
            .map_err(|_| invalid_number()),
        ColumnType::Date | ColumnType::DateTime | ColumnType::Timestamp => {
            Ok(parse_datetime_text(&text))
        }
        ColumnType::Time => parse_time_text(&text)
            .map(ColumnValue::Time)
            .ok_or_else(|| ConversionError::InvalidDateTime {
                column: column.name.clone(),
                text: text.clone(),
            }),
        _ => Ok(ColumnValue::Text(text)),
    }
}

/// `YYYY-MM-DD[ HH:MM:SS[.ffffff]]`; zero dates stay text.
fn parse_datetime_text(text: &str) -> ColumnValue {
    if let Ok(dt) = NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f") {
        return ColumnValue::DateTime(dt);
    }
    if let Ok(date) = NaiveDate::parse_from_str(text, "%Y-%m-%d") {
        return ColumnValue::DateTime(date.and_time(NaiveTime::MIN));
    }
    ColumnValue::Text(text.to_string())
}

/// `[-]H:MM:SS[.ffffff]` to signed microseconds.
pub fn parse_time_text(text: &str) -> Option<i64> {
    let (negative, rest) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, fraction) = match rest.split_once('.') {
        Some((clock, fraction)) => (clock, fraction),
        None => (rest, ""),
    };
    let mut parts = clock.split(':');
    let hours: i64 = parts.next()?.parse().ok()?;
    let minutes: i64 = parts.next()?.parse().ok()?;
    let seconds: i64 = parts.next()?.parse().ok()?;
    if parts.next().is_some() || fraction.len() > 6 {
        return None;
    }
    let micros: i64 = if fraction.is_empty() {
        0
    } else {
        format!("{fraction:0<6}").parse().ok()?
    };
    let total = (hours * 3600 + minutes * 60 + seconds) * 1_000_000 + micros;
    Some(if negative { -total } else { total })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(name: &str, column_type: ColumnType) -> Column {
        Column::new(name, column_type)
    }

    #[test]
    fn test_signed_binlog_int_masked_for_unsigned_columns() {
        let tiny = col("t", ColumnType::TinyInt).unsigned();
        assert_eq!(
            decode_value(Value::Int(-1), &tiny).unwrap(),
            ColumnValue::UInt(255)
        );

        let big = col("b", ColumnType::BigInt).unsigned();
        assert_eq!(
            decode_value(Value::Int(-1), &big).unwrap(),
            ColumnValue::UInt(u64::MAX)
        );

        let signed = col("s", ColumnType::Int);
        assert_eq!(
            decode_value(Value::Int(-7), &signed).unwrap(),
            ColumnValue::Int(-7)
        );
    }

    #[test]
    fn test_enum_index_to_label() {
        let size = col("size", ColumnType::Enum)
            .with_enum_values(vec!["s".to_string(), "m".to_string(), "l".to_string()]);
        assert_eq!(
            decode_value(Value::Int(2), &size).unwrap(),
            ColumnValue::from("m")
        );
        assert_eq!(
            decode_value(Value::Int(0), &size).unwrap(),
            ColumnValue::from("")
        );
        assert!(matches!(
            decode_value(Value::Int(4), &size),
            Err(ConversionError::EnumIndexOutOfRange { index: 4, .. })
        ));
        assert_eq!(
            decode_value(Value::Bytes(b"l".to_vec()), &size).unwrap(),
            ColumnValue::from("l")
        );
    }

    #[test]
    fn test_set_bitmask_to_labels() {
        let flags = col("flags", ColumnType::Set).with_set_values(vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string(),
        ]);
        assert_eq!(
            decode_value(Value::Int(0b101), &flags).unwrap(),
            ColumnValue::from("a,c")
        );
        assert_eq!(
            decode_value(Value::Int(0), &flags).unwrap(),
            ColumnValue::from("")
        );
    }

    #[test]
    fn test_text_protocol_numbers() {
        let id = col("id", ColumnType::BigInt);
        assert_eq!(
            decode_value(Value::Bytes(b"42".to_vec()), &id).unwrap(),
            ColumnValue::Int(42)
        );

        let price = col("price", ColumnType::Decimal);
        assert_eq!(
            decode_value(Value::Bytes(b"12.50".to_vec()), &price).unwrap(),
            ColumnValue::Decimal(Decimal::from_str("12.50").unwrap())
        );

        assert!(matches!(
            decode_value(Value::Bytes(b"abc".to_vec()), &id),
            Err(ConversionError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn test_bit_bytes_are_big_endian() {
        let bits = col("bits", ColumnType::Bit);
        assert_eq!(
            decode_value(Value::Bytes(vec![0x01, 0x02]), &bits).unwrap(),
            ColumnValue::UInt(258)
        );
    }

    #[test]
    fn test_binary_and_text() {
        let blob = col("data", ColumnType::Blob);
        assert_eq!(
            decode_value(Value::Bytes(vec![0xff, 0x00]), &blob).unwrap(),
            ColumnValue::Bytes(vec![0xff, 0x00])
        );

        let name = col("name", ColumnType::VarChar);
        assert!(matches!(
            decode_value(Value::Bytes(vec![0xff, 0xfe]), &name),
            Err(ConversionError::InvalidUtf8 { .. })
        ));
    }

    #[test]
    fn test_dates() {
        let created = col("created", ColumnType::DateTime);
        let expected = NaiveDate::from_ymd_opt(2024, 1, 15)
            .unwrap()
            .and_hms_micro_opt(10, 30, 0, 500)
            .unwrap();
        assert_eq!(
            decode_value(Value::Date(2024, 1, 15, 10, 30, 0, 500), &created).unwrap(),
            ColumnValue::DateTime(expected)
        );
        assert_eq!(
            decode_value(Value::Date(0, 0, 0, 0, 0, 0, 0), &created).unwrap(),
            ColumnValue::from("0000-00-00 00:00:00")
        );
        assert_eq!(
            decode_value(Value::Bytes(b"2024-01-15 10:30:00.000500".to_vec()), &created)
                .unwrap(),
            ColumnValue::DateTime(expected)
        );
    }

    #[test]
    fn test_time_values() {
        let t = col("t", ColumnType::Time);
        assert_eq!(
            decode_value(Value::Time(true, 1, 2, 0, 0, 0), &t).unwrap(),
            ColumnValue::Time(-26 * 3600 * 1_000_000)
        );
        assert_eq!(parse_time_text("-838:59:59"), Some(-3_020_399_000_000));
        assert_eq!(parse_time_text("01:00:00.5"), Some(3_600_500_000));
        assert_eq!(parse_time_text("nope"), None);
    }

    #[test]
    fn test_decode_row_checks_width() {
        let columns = vec![col("a", ColumnType::Int), col("b", ColumnType::Int)];
        assert_eq!(
            decode_row(vec![Value::Int(1)], &columns),
            Err(ConversionError::ColumnCountMismatch {
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            decode_row(vec![Value::Int(1), Value::NULL], &columns).unwrap(),
            vec![ColumnValue::Int(1), ColumnValue::Null]
        );
    }
}
