//! Column values as they travel between source, target and the progress store.
//!
//! MySQL rows are decoded into [`ColumnValue`], a small closed variant over
//! the scalar kinds the migration needs. Key comparison and equality are
//! defined per kind here instead of relying on whatever representation the
//! driver happened to return.

use std::cmp::Ordering;
use std::fmt;

use chrono::NaiveDateTime;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// A single decoded column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ColumnValue {
    /// SQL NULL
    Null,
    /// Signed integer family (TINYINT..BIGINT, YEAR)
    Int(i64),
    /// Unsigned integer family and BIT
    UInt(u64),
    /// FLOAT and DOUBLE
    Float(f64),
    /// DECIMAL / NUMERIC
    Decimal(Decimal),
    /// Character data, ENUM and SET labels, JSON documents
    Text(String),
    /// Binary data
    Bytes(Vec<u8>),
    /// Boolean
    Bool(bool),
    /// DATE, DATETIME and TIMESTAMP
    DateTime(NaiveDateTime),
    /// TIME, as signed microseconds
    Time(i64),
}

impl ColumnValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ColumnValue::Null)
    }

    /// Ordering rank of each kind group. Values of different groups order
    /// by rank so that comparison stays total.
    fn rank(&self) -> u8 {
        match self {
            ColumnValue::Null => 0,
            ColumnValue::Int(_)
            | ColumnValue::UInt(_)
            | ColumnValue::Float(_)
            | ColumnValue::Decimal(_)
            | ColumnValue::Bool(_) => 1,
            ColumnValue::Text(_) => 2,
            ColumnValue::Bytes(_) => 3,
            ColumnValue::DateTime(_) => 4,
            ColumnValue::Time(_) => 5,
        }
    }

    /// Compare two values the way an index on the column orders them.
    ///
    /// Numeric kinds compare by magnitude across signedness and precision,
    /// strings and bytes compare bytewise. NaN sorts below every other float.
    pub fn compare(&self, other: &ColumnValue) -> Ordering {
        use ColumnValue::*;

        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Text(a), Text(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Bytes(a), Bytes(b)) => a.cmp(b),
            (DateTime(a), DateTime(b)) => a.cmp(b),
            (Time(a), Time(b)) => a.cmp(b),
            (a, b) if a.rank() == 1 && b.rank() == 1 => compare_numeric(a, b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }

    /// Type-aware equality used to decide whether an update moved a row's
    /// unique key.
    ///
    /// Integers are equal across signedness when numerically equal, decimals
    /// compare by value (`1.0 == 1.00`), floats numerically with NaN equal
    /// to NaN, strings and bytes byte-exact.
    pub fn key_eq(&self, other: &ColumnValue) -> bool {
        use ColumnValue::*;

        match (self, other) {
            (Float(a), Float(b)) if a.is_nan() && b.is_nan() => true,
            (Float(a), Float(b)) => a == b,
            (Text(a), Text(b)) => a == b,
            (Bytes(a), Bytes(b)) => a == b,
            (a, b) if a.rank() == 1 && b.rank() == 1 => {
                compare_numeric(a, b) == Ordering::Equal
            }
            (a, b) => a.compare(b) == Ordering::Equal && a.rank() == b.rank(),
        }
    }

    /// Canonical text form. Equal values under [`ColumnValue::key_eq`] for
    /// integers share a form, so the form can be hashed for routing.
    pub fn canonical(&self) -> String {
        match self {
            ColumnValue::Null => "\\N".to_string(),
            ColumnValue::Int(i) => i.to_string(),
            ColumnValue::UInt(u) => u.to_string(),
            ColumnValue::Float(f) if *f == 0.0 => "0".to_string(),
            ColumnValue::Float(f) => f.to_string(),
            ColumnValue::Decimal(d) => d.normalize().to_string(),
            ColumnValue::Text(s) => s.clone(),
            ColumnValue::Bytes(b) => b.iter().map(|byte| format!("{byte:02x}")).collect(),
            ColumnValue::Bool(b) => (*b as u8).to_string(),
            ColumnValue::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S%.6f").to_string(),
            ColumnValue::Time(micros) => format_time(*micros),
        }
    }
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => f.write_str("NULL"),
            ColumnValue::Text(s) => write!(f, "'{s}'"),
            other => f.write_str(&other.canonical()),
        }
    }
}

impl From<i64> for ColumnValue {
    fn from(v: i64) -> Self {
        ColumnValue::Int(v)
    }
}

impl From<u64> for ColumnValue {
    fn from(v: u64) -> Self {
        ColumnValue::UInt(v)
    }
}

impl From<&str> for ColumnValue {
    fn from(v: &str) -> Self {
        ColumnValue::Text(v.to_string())
    }
}

impl From<String> for ColumnValue {
    fn from(v: String) -> Self {
        ColumnValue::Text(v)
    }
}

fn compare_numeric(a: &ColumnValue, b: &ColumnValue) -> Ordering {
    use ColumnValue::*;

    match (a, b) {
        (Float(_), _) | (_, Float(_)) => {
            let (x, y) = (as_f64(a), as_f64(b));
            match (x.is_nan(), y.is_nan()) {
                (true, true) => Ordering::Equal,
                (true, false) => Ordering::Less,
                (false, true) => Ordering::Greater,
                (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            }
        }
        (Decimal(_), _) | (_, Decimal(_)) => match (as_decimal(a), as_decimal(b)) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => as_i128(a).cmp(&as_i128(b)),
        },
        _ => as_i128(a).cmp(&as_i128(b)),
    }
}

fn as_i128(v: &ColumnValue) -> i128 {
    match v {
        ColumnValue::Int(i) => *i as i128,
        ColumnValue::UInt(u) => *u as i128,
        ColumnValue::Bool(b) => *b as i128,
        ColumnValue::Decimal(d) => d.trunc().to_i128().unwrap_or_default(),
        ColumnValue::Float(f) => *f as i128,
        _ => 0,
    }
}

fn as_f64(v: &ColumnValue) -> f64 {
    match v {
        ColumnValue::Float(f) => *f,
        ColumnValue::Decimal(d) => d.to_f64().unwrap_or(f64::NAN),
        other => as_i128(other) as f64,
    }
}

fn as_decimal(v: &ColumnValue) -> Option<Decimal> {
    match v {
        ColumnValue::Decimal(d) => Some(*d),
        ColumnValue::Int(i) => Some(Decimal::from(*i)),
        ColumnValue::UInt(u) => Some(Decimal::from(*u)),
        ColumnValue::Bool(b) => Some(Decimal::from(*b as u8)),
        _ => None,
    }
}

/// Render signed microseconds as MySQL TIME text (`-838:59:59.000000`).
pub fn format_time(micros: i64) -> String {
    let sign = if micros < 0 { "-" } else { "" };
    let abs = micros.unsigned_abs();
    let frac = abs % 1_000_000;
    let secs = abs / 1_000_000;
    format!(
        "{sign}{:02}:{:02}:{:02}.{frac:06}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60
    )
}

/// A full-width row: one value per source column, in source column order.
///
/// Ignored columns hold [`ColumnValue::Null`] when the row was read with a
/// statement that does not select them.
pub type Row = Vec<ColumnValue>;
