//! Primary-key tuples and the key ranges that copy and checksum work on.

use std::cmp::Ordering;
use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::values::ColumnValue;

/// Values of a table's key columns, in key column order.
///
/// Serialized as a JSON object (`{"id": {...}}`) whose entry order is the
/// key column order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct KeyValue(Vec<(String, ColumnValue)>);

impl KeyValue {
    pub fn new(parts: Vec<(String, ColumnValue)>) -> Self {
        Self(parts)
    }

    /// Build a key from parallel column-name and value lists.
    pub fn from_parts<I, S>(columns: I, values: Vec<ColumnValue>) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(columns.into_iter().map(Into::into).zip(values).collect())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(|(name, _)| name.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &ColumnValue> {
        self.0.iter().map(|(_, value)| value)
    }

    pub fn get(&self, column: &str) -> Option<&ColumnValue> {
        self.0
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    /// Lexicographic comparison by component, in key column order.
    pub fn compare(&self, other: &KeyValue) -> Ordering {
        for (a, b) in self.values().zip(other.values()) {
            match a.compare(b) {
                Ordering::Equal => continue,
                unequal => return unequal,
            }
        }
        self.len().cmp(&other.len())
    }

    /// `self >= other` under [`KeyValue::compare`].
    pub fn greater_or_equal(&self, other: &KeyValue) -> bool {
        self.compare(other) != Ordering::Less
    }

    /// Component-wise [`ColumnValue::key_eq`].
    pub fn key_eq(&self, other: &KeyValue) -> bool {
        self.len() == other.len()
            && self
                .values()
                .zip(other.values())
                .all(|(a, b)| a.key_eq(b))
    }

    /// Canonical text of all components joined, used for routing hashes.
    pub fn canonical(&self) -> String {
        self.values()
            .map(ColumnValue::canonical)
            .collect::<Vec<_>>()
            .join("\u{1f}")
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("(")?;
        for (i, (name, value)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}={value}")?;
        }
        f.write_str(")")
    }
}

impl Serialize for KeyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for KeyValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct KeyValueVisitor;

        impl<'de> Visitor<'de> for KeyValueVisitor {
            type Value = KeyValue;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of key column name to value")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<KeyValue, A::Error> {
                let mut parts = Vec::with_capacity(access.size_hint().unwrap_or(1));
                while let Some((name, value)) = access.next_entry::<String, ColumnValue>()? {
                    parts.push((name, value));
                }
                Ok(KeyValue(parts))
            }
        }

        deserializer.deserialize_map(KeyValueVisitor)
    }
}

/// A closed range `[min, max]` over one table's key: the unit of work for
/// row copy and checksum.
///
/// `token` orders ranges by generation and de-duplicates acknowledgments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimaryRangeValue {
    pub token: u64,
    pub schema: String,
    pub table: String,
    pub min: KeyValue,
    pub max: KeyValue,
}

impl PrimaryRangeValue {
    pub fn new(
        token: u64,
        schema: impl Into<String>,
        table: impl Into<String>,
        min: KeyValue,
        max: KeyValue,
    ) -> Self {
        Self {
            token,
            schema: schema.into(),
            table: table.into(),
            min,
            max,
        }
    }

    /// Whether `key` falls inside `[min, max]`.
    pub fn contains(&self, key: &KeyValue) -> bool {
        key.greater_or_equal(&self.min) && self.max.greater_or_equal(key)
    }
}

impl fmt::Display for PrimaryRangeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}#{} [{} .. {}]",
            self.schema, self.table, self.token, self.min, self.max
        )
    }
}
