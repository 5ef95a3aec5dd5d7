//! Table metadata: columns on both sides, key positions, ignored columns and
//! the pre-rendered SQL for one migrated table.
//!
//! A [`Table`] is immutable. When the source's column layout changes, a new
//! instance with a higher `version` replaces the old one.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::range::KeyValue;
use crate::sql::{SideSql, SqlTemplates};
use crate::values::{ColumnValue, Row};

/// Which of the two instances a statement or name refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Source,
    Target,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Source => f.write_str("source"),
            Side::Target => f.write_str("target"),
        }
    }
}

/// Decoded MySQL column type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    TinyInt,
    SmallInt,
    MediumInt,
    Int,
    BigInt,
    Float,
    Double,
    Decimal,
    Char,
    VarChar,
    Text,
    Binary,
    VarBinary,
    Blob,
    Date,
    DateTime,
    Timestamp,
    Time,
    Year,
    Bit,
    Enum,
    Set,
    Json,
    Other(String),
}

impl ColumnType {
    /// Storage width in bits for the integer family.
    pub fn int_width(&self) -> Option<u32> {
        match self {
            ColumnType::TinyInt => Some(8),
            ColumnType::SmallInt => Some(16),
            ColumnType::MediumInt => Some(24),
            ColumnType::Int => Some(32),
            ColumnType::BigInt => Some(64),
            _ => None,
        }
    }

    pub fn is_textual(&self) -> bool {
        matches!(
            self,
            ColumnType::Char
                | ColumnType::VarChar
                | ColumnType::Text
                | ColumnType::Enum
                | ColumnType::Set
                | ColumnType::Json
        )
    }

    pub fn is_binary(&self) -> bool {
        matches!(
            self,
            ColumnType::Binary | ColumnType::VarBinary | ColumnType::Blob
        )
    }
}

/// One column of a table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub nullable: bool,
    pub unsigned: bool,
    /// Labels of an ENUM column, in declaration order.
    pub enum_values: Vec<String>,
    /// Members of a SET column, in declaration order.
    pub set_values: Vec<String>,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            unsigned: false,
            enum_values: Vec::new(),
            set_values: Vec::new(),
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unsigned(mut self) -> Self {
        self.unsigned = true;
        self
    }

    pub fn with_enum_values(mut self, values: Vec<String>) -> Self {
        self.enum_values = values;
        self
    }

    pub fn with_set_values(mut self, values: Vec<String>) -> Self {
        self.set_values = values;
        self
    }
}

/// Schema-qualified table name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            table: table.into(),
        }
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("table {0} has no primary or unique key")]
    NoKey(TableId),
    #[error("table {table}: key column '{column}' is not a column of the table")]
    UnknownKeyColumn { table: TableId, column: String },
    #[error("table {table}: key column '{column}' cannot be ignored")]
    IgnoredKeyColumn { table: TableId, column: String },
    #[error("table {table}: ignored column '{column}' does not exist")]
    UnknownIgnoredColumn { table: TableId, column: String },
    #[error("table {table}: column mapping '{source_column}' -> '{target_column}' collides with another column")]
    MappingCollision {
        table: TableId,
        source_column: String,
        target_column: String,
    },
    #[error("table {0} has every column ignored")]
    NoUsefulColumns(TableId),
    #[error("table {0}: batch size must be at least 1")]
    ZeroBatchSize(TableId),
}

/// Everything needed to build a [`Table`].
#[derive(Debug, Clone)]
pub struct TableDef {
    pub source: TableId,
    pub target: TableId,
    /// Source columns in ordinal order.
    pub columns: Vec<Column>,
    /// Source column name to target column name, for renamed columns.
    pub column_map: HashMap<String, String>,
    /// Columns of the chosen primary (or unique) key, source names.
    pub key_columns: Vec<String>,
    /// Columns of every unique index including the primary key, source names.
    pub unique_columns: Vec<String>,
    /// Source columns that are never copied.
    pub ignored_columns: Vec<String>,
}

/// Immutable metadata for one migrated table.
#[derive(Debug, Clone)]
pub struct Table {
    source: TableId,
    target: TableId,
    version: u64,
    source_columns: Vec<Column>,
    target_columns: Vec<Column>,
    source_index: HashMap<String, usize>,
    target_index: HashMap<String, usize>,
    source_to_target: HashMap<String, String>,
    target_to_source: HashMap<String, String>,
    ignored: BTreeSet<usize>,
    useful: Vec<usize>,
    key_positions: Vec<usize>,
    unique_positions: Vec<usize>,
    sql: SqlTemplates,
}

impl Table {
    pub fn new(def: TableDef, batch_size: usize, version: u64) -> Result<Self, SchemaError> {
        let TableDef {
            source,
            target,
            columns,
            column_map,
            key_columns,
            unique_columns,
            ignored_columns,
        } = def;

        if key_columns.is_empty() {
            return Err(SchemaError::NoKey(source));
        }
        if batch_size == 0 {
            return Err(SchemaError::ZeroBatchSize(source));
        }

        let source_index: HashMap<String, usize> = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.name.clone(), i))
            .collect();

        let mut target_columns = Vec::with_capacity(columns.len());
        let mut target_index = HashMap::with_capacity(columns.len());
        let mut source_to_target = HashMap::with_capacity(columns.len());
        let mut target_to_source = HashMap::with_capacity(columns.len());
        for (i, column) in columns.iter().enumerate() {
            let target_name = column_map
                .get(&column.name)
                .cloned()
                .unwrap_or_else(|| column.name.clone());
            if target_index.insert(target_name.clone(), i).is_some() {
                return Err(SchemaError::MappingCollision {
                    table: source,
                    source_column: column.name.clone(),
                    target_column: target_name,
                });
            }
            source_to_target.insert(column.name.clone(), target_name.clone());
            target_to_source.insert(target_name.clone(), column.name.clone());
            target_columns.push(Column {
                name: target_name,
                ..column.clone()
            });
        }

        let mut ignored = BTreeSet::new();
        for name in &ignored_columns {
            let position = source_index.get(name).copied().ok_or_else(|| {
                SchemaError::UnknownIgnoredColumn {
                    table: source.clone(),
                    column: name.clone(),
                }
            })?;
            ignored.insert(position);
        }

        let mut key_positions = Vec::with_capacity(key_columns.len());
        for name in &key_columns {
            let position = source_index.get(name).copied().ok_or_else(|| {
                SchemaError::UnknownKeyColumn {
                    table: source.clone(),
                    column: name.clone(),
                }
            })?;
            if ignored.contains(&position) {
                return Err(SchemaError::IgnoredKeyColumn {
                    table: source,
                    column: name.clone(),
                });
            }
            key_positions.push(position);
        }

        let mut unique_positions: Vec<usize> = unique_columns
            .iter()
            .filter_map(|name| source_index.get(name).copied())
            .filter(|position| !ignored.contains(position))
            .collect();
        unique_positions.extend(key_positions.iter().copied());
        unique_positions.sort_unstable();
        unique_positions.dedup();

        let useful: Vec<usize> = (0..columns.len())
            .filter(|i| !ignored.contains(i))
            .collect();
        if useful.is_empty() {
            return Err(SchemaError::NoUsefulColumns(source));
        }

        let names = |cols: &[Column], positions: &[usize]| -> Vec<String> {
            positions.iter().map(|&i| cols[i].name.clone()).collect()
        };
        let sql = SqlTemplates {
            batch_size,
            source: SideSql::build(
                &source,
                &names(&columns, &key_positions),
                &names(&columns, &useful),
                batch_size,
            ),
            target: SideSql::build(
                &target,
                &names(&target_columns, &key_positions),
                &names(&target_columns, &useful),
                batch_size,
            ),
        };

        Ok(Self {
            source,
            target,
            version,
            source_columns: columns,
            target_columns,
            source_index,
            target_index,
            source_to_target,
            target_to_source,
            ignored,
            useful,
            key_positions,
            unique_positions,
            sql,
        })
    }

    /// Source identity; the identity tables are tracked and persisted under.
    pub fn id(&self) -> &TableId {
        &self.source
    }

    pub fn target_id(&self) -> &TableId {
        &self.target
    }

    pub fn name(&self, side: Side) -> &TableId {
        match side {
            Side::Source => &self.source,
            Side::Target => &self.target,
        }
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn columns(&self, side: Side) -> &[Column] {
        match side {
            Side::Source => &self.source_columns,
            Side::Target => &self.target_columns,
        }
    }

    pub fn column_count(&self) -> usize {
        self.source_columns.len()
    }

    pub fn position(&self, side: Side, column: &str) -> Option<usize> {
        match side {
            Side::Source => self.source_index.get(column).copied(),
            Side::Target => self.target_index.get(column).copied(),
        }
    }

    pub fn target_name_of(&self, source_column: &str) -> Option<&str> {
        self.source_to_target.get(source_column).map(String::as_str)
    }

    pub fn source_name_of(&self, target_column: &str) -> Option<&str> {
        self.target_to_source.get(target_column).map(String::as_str)
    }

    pub fn ignored(&self) -> &BTreeSet<usize> {
        &self.ignored
    }

    /// Positions of the copied columns, in column order.
    pub fn useful(&self) -> &[usize] {
        &self.useful
    }

    pub fn key_positions(&self) -> &[usize] {
        &self.key_positions
    }

    /// Key column names on the source side.
    pub fn key_columns(&self) -> Vec<&str> {
        self.key_positions
            .iter()
            .map(|&i| self.source_columns[i].name.as_str())
            .collect()
    }

    pub fn sql(&self, side: Side) -> &SideSql {
        match side {
            Side::Source => &self.sql.source,
            Side::Target => &self.sql.target,
        }
    }

    pub fn batch_size(&self) -> usize {
        self.sql.batch_size
    }

    /// Key of a full-width row.
    pub fn key_of(&self, row: &Row) -> KeyValue {
        KeyValue::new(
            self.key_positions
                .iter()
                .map(|&i| {
                    (
                        self.source_columns[i].name.clone(),
                        row.get(i).cloned().unwrap_or(ColumnValue::Null),
                    )
                })
                .collect(),
        )
    }

    /// Key built from values in key column order.
    pub fn key_from_values(&self, values: Vec<ColumnValue>) -> KeyValue {
        KeyValue::from_parts(self.key_columns(), values)
    }

    /// Values of the copied columns of a full-width row.
    pub fn project_useful(&self, row: &Row) -> Vec<ColumnValue> {
        self.useful
            .iter()
            .map(|&i| row.get(i).cloned().unwrap_or(ColumnValue::Null))
            .collect()
    }

    /// Widen values of the copied columns back to a full-width row.
    pub fn row_from_useful(&self, values: Vec<ColumnValue>) -> Row {
        let mut row = vec![ColumnValue::Null; self.source_columns.len()];
        for (&position, value) in self.useful.iter().zip(values) {
            row[position] = value;
        }
        row
    }

    /// Whether any unique-key column differs between two images of a row.
    pub fn unique_key_changed(&self, before: &Row, after: &Row) -> bool {
        self.unique_positions.iter().any(|&i| match (before.get(i), after.get(i)) {
            (Some(a), Some(b)) => !a.key_eq(b),
            _ => true,
        })
    }
}
