//! MySQL schema introspection.
//!
//! Decodes INFORMATION_SCHEMA column types into [`ColumnType`] and loads the
//! column list and unique indexes of a table.

use anyhow::{Context, Result};
use mysql_async::prelude::Queryable;
use mysql_async::Row;
use sync_core::{Column, ColumnType, TableId};

/// Convert a MySQL INFORMATION_SCHEMA column type to [`ColumnType`].
///
/// # Arguments
///
/// * `data_type` - The MySQL data type name (e.g., "INT", "VARCHAR", "ENUM")
/// * `column_type` - The full column type string (e.g., "int(10) unsigned", "enum('a','b')")
///
/// # Example
///
/// ```
/// use mysql_types::mysql_column_type;
/// use sync_core::ColumnType;
///
/// assert_eq!(mysql_column_type("INT", "int(11)"), ColumnType::Int);
/// assert_eq!(mysql_column_type("longtext", "longtext"), ColumnType::Text);
/// ```
pub fn mysql_column_type(data_type: &str, column_type: &str) -> ColumnType {
    match data_type.to_uppercase().as_str() {
        "TINYINT" | "BOOL" | "BOOLEAN" => ColumnType::TinyInt,
        "SMALLINT" => ColumnType::SmallInt,
        "MEDIUMINT" => ColumnType::MediumInt,
        "INT" | "INTEGER" => ColumnType::Int,
        "BIGINT" => ColumnType::BigInt,
        "FLOAT" => ColumnType::Float,
        "DOUBLE" | "REAL" => ColumnType::Double,
        "DECIMAL" | "NUMERIC" => ColumnType::Decimal,

        "CHAR" => ColumnType::Char,
        "VARCHAR" => ColumnType::VarChar,
        "TEXT" | "TINYTEXT" | "MEDIUMTEXT" | "LONGTEXT" => ColumnType::Text,

        "BINARY" => ColumnType::Binary,
        "VARBINARY" => ColumnType::VarBinary,
        "BLOB" | "TINYBLOB" | "MEDIUMBLOB" | "LONGBLOB" => ColumnType::Blob,

        "DATE" => ColumnType::Date,
        "DATETIME" => ColumnType::DateTime,
        "TIMESTAMP" => ColumnType::Timestamp,
        "TIME" => ColumnType::Time,
        "YEAR" => ColumnType::Year,
        "BIT" => ColumnType::Bit,

        "ENUM" => ColumnType::Enum,
        "SET" => ColumnType::Set,
        "JSON" => ColumnType::Json,

        _ => ColumnType::Other(column_type.to_lowercase()),
    }
}

/// Whether a full column type string carries the UNSIGNED attribute.
pub fn is_unsigned(column_type: &str) -> bool {
    column_type.to_lowercase().contains("unsigned")
}

/// Extract the labels of an ENUM or SET column type.
///
/// E.g., `enum('small','it''s, big')` -> `["small", "it's, big"]`
pub fn extract_set_or_enum_values(column_type: &str) -> Vec<String> {
    let Some(start) = column_type.find('(') else {
        return Vec::new();
    };
    let Some(end) = column_type.rfind(')') else {
        return Vec::new();
    };
    if start >= end {
        return Vec::new();
    }

    let mut values = Vec::new();
    let mut chars = column_type[start + 1..end].chars().peekable();
    let mut current = String::new();
    let mut in_quote = false;
    while let Some(c) = chars.next() {
        match (in_quote, c) {
            (false, '\'') => in_quote = true,
            (true, '\'') if chars.peek() == Some(&'\'') => {
                chars.next();
                current.push('\'');
            }
            (true, '\'') => {
                in_quote = false;
                values.push(std::mem::take(&mut current));
            }
            (true, c) => current.push(c),
            (false, _) => {}
        }
    }
    values
}

/// Build a [`Column`] from one INFORMATION_SCHEMA.COLUMNS row.
pub fn column_from_info(name: &str, data_type: &str, column_type: &str, nullable: bool) -> Column {
    let decoded = mysql_column_type(data_type, column_type);
    let mut column = Column::new(name, decoded.clone());
    column.nullable = nullable;
    column.unsigned = is_unsigned(column_type);
    match decoded {
        ColumnType::Enum => column.enum_values = extract_set_or_enum_values(column_type),
        ColumnType::Set => column.set_values = extract_set_or_enum_values(column_type),
        _ => {}
    }
    column
}

/// A unique index of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct UniqueIndex {
    pub name: String,
    pub columns: Vec<String>,
}

impl UniqueIndex {
    pub fn is_primary(&self) -> bool {
        self.name == "PRIMARY"
    }
}

/// Load the columns of a table in ordinal order.
pub async fn load_columns(conn: &mut mysql_async::Conn, table: &TableId) -> Result<Vec<Column>> {
    let query = "
        SELECT COLUMN_NAME, DATA_TYPE, COLUMN_TYPE, IS_NULLABLE
        FROM INFORMATION_SCHEMA.COLUMNS
        WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ?
        ORDER BY ORDINAL_POSITION";

    let rows: Vec<Row> = conn
        .exec(query, (&table.schema, &table.table))
        .await
        .with_context(|| format!("Failed to load columns of {table}"))?;

    let mut columns = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row
            .get(0)
            .ok_or_else(|| anyhow::anyhow!("Missing column name"))?;
        let data_type: String = row
            .get(1)
            .ok_or_else(|| anyhow::anyhow!("Missing data type"))?;
        let column_type: String = row
            .get(2)
            .ok_or_else(|| anyhow::anyhow!("Missing column type"))?;
        let is_nullable: String = row
            .get(3)
            .ok_or_else(|| anyhow::anyhow!("Missing nullability"))?;

        columns.push(column_from_info(
            &name,
            &data_type,
            &column_type,
            is_nullable.eq_ignore_ascii_case("YES"),
        ));
    }
    Ok(columns)
}

/// Load the unique indexes of a table; the primary key comes first.
pub async fn load_unique_indexes(
    conn: &mut mysql_async::Conn,
    table: &TableId,
) -> Result<Vec<UniqueIndex>> {
    let query = "
        SELECT INDEX_NAME, COLUMN_NAME
        FROM INFORMATION_SCHEMA.STATISTICS
        WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND NON_UNIQUE = 0
        ORDER BY INDEX_NAME = 'PRIMARY' DESC, INDEX_NAME, SEQ_IN_INDEX";

    let rows: Vec<(String, String)> = conn
        .exec(query, (&table.schema, &table.table))
        .await
        .with_context(|| format!("Failed to load indexes of {table}"))?;

    let mut indexes: Vec<UniqueIndex> = Vec::new();
    for (index_name, column_name) in rows {
        match indexes.last_mut() {
            Some(index) if index.name == index_name => index.columns.push(column_name),
            _ => indexes.push(UniqueIndex {
                name: index_name,
                columns: vec![column_name],
            }),
        }
    }
    Ok(indexes)
}

/// Pick the key that ranges and routing are built on: the primary key, or
/// else the first unique index whose columns are all NOT NULL.
pub fn choose_key(indexes: &[UniqueIndex], columns: &[Column]) -> Option<Vec<String>> {
    if let Some(primary) = indexes.iter().find(|i| i.is_primary()) {
        return Some(primary.columns.clone());
    }
    indexes
        .iter()
        .find(|index| {
            index.columns.iter().all(|name| {
                columns
                    .iter()
                    .any(|c| &c.name == name && !c.nullable)
            })
        })
        .map(|index| index.columns.clone())
}
