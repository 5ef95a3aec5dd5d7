//! MySQL type conversions for sync-core types.
//!
//! This crate provides bidirectional conversions between sync-core's
//! [`ColumnValue`](sync_core::ColumnValue) and MySQL's native values, and
//! reads table layouts from INFORMATION_SCHEMA.
//!
//! # Structure
//!
//! - `forward`: Convert `ColumnValue` → `MySQLValue` (statement parameters)
//! - `reverse`: Convert MySQL values → `ColumnValue` (result sets and binlog images)
//! - `schema`: INFORMATION_SCHEMA column types, columns and unique indexes
//!
//! # Example
//!
//! ```rust,ignore
//! use mysql_types::{decode_value, MySQLValue, mysql_column_type};
//! use sync_core::{Column, ColumnType, ColumnValue};
//!
//! let column = Column::new("id", mysql_column_type("INT", "int(10) unsigned")).unsigned();
//! let value = decode_value(mysql_async::Value::Int(-1), &column)?;
//! assert_eq!(value, ColumnValue::UInt(u32::MAX as u64));
//!
//! let param: MySQLValue = (&value).into();
//! ```

pub mod forward;
pub mod reverse;
pub mod schema;

pub use forward::{key_params, range_params, to_params, MySQLValue};
pub use reverse::{decode_row, decode_value, parse_time_text, ConversionError};
pub use schema::{
    choose_key, column_from_info, extract_set_or_enum_values, is_unsigned, load_columns,
    load_unique_indexes, mysql_column_type, UniqueIndex,
};
