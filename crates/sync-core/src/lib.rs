//! Core types for mysql-migrate.
//!
//! This crate holds the database-independent vocabulary shared by the
//! engines and the storage crates:
//!
//! - [`ColumnValue`] - closed variant over the MySQL scalar kinds
//! - [`KeyValue`] / [`PrimaryRangeValue`] - key tuples and key ranges
//! - [`LogFilePos`] - binlog coordinates
//! - [`Table`] - per-table metadata with pre-rendered SQL
//! - [`RowMutation`] / [`RowOp`] - binlog row changes and how they are applied
//!
//! # Architecture
//!
//! ```text
//! sync-core (this crate)
//!    │
//!    ├─── mysql-types          (mysql_async::Value <-> ColumnValue, information_schema)
//!    ├─── checkpoint           (durable progress store)
//!    ├─── mysql-binlog-source  (replication client)
//!    └─── mysql-migrate        (the engines)
//! ```

pub mod change;
pub mod position;
pub mod range;
pub mod schema;
pub mod sql;
pub mod values;

pub use change::{RowMutation, RowOp};
pub use position::LogFilePos;
pub use range::{KeyValue, PrimaryRangeValue};
pub use schema::{Column, ColumnType, SchemaError, Side, Table, TableDef, TableId};
pub use sql::{quote_ident, SideSql, SqlTemplates};
pub use values::{ColumnValue, Row};
