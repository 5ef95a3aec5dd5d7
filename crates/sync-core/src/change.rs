//! Row mutations decoded from the binlog and the idempotent operations they
//! are applied as.

use crate::range::KeyValue;
use crate::schema::Table;
use crate::values::Row;

/// One row-level change from a rows event.
#[derive(Debug, Clone, PartialEq)]
pub enum RowMutation {
    Insert { after: Row },
    Update { before: Row, after: Row },
    Delete { before: Row },
}

/// An idempotent write against the target.
#[derive(Debug, Clone, PartialEq)]
pub enum RowOp {
    /// Upsert the full row.
    Replace { key: KeyValue, row: Row },
    /// Delete the row with this key, if present.
    Delete { key: KeyValue },
}

impl RowOp {
    /// Key this operation is routed by.
    pub fn key(&self) -> &KeyValue {
        match self {
            RowOp::Replace { key, .. } | RowOp::Delete { key } => key,
        }
    }
}

impl RowMutation {
    /// Turn a mutation into target operations.
    ///
    /// An update that changes any unique-key column becomes a delete of the
    /// before-key followed by a replace of the after-row; every other update
    /// is a single replace of the after-row.
    pub fn plan(self, table: &Table) -> Vec<RowOp> {
        match self {
            RowMutation::Insert { after } => vec![RowOp::Replace {
                key: table.key_of(&after),
                row: after,
            }],
            RowMutation::Delete { before } => vec![RowOp::Delete {
                key: table.key_of(&before),
            }],
            RowMutation::Update { before, after } => {
                if table.unique_key_changed(&before, &after) {
                    vec![
                        RowOp::Delete {
                            key: table.key_of(&before),
                        },
                        RowOp::Replace {
                            key: table.key_of(&after),
                            row: after,
                        },
                    ]
                } else {
                    vec![RowOp::Replace {
                        key: table.key_of(&after),
                        row: after,
                    }]
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::users_def;
    use crate::values::ColumnValue;

    fn row(id: i64, email: &str, name: &str) -> Row {
        vec![
            ColumnValue::Int(id),
            ColumnValue::from(email),
            ColumnValue::from(name),
            ColumnValue::Null,
        ]
    }

    #[test]
    fn test_key_change_splits_into_delete_and_replace() {
        let table = Table::new(users_def(), 10, 1).unwrap();
        let ops = RowMutation::Update {
            before: row(5, "a@x", "A"),
            after: row(9, "a@x", "A"),
        }
        .plan(&table);

        assert_eq!(ops.len(), 2);
        assert!(matches!(&ops[0], RowOp::Delete { key } if key.to_string() == "(id=5)"));
        assert!(matches!(&ops[1], RowOp::Replace { key, .. } if key.to_string() == "(id=9)"));
    }

    #[test]
    fn test_plain_update_is_single_replace() {
        let table = Table::new(users_def(), 10, 1).unwrap();
        let ops = RowMutation::Update {
            before: row(5, "a@x", "A"),
            after: row(5, "a@x", "B"),
        }
        .plan(&table);

        assert_eq!(
            ops,
            vec![RowOp::Replace {
                key: table.key_of(&row(5, "a@x", "B")),
                row: row(5, "a@x", "B"),
            }]
        );
    }

    #[test]
    fn test_insert_and_delete() {
        let table = Table::new(users_def(), 10, 1).unwrap();
        let insert = RowMutation::Insert {
            after: row(1, "e", "n"),
        }
        .plan(&table);
        assert!(matches!(&insert[..], [RowOp::Replace { .. }]));

        let delete = RowMutation::Delete {
            before: row(1, "e", "n"),
        }
        .plan(&table);
        assert_eq!(delete[0].key().to_string(), "(id=1)");
    }
}
