//! Pre-rendered, parameterized SQL for one table on one side.
//!
//! Range predicates bind the `min` key values followed by the `max` key
//! values; single-row statements bind the key values in key column order.
//! Composite keys use row-constructor comparison so ranges stay
//! lexicographic in key column order.

use crate::schema::TableId;

/// Statements for one side (source or target) of a table.
#[derive(Debug, Clone, PartialEq)]
pub struct SideSql {
    /// First key tuple of the table.
    pub select_first_key: String,
    /// Last key tuple of the table.
    pub select_last_key: String,
    /// Up to `batch_size` key tuples in `[from, until]`, ascending.
    pub select_next_batch: String,
    /// Up to `batch_size` key tuples in `(from, until]`, ascending.
    pub select_batch_after: String,
    /// Copied columns of every row inside a closed key range.
    pub select_range_rows: String,
    /// Key tuples of every row inside a closed key range.
    pub select_range_keys: String,
    /// `(row count, BIT_XOR of row checksums)` over a closed key range.
    pub select_range_checksum: String,
    /// Checksum of the single row with the bound key.
    pub select_row_checksum: String,
    /// Copied columns of the single row with the bound key.
    pub select_row: String,
    /// `INSERT IGNORE` of a full batch of rows.
    pub insert_ignore_batch: String,
    /// `REPLACE` of one row.
    pub replace_one: String,
    /// `DELETE` of the row with the bound key.
    pub delete_by_key: String,
    insert_head: String,
    row_placeholder: String,
    batch_size: usize,
}

/// Both sides' statements for a table.
#[derive(Debug, Clone, PartialEq)]
pub struct SqlTemplates {
    pub batch_size: usize,
    pub source: SideSql,
    pub target: SideSql,
}

/// Quote an identifier with backticks.
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

fn placeholders(n: usize) -> String {
    format!("({})", vec!["?"; n].join(", "))
}

/// Left-hand side of a key comparison: `col` or `(a, b)`.
fn key_tuple(key: &[String]) -> String {
    if key.len() == 1 {
        quote_ident(&key[0])
    } else {
        format!("({})", quote_list(key))
    }
}

fn key_bound(key: &[String]) -> String {
    if key.len() == 1 {
        "?".to_string()
    } else {
        placeholders(key.len())
    }
}

/// Per-row checksum expression over the given columns.
///
/// Every value is preceded by its byte length, so a separator inside a
/// value cannot shift it into the next column. NULL markers are folded in
/// so that NULL and the empty string do not collide.
pub fn row_checksum_expr(columns: &[String]) -> String {
    let values = columns
        .iter()
        .map(|c| {
            let c = quote_ident(c);
            format!("LENGTH({c}), {c}")
        })
        .collect::<Vec<_>>()
        .join(", ");
    let nulls = columns
        .iter()
        .map(|c| format!("ISNULL({})", quote_ident(c)))
        .collect::<Vec<_>>()
        .join(", ");
    format!("CRC32(CONCAT_WS('#', {values}, CONCAT({nulls})))")
}

impl SideSql {
    pub fn build(table: &TableId, key: &[String], useful: &[String], batch_size: usize) -> Self {
        let name = format!(
            "{}.{}",
            quote_ident(&table.schema),
            quote_ident(&table.table)
        );
        let key_cols = quote_list(key);
        let key_lhs = key_tuple(key);
        let key_rhs = key_bound(key);
        let order_asc = key_cols.clone();
        let order_desc = key
            .iter()
            .map(|k| format!("{} DESC", quote_ident(k)))
            .collect::<Vec<_>>()
            .join(", ");
        let key_eq = key
            .iter()
            .map(|k| format!("{} = ?", quote_ident(k)))
            .collect::<Vec<_>>()
            .join(" AND ");
        let in_range = format!("{key_lhs} >= {key_rhs} AND {key_lhs} <= {key_rhs}");
        let useful_cols = quote_list(useful);
        let checksum = row_checksum_expr(useful);

        let insert_head = format!("INSERT IGNORE INTO {name} ({useful_cols}) VALUES ");
        let row_placeholder = placeholders(useful.len());
        let insert_ignore_batch = Self::render_insert(&insert_head, &row_placeholder, batch_size);

        Self {
            select_first_key: format!("SELECT {key_cols} FROM {name} ORDER BY {order_asc} LIMIT 1"),
            select_last_key: format!(
                "SELECT {key_cols} FROM {name} ORDER BY {order_desc} LIMIT 1"
            ),
            select_next_batch: format!(
                "SELECT {key_cols} FROM {name} WHERE {key_lhs} >= {key_rhs} AND {key_lhs} <= {key_rhs} ORDER BY {order_asc} LIMIT {batch_size}"
            ),
            select_batch_after: format!(
                "SELECT {key_cols} FROM {name} WHERE {key_lhs} > {key_rhs} AND {key_lhs} <= {key_rhs} ORDER BY {order_asc} LIMIT {batch_size}"
            ),
            select_range_rows: format!(
                "SELECT {useful_cols} FROM {name} WHERE {in_range} ORDER BY {order_asc}"
            ),
            select_range_keys: format!(
                "SELECT {key_cols} FROM {name} WHERE {in_range} ORDER BY {order_asc}"
            ),
            select_range_checksum: format!(
                "SELECT COUNT(*), COALESCE(BIT_XOR(CAST({checksum} AS UNSIGNED)), 0) FROM {name} WHERE {in_range}"
            ),
            select_row_checksum: format!("SELECT {checksum} FROM {name} WHERE {key_eq}"),
            select_row: format!("SELECT {useful_cols} FROM {name} WHERE {key_eq}"),
            insert_ignore_batch,
            replace_one: format!(
                "REPLACE INTO {name} ({useful_cols}) VALUES {row_placeholder}"
            ),
            delete_by_key: format!("DELETE FROM {name} WHERE {key_eq}"),
            insert_head,
            row_placeholder,
            batch_size,
        }
    }

    fn render_insert(head: &str, row: &str, rows: usize) -> String {
        let mut sql = String::with_capacity(head.len() + rows * (row.len() + 2));
        sql.push_str(head);
        for i in 0..rows {
            if i > 0 {
                sql.push_str(", ");
            }
            sql.push_str(row);
        }
        sql
    }

    /// `INSERT IGNORE` for `rows` rows; the pre-rendered statement when
    /// `rows` is a full batch.
    pub fn insert_ignore(&self, rows: usize) -> String {
        if rows == self.batch_size {
            self.insert_ignore_batch.clone()
        } else {
            Self::render_insert(&self.insert_head, &self.row_placeholder, rows)
        }
    }

    /// `REPLACE` for `rows` rows.
    pub fn replace_rows(&self, rows: usize) -> String {
        let head = self.insert_head.replacen("INSERT IGNORE", "REPLACE", 1);
        Self::render_insert(&head, &self.row_placeholder, rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::tests::users_def;
    use crate::schema::{Side, Table};

    #[test]
    fn test_single_key_statements() {
        let table = Table::new(users_def(), 2, 1).unwrap();
        let sql = table.sql(Side::Source);

        assert_eq!(
            sql.select_first_key,
            "SELECT `id` FROM `app`.`users` ORDER BY `id` LIMIT 1"
        );
        assert_eq!(
            sql.select_last_key,
            "SELECT `id` FROM `app`.`users` ORDER BY `id` DESC LIMIT 1"
        );
        assert_eq!(
            sql.select_next_batch,
            "SELECT `id` FROM `app`.`users` WHERE `id` >= ? AND `id` <= ? ORDER BY `id` LIMIT 2"
        );
        assert_eq!(
            sql.select_batch_after,
            "SELECT `id` FROM `app`.`users` WHERE `id` > ? AND `id` <= ? ORDER BY `id` LIMIT 2"
        );
        assert_eq!(
            sql.select_range_rows,
            "SELECT `id`, `email`, `name` FROM `app`.`users` WHERE `id` >= ? AND `id` <= ? ORDER BY `id`"
        );
        assert_eq!(
            sql.delete_by_key,
            "DELETE FROM `app`.`users` WHERE `id` = ?"
        );
    }

    #[test]
    fn test_target_statements_use_mapped_names() {
        let table = Table::new(users_def(), 2, 1).unwrap();
        let sql = table.sql(Side::Target);

        assert_eq!(
            sql.replace_one,
            "REPLACE INTO `app_new`.`people` (`id`, `email`, `full_name`) VALUES (?, ?, ?)"
        );
        assert_eq!(
            sql.insert_ignore_batch,
            "INSERT IGNORE INTO `app_new`.`people` (`id`, `email`, `full_name`) VALUES (?, ?, ?), (?, ?, ?)"
        );
        assert_eq!(
            sql.insert_ignore(1),
            "INSERT IGNORE INTO `app_new`.`people` (`id`, `email`, `full_name`) VALUES (?, ?, ?)"
        );
        assert!(sql.replace_rows(2).starts_with("REPLACE INTO `app_new`.`people`"));
        assert!(!sql.select_range_checksum.contains("legacy"));
    }

    #[test]
    fn test_composite_key_uses_row_constructor() {
        let key = vec!["a".to_string(), "b".to_string()];
        let sql = SideSql::build(&TableId::new("s", "t"), &key, &key, 10);
        assert_eq!(
            sql.select_batch_after,
            "SELECT `a`, `b` FROM `s`.`t` WHERE (`a`, `b`) > (?, ?) AND (`a`, `b`) <= (?, ?) ORDER BY `a`, `b` LIMIT 10"
        );
        assert!(sql
            .select_range_keys
            .contains("(`a`, `b`) >= (?, ?) AND (`a`, `b`) <= (?, ?)"));
        assert_eq!(
            sql.select_row_checksum,
            "SELECT CRC32(CONCAT_WS('#', LENGTH(`a`), `a`, LENGTH(`b`), `b`, CONCAT(ISNULL(`a`), ISNULL(`b`)))) FROM `s`.`t` WHERE `a` = ? AND `b` = ?"
        );
    }

    #[test]
    fn test_row_checksum_length_prefixes_values() {
        let expr = row_checksum_expr(&["x".to_string(), "y".to_string()]);
        assert_eq!(
            expr,
            "CRC32(CONCAT_WS('#', LENGTH(`x`), `x`, LENGTH(`y`), `y`, CONCAT(ISNULL(`x`), ISNULL(`y`))))"
        );
    }

    #[test]
    fn test_identifier_quoting() {
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }
}
