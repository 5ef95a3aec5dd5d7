//! In-memory stand-in for a MySQL instance.

use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Result};
use async_trait::async_trait;
use sync_core::{ColumnValue, KeyValue, LogFilePos, Row, Side, Table, TableId};

use crate::config::WriteMode;
use crate::endpoint::{Endpoint, ScanStart, RangeChecksum};

type Rows = Vec<(KeyValue, Row)>;

/// Tables kept as key-sorted rows, addressed by the side's table name.
///
/// Rows are stored full-width; ignored columns are blanked on read and on
/// write, the way a real instance never sees them. Secondary unique
/// indexes are not enforced.
pub struct MemoryEndpoint {
    name: String,
    side: Side,
    case_insensitive: AtomicBool,
    tables: Mutex<HashMap<TableId, Rows>>,
    master: Mutex<LogFilePos>,
    failures: AtomicUsize,
    operations: Mutex<Vec<String>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// How the endpoint orders and matches key values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Collation {
    Binary,
    /// Text compared the way a `_ci` collation does.
    CaseInsensitive,
}

impl Collation {
    fn compare(self, a: &KeyValue, b: &KeyValue) -> Ordering {
        if self == Collation::Binary {
            return a.compare(b);
        }
        a.values()
            .zip(b.values())
            .map(|pair| match pair {
                (ColumnValue::Text(x), ColumnValue::Text(y)) => {
                    x.to_lowercase().cmp(&y.to_lowercase())
                }
                (x, y) => x.compare(y),
            })
            .find(|o| o.is_ne())
            .unwrap_or(Ordering::Equal)
    }
}

fn find(rows: &Rows, key: &KeyValue, collation: Collation) -> std::result::Result<usize, usize> {
    rows.binary_search_by(|(k, _)| collation.compare(k, key))
}

fn normalize(table: &Table, row: &Row) -> Row {
    table.row_from_useful(table.project_useful(row))
}

/// Order-independent checksum of one row's copied columns.
pub fn row_hash(table: &Table, row: &Row) -> u64 {
    let mut hasher = DefaultHasher::new();
    for value in table.project_useful(row) {
        match value {
            ColumnValue::Null => 0u8.hash(&mut hasher),
            other => {
                1u8.hash(&mut hasher);
                other.canonical().hash(&mut hasher);
            }
        }
    }
    hasher.finish()
}

impl MemoryEndpoint {
    pub fn new(name: impl Into<String>, side: Side) -> Self {
        Self {
            name: name.into(),
            side,
            case_insensitive: AtomicBool::new(false),
            tables: Mutex::new(HashMap::new()),
            master: Mutex::new(LogFilePos::new("mysql-bin.000001", 4)),
            failures: AtomicUsize::new(0),
            operations: Mutex::new(Vec::new()),
        }
    }

    /// Order and match text keys ignoring case. Call before seeding.
    pub fn use_case_insensitive_keys(&self) {
        self.case_insensitive.store(true, AtomicOrdering::SeqCst);
    }

    fn collation(&self) -> Collation {
        if self.case_insensitive.load(AtomicOrdering::SeqCst) {
            Collation::CaseInsensitive
        } else {
            Collation::Binary
        }
    }

    /// Upsert rows directly, bypassing the operation log.
    pub fn seed(&self, table: &Table, rows: impl IntoIterator<Item = Row>) {
        let collation = self.collation();
        let mut tables = lock(&self.tables);
        let stored = tables.entry(table.name(self.side).clone()).or_default();
        for row in rows {
            upsert(stored, table, normalize(table, &row), collation);
        }
    }

    /// Remove a row directly, bypassing the operation log.
    pub fn remove(&self, table: &Table, key: &KeyValue) {
        let mut tables = lock(&self.tables);
        if let Some(stored) = tables.get_mut(table.name(self.side)) {
            if let Ok(i) = find(stored, key, self.collation()) {
                stored.remove(i);
            }
        }
    }

    pub fn rows(&self, table: &Table) -> Vec<Row> {
        lock(&self.tables)
            .get(table.name(self.side))
            .map(|rows| rows.iter().map(|(_, row)| row.clone()).collect())
            .unwrap_or_default()
    }

    pub fn get(&self, table: &Table, key: &KeyValue) -> Option<Row> {
        let tables = lock(&self.tables);
        let stored = tables.get(table.name(self.side))?;
        find(stored, key, self.collation())
            .ok()
            .map(|i| stored[i].1.clone())
    }

    pub fn set_master_status(&self, pos: LogFilePos) {
        *lock(&self.master) = pos;
    }

    /// Make the next `n` calls fail.
    pub fn fail_next(&self, n: usize) {
        self.failures.store(n, AtomicOrdering::SeqCst);
    }

    /// Writes applied through [`Endpoint`], in order: `replace (id=1)`,
    /// `delete (id=1)`, `insert (id=1)`.
    pub fn operations(&self) -> Vec<String> {
        lock(&self.operations).clone()
    }

    pub fn clear_operations(&self) {
        lock(&self.operations).clear();
    }

    fn check(&self, call: &str) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |n| {
                n.checked_sub(1)
            })
            .is_ok();
        if injected {
            bail!("injected failure in {call} on {}", self.name);
        }
        Ok(())
    }

    fn log(&self, entry: String) {
        lock(&self.operations).push(entry);
    }

    fn with_rows<T>(&self, table: &Table, f: impl FnOnce(&Rows) -> T) -> T {
        let tables = lock(&self.tables);
        let empty = Rows::new();
        f(tables.get(table.name(self.side)).unwrap_or(&empty))
    }

    fn in_range(&self, table: &Table, min: &KeyValue, max: &KeyValue) -> Vec<(KeyValue, Row)> {
        let collation = self.collation();
        self.with_rows(table, |rows| {
            rows.iter()
                .filter(|(k, _)| {
                    collation.compare(k, min).is_ge() && collation.compare(k, max).is_le()
                })
                .cloned()
                .collect()
        })
    }
}

fn upsert(stored: &mut Rows, table: &Table, row: Row, collation: Collation) -> bool {
    let key = table.key_of(&row);
    match find(stored, &key, collation) {
        Ok(i) => {
            stored[i].1 = row;
            false
        }
        Err(i) => {
            stored.insert(i, (key, row));
            true
        }
    }
}

#[async_trait]
impl Endpoint for MemoryEndpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn side(&self) -> Side {
        self.side
    }

    async fn first_key(&self, table: &Table) -> Result<Option<KeyValue>> {
        self.check("first_key")?;
        Ok(self.with_rows(table, |rows| rows.first().map(|(k, _)| k.clone())))
    }

    async fn last_key(&self, table: &Table) -> Result<Option<KeyValue>> {
        self.check("last_key")?;
        Ok(self.with_rows(table, |rows| rows.last().map(|(k, _)| k.clone())))
    }

    async fn next_boundary(
        &self,
        table: &Table,
        from: &KeyValue,
        until: &KeyValue,
        start: ScanStart,
    ) -> Result<Option<KeyValue>> {
        self.check("next_boundary")?;
        let collation = self.collation();
        Ok(self.with_rows(table, |rows| {
            rows.iter()
                .filter(|(k, _)| {
                    let order = collation.compare(k, from);
                    let started = match start {
                        ScanStart::Including => order.is_ge(),
                        ScanStart::After => order.is_gt(),
                    };
                    started && collation.compare(k, until).is_le()
                })
                .take(table.batch_size())
                .last()
                .map(|(k, _)| k.clone())
        }))
    }

    async fn select_range_rows(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<Vec<Row>> {
        self.check("select_range_rows")?;
        Ok(self
            .in_range(table, min, max)
            .into_iter()
            .map(|(_, row)| row)
            .collect())
    }

    async fn range_keys(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<Vec<KeyValue>> {
        self.check("range_keys")?;
        Ok(self
            .in_range(table, min, max)
            .into_iter()
            .map(|(key, _)| key)
            .collect())
    }

    async fn insert_rows(&self, table: &Table, rows: &[Row], mode: WriteMode) -> Result<()> {
        self.check("insert_rows")?;
        let collation = self.collation();
        let mut tables = lock(&self.tables);
        let stored = tables.entry(table.name(self.side).clone()).or_default();
        for row in rows {
            let row = normalize(table, row);
            let key = table.key_of(&row);
            match (find(stored, &key, collation), mode) {
                (Ok(_), WriteMode::InsertIgnore) => {}
                (Ok(i), WriteMode::Replace) => stored[i].1 = row,
                (Err(i), _) => stored.insert(i, (key.clone(), row)),
            }
            self.log(format!("insert {key}"));
        }
        Ok(())
    }

    async fn replace_row(&self, table: &Table, row: &Row) -> Result<()> {
        self.check("replace_row")?;
        let row = normalize(table, row);
        let key = table.key_of(&row);
        let collation = self.collation();
        {
            let mut tables = lock(&self.tables);
            let stored = tables.entry(table.name(self.side).clone()).or_default();
            upsert(stored, table, row, collation);
        }
        self.log(format!("replace {key}"));
        Ok(())
    }

    async fn delete_row(&self, table: &Table, key: &KeyValue) -> Result<()> {
        self.check("delete_row")?;
        let collation = self.collation();
        {
            let mut tables = lock(&self.tables);
            if let Some(stored) = tables.get_mut(table.name(self.side)) {
                if let Ok(i) = find(stored, key, collation) {
                    stored.remove(i);
                }
            }
        }
        self.log(format!("delete {key}"));
        Ok(())
    }

    async fn range_checksum(
        &self,
        table: &Table,
        min: &KeyValue,
        max: &KeyValue,
    ) -> Result<RangeChecksum> {
        self.check("range_checksum")?;
        let rows = self.in_range(table, min, max);
        Ok(RangeChecksum {
            count: rows.len() as u64,
            checksum: rows.iter().fold(0, |acc, (_, row)| acc ^ row_hash(table, row)),
        })
    }

    async fn row_checksum(&self, table: &Table, key: &KeyValue) -> Result<Option<u64>> {
        self.check("row_checksum")?;
        Ok(self.get(table, key).map(|row| row_hash(table, &row)))
    }

    async fn select_row(&self, table: &Table, key: &KeyValue) -> Result<Option<Row>> {
        self.check("select_row")?;
        Ok(self.get(table, key))
    }

    async fn master_status(&self) -> Result<LogFilePos> {
        self.check("master_status")?;
        Ok(lock(&self.master).clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{key, kv_row, kv_table};

    #[tokio::test]
    async fn test_ranges_and_boundaries() {
        let table = kv_table("app", "t", 2);
        let endpoint = MemoryEndpoint::new("src:3306", Side::Source);
        endpoint.seed(&table, [kv_row(3, "c"), kv_row(1, "a"), kv_row(2, "b")]);

        assert_eq!(endpoint.first_key(&table).await.unwrap(), Some(key(1)));
        assert_eq!(endpoint.last_key(&table).await.unwrap(), Some(key(3)));
        for (from, start, expected) in [
            (1, ScanStart::Including, Some(key(2))),
            (1, ScanStart::After, Some(key(3))),
            (2, ScanStart::After, Some(key(3))),
            (3, ScanStart::After, None),
            (4, ScanStart::Including, None),
        ] {
            let boundary = endpoint
                .next_boundary(&table, &key(from), &key(3), start)
                .await
                .unwrap();
            assert_eq!(boundary, expected, "{start:?} from {from}");
        }
        assert_eq!(
            endpoint.select_range_rows(&table, &key(2), &key(3)).await.unwrap(),
            vec![kv_row(2, "b"), kv_row(3, "c")]
        );
    }

    #[tokio::test]
    async fn test_checksum_detects_single_row_change() {
        let table = kv_table("app", "t", 10);
        let source = MemoryEndpoint::new("src:3306", Side::Source);
        let target = MemoryEndpoint::new("dst:3306", Side::Target);
        source.seed(&table, [kv_row(1, "a"), kv_row(2, "b")]);
        target.seed(&table, [kv_row(2, "b"), kv_row(1, "a")]);

        let a = source.range_checksum(&table, &key(1), &key(2)).await.unwrap();
        let b = target.range_checksum(&table, &key(1), &key(2)).await.unwrap();
        assert_eq!(a, b);

        target.seed(&table, [kv_row(2, "B")]);
        let b = target.range_checksum(&table, &key(1), &key(2)).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_insert_ignore_keeps_existing_rows() {
        let table = kv_table("app", "t", 10);
        let target = MemoryEndpoint::new("dst:3306", Side::Target);
        target.seed(&table, [kv_row(1, "newer")]);
        target
            .insert_rows(&table, &[kv_row(1, "older"), kv_row(2, "b")], WriteMode::InsertIgnore)
            .await
            .unwrap();
        assert_eq!(target.rows(&table), vec![kv_row(1, "newer"), kv_row(2, "b")]);

        target
            .insert_rows(&table, &[kv_row(1, "older")], WriteMode::Replace)
            .await
            .unwrap();
        assert_eq!(target.get(&table, &key(1)), Some(kv_row(1, "older")));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let table = kv_table("app", "t", 10);
        let endpoint = MemoryEndpoint::new("src:3306", Side::Source);
        endpoint.fail_next(1);
        assert!(endpoint.first_key(&table).await.is_err());
        assert!(endpoint.first_key(&table).await.is_ok());
    }
}
