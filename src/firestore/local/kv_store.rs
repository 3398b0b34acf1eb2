use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{data_loss, internal_error, FirestoreResult};

/// Object stores of the local cache. Keys are produced with
/// [`KeyBuilder`](crate::firestore::local::encoded_key::KeyBuilder); values are JSON.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Table {
    Owner,
    ClientMetadata,
    Mutations,
    MutationGlobal,
    MutationQueues,
    DocumentMutations,
    DocumentOverlays,
    RemoteDocuments,
    RemoteDocumentGlobal,
    Targets,
    TargetGlobal,
    QueryTargets,
    TargetDocuments,
    DocumentTargets,
    IndexConfiguration,
    IndexState,
    IndexEntries,
    IndexEntriesByDocument,
    CollectionParents,
}

impl Table {
    pub const ALL: [Table; 19] = [
        Table::Owner,
        Table::ClientMetadata,
        Table::Mutations,
        Table::MutationGlobal,
        Table::MutationQueues,
        Table::DocumentMutations,
        Table::DocumentOverlays,
        Table::RemoteDocuments,
        Table::RemoteDocumentGlobal,
        Table::Targets,
        Table::TargetGlobal,
        Table::QueryTargets,
        Table::TargetDocuments,
        Table::DocumentTargets,
        Table::IndexConfiguration,
        Table::IndexState,
        Table::IndexEntries,
        Table::IndexEntriesByDocument,
        Table::CollectionParents,
    ];
}

/// Key range for [`KvStore::scan`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScanRange {
    pub start: Bound<Vec<u8>>,
    pub end: Bound<Vec<u8>>,
}

impl ScanRange {
    pub fn all() -> Self {
        Self {
            start: Bound::Unbounded,
            end: Bound::Unbounded,
        }
    }

    /// Every key starting with `prefix`.
    pub fn prefix(prefix: Vec<u8>) -> Self {
        let end = match crate::firestore::value::index_encoder::prefix_successor(&prefix) {
            Some(successor) => Bound::Excluded(successor),
            None => Bound::Unbounded,
        };
        Self {
            start: Bound::Included(prefix),
            end,
        }
    }

    pub fn between(start: Bound<Vec<u8>>, end: Bound<Vec<u8>>) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        let after_start = match &self.start {
            Bound::Included(start) => key >= start.as_slice(),
            Bound::Excluded(start) => key > start.as_slice(),
            Bound::Unbounded => true,
        };
        let before_end = match &self.end {
            Bound::Included(end) => key <= end.as_slice(),
            Bound::Excluded(end) => key < end.as_slice(),
            Bound::Unbounded => true,
        };
        after_start && before_end
    }

    fn as_bounds(&self) -> (Bound<&[u8]>, Bound<&[u8]>) {
        (as_slice_bound(&self.start), as_slice_bound(&self.end))
    }

    fn is_empty(&self) -> bool {
        match (&self.start, &self.end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e))
            | (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        }
    }
}

fn as_slice_bound(bound: &Bound<Vec<u8>>) -> Bound<&[u8]> {
    match bound {
        Bound::Included(v) => Bound::Included(v.as_slice()),
        Bound::Excluded(v) => Bound::Excluded(v.as_slice()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        table: Table,
        key: Vec<u8>,
        value: Vec<u8>,
    },
    Delete {
        table: Table,
        key: Vec<u8>,
    },
}

/// Writes committed atomically by [`KvStore::commit`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.ops.push(WriteOp::Put { table, key, value });
    }

    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.ops.push(WriteOp::Delete { table, key });
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Ordered key/value storage backing the local cache.
pub trait KvStore: Send + Sync {
    fn get(&self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>>;

    /// Entries of `table` within `range`, in ascending key order.
    fn scan(&self, table: Table, range: &ScanRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    fn commit(&self, batch: WriteBatch) -> FirestoreResult<()>;

    /// Serializes transactions of every client sharing this store.
    fn transaction_lock(&self) -> MutexGuard<'_, ()>;

    /// Opens a buffered transaction with read-your-writes semantics.
    fn transaction(&self) -> KvTransaction<'_>
    where
        Self: Sized,
    {
        KvTransaction::new(self)
    }
}

pub(crate) fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

type TableMap = BTreeMap<Vec<u8>, Vec<u8>>;

/// Volatile store used for memory persistence and tests.
#[derive(Debug, Default)]
pub struct MemoryKvStore {
    tables: RwLock<BTreeMap<Table, TableMap>>,
    lock: Mutex<()>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_tables(tables: BTreeMap<Table, TableMap>) -> Self {
        Self {
            tables: RwLock::new(tables),
            lock: Mutex::new(()),
        }
    }

    pub(crate) fn snapshot_tables(&self) -> BTreeMap<Table, TableMap> {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self, table: Table) -> usize {
        self.tables
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&table)
            .map(BTreeMap::len)
            .unwrap_or(0)
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        Ok(tables.get(&table).and_then(|rows| rows.get(key)).cloned())
    }

    fn scan(&self, table: Table, range: &ScanRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
        let Some(rows) = tables.get(&table) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .range::<[u8], _>(range.as_bounds())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(&self, batch: WriteBatch) -> FirestoreResult<()> {
        let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
        apply_batch(&mut tables, batch);
        Ok(())
    }

    fn transaction_lock(&self) -> MutexGuard<'_, ()> {
        lock_unpoisoned(&self.lock)
    }
}

pub(crate) fn apply_batch(tables: &mut BTreeMap<Table, TableMap>, batch: WriteBatch) {
    for op in batch.ops {
        match op {
            WriteOp::Put { table, key, value } => {
                tables.entry(table).or_default().insert(key, value);
            }
            WriteOp::Delete { table, key } => {
                if let Some(rows) = tables.get_mut(&table) {
                    rows.remove(&key);
                }
            }
        }
    }
}

/// Buffered view over a [`KvStore`]. Reads see earlier writes of the same
/// transaction; nothing reaches the store until [`KvTransaction::into_batch`]
/// is committed.
pub struct KvTransaction<'a> {
    store: &'a dyn KvStore,
    pending: BTreeMap<Table, BTreeMap<Vec<u8>, Option<Vec<u8>>>>,
}

impl<'a> KvTransaction<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self {
            store,
            pending: BTreeMap::new(),
        }
    }

    pub fn get(&self, table: Table, key: &[u8]) -> FirestoreResult<Option<Vec<u8>>> {
        if let Some(buffered) = self.pending.get(&table).and_then(|rows| rows.get(key)) {
            return Ok(buffered.clone());
        }
        self.store.get(table, key)
    }

    pub fn put(&mut self, table: Table, key: Vec<u8>, value: Vec<u8>) {
        self.pending.entry(table).or_default().insert(key, Some(value));
    }

    pub fn delete(&mut self, table: Table, key: Vec<u8>) {
        self.pending.entry(table).or_default().insert(key, None);
    }

    pub fn scan(&self, table: Table, range: &ScanRange) -> FirestoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.store.scan(table, range)?.into_iter().collect();
        if let Some(rows) = self.pending.get(&table) {
            for (key, value) in rows.iter().filter(|(key, _)| range.contains(key)) {
                match value {
                    Some(value) => {
                        merged.insert(key.clone(), value.clone());
                    }
                    None => {
                        merged.remove(key);
                    }
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    pub fn get_json<T: DeserializeOwned>(&self, table: Table, key: &[u8]) -> FirestoreResult<Option<T>> {
        match self.get(table, key)? {
            Some(bytes) => decode_json(table, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&mut self, table: Table, key: Vec<u8>, value: &T) -> FirestoreResult<()> {
        let bytes = serde_json::to_vec(value)
            .map_err(|err| internal_error(format!("Failed to encode {table:?} row: {err}")))?;
        self.put(table, key, bytes);
        Ok(())
    }

    pub fn scan_json<T: DeserializeOwned>(
        &self,
        table: Table,
        range: &ScanRange,
    ) -> FirestoreResult<Vec<(Vec<u8>, T)>> {
        self.scan(table, range)?
            .into_iter()
            .map(|(key, bytes)| decode_json(table, &bytes).map(|value| (key, value)))
            .collect()
    }

    pub fn is_dirty(&self) -> bool {
        self.pending.values().any(|rows| !rows.is_empty())
    }

    pub fn into_batch(self) -> WriteBatch {
        let mut batch = WriteBatch::new();
        for (table, rows) in self.pending {
            for (key, value) in rows {
                match value {
                    Some(value) => batch.put(table, key, value),
                    None => batch.delete(table, key),
                }
            }
        }
        batch
    }
}

fn decode_json<T: DeserializeOwned>(table: Table, bytes: &[u8]) -> FirestoreResult<T> {
    serde_json::from_slice(bytes)
        .map_err(|err| data_loss(format!("Corrupt {table:?} row: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_reads_its_own_writes() {
        let store = MemoryKvStore::new();
        let mut txn = KvTransaction::new(&store);
        txn.put(Table::Targets, vec![1], vec![10]);
        assert_eq!(txn.get(Table::Targets, &[1]).unwrap(), Some(vec![10]));
        assert_eq!(store.get(Table::Targets, &[1]).unwrap(), None);

        store.commit(txn.into_batch()).unwrap();
        assert_eq!(store.get(Table::Targets, &[1]).unwrap(), Some(vec![10]));
    }

    #[test]
    fn scan_merges_buffered_deletes_and_puts() {
        let store = MemoryKvStore::new();
        let mut batch = WriteBatch::new();
        batch.put(Table::Targets, vec![1, 1], vec![1]);
        batch.put(Table::Targets, vec![1, 2], vec![2]);
        batch.put(Table::Targets, vec![2, 1], vec![3]);
        store.commit(batch).unwrap();

        let mut txn = KvTransaction::new(&store);
        txn.delete(Table::Targets, vec![1, 1]);
        txn.put(Table::Targets, vec![1, 3], vec![4]);
        let rows = txn.scan(Table::Targets, &ScanRange::prefix(vec![1])).unwrap();
        assert_eq!(rows, vec![(vec![1, 2], vec![2]), (vec![1, 3], vec![4])]);
    }

    #[test]
    fn json_rows_round_trip_through_transactions() {
        let store = MemoryKvStore::new();
        let mut txn = KvTransaction::new(&store);
        txn.put_json(Table::MutationGlobal, vec![0], &42_i64).unwrap();
        assert_eq!(txn.get_json::<i64>(Table::MutationGlobal, &[0]).unwrap(), Some(42));

        txn.put(Table::MutationGlobal, vec![1], b"not json".to_vec());
        let err = txn.get_json::<i64>(Table::MutationGlobal, &[1]).unwrap_err();
        assert_eq!(err.code_str(), "firestore/data-loss");
    }

    #[test]
    fn empty_range_scans_nothing() {
        let store = MemoryKvStore::new();
        let range = ScanRange::between(Bound::Included(vec![5]), Bound::Excluded(vec![5]));
        assert!(store.scan(Table::Targets, &range).unwrap().is_empty());
    }
}
