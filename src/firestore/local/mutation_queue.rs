use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::{KeyBuilder, KeyReader};
use crate::firestore::local::index_manager::add_to_collection_parent_index;
use crate::firestore::local::kv_store::{ScanRange, Table};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::target_cache::write_sentinel;
use crate::firestore::model::{
    BatchId, DocumentKey, Mutation, MutationBatch, Timestamp, User, BATCH_ID_UNKNOWN,
};
use crate::util::hard_assert;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MutationGlobal {
    highest_batch_id: BatchId,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct MutationQueueRecord {
    user_id: String,
}

/// Durable, per-user log of pending write batches.
///
/// Batch ids come from one counter shared by every user and survive restarts, so
/// each new batch id is greater than any id issued before it.
#[derive(Clone, Debug)]
pub struct MutationQueue {
    user_id: String,
}

impl MutationQueue {
    pub fn new(user: &User) -> Self {
        Self {
            user_id: user.storage_key().to_string(),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn check_empty(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<bool> {
        Ok(txn.scan(Table::Mutations, &self.user_range())?.is_empty())
    }

    pub fn add_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> FirestoreResult<MutationBatch> {
        let mut global = txn
            .get_json::<MutationGlobal>(Table::MutationGlobal, &global_key())?
            .unwrap_or_default();
        let batch_id = global.highest_batch_id + 1;
        global.highest_batch_id = batch_id;
        txn.put_json(Table::MutationGlobal, global_key(), &global)?;

        let batch = MutationBatch::new(batch_id, local_write_time, base_mutations, mutations);
        txn.put_json(Table::Mutations, self.batch_key(batch_id), &batch)?;
        txn.put_json(
            Table::MutationQueues,
            KeyBuilder::new().string(&self.user_id).build(),
            &MutationQueueRecord {
                user_id: self.user_id.clone(),
            },
        )?;
        for mutation in &batch.mutations {
            txn.put_json(
                Table::DocumentMutations,
                self.document_mutation_key(mutation.key(), batch_id),
                &(),
            )?;
            add_to_collection_parent_index(txn, &mutation.key().collection_path())?;
        }
        Ok(batch)
    }

    pub fn lookup_mutation_batch(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        txn.get_json(Table::Mutations, &self.batch_key(batch_id))
    }

    /// First batch with an id greater than `batch_id`, or the first batch when
    /// `batch_id` is [`BATCH_ID_UNKNOWN`].
    pub fn get_next_mutation_batch_after_batch_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<Option<MutationBatch>> {
        let start = self.batch_key(batch_id.max(BATCH_ID_UNKNOWN) + 1);
        let end = self.user_range().end;
        let range = ScanRange::between(std::ops::Bound::Included(start), end);
        Ok(txn
            .scan_json::<MutationBatch>(Table::Mutations, &range)?
            .into_iter()
            .next()
            .map(|(_, batch)| batch))
    }

    pub fn get_highest_unacknowledged_batch_id(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<BatchId> {
        Ok(self
            .get_all_mutation_batches(txn)?
            .last()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN))
    }

    pub fn get_all_mutation_batches(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<MutationBatch>> {
        Ok(txn
            .scan_json::<MutationBatch>(Table::Mutations, &self.user_range())?
            .into_iter()
            .map(|(_, batch)| batch)
            .collect())
    }

    pub fn get_all_mutation_batches_affecting_document_key(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        self.get_all_mutation_batches_affecting_document_keys(txn, std::iter::once(key))
    }

    /// Batches touching any of `keys`, in batch id order, without duplicates.
    pub fn get_all_mutation_batches_affecting_document_keys<'k, I>(
        &self,
        txn: &PersistenceTransaction<'_>,
        keys: I,
    ) -> FirestoreResult<Vec<MutationBatch>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut batch_ids = BTreeSet::new();
        for key in keys {
            let prefix = KeyBuilder::new().string(&self.user_id).path(key.path()).build();
            for (row_key, _) in txn.scan(Table::DocumentMutations, &ScanRange::prefix(prefix))? {
                let (_, batch_id) = decode_document_mutation_key(&row_key)?;
                batch_ids.insert(batch_id);
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    /// Batches touching documents directly inside the query's collection.
    pub fn get_all_mutation_batches_affecting_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        hard_assert(
            !query.is_collection_group_query(),
            "collection group queries are resolved per collection before reaching the queue",
        );
        let query_path = query.path();
        let prefix = KeyBuilder::new()
            .string(&self.user_id)
            .path_prefix(query_path)
            .build();
        let mut batch_ids = BTreeSet::new();
        for (row_key, _) in txn.scan(Table::DocumentMutations, &ScanRange::prefix(prefix))? {
            let (path, batch_id) = decode_document_mutation_key(&row_key)?;
            if path.len() == query_path.len() + 1 {
                batch_ids.insert(batch_id);
            }
        }
        self.lookup_batches(txn, batch_ids)
    }

    /// Deletes `batch` and returns the keys it touched.
    ///
    /// Removing a batch twice means acknowledgement and rejection went out of
    /// order, which is unrecoverable.
    pub fn remove_mutation_batch(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch: &MutationBatch,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let batch_key = self.batch_key(batch.batch_id);
        hard_assert(
            txn.get(Table::Mutations, &batch_key)?.is_some(),
            format!("Attempt to remove mutation batch {} that does not exist", batch.batch_id),
        );
        txn.delete(Table::Mutations, batch_key);

        let keys = batch.keys();
        for key in &keys {
            txn.delete(
                Table::DocumentMutations,
                self.document_mutation_key(key, batch.batch_id),
            );
            write_sentinel(txn, key)?;
        }
        Ok(keys)
    }

    /// An empty queue must not leave document index rows behind.
    pub fn perform_consistency_check(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<()> {
        if !self.check_empty(txn)? {
            return Ok(());
        }
        let prefix = KeyBuilder::new().string(&self.user_id).build();
        let dangling = txn.scan(Table::DocumentMutations, &ScanRange::prefix(prefix))?;
        hard_assert(
            dangling.is_empty(),
            format!(
                "Document leak -- detected dangling mutation references when queue is empty for user '{}'",
                self.user_id
            ),
        );
        Ok(())
    }

    fn lookup_batches(
        &self,
        txn: &PersistenceTransaction<'_>,
        batch_ids: BTreeSet<BatchId>,
    ) -> FirestoreResult<Vec<MutationBatch>> {
        let mut batches = Vec::with_capacity(batch_ids.len());
        for batch_id in batch_ids {
            match self.lookup_mutation_batch(txn, batch_id)? {
                Some(batch) => batches.push(batch),
                None => hard_assert(false, format!("Dangling document-mutation reference to batch {batch_id}")),
            }
        }
        Ok(batches)
    }

    fn user_range(&self) -> ScanRange {
        ScanRange::prefix(KeyBuilder::new().string(&self.user_id).build())
    }

    fn batch_key(&self, batch_id: BatchId) -> Vec<u8> {
        KeyBuilder::new()
            .string(&self.user_id)
            .int(i64::from(batch_id))
            .build()
    }

    fn document_mutation_key(&self, key: &DocumentKey, batch_id: BatchId) -> Vec<u8> {
        KeyBuilder::new()
            .string(&self.user_id)
            .path(key.path())
            .int(i64::from(batch_id))
            .build()
    }
}

/// Whether a pending batch of any user still references `key`.
pub(crate) fn any_queue_contains_key(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
    let queues = txn.scan_json::<MutationQueueRecord>(Table::MutationQueues, &ScanRange::all())?;
    for (_, queue) in queues {
        let prefix = KeyBuilder::new().string(&queue.user_id).path(key.path()).build();
        if !txn.scan(Table::DocumentMutations, &ScanRange::prefix(prefix))?.is_empty() {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Pending batches grouped by user, for switching users.
pub(crate) fn batches_by_user(txn: &PersistenceTransaction<'_>) -> FirestoreResult<BTreeMap<String, Vec<BatchId>>> {
    let mut result: BTreeMap<String, Vec<BatchId>> = BTreeMap::new();
    for (row_key, _) in txn.scan(Table::Mutations, &ScanRange::all())? {
        let mut reader = KeyReader::new(&row_key);
        let user_id = reader.string()?;
        let batch_id = reader.int()? as BatchId;
        result.entry(user_id).or_default().push(batch_id);
    }
    Ok(result)
}

fn decode_document_mutation_key(row_key: &[u8]) -> FirestoreResult<(crate::firestore::model::ResourcePath, BatchId)> {
    let mut reader = KeyReader::new(row_key);
    reader.string()?;
    let path = reader.path()?;
    let batch_id = reader.int()? as BatchId;
    Ok((path, batch_id))
}

fn global_key() -> Vec<u8> {
    KeyBuilder::new().string("mutation_global").build()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::kv_store::{KvStore, MemoryKvStore};
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::ResourcePath;
    use crate::firestore::value::MapValue;

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn start(store: Arc<dyn KvStore>) -> Persistence {
        let persistence = Persistence::new(store, "client", false);
        persistence.start().unwrap();
        persistence
    }

    fn add(persistence: &Persistence, queue: &MutationQueue, path: &str) -> MutationBatch {
        persistence
            .run_transaction("add", TransactionMode::ReadWrite, |txn| {
                queue.add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::set(key(path), MapValue::empty())],
                )
            })
            .unwrap()
    }

    #[test]
    fn batch_ids_increase_across_restart() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let queue = MutationQueue::new(&User::unauthenticated());
        let first = {
            let persistence = start(Arc::clone(&store));
            let first = add(&persistence, &queue, "rooms/a");
            persistence.shutdown().unwrap();
            first
        };
        let persistence = start(store);
        let second = add(&persistence, &queue, "rooms/b");
        assert!(second.batch_id > first.batch_id);
    }

    #[test]
    fn finds_batches_by_key_and_collection() {
        let persistence = start(Arc::new(MemoryKvStore::new()));
        let queue = MutationQueue::new(&User::authenticated("alice"));
        let a = add(&persistence, &queue, "rooms/a");
        let _nested = add(&persistence, &queue, "rooms/a/messages/m");
        let b = add(&persistence, &queue, "rooms/b");

        let (by_key, by_query, next) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
                Ok((
                    queue.get_all_mutation_batches_affecting_document_key(txn, &key("rooms/a"))?,
                    queue.get_all_mutation_batches_affecting_query(txn, &query)?,
                    queue.get_next_mutation_batch_after_batch_id(txn, a.batch_id)?,
                ))
            })
            .unwrap();
        assert_eq!(by_key, vec![a.clone()]);
        assert_eq!(by_query, vec![a, b]);
        assert_eq!(next.map(|batch| batch.batch_id), Some(2));
    }

    #[test]
    #[should_panic(expected = "INTERNAL ASSERT FAILED")]
    fn removing_a_batch_twice_is_fatal() {
        let persistence = start(Arc::new(MemoryKvStore::new()));
        let queue = MutationQueue::new(&User::unauthenticated());
        let batch = add(&persistence, &queue, "rooms/a");
        for _ in 0..2 {
            let _ = persistence.run_transaction("remove", TransactionMode::ReadWrite, |txn| {
                queue.remove_mutation_batch(txn, &batch)
            });
        }
    }
}
