use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::KeyBuilder;
use crate::firestore::local::index_manager::{add_to_collection_parent_index, IndexManager};
use crate::firestore::local::kv_store::{ScanRange, Table};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::model::{Document, DocumentKey, IndexOffset, ResourcePath, SnapshotVersion};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct RemoteDocumentGlobal {
    byte_size: i64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct RemoteDocumentRecord {
    document: Document,
    size: i64,
}

/// Last known server state of every cached document.
///
/// Rows are keyed `collection path · document id`; the running byte size of all
/// rows is kept in a global row and drives LRU collection.
#[derive(Clone, Copy, Debug, Default)]
pub struct RemoteDocumentCache;

impl RemoteDocumentCache {
    /// Stores `document`, stamped with `read_time`. Replaces any earlier row.
    pub fn add_entry(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        document: &Document,
        read_time: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let key = document.key();
        let mut stored = document.clone();
        stored.set_read_time(read_time);
        let size = serde_json::to_vec(&stored).map(|bytes| bytes.len() as i64).unwrap_or_default();

        let row_key = document_key(key);
        let previous = txn
            .get_json::<RemoteDocumentRecord>(Table::RemoteDocuments, &row_key)?
            .map(|record| record.size)
            .unwrap_or(0);
        txn.put_json(
            Table::RemoteDocuments,
            row_key,
            &RemoteDocumentRecord { document: stored, size },
        )?;
        add_to_collection_parent_index(txn, &key.collection_path())?;
        self.adjust_size(txn, size - previous)
    }

    /// Deletes the row for `key` and returns the bytes it occupied.
    pub fn remove_entry(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<i64> {
        let row_key = document_key(key);
        let Some(record) = txn.get_json::<RemoteDocumentRecord>(Table::RemoteDocuments, &row_key)? else {
            return Ok(0);
        };
        txn.delete(Table::RemoteDocuments, row_key);
        self.adjust_size(txn, -record.size)?;
        Ok(record.size)
    }

    /// Cached document for `key`, or an invalid document when nothing is cached.
    pub fn get_entry(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Document> {
        Ok(txn
            .get_json::<RemoteDocumentRecord>(Table::RemoteDocuments, &document_key(key))?
            .map(|record| record.document)
            .unwrap_or_else(|| Document::new_invalid(key.clone())))
    }

    pub fn get_entries<'k, I>(&self, txn: &PersistenceTransaction<'_>, keys: I) -> FirestoreResult<BTreeMap<DocumentKey, Document>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut documents = BTreeMap::new();
        for key in keys {
            documents.insert(key.clone(), self.get_entry(txn, key)?);
        }
        Ok(documents)
    }

    /// Documents directly in the query's collection that were read after
    /// `since_read_time` and match the query. Keys in `mutated_keys` are returned
    /// regardless so pending writes can be applied on top of them.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        mutated_keys: &BTreeSet<DocumentKey>,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let prefix = KeyBuilder::new().path(query.path()).build();
        let mut documents = BTreeMap::new();
        for (_, record) in txn.scan_json::<RemoteDocumentRecord>(Table::RemoteDocuments, &ScanRange::prefix(prefix))? {
            context.increment_documents_read_count(1);
            let document = record.document;
            let key = document.key();
            let mutated = mutated_keys.contains(key);
            if document.read_time() <= since_read_time && !mutated {
                continue;
            }
            if mutated || query.matches(&document) {
                documents.insert(key.clone(), document);
            }
        }
        Ok(documents)
    }

    /// Up to `limit` documents of `collection_group` ordered by key and after
    /// `offset`. Feeds index backfill.
    pub fn get_all_from_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        index_manager: &IndexManager,
        collection_group: &str,
        offset: &IndexOffset,
        limit: usize,
    ) -> FirestoreResult<Vec<Document>> {
        let mut documents = Vec::new();
        for parent in index_manager.get_collection_parents(txn, collection_group)? {
            let collection: ResourcePath = parent.child([collection_group]);
            let prefix = KeyBuilder::new().path(&collection).build();
            for (_, record) in txn.scan_json::<RemoteDocumentRecord>(Table::RemoteDocuments, &ScanRange::prefix(prefix))? {
                let after_offset = offset
                    .document_key
                    .as_ref()
                    .map_or(true, |last| record.document.key() > last);
                if after_offset {
                    documents.push(record.document);
                }
            }
        }
        documents.sort_by(|left, right| left.key().cmp(right.key()));
        documents.truncate(limit);
        Ok(documents)
    }

    /// Byte size of every cached document.
    pub fn get_size(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(txn
            .get_json::<RemoteDocumentGlobal>(Table::RemoteDocumentGlobal, &global_key())?
            .unwrap_or_default()
            .byte_size)
    }

    fn adjust_size(&self, txn: &mut PersistenceTransaction<'_>, delta: i64) -> FirestoreResult<()> {
        if delta == 0 {
            return Ok(());
        }
        let mut global = txn
            .get_json::<RemoteDocumentGlobal>(Table::RemoteDocumentGlobal, &global_key())?
            .unwrap_or_default();
        global.byte_size += delta;
        txn.put_json(Table::RemoteDocumentGlobal, global_key(), &global)
    }
}

fn document_key(key: &DocumentKey) -> Vec<u8> {
    KeyBuilder::new()
        .path(&key.collection_path())
        .string(key.id())
        .build()
}

fn global_key() -> Vec<u8> {
    KeyBuilder::new().string("remote_document_global").build()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, User};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn persistence() -> Persistence {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        persistence
    }

    fn doc(path: &str, version: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("v").unwrap(), FirestoreValue::from_integer(version));
        Document::new_found(
            DocumentKey::from_string(path).unwrap(),
            SnapshotVersion::from_micros(version),
            data,
        )
    }

    #[test]
    fn size_tracks_adds_and_removes() {
        let persistence = persistence();
        let cache = RemoteDocumentCache;
        let sizes = persistence
            .run_transaction("size", TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &doc("rooms/a", 1), SnapshotVersion::from_micros(1))?;
                let after_add = cache.get_size(txn)?;
                cache.add_entry(txn, &doc("rooms/a", 2), SnapshotVersion::from_micros(2))?;
                let after_update = cache.get_size(txn)?;
                let removed = cache.remove_entry(txn, &DocumentKey::from_string("rooms/a").unwrap())?;
                Ok((after_add, after_update, removed, cache.get_size(txn)?))
            })
            .unwrap();
        assert!(sizes.0 > 0);
        assert_eq!(sizes.1, sizes.2);
        assert_eq!(sizes.3, 0);
    }

    #[test]
    fn query_scan_honours_read_time() {
        let persistence = persistence();
        let cache = RemoteDocumentCache;
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
        let (keys, read) = persistence
            .run_transaction("query", TransactionMode::ReadWrite, |txn| {
                cache.add_entry(txn, &doc("rooms/a", 1), SnapshotVersion::from_micros(1))?;
                cache.add_entry(txn, &doc("rooms/b", 5), SnapshotVersion::from_micros(5))?;
                cache.add_entry(txn, &doc("rooms/b/beds/x", 5), SnapshotVersion::from_micros(5))?;
                let mut context = QueryContext::default();
                let found = cache.get_documents_matching_query(
                    txn,
                    &query,
                    SnapshotVersion::from_micros(3),
                    &BTreeSet::new(),
                    &mut context,
                )?;
                Ok((found.into_keys().collect::<Vec<_>>(), context.documents_read_count()))
            })
            .unwrap();
        assert_eq!(keys, vec![DocumentKey::from_string("rooms/b").unwrap()]);
        assert_eq!(read, 2);
    }

    #[test]
    fn collection_group_reads_every_parent_after_offset() {
        let persistence = persistence();
        let cache = RemoteDocumentCache;
        let manager = IndexManager::new(&User::unauthenticated());
        let documents = persistence
            .run_transaction("group", TransactionMode::ReadWrite, |txn| {
                for path in ["rooms/a", "hotels/h/rooms/b", "hotels/h/rooms/c", "halls/x"] {
                    cache.add_entry(txn, &doc(path, 1), SnapshotVersion::from_micros(1))?;
                }
                let offset = IndexOffset::after(DocumentKey::from_string("hotels/h/rooms/b").unwrap());
                cache.get_all_from_collection_group(txn, &manager, "rooms", &offset, 10)
            })
            .unwrap();
        let paths: Vec<_> = documents.iter().map(|doc| doc.key().to_string()).collect();
        assert_eq!(paths, vec!["hotels/h/rooms/c", "rooms/a"]);
    }
}
