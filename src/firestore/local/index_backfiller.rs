use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{Document, DocumentKey, IndexOffset};

pub const DEFAULT_MAX_DOCUMENTS_TO_PROCESS: usize = 100;

/// Builds entries for indexes created after their documents were cached.
///
/// Each run indexes at most `max_documents_to_process` documents, visiting
/// collection groups in least-recently-backfilled order. An index becomes
/// servable once a run reaches the end of its collection group.
#[derive(Clone, Debug)]
pub struct IndexBackfiller {
    max_documents_to_process: usize,
}

impl Default for IndexBackfiller {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_DOCUMENTS_TO_PROCESS)
    }
}

impl IndexBackfiller {
    pub fn new(max_documents_to_process: usize) -> Self {
        Self {
            max_documents_to_process,
        }
    }

    /// Returns the number of documents indexed.
    pub fn backfill(&self, txn: &mut PersistenceTransaction<'_>, view: &LocalDocumentsView) -> FirestoreResult<usize> {
        let index_manager = view.index_manager();
        let mut processed_groups = BTreeSet::new();
        let mut remaining = self.max_documents_to_process;
        let mut indexed = 0;

        while remaining > 0 {
            let Some(group) = index_manager.get_next_collection_group_to_update(txn)? else {
                break;
            };
            if !processed_groups.insert(group.clone()) {
                break;
            }
            let offset = index_manager
                .get_field_indexes(txn, Some(&group))?
                .into_iter()
                .filter(|index| !index.state.backfill_complete)
                .map(|index| index.state.offset)
                .min()
                .unwrap_or_else(IndexOffset::none);

            let documents = view.get_next_documents(txn, &group, &offset, remaining)?;
            let count = documents.len();
            let next_offset = documents
                .last()
                .map(|document| IndexOffset::after(document.key().clone()))
                .unwrap_or(offset);
            let by_key: BTreeMap<DocumentKey, Document> = documents
                .into_iter()
                .map(|document| (document.key().clone(), document))
                .collect();
            index_manager.update_index_entries(txn, &by_key)?;

            let complete = count < remaining;
            let sequence_number = txn.current_sequence_number();
            index_manager.update_collection_group(txn, &group, next_offset, complete, sequence_number)?;
            log::debug!("backfilled {count} documents of '{group}' (complete: {complete})");
            indexed += count;
            remaining -= count;
        }
        Ok(indexed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::query::{FieldFilter, FilterOperator, Query};
    use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
    use crate::firestore::local::index_manager::IndexManager;
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
    use crate::firestore::model::{FieldPath, ResourcePath, SnapshotVersion, User};
    use crate::firestore::value::{FirestoreValue, MapValue};

    #[test]
    fn backfill_runs_in_bounded_steps_until_servable() {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        let user = User::unauthenticated();
        let view = LocalDocumentsView::new(
            RemoteDocumentCache,
            MutationQueue::new(&user),
            DocumentOverlayCache::new(&user),
            IndexManager::new(&user),
        );
        let occupancy = FieldPath::from_dot_separated("occupancy").unwrap();
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(occupancy.clone(), FilterOperator::Equal, FirestoreValue::from_integer(2)))
            .to_target();
        let backfiller = IndexBackfiller::new(3);

        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                for id in 0..5 {
                    let mut data = MapValue::empty();
                    data.set(&occupancy, FirestoreValue::from_integer(id % 3));
                    let key = DocumentKey::from_string(&format!("rooms/r{id}"))?;
                    let document = Document::new_found(key, SnapshotVersion::from_micros(1), data);
                    RemoteDocumentCache.add_entry(txn, &document, SnapshotVersion::from_micros(1))?;
                }
                view.index_manager().create_target_indexes(txn, &target)?;
                Ok(())
            })
            .unwrap();

        let first = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| {
                Ok((backfiller.backfill(txn, &view)?, view.index_manager().get_documents_matching_target(txn, &target)?))
            })
            .unwrap();
        assert_eq!(first, (3, None));

        let second = persistence
            .run_transaction("backfill", TransactionMode::ReadWrite, |txn| {
                Ok((backfiller.backfill(txn, &view)?, view.index_manager().get_documents_matching_target(txn, &target)?))
            })
            .unwrap();
        let keys: Vec<_> = second.1.unwrap().into_iter().map(|key| key.id().to_string()).collect();
        assert_eq!(second.0, 2);
        assert_eq!(keys, vec!["r2"]);
    }
}
