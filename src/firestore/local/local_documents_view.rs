use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::Query;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::query_engine::QueryContext;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, FieldMask, IndexOffset, Overlay,
    OverlayedDocument, SnapshotVersion, Timestamp, BATCH_ID_UNKNOWN,
};

/// Local view of documents: the remote document with its overlay applied.
///
/// Overlays are kept up to date by [`Self::recalculate_and_save_overlays`]
/// whenever the pending batches of a key change, so reads apply one mutation per
/// document instead of replaying the queue.
#[derive(Clone, Debug)]
pub struct LocalDocumentsView {
    remote_documents: RemoteDocumentCache,
    mutation_queue: MutationQueue,
    overlay_cache: DocumentOverlayCache,
    index_manager: IndexManager,
}

impl LocalDocumentsView {
    pub fn new(
        remote_documents: RemoteDocumentCache,
        mutation_queue: MutationQueue,
        overlay_cache: DocumentOverlayCache,
        index_manager: IndexManager,
    ) -> Self {
        Self {
            remote_documents,
            mutation_queue,
            overlay_cache,
            index_manager,
        }
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn overlay_cache(&self) -> &DocumentOverlayCache {
        &self.overlay_cache
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    pub fn get_document(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Document> {
        let overlay = self.overlay_cache.get_overlay(txn, key)?;
        let mut document = self.base_document(txn, key, overlay.as_ref())?;
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        Ok(document)
    }

    pub fn get_documents<'k, I>(&self, txn: &mut PersistenceTransaction<'_>, keys: I) -> FirestoreResult<BTreeMap<DocumentKey, Document>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let documents = self.remote_documents.get_entries(txn, keys)?;
        self.get_local_view_of_documents(txn, documents, &BTreeSet::new())
    }

    /// Applies overlays to `documents`. Keys in `existence_changed` flipped
    /// between existing and missing remotely, so their patch overlays are
    /// recomputed from the queue first.
    pub fn get_local_view_of_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, Document>,
        existence_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let overlays = self.overlay_cache.get_overlays(txn, documents.keys())?;
        Ok(self
            .compute_views(txn, documents, overlays, existence_changed)?
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect())
    }

    /// Local views of `documents` along with the fields their overlays touch.
    pub fn get_overlayed_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let overlays = self.overlay_cache.get_overlays(txn, documents.keys())?;
        self.compute_views(txn, documents, overlays, &BTreeSet::new())
    }

    fn compute_views(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: BTreeMap<DocumentKey, Document>,
        overlays: BTreeMap<DocumentKey, Overlay>,
        existence_changed: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, OverlayedDocument>> {
        let mut recalculate = BTreeMap::new();
        let mut views = BTreeMap::new();
        let now = Timestamp::now();
        for (key, mut document) in documents {
            let overlay = overlays.get(&key);
            let needs_recalculation = existence_changed.contains(&key)
                && overlay.map_or(true, |overlay| overlay.mutation.is_patch());
            if needs_recalculation {
                recalculate.insert(key, document);
                continue;
            }
            let mutated_fields = match overlay {
                Some(overlay) => {
                    let mask = overlay.mutation.field_mask();
                    overlay
                        .mutation
                        .apply_to_local_view(&mut document, mask.clone(), now);
                    mask
                }
                None => Some(FieldMask::empty()),
            };
            views.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            );
        }

        let masks = self.recalculate_and_save_overlays(txn, &mut recalculate)?;
        for (key, document) in recalculate {
            let mutated_fields = masks.get(&key).cloned().unwrap_or(Some(FieldMask::empty()));
            views.insert(
                key,
                OverlayedDocument {
                    document,
                    mutated_fields,
                },
            );
        }
        Ok(views)
    }

    /// Replays every pending batch touching `documents` onto them and stores the
    /// resulting overlay under the newest batch id. Returns the accumulated field
    /// mask per key (`None` for full overwrites).
    pub fn recalculate_and_save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &mut BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Option<FieldMask>>> {
        let batches = self
            .mutation_queue
            .get_all_mutation_batches_affecting_document_keys(txn, documents.keys())?;
        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, BTreeSet<DocumentKey>> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(document) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or(Some(FieldMask::empty()));
                let mask = batch.apply_to_local_view(document, mask);
                masks.insert(key.clone(), mask);
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        let mut processed = BTreeSet::new();
        for (batch_id, keys) in keys_by_batch.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let Some(document) = documents.get(&key) else {
                    continue;
                };
                let mask = masks.get(&key).cloned().flatten();
                match calculate_overlay_mutation(document, mask.as_ref()) {
                    Some(mutation) => {
                        overlays.insert(key, mutation);
                    }
                    None => self.overlay_cache.remove_overlay(txn, &key),
                }
            }
            self.overlay_cache.save_overlays(txn, batch_id, &overlays)?;
        }
        Ok(masks)
    }

    pub fn recalculate_and_save_overlays_for_document_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let mut documents = self.remote_documents.get_entries(txn, keys)?;
        self.recalculate_and_save_overlays(txn, &mut documents)?;
        Ok(())
    }

    /// Local documents matching `query` whose remote state was read after
    /// `since_read_time`, plus every document with a pending write.
    pub fn get_documents_matching_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if query.is_document_query() {
            let key = DocumentKey::from_path(query.path().clone())?;
            let document = self.get_document(txn, &key)?;
            let mut result = BTreeMap::new();
            if document.is_found_document() {
                result.insert(key, document);
            }
            return Ok(result);
        }
        if let Some(group) = query.collection_group_id() {
            let mut result = BTreeMap::new();
            for parent in self.index_manager.get_collection_parents(txn, group)? {
                let collection_query = query.as_collection_query_at_path(parent.child([group]));
                result.extend(self.documents_matching_collection_query(
                    txn,
                    &collection_query,
                    since_read_time,
                    context,
                )?);
            }
            return Ok(result);
        }
        self.documents_matching_collection_query(txn, query, since_read_time, context)
    }

    fn documents_matching_collection_query(
        &self,
        txn: &PersistenceTransaction<'_>,
        query: &Query,
        since_read_time: SnapshotVersion,
        context: &mut QueryContext,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let overlays = self
            .overlay_cache
            .get_overlays_for_collection(txn, query.path(), BATCH_ID_UNKNOWN)?;
        let overlay_keys: BTreeSet<DocumentKey> = overlays.keys().cloned().collect();
        let mut documents = self.remote_documents.get_documents_matching_query(
            txn,
            query,
            since_read_time,
            &overlay_keys,
            context,
        )?;
        for key in overlay_keys {
            documents
                .entry(key.clone())
                .or_insert_with(|| Document::new_invalid(key));
        }

        let now = Timestamp::now();
        let mut results = BTreeMap::new();
        for (key, mut document) in documents {
            if let Some(overlay) = overlays.get(&key) {
                overlay
                    .mutation
                    .apply_to_local_view(&mut document, Some(FieldMask::empty()), now);
            }
            if query.matches(&document) {
                results.insert(key, document);
            }
        }
        Ok(results)
    }

    /// Next documents of `collection_group` after `offset` in key order, as local
    /// views, including documents that only exist as pending writes.
    pub fn get_next_documents(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: &IndexOffset,
        count: usize,
    ) -> FirestoreResult<Vec<Document>> {
        let remote = self.remote_documents.get_all_from_collection_group(
            txn,
            &self.index_manager,
            collection_group,
            offset,
            count,
        )?;
        let mut documents: BTreeMap<DocumentKey, Document> = remote
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();

        let pending = self.overlay_cache.get_overlays_for_collection_group(
            txn,
            collection_group,
            BATCH_ID_UNKNOWN,
            count,
        )?;
        let missing: Vec<DocumentKey> = pending
            .keys()
            .filter(|key| !documents.contains_key(*key))
            .filter(|key| offset.document_key.as_ref().map_or(true, |last| *key > last))
            .cloned()
            .collect();
        documents.extend(self.remote_documents.get_entries(txn, &missing)?);

        let views = self.get_local_view_of_documents(txn, documents, &BTreeSet::new())?;
        Ok(views.into_values().take(count).collect())
    }

    fn base_document(
        &self,
        txn: &PersistenceTransaction<'_>,
        key: &DocumentKey,
        overlay: Option<&Overlay>,
    ) -> FirestoreResult<Document> {
        match overlay {
            Some(overlay) if !overlay.mutation.is_patch() => Ok(Document::new_invalid(key.clone())),
            _ => self.remote_documents.get_entry(txn, key),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::{FieldPath, Mutation, ResourcePath, User};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn view() -> (Persistence, LocalDocumentsView) {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        let user = User::unauthenticated();
        let view = LocalDocumentsView::new(
            RemoteDocumentCache,
            MutationQueue::new(&user),
            DocumentOverlayCache::new(&user),
            IndexManager::new(&user),
        );
        (persistence, view)
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    fn map(name: &str, value: i64) -> MapValue {
        let mut data = MapValue::empty();
        data.set(&field(name), FirestoreValue::from_integer(value));
        data
    }

    fn write(persistence: &Persistence, view: &LocalDocumentsView, mutation: Mutation) {
        persistence
            .run_transaction("write", TransactionMode::ReadWrite, |txn| {
                let batch = view
                    .mutation_queue()
                    .add_mutation_batch(txn, Timestamp::now(), vec![], vec![mutation.clone()])?;
                let mut documents = RemoteDocumentCache.get_entries(txn, &batch.keys())?;
                view.recalculate_and_save_overlays(txn, &mut documents)?;
                Ok(())
            })
            .unwrap();
    }

    #[test]
    fn overlay_folds_every_pending_batch() {
        let (persistence, view) = view();
        let doc_key = key("rooms/a");
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                RemoteDocumentCache.add_entry(
                    txn,
                    &Document::new_found(doc_key.clone(), SnapshotVersion::from_micros(1), map("a", 0)),
                    SnapshotVersion::from_micros(1),
                )
            })
            .unwrap();
        write(&persistence, &view, Mutation::patch(doc_key.clone(), map("a", 1), FieldMask::new([field("a")])));
        write(&persistence, &view, Mutation::patch(doc_key.clone(), map("b", 2), FieldMask::new([field("b")])));

        let (document, overlay) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((view.get_document(txn, &doc_key)?, view.overlay_cache().get_overlay(txn, &doc_key)?))
            })
            .unwrap();
        assert_eq!(document.field(&field("a")), Some(&FirestoreValue::from_integer(1)));
        assert_eq!(document.field(&field("b")), Some(&FirestoreValue::from_integer(2)));
        assert!(document.has_local_mutations());
        assert_eq!(overlay.map(|overlay| overlay.largest_batch_id), Some(2));
    }

    #[test]
    fn collection_query_includes_local_only_documents() {
        let (persistence, view) = view();
        write(&persistence, &view, Mutation::set(key("rooms/new"), map("occupancy", 2)));
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
        let results = persistence
            .run_transaction("query", TransactionMode::ReadOnly, |txn| {
                view.get_documents_matching_query(txn, &query, SnapshotVersion::min(), &mut QueryContext::default())
            })
            .unwrap();
        assert_eq!(results.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/new")]);
        assert!(results[&key("rooms/new")].has_pending_writes());
    }
}
