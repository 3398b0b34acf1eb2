use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use crate::firestore::core::query::Query;
use crate::firestore::core::target::{Target, TargetData, TargetPurpose};
use crate::firestore::error::{is_transient_persistence_error, FirestoreResult};
use crate::firestore::local::document_overlay_cache::DocumentOverlayCache;
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::index_manager::IndexManager;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::mutation_queue::MutationQueue;
use crate::firestore::local::persistence::{
    is_primary_lease_lost, Persistence, PersistenceTransaction, TransactionMode,
};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::{write_sentinel, TargetCache};
use crate::firestore::model::{
    extract_transform_base_value, BatchId, Document, DocumentKey, FieldIndex, FieldMask, Mutation,
    MutationBatch, MutationBatchResult, Precondition, SnapshotVersion, TargetId, Timestamp, User,
    BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::util::hard_assert;

/// A target's resume token is persisted at least this often even when nothing
/// else about the target changed.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    pub changes: BTreeMap<DocumentKey, Document>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserChangeResult {
    pub affected_documents: BTreeMap<DocumentKey, Document>,
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub documents: BTreeMap<DocumentKey, Document>,
    pub remote_keys: BTreeSet<DocumentKey>,
}

/// Keys that entered or left one target's view, reported after a snapshot.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: BTreeSet<DocumentKey>,
    pub removed_keys: BTreeSet<DocumentKey>,
}

/// Local view of the database for one user.
///
/// Ties the mutation queue, overlays, remote document cache, target cache and
/// indexes together. Every operation runs in a single persistence transaction;
/// in-memory bookkeeping (active targets, view references) is updated only
/// after the transaction committed, since transaction bodies may be retried.
pub struct LocalStore {
    persistence: Arc<Persistence>,
    user: User,
    remote_documents: RemoteDocumentCache,
    target_cache: TargetCache,
    local_documents: LocalDocumentsView,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_id_by_canonical_id: HashMap<String, TargetId>,
    local_view_references: ReferenceSet,
}

impl LocalStore {
    pub fn new(persistence: Arc<Persistence>, query_engine: QueryEngine, user: User) -> Self {
        let local_documents = documents_view_for(&user);
        Self {
            persistence,
            user,
            remote_documents: RemoteDocumentCache,
            target_cache: TargetCache,
            local_documents,
            query_engine,
            target_data_by_target: BTreeMap::new(),
            target_id_by_canonical_id: HashMap::new(),
            local_view_references: ReferenceSet::new(),
        }
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Verifies the persisted mutation queue of the current user.
    pub fn start(&self) -> FirestoreResult<()> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Start LocalStore", TransactionMode::ReadOnly, |txn| {
                queue.perform_consistency_check(txn)
            })
    }

    /// Switches to `user`'s mutation queue, overlays and indexes. Returns the
    /// local view of every document either user has pending writes for.
    pub fn handle_user_change(&mut self, user: User) -> FirestoreResult<UserChangeResult> {
        let old_view = self.local_documents.clone();
        let new_view = documents_view_for(&user);
        let result = self.persistence.run_transaction(
            "Handle user change",
            TransactionMode::ReadWrite,
            |txn| {
                let old_batches = old_view.mutation_queue().get_all_mutation_batches(txn)?;
                let new_batches = new_view.mutation_queue().get_all_mutation_batches(txn)?;
                let mut changed_keys = BTreeSet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    changed_keys.extend(batch.keys());
                }
                let affected_documents = new_view.get_documents(txn, &changed_keys)?;
                new_view.index_manager().update_index_entries(txn, &affected_documents)?;
                Ok(UserChangeResult {
                    affected_documents,
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                })
            },
        )?;
        log::debug!("local store switched to {user}");
        self.local_documents = new_view;
        self.user = user;
        Ok(result)
    }

    /// Queues `mutations` as one batch and returns the new local views.
    pub fn write_locally(&mut self, mutations: Vec<Mutation>) -> FirestoreResult<LocalWriteResult> {
        let local_write_time = Timestamp::now();
        let keys: BTreeSet<DocumentKey> = mutations.iter().map(|m| m.key().clone()).collect();
        let view = &self.local_documents;
        let remote_documents = self.remote_documents;
        self.persistence
            .run_transaction("Locally write mutations", TransactionMode::ReadWrite, |txn| {
                let remote = remote_documents.get_entries(txn, &keys)?;
                let without_remote_version: BTreeSet<DocumentKey> = remote
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = view.get_overlayed_documents(txn, remote)?;

                // Non-idempotent transforms are pinned to the value they were
                // applied to locally, so retries and acks see the same base.
                let mut base_mutations = Vec::new();
                for mutation in &mutations {
                    let Some(current) = overlayed.get(mutation.key()) else {
                        continue;
                    };
                    if let Some(base_value) = extract_transform_base_value(mutation, &current.document) {
                        let mask = FieldMask::new(base_value.field_paths());
                        base_mutations.push(
                            Mutation::patch(mutation.key().clone(), base_value, mask)
                                .with_precondition(Precondition::Exists(true)),
                        );
                    }
                }

                let batch = view.mutation_queue().add_mutation_batch(
                    txn,
                    local_write_time,
                    base_mutations,
                    mutations.clone(),
                )?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                view.overlay_cache().save_overlays(txn, batch.batch_id, &overlays)?;

                let changes: BTreeMap<DocumentKey, Document> = overlayed
                    .into_iter()
                    .map(|(key, overlayed)| (key, overlayed.document))
                    .collect();
                view.index_manager().update_index_entries(txn, &changes)?;
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes,
                })
            })
    }

    /// Applies an acknowledged batch to the remote documents and drops it from
    /// the queue. Returns the new local views of the batch's documents.
    pub fn accept_batch(&mut self, batch_result: &MutationBatchResult) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let view = &self.local_documents;
        let remote_documents = self.remote_documents;
        self.persistence
            .run_transaction("Acknowledge batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = &batch_result.batch;
                let affected = batch.keys();
                let mut remote = remote_documents.get_entries(txn, &affected)?;
                for (key, document) in remote.iter_mut() {
                    let ack_version = batch_result.doc_versions.get(key).copied();
                    hard_assert(ack_version.is_some(), "doc versions should contain every acknowledged key");
                    let Some(ack_version) = ack_version else {
                        continue;
                    };
                    if document.version() < ack_version {
                        batch.apply_to_remote_document(document, batch_result);
                        if document.is_valid_document() {
                            remote_documents.add_entry(txn, document, batch_result.commit_version)?;
                        }
                    }
                }
                view.mutation_queue().remove_mutation_batch(txn, batch)?;
                view.mutation_queue().perform_consistency_check(txn)?;
                view.overlay_cache().remove_overlays_for_batch_id(txn, batch.batch_id)?;

                let with_transform_results: BTreeSet<DocumentKey> = batch
                    .mutations
                    .iter()
                    .zip(batch_result.mutation_results.iter())
                    .filter(|(_, result)| !result.transform_results.is_empty())
                    .map(|(mutation, _)| mutation.key().clone())
                    .collect();
                view.recalculate_and_save_overlays_for_document_keys(txn, &with_transform_results)?;

                let documents = view.get_documents(txn, &affected)?;
                view.index_manager().update_index_entries(txn, &documents)?;
                Ok(documents)
            })
    }

    /// Drops a batch the backend refused and returns the affected local views.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let view = &self.local_documents;
        self.persistence
            .run_transaction("Reject batch", TransactionMode::ReadWritePrimary, |txn| {
                let batch = view.mutation_queue().lookup_mutation_batch(txn, batch_id)?;
                hard_assert(batch.is_some(), format!("Attempt to reject nonexistent batch {batch_id}"));
                let Some(batch) = batch else {
                    return Ok(BTreeMap::new());
                };
                let keys = view.mutation_queue().remove_mutation_batch(txn, &batch)?;
                view.mutation_queue().perform_consistency_check(txn)?;
                view.overlay_cache().remove_overlays_for_batch_id(txn, batch_id)?;
                view.recalculate_and_save_overlays_for_document_keys(txn, &keys)?;
                let documents = view.get_documents(txn, &keys)?;
                view.index_manager().update_index_entries(txn, &documents)?;
                Ok(documents)
            })
    }

    pub fn get_highest_unacknowledged_batch_id(&self) -> FirestoreResult<BatchId> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Get highest unacknowledged batch id", TransactionMode::ReadOnly, |txn| {
                queue.get_highest_unacknowledged_batch_id(txn)
            })
    }

    /// First queued batch after `after_batch_id`, in id order.
    pub fn next_mutation_batch(&self, after_batch_id: Option<BatchId>) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.local_documents.mutation_queue();
        let after = after_batch_id.unwrap_or(BATCH_ID_UNKNOWN);
        self.persistence
            .run_transaction("Get next mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.get_next_mutation_batch_after_batch_id(txn, after)
            })
    }

    pub fn lookup_mutation_batch(&self, batch_id: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        let queue = self.local_documents.mutation_queue();
        self.persistence
            .run_transaction("Lookup mutation batch", TransactionMode::ReadOnly, |txn| {
                queue.lookup_mutation_batch(txn, batch_id)
            })
    }

    pub fn read_document(&self, key: &DocumentKey) -> FirestoreResult<Document> {
        let view = &self.local_documents;
        self.persistence
            .run_transaction("Read document", TransactionMode::ReadOnly, |txn| view.get_document(txn, key))
    }

    pub fn get_documents(&self, keys: &BTreeSet<DocumentKey>) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let view = &self.local_documents;
        self.persistence
            .run_transaction("Get documents", TransactionMode::ReadOnly, |txn| view.get_documents(txn, keys))
    }

    /// Merges one watch cycle into the cache. Returns the local views of every
    /// document the event changed.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        let view = &self.local_documents;
        let remote_documents = self.remote_documents;
        let target_cache = self.target_cache;
        let active = &self.target_data_by_target;
        let remote_version = event.snapshot_version;

        let (updated_targets, documents) = self.persistence.run_transaction(
            "Apply remote event",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let mut updated_targets = Vec::new();
                for (target_id, change) in &event.target_changes {
                    let Some(old) = active.get(target_id) else {
                        continue;
                    };
                    target_cache.remove_matching_keys(txn, &change.removed_documents, *target_id)?;
                    target_cache.add_matching_keys(txn, &change.added_documents, *target_id)?;

                    let mut updated = old.with_sequence_number(txn.current_sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(old, &updated, change) {
                        target_cache.update_target_data(txn, &updated)?;
                    }
                    updated_targets.push(updated);
                }

                for key in &event.resolved_limbo_documents {
                    if event.document_updates.contains_key(key) {
                        write_sentinel(txn, key)?;
                    }
                }

                let existing = remote_documents.get_entries(txn, event.document_updates.keys())?;
                let mut changed = BTreeMap::new();
                let mut existence_changed = BTreeSet::new();
                for (key, document) in &event.document_updates {
                    let Some(existing) = existing.get(key) else {
                        continue;
                    };
                    if document.is_found_document() != existing.is_found_document() {
                        existence_changed.insert(key.clone());
                    }
                    if document.is_no_document() && document.version().is_min() {
                        // Deleted with no version: the document left a target's
                        // results without the server telling us it was deleted.
                        remote_documents.remove_entry(txn, key)?;
                        changed.insert(key.clone(), document.clone());
                    } else if !existing.is_valid_document()
                        || document.version() > existing.version()
                        || (document.version() == existing.version() && existing.has_committed_mutations())
                    {
                        remote_documents.add_entry(txn, document, remote_version)?;
                        changed.insert(key.clone(), document.clone());
                    } else {
                        log::debug!(
                            "ignoring outdated watch update for {key}: current version {}, watch version {}",
                            existing.version(),
                            document.version()
                        );
                    }
                }

                if !remote_version.is_min() {
                    let last = target_cache.last_remote_snapshot_version(txn)?;
                    hard_assert(
                        remote_version >= last,
                        format!("watch stream reverted to previous snapshot: {remote_version} < {last}"),
                    );
                    target_cache.set_targets_metadata(txn, txn.current_sequence_number(), remote_version)?;
                }

                let documents = view.get_local_view_of_documents(txn, changed, &existence_changed)?;
                view.index_manager().update_index_entries(txn, &documents)?;
                Ok((updated_targets, documents))
            },
        )?;

        for target_data in updated_targets {
            self.target_data_by_target.insert(target_data.target_id, target_data);
        }
        Ok(documents)
    }

    /// Records which documents each view references and advances the last
    /// limbo-free version of views that are in sync with the server.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> FirestoreResult<()> {
        let limbo_free: Vec<TargetData> = view_changes
            .iter()
            .filter(|change| !change.from_cache)
            .filter_map(|change| self.target_data_by_target.get(&change.target_id))
            .filter(|target_data| target_data.last_limbo_free_snapshot_version != target_data.snapshot_version)
            .map(|target_data| target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version))
            .collect();

        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Notify local view changes", TransactionMode::ReadWrite, |txn| {
                for change in view_changes {
                    for key in &change.removed_keys {
                        write_sentinel(txn, key)?;
                    }
                }
                for target_data in &limbo_free {
                    target_cache.update_target_data(txn, target_data)?;
                }
                Ok(())
            })?;

        for change in view_changes {
            self.local_view_references
                .add_references(&change.added_keys, change.target_id);
            self.local_view_references
                .remove_references(&change.removed_keys, change.target_id);
        }
        for target_data in limbo_free {
            self.target_data_by_target.insert(target_data.target_id, target_data);
        }
        Ok(())
    }

    /// Finds or creates the persisted data for `target`.
    pub fn allocate_target(&mut self, target: Target) -> FirestoreResult<TargetData> {
        let target_cache = self.target_cache;
        let target_data = self
            .persistence
            .run_transaction("Allocate target", TransactionMode::ReadWrite, |txn| {
                if let Some(cached) = target_cache.get_target_data(txn, &target)? {
                    return Ok(cached);
                }
                let target_id = target_cache.allocate_target_id(txn)?;
                let target_data = TargetData::new(
                    target.clone(),
                    target_id,
                    TargetPurpose::Listen,
                    txn.current_sequence_number(),
                );
                target_cache.add_target_data(txn, &target_data)?;
                Ok(target_data)
            })?;

        let target_id = target_data.target_id;
        let newer = self
            .target_data_by_target
            .get(&target_id)
            .map_or(true, |existing| target_data.snapshot_version > existing.snapshot_version);
        if newer {
            self.target_data_by_target.insert(target_id, target_data.clone());
            self.target_id_by_canonical_id
                .insert(target_data.target.canonical_id(), target_id);
        }
        Ok(self
            .target_data_by_target
            .get(&target_id)
            .cloned()
            .unwrap_or(target_data))
    }

    /// Active target data for `target`, falling back to the target cache.
    pub fn get_target_data(&self, target: &Target) -> FirestoreResult<Option<TargetData>> {
        if let Some(target_data) = self
            .target_id_by_canonical_id
            .get(&target.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
        {
            return Ok(Some(target_data.clone()));
        }
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Get target data", TransactionMode::ReadOnly, |txn| {
                target_cache.get_target_data(txn, target)
            })
    }

    pub fn get_cached_target(&self, target_id: TargetId) -> FirestoreResult<Option<Target>> {
        if let Some(target_data) = self.target_data_by_target.get(&target_id) {
            return Ok(Some(target_data.target.clone()));
        }
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Get cached target", TransactionMode::ReadOnly, |txn| {
                Ok(target_cache
                    .get_target_data_for_target_id(txn, target_id)?
                    .map(|target_data| target_data.target))
            })
    }

    pub fn active_target_ids(&self) -> BTreeSet<TargetId> {
        self.target_data_by_target.keys().copied().collect()
    }

    pub fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Get last remote snapshot version", TransactionMode::ReadOnly, |txn| {
                target_cache.last_remote_snapshot_version(txn)
            })
    }

    /// Stops tracking a target. Unless `keep_persisted_target_data` is set, its
    /// sequence number is bumped so LRU collection sees when it was released.
    pub fn release_target(&mut self, target_id: TargetId, keep_persisted_target_data: bool) -> FirestoreResult<()> {
        let Some(target_data) = self.target_data_by_target.get(&target_id).cloned() else {
            hard_assert(false, format!("Tried to release nonexistent target: {target_id}"));
            return Ok(());
        };
        let mode = if keep_persisted_target_data {
            TransactionMode::ReadWrite
        } else {
            TransactionMode::ReadWritePrimary
        };
        let referenced = self.local_view_references.references_for_id(target_id);
        let target_cache = self.target_cache;
        let result = self.persistence.run_transaction("Release target", mode, |txn| {
            for key in &referenced {
                write_sentinel(txn, key)?;
            }
            if !keep_persisted_target_data {
                let updated = target_data.with_sequence_number(txn.current_sequence_number());
                target_cache.update_target_data(txn, &updated)?;
            }
            Ok(())
        });
        match result {
            Ok(()) => {}
            Err(err) if is_primary_lease_lost(&err) || is_transient_persistence_error(&err) => {
                log::debug!("failed to update sequence numbers for target {target_id}: {err}");
            }
            Err(err) => return Err(err),
        }

        self.local_view_references.remove_references_for_id(target_id);
        self.target_data_by_target.remove(&target_id);
        self.target_id_by_canonical_id
            .remove(&target_data.target.canonical_id());
        Ok(())
    }

    /// Runs `query` against the cache. With `use_previous_results`, the last
    /// synced result of the query's target seeds the execution.
    pub fn execute_query(&self, query: &Query, use_previous_results: bool) -> FirestoreResult<QueryResult> {
        let target_data = self.get_target_data(&query.to_target())?;
        let view = &self.local_documents;
        let engine = &self.query_engine;
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Execute query", TransactionMode::ReadWrite, |txn| {
                let (last_limbo_free, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        target_cache.get_matching_keys_for_target_id(txn, target_data.target_id)?,
                    ),
                    None => (SnapshotVersion::min(), BTreeSet::new()),
                };
                let (since, previous_keys) = if use_previous_results {
                    (last_limbo_free, remote_keys.clone())
                } else {
                    (SnapshotVersion::min(), BTreeSet::new())
                };
                let documents = engine.get_documents_matching_query(txn, view, query, since, &previous_keys)?;
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let target_cache = self.target_cache;
        self.persistence
            .run_transaction("Remote document keys", TransactionMode::ReadOnly, |txn| {
                target_cache.get_matching_keys_for_target_id(txn, target_id)
            })
    }

    /// Runs LRU collection. Documents referenced by active views or listed in
    /// `pinned` survive regardless of age.
    pub fn collect_garbage(
        &self,
        garbage_collector: &LruGarbageCollector,
        pinned: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<LruResults> {
        let active = self.active_target_ids();
        let references = &self.local_view_references;
        self.persistence
            .run_transaction("Collect garbage", TransactionMode::ReadWritePrimary, |txn| {
                garbage_collector.collect(txn, &active, |key| {
                    references.contains_key(key) || pinned.contains(key)
                })
            })
    }

    pub fn backfill_indexes(&self, backfiller: &IndexBackfiller) -> FirestoreResult<usize> {
        let view = &self.local_documents;
        self.persistence
            .run_transaction("Backfill indexes", TransactionMode::ReadWritePrimary, |txn| {
                backfiller.backfill(txn, view)
            })
    }

    /// Replaces the configured indexes with `indexes`. Indexes of an unchanged
    /// shape keep their entries.
    pub fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        let manager = self.local_documents.index_manager();
        self.persistence
            .run_transaction("Configure indexes", TransactionMode::ReadWrite, |txn| {
                let existing = manager.get_field_indexes(txn, None)?;
                for index in &existing {
                    if !indexes.iter().any(|wanted| wanted.same_shape(index)) {
                        manager.delete_field_index(txn, index.index_id)?;
                    }
                }
                for wanted in &indexes {
                    if !existing.iter().any(|index| index.same_shape(wanted)) {
                        manager.add_field_index(txn, &wanted.collection_group, wanted.segments.clone())?;
                    }
                }
                Ok(())
            })
    }

    pub fn get_field_indexes(&self) -> FirestoreResult<Vec<FieldIndex>> {
        let manager = self.local_documents.index_manager();
        self.persistence
            .run_transaction("Get indexes", TransactionMode::ReadOnly, |txn| {
                manager.get_field_indexes(txn, None)
            })
    }

    pub fn delete_all_field_indexes(&self) -> FirestoreResult<()> {
        let manager = self.local_documents.index_manager();
        self.persistence
            .run_transaction("Delete all indexes", TransactionMode::ReadWrite, |txn| {
                manager.delete_all_field_indexes(txn)
            })
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.query_engine.set_index_auto_creation_enabled(enabled);
    }
}

fn documents_view_for(user: &User) -> LocalDocumentsView {
    LocalDocumentsView::new(
        RemoteDocumentCache,
        MutationQueue::new(user),
        DocumentOverlayCache::new(user),
        IndexManager::new(user),
    )
}

/// Whether an updated target must be written now. New resume tokens are only
/// persisted periodically unless documents changed.
fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = micros(new.snapshot_version) - micros(old.snapshot_version);
    if elapsed >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.change_count() > 0
}

fn micros(version: SnapshotVersion) -> i64 {
    let timestamp = version.timestamp();
    timestamp.seconds * 1_000_000 + i64::from(timestamp.nanos / 1000)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{FieldFilter, FilterOperator};
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::model::{FieldPath, MutationResult, ResourcePath};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn store() -> LocalStore {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        let store = LocalStore::new(Arc::new(persistence), QueryEngine::default(), User::unauthenticated());
        store.start().unwrap();
        store
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

    fn patch(path: &str, name: &str, value: i64) -> Mutation {
        Mutation::patch(key(path), map(name, value), FieldMask::new([field(name)]))
    }

    fn found(path: &str, version: i64, data: MapValue) -> Document {
        Document::new_found(key(path), SnapshotVersion::from_micros(version), data)
    }

    fn ack(store: &mut LocalStore, batch_id: BatchId, version: i64) -> BTreeMap<DocumentKey, Document> {
        let batch = store.lookup_mutation_batch(batch_id).unwrap().unwrap();
        let commit = SnapshotVersion::from_micros(version);
        let results = batch
            .mutations
            .iter()
            .map(|_| MutationResult::new(commit, vec![]))
            .collect();
        let result = MutationBatchResult::from(batch, commit, results, vec![]);
        store.accept_batch(&result).unwrap()
    }

    #[test]
    fn set_is_visible_before_and_after_acknowledgement() {
        let mut store = store();
        let result = store
            .write_locally(vec![Mutation::set(key("rooms/a"), map("occupancy", 2))])
            .unwrap();
        assert!(result.changes[&key("rooms/a")].has_local_mutations());
        assert!(store.read_document(&key("rooms/a")).unwrap().has_pending_writes());

        let documents = ack(&mut store, result.batch_id, 10);
        let document = &documents[&key("rooms/a")];
        assert!(document.has_committed_mutations());
        assert!(!document.has_local_mutations());
        assert_eq!(document.field(&field("occupancy")), Some(&FirestoreValue::from_integer(2)));
        assert_eq!(store.get_highest_unacknowledged_batch_id().unwrap(), BATCH_ID_UNKNOWN);
    }

    #[test]
    fn rejecting_the_first_of_two_patches_keeps_the_second() {
        let mut store = store();
        let first = store.write_locally(vec![patch("rooms/a", "a", 1)]).unwrap();
        let second = store.write_locally(vec![patch("rooms/a", "a", 2)]).unwrap();
        assert!(second.batch_id > first.batch_id);

        let documents = store.reject_batch(first.batch_id).unwrap();
        let document = &documents[&key("rooms/a")];
        assert_eq!(document.field(&field("a")), Some(&FirestoreValue::from_integer(2)));
        assert_eq!(
            store.next_mutation_batch(None).unwrap().map(|batch| batch.batch_id),
            Some(second.batch_id)
        );
    }

    #[test]
    fn remote_events_merge_monotonically() {
        let mut store = store();
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap());
        let target_data = store.allocate_target(query.to_target()).unwrap();
        let target_id = target_data.target_id;

        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(5),
            ..RemoteEvent::default()
        };
        let mut change = TargetChange::synthesized(true, vec![1]);
        change.added_documents.insert(key("rooms/a"));
        event.target_changes.insert(target_id, change);
        event
            .document_updates
            .insert(key("rooms/a"), found("rooms/a", 5, map("v", 5)));
        store.apply_remote_event(&event).unwrap();

        let mut stale = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(6),
            ..RemoteEvent::default()
        };
        stale
            .document_updates
            .insert(key("rooms/a"), found("rooms/a", 3, map("v", 3)));
        let changed = store.apply_remote_event(&stale).unwrap();
        assert!(changed.is_empty());

        let document = store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(document.version(), SnapshotVersion::from_micros(5));
        assert_eq!(store.remote_document_keys(target_id).unwrap(), BTreeSet::from([key("rooms/a")]));
    }

    #[test]
    fn tombstone_at_min_version_removes_the_document() {
        let mut store = store();
        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(5),
            ..RemoteEvent::default()
        };
        event
            .document_updates
            .insert(key("rooms/a"), found("rooms/a", 5, map("v", 5)));
        store.apply_remote_event(&event).unwrap();

        let mut removal = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(7),
            ..RemoteEvent::default()
        };
        removal.document_updates.insert(
            key("rooms/a"),
            Document::new_no_document(key("rooms/a"), SnapshotVersion::min()),
        );
        store.apply_remote_event(&removal).unwrap();
        assert!(!store.read_document(&key("rooms/a")).unwrap().is_valid_document());
    }

    #[test]
    fn limbo_free_version_survives_restart() {
        let persistence = Arc::new(Persistence::new(Arc::new(MemoryKvStore::new()), "client", false));
        persistence.start().unwrap();
        let mut store = LocalStore::new(Arc::clone(&persistence), QueryEngine::default(), User::unauthenticated());
        store.start().unwrap();
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap()).to_target();
        let target_id = store.allocate_target(target.clone()).unwrap().target_id;

        let mut event = RemoteEvent {
            snapshot_version: SnapshotVersion::from_micros(5),
            ..RemoteEvent::default()
        };
        event
            .target_changes
            .insert(target_id, TargetChange::synthesized(true, vec![1]));
        store.apply_remote_event(&event).unwrap();
        store
            .notify_local_view_changes(&[LocalViewChanges {
                target_id,
                from_cache: false,
                added_keys: BTreeSet::new(),
                removed_keys: BTreeSet::new(),
            }])
            .unwrap();

        let restarted = LocalStore::new(persistence, QueryEngine::default(), User::unauthenticated());
        restarted.start().unwrap();
        let cached = restarted.get_target_data(&target).unwrap().unwrap();
        assert_eq!(cached.snapshot_version, SnapshotVersion::from_micros(5));
        assert_eq!(cached.last_limbo_free_snapshot_version, SnapshotVersion::from_micros(5));
    }

    #[test]
    fn allocating_the_same_target_twice_reuses_its_id() {
        let mut store = store();
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap()).to_target();
        let first = store.allocate_target(target.clone()).unwrap();
        store.release_target(first.target_id, false).unwrap();
        let second = store.allocate_target(target).unwrap();
        assert_eq!(first.target_id, second.target_id);
        assert_eq!(first.target_id % 2, 0);
    }

    #[test]
    fn execute_query_applies_pending_writes() {
        let mut store = store();
        store
            .write_locally(vec![Mutation::set(key("rooms/a"), map("occupancy", 2))])
            .unwrap();
        store
            .write_locally(vec![Mutation::set(key("rooms/b"), map("occupancy", 9))])
            .unwrap();
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).with_filter(FieldFilter::new(
            field("occupancy"),
            FilterOperator::LessThan,
            FirestoreValue::from_integer(4),
        ));
        let result = store.execute_query(&query, true).unwrap();
        assert_eq!(result.documents.keys().cloned().collect::<Vec<_>>(), vec![key("rooms/a")]);
        assert!(result.remote_keys.is_empty());
    }

    #[test]
    fn user_change_reports_both_users_documents() {
        let mut store = store();
        store.write_locally(vec![patch("rooms/a", "a", 1)]).unwrap();
        let result = store.handle_user_change(User::authenticated("alice")).unwrap();
        assert_eq!(result.removed_batch_ids.len(), 1);
        assert!(result.added_batch_ids.is_empty());
        assert!(result.affected_documents.contains_key(&key("rooms/a")));
        assert!(!store.read_document(&key("rooms/a")).unwrap().has_pending_writes());
    }
}
