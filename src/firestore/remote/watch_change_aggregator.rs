use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::target::{TargetData, TargetPurpose};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::bloom_filter::BloomFilter;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, WatchTargetChange, WatchTargetChangeState,
};
use crate::util::hard_assert;

/// What the aggregator needs to know about targets it does not own.
pub trait TargetMetadataProvider {
    /// Keys the local store currently associates with the target.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// Target data of a target the client is listening to.
    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplicationStatus {
    Success,
    Skipped,
    FalsePositive,
}

/// Per-target accumulation between two snapshots.
#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests; changes for a target with pending
    /// responses belong to an older incarnation and are dropped.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            // A fresh target always produces a change so its snapshot is raised.
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange::synthesized(self.current, self.resume_token.clone());
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
        hard_assert(self.pending_responses >= 0, "target state received more responses than requests");
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Folds Listen stream frames into one [`RemoteEvent`] per snapshot.
pub struct WatchChangeAggregator {
    serializer: JsonProtoSerializer,
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: BTreeMap<DocumentKey, Document>,
    /// Targets each pending document update touched; used to find documents
    /// that only limbo targets mention.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new(serializer: JsonProtoSerializer) -> Self {
        Self {
            serializer,
            target_states: BTreeMap::new(),
            pending_document_updates: BTreeMap::new(),
            pending_document_target_mapping: BTreeMap::new(),
            pending_target_resets: BTreeMap::new(),
        }
    }

    pub fn handle_document_change(&mut self, metadata: &dyn TargetMetadataProvider, change: DocumentWatchChange) {
        for target_id in &change.updated_target_ids {
            match &change.new_doc {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(metadata, *target_id, document.clone());
                }
                Some(document) if document.is_no_document() => {
                    self.remove_document_from_target(metadata, *target_id, &change.key, Some(document.clone()));
                }
                _ => {}
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(metadata, *target_id, &change.key, change.new_doc.clone());
        }
    }

    pub fn handle_target_change(&mut self, metadata: &dyn TargetMetadataProvider, change: &WatchTargetChange) {
        for target_id in self.affected_targets(metadata, change) {
            match change.state {
                WatchTargetChangeState::NoChange => {
                    if self.is_active_target(metadata, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Added => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A response for the latest add: discard anything that
                        // arrived for an earlier incarnation of the target.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                WatchTargetChangeState::Removed => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.remove_target(target_id);
                    }
                    hard_assert(change.cause.is_none(), "WatchChangeAggregator does not handle errored targets");
                }
                WatchTargetChangeState::Current => {
                    if self.is_active_target(metadata, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                WatchTargetChangeState::Reset => {
                    if self.is_active_target(metadata, target_id) {
                        self.reset_target(metadata, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn affected_targets(&self, metadata: &dyn TargetMetadataProvider, change: &WatchTargetChange) -> Vec<TargetId> {
        if !change.target_ids.is_empty() {
            return change.target_ids.clone();
        }
        self.target_states
            .keys()
            .copied()
            .filter(|target_id| self.is_active_target(metadata, *target_id))
            .collect()
    }

    /// Compares the server's document count with the local one and, on a
    /// mismatch, tries the bloom filter before scheduling a full re-listen.
    pub fn handle_existence_filter(&mut self, metadata: &dyn TargetMetadataProvider, change: &ExistenceFilterChange) {
        let target_id = change.target_id;
        let expected_count = change.existence_filter.count;
        let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
            return;
        };

        if target_data.target.is_document_target() {
            if expected_count == 0 {
                // The document was deleted without the server sending a delete.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let tombstone = Document::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(metadata, target_id, &key, Some(tombstone));
                }
            } else {
                hard_assert(
                    expected_count == 1,
                    format!("Single document existence filter with count: {expected_count}"),
                );
            }
            return;
        }

        let current_size = self.current_document_count_for_target(metadata, target_id);
        if current_size == expected_count as usize {
            return;
        }
        let status = self.apply_bloom_filter(metadata, change, current_size);
        log::debug!(
            "existence filter mismatch for target {target_id}: expected {expected_count}, \
             have {current_size}, bloom filter {status:?}"
        );
        if status != BloomFilterApplicationStatus::Success {
            self.reset_target(metadata, target_id);
            let purpose = if status == BloomFilterApplicationStatus::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: &ExistenceFilterChange,
        current_count: usize,
    ) -> BloomFilterApplicationStatus {
        let Some(names) = &change.existence_filter.unchanged_names else {
            return BloomFilterApplicationStatus::Skipped;
        };
        let bloom_filter = match BloomFilter::new(names.bitmap.clone(), names.padding, names.hash_count) {
            Ok(filter) => filter,
            Err(err) => {
                log::warn!("applying bloom filter failed: {err}; falling back to a full re-query");
                return BloomFilterApplicationStatus::Skipped;
            }
        };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplicationStatus::Skipped;
        }

        let removed = self.filter_removed_documents(metadata, &bloom_filter, change.target_id);
        let expected_count = change.existence_filter.count as i64;
        if expected_count != current_count as i64 - removed as i64 {
            return BloomFilterApplicationStatus::FalsePositive;
        }
        BloomFilterApplicationStatus::Success
    }

    /// Drops every tracked key the bloom filter does not contain and returns how
    /// many were dropped.
    fn filter_removed_documents(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> usize {
        let mut removed = 0;
        for key in metadata.get_remote_keys_for_target(target_id) {
            if !bloom_filter.might_contain(&self.serializer.document_name(&key)) {
                self.remove_document_from_target(metadata, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Emits everything accumulated since the last call as one event and
    /// clears the accumulation.
    pub fn create_remote_event(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();
        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
                continue;
            };
            let current = self
                .target_states
                .get(&target_id)
                .is_some_and(|state| state.current);
            if current && target_data.target.is_document_target() {
                // A current document target without the document means it does
                // not exist; synthesize the delete the server never sends.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !target_contains_document(metadata, target_id, &key)
                    {
                        let tombstone = Document::new_no_document(key.clone(), snapshot_version);
                        self.remove_document_from_target(metadata, target_id, &key, Some(tombstone));
                    }
                }
            }
            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = BTreeSet::new();
        for (key, target_ids) in &self.pending_document_target_mapping {
            let only_limbo = target_ids.iter().all(|target_id| {
                self.target_data_for_active_target(metadata, *target_id)
                    .map_or(true, |target_data| target_data.purpose == TargetPurpose::LimboResolution)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId, document: Document) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if target_contains_document(metadata, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        self.pending_document_updates.insert(key, document);
    }

    /// Removes `key` from the target. `updated_document` is the tombstone to
    /// store, if the server said the document is gone.
    fn remove_document_from_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        updated_document: Option<Document>,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let contained = target_contains_document(metadata, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // Added and removed within one snapshot.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = updated_document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Number of documents the target will contain once the pending changes
    /// are applied.
    fn current_document_count_for_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> usize {
        let change = self.ensure_target_state(target_id).to_target_change();
        let existing = metadata.get_remote_keys_for_target(target_id).len();
        (existing + change.added_documents.len()).saturating_sub(change.removed_documents.len())
    }

    /// Called for every add or remove request sent for the target.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id)
            .record_pending_target_request();
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    /// Starts the target over: its tracked keys are reported removed unless
    /// the server sends them again before the next snapshot.
    fn reset_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) {
        hard_assert(
            !self.target_states.get(&target_id).is_some_and(TargetState::is_pending),
            "Should only reset active targets",
        );
        self.target_states.insert(target_id, TargetState::new());
        for key in metadata.get_remote_keys_for_target(target_id) {
            self.remove_document_from_target(metadata, target_id, &key, None);
        }
    }

    fn is_active_target(&self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(metadata, target_id).is_some()
    }

    fn target_data_for_active_target(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        match self.target_states.get(&target_id) {
            Some(state) if state.is_pending() => None,
            _ => metadata.get_target_data_for_target(target_id),
        }
    }
}

fn target_contains_document(metadata: &dyn TargetMetadataProvider, target_id: TargetId, key: &DocumentKey) -> bool {
    metadata.get_remote_keys_for_target(target_id).contains(key)
}
