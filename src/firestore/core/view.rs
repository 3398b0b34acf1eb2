use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{compare_by_order, LimitType, OrderBy, Query};
use crate::firestore::local::local_store::QueryResult;
use crate::firestore::model::{Document, DocumentKey};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::TargetChange;
use crate::util::fail;

/// Kind of change a document went through between two snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the pending-write state changed.
    Metadata,
}

impl ChangeType {
    // Removals sort first, then additions, then everything else.
    fn sort_rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Per-key change log that folds successive changes into one.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };
        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new_type) if new_type != Added => Some(DocumentViewChange {
                change_type: new_type,
                document: change.document,
            }),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => fail(format!(
                "unsupported combination of changes: {new_type:?} after {old_type:?} for {key}"
            )),
        };
        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// Documents of one query kept in query order.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    order_by: Vec<OrderBy>,
    sorted: Vec<Document>,
    by_key: BTreeMap<DocumentKey, Document>,
}

impl DocumentSet {
    pub fn new(query: &Query) -> Self {
        Self {
            order_by: query.normalized_order_by(),
            sorted: Vec::new(),
            by_key: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &DocumentKey> {
        self.sorted.iter().map(Document::key)
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        compare_by_order(&self.order_by, left, right)
    }

    /// Inserts `document`, replacing any document with the same key.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let position = self
            .sorted
            .partition_point(|existing| compare_by_order(&self.order_by, existing, &document) == Ordering::Less);
        self.by_key.insert(document.key().clone(), document.clone());
        self.sorted.insert(position, document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let removed = self.by_key.remove(key)?;
        self.sorted.retain(|document| document.key() != key);
        Some(removed)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

/// Whether a view is backed by the server's current result.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncState {
    /// Results may be stale or incomplete.
    Local,
    Synced,
}

/// Immutable result of a query at one point in time.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    pub mutated_keys: BTreeSet<DocumentKey>,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot that reports every document in `docs` as added.
    pub fn from_initial_documents(
        query: Query,
        docs: DocumentSet,
        mutated_keys: BTreeSet<DocumentKey>,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = docs
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        let old_docs = DocumentSet::new(&query);
        Self {
            query,
            docs,
            old_docs,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.docs.iter()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    /// Copy without metadata-only changes, for listeners that did not ask for them.
    pub fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .doc_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LimboDocumentChange {
    Added(DocumentKey),
    Removed(DocumentKey),
}

/// Changes computed against a view but not yet applied to it.
#[derive(Clone, Debug)]
pub struct ViewDocumentChanges {
    pub document_set: DocumentSet,
    pub change_set: DocumentChangeSet,
    pub mutated_keys: BTreeSet<DocumentKey>,
    /// A limited query lost documents and must be re-run against the cache.
    pub needs_refill: bool,
}

#[derive(Clone, Debug, Default)]
pub struct ViewChange {
    pub snapshot: Option<ViewSnapshot>,
    pub limbo_changes: Vec<LimboDocumentChange>,
}

/// Result set of one query, maintained incrementally from document changes
/// and target changes.
///
/// A document is in limbo when the local result contains it, the server
/// result does not, and no local write explains the difference. Limbo is
/// only computed once the target is current.
#[derive(Clone, Debug)]
pub struct View {
    query: Query,
    sync_state: Option<SyncState>,
    current: bool,
    documents: DocumentSet,
    synced_documents: BTreeSet<DocumentKey>,
    limbo_documents: BTreeSet<DocumentKey>,
    mutated_keys: BTreeSet<DocumentKey>,
}

impl View {
    pub fn new(query: Query, synced_documents: BTreeSet<DocumentKey>) -> Self {
        let documents = DocumentSet::new(&query);
        Self {
            query,
            sync_state: None,
            current: false,
            documents,
            synced_documents,
            limbo_documents: BTreeSet::new(),
            mutated_keys: BTreeSet::new(),
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn synced_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.synced_documents
    }

    pub fn set_synced_documents(&mut self, keys: BTreeSet<DocumentKey>) {
        self.synced_documents = keys;
    }

    pub fn limbo_documents(&self) -> &BTreeSet<DocumentKey> {
        &self.limbo_documents
    }

    pub fn documents(&self) -> &DocumentSet {
        &self.documents
    }

    pub fn is_current(&self) -> bool {
        self.current
    }

    /// Computes how `doc_changes` affect this view. Pass the result of a
    /// previous call as `previous` to continue from it, which is how a limited
    /// query is refilled.
    pub fn compute_doc_changes(
        &self,
        doc_changes: &BTreeMap<DocumentKey, Document>,
        previous: Option<ViewDocumentChanges>,
    ) -> ViewDocumentChanges {
        let (mut change_set, old_documents, mut mutated_keys) = match previous {
            Some(previous) => (previous.change_set, previous.document_set, previous.mutated_keys),
            None => (
                DocumentChangeSet::default(),
                self.documents.clone(),
                self.mutated_keys.clone(),
            ),
        };
        let mut new_documents = old_documents.clone();
        let mut needs_refill = false;

        let limit = self.query.limit_value().map(|limit| limit as usize);
        let at_limit = limit.is_some_and(|limit| old_documents.len() == limit);
        let last_doc_in_limit = match self.query.limit_type() {
            LimitType::First if at_limit => old_documents.last().cloned(),
            _ => None,
        };
        let first_doc_in_limit = match self.query.limit_type() {
            LimitType::Last if at_limit => old_documents.first().cloned(),
            _ => None,
        };

        for (key, entry) in doc_changes {
            let old_doc = old_documents.get(key);
            let new_doc = self.query.matches(entry).then_some(entry);

            let old_doc_had_pending_mutations = old_doc.is_some_and(|doc| self.mutated_keys.contains(doc.key()));
            let new_doc_has_pending_mutations = new_doc.is_some_and(|doc| {
                doc.has_local_mutations()
                    || (self.mutated_keys.contains(doc.key()) && doc.has_committed_mutations())
            });

            let mut change_applied = false;
            match (old_doc, new_doc) {
                (Some(old_doc), Some(new_doc)) => {
                    if old_doc.data() != new_doc.data() {
                        if !should_wait_for_synced_document(old_doc, new_doc) {
                            change_set.track(DocumentViewChange {
                                change_type: ChangeType::Modified,
                                document: new_doc.clone(),
                            });
                            change_applied = true;
                            let past_last = last_doc_in_limit
                                .as_ref()
                                .is_some_and(|last| old_documents.compare(new_doc, last) == Ordering::Greater);
                            let before_first = first_doc_in_limit
                                .as_ref()
                                .is_some_and(|first| old_documents.compare(new_doc, first) == Ordering::Less);
                            if past_last || before_first {
                                // This document moved out of the limit; another
                                // one may need to take its place.
                                needs_refill = true;
                            }
                        }
                    } else if old_doc_had_pending_mutations != new_doc_has_pending_mutations {
                        change_set.track(DocumentViewChange {
                            change_type: ChangeType::Metadata,
                            document: new_doc.clone(),
                        });
                        change_applied = true;
                    }
                }
                (None, Some(new_doc)) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Added,
                        document: new_doc.clone(),
                    });
                    change_applied = true;
                }
                (Some(old_doc), None) => {
                    change_set.track(DocumentViewChange {
                        change_type: ChangeType::Removed,
                        document: old_doc.clone(),
                    });
                    change_applied = true;
                    if last_doc_in_limit.is_some() || first_doc_in_limit.is_some() {
                        needs_refill = true;
                    }
                }
                (None, None) => {}
            }

            if change_applied {
                match new_doc {
                    Some(new_doc) => {
                        new_documents.insert(new_doc.clone());
                        if new_doc_has_pending_mutations {
                            mutated_keys.insert(key.clone());
                        } else {
                            mutated_keys.remove(key);
                        }
                    }
                    None => {
                        new_documents.remove(key);
                        mutated_keys.remove(key);
                    }
                }
            }
        }

        if let Some(limit) = limit {
            while new_documents.len() > limit {
                let evicted = match self.query.limit_type() {
                    LimitType::First => new_documents.last(),
                    LimitType::Last => new_documents.first(),
                }
                .cloned();
                let Some(evicted) = evicted else {
                    break;
                };
                new_documents.remove(evicted.key());
                mutated_keys.remove(evicted.key());
                change_set.track(DocumentViewChange {
                    change_type: ChangeType::Removed,
                    document: evicted,
                });
            }
        }

        ViewDocumentChanges {
            document_set: new_documents,
            change_set,
            mutated_keys,
            needs_refill,
        }
    }

    /// Applies computed changes and an optional target change, producing a
    /// snapshot when anything visible changed.
    pub fn apply_changes(
        &mut self,
        doc_changes: ViewDocumentChanges,
        limbo_resolution_enabled: bool,
        target_change: Option<&TargetChange>,
        target_is_pending_reset: bool,
    ) -> ViewChange {
        let old_documents = std::mem::replace(&mut self.documents, doc_changes.document_set.clone());
        self.mutated_keys = doc_changes.mutated_keys.clone();

        let mut changes = doc_changes.change_set.into_changes();
        changes.sort_by(|left, right| {
            left.change_type
                .sort_rank()
                .cmp(&right.change_type.sort_rank())
                .then_with(|| self.documents.compare(&left.document, &right.document))
        });

        self.apply_target_change(target_change);
        let limbo_changes = if limbo_resolution_enabled && !target_is_pending_reset {
            self.update_limbo_documents()
        } else {
            Vec::new()
        };

        let synced = self.limbo_documents.is_empty() && self.current && !target_is_pending_reset;
        let new_sync_state = if synced { SyncState::Synced } else { SyncState::Local };
        let sync_state_changed = self.sync_state != Some(new_sync_state);
        self.sync_state = Some(new_sync_state);

        if changes.is_empty() && !sync_state_changed {
            return ViewChange {
                snapshot: None,
                limbo_changes,
            };
        }

        let has_cached_results = target_change.is_some_and(|change| !change.resume_token.is_empty());
        ViewChange {
            snapshot: Some(ViewSnapshot {
                query: self.query.clone(),
                docs: self.documents.clone(),
                old_docs: old_documents,
                doc_changes: changes,
                mutated_keys: self.mutated_keys.clone(),
                from_cache: new_sync_state == SyncState::Local,
                sync_state_changed,
                excludes_metadata_changes: false,
                has_cached_results,
            }),
            limbo_changes,
        }
    }

    /// Marks the view as not current when the client goes offline, so the
    /// next snapshot reports `from_cache`.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> ViewChange {
        if self.current && online_state == OnlineState::Offline {
            self.current = false;
            let unchanged = ViewDocumentChanges {
                document_set: self.documents.clone(),
                change_set: DocumentChangeSet::default(),
                mutated_keys: self.mutated_keys.clone(),
                needs_refill: false,
            };
            return self.apply_changes(unchanged, false, None, false);
        }
        ViewChange::default()
    }

    /// Re-bases the view on a fresh query result from persistence, as needed
    /// when another client has been maintaining the target.
    pub fn synchronize_with_persisted_state(&mut self, result: &QueryResult) -> ViewChange {
        self.synced_documents = result.remote_keys.clone();
        self.limbo_documents.clear();
        let mut documents = result.documents.clone();
        for key in self.documents.keys() {
            if !documents.contains_key(key) {
                if let Some(existing) = self.documents.get(key) {
                    // Not in the result anymore: feed it back as a non-match.
                    documents.insert(key.clone(), Document::new_invalid(existing.key().clone()));
                }
            }
        }
        let changes = self.compute_doc_changes(&documents, None);
        self.apply_changes(changes, true, None, false)
    }

    /// Snapshot of the current state with every document reported as added.
    pub fn compute_initial_snapshot(&self) -> ViewSnapshot {
        ViewSnapshot::from_initial_documents(
            self.query.clone(),
            self.documents.clone(),
            self.mutated_keys.clone(),
            self.sync_state != Some(SyncState::Synced),
            false,
        )
    }

    fn apply_target_change(&mut self, target_change: Option<&TargetChange>) {
        let Some(change) = target_change else {
            return;
        };
        self.synced_documents.extend(change.added_documents.iter().cloned());
        for key in &change.removed_documents {
            self.synced_documents.remove(key);
        }
        self.current = change.current;
    }

    fn update_limbo_documents(&mut self) -> Vec<LimboDocumentChange> {
        if !self.current {
            return Vec::new();
        }
        let old_limbo = std::mem::take(&mut self.limbo_documents);
        let new_limbo: BTreeSet<DocumentKey> = self
            .documents
            .iter()
            .filter(|document| self.should_be_in_limbo(document))
            .map(|document| document.key().clone())
            .collect();

        let mut changes: Vec<LimboDocumentChange> = old_limbo
            .difference(&new_limbo)
            .cloned()
            .map(LimboDocumentChange::Removed)
            .collect();
        changes.extend(
            new_limbo
                .difference(&old_limbo)
                .cloned()
                .map(LimboDocumentChange::Added),
        );
        self.limbo_documents = new_limbo;
        changes
    }

    fn should_be_in_limbo(&self, document: &Document) -> bool {
        !self.synced_documents.contains(document.key()) && !document.has_local_mutations()
    }
}

// A locally modified document that just got its write acknowledged keeps
// showing the local version until the server sends the synced one.
fn should_wait_for_synced_document(old_doc: &Document, new_doc: &Document) -> bool {
    old_doc.has_local_mutations() && new_doc.has_committed_mutations() && !new_doc.has_local_mutations()
}
