use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::target::TargetPurpose;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};

/// Everything one watch cycle changed, applied to the local store atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose existence filter did not match; their resume token must be
    /// dropped so the next listen starts from scratch.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: BTreeMap<DocumentKey, Document>,
    pub resolved_limbo_documents: BTreeSet<DocumentKey>,
}

impl RemoteEvent {
    /// Event for a target that the server marked current without any other
    /// change, used to synthesize a snapshot when going offline or for tests.
    pub fn synthesized_for_current_change(target_id: TargetId, current: bool, resume_token: Vec<u8>) -> Self {
        let mut target_changes = BTreeMap::new();
        target_changes.insert(target_id, TargetChange::synthesized(current, resume_token));
        Self {
            target_changes,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.document_updates.is_empty()
            && self.target_mismatches.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Per-target part of a [`RemoteEvent`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TargetChange {
    /// Empty when the cycle carried no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: BTreeSet<DocumentKey>,
    pub modified_documents: BTreeSet<DocumentKey>,
    pub removed_documents: BTreeSet<DocumentKey>,
}

impl TargetChange {
    pub fn synthesized(current: bool, resume_token: Vec<u8>) -> Self {
        Self {
            resume_token,
            current,
            ..Self::default()
        }
    }

    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
