use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::firestore::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, FieldMask, Mutation,
    MutationResult, SnapshotVersion, Timestamp,
};
use crate::util::hard_assert;

/// Mutations written together by one `write` call. Applied atomically.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Coerced base values for non-idempotent transforms, applied before `mutations`.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

/// A document in the local view together with the fields pending writes touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    /// `None` when the document was fully replaced by local writes.
    pub mutated_fields: Option<FieldMask>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        for (mutation, mutation_result) in self.mutations.iter().zip(result.mutation_results.iter()) {
            if mutation.key() == document.key() {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if mutation.key() == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch to every document it touches and returns the resulting
    /// overlay per key. Keys in `without_remote_version` only exist locally, so
    /// their overlay is a full set or delete instead of a patch.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        without_remote_version: &BTreeSet<DocumentKey>,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let Some(overlayed) = documents.get_mut(mutation.key()) else {
                continue;
            };
            let mutated = self.apply_to_local_view(
                &mut overlayed.document,
                overlayed.mutated_fields.take(),
            );
            let mutated = if without_remote_version.contains(mutation.key()) {
                None
            } else {
                mutated
            };
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mutated.as_ref()) {
                overlays.insert(mutation.key().clone(), overlay);
            }
            overlayed.mutated_fields = mutated;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }

    pub fn keys(&self) -> BTreeSet<DocumentKey> {
        self.mutations.iter().map(|m| m.key().clone()).collect()
    }
}

/// Server acknowledgement of a whole batch.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each touched document reached with this batch.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> Self {
        hard_assert(
            batch.mutations.len() == mutation_results.len(),
            "mutations sent and results received should have the same length",
        );
        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key().clone(), result.version))
            .collect();
        Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        }
    }
}

/// Net effect of every pending batch on one document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    pub largest_batch_id: BatchId,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: BatchId, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{FieldPath, FieldTransform, TransformOperation};
    use crate::firestore::value::{FirestoreValue, MapValue};

    fn key() -> DocumentKey {
        DocumentKey::from_string("counters/c").unwrap()
    }

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn applying_batch_with_base_mutation_twice_is_idempotent() {
        let mut base_value = MapValue::empty();
        base_value.set(&path("n"), FirestoreValue::from_integer(10));
        let base = Mutation::patch(key(), base_value, FieldMask::new([path("n")]));
        let increment = Mutation::patch(key(), MapValue::empty(), FieldMask::empty()).with_transforms(vec![
            FieldTransform::new(
                path("n"),
                TransformOperation::NumericIncrement(FirestoreValue::from_integer(1)),
            ),
        ]);
        let batch = MutationBatch::new(1, Timestamp::new(1, 0), vec![base], vec![increment]);

        let mut data = MapValue::empty();
        data.set(&path("n"), FirestoreValue::from_integer(10));
        let mut once = Document::new_found(key(), SnapshotVersion::from_micros(1), data);
        batch.apply_to_local_view(&mut once, Some(FieldMask::empty()));
        let mut twice = once.clone();
        batch.apply_to_local_view(&mut twice, Some(FieldMask::empty()));

        assert_eq!(once.field(&path("n")), Some(&FirestoreValue::from_integer(11)));
        assert_eq!(once.data(), twice.data());
    }

    #[test]
    fn batch_result_maps_versions_per_key() {
        let batch = MutationBatch::new(
            7,
            Timestamp::new(1, 0),
            vec![],
            vec![Mutation::delete(key())],
        );
        let version = SnapshotVersion::from_micros(5);
        let result = MutationBatchResult::from(
            batch,
            version,
            vec![MutationResult::new(version, vec![])],
            vec![1],
        );
        assert_eq!(result.doc_versions.get(&key()), Some(&version));
    }
}
