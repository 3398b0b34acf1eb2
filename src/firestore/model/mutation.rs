use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};
use crate::util::hard_assert;

/// Set of field paths touched by a patch, or accumulated while folding batches.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new<I>(fields: I) -> Self
    where
        I: IntoIterator<Item = FieldPath>,
    {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> impl Iterator<Item = &FieldPath> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `path` or one of its parents is part of the mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with<'a, I>(mut self, other: I) -> Self
    where
        I: IntoIterator<Item = &'a FieldPath>,
    {
        self.fields.extend(other.into_iter().cloned());
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldTransform {
    field_path: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field_path: FieldPath, operation: TransformOperation) -> Self {
        Self {
            field_path,
            operation,
        }
    }

    pub fn field_path(&self) -> &FieldPath {
        &self.field_path
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }

    /// Value the transform is computed against. Only increments need one; the
    /// coerced value is persisted as a base mutation so replays stay idempotent.
    fn base_value(&self, previous: Option<&FirestoreValue>) -> Option<FirestoreValue> {
        match self.operation {
            TransformOperation::NumericIncrement(_) => Some(match previous {
                Some(value) if value.is_number() => value.clone(),
                _ => FirestoreValue::from_integer(0),
            }),
            _ => None,
        }
    }

    fn apply_to_local_view(
        &self,
        previous: Option<&FirestoreValue>,
        local_write_time: Timestamp,
    ) -> FirestoreValue {
        match &self.operation {
            TransformOperation::ServerTimestamp => FirestoreValue::from_timestamp(local_write_time),
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            TransformOperation::NumericIncrement(operand) => {
                let base = self
                    .base_value(previous)
                    .unwrap_or_else(|| FirestoreValue::from_integer(0));
                numeric_increment(&base, operand)
            }
        }
    }

    fn apply_to_remote_document(
        &self,
        previous: Option<&FirestoreValue>,
        server_result: &FirestoreValue,
    ) -> FirestoreValue {
        match &self.operation {
            // Array transforms come back as null; compute them like the local view does.
            TransformOperation::ArrayUnion(elements) => array_union(previous, elements),
            TransformOperation::ArrayRemove(elements) => array_remove(previous, elements),
            _ => server_result.clone(),
        }
    }
}

fn array_union(existing: Option<&FirestoreValue>, additions: &[FirestoreValue]) -> FirestoreValue {
    let mut values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    for element in additions {
        if !values.iter().any(|candidate| candidate == element) {
            values.push(element.clone());
        }
    }

    FirestoreValue::from_array(values)
}

fn array_remove(existing: Option<&FirestoreValue>, removals: &[FirestoreValue]) -> FirestoreValue {
    let values = existing
        .and_then(FirestoreValue::as_array)
        .map(|array| array.values().to_vec())
        .unwrap_or_default();

    let filtered: Vec<FirestoreValue> = values
        .into_iter()
        .filter(|candidate| !removals.iter().any(|needle| needle == candidate))
        .collect();

    FirestoreValue::from_array(filtered)
}

fn numeric_increment(base: &FirestoreValue, operand: &FirestoreValue) -> FirestoreValue {
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(current), ValueKind::Integer(delta)) => {
            FirestoreValue::from_integer(current.saturating_add(*delta))
        }
        _ => {
            let sum = base.as_f64().unwrap_or(0.0) + operand.as_f64().unwrap_or(0.0);
            FirestoreValue::from_double(sum)
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum MutationKind {
    /// Replaces the whole document.
    Set { value: MapValue },
    /// Updates only the fields in `mask`; masked fields missing from `data` are deleted.
    Patch { data: MapValue, mask: FieldMask },
    Delete,
    /// Checks the precondition without writing.
    Verify,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Server outcome for one mutation of an acknowledged batch.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion, transform_results: Vec<FirestoreValue>) -> Self {
        Self {
            version,
            transform_results,
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self {
            key,
            kind: MutationKind::Set { value },
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn patch(key: DocumentKey, data: MapValue, mask: FieldMask) -> Self {
        Self {
            key,
            kind: MutationKind::Patch { data, mask },
            precondition: Precondition::Exists(true),
            field_transforms: Vec::new(),
        }
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self {
            key,
            kind: MutationKind::Delete,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn verify(key: DocumentKey, precondition: Precondition) -> Self {
        Self {
            key,
            kind: MutationKind::Verify,
            precondition,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transforms(mut self, transforms: Vec<FieldTransform>) -> Self {
        self.field_transforms = transforms;
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    /// Fields a patch writes. `None` for mutations that replace the whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(mask.clone()),
            _ => None,
        }
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Applies the server-acknowledged result of this mutation to `document`.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        self.verify_key_matches(document);
        match &self.kind {
            MutationKind::Set { value } => {
                let mut new_data = value.clone();
                new_data.set_all(self.server_transform_results(document, result));
                document
                    .convert_to_found(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { .. } => {
                if !self.precondition.is_valid_for(document) {
                    // The backend accepted the write, so the cached base is stale.
                    document.convert_to_unknown(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, result);
                let mut new_data = document.data().clone();
                new_data.set_all(self.patch_values());
                new_data.set_all(transform_results);
                document
                    .convert_to_found(result.version, new_data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
            MutationKind::Verify => {}
        }
    }

    /// Applies this mutation to the local view of `document`. Returns the fields
    /// changed so far: `None` means the whole document was replaced. A failed
    /// precondition leaves the document alone and returns `previous_mask`.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        self.verify_key_matches(document);
        match &self.kind {
            MutationKind::Set { value } => {
                if !self.precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let mut new_data = value.clone();
                new_data.set_all(self.local_transform_results(document, local_write_time));
                let version = document.version();
                document
                    .convert_to_found(version, new_data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { mask, .. } => {
                if !self.precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let transform_results = self.local_transform_results(document, local_write_time);
                let mut new_data = document.data().clone();
                new_data.set_all(self.patch_values());
                new_data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found(version, new_data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields())
                        .union_with(self.field_transforms.iter().map(FieldTransform::field_path))
                })
            }
            MutationKind::Delete => {
                if !self.precondition.is_valid_for(document) {
                    return previous_mask;
                }
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Verify => previous_mask,
        }
    }

    fn verify_key_matches(&self, document: &Document) {
        hard_assert(
            document.key() == &self.key,
            "Can only apply a mutation to a document with the same key",
        );
    }

    fn patch_values(&self) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        match &self.kind {
            MutationKind::Patch { data, mask } => mask
                .fields()
                .map(|path| (path.clone(), data.field(path).cloned()))
                .collect(),
            _ => Vec::new(),
        }
    }

    fn local_transform_results(
        &self,
        document: &Document,
        local_write_time: Timestamp,
    ) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(transform.field_path());
                let value = transform.apply_to_local_view(previous, local_write_time);
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &Document,
        result: &MutationResult,
    ) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        hard_assert(
            self.field_transforms.len() == result.transform_results.len(),
            "server transform result count should match the transform count",
        );
        self.field_transforms
            .iter()
            .zip(result.transform_results.iter())
            .map(|(transform, server_result)| {
                let previous = document.field(transform.field_path());
                let value = transform.apply_to_remote_document(previous, server_result);
                (transform.field_path().clone(), Some(value))
            })
            .collect()
    }
}

/// Coerced base values of non-idempotent transforms in `mutation`, read from
/// `document`. `None` when the mutation has no such transform.
pub fn extract_transform_base_value(mutation: &Mutation, document: &Document) -> Option<MapValue> {
    let mut base: Option<MapValue> = None;
    for transform in mutation.field_transforms() {
        let existing = document.field(transform.field_path());
        if let Some(coerced) = transform.base_value(existing) {
            base.get_or_insert_with(MapValue::empty)
                .set(transform.field_path(), coerced);
        }
    }
    base
}

/// Single mutation equivalent to every local write folded into `document`.
/// `mask` is the accumulated field mask (`None` for a full overwrite).
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() || mask.is_some_and(FieldMask::is_empty) {
        return None;
    }

    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data().clone())
        });
    };

    let data = document.data();
    let mut patch_value = MapValue::empty();
    let mut mask_set: BTreeSet<FieldPath> = BTreeSet::new();
    for field in mask.fields() {
        if mask_set.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = data.field(&path);
        // A deleted nested field still leaves its parent map behind, so patch the parent.
        if value.is_none() {
            if let Some(parent) = path.parent() {
                value = data.field(&parent);
                path = parent;
            }
        }
        match value {
            Some(value) => patch_value.set(&path, value.clone()),
            None => patch_value.delete(&path),
        }
        mask_set.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch_value, FieldMask::new(mask_set))
            .with_precondition(Precondition::None),
    )
}
