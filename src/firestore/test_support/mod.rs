//! Builders shared by unit tests.

use crate::firestore::core::query::Query;
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath, SnapshotVersion};
use crate::firestore::value::{FirestoreValue, MapValue};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).unwrap()
}

pub fn map(fields: &[(&str, i64)]) -> MapValue {
    let mut data = MapValue::empty();
    for (name, value) in fields {
        data.set(&field(name), FirestoreValue::from_integer(*value));
    }
    data
}

pub fn version(micros: i64) -> SnapshotVersion {
    SnapshotVersion::from_micros(micros)
}

/// Found document at `path` with integer fields.
pub fn doc(path: &str, micros: i64, fields: &[(&str, i64)]) -> Document {
    Document::new_found(key(path), version(micros), map(fields))
}

pub fn deleted_doc(path: &str, micros: i64) -> Document {
    Document::new_no_document(key(path), version(micros))
}

pub fn query(path: &str) -> Query {
    Query::collection(ResourcePath::from_string(path).unwrap())
}
