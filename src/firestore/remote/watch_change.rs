use serde::Deserialize;
use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion, TargetId};
use crate::firestore::remote::serializer::JsonProtoSerializer;

/// One decoded frame of the Listen stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchChange {
    TargetChange(WatchTargetChange),
    Document(DocumentWatchChange),
    ExistenceFilter(ExistenceFilterChange),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchTargetChangeState {
    NoChange,
    Added,
    Removed,
    Current,
    Reset,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchTargetChange {
    pub state: WatchTargetChangeState,
    /// Empty means every target the stream currently listens to.
    pub target_ids: Vec<TargetId>,
    pub resume_token: Vec<u8>,
    /// Set when the server removed the targets because of an error.
    pub cause: Option<FirestoreError>,
}

/// A document that was added, updated, deleted or dropped from targets.
///
/// `new_doc` is a found document for `documentChange`, a no-document for
/// `documentDelete` and `None` for `documentRemove`.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentWatchChange {
    pub updated_target_ids: Vec<TargetId>,
    pub removed_target_ids: Vec<TargetId>,
    pub key: DocumentKey,
    pub new_doc: Option<Document>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceFilterChange {
    pub target_id: TargetId,
    pub existence_filter: ExistenceFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistenceFilter {
    pub count: i32,
    pub unchanged_names: Option<UnchangedNames>,
}

/// Raw bloom filter parameters as sent by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnchangedNames {
    pub bitmap: Vec<u8>,
    pub padding: u32,
    pub hash_count: i32,
}

#[derive(Debug, Deserialize)]
struct StatusCause {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: Option<String>,
}

pub fn decode_watch_change(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<Option<WatchChange>> {
    if let Some(target_change) = value.get("targetChange") {
        return decode_target_change(serializer, target_change).map(Some);
    }
    if let Some(document_change) = value.get("documentChange") {
        return decode_document_change(serializer, document_change).map(Some);
    }
    if let Some(document_delete) = value.get("documentDelete") {
        return decode_document_delete(serializer, document_delete).map(Some);
    }
    if let Some(document_remove) = value.get("documentRemove") {
        return decode_document_remove(serializer, document_remove).map(Some);
    }
    if let Some(filter) = value.get("filter") {
        return decode_filter(serializer, filter).map(Some);
    }
    Ok(None)
}

/// The global snapshot version a listen response carries. Only target changes
/// that name no targets advance it.
pub fn snapshot_version_from_listen_response(
    serializer: &JsonProtoSerializer,
    value: &JsonValue,
) -> FirestoreResult<SnapshotVersion> {
    let Some(target_change) = value.get("targetChange") else {
        return Ok(SnapshotVersion::min());
    };
    if !numeric_array(target_change.get("targetIds")).is_empty() {
        return Ok(SnapshotVersion::min());
    }
    Ok(serializer
        .optional_version(target_change.get("readTime"))?
        .unwrap_or_else(SnapshotVersion::min))
}

fn decode_target_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let state = match value.get("targetChangeType").and_then(JsonValue::as_str) {
        None | Some("NO_CHANGE") => WatchTargetChangeState::NoChange,
        Some("ADD") => WatchTargetChangeState::Added,
        Some("REMOVE") => WatchTargetChangeState::Removed,
        Some("CURRENT") => WatchTargetChangeState::Current,
        Some("RESET") => WatchTargetChangeState::Reset,
        Some(other) => return Err(invalid_argument(format!("Unknown target change type: {other}"))),
    };
    let resume_token = match value.get("resumeToken").and_then(JsonValue::as_str) {
        Some(token) => serializer.decode_bytes(token)?,
        None => Vec::new(),
    };
    let cause = value
        .get("cause")
        .map(|cause| serde_json::from_value::<StatusCause>(cause.clone()))
        .transpose()
        .map_err(|err| invalid_argument(format!("Failed to decode watch cause: {err}")))?
        .map(|cause| {
            FirestoreError::new(
                FirestoreErrorCode::from_rpc_code(cause.code),
                cause.message.unwrap_or_default(),
            )
        });
    Ok(WatchChange::TargetChange(WatchTargetChange {
        state,
        target_ids: numeric_array(value.get("targetIds")),
        resume_token,
        cause,
    }))
}

fn decode_document_change(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let document = value
        .get("document")
        .ok_or_else(|| invalid_argument("documentChange missing document"))?;
    let document = serializer.decode_found_document(document)?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: numeric_array(value.get("targetIds")),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key: document.key().clone(),
        new_doc: Some(document),
    }))
}

fn decode_document_delete(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentDelete")?;
    let read_time = serializer
        .optional_version(value.get("readTime"))?
        .unwrap_or_else(SnapshotVersion::min);
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        new_doc: Some(Document::new_no_document(key.clone(), read_time)),
        key,
    }))
}

fn decode_document_remove(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let key = document_key(serializer, value, "documentRemove")?;
    Ok(WatchChange::Document(DocumentWatchChange {
        updated_target_ids: Vec::new(),
        removed_target_ids: numeric_array(value.get("removedTargetIds")),
        key,
        new_doc: None,
    }))
}

fn decode_filter(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<WatchChange> {
    let target_id = value
        .get("targetId")
        .and_then(JsonValue::as_i64)
        .ok_or_else(|| invalid_argument("filter missing targetId"))? as TargetId;
    let count = value.get("count").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    let unchanged_names = value
        .get("unchangedNames")
        .map(|names| decode_unchanged_names(serializer, names))
        .transpose()?;
    Ok(WatchChange::ExistenceFilter(ExistenceFilterChange {
        target_id,
        existence_filter: ExistenceFilter { count, unchanged_names },
    }))
}

fn decode_unchanged_names(serializer: &JsonProtoSerializer, value: &JsonValue) -> FirestoreResult<UnchangedNames> {
    let bits = value.get("bits");
    let bitmap = match bits.and_then(|bits| bits.get("bitmap")).and_then(JsonValue::as_str) {
        Some(bitmap) => serializer.decode_bytes(bitmap)?,
        None => Vec::new(),
    };
    let padding = bits
        .and_then(|bits| bits.get("padding"))
        .and_then(JsonValue::as_u64)
        .unwrap_or(0) as u32;
    let hash_count = value.get("hashCount").and_then(JsonValue::as_i64).unwrap_or(0) as i32;
    Ok(UnchangedNames {
        bitmap,
        padding,
        hash_count,
    })
}

fn document_key(serializer: &JsonProtoSerializer, value: &JsonValue, frame: &str) -> FirestoreResult<DocumentKey> {
    let name = value
        .get("document")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| invalid_argument(format!("{frame} missing document")))?;
    serializer.document_key_from_name(name)
}

fn numeric_array(value: Option<&JsonValue>) -> Vec<TargetId> {
    value
        .and_then(JsonValue::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| entry.as_i64().map(|value| value as TargetId))
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::DatabaseId;
    use serde_json::json;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    #[test]
    fn decodes_target_change_with_cause() {
        let frame = json!({
            "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            }
        });
        let Some(WatchChange::TargetChange(change)) = decode_watch_change(&serializer(), &frame).unwrap() else {
            panic!("expected a target change");
        };
        assert_eq!(change.state, WatchTargetChangeState::Removed);
        assert_eq!(change.target_ids, vec![2]);
        assert_eq!(change.cause.unwrap().code, FirestoreErrorCode::PermissionDenied);
    }

    #[test]
    fn document_delete_becomes_a_tombstone_at_read_time() {
        let frame = json!({
            "documentDelete": {
                "document": "projects/p/databases/(default)/documents/rooms/a",
                "removedTargetIds": [2],
                "readTime": "1970-01-01T00:00:01Z"
            }
        });
        let Some(WatchChange::Document(change)) = decode_watch_change(&serializer(), &frame).unwrap() else {
            panic!("expected a document change");
        };
        let tombstone = change.new_doc.unwrap();
        assert!(tombstone.is_no_document());
        assert_eq!(tombstone.version(), SnapshotVersion::from_micros(1_000_000));
        assert_eq!(change.removed_target_ids, vec![2]);
    }

    #[test]
    fn decodes_filter_with_bloom_parameters() {
        let frame = json!({
            "filter": {
                "targetId": 4,
                "count": 1,
                "unchangedNames": { "bits": { "bitmap": "AQI=", "padding": 3 }, "hashCount": 2 }
            }
        });
        let Some(WatchChange::ExistenceFilter(change)) = decode_watch_change(&serializer(), &frame).unwrap() else {
            panic!("expected an existence filter");
        };
        assert_eq!(change.target_id, 4);
        assert_eq!(
            change.existence_filter.unchanged_names,
            Some(UnchangedNames {
                bitmap: vec![1, 2],
                padding: 3,
                hash_count: 2
            })
        );
    }

    #[test]
    fn only_global_target_changes_carry_a_snapshot_version() {
        let serializer = serializer();
        let global = json!({ "targetChange": { "readTime": "1970-01-01T00:00:02Z" } });
        let scoped = json!({ "targetChange": { "targetIds": [2], "readTime": "1970-01-01T00:00:02Z" } });
        assert_eq!(
            snapshot_version_from_listen_response(&serializer, &global).unwrap(),
            SnapshotVersion::from_micros(2_000_000)
        );
        assert!(snapshot_version_from_listen_response(&serializer, &scoped).unwrap().is_min());
    }
}
