use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde_json::{json, Value as JsonValue};

use crate::firestore::core::query::{Bound, FieldFilter, FilterOperator};
use crate::firestore::core::target::{Target, TargetData};
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{
    DatabaseId, Document, DocumentKey, FieldTransform, Mutation, MutationKind, MutationResult,
    Precondition, ResourcePath, SnapshotVersion, Timestamp, TransformOperation,
};
use crate::firestore::value::json::{
    decode_map_fields, decode_value, encode_map_fields, encode_timestamp, encode_value,
    parse_timestamp,
};
use crate::firestore::value::MapValue;

/// Converts between model types and the JSON frames exchanged on the Listen and
/// Write streams.
#[derive(Clone, Debug)]
pub struct JsonProtoSerializer {
    database_id: DatabaseId,
}

impl JsonProtoSerializer {
    pub fn new(database_id: DatabaseId) -> Self {
        Self { database_id }
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    pub fn database_name(&self) -> String {
        format!(
            "projects/{}/databases/{}",
            self.database_id.project_id(),
            self.database_id.database()
        )
    }

    fn documents_root(&self) -> String {
        format!("{}/documents", self.database_name())
    }

    pub fn document_name(&self, key: &DocumentKey) -> String {
        format!("{}/{}", self.documents_root(), key.path().canonical_string())
    }

    fn resource_name(&self, path: &ResourcePath) -> String {
        if path.is_empty() {
            self.documents_root()
        } else {
            format!("{}/{}", self.documents_root(), path.canonical_string())
        }
    }

    pub fn document_key_from_name(&self, name: &str) -> FirestoreResult<DocumentKey> {
        let root = self.documents_root();
        let relative = name
            .strip_prefix(&root)
            .and_then(|rest| rest.strip_prefix('/'))
            .ok_or_else(|| {
                invalid_argument(format!(
                    "Resource name '{name}' does not belong to database {}",
                    self.database_name()
                ))
            })?;
        DocumentKey::from_string(relative)
    }

    pub fn encode_version(&self, version: SnapshotVersion) -> String {
        encode_timestamp(&version.timestamp())
    }

    pub fn decode_version(&self, value: &str) -> FirestoreResult<SnapshotVersion> {
        Ok(SnapshotVersion::new(self.decode_timestamp_string(value)?))
    }

    pub fn decode_timestamp_string(&self, value: &str) -> FirestoreResult<Timestamp> {
        parse_timestamp(value)
    }

    pub fn encode_bytes(&self, bytes: &[u8]) -> String {
        BASE64_STANDARD.encode(bytes)
    }

    pub fn decode_bytes(&self, value: &str) -> FirestoreResult<Vec<u8>> {
        BASE64_STANDARD
            .decode(value)
            .map_err(|err| invalid_argument(format!("Invalid base64 payload: {err}")))
    }

    /// `{name, fields, createTime, updateTime}` as carried by `documentChange`.
    pub fn encode_document(&self, document: &Document) -> JsonValue {
        let mut encoded = json!({
            "name": self.document_name(document.key()),
            "fields": encode_map_fields(document.data()),
            "updateTime": self.encode_version(document.version()),
        });
        if !document.create_time().is_min() {
            encoded["createTime"] = json!(self.encode_version(document.create_time()));
        }
        encoded
    }

    pub fn decode_found_document(&self, value: &JsonValue) -> FirestoreResult<Document> {
        let name = value
            .get("name")
            .and_then(JsonValue::as_str)
            .ok_or_else(|| invalid_argument("Document missing name"))?;
        let key = self.document_key_from_name(name)?;
        let data = match value.get("fields") {
            Some(fields) => decode_map_fields(fields)?,
            None => MapValue::empty(),
        };
        let version = self.optional_version(value.get("updateTime"))?.ok_or_else(|| {
            invalid_argument(format!("Document {key} missing updateTime"))
        })?;
        let create_time = self
            .optional_version(value.get("createTime"))?
            .unwrap_or_else(SnapshotVersion::min);
        Ok(Document::new_found_with_create_time(key, version, create_time, data))
    }

    pub(crate) fn optional_version(&self, value: Option<&JsonValue>) -> FirestoreResult<Option<SnapshotVersion>> {
        value
            .and_then(JsonValue::as_str)
            .map(|text| self.decode_version(text))
            .transpose()
    }

    pub fn encode_mutation(&self, mutation: &Mutation) -> JsonValue {
        let name = self.document_name(mutation.key());
        let mut write = serde_json::Map::new();
        match mutation.kind() {
            MutationKind::Set { value } => {
                write.insert("update".into(), self.encode_fields_document(&name, value));
            }
            MutationKind::Patch { data, mask } => {
                write.insert("update".into(), self.encode_fields_document(&name, data));
                let paths: Vec<String> = mask.fields().map(|path| path.canonical_string()).collect();
                write.insert("updateMask".into(), json!({ "fieldPaths": paths }));
            }
            MutationKind::Delete => {
                write.insert("delete".into(), json!(name));
            }
            MutationKind::Verify => {
                write.insert("verify".into(), json!(name));
            }
        }
        if !mutation.field_transforms().is_empty() {
            let transforms = mutation
                .field_transforms()
                .iter()
                .map(encode_field_transform)
                .collect();
            write.insert("updateTransforms".into(), JsonValue::Array(transforms));
        }
        match mutation.precondition() {
            Precondition::None => {}
            Precondition::Exists(exists) => {
                write.insert("currentDocument".into(), json!({ "exists": exists }));
            }
            Precondition::UpdateTime(version) => {
                write.insert(
                    "currentDocument".into(),
                    json!({ "updateTime": self.encode_version(*version) }),
                );
            }
        }
        JsonValue::Object(write)
    }

    fn encode_fields_document(&self, name: &str, data: &MapValue) -> JsonValue {
        json!({
            "name": name,
            "fields": encode_map_fields(data),
        })
    }

    /// Decodes `writeResults`. A result without `updateTime` was a no-op write
    /// and takes the batch commit version.
    pub fn decode_write_results(
        &self,
        results: Option<&JsonValue>,
        commit_version: SnapshotVersion,
    ) -> FirestoreResult<Vec<MutationResult>> {
        let Some(results) = results.and_then(JsonValue::as_array) else {
            return Ok(Vec::new());
        };
        results
            .iter()
            .map(|result| {
                let version = self
                    .optional_version(result.get("updateTime"))?
                    .unwrap_or(commit_version);
                let transform_results = match result.get("transformResults").and_then(JsonValue::as_array) {
                    Some(values) => values.iter().map(decode_value).collect::<FirestoreResult<Vec<_>>>()?,
                    None => Vec::new(),
                };
                Ok(MutationResult::new(version, transform_results))
            })
            .collect()
    }

    /// The `addTarget` payload for a listen request.
    pub fn encode_target(&self, target_data: &TargetData) -> JsonValue {
        let target = &target_data.target;
        let mut encoded = serde_json::Map::new();
        encoded.insert("targetId".into(), json!(target_data.target_id));
        if target.is_document_target() {
            let name = self.resource_name(target.path());
            encoded.insert("documents".into(), json!({ "documents": [name] }));
        } else {
            encoded.insert("query".into(), self.encode_query_target(target));
        }

        if !target_data.resume_token.is_empty() {
            encoded.insert("resumeToken".into(), json!(self.encode_bytes(&target_data.resume_token)));
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".into(), json!(expected_count));
            }
        } else if !target_data.snapshot_version.is_min() {
            encoded.insert("readTime".into(), json!(self.encode_version(target_data.snapshot_version)));
            if let Some(expected_count) = target_data.expected_count {
                encoded.insert("expectedCount".into(), json!(expected_count));
            }
        }
        JsonValue::Object(encoded)
    }

    /// `{parent, structuredQuery}` for a collection or collection group target.
    pub fn encode_query_target(&self, target: &Target) -> JsonValue {
        let (parent, collection_id, all_descendants) = match target.collection_group() {
            Some(group) => (target.path().clone(), group.to_string(), true),
            None => (
                target.path().without_last(),
                target.collection_id().to_string(),
                false,
            ),
        };

        let mut structured = serde_json::Map::new();
        structured.insert(
            "from".into(),
            json!([{ "collectionId": collection_id, "allDescendants": all_descendants }]),
        );
        if !target.filters().is_empty() {
            structured.insert("where".into(), encode_filters(target.filters()));
        }
        if !target.order_by().is_empty() {
            let orders: Vec<JsonValue> = target
                .order_by()
                .iter()
                .map(|order| {
                    json!({
                        "field": { "fieldPath": order.field().canonical_string() },
                        "direction": order.direction().as_str(),
                    })
                })
                .collect();
            structured.insert("orderBy".into(), JsonValue::Array(orders));
        }
        if let Some(limit) = target.limit() {
            structured.insert("limit".into(), json!(limit));
        }
        if let Some(start) = target.start_at() {
            structured.insert("startAt".into(), encode_cursor(start, start.inclusive()));
        }
        if let Some(end) = target.end_at() {
            structured.insert("endAt".into(), encode_cursor(end, !end.inclusive()));
        }

        json!({
            "parent": self.resource_name(&parent),
            "structuredQuery": JsonValue::Object(structured),
        })
    }
}

fn encode_field_transform(transform: &FieldTransform) -> JsonValue {
    let field_path = transform.field_path().canonical_string();
    match transform.operation() {
        TransformOperation::ServerTimestamp => json!({
            "fieldPath": field_path,
            "setToServerValue": "REQUEST_TIME"
        }),
        TransformOperation::ArrayUnion(elements) => json!({
            "fieldPath": field_path,
            "appendMissingElements": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        TransformOperation::ArrayRemove(elements) => json!({
            "fieldPath": field_path,
            "removeAllFromArray": { "values": elements.iter().map(encode_value).collect::<Vec<_>>() }
        }),
        TransformOperation::NumericIncrement(operand) => json!({
            "fieldPath": field_path,
            "increment": encode_value(operand)
        }),
    }
}

fn encode_filters(filters: &[FieldFilter]) -> JsonValue {
    if let [filter] = filters {
        return encode_field_filter(filter);
    }
    let encoded: Vec<JsonValue> = filters.iter().map(encode_field_filter).collect();
    json!({
        "compositeFilter": {
            "op": "AND",
            "filters": encoded,
        }
    })
}

fn encode_field_filter(filter: &FieldFilter) -> JsonValue {
    let field = json!({ "fieldPath": filter.field().canonical_string() });
    let unary = match filter.operator() {
        FilterOperator::Equal if filter.value().is_null() => Some("IS_NULL"),
        FilterOperator::Equal if filter.value().is_nan() => Some("IS_NAN"),
        FilterOperator::NotEqual if filter.value().is_null() => Some("IS_NOT_NULL"),
        FilterOperator::NotEqual if filter.value().is_nan() => Some("IS_NOT_NAN"),
        _ => None,
    };
    match unary {
        Some(op) => json!({ "unaryFilter": { "field": field, "op": op } }),
        None => json!({
            "fieldFilter": {
                "field": field,
                "op": filter.operator().as_str(),
                "value": encode_value(filter.value()),
            }
        }),
    }
}

fn encode_cursor(bound: &Bound, before: bool) -> JsonValue {
    json!({
        "before": before,
        "values": bound.values().iter().map(encode_value).collect::<Vec<_>>(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::{OrderDirection, Query};
    use crate::firestore::core::target::TargetPurpose;
    use crate::firestore::model::{FieldMask, FieldPath};
    use crate::firestore::value::FirestoreValue;

    fn serializer() -> JsonProtoSerializer {
        JsonProtoSerializer::new(DatabaseId::new("p", "(default)"))
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    #[test]
    fn document_names_resolve_back_to_keys() {
        let serializer = serializer();
        let name = serializer.document_name(&key("rooms/a"));
        assert_eq!(name, "projects/p/databases/(default)/documents/rooms/a");
        assert_eq!(serializer.document_key_from_name(&name).unwrap(), key("rooms/a"));
        assert!(serializer
            .document_key_from_name("projects/other/databases/(default)/documents/rooms/a")
            .is_err());
    }

    #[test]
    fn patch_carries_mask_and_precondition() {
        let field = FieldPath::from_dot_separated("a").unwrap();
        let mut data = MapValue::empty();
        data.set(&field, FirestoreValue::from_integer(1));
        let mutation = Mutation::patch(key("rooms/a"), data, FieldMask::new([field]));

        let encoded = serializer().encode_mutation(&mutation);
        assert_eq!(encoded["updateMask"], json!({ "fieldPaths": ["a"] }));
        assert_eq!(encoded["currentDocument"], json!({ "exists": true }));
        assert_eq!(encoded["update"]["fields"]["a"], json!({ "integerValue": "1" }));
    }

    #[test]
    fn query_target_resumes_from_token() {
        let occupancy = FieldPath::from_dot_separated("occupancy").unwrap();
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(
                occupancy.clone(),
                FilterOperator::LessThan,
                FirestoreValue::from_integer(4),
            ))
            .order_by(occupancy, OrderDirection::Ascending)
            .limit(3);
        let target_data = TargetData::new(query.to_target(), 2, TargetPurpose::Listen, 1)
            .with_resume_token(vec![1, 2], SnapshotVersion::from_micros(10));

        let encoded = serializer().encode_target(&target_data);
        assert_eq!(encoded["targetId"], json!(2));
        assert_eq!(encoded["resumeToken"], json!("AQI="));
        let query = &encoded["query"];
        assert_eq!(query["parent"], json!("projects/p/databases/(default)/documents"));
        assert_eq!(query["structuredQuery"]["from"][0]["collectionId"], json!("rooms"));
        assert_eq!(query["structuredQuery"]["where"]["fieldFilter"]["op"], json!("LESS_THAN"));
        assert_eq!(query["structuredQuery"]["limit"], json!(3));
    }

    #[test]
    fn write_results_default_to_commit_version() {
        let serializer = serializer();
        let commit = SnapshotVersion::from_micros(5_000_000);
        let results = json!([
            { "updateTime": "1970-01-01T00:00:03Z" },
            {}
        ]);
        let decoded = serializer.decode_write_results(Some(&results), commit).unwrap();
        assert_eq!(decoded[0].version, SnapshotVersion::from_micros(3_000_000));
        assert_eq!(decoded[1].version, commit);
    }
}
