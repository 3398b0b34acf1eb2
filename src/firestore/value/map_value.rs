use std::collections::BTreeMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::firestore::model::FieldPath;
use crate::firestore::value::{json, FirestoreValue, ValueKind};

/// Field map of a document or of a nested map value. Nested access goes through
/// [`FieldPath`]s.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct MapValue {
    fields: BTreeMap<String, FirestoreValue>,
}

impl MapValue {
    pub fn new(fields: BTreeMap<String, FirestoreValue>) -> Self {
        Self { fields }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn fields(&self) -> &BTreeMap<String, FirestoreValue> {
        &self.fields
    }

    pub fn into_fields(self) -> BTreeMap<String, FirestoreValue> {
        self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&FirestoreValue> {
        self.fields.get(name)
    }

    /// Value at `path`, or `None` when any segment is missing or not a map.
    pub fn field(&self, path: &FieldPath) -> Option<&FirestoreValue> {
        let (last, parents) = path.segments().split_last()?;
        let mut current = &self.fields;
        for segment in parents {
            match current.get(segment).map(FirestoreValue::kind) {
                Some(ValueKind::Map(child)) => current = &child.fields,
                _ => return None,
            }
        }
        current.get(last)
    }

    /// Writes `value` at `path`, replacing non-map intermediate values with maps.
    pub fn set(&mut self, path: &FieldPath, value: FirestoreValue) {
        set_at_segments(&mut self.fields, path.segments(), value);
    }

    /// Removes the leaf at `path`. Parent maps are left in place even when they
    /// become empty.
    pub fn delete(&mut self, path: &FieldPath) {
        delete_at_segments(&mut self.fields, path.segments());
    }

    /// Applies a batch of sets (`Some`) and deletes (`None`).
    pub fn set_all<I>(&mut self, updates: I)
    where
        I: IntoIterator<Item = (FieldPath, Option<FirestoreValue>)>,
    {
        for (path, value) in updates {
            match value {
                Some(value) => self.set(&path, value),
                None => self.delete(&path),
            }
        }
    }

    /// Leaf paths of this map. Empty nested maps count as leaves.
    pub fn field_paths(&self) -> Vec<FieldPath> {
        let mut paths = Vec::new();
        collect_leaf_paths(&self.fields, &mut Vec::new(), &mut paths);
        paths
    }
}

fn set_at_segments(
    fields: &mut BTreeMap<String, FirestoreValue>,
    segments: &[String],
    value: FirestoreValue,
) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.insert(first.clone(), value);
        return;
    }

    let entry = fields
        .entry(first.clone())
        .or_insert_with(|| FirestoreValue::from_map_value(MapValue::empty()));
    if !matches!(entry.kind(), ValueKind::Map(_)) {
        *entry = FirestoreValue::from_map_value(MapValue::empty());
    }
    if let ValueKind::Map(child) = entry.kind_mut() {
        set_at_segments(&mut child.fields, rest, value);
    }
}

fn delete_at_segments(fields: &mut BTreeMap<String, FirestoreValue>, segments: &[String]) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };
    if rest.is_empty() {
        fields.remove(first);
        return;
    }
    if let Some(ValueKind::Map(child)) = fields.get_mut(first).map(FirestoreValue::kind_mut) {
        delete_at_segments(&mut child.fields, rest);
    }
}

fn collect_leaf_paths(
    fields: &BTreeMap<String, FirestoreValue>,
    prefix: &mut Vec<String>,
    out: &mut Vec<FieldPath>,
) {
    for (name, value) in fields {
        prefix.push(name.clone());
        match value.kind() {
            ValueKind::Map(child) if !child.is_empty() => {
                collect_leaf_paths(&child.fields, prefix, out)
            }
            _ => {
                if let Ok(path) = FieldPath::new(prefix.iter().cloned()) {
                    out.push(path);
                }
            }
        }
        prefix.pop();
    }
}

impl Serialize for MapValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        json::encode_map_fields(self).serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MapValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = serde_json::Value::deserialize(deserializer)?;
        json::decode_map_fields(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn path(raw: &str) -> FieldPath {
        FieldPath::from_dot_separated(raw).unwrap()
    }

    #[test]
    fn stores_map_entries() {
        let mut map = BTreeMap::new();
        map.insert("foo".to_string(), FirestoreValue::from_integer(1));
        let value = MapValue::new(map.clone());
        assert_eq!(value.fields().get("foo"), map.get("foo"));
    }

    #[test]
    fn set_creates_intermediate_maps() {
        let mut map = MapValue::empty();
        map.set(&path("a"), FirestoreValue::from_integer(1));
        map.set(&path("a.b.c"), FirestoreValue::from_bool(true));
        assert_eq!(
            map.field(&path("a.b.c")),
            Some(&FirestoreValue::from_bool(true))
        );
        assert_eq!(map.field_paths(), vec![path("a.b.c")]);
    }

    #[test]
    fn delete_keeps_empty_parent() {
        let mut map = MapValue::empty();
        map.set(&path("foo.bar"), FirestoreValue::from_integer(1));
        map.delete(&path("foo.bar"));
        assert_eq!(
            map.field(&path("foo")),
            Some(&FirestoreValue::from_map_value(MapValue::empty()))
        );
        assert!(map.field(&path("foo.bar")).is_none());
    }

    #[test]
    fn set_all_mixes_sets_and_deletes() {
        let mut map = MapValue::empty();
        map.set(&path("keep"), FirestoreValue::from_integer(1));
        map.set(&path("drop"), FirestoreValue::from_integer(2));
        map.set_all(vec![
            (path("drop"), None),
            (path("new"), Some(FirestoreValue::from_string("x"))),
        ]);
        assert_eq!(map.field_paths(), vec![path("keep"), path("new")]);
    }

    #[test]
    fn serde_uses_rest_field_encoding() {
        let mut map = MapValue::empty();
        map.set(&path("n"), FirestoreValue::from_integer(3));
        let encoded = serde_json::to_value(&map).unwrap();
        assert_eq!(encoded, serde_json::json!({ "n": { "integerValue": "3" } }));
        let decoded: MapValue = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, map);
    }
}
