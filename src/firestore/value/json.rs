//! Firestore REST JSON encoding of values, shared by the wire serializer and the
//! persisted records.

use std::collections::BTreeMap;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde_json::{json, Value as JsonValue};

use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{BytesValue, FirestoreValue, MapValue, ValueKind};

pub fn encode_map_fields(map: &MapValue) -> JsonValue {
    let mut fields = serde_json::Map::new();
    for (key, value) in map.fields() {
        fields.insert(key.clone(), encode_value(value));
    }
    JsonValue::Object(fields)
}

pub fn encode_value(value: &FirestoreValue) -> JsonValue {
    match value.kind() {
        ValueKind::Null => json!({ "nullValue": JsonValue::Null }),
        ValueKind::Boolean(boolean) => json!({ "booleanValue": boolean }),
        ValueKind::Integer(integer) => json!({ "integerValue": integer.to_string() }),
        ValueKind::Double(double) => json!({ "doubleValue": encode_double(*double) }),
        ValueKind::Timestamp(timestamp) => json!({ "timestampValue": encode_timestamp(timestamp) }),
        ValueKind::String(string) => json!({ "stringValue": string }),
        ValueKind::Bytes(bytes) => {
            json!({ "bytesValue": BASE64_STANDARD.encode(bytes.as_slice()) })
        }
        ValueKind::Reference(reference) => json!({ "referenceValue": reference }),
        ValueKind::GeoPoint(point) => json!({
            "geoPointValue": {
                "latitude": point.latitude(),
                "longitude": point.longitude(),
            }
        }),
        ValueKind::Array(array) => {
            let values = array.values().iter().map(encode_value).collect::<Vec<_>>();
            json!({ "arrayValue": { "values": values } })
        }
        ValueKind::Map(map) => json!({
            "mapValue": {
                "fields": encode_map_fields(map)
            }
        }),
    }
}

// Non-finite doubles have no JSON number form; proto3 JSON spells them as strings.
fn encode_double(value: f64) -> JsonValue {
    if value.is_nan() {
        JsonValue::String("NaN".into())
    } else if value.is_infinite() {
        let text = if value > 0.0 { "Infinity" } else { "-Infinity" };
        JsonValue::String(text.into())
    } else {
        json!(value)
    }
}

/// Decodes `{"fields": {...}}` (or an absent `fields` key) into a map.
pub fn decode_map_value(value: &JsonValue) -> FirestoreResult<MapValue> {
    let map = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected object for map value"))?;
    match map.get("fields") {
        Some(fields_value) => decode_map_fields(fields_value),
        None => Ok(MapValue::empty()),
    }
}

/// Decodes a bare `{name: value}` object.
pub fn decode_map_fields(value: &JsonValue) -> FirestoreResult<MapValue> {
    let fields_object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected 'fields' to be an object"))?;
    let mut fields = BTreeMap::new();
    for (key, value) in fields_object {
        fields.insert(key.clone(), decode_value(value)?);
    }
    Ok(MapValue::new(fields))
}

pub fn decode_value(value: &JsonValue) -> FirestoreResult<FirestoreValue> {
    let object = value
        .as_object()
        .ok_or_else(|| invalid_argument("Expected Firestore value object"))?;
    if object.contains_key("nullValue") {
        return Ok(FirestoreValue::null());
    }
    if let Some(bool_value) = object.get("booleanValue") {
        let value = bool_value
            .as_bool()
            .ok_or_else(|| invalid_argument("booleanValue must be bool"))?;
        return Ok(FirestoreValue::from_bool(value));
    }
    if let Some(integer_value) = object.get("integerValue") {
        let parsed = match integer_value {
            JsonValue::String(value) => i64::from_str(value)
                .map_err(|err| invalid_argument(format!("Invalid integerValue: {err}")))?,
            JsonValue::Number(number) => number
                .as_i64()
                .ok_or_else(|| invalid_argument("Integer out of range"))?,
            _ => return Err(invalid_argument("integerValue must be a string or number")),
        };
        return Ok(FirestoreValue::from_integer(parsed));
    }
    if let Some(double_value) = object.get("doubleValue") {
        let parsed = match double_value {
            JsonValue::Number(number) => number
                .as_f64()
                .ok_or_else(|| invalid_argument("Invalid doubleValue"))?,
            JsonValue::String(value) => value
                .parse::<f64>()
                .map_err(|err| invalid_argument(format!("Invalid doubleValue: {err}")))?,
            _ => return Err(invalid_argument("doubleValue must be a number or string")),
        };
        return Ok(FirestoreValue::from_double(parsed));
    }
    if let Some(timestamp_value) = object.get("timestampValue") {
        let timestamp_str = timestamp_value
            .as_str()
            .ok_or_else(|| invalid_argument("timestampValue must be string"))?;
        return Ok(FirestoreValue::from_timestamp(parse_timestamp(
            timestamp_str,
        )?));
    }
    if let Some(string_value) = object.get("stringValue") {
        let str_value = string_value
            .as_str()
            .ok_or_else(|| invalid_argument("stringValue must be string"))?;
        return Ok(FirestoreValue::from_string(str_value));
    }
    if let Some(bytes_value) = object.get("bytesValue") {
        let str_value = bytes_value
            .as_str()
            .ok_or_else(|| invalid_argument("bytesValue must be base64 string"))?;
        let decoded = BASE64_STANDARD
            .decode(str_value)
            .map_err(|err| invalid_argument(format!("Invalid bytesValue: {err}")))?;
        return Ok(FirestoreValue::from_bytes(BytesValue::from(decoded)));
    }
    if let Some(reference_value) = object.get("referenceValue") {
        let str_value = reference_value
            .as_str()
            .ok_or_else(|| invalid_argument("referenceValue must be string"))?;
        return Ok(FirestoreValue::from_reference(str_value));
    }
    if let Some(geo_point) = object.get("geoPointValue") {
        let latitude = geo_point
            .get("latitude")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);
        let longitude = geo_point
            .get("longitude")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);
        return Ok(FirestoreValue::from_geo_point(GeoPoint::new(
            latitude, longitude,
        )?));
    }
    if let Some(array_value) = object.get("arrayValue") {
        let decoded = match array_value.get("values").and_then(JsonValue::as_array) {
            Some(entries) => entries
                .iter()
                .map(decode_value)
                .collect::<FirestoreResult<Vec<_>>>()?,
            None => Vec::new(),
        };
        return Ok(FirestoreValue::from_array(decoded));
    }
    if let Some(map_value) = object.get("mapValue") {
        return Ok(FirestoreValue::from_map_value(decode_map_value(map_value)?));
    }

    Err(invalid_argument("Unknown Firestore value type"))
}

pub fn encode_timestamp(timestamp: &Timestamp) -> String {
    Utc.timestamp_opt(timestamp.seconds, timestamp.nanos as u32)
        .single()
        .unwrap_or_default()
        .to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub fn parse_timestamp(value: &str) -> FirestoreResult<Timestamp> {
    let datetime = DateTime::parse_from_rfc3339(value)
        .map_err(|err| invalid_argument(format!("Invalid timestamp: {err}")))?;
    let datetime_utc = datetime.with_timezone(&Utc);
    Ok(Timestamp::new(
        datetime_utc.timestamp(),
        datetime_utc.timestamp_subsec_nanos() as i32,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_nested_map() {
        let mut inner = BTreeMap::new();
        inner.insert("flag".to_string(), FirestoreValue::from_bool(true));
        let mut fields = BTreeMap::new();
        fields.insert("name".to_string(), FirestoreValue::from_string("Ada"));
        fields.insert("age".to_string(), FirestoreValue::from_integer(42));
        fields.insert("nested".to_string(), FirestoreValue::from_map(inner));
        let map = MapValue::new(fields);

        let encoded = json!({ "fields": encode_map_fields(&map) });
        let decoded = decode_map_value(&encoded).unwrap();
        assert_eq!(decoded, map);
    }

    #[test]
    fn non_finite_doubles_use_strings() {
        let encoded = encode_value(&FirestoreValue::from_double(f64::NAN));
        assert_eq!(encoded, json!({ "doubleValue": "NaN" }));
        let decoded = decode_value(&encoded).unwrap();
        assert!(decoded.is_nan());

        let encoded = encode_value(&FirestoreValue::from_double(f64::NEG_INFINITY));
        let decoded = decode_value(&encoded).unwrap();
        assert_eq!(decoded, FirestoreValue::from_double(f64::NEG_INFINITY));
    }

    #[test]
    fn timestamps_use_rfc3339() {
        let ts = Timestamp::new(1, 5);
        let encoded = encode_timestamp(&ts);
        assert_eq!(encoded, "1970-01-01T00:00:01.000000005Z");
        assert_eq!(parse_timestamp(&encoded).unwrap(), ts);
    }

    #[test]
    fn rejects_unknown_value_type() {
        let err = decode_value(&json!({ "mystery": 1 })).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }
}
