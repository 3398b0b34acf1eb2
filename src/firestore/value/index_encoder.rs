//! Order-preserving byte encoding of values for index entries.
//!
//! Every encoding starts with a type label so values of different types sort in
//! the cross-type order. Encodings are prefix free, which lets index entries
//! concatenate several segments and still compare as tuples. Descending segments
//! invert every byte.

use crate::firestore::value::{FirestoreValue, ValueKind};

const LABEL_NULL: u8 = 5;
const LABEL_BOOLEAN: u8 = 10;
const LABEL_NAN: u8 = 13;
const LABEL_NUMBER: u8 = 15;
const LABEL_TIMESTAMP: u8 = 20;
const LABEL_STRING: u8 = 25;
const LABEL_BYTES: u8 = 30;
const LABEL_REFERENCE: u8 = 37;
const LABEL_GEO_POINT: u8 = 45;
const LABEL_ARRAY: u8 = 50;
const LABEL_MAP: u8 = 55;
const LABEL_REFERENCE_SEGMENT: u8 = 60;

const END_OF_SEQUENCE: u8 = 0x02;
const ESCAPE: u8 = 0x00;
const ESCAPED_NULL: u8 = 0xFF;
const TERMINATOR: u8 = 0x01;

/// Writes the directional encoding of `value` into `out`.
pub fn encode_index_value(value: &FirestoreValue, descending: bool, out: &mut Vec<u8>) {
    let start = out.len();
    write_value(value, out);
    if descending {
        for byte in &mut out[start..] {
            *byte = !*byte;
        }
    }
}

pub fn encoded(value: &FirestoreValue, descending: bool) -> Vec<u8> {
    let mut out = Vec::new();
    encode_index_value(value, descending, &mut out);
    out
}

/// Encoding of the type label shared by every value of the same type class.
/// Used to bound open-ended ranges (`a > 5` stays within numbers).
pub fn type_label(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => LABEL_NULL,
        ValueKind::Boolean(_) => LABEL_BOOLEAN,
        ValueKind::Double(d) if d.is_nan() => LABEL_NAN,
        ValueKind::Integer(_) | ValueKind::Double(_) => LABEL_NUMBER,
        ValueKind::Timestamp(_) => LABEL_TIMESTAMP,
        ValueKind::String(_) => LABEL_STRING,
        ValueKind::Bytes(_) => LABEL_BYTES,
        ValueKind::Reference(_) => LABEL_REFERENCE,
        ValueKind::GeoPoint(_) => LABEL_GEO_POINT,
        ValueKind::Array(_) => LABEL_ARRAY,
        ValueKind::Map(_) => LABEL_MAP,
    }
}

/// First label of the type class that follows `value`'s class. NaN shares the
/// number class so numeric ranges include it.
pub fn next_type_label(value: &FirestoreValue) -> u8 {
    match type_label(value) {
        LABEL_NAN | LABEL_NUMBER => LABEL_TIMESTAMP,
        label => label + 1,
    }
}

/// Lower label of the class containing `value`.
pub fn class_label(value: &FirestoreValue) -> u8 {
    match type_label(value) {
        LABEL_NUMBER => LABEL_NAN,
        label => label,
    }
}

/// Smallest byte string greater than every string that starts with `prefix`.
/// Returns `None` when no such string exists (all bytes are 0xFF).
pub fn prefix_successor(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bytes = prefix.to_vec();
    while let Some(last) = bytes.pop() {
        if last < u8::MAX {
            bytes.push(last + 1);
            return Some(bytes);
        }
    }
    None
}

fn write_value(value: &FirestoreValue, out: &mut Vec<u8>) {
    match value.kind() {
        ValueKind::Null => out.push(LABEL_NULL),
        ValueKind::Boolean(b) => {
            out.push(LABEL_BOOLEAN);
            out.push(u8::from(*b));
        }
        ValueKind::Double(d) if d.is_nan() => out.push(LABEL_NAN),
        ValueKind::Integer(i) => {
            out.push(LABEL_NUMBER);
            write_double(*i as f64, out);
        }
        ValueKind::Double(d) => {
            out.push(LABEL_NUMBER);
            write_double(*d, out);
        }
        ValueKind::Timestamp(ts) => {
            out.push(LABEL_TIMESTAMP);
            out.extend_from_slice(&((ts.seconds as u64) ^ (1 << 63)).to_be_bytes());
            out.extend_from_slice(&(ts.nanos as u32).to_be_bytes());
        }
        ValueKind::String(s) => {
            out.push(LABEL_STRING);
            write_escaped(s.as_bytes(), out);
        }
        ValueKind::Bytes(bytes) => {
            out.push(LABEL_BYTES);
            write_escaped(bytes.as_slice(), out);
        }
        ValueKind::Reference(path) => {
            out.push(LABEL_REFERENCE);
            for segment in path.split('/').filter(|s| !s.is_empty()) {
                out.push(LABEL_REFERENCE_SEGMENT);
                write_escaped(segment.as_bytes(), out);
            }
            out.push(END_OF_SEQUENCE);
        }
        ValueKind::GeoPoint(point) => {
            out.push(LABEL_GEO_POINT);
            write_double(point.latitude(), out);
            write_double(point.longitude(), out);
        }
        ValueKind::Array(array) => {
            out.push(LABEL_ARRAY);
            for element in array.values() {
                write_value(element, out);
            }
            out.push(END_OF_SEQUENCE);
        }
        ValueKind::Map(map) => {
            out.push(LABEL_MAP);
            for (key, element) in map.fields() {
                out.push(LABEL_STRING);
                write_escaped(key.as_bytes(), out);
                write_value(element, out);
            }
            out.push(END_OF_SEQUENCE);
        }
    }
}

fn write_double(value: f64, out: &mut Vec<u8>) {
    let normalized = if value == 0.0 { 0.0 } else { value };
    let bits = normalized.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits ^ (1 << 63) };
    out.extend_from_slice(&ordered.to_be_bytes());
}

fn write_escaped(bytes: &[u8], out: &mut Vec<u8>) {
    for byte in bytes {
        out.push(*byte);
        if *byte == ESCAPE {
            out.push(ESCAPED_NULL);
        }
    }
    out.push(ESCAPE);
    out.push(TERMINATOR);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::value::compare_values;
    use std::cmp::Ordering;

    fn sample_values() -> Vec<FirestoreValue> {
        vec![
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_bool(true),
            FirestoreValue::from_double(f64::NAN),
            FirestoreValue::from_double(-10.5),
            FirestoreValue::from_integer(-1),
            FirestoreValue::from_integer(0),
            FirestoreValue::from_double(0.5),
            FirestoreValue::from_integer(3),
            FirestoreValue::from_string(""),
            FirestoreValue::from_string("a"),
            FirestoreValue::from_string("a\u{0}"),
            FirestoreValue::from_string("ab"),
            FirestoreValue::from_string("b"),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]),
            FirestoreValue::from_array(vec![
                FirestoreValue::from_integer(1),
                FirestoreValue::from_integer(2),
            ]),
        ]
    }

    #[test]
    fn ascending_bytes_follow_value_order() {
        let values = sample_values();
        for left in &values {
            for right in &values {
                let by_value = compare_values(left, right);
                let by_bytes = encoded(left, false).cmp(&encoded(right, false));
                assert_eq!(by_value, by_bytes, "{left:?} vs {right:?}");
            }
        }
    }

    #[test]
    fn descending_bytes_reverse_value_order() {
        let values = sample_values();
        for pair in values.windows(2) {
            assert_eq!(
                encoded(&pair[0], true).cmp(&encoded(&pair[1], true)),
                Ordering::Greater
            );
        }
    }

    #[test]
    fn prefix_successor_skips_trailing_max_bytes() {
        assert_eq!(prefix_successor(&[1, 2, 0xFF]), Some(vec![1, 3]));
        assert_eq!(prefix_successor(&[0xFF, 0xFF]), None);
    }
}
