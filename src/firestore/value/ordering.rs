use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, MapValue, ValueKind};

/// Cross-type ordering of Firestore values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TypeOrder {
    Null = 0,
    Boolean = 1,
    Number = 2,
    Timestamp = 3,
    String = 4,
    Bytes = 5,
    Reference = 6,
    GeoPoint = 7,
    Array = 8,
    Map = 9,
}

pub fn type_order(value: &FirestoreValue) -> TypeOrder {
    match value.kind() {
        ValueKind::Null => TypeOrder::Null,
        ValueKind::Boolean(_) => TypeOrder::Boolean,
        ValueKind::Integer(_) | ValueKind::Double(_) => TypeOrder::Number,
        ValueKind::Timestamp(_) => TypeOrder::Timestamp,
        ValueKind::String(_) => TypeOrder::String,
        ValueKind::Bytes(_) => TypeOrder::Bytes,
        ValueKind::Reference(_) => TypeOrder::Reference,
        ValueKind::GeoPoint(_) => TypeOrder::GeoPoint,
        ValueKind::Array(_) => TypeOrder::Array,
        ValueKind::Map(_) => TypeOrder::Map,
    }
}

/// Total order over values: first by type, then within the type.
pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => Ordering::Equal,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_integer_double(*l, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_integer_double(*r, *l).reverse(),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => compare_references(l, r),
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => compare_doubles(l.latitude(), r.latitude())
            .then_with(|| compare_doubles(l.longitude(), r.longitude())),
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            compare_sequences(l.values(), r.values())
        }
        (ValueKind::Map(l), ValueKind::Map(r)) => compare_maps(l, r),
        _ => Ordering::Equal,
    }
}

/// NaN sorts before every other number; `-0.0` equals `0.0`.
pub fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

fn compare_integer_double(left: i64, right: f64) -> Ordering {
    if right.is_nan() {
        return Ordering::Greater;
    }
    let widened = left as f64;
    match widened.partial_cmp(&right).unwrap_or(Ordering::Equal) {
        // Widening may round; settle ties on the integer side when `right` is integral.
        Ordering::Equal if right.fract() == 0.0 && right.abs() < 9.2e18 => left.cmp(&(right as i64)),
        other => other,
    }
}

fn compare_references(left: &str, right: &str) -> Ordering {
    let mut left_segments = left.split('/');
    let mut right_segments = right.split('/');
    loop {
        match (left_segments.next(), right_segments.next()) {
            (Some(l), Some(r)) => match l.cmp(r) {
                Ordering::Equal => continue,
                other => return other,
            },
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (None, None) => return Ordering::Equal,
        }
    }
}

fn compare_sequences(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        match compare_values(l, r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    left.len().cmp(&right.len())
}

fn compare_maps(left: &MapValue, right: &MapValue) -> Ordering {
    for ((lk, lv), (rk, rv)) in left.fields().iter().zip(right.fields().iter()) {
        let by_key = lk.cmp(rk);
        if by_key != Ordering::Equal {
            return by_key;
        }
        let by_value = compare_values(lv, rv);
        if by_value != Ordering::Equal {
            return by_value;
        }
    }
    left.fields().len().cmp(&right.fields().len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn orders_by_type_first() {
        let values = [
            FirestoreValue::null(),
            FirestoreValue::from_bool(false),
            FirestoreValue::from_integer(100),
            FirestoreValue::from_string(""),
            FirestoreValue::from_array(vec![]),
            FirestoreValue::from_map(BTreeMap::new()),
        ];
        for pair in values.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn mixes_integers_and_doubles() {
        let one = FirestoreValue::from_integer(1);
        let one_and_half = FirestoreValue::from_double(1.5);
        let nan = FirestoreValue::from_double(f64::NAN);
        assert_eq!(compare_values(&one, &one_and_half), Ordering::Less);
        assert_eq!(
            compare_values(&one, &FirestoreValue::from_double(1.0)),
            Ordering::Equal
        );
        assert_eq!(compare_values(&nan, &one), Ordering::Less);
    }

    #[test]
    fn arrays_compare_elementwise_then_length() {
        let short = FirestoreValue::from_array(vec![FirestoreValue::from_integer(1)]);
        let long = FirestoreValue::from_array(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(0),
        ]);
        assert_eq!(compare_values(&short, &long), Ordering::Less);
    }
}
