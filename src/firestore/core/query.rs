use std::cmp::Ordering;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::Target;
use crate::firestore::model::{Document, DocumentKey, FieldPath, ResourcePath};
use crate::firestore::value::{
    compare_values, json, type_order, ArrayValue, FirestoreValue, ValueKind,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FilterOperator {
    LessThan,
    LessThanOrEqual,
    Equal,
    NotEqual,
    GreaterThan,
    GreaterThanOrEqual,
    ArrayContains,
    ArrayContainsAny,
    In,
    NotIn,
}

impl FilterOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOperator::LessThan => "LESS_THAN",
            FilterOperator::LessThanOrEqual => "LESS_THAN_OR_EQUAL",
            FilterOperator::Equal => "EQUAL",
            FilterOperator::NotEqual => "NOT_EQUAL",
            FilterOperator::GreaterThan => "GREATER_THAN",
            FilterOperator::GreaterThanOrEqual => "GREATER_THAN_OR_EQUAL",
            FilterOperator::ArrayContains => "ARRAY_CONTAINS",
            FilterOperator::ArrayContainsAny => "ARRAY_CONTAINS_ANY",
            FilterOperator::In => "IN",
            FilterOperator::NotIn => "NOT_IN",
        }
    }

    pub fn is_inequality(&self) -> bool {
        matches!(
            self,
            FilterOperator::LessThan
                | FilterOperator::LessThanOrEqual
                | FilterOperator::GreaterThan
                | FilterOperator::GreaterThanOrEqual
                | FilterOperator::NotEqual
                | FilterOperator::NotIn
        )
    }

    pub fn is_array_operator(&self) -> bool {
        matches!(
            self,
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldFilter {
    field: FieldPath,
    operator: FilterOperator,
    value: FirestoreValue,
}

impl FieldFilter {
    pub fn new(field: FieldPath, operator: FilterOperator, value: FirestoreValue) -> Self {
        Self {
            field,
            operator,
            value,
        }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operator(&self) -> FilterOperator {
        self.operator
    }

    pub fn value(&self) -> &FirestoreValue {
        &self.value
    }

    pub fn matches(&self, document: &Document) -> bool {
        let other = field_value(document, &self.field);
        match self.operator {
            FilterOperator::NotEqual => match &other {
                Some(value) if !value.is_null() => {
                    compare_values(value, &self.value) != Ordering::Equal
                }
                _ => false,
            },
            FilterOperator::ArrayContains => other
                .as_ref()
                .and_then(FirestoreValue::as_array)
                .is_some_and(|array| array.contains(&self.value)),
            FilterOperator::ArrayContainsAny => {
                let needles = self.value.as_array();
                match (other.as_ref().and_then(FirestoreValue::as_array), needles) {
                    (Some(array), Some(needles)) => {
                        array.values().iter().any(|value| needles.contains(value))
                    }
                    _ => false,
                }
            }
            FilterOperator::In => match (&other, self.value.as_array()) {
                (Some(value), Some(candidates)) => contains_by_order(candidates, value),
                _ => false,
            },
            FilterOperator::NotIn => {
                let Some(candidates) = self.value.as_array() else {
                    return false;
                };
                if candidates.contains(&FirestoreValue::null()) {
                    return false;
                }
                match &other {
                    Some(value) if !value.is_null() => !contains_by_order(candidates, value),
                    _ => false,
                }
            }
            _ => match &other {
                Some(value) if type_order(value) == type_order(&self.value) => {
                    self.matches_comparison(compare_values(value, &self.value))
                }
                _ => false,
            },
        }
    }

    fn matches_comparison(&self, ordering: Ordering) -> bool {
        match self.operator {
            FilterOperator::LessThan => ordering == Ordering::Less,
            FilterOperator::LessThanOrEqual => ordering != Ordering::Greater,
            FilterOperator::Equal => ordering == Ordering::Equal,
            FilterOperator::GreaterThan => ordering == Ordering::Greater,
            FilterOperator::GreaterThanOrEqual => ordering != Ordering::Less,
            _ => false,
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        format!(
            "{}{}{}",
            self.field.canonical_string(),
            self.operator.as_str(),
            canonical_value(&self.value)
        )
    }
}

fn contains_by_order(candidates: &ArrayValue, value: &FirestoreValue) -> bool {
    candidates.values().iter().any(|candidate| {
        type_order(candidate) == type_order(value)
            && compare_values(candidate, value) == Ordering::Equal
    })
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

impl OrderDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Ascending => "ASCENDING",
            OrderDirection::Descending => "DESCENDING",
        }
    }

    fn flipped(self) -> Self {
        match self {
            OrderDirection::Ascending => OrderDirection::Descending,
            OrderDirection::Descending => OrderDirection::Ascending,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderBy {
    field: FieldPath,
    direction: OrderDirection,
}

impl OrderBy {
    pub fn new(field: FieldPath, direction: OrderDirection) -> Self {
        Self { field, direction }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn direction(&self) -> OrderDirection {
        self.direction
    }

    pub(crate) fn flipped(&self) -> Self {
        Self::new(self.field.clone(), self.direction.flipped())
    }
}

/// Cursor position; values line up with the normalized order-by clauses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bound {
    values: Vec<FirestoreValue>,
    inclusive: bool,
}

impl Bound {
    pub fn new(values: Vec<FirestoreValue>, inclusive: bool) -> Self {
        Self { values, inclusive }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    pub fn inclusive(&self) -> bool {
        self.inclusive
    }

    fn compare_to_document(&self, order_by: &[OrderBy], document: &Document) -> Ordering {
        for (value, order) in self.values.iter().zip(order_by.iter()) {
            let ordering = if order.field().is_document_id() {
                match value.kind() {
                    ValueKind::Reference(path) => compare_reference_to_key(path, document.key()),
                    _ => Ordering::Equal,
                }
            } else {
                let doc_value = document
                    .field(order.field())
                    .cloned()
                    .unwrap_or_else(FirestoreValue::null);
                compare_values(value, &doc_value)
            };
            let ordering = match order.direction() {
                OrderDirection::Ascending => ordering,
                OrderDirection::Descending => ordering.reverse(),
            };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    }

    pub(crate) fn sorts_before_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Greater
        } else {
            ordering == Ordering::Less
        }
    }

    pub(crate) fn sorts_after_document(&self, order_by: &[OrderBy], document: &Document) -> bool {
        let ordering = self.compare_to_document(order_by, document);
        if self.inclusive {
            ordering != Ordering::Less
        } else {
            ordering == Ordering::Greater
        }
    }

    pub(crate) fn canonical_id(&self) -> String {
        let mut out = String::from(if self.inclusive { "b:" } else { "a:" });
        for (index, value) in self.values.iter().enumerate() {
            if index > 0 {
                out.push(',');
            }
            out.push_str(&canonical_value(value));
        }
        out
    }
}

fn compare_reference_to_key(reference: &str, key: &DocumentKey) -> Ordering {
    match DocumentKey::from_string(reference) {
        Ok(bound_key) => bound_key.cmp(key),
        Err(_) => Ordering::Equal,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitType {
    First,
    Last,
}

/// Query over the local cache and, once listened to, the backend.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    path: ResourcePath,
    collection_group: Option<String>,
    filters: Vec<FieldFilter>,
    explicit_order_by: Vec<OrderBy>,
    limit: Option<u32>,
    limit_type: LimitType,
    start_at: Option<Bound>,
    end_at: Option<Bound>,
}

impl Query {
    pub fn collection(path: ResourcePath) -> Self {
        Self {
            path,
            collection_group: None,
            filters: Vec::new(),
            explicit_order_by: Vec::new(),
            limit: None,
            limit_type: LimitType::First,
            start_at: None,
            end_at: None,
        }
    }

    /// Matches every collection named `collection_id`, at any depth.
    pub fn collection_group(collection_id: impl Into<String>) -> Self {
        let mut query = Self::collection(ResourcePath::root());
        query.collection_group = Some(collection_id.into());
        query
    }

    pub fn document(key: &DocumentKey) -> Self {
        Self::collection(key.path().clone())
    }

    /// Limit-first query that produces `target`. Used when only the cached
    /// target of a query is known, e.g. a target another client listens to.
    pub fn from_target(target: &Target) -> Self {
        Self {
            path: target.path().clone(),
            collection_group: target.collection_group().map(str::to_string),
            filters: target.filters().to_vec(),
            explicit_order_by: target.order_by().to_vec(),
            limit: target.limit(),
            limit_type: LimitType::First,
            start_at: target.start_at().cloned(),
            end_at: target.end_at().cloned(),
        }
    }

    pub fn with_filter(mut self, filter: FieldFilter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn order_by(mut self, field: FieldPath, direction: OrderDirection) -> Self {
        self.explicit_order_by.push(OrderBy::new(field, direction));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::First;
        self
    }

    pub fn limit_to_last(mut self, limit: u32) -> Self {
        self.limit = Some(limit);
        self.limit_type = LimitType::Last;
        self
    }

    pub fn start_at(mut self, bound: Bound) -> Self {
        self.start_at = Some(bound);
        self
    }

    pub fn end_at(mut self, bound: Bound) -> Self {
        self.end_at = Some(bound);
        self
    }

    pub fn without_limit(&self) -> Self {
        let mut query = self.clone();
        query.limit = None;
        query.limit_type = LimitType::First;
        query
    }

    /// Collection query over `path` with this query's constraints; used to run a
    /// collection group query one collection at a time.
    pub fn as_collection_query_at_path(&self, path: ResourcePath) -> Self {
        let mut query = self.clone();
        query.path = path;
        query.collection_group = None;
        query
    }

    pub fn path(&self) -> &ResourcePath {
        &self.path
    }

    pub fn collection_group_id(&self) -> Option<&str> {
        self.collection_group.as_deref()
    }

    pub fn filters(&self) -> &[FieldFilter] {
        &self.filters
    }

    pub fn explicit_order_by(&self) -> &[OrderBy] {
        &self.explicit_order_by
    }

    pub fn limit_value(&self) -> Option<u32> {
        self.limit
    }

    pub fn limit_type(&self) -> LimitType {
        self.limit_type
    }

    pub fn has_limit(&self) -> bool {
        self.limit.is_some()
    }

    pub fn start_bound(&self) -> Option<&Bound> {
        self.start_at.as_ref()
    }

    pub fn end_bound(&self) -> Option<&Bound> {
        self.end_at.as_ref()
    }

    pub fn is_document_query(&self) -> bool {
        DocumentKey::is_document_key(&self.path)
            && self.collection_group.is_none()
            && self.filters.is_empty()
    }

    pub fn is_collection_group_query(&self) -> bool {
        self.collection_group.is_some()
    }

    /// Whether every document in the collection matches.
    pub fn matches_all_documents(&self) -> bool {
        self.filters.is_empty()
            && self.limit.is_none()
            && self.start_at.is_none()
            && self.end_at.is_none()
            && (self.explicit_order_by.is_empty()
                || (self.explicit_order_by.len() == 1
                    && self.explicit_order_by[0].field().is_document_id()))
    }

    /// Explicit order-bys, then inequality fields, then the document key.
    pub fn normalized_order_by(&self) -> Vec<OrderBy> {
        let mut order_by = self.explicit_order_by.clone();
        let last_direction = order_by
            .last()
            .map(OrderBy::direction)
            .unwrap_or(OrderDirection::Ascending);

        let mut inequality_fields: Vec<&FieldPath> = self
            .filters
            .iter()
            .filter(|filter| filter.operator().is_inequality())
            .map(FieldFilter::field)
            .collect();
        inequality_fields.sort();
        inequality_fields.dedup();
        for field in inequality_fields {
            if !field.is_document_id() && !order_by.iter().any(|order| order.field() == field) {
                order_by.push(OrderBy::new(field.clone(), last_direction));
            }
        }

        if !order_by.iter().any(|order| order.field().is_document_id()) {
            order_by.push(OrderBy::new(FieldPath::document_id(), last_direction));
        }
        order_by
    }

    pub fn matches(&self, document: &Document) -> bool {
        document.is_found_document()
            && self.matches_path(document.key())
            && self.matches_order_by(document)
            && self.filters.iter().all(|filter| filter.matches(document))
            && self.matches_bounds(document)
    }

    fn matches_path(&self, key: &DocumentKey) -> bool {
        let doc_path = key.path();
        match &self.collection_group {
            Some(group) => key.has_collection_id(group) && self.path.is_prefix_of(doc_path),
            None if DocumentKey::is_document_key(&self.path) => &self.path == doc_path,
            None => self.path.is_immediate_parent_of(doc_path),
        }
    }

    fn matches_order_by(&self, document: &Document) -> bool {
        self.explicit_order_by
            .iter()
            .all(|order| order.field().is_document_id() || document.field(order.field()).is_some())
    }

    fn matches_bounds(&self, document: &Document) -> bool {
        let order_by = self.normalized_order_by();
        if let Some(start) = &self.start_at {
            if !start.sorts_before_document(&order_by, document) {
                return false;
            }
        }
        if let Some(end) = &self.end_at {
            if !end.sorts_after_document(&order_by, document) {
                return false;
            }
        }
        true
    }

    /// Result order of this query.
    pub fn compare_documents(&self, left: &Document, right: &Document) -> Ordering {
        compare_by_order(&self.normalized_order_by(), left, right)
    }

    pub fn to_target(&self) -> Target {
        let order_by = self.normalized_order_by();
        match self.limit_type {
            LimitType::First => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by,
                self.limit,
                self.start_at.clone(),
                self.end_at.clone(),
            ),
            LimitType::Last => Target::new(
                self.path.clone(),
                self.collection_group.clone(),
                self.filters.clone(),
                order_by.iter().map(OrderBy::flipped).collect(),
                self.limit,
                self.end_at.clone(),
                self.start_at.clone(),
            ),
        }
    }

    pub fn canonical_id(&self) -> String {
        let mut id = self.to_target().canonical_id();
        let _ = write!(
            id,
            "|lt:{}",
            match self.limit_type {
                LimitType::First => "f",
                LimitType::Last => "l",
            }
        );
        id
    }
}

pub(crate) fn compare_by_order(order_by: &[OrderBy], left: &Document, right: &Document) -> Ordering {
    for order in order_by {
        let ordering = if order.field().is_document_id() {
            left.key().cmp(right.key())
        } else {
            let null = FirestoreValue::null();
            let l = left.field(order.field()).unwrap_or(&null);
            let r = right.field(order.field()).unwrap_or(&null);
            compare_values(l, r)
        };
        let ordering = match order.direction() {
            OrderDirection::Ascending => ordering,
            OrderDirection::Descending => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn field_value(document: &Document, field: &FieldPath) -> Option<FirestoreValue> {
    if field.is_document_id() {
        return Some(FirestoreValue::from_reference(
            document.key().path().canonical_string(),
        ));
    }
    document.field(field).cloned()
}

pub(crate) fn canonical_value(value: &FirestoreValue) -> String {
    json::encode_value(value).to_string()
}
