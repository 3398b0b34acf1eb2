use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::firestore::core::query::{FieldFilter, FilterOperator, OrderDirection};
use crate::firestore::core::target::Target;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::{KeyBuilder, KeyReader};
use crate::firestore::local::kv_store::{ScanRange, Table};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{
    Document, DocumentKey, FieldIndex, FieldPath, IndexOffset, IndexSegment, IndexState,
    ListenSequenceNumber, ResourcePath, SegmentKind, User,
};
use crate::firestore::value::index_encoder::{
    class_label, encode_index_value, encoded, next_type_label, prefix_successor,
};
use crate::firestore::value::{FirestoreValue, ValueKind};
use crate::util::hard_assert;

/// How completely an index can answer a target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IndexType {
    None,
    /// Narrows the candidates; results still need the query predicate.
    Partial,
    /// Covers every filtered and ordered field of the target.
    Full,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct IndexConfig {
    index_id: i32,
    collection_group: String,
    segments: Vec<IndexSegment>,
}

type EntrySet = BTreeSet<(Vec<u8>, Vec<u8>)>;

/// Client-side composite indexes and the byte-encoded entries backing them.
///
/// An entry key is `index_id · user · array_value · directional_value · document`,
/// so a range scan over a prefix of equality values (optionally bounded by one
/// range on the next segment) yields candidate documents for a target.
#[derive(Clone, Debug)]
pub struct IndexManager {
    user_id: String,
}

impl IndexManager {
    pub fn new(user: &User) -> Self {
        Self {
            user_id: user.storage_key().to_string(),
        }
    }

    pub fn get_collection_parents(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_id: &str,
    ) -> FirestoreResult<Vec<ResourcePath>> {
        let prefix = KeyBuilder::new().string(collection_id).build();
        let mut parents = Vec::new();
        for (row_key, _) in txn.scan(Table::CollectionParents, &ScanRange::prefix(prefix))? {
            let mut reader = KeyReader::new(&row_key);
            reader.string()?;
            parents.push(reader.path()?);
        }
        parents.sort_by(ResourcePath::comparator);
        Ok(parents)
    }

    pub fn add_field_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        segments: Vec<IndexSegment>,
    ) -> FirestoreResult<FieldIndex> {
        let index_id = txn
            .scan_json::<IndexConfig>(Table::IndexConfiguration, &ScanRange::all())?
            .into_iter()
            .map(|(_, config)| config.index_id)
            .max()
            .unwrap_or(0)
            + 1;
        let config = IndexConfig {
            index_id,
            collection_group: collection_group.to_string(),
            segments,
        };
        txn.put_json(Table::IndexConfiguration, config_key(index_id), &config)?;
        let mut index = FieldIndex::new(index_id, config.collection_group, config.segments);
        index.state = IndexState {
            sequence_number: txn.current_sequence_number(),
            offset: IndexOffset::none(),
            backfill_complete: false,
        };
        self.update_index_state(txn, index_id, &index.state)?;
        log::debug!("created field index {index_id} on '{collection_group}'");
        Ok(index)
    }

    pub fn delete_field_index(&self, txn: &mut PersistenceTransaction<'_>, index_id: i32) -> FirestoreResult<()> {
        txn.delete(Table::IndexConfiguration, config_key(index_id));
        for (row_key, _) in txn.scan(Table::IndexState, &ScanRange::all())? {
            let mut reader = KeyReader::new(&row_key);
            reader.string()?;
            if reader.int()? == i64::from(index_id) {
                txn.delete(Table::IndexState, row_key);
            }
        }
        let prefix = ScanRange::prefix(KeyBuilder::new().int(i64::from(index_id)).build());
        for table in [Table::IndexEntries, Table::IndexEntriesByDocument] {
            for (row_key, _) in txn.scan(table, &prefix)? {
                txn.delete(table, row_key);
            }
        }
        Ok(())
    }

    pub fn delete_all_field_indexes(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        for index in self.get_field_indexes(txn, None)? {
            self.delete_field_index(txn, index.index_id)?;
        }
        Ok(())
    }

    /// Indexes with this user's backfill state, optionally limited to one
    /// collection group.
    pub fn get_field_indexes(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: Option<&str>,
    ) -> FirestoreResult<Vec<FieldIndex>> {
        let mut indexes = Vec::new();
        for (_, config) in txn.scan_json::<IndexConfig>(Table::IndexConfiguration, &ScanRange::all())? {
            if collection_group.is_some_and(|group| group != config.collection_group) {
                continue;
            }
            let state = txn
                .get_json::<IndexState>(Table::IndexState, &self.state_key(config.index_id))?
                .unwrap_or_default();
            let mut index = FieldIndex::new(config.index_id, config.collection_group, config.segments);
            index.state = state;
            indexes.push(index);
        }
        Ok(indexes)
    }

    pub fn update_index_state(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        index_id: i32,
        state: &IndexState,
    ) -> FirestoreResult<()> {
        txn.put_json(Table::IndexState, self.state_key(index_id), state)
    }

    /// Collection group whose backfill is least recently advanced, if any index
    /// still needs backfilling.
    pub fn get_next_collection_group_to_update(
        &self,
        txn: &PersistenceTransaction<'_>,
    ) -> FirestoreResult<Option<String>> {
        Ok(self
            .get_field_indexes(txn, None)?
            .into_iter()
            .filter(|index| !index.state.backfill_complete)
            .min_by_key(|index| (index.state.sequence_number, index.index_id))
            .map(|index| index.collection_group))
    }

    /// Records backfill progress for every index on `collection_group`.
    pub fn update_collection_group(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        collection_group: &str,
        offset: IndexOffset,
        backfill_complete: bool,
        sequence_number: ListenSequenceNumber,
    ) -> FirestoreResult<()> {
        for index in self.get_field_indexes(txn, Some(collection_group))? {
            if index.state.backfill_complete {
                continue;
            }
            let state = IndexState {
                sequence_number,
                offset: offset.clone(),
                backfill_complete,
            };
            self.update_index_state(txn, index.index_id, &state)?;
        }
        Ok(())
    }

    /// Rewrites the entries of every index on the documents' collection groups.
    /// Documents that no longer exist or lack an indexed field lose their entries.
    pub fn update_index_entries(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        documents: &BTreeMap<DocumentKey, Document>,
    ) -> FirestoreResult<()> {
        let mut indexes_by_group: BTreeMap<String, Vec<FieldIndex>> = BTreeMap::new();
        for (key, document) in documents {
            let group = key.collection_group().to_string();
            if !indexes_by_group.contains_key(&group) {
                let indexes = self.get_field_indexes(txn, Some(&group))?;
                indexes_by_group.insert(group.clone(), indexes);
            }
            let Some(indexes) = indexes_by_group.get(&group) else {
                continue;
            };
            for index in indexes {
                let new_entries = index_entries(index, document);
                let by_document_key = self.by_document_key(index.index_id, key);
                let existing: EntrySet = txn
                    .get_json::<Vec<(Vec<u8>, Vec<u8>)>>(Table::IndexEntriesByDocument, &by_document_key)?
                    .map(|entries| entries.into_iter().collect())
                    .unwrap_or_default();
                if existing == new_entries {
                    continue;
                }
                for (array_value, directional_value) in existing.difference(&new_entries) {
                    txn.delete(
                        Table::IndexEntries,
                        self.entry_key(index.index_id, array_value, directional_value, key),
                    );
                }
                for (array_value, directional_value) in new_entries.difference(&existing) {
                    txn.put_json(
                        Table::IndexEntries,
                        self.entry_key(index.index_id, array_value, directional_value, key),
                        &(),
                    )?;
                }
                if new_entries.is_empty() {
                    txn.delete(Table::IndexEntriesByDocument, by_document_key);
                } else {
                    let rows: Vec<_> = new_entries.into_iter().collect();
                    txn.put_json(Table::IndexEntriesByDocument, by_document_key, &rows)?;
                }
            }
        }
        Ok(())
    }

    /// Best index for `target`: the one covering the most segments.
    pub fn get_field_index(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<FieldIndex>> {
        if target.is_document_target() {
            return Ok(None);
        }
        Ok(self
            .get_field_indexes(txn, Some(target.collection_id()))?
            .into_iter()
            .filter(|index| served_by_index(target, index))
            .max_by_key(|index| index.segments.len()))
    }

    pub fn get_index_type(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<IndexType> {
        Ok(match self.get_field_index(txn, target)? {
            None => IndexType::None,
            Some(index) if covers_target(target, &index) => IndexType::Full,
            Some(_) => IndexType::Partial,
        })
    }

    /// Candidate documents for `target` from a fully backfilled index, or `None`
    /// when no such index exists. Candidates are a superset of the matches.
    pub fn get_documents_matching_target(
        &self,
        txn: &PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<BTreeSet<DocumentKey>>> {
        let Some(index) = self.get_field_index(txn, target)? else {
            return Ok(None);
        };
        if !index.is_servable() {
            return Ok(None);
        }
        let mut keys = BTreeSet::new();
        for range in self.scan_ranges(&index, target) {
            for (row_key, _) in txn.scan(Table::IndexEntries, &range)? {
                let mut reader = KeyReader::new(&row_key);
                reader.int()?;
                reader.string()?;
                reader.bytes()?;
                reader.bytes()?;
                keys.insert(DocumentKey::from_path(reader.path()?)?);
            }
        }
        Ok(Some(keys))
    }

    /// Creates the index `target` would need, unless one of that shape exists.
    pub fn create_target_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        target: &Target,
    ) -> FirestoreResult<Option<FieldIndex>> {
        let Some(wanted) = build_target_index(target) else {
            return Ok(None);
        };
        let existing = self.get_field_indexes(txn, Some(&wanted.collection_group))?;
        if existing.iter().any(|index| index.same_shape(&wanted)) {
            return Ok(None);
        }
        self.add_field_index(txn, &wanted.collection_group, wanted.segments)
            .map(Some)
    }

    fn scan_ranges(&self, index: &FieldIndex, target: &Target) -> Vec<ScanRange> {
        let array_values: Vec<Vec<u8>> = match index.array_segment() {
            None => vec![Vec::new()],
            Some(segment) => target
                .filters()
                .iter()
                .filter(|filter| filter.field() == &segment.field_path)
                .find_map(|filter| match filter.operator() {
                    FilterOperator::ArrayContains => Some(vec![encoded(filter.value(), false)]),
                    FilterOperator::ArrayContainsAny => filter.value().as_array().map(|values| {
                        values
                            .values()
                            .iter()
                            .map(|value| encoded(value, false))
                            .collect()
                    }),
                    _ => None,
                })
                .unwrap_or_default(),
        };

        let mut prefixes: Vec<Vec<u8>> = vec![Vec::new()];
        let mut lower: Option<FirestoreValue> = None;
        let mut upper: Option<FirestoreValue> = None;
        for segment in index.directional_segments() {
            let descending = segment.kind == SegmentKind::Descending;
            if let Some(values) = equality_values(target.filters(), &segment.field_path) {
                prefixes = prefixes
                    .iter()
                    .flat_map(|prefix| {
                        values.iter().map(move |value| {
                            let mut next = prefix.clone();
                            encode_index_value(value, descending, &mut next);
                            next
                        })
                    })
                    .collect();
                continue;
            }
            if !descending {
                for filter in target.filters().iter().filter(|f| f.field() == &segment.field_path) {
                    match filter.operator() {
                        FilterOperator::GreaterThan | FilterOperator::GreaterThanOrEqual => {
                            lower = Some(filter.value().clone());
                        }
                        FilterOperator::LessThan | FilterOperator::LessThanOrEqual => {
                            upper = Some(filter.value().clone());
                        }
                        _ => {}
                    }
                }
            }
            break;
        }

        let mut ranges = Vec::new();
        for array_value in &array_values {
            let base = KeyBuilder::new()
                .int(i64::from(index.index_id))
                .string(&self.user_id)
                .bytes(array_value);
            for prefix in &prefixes {
                let mut start = prefix.clone();
                let mut end = prefix.clone();
                match (&lower, &upper) {
                    (Some(low), _) => encode_index_value(low, false, &mut start),
                    (None, Some(high)) => start.push(class_label(high)),
                    (None, None) => {}
                }
                match (&upper, &lower) {
                    (Some(high), _) => encode_index_value(high, false, &mut end),
                    (None, Some(low)) => end.push(next_type_label(low) - 1),
                    (None, None) => {}
                }
                let start = base.clone().bytes_prefix(&start).build();
                let end = base.clone().bytes_prefix(&end).build();
                let end = match prefix_successor(&end) {
                    Some(successor) => Bound::Excluded(successor),
                    None => Bound::Unbounded,
                };
                ranges.push(ScanRange::between(Bound::Included(start), end));
            }
        }
        ranges
    }

    fn state_key(&self, index_id: i32) -> Vec<u8> {
        KeyBuilder::new()
            .string(&self.user_id)
            .int(i64::from(index_id))
            .build()
    }

    fn entry_key(&self, index_id: i32, array_value: &[u8], directional_value: &[u8], key: &DocumentKey) -> Vec<u8> {
        KeyBuilder::new()
            .int(i64::from(index_id))
            .string(&self.user_id)
            .bytes(array_value)
            .bytes(directional_value)
            .path(key.path())
            .build()
    }

    fn by_document_key(&self, index_id: i32, key: &DocumentKey) -> Vec<u8> {
        KeyBuilder::new()
            .int(i64::from(index_id))
            .string(&self.user_id)
            .path(key.path())
            .build()
    }
}

/// Records that documents exist under `collection_path`, so collection group
/// queries can find every parent.
pub(crate) fn add_to_collection_parent_index(
    txn: &mut PersistenceTransaction<'_>,
    collection_path: &ResourcePath,
) -> FirestoreResult<()> {
    hard_assert(
        collection_path.len() % 2 == 1,
        "Expected a collection path",
    );
    let Some(collection_id) = collection_path.last_segment() else {
        return Ok(());
    };
    let row_key = KeyBuilder::new()
        .string(collection_id)
        .path(&collection_path.without_last())
        .build();
    txn.put_json(Table::CollectionParents, row_key, &())
}

fn config_key(index_id: i32) -> Vec<u8> {
    KeyBuilder::new().int(i64::from(index_id)).build()
}

fn index_entries(index: &FieldIndex, document: &Document) -> EntrySet {
    let mut entries = EntrySet::new();
    if !document.is_found_document() {
        return entries;
    }
    let mut directional = Vec::new();
    for segment in index.directional_segments() {
        let Some(value) = document.field(&segment.field_path) else {
            return entries;
        };
        encode_index_value(value, segment.kind == SegmentKind::Descending, &mut directional);
    }
    match index.array_segment() {
        None => {
            entries.insert((Vec::new(), directional));
        }
        Some(segment) => {
            if let Some(ValueKind::Array(values)) = document.field(&segment.field_path).map(FirestoreValue::kind) {
                for value in values.values() {
                    entries.insert((encoded(value, false), directional.clone()));
                }
            }
        }
    }
    entries
}

fn equality_values(filters: &[FieldFilter], field: &FieldPath) -> Option<Vec<FirestoreValue>> {
    filters
        .iter()
        .filter(|filter| filter.field() == field)
        .find_map(|filter| match filter.operator() {
            FilterOperator::Equal => Some(vec![filter.value().clone()]),
            FilterOperator::In => filter
                .value()
                .as_array()
                .map(|values| values.values().to_vec()),
            _ => None,
        })
}

/// Every segment must constrain a field the target filters or orders on, so
/// documents lacking the field could not match anyway.
fn served_by_index(target: &Target, index: &FieldIndex) -> bool {
    if index.collection_group != target.collection_id() || index.segments.is_empty() {
        return false;
    }
    if let Some(segment) = index.array_segment() {
        let has_array_filter = target
            .filters()
            .iter()
            .any(|f| f.field() == &segment.field_path && f.operator().is_array_operator());
        if !has_array_filter {
            return false;
        }
    }
    index.directional_segments().all(|segment| {
        target
            .filters()
            .iter()
            .any(|f| f.field() == &segment.field_path && !f.operator().is_array_operator())
            || target
                .order_by()
                .iter()
                .any(|order| order.field() == &segment.field_path)
    })
}

fn covers_target(target: &Target, index: &FieldIndex) -> bool {
    let covered: BTreeSet<&FieldPath> = index.segments.iter().map(|s| &s.field_path).collect();
    target
        .filters()
        .iter()
        .map(FieldFilter::field)
        .chain(target.order_by().iter().map(|order| order.field()))
        .filter(|field| !field.is_document_id())
        .all(|field| covered.contains(field))
}

/// Index shape serving `target`: equality fields ascending, then the array
/// field, then the remaining order-by fields in their direction.
fn build_target_index(target: &Target) -> Option<FieldIndex> {
    if target.is_document_target() {
        return None;
    }
    let mut segments = Vec::new();
    let mut seen: BTreeSet<FieldPath> = BTreeSet::new();
    let mut array_segment = None;
    for filter in target.filters() {
        let field = filter.field();
        if field.is_document_id() {
            continue;
        }
        match filter.operator() {
            FilterOperator::ArrayContains | FilterOperator::ArrayContainsAny => {
                if array_segment.is_none() {
                    array_segment = Some(IndexSegment::new(field.clone(), SegmentKind::Contains));
                }
            }
            FilterOperator::Equal | FilterOperator::In => {
                if seen.insert(field.clone()) {
                    segments.push(IndexSegment::new(field.clone(), SegmentKind::Ascending));
                }
            }
            _ => {}
        }
    }
    segments.extend(array_segment);
    for order in target.order_by() {
        let field = order.field();
        if field.is_document_id() || !seen.insert(field.clone()) {
            continue;
        }
        let kind = match order.direction() {
            OrderDirection::Ascending => SegmentKind::Ascending,
            OrderDirection::Descending => SegmentKind::Descending,
        };
        segments.push(IndexSegment::new(field.clone(), kind));
    }
    if segments.is_empty() {
        return None;
    }
    Some(FieldIndex::new(0, target.collection_id(), segments))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::SnapshotVersion;
    use crate::firestore::value::MapValue;

    fn persistence() -> Persistence {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        persistence
    }

    fn room(id: &str, occupancy: i64, floor: i64) -> Document {
        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("occupancy").unwrap(), FirestoreValue::from_integer(occupancy));
        data.set(&FieldPath::from_dot_separated("floor").unwrap(), FirestoreValue::from_integer(floor));
        Document::new_found(
            DocumentKey::from_string(&format!("rooms/{id}")).unwrap(),
            SnapshotVersion::new(crate::firestore::model::Timestamp::new(1, 0)),
            data,
        )
    }

    fn field(name: &str) -> FieldPath {
        FieldPath::from_dot_separated(name).unwrap()
    }

    #[test]
    fn deleting_an_index_keeps_the_others() {
        let persistence = persistence();
        let manager = IndexManager::new(&User::unauthenticated());
        let ids = persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                let floor = manager.add_field_index(txn, "rooms", vec![IndexSegment::new(field("floor"), SegmentKind::Ascending)])?;
                let occupancy = manager.add_field_index(
                    txn,
                    "rooms",
                    vec![IndexSegment::new(field("occupancy"), SegmentKind::Descending)],
                )?;
                assert_eq!(occupancy.index_id, floor.index_id + 1);
                manager.delete_field_index(txn, floor.index_id)?;
                Ok(manager
                    .get_field_indexes(txn, Some("rooms"))?
                    .into_iter()
                    .map(|index| index.index_id)
                    .collect::<Vec<_>>())
            })
            .unwrap();
        assert_eq!(ids, vec![2]);
    }

    #[test]
    fn builds_equality_then_range_shape() {
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(field("floor"), FilterOperator::Equal, FirestoreValue::from_integer(1)))
            .with_filter(FieldFilter::new(field("occupancy"), FilterOperator::LessThan, FirestoreValue::from_integer(4)))
            .to_target();
        let index = build_target_index(&target).unwrap();
        assert_eq!(
            index.segments,
            vec![
                IndexSegment::new(field("floor"), SegmentKind::Ascending),
                IndexSegment::new(field("occupancy"), SegmentKind::Ascending),
            ]
        );
        assert!(served_by_index(&target, &index));
        assert!(covers_target(&target, &index));
    }

    #[test]
    fn range_scan_returns_matching_candidates() {
        let persistence = persistence();
        let manager = IndexManager::new(&User::unauthenticated());
        let query = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .with_filter(FieldFilter::new(field("occupancy"), FilterOperator::LessThan, FirestoreValue::from_integer(4)));
        let target = query.to_target();

        let keys = persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                let index = manager.create_target_indexes(txn, &target)?.unwrap();
                let mut state = index.state.clone();
                state.backfill_complete = true;
                manager.update_index_state(txn, index.index_id, &state)?;

                let documents: BTreeMap<_, _> = [room("a", 2, 1), room("b", 5, 1), room("c", 3, 2)]
                    .into_iter()
                    .map(|doc| (doc.key().clone(), doc))
                    .collect();
                manager.update_index_entries(txn, &documents)?;
                manager.get_documents_matching_target(txn, &target)
            })
            .unwrap()
            .unwrap();
        let ids: Vec<_> = keys.iter().map(|key| key.id().to_string()).collect();
        assert_eq!(ids, vec!["a", "c"]);
    }

    #[test]
    fn unbackfilled_index_is_not_served() {
        let persistence = persistence();
        let manager = IndexManager::new(&User::unauthenticated());
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .order_by(field("floor"), OrderDirection::Descending)
            .to_target();
        let result = persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                manager.create_target_indexes(txn, &target)?;
                Ok((
                    manager.get_index_type(txn, &target)?,
                    manager.get_documents_matching_target(txn, &target)?,
                ))
            })
            .unwrap();
        assert_eq!(result, (IndexType::Full, None));
    }

    #[test]
    fn removed_documents_lose_their_entries() {
        let persistence = persistence();
        let manager = IndexManager::new(&User::unauthenticated());
        let target = Query::collection(ResourcePath::from_string("rooms").unwrap())
            .order_by(field("floor"), OrderDirection::Ascending)
            .to_target();
        let keys = persistence
            .run_transaction("index", TransactionMode::ReadWrite, |txn| {
                let index = manager.create_target_indexes(txn, &target)?.unwrap();
                let mut state = index.state.clone();
                state.backfill_complete = true;
                manager.update_index_state(txn, index.index_id, &state)?;
                let doc = room("a", 1, 1);
                let key = doc.key().clone();
                manager.update_index_entries(txn, &BTreeMap::from([(key.clone(), doc)]))?;
                let deleted = Document::new_no_document(key.clone(), SnapshotVersion::min());
                manager.update_index_entries(txn, &BTreeMap::from([(key, deleted)]))?;
                manager.get_documents_matching_target(txn, &target)
            })
            .unwrap();
        assert_eq!(keys, Some(BTreeSet::new()));
    }
}
