use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, FieldPath, ListenSequenceNumber};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    Ascending,
    Descending,
    /// Array membership; one index entry per array element.
    Contains,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexSegment {
    pub field_path: FieldPath,
    pub kind: SegmentKind,
}

impl IndexSegment {
    pub fn new(field_path: FieldPath, kind: SegmentKind) -> Self {
        Self { field_path, kind }
    }
}

/// Position of the backfill scan: every document up to and including
/// `document_key` has been indexed.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexOffset {
    pub document_key: Option<DocumentKey>,
}

impl IndexOffset {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn after(key: DocumentKey) -> Self {
        Self {
            document_key: Some(key),
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexState {
    pub sequence_number: ListenSequenceNumber,
    pub offset: IndexOffset,
    pub backfill_complete: bool,
}

/// Client-side composite index over one collection group.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldIndex {
    pub index_id: i32,
    pub collection_group: String,
    pub segments: Vec<IndexSegment>,
    pub state: IndexState,
}

impl FieldIndex {
    pub fn new(index_id: i32, collection_group: impl Into<String>, segments: Vec<IndexSegment>) -> Self {
        Self {
            index_id,
            collection_group: collection_group.into(),
            segments,
            state: IndexState::default(),
        }
    }

    pub fn array_segment(&self) -> Option<&IndexSegment> {
        self.segments
            .iter()
            .find(|segment| segment.kind == SegmentKind::Contains)
    }

    pub fn directional_segments(&self) -> impl Iterator<Item = &IndexSegment> {
        self.segments
            .iter()
            .filter(|segment| segment.kind != SegmentKind::Contains)
    }

    /// Whether two indexes cover the same fields in the same way.
    pub fn same_shape(&self, other: &FieldIndex) -> bool {
        self.collection_group == other.collection_group && self.segments == other.segments
    }

    pub fn is_servable(&self) -> bool {
        self.state.backfill_complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_array_and_directional_segments() {
        let index = FieldIndex::new(
            1,
            "rooms",
            vec![
                IndexSegment::new(FieldPath::from_dot_separated("tags").unwrap(), SegmentKind::Contains),
                IndexSegment::new(FieldPath::from_dot_separated("size").unwrap(), SegmentKind::Ascending),
            ],
        );
        assert_eq!(index.array_segment().unwrap().field_path.canonical_string(), "tags");
        assert_eq!(index.directional_segments().count(), 1);
        assert!(!index.is_servable());
    }
}
