mod database_id;
mod document;
mod document_key;
mod field_index;
mod field_path;
mod geo_point;
mod mutation;
mod mutation_batch;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentState, DocumentType};
pub use document_key::DocumentKey;
pub use field_index::{FieldIndex, IndexOffset, IndexSegment, IndexState, SegmentKind};
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use mutation::{
    calculate_overlay_mutation, extract_transform_base_value, FieldMask, FieldTransform,
    Mutation, MutationKind, MutationResult, Precondition, TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;

/// Identifier of a listen target. Even ids belong to the local store, odd ids to
/// in-memory limbo resolution targets.
pub type TargetId = i32;

/// Identifier of a mutation batch, strictly increasing per local store.
pub type BatchId = i32;

/// Monotonic counter used to order target and document activity for LRU collection.
pub type ListenSequenceNumber = i64;

pub const BATCH_ID_UNKNOWN: BatchId = -1;
pub const INVALID_SEQUENCE_NUMBER: ListenSequenceNumber = -1;
