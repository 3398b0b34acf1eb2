pub mod event_manager;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod view;

pub use event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
pub use query::{Bound, FieldFilter, FilterOperator, LimitType, OrderBy, OrderDirection, Query};
pub use sync_engine::{OnlineStateSource, SyncEngine, WriteCallback, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
pub use target::{Target, TargetData, TargetPurpose};
pub use target_id_generator::TargetIdGenerator;
pub use view::{
    ChangeType, DocumentSet, DocumentViewChange, LimboDocumentChange, SyncState, View, ViewChange, ViewSnapshot,
};
