pub mod document_overlay_cache;
pub mod encoded_key;
#[cfg(not(target_arch = "wasm32"))]
pub mod file_kv_store;
pub mod index_backfiller;
pub mod index_manager;
pub mod kv_store;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod shared_client_state;
pub mod target_cache;

pub use document_overlay_cache::DocumentOverlayCache;
#[cfg(not(target_arch = "wasm32"))]
pub use file_kv_store::FileKvStore;
pub use index_backfiller::IndexBackfiller;
pub use index_manager::{IndexManager, IndexType};
pub use kv_store::{KvStore, KvTransaction, MemoryKvStore, ScanRange, Table, WriteBatch};
pub use local_documents_view::LocalDocumentsView;
pub use local_store::{LocalStore, LocalViewChanges, LocalWriteResult, QueryResult, UserChangeResult};
pub use lru_garbage_collector::{
    LruGarbageCollector, LruParams, LruResults, CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES,
    MINIMUM_CACHE_SIZE_BYTES,
};
pub use mutation_queue::MutationQueue;
pub use persistence::{is_primary_lease_lost, Persistence, PersistenceTransaction, TransactionMode};
pub use query_engine::QueryEngine;
pub use reference_set::ReferenceSet;
pub use remote_document_cache::RemoteDocumentCache;
pub use shared_client_state::{
    MutationBatchState, QueryTargetState, SharedClientBus, SharedClientEvent, SharedClientState,
};
pub use target_cache::TargetCache;
