pub mod bloom_filter;
pub mod connection;
pub mod credentials;
pub mod listen_stream;
pub mod online_state_tracker;
pub mod persistent_stream;
pub mod remote_event;
pub mod remote_store;
pub mod serializer;
pub mod watch_change;
pub mod watch_change_aggregator;
pub mod write_stream;

pub use bloom_filter::BloomFilter;
pub use connection::{Connection, InMemoryConnection, ServerEndpoint, ServerStream, StreamHandle, StreamKind};
pub use credentials::{CredentialsProvider, StaticCredentialsProvider, StreamCredentials};
pub use online_state_tracker::{OnlineState, OnlineStateTracker};
pub use persistent_stream::{
    PersistentStream, PersistentStreamState, RemoteTimer, StreamEvent, StreamIo,
};
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::{OfflineCause, RemoteStore, RemoteSyncer, RemoteSyncerEvent};
pub use serializer::JsonProtoSerializer;
pub use watch_change::WatchChange;
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
