pub mod async_queue;
pub mod client;
pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod settings;
pub mod value;

#[cfg(test)]
pub(crate) mod test_support;

pub use async_queue::{AsyncQueue, DelayedOperation, TimerId};
pub use client::{ClientComponents, FirestoreClient};
pub use self::core::{ListenOptions, ListenerId, Query, ViewSnapshot};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
pub use settings::{FirestoreSettings, PersistenceSettings};
