//! Offline-first document cache and synchronization engine for Cloud Firestore.
//!
//! The crate keeps a crash-recoverable local copy of remote documents, lets callers
//! read and write while disconnected, and reconciles the local state with the backend
//! through the Listen and Write streams.

pub mod firestore;
pub mod platform;
pub mod util;
