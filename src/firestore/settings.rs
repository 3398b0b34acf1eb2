use std::path::PathBuf;
use std::time::Duration;

use crate::firestore::core::sync_engine::DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS;
use crate::firestore::error::{invalid_argument, FirestoreResult};
use crate::firestore::local::index_backfiller::DEFAULT_MAX_DOCUMENTS_TO_PROCESS;
use crate::firestore::local::lru_garbage_collector::{
    LruParams, CACHE_SIZE_UNLIMITED, DEFAULT_CACHE_SIZE_BYTES, DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
    DEFAULT_PERCENTILE_TO_COLLECT, MINIMUM_CACHE_SIZE_BYTES,
};
use crate::firestore::local::persistence::CLIENT_METADATA_REFRESH_INTERVAL_MS;
use crate::firestore::local::query_engine::{
    DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE, DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
};

pub const DEFAULT_GC_INITIAL_DELAY: Duration = Duration::from_secs(60);
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_INDEX_BACKFILL_INITIAL_DELAY: Duration = Duration::from_secs(15);
pub const DEFAULT_INDEX_BACKFILL_INTERVAL: Duration = Duration::from_secs(60);
/// Interval of the multi-client heartbeat that refreshes the primary lease.
pub const CLIENT_METADATA_REFRESH_INTERVAL: Duration =
    Duration::from_millis(CLIENT_METADATA_REFRESH_INTERVAL_MS as u64);

/// Where the local cache lives.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum PersistenceSettings {
    #[default]
    Memory,
    /// JSON snapshot file, rewritten after every commit.
    Disk { path: PathBuf },
}

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreSettings {
    pub persistence: PersistenceSettings,
    /// Lets several clients share one persistence store, with one of them
    /// elected primary.
    pub synchronize_tabs: bool,
    pub cache_size_bytes: i64,
    pub gc_initial_delay: Duration,
    pub gc_interval: Duration,
    pub lru_percentile_to_collect: u32,
    pub lru_max_sequence_numbers_to_collect: usize,
    pub max_concurrent_limbo_resolutions: usize,
    pub index_auto_creation_enabled: bool,
    pub index_auto_creation_min_collection_size: usize,
    pub relative_index_read_cost_per_document: f64,
    pub index_backfill_initial_delay: Duration,
    pub index_backfill_interval: Duration,
    pub index_backfill_max_documents: usize,
}

impl Default for FirestoreSettings {
    fn default() -> Self {
        Self {
            persistence: PersistenceSettings::Memory,
            synchronize_tabs: false,
            cache_size_bytes: DEFAULT_CACHE_SIZE_BYTES,
            gc_initial_delay: DEFAULT_GC_INITIAL_DELAY,
            gc_interval: DEFAULT_GC_INTERVAL,
            lru_percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            lru_max_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
            index_backfill_initial_delay: DEFAULT_INDEX_BACKFILL_INITIAL_DELAY,
            index_backfill_interval: DEFAULT_INDEX_BACKFILL_INTERVAL,
            index_backfill_max_documents: DEFAULT_MAX_DOCUMENTS_TO_PROCESS,
        }
    }
}

impl FirestoreSettings {
    pub fn with_persistence(mut self, persistence: PersistenceSettings) -> Self {
        self.persistence = persistence;
        self
    }

    pub fn with_disk_persistence(self, path: impl Into<PathBuf>) -> Self {
        self.with_persistence(PersistenceSettings::Disk { path: path.into() })
    }

    pub fn with_synchronize_tabs(mut self, enabled: bool) -> Self {
        self.synchronize_tabs = enabled;
        self
    }

    pub fn with_cache_size_bytes(mut self, cache_size_bytes: i64) -> Self {
        self.cache_size_bytes = cache_size_bytes;
        self
    }

    pub fn with_gc_schedule(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.gc_initial_delay = initial_delay;
        self.gc_interval = interval;
        self
    }

    pub fn with_max_concurrent_limbo_resolutions(mut self, max: usize) -> Self {
        self.max_concurrent_limbo_resolutions = max;
        self
    }

    pub fn with_index_auto_creation(mut self, enabled: bool) -> Self {
        self.index_auto_creation_enabled = enabled;
        self
    }

    pub fn with_index_backfill_schedule(mut self, initial_delay: Duration, interval: Duration) -> Self {
        self.index_backfill_initial_delay = initial_delay;
        self.index_backfill_interval = interval;
        self
    }

    pub fn validate(&self) -> FirestoreResult<()> {
        if self.cache_size_bytes != CACHE_SIZE_UNLIMITED && self.cache_size_bytes < MINIMUM_CACHE_SIZE_BYTES {
            return Err(invalid_argument(format!(
                "cache size must be set to at least {MINIMUM_CACHE_SIZE_BYTES} bytes"
            )));
        }
        if self.max_concurrent_limbo_resolutions == 0 {
            return Err(invalid_argument(
                "max concurrent limbo resolutions must be at least 1",
            ));
        }
        if self.lru_percentile_to_collect > 100 {
            return Err(invalid_argument("LRU percentile must be between 0 and 100"));
        }
        if !(self.relative_index_read_cost_per_document > 0.0) {
            return Err(invalid_argument(
                "relative index read cost must be a positive number",
            ));
        }
        if let PersistenceSettings::Disk { path } = &self.persistence {
            if path.as_os_str().is_empty() {
                return Err(invalid_argument("disk persistence requires a path"));
            }
        }
        Ok(())
    }

    pub fn gc_enabled(&self) -> bool {
        self.cache_size_bytes != CACHE_SIZE_UNLIMITED
    }

    pub fn lru_params(&self) -> LruParams {
        LruParams {
            cache_size_collection_threshold: self.cache_size_bytes,
            percentile_to_collect: self.lru_percentile_to_collect,
            maximum_sequence_numbers_to_collect: self.lru_max_sequence_numbers_to_collect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[test]
    fn defaults_are_valid() {
        let settings = FirestoreSettings::default();
        settings.validate().unwrap();
        assert_eq!(settings.cache_size_bytes, 40 * 1024 * 1024);
        assert_eq!(settings.persistence, PersistenceSettings::Memory);
        assert!(settings.gc_enabled());
    }

    #[test]
    fn small_cache_is_rejected() {
        let err = FirestoreSettings::default()
            .with_cache_size_bytes(1024)
            .validate()
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }

    #[test]
    fn unlimited_cache_disables_gc() {
        let settings = FirestoreSettings::default().with_cache_size_bytes(CACHE_SIZE_UNLIMITED);
        settings.validate().unwrap();
        assert!(!settings.gc_enabled());
        assert_eq!(settings.lru_params(), LruParams::disabled());
    }

    #[test]
    fn disk_persistence_needs_a_path() {
        let err = FirestoreSettings::default()
            .with_disk_persistence("")
            .validate()
            .unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::InvalidArgument);
    }
}
