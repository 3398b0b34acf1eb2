use std::collections::BTreeSet;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::mutation_queue::any_queue_contains_key;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::local::remote_document_cache::RemoteDocumentCache;
use crate::firestore::local::target_cache::{orphaned_documents, remove_sentinel, TargetCache};
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, TargetId, INVALID_SEQUENCE_NUMBER};

/// Cache size that turns garbage collection off.
pub const CACHE_SIZE_UNLIMITED: i64 = -1;
pub const DEFAULT_CACHE_SIZE_BYTES: i64 = 40 * 1024 * 1024;
pub const MINIMUM_CACHE_SIZE_BYTES: i64 = 1024 * 1024;
pub const DEFAULT_PERCENTILE_TO_COLLECT: u32 = 10;
pub const DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT: usize = 1000;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LruParams {
    pub cache_size_collection_threshold: i64,
    pub percentile_to_collect: u32,
    pub maximum_sequence_numbers_to_collect: usize,
}

impl Default for LruParams {
    fn default() -> Self {
        Self {
            cache_size_collection_threshold: DEFAULT_CACHE_SIZE_BYTES,
            percentile_to_collect: DEFAULT_PERCENTILE_TO_COLLECT,
            maximum_sequence_numbers_to_collect: DEFAULT_MAX_SEQUENCE_NUMBERS_TO_COLLECT,
        }
    }
}

impl LruParams {
    pub fn with_cache_size(cache_size_bytes: i64) -> Self {
        Self {
            cache_size_collection_threshold: cache_size_bytes,
            ..Self::default()
        }
    }

    pub fn disabled() -> Self {
        Self::with_cache_size(CACHE_SIZE_UNLIMITED)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LruResults {
    pub did_run: bool,
    pub sequence_numbers_collected: usize,
    pub targets_removed: usize,
    pub documents_removed: usize,
}

impl LruResults {
    pub fn did_not_run() -> Self {
        Self::default()
    }
}

/// Least-recently-used eviction of targets and orphaned documents.
///
/// Every target and every document reference carries the sequence number of the
/// transaction that last touched it. A run picks the sequence number below which
/// the configured percentile of entries falls and removes inactive targets and
/// unpinned orphaned documents at or below it.
#[derive(Clone, Debug, Default)]
pub struct LruGarbageCollector {
    params: LruParams,
}

impl LruGarbageCollector {
    pub fn new(params: LruParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &LruParams {
        &self.params
    }

    /// Runs one collection. `active_target_ids` are targets with live listeners;
    /// `is_pinned` reports documents referenced in memory (local views, limbo).
    pub fn collect<P>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        is_pinned: P,
    ) -> FirestoreResult<LruResults>
    where
        P: Fn(&DocumentKey) -> bool,
    {
        if self.params.cache_size_collection_threshold == CACHE_SIZE_UNLIMITED {
            log::debug!("garbage collection skipped; disabled");
            return Ok(LruResults::did_not_run());
        }
        let cache_size = RemoteDocumentCache.get_size(txn)?;
        if cache_size < self.params.cache_size_collection_threshold {
            log::debug!(
                "garbage collection skipped; cache size {cache_size} is lower than threshold {}",
                self.params.cache_size_collection_threshold
            );
            return Ok(LruResults::did_not_run());
        }
        self.run_garbage_collection(txn, active_target_ids, is_pinned)
    }

    fn run_garbage_collection<P>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        active_target_ids: &BTreeSet<TargetId>,
        is_pinned: P,
    ) -> FirestoreResult<LruResults>
    where
        P: Fn(&DocumentKey) -> bool,
    {
        let target_cache = TargetCache;
        let mut sequence_numbers: Vec<ListenSequenceNumber> = target_cache
            .all_targets(txn)?
            .into_iter()
            .map(|target_data| target_data.sequence_number)
            .collect();
        let orphaned = orphaned_documents(txn)?;
        sequence_numbers.extend(orphaned.iter().map(|(_, sequence_number)| *sequence_number));

        let percentile = self.params.percentile_to_collect as usize;
        let count = (percentile * sequence_numbers.len() / 100)
            .min(self.params.maximum_sequence_numbers_to_collect);
        let upper_bound = nth_sequence_number(&mut sequence_numbers, count);

        let targets_removed = target_cache.remove_targets(txn, upper_bound, active_target_ids)?;

        let mut documents_removed = 0;
        for (key, sequence_number) in orphaned_documents(txn)? {
            if sequence_number > upper_bound || is_pinned(&key) || any_queue_contains_key(txn, &key)? {
                continue;
            }
            RemoteDocumentCache.remove_entry(txn, &key)?;
            remove_sentinel(txn, &key);
            documents_removed += 1;
        }

        log::debug!(
            "LRU garbage collection: collected {count} sequence numbers up to {upper_bound}, \
             removed {targets_removed} targets and {documents_removed} documents"
        );
        Ok(LruResults {
            did_run: true,
            sequence_numbers_collected: count,
            targets_removed,
            documents_removed,
        })
    }
}

/// The `n`th smallest sequence number, or [`INVALID_SEQUENCE_NUMBER`] when `n`
/// is zero.
fn nth_sequence_number(sequence_numbers: &mut [ListenSequenceNumber], n: usize) -> ListenSequenceNumber {
    if n == 0 || sequence_numbers.is_empty() {
        return INVALID_SEQUENCE_NUMBER;
    }
    sequence_numbers.sort_unstable();
    sequence_numbers[n.min(sequence_numbers.len()) - 1]
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::{TargetData, TargetPurpose};
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::mutation_queue::MutationQueue;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::local::target_cache::write_sentinel;
    use crate::firestore::model::{Document, Mutation, ResourcePath, SnapshotVersion, Timestamp, User};
    use crate::firestore::value::MapValue;

    fn persistence() -> Persistence {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        persistence
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn cache_orphan(txn: &mut PersistenceTransaction<'_>, path: &str) -> FirestoreResult<()> {
        let document = Document::new_found(key(path), SnapshotVersion::from_micros(1), MapValue::empty());
        RemoteDocumentCache.add_entry(txn, &document, SnapshotVersion::from_micros(1))?;
        write_sentinel(txn, &key(path))
    }

    #[test]
    fn below_threshold_does_not_run() {
        let persistence = persistence();
        let gc = LruGarbageCollector::default();
        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                cache_orphan(txn, "rooms/a")?;
                gc.collect(txn, &BTreeSet::new(), |_| false)
            })
            .unwrap();
        assert_eq!(results, LruResults::did_not_run());
    }

    #[test]
    fn removes_oldest_orphans_but_keeps_pinned_documents() {
        let persistence = persistence();
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 1,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        for path in ["rooms/a", "rooms/b", "rooms/c"] {
            persistence
                .run_transaction("seed", TransactionMode::ReadWrite, |txn| cache_orphan(txn, path))
                .unwrap();
        }
        let pinned = key("rooms/b");
        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                gc.collect(txn, &BTreeSet::new(), |candidate| candidate == &pinned)
            })
            .unwrap();
        assert!(results.did_run);
        assert_eq!(results.documents_removed, 2);

        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    RemoteDocumentCache.get_entry(txn, &key("rooms/a"))?.is_valid_document(),
                    RemoteDocumentCache.get_entry(txn, &pinned)?.is_valid_document(),
                ))
            })
            .unwrap();
        assert_eq!(remaining, (false, true));
    }

    #[test]
    fn documents_with_pending_mutations_survive_collection() {
        let persistence = persistence();
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 1,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let queue = MutationQueue::new(&User::unauthenticated());
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| {
                cache_orphan(txn, "rooms/a")?;
                cache_orphan(txn, "rooms/b")?;
                queue.add_mutation_batch(
                    txn,
                    Timestamp::new(1, 0),
                    Vec::new(),
                    vec![Mutation::set(key("rooms/a"), MapValue::empty())],
                )?;
                Ok(())
            })
            .unwrap();

        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                gc.collect(txn, &BTreeSet::new(), |_| false)
            })
            .unwrap();
        assert!(results.did_run);
        assert_eq!(results.documents_removed, 1);

        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    RemoteDocumentCache.get_entry(txn, &key("rooms/a"))?.is_valid_document(),
                    RemoteDocumentCache.get_entry(txn, &key("rooms/b"))?.is_valid_document(),
                ))
            })
            .unwrap();
        assert_eq!(remaining, (true, false));
    }

    #[test]
    fn documents_of_a_removed_target_are_collected_in_the_same_pass() {
        let persistence = persistence();
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 1,
            percentile_to_collect: 50,
            maximum_sequence_numbers_to_collect: 1000,
        });
        persistence
            .run_transaction("listen", TransactionMode::ReadWrite, |txn| {
                let target = Query::collection(ResourcePath::from_string("rooms")?).to_target();
                let data = TargetData::new(target, 2, TargetPurpose::Listen, txn.current_sequence_number());
                TargetCache.add_target_data(txn, &data)?;
                let document = Document::new_found(key("rooms/a"), SnapshotVersion::from_micros(1), MapValue::empty());
                RemoteDocumentCache.add_entry(txn, &document, SnapshotVersion::from_micros(1))?;
                TargetCache.add_matching_keys(txn, [&key("rooms/a")], 2)
            })
            .unwrap();
        persistence
            .run_transaction("seed", TransactionMode::ReadWrite, |txn| cache_orphan(txn, "halls/b"))
            .unwrap();

        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                gc.collect(txn, &BTreeSet::new(), |_| false)
            })
            .unwrap();
        assert_eq!(results.targets_removed, 1);
        assert_eq!(results.documents_removed, 1);

        let remaining = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    RemoteDocumentCache.get_entry(txn, &key("rooms/a"))?.is_valid_document(),
                    RemoteDocumentCache.get_entry(txn, &key("halls/b"))?.is_valid_document(),
                ))
            })
            .unwrap();
        assert_eq!(remaining, (false, true));
    }

    #[test]
    fn active_targets_survive_collection() {
        let persistence = persistence();
        let gc = LruGarbageCollector::new(LruParams {
            cache_size_collection_threshold: 1,
            percentile_to_collect: 100,
            maximum_sequence_numbers_to_collect: 1000,
        });
        let results = persistence
            .run_transaction("gc", TransactionMode::ReadWrite, |txn| {
                cache_orphan(txn, "rooms/a")?;
                let cache = TargetCache;
                for (id, path) in [(2, "rooms"), (4, "halls")] {
                    let target = Query::collection(ResourcePath::from_string(path)?).to_target();
                    let data = TargetData::new(target, id, TargetPurpose::Listen, txn.current_sequence_number());
                    cache.add_target_data(txn, &data)?;
                }
                let results = gc.collect(txn, &BTreeSet::from([2]), |_| false)?;
                Ok((results, cache.target_count(txn)?))
            })
            .unwrap();
        assert_eq!(results.0.targets_removed, 1);
        assert_eq!(results.1, 1);
    }
}
