use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::firestore::core::target::{Target, TargetData};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::{KeyBuilder, KeyReader};
use crate::firestore::local::kv_store::{KvTransaction, ScanRange, Table};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{DocumentKey, ListenSequenceNumber, SnapshotVersion, TargetId};
use crate::util::fail;

/// Target id whose rows in the document/target tables are LRU sentinels.
pub const SENTINEL_TARGET_ID: TargetId = 0;

/// Single row of target-wide metadata.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetGlobal {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
    pub target_count: i64,
}

/// Persisted targets and the documents each one matches.
#[derive(Clone, Copy, Debug, Default)]
pub struct TargetCache;

impl TargetCache {
    pub(crate) fn ensure_target_global(txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        if txn.get(Table::TargetGlobal, &global_key())?.is_none() {
            txn.put_json(Table::TargetGlobal, global_key(), &TargetGlobal::default())?;
        }
        Ok(())
    }

    /// The metadata row is created on start; a missing row means the cache is corrupt.
    pub(crate) fn read_target_global(txn: &KvTransaction<'_>) -> FirestoreResult<TargetGlobal> {
        match txn.get_json::<TargetGlobal>(Table::TargetGlobal, &global_key())? {
            Some(global) => Ok(global),
            None => fail("missing TargetGlobal row"),
        }
    }

    fn save_target_global(txn: &mut KvTransaction<'_>, global: &TargetGlobal) -> FirestoreResult<()> {
        txn.put_json(Table::TargetGlobal, global_key(), global)
    }

    pub fn metadata(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<TargetGlobal> {
        Self::read_target_global(txn)
    }

    pub fn allocate_target_id(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<TargetId> {
        let mut global = Self::read_target_global(txn)?;
        global.highest_target_id = TargetIdGenerator::for_target_cache(global.highest_target_id).next();
        Self::save_target_global(txn, &global)?;
        Ok(global.highest_target_id)
    }

    pub fn last_remote_snapshot_version(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<SnapshotVersion> {
        Ok(Self::read_target_global(txn)?.last_remote_snapshot_version)
    }

    pub fn highest_sequence_number(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
        Ok(Self::read_target_global(txn)?.highest_listen_sequence_number)
    }

    pub fn set_targets_metadata(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        highest_listen_sequence_number: ListenSequenceNumber,
        last_remote_snapshot_version: SnapshotVersion,
    ) -> FirestoreResult<()> {
        let mut global = Self::read_target_global(txn)?;
        global.highest_listen_sequence_number =
            global.highest_listen_sequence_number.max(highest_listen_sequence_number);
        global.last_remote_snapshot_version = last_remote_snapshot_version;
        Self::save_target_global(txn, &global)
    }

    pub fn add_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        txn.put_json(
            Table::QueryTargets,
            query_target_key(&target_data.target.canonical_id(), target_data.target_id),
            &target_data.target_id,
        )?;
        let mut global = Self::read_target_global(txn)?;
        global.target_count += 1;
        global.highest_target_id = global.highest_target_id.max(target_data.target_id);
        global.highest_listen_sequence_number =
            global.highest_listen_sequence_number.max(target_data.sequence_number);
        Self::save_target_global(txn, &global)
    }

    pub fn update_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        self.save_target_data(txn, target_data)?;
        let mut global = Self::read_target_global(txn)?;
        if target_data.sequence_number > global.highest_listen_sequence_number {
            global.highest_listen_sequence_number = target_data.sequence_number;
            Self::save_target_global(txn, &global)?;
        }
        Ok(())
    }

    /// Drops `target_data` and its document references. Documents it held
    /// keep the target's sequence number, so the collection pass removing
    /// the target can also remove them.
    pub fn remove_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        let target_id = target_data.target_id;
        for key in self.get_matching_keys_for_target_id(txn, target_id)? {
            txn.delete(Table::TargetDocuments, target_document_key(target_id, &key));
            txn.delete(Table::DocumentTargets, document_target_key(&key, target_id));
            let sequence_number = match read_sentinel(txn, &key)? {
                Some(existing) => existing.max(target_data.sequence_number),
                None => target_data.sequence_number,
            };
            put_sentinel(txn, &key, sequence_number)?;
        }
        txn.delete(Table::Targets, target_key(target_data.target_id));
        txn.delete(
            Table::QueryTargets,
            query_target_key(&target_data.target.canonical_id(), target_data.target_id),
        );
        let mut global = Self::read_target_global(txn)?;
        global.target_count = (global.target_count - 1).max(0);
        Self::save_target_global(txn, &global)
    }

    /// Removes every target with a sequence number at or below `upper_bound`
    /// that is not in `active_target_ids`. Returns how many were removed.
    pub fn remove_targets(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        upper_bound: ListenSequenceNumber,
        active_target_ids: &BTreeSet<TargetId>,
    ) -> FirestoreResult<usize> {
        let mut removed = 0;
        for target_data in self.all_targets(txn)? {
            if target_data.sequence_number <= upper_bound
                && !active_target_ids.contains(&target_data.target_id)
            {
                self.remove_target_data(txn, &target_data)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn all_targets(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<Vec<TargetData>> {
        Ok(txn
            .scan_json::<TargetData>(Table::Targets, &ScanRange::all())?
            .into_iter()
            .map(|(_, target_data)| target_data)
            .collect())
    }

    pub fn target_count(&self, txn: &PersistenceTransaction<'_>) -> FirestoreResult<i64> {
        Ok(Self::read_target_global(txn)?.target_count)
    }

    /// Cached data for a target equal to `target`, if one was allocated.
    pub fn get_target_data(&self, txn: &PersistenceTransaction<'_>, target: &Target) -> FirestoreResult<Option<TargetData>> {
        let prefix = KeyBuilder::new().string(&target.canonical_id()).build();
        for (_, target_id) in txn.scan_json::<TargetId>(Table::QueryTargets, &ScanRange::prefix(prefix))? {
            if let Some(target_data) = self.get_target_data_for_target_id(txn, target_id)? {
                if &target_data.target == target {
                    return Ok(Some(target_data));
                }
            }
        }
        Ok(None)
    }

    pub fn get_target_data_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<Option<TargetData>> {
        txn.get_json(Table::Targets, &target_key(target_id))
    }

    pub fn add_matching_keys<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            txn.put_json(Table::TargetDocuments, target_document_key(target_id, key), &())?;
            txn.put_json(Table::DocumentTargets, document_target_key(key, target_id), &())?;
            write_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn remove_matching_keys<'k, I>(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        keys: I,
        target_id: TargetId,
    ) -> FirestoreResult<()>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        for key in keys {
            txn.delete(Table::TargetDocuments, target_document_key(target_id, key));
            txn.delete(Table::DocumentTargets, document_target_key(key, target_id));
            write_sentinel(txn, key)?;
        }
        Ok(())
    }

    pub fn get_matching_keys_for_target_id(
        &self,
        txn: &PersistenceTransaction<'_>,
        target_id: TargetId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let prefix = KeyBuilder::new().int(i64::from(target_id)).build();
        let mut keys = BTreeSet::new();
        for (row_key, _) in txn.scan(Table::TargetDocuments, &ScanRange::prefix(prefix))? {
            let mut reader = KeyReader::new(&row_key);
            reader.int()?;
            keys.insert(DocumentKey::from_path(reader.path()?)?);
        }
        Ok(keys)
    }

    /// Whether any target other than the sentinel references `key`.
    pub fn contains_key(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<bool> {
        Ok(document_target_ids(txn, key)?
            .into_iter()
            .any(|target_id| target_id != SENTINEL_TARGET_ID))
    }

    fn save_target_data(&self, txn: &mut PersistenceTransaction<'_>, target_data: &TargetData) -> FirestoreResult<()> {
        txn.put_json(Table::Targets, target_key(target_data.target_id), target_data)
    }
}

/// Stamps `key` with the transaction's sequence number so LRU collection can
/// tell when it was last referenced.
pub(crate) fn write_sentinel(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<()> {
    let sequence_number = txn.current_sequence_number();
    put_sentinel(txn, key, sequence_number)
}

fn read_sentinel(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Option<ListenSequenceNumber>> {
    txn.get_json(Table::DocumentTargets, &document_target_key(key, SENTINEL_TARGET_ID))
}

fn put_sentinel(
    txn: &mut PersistenceTransaction<'_>,
    key: &DocumentKey,
    sequence_number: ListenSequenceNumber,
) -> FirestoreResult<()> {
    txn.put_json(
        Table::TargetDocuments,
        target_document_key(SENTINEL_TARGET_ID, key),
        &sequence_number,
    )?;
    txn.put_json(
        Table::DocumentTargets,
        document_target_key(key, SENTINEL_TARGET_ID),
        &sequence_number,
    )
}

pub(crate) fn remove_sentinel(txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
    txn.delete(Table::TargetDocuments, target_document_key(SENTINEL_TARGET_ID, key));
    txn.delete(Table::DocumentTargets, document_target_key(key, SENTINEL_TARGET_ID));
}

/// Documents referenced only by their sentinel, with the sentinel's sequence number.
pub(crate) fn orphaned_documents(
    txn: &PersistenceTransaction<'_>,
) -> FirestoreResult<Vec<(DocumentKey, ListenSequenceNumber)>> {
    let mut orphaned = Vec::new();
    let mut current: Option<(DocumentKey, Option<ListenSequenceNumber>, bool)> = None;
    for (row_key, value) in txn.scan(Table::DocumentTargets, &ScanRange::all())? {
        let mut reader = KeyReader::new(&row_key);
        let key = DocumentKey::from_path(reader.path()?)?;
        let target_id = reader.int()? as TargetId;

        if current.as_ref().map(|(k, _, _)| k != &key).unwrap_or(true) {
            if let Some((done, Some(sequence_number), false)) = current.take() {
                orphaned.push((done, sequence_number));
            }
            current = Some((key, None, false));
        }
        if let Some((_, sentinel, referenced)) = current.as_mut() {
            if target_id == SENTINEL_TARGET_ID {
                *sentinel = serde_json::from_slice(&value).ok();
            } else {
                *referenced = true;
            }
        }
    }
    if let Some((done, Some(sequence_number), false)) = current {
        orphaned.push((done, sequence_number));
    }
    Ok(orphaned)
}

fn document_target_ids(txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Vec<TargetId>> {
    let prefix = KeyBuilder::new().path(key.path()).build();
    txn.scan(Table::DocumentTargets, &ScanRange::prefix(prefix))?
        .into_iter()
        .map(|(row_key, _)| {
            let mut reader = KeyReader::new(&row_key);
            reader.path()?;
            Ok(reader.int()? as TargetId)
        })
        .collect()
}

fn global_key() -> Vec<u8> {
    KeyBuilder::new().string("target_global").build()
}

fn target_key(target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new().int(i64::from(target_id)).build()
}

fn query_target_key(canonical_id: &str, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new()
        .string(canonical_id)
        .int(i64::from(target_id))
        .build()
}

fn target_document_key(target_id: TargetId, key: &DocumentKey) -> Vec<u8> {
    KeyBuilder::new()
        .int(i64::from(target_id))
        .path(key.path())
        .build()
}

fn document_target_key(key: &DocumentKey, target_id: TargetId) -> Vec<u8> {
    KeyBuilder::new()
        .path(key.path())
        .int(i64::from(target_id))
        .build()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::TargetPurpose;
    use crate::firestore::local::kv_store::MemoryKvStore;
    use crate::firestore::local::persistence::{Persistence, TransactionMode};
    use crate::firestore::model::ResourcePath;

    fn persistence() -> Persistence {
        let persistence = Persistence::new(Arc::new(MemoryKvStore::new()), "client", false);
        persistence.start().unwrap();
        persistence
    }

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn rooms_target() -> Target {
        Query::collection(ResourcePath::from_string("rooms").unwrap()).to_target()
    }

    #[test]
    fn allocates_even_ids_and_finds_targets_by_shape() {
        let persistence = persistence();
        let cache = TargetCache;
        let data = persistence
            .run_transaction("allocate", TransactionMode::ReadWritePrimary, |txn| {
                let target_id = cache.allocate_target_id(txn)?;
                let data = TargetData::new(rooms_target(), target_id, TargetPurpose::Listen, txn.current_sequence_number());
                cache.add_target_data(txn, &data)?;
                Ok(data)
            })
            .unwrap();
        assert_eq!(data.target_id, 2);

        let found = persistence
            .run_transaction("lookup", TransactionMode::ReadOnly, |txn| cache.get_target_data(txn, &rooms_target()))
            .unwrap();
        assert_eq!(found, Some(data));
        let count = persistence
            .run_transaction("count", TransactionMode::ReadOnly, |txn| cache.target_count(txn))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn tracks_matching_keys_and_orphans() {
        let persistence = persistence();
        let cache = TargetCache;
        let a = key("rooms/a");
        let b = key("rooms/b");
        persistence
            .run_transaction("keys", TransactionMode::ReadWrite, |txn| {
                cache.add_matching_keys(txn, [&a, &b], 2)?;
                cache.remove_matching_keys(txn, [&b], 2)
            })
            .unwrap();

        let (keys, contains_a, contains_b, orphans) = persistence
            .run_transaction("read", TransactionMode::ReadOnly, |txn| {
                Ok((
                    cache.get_matching_keys_for_target_id(txn, 2)?,
                    cache.contains_key(txn, &a)?,
                    cache.contains_key(txn, &b)?,
                    orphaned_documents(txn)?,
                ))
            })
            .unwrap();
        assert_eq!(keys, BTreeSet::from([a.clone()]));
        assert!(contains_a);
        assert!(!contains_b);
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].0, b);
    }
}
