use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::encoded_key::KeyBuilder;
use crate::firestore::local::kv_store::{ScanRange, Table};
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{BatchId, DocumentKey, Mutation, Overlay, ResourcePath, User};

/// Saved overlays of one user, keyed by document.
///
/// Rows are keyed `user · collection path · document id`, so the overlays of a
/// collection are one contiguous prefix scan.
#[derive(Clone, Debug)]
pub struct DocumentOverlayCache {
    user_id: String,
}

impl DocumentOverlayCache {
    pub fn new(user: &User) -> Self {
        Self {
            user_id: user.storage_key().to_string(),
        }
    }

    pub fn get_overlay(&self, txn: &PersistenceTransaction<'_>, key: &DocumentKey) -> FirestoreResult<Option<Overlay>> {
        txn.get_json(Table::DocumentOverlays, &self.overlay_key(key))
    }

    pub fn get_overlays<'k, I>(&self, txn: &PersistenceTransaction<'_>, keys: I) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>>
    where
        I: IntoIterator<Item = &'k DocumentKey>,
    {
        let mut overlays = BTreeMap::new();
        for key in keys {
            if let Some(overlay) = self.get_overlay(txn, key)? {
                overlays.insert(key.clone(), overlay);
            }
        }
        Ok(overlays)
    }

    /// Stores `mutations` as the overlays produced by batch `largest_batch_id`.
    pub fn save_overlays(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        largest_batch_id: BatchId,
        mutations: &BTreeMap<DocumentKey, Mutation>,
    ) -> FirestoreResult<()> {
        for (key, mutation) in mutations {
            let overlay = Overlay::new(largest_batch_id, mutation.clone());
            txn.put_json(Table::DocumentOverlays, self.overlay_key(key), &overlay)?;
        }
        Ok(())
    }

    pub fn remove_overlay(&self, txn: &mut PersistenceTransaction<'_>, key: &DocumentKey) {
        txn.delete(Table::DocumentOverlays, self.overlay_key(key));
    }

    /// Deletes every overlay last written by `batch_id`.
    pub fn remove_overlays_for_batch_id(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        batch_id: BatchId,
    ) -> FirestoreResult<BTreeSet<DocumentKey>> {
        let mut removed = BTreeSet::new();
        for (row_key, overlay) in txn.scan_json::<Overlay>(Table::DocumentOverlays, &self.user_range())? {
            if overlay.largest_batch_id == batch_id {
                txn.delete(Table::DocumentOverlays, row_key);
                removed.insert(overlay.key().clone());
            }
        }
        Ok(removed)
    }

    /// Overlays of documents directly inside `collection` whose batch id is
    /// greater than `since_batch_id`.
    pub fn get_overlays_for_collection(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let prefix = KeyBuilder::new()
            .string(&self.user_id)
            .path(collection)
            .build();
        Ok(txn
            .scan_json::<Overlay>(Table::DocumentOverlays, &ScanRange::prefix(prefix))?
            .into_iter()
            .filter(|(_, overlay)| overlay.largest_batch_id > since_batch_id)
            .map(|(_, overlay)| (overlay.key().clone(), overlay))
            .collect())
    }

    /// Overlays in `collection_group` newer than `since_batch_id`, in batch
    /// order. Whole batches are returned, so the result may exceed `count`.
    pub fn get_overlays_for_collection_group(
        &self,
        txn: &PersistenceTransaction<'_>,
        collection_group: &str,
        since_batch_id: BatchId,
        count: usize,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Overlay>> {
        let mut by_batch: BTreeMap<BatchId, Vec<Overlay>> = BTreeMap::new();
        for (_, overlay) in txn.scan_json::<Overlay>(Table::DocumentOverlays, &self.user_range())? {
            if overlay.largest_batch_id > since_batch_id && overlay.key().has_collection_id(collection_group) {
                by_batch.entry(overlay.largest_batch_id).or_default().push(overlay);
            }
        }
        let mut result = BTreeMap::new();
        for overlays in by_batch.into_values() {
            if result.len() >= count {
                break;
            }
            for overlay in overlays {
                result.insert(overlay.key().clone(), overlay);
            }
        }
        Ok(result)
    }

    fn overlay_key(&self, key: &DocumentKey) -> Vec<u8> {
        KeyBuilder::new()
            .string(&self.user_id)
            .path(&key.collection_path())
            .string(key.id())
            .build()
    }

    fn user_range(&self) -> ScanRange {
        ScanRange::prefix(KeyBuilder::new().string(&self.user_id).build())
    }
}
