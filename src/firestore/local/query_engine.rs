use std::collections::{BTreeMap, BTreeSet};

use crate::firestore::core::query::{LimitType, Query};
use crate::firestore::error::FirestoreResult;
use crate::firestore::local::index_manager::IndexType;
use crate::firestore::local::local_documents_view::LocalDocumentsView;
use crate::firestore::local::persistence::PersistenceTransaction;
use crate::firestore::model::{Document, DocumentKey, SnapshotVersion};

pub const DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE: usize = 100;
pub const DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT: f64 = 2.0;

/// Counts the documents a query execution touched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueryContext {
    documents_read_count: usize,
}

impl QueryContext {
    pub fn documents_read_count(&self) -> usize {
        self.documents_read_count
    }

    pub fn increment_documents_read_count(&mut self, amount: usize) {
        self.documents_read_count += amount;
    }
}

/// Runs queries against the local cache.
///
/// Strategies, in order: a fully backfilled index, the previous result set when
/// the target was limbo free, and finally a scan of the whole collection. A scan
/// that reads many more documents than it returns creates an index for the
/// query's shape so later runs can use the first strategy.
#[derive(Clone, Debug)]
pub struct QueryEngine {
    index_auto_creation_enabled: bool,
    index_auto_creation_min_collection_size: usize,
    relative_index_read_cost_per_document: f64,
}

impl Default for QueryEngine {
    fn default() -> Self {
        Self {
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: DEFAULT_INDEX_AUTO_CREATION_MIN_COLLECTION_SIZE,
            relative_index_read_cost_per_document: DEFAULT_RELATIVE_INDEX_READ_COST_PER_DOCUMENT,
        }
    }
}

impl QueryEngine {
    pub fn new(min_collection_size: usize, relative_read_cost: f64) -> Self {
        Self {
            index_auto_creation_enabled: true,
            index_auto_creation_min_collection_size: min_collection_size,
            relative_index_read_cost_per_document: relative_read_cost,
        }
    }

    pub fn set_index_auto_creation_enabled(&mut self, enabled: bool) {
        self.index_auto_creation_enabled = enabled;
    }

    pub fn index_auto_creation_enabled(&self) -> bool {
        self.index_auto_creation_enabled
    }

    /// Documents that may match `query`, as local views. `remote_keys` and
    /// `last_limbo_free` describe the previous synced result of the query's
    /// target, when there is one.
    pub fn get_documents_matching_query(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        last_limbo_free: SnapshotVersion,
        remote_keys: &BTreeSet<DocumentKey>,
    ) -> FirestoreResult<BTreeMap<DocumentKey, Document>> {
        if let Some(results) = self.perform_query_using_index(txn, view, query)? {
            return Ok(results);
        }
        if let Some(results) = self.perform_query_using_remote_keys(txn, view, query, remote_keys, last_limbo_free)? {
            return Ok(results);
        }
        let mut context = QueryContext::default();
        let results = view.get_documents_matching_query(txn, query, SnapshotVersion::min(), &mut context)?;
        if self.index_auto_creation_enabled {
            self.create_cache_indexes(txn, view, query, &context, results.len())?;
        }
        Ok(results)
    }

    fn perform_query_using_index(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() || query.is_document_query() {
            return Ok(None);
        }
        let target = query.to_target();
        if view.index_manager().get_index_type(txn, &target)? == IndexType::None {
            return Ok(None);
        }
        let Some(keys) = view.index_manager().get_documents_matching_target(txn, &target)? else {
            return Ok(None);
        };
        let documents = view.get_documents(txn, &keys)?;
        log::debug!(
            "index scan returned {} candidates for {}",
            keys.len(),
            query.canonical_id()
        );
        Ok(Some(
            documents
                .into_iter()
                .filter(|(_, document)| query.matches(document))
                .collect(),
        ))
    }

    fn perform_query_using_remote_keys(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        remote_keys: &BTreeSet<DocumentKey>,
        last_limbo_free: SnapshotVersion,
    ) -> FirestoreResult<Option<BTreeMap<DocumentKey, Document>>> {
        if query.matches_all_documents() || last_limbo_free.is_min() {
            return Ok(None);
        }
        let documents = view.get_documents(txn, remote_keys)?;
        let previous = apply_query(query, documents.into_values());
        if needs_refill(query, &previous, remote_keys, last_limbo_free) {
            return Ok(None);
        }

        let mut results: BTreeMap<DocumentKey, Document> = previous
            .into_iter()
            .map(|document| (document.key().clone(), document))
            .collect();
        let mut context = QueryContext::default();
        let updated = view.get_documents_matching_query(txn, query, last_limbo_free, &mut context)?;
        results.extend(updated);
        Ok(Some(results))
    }

    fn create_cache_indexes(
        &self,
        txn: &mut PersistenceTransaction<'_>,
        view: &LocalDocumentsView,
        query: &Query,
        context: &QueryContext,
        result_size: usize,
    ) -> FirestoreResult<()> {
        let read = context.documents_read_count();
        if read < self.index_auto_creation_min_collection_size {
            return Ok(());
        }
        if (read as f64) <= self.relative_index_read_cost_per_document * result_size as f64 {
            return Ok(());
        }
        if query.is_document_query() {
            return Ok(());
        }
        if let Some(index) = view.index_manager().create_target_indexes(txn, &query.to_target())? {
            log::debug!(
                "auto-created index {} after reading {read} documents for {result_size} results",
                index.index_id
            );
        }
        Ok(())
    }
}

/// Matching documents in query order.
fn apply_query(query: &Query, documents: impl IntoIterator<Item = Document>) -> Vec<Document> {
    let mut matching: Vec<Document> = documents
        .into_iter()
        .filter(|document| query.matches(document))
        .collect();
    matching.sort_by(|left, right| query.compare_documents(left, right));
    matching
}

/// Whether a limit query's previous page can no longer be trusted: a document
/// left the result, or the document at the limit edge changed after the last
/// limbo-free snapshot.
fn needs_refill(
    query: &Query,
    sorted_previous: &[Document],
    remote_keys: &BTreeSet<DocumentKey>,
    last_limbo_free: SnapshotVersion,
) -> bool {
    if !query.has_limit() {
        return false;
    }
    if remote_keys.len() != sorted_previous.len() {
        return true;
    }
    let edge = match query.limit_type() {
        LimitType::First => sorted_previous.last(),
        LimitType::Last => sorted_previous.first(),
    };
    match edge {
        None => false,
        Some(document) => {
            document.has_pending_writes() || document.version() > last_limbo_free
        }
    }
}
