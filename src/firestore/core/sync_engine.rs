use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use async_channel::Sender;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, ListenerId, QueryListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::target::{TargetData, TargetPurpose};
use crate::firestore::core::target_id_generator::TargetIdGenerator;
use crate::firestore::core::view::{ChangeType, LimboDocumentChange, View, ViewChange, ViewSnapshot};
use crate::firestore::error::{
    cancelled, is_transient_persistence_error, unavailable, FirestoreError, FirestoreErrorCode,
    FirestoreResult,
};
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::local_store::{LocalStore, LocalViewChanges};
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::persistence::is_primary_lease_lost;
use crate::firestore::local::reference_set::ReferenceSet;
use crate::firestore::local::shared_client_state::{
    MutationBatchState, QueryTargetState, SharedClientEnvelope, SharedClientEvent, SharedClientState,
};
use crate::firestore::model::{
    BatchId, Document, DocumentKey, MutationBatch, MutationBatchResult, Mutation, SnapshotVersion,
    TargetId, User, BATCH_ID_UNKNOWN, INVALID_SEQUENCE_NUMBER,
};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::persistent_stream::StreamEvent;
use crate::firestore::remote::remote_event::{RemoteEvent, TargetChange};
use crate::firestore::remote::remote_store::{RemoteStore, RemoteSyncer, RemoteSyncerEvent};
use crate::util::{hard_assert, PartialObserver};

/// Default bound on limbo documents resolved at the same time.
pub const DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS: usize = 100;

/// One-shot completion of a write or of a pending-writes wait.
pub type WriteCallback = Sender<FirestoreResult<()>>;

fn resolve(callback: WriteCallback, result: FirestoreResult<()>) {
    // The waiter may have gone away; nothing to report then.
    let _ = callback.try_send(result);
}

/// Where an online state change came from. Secondary clients follow the
/// primary's online state and ignore their own remote store.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OnlineStateSource {
    RemoteStore,
    SharedClientState,
}

struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Default)]
struct QueryViews {
    by_query: HashMap<String, QueryView>,
    by_target: BTreeMap<TargetId, Vec<Query>>,
}

struct LimboResolution {
    key: DocumentKey,
    /// Set once the server sent the document for this target, so the key is
    /// reported as part of the target's remote keys.
    received_document: bool,
}

struct LimboTracker {
    max_concurrent: usize,
    enqueued: VecDeque<DocumentKey>,
    active_by_key: BTreeMap<DocumentKey, TargetId>,
    active_by_target: BTreeMap<TargetId, LimboResolution>,
    references: ReferenceSet,
    target_ids: TargetIdGenerator,
}

impl LimboTracker {
    fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent,
            enqueued: VecDeque::new(),
            active_by_key: BTreeMap::new(),
            active_by_target: BTreeMap::new(),
            references: ReferenceSet::new(),
            target_ids: TargetIdGenerator::for_sync_engine(),
        }
    }
}

/// Read-only view of the engine handed to the remote store.
struct SyncerView<'a> {
    local_store: &'a LocalStore,
    query_views: &'a QueryViews,
    limbo: &'a LimboTracker,
}

impl RemoteSyncer for SyncerView<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        if let Some(resolution) = self.limbo.active_by_target.get(&target_id) {
            let mut keys = BTreeSet::new();
            if resolution.received_document {
                keys.insert(resolution.key.clone());
            }
            return keys;
        }
        let mut keys = BTreeSet::new();
        for query in self.query_views.by_target.get(&target_id).into_iter().flatten() {
            if let Some(query_view) = self.query_views.by_query.get(&query.canonical_id()) {
                keys.extend(query_view.view.synced_documents().iter().cloned());
            }
        }
        keys
    }

    fn next_mutation_batch(&self, after: BatchId) -> FirestoreResult<Option<MutationBatch>> {
        self.local_store.next_mutation_batch(Some(after))
    }

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
        self.local_store.last_remote_snapshot_version()
    }
}

// Borrows the fields the remote store reads while leaving `remote_store`
// free for a mutable borrow.
macro_rules! remote_syncer {
    ($engine:ident) => {
        SyncerView {
            local_store: &$engine.local_store,
            query_views: &$engine.query_views,
            limbo: &$engine.limbo,
        }
    };
}

/// Coordinates the local store, the remote store and the views of all active
/// queries.
///
/// Local writes and remote events are applied to the local store first; the
/// resulting document changes then flow into every view, and the snapshots
/// are handed to the [`EventManager`]. Documents that a view holds locally
/// but the server does not report are resolved through dedicated limbo
/// targets with odd ids.
///
/// With multi-client persistence only the primary client talks to the
/// backend. Secondary clients keep views for their own listeners and learn
/// about changes through [`SharedClientState`] notifications.
pub struct SyncEngine {
    local_store: LocalStore,
    remote_store: RemoteStore,
    event_manager: EventManager,
    shared_client_state: SharedClientState,
    current_user: User,
    is_primary: Option<bool>,
    online_state: OnlineState,
    query_views: QueryViews,
    limbo: LimboTracker,
    mutation_user_callbacks: HashMap<User, BTreeMap<BatchId, WriteCallback>>,
    pending_writes_callbacks: BTreeMap<BatchId, Vec<WriteCallback>>,
    /// Keys of batches written or announced by any client, so their views can
    /// be refreshed after another client removed the batch from persistence.
    batch_keys: BTreeMap<BatchId, BTreeSet<DocumentKey>>,
}

impl SyncEngine {
    pub fn new(
        local_store: LocalStore,
        remote_store: RemoteStore,
        shared_client_state: SharedClientState,
        max_concurrent_limbo_resolutions: usize,
    ) -> Self {
        let current_user = local_store.user().clone();
        Self {
            local_store,
            remote_store,
            event_manager: EventManager::new(),
            shared_client_state,
            current_user,
            is_primary: None,
            online_state: OnlineState::Unknown,
            query_views: QueryViews::default(),
            limbo: LimboTracker::new(max_concurrent_limbo_resolutions),
            mutation_user_callbacks: HashMap::new(),
            pending_writes_callbacks: BTreeMap::new(),
            batch_keys: BTreeMap::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn remote_store(&self) -> &RemoteStore {
        &self.remote_store
    }

    pub fn shared_client_state(&self) -> &SharedClientState {
        &self.shared_client_state
    }

    pub fn shared_client_state_mut(&mut self) -> &mut SharedClientState {
        &mut self.shared_client_state
    }

    pub fn current_user(&self) -> &User {
        &self.current_user
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn is_primary_client(&self) -> bool {
        self.is_primary == Some(true)
    }

    /// Keys currently being resolved or waiting for resolution.
    pub fn limbo_documents(&self) -> BTreeSet<DocumentKey> {
        self.limbo
            .active_by_key
            .keys()
            .chain(self.limbo.enqueued.iter())
            .cloned()
            .collect()
    }

    pub fn active_limbo_resolutions(&self) -> BTreeMap<DocumentKey, TargetId> {
        self.limbo.active_by_key.clone()
    }

    /// Applies the persistence layer's primary state and starts the network.
    pub fn start(&mut self) -> FirestoreResult<()> {
        let is_primary = self.local_store.persistence().is_primary();
        self.apply_primary_state(is_primary)?;
        let events = self.remote_store.start(&remote_syncer!(self))?;
        self.process_remote_events(events)
    }

    pub fn shutdown(&mut self) -> FirestoreResult<()> {
        let events = self.remote_store.shutdown();
        self.process_remote_events(events)?;
        self.shared_client_state.shutdown();
        self.reject_outstanding_pending_writes_callbacks("the client was terminated");
        Ok(())
    }

    /// Registers a listener. The first listener of a query allocates its
    /// target and starts listening to it.
    pub fn listen(
        &mut self,
        query: Query,
        options: ListenOptions,
        observer: PartialObserver<ViewSnapshot>,
    ) -> FirestoreResult<ListenerId> {
        let initial_snapshot = if self.event_manager.is_first_listener(&query) {
            match self.listen_to_query(&query, true) {
                Ok(snapshot) => Some(snapshot),
                Err(err) => {
                    log::warn!("failed to listen to query: {err}");
                    observer.notify_error(&err);
                    return Err(err);
                }
            }
        } else {
            None
        };
        let listener = QueryListener::new(query, options, observer);
        Ok(self.event_manager.add_listener(listener, initial_snapshot))
    }

    /// Removes a listener. The last listener of a query releases its target.
    pub fn unlisten(&mut self, listener_id: ListenerId) -> FirestoreResult<()> {
        match self.event_manager.remove_listener(listener_id) {
            Some(query) => self.unlisten_from_query(&query, true),
            None => Ok(()),
        }
    }

    /// Applies `mutations` locally and queues them for the backend. The
    /// callback completes once the backend accepted or rejected the batch.
    pub fn write(&mut self, mutations: Vec<Mutation>, callback: WriteCallback) -> FirestoreResult<()> {
        let result = match self.local_store.write_locally(mutations) {
            Ok(result) => result,
            Err(err) => {
                log::warn!("failed to persist write: {err}");
                resolve(callback, Err(err));
                return Ok(());
            }
        };
        let batch_id = result.batch_id;
        self.batch_keys
            .insert(batch_id, result.changes.keys().cloned().collect());
        self.shared_client_state.add_pending_mutation(batch_id);
        self.mutation_user_callbacks
            .entry(self.current_user.clone())
            .or_default()
            .insert(batch_id, callback);
        self.emit_new_snaps_and_notify_local_store(&result.changes, None)?;
        self.fill_write_pipeline()
    }

    /// Completes `callback` once every batch that is pending now has been
    /// acknowledged or rejected.
    pub fn register_pending_writes_callback(&mut self, callback: WriteCallback) {
        if !self.remote_store.can_use_network() {
            log::debug!("the network is disabled; pending writes will not complete until it is enabled");
        }
        match self.local_store.get_highest_unacknowledged_batch_id() {
            Ok(BATCH_ID_UNKNOWN) => resolve(callback, Ok(())),
            Ok(batch_id) => self
                .pending_writes_callbacks
                .entry(batch_id)
                .or_default()
                .push(callback),
            Err(err) => resolve(callback, Err(err)),
        }
    }

    pub fn get_document_from_cache(&self, key: &DocumentKey) -> FirestoreResult<Option<Document>> {
        let document = self.local_store.read_document(key)?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(
                "failed to get document from cache; the document may exist on the server",
            ))
        }
    }

    /// Runs `query` against the cache only.
    pub fn get_documents_from_cache(&self, query: &Query) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys.clone());
        let changes = view.compute_doc_changes(&result.documents, None);
        let change = view.apply_changes(changes, false, None, false);
        Ok(change
            .snapshot
            .unwrap_or_else(|| view.compute_initial_snapshot()))
    }

    pub fn enable_network(&mut self) -> FirestoreResult<()> {
        let persistence = self.local_store.persistence().clone();
        let is_primary = persistence.set_network_enabled(true)?;
        self.apply_primary_state(is_primary)?;
        let events = self.remote_store.enable_network(&remote_syncer!(self))?;
        self.process_remote_events(events)
    }

    pub fn disable_network(&mut self) -> FirestoreResult<()> {
        let persistence = self.local_store.persistence().clone();
        let is_primary = persistence.set_network_enabled(false)?;
        let events = self.remote_store.disable_network();
        self.process_remote_events(events)?;
        self.apply_primary_state(is_primary)
    }

    /// Restarts the streams after the device's connectivity changed.
    pub fn handle_connectivity_change(&mut self) -> FirestoreResult<()> {
        let events = self.remote_store.restart_network(&remote_syncer!(self))?;
        self.process_remote_events(events)
    }

    pub fn set_in_foreground(&mut self, in_foreground: bool) -> FirestoreResult<()> {
        let persistence = self.local_store.persistence().clone();
        let is_primary = persistence.set_in_foreground(in_foreground)?;
        self.apply_primary_state(is_primary)?;
        if in_foreground {
            self.handle_connectivity_change()?;
        }
        Ok(())
    }

    /// Switches to `user`: streams are paused, the local store swaps mutation
    /// queues, and views are recomputed from the new user's writes.
    pub fn handle_credential_change(&mut self, user: User) -> FirestoreResult<()> {
        let (_, events) = self.remote_store.pause_for_credential_change();
        self.process_remote_events(events)?;

        if user != self.current_user {
            log::debug!("user changed to {user}");
            let result = self.local_store.handle_user_change(user.clone())?;
            self.current_user = user.clone();
            self.reject_outstanding_pending_writes_callbacks(
                "pending writes were abandoned because the user changed",
            );
            self.shared_client_state.handle_user_change(user);
            self.batch_keys.clear();
            self.emit_new_snaps_and_notify_local_store(&result.affected_documents, None)?;
        }

        let events = self
            .remote_store
            .resume_after_credential_change(&remote_syncer!(self))?;
        self.process_remote_events(events)
    }

    /// Routes a stream or timer completion into the remote store.
    pub fn handle_stream_event(&mut self, event: StreamEvent) -> FirestoreResult<()> {
        let events = self
            .remote_store
            .handle_stream_event(event, &remote_syncer!(self))?;
        self.process_remote_events(events)
    }

    pub fn handle_shared_client_message(&mut self, envelope: SharedClientEnvelope) -> FirestoreResult<()> {
        match self.shared_client_state.handle_message(envelope) {
            Some(event) => self.apply_shared_client_event(event),
            None => Ok(()),
        }
    }

    /// Heartbeat: refreshes this client's metadata row, forgets clients that
    /// stopped heartbeating, and applies the resulting primary state.
    pub fn refresh_client_metadata(&mut self) -> FirestoreResult<()> {
        let persistence = self.local_store.persistence().clone();
        let is_primary = match persistence.update_client_metadata_and_try_become_primary() {
            Ok(is_primary) => is_primary,
            Err(err) if is_transient_persistence_error(&err) => {
                log::debug!("failed to refresh client metadata: {err}");
                return Ok(());
            }
            Err(err) => return Err(err),
        };
        if persistence.allows_tab_sync() {
            let active_clients = persistence.active_clients()?;
            if let Some(event) = self.shared_client_state.retain_clients(&active_clients) {
                self.apply_shared_client_event(event)?;
            }
        }
        self.apply_primary_state(is_primary)
    }

    /// Runs LRU collection on the primary. Documents in limbo are kept.
    pub fn collect_garbage(&self, garbage_collector: &LruGarbageCollector) -> FirestoreResult<LruResults> {
        if !self.is_primary_client() {
            return Ok(LruResults::did_not_run());
        }
        let pinned = self.limbo_documents();
        match self.local_store.collect_garbage(garbage_collector, &pinned) {
            Err(err) if is_primary_lease_lost(&err) => {
                log::debug!("skipping garbage collection: {err}");
                Ok(LruResults::did_not_run())
            }
            other => other,
        }
    }

    pub fn backfill_indexes(&self, backfiller: &IndexBackfiller) -> FirestoreResult<usize> {
        if !self.is_primary_client() {
            return Ok(0);
        }
        match self.local_store.backfill_indexes(backfiller) {
            Err(err) if is_primary_lease_lost(&err) => Ok(0),
            other => other,
        }
    }

    /// Makes this client the primary or a secondary.
    ///
    /// A new primary reconciles its views with persistence, since secondary
    /// views do not track synced documents, and starts listening to every
    /// target any client is interested in. A new secondary drops the targets
    /// only other clients used and stops talking to the backend.
    pub fn apply_primary_state(&mut self, is_primary: bool) -> FirestoreResult<()> {
        if is_primary && self.is_primary != Some(true) {
            let active_targets: Vec<TargetId> = self
                .shared_client_state
                .all_active_query_targets()
                .into_iter()
                .collect();
            let active_queries = self.synchronize_query_views_and_raise_snapshots(&active_targets, true)?;
            self.is_primary = Some(true);
            let events = self
                .remote_store
                .apply_primary_state(true, &remote_syncer!(self))?;
            self.process_remote_events(events)?;
            for target_data in active_queries {
                let events = self.remote_store.listen(target_data, &remote_syncer!(self));
                self.process_remote_events(events)?;
            }
        } else if !is_primary && self.is_primary != Some(false) {
            let mut active_targets = Vec::new();
            let target_ids: Vec<TargetId> = self.query_views.by_target.keys().copied().collect();
            for target_id in target_ids {
                if self.shared_client_state.is_local_query_target(target_id) {
                    active_targets.push(target_id);
                } else {
                    self.remove_and_cleanup_target(target_id, None)?;
                    self.local_store.release_target(target_id, true)?;
                }
                self.remote_unlisten(target_id)?;
            }
            self.synchronize_query_views_and_raise_snapshots(&active_targets, false)?;
            self.reset_limbo_documents()?;
            self.is_primary = Some(false);
            let events = self
                .remote_store
                .apply_primary_state(false, &remote_syncer!(self))?;
            self.process_remote_events(events)?;
        }
        Ok(())
    }

    fn process_remote_events(&mut self, events: Vec<RemoteSyncerEvent>) -> FirestoreResult<()> {
        for event in events {
            match event {
                RemoteSyncerEvent::RemoteEvent(remote_event) => self.apply_remote_event(remote_event)?,
                RemoteSyncerEvent::RejectListen { target_id, error } => self.reject_listen(target_id, error)?,
                RemoteSyncerEvent::WriteAcknowledged(result) => self.apply_successful_write(result)?,
                RemoteSyncerEvent::WriteRejected { batch_id, error } => {
                    self.reject_failed_write(batch_id, error)?
                }
                RemoteSyncerEvent::OnlineStateChanged(state) => {
                    self.apply_online_state_change(state, OnlineStateSource::RemoteStore)
                }
            }
        }
        Ok(())
    }

    fn apply_shared_client_event(&mut self, event: SharedClientEvent) -> FirestoreResult<()> {
        match event {
            SharedClientEvent::BatchState {
                batch_id,
                state,
                error,
            } => self.apply_batch_state(batch_id, state, error),
            SharedClientEvent::TargetState {
                target_id,
                state,
                error,
            } => self.apply_target_state(target_id, state, error),
            SharedClientEvent::ActiveTargetsChanged { added, removed } => {
                if self.is_primary_client() {
                    self.apply_active_targets_change(added, removed)
                } else {
                    Ok(())
                }
            }
            SharedClientEvent::OnlineState(state) => {
                self.apply_online_state_change(state, OnlineStateSource::SharedClientState);
                Ok(())
            }
        }
    }

    // Persistence failures that must not tear down the client.
    fn handle_persistence_error(&mut self, error: FirestoreError) -> FirestoreResult<()> {
        if is_primary_lease_lost(&error) {
            log::debug!("unexpectedly lost primary lease: {error}");
            return Ok(());
        }
        if is_transient_persistence_error(&error) {
            let events = self.remote_store.disable_network_until_recovery(&error)?;
            return self.process_remote_events(events);
        }
        Err(error)
    }

    fn ignore_if_primary_lease_loss(&self, error: FirestoreError) -> FirestoreResult<()> {
        if is_primary_lease_lost(&error) {
            log::debug!("unexpectedly lost primary lease: {error}");
            Ok(())
        } else {
            Err(error)
        }
    }

    fn listen_to_query(&mut self, query: &Query, should_listen_to_remote: bool) -> FirestoreResult<ViewSnapshot> {
        if let Some(query_view) = self.query_views.by_query.get(&query.canonical_id()) {
            // Another client may still hold a view the engine kept alive for it.
            let target_id = query_view.target_id;
            let snapshot = query_view.view.compute_initial_snapshot();
            self.shared_client_state.add_local_query_target(target_id);
            return Ok(snapshot);
        }

        let target_data = self.local_store.allocate_target(query.to_target())?;
        let status = self
            .shared_client_state
            .add_local_query_target(target_data.target_id);
        let snapshot = self.initialize_view_and_compute_snapshot(
            query,
            target_data.target_id,
            status == QueryTargetState::Current,
            target_data.resume_token.clone(),
        )?;
        if self.is_primary_client() && should_listen_to_remote {
            let events = self.remote_store.listen(target_data, &remote_syncer!(self));
            self.process_remote_events(events)?;
        }
        Ok(snapshot)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> FirestoreResult<ViewSnapshot> {
        let result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), result.remote_keys);
        let changes = view.compute_doc_changes(&result.documents, None);
        let synthesized = TargetChange::synthesized(current && self.online_state != OnlineState::Offline, resume_token);
        let change = view.apply_changes(changes, self.is_primary_client(), Some(&synthesized), false);
        let snapshot = match change.snapshot {
            Some(snapshot) => snapshot,
            None => view.compute_initial_snapshot(),
        };

        self.query_views.by_query.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.query_views
            .by_target
            .entry(target_id)
            .or_default()
            .push(query.clone());
        self.update_tracked_limbos(target_id, change.limbo_changes)?;
        Ok(snapshot)
    }

    fn unlisten_from_query(&mut self, query: &Query, should_unlisten_to_remote: bool) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let Some(target_id) = self
            .query_views
            .by_query
            .get(&canonical_id)
            .map(|query_view| query_view.target_id)
        else {
            return Ok(());
        };

        if let Some(queries) = self.query_views.by_target.get_mut(&target_id) {
            if queries.len() > 1 {
                queries.retain(|other| other.canonical_id() != canonical_id);
                self.query_views.by_query.remove(&canonical_id);
                return Ok(());
            }
        }

        if self.is_primary_client() {
            // Drop the local registration first so the check below only sees
            // other clients.
            self.shared_client_state.remove_local_query_target(target_id);
            if self.shared_client_state.is_active_query_target(target_id) {
                return Ok(());
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.shared_client_state.clear_query_state(target_id);
                    if should_unlisten_to_remote {
                        self.remote_unlisten(target_id)?;
                    }
                    self.remove_and_cleanup_target(target_id, None)
                }
                Err(err) => self.ignore_if_primary_lease_loss(err),
            }
        } else {
            self.remove_and_cleanup_target(target_id, None)?;
            self.local_store.release_target(target_id, true)
        }
    }

    fn remove_and_cleanup_target(&mut self, target_id: TargetId, error: Option<&FirestoreError>) -> FirestoreResult<()> {
        self.shared_client_state.remove_local_query_target(target_id);
        if let Some(queries) = self.query_views.by_target.remove(&target_id) {
            for query in queries {
                self.query_views.by_query.remove(&query.canonical_id());
                if let Some(error) = error {
                    self.event_manager.on_watch_error(&query, error);
                }
            }
        }

        if self.is_primary_client() {
            let keys = self.limbo.references.remove_references_for_id(target_id);
            for key in keys {
                if !self.limbo.references.contains_key(&key) {
                    self.remove_limbo_target(&key)?;
                }
            }
        }
        Ok(())
    }

    fn remote_unlisten(&mut self, target_id: TargetId) -> FirestoreResult<()> {
        if !self.remote_store.listen_targets().contains_key(&target_id) {
            return Ok(());
        }
        let events = self.remote_store.unlisten(target_id);
        self.process_remote_events(events)
    }

    fn fill_write_pipeline(&mut self) -> FirestoreResult<()> {
        match self.remote_store.fill_write_pipeline(&remote_syncer!(self)) {
            Ok(()) => Ok(()),
            Err(err) => self.handle_persistence_error(err),
        }
    }

    fn apply_remote_event(&mut self, event: RemoteEvent) -> FirestoreResult<()> {
        let changes = match self.local_store.apply_remote_event(&event) {
            Ok(changes) => changes,
            Err(err) => return self.handle_persistence_error(err),
        };

        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.limbo.active_by_target.get_mut(target_id) else {
                continue;
            };
            hard_assert(
                change.change_count() <= 1,
                "limbo resolution for a single document contains multiple changes",
            );
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "received change for limbo target document without add",
                );
            } else if !change.removed_documents.is_empty() {
                hard_assert(
                    resolution.received_document,
                    "received remove for limbo target document without add",
                );
                resolution.received_document = false;
            }
        }

        self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
    }

    fn reject_listen(&mut self, target_id: TargetId, error: FirestoreError) -> FirestoreResult<()> {
        log::debug!("listen for target {target_id} rejected: {error}");
        self.shared_client_state
            .update_query_state(target_id, QueryTargetState::Rejected, Some(error.clone()));

        let limbo_key = self
            .limbo
            .active_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone());
        if let Some(key) = limbo_key {
            // The server refused to tell us about the document; treat it as
            // deleted so it leaves the views.
            let mut event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                ..RemoteEvent::default()
            };
            event
                .document_updates
                .insert(key.clone(), Document::new_no_document(key.clone(), SnapshotVersion::min()));
            event.resolved_limbo_documents.insert(key.clone());
            self.apply_remote_event(event)?;

            self.limbo.active_by_key.remove(&key);
            self.limbo.active_by_target.remove(&target_id);
            return self.pump_enqueued_limbo_resolutions();
        }

        match self.local_store.release_target(target_id, false) {
            Ok(()) => self.remove_and_cleanup_target(target_id, Some(&error)),
            Err(err) => self.ignore_if_primary_lease_loss(err),
        }
    }

    fn apply_successful_write(&mut self, result: MutationBatchResult) -> FirestoreResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = match self.local_store.accept_batch(&result) {
            Ok(changes) => changes,
            Err(err) => return self.ignore_if_primary_lease_loss(err),
        };
        // Write callbacks run before the snapshots that include the write.
        self.process_user_callback(batch_id, None);
        self.trigger_pending_writes_callbacks(batch_id);
        self.batch_keys.remove(&batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Acknowledged, None);
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn reject_failed_write(&mut self, batch_id: BatchId, error: FirestoreError) -> FirestoreResult<()> {
        let changes = match self.local_store.reject_batch(batch_id) {
            Ok(changes) => changes,
            Err(err) => return self.ignore_if_primary_lease_loss(err),
        };
        self.process_user_callback(batch_id, Some(error.clone()));
        self.trigger_pending_writes_callbacks(batch_id);
        self.batch_keys.remove(&batch_id);
        self.shared_client_state
            .update_mutation_state(batch_id, MutationBatchState::Rejected, Some(error));
        self.emit_new_snaps_and_notify_local_store(&changes, None)
    }

    fn process_user_callback(&mut self, batch_id: BatchId, error: Option<FirestoreError>) {
        let callback = self
            .mutation_user_callbacks
            .get_mut(&self.current_user)
            .and_then(|callbacks| callbacks.remove(&batch_id));
        if let Some(callback) = callback {
            resolve(
                callback,
                match error {
                    Some(error) => Err(error),
                    None => Ok(()),
                },
            );
        }
    }

    fn trigger_pending_writes_callbacks(&mut self, batch_id: BatchId) {
        for callback in self.pending_writes_callbacks.remove(&batch_id).unwrap_or_default() {
            resolve(callback, Ok(()));
        }
    }

    fn reject_outstanding_pending_writes_callbacks(&mut self, message: &str) {
        for callback in std::mem::take(&mut self.pending_writes_callbacks)
            .into_values()
            .flatten()
        {
            resolve(callback, Err(cancelled(message)));
        }
    }

    fn apply_online_state_change(&mut self, online_state: OnlineState, source: OnlineStateSource) {
        let is_primary = self.is_primary_client();
        let applies = (is_primary && source == OnlineStateSource::RemoteStore)
            || (!is_primary && source == OnlineStateSource::SharedClientState);
        if !applies {
            return;
        }
        let mut snapshots = Vec::new();
        for query_view in self.query_views.by_query.values_mut() {
            let change = query_view.view.apply_online_state_change(online_state);
            hard_assert(
                change.limbo_changes.is_empty(),
                "online state changes must not produce limbo changes",
            );
            snapshots.extend(change.snapshot);
        }
        self.event_manager.on_online_state_change(online_state);
        self.event_manager.on_watch_change(&snapshots);
        self.online_state = online_state;
        if is_primary {
            self.shared_client_state.set_online_state(online_state);
        }
    }

    /// Pushes `changes` through every view, raises the resulting snapshots,
    /// and records the views' new references in the local store.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        changes: &BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<()> {
        if self.query_views.by_query.is_empty() {
            return Ok(());
        }
        let mut snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.query_views.by_query.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some((target_id, snapshot)) = self.apply_doc_changes(&canonical_id, changes, remote_event)? else {
                continue;
            };
            if (snapshot.is_some() || remote_event.is_some()) && self.is_primary_client() {
                let current = match &snapshot {
                    Some(snapshot) => !snapshot.from_cache,
                    None => remote_event
                        .and_then(|event| event.target_changes.get(&target_id))
                        .is_some_and(|change| change.current),
                };
                let state = if current {
                    QueryTargetState::Current
                } else {
                    QueryTargetState::NotCurrent
                };
                self.shared_client_state.update_query_state(target_id, state, None);
            }
            if let Some(snapshot) = snapshot {
                view_changes.push(local_view_changes(target_id, &snapshot));
                snapshots.push(snapshot);
            }
        }
        self.event_manager.on_watch_change(&snapshots);
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn apply_doc_changes(
        &mut self,
        canonical_id: &str,
        changes: &BTreeMap<DocumentKey, Document>,
        remote_event: Option<&RemoteEvent>,
    ) -> FirestoreResult<Option<(TargetId, Option<ViewSnapshot>)>> {
        let is_primary = self.is_primary_client();
        let Some(query_view) = self.query_views.by_query.get_mut(canonical_id) else {
            return Ok(None);
        };
        let mut view_changes = query_view.view.compute_doc_changes(changes, None);
        if view_changes.needs_refill {
            // Documents left a limited view; documents past the old limit may
            // now belong in it.
            let result = self.local_store.execute_query(&query_view.query, false)?;
            view_changes = query_view
                .view
                .compute_doc_changes(&result.documents, Some(view_changes));
        }
        let target_id = query_view.target_id;
        let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
        let target_is_pending_reset =
            remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
        let change = query_view
            .view
            .apply_changes(view_changes, is_primary, target_change, target_is_pending_reset);
        self.update_tracked_limbos(target_id, change.limbo_changes)?;
        Ok(Some((target_id, change.snapshot)))
    }

    fn update_tracked_limbos(&mut self, target_id: TargetId, changes: Vec<LimboDocumentChange>) -> FirestoreResult<()> {
        for change in changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo.references.add_reference(key.clone(), target_id);
                    self.track_limbo_change(key)?;
                }
                LimboDocumentChange::Removed(key) => {
                    log::debug!("document no longer in limbo: {key}");
                    self.limbo.references.remove_reference(&key, target_id);
                    if !self.limbo.references.contains_key(&key) {
                        self.remove_limbo_target(&key)?;
                    }
                }
            }
        }
        Ok(())
    }

    fn track_limbo_change(&mut self, key: DocumentKey) -> FirestoreResult<()> {
        if self.limbo.active_by_key.contains_key(&key) || self.limbo.enqueued.contains(&key) {
            return Ok(());
        }
        log::debug!("new document in limbo: {key}");
        self.limbo.enqueued.push_back(key);
        self.pump_enqueued_limbo_resolutions()
    }

    /// Starts limbo resolutions until the concurrency limit is reached.
    fn pump_enqueued_limbo_resolutions(&mut self) -> FirestoreResult<()> {
        while self.limbo.active_by_key.len() < self.limbo.max_concurrent {
            let Some(key) = self.limbo.enqueued.pop_front() else {
                break;
            };
            let target_id = self.limbo.target_ids.next();
            self.limbo.active_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.limbo.active_by_key.insert(key.clone(), target_id);
            let target_data = TargetData::new(
                Query::document(&key).to_target(),
                target_id,
                TargetPurpose::LimboResolution,
                INVALID_SEQUENCE_NUMBER,
            );
            let events = self.remote_store.listen(target_data, &remote_syncer!(self));
            self.process_remote_events(events)?;
        }
        Ok(())
    }

    fn remove_limbo_target(&mut self, key: &DocumentKey) -> FirestoreResult<()> {
        self.limbo.enqueued.retain(|enqueued| enqueued != key);
        let Some(target_id) = self.limbo.active_by_key.remove(key) else {
            return Ok(());
        };
        self.limbo.active_by_target.remove(&target_id);
        self.remote_unlisten(target_id)?;
        self.pump_enqueued_limbo_resolutions()
    }

    fn reset_limbo_documents(&mut self) -> FirestoreResult<()> {
        let target_ids: Vec<TargetId> = self.limbo.active_by_target.keys().copied().collect();
        for target_id in target_ids {
            self.remote_unlisten(target_id)?;
        }
        self.limbo.references.remove_all_references();
        self.limbo.active_by_target.clear();
        self.limbo.active_by_key.clear();
        self.limbo.enqueued.clear();
        Ok(())
    }

    fn synchronize_query_views_and_raise_snapshots(
        &mut self,
        target_ids: &[TargetId],
        transition_to_primary: bool,
    ) -> FirestoreResult<Vec<TargetData>> {
        let mut active_queries = Vec::new();
        let mut snapshots = Vec::new();
        for &target_id in target_ids {
            let queries = self
                .query_views
                .by_target
                .get(&target_id)
                .cloned()
                .unwrap_or_default();
            let target_data = match queries.first() {
                Some(first) => {
                    // Resume token and synced documents may have moved on while
                    // another client owned the target.
                    let target_data = self.local_store.allocate_target(first.to_target())?;
                    for query in &queries {
                        let change = self.synchronize_view_and_compute_snapshot(query, transition_to_primary)?;
                        snapshots.extend(change.snapshot);
                    }
                    target_data
                }
                None => {
                    let Some(target) = self.local_store.get_cached_target(target_id)? else {
                        log::warn!("no cached target for active target {target_id}");
                        continue;
                    };
                    let target_data = self.local_store.allocate_target(target.clone())?;
                    self.initialize_view_and_compute_snapshot(
                        &Query::from_target(&target),
                        target_data.target_id,
                        false,
                        target_data.resume_token.clone(),
                    )?;
                    target_data
                }
            };
            active_queries.push(target_data);
        }
        self.event_manager.on_watch_change(&snapshots);
        Ok(active_queries)
    }

    fn synchronize_view_and_compute_snapshot(
        &mut self,
        query: &Query,
        track_limbos: bool,
    ) -> FirestoreResult<ViewChange> {
        let result = self.local_store.execute_query(query, true)?;
        let track_limbos = track_limbos || self.is_primary_client();
        let Some(query_view) = self.query_views.by_query.get_mut(&query.canonical_id()) else {
            return Ok(ViewChange::default());
        };
        let change = query_view.view.synchronize_with_persisted_state(&result);
        let target_id = query_view.target_id;
        if track_limbos {
            self.update_tracked_limbos(target_id, change.limbo_changes.clone())?;
        }
        Ok(change)
    }

    /// Another client started or stopped listening to targets; the primary
    /// listens on their behalf.
    fn apply_active_targets_change(
        &mut self,
        added: BTreeSet<TargetId>,
        removed: BTreeSet<TargetId>,
    ) -> FirestoreResult<()> {
        for target_id in added {
            if self.query_views.by_target.contains_key(&target_id) {
                log::debug!("adding an already active target {target_id}");
                continue;
            }
            let Some(target) = self.local_store.get_cached_target(target_id)? else {
                log::warn!("no cached target for added target {target_id}");
                continue;
            };
            let target_data = self.local_store.allocate_target(target.clone())?;
            self.initialize_view_and_compute_snapshot(
                &Query::from_target(&target),
                target_data.target_id,
                false,
                target_data.resume_token.clone(),
            )?;
            let events = self.remote_store.listen(target_data, &remote_syncer!(self));
            self.process_remote_events(events)?;
        }

        for target_id in removed {
            // Rejected targets are already gone.
            if !self.query_views.by_target.contains_key(&target_id) {
                continue;
            }
            match self.local_store.release_target(target_id, false) {
                Ok(()) => {
                    self.remote_unlisten(target_id)?;
                    self.remove_and_cleanup_target(target_id, None)?;
                }
                Err(err) => self.ignore_if_primary_lease_loss(err)?,
            }
        }
        Ok(())
    }

    /// The primary reported a new state for a target this secondary listens
    /// to; re-reads the target's documents from persistence.
    fn apply_target_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        if self.is_primary_client() {
            log::debug!("ignoring query state notification for {target_id} as primary");
            return Ok(());
        }
        let queries = self
            .query_views
            .by_target
            .get(&target_id)
            .cloned()
            .unwrap_or_default();
        if queries.is_empty() {
            return Ok(());
        }

        match state {
            QueryTargetState::Current | QueryTargetState::NotCurrent => {
                let remote_keys = self.local_store.remote_document_keys(target_id)?;
                let mut changes = BTreeMap::new();
                let mut stale = BTreeSet::new();
                for query in &queries {
                    let result = self.local_store.execute_query(query, false)?;
                    if let Some(query_view) = self.query_views.by_query.get_mut(&query.canonical_id()) {
                        query_view.view.set_synced_documents(remote_keys.clone());
                        stale.extend(
                            query_view
                                .view
                                .documents()
                                .keys()
                                .filter(|key| !result.documents.contains_key(*key))
                                .cloned(),
                        );
                    }
                    changes.extend(result.documents);
                }
                stale.retain(|key| !changes.contains_key(key));
                if !stale.is_empty() {
                    changes.extend(self.local_store.get_documents(&stale)?);
                }
                let event = RemoteEvent::synthesized_for_current_change(
                    target_id,
                    state == QueryTargetState::Current,
                    Vec::new(),
                );
                self.emit_new_snaps_and_notify_local_store(&changes, Some(&event))
            }
            QueryTargetState::Rejected => {
                let error = error.unwrap_or_else(|| {
                    FirestoreError::new(FirestoreErrorCode::Unknown, "listen rejected by the backend")
                });
                self.local_store.release_target(target_id, true)?;
                self.remove_and_cleanup_target(target_id, Some(&error))
            }
        }
    }

    /// A batch changed state in another client. The primary picks up batches
    /// written by secondaries; everyone refreshes the affected views.
    fn apply_batch_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let keys = match self.batch_keys.get(&batch_id) {
            Some(keys) => keys.clone(),
            None => match self.local_store.lookup_mutation_batch(batch_id)? {
                Some(batch) => batch.keys(),
                None => {
                    log::debug!("cannot apply mutation batch with id {batch_id}");
                    return Ok(());
                }
            },
        };

        match state {
            MutationBatchState::Pending => {
                self.batch_keys.insert(batch_id, keys.clone());
                if self.is_primary_client() {
                    self.fill_write_pipeline()?;
                }
            }
            MutationBatchState::Acknowledged | MutationBatchState::Rejected => {
                self.process_user_callback(batch_id, error);
                self.trigger_pending_writes_callbacks(batch_id);
                self.batch_keys.remove(&batch_id);
            }
        }

        let documents = self.local_store.get_documents(&keys)?;
        self.emit_new_snaps_and_notify_local_store(&documents, None)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut added_keys = BTreeSet::new();
    let mut removed_keys = BTreeSet::new();
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        added_keys,
        removed_keys,
    }
}
