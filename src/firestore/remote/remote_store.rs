use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use crate::firestore::core::target::TargetData;
use crate::firestore::error::{
    is_permanent_error, is_permanent_write_error, is_transient_persistence_error, FirestoreError,
    FirestoreResult,
};
use crate::firestore::model::{
    BatchId, DocumentKey, MutationBatch, MutationBatchResult, MutationResult, SnapshotVersion,
    TargetId, BATCH_ID_UNKNOWN,
};
use crate::firestore::remote::connection::StreamKind;
use crate::firestore::remote::listen_stream::{ListenStream, ListenStreamEvent};
use crate::firestore::remote::online_state_tracker::{OnlineState, OnlineStateTracker};
use crate::firestore::remote::persistent_stream::{RemoteTimer, StreamEvent, StreamIo};
use crate::firestore::remote::remote_event::RemoteEvent;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::watch_change::{WatchChange, WatchTargetChange, WatchTargetChangeState};
use crate::firestore::remote::watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
use crate::firestore::remote::write_stream::{WriteStream, WriteStreamEvent};
use crate::util::{hard_assert, BackoffConfig, ExponentialBackoff};

/// Batches sent to the backend but not yet acknowledged.
pub const MAX_PENDING_WRITES: usize = 10;

/// Reasons the remote store keeps its streams closed. The network is used
/// only while the set is empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum OfflineCause {
    UserDisabled,
    IsSecondary,
    CredentialChange,
    ConnectivityChange,
    PersistenceFailure,
    Shutdown,
}

/// Reads the remote store needs from the layers above it.
pub trait RemoteSyncer {
    /// Keys the client currently considers part of the target on the server.
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey>;

    /// First pending batch with an id greater than `after`.
    fn next_mutation_batch(&self, after: BatchId) -> FirestoreResult<Option<MutationBatch>>;

    fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion>;
}

/// Outcomes the sync engine must apply.
#[derive(Clone, Debug, PartialEq)]
pub enum RemoteSyncerEvent {
    RemoteEvent(RemoteEvent),
    RejectListen {
        target_id: TargetId,
        error: FirestoreError,
    },
    WriteAcknowledged(MutationBatchResult),
    WriteRejected {
        batch_id: BatchId,
        error: FirestoreError,
    },
    OnlineStateChanged(OnlineState),
}

struct ListenTargetMetadata<'a> {
    listen_targets: &'a BTreeMap<TargetId, TargetData>,
    syncer: &'a dyn RemoteSyncer,
}

impl TargetMetadataProvider for ListenTargetMetadata<'_> {
    fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
        self.syncer.get_remote_keys_for_target(target_id)
    }

    fn get_target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        self.listen_targets.get(&target_id).cloned()
    }
}

/// Owns the Listen and Write streams.
///
/// Keeps the set of targets the client listens to and re-registers them on
/// every new Listen connection, and keeps a pipeline of up to
/// [`MAX_PENDING_WRITES`] batches that is replayed on every new Write
/// connection. All methods are synchronous; I/O goes through [`StreamIo`] and
/// comes back through [`RemoteStore::handle_stream_event`].
pub struct RemoteStore {
    io: Arc<dyn StreamIo>,
    listen_targets: BTreeMap<TargetId, TargetData>,
    watch_change_aggregator: Option<WatchChangeAggregator>,
    serializer: JsonProtoSerializer,
    listen_stream: ListenStream,
    write_stream: WriteStream,
    write_pipeline: VecDeque<MutationBatch>,
    offline_causes: BTreeSet<OfflineCause>,
    online_state_tracker: OnlineStateTracker,
    recovery_backoff: ExponentialBackoff,
    recovery_token: u64,
}

impl RemoteStore {
    /// Creates a store that stays offline until [`RemoteStore::start`].
    pub fn new(io: Arc<dyn StreamIo>, serializer: JsonProtoSerializer) -> Self {
        let mut offline_causes = BTreeSet::new();
        offline_causes.insert(OfflineCause::UserDisabled);
        Self {
            io,
            listen_targets: BTreeMap::new(),
            watch_change_aggregator: None,
            listen_stream: ListenStream::new(serializer.clone()),
            write_stream: WriteStream::new(serializer.clone()),
            serializer,
            write_pipeline: VecDeque::new(),
            offline_causes,
            online_state_tracker: OnlineStateTracker::new(),
            recovery_backoff: ExponentialBackoff::new(BackoffConfig::default()),
            recovery_token: 0,
        }
    }

    pub fn start(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        self.enable_network(syncer)
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state_tracker.state()
    }

    pub fn can_use_network(&self) -> bool {
        self.offline_causes.is_empty()
    }

    pub fn listen_targets(&self) -> &BTreeMap<TargetId, TargetData> {
        &self.listen_targets
    }

    pub fn pending_write_count(&self) -> usize {
        self.write_pipeline.len()
    }

    pub fn serializer(&self) -> &JsonProtoSerializer {
        &self.serializer
    }

    pub fn enable_network(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        self.offline_causes.remove(&OfflineCause::UserDisabled);
        let mut events = Vec::new();
        self.enable_network_internal(syncer, &mut events)?;
        Ok(events)
    }

    /// Closes both streams until [`RemoteStore::enable_network`]. Pending
    /// writes stay queued locally.
    pub fn disable_network(&mut self) -> Vec<RemoteSyncerEvent> {
        self.offline_causes.insert(OfflineCause::UserDisabled);
        self.disable_network_internal();
        let mut events = Vec::new();
        self.set_online_state(OnlineState::Offline, &mut events);
        events
    }

    pub fn shutdown(&mut self) -> Vec<RemoteSyncerEvent> {
        log::debug!("remote store shutting down");
        self.offline_causes.insert(OfflineCause::Shutdown);
        self.disable_network_internal();
        let mut events = Vec::new();
        self.set_online_state(OnlineState::Unknown, &mut events);
        events
    }

    /// Closes the streams and reopens whatever is still needed, e.g. after a
    /// connectivity change or when the app returns to the foreground.
    pub fn restart_network(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        let mut events = Vec::new();
        if !self.can_use_network() {
            return Ok(events);
        }
        log::debug!("restarting streams after a connectivity change");
        self.offline_causes.insert(OfflineCause::ConnectivityChange);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Unknown, &mut events);
        self.offline_causes.remove(&OfflineCause::ConnectivityChange);
        self.enable_network_internal(syncer, &mut events)?;
        Ok(events)
    }

    /// First half of a user switch: closes the streams so nothing is sent
    /// with the old credentials. Returns whether the network was in use.
    pub fn pause_for_credential_change(&mut self) -> (bool, Vec<RemoteSyncerEvent>) {
        let mut events = Vec::new();
        if !self.can_use_network() {
            return (false, events);
        }
        log::debug!("restarting streams for new credential");
        self.offline_causes.insert(OfflineCause::CredentialChange);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Unknown, &mut events);
        (true, events)
    }

    pub fn resume_after_credential_change(
        &mut self,
        syncer: &dyn RemoteSyncer,
    ) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        let mut events = Vec::new();
        if self.offline_causes.remove(&OfflineCause::CredentialChange) {
            self.enable_network_internal(syncer, &mut events)?;
        }
        Ok(events)
    }

    pub fn apply_primary_state(
        &mut self,
        is_primary: bool,
        syncer: &dyn RemoteSyncer,
    ) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        let mut events = Vec::new();
        if is_primary {
            self.offline_causes.remove(&OfflineCause::IsSecondary);
            self.enable_network_internal(syncer, &mut events)?;
        } else {
            self.offline_causes.insert(OfflineCause::IsSecondary);
            self.disable_network_internal();
            self.set_online_state(OnlineState::Unknown, &mut events);
        }
        Ok(events)
    }

    /// Takes the network down after a transient persistence failure.
    pub fn disable_network_until_recovery(&mut self, error: &FirestoreError) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        if !is_transient_persistence_error(error) {
            return Err(error.clone());
        }
        log::warn!("disabling network until persistence recovers: {error}");
        let mut events = Vec::new();
        self.offline_causes.insert(OfflineCause::PersistenceFailure);
        self.disable_network_internal();
        self.set_online_state(OnlineState::Offline, &mut events);
        self.schedule_recovery();
        Ok(events)
    }

    fn schedule_recovery(&mut self) {
        self.recovery_token += 1;
        let delay = self.recovery_backoff.next_delay();
        self.io
            .schedule(RemoteTimer::NetworkRecovery, delay, self.recovery_token);
    }

    /// Checks persistence and re-enables the network if it answers.
    pub fn try_recover_network(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        if !self.offline_causes.contains(&OfflineCause::PersistenceFailure) {
            return Ok(Vec::new());
        }
        match syncer.last_remote_snapshot_version() {
            Ok(_) => {
                log::debug!("persistence recovered, re-enabling network");
                self.offline_causes.remove(&OfflineCause::PersistenceFailure);
                self.recovery_backoff.reset();
                let mut events = Vec::new();
                self.enable_network_internal(syncer, &mut events)?;
                Ok(events)
            }
            Err(err) if is_transient_persistence_error(&err) => {
                self.schedule_recovery();
                Ok(Vec::new())
            }
            Err(err) => Err(err),
        }
    }

    /// Starts listening to `target_data` unless it is already tracked.
    pub fn listen(&mut self, target_data: TargetData, syncer: &dyn RemoteSyncer) -> Vec<RemoteSyncerEvent> {
        let mut events = Vec::new();
        let target_id = target_data.target_id;
        if self.listen_targets.contains_key(&target_id) {
            return events;
        }
        self.listen_targets.insert(target_id, target_data.clone());
        if self.should_start_watch_stream() {
            self.start_watch_stream(&mut events);
        } else if self.listen_stream.is_open() {
            self.send_watch_request(target_data, syncer);
        }
        events
    }

    pub fn unlisten(&mut self, target_id: TargetId) -> Vec<RemoteSyncerEvent> {
        let mut events = Vec::new();
        hard_assert(
            self.listen_targets.remove(&target_id).is_some(),
            format!("unlisten called on target {target_id} that is not being watched"),
        );
        if self.listen_stream.is_open() {
            self.send_unwatch_request(target_id);
        }
        if self.listen_targets.is_empty() {
            if self.listen_stream.is_open() {
                self.listen_stream.stream_mut().mark_idle(self.io.as_ref());
            } else if self.can_use_network() {
                self.set_online_state(OnlineState::Unknown, &mut events);
            }
        }
        events
    }

    /// Dispatches one I/O completion to the stream or timer it belongs to.
    pub fn handle_stream_event(
        &mut self,
        event: StreamEvent,
        syncer: &dyn RemoteSyncer,
    ) -> FirestoreResult<Vec<RemoteSyncerEvent>> {
        let mut events = Vec::new();
        let kind = match &event {
            StreamEvent::Opened { kind, .. }
            | StreamEvent::Message { kind, .. }
            | StreamEvent::Closed { kind, .. } => *kind,
            StreamEvent::TimerFired {
                timer: RemoteTimer::OnlineStateTimeout,
                token,
            } => {
                let changed = self.online_state_tracker.handle_timer(*token);
                push_online_state(changed, &mut events);
                return Ok(events);
            }
            StreamEvent::TimerFired {
                timer: RemoteTimer::NetworkRecovery,
                token,
            } => {
                if *token != self.recovery_token {
                    return Ok(events);
                }
                return self.try_recover_network(syncer);
            }
            StreamEvent::TimerFired {
                timer: RemoteTimer::Backoff(kind) | RemoteTimer::HealthCheck(kind) | RemoteTimer::Idle(kind),
                ..
            } => *kind,
        };
        match kind {
            StreamKind::Listen => {
                if let Some(listen_event) = self.listen_stream.handle_event(self.io.as_ref(), event) {
                    self.on_listen_event(listen_event, syncer, &mut events)?;
                }
            }
            StreamKind::Write => {
                let handshake_was_complete = self.write_stream.handshake_complete();
                if let Some(write_event) = self.write_stream.handle_event(self.io.as_ref(), event) {
                    self.on_write_event(write_event, handshake_was_complete, syncer, &mut events)?;
                }
            }
        }
        Ok(events)
    }

    fn enable_network_internal(
        &mut self,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) -> FirestoreResult<()> {
        if !self.can_use_network() {
            return Ok(());
        }
        if self.should_start_watch_stream() {
            self.start_watch_stream(events);
        } else {
            self.set_online_state(OnlineState::Unknown, events);
        }
        self.fill_write_pipeline(syncer)
    }

    fn disable_network_internal(&mut self) {
        let io = Arc::clone(&self.io);
        self.write_stream.stream_mut().stop(io.as_ref());
        self.listen_stream.stream_mut().stop(io.as_ref());
        if !self.write_pipeline.is_empty() {
            log::debug!(
                "stopping write stream with {} pending writes",
                self.write_pipeline.len()
            );
            self.write_pipeline.clear();
        }
        self.cleanup_watch_stream_state();
    }

    fn set_online_state(&mut self, state: OnlineState, events: &mut Vec<RemoteSyncerEvent>) {
        let changed = self.online_state_tracker.set(state);
        push_online_state(changed, events);
    }

    // Listen stream

    fn should_start_watch_stream(&self) -> bool {
        self.can_use_network() && !self.listen_stream.is_started() && !self.listen_targets.is_empty()
    }

    fn start_watch_stream(&mut self, events: &mut Vec<RemoteSyncerEvent>) {
        hard_assert(
            self.should_start_watch_stream(),
            "start_watch_stream called when should_start_watch_stream is false",
        );
        self.watch_change_aggregator = Some(WatchChangeAggregator::new(self.serializer.clone()));
        self.listen_stream.stream_mut().start(self.io.as_ref());
        let changed = self.online_state_tracker.handle_watch_stream_start(self.io.as_ref());
        push_online_state(changed, events);
    }

    fn cleanup_watch_stream_state(&mut self) {
        self.watch_change_aggregator = None;
    }

    fn send_watch_request(&mut self, target_data: TargetData, syncer: &dyn RemoteSyncer) {
        let target_id = target_data.target_id;
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        let request = if !target_data.resume_token.is_empty() || !target_data.snapshot_version.is_min() {
            let expected_count = syncer.get_remote_keys_for_target(target_id).len() as i32;
            target_data.with_expected_count(expected_count)
        } else {
            target_data
        };
        self.listen_stream.watch(self.io.as_ref(), &request);
    }

    fn send_unwatch_request(&mut self, target_id: TargetId) {
        if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
            aggregator.record_pending_target_request(target_id);
        }
        self.listen_stream.unwatch(self.io.as_ref(), target_id);
    }

    fn on_listen_event(
        &mut self,
        event: ListenStreamEvent,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) -> FirestoreResult<()> {
        match event {
            ListenStreamEvent::Opened => {
                let targets: Vec<TargetData> = self.listen_targets.values().cloned().collect();
                for target_data in targets {
                    self.send_watch_request(target_data, syncer);
                }
                Ok(())
            }
            ListenStreamEvent::WatchChange {
                change,
                snapshot_version,
            } => self.on_watch_stream_change(change, snapshot_version, syncer, events),
            ListenStreamEvent::Closed(error) => {
                self.cleanup_watch_stream_state();
                if self.should_start_watch_stream() {
                    let changed = self.online_state_tracker.handle_watch_stream_failure(error.as_ref());
                    push_online_state(changed, events);
                    self.start_watch_stream(events);
                } else {
                    self.set_online_state(OnlineState::Unknown, events);
                }
                Ok(())
            }
        }
    }

    fn on_watch_stream_change(
        &mut self,
        change: WatchChange,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) -> FirestoreResult<()> {
        self.set_online_state(OnlineState::Online, events);

        if let WatchChange::TargetChange(target_change) = &change {
            if target_change.state == WatchTargetChangeState::Removed && target_change.cause.is_some() {
                self.handle_target_error(target_change, events);
                return Ok(());
            }
        }

        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return Ok(());
        };
        let metadata = ListenTargetMetadata {
            listen_targets: &self.listen_targets,
            syncer,
        };
        match change {
            WatchChange::Document(document_change) => {
                aggregator.handle_document_change(&metadata, document_change)
            }
            WatchChange::ExistenceFilter(filter) => aggregator.handle_existence_filter(&metadata, &filter),
            WatchChange::TargetChange(target_change) => aggregator.handle_target_change(&metadata, &target_change),
        }

        if snapshot_version.is_min() {
            return Ok(());
        }
        match syncer.last_remote_snapshot_version() {
            Ok(last_remote_snapshot_version) => {
                if snapshot_version >= last_remote_snapshot_version {
                    self.raise_watch_snapshot(snapshot_version, syncer, events);
                }
                Ok(())
            }
            Err(err) => {
                log::debug!("failed to read the last remote snapshot version: {err}");
                events.extend(self.disable_network_until_recovery(&err)?);
                Ok(())
            }
        }
    }

    /// Turns the aggregated changes into a [`RemoteEvent`], records new resume
    /// tokens, and re-listens to targets whose existence filter mismatched.
    fn raise_watch_snapshot(
        &mut self,
        snapshot_version: SnapshotVersion,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) {
        hard_assert(!snapshot_version.is_min(), "cannot raise a snapshot at the minimum version");
        let Some(aggregator) = self.watch_change_aggregator.as_mut() else {
            return;
        };
        let metadata = ListenTargetMetadata {
            listen_targets: &self.listen_targets,
            syncer,
        };
        let remote_event = aggregator.create_remote_event(&metadata, snapshot_version);

        for (target_id, change) in &remote_event.target_changes {
            if change.resume_token.is_empty() {
                continue;
            }
            if let Some(target_data) = self.listen_targets.get(target_id) {
                let updated = target_data.with_resume_token(change.resume_token.clone(), snapshot_version);
                self.listen_targets.insert(*target_id, updated);
            }
        }

        for (target_id, purpose) in &remote_event.target_mismatches {
            let Some(target_data) = self.listen_targets.get(target_id).cloned() else {
                continue;
            };
            self.listen_targets.insert(
                *target_id,
                target_data.with_resume_token(Vec::new(), target_data.snapshot_version),
            );
            self.send_unwatch_request(*target_id);
            let request = TargetData::new(
                target_data.target.clone(),
                *target_id,
                *purpose,
                target_data.sequence_number,
            );
            self.send_watch_request(request, syncer);
        }

        events.push(RemoteSyncerEvent::RemoteEvent(remote_event));
    }

    fn handle_target_error(&mut self, change: &WatchTargetChange, events: &mut Vec<RemoteSyncerEvent>) {
        let Some(error) = change.cause.clone() else {
            return;
        };
        for target_id in &change.target_ids {
            if self.listen_targets.remove(target_id).is_some() {
                if let Some(aggregator) = self.watch_change_aggregator.as_mut() {
                    aggregator.remove_target(*target_id);
                }
                events.push(RemoteSyncerEvent::RejectListen {
                    target_id: *target_id,
                    error: error.clone(),
                });
            }
        }
    }

    // Write stream

    fn can_add_to_write_pipeline(&self) -> bool {
        self.can_use_network() && self.write_pipeline.len() < MAX_PENDING_WRITES
    }

    fn should_start_write_stream(&self) -> bool {
        self.can_use_network() && !self.write_stream.is_started() && !self.write_pipeline.is_empty()
    }

    /// Pulls pending batches from the local store until the pipeline is full,
    /// then opens the Write stream if needed.
    pub fn fill_write_pipeline(&mut self, syncer: &dyn RemoteSyncer) -> FirestoreResult<()> {
        let mut last_batch_id = self
            .write_pipeline
            .back()
            .map(|batch| batch.batch_id)
            .unwrap_or(BATCH_ID_UNKNOWN);
        while self.can_add_to_write_pipeline() {
            match syncer.next_mutation_batch(last_batch_id)? {
                Some(batch) => {
                    last_batch_id = batch.batch_id;
                    self.add_to_write_pipeline(batch);
                }
                None => {
                    if self.write_pipeline.is_empty() {
                        self.write_stream.stream_mut().mark_idle(self.io.as_ref());
                    }
                    break;
                }
            }
        }
        if self.should_start_write_stream() {
            self.write_stream.start(self.io.as_ref());
        }
        Ok(())
    }

    fn add_to_write_pipeline(&mut self, batch: MutationBatch) {
        if self.write_stream.is_open() && self.write_stream.handshake_complete() {
            self.write_stream.write_mutations(self.io.as_ref(), &batch.mutations);
        }
        self.write_pipeline.push_back(batch);
    }

    fn on_write_event(
        &mut self,
        event: WriteStreamEvent,
        handshake_was_complete: bool,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) -> FirestoreResult<()> {
        match event {
            WriteStreamEvent::Opened => {
                self.write_stream.write_handshake(self.io.as_ref());
                Ok(())
            }
            WriteStreamEvent::HandshakeComplete => {
                let io = Arc::clone(&self.io);
                for batch in &self.write_pipeline {
                    self.write_stream.write_mutations(io.as_ref(), &batch.mutations);
                }
                Ok(())
            }
            WriteStreamEvent::MutationResults {
                commit_version,
                results,
            } => self.on_mutation_result(commit_version, results, syncer, events),
            WriteStreamEvent::Closed(error) => {
                if let Some(error) = error {
                    if !self.write_pipeline.is_empty() {
                        if handshake_was_complete {
                            self.handle_write_error(error, syncer, events)?;
                        } else {
                            self.handle_handshake_error(&error);
                        }
                    }
                }
                if self.should_start_write_stream() {
                    self.write_stream.start(self.io.as_ref());
                }
                Ok(())
            }
        }
    }

    fn on_mutation_result(
        &mut self,
        commit_version: SnapshotVersion,
        results: Vec<MutationResult>,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) -> FirestoreResult<()> {
        let Some(batch) = self.write_pipeline.pop_front() else {
            hard_assert(false, "got a mutation result with an empty write pipeline");
            return Ok(());
        };
        let stream_token = self.write_stream.last_stream_token().to_vec();
        let result = MutationBatchResult::from(batch, commit_version, results, stream_token);
        events.push(RemoteSyncerEvent::WriteAcknowledged(result));
        self.fill_write_pipeline(syncer)
    }

    /// A rejected handshake keeps every batch queued. The token is dropped so
    /// the next stream starts a fresh session, and the stream backs off
    /// before reconnecting since it closed with an error.
    fn handle_handshake_error(&mut self, error: &FirestoreError) {
        if is_permanent_error(error.code) {
            log::debug!("write stream handshake failed permanently: {error}");
            self.write_stream.clear_stream_token();
        }
    }

    fn handle_write_error(
        &mut self,
        error: FirestoreError,
        syncer: &dyn RemoteSyncer,
        events: &mut Vec<RemoteSyncerEvent>,
    ) -> FirestoreResult<()> {
        if !is_permanent_write_error(error.code) {
            return Ok(());
        }
        let Some(batch) = self.write_pipeline.pop_front() else {
            return Ok(());
        };
        log::debug!(
            "batch {} rejected by the backend: {error}",
            batch.batch_id
        );
        // Retrying right away is fine; the failing batch is gone.
        self.write_stream.stream_mut().inhibit_backoff();
        events.push(RemoteSyncerEvent::WriteRejected {
            batch_id: batch.batch_id,
            error,
        });
        self.fill_write_pipeline(syncer)
    }
}

fn push_online_state(changed: Option<OnlineState>, events: &mut Vec<RemoteSyncerEvent>) {
    if let Some(state) = changed {
        events.push(RemoteSyncerEvent::OnlineStateChanged(state));
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use serde_json::json;

    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::core::target::TargetPurpose;
    use crate::firestore::error::{failed_precondition, unavailable, FirestoreErrorCode};
    use crate::firestore::model::{DatabaseId, DocumentKey, Mutation, ResourcePath, Timestamp};
    use crate::firestore::remote::persistent_stream::testing::{IoCall, RecordingStreamIo};
    use crate::firestore::value::MapValue;

    #[derive(Default)]
    struct FakeSyncer {
        batches: RefCell<Vec<MutationBatch>>,
        remote_keys: BTreeMap<TargetId, BTreeSet<DocumentKey>>,
    }

    impl RemoteSyncer for FakeSyncer {
        fn get_remote_keys_for_target(&self, target_id: TargetId) -> BTreeSet<DocumentKey> {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn next_mutation_batch(&self, after: BatchId) -> FirestoreResult<Option<MutationBatch>> {
            Ok(self
                .batches
                .borrow()
                .iter()
                .find(|batch| batch.batch_id > after)
                .cloned())
        }

        fn last_remote_snapshot_version(&self) -> FirestoreResult<SnapshotVersion> {
            Ok(SnapshotVersion::min())
        }
    }

    fn store() -> (Arc<RecordingStreamIo>, RemoteStore) {
        let io = Arc::new(RecordingStreamIo::default());
        let serializer = JsonProtoSerializer::new(DatabaseId::new("p", "(default)"));
        let store = RemoteStore::new(Arc::clone(&io) as Arc<dyn StreamIo>, serializer);
        (io, store)
    }

    fn rooms_target(target_id: TargetId) -> TargetData {
        let target = Query::collection(ResourcePath::from_segments(["rooms"])).to_target();
        TargetData::new(target, target_id, TargetPurpose::Listen, 1)
    }

    fn batch(batch_id: BatchId, path: &str) -> MutationBatch {
        let key = DocumentKey::from_string(path).unwrap();
        MutationBatch::new(batch_id, Timestamp::now(), Vec::new(), vec![Mutation::set(key, MapValue::empty())])
    }

    fn deliver(store: &mut RemoteStore, syncer: &FakeSyncer, event: StreamEvent) -> Vec<RemoteSyncerEvent> {
        store.handle_stream_event(event, syncer).unwrap()
    }

    fn open(store: &mut RemoteStore, syncer: &FakeSyncer, kind: StreamKind) {
        let generation = match kind {
            StreamKind::Listen => store.listen_stream.stream().generation(),
            StreamKind::Write => store.write_stream.stream().generation(),
        };
        deliver(store, syncer, StreamEvent::Opened { kind, generation });
    }

    fn listen_message(store: &mut RemoteStore, syncer: &FakeSyncer, frame: serde_json::Value) -> Vec<RemoteSyncerEvent> {
        let generation = store.listen_stream.stream().generation();
        deliver(
            store,
            syncer,
            StreamEvent::Message {
                kind: StreamKind::Listen,
                generation,
                frame,
            },
        )
    }

    fn write_message(store: &mut RemoteStore, syncer: &FakeSyncer, frame: serde_json::Value) -> Vec<RemoteSyncerEvent> {
        let generation = store.write_stream.stream().generation();
        deliver(
            store,
            syncer,
            StreamEvent::Message {
                kind: StreamKind::Write,
                generation,
                frame,
            },
        )
    }

    #[test]
    fn listen_registers_targets_once_stream_opens() {
        let (io, mut store) = store();
        let syncer = FakeSyncer::default();
        store.start(&syncer).unwrap();
        store.listen(rooms_target(2), &syncer);
        assert!(io.take().iter().any(|call| matches!(call, IoCall::Open(StreamKind::Listen, _))));

        open(&mut store, &syncer, StreamKind::Listen);
        let sent = io.sent(StreamKind::Listen);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["addTarget"]["targetId"], json!(2));

        store.listen(rooms_target(4), &syncer);
        assert_eq!(io.sent(StreamKind::Listen)[1]["addTarget"]["targetId"], json!(4));
    }

    #[test]
    fn global_snapshot_raises_remote_event_and_goes_online() {
        let (_io, mut store) = store();
        let syncer = FakeSyncer::default();
        store.start(&syncer).unwrap();
        store.listen(rooms_target(2), &syncer);
        open(&mut store, &syncer, StreamKind::Listen);

        let events = listen_message(
            &mut store,
            &syncer,
            json!({ "targetChange": { "targetChangeType": "ADD", "targetIds": [2] } }),
        );
        assert!(events.contains(&RemoteSyncerEvent::OnlineStateChanged(OnlineState::Online)));
        listen_message(
            &mut store,
            &syncer,
            json!({ "documentChange": {
                "document": {
                    "name": "projects/p/databases/(default)/documents/rooms/a",
                    "fields": { "occupancy": { "integerValue": "2" } },
                    "updateTime": "1970-01-01T00:00:01Z"
                },
                "targetIds": [2]
            } }),
        );
        listen_message(
            &mut store,
            &syncer,
            json!({ "targetChange": { "targetChangeType": "CURRENT", "targetIds": [2], "resumeToken": "AQ==" } }),
        );
        let events = listen_message(
            &mut store,
            &syncer,
            json!({ "targetChange": { "readTime": "1970-01-01T00:00:02Z" } }),
        );
        let remote_event = events
            .iter()
            .find_map(|event| match event {
                RemoteSyncerEvent::RemoteEvent(remote_event) => Some(remote_event.clone()),
                _ => None,
            })
            .expect("remote event");
        let change = &remote_event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.added_documents.len(), 1);
        assert_eq!(store.listen_targets()[&2].resume_token, vec![1]);
    }

    #[test]
    fn target_removed_with_cause_rejects_listen() {
        let (_io, mut store) = store();
        let syncer = FakeSyncer::default();
        store.start(&syncer).unwrap();
        store.listen(rooms_target(2), &syncer);
        open(&mut store, &syncer, StreamKind::Listen);
        let events = listen_message(
            &mut store,
            &syncer,
            json!({ "targetChange": {
                "targetChangeType": "REMOVE",
                "targetIds": [2],
                "cause": { "code": 7, "message": "denied" }
            } }),
        );
        assert!(events.iter().any(|event| matches!(
            event,
            RemoteSyncerEvent::RejectListen { target_id: 2, error } if error.code == FirestoreErrorCode::PermissionDenied
        )));
        assert!(store.listen_targets().is_empty());
    }

    #[test]
    fn write_pipeline_flushes_after_handshake_in_order() {
        let (io, mut store) = store();
        let syncer = FakeSyncer::default();
        syncer.batches.borrow_mut().push(batch(1, "rooms/a"));
        syncer.batches.borrow_mut().push(batch(2, "rooms/b"));
        store.start(&syncer).unwrap();
        assert_eq!(store.pending_write_count(), 2);

        open(&mut store, &syncer, StreamKind::Write);
        write_message(&mut store, &syncer, json!({ "streamToken": "AQ==" }));
        let sent = io.sent(StreamKind::Write);
        assert_eq!(sent.len(), 3);
        assert!(sent[0].get("database").is_some());
        assert!(sent[1]["writes"][0]["update"]["name"].as_str().unwrap().ends_with("rooms/a"));
        assert!(sent[2]["writes"][0]["update"]["name"].as_str().unwrap().ends_with("rooms/b"));

        syncer.batches.borrow_mut().remove(0);
        let events = write_message(
            &mut store,
            &syncer,
            json!({ "streamToken": "Ag==", "commitTime": "1970-01-01T00:00:05Z", "writeResults": [{}] }),
        );
        let RemoteSyncerEvent::WriteAcknowledged(result) = &events[0] else {
            panic!("expected an acknowledgement");
        };
        assert_eq!(result.batch.batch_id, 1);
        assert_eq!(result.stream_token, vec![2]);
        assert_eq!(store.pending_write_count(), 1);
    }

    #[test]
    fn permanent_write_error_rejects_only_the_head_batch() {
        let (_io, mut store) = store();
        let syncer = FakeSyncer::default();
        syncer.batches.borrow_mut().push(batch(1, "rooms/a"));
        syncer.batches.borrow_mut().push(batch(2, "rooms/b"));
        store.start(&syncer).unwrap();
        open(&mut store, &syncer, StreamKind::Write);
        write_message(&mut store, &syncer, json!({ "streamToken": "AQ==" }));

        syncer.batches.borrow_mut().remove(0);
        let generation = store.write_stream.stream().generation();
        let events = deliver(
            &mut store,
            &syncer,
            StreamEvent::Closed {
                kind: StreamKind::Write,
                generation,
                error: Some(failed_precondition("missing document")),
            },
        );
        assert_eq!(
            events,
            vec![RemoteSyncerEvent::WriteRejected {
                batch_id: 1,
                error: failed_precondition("missing document"),
            }]
        );
        assert_eq!(store.pending_write_count(), 1);
        assert!(store.write_stream.is_started());
    }

    #[test]
    fn transient_write_error_keeps_pipeline() {
        let (_io, mut store) = store();
        let syncer = FakeSyncer::default();
        syncer.batches.borrow_mut().push(batch(1, "rooms/a"));
        store.start(&syncer).unwrap();
        open(&mut store, &syncer, StreamKind::Write);
        write_message(&mut store, &syncer, json!({ "streamToken": "AQ==" }));
        let generation = store.write_stream.stream().generation();
        let events = deliver(
            &mut store,
            &syncer,
            StreamEvent::Closed {
                kind: StreamKind::Write,
                generation,
                error: Some(unavailable("reset")),
            },
        );
        assert!(events.is_empty());
        assert_eq!(store.pending_write_count(), 1);
    }

    #[test]
    fn rejected_handshake_keeps_batches_and_backs_off() {
        let (io, mut store) = store();
        let syncer = FakeSyncer::default();
        syncer.batches.borrow_mut().push(batch(1, "rooms/a"));
        store.start(&syncer).unwrap();
        open(&mut store, &syncer, StreamKind::Write);
        io.take();

        let generation = store.write_stream.stream().generation();
        let events = deliver(
            &mut store,
            &syncer,
            StreamEvent::Closed {
                kind: StreamKind::Write,
                generation,
                error: Some(failed_precondition("bad handshake")),
            },
        );
        assert!(events.is_empty());
        assert_eq!(store.pending_write_count(), 1);
        assert!(store.write_stream.last_stream_token().is_empty());
        assert!(io.last_token(RemoteTimer::Backoff(StreamKind::Write)).is_some());
        assert_eq!(io.last_open(StreamKind::Write), None);
    }

    #[test]
    fn disable_network_goes_offline_and_clears_pipeline() {
        let (_io, mut store) = store();
        let syncer = FakeSyncer::default();
        syncer.batches.borrow_mut().push(batch(1, "rooms/a"));
        store.start(&syncer).unwrap();
        store.listen(rooms_target(2), &syncer);
        let events = store.disable_network();
        assert_eq!(events, vec![RemoteSyncerEvent::OnlineStateChanged(OnlineState::Offline)]);
        assert_eq!(store.pending_write_count(), 0);
        assert!(!store.listen_stream.is_started());

        store.enable_network(&syncer).unwrap();
        assert!(store.listen_stream.is_started());
        assert_eq!(store.pending_write_count(), 1);
    }

    #[test]
    fn watch_failure_before_connect_reports_offline() {
        let (_io, mut store) = store();
        let syncer = FakeSyncer::default();
        store.start(&syncer).unwrap();
        store.listen(rooms_target(2), &syncer);
        let generation = store.listen_stream.stream().generation();
        let events = deliver(
            &mut store,
            &syncer,
            StreamEvent::Closed {
                kind: StreamKind::Listen,
                generation,
                error: Some(unavailable("unreachable")),
            },
        );
        assert!(events.contains(&RemoteSyncerEvent::OnlineStateChanged(OnlineState::Offline)));
        assert!(store.listen_stream.is_started());
    }
}
