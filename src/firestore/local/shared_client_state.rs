use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};

use crate::firestore::error::FirestoreError;
use crate::firestore::local::kv_store::lock_unpoisoned;
use crate::firestore::model::{BatchId, TargetId, User};
use crate::firestore::remote::OnlineState;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MutationBatchState {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryTargetState {
    NotCurrent,
    Current,
    Rejected,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum SharedClientMessage {
    MutationBatch {
        user: User,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    },
    QueryTarget {
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    },
    /// Full set of targets the sender listens to.
    ClientState {
        active_target_ids: BTreeSet<TargetId>,
    },
    ClientRemoved,
    OnlineState {
        state: OnlineState,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SharedClientEnvelope {
    pub sender: String,
    pub message: SharedClientMessage,
}

/// Process-local broadcast channel connecting the clients that share one
/// persistence store.
#[derive(Debug, Default)]
pub struct SharedClientBus {
    subscribers: Mutex<Vec<(String, Sender<SharedClientEnvelope>)>>,
}

impl SharedClientBus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self, client_id: &str) -> Receiver<SharedClientEnvelope> {
        let (sender, receiver) = async_channel::unbounded();
        let mut subscribers = lock_unpoisoned(&self.subscribers);
        subscribers.retain(|(id, _)| id != client_id);
        subscribers.push((client_id.to_string(), sender));
        receiver
    }

    pub fn unsubscribe(&self, client_id: &str) {
        lock_unpoisoned(&self.subscribers).retain(|(id, _)| id != client_id);
    }

    /// Delivers `envelope` to every subscriber except its sender.
    pub fn publish(&self, envelope: SharedClientEnvelope) {
        let mut subscribers = lock_unpoisoned(&self.subscribers);
        subscribers.retain(|(_, sender)| !sender.is_closed());
        for (id, sender) in subscribers.iter() {
            if *id != envelope.sender {
                let _ = sender.try_send(envelope.clone());
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        lock_unpoisoned(&self.subscribers).len()
    }
}

/// What a message from another client means for the sync engine.
#[derive(Clone, Debug, PartialEq)]
pub enum SharedClientEvent {
    BatchState {
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    },
    TargetState {
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    },
    /// The union of all clients' active targets changed.
    ActiveTargetsChanged {
        added: BTreeSet<TargetId>,
        removed: BTreeSet<TargetId>,
    },
    OnlineState(OnlineState),
}

/// This client's view of the state shared between clients: its own active
/// targets and pending batches, plus what it learned from the others.
#[derive(Debug)]
pub struct SharedClientState {
    client_id: String,
    bus: Arc<SharedClientBus>,
    current_user: User,
    started: bool,
    local_targets: BTreeSet<TargetId>,
    remote_clients: BTreeMap<String, BTreeSet<TargetId>>,
    query_states: BTreeMap<TargetId, QueryTargetState>,
    online_state: OnlineState,
}

impl SharedClientState {
    pub fn new(client_id: impl Into<String>, bus: Arc<SharedClientBus>, user: User) -> Self {
        Self {
            client_id: client_id.into(),
            bus,
            current_user: user,
            started: false,
            local_targets: BTreeSet::new(),
            remote_clients: BTreeMap::new(),
            query_states: BTreeMap::new(),
            online_state: OnlineState::Unknown,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Subscribes to the bus and announces this client. The returned receiver
    /// must be pumped into [`SharedClientState::handle_message`].
    pub fn start(&mut self) -> Receiver<SharedClientEnvelope> {
        let receiver = self.bus.subscribe(&self.client_id);
        self.started = true;
        self.publish_client_state();
        receiver
    }

    pub fn shutdown(&mut self) {
        if !self.started {
            return;
        }
        self.publish(SharedClientMessage::ClientRemoved);
        self.bus.unsubscribe(&self.client_id);
        self.started = false;
    }

    pub fn handle_user_change(&mut self, user: User) {
        self.current_user = user;
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn add_pending_mutation(&mut self, batch_id: BatchId) {
        self.update_mutation_state(batch_id, MutationBatchState::Pending, None);
    }

    pub fn update_mutation_state(
        &mut self,
        batch_id: BatchId,
        state: MutationBatchState,
        error: Option<FirestoreError>,
    ) {
        self.publish(SharedClientMessage::MutationBatch {
            user: self.current_user.clone(),
            batch_id,
            state,
            error,
        });
    }

    /// Registers a target this client listens to. Returns the state another
    /// client already reported for it, if it is current there.
    pub fn add_local_query_target(&mut self, target_id: TargetId) -> QueryTargetState {
        let state = match self.query_states.get(&target_id) {
            Some(QueryTargetState::Current) if self.is_active_query_target(target_id) => QueryTargetState::Current,
            _ => QueryTargetState::NotCurrent,
        };
        if self.local_targets.insert(target_id) {
            self.publish_client_state();
        }
        state
    }

    pub fn remove_local_query_target(&mut self, target_id: TargetId) {
        if self.local_targets.remove(&target_id) {
            self.publish_client_state();
        }
    }

    pub fn is_local_query_target(&self, target_id: TargetId) -> bool {
        self.local_targets.contains(&target_id)
    }

    pub fn is_active_query_target(&self, target_id: TargetId) -> bool {
        self.local_targets.contains(&target_id)
            || self
                .remote_clients
                .values()
                .any(|targets| targets.contains(&target_id))
    }

    pub fn clear_query_state(&mut self, target_id: TargetId) {
        self.query_states.remove(&target_id);
    }

    pub fn update_query_state(
        &mut self,
        target_id: TargetId,
        state: QueryTargetState,
        error: Option<FirestoreError>,
    ) {
        self.query_states.insert(target_id, state);
        self.publish(SharedClientMessage::QueryTarget {
            target_id,
            state,
            error,
        });
    }

    /// Union of every client's active targets.
    pub fn all_active_query_targets(&self) -> BTreeSet<TargetId> {
        let mut targets = self.local_targets.clone();
        for remote in self.remote_clients.values() {
            targets.extend(remote.iter().copied());
        }
        targets
    }

    pub fn set_online_state(&mut self, state: OnlineState) {
        self.online_state = state;
        self.publish(SharedClientMessage::OnlineState { state });
    }

    pub fn handle_message(&mut self, envelope: SharedClientEnvelope) -> Option<SharedClientEvent> {
        if envelope.sender == self.client_id {
            return None;
        }
        match envelope.message {
            SharedClientMessage::MutationBatch {
                user,
                batch_id,
                state,
                error,
            } => {
                if user != self.current_user {
                    log::debug!("ignoring batch {batch_id} update for inactive user {user}");
                    return None;
                }
                Some(SharedClientEvent::BatchState {
                    batch_id,
                    state,
                    error,
                })
            }
            SharedClientMessage::QueryTarget {
                target_id,
                state,
                error,
            } => {
                self.query_states.insert(target_id, state);
                Some(SharedClientEvent::TargetState {
                    target_id,
                    state,
                    error,
                })
            }
            SharedClientMessage::ClientState { active_target_ids } => {
                let before = self.all_active_query_targets();
                self.remote_clients.insert(envelope.sender, active_target_ids);
                self.active_targets_diff(before)
            }
            SharedClientMessage::ClientRemoved => {
                let before = self.all_active_query_targets();
                self.remote_clients.remove(&envelope.sender);
                self.active_targets_diff(before)
            }
            SharedClientMessage::OnlineState { state } => {
                self.online_state = state;
                Some(SharedClientEvent::OnlineState(state))
            }
        }
    }

    /// Forgets clients whose metadata row expired.
    pub fn retain_clients(&mut self, active_client_ids: &[String]) -> Option<SharedClientEvent> {
        let before = self.all_active_query_targets();
        self.remote_clients
            .retain(|client_id, _| active_client_ids.contains(client_id));
        self.active_targets_diff(before)
    }

    fn active_targets_diff(&self, before: BTreeSet<TargetId>) -> Option<SharedClientEvent> {
        let after = self.all_active_query_targets();
        let added: BTreeSet<TargetId> = after.difference(&before).copied().collect();
        let removed: BTreeSet<TargetId> = before.difference(&after).copied().collect();
        if added.is_empty() && removed.is_empty() {
            return None;
        }
        Some(SharedClientEvent::ActiveTargetsChanged { added, removed })
    }

    fn publish_client_state(&self) {
        self.publish(SharedClientMessage::ClientState {
            active_target_ids: self.local_targets.clone(),
        });
    }

    fn publish(&self, message: SharedClientMessage) {
        if !self.started {
            return;
        }
        self.bus.publish(SharedClientEnvelope {
            sender: self.client_id.clone(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (SharedClientState, Receiver<SharedClientEnvelope>, SharedClientState, Receiver<SharedClientEnvelope>) {
        let bus = SharedClientBus::new();
        let mut primary = SharedClientState::new("primary", Arc::clone(&bus), User::unauthenticated());
        let mut secondary = SharedClientState::new("secondary", bus, User::unauthenticated());
        let primary_rx = primary.start();
        let secondary_rx = secondary.start();
        (primary, primary_rx, secondary, secondary_rx)
    }

    fn drain(state: &mut SharedClientState, receiver: &Receiver<SharedClientEnvelope>) -> Vec<SharedClientEvent> {
        let mut events = Vec::new();
        while let Ok(envelope) = receiver.try_recv() {
            events.extend(state.handle_message(envelope));
        }
        events
    }

    #[test]
    fn primary_learns_secondary_targets() {
        let (mut primary, primary_rx, mut secondary, _secondary_rx) = pair();
        drain(&mut primary, &primary_rx);

        secondary.add_local_query_target(2);
        let events = drain(&mut primary, &primary_rx);
        assert_eq!(
            events,
            vec![SharedClientEvent::ActiveTargetsChanged {
                added: BTreeSet::from([2]),
                removed: BTreeSet::new(),
            }]
        );
        assert!(primary.is_active_query_target(2));

        secondary.shutdown();
        let events = drain(&mut primary, &primary_rx);
        assert_eq!(
            events,
            vec![SharedClientEvent::ActiveTargetsChanged {
                added: BTreeSet::new(),
                removed: BTreeSet::from([2]),
            }]
        );
    }

    #[test]
    fn batch_updates_for_other_users_are_ignored() {
        let (mut primary, _primary_rx, mut secondary, secondary_rx) = pair();
        drain(&mut secondary, &secondary_rx);
        primary.handle_user_change(User::authenticated("alice"));
        primary.update_mutation_state(1, MutationBatchState::Acknowledged, None);
        assert!(drain(&mut secondary, &secondary_rx).is_empty());

        primary.handle_user_change(User::unauthenticated());
        primary.update_mutation_state(2, MutationBatchState::Acknowledged, None);
        assert_eq!(
            drain(&mut secondary, &secondary_rx),
            vec![SharedClientEvent::BatchState {
                batch_id: 2,
                state: MutationBatchState::Acknowledged,
                error: None,
            }]
        );
    }

    #[test]
    fn current_state_from_another_client_is_reused() {
        let (mut primary, primary_rx, mut secondary, secondary_rx) = pair();
        primary.add_local_query_target(2);
        primary.update_query_state(2, QueryTargetState::Current, None);
        drain(&mut secondary, &secondary_rx);
        drain(&mut primary, &primary_rx);
        assert_eq!(secondary.add_local_query_target(2), QueryTargetState::Current);
        assert_eq!(secondary.add_local_query_target(4), QueryTargetState::NotCurrent);
    }

    #[test]
    fn own_messages_are_not_echoed() {
        let bus = SharedClientBus::new();
        let mut only = SharedClientState::new("only", Arc::clone(&bus), User::unauthenticated());
        let receiver = only.start();
        only.add_local_query_target(2);
        assert!(receiver.try_recv().is_err());
        assert_eq!(bus.subscriber_count(), 1);
    }
}
