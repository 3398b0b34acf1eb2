use std::collections::HashMap;

use crate::firestore::core::query::Query;
use crate::firestore::core::view::ViewSnapshot;
use crate::firestore::error::FirestoreError;
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::util::PartialObserver;

/// Identifies one registered listener.
pub type ListenerId = u64;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (`from_cache` or
    /// pending writes).
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until it comes from the server, unless
    /// the client is known to be offline.
    pub wait_for_sync_when_online: bool,
}

impl ListenOptions {
    pub fn with_metadata_changes(mut self) -> Self {
        self.include_metadata_changes = true;
        self
    }

    pub fn wait_for_sync_when_online(mut self) -> Self {
        self.wait_for_sync_when_online = true;
        self
    }
}

/// Filters the view snapshots of one query down to what a user listener
/// wants to see.
pub struct QueryListener {
    query: Query,
    options: ListenOptions,
    observer: PartialObserver<ViewSnapshot>,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(query: Query, options: ListenOptions, observer: PartialObserver<ViewSnapshot>) -> Self {
        Self {
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Returns whether an event was raised.
    pub fn on_view_snapshot(&mut self, snapshot: &ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot.clone()
        } else {
            snapshot.without_metadata_changes()
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            self.observer.notify_next(&snapshot);
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&self, error: &FirestoreError) {
        self.observer.notify_error(error);
    }

    /// A cached snapshot that was held back may be released once the client
    /// is known to be offline.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache {
            return true;
        }
        let maybe_online = online_state != OnlineState::Offline;
        if self.options.wait_for_sync_when_online && maybe_online {
            return false;
        }
        !snapshot.is_empty() || snapshot.has_cached_results || online_state == OnlineState::Offline
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        self.observer.notify_next(&initial);
    }
}

struct QueryListeners {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<(ListenerId, QueryListener)>,
}

/// Fans view snapshots out to the listeners of each query.
///
/// Several listeners on the same query share one view in the sync engine;
/// the manager tracks which listener is the first and the last for a query
/// so the engine knows when to listen and unlisten.
#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListeners>,
    online_state: OnlineState,
    next_listener_id: ListenerId,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    /// Whether no listener is registered for `query` yet.
    pub fn is_first_listener(&self, query: &Query) -> bool {
        !self.queries.contains_key(&query.canonical_id())
    }

    /// Registers `listener`. `initial_snapshot` is the snapshot the sync engine
    /// computed when this is the first listener of its query.
    pub fn add_listener(&mut self, mut listener: QueryListener, initial_snapshot: Option<ViewSnapshot>) -> ListenerId {
        self.next_listener_id += 1;
        let id = self.next_listener_id;
        let entry = self
            .queries
            .entry(listener.query().canonical_id())
            .or_insert_with(|| QueryListeners {
                view_snapshot: None,
                listeners: Vec::new(),
            });
        if let Some(snapshot) = initial_snapshot {
            entry.view_snapshot = Some(snapshot);
        }
        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = &entry.view_snapshot {
            listener.on_view_snapshot(snapshot);
        }
        entry.listeners.push((id, listener));
        id
    }

    /// Removes a listener. Returns its query when it was the last listener.
    pub fn remove_listener(&mut self, id: ListenerId) -> Option<Query> {
        let canonical_id = self
            .queries
            .iter()
            .find(|(_, info)| info.listeners.iter().any(|(listener_id, _)| *listener_id == id))
            .map(|(canonical_id, _)| canonical_id.clone())?;
        let info = self.queries.get_mut(&canonical_id)?;
        let position = info.listeners.iter().position(|(listener_id, _)| *listener_id == id)?;
        let (_, listener) = info.listeners.remove(position);
        if info.listeners.is_empty() {
            self.queries.remove(&canonical_id);
            return Some(listener.query);
        }
        None
    }

    pub fn has_listeners(&self, query: &Query) -> bool {
        self.queries.contains_key(&query.canonical_id())
    }

    pub fn on_watch_change(&mut self, snapshots: &[ViewSnapshot]) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for (_, listener) in &mut info.listeners {
                listener.on_view_snapshot(snapshot);
            }
            info.view_snapshot = Some(snapshot.clone());
        }
    }

    /// Delivers `error` to every listener of `query` and drops them.
    pub fn on_watch_error(&mut self, query: &Query, error: &FirestoreError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for (_, listener) in &info.listeners {
                listener.on_error(error);
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for (_, listener) in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::firestore::core::view::View;
    use crate::firestore::remote::remote_event::TargetChange;
    use crate::firestore::test_support::{doc, query};

    fn recording_observer() -> (PartialObserver<ViewSnapshot>, Arc<Mutex<Vec<ViewSnapshot>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let observer = PartialObserver::new().with_next(move |snapshot: &ViewSnapshot| {
            sink.lock().unwrap().push(snapshot.clone());
        });
        (observer, seen)
    }

    fn snapshot_with(view: &mut View, docs: &[(&str, i64)], current: bool) -> Option<ViewSnapshot> {
        let changes: BTreeMap<_, _> = docs
            .iter()
            .map(|(path, version)| {
                let document = doc(path, *version, &[]);
                (document.key().clone(), document)
            })
            .collect();
        let computed = view.compute_doc_changes(&changes, None);
        let target_change = TargetChange {
            current,
            added_documents: changes.keys().cloned().collect(),
            ..TargetChange::default()
        };
        view.apply_changes(computed, true, Some(&target_change), false).snapshot
    }

    #[test]
    fn empty_cached_snapshot_is_held_until_offline() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let snapshot = snapshot_with(&mut view, &[], false).unwrap();

        let (observer, seen) = recording_observer();
        let mut listener = QueryListener::new(query("rooms"), ListenOptions::default(), observer);
        assert!(!listener.on_view_snapshot(&snapshot));
        assert!(seen.lock().unwrap().is_empty());

        assert!(listener.apply_online_state_change(OnlineState::Offline));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].from_cache);
    }

    #[test]
    fn wait_for_sync_skips_cached_results_while_online() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let cached = snapshot_with(&mut view, &[("rooms/a", 1)], false).unwrap();

        let (observer, seen) = recording_observer();
        let options = ListenOptions::default().wait_for_sync_when_online();
        let mut listener = QueryListener::new(query("rooms"), options, observer);
        listener.apply_online_state_change(OnlineState::Online);
        assert!(!listener.on_view_snapshot(&cached));

        let synced = snapshot_with(&mut view, &[], true).unwrap();
        assert!(listener.on_view_snapshot(&synced));
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(!seen[0].from_cache);
        assert_eq!(seen[0].doc_changes.len(), 1);
    }

    #[test]
    fn metadata_only_snapshots_require_opt_in() {
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let first = snapshot_with(&mut view, &[("rooms/a", 1)], false).unwrap();
        let synced = snapshot_with(&mut view, &[], true).unwrap();

        let (plain_observer, plain_seen) = recording_observer();
        let mut plain = QueryListener::new(query("rooms"), ListenOptions::default(), plain_observer);
        plain.on_view_snapshot(&first);
        assert!(!plain.on_view_snapshot(&synced));

        let (meta_observer, meta_seen) = recording_observer();
        let mut with_metadata = QueryListener::new(
            query("rooms"),
            ListenOptions::default().with_metadata_changes(),
            meta_observer,
        );
        with_metadata.on_view_snapshot(&first);
        assert!(with_metadata.on_view_snapshot(&synced));

        assert_eq!(plain_seen.lock().unwrap().len(), 1);
        assert_eq!(meta_seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn manager_tracks_first_and_last_listener() {
        let mut manager = EventManager::new();
        let (observer, _) = recording_observer();
        assert!(manager.is_first_listener(&query("rooms")));
        let first = manager.add_listener(
            QueryListener::new(query("rooms"), ListenOptions::default(), observer.clone()),
            None,
        );
        assert!(!manager.is_first_listener(&query("rooms")));
        let second = manager.add_listener(
            QueryListener::new(query("rooms"), ListenOptions::default(), observer),
            None,
        );

        assert!(manager.remove_listener(first).is_none());
        assert_eq!(manager.remove_listener(second), Some(query("rooms")));
        assert!(manager.remove_listener(second).is_none());
    }

    #[test]
    fn second_listener_receives_current_snapshot() {
        let mut manager = EventManager::new();
        let mut view = View::new(query("rooms"), BTreeSet::new());
        let snapshot = snapshot_with(&mut view, &[("rooms/a", 1)], true).unwrap();

        let (observer, _) = recording_observer();
        manager.add_listener(
            QueryListener::new(query("rooms"), ListenOptions::default(), observer),
            Some(snapshot),
        );

        let (late_observer, late_seen) = recording_observer();
        manager.add_listener(
            QueryListener::new(query("rooms"), ListenOptions::default(), late_observer),
            None,
        );
        let late_seen = late_seen.lock().unwrap();
        assert_eq!(late_seen.len(), 1);
        assert_eq!(late_seen[0].len(), 1);
    }

    #[test]
    fn watch_error_reaches_listeners_and_drops_query() {
        let mut manager = EventManager::new();
        let errors = Arc::new(Mutex::new(0));
        let counter = errors.clone();
        let observer = PartialObserver::new().with_error(move |_| *counter.lock().unwrap() += 1);
        manager.add_listener(QueryListener::new(query("rooms"), ListenOptions::default(), observer), None);

        let error = crate::firestore::error::permission_denied("denied");
        manager.on_watch_error(&query("rooms"), &error);
        assert_eq!(*errors.lock().unwrap(), 1);
        assert!(!manager.has_listeners(&query("rooms")));
    }
}
