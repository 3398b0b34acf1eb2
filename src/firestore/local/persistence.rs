use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use crate::firestore::error::{
    failed_precondition, is_transient_persistence_error, unavailable, FirestoreError,
    FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::local::encoded_key::KeyBuilder;
use crate::firestore::local::kv_store::{
    lock_unpoisoned, KvStore, KvTransaction, ScanRange, Table,
};
use crate::firestore::local::target_cache::TargetCache;
use crate::firestore::model::ListenSequenceNumber;
use crate::platform::runtime::wall_clock_millis;
use crate::util::hard_assert;

/// Attempts per transaction before a transient failure is surfaced.
pub const TRANSACTION_RETRY_COUNT: usize = 3;
/// Age after which an owner lease is considered abandoned.
pub const MAX_PRIMARY_ELIGIBLE_AGE_MS: i64 = 5_000;
/// Interval of the metadata heartbeat that refreshes the lease.
pub const CLIENT_METADATA_REFRESH_INTERVAL_MS: i64 = 4_000;
/// Client metadata rows older than this are ignored and garbage collected.
pub const MAX_CLIENT_AGE_MS: i64 = 30 * 60 * 1_000;

pub const PRIMARY_LEASE_LOST_ERROR_MSG: &str =
    "The current client lost its primary lease while a primary-only transaction was running.";
pub const PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG: &str =
    "Another client holds exclusive access to the persisted cache. Enable tab synchronization \
     in every client that shares it.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Fails with `FailedPrecondition` unless this client holds the owner lease.
    ReadWritePrimary,
}

/// Monotonic sequence numbers stamped on every transaction, used to order
/// cache entries for LRU collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ListenSequence {
    previous: ListenSequenceNumber,
}

impl ListenSequence {
    pub fn new(start_after: ListenSequenceNumber) -> Self {
        Self {
            previous: start_after,
        }
    }

    pub fn next(&mut self) -> ListenSequenceNumber {
        self.previous += 1;
        self.previous
    }

    /// Moves past a sequence number issued by another client.
    pub fn observe(&mut self, sequence_number: ListenSequenceNumber) {
        self.previous = self.previous.max(sequence_number);
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct OwnerRecord {
    owner_id: String,
    allow_tab_sync: bool,
    lease_timestamp_ms: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub network_enabled: bool,
    pub in_foreground: bool,
}

pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Transaction handed to component code. Dereferences to the buffered
/// [`KvTransaction`].
pub struct PersistenceTransaction<'a> {
    kv: KvTransaction<'a>,
    mode: TransactionMode,
    current_sequence_number: ListenSequenceNumber,
}

impl<'a> PersistenceTransaction<'a> {
    fn new(store: &'a dyn KvStore, mode: TransactionMode, sequence_number: ListenSequenceNumber) -> Self {
        Self {
            kv: KvTransaction::new(store),
            mode,
            current_sequence_number: sequence_number,
        }
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub fn current_sequence_number(&self) -> ListenSequenceNumber {
        self.current_sequence_number
    }
}

impl<'a> std::ops::Deref for PersistenceTransaction<'a> {
    type Target = KvTransaction<'a>;

    fn deref(&self) -> &Self::Target {
        &self.kv
    }
}

impl<'a> std::ops::DerefMut for PersistenceTransaction<'a> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.kv
    }
}

/// Transaction runner over a [`KvStore`] shared by one or more clients.
///
/// Exactly one client holds the owner lease at a time. The lease is refreshed by
/// every primary transaction and by the metadata heartbeat; a client whose lease
/// expired or was taken over falls back to secondary.
pub struct Persistence {
    store: Arc<dyn KvStore>,
    client_id: String,
    allow_tab_sync: bool,
    is_primary: AtomicBool,
    started: AtomicBool,
    network_enabled: AtomicBool,
    in_foreground: AtomicBool,
    listen_sequence: Mutex<ListenSequence>,
    clock: Clock,
}

impl Debug for Persistence {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Persistence")
            .field("client_id", &self.client_id)
            .field("allow_tab_sync", &self.allow_tab_sync)
            .field("is_primary", &self.is_primary())
            .finish()
    }
}

impl Persistence {
    pub fn new(store: Arc<dyn KvStore>, client_id: impl Into<String>, allow_tab_sync: bool) -> Self {
        Self {
            store,
            client_id: client_id.into(),
            allow_tab_sync,
            is_primary: AtomicBool::new(false),
            started: AtomicBool::new(false),
            network_enabled: AtomicBool::new(true),
            in_foreground: AtomicBool::new(true),
            listen_sequence: Mutex::new(ListenSequence::new(0)),
            clock: Arc::new(wall_clock_millis),
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn allows_tab_sync(&self) -> bool {
        self.allow_tab_sync
    }

    /// Creates the global rows, restores the sequence number, and attempts to
    /// acquire the owner lease.
    pub fn start(&self) -> FirestoreResult<()> {
        {
            let _lock = self.store.transaction_lock();
            let mut txn = KvTransaction::new(self.store.as_ref());
            TargetCache::ensure_target_global(&mut txn)?;
            let highest = highest_sequence_number(&txn)?;
            lock_unpoisoned(&self.listen_sequence).observe(highest);
            self.store.commit(txn.into_batch())?;
        }
        self.started.store(true, Ordering::SeqCst);

        let is_primary = match self.update_client_metadata_and_try_become_primary() {
            Ok(is_primary) => is_primary,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        if !is_primary && !self.allow_tab_sync {
            self.started.store(false, Ordering::SeqCst);
            return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
        }
        log::debug!(
            "persistence started for client {} (primary: {is_primary})",
            self.client_id
        );
        Ok(())
    }

    /// Releases the lease and removes this client's metadata row.
    pub fn shutdown(&self) -> FirestoreResult<()> {
        if !self.started.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let _lock = self.store.transaction_lock();
        let mut txn = KvTransaction::new(self.store.as_ref());
        if let Some(owner) = txn.get_json::<OwnerRecord>(Table::Owner, &owner_key())? {
            if owner.owner_id == self.client_id {
                txn.delete(Table::Owner, owner_key());
            }
        }
        txn.delete(Table::ClientMetadata, client_key(&self.client_id));
        self.store.commit(txn.into_batch())?;
        self.is_primary.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn set_network_enabled(&self, enabled: bool) -> FirestoreResult<bool> {
        self.network_enabled.store(enabled, Ordering::SeqCst);
        self.update_client_metadata_and_try_become_primary()
    }

    pub fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<bool> {
        self.in_foreground.store(in_foreground, Ordering::SeqCst);
        self.update_client_metadata_and_try_become_primary()
    }

    /// Heartbeat: refreshes this client's metadata row and acquires, extends, or
    /// releases the owner lease. Returns the resulting primary state.
    pub fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<bool> {
        if !self.is_started() {
            return Ok(false);
        }
        let _lock = self.store.transaction_lock();
        let mut txn = KvTransaction::new(self.store.as_ref());
        let now = (self.clock)();
        let metadata = ClientMetadata {
            client_id: self.client_id.clone(),
            update_time_ms: now,
            network_enabled: self.network_enabled.load(Ordering::SeqCst),
            in_foreground: self.in_foreground.load(Ordering::SeqCst),
        };
        txn.put_json(Table::ClientMetadata, client_key(&self.client_id), &metadata)?;

        let can_act = self.can_act_as_primary(&txn, &metadata)?;
        if can_act {
            self.write_lease(&mut txn)?;
        } else if let Some(owner) = txn.get_json::<OwnerRecord>(Table::Owner, &owner_key())? {
            if owner.owner_id == self.client_id {
                txn.delete(Table::Owner, owner_key());
            }
        }
        self.remove_zombie_clients(&mut txn)?;
        self.store.commit(txn.into_batch())?;

        let was_primary = self.is_primary.swap(can_act, Ordering::SeqCst);
        if was_primary != can_act {
            log::debug!(
                "client {} {} the primary lease",
                self.client_id,
                if can_act { "acquired" } else { "released" }
            );
        }
        Ok(can_act)
    }

    /// Ids of clients whose metadata row is fresh, this client included.
    pub fn active_clients(&self) -> FirestoreResult<Vec<String>> {
        let txn = KvTransaction::new(self.store.as_ref());
        Ok(self
            .client_metadata(&txn)?
            .into_iter()
            .filter(|client| self.is_within_age(client.update_time_ms, MAX_CLIENT_AGE_MS))
            .map(|client| client.client_id)
            .collect())
    }

    /// Runs `body` in a transaction and commits its writes atomically.
    ///
    /// Transient failures re-run the whole body, up to
    /// [`TRANSACTION_RETRY_COUNT`] attempts. The body must therefore keep its side
    /// effects inside the transaction.
    pub fn run_transaction<T, F>(&self, action: &str, mode: TransactionMode, mut body: F) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        if !self.is_started() {
            return Err(failed_precondition(format!(
                "Persistence is not started; cannot run '{action}'"
            )));
        }
        let sequence_number = lock_unpoisoned(&self.listen_sequence).next();
        let mut last_error: Option<FirestoreError> = None;

        for attempt in 1..=TRANSACTION_RETRY_COUNT {
            match self.attempt_transaction(action, mode, sequence_number, &mut body) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient_persistence_error(&err) => {
                    log::debug!("transaction '{action}' failed on attempt {attempt}: {err}");
                    last_error = Some(err);
                }
                Err(err) => return Err(err),
            }
        }
        let reason = last_error
            .map(|err| err.message().to_string())
            .unwrap_or_default();
        Err(unavailable(format!(
            "Transaction '{action}' failed after {TRANSACTION_RETRY_COUNT} attempts: {reason}"
        )))
    }

    fn attempt_transaction<T, F>(
        &self,
        action: &str,
        mode: TransactionMode,
        sequence_number: ListenSequenceNumber,
        body: &mut F,
    ) -> FirestoreResult<T>
    where
        F: FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let _lock = self.store.transaction_lock();
        let mut txn = PersistenceTransaction::new(self.store.as_ref(), mode, sequence_number);

        if mode == TransactionMode::ReadWritePrimary {
            self.verify_primary_lease(&txn, action)?;
            self.write_lease(&mut txn)?;
        }

        let value = body(&mut txn)?;

        if mode == TransactionMode::ReadOnly {
            hard_assert(
                !txn.is_dirty(),
                format!("read-only transaction '{action}' attempted to write"),
            );
            return Ok(value);
        }
        if mode == TransactionMode::ReadWritePrimary {
            self.verify_primary_lease(&txn, action)?;
        }
        self.store.commit(txn.kv.into_batch())?;
        Ok(value)
    }

    fn verify_primary_lease(&self, txn: &PersistenceTransaction<'_>, action: &str) -> FirestoreResult<()> {
        let owner = txn.get_json::<OwnerRecord>(Table::Owner, &owner_key())?;
        let holds_lease = owner.is_some_and(|owner| {
            owner.owner_id == self.client_id
                && self.is_within_age(owner.lease_timestamp_ms, MAX_PRIMARY_ELIGIBLE_AGE_MS)
        });
        if !holds_lease {
            if self.is_primary.swap(false, Ordering::SeqCst) {
                log::error!(
                    "client {} lost its primary lease during '{action}'",
                    self.client_id
                );
            }
            return Err(failed_precondition(PRIMARY_LEASE_LOST_ERROR_MSG));
        }
        Ok(())
    }

    fn write_lease(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        let owner = OwnerRecord {
            owner_id: self.client_id.clone(),
            allow_tab_sync: self.allow_tab_sync,
            lease_timestamp_ms: (self.clock)(),
        };
        txn.put_json(Table::Owner, owner_key(), &owner)
    }

    fn can_act_as_primary(&self, txn: &KvTransaction<'_>, local: &ClientMetadata) -> FirestoreResult<bool> {
        if let Some(owner) = txn.get_json::<OwnerRecord>(Table::Owner, &owner_key())? {
            let lease_valid = self.is_within_age(owner.lease_timestamp_ms, MAX_PRIMARY_ELIGIBLE_AGE_MS);
            if lease_valid {
                if owner.owner_id != self.client_id {
                    if !owner.allow_tab_sync || !self.allow_tab_sync {
                        return Err(failed_precondition(PRIMARY_LEASE_EXCLUSIVE_ERROR_MSG));
                    }
                    return Ok(false);
                }
                if local.network_enabled {
                    return Ok(true);
                }
            }
        }
        if !self.allow_tab_sync || (local.network_enabled && local.in_foreground) {
            return Ok(true);
        }
        // Defer to a fresher client that is both online and visible.
        let better_client = self.client_metadata(txn)?.into_iter().any(|other| {
            other.client_id != self.client_id
                && self.is_within_age(other.update_time_ms, MAX_PRIMARY_ELIGIBLE_AGE_MS)
                && (other.network_enabled && !local.network_enabled
                    || other.in_foreground && !local.in_foreground && other.network_enabled == local.network_enabled)
        });
        Ok(!better_client)
    }

    fn client_metadata(&self, txn: &KvTransaction<'_>) -> FirestoreResult<Vec<ClientMetadata>> {
        Ok(txn
            .scan_json::<ClientMetadata>(Table::ClientMetadata, &ScanRange::all())?
            .into_iter()
            .map(|(_, metadata)| metadata)
            .collect())
    }

    fn remove_zombie_clients(&self, txn: &mut KvTransaction<'_>) -> FirestoreResult<()> {
        for client in self.client_metadata(txn)? {
            if !self.is_within_age(client.update_time_ms, MAX_CLIENT_AGE_MS) {
                txn.delete(Table::ClientMetadata, client_key(&client.client_id));
            }
        }
        Ok(())
    }

    fn is_within_age(&self, timestamp_ms: i64, max_age_ms: i64) -> bool {
        let now = (self.clock)();
        if timestamp_ms > now {
            log::warn!("detected a lease update time in the future: {timestamp_ms} > {now}");
            return false;
        }
        timestamp_ms >= now - max_age_ms
    }

    /// Advances the local sequence after another client wrote a higher one.
    pub fn observe_sequence_number(&self, sequence_number: ListenSequenceNumber) {
        lock_unpoisoned(&self.listen_sequence).observe(sequence_number);
    }
}

/// Whether `err` was raised because the primary lease is gone. Such failures are
/// expected during failover and only logged.
pub fn is_primary_lease_lost(err: &FirestoreError) -> bool {
    err.code == FirestoreErrorCode::FailedPrecondition && err.message() == PRIMARY_LEASE_LOST_ERROR_MSG
}

fn owner_key() -> Vec<u8> {
    KeyBuilder::new().string("owner").build()
}

fn client_key(client_id: &str) -> Vec<u8> {
    KeyBuilder::new().string(client_id).build()
}

/// Highest sequence number recorded either in the target metadata or on an
/// orphaned document sentinel.
fn highest_sequence_number(txn: &KvTransaction<'_>) -> FirestoreResult<ListenSequenceNumber> {
    let mut highest = TargetCache::read_target_global(txn)?.highest_listen_sequence_number;
    let sentinels = txn.scan_json::<ListenSequenceNumber>(
        Table::TargetDocuments,
        &ScanRange::prefix(KeyBuilder::new().int(0).build()),
    )?;
    for (_, sequence_number) in sentinels {
        highest = highest.max(sequence_number);
    }
    Ok(highest)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicI64;

    use super::*;
    use crate::firestore::error::aborted;
    use crate::firestore::local::kv_store::MemoryKvStore;

    fn manual_clock(start: i64) -> (Arc<AtomicI64>, Clock) {
        let now = Arc::new(AtomicI64::new(start));
        let handle = Arc::clone(&now);
        (now, Arc::new(move || handle.load(Ordering::SeqCst)))
    }

    fn started(store: Arc<dyn KvStore>, client_id: &str, tabs: bool, clock: Clock) -> FirestoreResult<Persistence> {
        let persistence = Persistence::new(store, client_id, tabs).with_clock(clock);
        persistence.start()?;
        Ok(persistence)
    }

    #[test]
    fn commits_writes_atomically() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (_, clock) = manual_clock(1_000_000);
        let persistence = started(Arc::clone(&store), "a", false, clock).unwrap();

        let result: FirestoreResult<()> =
            persistence.run_transaction("fails", TransactionMode::ReadWrite, |txn| {
                txn.put(Table::MutationGlobal, vec![1], vec![1]);
                Err(crate::firestore::error::invalid_argument("boom"))
            });
        assert!(result.is_err());
        assert_eq!(store.get(Table::MutationGlobal, &[1]).unwrap(), None);

        persistence
            .run_transaction("writes", TransactionMode::ReadWrite, |txn| {
                txn.put(Table::MutationGlobal, vec![1], vec![2]);
                Ok(())
            })
            .unwrap();
        assert_eq!(store.get(Table::MutationGlobal, &[1]).unwrap(), Some(vec![2]));
    }

    #[test]
    fn retries_transient_errors_then_surfaces_unavailable() {
        let (_, clock) = manual_clock(1_000_000);
        let persistence = started(Arc::new(MemoryKvStore::new()), "a", false, clock).unwrap();
        let mut attempts = 0;
        let err = persistence
            .run_transaction("flaky", TransactionMode::ReadWrite, |_| -> FirestoreResult<()> {
                attempts += 1;
                Err(aborted("conflict"))
            })
            .unwrap_err();
        assert_eq!(attempts, TRANSACTION_RETRY_COUNT);
        assert_eq!(err.code, FirestoreErrorCode::Unavailable);

        let mut attempts = 0;
        let value = persistence
            .run_transaction("recovers", TransactionMode::ReadWrite, |_| {
                attempts += 1;
                if attempts < 2 {
                    Err(aborted("conflict"))
                } else {
                    Ok(attempts)
                }
            })
            .unwrap();
        assert_eq!(value, 2);
    }

    #[test]
    fn sequence_numbers_increase_per_transaction() {
        let (_, clock) = manual_clock(1_000_000);
        let persistence = started(Arc::new(MemoryKvStore::new()), "a", false, clock).unwrap();
        let first = persistence
            .run_transaction("one", TransactionMode::ReadOnly, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        let second = persistence
            .run_transaction("two", TransactionMode::ReadOnly, |txn| Ok(txn.current_sequence_number()))
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn exclusive_lease_rejects_second_client() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (_, clock) = manual_clock(1_000_000);
        let first = started(Arc::clone(&store), "a", false, Arc::clone(&clock)).unwrap();
        assert!(first.is_primary());

        let err = started(Arc::clone(&store), "b", false, clock).unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
    }

    #[test]
    fn secondary_takes_over_expired_lease() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (now, clock) = manual_clock(1_000_000);
        let first = started(Arc::clone(&store), "a", true, Arc::clone(&clock)).unwrap();
        let second = started(Arc::clone(&store), "b", true, clock).unwrap();
        assert!(first.is_primary());
        assert!(!second.is_primary());

        let err = second
            .run_transaction("primary only", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert!(is_primary_lease_lost(&err));

        now.fetch_add(MAX_PRIMARY_ELIGIBLE_AGE_MS + 1, Ordering::SeqCst);
        assert!(second.update_client_metadata_and_try_become_primary().unwrap());

        let err = first
            .run_transaction("stale primary", TransactionMode::ReadWritePrimary, |_| Ok(()))
            .unwrap_err();
        assert!(is_primary_lease_lost(&err));
        assert!(!first.is_primary());
    }

    #[test]
    fn shutdown_releases_the_lease() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let (_, clock) = manual_clock(1_000_000);
        let first = started(Arc::clone(&store), "a", false, Arc::clone(&clock)).unwrap();
        first.shutdown().unwrap();
        let second = started(store, "b", false, clock).unwrap();
        assert!(second.is_primary());
    }
}
