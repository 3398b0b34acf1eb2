use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::local::kv_store::lock_unpoisoned;
use crate::platform::runtime::{sleep, spawn_detached, wall_clock_millis};

type Task = BoxFuture<'static, ()>;

/// Identifies the kind of a delayed operation so tests can fast-forward
/// specific timers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delayed_operations_until`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    HealthCheckTimeout,
    OnlineStateTimeout,
    NetworkRecovery,
    ClientMetadataRefresh,
    LruGarbageCollection,
    IndexBackfill,
    AsyncQueueRetry,
}

struct DelayedEntry {
    timer_id: TimerId,
    target_time_ms: i64,
    task: Task,
}

#[derive(Default)]
struct QueueState {
    failure: Option<FirestoreError>,
    terminated: bool,
    next_delayed_id: u64,
    delayed: BTreeMap<u64, DelayedEntry>,
}

/// Ordered executor for every operation that touches client state.
///
/// Operations run one at a time in submission order on a single worker task.
/// An operation that panics puts the queue into restricted mode: later
/// submissions fail with the recorded error, and operations still waiting in
/// the queue are skipped, except those made through
/// [`AsyncQueue::enqueue_even_while_restricted`].
#[derive(Clone)]
pub struct AsyncQueue {
    sender: Sender<Task>,
    state: Arc<Mutex<QueueState>>,
}

impl AsyncQueue {
    /// Creates the queue and spawns its worker on the ambient runtime.
    pub fn new() -> Self {
        let (sender, receiver) = async_channel::unbounded::<Task>();
        spawn_detached(run_worker(receiver));
        Self {
            sender,
            state: Arc::new(Mutex::new(QueueState::default())),
        }
    }

    /// The error that put the queue into restricted mode, if any.
    pub fn failure(&self) -> Option<FirestoreError> {
        lock_unpoisoned(&self.state).failure.clone()
    }

    pub fn is_restricted(&self) -> bool {
        let state = lock_unpoisoned(&self.state);
        state.failure.is_some() || state.terminated
    }

    /// Rejects all later regular submissions and drops pending timers.
    pub fn enter_restricted_mode(&self) {
        let mut state = lock_unpoisoned(&self.state);
        state.terminated = true;
        state.delayed.clear();
    }

    /// Runs `op` after every previously submitted operation and returns its
    /// result.
    pub async fn enqueue<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.verify_not_restricted()?;
        self.submit(op, false).await
    }

    /// Like [`AsyncQueue::enqueue`], but also accepted in restricted mode.
    /// Used for shutdown.
    pub async fn enqueue_even_while_restricted<F, Fut, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(op, true).await
    }

    /// Submits `op` without waiting for it. An error it returns is fatal.
    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        if self.is_restricted() {
            log::debug!("dropping operation submitted in restricted mode");
            return;
        }
        let task = self.fatal_on_error(op);
        if self.sender.try_send(task).is_err() {
            log::warn!("async queue worker is gone; operation dropped");
        }
    }

    /// Schedules `op` to be submitted after `delay`. Errors are fatal, as
    /// with [`AsyncQueue::enqueue_and_forget`].
    pub fn enqueue_after_delay<F, Fut>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let task = self.fatal_on_error(op);
        let id = {
            let mut state = lock_unpoisoned(&self.state);
            state.next_delayed_id += 1;
            let id = state.next_delayed_id;
            if state.failure.is_some() {
                log::debug!("dropping {timer_id:?} operation scheduled after the queue failed");
            } else if !state.terminated {
                state.delayed.insert(
                    id,
                    DelayedEntry {
                        timer_id,
                        target_time_ms: wall_clock_millis() + delay.as_millis() as i64,
                        task,
                    },
                );
            }
            id
        };

        let state = Arc::clone(&self.state);
        let sender = self.sender.clone();
        spawn_detached(async move {
            sleep(delay).await;
            let entry = lock_unpoisoned(&state).delayed.remove(&id);
            if let Some(entry) = entry {
                let _ = sender.send(entry.task).await;
            }
        });

        DelayedOperation {
            id,
            timer_id,
            state: Arc::clone(&self.state),
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        lock_unpoisoned(&self.state)
            .delayed
            .values()
            .any(|entry| entry.timer_id == timer_id)
    }

    /// Submits pending delayed operations in fire-time order, up to and
    /// including the first one with `last_timer_id`, and waits for them.
    pub async fn run_delayed_operations_until(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        // Queued work may still schedule the timer being waited for.
        self.drain().await?;

        let due = {
            let mut state = lock_unpoisoned(&self.state);
            let mut order: Vec<(i64, u64, TimerId)> = state
                .delayed
                .iter()
                .map(|(id, entry)| (entry.target_time_ms, *id, entry.timer_id))
                .collect();
            order.sort();
            if last_timer_id != TimerId::All && !order.iter().any(|(_, _, timer)| *timer == last_timer_id) {
                return Err(internal_error(format!(
                    "no delayed operation scheduled for {last_timer_id:?}"
                )));
            }
            let mut due = Vec::new();
            for (_, id, timer_id) in order {
                if let Some(entry) = state.delayed.remove(&id) {
                    due.push(entry.task);
                }
                if last_timer_id != TimerId::All && timer_id == last_timer_id {
                    break;
                }
            }
            due
        };

        for task in due {
            self.sender
                .send(task)
                .await
                .map_err(|_| internal_error("async queue worker is gone"))?;
        }
        self.drain().await
    }

    /// Waits until everything submitted so far has run.
    pub async fn drain(&self) -> FirestoreResult<()> {
        self.submit(|| async { Ok(()) }, true).await
    }

    fn verify_not_restricted(&self) -> FirestoreResult<()> {
        let state = lock_unpoisoned(&self.state);
        if let Some(failure) = &state.failure {
            return Err(failed_queue_error(failure));
        }
        if state.terminated {
            return Err(failed_precondition("the client has already been terminated"));
        }
        Ok(())
    }

    async fn submit<F, Fut, T>(&self, op: F, even_while_restricted: bool) -> FirestoreResult<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = async_channel::bounded(1);
        let state = Arc::clone(&self.state);
        let task = async move {
            let result = match failure_of(&state) {
                Some(failure) if !even_while_restricted => Err(failed_queue_error(&failure)),
                _ => run_guarded(op, &state).await,
            };
            let _ = result_tx.try_send(result);
        }
        .boxed();
        self.sender
            .send(task)
            .await
            .map_err(|_| internal_error("async queue worker is gone"))?;
        result_rx
            .recv()
            .await
            .map_err(|_| internal_error("async queue dropped the operation"))?
    }

    fn fatal_on_error<F, Fut>(&self, op: F) -> Task
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        async move {
            if failure_of(&state).is_some() {
                log::debug!("skipping operation queued before the queue failed");
                return;
            }
            if let Err(error) = run_guarded(op, &state).await {
                record_failure(&state, error);
            }
        }
        .boxed()
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone)]
pub struct DelayedOperation {
    id: u64,
    timer_id: TimerId,
    state: Arc<Mutex<QueueState>>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Drops the operation if it has not been submitted yet. Returns whether
    /// it was still pending.
    pub fn cancel(&self) -> bool {
        lock_unpoisoned(&self.state).delayed.remove(&self.id).is_some()
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

async fn run_worker(receiver: Receiver<Task>) {
    while let Ok(task) = receiver.recv().await {
        task.await;
    }
}

async fn run_guarded<F, Fut, T>(op: F, state: &Mutex<QueueState>) -> FirestoreResult<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = FirestoreResult<T>>,
{
    match AssertUnwindSafe(async move { op().await }).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic.downcast_ref::<&str>().copied())
                .unwrap_or("operation panicked");
            let error = internal_error(message.to_string());
            record_failure(state, error.clone());
            Err(error)
        }
    }
}

fn failure_of(state: &Mutex<QueueState>) -> Option<FirestoreError> {
    lock_unpoisoned(state).failure.clone()
}

fn failed_queue_error(failure: &FirestoreError) -> FirestoreError {
    internal_error(format!("async queue is already failed: {}", failure.message()))
}

fn record_failure(state: &Mutex<QueueState>, error: FirestoreError) {
    log::error!("async queue failed: {error}");
    let mut state = lock_unpoisoned(state);
    if state.failure.is_none() {
        state.failure = Some(error);
    }
    state.delayed.clear();
}
