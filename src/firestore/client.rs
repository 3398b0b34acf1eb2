use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::Value as JsonValue;

use crate::firestore::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::firestore::core::event_manager::{ListenOptions, ListenerId};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::SyncEngine;
use crate::firestore::core::view::ViewSnapshot;
use crate::firestore::error::{internal_error, is_transient_persistence_error, FirestoreError, FirestoreResult};
use crate::firestore::local::index_backfiller::IndexBackfiller;
use crate::firestore::local::kv_store::{lock_unpoisoned, KvStore, MemoryKvStore};
use crate::firestore::local::local_store::LocalStore;
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruResults};
use crate::firestore::local::persistence::{is_primary_lease_lost, Persistence};
use crate::firestore::local::query_engine::QueryEngine;
use crate::firestore::local::shared_client_state::{SharedClientBus, SharedClientState};
use crate::firestore::model::{DatabaseId, Document, DocumentKey, FieldIndex, Mutation, User};
use crate::firestore::remote::connection::{Connection, StreamHandle, StreamKind};
use crate::firestore::remote::credentials::CredentialsProvider;
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::persistent_stream::{RemoteTimer, StreamEvent, StreamIo};
use crate::firestore::remote::remote_store::RemoteStore;
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::settings::{FirestoreSettings, PersistenceSettings, CLIENT_METADATA_REFRESH_INTERVAL};
use crate::platform::runtime::spawn_detached;
use crate::util::PartialObserver;

type SharedEngine = Arc<async_lock::Mutex<SyncEngine>>;

/// Collaborators a client is built from.
pub struct ClientComponents {
    pub connection: Arc<dyn Connection>,
    pub credentials: Arc<dyn CredentialsProvider>,
    /// Store shared with other clients. Built from the settings when absent.
    pub store: Option<Arc<dyn KvStore>>,
    /// Channel to the other clients of a shared store.
    pub bus: Option<Arc<SharedClientBus>>,
}

impl ClientComponents {
    pub fn new(connection: Arc<dyn Connection>, credentials: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            connection,
            credentials,
            store: None,
            bus: None,
        }
    }

    pub fn with_shared_store(mut self, store: Arc<dyn KvStore>, bus: Arc<SharedClientBus>) -> Self {
        self.store = Some(store);
        self.bus = Some(bus);
        self
    }
}

/// An offline-first client for one database.
///
/// Every operation is serialized through the client's [`AsyncQueue`]; the
/// methods here submit work and wait for its result.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    database_id: DatabaseId,
    client_id: String,
    settings: FirestoreSettings,
    queue: AsyncQueue,
    engine: SharedEngine,
    io: Arc<ClientStreamIo>,
    persistence: Arc<Persistence>,
    persistence_error: Option<FirestoreError>,
    bus: Arc<SharedClientBus>,
    terminated: AtomicBool,
}

impl FirestoreClient {
    /// Opens persistence, starts the sync engine and schedules the
    /// background jobs.
    ///
    /// A disk store that cannot be opened is replaced by an in-memory one; the
    /// original error stays available through
    /// [`FirestoreClient::persistence_error`].
    pub async fn start(
        database_id: DatabaseId,
        settings: FirestoreSettings,
        components: ClientComponents,
    ) -> FirestoreResult<Self> {
        settings.validate()?;
        let client_id = generate_client_id();
        let ClientComponents {
            connection,
            credentials,
            store,
            bus,
        } = components;

        let (store, persistence_error) = match store {
            Some(store) => (store, None),
            None => open_store(&settings.persistence),
        };
        let persistence = Arc::new(Persistence::new(store, client_id.clone(), settings.synchronize_tabs));
        persistence.start()?;

        let user = credentials.current().user;
        let mut query_engine = QueryEngine::new(
            settings.index_auto_creation_min_collection_size,
            settings.relative_index_read_cost_per_document,
        );
        query_engine.set_index_auto_creation_enabled(settings.index_auto_creation_enabled);
        let local_store = LocalStore::new(Arc::clone(&persistence), query_engine, user.clone());
        local_store.start()?;

        let queue = AsyncQueue::new();
        let io = Arc::new(ClientStreamIo::new(connection, credentials, queue.clone()));
        let remote_store = RemoteStore::new(
            Arc::clone(&io) as Arc<dyn StreamIo>,
            JsonProtoSerializer::new(database_id.clone()),
        );

        let bus = bus.unwrap_or_else(SharedClientBus::new);
        let mut shared_client_state = SharedClientState::new(client_id.clone(), Arc::clone(&bus), user);
        let shared_messages = settings
            .synchronize_tabs
            .then(|| shared_client_state.start());

        let engine: SharedEngine = Arc::new(async_lock::Mutex::new(SyncEngine::new(
            local_store,
            remote_store,
            shared_client_state,
            settings.max_concurrent_limbo_resolutions,
        )));
        io.attach(Arc::downgrade(&engine));

        let started = Arc::clone(&engine);
        queue
            .enqueue(move || async move { started.lock().await.start() })
            .await?;

        let inner = Arc::new(ClientInner {
            database_id,
            client_id,
            settings,
            queue,
            engine,
            io,
            persistence,
            persistence_error,
            bus,
            terminated: AtomicBool::new(false),
        });

        if let Some(messages) = shared_messages {
            pump_shared_client_messages(&inner, messages);
            schedule_client_metadata_refresh(inner.queue.clone(), Arc::clone(&inner.engine));
        }
        if inner.settings.gc_enabled() {
            let collector = Arc::new(LruGarbageCollector::new(inner.settings.lru_params()));
            schedule_garbage_collection(
                inner.queue.clone(),
                Arc::clone(&inner.engine),
                collector,
                inner.settings.gc_initial_delay,
                inner.settings.gc_interval,
            );
        }
        if inner.settings.index_auto_creation_enabled {
            let backfiller = Arc::new(IndexBackfiller::new(inner.settings.index_backfill_max_documents));
            schedule_index_backfill(
                inner.queue.clone(),
                Arc::clone(&inner.engine),
                backfiller,
                inner.settings.index_backfill_initial_delay,
                inner.settings.index_backfill_interval,
            );
        }

        log::debug!(
            "client {} started for {}",
            inner.client_id,
            inner.database_id.database_name()
        );
        Ok(Self { inner })
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn database_id(&self) -> &DatabaseId {
        &self.inner.database_id
    }

    pub fn settings(&self) -> &FirestoreSettings {
        &self.inner.settings
    }

    /// Why the configured persistence was replaced by an in-memory store.
    pub fn persistence_error(&self) -> Option<&FirestoreError> {
        self.inner.persistence_error.as_ref()
    }

    pub fn async_queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn shared_client_bus(&self) -> &Arc<SharedClientBus> {
        &self.inner.bus
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::SeqCst)
    }

    pub async fn is_primary(&self) -> FirestoreResult<bool> {
        self.run(|engine| Ok(engine.is_primary_client())).await
    }

    pub async fn online_state(&self) -> FirestoreResult<OnlineState> {
        self.run(|engine| Ok(engine.online_state())).await
    }

    /// Registers `observer` for snapshots of `query`. A snapshot from the
    /// cache may be delivered before this returns.
    pub async fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: PartialObserver<ViewSnapshot>,
    ) -> FirestoreResult<ListenerId> {
        self.run(move |engine| engine.listen(query, options, observer))
            .await
    }

    pub async fn unlisten(&self, listener_id: ListenerId) -> FirestoreResult<()> {
        self.run(move |engine| engine.unlisten(listener_id)).await
    }

    /// Applies `mutations` as one batch. Resolves once the backend accepted
    /// or rejected it.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let (sender, receiver) = async_channel::bounded(1);
        self.run(move |engine| engine.write(mutations, sender)).await?;
        receiver
            .recv()
            .await
            .map_err(|_| internal_error("write was dropped before completing"))?
    }

    /// Resolves once every write issued before this call is resolved.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let (sender, receiver) = async_channel::bounded(1);
        self.run(move |engine| {
            engine.register_pending_writes_callback(sender);
            Ok(())
        })
        .await?;
        receiver
            .recv()
            .await
            .map_err(|_| internal_error("pending writes wait was dropped"))?
    }

    /// Reads `key` from the cache. `Ok(None)` means the document is known
    /// not to exist.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Option<Document>> {
        self.run(move |engine| engine.get_document_from_cache(&key)).await
    }

    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        self.run(move |engine| engine.get_documents_from_cache(&query))
            .await
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        self.run(|engine| engine.enable_network()).await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        self.run(|engine| engine.disable_network()).await
    }

    /// Reconnects the streams, e.g. after the device changed networks.
    pub async fn handle_connectivity_change(&self) -> FirestoreResult<()> {
        self.run(|engine| engine.handle_connectivity_change()).await
    }

    pub async fn set_app_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        self.run(move |engine| engine.set_in_foreground(in_foreground))
            .await
    }

    /// Switches to `user`. Call after the credentials provider started
    /// returning the new user's credentials.
    pub async fn handle_credential_change(&self, user: User) -> FirestoreResult<()> {
        self.run(move |engine| engine.handle_credential_change(user))
            .await
    }

    pub async fn configure_field_indexes(&self, indexes: Vec<FieldIndex>) -> FirestoreResult<()> {
        self.run(move |engine| engine.local_store().configure_field_indexes(indexes))
            .await
    }

    pub async fn set_index_auto_creation_enabled(&self, enabled: bool) -> FirestoreResult<()> {
        self.run(move |engine| {
            engine.local_store_mut().set_index_auto_creation_enabled(enabled);
            Ok(())
        })
        .await
    }

    /// Runs garbage collection now, independent of the schedule.
    pub async fn collect_garbage(&self) -> FirestoreResult<LruResults> {
        let collector = LruGarbageCollector::new(self.inner.settings.lru_params());
        self.run(move |engine| engine.collect_garbage(&collector)).await
    }

    /// Runs one index backfill pass now and returns the documents indexed.
    pub async fn backfill_indexes(&self) -> FirestoreResult<usize> {
        let backfiller = IndexBackfiller::new(self.inner.settings.index_backfill_max_documents);
        self.run(move |engine| engine.backfill_indexes(&backfiller)).await
    }

    /// Shuts the client down. Later calls fail with FailedPrecondition.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.queue.enter_restricted_mode();
        let engine = Arc::clone(&self.inner.engine);
        let persistence = Arc::clone(&self.inner.persistence);
        let io = Arc::clone(&self.inner.io);
        self.inner
            .queue
            .enqueue_even_while_restricted(move || async move {
                engine.lock().await.shutdown()?;
                io.close_all();
                persistence.shutdown()
            })
            .await?;
        log::debug!("client {} terminated", self.inner.client_id);
        Ok(())
    }

    async fn run<F, T>(&self, op: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut SyncEngine) -> FirestoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.inner.engine);
        self.inner
            .queue
            .enqueue(move || async move {
                let mut engine = engine.lock().await;
                op(&mut engine)
            })
            .await
    }
}

fn generate_client_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .map(char::from)
        .take(20)
        .collect()
}

fn open_store(settings: &PersistenceSettings) -> (Arc<dyn KvStore>, Option<FirestoreError>) {
    match settings {
        PersistenceSettings::Memory => (Arc::new(MemoryKvStore::new()), None),
        PersistenceSettings::Disk { path } => match open_disk_store(path) {
            Ok(store) => (store, None),
            Err(err) => {
                log::warn!(
                    "failed to open persistence at {}; falling back to memory cache: {err}",
                    path.display()
                );
                (Arc::new(MemoryKvStore::new()), Some(err))
            }
        },
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn open_disk_store(path: &Path) -> FirestoreResult<Arc<dyn KvStore>> {
    use crate::firestore::local::file_kv_store::FileKvStore;

    Ok(Arc::new(FileKvStore::open(path)?))
}

#[cfg(target_arch = "wasm32")]
fn open_disk_store(_path: &Path) -> FirestoreResult<Arc<dyn KvStore>> {
    Err(FirestoreError::new(
        crate::firestore::error::FirestoreErrorCode::Unimplemented,
        "disk persistence is not available on this platform",
    ))
}

fn pump_shared_client_messages(
    inner: &ClientInner,
    messages: async_channel::Receiver<crate::firestore::local::shared_client_state::SharedClientEnvelope>,
) {
    let queue = inner.queue.clone();
    let engine = Arc::downgrade(&inner.engine);
    spawn_detached(async move {
        while let Ok(envelope) = messages.recv().await {
            let engine = engine.clone();
            queue.enqueue_and_forget(move || async move {
                match engine.upgrade() {
                    Some(engine) => engine.lock().await.handle_shared_client_message(envelope),
                    None => Ok(()),
                }
            });
        }
    });
}

fn schedule_client_metadata_refresh(queue: AsyncQueue, engine: SharedEngine) {
    let next_queue = queue.clone();
    queue.enqueue_after_delay(
        TimerId::ClientMetadataRefresh,
        CLIENT_METADATA_REFRESH_INTERVAL,
        move || async move {
            engine.lock().await.refresh_client_metadata()?;
            schedule_client_metadata_refresh(next_queue, engine);
            Ok(())
        },
    );
}

fn schedule_garbage_collection(
    queue: AsyncQueue,
    engine: SharedEngine,
    collector: Arc<LruGarbageCollector>,
    delay: Duration,
    interval: Duration,
) {
    let next_queue = queue.clone();
    queue.enqueue_after_delay(TimerId::LruGarbageCollection, delay, move || async move {
        match engine.lock().await.collect_garbage(&collector) {
            Ok(results) if results.did_run => log::debug!(
                "garbage collection removed {} targets and {} documents",
                results.targets_removed,
                results.documents_removed
            ),
            Ok(_) => {}
            Err(err) if is_retryable_background_error(&err) => {
                log::warn!("ignoring error during garbage collection: {err}")
            }
            Err(err) => return Err(err),
        }
        schedule_garbage_collection(next_queue, engine, collector, interval, interval);
        Ok(())
    });
}

fn schedule_index_backfill(
    queue: AsyncQueue,
    engine: SharedEngine,
    backfiller: Arc<IndexBackfiller>,
    delay: Duration,
    interval: Duration,
) {
    let next_queue = queue.clone();
    queue.enqueue_after_delay(TimerId::IndexBackfill, delay, move || async move {
        match engine.lock().await.backfill_indexes(&backfiller) {
            Ok(count) if count > 0 => {
                log::debug!("index backfill processed {count} documents")
            }
            Ok(_) => {}
            Err(err) if is_retryable_background_error(&err) => {
                log::warn!("ignoring error during index backfill: {err}")
            }
            Err(err) => return Err(err),
        }
        schedule_index_backfill(next_queue, engine, backfiller, interval, interval);
        Ok(())
    });
}

/// Background jobs retry on their next run after these; anything else fails
/// the queue.
fn is_retryable_background_error(err: &FirestoreError) -> bool {
    is_transient_persistence_error(err) || is_primary_lease_lost(err)
}

fn timer_id(timer: RemoteTimer) -> TimerId {
    match timer {
        RemoteTimer::Backoff(StreamKind::Listen) => TimerId::ListenStreamConnectionBackoff,
        RemoteTimer::Backoff(StreamKind::Write) => TimerId::WriteStreamConnectionBackoff,
        RemoteTimer::Idle(StreamKind::Listen) => TimerId::ListenStreamIdle,
        RemoteTimer::Idle(StreamKind::Write) => TimerId::WriteStreamIdle,
        RemoteTimer::HealthCheck(_) => TimerId::HealthCheckTimeout,
        RemoteTimer::OnlineStateTimeout => TimerId::OnlineStateTimeout,
        RemoteTimer::NetworkRecovery => TimerId::NetworkRecovery,
    }
}

struct StreamSlot {
    generation: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    closed: bool,
}

/// Performs the remote store's I/O over a [`Connection`] and feeds the
/// completions back through the async queue.
struct ClientStreamIo {
    connection: Arc<dyn Connection>,
    credentials: Arc<dyn CredentialsProvider>,
    queue: AsyncQueue,
    engine: OnceLock<Weak<async_lock::Mutex<SyncEngine>>>,
    streams: Arc<Mutex<HashMap<StreamKind, StreamSlot>>>,
    timers: Mutex<HashMap<RemoteTimer, DelayedOperation>>,
}

impl ClientStreamIo {
    fn new(connection: Arc<dyn Connection>, credentials: Arc<dyn CredentialsProvider>, queue: AsyncQueue) -> Self {
        Self {
            connection,
            credentials,
            queue,
            engine: OnceLock::new(),
            streams: Arc::new(Mutex::new(HashMap::new())),
            timers: Mutex::new(HashMap::new()),
        }
    }

    fn attach(&self, engine: Weak<async_lock::Mutex<SyncEngine>>) {
        if self.engine.set(engine).is_err() {
            log::warn!("stream io attached twice");
        }
    }

    fn deliverer(&self) -> Deliverer {
        Deliverer {
            queue: self.queue.clone(),
            engine: self.engine.get().cloned().unwrap_or_default(),
        }
    }

    fn close_all(&self) {
        let mut streams = lock_unpoisoned(&self.streams);
        for slot in streams.values_mut() {
            slot.closed = true;
            if let Some(handle) = slot.handle.take() {
                handle.close();
            }
        }
        for (_, timer) in lock_unpoisoned(&self.timers).drain() {
            timer.cancel();
        }
    }
}

#[derive(Clone)]
struct Deliverer {
    queue: AsyncQueue,
    engine: Weak<async_lock::Mutex<SyncEngine>>,
}

impl Deliverer {
    fn deliver(&self, event: StreamEvent) {
        let engine = self.engine.clone();
        self.queue.enqueue_and_forget(move || async move {
            match engine.upgrade() {
                Some(engine) => engine.lock().await.handle_stream_event(event),
                None => Ok(()),
            }
        });
    }
}

impl StreamIo for ClientStreamIo {
    fn open_stream(&self, kind: StreamKind, generation: u64) {
        {
            let mut streams = lock_unpoisoned(&self.streams);
            if let Some(previous) = streams.insert(
                kind,
                StreamSlot {
                    generation,
                    handle: None,
                    closed: false,
                },
            ) {
                if let Some(handle) = previous.handle {
                    handle.close();
                }
            }
        }

        let connection = Arc::clone(&self.connection);
        let credentials = self.credentials.current();
        let streams = Arc::clone(&self.streams);
        let deliverer = self.deliverer();
        spawn_detached(async move {
            let handle = match connection.open_stream(kind, credentials).await {
                Ok(handle) => handle,
                Err(error) => {
                    deliverer.deliver(StreamEvent::Closed {
                        kind,
                        generation,
                        error: Some(error),
                    });
                    return;
                }
            };
            {
                let mut streams = lock_unpoisoned(&streams);
                match streams.get_mut(&kind) {
                    Some(slot) if slot.generation == generation && !slot.closed => {
                        slot.handle = Some(Arc::clone(&handle));
                    }
                    _ => {
                        handle.close();
                        return;
                    }
                }
            }
            deliverer.deliver(StreamEvent::Opened { kind, generation });
            loop {
                match handle.next().await {
                    Some(Ok(frame)) => deliverer.deliver(StreamEvent::Message {
                        kind,
                        generation,
                        frame,
                    }),
                    Some(Err(error)) => {
                        deliverer.deliver(StreamEvent::Closed {
                            kind,
                            generation,
                            error: Some(error),
                        });
                        break;
                    }
                    None => {
                        deliverer.deliver(StreamEvent::Closed {
                            kind,
                            generation,
                            error: None,
                        });
                        break;
                    }
                }
            }
        });
    }

    fn send(&self, kind: StreamKind, generation: u64, frame: JsonValue) {
        let handle = lock_unpoisoned(&self.streams)
            .get(&kind)
            .filter(|slot| slot.generation == generation)
            .and_then(|slot| slot.handle.clone());
        match handle {
            Some(handle) => {
                if let Err(err) = handle.send(frame) {
                    log::debug!("dropping {} frame: {err}", kind.label());
                }
            }
            None => log::debug!("no open {} stream for frame", kind.label()),
        }
    }

    fn close_stream(&self, kind: StreamKind, generation: u64) {
        let mut streams = lock_unpoisoned(&self.streams);
        if let Some(slot) = streams.get_mut(&kind) {
            if slot.generation == generation {
                slot.closed = true;
                if let Some(handle) = slot.handle.take() {
                    handle.close();
                }
            }
        }
    }

    fn schedule(&self, timer: RemoteTimer, delay: Duration, token: u64) {
        let deliverer = self.deliverer();
        let operation = self
            .queue
            .enqueue_after_delay(timer_id(timer), delay, move || async move {
                deliverer.deliver(StreamEvent::TimerFired { timer, token });
                Ok(())
            });
        if let Some(previous) = lock_unpoisoned(&self.timers).insert(timer, operation) {
            previous.cancel();
        }
    }

    fn invalidate_credentials(&self) {
        self.credentials.invalidate_token();
    }
}
