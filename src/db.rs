//! The database aggregate: collection registry, event reduction, and the
//! bridge between local commits and the remote thread.
//!
//! A [`Db`] owns one thread, a transactional datastore, the dispatcher,
//! the event codec, the local events bus, and the state-change notifier.
//! Local mutations flow commit -> dispatch (reduce + index + persist) ->
//! bus -> network; remote records flow network -> decrypt -> decode ->
//! dispatch. Both paths converge on the same reduction, serialized by a
//! single DB-wide lock so remote applications never interleave with
//! local commits.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::bus::{LocalEventsBus, LocalEventsSubscription};
use crate::collection::{Collection, CollectionConfig};
use crate::datastore::{Datastore, RedbDatastore, WriteTxn};
use crate::dispatcher::{Dispatcher, Reducer};
use crate::error::{Error, Result};
use crate::event::{CborCodec, Event, EventCodec, EventKind, IndexFn};
use crate::index::{IndexConfig, index_add, index_delete};
use crate::key::Key;
use crate::network::{
    App, Block, Connector, LogId, Multiaddr, Net, NetRecord, ThreadId, ThreadKey, ThreadRecord,
    Token,
};
use crate::notifier::{Action, ActionType, StateChangeNotifier, Subscription};
use crate::txn::{Txn, TxnOptions};

/// Attempts made to fetch a record's block before giving up.
const GET_BLOCK_RETRIES: usize = 3;

/// Backoff before the second fetch attempt; doubles on each retry.
const GET_BLOCK_INITIAL_BACKOFF: Duration = Duration::from_millis(500);

/// Prefix of the persisted collection schemas.
pub(crate) fn schemas_prefix() -> Key {
    Key::new("/db/schema")
}

/// Key persisting the schema of `collection`.
pub(crate) fn schema_key(collection: &str) -> Key {
    schemas_prefix().child(collection)
}

/// Key persisting the index-config list of `collection`.
pub(crate) fn index_config_key(collection: &str) -> Key {
    Key::new("/db/index").child(collection)
}

/// Root of the instance keyspace events reduce into.
pub(crate) fn base_key() -> Key {
    Key::root()
}

/// Construction options for a [`Db`].
#[derive(Default)]
pub struct DbOptions {
    /// External datastore; omitting it creates one at
    /// [`repo_path`](DbOptions::repo_path).
    pub datastore: Option<Arc<dyn Datastore>>,
    /// Whether the supplied datastore is owned elsewhere; a managed
    /// store is not closed by [`Db::close`].
    pub managed_datastore: bool,
    /// Event codec override; defaults to [`CborCodec`].
    pub codec: Option<Arc<dyn EventCodec>>,
    /// Collections to register at open time.
    pub collections: Vec<CollectionConfig>,
    /// Where the default datastore lives when none is supplied.
    pub repo_path: Option<PathBuf>,
    /// Tune the default datastore for a small memory footprint.
    pub low_mem: bool,
    /// Emit extra per-record debug logging.
    pub debug: bool,
    /// Auth token passed to network calls.
    pub token: Option<Token>,
}

impl DbOptions {
    /// Use an externally created datastore.
    pub fn with_datastore(mut self, datastore: Arc<dyn Datastore>) -> Self {
        self.datastore = Some(datastore);
        self
    }

    /// Mark the datastore as owned elsewhere; `close` will not close it.
    pub fn with_managed_datastore(mut self) -> Self {
        self.managed_datastore = true;
        self
    }

    /// Override the event codec.
    pub fn with_codec(mut self, codec: Arc<dyn EventCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    /// Register a collection at open time.
    pub fn with_collection(mut self, config: CollectionConfig) -> Self {
        self.collections.push(config);
        self
    }

    /// Create the default datastore under `path`.
    pub fn with_repo_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.repo_path = Some(path.into());
        self
    }

    /// Open the default datastore with a small cache.
    pub fn with_low_mem(mut self) -> Self {
        self.low_mem = true;
        self
    }

    /// Raise log verbosity for this database.
    pub fn with_debug(mut self) -> Self {
        self.debug = true;
        self
    }

    /// Authenticate network calls with `token`.
    pub fn with_token(mut self, token: Token) -> Self {
        self.token = Some(token);
        self
    }
}

/// Invite material other peers use to join this database's thread.
#[derive(Debug, Clone)]
pub struct DbInfo {
    /// Addresses the thread is reachable at.
    pub addrs: Vec<Multiaddr>,
    /// The thread key.
    pub key: ThreadKey,
}

impl std::fmt::Debug for DbInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbInner")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}

pub(crate) struct DbInner {
    pub(crate) thread_id: ThreadId,
    pub(crate) datastore: Arc<dyn Datastore>,
    managed_datastore: bool,
    pub(crate) codec: Arc<dyn EventCodec>,
    pub(crate) dispatcher: Dispatcher,
    /// The DB-wide state lock. Shared for read transactions; exclusive
    /// for write transactions, remote dispatch, collection registration,
    /// and close.
    pub(crate) state_lock: tokio::sync::RwLock<()>,
    collections: parking_lot::RwLock<HashMap<String, Collection>>,
    pub(crate) bus: LocalEventsBus,
    notifier: StateChangeNotifier,
    connector: parking_lot::Mutex<Option<Connector>>,
    pub(crate) token: Option<Token>,
    debug: bool,
    closed: AtomicBool,
}

/// An embedded, thread-replicated document database. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    inner: Arc<DbInner>,
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("thread_id", &self.inner.thread_id)
            .finish_non_exhaustive()
    }
}

impl Db {
    /// Create a database on a new thread with the given id.
    ///
    /// If the thread already exists locally, construction continues
    /// without error.
    pub async fn new(net: Arc<dyn Net>, id: ThreadId, options: DbOptions) -> Result<Db> {
        match net.create_thread(&id, options.token.as_ref()).await {
            Ok(_) | Err(Error::ThreadExists) => {}
            Err(err) => return Err(err),
        }
        Self::build(net, id, options).await
    }

    /// Join a thread hosted by another peer and create a database on it.
    ///
    /// After construction a background task pulls the thread so remote
    /// state starts converging immediately.
    pub async fn new_from_addr(
        net: Arc<dyn Net>,
        addr: Multiaddr,
        key: ThreadKey,
        options: DbOptions,
    ) -> Result<Db> {
        let token = options.token.clone();
        let info = net.add_thread(&addr, &key, token.as_ref()).await?;
        let db = Self::build(net.clone(), info.id, options).await?;

        let id = info.id;
        tokio::spawn(async move {
            if let Err(err) = net.pull_thread(&id, token.as_ref()).await {
                tracing::error!(thread = %id, %err, "error pulling thread");
            }
        });
        Ok(db)
    }

    async fn build(net: Arc<dyn Net>, id: ThreadId, options: DbOptions) -> Result<Db> {
        let datastore: Arc<dyn Datastore> = match options.datastore {
            Some(datastore) => datastore,
            None => {
                let repo = options.repo_path.ok_or_else(|| {
                    Error::Config("either a datastore or a repo path is required".to_string())
                })?;
                Arc::new(RedbDatastore::open(&repo, options.low_mem)?)
            }
        };
        let codec: Arc<dyn EventCodec> = options
            .codec
            .unwrap_or_else(|| Arc::new(CborCodec));

        let inner = Arc::new(DbInner {
            thread_id: id,
            datastore: datastore.clone(),
            managed_datastore: options.managed_datastore,
            codec,
            dispatcher: Dispatcher::new(datastore),
            state_lock: tokio::sync::RwLock::new(()),
            collections: parking_lot::RwLock::new(HashMap::new()),
            bus: LocalEventsBus::new(),
            notifier: StateChangeNotifier::new(),
            connector: parking_lot::Mutex::new(None),
            token: options.token,
            debug: options.debug && !options.managed_datastore,
            closed: AtomicBool::new(false),
        });
        let inner_dyn: Arc<dyn Reducer> = inner.clone();
        let reducer: Weak<dyn Reducer> = Arc::downgrade(&inner_dyn);
        inner.dispatcher.register(reducer);

        inner.recreate_collections()?;
        for config in options.collections {
            inner.new_collection_locked(config)?;
        }

        // Failure to connect is fatal at construction time.
        let connector = net.connect_app(inner.clone(), &id)?;
        *inner.connector.lock() = Some(connector);

        if inner.debug {
            tracing::debug!(thread = %id, "database ready");
        }
        Ok(Db { inner })
    }

    /// The thread this database replicates over.
    pub fn thread_id(&self) -> ThreadId {
        self.inner.thread_id
    }

    /// Register a new collection.
    ///
    /// Fails if the name is taken or the schema does not declare a
    /// string `_id` property. The schema is persisted (if absent), a
    /// unique index on `_id` is added, then each supplied index.
    pub async fn new_collection(&self, config: CollectionConfig) -> Result<Collection> {
        self.inner.check_open()?;
        let _guard = self.inner.state_lock.write().await;
        self.inner.new_collection_locked(config)
    }

    /// Look up a registered collection; never constructs one.
    pub fn get_collection(&self, name: &str) -> Option<Collection> {
        self.inner.get_collection(name)
    }

    /// The thread's advertised addresses and key, for inviting peers.
    ///
    /// `token` falls back to the construction-time token when omitted.
    pub async fn get_db_info(&self, token: Option<&Token>) -> Result<DbInfo> {
        self.inner.check_open()?;
        let (net, thread_id) = {
            let guard = self.inner.connector.lock();
            let connector = guard.as_ref().ok_or(Error::Closed)?;
            (connector.net().clone(), connector.thread_id())
        };
        let token = token.or(self.inner.token.as_ref());
        let info = net.get_thread(&thread_id, token).await?;
        Ok(DbInfo {
            addrs: info.addrs,
            key: info.key,
        })
    }

    /// Subscribe to post-commit state changes.
    pub fn listen(&self) -> Result<Subscription> {
        self.inner.check_open()?;
        self.inner.notifier.listen().ok_or(Error::Closed)
    }

    /// Apply one remote record. See [`App::handle_net_record`].
    pub async fn handle_net_record(
        &self,
        rec: Arc<dyn ThreadRecord>,
        key: ThreadKey,
        local_log: LogId,
        timeout: Duration,
    ) -> Result<()> {
        self.inner
            .handle_net_record(rec, key, local_log, timeout)
            .await
    }

    /// Close the database. Idempotent; concurrent callers are safe and
    /// only the first performs real work.
    ///
    /// Closes the network connector, discards the local events bus,
    /// closes the datastore (unless externally managed), and releases
    /// all state-change listeners.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let _guard = self.inner.state_lock.write().await;
        if let Some(connector) = self.inner.connector.lock().take() {
            connector.close()?;
        }
        self.inner.bus.discard();
        if !self.inner.managed_datastore {
            self.inner.datastore.close()?;
        }
        self.inner.notifier.close();
        tracing::debug!(thread = %self.inner.thread_id, "database closed");
        Ok(())
    }
}

impl DbInner {
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    pub(crate) fn get_collection(&self, name: &str) -> Option<Collection> {
        self.collections.read().get(name).cloned()
    }

    // Load persisted schemas and index configs and re-register their
    // collections. Runs during construction, before any concurrency.
    fn recreate_collections(self: &Arc<Self>) -> Result<()> {
        let txn = self.datastore.read()?;
        for (key, schema_bytes) in txn.prefix(&schemas_prefix())? {
            let name = key.name().to_string();
            let schema: Value = serde_json::from_slice(&schema_bytes)?;
            let indexes: Vec<IndexConfig> = match txn.get(&index_config_key(&name))? {
                Some(bytes) => serde_json::from_slice(&bytes)?,
                None => Vec::new(),
            };
            tracing::debug!(collection = %name, indexes = indexes.len(), "rehydrating collection");
            self.new_collection_locked(CollectionConfig {
                name,
                schema,
                indexes,
            })?;
        }
        Ok(())
    }

    // Collection registration body; the caller holds the DB-wide
    // exclusive lock (or has sole access during construction).
    fn new_collection_locked(self: &Arc<Self>, config: CollectionConfig) -> Result<Collection> {
        if self.collections.read().contains_key(&config.name) {
            return Err(Error::CollectionAlreadyRegistered(config.name));
        }
        let collection =
            Collection::new(config.name.clone(), config.schema.clone(), Arc::downgrade(self))?;

        let key = schema_key(&config.name);
        let mut txn = self.datastore.write()?;
        if !txn.has(&key)? {
            txn.put(&key, &serde_json::to_vec(&config.schema)?)?;
            txn.commit()?;
        } else {
            txn.discard();
        }

        collection.add_index_locked(self, IndexConfig::unique("_id"))?;
        for index in config.indexes {
            collection.add_index_locked(self, index)?;
        }

        self.collections
            .write()
            .insert(config.name.clone(), collection.clone());
        tracing::debug!(collection = %config.name, "collection registered");
        Ok(collection)
    }

    /// Apply remote events under the same exclusive lock as local write
    /// transactions, so the two paths can never interleave.
    pub(crate) async fn dispatch(&self, events: &[Event]) -> Result<()> {
        let _guard = self.state_lock.write().await;
        self.dispatcher.dispatch(events)
    }

    pub(crate) async fn read_txn<F, R>(
        self: &Arc<Self>,
        collection: &Collection,
        f: F,
        opts: TxnOptions,
    ) -> Result<R>
    where
        F: FnOnce(&mut Txn) -> Result<R>,
    {
        self.check_open()?;
        let _guard = self.state_lock.read().await;
        let mut txn = Txn::new(collection.clone(), self.clone(), opts.token, true);
        f(&mut txn)
    }

    pub(crate) async fn write_txn<F, R>(
        self: &Arc<Self>,
        collection: &Collection,
        f: F,
        opts: TxnOptions,
    ) -> Result<R>
    where
        F: FnOnce(&mut Txn) -> Result<R>,
    {
        self.check_open()?;
        let _guard = self.state_lock.write().await;
        let mut txn = Txn::new(collection.clone(), self.clone(), opts.token, false);
        // An error from the closure drops the transaction, discarding
        // every staged event.
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    fn net(&self) -> Result<Arc<dyn Net>> {
        self.connector
            .lock()
            .as_ref()
            .map(|connector| connector.net().clone())
            .ok_or(Error::Closed)
    }

    /// Fetch a record's block with exponential backoff: up to three
    /// attempts, waiting 500 ms then 1 s between them. Returns the first
    /// success or the last error.
    async fn get_block_with_retry(&self, record: &dyn NetRecord) -> Result<Block> {
        let net = self.net()?;
        let mut backoff = GET_BLOCK_INITIAL_BACKOFF;
        let mut last_err = Error::Network("block fetch failed".to_string());
        for attempt in 1..=GET_BLOCK_RETRIES {
            match record.get_block(net.as_ref()).await {
                Ok(block) => return Ok(block),
                Err(err) => {
                    tracing::warn!(cid = %record.cid(), attempt, %err, "error fetching block");
                    last_err = err;
                }
            }
            if attempt < GET_BLOCK_RETRIES {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
        }
        Err(last_err)
    }
}

impl Reducer for DbInner {
    /// Reduce `events` into collection state: delegate to the codec with
    /// the base key and the index-maintenance callback, then notify
    /// listeners of the resulting actions.
    fn reduce(&self, events: &[Event], txn: &mut dyn WriteTxn) -> Result<()> {
        let index_fn = |collection: &str,
                        key: &Key,
                        old: Option<&[u8]>,
                        new: Option<&[u8]>,
                        txn: &mut dyn WriteTxn|
         -> Result<()> {
            let registered = self
                .get_collection(collection)
                .ok_or_else(|| Error::CollectionNotFound(collection.to_string()))?;
            let indexes = registered.indexes();
            if let Some(old) = old {
                index_delete(txn, collection, &indexes, key, old)?;
            }
            if let Some(new) = new {
                index_add(txn, collection, &indexes, key, new)?;
            }
            Ok(())
        };
        let index_fn: IndexFn<'_> = &index_fn;

        let codec_actions = self.codec.reduce(events, txn, &base_key(), index_fn)?;
        let actions: Vec<Action> = codec_actions
            .into_iter()
            .map(|action| Action {
                collection: action.collection,
                kind: match action.kind {
                    EventKind::Create => ActionType::Create,
                    EventKind::Save => ActionType::Save,
                    EventKind::Delete => ActionType::Delete,
                },
                instance_id: action.instance_id,
            })
            .collect();
        self.notifier.notify(actions);
        Ok(())
    }
}

#[async_trait]
impl App for DbInner {
    async fn handle_net_record(
        &self,
        rec: Arc<dyn ThreadRecord>,
        key: ThreadKey,
        local_log: LogId,
        timeout: Duration,
    ) -> Result<()> {
        if rec.log_id() == local_log {
            // Our own events were already applied at commit time.
            return Ok(());
        }
        self.check_open()?;

        let work = async {
            let record = rec.value();
            let event = match record.event() {
                Ok(event) => event,
                Err(_) => {
                    let block = self.get_block_with_retry(record).await.map_err(|err| {
                        Error::Network(format!("error when getting block from record: {err}"))
                    })?;
                    record.event_from_block(block).map_err(|err| {
                        Error::Network(format!("error when decoding block to event: {err}"))
                    })?
                }
            };
            let net = self.net()?;
            let body = event.body(net.as_ref(), &key).await.map_err(|err| {
                Error::Network(format!(
                    "error when getting body of event on thread {}/{}: {err}",
                    rec.thread_id(),
                    rec.log_id()
                ))
            })?;
            let events = self.codec.events_from_bytes(&body)?;
            if self.debug {
                tracing::debug!(
                    thread = %rec.thread_id(),
                    log = %rec.log_id(),
                    "dispatching new record"
                );
            }
            self.dispatch(&events).await
        };

        match tokio::time::timeout(timeout, work).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout),
        }
    }

    fn local_event_listen(&self) -> Result<LocalEventsSubscription> {
        self.bus.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{NetEvent, ThreadInfo};
    use crate::query::Query;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    // ---------------------------------------------------------------
    // In-process stub of the thread network: a Hub is the shared
    // "network", each StubNet is one peer's view of it.
    // ---------------------------------------------------------------

    #[derive(Default)]
    struct Hub {
        threads: parking_lot::Mutex<HashMap<ThreadId, ThreadKey>>,
        logs: parking_lot::Mutex<HashMap<ThreadId, Vec<(LogId, Vec<u8>)>>>,
    }

    impl Hub {
        fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn log_len(&self, id: &ThreadId) -> usize {
            self.logs.lock().get(id).map(Vec::len).unwrap_or(0)
        }
    }

    struct StubNet {
        hub: Arc<Hub>,
        log_id: LogId,
        apps: parking_lot::Mutex<HashMap<ThreadId, Arc<dyn App>>>,
    }

    impl StubNet {
        fn new(hub: Arc<Hub>) -> Arc<Self> {
            Arc::new(Self {
                hub,
                log_id: LogId::random(),
                apps: parking_lot::Mutex::new(HashMap::new()),
            })
        }
    }

    #[async_trait]
    impl Net for StubNet {
        async fn create_thread(&self, id: &ThreadId, _token: Option<&Token>) -> Result<ThreadInfo> {
            let mut threads = self.hub.threads.lock();
            if threads.contains_key(id) {
                return Err(Error::ThreadExists);
            }
            let key = ThreadKey::random();
            threads.insert(*id, key);
            Ok(ThreadInfo {
                id: *id,
                addrs: vec![Multiaddr::new(format!("/mem/{id}"))],
                key,
            })
        }

        async fn add_thread(
            &self,
            addr: &Multiaddr,
            key: &ThreadKey,
            _token: Option<&Token>,
        ) -> Result<ThreadInfo> {
            let id: ThreadId = addr
                .as_str()
                .strip_prefix("/mem/")
                .ok_or_else(|| Error::Network(format!("unreachable address {addr}")))?
                .parse()?;
            self.hub.threads.lock().entry(id).or_insert(*key);
            Ok(ThreadInfo {
                id,
                addrs: vec![addr.clone()],
                key: *key,
            })
        }

        async fn pull_thread(&self, id: &ThreadId, _token: Option<&Token>) -> Result<()> {
            let app = self
                .apps
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| Error::Network("no app connected".to_string()))?;
            let key = *self
                .hub
                .threads
                .lock()
                .get(id)
                .ok_or_else(|| Error::Network("unknown thread".to_string()))?;
            let records: Vec<(LogId, Vec<u8>)> =
                self.hub.logs.lock().get(id).cloned().unwrap_or_default();
            for (log_id, payload) in records {
                let rec: Arc<dyn ThreadRecord> = Arc::new(StubThreadRecord {
                    thread_id: *id,
                    log_id,
                    record: StubRecord::inline(payload),
                });
                app.handle_net_record(rec, key, self.log_id, Duration::from_secs(5))
                    .await?;
            }
            Ok(())
        }

        async fn get_thread(&self, id: &ThreadId, _token: Option<&Token>) -> Result<ThreadInfo> {
            let key = *self
                .hub
                .threads
                .lock()
                .get(id)
                .ok_or_else(|| Error::Network("unknown thread".to_string()))?;
            Ok(ThreadInfo {
                id: *id,
                addrs: vec![Multiaddr::new(format!("/mem/{id}"))],
                key,
            })
        }

        fn connect_app(self: Arc<Self>, app: Arc<dyn App>, id: &ThreadId) -> Result<Connector> {
            self.apps.lock().insert(*id, app.clone());

            // Drain the app's committed batches into this peer's log.
            let mut subscription = app.local_event_listen()?;
            let hub = self.hub.clone();
            let log_id = self.log_id;
            let forwarder = tokio::spawn(async move {
                while let Some(event) = subscription.recv().await {
                    hub.logs
                        .lock()
                        .entry(event.thread_id)
                        .or_default()
                        .push((log_id, event.payload));
                }
            });

            let net = self.clone();
            let thread_id = *id;
            Ok(Connector::new(self, thread_id, move || {
                net.apps.lock().remove(&thread_id);
                forwarder.abort();
            }))
        }
    }

    struct StubThreadRecord {
        thread_id: ThreadId,
        log_id: LogId,
        record: StubRecord,
    }

    impl ThreadRecord for StubThreadRecord {
        fn thread_id(&self) -> ThreadId {
            self.thread_id
        }

        fn log_id(&self) -> LogId {
            self.log_id
        }

        fn value(&self) -> &dyn NetRecord {
            &self.record
        }
    }

    struct StubRecord {
        payload: Vec<u8>,
        inline: bool,
        remaining_failures: AtomicUsize,
        fetch_attempts: AtomicUsize,
    }

    impl StubRecord {
        fn inline(payload: Vec<u8>) -> Self {
            Self {
                payload,
                inline: true,
                remaining_failures: AtomicUsize::new(0),
                fetch_attempts: AtomicUsize::new(0),
            }
        }

        fn fetched(payload: Vec<u8>, failures: usize) -> Self {
            Self {
                payload,
                inline: false,
                remaining_failures: AtomicUsize::new(failures),
                fetch_attempts: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl NetRecord for StubRecord {
        fn cid(&self) -> String {
            "stub-cid".to_string()
        }

        fn event(&self) -> Result<Box<dyn NetEvent>> {
            if self.inline {
                Ok(Box::new(StubEvent {
                    payload: self.payload.clone(),
                }))
            } else {
                Err(Error::Network("record body not inline".to_string()))
            }
        }

        async fn get_block(&self, _net: &dyn Net) -> Result<Block> {
            self.fetch_attempts.fetch_add(1, Ordering::SeqCst);
            let failed = self
                .remaining_failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failed {
                Err(Error::Network("block temporarily unavailable".to_string()))
            } else {
                Ok(Block(self.payload.clone()))
            }
        }

        fn event_from_block(&self, block: Block) -> Result<Box<dyn NetEvent>> {
            Ok(Box::new(StubEvent { payload: block.0 }))
        }
    }

    struct StubEvent {
        payload: Vec<u8>,
    }

    #[async_trait]
    impl NetEvent for StubEvent {
        async fn body(&self, _net: &dyn Net, key: &ThreadKey) -> Result<Vec<u8>> {
            if !key.can_read() {
                return Err(Error::Network("thread key cannot read bodies".to_string()));
            }
            Ok(self.payload.clone())
        }
    }

    // ---------------------------------------------------------------
    // Helpers
    // ---------------------------------------------------------------

    fn person_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "_id": {"type": "string"},
                "age": {"type": "integer"},
                "email": {"type": "string"}
            },
            "required": ["_id"]
        })
    }

    fn person_config(indexes: Vec<IndexConfig>) -> CollectionConfig {
        CollectionConfig {
            name: "person".to_string(),
            schema: person_schema(),
            indexes,
        }
    }

    fn memory_options() -> DbOptions {
        DbOptions::default()
            .with_datastore(Arc::new(RedbDatastore::memory().expect("memory store")))
    }

    async fn open_db() -> Db {
        let net = StubNet::new(Hub::new());
        Db::new(net, ThreadId::random(), memory_options())
            .await
            .expect("db should open")
    }

    async fn wait_for<F>(mut condition: F, what: &str)
    where
        F: FnMut() -> bool,
    {
        for _ in 0..500 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for {what}");
    }

    // ---------------------------------------------------------------
    // Registration and lifecycle
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn schema_without_id_is_rejected() {
        let db = open_db().await;
        let err = db
            .new_collection(CollectionConfig {
                name: "person".to_string(),
                schema: json!({"type": "object", "properties": {"age": {"type": "integer"}}}),
                indexes: Vec::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidCollectionSchema), "got: {err}");
    }

    #[tokio::test]
    async fn duplicate_collection_name_is_rejected() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("first registration should succeed");
        let err = db
            .new_collection(person_config(Vec::new()))
            .await
            .unwrap_err();
        assert!(
            matches!(err, Error::CollectionAlreadyRegistered(_)),
            "got: {err}"
        );
    }

    #[tokio::test]
    async fn get_collection_returns_registered_only() {
        let db = open_db().await;
        assert!(db.get_collection("person").is_none());
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        assert!(db.get_collection("person").is_some());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_operations_fail_fast_after() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        db.close().await.expect("close should succeed");
        db.close().await.expect("second close should be a no-op");

        let err = people.create(json!({"_id": "a"})).await.unwrap_err();
        assert!(matches!(err, Error::Closed), "got: {err}");
        let err = db.new_collection(person_config(Vec::new())).await.unwrap_err();
        assert!(matches!(err, Error::Closed), "got: {err}");
        let err = db.get_db_info(None).await.unwrap_err();
        assert!(matches!(err, Error::Closed), "got: {err}");
        assert!(db.listen().is_err());
    }

    #[tokio::test]
    async fn close_and_reopen_rehydrates_collections_and_indexes() {
        let hub = Hub::new();
        let datastore: Arc<dyn Datastore> =
            Arc::new(RedbDatastore::memory().expect("memory store"));
        let id = ThreadId::random();

        let db = Db::new(
            StubNet::new(hub.clone()),
            id,
            DbOptions::default()
                .with_datastore(datastore.clone())
                .with_managed_datastore(),
        )
        .await
        .expect("db should open");
        let people = db
            .new_collection(person_config(vec![IndexConfig::new("age")]))
            .await
            .expect("registration should succeed");
        people
            .create(json!({"_id": "a", "age": 30}))
            .await
            .expect("create should succeed");
        db.close().await.expect("close should succeed");

        // Same datastore, fresh DB: collections and indexes come back.
        let db = Db::new(
            StubNet::new(hub),
            id,
            DbOptions::default()
                .with_datastore(datastore)
                .with_managed_datastore(),
        )
        .await
        .expect("db should reopen");
        let people = db
            .get_collection("person")
            .expect("collection should be rehydrated");
        let mut paths: Vec<String> = people.indexes().into_iter().map(|i| i.path).collect();
        paths.sort();
        assert_eq!(paths, vec!["_id".to_string(), "age".to_string()]);
        assert_eq!(
            people.find_by_id("a").await.expect("find should succeed"),
            json!({"_id": "a", "age": 30})
        );
    }

    // ---------------------------------------------------------------
    // End-to-end scenario 1: create and read back
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn create_and_read_back() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        people
            .write_txn(|txn| {
                txn.create(json!({"_id": "a", "age": 30}))?;
                Ok(())
            })
            .await
            .expect("write txn should commit");

        let found = people
            .read_txn(|txn| txn.find_by_id("a"))
            .await
            .expect("read txn should succeed");
        assert_eq!(found, json!({"_id": "a", "age": 30}));
    }

    #[tokio::test]
    async fn create_generates_missing_ids() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let id = people
            .create(json!({"age": 44}))
            .await
            .expect("create should succeed");
        assert!(!id.is_empty());
        let found = people.find_by_id(&id).await.expect("find should succeed");
        assert_eq!(found["age"], json!(44));
        assert_eq!(found["_id"], json!(id));
    }

    #[tokio::test]
    async fn invalid_instances_are_rejected_by_the_schema() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let err = people
            .create(json!({"_id": "a", "age": "thirty"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidInstance(_)), "got: {err}");
        assert!(!people.has("a").await.expect("has should succeed"));
    }

    // ---------------------------------------------------------------
    // End-to-end scenario 2: index-backed query
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn index_backed_query_returns_matching_instances() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(vec![IndexConfig::new("age")]))
            .await
            .expect("registration should succeed");

        for (id, age) in [("a", 30), ("b", 30), ("c", 40)] {
            people
                .create(json!({"_id": id, "age": age}))
                .await
                .expect("create should succeed");
        }

        let mut found = people
            .find(Query::new().and("age").eq(json!(30)))
            .await
            .expect("find should succeed");
        found.sort_by_key(|doc| doc["_id"].as_str().unwrap().to_string());
        let ids: Vec<&str> = found.iter().map(|d| d["_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn full_scan_query_ignores_index_entries() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(vec![IndexConfig::new("age")]))
            .await
            .expect("registration should succeed");
        people
            .create(json!({"_id": "a", "age": 30}))
            .await
            .expect("create should succeed");

        // Non-equality predicate forces the scan path; index marker keys
        // must not leak into results.
        let found = people
            .find(Query::new().and("age").gt(json!(10)))
            .await
            .expect("find should succeed");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0]["_id"], json!("a"));
    }

    // ---------------------------------------------------------------
    // End-to-end scenario 3: unique violation
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn unique_index_violation_rolls_back_the_create() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(vec![IndexConfig::unique("email")]))
            .await
            .expect("registration should succeed");

        people
            .create(json!({"_id": "a", "email": "x@y"}))
            .await
            .expect("first create should succeed");
        let err = people
            .create(json!({"_id": "b", "email": "x@y"}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UniqueConstraint { .. }), "got: {err}");

        // Only `a` exists and exactly one index entry remains.
        assert!(people.has("a").await.expect("has should succeed"));
        assert!(!people.has("b").await.expect("has should succeed"));
        let entries = people
            .find(Query::new().and("email").eq(json!("x@y")))
            .await
            .expect("find should succeed");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["_id"], json!("a"));
    }

    #[tokio::test]
    async fn add_index_backfill_fails_on_existing_duplicates() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        people
            .create(json!({"_id": "a", "email": "x@y"}))
            .await
            .expect("create should succeed");
        people
            .create(json!({"_id": "b", "email": "x@y"}))
            .await
            .expect("create should succeed");

        let err = people.add_index(IndexConfig::unique("email")).await.unwrap_err();
        assert!(matches!(err, Error::UniqueConstraint { .. }), "got: {err}");
        let paths: Vec<String> = people.indexes().into_iter().map(|i| i.path).collect();
        assert_eq!(paths, vec!["_id".to_string()], "index list must be unchanged");
    }

    #[tokio::test]
    async fn add_index_backfills_existing_instances() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        people
            .create(json!({"_id": "a", "age": 30}))
            .await
            .expect("create should succeed");

        people
            .add_index(IndexConfig::new("age"))
            .await
            .expect("add_index should backfill");
        let found = people
            .find(Query::new().and("age").eq(json!(30)))
            .await
            .expect("find should succeed");
        assert_eq!(found.len(), 1);
    }

    // ---------------------------------------------------------------
    // Mutation edge cases
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn duplicate_create_missing_save_and_missing_delete_are_rejected() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        people
            .create(json!({"_id": "a", "age": 30}))
            .await
            .expect("create should succeed");

        let err = people.create(json!({"_id": "a", "age": 31})).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateInstance { .. }), "got: {err}");

        let err = people.save(json!({"_id": "ghost", "age": 1})).await.unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound { .. }), "got: {err}");

        let err = people.delete("ghost").await.unwrap_err();
        assert!(matches!(err, Error::InstanceNotFound { .. }), "got: {err}");
    }

    #[tokio::test]
    async fn mutations_in_read_txns_are_rejected() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let err = people
            .read_txn(|txn| txn.create(json!({"_id": "a"})))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReadOnlyTxn), "got: {err}");
    }

    #[tokio::test]
    async fn failed_write_txn_discards_all_staged_mutations() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        let mut actions = db.listen().expect("listen should succeed");

        let err = people
            .write_txn(|txn| {
                txn.create(json!({"_id": "a", "age": 30}))?;
                Err::<(), _>(Error::Config("caller changed its mind".to_string()))
            })
            .await;
        assert!(err.is_err());

        assert!(
            !people.has("a").await.expect("has should succeed"),
            "discarded txn must not change keys"
        );

        // A later commit is the first thing listeners observe.
        people
            .create(json!({"_id": "b", "age": 1}))
            .await
            .expect("create should succeed");
        let batch = actions.recv().await.expect("actions expected");
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].instance_id, "b");
    }

    #[tokio::test]
    async fn save_and_delete_update_state_and_indexes() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(vec![IndexConfig::new("age")]))
            .await
            .expect("registration should succeed");

        people
            .create(json!({"_id": "a", "age": 30}))
            .await
            .expect("create should succeed");
        people
            .save(json!({"_id": "a", "age": 31}))
            .await
            .expect("save should succeed");

        assert!(
            people
                .find(Query::new().and("age").eq(json!(30)))
                .await
                .expect("find should succeed")
                .is_empty(),
            "stale index entry must be gone after save"
        );
        let found = people
            .find(Query::new().and("age").eq(json!(31)))
            .await
            .expect("find should succeed");
        assert_eq!(found.len(), 1);

        people.delete("a").await.expect("delete should succeed");
        assert!(
            people
                .find(Query::new().and("age").eq(json!(31)))
                .await
                .expect("find should succeed")
                .is_empty(),
            "deleting the instance must delete its index entries"
        );
    }

    #[tokio::test]
    async fn actions_match_the_transactions_mutations() {
        let db = open_db().await;
        let people = db
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        let mut subscription = db.listen().expect("listen should succeed");

        people
            .write_txn(|txn| {
                txn.create(json!({"_id": "a", "age": 1}))?;
                txn.create(json!({"_id": "b", "age": 2}))?;
                Ok(())
            })
            .await
            .expect("write txn should commit");

        let batch = subscription.recv().await.expect("actions expected");
        assert_eq!(
            batch,
            vec![
                Action {
                    collection: "person".to_string(),
                    kind: ActionType::Create,
                    instance_id: "a".to_string(),
                },
                Action {
                    collection: "person".to_string(),
                    kind: ActionType::Create,
                    instance_id: "b".to_string(),
                },
            ]
        );
    }

    // ---------------------------------------------------------------
    // End-to-end scenario 4: cross-peer convergence
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn peers_converge_after_pull() {
        let hub = Hub::new();
        let id = ThreadId::random();

        let db1 = Db::new(StubNet::new(hub.clone()), id, memory_options())
            .await
            .expect("first peer should open");
        let people1 = db1
            .new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");
        people1
            .create(json!({"_id": "a", "age": 30}))
            .await
            .expect("create should succeed");

        // The bus forwarder appends to the shared log asynchronously.
        let hub_wait = hub.clone();
        wait_for(move || hub_wait.log_len(&id) == 1, "record to reach the log").await;

        let info = db1.get_db_info(None).await.expect("db info should succeed");
        let db2 = Db::new_from_addr(
            StubNet::new(hub),
            info.addrs[0].clone(),
            info.key,
            memory_options().with_collection(person_config(Vec::new())),
        )
        .await
        .expect("second peer should join");

        let people2 = db2.get_collection("person").expect("collection registered");
        let mut converged = false;
        for _ in 0..500 {
            if let Ok(doc) = people2.find_by_id("a").await {
                assert_eq!(doc, json!({"_id": "a", "age": 30}));
                converged = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(converged, "second peer should converge after pulling");
    }

    // ---------------------------------------------------------------
    // End-to-end scenario 5: own-log records are ignored
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn record_from_own_log_is_ignored() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let codec = CborCodec;
        let payload = codec
            .events_to_bytes(&[codec.create(
                "person",
                "a",
                serde_json::to_vec(&json!({"_id": "a", "age": 30})).unwrap(),
            )])
            .expect("encode should succeed");

        let own_log = LogId::random();
        let rec: Arc<dyn ThreadRecord> = Arc::new(StubThreadRecord {
            thread_id: db.thread_id(),
            log_id: own_log,
            record: StubRecord::inline(payload),
        });

        db.handle_net_record(rec, ThreadKey::random(), own_log, Duration::from_secs(1))
            .await
            .expect("own-log record should be silently ignored");

        let people = db.get_collection("person").expect("collection registered");
        assert!(
            !people.has("a").await.expect("has should succeed"),
            "own-log record must not be applied"
        );
    }

    #[tokio::test]
    async fn remote_record_from_other_log_is_applied() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let codec = CborCodec;
        let payload = codec
            .events_to_bytes(&[codec.create(
                "person",
                "a",
                serde_json::to_vec(&json!({"_id": "a", "age": 30})).unwrap(),
            )])
            .expect("encode should succeed");

        let rec: Arc<dyn ThreadRecord> = Arc::new(StubThreadRecord {
            thread_id: db.thread_id(),
            log_id: LogId::random(),
            record: StubRecord::inline(payload),
        });
        db.handle_net_record(
            rec,
            ThreadKey::random(),
            LogId::random(),
            Duration::from_secs(1),
        )
        .await
        .expect("remote record should apply");

        let people = db.get_collection("person").expect("collection registered");
        assert_eq!(
            people.find_by_id("a").await.expect("find should succeed"),
            json!({"_id": "a", "age": 30})
        );
    }

    #[tokio::test]
    async fn undecryptable_record_is_rejected_and_state_unchanged() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let codec = CborCodec;
        let payload = codec
            .events_to_bytes(&[codec.create("person", "a", b"{}".to_vec())])
            .expect("encode should succeed");
        let rec: Arc<dyn ThreadRecord> = Arc::new(StubThreadRecord {
            thread_id: db.thread_id(),
            log_id: LogId::random(),
            record: StubRecord::inline(payload),
        });

        let err = db
            .handle_net_record(
                rec,
                ThreadKey::random().follow_only(),
                LogId::random(),
                Duration::from_secs(1),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got: {err}");

        let people = db.get_collection("person").expect("collection registered");
        assert!(!people.has("a").await.expect("has should succeed"));
    }

    // ---------------------------------------------------------------
    // End-to-end scenario 6: block fetch retry ladder
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn block_fetch_retries_then_succeeds() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let codec = CborCodec;
        let payload = codec
            .events_to_bytes(&[codec.create(
                "person",
                "a",
                serde_json::to_vec(&json!({"_id": "a", "age": 30})).unwrap(),
            )])
            .expect("encode should succeed");

        let record = Arc::new(StubThreadRecord {
            thread_id: db.thread_id(),
            log_id: LogId::random(),
            record: StubRecord::fetched(payload, 2),
        });

        let started = tokio::time::Instant::now();
        db.handle_net_record(
            record.clone(),
            ThreadKey::random(),
            LogId::random(),
            Duration::from_secs(30),
        )
        .await
        .expect("record should apply after retries");

        assert_eq!(
            record.record.fetch_attempts.load(Ordering::SeqCst),
            3,
            "two failures plus the successful attempt"
        );
        assert!(
            started.elapsed() >= Duration::from_millis(1500),
            "backoff must wait 500 ms then 1 s, got {:?}",
            started.elapsed()
        );

        let people = db.get_collection("person").expect("collection registered");
        assert_eq!(
            people.find_by_id("a").await.expect("find should succeed")["age"],
            json!(30),
            "the event must be applied exactly once"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn block_fetch_surfaces_the_last_error_after_three_attempts() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let record = Arc::new(StubThreadRecord {
            thread_id: db.thread_id(),
            log_id: LogId::random(),
            record: StubRecord::fetched(b"unused".to_vec(), GET_BLOCK_RETRIES),
        });

        let err = db
            .handle_net_record(
                record.clone(),
                ThreadKey::random(),
                LogId::random(),
                Duration::from_secs(30),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(_)), "got: {err}");
        assert_eq!(record.record.fetch_attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn record_handling_respects_the_timeout() {
        let db = open_db().await;
        db.new_collection(person_config(Vec::new()))
            .await
            .expect("registration should succeed");

        let record: Arc<dyn ThreadRecord> = Arc::new(StubThreadRecord {
            thread_id: db.thread_id(),
            log_id: LogId::random(),
            record: StubRecord::fetched(b"unused".to_vec(), GET_BLOCK_RETRIES),
        });

        // The retry ladder alone needs 1.5 s; a 100 ms budget expires first.
        let err = db
            .handle_net_record(
                record,
                ThreadKey::random(),
                LogId::random(),
                Duration::from_millis(100),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout), "got: {err}");
    }

    // ---------------------------------------------------------------
    // Invite info
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn get_db_info_returns_joinable_invite_material() {
        let hub = Hub::new();
        let db = Db::new(StubNet::new(hub), ThreadId::random(), memory_options())
            .await
            .expect("db should open");

        let info = db.get_db_info(None).await.expect("db info should succeed");
        assert_eq!(info.addrs.len(), 1);
        assert!(info.key.can_read());
        assert!(
            info.addrs[0]
                .as_str()
                .ends_with(&db.thread_id().to_string()),
            "address should point at the thread"
        );
    }
}
