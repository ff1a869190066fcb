//! The seam between the database and the thread network.
//!
//! The network layer (peer discovery, pubsub, signing, log transport,
//! record encryption) lives outside this crate and is consumed through
//! the [`Net`] trait and the record traits below. The database offers
//! itself back to the network as an [`App`]: the network publishes
//! batches drained from [`App::local_event_listen`] and delivers remote
//! records through [`App::handle_net_record`].
//!
//! Identifiers and keys are opaque here; decrypting a record body is the
//! record's own job, given the thread's read key.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use data_encoding::HEXLOWER;
use parking_lot::Mutex;
use rand::Rng;

use crate::bus::LocalEventsSubscription;
use crate::dispatcher::Reducer;
use crate::error::{Error, Result};

/// Identifies one thread: an append-only, partially ordered set of
/// per-peer logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadId([u8; 16]);

impl ThreadId {
    /// A fresh random thread id.
    pub fn random() -> Self {
        Self(rand::thread_rng().r#gen())
    }

    /// The raw id bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

impl FromStr for ThreadId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = HEXLOWER
            .decode(s.as_bytes())
            .map_err(|e| Error::Config(format!("invalid thread id: {e}")))?;
        let bytes: [u8; 16] = bytes
            .try_into()
            .map_err(|_| Error::Config("invalid thread id length".to_string()))?;
        Ok(Self(bytes))
    }
}

/// Identifies one peer's log within a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogId([u8; 16]);

impl LogId {
    /// A fresh random log id.
    pub fn random() -> Self {
        Self(rand::thread_rng().r#gen())
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&HEXLOWER.encode(&self.0))
    }
}

/// Symmetric key material protecting a thread.
///
/// The follow key decrypts record envelopes; the read key decrypts event
/// bodies. A key without the read part can follow a thread's structure
/// but cannot read its contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadKey {
    follow: [u8; 32],
    read: Option<[u8; 32]>,
}

impl ThreadKey {
    /// A fresh random follow+read key pair.
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            follow: rng.r#gen(),
            read: Some(rng.r#gen()),
        }
    }

    /// This key with the read half removed.
    pub fn follow_only(&self) -> Self {
        Self {
            follow: self.follow,
            read: None,
        }
    }

    /// Whether event bodies can be decrypted with this key.
    pub fn can_read(&self) -> bool {
        self.read.is_some()
    }

    /// The read half, if present.
    pub fn read(&self) -> Option<&[u8; 32]> {
        self.read.as_ref()
    }

    /// The follow half.
    pub fn follow(&self) -> &[u8; 32] {
        &self.follow
    }
}

/// An opaque peer address, e.g. a multiaddress string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Multiaddr(String);

impl Multiaddr {
    /// Wrap a raw address string.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The raw address string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Multiaddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque auth credential threaded through network calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token(String);

impl Token {
    /// Wrap a raw credential.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw credential.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A thread as advertised by the network: its id, dialable addresses,
/// and key. This is the invite material remote peers join with.
#[derive(Debug, Clone)]
pub struct ThreadInfo {
    /// Thread id.
    pub id: ThreadId,
    /// Addresses other peers can dial.
    pub addrs: Vec<Multiaddr>,
    /// Thread key.
    pub key: ThreadKey,
}

/// A raw block fetched from the network.
#[derive(Debug, Clone)]
pub struct Block(pub Vec<u8>);

/// Thread network operations the database consumes.
#[async_trait]
pub trait Net: Send + Sync + 'static {
    /// Create a new thread with the given id.
    ///
    /// Returns [`Error::ThreadExists`] if the peer already carries it.
    async fn create_thread(&self, id: &ThreadId, token: Option<&Token>) -> Result<ThreadInfo>;

    /// Join a thread hosted by another peer at `addr`.
    async fn add_thread(
        &self,
        addr: &Multiaddr,
        key: &ThreadKey,
        token: Option<&Token>,
    ) -> Result<ThreadInfo>;

    /// Fetch new records from the thread's other logs.
    async fn pull_thread(&self, id: &ThreadId, token: Option<&Token>) -> Result<()>;

    /// The thread's current advertised addresses and key.
    async fn get_thread(&self, id: &ThreadId, token: Option<&Token>) -> Result<ThreadInfo>;

    /// Attach `app` to the thread: the network starts draining the app's
    /// local events into the log and delivering remote records to it.
    ///
    /// The returned [`Connector`] is the app's handle for outbound calls;
    /// closing it tears the subscription down.
    fn connect_app(self: Arc<Self>, app: Arc<dyn App>, id: &ThreadId) -> Result<Connector>;
}

/// The database as seen by the network.
#[async_trait]
pub trait App: Reducer {
    /// Apply one remote record within `timeout`.
    ///
    /// Records originating from `local_log` are ignored (their events
    /// were already applied at commit time). On error or timeout the
    /// record is not applied and stays eligible for re-delivery.
    async fn handle_net_record(
        &self,
        rec: Arc<dyn ThreadRecord>,
        key: ThreadKey,
        local_log: LogId,
        timeout: Duration,
    ) -> Result<()>;

    /// Subscribe to the app's committed event batches for publication.
    fn local_event_listen(&self) -> Result<LocalEventsSubscription>;
}

/// A record as delivered by the network, tagged with its origin.
pub trait ThreadRecord: Send + Sync {
    /// Thread the record belongs to.
    fn thread_id(&self) -> ThreadId;

    /// Log (peer) the record originates from.
    fn log_id(&self) -> LogId;

    /// The record envelope.
    fn value(&self) -> &dyn NetRecord;
}

/// A signed record envelope in a log.
#[async_trait]
pub trait NetRecord: Send + Sync {
    /// Content id of the record's body block.
    fn cid(&self) -> String;

    /// Decode the event from the envelope, if the body is inline.
    fn event(&self) -> Result<Box<dyn NetEvent>>;

    /// Fetch the body block from the network.
    async fn get_block(&self, net: &dyn Net) -> Result<Block>;

    /// Decode a fetched block into the record's event.
    fn event_from_block(&self, block: Block) -> Result<Box<dyn NetEvent>>;
}

/// A decoded record event whose body can be decrypted with the thread's
/// read key.
#[async_trait]
pub trait NetEvent: Send + Sync {
    /// Decrypt and return the raw event payload.
    async fn body(&self, net: &dyn Net, key: &ThreadKey) -> Result<Vec<u8>>;
}

/// The network's attachment to one database.
///
/// Holds the outbound network handle and the thread id, and tears down
/// the network-side subscription on close. The connector's owner (the
/// database) clears it during close, which breaks the reference cycle
/// between the two sides.
pub struct Connector {
    net: Arc<dyn Net>,
    thread_id: ThreadId,
    on_close: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl Connector {
    /// Build a connector whose `on_close` hook tears down the network's
    /// subscription to the app.
    pub fn new(
        net: Arc<dyn Net>,
        thread_id: ThreadId,
        on_close: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self {
            net,
            thread_id,
            on_close: Mutex::new(Some(Box::new(on_close))),
        }
    }

    /// The thread this connector is attached to.
    pub fn thread_id(&self) -> ThreadId {
        self.thread_id
    }

    /// The outbound network handle.
    pub fn net(&self) -> &Arc<dyn Net> {
        &self.net
    }

    /// Tear down the network's subscription. Idempotent.
    pub fn close(&self) -> Result<()> {
        if let Some(hook) = self.on_close.lock().take() {
            hook();
        }
        Ok(())
    }
}

impl fmt::Debug for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connector")
            .field("thread_id", &self.thread_id)
            .finish_non_exhaustive()
    }
}
