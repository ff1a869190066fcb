//! Crate-level error type and `Result` alias.

/// All errors that can surface from database operations.
///
/// Configuration and validation problems are reported eagerly at the call
/// site; transactional failures roll the whole write back before they are
/// returned; network-transient failures reject a single remote record and
/// leave local state untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The collection schema does not declare a string `_id` property.
    #[error("the collection schema should specify an _id string property")]
    InvalidCollectionSchema,

    /// The schema document itself failed to compile.
    #[error("invalid schema: {0}")]
    InvalidSchema(String),

    /// A collection with this name is already registered.
    #[error("already registered collection: {0}")]
    CollectionAlreadyRegistered(String),

    /// No collection with this name is registered.
    #[error("collection not found: {0}")]
    CollectionNotFound(String),

    /// An instance failed validation against its collection's schema.
    #[error("instance is invalid: {0}")]
    InvalidInstance(String),

    /// The instance does not exist.
    ///
    /// Returned by save, delete, and lookups when no instance with the
    /// given id is present in the collection.
    #[error("instance {instance_id} not found in collection {collection}")]
    InstanceNotFound {
        /// Collection that was searched.
        collection: String,
        /// Missing instance id.
        instance_id: String,
    },

    /// An instance with this `_id` already exists.
    #[error("instance {instance_id} already exists in collection {collection}")]
    DuplicateInstance {
        /// Collection that rejected the create.
        collection: String,
        /// Conflicting instance id.
        instance_id: String,
    },

    /// A unique index already holds this value for a different instance.
    #[error("unique index violation on {collection}.{path}")]
    UniqueConstraint {
        /// Collection owning the index.
        collection: String,
        /// Indexed JSON path.
        path: String,
    },

    /// A mutation was attempted inside a read-only transaction.
    #[error("cannot mutate in a read-only transaction")]
    ReadOnlyTxn,

    /// The thread already exists locally.
    ///
    /// `Net::create_thread` reports this when asked to create a thread
    /// the peer already carries; `Db::new` treats it as success.
    #[error("thread already exists")]
    ThreadExists,

    /// Construction options are inconsistent or incomplete.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The underlying key-value store failed.
    #[error("datastore: {0}")]
    Datastore(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),

    /// Encoding an event batch to its wire form failed.
    #[error("event encode: {0}")]
    EventEncode(#[from] minicbor::encode::Error<std::convert::Infallible>),

    /// A remote payload could not be decoded into events.
    #[error("event decode: {0}")]
    EventDecode(#[from] minicbor::decode::Error),

    /// Instance JSON could not be parsed or produced.
    #[error(transparent)]
    Json(#[from] serde_json::Error),

    /// A network operation failed.
    ///
    /// Covers both fatal construction-time failures (cannot create or
    /// join the thread) and transient per-record failures (block fetch
    /// exhausted its retries, body decryption failed). Transient cases
    /// leave state unchanged and the record eligible for re-delivery.
    #[error("network: {0}")]
    Network(String),

    /// Handling a remote record exceeded its deadline.
    ///
    /// The record was not applied; it will be re-offered on the next pull.
    #[error("record handling timed out")]
    Timeout,

    /// The database has been closed.
    #[error("database is closed")]
    Closed,
}

/// A `Result` specialized to this crate's [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Wrap any error as a datastore failure.
    pub fn datastore(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Error::Datastore(Box::new(err))
    }
}
