//! Read and write sessions scoped to one collection.
//!
//! A [`Txn`] is handed to the closure of [`Collection::read_txn`] or
//! [`Collection::write_txn`](crate::Collection::write_txn). Mutations do
//! not touch the datastore directly: they validate eagerly, then stage
//! codec events in memory. When the closure returns `Ok` from a write
//! transaction, the staged batch is dispatched (reduced, indexed, and
//! persisted in one datastore transaction) and published on the local
//! events bus for the network to append to the thread. Dropping the
//! transaction without commit discards it on every exit path.
//!
//! Reads always observe the last committed state: a transaction's own
//! staged mutations become visible only after commit.
//!
//! [`Collection::read_txn`]: crate::Collection::read_txn

use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::bus::LocalEvent;
use crate::collection::Collection;
use crate::db::DbInner;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::index::{canonical_index_value, index_prefix};
use crate::network::Token;
use crate::query::Query;

/// Options for a single transaction.
#[derive(Debug, Clone, Default)]
pub struct TxnOptions {
    /// Auth token threaded through to network calls the commit triggers.
    pub token: Option<Token>,
}

/// A read or write session on exactly one collection.
pub struct Txn {
    collection: Collection,
    db: Arc<DbInner>,
    token: Option<Token>,
    readonly: bool,
    events: Vec<Event>,
}

impl Txn {
    pub(crate) fn new(
        collection: Collection,
        db: Arc<DbInner>,
        token: Option<Token>,
        readonly: bool,
    ) -> Self {
        Self {
            collection,
            db,
            token,
            readonly,
            events: Vec::new(),
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(Error::ReadOnlyTxn);
        }
        Ok(())
    }

    fn committed_exists(&self, id: &str) -> Result<bool> {
        let txn = self.db.datastore.read()?;
        txn.has(&self.collection.base_key().child(id))
    }

    /// Stage the creation of `instance`; returns its id.
    ///
    /// An absent or empty `_id` is replaced with a fresh UUID. The
    /// instance is validated against the collection schema before it is
    /// staged, and must not already exist in committed state.
    pub fn create(&mut self, mut instance: Value) -> Result<String> {
        self.check_writable()?;
        let object = instance
            .as_object_mut()
            .ok_or_else(|| Error::InvalidInstance("instance must be a JSON object".to_string()))?;
        let id = match object.get("_id") {
            Some(Value::String(s)) if !s.is_empty() => s.clone(),
            Some(Value::String(_)) | None => {
                let id = Uuid::new_v4().to_string();
                object.insert("_id".to_string(), Value::String(id.clone()));
                id
            }
            Some(_) => {
                return Err(Error::InvalidInstance("_id must be a string".to_string()));
            }
        };
        self.collection.validate(&instance)?;
        if self.committed_exists(&id)? {
            return Err(Error::DuplicateInstance {
                collection: self.collection.name().to_string(),
                instance_id: id,
            });
        }
        let bytes = serde_json::to_vec(&instance)?;
        self.events
            .push(self.db.codec.create(self.collection.name(), &id, bytes));
        Ok(id)
    }

    /// Stage a replacement of the existing instance carrying the same
    /// `_id`.
    pub fn save(&mut self, instance: Value) -> Result<()> {
        self.check_writable()?;
        let id = instance
            .get("_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidInstance("instance is missing _id".to_string()))?
            .to_string();
        self.collection.validate(&instance)?;
        if !self.committed_exists(&id)? {
            return Err(Error::InstanceNotFound {
                collection: self.collection.name().to_string(),
                instance_id: id,
            });
        }
        let bytes = serde_json::to_vec(&instance)?;
        self.events
            .push(self.db.codec.save(self.collection.name(), &id, bytes));
        Ok(())
    }

    /// Stage the deletion of the instance with `id`.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        self.check_writable()?;
        if !self.committed_exists(id)? {
            return Err(Error::InstanceNotFound {
                collection: self.collection.name().to_string(),
                instance_id: id.to_string(),
            });
        }
        self.events
            .push(self.db.codec.delete(self.collection.name(), id));
        Ok(())
    }

    /// Whether an instance with `id` exists in committed state.
    pub fn has(&self, id: &str) -> Result<bool> {
        self.committed_exists(id)
    }

    /// Fetch the instance with `id` from committed state.
    pub fn find_by_id(&self, id: &str) -> Result<Value> {
        let txn = self.db.datastore.read()?;
        let bytes = txn
            .get(&self.collection.base_key().child(id))?
            .ok_or_else(|| Error::InstanceNotFound {
                collection: self.collection.name().to_string(),
                instance_id: id.to_string(),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// All committed instances matching `query`.
    ///
    /// When the query's root predicate is an equality on an indexed
    /// path, candidates come from the index prefix; otherwise the whole
    /// collection is scanned and the predicate evaluated in memory.
    pub fn find(&self, query: &Query) -> Result<Vec<Value>> {
        let txn = self.db.datastore.read()?;
        let base = self.collection.base_key();
        let indexes = self.collection.indexes();

        let candidates: Vec<Value> = match query.index_candidate(&indexes) {
            Some((path, value)) => {
                let Some(canonical) = canonical_index_value(value) else {
                    // An unindexable literal can never equal an indexed value.
                    return Ok(Vec::new());
                };
                let prefix = index_prefix(self.collection.name(), path, &canonical);
                let mut docs = Vec::new();
                for (entry, _) in txn.prefix(&prefix)? {
                    if let Some(bytes) = txn.get(&base.child(entry.name()))? {
                        docs.push(serde_json::from_slice(&bytes)?);
                    }
                }
                docs
            }
            None => txn
                .prefix(&base)?
                .into_iter()
                // Direct children only: the _index subtree is not instance data.
                .filter(|(key, _)| key.parent() == base)
                .map(|(_, bytes)| serde_json::from_slice(&bytes).map_err(Error::from))
                .collect::<Result<_>>()?,
        };

        let mut matches: Vec<Value> = candidates
            .into_iter()
            .filter(|doc| query.matches(doc))
            .collect();
        query.sort_results(&mut matches);
        Ok(matches)
    }

    /// Dispatch the staged batch and publish it to the thread.
    ///
    /// Called by the write-transaction wrapper while the DB-wide
    /// exclusive lock is held. Dispatch failure rolls everything back
    /// and nothing reaches the bus.
    pub(crate) fn commit(self) -> Result<()> {
        if self.events.is_empty() {
            return Ok(());
        }
        let payload = self.db.codec.events_to_bytes(&self.events)?;
        self.db.dispatcher.dispatch(&self.events)?;
        self.db.bus.publish(LocalEvent {
            thread_id: self.db.thread_id,
            token: self.token.clone().or_else(|| self.db.token.clone()),
            payload,
        })?;
        tracing::debug!(
            collection = self.collection.name(),
            events = self.events.len(),
            "transaction committed"
        );
        Ok(())
    }
}
