//! Named, schema-bound sets of JSON instances with secondary indexes.
//!
//! A [`Collection`] validates every instance against its JSON schema,
//! maintains the declared indexes on every mutation, and exposes both a
//! transactional API ([`Collection::read_txn`], [`Collection::write_txn`])
//! and one-shot convenience CRUD that opens the appropriate transaction
//! internally.

use std::sync::{Arc, Weak};

use serde_json::Value;

use crate::db::{DbInner, index_config_key};
use crate::error::{Error, Result};
use crate::index::{IndexConfig, index_add};
use crate::key::Key;
use crate::query::Query;
use crate::txn::{Txn, TxnOptions};

/// Describes a collection to register.
#[derive(Debug, Clone, Default)]
pub struct CollectionConfig {
    /// Collection name, unique within a database.
    pub name: String,
    /// JSON schema every instance must satisfy. Must declare a string
    /// `_id` property.
    pub schema: Value,
    /// Secondary indexes to declare, in addition to the implicit unique
    /// index on `_id`.
    pub indexes: Vec<IndexConfig>,
}

pub(crate) struct CollectionInner {
    name: String,
    schema: Value,
    validator: jsonschema::Validator,
    indexes: parking_lot::RwLock<Vec<IndexConfig>>,
    db: Weak<DbInner>,
}

/// A handle to a registered collection. Cheap to clone.
#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

// A valid schema declares `_id` as a string property.
fn schema_declares_id(schema: &Value) -> bool {
    schema
        .get("properties")
        .and_then(|props| props.get("_id"))
        .and_then(|id| id.get("type"))
        .and_then(Value::as_str)
        == Some("string")
}

impl Collection {
    pub(crate) fn new(name: String, schema: Value, db: Weak<DbInner>) -> Result<Self> {
        if name.is_empty() || name.contains('/') || name == "db" {
            return Err(Error::Config(format!("invalid collection name: {name:?}")));
        }
        if !schema_declares_id(&schema) {
            return Err(Error::InvalidCollectionSchema);
        }
        let validator = jsonschema::validator_for(&schema)
            .map_err(|e| Error::InvalidSchema(e.to_string()))?;
        Ok(Self {
            inner: Arc::new(CollectionInner {
                name,
                schema,
                validator,
                indexes: parking_lot::RwLock::new(Vec::new()),
                db,
            }),
        })
    }

    /// The collection's name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The collection's JSON schema.
    pub fn schema(&self) -> &Value {
        &self.inner.schema
    }

    /// The currently declared indexes, including the implicit `_id` one.
    pub fn indexes(&self) -> Vec<IndexConfig> {
        self.inner.indexes.read().clone()
    }

    /// The key prefix holding this collection's instances.
    pub(crate) fn base_key(&self) -> Key {
        Key::root().child(&self.inner.name)
    }

    /// Validate `instance` against the schema.
    pub(crate) fn validate(&self, instance: &Value) -> Result<()> {
        self.inner
            .validator
            .validate(instance)
            .map_err(|e| Error::InvalidInstance(e.to_string()))
    }

    fn db(&self) -> Result<Arc<DbInner>> {
        self.inner.db.upgrade().ok_or(Error::Closed)
    }

    /// Declare a new index, backfilling entries for existing instances.
    ///
    /// Runs the whole backfill in one transaction: if any existing pair
    /// of instances would violate a unique constraint, the index is not
    /// added and no state changes.
    pub async fn add_index(&self, config: IndexConfig) -> Result<()> {
        let db = self.db()?;
        db.check_open()?;
        let _guard = db.state_lock.write().await;
        self.add_index_locked(&db, config)
    }

    /// Index registration body; caller holds the DB-wide exclusive lock.
    pub(crate) fn add_index_locked(&self, db: &Arc<DbInner>, config: IndexConfig) -> Result<()> {
        if config.path.is_empty() {
            return Err(Error::Config("index path must not be empty".to_string()));
        }
        {
            let indexes = self.inner.indexes.read();
            if let Some(existing) = indexes.iter().find(|i| i.path == config.path) {
                if *existing == config {
                    // Re-declaring an identical index (e.g. on rehydration)
                    // is a no-op.
                    return Ok(());
                }
                return Err(Error::Config(format!(
                    "index on {} already exists with a different configuration",
                    config.path
                )));
            }
        }

        let mut txn = db.datastore.write()?;
        let base = self.base_key();
        for (key, bytes) in txn.prefix(&base)? {
            // Direct children only: skip the _index subtree.
            if key.parent() != base {
                continue;
            }
            index_add(
                txn.as_mut(),
                self.name(),
                std::slice::from_ref(&config),
                &key,
                &bytes,
            )?;
        }
        let mut updated = self.inner.indexes.read().clone();
        updated.push(config);
        txn.put(
            &index_config_key(self.name()),
            &serde_json::to_vec(&updated)?,
        )?;
        txn.commit()?;

        tracing::debug!(
            collection = self.name(),
            path = updated.last().map(|i| i.path.as_str()).unwrap_or(""),
            "index added"
        );
        *self.inner.indexes.write() = updated;
        Ok(())
    }

    /// Run `f` inside a read transaction (shared lock).
    pub async fn read_txn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Txn) -> Result<R>,
    {
        self.read_txn_opts(f, TxnOptions::default()).await
    }

    /// [`read_txn`](Collection::read_txn) with explicit options.
    pub async fn read_txn_opts<F, R>(&self, f: F, opts: TxnOptions) -> Result<R>
    where
        F: FnOnce(&mut Txn) -> Result<R>,
    {
        let db = self.db()?;
        db.read_txn(self, f, opts).await
    }

    /// Run `f` inside a write transaction (exclusive lock).
    ///
    /// Mutations stage events in memory; when `f` returns `Ok` the
    /// transaction commits, dispatching the batch and publishing it to
    /// the thread. When `f` returns `Err` the transaction is discarded
    /// and nothing changes.
    pub async fn write_txn<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut Txn) -> Result<R>,
    {
        self.write_txn_opts(f, TxnOptions::default()).await
    }

    /// [`write_txn`](Collection::write_txn) with explicit options.
    pub async fn write_txn_opts<F, R>(&self, f: F, opts: TxnOptions) -> Result<R>
    where
        F: FnOnce(&mut Txn) -> Result<R>,
    {
        let db = self.db()?;
        db.write_txn(self, f, opts).await
    }

    /// Create one instance; returns its id (generated when `_id` is
    /// absent or empty).
    pub async fn create(&self, instance: Value) -> Result<String> {
        self.write_txn(|txn| txn.create(instance)).await
    }

    /// Replace an existing instance.
    pub async fn save(&self, instance: Value) -> Result<()> {
        self.write_txn(|txn| txn.save(instance)).await
    }

    /// Delete an existing instance by id.
    pub async fn delete(&self, id: &str) -> Result<()> {
        self.write_txn(|txn| txn.delete(id)).await
    }

    /// Whether an instance with `id` exists.
    pub async fn has(&self, id: &str) -> Result<bool> {
        self.read_txn(|txn| txn.has(id)).await
    }

    /// Fetch one instance by id.
    pub async fn find_by_id(&self, id: &str) -> Result<Value> {
        self.read_txn(|txn| txn.find_by_id(id)).await
    }

    /// All instances matching `query`.
    pub async fn find(&self, query: Query) -> Result<Vec<Value>> {
        self.read_txn(|txn| txn.find(&query)).await
    }
}
