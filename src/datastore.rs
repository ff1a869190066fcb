//! Transactional key-value storage behind object-safe traits.
//!
//! The engine consumes storage through [`Datastore`], [`ReadTxn`], and
//! [`WriteTxn`] so an application can supply its own store. The bundled
//! implementation, [`RedbDatastore`], wraps a single-table `redb`
//! database and supports both a file-backed and an in-memory backend.
//!
//! The contract deliberately requires transactions: event reduction only
//! ever reads through the write transaction it mutates, so a reduction
//! always observes its own prior writes and never a torn state.

use std::path::Path;

use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{Error, Result};
use crate::key::Key;

/// The single key-value table holding all engine state.
const TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("threadloom");

/// Cache budget applied when the store is opened in low-memory mode.
const LOW_MEM_CACHE_BYTES: usize = 1 << 20;

/// A transactional, prefix-queryable key-value store.
///
/// Keys are hierarchical [`Key`] paths; values are opaque bytes. At most
/// one write transaction makes progress at a time; readers see the last
/// committed state.
pub trait Datastore: Send + Sync + 'static {
    /// Begin a read-only transaction over the last committed state.
    fn read(&self) -> Result<Box<dyn ReadTxn>>;

    /// Begin a write transaction.
    fn write(&self) -> Result<Box<dyn WriteTxn>>;

    /// Release resources held by the store.
    ///
    /// Called by `Db::close` when the store is not externally managed.
    fn close(&self) -> Result<()>;
}

/// Read operations available in any transaction.
pub trait ReadTxn: Send {
    /// Fetch the value at `key`, if present.
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>>;

    /// Whether `key` is present.
    fn has(&self, key: &Key) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// All `(key, value)` pairs strictly below `prefix`, in key order.
    fn prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>>;
}

/// A write transaction; buffered mutations become visible only on commit.
pub trait WriteTxn: ReadTxn {
    /// Set `key` to `value`.
    fn put(&mut self, key: &Key, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    fn delete(&mut self, key: &Key) -> Result<()>;

    /// Durably apply all buffered mutations.
    fn commit(self: Box<Self>) -> Result<()>;

    /// Drop all buffered mutations.
    fn discard(self: Box<Self>) {}
}

/// The bundled [`Datastore`] implementation on top of `redb`.
pub struct RedbDatastore {
    db: Database,
}

impl RedbDatastore {
    /// Create a store backed by process memory. Nothing survives drop.
    pub fn memory() -> Result<Self> {
        let db = Database::builder()
            .create_with_backend(redb::backends::InMemoryBackend::new())
            .map_err(Error::datastore)?;
        Self::init(db)
    }

    /// Open (or create) a file-backed store under `repo_path`.
    ///
    /// `low_mem` trades read performance for a small page cache.
    pub fn open(repo_path: impl AsRef<Path>, low_mem: bool) -> Result<Self> {
        std::fs::create_dir_all(repo_path.as_ref()).map_err(Error::datastore)?;
        let file = repo_path.as_ref().join("threadloom.redb");
        let mut builder = Database::builder();
        if low_mem {
            builder.set_cache_size(LOW_MEM_CACHE_BYTES);
        }
        let db = builder.create(file).map_err(Error::datastore)?;
        Self::init(db)
    }

    // Make sure the table exists so read transactions never observe a
    // missing table on a fresh database.
    fn init(db: Database) -> Result<Self> {
        let txn = db.begin_write().map_err(Error::datastore)?;
        txn.open_table(TABLE).map_err(Error::datastore)?;
        txn.commit().map_err(Error::datastore)?;
        Ok(Self { db })
    }
}

impl std::fmt::Debug for RedbDatastore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbDatastore").finish_non_exhaustive()
    }
}

impl Datastore for RedbDatastore {
    fn read(&self) -> Result<Box<dyn ReadTxn>> {
        let txn = self.db.begin_read().map_err(Error::datastore)?;
        Ok(Box::new(RedbReadTxn { txn }))
    }

    fn write(&self) -> Result<Box<dyn WriteTxn>> {
        let txn = self.db.begin_write().map_err(Error::datastore)?;
        Ok(Box::new(RedbWriteTxn { txn }))
    }

    fn close(&self) -> Result<()> {
        // redb flushes at every commit; the file handle is released when
        // the last reference to the store drops.
        Ok(())
    }
}

fn scan_table<T>(table: &T, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    let start = prefix.scan_prefix();
    let mut out = Vec::new();
    for item in table.range(start.as_str()..).map_err(Error::datastore)? {
        let (key, value) = item.map_err(Error::datastore)?;
        if !key.value().starts_with(start.as_str()) {
            break;
        }
        out.push((Key::new(key.value()), value.value().to_vec()));
    }
    Ok(out)
}

struct RedbReadTxn {
    txn: redb::ReadTransaction,
}

impl ReadTxn for RedbReadTxn {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(TABLE).map_err(Error::datastore)?;
        let value = table.get(key.as_str()).map_err(Error::datastore)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let table = self.txn.open_table(TABLE).map_err(Error::datastore)?;
        scan_table(&table, prefix)
    }
}

struct RedbWriteTxn {
    txn: redb::WriteTransaction,
}

impl ReadTxn for RedbWriteTxn {
    fn get(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let table = self.txn.open_table(TABLE).map_err(Error::datastore)?;
        let value = table.get(key.as_str()).map_err(Error::datastore)?;
        Ok(value.map(|guard| guard.value().to_vec()))
    }

    fn prefix(&self, prefix: &Key) -> Result<Vec<(Key, Vec<u8>)>> {
        let table = self.txn.open_table(TABLE).map_err(Error::datastore)?;
        scan_table(&table, prefix)
    }
}

impl WriteTxn for RedbWriteTxn {
    fn put(&mut self, key: &Key, value: &[u8]) -> Result<()> {
        let mut table = self.txn.open_table(TABLE).map_err(Error::datastore)?;
        table.insert(key.as_str(), value).map_err(Error::datastore)?;
        Ok(())
    }

    fn delete(&mut self, key: &Key) -> Result<()> {
        let mut table = self.txn.open_table(TABLE).map_err(Error::datastore)?;
        table.remove(key.as_str()).map_err(Error::datastore)?;
        Ok(())
    }

    fn commit(self: Box<Self>) -> Result<()> {
        self.txn.commit().map_err(Error::datastore)
    }

    // Dropping a redb write transaction aborts it, so the default
    // `discard` (drop the box) is sufficient.
}
