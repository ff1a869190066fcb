//! Serialized application of event batches through registered reducers.
//!
//! The dispatcher owns the only code path that turns events into datastore
//! mutations: it opens one write transaction, runs every registered
//! reducer over the batch, and commits only if all of them succeed. On
//! any failure the transaction is discarded, so no partial side effects
//! are ever observable.

use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::datastore::{Datastore, WriteTxn};
use crate::error::Result;
use crate::event::Event;

/// Applies an event batch inside the transaction the dispatcher opened.
///
/// Reducers must be pure over the transaction they receive: all reads and
/// writes go through `txn`, never directly to the datastore.
pub trait Reducer: Send + Sync {
    /// Apply `events` to `txn`.
    fn reduce(&self, events: &[Event], txn: &mut dyn WriteTxn) -> Result<()>;
}

/// Registry of reducers plus the serialized apply path.
pub(crate) struct Dispatcher {
    datastore: Arc<dyn Datastore>,
    reducers: RwLock<Vec<Weak<dyn Reducer>>>,
    // Serializes dispatch even if two callers race past the DB-wide lock
    // (e.g. a dispatch triggered while closing).
    apply: Mutex<()>,
}

impl Dispatcher {
    pub(crate) fn new(datastore: Arc<dyn Datastore>) -> Self {
        Self {
            datastore,
            reducers: RwLock::new(Vec::new()),
            apply: Mutex::new(()),
        }
    }

    /// Install a reducer. Held weakly so the registry never keeps its
    /// owner alive.
    pub(crate) fn register(&self, reducer: Weak<dyn Reducer>) {
        self.reducers.write().push(reducer);
    }

    /// Apply `events` through every registered reducer in one transaction.
    ///
    /// Commits if all reducers succeed; discards otherwise. An empty
    /// batch is a no-op.
    pub(crate) fn dispatch(&self, events: &[Event]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let _serial = self.apply.lock();
        let mut txn = self.datastore.write()?;
        let reducers: Vec<Arc<dyn Reducer>> = {
            let registry = self.reducers.read();
            registry.iter().filter_map(Weak::upgrade).collect()
        };
        for reducer in &reducers {
            if let Err(err) = reducer.reduce(events, txn.as_mut()) {
                txn.discard();
                return Err(err);
            }
        }
        txn.commit()
    }
}
