//! Embedded, event-sourced document database replicated over a thread.
//!
//! `threadloom` hosts named *collections* of JSON documents, validated
//! by a JSON schema and indexed on declared paths. Local mutations
//! become events appended to the peer's log on a shared, encrypted
//! thread; events observed from remote peers reduce into the same local
//! state. Every peer that can decrypt the thread converges to the same
//! per-instance state under last-writer-wins semantics.
//!
//! The thread network itself (discovery, pubsub, signing, transport) is
//! not part of this crate: it is injected through the [`Net`] trait, and
//! the database offers itself back as the network's [`App`].
//!
//! # Key Types
//!
//! | Type | Role |
//! |------|------|
//! | [`Db`] | Aggregate root: one thread, the collection registry, the event pipeline |
//! | [`Collection`] | Schema-bound set of JSON instances with secondary indexes |
//! | [`Txn`] | Read or write session on one collection |
//! | [`Query`] | Declarative filter; equality on an indexed path uses the index |
//! | [`EventCodec`] | Owns the wire format and the deterministic reduction |
//! | [`Datastore`] | Transactional, prefix-queryable key-value backend |
//! | [`Net`] | The injected thread network |
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use threadloom::{CollectionConfig, Db, DbOptions, IndexConfig, Net, Query, ThreadId};
//!
//! async fn run(net: Arc<dyn Net>) -> threadloom::Result<()> {
//!     let db = Db::new(
//!         net,
//!         ThreadId::random(),
//!         DbOptions::default().with_repo_path("/tmp/my-app"),
//!     )
//!     .await?;
//!
//!     let people = db
//!         .new_collection(CollectionConfig {
//!             name: "person".to_string(),
//!             schema: json!({
//!                 "type": "object",
//!                 "properties": {
//!                     "_id": {"type": "string"},
//!                     "age": {"type": "integer"}
//!                 },
//!                 "required": ["_id"]
//!             }),
//!             indexes: vec![IndexConfig::new("age")],
//!         })
//!         .await?;
//!
//!     people.create(json!({"_id": "a", "age": 30})).await?;
//!     let adults = people.find(Query::new().and("age").ge(json!(18))).await?;
//!     assert_eq!(adults.len(), 1);
//!
//!     // Share db.get_db_info(None) with other peers so they can join
//!     // via Db::new_from_addr and converge on the same state.
//!     db.close().await
//! }
//! ```

mod bus;
mod collection;
mod datastore;
mod db;
mod dispatcher;
mod error;
mod event;
mod index;
mod key;
mod network;
mod notifier;
mod query;
mod txn;

pub use bus::{LocalEvent, LocalEventsSubscription};
pub use collection::{Collection, CollectionConfig};
pub use datastore::{Datastore, ReadTxn, RedbDatastore, WriteTxn};
pub use db::{Db, DbInfo, DbOptions};
pub use dispatcher::Reducer;
pub use error::{Error, Result};
pub use event::{CborCodec, CodecAction, Event, EventCodec, EventKind, IndexFn};
pub use index::IndexConfig;
pub use key::Key;
pub use network::{
    App, Block, Connector, LogId, Multiaddr, Net, NetEvent, NetRecord, ThreadId, ThreadInfo,
    ThreadKey, ThreadRecord, Token,
};
pub use notifier::{Action, ActionType, Subscription};
pub use query::{Criterion, CriterionBuilder, Operation, Query};
pub use txn::{Txn, TxnOptions};
