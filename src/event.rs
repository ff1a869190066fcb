//! Events, codec actions, and the wire codec.
//!
//! An [`Event`] is one Create/Save/Delete against a single instance.
//! Locally committed transactions encode their staged events into an
//! opaque payload published on the thread; remote payloads decode back
//! into the same event list. [`EventCodec::reduce`] is the single place
//! where events touch the instance keyspace, so local commit and remote
//! application take exactly the same path.
//!
//! The default wire format is CBOR: an array of records, each the
//! 4-tuple `[collection, instance_id, kind, instance-bytes-or-null]`.
//! Only the codec understands this layout; everything else in the engine
//! treats event payloads as opaque bytes.

use minicbor::data::Type;
use minicbor::{Decoder, Encoder};

use crate::datastore::WriteTxn;
use crate::error::{Error, Result};
use crate::key::Key;

/// What an event does to its instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Insert a new instance; fails if the id is already present.
    Create,
    /// Replace an existing instance; fails if the id is absent.
    Save,
    /// Remove an existing instance; fails if the id is absent.
    Delete,
}

/// A single mutation against one `(collection, instance id)` pair.
///
/// Reducible deterministically against any datastore holding a
/// compatible prior state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Target collection name.
    pub collection: String,
    /// Target instance id.
    pub instance_id: String,
    /// Mutation kind.
    pub kind: EventKind,
    /// Full instance bytes for Create/Save; `None` for Delete.
    pub instance: Option<Vec<u8>>,
}

/// The effective action a reduced event had on the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodecAction {
    /// Mutation kind that was applied.
    pub kind: EventKind,
    /// Collection the instance belongs to.
    pub collection: String,
    /// Instance id that was touched.
    pub instance_id: String,
}

/// Secondary-index maintenance callback invoked once per reduced event.
///
/// Arguments: collection name, instance key, prior instance bytes (if
/// any), new instance bytes (if any), and the open write transaction.
pub type IndexFn<'a> =
    &'a (dyn Fn(&str, &Key, Option<&[u8]>, Option<&[u8]>, &mut dyn WriteTxn) -> Result<()>
         + Send
         + Sync);

/// Encodes local mutations to wire bytes, decodes remote payloads, and
/// reduces event batches into the instance keyspace.
pub trait EventCodec: Send + Sync + 'static {
    /// Build a Create event for a transaction to stage.
    fn create(&self, collection: &str, instance_id: &str, instance: Vec<u8>) -> Event {
        Event {
            collection: collection.to_string(),
            instance_id: instance_id.to_string(),
            kind: EventKind::Create,
            instance: Some(instance),
        }
    }

    /// Build a Save event for a transaction to stage.
    fn save(&self, collection: &str, instance_id: &str, instance: Vec<u8>) -> Event {
        Event {
            collection: collection.to_string(),
            instance_id: instance_id.to_string(),
            kind: EventKind::Save,
            instance: Some(instance),
        }
    }

    /// Build a Delete event for a transaction to stage.
    fn delete(&self, collection: &str, instance_id: &str) -> Event {
        Event {
            collection: collection.to_string(),
            instance_id: instance_id.to_string(),
            kind: EventKind::Delete,
            instance: None,
        }
    }

    /// Serialize an event batch into the opaque payload appended to the
    /// thread log.
    fn events_to_bytes(&self, events: &[Event]) -> Result<Vec<u8>>;

    /// Parse a remote payload back into its event batch.
    ///
    /// Malformed bytes are rejected here, before any event can reach
    /// [`reduce`](EventCodec::reduce).
    fn events_from_bytes(&self, bytes: &[u8]) -> Result<Vec<Event>>;

    /// Apply `events` to the instance keyspace rooted at `base_key`.
    ///
    /// For each event the prior instance bytes are read at
    /// `base_key/<collection>/<id>`, the mutation is applied (Create
    /// requires the prior to be absent, Save and Delete require it to be
    /// present), and `index_fn` is invoked exactly once with the old and
    /// new bytes. Returns one action per event, in input order. Any error
    /// leaves the transaction to be discarded by the caller.
    fn reduce(
        &self,
        events: &[Event],
        txn: &mut dyn WriteTxn,
        base_key: &Key,
        index_fn: IndexFn<'_>,
    ) -> Result<Vec<CodecAction>>;
}

/// The default CBOR [`EventCodec`].
#[derive(Debug, Default, Clone, Copy)]
pub struct CborCodec;

const KIND_CREATE: u8 = 0;
const KIND_SAVE: u8 = 1;
const KIND_DELETE: u8 = 2;

fn kind_to_wire(kind: EventKind) -> u8 {
    match kind {
        EventKind::Create => KIND_CREATE,
        EventKind::Save => KIND_SAVE,
        EventKind::Delete => KIND_DELETE,
    }
}

fn kind_from_wire(raw: u8) -> std::result::Result<EventKind, minicbor::decode::Error> {
    match raw {
        KIND_CREATE => Ok(EventKind::Create),
        KIND_SAVE => Ok(EventKind::Save),
        KIND_DELETE => Ok(EventKind::Delete),
        other => Err(minicbor::decode::Error::message(format!(
            "unknown event kind {other}"
        ))),
    }
}

impl EventCodec for CborCodec {
    fn events_to_bytes(&self, events: &[Event]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let mut e = Encoder::new(&mut buf);
        e.array(events.len() as u64)?;
        for event in events {
            e.array(4)?;
            e.str(&event.collection)?;
            e.str(&event.instance_id)?;
            e.u8(kind_to_wire(event.kind))?;
            match &event.instance {
                Some(bytes) => e.bytes(bytes)?,
                None => e.null()?,
            };
        }
        Ok(buf)
    }

    fn events_from_bytes(&self, bytes: &[u8]) -> Result<Vec<Event>> {
        let mut d = Decoder::new(bytes);
        let len = d
            .array()?
            .ok_or_else(|| minicbor::decode::Error::message("indefinite event array"))?;
        let mut events = Vec::with_capacity(len as usize);
        for _ in 0..len {
            let fields = d
                .array()?
                .ok_or_else(|| minicbor::decode::Error::message("indefinite event record"))?;
            if fields != 4 {
                return Err(Error::EventDecode(minicbor::decode::Error::message(
                    format!("event record has {fields} fields, expected 4"),
                )));
            }
            let collection = d.str()?.to_string();
            let instance_id = d.str()?.to_string();
            let kind = kind_from_wire(d.u8()?)?;
            let instance = match d.datatype()? {
                Type::Bytes => Some(d.bytes()?.to_vec()),
                Type::Null => {
                    d.skip()?;
                    None
                }
                other => {
                    return Err(Error::EventDecode(minicbor::decode::Error::message(
                        format!("event instance must be bytes or null, got {other}"),
                    )));
                }
            };
            match kind {
                EventKind::Create | EventKind::Save if instance.is_none() => {
                    return Err(Error::EventDecode(minicbor::decode::Error::message(
                        "create/save event without instance bytes",
                    )));
                }
                EventKind::Delete if instance.is_some() => {
                    return Err(Error::EventDecode(minicbor::decode::Error::message(
                        "delete event carries instance bytes",
                    )));
                }
                _ => {}
            }
            events.push(Event {
                collection,
                instance_id,
                kind,
                instance,
            });
        }
        Ok(events)
    }

    fn reduce(
        &self,
        events: &[Event],
        txn: &mut dyn WriteTxn,
        base_key: &Key,
        index_fn: IndexFn<'_>,
    ) -> Result<Vec<CodecAction>> {
        let mut actions = Vec::with_capacity(events.len());
        for event in events {
            let key = base_key.child(&event.collection).child(&event.instance_id);
            let prior = txn.get(&key)?;
            match event.kind {
                EventKind::Create => {
                    if prior.is_some() {
                        return Err(Error::DuplicateInstance {
                            collection: event.collection.clone(),
                            instance_id: event.instance_id.clone(),
                        });
                    }
                    let new = event.instance.as_deref().ok_or_else(|| {
                        Error::EventDecode(minicbor::decode::Error::message(
                            "create event without instance bytes",
                        ))
                    })?;
                    txn.put(&key, new)?;
                    index_fn(&event.collection, &key, None, Some(new), txn)?;
                }
                EventKind::Save => {
                    let old = prior.ok_or_else(|| Error::InstanceNotFound {
                        collection: event.collection.clone(),
                        instance_id: event.instance_id.clone(),
                    })?;
                    let new = event.instance.as_deref().ok_or_else(|| {
                        Error::EventDecode(minicbor::decode::Error::message(
                            "save event without instance bytes",
                        ))
                    })?;
                    txn.put(&key, new)?;
                    index_fn(&event.collection, &key, Some(&old), Some(new), txn)?;
                }
                EventKind::Delete => {
                    let old = prior.ok_or_else(|| Error::InstanceNotFound {
                        collection: event.collection.clone(),
                        instance_id: event.instance_id.clone(),
                    })?;
                    txn.delete(&key)?;
                    index_fn(&event.collection, &key, Some(&old), None, txn)?;
                }
            }
            actions.push(CodecAction {
                kind: event.kind,
                collection: event.collection.clone(),
                instance_id: event.instance_id.clone(),
            });
        }
        Ok(actions)
    }
}
