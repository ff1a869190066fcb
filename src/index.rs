//! Secondary index configuration and maintenance.
//!
//! Every declared index on a collection keeps one marker key per live
//! instance at `/<collection>/_index/<path>/<value>/<id>`. Index entries
//! are maintained in the same transaction as the instance mutation, so
//! an instance and its index entries are never visible out of sync.
//!
//! # Canonical index values
//!
//! The `<value>` segment is part of the persisted format. The extracted
//! JSON value is canonicalized as follows:
//!
//! * strings: verbatim, with `%` and `/` percent-escaped so a value can
//!   never introduce extra key segments;
//! * booleans: `"0"` for false, `"1"` for true;
//! * null: the single byte `0x00` as a reserved sentinel;
//! * numbers: 16 lowercase hex digits of the order-preserving f64 bit
//!   transform (sign bit flipped for positives, all bits flipped for
//!   negatives), so lexicographic key order matches numeric order;
//! * arrays and objects: not indexable, no entry is written.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::datastore::WriteTxn;
use crate::error::{Error, Result};
use crate::key::Key;

/// Key segment that roots a collection's index entries.
pub(crate) const INDEX_SEGMENT: &str = "_index";

/// Declares one secondary index on a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Dotted JSON path to index, e.g. `"age"` or `"address.city"`.
    pub path: String,
    /// When true, no two instances may share a value at `path`.
    #[serde(default)]
    pub unique: bool,
}

impl IndexConfig {
    /// A non-unique index on `path`.
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            unique: false,
        }
    }

    /// A unique index on `path`.
    pub fn unique(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            unique: true,
        }
    }
}

/// Walk a dotted path through a JSON document.
pub(crate) fn value_at_path<'v>(doc: &'v Value, path: &str) -> Option<&'v Value> {
    let mut current = doc;
    for segment in path.split('.') {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn escape_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        match ch {
            '%' => out.push_str("%25"),
            '/' => out.push_str("%2F"),
            other => out.push(other),
        }
    }
    out
}

// Order-preserving encoding of an f64: flipping the sign bit of positives
// and every bit of negatives makes unsigned comparison match numeric order.
// Negative zero is folded into positive zero so equal values share an entry.
fn sortable_number(x: f64) -> String {
    let x = if x == 0.0 { 0.0 } else { x };
    let bits = x.to_bits();
    let ordered = if bits >> 63 == 1 { !bits } else { bits | (1 << 63) };
    format!("{ordered:016x}")
}

/// Canonical key segment for an indexed JSON value, or `None` when the
/// value is not indexable (arrays and objects).
pub(crate) fn canonical_index_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => Some("\u{0}".to_string()),
        Value::Bool(false) => Some("0".to_string()),
        Value::Bool(true) => Some("1".to_string()),
        Value::Number(n) => Some(sortable_number(n.as_f64()?)),
        // The empty string would otherwise collapse to an empty key
        // segment; "%00" cannot collide because literal `%` is escaped.
        Value::String(s) if s.is_empty() => Some("%00".to_string()),
        Value::String(s) => Some(escape_segment(s)),
        Value::Array(_) | Value::Object(_) => None,
    }
}

/// The key prefix holding every entry of one index value:
/// `/<collection>/_index/<path>/<value>`.
pub(crate) fn index_prefix(collection: &str, path: &str, canonical: &str) -> Key {
    Key::root()
        .child(collection)
        .child(INDEX_SEGMENT)
        .child(&escape_segment(path))
        .child(canonical)
}

/// Write index entries for a new instance revision.
///
/// Paths absent from the document (or holding unindexable values) get no
/// entry. A unique index that already holds the value for a different
/// instance fails the transaction.
pub(crate) fn index_add(
    txn: &mut dyn WriteTxn,
    collection: &str,
    indexes: &[IndexConfig],
    instance_key: &Key,
    new: &[u8],
) -> Result<()> {
    let doc: Value = serde_json::from_slice(new)?;
    let id = instance_key.name().to_string();
    for cfg in indexes {
        let Some(value) = value_at_path(&doc, &cfg.path) else {
            continue;
        };
        let Some(canonical) = canonical_index_value(value) else {
            continue;
        };
        let prefix = index_prefix(collection, &cfg.path, &canonical);
        if cfg.unique {
            for (entry, _) in txn.prefix(&prefix)? {
                if entry.name() != id {
                    return Err(Error::UniqueConstraint {
                        collection: collection.to_string(),
                        path: cfg.path.clone(),
                    });
                }
            }
        }
        txn.put(&prefix.child(&id), &[])?;
    }
    Ok(())
}

/// Remove the index entries belonging to an old instance revision.
///
/// Deletes only this instance's entries; entries of other instances that
/// share the indexed value are untouched.
pub(crate) fn index_delete(
    txn: &mut dyn WriteTxn,
    collection: &str,
    indexes: &[IndexConfig],
    instance_key: &Key,
    old: &[u8],
) -> Result<()> {
    let doc: Value = serde_json::from_slice(old)?;
    let id = instance_key.name();
    for cfg in indexes {
        let Some(value) = value_at_path(&doc, &cfg.path) else {
            continue;
        };
        let Some(canonical) = canonical_index_value(value) else {
            continue;
        };
        txn.delete(&index_prefix(collection, &cfg.path, &canonical).child(id))?;
    }
    Ok(())
}
