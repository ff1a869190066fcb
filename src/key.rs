//! Hierarchical path keys for the datastore.
//!
//! A [`Key`] is a `/`-separated path like `/db/schema/person` or
//! `/person/3f1c.../`. Keys address both engine metadata and instance
//! data; the persisted layout is part of the on-disk format:
//!
//! ```text
//! /db/schema/<collection>                  -> JSON schema bytes
//! /db/index/<collection>                   -> JSON list of IndexConfig
//! /<collection>/<instanceId>               -> instance JSON bytes
//! /<collection>/_index/<path>/<value>/<id> -> empty marker
//! ```

use std::fmt;

/// A hierarchical datastore key.
///
/// Always stored in normalized form: a leading `/`, no trailing `/`, no
/// empty segments. The root key is the empty string, so `root.child("a")`
/// is `/a`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(String);

impl Key {
    /// The root key, parent of all others.
    pub fn root() -> Self {
        Key(String::new())
    }

    /// Build a key from a raw path, normalizing separators.
    ///
    /// Leading slashes are made canonical and empty segments collapse,
    /// so `new("a//b/")`, `new("/a/b")`, and `new("a/b")` are all `/a/b`.
    pub fn new(raw: impl AsRef<str>) -> Self {
        let mut path = String::new();
        for segment in raw.as_ref().split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(segment);
        }
        Key(path)
    }

    /// Append one segment to this key.
    pub fn child(&self, segment: &str) -> Self {
        let mut path = self.0.clone();
        for part in segment.split('/').filter(|s| !s.is_empty()) {
            path.push('/');
            path.push_str(part);
        }
        Key(path)
    }

    /// The last segment of the key, or `""` for the root.
    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => "",
        }
    }

    /// The key with its last segment removed; the root is its own parent.
    pub fn parent(&self) -> Self {
        match self.0.rfind('/') {
            Some(idx) => Key(self.0[..idx].to_string()),
            None => Key::root(),
        }
    }

    /// Number of segments in the key; the root has zero.
    pub fn len(&self) -> usize {
        self.0.matches('/').count()
    }

    /// Whether this is the root key.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Whether `self` sits strictly below `prefix` in the hierarchy.
    pub fn is_descendant_of(&self, prefix: &Key) -> bool {
        if prefix.0.is_empty() {
            return !self.0.is_empty();
        }
        self.0.len() > prefix.0.len()
            && self.0.starts_with(&prefix.0)
            && self.0.as_bytes()[prefix.0.len()] == b'/'
    }

    /// The raw normalized path.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The path with a trailing `/`, suitable as a range-scan prefix that
    /// matches descendants only (never sibling keys sharing a name prefix).
    pub(crate) fn scan_prefix(&self) -> String {
        let mut p = self.0.clone();
        p.push('/');
        p
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl From<&str> for Key {
    fn from(raw: &str) -> Self {
        Key::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_normalizes_slashes() {
        assert_eq!(Key::new("a/b").as_str(), "/a/b");
        assert_eq!(Key::new("/a/b").as_str(), "/a/b");
        assert_eq!(Key::new("a//b/").as_str(), "/a/b");
        assert_eq!(Key::new("").as_str(), "");
    }

    #[test]
    fn child_appends_segments() {
        let k = Key::root().child("db").child("schema").child("person");
        assert_eq!(k.as_str(), "/db/schema/person");
    }

    #[test]
    fn name_returns_last_segment() {
        assert_eq!(Key::new("/db/schema/person").name(), "person");
        assert_eq!(Key::root().name(), "");
    }

    #[test]
    fn parent_strips_last_segment() {
        let k = Key::new("/db/schema/person");
        assert_eq!(k.parent().as_str(), "/db/schema");
        assert_eq!(Key::new("/db").parent(), Key::root());
        assert_eq!(Key::root().parent(), Key::root());
    }

    #[test]
    fn descendant_check_requires_a_segment_boundary() {
        let base = Key::new("/person");
        assert!(Key::new("/person/a").is_descendant_of(&base));
        assert!(Key::new("/person/_index/age/30/a").is_descendant_of(&base));
        // A sibling sharing the textual prefix is not a descendant.
        assert!(!Key::new("/personal/a").is_descendant_of(&base));
        assert!(!base.is_descendant_of(&base));
        assert!(Key::new("/person").is_descendant_of(&Key::root()));
    }

    #[test]
    fn len_counts_segments() {
        assert_eq!(Key::root().len(), 0);
        assert_eq!(Key::new("/a").len(), 1);
        assert_eq!(Key::new("/a/b/c").len(), 3);
    }
}
