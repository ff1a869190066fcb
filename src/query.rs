//! Declarative filters over JSON instances.
//!
//! A [`Query`] is a conjunction of [`Criterion`]s with optional
//! or-branches and an optional sort. Execution strategy is decided by
//! the transaction: a root-level equality criterion on an indexed path
//! runs against the index prefix; everything else is a full collection
//! scan with in-memory evaluation.
//!
//! ```
//! use threadloom::Query;
//! use serde_json::json;
//!
//! let q = Query::new()
//!     .and("age").ge(json!(18))
//!     .or(Query::new().and("vip").eq(json!(true)))
//!     .order_by("age");
//! assert!(q.matches(&json!({"_id": "a", "age": 30})));
//! assert!(q.matches(&json!({"_id": "b", "age": 7, "vip": true})));
//! assert!(!q.matches(&json!({"_id": "c", "age": 7})));
//! ```

use std::cmp::Ordering;

use serde_json::Value;

use crate::index::{IndexConfig, value_at_path};

/// Comparison operator of a [`Criterion`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Equal.
    Eq,
    /// Not equal (value must be present and comparable).
    Ne,
    /// Greater than.
    Gt,
    /// Greater than or equal.
    Ge,
    /// Less than.
    Lt,
    /// Less than or equal.
    Le,
}

/// One `path <op> value` predicate.
#[derive(Debug, Clone, PartialEq)]
pub struct Criterion {
    pub(crate) path: String,
    pub(crate) op: Operation,
    pub(crate) value: Value,
}

/// Builder state returned by [`Query::and`]; finished by choosing an
/// operator.
#[derive(Debug)]
pub struct CriterionBuilder {
    query: Query,
    path: String,
}

macro_rules! criterion_op {
    ($name:ident, $op:expr, $doc:literal) => {
        #[doc = $doc]
        pub fn $name(mut self, value: Value) -> Query {
            self.query.ands.push(Criterion {
                path: self.path,
                op: $op,
                value,
            });
            self.query
        }
    };
}

impl CriterionBuilder {
    criterion_op!(eq, Operation::Eq, "Match values equal to `value`.");
    criterion_op!(ne, Operation::Ne, "Match present values not equal to `value`.");
    criterion_op!(gt, Operation::Gt, "Match values greater than `value`.");
    criterion_op!(ge, Operation::Ge, "Match values greater than or equal to `value`.");
    criterion_op!(lt, Operation::Lt, "Match values less than `value`.");
    criterion_op!(le, Operation::Le, "Match values less than or equal to `value`.");
}

/// Sort direction and path applied to query results.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Sort {
    pub(crate) path: String,
    pub(crate) desc: bool,
}

/// A filter over the JSON instances of one collection.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub(crate) ands: Vec<Criterion>,
    pub(crate) ors: Vec<Query>,
    pub(crate) sort: Option<Sort>,
}

impl Query {
    /// A query that matches every instance until criteria are added.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a conjunct on `path`; finish it with an operator call.
    pub fn and(self, path: impl Into<String>) -> CriterionBuilder {
        CriterionBuilder {
            query: self,
            path: path.into(),
        }
    }

    /// Add an alternative branch: an instance matches if all conjuncts
    /// match, or if any or-branch matches.
    pub fn or(mut self, other: Query) -> Self {
        self.ors.push(other);
        self
    }

    /// Sort results ascending by the value at `path`; instances missing
    /// the path sort last.
    pub fn order_by(mut self, path: impl Into<String>) -> Self {
        self.sort = Some(Sort {
            path: path.into(),
            desc: false,
        });
        self
    }

    /// Sort results descending by the value at `path`.
    pub fn order_by_desc(mut self, path: impl Into<String>) -> Self {
        self.sort = Some(Sort {
            path: path.into(),
            desc: true,
        });
        self
    }

    /// Whether `doc` satisfies this query.
    pub fn matches(&self, doc: &Value) -> bool {
        if self.ands.iter().all(|c| c.matches(doc)) {
            return true;
        }
        self.ors.iter().any(|q| q.matches(doc))
    }

    /// The first root-level equality conjunct whose path is indexed, if
    /// the query has no or-branches. Used for index-backed execution.
    pub(crate) fn index_candidate<'q>(
        &'q self,
        indexes: &[IndexConfig],
    ) -> Option<(&'q str, &'q Value)> {
        if !self.ors.is_empty() {
            return None;
        }
        self.ands
            .iter()
            .find(|c| c.op == Operation::Eq && indexes.iter().any(|i| i.path == c.path))
            .map(|c| (c.path.as_str(), &c.value))
    }

    /// Apply the configured sort, if any, to `docs`.
    pub(crate) fn sort_results(&self, docs: &mut [Value]) {
        let Some(sort) = &self.sort else {
            return;
        };
        docs.sort_by(|a, b| {
            let ord = match (
                value_at_path(a, &sort.path),
                value_at_path(b, &sort.path),
            ) {
                (Some(va), Some(vb)) => compare(va, vb).unwrap_or(Ordering::Equal),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            };
            if sort.desc { ord.reverse() } else { ord }
        });
    }
}

impl Criterion {
    fn matches(&self, doc: &Value) -> bool {
        let Some(actual) = value_at_path(doc, &self.path) else {
            return false;
        };
        let Some(ord) = compare(actual, &self.value) else {
            return false;
        };
        match self.op {
            Operation::Eq => ord == Ordering::Equal,
            Operation::Ne => ord != Ordering::Equal,
            Operation::Gt => ord == Ordering::Greater,
            Operation::Ge => ord != Ordering::Less,
            Operation::Lt => ord == Ordering::Less,
            Operation::Le => ord != Ordering::Greater,
        }
    }
}

// Compare two JSON scalars of the same shape; None for mismatched or
// non-scalar operands.
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}
