use std::collections::BTreeSet;

use crate::{
    error::{Error, Result},
    value::Value,
};

/// Integer identifier joining the catalog, its indexes and the object map.
pub type DocId = i64;

/// An ordered set of document ids, the currency of every index query.
pub type DocSet = BTreeSet<DocId>;

/// Parse a document id supplied as text (CLI arguments, admin forms).
///
/// # Examples
///
/// ```
/// use doccat::doc_id::parse_doc_id;
///
/// assert_eq!(parse_doc_id("42").unwrap(), 42);
/// assert!(parse_doc_id("forty-two").is_err());
/// ```
pub fn parse_doc_id(raw: &str) -> Result<DocId> {
    raw.trim()
        .parse::<DocId>()
        .map_err(|_| Error::InvalidDocId(raw.to_string()))
}

/// Accept a dynamically typed value as a document id only if it is an
/// integer.
pub fn doc_id_from_value(value: &Value) -> Result<DocId> {
    match value {
        Value::Int(i) => Ok(*i),
        other => Err(Error::InvalidDocId(other.to_string())),
    }
}

/// Intersect a sequence of sets, smallest first.
///
/// Returns `None` when `sets` is empty so callers can tell "no constraint"
/// apart from "no match".
pub fn intersect_all(mut sets: Vec<DocSet>) -> Option<DocSet> {
    if sets.is_empty() {
        return None;
    }
    sets.sort_by_key(BTreeSet::len);
    let mut iter = sets.into_iter();
    let mut acc = iter.next()?;
    for set in iter {
        if acc.is_empty() {
            break;
        }
        acc.retain(|id| set.contains(id));
    }
    Some(acc)
}

/// Union of a sequence of sets.
pub fn union_all<I>(sets: I) -> DocSet
where
    I: IntoIterator<Item = DocSet>,
{
    let mut acc = DocSet::new();
    for set in sets {
        if acc.is_empty() {
            acc = set;
        } else {
            acc.extend(set);
        }
    }
    acc
}
