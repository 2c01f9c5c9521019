//! The index contract and its query vocabulary.

use std::{
    any::Any,
    fmt,
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    doc_id::{
        DocId,
        DocSet,
    },
    error::{
        Error,
        Result,
    },
    resource::Resource,
    value::Value,
};

pub mod allowed;
pub mod facet;
pub mod field;
pub mod keyword;
pub mod path;
pub mod text;

pub use allowed::AllowedIndex;
pub use facet::FacetIndex;
pub use field::FieldIndex;
pub use keyword::KeywordIndex;
pub use path::{
    PathIndex,
    PathQuery,
};
pub use text::TextIndex;

/// When an index mutation requested inside a transaction is carried out.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ActionMode {
    /// Applied to the index as soon as it is requested.
    #[default]
    Immediate,
    /// Queued and applied when the transaction commits.
    AtCommit,
    /// Queued and handed to the action processor at commit, when one is
    /// active; applied at commit otherwise.
    Deferred,
}

impl fmt::Display for ActionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionMode::Immediate => "immediate",
            ActionMode::AtCommit => "atcommit",
            ActionMode::Deferred => "deferred",
        })
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
    Field,
    Keyword,
    Text,
    Facet,
    Allowed,
    Path,
}

impl fmt::Display for IndexKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            IndexKind::Field => "field",
            IndexKind::Keyword => "keyword",
            IndexKind::Text => "text",
            IndexKind::Facet => "facet",
            IndexKind::Allowed => "allowed",
            IndexKind::Path => "path",
        })
    }
}

impl FromStr for IndexKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "field" => Ok(IndexKind::Field),
            "keyword" => Ok(IndexKind::Keyword),
            "text" => Ok(IndexKind::Text),
            "facet" => Ok(IndexKind::Facet),
            "allowed" => Ok(IndexKind::Allowed),
            "path" => Ok(IndexKind::Path),
            _ => Err(Error::UnknownFactory(s.to_string())),
        }
    }
}

/// A per-index query fragment.
#[derive(Debug, Clone)]
pub enum Fragment {
    Eq(Value),
    /// Inclusive on both ends; a missing bound is open.
    Range {
        min: Option<Value>,
        max: Option<Value>,
    },
    AnyOf(Vec<Value>),
    AllOf(Vec<Value>),
    /// Full-text query string.
    Text(String),
    Path(PathQuery),
}

impl Fragment {
    pub fn name(&self) -> &'static str {
        match self {
            Fragment::Eq(_) => "eq",
            Fragment::Range { .. } => "range",
            Fragment::AnyOf(_) => "any_of",
            Fragment::AllOf(_) => "all_of",
            Fragment::Text(_) => "text",
            Fragment::Path(_) => "path",
        }
    }

    pub fn path(query: impl Into<PathQuery>) -> Self {
        Fragment::Path(query.into())
    }
}

/// Strategy for ordering a result set by an index's values.
///
/// All strategies yield the same order; they differ only in cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortType {
    /// Pick a strategy from the result, limit and index sizes.
    #[default]
    Auto,
    /// Collect every value and sort.
    Timsort,
    /// Keep only the best `limit` entries in a heap.
    NBest,
    /// Walk the index in value order and keep members of the result.
    FwScan,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SortOptions {
    pub limit: Option<usize>,
    pub reverse: bool,
    pub sort_type: SortType,
}

pub trait CatalogIndex: Send + Sync {
    fn kind(&self) -> IndexKind;

    fn action_mode(&self) -> ActionMode;

    /// Hash of the factory declaration that built this index.
    fn fingerprint(&self) -> u64;

    fn index_doc(&mut self, docid: DocId, resource: &dyn Resource)
    -> Result<()>;

    fn unindex_doc(&mut self, docid: DocId) -> Result<()>;

    fn reindex_doc(
        &mut self,
        docid: DocId,
        resource: &dyn Resource,
    ) -> Result<()> {
        self.unindex_doc(docid)?;
        self.index_doc(docid, resource)
    }

    fn reset(&mut self) -> Result<()>;

    /// Ids this index holds a value for, or `None` when the index has no
    /// storage of its own and answers from the catalog's id set.
    fn docids(&self) -> Option<DocSet>;

    /// Ids the index saw but extracted no value for.
    fn not_indexed(&self) -> DocSet {
        DocSet::new()
    }

    fn apply(&self, fragment: &Fragment) -> Result<DocSet>;

    fn sort(
        &self,
        docids: &DocSet,
        options: &SortOptions,
    ) -> Result<Vec<DocId>> {
        let _ = (docids, options);
        Err(Error::Unsortable(self.kind().to_string()))
    }

    fn as_any(&self) -> &dyn Any;
}

impl fmt::Debug for dyn CatalogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CatalogIndex")
            .field("kind", &self.kind())
            .field("action_mode", &self.action_mode())
            .finish_non_exhaustive()
    }
}

pub(crate) fn unsupported(kind: IndexKind, fragment: &Fragment) -> Error {
    Error::InvalidQuery {
        index: kind.to_string(),
        reason: format!("{} queries are not supported", fragment.name()),
    }
}

/// Settings shared by every index.
#[derive(Debug, Clone, Copy, Default)]
pub struct IndexMeta {
    pub action_mode: ActionMode,
    pub fingerprint: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index_kind_parses_case_insensitively() {
        assert_eq!("Field".parse::<IndexKind>().unwrap(), IndexKind::Field);
        assert!(matches!(
            "btree".parse::<IndexKind>(),
            Err(Error::UnknownFactory(_))
        ));
    }

    #[test]
    fn action_mode_serializes_lowercase() {
        let json = serde_json::to_string(&ActionMode::AtCommit).unwrap();
        assert_eq!(json, "\"atcommit\"");
        let mode: ActionMode = serde_json::from_str("\"deferred\"").unwrap();
        assert_eq!(mode, ActionMode::Deferred);
    }
}
