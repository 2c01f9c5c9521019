use std::{
    any::Any,
    fmt,
    str::FromStr,
    sync::Arc,
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
    index::{
        ActionMode,
        CatalogIndex,
        Fragment,
        IndexKind,
        IndexMeta,
        unsupported,
    },
    objectmap::ObjectMap,
    resource::{
        PathTuple,
        Resource,
        parse_path,
        resource_path_tuple,
    },
};

/// Where a containment query is anchored.
#[derive(Clone)]
pub enum PathTarget {
    Resource(Arc<dyn Resource>),
    /// An absolute path string, possibly percent-quoted.
    Path(String),
    Tuple(PathTuple),
}

impl fmt::Debug for PathTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathTarget::Resource(r) => {
                f.debug_tuple("Resource").field(r).finish()
            }
            PathTarget::Path(p) => f.debug_tuple("Path").field(p).finish(),
            PathTarget::Tuple(t) => f.debug_tuple("Tuple").field(t).finish(),
        }
    }
}

/// A containment query: everything at or under an anchor.
///
/// `depth` and `include_origin` left as `None` fall back to the index
/// defaults. `depth: Some(None)` asks for unbounded depth explicitly.
#[derive(Debug, Clone)]
pub struct PathQuery {
    pub target: PathTarget,
    pub depth: Option<Option<usize>>,
    pub include_origin: Option<bool>,
}

impl PathQuery {
    pub fn new(target: PathTarget) -> Self {
        Self {
            target,
            depth: None,
            include_origin: None,
        }
    }

    pub fn depth(mut self, depth: Option<usize>) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn include_origin(mut self, include: bool) -> Self {
        self.include_origin = Some(include);
        self
    }

    /// The anchor as a path tuple.
    pub fn tuple(&self) -> Result<PathTuple> {
        match &self.target {
            PathTarget::Resource(r) => Ok(resource_path_tuple(r.as_ref())),
            PathTarget::Path(p) => parse_path(p),
            PathTarget::Tuple(t) => {
                if t.first().is_some_and(String::is_empty) {
                    Ok(t.clone())
                } else {
                    Err(Error::InvalidPath {
                        path: t.join("/"),
                        reason: "path must start with /",
                    })
                }
            }
        }
    }
}

fn bad_option(raw: &str, reason: String) -> Error {
    Error::InvalidQuery {
        index: IndexKind::Path.to_string(),
        reason: format!("{raw:?}: {reason}"),
    }
}

/// Parses `[depth=N,include_origin=false]/a/b`; the bracketed prefix is
/// optional.
///
/// # Examples
///
/// ```
/// use doccat::index::PathQuery;
///
/// let q: PathQuery = "[depth=1,include_origin=false]/a".parse().unwrap();
/// assert_eq!(q.depth, Some(Some(1)));
/// assert_eq!(q.include_origin, Some(false));
/// assert_eq!(q.tuple().unwrap(), vec!["", "a"]);
/// ```
impl FromStr for PathQuery {
    type Err = Error;

    fn from_str(raw: &str) -> Result<Self> {
        let mut query = PathQuery::new(PathTarget::Path(raw.to_string()));
        let Some(rest) = raw.strip_prefix('[') else {
            query.tuple()?;
            return Ok(query);
        };
        let (options, path) = rest
            .split_once(']')
            .ok_or_else(|| bad_option(raw, "unterminated [".into()))?;

        for option in options.split(',').map(str::trim) {
            if option.is_empty() {
                continue;
            }
            let (key, value) = option.split_once('=').ok_or_else(|| {
                bad_option(raw, format!("expected key=value, got {option}"))
            })?;
            match key.trim() {
                "depth" => {
                    let value = value.trim();
                    query.depth = Some(if value.eq_ignore_ascii_case("none") {
                        None
                    } else {
                        Some(value.parse().map_err(|_| {
                            bad_option(raw, format!("bad depth {value}"))
                        })?)
                    });
                }
                "include_origin" => {
                    let value = value.trim().to_ascii_lowercase();
                    query.include_origin = Some(value.parse().map_err(|_| {
                        bad_option(raw, format!("bad include_origin {value}"))
                    })?);
                }
                other => {
                    let reason = format!("unknown option {other}");
                    return Err(bad_option(raw, reason));
                }
            }
        }

        query.target = PathTarget::Path(path.to_string());
        query.tuple()?;
        Ok(query)
    }
}

impl From<Arc<dyn Resource>> for PathQuery {
    fn from(resource: Arc<dyn Resource>) -> Self {
        PathQuery::new(PathTarget::Resource(resource))
    }
}

impl From<PathTuple> for PathQuery {
    fn from(tuple: PathTuple) -> Self {
        PathQuery::new(PathTarget::Tuple(tuple))
    }
}

/// The explicit `(path, depth, include_origin)` form.
impl From<(PathTuple, Option<usize>, bool)> for PathQuery {
    fn from(parts: (PathTuple, Option<usize>, bool)) -> Self {
        let (tuple, depth, include_origin) = parts;
        PathQuery::new(PathTarget::Tuple(tuple))
            .depth(depth)
            .include_origin(include_origin)
    }
}

/// Tree containment answered by the object map.
///
/// Holds no per-document state: indexing calls are no-ops.
pub struct PathIndex {
    meta: IndexMeta,
    objectmap: Arc<dyn ObjectMap>,
    depth: Option<usize>,
    include_origin: bool,
}

impl PathIndex {
    pub fn new(objectmap: Arc<dyn ObjectMap>, meta: IndexMeta) -> Self {
        Self {
            meta,
            objectmap,
            depth: None,
            include_origin: true,
        }
    }

    pub fn with_defaults(
        mut self,
        depth: Option<usize>,
        include_origin: bool,
    ) -> Self {
        self.depth = depth;
        self.include_origin = include_origin;
        self
    }

    /// Resolve `query` against this index's defaults.
    pub fn resolve(
        &self,
        query: &PathQuery,
    ) -> Result<(PathTuple, Option<usize>, bool)> {
        Ok((
            query.tuple()?,
            query.depth.unwrap_or(self.depth),
            query.include_origin.unwrap_or(self.include_origin),
        ))
    }

    /// Shorthand for [`Fragment::Path`] queries.
    pub fn eq(&self, query: impl Into<PathQuery>) -> Result<DocSet> {
        self.apply(&Fragment::Path(query.into()))
    }
}

impl fmt::Debug for PathIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PathIndex")
            .field("depth", &self.depth)
            .field("include_origin", &self.include_origin)
            .finish_non_exhaustive()
    }
}

impl CatalogIndex for PathIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Path
    }

    fn action_mode(&self) -> ActionMode {
        self.meta.action_mode
    }

    fn fingerprint(&self) -> u64 {
        self.meta.fingerprint
    }

    fn index_doc(&mut self, _: DocId, _: &dyn Resource) -> Result<()> {
        Ok(())
    }

    fn unindex_doc(&mut self, _: DocId) -> Result<()> {
        Ok(())
    }

    fn reindex_doc(&mut self, _: DocId, _: &dyn Resource) -> Result<()> {
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    fn docids(&self) -> Option<DocSet> {
        None
    }

    fn apply(&self, fragment: &Fragment) -> Result<DocSet> {
        let query = match fragment {
            Fragment::Path(q) => q.clone(),
            Fragment::Text(raw) => raw.parse()?,
            other => return Err(unsupported(IndexKind::Path, other)),
        };
        let (path, depth, include_origin) = self.resolve(&query)?;
        Ok(self.objectmap.path_lookup(&path, depth, include_origin))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
