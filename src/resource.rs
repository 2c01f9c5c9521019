//! The object model the catalog indexes.
//!
//! Indexes never see concrete application types; they see [`Resource`],
//! a minimal view of a node in a persistent object tree: an integer oid, a
//! name within its parent, a declared set of interface tags and named
//! attributes. [`Content`] is a ready-made implementation for embedders and
//! tests.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    fmt,
    sync::{
        Arc,
        PoisonError,
        RwLock,
    },
};

use percent_encoding::{
    AsciiSet,
    CONTROLS,
    percent_decode_str,
    utf8_percent_encode,
};

use crate::{
    doc_id::DocId,
    error::{
        Error,
        Result,
    },
    value::Value,
};

/// Characters escaped when a path segment is rendered into a path string.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b']');

/// A path from the root, root first. The root itself is `[""]`.
pub type PathTuple = Vec<String>;

pub trait Resource: Send + Sync {
    /// The object id, if the resource has been registered with an object map.
    fn oid(&self) -> Option<DocId>;

    /// Name within the parent. The root has no name.
    fn name(&self) -> Option<&str>;

    fn parent(&self) -> Option<Arc<dyn Resource>>;

    /// Content type name, used to pick per-type index views.
    fn content_type(&self) -> &str;

    /// The full, declared set of interface tags including inherited ones.
    fn interfaces(&self) -> BTreeSet<String>;

    fn attribute(&self, name: &str) -> Option<Value>;
}

impl fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Resource")
            .field("oid", &self.oid())
            .field("path", &resource_path(self))
            .finish()
    }
}

/// Names of `resource` and its ancestors, root first.
pub fn resource_path_tuple(resource: &dyn Resource) -> PathTuple {
    let mut names = vec![resource.name().unwrap_or("").to_string()];
    let mut current = resource.parent();
    while let Some(node) = current {
        names.push(node.name().unwrap_or("").to_string());
        current = node.parent();
    }
    names.reverse();
    names
}

/// Render a path tuple as a slash-separated, percent-quoted string.
pub fn path_string(path: &[String]) -> String {
    match path {
        [] => "/".to_string(),
        [root] if root.is_empty() => "/".to_string(),
        _ => path
            .iter()
            .map(|seg| utf8_percent_encode(seg, SEGMENT).to_string())
            .collect::<Vec<_>>()
            .join("/"),
    }
}

pub fn resource_path(resource: &dyn Resource) -> String {
    path_string(&resource_path_tuple(resource))
}

/// Parse an absolute path string into a path tuple.
///
/// Empty segments are dropped, so `/a//b/` and `/a/b` are the same path.
///
/// # Examples
///
/// ```
/// use doccat::resource::parse_path;
///
/// assert_eq!(parse_path("/a/b").unwrap(), vec!["", "a", "b"]);
/// assert_eq!(parse_path("/").unwrap(), vec![""]);
/// assert!(parse_path("a/b").is_err());
/// ```
pub fn parse_path(raw: &str) -> Result<PathTuple> {
    if !raw.starts_with('/') {
        return Err(Error::InvalidPath {
            path: raw.to_string(),
            reason: "path must start with /",
        });
    }
    let mut tuple = vec![String::new()];
    for seg in raw.split('/').filter(|s| !s.is_empty()) {
        let decoded = percent_decode_str(seg).decode_utf8().map_err(|_| {
            Error::InvalidPath {
                path: raw.to_string(),
                reason: "path is not valid percent-encoded UTF-8",
            }
        })?;
        tuple.push(decoded.into_owned());
    }
    Ok(tuple)
}

/// The interfaces of `resource` and of every ancestor, inclusive.
pub fn lineage_interfaces(resource: &dyn Resource) -> BTreeSet<String> {
    let mut ifaces = resource.interfaces();
    let mut current = resource.parent();
    while let Some(node) = current {
        ifaces.extend(node.interfaces());
        current = node.parent();
    }
    ifaces
}

/// A plain in-memory tree node.
pub struct Content {
    oid: Option<DocId>,
    name: Option<String>,
    parent: Option<Arc<Content>>,
    content_type: String,
    interfaces: BTreeSet<String>,
    attributes: RwLock<BTreeMap<String, Value>>,
}

impl Content {
    pub fn new(oid: DocId) -> Self {
        Self {
            oid: Some(oid),
            name: None,
            parent: None,
            content_type: "Content".to_string(),
            interfaces: BTreeSet::new(),
            attributes: RwLock::new(BTreeMap::new()),
        }
    }

    /// A node with no oid, as seen before registration.
    pub fn unregistered() -> Self {
        Self {
            oid: None,
            ..Self::new(0)
        }
    }

    pub fn named(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn within(mut self, parent: &Arc<Content>) -> Self {
        self.parent = Some(Arc::clone(parent));
        self
    }

    pub fn typed(mut self, content_type: &str) -> Self {
        self.content_type = content_type.to_string();
        self
    }

    pub fn provides(mut self, iface: &str) -> Self {
        self.interfaces.insert(iface.to_string());
        self
    }

    pub fn with(self, name: &str, value: impl Into<Value>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn set_attribute(&self, name: &str, value: impl Into<Value>) {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), value.into());
    }

    pub fn remove_attribute(&self, name: &str) -> Option<Value> {
        self.attributes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }
}

impl Resource for Content {
    fn oid(&self) -> Option<DocId> {
        self.oid
    }

    fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    fn parent(&self) -> Option<Arc<dyn Resource>> {
        self.parent
            .as_ref()
            .map(|p| Arc::clone(p) as Arc<dyn Resource>)
    }

    fn content_type(&self) -> &str {
        &self.content_type
    }

    fn interfaces(&self) -> BTreeSet<String> {
        self.interfaces.clone()
    }

    fn attribute(&self, name: &str) -> Option<Value> {
        self.attributes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

impl fmt::Debug for Content {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Content")
            .field("oid", &self.oid)
            .field("path", &resource_path(self))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> (Arc<Content>, Arc<Content>, Arc<Content>) {
        let root = Content::new(1).provides("IRoot").into_arc();
        let a = Content::new(2)
            .named("a")
            .within(&root)
            .provides("IFolder")
            .into_arc();
        let b = Content::new(3)
            .named("b c")
            .within(&a)
            .provides("IDocument")
            .into_arc();
        (root, a, b)
    }

    #[test]
    fn path_tuple_walks_lineage() {
        let (root, a, b) = tree();
        assert_eq!(resource_path_tuple(root.as_ref()), vec![""]);
        assert_eq!(resource_path_tuple(a.as_ref()), vec!["", "a"]);
        assert_eq!(resource_path_tuple(b.as_ref()), vec!["", "a", "b c"]);
    }

    #[test]
    fn path_string_quotes_segments() {
        let (root, _, b) = tree();
        assert_eq!(resource_path(root.as_ref()), "/");
        assert_eq!(resource_path(b.as_ref()), "/a/b%20c");
    }

    #[test]
    fn parse_path_unquotes_and_round_trips() {
        let (_, _, b) = tree();
        let parsed = parse_path(&resource_path(b.as_ref())).unwrap();
        assert_eq!(parsed, resource_path_tuple(b.as_ref()));
    }

    #[test]
    fn parse_path_requires_leading_slash() {
        assert!(matches!(
            parse_path("a/b"),
            Err(Error::InvalidPath { .. })
        ));
    }

    #[test]
    fn lineage_interfaces_is_inclusive() {
        let (_, _, b) = tree();
        let ifaces = lineage_interfaces(b.as_ref());
        let expected: BTreeSet<String> = ["IRoot", "IFolder", "IDocument"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(ifaces, expected);
    }

    #[test]
    fn attributes_are_mutable_through_shared_handles() {
        let (_, a, _) = tree();
        assert!(a.attribute("title").is_none());
        a.set_attribute("title", "Hello");
        assert_eq!(a.attribute("title"), Some(Value::from("Hello")));
        assert_eq!(a.remove_attribute("title"), Some(Value::from("Hello")));
    }
}
