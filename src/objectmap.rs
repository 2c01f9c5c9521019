//! Object id <-> path resolution and tree containment lookups.
//!
//! The catalog treats the object map as an external collaborator behind the
//! [`ObjectMap`] trait. [`MemoryObjectMap`] is an in-process implementation
//! whose path index is keyed by every path prefix and then by depth below
//! that prefix:
//!
//! ```text
//! add /a/b/c (oid 1), then /a (oid 2):
//!
//! [""]              {1: {2}, 3: {1}}
//! ["", "a"]         {0: {2}, 2: {1}}
//! ["", "a", "b"]    {1: {1}}
//! ["", "a", "b", "c"] {0: {1}}
//! ```
//!
//! Level 0 is the path itself, so a containment query under a prefix is a
//! union over a range of levels and never walks the tree.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        PoisonError,
        RwLock,
    },
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
    resource::{
        PathTuple,
        Resource,
        resource_path_tuple,
    },
};

pub trait ObjectMap: Send + Sync {
    /// Resolve an oid to a live object, `None` if it no longer exists.
    fn object_for(&self, oid: DocId) -> Option<Arc<dyn Resource>>;

    fn path_for(&self, oid: DocId) -> Option<PathTuple>;

    fn objectid_for(&self, path: &[String]) -> Option<DocId>;

    /// Oids at or under `path`, `depth` levels deep (`None` = unbounded).
    fn path_lookup(
        &self,
        path: &[String],
        depth: Option<usize>,
        include_origin: bool,
    ) -> DocSet;
}

#[derive(Default)]
struct MapState {
    objects: BTreeMap<DocId, Arc<dyn Resource>>,
    objectid_to_path: BTreeMap<DocId, PathTuple>,
    path_to_objectid: BTreeMap<PathTuple, DocId>,
    pathindex: BTreeMap<PathTuple, BTreeMap<usize, DocSet>>,
}

#[derive(Default)]
pub struct MemoryObjectMap {
    state: RwLock<MapState>,
}

impl MemoryObjectMap {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MapState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MapState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `resource` under its current path.
    pub fn add(&self, resource: Arc<dyn Resource>) -> Result<DocId> {
        let oid = resource
            .oid()
            .ok_or_else(|| Error::InvalidDocId("<unassigned>".into()))?;
        let path = resource_path_tuple(resource.as_ref());

        let mut state = self.write();
        if state.objectid_to_path.contains_key(&oid) {
            return Err(Error::Conflict(format!(
                "objectid {oid} already exists"
            )));
        }
        if state.path_to_objectid.contains_key(&path) {
            return Err(Error::Conflict(format!(
                "path {path:?} already exists"
            )));
        }

        state.path_to_objectid.insert(path.clone(), oid);
        state.objectid_to_path.insert(oid, path.clone());
        state.objects.insert(oid, resource);

        let pathlen = path.len();
        for x in 1..=pathlen {
            let prefix = path[..x].to_vec();
            let level = pathlen - x;
            state
                .pathindex
                .entry(prefix)
                .or_default()
                .entry(level)
                .or_default()
                .insert(oid);
        }

        Ok(oid)
    }

    /// Remove the object at `path` and everything below it.
    ///
    /// Returns the removed oids; an unknown path removes nothing.
    pub fn remove(&self, path: &[String]) -> DocSet {
        let mut state = self.write();
        let Some(dmap) = state.pathindex.get(path).cloned() else {
            return DocSet::new();
        };

        let mut removed = DocSet::new();
        let subtree: Vec<PathTuple> = state
            .pathindex
            .range(path.to_vec()..)
            .take_while(|(k, _)| k.starts_with(path))
            .map(|(k, _)| k.clone())
            .collect();
        for key in subtree {
            if let Some(levels) = state.pathindex.remove(&key) {
                for oids in levels.into_values() {
                    removed.extend(oids);
                }
            }
        }
        for oid in &removed {
            if let Some(p) = state.objectid_to_path.remove(oid) {
                state.path_to_objectid.remove(&p);
            }
            state.objects.remove(oid);
        }

        let pathlen = path.len();
        for offset in 1..pathlen {
            let ancestor = &path[..pathlen - offset];
            let Some(levels) = state.pathindex.get_mut(ancestor) else {
                continue;
            };
            for (level, oids) in &dmap {
                let at = level + offset;
                if let Some(set) = levels.get_mut(&at) {
                    set.retain(|oid| !oids.contains(oid));
                    if set.is_empty() {
                        levels.remove(&at);
                    }
                }
            }
            if levels.is_empty() {
                state.pathindex.remove(ancestor);
            }
        }

        removed
    }

    pub fn remove_oid(&self, oid: DocId) -> DocSet {
        let path = self.read().objectid_to_path.get(&oid).cloned();
        match path {
            Some(path) => self.remove(&path),
            None => DocSet::new(),
        }
    }

    /// Drop the live object for `oid` but keep its path registration,
    /// the state a concurrent deletion leaves behind mid-transaction.
    pub fn forget_object(&self, oid: DocId) -> bool {
        self.write().objects.remove(&oid).is_some()
    }

    /// Drop the path registration for `oid` but keep nothing else either;
    /// the catalog may still list the oid.
    pub fn forget(&self, oid: DocId) {
        let mut state = self.write();
        state.objects.remove(&oid);
        if let Some(p) = state.objectid_to_path.remove(&oid) {
            state.path_to_objectid.remove(&p);
        }
    }

    pub fn len(&self) -> usize {
        self.read().objectid_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ObjectMap for MemoryObjectMap {
    fn object_for(&self, oid: DocId) -> Option<Arc<dyn Resource>> {
        self.read().objects.get(&oid).cloned()
    }

    fn path_for(&self, oid: DocId) -> Option<PathTuple> {
        self.read().objectid_to_path.get(&oid).cloned()
    }

    fn objectid_for(&self, path: &[String]) -> Option<DocId> {
        self.read().path_to_objectid.get(path).copied()
    }

    fn path_lookup(
        &self,
        path: &[String],
        depth: Option<usize>,
        include_origin: bool,
    ) -> DocSet {
        let state = self.read();
        let mut result = DocSet::new();
        let Some(levels) = state.pathindex.get(path) else {
            return result;
        };
        let max = depth.unwrap_or(usize::MAX);
        for (level, oids) in levels.range(..=max) {
            if *level == 0 && !include_origin {
                continue;
            }
            result.extend(oids.iter().copied());
        }
        result
    }
}

impl std::fmt::Debug for dyn ObjectMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectMap").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for MemoryObjectMap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryObjectMap")
            .field("objects", &self.len())
            .finish_non_exhaustive()
    }
}
