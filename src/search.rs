//! Query composition over a catalog's indexes.
//!
//! [`Search::search`] intersects one fragment per named index;
//! [`Search::query`] evaluates a boolean [`Query`] tree. Both then run the
//! same pipeline:
//!
//! 1. Permission filter (ids whose object is gone are dropped)
//! 2. Count
//! 3. Sort by an index, or ascending id
//! 4. Limit

use std::{
    collections::BTreeSet,
    fmt,
    sync::Arc,
};

use rayon::prelude::*;
use tracing::debug;

use crate::{
    catalog::Catalog,
    doc_id::{
        DocId,
        DocSet,
        union_all,
    },
    error::{
        Error,
        Result,
    },
    index::{
        Fragment,
        SortOptions,
        SortType,
        TextIndex,
    },
    objectmap::ObjectMap,
    resource::Resource,
    security::{
        Principals,
        Security,
    },
};

pub type Predicate = Arc<dyn Fn(&dyn Resource) -> bool + Send + Sync>;

/// Who must be allowed to see a result.
#[derive(Clone)]
pub enum PermissionFilter {
    Principals {
        principals: Principals,
        permission: String,
        security: Arc<dyn Security>,
    },
    Predicate(Predicate),
}

impl fmt::Debug for PermissionFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionFilter::Principals {
                principals,
                permission,
                ..
            } => f
                .debug_struct("Principals")
                .field("principals", principals)
                .field("permission", permission)
                .finish_non_exhaustive(),
            PermissionFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SearchOptions {
    /// Indexes to evaluate first, in this order.
    pub index_query_order: Option<Vec<String>>,
    pub sort_index: Option<String>,
    pub limit: Option<usize>,
    pub reverse: bool,
    pub sort_type: SortType,
    pub permission: Option<PermissionFilter>,
}

#[derive(Debug, Clone)]
pub enum Query {
    Index(String, Fragment),
    And(Vec<Query>),
    Or(Vec<Query>),
    /// Every id the catalog knows, minus the inner matches.
    Not(Box<Query>),
}

impl Query {
    pub fn index(name: &str, fragment: Fragment) -> Self {
        Query::Index(name.to_string(), fragment)
    }

    pub fn not(inner: Query) -> Self {
        Query::Not(Box::new(inner))
    }
}

pub struct QueryResult {
    /// Matches after permission filtering, before the limit.
    pub count: usize,
    pub ids: Vec<DocId>,
    resolver: Arc<dyn ObjectMap>,
}

impl fmt::Debug for QueryResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryResult")
            .field("count", &self.count)
            .field("ids", &self.ids)
            .finish_non_exhaustive()
    }
}

impl QueryResult {
    pub fn resolve(&self, oid: DocId) -> Option<Arc<dyn Resource>> {
        self.resolver.object_for(oid)
    }

    pub fn resolver(&self) -> impl Fn(DocId) -> Option<Arc<dyn Resource>> {
        let map = Arc::clone(&self.resolver);
        move |oid| map.object_for(oid)
    }

    /// Resolved objects in result order, skipping ids that no longer
    /// resolve.
    pub fn resources(&self) -> Vec<Arc<dyn Resource>> {
        self.ids.iter().filter_map(|oid| self.resolve(*oid)).collect()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Search<'a> {
    catalog: &'a Catalog,
}

impl<'a> Search<'a> {
    pub fn new(catalog: &'a Catalog) -> Self {
        Self { catalog }
    }

    fn apply(&self, index: &str, fragment: &Fragment) -> Result<DocSet> {
        let ids = self.catalog.get_index(index)?.apply(fragment)?;
        debug!(index, fragment = fragment.name(), hits = ids.len(), "applied");
        Ok(ids)
    }

    /// Intersect the matches of each `(index, fragment)` pair.
    pub fn search(
        &self,
        fragments: &[(&str, Fragment)],
        options: &SearchOptions,
    ) -> Result<QueryResult> {
        if fragments.is_empty() {
            return Err(Error::InvalidQuery {
                index: self.catalog.name().to_string(),
                reason: "no query fragments".to_string(),
            });
        }
        for (name, _) in fragments {
            self.catalog.get_index(name)?;
        }

        let mut order: Vec<&(&str, Fragment)> = Vec::new();
        for name in options.index_query_order.iter().flatten() {
            let entry = fragments
                .iter()
                .find(|entry| entry.0 == name.as_str())
                .ok_or_else(|| Error::InvalidQuery {
                    index: name.clone(),
                    reason: "ordered index has no fragment".to_string(),
                })?;
            order.push(entry);
        }
        for entry in fragments {
            if !order.iter().any(|seen| seen.0 == entry.0) {
                order.push(entry);
            }
        }

        let mut acc: Option<DocSet> = None;
        for (name, fragment) in order {
            let ids = self.apply(name, fragment)?;
            let next = match acc {
                None => ids,
                Some(mut prev) => {
                    prev.retain(|id| ids.contains(id));
                    prev
                }
            };
            let empty = next.is_empty();
            acc = Some(next);
            if empty {
                break;
            }
        }
        self.finish(acc.unwrap_or_default(), options)
    }

    pub fn query(
        &self,
        query: &Query,
        options: &SearchOptions,
    ) -> Result<QueryResult> {
        let ids = self.eval(query)?;
        self.finish(ids, options)
    }

    fn eval(&self, query: &Query) -> Result<DocSet> {
        match query {
            Query::Index(name, fragment) => self.apply(name, fragment),
            Query::And(parts) => {
                let Some((first, rest)) = parts.split_first() else {
                    return Err(Error::InvalidQuery {
                        index: self.catalog.name().to_string(),
                        reason: "empty conjunction".to_string(),
                    });
                };
                let mut acc = self.eval(first)?;
                for part in rest {
                    if acc.is_empty() {
                        break;
                    }
                    let ids = self.eval(part)?;
                    acc.retain(|id| ids.contains(id));
                }
                Ok(acc)
            }
            Query::Or(parts) => {
                let sets = parts
                    .iter()
                    .map(|part| self.eval(part))
                    .collect::<Result<Vec<_>>>()?;
                Ok(union_all(sets))
            }
            Query::Not(inner) => {
                let excluded = self.eval(inner)?;
                Ok(self
                    .catalog
                    .objectids()
                    .difference(&excluded)
                    .copied()
                    .collect())
            }
        }
    }

    fn permitted(&self, ids: DocSet, filter: &PermissionFilter) -> DocSet {
        let objectmap = self.catalog.objectmap();
        let principals: BTreeSet<String> = match filter {
            PermissionFilter::Principals {
                principals,
                security,
                ..
            } => principals.resolve(security.as_ref()),
            PermissionFilter::Predicate(_) => BTreeSet::new(),
        };
        let allowed = |resource: &dyn Resource| match filter {
            PermissionFilter::Principals {
                permission,
                security,
                ..
            } => security.has_permission(&principals, permission, resource),
            PermissionFilter::Predicate(check) => check(resource),
        };
        ids.par_iter()
            .filter(|oid| {
                objectmap
                    .object_for(**oid)
                    .is_some_and(|resource| allowed(resource.as_ref()))
            })
            .copied()
            .collect()
    }

    /// Order `ids` by `options.sort_index`, or by id when none is set,
    /// honoring `reverse` and `limit`.
    pub fn sort(
        &self,
        ids: &DocSet,
        options: &SearchOptions,
    ) -> Result<Vec<DocId>> {
        let Some(name) = &options.sort_index else {
            let limit = options.limit.unwrap_or(usize::MAX);
            return Ok(if options.reverse {
                ids.iter().rev().take(limit).copied().collect()
            } else {
                ids.iter().take(limit).copied().collect()
            });
        };
        let sort = SortOptions {
            limit: options.limit,
            reverse: options.reverse,
            sort_type: options.sort_type,
        };
        self.catalog.get_index(name)?.sort(ids, &sort)
    }

    fn finish(
        &self,
        mut ids: DocSet,
        options: &SearchOptions,
    ) -> Result<QueryResult> {
        if let Some(filter) = &options.permission {
            ids = self.permitted(ids, filter);
        }
        let count = ids.len();

        let ids = self.sort(&ids, options)?;

        Ok(QueryResult {
            count,
            ids,
            resolver: Arc::clone(self.catalog.objectmap()),
        })
    }

    /// Best-scoring matches of a text index, best first.
    pub fn ranked(
        &self,
        index: &str,
        text: &str,
        limit: usize,
    ) -> Result<Vec<(DocId, f32)>> {
        let found = self.catalog.get_index(index)?;
        let Some(text_index) = found.as_any().downcast_ref::<TextIndex>()
        else {
            return Err(Error::InvalidQuery {
                index: index.to_string(),
                reason: format!("{} index is not ranked", found.kind()),
            });
        };
        text_index.search_scored(text, limit)
    }
}
