//! The permission collaborator.
//!
//! The catalog never evaluates ACLs itself. Discriminators ask which
//! principals hold a permission on a resource, and search-time filtering asks
//! whether a principal set holds a permission.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::{
        PoisonError,
        RwLock,
    },
};

use crate::{
    doc_id::DocId,
    resource::Resource,
};

pub trait Security: Send + Sync {
    fn principals_allowed(
        &self,
        resource: &dyn Resource,
        permission: &str,
    ) -> Vec<String>;

    fn has_permission(
        &self,
        principals: &BTreeSet<String>,
        permission: &str,
        resource: &dyn Resource,
    ) -> bool {
        self.principals_allowed(resource, permission)
            .iter()
            .any(|p| principals.contains(p))
    }

    /// Principals of the request currently being served.
    fn effective_principals(&self) -> BTreeSet<String>;

    /// Every permission the policy knows about.
    fn all_permissions(&self) -> BTreeSet<String>;
}

impl std::fmt::Debug for dyn Security {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Security").finish_non_exhaustive()
    }
}

/// Who a query is being asked on behalf of.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principals {
    List(Vec<String>),
    One(String),
    /// Whoever the current request is authenticated as.
    Request,
}

impl Principals {
    pub fn resolve(&self, security: &dyn Security) -> BTreeSet<String> {
        match self {
            Principals::List(list) => list.iter().cloned().collect(),
            Principals::One(p) => BTreeSet::from([p.clone()]),
            Principals::Request => security.effective_principals(),
        }
    }
}

impl From<&str> for Principals {
    fn from(p: &str) -> Self {
        Principals::One(p.to_string())
    }
}

impl From<Vec<&str>> for Principals {
    fn from(list: Vec<&str>) -> Self {
        Principals::List(list.into_iter().map(str::to_string).collect())
    }
}

#[derive(Default)]
struct Grants {
    by_oid: BTreeMap<DocId, BTreeMap<String, BTreeSet<String>>>,
    request: BTreeSet<String>,
}

/// A flat oid -> permission -> principals table, inherited down the
/// resource lineage.
#[derive(Default)]
pub struct GrantTable {
    grants: RwLock<Grants>,
}

impl GrantTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grant(&self, oid: DocId, principal: &str, permission: &str) {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .by_oid
            .entry(oid)
            .or_default()
            .entry(permission.to_string())
            .or_default()
            .insert(principal.to_string());
    }

    pub fn revoke(&self, oid: DocId, principal: &str, permission: &str) {
        let mut grants =
            self.grants.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(perms) = grants.by_oid.get_mut(&oid)
            && let Some(set) = perms.get_mut(permission)
        {
            set.remove(principal);
        }
    }

    pub fn set_request_principals<I, S>(&self, principals: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.grants
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .request = principals.into_iter().map(Into::into).collect();
    }
}

impl Security for GrantTable {
    fn principals_allowed(
        &self,
        resource: &dyn Resource,
        permission: &str,
    ) -> Vec<String> {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        let mut allowed = BTreeSet::new();
        let mut collect = |oid: Option<DocId>| {
            if let Some(set) = oid
                .and_then(|oid| grants.by_oid.get(&oid))
                .and_then(|perms| perms.get(permission))
            {
                allowed.extend(set.iter().cloned());
            }
        };
        collect(resource.oid());
        let mut current = resource.parent();
        while let Some(node) = current {
            collect(node.oid());
            current = node.parent();
        }
        allowed.into_iter().collect()
    }

    fn effective_principals(&self) -> BTreeSet<String> {
        self.grants
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .request
            .clone()
    }

    fn all_permissions(&self) -> BTreeSet<String> {
        let grants = self.grants.read().unwrap_or_else(PoisonError::into_inner);
        grants
            .by_oid
            .values()
            .flat_map(|perms| perms.keys().cloned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Content;

    #[test]
    fn grants_are_inherited_from_ancestors() {
        let root = Content::new(1).into_arc();
        let doc = Content::new(2).named("doc").within(&root).into_arc();
        let table = GrantTable::new();
        table.grant(1, "system.Everyone", "view");
        table.grant(2, "bob", "view");
        table.grant(2, "bob", "edit");

        assert_eq!(
            table.principals_allowed(doc.as_ref(), "view"),
            vec!["bob".to_string(), "system.Everyone".to_string()]
        );
        assert!(table.principals_allowed(root.as_ref(), "edit").is_empty());
        assert_eq!(
            table.all_permissions(),
            BTreeSet::from(["edit".to_string(), "view".to_string()])
        );
    }

    #[test]
    fn has_permission_checks_any_principal() {
        let doc = Content::new(7).into_arc();
        let table = GrantTable::new();
        table.grant(7, "alice", "view");
        let who = BTreeSet::from(["bob".to_string(), "alice".to_string()]);
        assert!(table.has_permission(&who, "view", doc.as_ref()));
        table.revoke(7, "alice", "view");
        assert!(!table.has_permission(&who, "view", doc.as_ref()));
    }

    #[test]
    fn request_principals_resolve_from_the_collaborator() {
        let table = GrantTable::new();
        table.set_request_principals(["alice", "system.Authenticated"]);
        let resolved = Principals::Request.resolve(&table);
        assert!(resolved.contains("alice"));
        assert_eq!(Principals::from("bob").resolve(&table).len(), 1);
        assert_eq!(
            Principals::from(vec!["a", "b", "a"]).resolve(&table).len(),
            2
        );
    }
}
