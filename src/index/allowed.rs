use std::{
    any::Any,
    sync::Arc,
};

use crate::{
    discriminators::{
        self,
        Discriminator,
        Extractor,
    },
    doc_id::{
        DocId,
        DocSet,
    },
    error::Result,
    index::{
        ActionMode,
        CatalogIndex,
        Fragment,
        IndexKind,
        IndexMeta,
        KeywordIndex,
    },
    resource::Resource,
    security::{
        Principals,
        Security,
    },
    value::Value,
};

/// Permission [`AllowedIndex::allows`] asks about when none is given.
pub const DEFAULT_PERMISSION: &str = "view";

/// Keyword index over `(principal, permission)` pairs.
#[derive(Debug)]
pub struct AllowedIndex {
    inner: KeywordIndex,
    permissions: Vec<String>,
    security: Arc<dyn Security>,
}

impl AllowedIndex {
    /// An empty `permissions` list indexes every permission the policy
    /// knows about.
    pub fn new(
        security: Arc<dyn Security>,
        permissions: Vec<String>,
        meta: IndexMeta,
    ) -> Self {
        let discriminator = Discriminator::new(vec![Extractor::Func(
            discriminators::allowed(security.clone(), permissions.clone()),
        )]);
        Self {
            inner: KeywordIndex::new(discriminator, meta),
            permissions,
            security,
        }
    }

    pub fn permissions(&self) -> &[String] {
        &self.permissions
    }

    /// Query matching documents on which any of `principals` holds
    /// `permission`.
    pub fn allows(
        &self,
        principals: &Principals,
        permission: Option<&str>,
    ) -> Fragment {
        let permission = permission.unwrap_or(DEFAULT_PERMISSION);
        let pairs = principals
            .resolve(self.security.as_ref())
            .iter()
            .map(|p| Value::pair(p, permission))
            .collect();
        Fragment::AnyOf(pairs)
    }
}

impl CatalogIndex for AllowedIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Allowed
    }

    fn action_mode(&self) -> ActionMode {
        self.inner.action_mode()
    }

    fn fingerprint(&self) -> u64 {
        self.inner.fingerprint()
    }

    fn index_doc(
        &mut self,
        docid: DocId,
        resource: &dyn Resource,
    ) -> Result<()> {
        self.inner.index_doc(docid, resource)
    }

    fn unindex_doc(&mut self, docid: DocId) -> Result<()> {
        self.inner.unindex_doc(docid)
    }

    fn reset(&mut self) -> Result<()> {
        self.inner.reset()
    }

    fn docids(&self) -> Option<DocSet> {
        self.inner.docids()
    }

    fn not_indexed(&self) -> DocSet {
        self.inner.not_indexed()
    }

    fn apply(&self, fragment: &Fragment) -> Result<DocSet> {
        self.inner.apply_as(IndexKind::Allowed, fragment)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discriminators::NO_WAY,
        resource::Content,
        security::GrantTable,
    };

    fn set(ids: &[DocId]) -> DocSet {
        ids.iter().copied().collect()
    }

    #[test]
    fn allows_matches_granted_principals() {
        let table = Arc::new(GrantTable::new());
        table.grant(1, "alice", "view");
        table.grant(2, "bob", "view");
        table.grant(2, "alice", "edit");

        let mut idx = AllowedIndex::new(
            table.clone(),
            vec!["view".into(), "edit".into()],
            IndexMeta::default(),
        );
        for oid in 1..=3 {
            idx.index_doc(oid, &Content::new(oid)).unwrap();
        }

        let q = idx.allows(&Principals::from("alice"), None);
        assert_eq!(idx.apply(&q).unwrap(), set(&[1]));
        let q = idx.allows(&Principals::from("alice"), Some("edit"));
        assert_eq!(idx.apply(&q).unwrap(), set(&[2]));
        let q = idx.allows(&Principals::from(vec!["alice", "bob"]), None);
        assert_eq!(idx.apply(&q).unwrap(), set(&[1, 2]));
    }

    #[test]
    fn nobody_allowed_never_matches_an_empty_query() {
        let table = Arc::new(GrantTable::new());
        let mut idx =
            AllowedIndex::new(table.clone(), vec![], IndexMeta::default());
        idx.index_doc(9, &Content::new(9)).unwrap();

        assert_eq!(idx.docids().unwrap(), set(&[9]));
        let q = idx.allows(&Principals::List(vec![]), None);
        assert!(idx.apply(&q).unwrap().is_empty());
        assert_eq!(
            idx.inner.keywords_of(9).unwrap().len(),
            1,
            "only the {NO_WAY:?} pair is stored"
        );
    }

    #[test]
    fn no_permissions_means_every_known_permission() {
        let table = Arc::new(GrantTable::new());
        table.grant(1, "alice", "view");
        table.grant(2, "alice", "edit");
        let mut idx =
            AllowedIndex::new(table.clone(), vec![], IndexMeta::default());
        assert!(idx.permissions().is_empty());
        for oid in 1..=2 {
            idx.index_doc(oid, &Content::new(oid)).unwrap();
        }

        let alice = Principals::from("alice");
        let q = idx.allows(&alice, Some("edit"));
        assert_eq!(idx.apply(&q).unwrap(), set(&[2]));
        let q = idx.allows(&alice, None);
        assert_eq!(idx.apply(&q).unwrap(), set(&[1]));
    }

    #[test]
    fn request_principals_come_from_security() {
        let table = Arc::new(GrantTable::new());
        table.grant(4, "carol", "view");
        table.set_request_principals(["carol"]);
        let mut idx =
            AllowedIndex::new(table.clone(), vec![], IndexMeta::default());
        idx.index_doc(4, &Content::new(4)).unwrap();
        let q = idx.allows(&Principals::Request, None);
        assert_eq!(idx.apply(&q).unwrap(), set(&[4]));
    }
}
