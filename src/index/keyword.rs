use std::{
    any::Any,
    collections::{
        BTreeMap,
        BTreeSet,
    },
};

use crate::{
    discriminators::Discriminator,
    doc_id::{
        DocId,
        DocSet,
        intersect_all,
    },
    error::Result,
    index::{
        ActionMode,
        CatalogIndex,
        Fragment,
        IndexKind,
        IndexMeta,
        unsupported,
    },
    resource::Resource,
    value::Value,
};

/// Set-membership index over multi-valued attributes.
#[derive(Debug)]
pub struct KeywordIndex {
    meta: IndexMeta,
    discriminator: Discriminator,
    fwd: BTreeMap<Value, DocSet>,
    rev: BTreeMap<DocId, BTreeSet<Value>>,
    not_indexed: DocSet,
}

impl KeywordIndex {
    pub fn new(discriminator: Discriminator, meta: IndexMeta) -> Self {
        Self {
            meta,
            discriminator,
            fwd: BTreeMap::new(),
            rev: BTreeMap::new(),
            not_indexed: DocSet::new(),
        }
    }

    pub fn keywords_of(&self, docid: DocId) -> Option<&BTreeSet<Value>> {
        self.rev.get(&docid)
    }

    /// Number of distinct keywords.
    pub fn word_count(&self) -> usize {
        self.fwd.len()
    }

    pub(crate) fn discriminator(&self) -> &Discriminator {
        &self.discriminator
    }

    /// Record `keywords` for `docid`, replacing whatever it had. An empty
    /// set marks the document as not indexed.
    pub(crate) fn store(&mut self, docid: DocId, keywords: BTreeSet<Value>) {
        self.remove(docid);
        if keywords.is_empty() {
            self.not_indexed.insert(docid);
            return;
        }
        self.not_indexed.remove(&docid);
        for kw in &keywords {
            self.fwd.entry(kw.clone()).or_default().insert(docid);
        }
        self.rev.insert(docid, keywords);
    }

    pub(crate) fn mark_not_indexed(&mut self, docid: DocId) {
        self.remove(docid);
        self.not_indexed.insert(docid);
    }

    fn remove(&mut self, docid: DocId) {
        let Some(old) = self.rev.remove(&docid) else {
            return;
        };
        for kw in old {
            if let Some(set) = self.fwd.get_mut(&kw) {
                set.remove(&docid);
                if set.is_empty() {
                    self.fwd.remove(&kw);
                }
            }
        }
    }

    fn lookup(&self, kw: &Value) -> DocSet {
        self.fwd.get(kw).cloned().unwrap_or_default()
    }

    pub(crate) fn any_of<'a, I>(&self, keywords: I) -> DocSet
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let mut out = DocSet::new();
        for kw in keywords {
            if let Some(set) = self.fwd.get(kw) {
                out.extend(set.iter().copied());
            }
        }
        out
    }

    pub(crate) fn all_of<'a, I>(&self, keywords: I) -> DocSet
    where
        I: IntoIterator<Item = &'a Value>,
    {
        let sets: Vec<DocSet> =
            keywords.into_iter().map(|kw| self.lookup(kw)).collect();
        intersect_all(sets).unwrap_or_default()
    }

    pub(crate) fn apply_as(
        &self,
        kind: IndexKind,
        fragment: &Fragment,
    ) -> Result<DocSet> {
        match fragment {
            Fragment::Eq(Value::List(items)) => Ok(self.any_of(items)),
            Fragment::Eq(kw) => Ok(self.lookup(kw)),
            Fragment::AnyOf(items) => Ok(self.any_of(items)),
            Fragment::AllOf(items) => Ok(self.all_of(items)),
            other => Err(unsupported(kind, other)),
        }
    }
}

pub(crate) fn keywords(value: &Value) -> BTreeSet<Value> {
    value.items().into_iter().collect()
}

impl CatalogIndex for KeywordIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Keyword
    }

    fn action_mode(&self) -> ActionMode {
        self.meta.action_mode
    }

    fn fingerprint(&self) -> u64 {
        self.meta.fingerprint
    }

    fn index_doc(
        &mut self,
        docid: DocId,
        resource: &dyn Resource,
    ) -> Result<()> {
        match self.discriminator.extract(resource) {
            Some(value) => self.store(docid, keywords(&value)),
            None => self.mark_not_indexed(docid),
        }
        Ok(())
    }

    fn unindex_doc(&mut self, docid: DocId) -> Result<()> {
        self.remove(docid);
        self.not_indexed.remove(&docid);
        Ok(())
    }

    fn reset(&mut self) -> Result<()> {
        self.fwd.clear();
        self.rev.clear();
        self.not_indexed.clear();
        Ok(())
    }

    fn docids(&self) -> Option<DocSet> {
        Some(self.rev.keys().copied().collect())
    }

    fn not_indexed(&self) -> DocSet {
        self.not_indexed.clone()
    }

    fn apply(&self, fragment: &Fragment) -> Result<DocSet> {
        self.apply_as(IndexKind::Keyword, fragment)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::Content;

    fn set(ids: &[DocId]) -> DocSet {
        ids.iter().copied().collect()
    }

    fn tagged() -> KeywordIndex {
        let mut idx = KeywordIndex::new(
            Discriminator::attribute("tags"),
            IndexMeta::default(),
        );
        let docs = [
            (1, vec!["rust", "db"]),
            (2, vec!["rust"]),
            (3, vec!["python", "db"]),
        ];
        for (oid, tags) in docs {
            idx.index_doc(oid, &Content::new(oid).with("tags", tags))
                .unwrap();
        }
        idx.index_doc(4, &Content::new(4)).unwrap();
        idx
    }

    #[test]
    fn any_and_all_of() {
        let idx = tagged();
        let rust = Value::from("rust");
        let db = Value::from("db");
        assert_eq!(
            idx.apply(&Fragment::Eq(rust.clone())).unwrap(),
            set(&[1, 2])
        );
        assert_eq!(
            idx.apply(&Fragment::AnyOf(vec![rust.clone(), db.clone()]))
                .unwrap(),
            set(&[1, 2, 3])
        );
        assert_eq!(
            idx.apply(&Fragment::AllOf(vec![rust, db])).unwrap(),
            set(&[1])
        );
        assert!(idx.apply(&Fragment::AllOf(vec![])).unwrap().is_empty());
    }

    #[test]
    fn missing_value_is_not_indexed() {
        let idx = tagged();
        assert_eq!(idx.not_indexed(), set(&[4]));
        assert_eq!(idx.docids().unwrap(), set(&[1, 2, 3]));
    }

    #[test]
    fn reindex_replaces_keywords() {
        let mut idx = tagged();
        idx.reindex_doc(2, &Content::new(2).with("tags", vec!["go"]))
            .unwrap();
        assert_eq!(
            idx.apply(&Fragment::Eq(Value::from("rust"))).unwrap(),
            set(&[1])
        );
        assert_eq!(
            idx.keywords_of(2).unwrap(),
            &BTreeSet::from([Value::from("go")])
        );
    }

    #[test]
    fn unindex_forgets_the_doc() {
        let mut idx = tagged();
        idx.unindex_doc(1).unwrap();
        idx.unindex_doc(99).unwrap();
        assert_eq!(
            idx.apply(&Fragment::Eq(Value::from("db"))).unwrap(),
            set(&[3])
        );
    }

    #[test]
    fn range_queries_are_rejected() {
        let idx = tagged();
        let err = idx
            .apply(&Fragment::Range {
                min: None,
                max: None,
            })
            .unwrap_err();
        assert!(err.to_string().contains("keyword"));
    }
}
