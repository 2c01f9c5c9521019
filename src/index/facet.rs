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
    value::Value,
};

/// Hierarchical facets such as `price:0-100` or `color:red:dark`.
///
/// A document tagged `a:b:c` is also found under `a:b` and `a`.
#[derive(Debug)]
pub struct FacetIndex {
    inner: KeywordIndex,
    facets: BTreeSet<String>,
}

/// `a:b:c` -> `a`, `a:b`, `a:b:c`.
pub fn expand(facet: &str) -> Vec<String> {
    let parts: Vec<&str> = facet.split(':').collect();
    (1..=parts.len()).map(|n| parts[..n].join(":")).collect()
}

impl FacetIndex {
    pub fn new(
        discriminator: Discriminator,
        facets: Vec<String>,
        meta: IndexMeta,
    ) -> Self {
        Self {
            inner: KeywordIndex::new(discriminator, meta),
            facets: facets.into_iter().collect(),
        }
    }

    pub fn facets(&self) -> &BTreeSet<String> {
        &self.facets
    }

    /// How many of `docids` carry each declared facet, skipping `omit` and
    /// everything above it.
    pub fn counts(
        &self,
        docids: &DocSet,
        omit: &[&str],
    ) -> BTreeMap<String, usize> {
        let omitted: BTreeSet<String> =
            omit.iter().flat_map(|f| expand(f)).collect();
        let include: BTreeSet<&String> =
            self.facets.iter().filter(|f| !omitted.contains(*f)).collect();

        let mut counts = BTreeMap::new();
        for docid in docids {
            let Some(available) = self.inner.keywords_of(*docid) else {
                continue;
            };
            for facet in &include {
                if available.contains(&Value::Text((*facet).clone())) {
                    *counts.entry((*facet).clone()).or_insert(0) += 1;
                }
            }
        }
        counts
    }
}

impl CatalogIndex for FacetIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Facet
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
        let Some(value) = self.inner.discriminator().extract(resource) else {
            self.inner.mark_not_indexed(docid);
            return Ok(());
        };
        let expanded: BTreeSet<Value> = value
            .items()
            .iter()
            .filter_map(Value::as_str)
            .flat_map(expand)
            .map(Value::Text)
            .collect();
        self.inner.store(docid, expanded);
        Ok(())
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
        self.inner.apply_as(IndexKind::Facet, fragment)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
