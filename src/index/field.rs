use std::{
    any::Any,
    collections::{
        BTreeMap,
        BinaryHeap,
    },
    ops::Bound,
};

use tracing::debug;

use crate::{
    discriminators::Discriminator,
    doc_id::{
        DocId,
        DocSet,
        intersect_all,
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
        SortOptions,
        SortType,
        unsupported,
    },
    resource::Resource,
    value::Value,
};

/// Exact and range matching over a single ordered value per document.
#[derive(Debug)]
pub struct FieldIndex {
    meta: IndexMeta,
    discriminator: Discriminator,
    fwd: BTreeMap<Value, DocSet>,
    rev: BTreeMap<DocId, Value>,
    not_indexed: DocSet,
}

impl FieldIndex {
    pub fn new(discriminator: Discriminator, meta: IndexMeta) -> Self {
        Self {
            meta,
            discriminator,
            fwd: BTreeMap::new(),
            rev: BTreeMap::new(),
            not_indexed: DocSet::new(),
        }
    }

    pub fn value_of(&self, docid: DocId) -> Option<&Value> {
        self.rev.get(&docid)
    }

    /// Number of distinct values.
    pub fn value_count(&self) -> usize {
        self.fwd.len()
    }

    fn remove(&mut self, docid: DocId) {
        if let Some(old) = self.rev.remove(&docid)
            && let Some(set) = self.fwd.get_mut(&old)
        {
            set.remove(&docid);
            if set.is_empty() {
                self.fwd.remove(&old);
            }
        }
    }

    fn range(&self, min: Option<&Value>, max: Option<&Value>) -> DocSet {
        if let (Some(lo), Some(hi)) = (min, max)
            && lo > hi
        {
            return DocSet::new();
        }
        let lo = min.map_or(Bound::Unbounded, Bound::Included);
        let hi = max.map_or(Bound::Unbounded, Bound::Included);
        let mut out = DocSet::new();
        for (_, set) in self.fwd.range::<Value, _>((lo, hi)) {
            out.extend(set.iter().copied());
        }
        out
    }

    fn choose(&self, docids: &DocSet, options: &SortOptions) -> SortType {
        if options.sort_type != SortType::Auto {
            return options.sort_type;
        }
        let rlen = docids.len();
        let numdocs = self.rev.len().max(1);
        let small = |limit: usize| limit.saturating_mul(4) < rlen;
        match options.limit {
            // Walking the whole index is cheap when the result covers most
            // of it and we can stop early.
            Some(limit) if rlen.saturating_mul(2) > numdocs && small(limit) => {
                SortType::FwScan
            }
            Some(limit) if small(limit) => SortType::NBest,
            _ => SortType::Timsort,
        }
    }

    fn sort_timsort(
        &self,
        docids: &DocSet,
        options: &SortOptions,
    ) -> Vec<DocId> {
        let mut pairs: Vec<(&Value, DocId)> = docids
            .iter()
            .filter_map(|id| self.rev.get(id).map(|v| (v, *id)))
            .collect();
        pairs.sort();
        if options.reverse {
            pairs.reverse();
        }
        let limit = options.limit.unwrap_or(usize::MAX);
        pairs.into_iter().take(limit).map(|(_, id)| id).collect()
    }

    fn sort_nbest(
        &self,
        docids: &DocSet,
        options: &SortOptions,
    ) -> Vec<DocId> {
        let limit = options.limit.unwrap_or(usize::MAX);
        if limit == 0 {
            return Vec::new();
        }
        let candidates = docids
            .iter()
            .filter_map(|id| self.rev.get(id).map(|v| (v, *id)));
        let mut out: Vec<(&Value, DocId)> = if options.reverse {
            // Min-heap of the largest entries.
            let mut heap = BinaryHeap::new();
            for pair in candidates {
                heap.push(std::cmp::Reverse(pair));
                if heap.len() > limit {
                    heap.pop();
                }
            }
            let mut v: Vec<_> = heap.into_iter().map(|r| r.0).collect();
            v.sort_by(|a, b| b.cmp(a));
            v
        } else {
            let mut heap = BinaryHeap::new();
            for pair in candidates {
                heap.push(pair);
                if heap.len() > limit {
                    heap.pop();
                }
            }
            heap.into_sorted_vec()
        };
        out.truncate(limit);
        out.into_iter().map(|(_, id)| id).collect()
    }

    fn sort_fwscan(
        &self,
        docids: &DocSet,
        options: &SortOptions,
    ) -> Vec<DocId> {
        let limit = options.limit.unwrap_or(usize::MAX);
        let mut out = Vec::new();
        if limit == 0 {
            return out;
        }
        let mut keep = |id: &DocId| {
            if docids.contains(id) {
                out.push(*id);
            }
            out.len() < limit
        };
        if options.reverse {
            'scan: for set in self.fwd.values().rev() {
                for id in set.iter().rev() {
                    if !keep(id) {
                        break 'scan;
                    }
                }
            }
        } else {
            'scan: for set in self.fwd.values() {
                for id in set {
                    if !keep(id) {
                        break 'scan;
                    }
                }
            }
        }
        out
    }
}

impl CatalogIndex for FieldIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Field
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
        self.remove(docid);
        match self.discriminator.extract(resource) {
            Some(value) => {
                self.not_indexed.remove(&docid);
                self.fwd.entry(value.clone()).or_default().insert(docid);
                self.rev.insert(docid, value);
            }
            None => {
                self.not_indexed.insert(docid);
            }
        }
        Ok(())
    }

    fn unindex_doc(&mut self, docid: DocId) -> Result<()> {
        self.remove(docid);
        self.not_indexed.remove(&docid);
        Ok(())
    }

    fn reindex_doc(
        &mut self,
        docid: DocId,
        resource: &dyn Resource,
    ) -> Result<()> {
        // Skip the churn when the value did not change.
        if let Some(value) = self.discriminator.extract(resource)
            && self.rev.get(&docid) == Some(&value)
        {
            return Ok(());
        }
        self.index_doc(docid, resource)
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
        match fragment {
            Fragment::Eq(v) => Ok(self.fwd.get(v).cloned().unwrap_or_default()),
            Fragment::Range { min, max } => {
                Ok(self.range(min.as_ref(), max.as_ref()))
            }
            Fragment::AnyOf(values) => Ok(values
                .iter()
                .filter_map(|v| self.fwd.get(v))
                .flatten()
                .copied()
                .collect()),
            Fragment::AllOf(values) => {
                let sets = values
                    .iter()
                    .map(|v| self.fwd.get(v).cloned().unwrap_or_default())
                    .collect();
                Ok(intersect_all(sets).unwrap_or_default())
            }
            other => Err(unsupported(IndexKind::Field, other)),
        }
    }

    fn sort(
        &self,
        docids: &DocSet,
        options: &SortOptions,
    ) -> Result<Vec<DocId>> {
        if options.sort_type == SortType::NBest && options.limit.is_none() {
            return Err(Error::InvalidQuery {
                index: IndexKind::Field.to_string(),
                reason: "nbest sorting requires a limit".into(),
            });
        }
        let strategy = self.choose(docids, options);
        debug!(?strategy, results = docids.len(), "sorting field index");
        Ok(match strategy {
            SortType::NBest => self.sort_nbest(docids, options),
            SortType::FwScan => self.sort_fwscan(docids, options),
            SortType::Timsort | SortType::Auto => {
                self.sort_timsort(docids, options)
            }
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
