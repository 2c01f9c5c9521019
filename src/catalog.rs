//! Catalogs: named sets of indexes plus the ids they have seen.
//!
//! Every index mutation goes through [`Catalog::index_doc`],
//! [`Catalog::reindex_doc`] or [`Catalog::unindex_doc`], which fan out to
//! each index and either apply the change right away or queue an
//! [`Action`] for commit time, depending on the index's [`ActionMode`].

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use regex::Regex;
use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    action::{
        Action,
        ActionKind,
        IndexKey,
    },
    config::{
        CatalogConfig,
        IndexPlan,
    },
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
    },
    objectmap::ObjectMap,
    resource::{
        Resource,
        path_string,
        resource_path,
    },
    txn::{
        ActionProcessor,
        ActionQueue,
        ActionTarget,
        QueueSavepoint,
        Transaction,
    },
};

pub const DEFAULT_COMMIT_INTERVAL: usize = 200;

/// Where progress lines from bulk operations go.
#[derive(Default)]
pub enum Output<'a> {
    /// `tracing` at info level, errors at warn.
    #[default]
    Log,
    Quiet,
    Sink(&'a mut dyn FnMut(&str)),
}

impl Output<'_> {
    fn line(&mut self, msg: &str) {
        match self {
            Output::Log => info!("{msg}"),
            Output::Quiet => {}
            Output::Sink(sink) => sink(msg),
        }
    }

    fn error(&mut self, msg: &str) {
        match self {
            Output::Log => warn!("{msg}"),
            Output::Quiet => {}
            Output::Sink(sink) => sink(msg),
        }
    }
}

impl fmt::Debug for Output<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Output::Log => "Log",
            Output::Quiet => "Quiet",
            Output::Sink(_) => "Sink(..)",
        })
    }
}

#[derive(Debug, Clone)]
pub struct ReindexOptions {
    /// Report what would be reindexed without touching any index.
    pub dry_run: bool,
    /// Objects between intermediate commits.
    pub commit_interval: usize,
    /// Restrict to these indexes; `None` reindexes all of them.
    pub indexes: Option<Vec<String>>,
    /// Only objects whose path matches at its start.
    pub path_re: Option<Regex>,
}

impl Default for ReindexOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            commit_interval: DEFAULT_COMMIT_INTERVAL,
            indexes: None,
            path_re: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReindexReport {
    pub reindexed: usize,
    pub missing_path: usize,
    pub missing_object: usize,
    pub commits: usize,
    pub aborts: usize,
    /// Commits that lost to a concurrent writer and were aborted.
    pub conflicts: usize,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub dry_run: bool,
    /// Rebuild every declared index, not only the changed ones.
    pub replace: bool,
    /// Reindex the added and replaced indexes afterwards.
    pub reindex: bool,
    pub reindex_options: ReindexOptions,
}

/// Pending queue snapshots taken by [`Catalog::savepoint`].
#[derive(Debug, Clone)]
pub struct CatalogSavepoint {
    queues: BTreeMap<String, QueueSavepoint>,
}

pub struct Catalog {
    name: String,
    indexes: BTreeMap<String, Box<dyn CatalogIndex>>,
    objectids: DocSet,
    queues: BTreeMap<String, ActionQueue>,
    objectmap: Arc<dyn ObjectMap>,
}

impl fmt::Debug for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catalog")
            .field("name", &self.name)
            .field("indexes", &self.indexes.keys().collect::<Vec<_>>())
            .field("objectids", &self.objectids.len())
            .finish_non_exhaustive()
    }
}

impl Catalog {
    pub fn new(name: &str, objectmap: Arc<dyn ObjectMap>) -> Self {
        Self {
            name: name.to_string(),
            indexes: BTreeMap::new(),
            objectids: DocSet::new(),
            queues: BTreeMap::new(),
            objectmap,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Every id indexed into this catalog and not since unindexed.
    pub fn objectids(&self) -> &DocSet {
        &self.objectids
    }

    pub fn objectmap(&self) -> &Arc<dyn ObjectMap> {
        &self.objectmap
    }

    pub fn get_index(&self, name: &str) -> Result<&dyn CatalogIndex> {
        self.indexes
            .get(name)
            .map(Box::as_ref)
            .ok_or_else(|| Error::UnknownIndex(name.to_string()))
    }

    /// Add `index` under `name`, replacing any index already there along
    /// with its pending actions.
    pub fn add_index(&mut self, name: &str, index: Box<dyn CatalogIndex>) {
        self.queues.remove(name);
        if self.indexes.insert(name.to_string(), index).is_some() {
            debug!(catalog = %self.name, index = name, "index replaced");
        }
    }

    pub fn remove_index(
        &mut self,
        name: &str,
    ) -> Option<Box<dyn CatalogIndex>> {
        self.queues.remove(name);
        self.indexes.remove(name)
    }

    pub fn index_names(&self) -> Vec<String> {
        self.indexes.keys().cloned().collect()
    }

    /// Actions queued for `index` in the current transaction.
    pub fn pending(&self, index: &str) -> &[Action] {
        self.queues.get(index).map_or(&[], ActionQueue::actions)
    }

    fn route(
        &mut self,
        index_name: &str,
        kind: ActionKind,
        oid: DocId,
        resource: Option<&Arc<dyn Resource>>,
    ) -> Result<()> {
        let index = self
            .indexes
            .get_mut(index_name)
            .ok_or_else(|| Error::UnknownIndex(index_name.to_string()))?;
        let mode = index.action_mode();
        let key = IndexKey::new(&self.name, index_name);
        let resource = resource.cloned();
        let action = match kind {
            ActionKind::Add => Action::add(key, oid, mode, resource),
            ActionKind::Change => Action::change(key, oid, mode, resource),
            ActionKind::Remove => Action::remove(key, oid, mode),
        };
        if mode == ActionMode::Immediate {
            return action.execute(index.as_mut(), self.objectmap.as_ref());
        }
        let queue = self.queues.entry(index_name.to_string()).or_default();
        if queue.register() {
            debug!(index = %action.index, "joined transaction");
        }
        queue.add(action);
        Ok(())
    }

    fn fan_out(
        &mut self,
        kind: ActionKind,
        oid: DocId,
        resource: Option<&Arc<dyn Resource>>,
    ) -> Result<()> {
        for name in self.index_names() {
            self.route(&name, kind, oid, resource)?;
        }
        Ok(())
    }

    pub fn index_doc(
        &mut self,
        oid: DocId,
        resource: Arc<dyn Resource>,
    ) -> Result<()> {
        self.fan_out(ActionKind::Add, oid, Some(&resource))?;
        self.objectids.insert(oid);
        Ok(())
    }

    /// Index `resource` under its own oid.
    pub fn index_resource(
        &mut self,
        resource: Arc<dyn Resource>,
    ) -> Result<()> {
        let oid = resource
            .oid()
            .ok_or_else(|| Error::InvalidDocId(resource_path(&*resource)))?;
        self.index_doc(oid, resource)
    }

    /// Unindexing an id the catalog does not know is not an error.
    pub fn unindex_doc(&mut self, oid: DocId) -> Result<()> {
        self.fan_out(ActionKind::Remove, oid, None)?;
        self.objectids.remove(&oid);
        Ok(())
    }

    pub fn reindex_doc(
        &mut self,
        oid: DocId,
        resource: Arc<dyn Resource>,
    ) -> Result<()> {
        if !self.objectids.contains(&oid) {
            return self.index_doc(oid, resource);
        }
        self.fan_out(ActionKind::Change, oid, Some(&resource))
    }

    /// Clear every index and forget every id.
    pub fn reset(&mut self) -> Result<()> {
        for index in self.indexes.values_mut() {
            index.reset()?;
        }
        self.objectids.clear();
        Ok(())
    }

    /// Run the actions queued in this transaction.
    ///
    /// With `all` unset, deferred actions go to `processor` when it is
    /// active.
    pub fn flush(
        &mut self,
        all: bool,
        processor: Option<&dyn ActionProcessor>,
    ) -> Result<()> {
        let Self {
            name,
            indexes,
            queues,
            objectmap,
            ..
        } = self;
        for (index_name, queue) in queues.iter_mut() {
            if !queue.is_registered() {
                continue;
            }
            let Some(index) = indexes.get_mut(index_name) else {
                warn!(
                    catalog = %name,
                    index = %index_name,
                    dropped = queue.len(),
                    "pending actions for a missing index"
                );
                queue.take();
                continue;
            };
            queue.flush(all, processor, |action| {
                action.execute(index.as_mut(), objectmap.as_ref())
            })?;
        }
        Ok(())
    }

    /// Flush pending actions, then commit `txn`.
    pub fn commit(
        &mut self,
        txn: &dyn Transaction,
        processor: Option<&dyn ActionProcessor>,
    ) -> Result<()> {
        self.flush(false, processor)?;
        txn.commit()
    }

    /// Discard pending actions and abort `txn`.
    pub fn abort(&mut self, txn: &dyn Transaction) -> Result<()> {
        for queue in self.queues.values_mut() {
            queue.take();
        }
        txn.abort()
    }

    pub fn savepoint(&self) -> CatalogSavepoint {
        CatalogSavepoint {
            queues: self
                .queues
                .iter()
                .map(|(name, queue)| (name.clone(), queue.savepoint()))
                .collect(),
        }
    }

    /// Restore pending actions to what they were at `savepoint`.
    ///
    /// Immediate-mode changes made since are not undone.
    pub fn rollback(&mut self, mut savepoint: CatalogSavepoint) {
        for (name, queue) in &mut self.queues {
            match savepoint.queues.remove(name) {
                Some(snapshot) => queue.rollback(snapshot),
                None => {
                    queue.take();
                }
            }
        }
    }

    fn commit_or_abort(
        &mut self,
        dry_run: bool,
        txn: &dyn Transaction,
        processor: Option<&dyn ActionProcessor>,
        output: &mut Output<'_>,
        report: &mut ReindexReport,
    ) -> Result<()> {
        if dry_run {
            output.line("*** aborting ***");
            report.aborts += 1;
            return self.abort(txn);
        }
        output.line("*** committing ***");
        match self.commit(txn, processor) {
            Ok(()) => {
                report.commits += 1;
                Ok(())
            }
            Err(Error::Conflict(reason)) => {
                output.error(&format!("conflict on commit: {reason}"));
                report.conflicts += 1;
                report.aborts += 1;
                self.abort(txn)
            }
            Err(err) => Err(err),
        }
    }

    /// Reindex every object this catalog knows about.
    ///
    /// Ids whose object or path can no longer be resolved are reported and
    /// skipped. A final commit (or abort, for a dry run) always happens.
    pub fn reindex(
        &mut self,
        options: &ReindexOptions,
        txn: &dyn Transaction,
        processor: Option<&dyn ActionProcessor>,
        output: &mut Output<'_>,
    ) -> Result<ReindexReport> {
        let mut report = ReindexReport::default();
        let interval = options.commit_interval.max(1);

        if let Some(names) = &options.indexes {
            for name in names {
                self.get_index(name)?;
            }
            output.line(&format!(
                "{} reindexing only indexes {names:?}",
                self.name
            ));
        }

        let mut i = 1;
        let oids: Vec<DocId> = self.objectids.iter().copied().collect();
        for oid in oids {
            let Some(resource) = self.objectmap.object_for(oid) else {
                match self.objectmap.path_for(oid) {
                    None => {
                        report.missing_path += 1;
                        output.error(&format!(
                            "error: no path for objectid {oid} in object map"
                        ));
                    }
                    Some(path) => {
                        report.missing_object += 1;
                        output.error(&format!(
                            "error: object at path {} not found",
                            path_string(&path)
                        ));
                    }
                }
                continue;
            };
            let path = resource_path(&*resource);
            if let Some(re) = &options.path_re
                && !re.find(&path).is_some_and(|m| m.start() == 0)
            {
                continue;
            }
            output.line(&format!("{} reindexing {path}", self.name));

            if !options.dry_run {
                match &options.indexes {
                    None => self.reindex_doc(oid, resource)?,
                    Some(names) => {
                        for name in names {
                            self.route(
                                name,
                                ActionKind::Change,
                                oid,
                                Some(&resource),
                            )?;
                        }
                    }
                }
            }
            report.reindexed += 1;

            if i % interval == 0 {
                self.commit_or_abort(
                    options.dry_run,
                    txn,
                    processor,
                    output,
                    &mut report,
                )?;
            }
            i += 1;
        }

        self.commit_or_abort(
            options.dry_run,
            txn,
            processor,
            output,
            &mut report,
        )?;
        Ok(report)
    }

    /// Bring the index set in line with this catalog's declared factory.
    ///
    /// Returns whether anything was (or, for a dry run, would be) changed.
    pub fn update_indexes(
        &mut self,
        config: &CatalogConfig,
        options: &UpdateOptions,
        txn: &dyn Transaction,
        processor: Option<&dyn ActionProcessor>,
        output: &mut Output<'_>,
    ) -> Result<bool> {
        let factory = config.factory(&self.name).ok_or_else(|| {
            Error::NotFound {
                kind: "catalog factory",
                name: self.name.clone(),
            }
        })?;
        let plan = factory.plan(self, options.replace);
        if plan.is_empty() {
            output.line(&format!(
                "{} update_indexes: no indexes added or removed",
                self.name
            ));
            return Ok(false);
        }
        self.report_plan(&plan, output);

        let mut report = ReindexReport::default();
        if options.dry_run {
            self.commit_or_abort(true, txn, processor, output, &mut report)?;
            return Ok(true);
        }

        factory.apply(self, config, &plan)?;
        let touched = plan.touched();
        if options.reindex && !touched.is_empty() {
            let reindex = ReindexOptions {
                dry_run: false,
                indexes: Some(touched),
                ..options.reindex_options.clone()
            };
            // Reindexing ends with its own commit.
            self.reindex(&reindex, txn, processor, output)?;
            return Ok(true);
        }
        self.commit_or_abort(false, txn, processor, output, &mut report)?;
        Ok(true)
    }

    fn report_plan(&self, plan: &IndexPlan, output: &mut Output<'_>) {
        for name in &plan.added {
            output.line(&format!("{}: adding index {name}", self.name));
        }
        for name in &plan.replaced {
            output.line(&format!("{}: replacing index {name}", self.name));
        }
        for name in &plan.removed {
            output.line(&format!("{}: removing index {name}", self.name));
        }
    }
}

impl ActionTarget for Catalog {
    fn execute(&mut self, action: &Action) -> Result<()> {
        if action.index.catalog != self.name {
            return Err(Error::NotFound {
                kind: "catalog",
                name: action.index.catalog.clone(),
            });
        }
        let Some(index) = self.indexes.get_mut(&action.index.index) else {
            warn!(%action, "index no longer exists, skipping");
            return Ok(());
        };
        action.execute(index.as_mut(), self.objectmap.as_ref())
    }
}

/// Every catalog of a site, and the content-event hooks that keep them
/// current.
#[derive(Debug)]
pub struct Catalogs {
    catalogs: BTreeMap<String, Catalog>,
    objectmap: Arc<dyn ObjectMap>,
    config: Arc<CatalogConfig>,
}

impl Catalogs {
    pub fn new(
        objectmap: Arc<dyn ObjectMap>,
        config: Arc<CatalogConfig>,
    ) -> Self {
        Self {
            catalogs: BTreeMap::new(),
            objectmap,
            config,
        }
    }

    pub fn config(&self) -> &CatalogConfig {
        &self.config
    }

    /// Create catalog `name`, building its declared indexes when
    /// `update_indexes` is set.
    pub fn add_catalog(
        &mut self,
        name: &str,
        update_indexes: bool,
    ) -> Result<&mut Catalog> {
        if self.catalogs.contains_key(name) {
            return Err(Error::Config(format!(
                "catalog {name:?} already exists"
            )));
        }
        let mut catalog = Catalog::new(name, Arc::clone(&self.objectmap));
        if update_indexes && let Some(factory) = self.config.factory(name) {
            let plan = factory.replace(&mut catalog, &self.config)?;
            info!(catalog = name, added = plan.added.len(), "catalog created");
        }
        Ok(self.catalogs.entry(name.to_string()).or_insert(catalog))
    }

    pub fn get(&self, name: &str) -> Result<&Catalog> {
        self.catalogs.get(name).ok_or_else(|| Error::NotFound {
            kind: "catalog",
            name: name.to_string(),
        })
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Catalog> {
        self.catalogs.get_mut(name).ok_or_else(|| Error::NotFound {
            kind: "catalog",
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> Vec<String> {
        self.catalogs.keys().cloned().collect()
    }

    /// Index `resource` and everything below it in every catalog.
    pub fn object_added(&mut self, resource: &Arc<dyn Resource>) -> Result<()> {
        let Some(oid) = resource.oid() else {
            return Err(Error::InvalidDocId(resource_path(&**resource)));
        };
        let subtree = match self.objectmap.path_for(oid) {
            Some(path) => self.objectmap.path_lookup(&path, None, true),
            None => DocSet::from([oid]),
        };
        for node_oid in subtree {
            let node = if node_oid == oid {
                Arc::clone(resource)
            } else {
                let Some(node) = self.objectmap.object_for(node_oid) else {
                    debug!(oid = node_oid, "descendant vanished");
                    continue;
                };
                node
            };
            if !self.config.is_catalogable(node.content_type()) {
                continue;
            }
            for catalog in self.catalogs.values_mut() {
                catalog.index_doc(node_oid, Arc::clone(&node))?;
            }
        }
        Ok(())
    }

    /// Unindex `removed` from every catalog that knows the ids.
    pub fn object_removed(&mut self, removed: &DocSet) -> Result<()> {
        for catalog in self.catalogs.values_mut() {
            let known: Vec<DocId> =
                removed.intersection(&catalog.objectids).copied().collect();
            for oid in known {
                catalog.unindex_doc(oid)?;
            }
        }
        Ok(())
    }

    /// Reindex one node, not its descendants.
    pub fn object_modified(
        &mut self,
        resource: &Arc<dyn Resource>,
    ) -> Result<()> {
        if !self.config.is_catalogable(resource.content_type()) {
            return Ok(());
        }
        let Some(oid) = resource.oid() else {
            return Err(Error::InvalidDocId(resource_path(&**resource)));
        };
        for catalog in self.catalogs.values_mut() {
            catalog.reindex_doc(oid, Arc::clone(resource))?;
        }
        Ok(())
    }

    /// Flush every catalog, then commit `txn` once.
    pub fn commit(
        &mut self,
        txn: &dyn Transaction,
        processor: Option<&dyn ActionProcessor>,
    ) -> Result<()> {
        for catalog in self.catalogs.values_mut() {
            catalog.flush(false, processor)?;
        }
        txn.commit()
    }

    pub fn abort(&mut self, txn: &dyn Transaction) -> Result<()> {
        for catalog in self.catalogs.values_mut() {
            for queue in catalog.queues.values_mut() {
                queue.take();
            }
        }
        txn.abort()
    }
}

impl ActionTarget for Catalogs {
    fn execute(&mut self, action: &Action) -> Result<()> {
        match self.catalogs.get_mut(&action.index.catalog) {
            Some(catalog) => catalog.execute(action),
            None => {
                warn!(%action, "catalog no longer exists, skipping");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{
            IndexArgs,
            IndexFactory,
        },
        discriminators::Discriminator,
        index::{
            FieldIndex,
            Fragment,
            IndexKind,
            IndexMeta,
            KeywordIndex,
        },
        objectmap::MemoryObjectMap,
        resource::Content,
        txn::CountingTransaction,
        value::Value,
    };

    fn meta(action_mode: ActionMode) -> IndexMeta {
        IndexMeta {
            action_mode,
            fingerprint: 0,
        }
    }

    fn catalog_with(map: Arc<MemoryObjectMap>, mode: ActionMode) -> Catalog {
        let mut catalog = Catalog::new("app", map);
        catalog.add_index(
            "title",
            Box::new(FieldIndex::new(
                Discriminator::attribute("title"),
                meta(mode),
            )),
        );
        catalog.add_index(
            "tags",
            Box::new(KeywordIndex::new(
                Discriminator::attribute("tags"),
                meta(ActionMode::Immediate),
            )),
        );
        catalog
    }

    fn titled(oid: DocId, title: &str) -> Arc<dyn Resource> {
        Content::new(oid)
            .named(&format!("n{oid}"))
            .with("title", title)
            .with("tags", vec!["a"])
            .into_arc()
    }

    fn eq(catalog: &Catalog, index: &str, value: &str) -> DocSet {
        catalog
            .get_index(index)
            .unwrap()
            .apply(&Fragment::Eq(Value::from(value)))
            .unwrap()
    }

    #[test]
    fn fan_out_and_idempotent_unindex() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        catalog.index_doc(1, titled(1, "hello")).unwrap();
        assert!(catalog.objectids().contains(&1));
        for name in catalog.index_names() {
            let ids = catalog.get_index(&name).unwrap().docids().unwrap();
            assert!(ids.contains(&1), "{name} holds 1");
        }

        catalog.unindex_doc(1).unwrap();
        catalog.unindex_doc(1).unwrap();
        assert!(catalog.objectids().is_empty());
        assert!(eq(&catalog, "title", "hello").is_empty());
    }

    #[test]
    fn reindex_doc_of_unknown_id_indexes_it() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        catalog.reindex_doc(5, titled(5, "five")).unwrap();
        assert!(catalog.objectids().contains(&5));
        catalog.reindex_doc(5, titled(5, "cinq")).unwrap();
        assert_eq!(eq(&catalog, "title", "cinq"), DocSet::from([5]));
        assert!(eq(&catalog, "title", "five").is_empty());
    }

    #[test]
    fn atcommit_actions_wait_for_commit() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::AtCommit);
        let txn = CountingTransaction::new();
        catalog.index_doc(1, titled(1, "x")).unwrap();
        catalog.reindex_doc(1, titled(1, "y")).unwrap();
        assert_eq!(catalog.pending("title").len(), 2);
        assert!(eq(&catalog, "title", "y").is_empty());

        catalog.commit(&txn, None).unwrap();
        assert_eq!(eq(&catalog, "title", "y"), DocSet::from([1]));
        assert!(catalog.pending("title").is_empty());
        assert_eq!(txn.commits(), 1);
    }

    #[test]
    fn abort_and_rollback_discard_pending() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::AtCommit);
        let txn = CountingTransaction::new();
        catalog.index_doc(1, titled(1, "x")).unwrap();
        let sp = catalog.savepoint();
        catalog.index_doc(2, titled(2, "z")).unwrap();
        catalog.rollback(sp);
        assert_eq!(catalog.pending("title").len(), 1);

        catalog.abort(&txn).unwrap();
        assert!(catalog.pending("title").is_empty());
        catalog.commit(&txn, None).unwrap();
        assert!(eq(&catalog, "title", "x").is_empty());
    }

    #[test]
    fn reset_clears_indexes_and_ids() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        catalog.index_doc(1, titled(1, "x")).unwrap();
        catalog.reset().unwrap();
        assert!(catalog.objectids().is_empty());
        assert!(eq(&catalog, "title", "x").is_empty());
    }

    #[test]
    fn unregistered_resource_is_rejected() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        let err = catalog
            .index_resource(Content::unregistered().into_arc())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocId(_)));
        assert!(catalog.objectids().is_empty());
    }

    #[test]
    fn reindex_reports_and_commits_on_interval() {
        let map = Arc::new(MemoryObjectMap::new());
        let root = Content::new(100).into_arc();
        for oid in 1..=3 {
            let child = Content::new(oid)
                .named(&format!("doc{oid}"))
                .within(&root)
                .with("title", "t")
                .into_arc();
            map.add(child).unwrap();
        }
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        for oid in 1..=3 {
            catalog.objectids.insert(oid);
        }
        let txn = CountingTransaction::new();
        let mut lines = Vec::new();
        let mut sink = |l: &str| lines.push(l.to_string());
        let options = ReindexOptions {
            commit_interval: 2,
            ..ReindexOptions::default()
        };
        let report = catalog
            .reindex(&options, &txn, None, &mut Output::Sink(&mut sink))
            .unwrap();
        assert_eq!(report.reindexed, 3);
        assert_eq!(report.commits, 2);
        assert_eq!(txn.commits(), 2);
        assert_eq!(lines[0], "app reindexing /doc1");
        assert_eq!(lines[2], "*** committing ***");
        assert_eq!(eq(&catalog, "title", "t").len(), 3);
    }

    #[test]
    fn reindex_path_filter_and_subset() {
        let map = Arc::new(MemoryObjectMap::new());
        let root = Content::new(100).into_arc();
        let keep = Content::new(1)
            .named("keep")
            .within(&root)
            .with("title", "k")
            .into_arc();
        let skip = Content::new(2)
            .named("skip")
            .within(&root)
            .with("title", "s")
            .into_arc();
        map.add(keep).unwrap();
        map.add(skip).unwrap();
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        catalog.objectids.extend([1, 2]);
        let txn = CountingTransaction::new();
        let options = ReindexOptions {
            indexes: Some(vec!["title".into()]),
            path_re: Some(Regex::new("/ke").unwrap()),
            ..ReindexOptions::default()
        };
        let report = catalog
            .reindex(&options, &txn, None, &mut Output::Quiet)
            .unwrap();
        assert_eq!(report.reindexed, 1);
        assert_eq!(eq(&catalog, "title", "k"), DocSet::from([1]));
        assert!(eq(&catalog, "title", "s").is_empty());
        let tags = catalog.get_index("tags").unwrap();
        assert!(tags.docids().unwrap().is_empty());
    }

    #[test]
    fn reindex_of_unknown_index_fails_up_front() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        let txn = CountingTransaction::new();
        let options = ReindexOptions {
            indexes: Some(vec!["nope".into()]),
            ..ReindexOptions::default()
        };
        let err = catalog
            .reindex(&options, &txn, None, &mut Output::Quiet)
            .unwrap_err();
        assert!(matches!(err, Error::UnknownIndex(_)));
        assert_eq!(txn.commits() + txn.aborts(), 0);
    }

    #[test]
    fn reindex_conflict_becomes_abort() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        let txn = CountingTransaction::new();
        txn.conflict_next(1);
        let report = catalog
            .reindex(&ReindexOptions::default(), &txn, None, &mut Output::Quiet)
            .unwrap();
        assert_eq!(report.conflicts, 1);
        assert_eq!(txn.aborts(), 1);
    }

    fn config_for(indexes: &[(&str, IndexKind)]) -> CatalogConfig {
        let mut config = CatalogConfig::default();
        for (name, kind) in indexes {
            config
                .declare(
                    "app",
                    name,
                    IndexFactory::new(*kind, IndexArgs::default()),
                )
                .unwrap();
        }
        config
    }

    #[test]
    fn update_indexes_adds_and_removes() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        let config = config_for(&[
            ("title", IndexKind::Field),
            ("body", IndexKind::Text),
        ]);
        let txn = CountingTransaction::new();
        let mut lines = Vec::new();
        let mut sink = |l: &str| lines.push(l.to_string());

        let changed = catalog
            .update_indexes(
                &config,
                &UpdateOptions::default(),
                &txn,
                None,
                &mut Output::Sink(&mut sink),
            )
            .unwrap();
        assert!(changed);
        assert_eq!(catalog.index_names(), vec!["body", "title"]);
        assert!(lines.contains(&"app: removing index tags".to_string()));
        assert_eq!(txn.commits(), 1);

        let mut lines = Vec::new();
        let mut sink = |l: &str| lines.push(l.to_string());
        let changed = catalog
            .update_indexes(
                &config,
                &UpdateOptions::default(),
                &txn,
                None,
                &mut Output::Sink(&mut sink),
            )
            .unwrap();
        assert!(!changed);
        assert_eq!(
            lines,
            vec!["app update_indexes: no indexes added or removed"]
        );
    }

    #[test]
    fn update_indexes_with_reindex_commits_once() {
        let map = Arc::new(MemoryObjectMap::new());
        let root = Content::new(100).into_arc();
        let doc = Content::new(1)
            .named("doc")
            .within(&root)
            .with("title", "t")
            .with("body", "some words")
            .into_arc();
        map.add(doc).unwrap();
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        catalog.objectids.insert(1);
        let config = config_for(&[
            ("title", IndexKind::Field),
            ("body", IndexKind::Text),
        ]);
        let txn = CountingTransaction::new();
        let options = UpdateOptions {
            reindex: true,
            ..UpdateOptions::default()
        };
        let changed = catalog
            .update_indexes(&config, &options, &txn, None, &mut Output::Quiet)
            .unwrap();
        assert!(changed);
        assert_eq!(txn.commits(), 1);
        let body = catalog.get_index("body").unwrap();
        assert_eq!(
            body.apply(&Fragment::Text("words".into())).unwrap(),
            DocSet::from([1])
        );
    }

    #[test]
    fn update_indexes_dry_run_changes_nothing() {
        let map = Arc::new(MemoryObjectMap::new());
        let mut catalog = catalog_with(map, ActionMode::Immediate);
        let config = config_for(&[("body", IndexKind::Text)]);
        let txn = CountingTransaction::new();
        let options = UpdateOptions {
            dry_run: true,
            ..UpdateOptions::default()
        };
        let changed = catalog
            .update_indexes(&config, &options, &txn, None, &mut Output::Quiet)
            .unwrap();
        assert!(changed);
        assert_eq!(catalog.index_names(), vec!["tags", "title"]);
        assert_eq!(txn.aborts(), 1);
        assert_eq!(txn.commits(), 0);
    }

    #[test]
    fn catalogs_route_actions_by_name() {
        let map = Arc::new(MemoryObjectMap::new());
        let config = Arc::new(config_for(&[("title", IndexKind::Field)]));
        let mut catalogs = Catalogs::new(map, config);
        catalogs.add_catalog("app", true).unwrap();
        assert!(catalogs.add_catalog("app", true).is_err());

        let key = IndexKey::new("app", "title");
        let action =
            Action::add(key, 9, ActionMode::Deferred, Some(titled(9, "nine")));
        catalogs.execute(&action).unwrap();
        let catalog = catalogs.get("app").unwrap();
        assert_eq!(eq(catalog, "title", "nine"), DocSet::from([9]));

        let stray =
            Action::remove(IndexKey::new("gone", "x"), 9, ActionMode::Deferred);
        catalogs.execute(&stray).unwrap();
        assert!(catalogs.get("gone").is_err());
    }
}
