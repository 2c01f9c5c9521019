//! Candidate index declarations and the factories that build indexes.
//!
//! A [`CatalogConfig`] is assembled once at startup, from code or from a
//! JSON document, and passed to whoever builds catalogs. Declaring the same
//! index twice must agree:
//!
//! | existing | new | outcome |
//! |---|---|---|
//! | same factory and args | | no-op |
//! | same factory, args | no args | existing kept |
//! | same factory, no args | args | new wins |
//! | anything else | | [`Error::ConflictingIndex`] |

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    hash::{
        DefaultHasher,
        Hash,
        Hasher,
    },
    path::Path,
    sync::Arc,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::debug;

use crate::{
    catalog::Catalog,
    discriminators::{
        self,
        Discriminator,
        ExtractFn,
        Extractor,
    },
    error::{
        Error,
        Result,
    },
    index::{
        ActionMode,
        AllowedIndex,
        CatalogIndex,
        FacetIndex,
        FieldIndex,
        IndexKind,
        IndexMeta,
        KeywordIndex,
        PathIndex,
        TextIndex,
    },
    objectmap::ObjectMap,
    resource::Resource,
    security::{
        GrantTable,
        Security,
    },
    value::Value,
};

pub const SYSTEM_CATALOG: &str = "system";

/// Factory arguments. Every field is optional; an index declared with none
/// of them is a placeholder any concrete declaration may refine.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(deny_unknown_fields)]
pub struct IndexArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_mode: Option<ActionMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facets: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub depth: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub include_origin: Option<bool>,
    /// Attribute read when no index view applies. Defaults to the index
    /// name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub discriminator: Option<String>,
}

impl IndexArgs {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    pub fn mode(mut self, mode: ActionMode) -> Self {
        self.action_mode = Some(mode);
        self
    }

    fn normalized(&self) -> Self {
        let sorted = |list: &Option<Vec<String>>| {
            list.as_ref().map(|items| {
                let set: BTreeSet<&String> = items.iter().collect();
                set.into_iter().cloned().collect()
            })
        };
        Self {
            facets: sorted(&self.facets),
            permissions: sorted(&self.permissions),
            ..self.clone()
        }
    }
}

/// How to build one index.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct IndexFactory {
    #[serde(rename = "factory")]
    pub kind: IndexKind,
    #[serde(skip_serializing_if = "IndexArgs::is_empty")]
    pub args: IndexArgs,
}

impl IndexFactory {
    pub fn new(kind: IndexKind, args: IndexArgs) -> Self {
        Self {
            kind,
            args: args.normalized(),
        }
    }

    pub fn of(kind: IndexKind) -> Self {
        Self::new(kind, IndexArgs::default())
    }

    /// Identifies the declaration an index was built from, so a changed
    /// declaration can be detected.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.kind.hash(&mut hasher);
        self.args.normalized().hash(&mut hasher);
        hasher.finish()
    }

    pub fn build(
        &self,
        catalog: &str,
        index: &str,
        config: &CatalogConfig,
        objectmap: &Arc<dyn ObjectMap>,
    ) -> Result<Box<dyn CatalogIndex>> {
        let meta = IndexMeta {
            action_mode: self.args.action_mode.unwrap_or_default(),
            fingerprint: self.fingerprint(),
        };
        let discriminator = || {
            let attr = self.args.discriminator.as_deref().unwrap_or(index);
            let mut chain = config.views_for(catalog, index);
            chain.push(Extractor::Attribute(attr.to_string()));
            Discriminator::new(chain)
        };
        let built: Box<dyn CatalogIndex> = match self.kind {
            IndexKind::Field => {
                Box::new(FieldIndex::new(discriminator(), meta))
            }
            IndexKind::Keyword => {
                Box::new(KeywordIndex::new(discriminator(), meta))
            }
            IndexKind::Text => Box::new(TextIndex::new(discriminator(), meta)?),
            IndexKind::Facet => Box::new(FacetIndex::new(
                discriminator(),
                self.args.facets.clone().unwrap_or_default(),
                meta,
            )),
            IndexKind::Allowed => Box::new(AllowedIndex::new(
                config.security(),
                self.args.permissions.clone().unwrap_or_default(),
                meta,
            )),
            IndexKind::Path => Box::new(
                PathIndex::new(Arc::clone(objectmap), meta).with_defaults(
                    self.args.depth,
                    self.args.include_origin.unwrap_or(true),
                ),
            ),
        };
        debug!(catalog, index, kind = %self.kind, "built index");
        Ok(built)
    }
}

/// Differences between a catalog and its declared indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexPlan {
    pub added: Vec<String>,
    /// Present but built from a different declaration.
    pub replaced: Vec<String>,
    pub removed: Vec<String>,
}

impl IndexPlan {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty()
            && self.replaced.is_empty()
            && self.removed.is_empty()
    }

    /// Indexes that will hold no data once the plan is applied.
    pub fn touched(&self) -> Vec<String> {
        self.added.iter().chain(&self.replaced).cloned().collect()
    }
}

/// The declared indexes of one catalog.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CatalogFactory {
    pub name: String,
    pub indexes: BTreeMap<String, IndexFactory>,
}

impl CatalogFactory {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            indexes: BTreeMap::new(),
        }
    }

    /// With `replace`, every declared index is rebuilt.
    pub fn plan(&self, catalog: &Catalog, replace: bool) -> IndexPlan {
        let mut plan = IndexPlan::default();
        for (name, factory) in &self.indexes {
            match catalog.get_index(name) {
                Err(_) => plan.added.push(name.clone()),
                Ok(index)
                    if replace
                        || index.kind() != factory.kind
                        || index.fingerprint() != factory.fingerprint() =>
                {
                    plan.replaced.push(name.clone());
                }
                Ok(_) => {}
            }
        }
        plan.removed = catalog
            .index_names()
            .into_iter()
            .filter(|name| !self.indexes.contains_key(name))
            .collect();
        plan
    }

    pub fn apply(
        &self,
        catalog: &mut Catalog,
        config: &CatalogConfig,
        plan: &IndexPlan,
    ) -> Result<()> {
        let objectmap = Arc::clone(catalog.objectmap());
        for name in plan.touched() {
            let Some(factory) = self.indexes.get(&name) else {
                continue;
            };
            let index = factory.build(&self.name, &name, config, &objectmap)?;
            catalog.add_index(&name, index);
        }
        for name in &plan.removed {
            catalog.remove_index(name);
        }
        Ok(())
    }

    /// Add missing indexes, rebuild changed ones, drop undeclared ones.
    pub fn sync(
        &self,
        catalog: &mut Catalog,
        config: &CatalogConfig,
    ) -> Result<IndexPlan> {
        let plan = self.plan(catalog, false);
        self.apply(catalog, config, &plan)?;
        Ok(plan)
    }

    /// Rebuild every declared index and drop undeclared ones.
    pub fn replace(
        &self,
        catalog: &mut Catalog,
        config: &CatalogConfig,
    ) -> Result<IndexPlan> {
        let plan = self.plan(catalog, true);
        self.apply(catalog, config, &plan)?;
        Ok(plan)
    }
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawIndex {
    factory: String,
    #[serde(default)]
    args: IndexArgs,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    catalogs: BTreeMap<String, BTreeMap<String, RawIndex>>,
    #[serde(default)]
    catalogable: Vec<String>,
}

/// Everything catalogs are built from.
#[derive(Debug, Clone)]
pub struct CatalogConfig {
    catalogs: BTreeMap<String, CatalogFactory>,
    views: BTreeMap<(String, String), Vec<Extractor>>,
    catalogable: BTreeSet<String>,
    security: Arc<dyn Security>,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            catalogs: BTreeMap::new(),
            views: BTreeMap::new(),
            catalogable: BTreeSet::new(),
            security: Arc::new(GrantTable::new()),
        }
    }
}

impl CatalogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_security(mut self, security: Arc<dyn Security>) -> Self {
        self.security = security;
        self
    }

    pub fn security(&self) -> Arc<dyn Security> {
        Arc::clone(&self.security)
    }

    /// Declare a candidate index, enforcing the agreement rules.
    pub fn declare(
        &mut self,
        catalog: &str,
        index: &str,
        factory: IndexFactory,
    ) -> Result<()> {
        let factory = IndexFactory::new(factory.kind, factory.args);
        let indexes = &mut self
            .catalogs
            .entry(catalog.to_string())
            .or_insert_with(|| CatalogFactory::new(catalog))
            .indexes;
        let Some(existing) = indexes.get(index) else {
            indexes.insert(index.to_string(), factory);
            return Ok(());
        };
        if *existing == factory {
            return Ok(());
        }
        if existing.kind != factory.kind {
            return Err(Error::ConflictingIndex {
                catalog: catalog.to_string(),
                index: index.to_string(),
                reason: format!(
                    "factory {} vs {}",
                    existing.kind, factory.kind
                ),
            });
        }
        if factory.args.is_empty() {
            return Ok(());
        }
        if existing.args.is_empty() {
            indexes.insert(index.to_string(), factory);
            return Ok(());
        }
        Err(Error::ConflictingIndex {
            catalog: catalog.to_string(),
            index: index.to_string(),
            reason: "differing factory arguments".to_string(),
        })
    }

    pub fn factory(&self, catalog: &str) -> Option<&CatalogFactory> {
        self.catalogs.get(catalog)
    }

    pub fn catalog_names(&self) -> Vec<String> {
        self.catalogs.keys().cloned().collect()
    }

    /// Register an index view, tried before the attribute fallback.
    ///
    /// A view bound to a content type only applies to resources of that
    /// type.
    pub fn add_index_view<F>(
        &mut self,
        catalog: &str,
        index: &str,
        content_type: Option<&str>,
        view: F,
    ) where
        F: Fn(&dyn Resource) -> Option<Value> + Send + Sync + 'static,
    {
        let view: ExtractFn = Arc::new(view);
        self.views
            .entry((catalog.to_string(), index.to_string()))
            .or_default()
            .push(Extractor::View {
                content_type: content_type.map(str::to_string),
                view,
            });
    }

    pub fn views_for(&self, catalog: &str, index: &str) -> Vec<Extractor> {
        self.views
            .get(&(catalog.to_string(), index.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    /// Restrict indexing to the given content type (and any others marked).
    pub fn mark_catalogable(&mut self, content_type: &str) {
        self.catalogable.insert(content_type.to_string());
    }

    /// Every content type is catalogable until one is marked.
    pub fn is_catalogable(&self, content_type: &str) -> bool {
        self.catalogable.is_empty() || self.catalogable.contains(content_type)
    }

    /// Declare the system catalog and its index views.
    pub fn with_system_catalog(mut self) -> Result<Self> {
        let factory = system_catalog_factory();
        for (index, decl) in factory.indexes {
            self.declare(SYSTEM_CATALOG, &index, decl)?;
        }
        self.add_index_view(
            SYSTEM_CATALOG,
            "interfaces",
            None,
            discriminators::interfaces,
        );
        self.add_index_view(SYSTEM_CATALOG, "name", None, discriminators::name);
        self.add_index_view(
            SYSTEM_CATALOG,
            "name_text",
            None,
            discriminators::name_text,
        );
        Ok(self)
    }

    /// Merge the declarations of a JSON document into this config.
    ///
    /// ```
    /// use doccat::config::CatalogConfig;
    ///
    /// let mut config = CatalogConfig::new();
    /// config
    ///     .extend_from_json(r#"{"catalogs": {"app": {
    ///         "title": {"factory": "field"}
    ///     }}}"#)
    ///     .unwrap();
    /// assert!(config.factory("app").is_some());
    /// ```
    pub fn extend_from_json(&mut self, json: &str) -> Result<()> {
        let raw: RawConfig = serde_json::from_str(json)?;
        for (catalog, indexes) in raw.catalogs {
            for (index, decl) in indexes {
                let kind: IndexKind = decl.factory.parse()?;
                let factory = IndexFactory::new(kind, decl.args);
                self.declare(&catalog, &index, factory)?;
            }
        }
        for content_type in raw.catalogable {
            self.mark_catalogable(&content_type);
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let mut config = Self::new();
        config.extend_from_json(json)?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// The resolved declarations, for display.
    pub fn to_json(&self) -> Result<String> {
        let table: BTreeMap<&str, &BTreeMap<String, IndexFactory>> = self
            .catalogs
            .iter()
            .map(|(name, factory)| (name.as_str(), &factory.indexes))
            .collect();
        Ok(serde_json::to_string_pretty(&table)?)
    }
}

/// Indexes every site carries.
pub fn system_catalog_factory() -> CatalogFactory {
    let mut factory = CatalogFactory::new(SYSTEM_CATALOG);
    let mut add = |name: &str, kind: IndexKind, args: IndexArgs| {
        factory
            .indexes
            .insert(name.to_string(), IndexFactory::new(kind, args));
    };
    add("path", IndexKind::Path, IndexArgs::default());
    add(
        "name",
        IndexKind::Field,
        IndexArgs::default().mode(ActionMode::Immediate),
    );
    add(
        "interfaces",
        IndexKind::Keyword,
        IndexArgs::default().mode(ActionMode::Deferred),
    );
    add(
        "allowed",
        IndexKind::Allowed,
        IndexArgs {
            permissions: Some(vec!["sdi.view".into(), "view".into()]),
            ..IndexArgs::default().mode(ActionMode::Immediate)
        },
    );
    add(
        "name_text",
        IndexKind::Text,
        IndexArgs::default().mode(ActionMode::Deferred),
    );
    factory
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        doc_id::DocSet,
        index::Fragment,
        objectmap::MemoryObjectMap,
        resource::Content,
    };

    fn field_with(discriminator: &str) -> IndexFactory {
        IndexFactory::new(
            IndexKind::Field,
            IndexArgs {
                discriminator: Some(discriminator.into()),
                ..IndexArgs::default()
            },
        )
    }

    #[test]
    fn identical_declarations_are_idempotent() {
        let mut config = CatalogConfig::new();
        config.declare("app", "title", field_with("t")).unwrap();
        config.declare("app", "title", field_with("t")).unwrap();
        assert_eq!(config.factory("app").unwrap().indexes.len(), 1);
    }

    #[test]
    fn args_win_over_placeholder_in_either_order() {
        let mut config = CatalogConfig::new();
        let placeholder = IndexFactory::of(IndexKind::Field);
        config.declare("app", "a", placeholder.clone()).unwrap();
        config.declare("app", "a", field_with("x")).unwrap();
        config.declare("app", "b", field_with("y")).unwrap();
        config.declare("app", "b", placeholder).unwrap();
        let indexes = &config.factory("app").unwrap().indexes;
        assert_eq!(indexes["a"], field_with("x"));
        assert_eq!(indexes["b"], field_with("y"));
    }

    #[test]
    fn disagreement_is_a_configuration_error() {
        let mut config = CatalogConfig::new();
        config.declare("app", "title", field_with("a")).unwrap();
        let err = config.declare("app", "title", field_with("b")).unwrap_err();
        assert!(matches!(err, Error::ConflictingIndex { .. }));
        let err = config
            .declare("app", "title", IndexFactory::of(IndexKind::Text))
            .unwrap_err();
        assert!(err.to_string().contains("factory field vs text"));
    }

    #[test]
    fn fingerprint_ignores_list_order() {
        let facets = |list: &[&str]| {
            IndexFactory::new(
                IndexKind::Facet,
                IndexArgs {
                    facets: Some(list.iter().map(|s| s.to_string()).collect()),
                    ..IndexArgs::default()
                },
            )
        };
        assert_eq!(
            facets(&["a", "b"]).fingerprint(),
            facets(&["b", "a", "a"]).fingerprint()
        );
        assert_ne!(
            facets(&["a"]).fingerprint(),
            IndexFactory::of(IndexKind::Facet).fingerprint()
        );
    }

    #[test]
    fn json_declarations_and_unknown_factories() {
        let config = CatalogConfig::from_json(
            r#"{"catalogs": {"app": {
                "tags": {"factory": "keyword",
                         "args": {"action_mode": "deferred"}}
            }}, "catalogable": ["Document"]}"#,
        )
        .unwrap();
        let tags = &config.factory("app").unwrap().indexes["tags"];
        assert_eq!(tags.kind, IndexKind::Keyword);
        assert_eq!(tags.args.action_mode, Some(ActionMode::Deferred));
        assert!(config.is_catalogable("Document"));
        assert!(!config.is_catalogable("Folder"));

        let err = CatalogConfig::from_json(
            r#"{"catalogs": {"app": {"x": {"factory": "btree"}}}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::UnknownFactory(_)));
    }

    #[test]
    fn system_catalog_builds_with_views() {
        let config = CatalogConfig::new().with_system_catalog().unwrap();
        let map: Arc<dyn ObjectMap> = Arc::new(MemoryObjectMap::new());
        let mut catalog = Catalog::new(SYSTEM_CATALOG, Arc::clone(&map));
        let plan = config
            .factory(SYSTEM_CATALOG)
            .unwrap()
            .sync(&mut catalog, &config)
            .unwrap();
        assert_eq!(plan.added.len(), 5);
        assert_eq!(
            catalog.get_index("interfaces").unwrap().action_mode(),
            ActionMode::Deferred
        );

        let doc = Content::new(3).named("read-me.txt").into_arc();
        catalog.index_doc(3, doc).unwrap();
        let name = catalog.get_index("name").unwrap();
        let hits = name.apply(&Fragment::Eq(Value::from("read-me.txt")));
        assert_eq!(hits.unwrap(), DocSet::from([3]));
    }

    #[test]
    fn changed_declaration_is_replaced_on_sync() {
        let map: Arc<dyn ObjectMap> = Arc::new(MemoryObjectMap::new());
        let mut config = CatalogConfig::new();
        config.declare("app", "title", field_with("a")).unwrap();
        let mut catalog = Catalog::new("app", map);
        let factory = config.factory("app").unwrap().clone();
        factory.sync(&mut catalog, &config).unwrap();
        assert!(factory.plan(&catalog, false).is_empty());

        let mut changed = factory.clone();
        changed.indexes.insert("title".into(), field_with("b"));
        let plan = changed.plan(&catalog, false);
        assert_eq!(plan.replaced, vec!["title"]);
        assert_eq!(factory.plan(&catalog, true).replaced, vec!["title"]);
    }
}
