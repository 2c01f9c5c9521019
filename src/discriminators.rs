//! Value extraction for indexes.
//!
//! A [`Discriminator`] is an ordered chain of [`Extractor`]s. The first one
//! that produces a value wins; if none does, the index records the document
//! as not indexed.

use std::{
    fmt,
    sync::Arc,
};

use crate::{
    resource::{
        Resource,
        lineage_interfaces,
    },
    security::Security,
    value::Value,
};

/// Principal and permission stored when nobody is allowed. An empty value
/// list would match any `AnyOf` query over the pairs.
pub const NO_WAY: &str = "\u{0}no-way";

/// Separators the name text view splits names on, applied in order.
const NAME_SEPARATORS: [char; 4] = [',', '-', '_', '.'];

/// How many times the leading element of a text sequence is repeated.
const TEXT_WEIGHT: usize = 10;

pub type ExtractFn = Arc<dyn Fn(&dyn Resource) -> Option<Value> + Send + Sync>;

#[derive(Clone)]
pub enum Extractor {
    /// A registered index view, optionally restricted to one content type.
    View {
        content_type: Option<String>,
        view: ExtractFn,
    },
    Attribute(String),
    Func(ExtractFn),
}

impl Extractor {
    pub fn extract(&self, resource: &dyn Resource) -> Option<Value> {
        match self {
            Extractor::View { content_type, view } => match content_type {
                Some(ct) if ct != resource.content_type() => None,
                _ => view(resource),
            },
            Extractor::Attribute(name) => resource.attribute(name),
            Extractor::Func(f) => f(resource),
        }
    }
}

impl fmt::Debug for Extractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Extractor::View { content_type, .. } => f
                .debug_struct("View")
                .field("content_type", content_type)
                .finish_non_exhaustive(),
            Extractor::Attribute(name) => {
                f.debug_tuple("Attribute").field(name).finish()
            }
            Extractor::Func(_) => f.write_str("Func(..)"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Discriminator {
    chain: Vec<Extractor>,
}

impl Discriminator {
    pub fn new(chain: Vec<Extractor>) -> Self {
        Self { chain }
    }

    pub fn attribute(name: &str) -> Self {
        Self::new(vec![Extractor::Attribute(name.to_string())])
    }

    pub fn func<F>(f: F) -> Self
    where
        F: Fn(&dyn Resource) -> Option<Value> + Send + Sync + 'static,
    {
        Self::new(vec![Extractor::Func(Arc::new(f))])
    }

    pub fn then(mut self, extractor: Extractor) -> Self {
        self.chain.push(extractor);
        self
    }

    pub fn extract(&self, resource: &dyn Resource) -> Option<Value> {
        self.chain.iter().find_map(|e| e.extract(resource))
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

fn text_list<I: IntoIterator<Item = String>>(items: I) -> Value {
    Value::List(items.into_iter().map(Value::Text).collect())
}

/// Declared interface tags of the resource.
pub fn interfaces(resource: &dyn Resource) -> Option<Value> {
    Some(text_list(resource.interfaces()))
}

/// Interface tags of the resource and all of its ancestors.
pub fn containment(resource: &dyn Resource) -> Option<Value> {
    Some(text_list(lineage_interfaces(resource)))
}

pub fn name(resource: &dyn Resource) -> Option<Value> {
    resource.name().map(Value::from)
}

/// The name followed by its separator-split pieces, so that
/// `foo-bar_baz.pt,foz` is searchable as `foo`, `bar`, `baz`, `pt`, `foz`.
pub fn name_text(resource: &dyn Resource) -> Option<Value> {
    let name = resource.name()?;
    let mut split = name.to_string();
    for sep in NAME_SEPARATORS {
        split = split.split(sep).map(str::trim).collect::<Vec<_>>().join(" ");
    }
    if split == name {
        Some(Value::from(name))
    } else {
        Some(Value::from(format!("{name} {split}")))
    }
}

/// `(principal, permission)` pairs for every principal holding one of
/// `permissions`, or a single [`NO_WAY`] pair when nobody does.
///
/// An empty `permissions` list stands for every permission `security`
/// knows about at extraction time.
pub fn allowed(
    security: Arc<dyn Security>,
    permissions: Vec<String>,
) -> ExtractFn {
    Arc::new(move |resource: &dyn Resource| {
        let every: Vec<String>;
        let permissions = if permissions.is_empty() {
            every = security.all_permissions().into_iter().collect();
            &every
        } else {
            &permissions
        };
        let mut pairs = Vec::new();
        for permission in permissions {
            for principal in security.principals_allowed(resource, permission)
            {
                pairs.push(Value::pair(&principal, permission));
            }
        }
        if pairs.is_empty() {
            pairs.push(Value::pair(NO_WAY, NO_WAY));
        }
        Some(Value::List(pairs))
    })
}

/// Flatten an extracted value into indexable text.
///
/// A sequence boosts its first non-empty element by repeating it ahead of
/// the rest.
pub fn weighted_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Text(s) => s.clone(),
        Value::List(items) => {
            let strings: Vec<&str> = items
                .iter()
                .filter_map(Value::as_str)
                .filter(|s| !s.trim().is_empty())
                .collect();
            let (first, rest) = strings.split_first()?;
            let mut parts = vec![*first; TEXT_WEIGHT];
            parts.extend(rest.iter().copied());
            parts.join(" ")
        }
        other => other.to_string(),
    };
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}
