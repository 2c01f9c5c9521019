//! Pending index mutations and the rules that fold them.
//!
//! An [`Action`] names one change to one index for one document. Within a
//! transaction the actions for an index are collapsed by
//! [`optimize_actions`] so that each `(oid, index)` pair is touched at most
//! once with its net effect. When two transactions append to the durable
//! queue concurrently, [`action_union`] and [`which_action`] decide which of
//! two actions on the same pair survives.

use std::{
    collections::BTreeMap,
    fmt,
    sync::Arc,
};

use serde::{
    Deserialize,
    Serialize,
};
use tracing::debug;

use crate::{
    doc_id::DocId,
    error::{
        Error,
        Result,
    },
    index::{
        ActionMode,
        CatalogIndex,
    },
    objectmap::ObjectMap,
    resource::Resource,
};

/// What an action does. The discriminant is the execution position among
/// unrelated actions: removals run before changes, changes before adds.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Remove = 0,
    Change = 1,
    Add = 2,
}

impl ActionKind {
    pub fn position(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ActionKind::Remove => "remove",
            ActionKind::Change => "change",
            ActionKind::Add => "add",
        })
    }
}

/// Identity of an index across catalogs.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct IndexKey {
    pub catalog: String,
    pub index: String,
}

impl IndexKey {
    pub fn new(catalog: &str, index: &str) -> Self {
        Self {
            catalog: catalog.to_string(),
            index: index.to_string(),
        }
    }
}

impl fmt::Display for IndexKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.catalog, self.index)
    }
}

/// One pending mutation of one index.
///
/// In-process actions carry the resource they were raised for; actions read
/// back from the durable queue do not and resolve it through the object map
/// when executed.
#[derive(Clone, Serialize, Deserialize)]
pub struct Action {
    pub kind: ActionKind,
    pub index: IndexKey,
    pub oid: DocId,
    pub mode: ActionMode,
    #[serde(skip)]
    pub resource: Option<Arc<dyn Resource>>,
}

impl Action {
    pub fn add(
        index: IndexKey,
        oid: DocId,
        mode: ActionMode,
        resource: Option<Arc<dyn Resource>>,
    ) -> Self {
        Self {
            kind: ActionKind::Add,
            index,
            oid,
            mode,
            resource,
        }
    }

    pub fn change(
        index: IndexKey,
        oid: DocId,
        mode: ActionMode,
        resource: Option<Arc<dyn Resource>>,
    ) -> Self {
        Self {
            kind: ActionKind::Change,
            ..Self::add(index, oid, mode, resource)
        }
    }

    pub fn remove(index: IndexKey, oid: DocId, mode: ActionMode) -> Self {
        Self {
            kind: ActionKind::Remove,
            ..Self::add(index, oid, mode, None)
        }
    }

    /// The pair optimisation and conflict resolution group by.
    pub fn key(&self) -> (DocId, &IndexKey) {
        (self.oid, &self.index)
    }

    fn with_kind(&self, kind: ActionKind) -> Self {
        Self {
            kind,
            ..self.clone()
        }
    }

    /// Apply this action to `index`.
    pub fn execute(
        &self,
        index: &mut dyn CatalogIndex,
        objectmap: &dyn ObjectMap,
    ) -> Result<()> {
        debug!(action = %self, "executing");
        if self.kind == ActionKind::Remove {
            return index.unindex_doc(self.oid);
        }
        let resource = match &self.resource {
            Some(resource) => Arc::clone(resource),
            None => objectmap
                .object_for(self.oid)
                .ok_or(Error::ResourceNotFound(self.oid))?,
        };
        match self.kind {
            ActionKind::Add => index.index_doc(self.oid, resource.as_ref()),
            _ => index.reindex_doc(self.oid, resource.as_ref()),
        }
    }
}

impl PartialEq for Action {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.index == other.index
            && self.oid == other.oid
            && self.mode == other.mode
    }
}

impl Eq for Action {}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("kind", &self.kind)
            .field("index", &self.index)
            .field("oid", &self.oid)
            .field("mode", &self.mode)
            .field("carries_resource", &self.resource.is_some())
            .finish()
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} in {} ({})",
            self.kind, self.oid, self.index, self.mode
        )
    }
}

/// Fold `actions` into one net action per `(oid, index)`.
///
/// | prior \ new | add    | remove  | change |
/// |-------------|--------|---------|--------|
/// | add         | add    | nothing | add    |
/// | remove      | change | remove  | change |
/// | change      | add    | remove  | change |
///
/// A surviving add that absorbed a later change takes the change's
/// resource. The result is ordered by oid, index, then
/// [`ActionKind::position`].
///
/// # Examples
///
/// ```
/// use doccat::{
///     action::{Action, IndexKey, optimize_actions},
///     index::ActionMode,
/// };
///
/// let key = IndexKey::new("system", "name");
/// let mode = ActionMode::AtCommit;
/// let folded = optimize_actions(vec![
///     Action::add(key.clone(), 1, mode, None),
///     Action::change(key.clone(), 1, mode, None),
///     Action::remove(key, 1, mode),
/// ]);
/// assert!(folded.is_empty());
/// ```
pub fn optimize_actions<I>(actions: I) -> Vec<Action>
where
    I: IntoIterator<Item = Action>,
{
    let mut net: BTreeMap<(DocId, IndexKey), Action> = BTreeMap::new();
    for action in actions {
        let key = (action.oid, action.index.clone());
        let prior = net.get(&key).map(|a| a.kind);
        match (prior, action.kind) {
            (Some(ActionKind::Add), ActionKind::Remove) => {
                net.remove(&key);
            }
            (Some(ActionKind::Add), ActionKind::Change) => {
                net.insert(key, action.with_kind(ActionKind::Add));
            }
            (Some(ActionKind::Remove), ActionKind::Add) => {
                net.insert(key, action.with_kind(ActionKind::Change));
            }
            _ => {
                net.insert(key, action);
            }
        }
    }
    net.into_values().collect()
}

/// Pick between two actions on the same `(oid, index)` that were queued by
/// concurrent transactions.
///
/// A removal racing an add or change cannot be reconciled and is a
/// conflict. A change racing an add resolves to the add; anything else
/// keeps `first`.
pub fn which_action(first: &Action, second: &Action) -> Result<Action> {
    use ActionKind::{
        Add,
        Change,
        Remove,
    };
    match (first.kind, second.kind) {
        (Add | Change, Remove) | (Remove, Add | Change) => {
            Err(Error::Conflict(format!("{first} races {second}")))
        }
        (Change, Add) => Ok(second.clone()),
        _ => Ok(first.clone()),
    }
}

/// Union of two action lists, resolving same-key pairs with
/// [`which_action`]. Order follows `first`, then unmatched `second`.
pub fn action_union(
    first: &[Action],
    second: &[Action],
) -> Result<Vec<Action>> {
    let mut out: Vec<Action> = first.to_vec();
    let positions: BTreeMap<(DocId, &IndexKey), usize> = first
        .iter()
        .enumerate()
        .map(|(pos, a)| (a.key(), pos))
        .collect();
    let mut extra = Vec::new();
    for action in second {
        match positions.get(&action.key()) {
            Some(&pos) => out[pos] = which_action(&first[pos], action)?,
            None => extra.push(action.clone()),
        }
    }
    out.extend(extra);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        discriminators::Discriminator,
        index::{
            Fragment,
            IndexMeta,
            KeywordIndex,
        },
        objectmap::MemoryObjectMap,
        resource::Content,
        value::Value,
    };

    use ActionKind::{
        Add,
        Change,
        Remove,
    };

    fn key(index: &str) -> IndexKey {
        IndexKey::new("catalog", index)
    }

    fn act(kind: ActionKind, oid: DocId, index: &str) -> Action {
        Action {
            kind,
            index: key(index),
            oid,
            mode: ActionMode::AtCommit,
            resource: None,
        }
    }

    #[test]
    fn transition_table() {
        let cases = [
            (Add, Add, Some(Add)),
            (Add, Remove, None),
            (Add, Change, Some(Add)),
            (Remove, Add, Some(Change)),
            (Remove, Remove, Some(Remove)),
            (Remove, Change, Some(Change)),
            (Change, Add, Some(Add)),
            (Change, Remove, Some(Remove)),
            (Change, Change, Some(Change)),
        ];
        for (prior, new, expected) in cases {
            let out =
                optimize_actions(vec![act(prior, 1, "a"), act(new, 1, "a")]);
            assert_eq!(
                out.first().map(|a| a.kind),
                expected,
                "{prior} then {new}"
            );
            assert!(out.len() <= 1);
        }
    }

    #[test]
    fn remove_then_add_keeps_the_new_mode() {
        let mut add = act(Add, 1, "a");
        add.mode = ActionMode::Deferred;
        let out = optimize_actions(vec![act(Remove, 1, "a"), add]);
        assert_eq!(out[0].kind, Change);
        assert_eq!(out[0].mode, ActionMode::Deferred);
    }

    #[test]
    fn add_absorbs_a_later_change_resource() {
        let mut change = act(Change, 1, "a");
        change.resource = Some(Content::new(1).with("v", "y").into_arc());
        let out = optimize_actions(vec![act(Add, 1, "a"), change]);
        assert_eq!(out[0].kind, Add);
        let resource = out[0].resource.as_ref().unwrap();
        assert_eq!(resource.attribute("v"), Some(Value::from("y")));
    }

    #[test]
    fn output_is_ordered_by_oid_index_then_position() {
        let out = optimize_actions(vec![
            act(Add, 2, "b"),
            act(Add, 1, "b"),
            act(Remove, 2, "a"),
            act(Change, 1, "a"),
        ]);
        let keys: Vec<(DocId, &str, ActionKind)> = out
            .iter()
            .map(|a| (a.oid, a.index.index.as_str(), a.kind))
            .collect();
        assert_eq!(keys, vec![
            (1, "a", Change),
            (1, "b", Add),
            (2, "a", Remove),
            (2, "b", Add),
        ]);
    }

    #[test]
    fn which_action_chart() {
        let conflicts = [
            (Add, Remove),
            (Remove, Add),
            (Change, Remove),
            (Remove, Change),
        ];
        for (a, b) in conflicts {
            assert!(matches!(
                which_action(&act(a, 1, "x"), &act(b, 1, "x")),
                Err(Error::Conflict(_))
            ));
        }
        let pick = |a, b| which_action(&act(a, 1, "x"), &act(b, 1, "x"));
        assert_eq!(pick(Change, Add).unwrap().kind, Add);
        assert_eq!(pick(Add, Change).unwrap().kind, Add);
        assert_eq!(pick(Remove, Remove).unwrap().kind, Remove);
    }

    #[test]
    fn union_resolves_shared_keys() {
        let first = vec![act(Change, 1, "x"), act(Add, 2, "x")];
        let second = vec![act(Add, 1, "x"), act(Remove, 3, "x")];
        let out = action_union(&first, &second).unwrap();
        assert_eq!(out, vec![
            act(Add, 1, "x"),
            act(Add, 2, "x"),
            act(Remove, 3, "x"),
        ]);
        assert!(action_union(&first, &[act(Remove, 2, "x")]).is_err());
    }

    #[test]
    fn execute_resolves_missing_resources_through_the_objectmap() {
        let map = MemoryObjectMap::new();
        map.add(Content::new(5).named("five").with("tags", "t").into_arc())
            .unwrap();
        let mut idx = KeywordIndex::new(
            Discriminator::attribute("tags"),
            IndexMeta::default(),
        );

        act(Add, 5, "tags").execute(&mut idx, &map).unwrap();
        assert_eq!(
            idx.apply(&Fragment::Eq(Value::from("t"))).unwrap().len(),
            1
        );

        let err = act(Change, 6, "tags").execute(&mut idx, &map).unwrap_err();
        assert!(matches!(err, Error::ResourceNotFound(6)));

        act(Remove, 5, "tags").execute(&mut idx, &map).unwrap();
        assert!(idx.docids().unwrap().is_empty());
    }

    #[test]
    fn serialized_actions_drop_the_resource() {
        let mut a = act(Add, 1, "x");
        a.resource = Some(Content::new(1).into_arc());
        let json = serde_json::to_string(&a).unwrap();
        assert!(json.contains("\"kind\":\"add\""));
        let back: Action = serde_json::from_str(&json).unwrap();
        assert!(back.resource.is_none());
        assert_eq!(back, a);
    }
}
