use std::{
    collections::{
        BTreeMap,
        BTreeSet,
        btree_map,
    },
    path::Path,
    sync::{
        Arc,
        Mutex,
        MutexGuard,
        PoisonError,
    },
};

use redb::{
    Database,
    ReadableDatabase,
    ReadableTable,
    TableDefinition,
};
use serde::{
    Deserialize,
    Serialize,
};
use tracing::{
    debug,
    info,
};

use crate::{
    action::{
        Action,
        IndexKey,
        action_union,
        optimize_actions,
    },
    doc_id::DocId,
    error::{
        Error,
        Result,
    },
    txn::Transaction,
};

const QUEUES: TableDefinition<&str, &[u8]> = TableDefinition::new("queues");

/// A durable list of deferred actions.
///
/// `generation` increases with every committed change and is what commits
/// compare to detect a concurrent writer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionsQueue {
    pub generation: u64,
    pub actions: Vec<Action>,
    pub active: bool,
}

impl ActionsQueue {
    pub fn extend<I: IntoIterator<Item = Action>>(&mut self, actions: I) {
        self.actions.extend(actions);
    }

    /// Remove and return every queued action.
    pub fn popall(&mut self) -> Vec<Action> {
        std::mem::take(&mut self.actions)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

type Key = (DocId, IndexKey);

fn keyed(actions: &[Action]) -> BTreeSet<Key> {
    actions.iter().map(|a| (a.oid, a.index.clone())).collect()
}

fn minus(actions: &[Action], other: &BTreeSet<Key>) -> Vec<Action> {
    actions
        .iter()
        .filter(|a| !other.contains(&(a.oid, a.index.clone())))
        .cloned()
        .collect()
}

/// Three-way merge of a queue changed by two writers from the same `old`
/// state.
///
/// Actions either side added are kept, actions either side consumed are
/// dropped, and an add on one side racing a removal on the other for the
/// same `(oid, index)` is a conflict. Anything but the actions differing
/// between `committed` and `new` is a conflict too.
pub fn merge(
    old: &ActionsQueue,
    committed: &ActionsQueue,
    new: &ActionsQueue,
) -> Result<ActionsQueue> {
    if committed.active != new.active {
        return Err(Error::Conflict(
            "queue activation changed concurrently".into(),
        ));
    }

    let old_actions = optimize_actions(old.actions.clone());
    let committed_actions = optimize_actions(committed.actions.clone());
    let new_actions = optimize_actions(new.actions.clone());

    let old_keys = keyed(&old_actions);
    let committed_keys = keyed(&committed_actions);
    let new_keys = keyed(&new_actions);

    let committed_added = minus(&committed_actions, &old_keys);
    let committed_removed = minus(&old_actions, &committed_keys);
    let new_added = minus(&new_actions, &old_keys);
    let new_removed = minus(&old_actions, &new_keys);

    let removed = action_union(&new_removed, &committed_removed)?;
    let added = action_union(&new_added, &committed_added)?;
    let union = action_union(&old_actions, &added)?;

    let removed = keyed(&removed);
    let mut actions = minus(&union, &removed);
    actions.sort_by(|a, b| {
        (a.oid, &a.index, a.kind).cmp(&(b.oid, &b.index, b.kind))
    });

    Ok(ActionsQueue {
        generation: committed.generation.max(new.generation) + 1,
        actions,
        active: committed.active,
    })
}

/// On-disk home of the durable action queues.
#[derive(Clone)]
pub struct QueueDb {
    db: Arc<Database>,
}

impl QueueDb {
    pub fn open(path: &Path) -> Result<Self> {
        let db = Database::create(path)?;

        // Make sure the table exists before anyone reads it.
        let txn = db.begin_write()?;
        txn.open_table(QUEUES)?;
        txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// A new transactional view of the queues.
    pub fn connection(&self) -> Connection {
        Connection {
            db: Arc::clone(&self.db),
            state: Mutex::new(BTreeMap::new()),
        }
    }

    /// The committed state of queue `name`.
    pub fn load(&self, name: &str) -> Result<Option<ActionsQueue>> {
        load(&self.db, name)
    }

    pub fn names(&self) -> Result<Vec<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(QUEUES)?;
        let mut result = Vec::new();
        for entry in table.iter()? {
            let (k, _v) = entry?;
            result.push(k.value().to_string());
        }
        Ok(result)
    }
}

impl std::fmt::Debug for QueueDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueDb").finish_non_exhaustive()
    }
}

fn load(db: &Database, name: &str) -> Result<Option<ActionsQueue>> {
    let txn = db.begin_read()?;
    let table = txn.open_table(QUEUES)?;
    let bytes = table.get(name)?.map(|v| v.value().to_vec());
    bytes.as_deref().map(ActionsQueue::decode).transpose()
}

#[derive(Debug)]
struct Staged {
    /// What this connection first read.
    base: Option<ActionsQueue>,
    current: Option<ActionsQueue>,
    dirty: bool,
}

/// One writer's view of the queues.
///
/// Reads are snapshotted on first access and changes are staged locally
/// until [`Transaction::commit`], which checks each changed queue's
/// generation and merges with whatever a concurrent writer committed.
pub struct Connection {
    db: Arc<Database>,
    state: Mutex<BTreeMap<String, Staged>>,
}

impl Connection {
    fn state(&self) -> MutexGuard<'_, BTreeMap<String, Staged>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_entry<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Staged) -> Result<T>,
    ) -> Result<T> {
        let mut state = self.state();
        let staged = match state.entry(name.to_string()) {
            btree_map::Entry::Occupied(slot) => slot.into_mut(),
            btree_map::Entry::Vacant(slot) => {
                let base = load(&self.db, name)?;
                slot.insert(Staged {
                    current: base.clone(),
                    base,
                    dirty: false,
                })
            }
        };
        f(staged)
    }

    pub fn get(&self, name: &str) -> Result<Option<ActionsQueue>> {
        self.with_entry(name, |e| Ok(e.current.clone()))
    }

    pub fn put(&self, name: &str, queue: ActionsQueue) -> Result<()> {
        self.with_entry(name, |e| {
            e.current = Some(queue);
            e.dirty = true;
            Ok(())
        })
    }

    pub fn remove(&self, name: &str) -> Result<Option<ActionsQueue>> {
        self.with_entry(name, |e| {
            e.dirty = true;
            Ok(e.current.take())
        })
    }

    /// Change queue `name` in place.
    pub fn update<T>(
        &self,
        name: &str,
        f: impl FnOnce(&mut Option<ActionsQueue>) -> Result<T>,
    ) -> Result<T> {
        self.with_entry(name, |e| {
            let out = f(&mut e.current)?;
            e.dirty = true;
            Ok(out)
        })
    }

    fn reset(&self) {
        self.state().clear();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("staged", &self.state().len())
            .finish_non_exhaustive()
    }
}

/// Decide what to store for one staged queue given what is on disk now.
fn resolve(
    name: &str,
    entry: &Staged,
    stored: Option<ActionsQueue>,
) -> Result<Option<ActionsQueue>> {
    let conflict = |why: &str| Error::Conflict(format!("queue {name}: {why}"));
    match (&entry.base, stored, &entry.current) {
        (_, None, None) => Ok(None),
        (None, None, Some(current)) => Ok(Some(ActionsQueue {
            generation: current.generation + 1,
            ..current.clone()
        })),
        (Some(_), None, Some(_)) => Err(conflict("removed concurrently")),
        (Some(base), Some(stored), current)
            if base.generation == stored.generation =>
        {
            Ok(current.as_ref().map(|current| ActionsQueue {
                generation: stored.generation + 1,
                ..current.clone()
            }))
        }
        (_, Some(_), None) => {
            Err(conflict("removed here while changed concurrently"))
        }
        (base, Some(stored), Some(current)) => {
            info!(queue = name, "resolving concurrent queue update");
            let old = base.clone().unwrap_or_default();
            merge(&old, &stored, current).map(Some)
        }
    }
}

impl Transaction for Connection {
    fn begin(&self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let staged: Vec<(String, Staged)> = {
            let mut state = self.state();
            std::mem::take(&mut *state)
                .into_iter()
                .filter(|(_, e)| e.dirty)
                .collect()
        };
        if staged.is_empty() {
            return Ok(());
        }

        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(QUEUES)?;
            for (name, entry) in &staged {
                let stored =
                    table.get(name.as_str())?.map(|v| v.value().to_vec());
                let stored =
                    stored.as_deref().map(ActionsQueue::decode).transpose()?;
                match resolve(name, entry, stored)? {
                    Some(queue) => {
                        debug!(
                            queue = name.as_str(),
                            generation = queue.generation,
                            actions = queue.len(),
                            "storing queue"
                        );
                        let bytes = queue.encode()?;
                        table.insert(name.as_str(), bytes.as_slice())?;
                    }
                    None => {
                        table.remove(name.as_str())?;
                    }
                }
            }
        }
        txn.commit()?;
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        self.reset();
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.reset();
        Ok(())
    }
}
