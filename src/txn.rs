//! Transaction plumbing shared by catalogs and the durable queue.
//!
//! A [`Transaction`] is whatever store the embedding application commits
//! to. Catalogs buffer non-immediate index actions per index in an
//! [`ActionQueue`] and flush them when the transaction commits, either
//! executing them or handing deferred ones to an [`ActionProcessor`].

use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};

use tracing::debug;

use crate::{
    action::{
        Action,
        optimize_actions,
    },
    error::{
        Error,
        Result,
    },
    index::ActionMode,
};

/// A store transaction under optimistic concurrency control.
pub trait Transaction {
    fn begin(&self) -> Result<()>;

    /// Fails with [`Error::Conflict`] when a concurrent writer won.
    fn commit(&self) -> Result<()>;

    fn abort(&self) -> Result<()>;

    /// Drop cached state so the next read sees the latest snapshot.
    fn sync(&self) -> Result<()>;
}

/// Run `f` inside a fresh transaction and commit, retrying up to `tries`
/// times when the commit conflicts.
pub fn commit_with_tries<T, F>(
    txn: &dyn Transaction,
    tries: usize,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Result<T>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        txn.sync()?;
        txn.begin()?;
        let outcome = f().and_then(|value| txn.commit().map(|()| value));
        match outcome {
            Ok(value) => return Ok(value),
            Err(Error::Conflict(reason)) if attempt < tries => {
                debug!(attempt, %reason, "commit conflicted, retrying");
                txn.abort()?;
            }
            Err(err) => {
                txn.abort()?;
                return Err(err);
            }
        }
    }
}

/// Something that accepts deferred actions for later execution.
pub trait ActionProcessor {
    fn active(&self) -> Result<bool>;

    fn add(&self, actions: Vec<Action>) -> Result<()>;
}

/// Something actions can be executed against.
pub trait ActionTarget {
    fn execute(&mut self, action: &Action) -> Result<()>;
}

/// Actions pending for one index in the current transaction.
#[derive(Debug, Default)]
pub struct ActionQueue {
    actions: Vec<Action>,
    registered: bool,
}

/// Snapshot of an [`ActionQueue`] taken at a savepoint.
#[derive(Debug, Clone)]
pub struct QueueSavepoint {
    actions: Vec<Action>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, action: Action) {
        self.actions.push(action);
    }

    /// Join the current transaction. Returns `true` only the first time.
    pub fn register(&mut self) -> bool {
        !std::mem::replace(&mut self.registered, true)
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn actions(&self) -> &[Action] {
        &self.actions
    }

    pub fn savepoint(&self) -> QueueSavepoint {
        QueueSavepoint {
            actions: self.actions.clone(),
        }
    }

    pub fn rollback(&mut self, savepoint: QueueSavepoint) {
        self.actions = savepoint.actions;
    }

    /// Empty the queue and leave the transaction.
    pub fn take(&mut self) -> Vec<Action> {
        self.registered = false;
        std::mem::take(&mut self.actions)
    }

    /// Optimise and run the pending actions.
    ///
    /// Unless `all` is set and when `processor` is active, deferred actions
    /// go to the processor instead of `exec`. The queue is emptied before
    /// anything runs, and the first failing action stops the batch.
    pub fn flush<F>(
        &mut self,
        all: bool,
        processor: Option<&dyn ActionProcessor>,
        mut exec: F,
    ) -> Result<()>
    where
        F: FnMut(&Action) -> Result<()>,
    {
        let actions = optimize_actions(self.take());
        if actions.is_empty() {
            return Ok(());
        }
        let processor = match processor {
            Some(p) if !all => {
                if p.active()? {
                    Some(p)
                } else {
                    debug!("action processor inactive, executing inline");
                    None
                }
            }
            _ => None,
        };
        let Some(processor) = processor else {
            for action in &actions {
                exec(action)?;
            }
            return Ok(());
        };

        let mut deferred = Vec::new();
        for action in actions {
            if action.mode == ActionMode::Deferred {
                debug!(%action, "deferring");
                deferred.push(action);
            } else {
                exec(&action)?;
            }
        }
        if !deferred.is_empty() {
            processor.add(deferred)?;
        }
        Ok(())
    }
}

/// A store with nothing to persist that counts what it was asked to do.
///
/// Catalogs living purely in memory commit through this.
#[derive(Debug, Default)]
pub struct CountingTransaction {
    begins: AtomicUsize,
    commits: AtomicUsize,
    aborts: AtomicUsize,
    conflicts: AtomicUsize,
}

impl CountingTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` commits fail with a conflict.
    pub fn conflict_next(&self, n: usize) {
        self.conflicts.store(n, Ordering::SeqCst);
    }

    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    pub fn aborts(&self) -> usize {
        self.aborts.load(Ordering::SeqCst)
    }
}

impl Transaction for CountingTransaction {
    fn begin(&self) -> Result<()> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        let pending = self.conflicts.load(Ordering::SeqCst);
        if pending > 0 {
            self.conflicts.store(pending - 1, Ordering::SeqCst);
            return Err(Error::Conflict("simulated".into()));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn abort(&self) -> Result<()> {
        self.aborts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}
