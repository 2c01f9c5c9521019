//! The out-of-process worker that drains the durable action queue.
//!
//! ```text
//! inactive --engage()--> active --process()...--> disengage() --> inactive
//! ```
//!
//! While the queue is active, catalogs committing through the processor's
//! connection hand their deferred actions to it instead of running them.

use std::{
    sync::atomic::{
        AtomicBool,
        Ordering,
    },
    thread,
    time::{
        Duration,
        Instant,
    },
};

use tracing::{
    debug,
    info,
    warn,
};

use crate::{
    action::{
        Action,
        optimize_actions,
    },
    error::{
        Error,
        Result,
    },
    queue_db::{
        ActionsQueue,
        Connection,
        QueueDb,
    },
    txn::{
        ActionProcessor,
        ActionTarget,
        Transaction,
        commit_with_tries,
    },
};

pub const DEFAULT_QUEUE: &str = "basic_action_queue";

const COMMIT_TRIES: usize = 5;

/// Granularity at which a sleeping processor notices a stop request.
const STOP_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct ProcessOptions {
    /// Pause between batches.
    pub sleep: Duration,
    /// Process a single batch and stop.
    pub once: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            sleep: Duration::from_secs(5),
            once: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    pub batches: usize,
    pub executed: usize,
    /// Actions whose resource no longer exists.
    pub skipped: usize,
    /// Batches whose commit lost to a concurrent writer.
    pub conflicts: usize,
}

#[derive(Debug)]
pub struct BasicActionProcessor {
    conn: Connection,
    queue_name: String,
}

impl BasicActionProcessor {
    pub fn new(db: &QueueDb) -> Self {
        Self {
            conn: db.connection(),
            queue_name: DEFAULT_QUEUE.to_string(),
        }
    }

    pub fn with_queue_name(mut self, name: &str) -> Self {
        self.queue_name = name.to_string();
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// The transaction deferred actions are staged in.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn get_queue(&self) -> Result<Option<ActionsQueue>> {
        self.conn.get(&self.queue_name)
    }

    /// Create the queue if needed and mark it active.
    pub fn engage(&self) -> Result<()> {
        commit_with_tries(&self.conn, COMMIT_TRIES, || {
            self.conn.update(&self.queue_name, |queue| {
                match queue {
                    Some(q) => q.active = true,
                    None => {
                        *queue = Some(ActionsQueue {
                            active: true,
                            ..ActionsQueue::default()
                        });
                    }
                }
                Ok(())
            })
        })?;
        info!(queue = %self.queue_name, "engaged");
        Ok(())
    }

    /// Remove the queue, returning whatever actions were still in it.
    pub fn disengage(&self) -> Result<Vec<Action>> {
        let leftover =
            commit_with_tries(&self.conn, COMMIT_TRIES, || self.take_queue())?;
        info!(
            queue = %self.queue_name,
            leftover = leftover.len(),
            "disengaged"
        );
        Ok(leftover)
    }

    /// Stage removal of the queue in the open transaction.
    fn take_queue(&self) -> Result<Vec<Action>> {
        let removed = self.conn.remove(&self.queue_name)?;
        Ok(removed.map(|q| q.actions).unwrap_or_default())
    }

    fn pause(&self, sleep: Duration, stop: &AtomicBool) {
        let deadline = Instant::now() + sleep;
        while !stop.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            thread::sleep(STOP_POLL.min(deadline - now));
        }
    }

    fn run(
        &self,
        actions: &[Action],
        target: &mut dyn ActionTarget,
        stats: &mut ProcessStats,
    ) -> Result<()> {
        for action in actions {
            match target.execute(action) {
                Ok(()) => stats.executed += 1,
                Err(Error::ResourceNotFound(oid)) => {
                    info!(oid, %action, "resource gone, skipping");
                    stats.skipped += 1;
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Pop, optimise and execute queued actions until `stop` is raised (or
    /// after one batch with `once`), then disengage.
    ///
    /// A batch whose commit conflicts is aborted and retried on the next
    /// tick. Any other failure aborts the batch and is returned. The queue
    /// is always removed before returning `Ok`, even when writers keep
    /// appending while it is being removed.
    pub fn process(
        &self,
        target: &mut dyn ActionTarget,
        options: &ProcessOptions,
        stop: &AtomicBool,
    ) -> Result<ProcessStats> {
        let mut stats = ProcessStats::default();
        info!(queue = %self.queue_name, "processing");

        loop {
            if !options.once {
                self.pause(options.sleep, stop);
            }
            if stop.load(Ordering::SeqCst) {
                info!("stop requested");
                break;
            }

            self.drain_batch(target, &mut stats)?;

            if options.once {
                break;
            }
        }

        self.conn.sync()?;
        self.conn.begin()?;
        let leftover = self.take_queue()?;
        self.settle(leftover, target, &mut stats)?;
        Ok(stats)
    }

    /// Pop everything queued, execute it and commit the pop.
    ///
    /// A conflicting commit is aborted and counted; the actions stay queued
    /// for the next batch.
    fn drain_batch(
        &self,
        target: &mut dyn ActionTarget,
        stats: &mut ProcessStats,
    ) -> Result<()> {
        self.conn.sync()?;
        self.conn.begin()?;
        let popped = self.conn.update(&self.queue_name, |queue| {
            queue
                .as_mut()
                .map(ActionsQueue::popall)
                .ok_or(Error::QueueNotEngaged)
        });
        let actions = match popped {
            Ok(actions) => optimize_actions(actions),
            Err(err) => {
                self.conn.abort()?;
                return Err(err);
            }
        };

        if actions.is_empty() {
            return self.conn.abort();
        }
        stats.batches += 1;
        debug!(count = actions.len(), "executing batch");
        if let Err(err) = self.run(&actions, target, stats) {
            self.conn.abort()?;
            return Err(err);
        }
        match self.conn.commit() {
            Ok(()) => Ok(()),
            Err(Error::Conflict(reason)) => {
                warn!(%reason, "batch commit conflicted, aborting");
                stats.conflicts += 1;
                self.conn.abort()
            }
            Err(err) => {
                self.conn.abort()?;
                Err(err)
            }
        }
    }

    /// Commit the staged queue removal and run what it held.
    ///
    /// Actions appended while the removal was staged make the commit
    /// conflict; they are drained in another batch and the removal is
    /// staged again until it lands.
    fn settle(
        &self,
        mut leftover: Vec<Action>,
        target: &mut dyn ActionTarget,
        stats: &mut ProcessStats,
    ) -> Result<()> {
        loop {
            match self.conn.commit() {
                Ok(()) => break,
                Err(Error::Conflict(reason)) => {
                    warn!(%reason, "queue changed while disengaging");
                    stats.conflicts += 1;
                    self.conn.abort()?;
                    self.drain_batch(target, stats)?;
                    self.conn.sync()?;
                    self.conn.begin()?;
                    leftover = self.take_queue()?;
                }
                Err(err) => {
                    self.conn.abort()?;
                    return Err(err);
                }
            }
        }
        info!(
            queue = %self.queue_name,
            leftover = leftover.len(),
            "disengaged"
        );

        let leftover = optimize_actions(leftover);
        if !leftover.is_empty() {
            info!(count = leftover.len(), "executing leftover actions");
            self.run(&leftover, target, stats)?;
        }
        Ok(())
    }
}

impl ActionProcessor for BasicActionProcessor {
    fn active(&self) -> Result<bool> {
        Ok(self.get_queue()?.is_some_and(|q| q.active))
    }

    fn add(&self, actions: Vec<Action>) -> Result<()> {
        debug!(count = actions.len(), "queueing deferred actions");
        self.conn.update(&self.queue_name, |queue| match queue {
            Some(q) => {
                q.extend(actions);
                Ok(())
            }
            None => Err(Error::QueueNotEngaged),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        action::IndexKey,
        doc_id::DocId,
        index::ActionMode,
    };

    #[derive(Default)]
    struct Recorder {
        seen: Vec<DocId>,
        missing: Vec<DocId>,
    }

    impl ActionTarget for Recorder {
        fn execute(&mut self, action: &Action) -> Result<()> {
            if self.missing.contains(&action.oid) {
                return Err(Error::ResourceNotFound(action.oid));
            }
            self.seen.push(action.oid);
            Ok(())
        }
    }

    fn test_db() -> (tempfile::TempDir, QueueDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = QueueDb::open(&tmp.path().join("queue.redb")).unwrap();
        (tmp, db)
    }

    fn add(oid: DocId) -> Action {
        Action::add(IndexKey::new("c", "i"), oid, ActionMode::Deferred, None)
    }

    fn once() -> ProcessOptions {
        ProcessOptions {
            sleep: Duration::ZERO,
            once: true,
        }
    }

    #[test]
    fn engage_is_idempotent() {
        let (_tmp, db) = test_db();
        let p = BasicActionProcessor::new(&db);
        assert!(!p.active().unwrap());
        p.engage().unwrap();
        p.engage().unwrap();
        assert!(p.active().unwrap());
        assert!(db.load(DEFAULT_QUEUE).unwrap().unwrap().active);
    }

    #[test]
    fn add_requires_an_engaged_queue() {
        let (_tmp, db) = test_db();
        let p = BasicActionProcessor::new(&db);
        let err = p.add(vec![add(1)]).unwrap_err();
        assert!(matches!(err, Error::QueueNotEngaged));
    }

    #[test]
    fn process_once_drains_and_disengages() {
        let (_tmp, db) = test_db();
        let p = BasicActionProcessor::new(&db);
        p.engage().unwrap();
        p.connection().begin().unwrap();
        p.add(vec![add(2), add(1), add(3)]).unwrap();
        p.connection().commit().unwrap();

        let mut target = Recorder {
            missing: vec![3],
            ..Recorder::default()
        };
        let stop = AtomicBool::new(false);
        let stats = p.process(&mut target, &once(), &stop).unwrap();

        assert_eq!(target.seen, vec![1, 2]);
        assert_eq!(stats.executed, 2);
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.batches, 1);
        assert!(db.load(DEFAULT_QUEUE).unwrap().is_none());
    }

    #[test]
    fn stop_still_drains_leftovers() {
        let (_tmp, db) = test_db();
        let p = BasicActionProcessor::new(&db).with_queue_name("other");
        p.engage().unwrap();
        p.connection().begin().unwrap();
        p.add(vec![add(7)]).unwrap();
        p.connection().commit().unwrap();

        let mut target = Recorder::default();
        let stop = AtomicBool::new(true);
        let options = ProcessOptions {
            sleep: Duration::from_secs(60),
            once: false,
        };
        let stats = p.process(&mut target, &options, &stop).unwrap();
        assert_eq!(stats.batches, 0);
        assert_eq!(target.seen, vec![7]);
        assert!(db.load("other").unwrap().is_none());
    }

    #[test]
    fn failing_action_aborts_the_batch() {
        struct Broken;
        impl ActionTarget for Broken {
            fn execute(&mut self, _: &Action) -> Result<()> {
                Err(Error::Config("broken index".into()))
            }
        }

        let (_tmp, db) = test_db();
        let p = BasicActionProcessor::new(&db);
        p.engage().unwrap();
        p.connection().begin().unwrap();
        p.add(vec![add(1)]).unwrap();
        p.connection().commit().unwrap();

        let stop = AtomicBool::new(false);
        assert!(p.process(&mut Broken, &once(), &stop).is_err());
        let queue = db.load(DEFAULT_QUEUE).unwrap().unwrap();
        assert_eq!(queue.actions, vec![add(1)], "batch was not consumed");
    }

    #[test]
    fn append_during_disengage_is_drained() {
        let (_tmp, db) = test_db();
        let p = BasicActionProcessor::new(&db);
        p.engage().unwrap();
        commit_with_tries(p.connection(), 1, || p.add(vec![add(1)])).unwrap();

        p.connection().begin().unwrap();
        let leftover = p.take_queue().unwrap();
        assert_eq!(leftover, vec![add(1)]);

        let writer = BasicActionProcessor::new(&db);
        commit_with_tries(writer.connection(), 1, || {
            writer.add(vec![add(2)])
        })
        .unwrap();

        let mut target = Recorder::default();
        let mut stats = ProcessStats::default();
        p.settle(leftover, &mut target, &mut stats).unwrap();

        assert_eq!(target.seen, vec![1, 2]);
        assert_eq!(stats.conflicts, 1);
        assert_eq!(stats.batches, 1);
        assert!(db.load(DEFAULT_QUEUE).unwrap().is_none());
    }

    #[test]
    fn racing_writers_never_strand_actions() {
        let (_tmp, db) = test_db();
        for round in 0..8 {
            let p = BasicActionProcessor::new(&db);
            p.engage().unwrap();
            let stop = AtomicBool::new(false);
            let mut target = Recorder::default();

            let rejected = thread::scope(|scope| {
                let db = db.clone();
                let writer = scope.spawn(move || {
                    let w = BasicActionProcessor::new(&db);
                    let conn = w.connection();
                    let mut rejected = Vec::new();
                    for oid in 0..20 {
                        let push = || w.add(vec![add(oid)]);
                        let queued = commit_with_tries(conn, 5, push);
                        match queued {
                            Ok(()) => {}
                            Err(Error::QueueNotEngaged) => rejected.push(oid),
                            Err(err) => panic!("round {round}: {err}"),
                        }
                    }
                    rejected
                });
                p.process(&mut target, &once(), &stop).unwrap();
                writer.join().unwrap()
            });

            let mut seen: Vec<DocId> = target.seen.clone();
            seen.extend(rejected);
            seen.sort_unstable();
            seen.dedup();
            assert_eq!(seen, (0..20).collect::<Vec<_>>(), "round {round}");
            assert!(db.load(DEFAULT_QUEUE).unwrap().is_none());
        }
    }
}
