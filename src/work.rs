//! The executor: walks the finalized command graph with a fixed set of
//! worker threads.
//!
//! Scheduling state is a mutex-guarded heap of ready commands plus one
//! atomic per command: its state byte and its count of unfinished
//! dependencies.  Workers pop the best ready command, decide skip or
//! run, and on completion decrement each dependent's counter; the
//! counter reaching zero is the only way a command becomes ready, so
//! every dependent starts strictly after its dependencies end.  A
//! failure marks all transitive dependents failed without running them;
//! independent branches keep draining.

use crate::db;
use crate::error::{Error, Result};
use crate::fs::FileStorage;
use crate::graph::{CmdId, CommandGraph};
use crate::hash;
use crate::progress::{CmdState, Outcome, Progress, StateCounts};
use crate::signal;

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, SystemTime};

#[derive(Clone)]
pub struct Options {
    /// Worker thread count.
    pub parallelism: usize,
    /// Per-command wall-clock timeout.
    pub timeout: Option<Duration>,
    /// How long a cancelled command gets between SIGTERM and the kill.
    pub grace: Duration,
    /// Command-line byte limit before a response file is used.
    pub max_argv_bytes: usize,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            parallelism: std::thread::available_parallelism()
                .map(usize::from)
                .unwrap_or(1),
            timeout: None,
            grace: Duration::from_millis(500),
            max_argv_bytes: crate::command::default_max_argv_bytes(),
        }
    }
}

/// Counts of commands by terminal state after a run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: usize,
    pub failed: usize,
    /// Failed without being spawned, because a dependency failed.
    pub propagated: usize,
    pub skipped: usize,
}

impl Summary {
    pub fn ok(&self) -> bool {
        self.failed == 0 && self.propagated == 0
    }

    /// Commands actually executed.
    pub fn ran(&self) -> usize {
        self.succeeded + self.failed
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "succeeded={}, failed={}, skipped={}, propagated={}",
            self.succeeded, self.failed, self.skipped, self.propagated
        )
    }
}

// Command state bytes.  PROPAGATED is a failure that never spawned.
const PENDING: u8 = 0;
const READY: u8 = 1;
const RUNNING: u8 = 2;
const SUCCEEDED: u8 = 3;
const FAILED: u8 = 4;
const PROPAGATED: u8 = 5;
const SKIPPED: u8 = 6;

fn display_state(s: u8) -> CmdState {
    match s {
        PENDING => CmdState::Pending,
        READY => CmdState::Ready,
        RUNNING => CmdState::Running,
        SUCCEEDED => CmdState::Succeeded,
        FAILED | PROPAGATED => CmdState::Failed,
        _ => CmdState::Skipped,
    }
}

fn is_terminal(s: u8) -> bool {
    matches!(s, SUCCEEDED | FAILED | PROPAGATED | SKIPPED)
}

/// Heap entry for ready commands.  `Ord` is arranged so the heap pops
/// the command that should run first: lowest strict order, then most
/// dependents (critical-path bias), then lexicographic name.
struct ReadyEntry {
    order: i32,
    fanout: usize,
    name: String,
    id: CmdId,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .order
            .cmp(&self.order)
            .then_with(|| self.fanout.cmp(&other.fanout))
            .then_with(|| other.name.cmp(&self.name))
            .then_with(|| other.id.cmp(&self.id))
    }
}

/// Handle for cancelling a run from another thread; idempotent.
#[derive(Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

pub struct Work<'a> {
    graph: &'a CommandGraph,
    fsx: &'a FileStorage,
    store: Mutex<db::Store>,
    progress: Mutex<&'a mut (dyn Progress + Send)>,
    options: &'a Options,
    log_dir: PathBuf,
    cancel: Arc<AtomicBool>,

    states: Vec<AtomicU8>,
    remaining: Vec<AtomicUsize>,
    ready: Mutex<BinaryHeap<ReadyEntry>>,
    wakeup: Condvar,
    terminal: AtomicUsize,
    counts: Mutex<StateCounts>,
}

impl<'a> Work<'a> {
    pub fn new(
        graph: &'a CommandGraph,
        fsx: &'a FileStorage,
        store: db::Store,
        options: &'a Options,
        log_dir: PathBuf,
        progress: &'a mut (dyn Progress + Send),
    ) -> Self {
        assert!(graph.is_finalized(), "graph must be finalized before execution");
        let n = graph.len();
        let mut counts = StateCounts::default();
        counts.add(CmdState::Pending, n);
        Work {
            graph,
            fsx,
            store: Mutex::new(store),
            progress: Mutex::new(progress),
            options,
            log_dir,
            cancel: Arc::new(AtomicBool::new(false)),
            states: (0..n).map(|_| AtomicU8::new(PENDING)).collect(),
            remaining: (0..n).map(|_| AtomicUsize::new(0)).collect(),
            ready: Mutex::new(BinaryHeap::new()),
            wakeup: Condvar::new(),
            terminal: AtomicUsize::new(0),
            counts: Mutex::new(counts),
        }
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        CancelHandle(self.cancel.clone())
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed) || signal::was_interrupted()
    }

    /// Run every command to a terminal state.  Returns the terminal
    /// counts; the run as a whole succeeded iff `summary.ok()`.
    pub fn run(&self) -> Result<Summary> {
        let total = self.graph.len();
        if total == 0 {
            return Ok(Summary::default());
        }

        for id in self.graph.ids() {
            self.remaining[id.index()].store(self.graph.deps(id).len(), Ordering::SeqCst);
        }
        for id in self.graph.ids() {
            if self.graph.deps(id).is_empty() {
                self.make_ready(id);
            }
        }

        let workers = self.options.parallelism.clamp(1, total);
        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while let Some(id) = self.next_ready() {
                        self.run_one(id);
                    }
                });
            }
        });

        Ok(self.summarize())
    }

    fn next_ready(&self) -> Option<CmdId> {
        let mut ready = self.ready.lock().unwrap();
        loop {
            if let Some(entry) = ready.pop() {
                return Some(entry.id);
            }
            if self.terminal.load(Ordering::SeqCst) >= self.graph.len() {
                return None;
            }
            ready = self.wakeup.wait(ready).unwrap();
        }
    }

    fn run_one(&self, id: CmdId) {
        let cmd = self.graph.command(id);

        // No new commands start once cancellation is requested.
        if self.cancelled() {
            self.finish_failed(id, Error::Cancelled);
            return;
        }

        let stored = self.store.lock().unwrap().lookup(cmd.identity());
        match cmd.is_outdated(self.fsx, stored.as_ref()) {
            Ok(false) => {
                self.set_state(id, SKIPPED);
                self.progress.lock().unwrap().task_finished(cmd, &Outcome::Skipped);
                self.finish_ok(id);
            }
            Ok(true) => {
                self.set_state(id, RUNNING);
                self.progress.lock().unwrap().task_started(cmd);
                let result = cmd.execute(
                    self.fsx,
                    &self.log_dir,
                    &self.cancel,
                    self.options.timeout,
                    self.options.grace,
                );
                match result.and_then(|output| {
                    self.persist(cmd)?;
                    Ok(output)
                }) {
                    Ok(output) => {
                        self.set_state(id, SUCCEEDED);
                        self.progress
                            .lock()
                            .unwrap()
                            .task_finished(cmd, &Outcome::Succeeded { output: &output });
                        self.finish_ok(id);
                    }
                    Err(err) => {
                        if matches!(err, Error::Cancelled) {
                            // Partial outputs of an interrupted command
                            // must not be mistaken for real ones.
                            cmd.clean();
                        }
                        self.finish_failed(id, err);
                    }
                }
            }
            Err(err) => self.finish_failed(id, err),
        }
    }

    /// Make the fingerprint of a successful run durable.  Runs before
    /// any dependent is queued.
    fn persist(&self, cmd: &crate::command::Command) -> Result<()> {
        let fingerprint = cmd.fingerprint(self.fsx)?;
        let run_mtime = hash::encode_mtime(SystemTime::now());
        self.store
            .lock()
            .unwrap()
            .record(cmd.identity(), fingerprint, run_mtime)
    }

    fn finish_ok(&self, id: CmdId) {
        for &dep in self.graph.dependents(id) {
            if self.remaining[dep.index()].fetch_sub(1, Ordering::SeqCst) == 1 {
                self.make_ready(dep);
            }
        }
        self.mark_terminal();
    }

    fn finish_failed(&self, id: CmdId, err: Error) {
        let cmd = self.graph.command(id);
        let message = match &err {
            Error::ExitNonZero { stderr_tail, .. } if !stderr_tail.is_empty() => {
                format!("{}\n{}", err, stderr_tail)
            }
            _ => err.to_string(),
        };
        self.set_state(id, FAILED);
        self.progress
            .lock()
            .unwrap()
            .task_finished(cmd, &Outcome::Failed { message });
        self.mark_terminal();

        // Everything downstream can never run.
        let mut stack: Vec<CmdId> = self.graph.dependents(id).to_vec();
        while let Some(dep) = stack.pop() {
            if self.cas_state(dep, PENDING, PROPAGATED) {
                self.mark_terminal();
                stack.extend_from_slice(self.graph.dependents(dep));
            }
        }
    }

    fn make_ready(&self, id: CmdId) {
        if !self.cas_state(id, PENDING, READY) {
            // Already failed by propagation.
            return;
        }
        let cmd = self.graph.command(id);
        let entry = ReadyEntry {
            order: cmd.strict_order(),
            fanout: self.graph.dependents(id).len(),
            name: cmd.name().to_owned(),
            id,
        };
        self.ready.lock().unwrap().push(entry);
        self.wakeup.notify_one();
    }

    fn mark_terminal(&self) {
        self.terminal.fetch_add(1, Ordering::SeqCst);
        // Take the queue lock before notifying: a worker that already
        // read the old count is either still holding the lock (and will
        // re-read after we release) or parked in wait (and gets woken).
        // Notifying without the lock could slip between its check and
        // its wait and strand it forever.
        let _ready = self.ready.lock().unwrap();
        self.wakeup.notify_all();
    }

    fn set_state(&self, id: CmdId, to: u8) {
        let from = self.states[id.index()].swap(to, Ordering::SeqCst);
        self.note_transition(from, to);
    }

    fn cas_state(&self, id: CmdId, from: u8, to: u8) -> bool {
        let swapped = self.states[id.index()]
            .compare_exchange(from, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            self.note_transition(from, to);
        }
        swapped
    }

    fn note_transition(&self, from: u8, to: u8) {
        let mut counts = self.counts.lock().unwrap();
        counts.sub(display_state(from), 1);
        counts.add(display_state(to), 1);
        self.progress.lock().unwrap().update(&counts);
    }

    fn summarize(&self) -> Summary {
        let mut summary = Summary::default();
        for state in &self.states {
            match state.load(Ordering::SeqCst) {
                SUCCEEDED => summary.succeeded += 1,
                FAILED => summary.failed += 1,
                PROPAGATED => summary.propagated += 1,
                SKIPPED => summary.skipped += 1,
                other => debug_assert!(is_terminal(other), "non-terminal state after run"),
            }
        }
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(order: i32, fanout: usize, name: &str, id: usize) -> ReadyEntry {
        ReadyEntry {
            order,
            fanout,
            name: name.to_owned(),
            id: CmdId(id),
        }
    }

    #[test]
    fn heap_pops_lowest_strict_order_first() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(1, 0, "b", 0));
        heap.push(entry(0, 0, "a", 1));
        heap.push(entry(2, 0, "c", 2));
        assert_eq!(heap.pop().unwrap().id, CmdId(1));
        assert_eq!(heap.pop().unwrap().id, CmdId(0));
        assert_eq!(heap.pop().unwrap().id, CmdId(2));
    }

    #[test]
    fn heap_prefers_higher_fanout_within_an_order() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, 1, "a", 0));
        heap.push(entry(0, 5, "b", 1));
        assert_eq!(heap.pop().unwrap().id, CmdId(1));
    }

    #[test]
    fn heap_breaks_ties_by_name() {
        let mut heap = BinaryHeap::new();
        heap.push(entry(0, 0, "zeta", 0));
        heap.push(entry(0, 0, "alpha", 1));
        assert_eq!(heap.pop().unwrap().id, CmdId(1));
    }

    #[test]
    fn summary_formats_like_a_report() {
        let s = Summary {
            succeeded: 1,
            failed: 1,
            propagated: 1,
            skipped: 0,
        };
        assert_eq!(s.to_string(), "succeeded=1, failed=1, skipped=0, propagated=1");
        assert!(!s.ok());
        assert_eq!(s.ran(), 2);
    }
}
