//! Priority job queue with merge-on-admission and a worker pool

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex};

use super::completion::CompletionTracker;
use super::job::{Job, JobOutcome};

/// Scheduling surface jobs see while they run
pub trait Scheduler: Send + Sync {
    /// Merge into a queued job of the same identifier or admit a new one
    ///
    /// Returns false when the queue is full, shut down, or a job with the
    /// same identifier is running.
    fn add_job(&self, job: Job) -> bool;

    /// Whether a queued job outranks `ranking`
    fn has_higher_ranked_job_in_queue(&self, ranking: i32) -> bool;

    /// Admit a sub-job whose completion is reported to `tracker`
    ///
    /// Never merges; a refused job is handed back.
    fn add_tracked(&self, job: Job, tracker: Arc<CompletionTracker>) -> Result<(), Job>;

    /// Take a still-queued job out of the queue and run it on this thread
    fn run_pending_inline(&self, identifier: &str) -> bool;
}

/// Counters of queue activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub admitted: u64,
    pub merged: u64,
    pub rejected: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Default)]
struct Counters {
    admitted: AtomicU64,
    merged: AtomicU64,
    rejected: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
}

/// Heap key: highest ranking first, then lowest arrival number
#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    ranking: i32,
    seq: u64,
    identifier: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.ranking
            .cmp(&other.ranking)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct Pending {
    job: Arc<Job>,
    tracker: Option<Arc<CompletionTracker>>,
    seq: u64,
    ranking: i32,
}

struct Dispatch {
    job: Arc<Job>,
    tracker: Option<Arc<CompletionTracker>>,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<HeapEntry>,
    pending: HashMap<String, Pending>,
    running: HashMap<String, Arc<Job>>,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    /// Heap entries left behind by merges and inline runs are skipped
    fn is_current(&self, entry: &HeapEntry) -> bool {
        self.pending
            .get(&entry.identifier)
            .is_some_and(|p| p.seq == entry.seq && p.ranking == entry.ranking)
    }

    fn discard_stale(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_current(top) {
                return;
            }
            self.heap.pop();
        }
    }

    fn take_next(&mut self) -> Option<Dispatch> {
        while let Some(entry) = self.heap.pop() {
            if !self.is_current(&entry) {
                continue;
            }
            if let Some(pending) = self.pending.remove(&entry.identifier) {
                self.running
                    .insert(entry.identifier, Arc::clone(&pending.job));
                return Some(Dispatch {
                    job: pending.job,
                    tracker: pending.tracker,
                });
            }
        }
        None
    }

    fn admit(&mut self, job: Job, tracker: Option<Arc<CompletionTracker>>) {
        let identifier = job.identifier().to_string();
        let ranking = job.ranking();
        let seq = self.next_seq;
        self.next_seq += 1;

        self.heap.push(HeapEntry {
            ranking,
            seq,
            identifier: identifier.clone(),
        });
        self.pending.insert(
            identifier,
            Pending {
                job: Arc::new(job),
                tracker,
                seq,
                ranking,
            },
        );
    }
}

/// Capacity-bounded priority queue of sync jobs
///
/// Jobs run strictly by descending ranking, FIFO within a ranking. A job
/// whose identifier is already queued is merged into the queued one.
pub struct JobQueue {
    state: Mutex<QueueState>,
    available: Condvar,
    capacity: usize,
    counters: Counters,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            capacity: capacity.max(1),
            counters: Counters::default(),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn `workers` threads pulling jobs until shutdown
    pub fn start(self: &Arc<Self>, workers: usize) -> std::io::Result<()> {
        let mut handles = self.workers.lock();
        for n in 0..workers.max(1) {
            let queue = Arc::clone(self);
            let handle = std::thread::Builder::new()
                .name(format!("index-sync-worker-{}", n))
                .spawn(move || queue.worker_loop())?;
            handles.push(handle);
        }
        info!("Started {} index sync workers", handles.len());
        Ok(())
    }

    fn worker_loop(&self) {
        while let Some(dispatch) = self.next_blocking() {
            self.run(dispatch);
        }
        debug!("Index sync worker exiting");
    }

    fn next_blocking(&self) -> Option<Dispatch> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(dispatch) = state.take_next() {
                return Some(dispatch);
            }
            self.available.wait(&mut state);
        }
    }

    fn run(&self, dispatch: Dispatch) {
        let Dispatch { job, tracker } = dispatch;

        let outcome = catch_unwind(AssertUnwindSafe(|| job.perform(self)));
        match outcome {
            Ok(JobOutcome::Failed) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(_) => {
                self.counters.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                error!("Job {} panicked", job.identifier());
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                job.cancel();
            }
        }

        {
            let mut state = self.state.lock();
            if state
                .running
                .get(job.identifier())
                .is_some_and(|running| Arc::ptr_eq(running, &job))
            {
                state.running.remove(job.identifier());
            }
        }
        if let Some(tracker) = tracker {
            tracker.complete();
        }
    }

    /// Run queued jobs on the calling thread until the queue is empty
    ///
    /// Returns the number of jobs dispatched.
    pub fn drain(&self) -> usize {
        let mut ran = 0;
        loop {
            let next = {
                let mut state = self.state.lock();
                if state.shutdown {
                    break;
                }
                state.take_next()
            };
            match next {
                Some(dispatch) => {
                    self.run(dispatch);
                    ran += 1;
                }
                None => break,
            }
        }
        ran
    }

    /// Stop admitting, cancel queued and running jobs and join the workers
    pub fn shutdown(&self) {
        let (pending, running) = {
            let mut state = self.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.heap.clear();
            let pending: Vec<Pending> = state.pending.drain().map(|(_, p)| p).collect();
            let running: Vec<Arc<Job>> = state.running.values().cloned().collect();
            (pending, running)
        };
        self.available.notify_all();

        info!(
            "Shutting down job queue: {} queued, {} running",
            pending.len(),
            running.len()
        );
        for entry in pending {
            entry.job.cancel();
            if let Some(tracker) = entry.tracker {
                tracker.complete();
            }
        }
        for job in running {
            job.cancel();
        }

        let current = std::thread::current().id();
        let handles: Vec<_> = self.workers.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                warn!("Index sync worker panicked");
            }
        }
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            admitted: self.counters.admitted.load(Ordering::Relaxed),
            merged: self.counters.merged.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            completed: self.counters.completed.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// The queued (not yet running) job with this identifier
    pub fn pending_job(&self, identifier: &str) -> Option<Arc<Job>> {
        self.state
            .lock()
            .pending
            .get(identifier)
            .map(|p| Arc::clone(&p.job))
    }

    /// Identifiers of queued jobs in dispatch order
    pub fn pending_identifiers(&self) -> Vec<String> {
        let state = self.state.lock();
        let mut pending: Vec<&Pending> = state.pending.values().collect();
        pending.sort_by(|a, b| b.ranking.cmp(&a.ranking).then(a.seq.cmp(&b.seq)));
        pending
            .into_iter()
            .map(|p| p.job.identifier().to_string())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn running_count(&self) -> usize {
        self.state.lock().running.len()
    }

    fn reject(&self, identifier: &str, reason: &str) {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        debug!("Job {} not admitted: {}", identifier, reason);
    }
}

impl Scheduler for JobQueue {
    fn add_job(&self, job: Job) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let identifier = job.identifier().to_string();

        if state.shutdown {
            self.reject(&identifier, "queue shut down");
            return false;
        }

        if let Some(pending) = state.pending.get_mut(&identifier) {
            if !pending.job.replace_with(&job) {
                self.reject(&identifier, "queued job refused the merge");
                return false;
            }
            let ranking = pending.job.ranking();
            let seq = pending.seq;
            if ranking != pending.ranking {
                pending.ranking = ranking;
                state.heap.push(HeapEntry {
                    ranking,
                    seq,
                    identifier,
                });
            }
            self.counters.merged.fetch_add(1, Ordering::Relaxed);
            drop(guard);
            self.available.notify_one();
            return true;
        }

        if state.running.contains_key(&identifier) {
            self.reject(&identifier, "a job with this identifier is running");
            return false;
        }
        if state.pending.len() >= self.capacity {
            self.reject(&identifier, "queue at capacity");
            return false;
        }

        state.admit(job, None);
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        drop(guard);
        self.available.notify_one();
        true
    }

    fn has_higher_ranked_job_in_queue(&self, ranking: i32) -> bool {
        let mut state = self.state.lock();
        state.discard_stale();
        state.heap.peek().is_some_and(|top| top.ranking > ranking)
    }

    fn add_tracked(&self, job: Job, tracker: Arc<CompletionTracker>) -> Result<(), Job> {
        let mut state = self.state.lock();
        let identifier = job.identifier();
        if state.shutdown
            || state.pending.contains_key(identifier)
            || state.running.contains_key(identifier)
            || state.pending.len() >= self.capacity
        {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(job);
        }

        state.admit(job, Some(tracker));
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn run_pending_inline(&self, identifier: &str) -> bool {
        let dispatch = {
            let mut state = self.state.lock();
            if state.shutdown {
                return false;
            }
            let Some(pending) = state.pending.remove(identifier) else {
                return false;
            };
            state
                .running
                .insert(identifier.to_string(), Arc::clone(&pending.job));
            Dispatch {
                job: pending.job,
                tracker: pending.tracker,
            }
        };
        self.run(dispatch);
        true
    }
}

impl Drop for JobQueue {
    fn drop(&mut self) {
        self.shutdown();
    }
}
