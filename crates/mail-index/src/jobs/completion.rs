//! Bounded completion tracking for fanned-out sub-jobs

use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex};

use super::job::Job;
use super::queue::Scheduler;

/// Counts finished sub-jobs and wakes whoever waits for them
#[derive(Debug, Default)]
pub struct CompletionTracker {
    completed: Mutex<usize>,
    changed: Condvar,
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one finished sub-job, whatever its outcome
    pub fn complete(&self) {
        *self.completed.lock() += 1;
        self.changed.notify_all();
    }

    pub fn completed(&self) -> usize {
        *self.completed.lock()
    }

    /// Block until at least `count` sub-jobs finished
    pub fn wait_for(&self, count: usize) {
        let mut completed = self.completed.lock();
        while *completed < count {
            self.changed.wait(&mut completed);
        }
    }
}

/// Submits sub-jobs to the scheduler and waits for a known number of them
///
/// At most `capacity` submitted sub-jobs are in flight; a full service makes
/// `submit` wait. While waiting the caller runs its own still-queued
/// sub-jobs, so a single worker never deadlocks on its children.
pub struct CompletionService<'a> {
    scheduler: &'a dyn Scheduler,
    tracker: Arc<CompletionTracker>,
    capacity: usize,
    submitted: Vec<String>,
}

impl<'a> CompletionService<'a> {
    pub fn new(scheduler: &'a dyn Scheduler, capacity: usize) -> Self {
        Self {
            scheduler,
            tracker: Arc::new(CompletionTracker::new()),
            capacity: capacity.max(1),
            submitted: Vec::new(),
        }
    }

    /// Hand a sub-job to the scheduler, running it here if refused
    pub fn submit(&mut self, job: Job) {
        if self.in_flight() >= self.capacity {
            let target = self.submitted.len() + 1 - self.capacity;
            self.await_completions(target);
        }

        let identifier = job.identifier().to_string();
        match self.scheduler.add_tracked(job, Arc::clone(&self.tracker)) {
            Ok(()) => {}
            Err(job) => {
                debug!("Scheduler refused sub-job {}, running it inline", identifier);
                job.perform(self.scheduler);
                self.tracker.complete();
            }
        }
        self.submitted.push(identifier);
    }

    pub fn submitted(&self) -> usize {
        self.submitted.len()
    }

    pub fn in_flight(&self) -> usize {
        self.submitted.len().saturating_sub(self.tracker.completed())
    }

    /// Block until `count` of the submitted sub-jobs finished
    pub fn await_completions(&self, count: usize) {
        let count = count.min(self.submitted.len());
        for identifier in &self.submitted {
            if self.tracker.completed() >= count {
                return;
            }
            self.scheduler.run_pending_inline(identifier);
        }
        self.tracker.wait_for(count);
    }

    /// Block until every submitted sub-job finished
    pub fn wait_all(&self) {
        self.await_completions(self.submitted.len());
    }
}
