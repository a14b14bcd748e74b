//! Job abstraction: identity, ranking, gate and the tagged job variants

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};

use anyhow::Result;
use log::{debug, error};

use super::discovery::{ElapsedFolderJob, MailAccountJob};
use super::folder::FolderJob;
use super::gate::JobGate;
use super::incremental::{AddByIdJob, ChangeByIdJob, FlagsObserverJob, RemoveByIdJob};
use super::queue::Scheduler;
use crate::cancel::CancelToken;

/// How a call to [`SyncJob::perform`] ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The gate was already PERFORMING or the job was cancelled beforehand
    Skipped,
    Completed,
    /// The body failed and the job was cancelled
    Failed,
}

/// State every job carries regardless of its kind
#[derive(Debug)]
pub struct JobCore {
    identifier: String,
    ranking: AtomicI32,
    gate: JobGate,
    cancelled: AtomicBool,
    failed: AtomicBool,
    cancel_token: CancelToken,
}

impl JobCore {
    pub fn new(identifier: impl Into<String>, ranking: i32) -> Self {
        Self {
            identifier: identifier.into(),
            ranking: AtomicI32::new(ranking),
            gate: JobGate::new(),
            cancelled: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            cancel_token: CancelToken::new(),
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn ranking(&self) -> i32 {
        self.ranking.load(Ordering::Acquire)
    }

    pub fn gate(&self) -> &JobGate {
        &self.gate
    }

    /// Token observed by paging and chunk loops of this job
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel_token
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    fn set_ranking(&self, ranking: i32) {
        self.ranking.store(ranking, Ordering::Release);
    }
}

/// A unit of index synchronization work
///
/// Implementors supply the body (`execute`), the payload merge and the
/// kind-specific cancel cleanup; the gate discipline is provided.
pub trait SyncJob: Send + Sync {
    fn core(&self) -> &JobCore;

    /// The job body, run at most once per instance
    fn execute(&self, scheduler: &dyn Scheduler) -> Result<()>;

    /// Copy the mutable payload of `other` into this job
    ///
    /// Called with the gate held in REPLACED. Returns false if `other` is
    /// not of the same kind.
    fn merge_from(&self, other: &Job) -> bool;

    /// Kind-specific cleanup, run once on the first [`SyncJob::cancel`]
    fn on_cancel(&self) {}

    fn identifier(&self) -> &str {
        self.core().identifier()
    }

    fn ranking(&self) -> i32 {
        self.core().ranking()
    }

    /// Run the job unless it already ran
    ///
    /// Failures are logged and end in [`SyncJob::cancel`]; they never
    /// propagate to the scheduler.
    fn perform(&self, scheduler: &dyn Scheduler) -> JobOutcome {
        let core = self.core();
        if !core.gate().try_begin_perform() {
            debug!("Job {} already performing, skipping", core.identifier());
            return JobOutcome::Skipped;
        }
        if core.is_cancelled() {
            debug!("Job {} was cancelled before it ran", core.identifier());
            return JobOutcome::Skipped;
        }

        match self.execute(scheduler) {
            Ok(()) => JobOutcome::Completed,
            Err(e) => {
                core.failed.store(true, Ordering::Release);
                error!("Job {} failed: {:#}", core.identifier(), e);
                self.cancel();
                JobOutcome::Failed
            }
        }
    }

    /// Merge a newer job with the same identifier into this one
    ///
    /// Refused once this job is PERFORMING.
    fn replace_with(&self, other: &Job) -> bool {
        let core = self.core();
        if other.identifier() != core.identifier() {
            return false;
        }

        let merged = core
            .gate()
            .replace(|| {
                let merged = self.merge_from(other);
                if merged {
                    core.set_ranking(other.ranking());
                }
                merged
            })
            .unwrap_or(false);

        if merged {
            debug!("Merged newer payload into job {}", core.identifier());
        }
        merged
    }

    /// Mark the job non-retriable and run the cleanup; safe to call repeatedly
    fn cancel(&self) {
        let core = self.core();
        core.cancel_token().cancel();
        if !core.cancelled.swap(true, Ordering::AcqRel) {
            self.on_cancel();
        }
    }
}

/// Every concrete job kind the queue schedules
pub enum Job {
    Folder(FolderJob),
    AddById(AddByIdJob),
    ChangeById(ChangeByIdJob),
    RemoveById(RemoveByIdJob),
    FlagsObserver(FlagsObserverJob),
    MailAccount(MailAccountJob),
    ElapsedFolder(ElapsedFolderJob),
}

impl Job {
    pub fn as_sync_job(&self) -> &dyn SyncJob {
        match self {
            Job::Folder(job) => job,
            Job::AddById(job) => job,
            Job::ChangeById(job) => job,
            Job::RemoveById(job) => job,
            Job::FlagsObserver(job) => job,
            Job::MailAccount(job) => job,
            Job::ElapsedFolder(job) => job,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Job::Folder(_) => "folder",
            Job::AddById(_) => "add",
            Job::ChangeById(_) => "change",
            Job::RemoveById(_) => "remove",
            Job::FlagsObserver(_) => "flags",
            Job::MailAccount(_) => "account",
            Job::ElapsedFolder(_) => "elapsed",
        }
    }

    pub fn identifier(&self) -> &str {
        self.as_sync_job().identifier()
    }

    pub fn ranking(&self) -> i32 {
        self.as_sync_job().ranking()
    }

    pub fn core(&self) -> &JobCore {
        self.as_sync_job().core()
    }

    pub fn perform(&self, scheduler: &dyn Scheduler) -> JobOutcome {
        self.as_sync_job().perform(scheduler)
    }

    pub fn replace_with(&self, other: &Job) -> bool {
        self.as_sync_job().replace_with(other)
    }

    pub fn cancel(&self) {
        self.as_sync_job().cancel()
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("kind", &self.kind())
            .field("identifier", &self.identifier())
            .field("ranking", &self.ranking())
            .finish()
    }
}
