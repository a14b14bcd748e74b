//! Folder reconciliation job

use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};
use parking_lot::Mutex;
use uuid::Uuid;

use super::completion::CompletionService;
use super::incremental::AddByIdJob;
use super::job::{Job, JobCore, SyncJob};
use super::queue::Scheduler;
use super::reconcile::compute_delta;
use super::{
    JobSettings, RANK_FOLDER, RANK_FORCED_FOLDER, SyncServices, add_with_fallback,
    change_with_fallback, submit_content,
};
use crate::bookkeeping::{AcquireOptions, Acquisition, staleness_elapsed};
use crate::index::IndexError;
use crate::models::{FolderKey, INDEXABLE_FIELDS, MessageId, SYNC_FIELDS, SortOrder};

/// Per-run options of a folder job
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FolderJobOptions {
    /// Skip the run if the folder was synced within this span
    pub staleness: Duration,
    /// Ignore the staleness span
    pub force: bool,
    /// Leave index documents of vanished messages alone
    pub ignore_deleted: bool,
    /// Ids per addition chunk; 0 means one chunk
    pub chunk_size: usize,
    /// Submit addition chunks as sub-jobs
    pub fan_out: bool,
    /// This run resumes a run that yielded and already holds the folder
    pub continuation: bool,
}

impl FolderJobOptions {
    pub fn from_settings(settings: &JobSettings) -> Self {
        Self {
            staleness: settings.staleness,
            force: false,
            ignore_deleted: false,
            chunk_size: settings.chunk_size,
            fan_out: settings.fan_out,
            continuation: false,
        }
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Where a folder job is in its run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FolderJobState {
    Created,
    AcquiringExclusivity,
    Reconciling,
    Converging,
    Done,
    Cancelled,
}

/// Statistics from one folder reconciliation
#[derive(Debug, Default, Clone, PartialEq)]
pub struct FolderSyncStats {
    /// Messages missing from the index
    pub new_messages: usize,
    /// Messages added in this run (inline chunks only)
    pub indexed: usize,
    /// Messages whose flags were pushed to the index
    pub changed: usize,
    /// Index documents removed
    pub deleted: usize,
    /// Messages that failed individually
    pub failed: usize,
    /// Chunks handed to sub-jobs
    pub fanned_out: usize,
    /// The run stopped early and re-enqueued a continuation
    pub yielded: bool,
    /// The folder vanished from the store
    pub folder_removed: bool,
    /// Duration of the run
    pub duration_ms: u64,
}

pub(super) fn folder_identifier(folder: &FolderKey) -> String {
    format!("folder:{}", folder)
}

/// Reconciles one folder between mail store and index
pub struct FolderJob {
    core: JobCore,
    folder: FolderKey,
    services: SyncServices,
    options: Mutex<FolderJobOptions>,
    state: Mutex<FolderJobState>,
    /// Token under which this run (or the run it continues) holds the folder
    owner: Mutex<Option<Uuid>>,
    stats: Mutex<Option<FolderSyncStats>>,
}

/// Clears the syncing flag when the run ends, whichever way it ends
struct FolderLock<'a> {
    job: &'a FolderJob,
    owner: Uuid,
    active: bool,
}

impl FolderLock<'_> {
    /// Release and record a completed sync
    fn complete(mut self, synced_at: DateTime<Utc>) {
        self.release(Some(synced_at));
    }

    /// Release without touching the last-synced timestamp
    fn abandon(mut self) {
        self.release(None);
    }

    /// Keep the flag set; the continuation or row removal takes it over
    fn hand_over(mut self) {
        self.active = false;
    }

    fn release(&mut self, synced_at: Option<DateTime<Utc>>) {
        if !self.active {
            return;
        }
        self.active = false;
        let job = self.job;
        match job.services.bookkeeping.release(&job.folder, self.owner, synced_at) {
            Ok(true) => {}
            Ok(false) => warn!("Sync flag of {} was taken over before release", job.folder),
            Err(e) => warn!("Failed to release sync flag of {}: {:#}", job.folder, e),
        }
    }
}

impl Drop for FolderLock<'_> {
    fn drop(&mut self) {
        self.release(None);
    }
}

impl FolderJob {
    /// Job with the configured defaults
    pub fn new(folder: FolderKey, services: SyncServices) -> Self {
        let options = FolderJobOptions::from_settings(&services.settings);
        Self::with_options(folder, services, options)
    }

    pub fn with_options(folder: FolderKey, services: SyncServices, options: FolderJobOptions) -> Self {
        let ranking = if options.force {
            RANK_FORCED_FOLDER
        } else {
            RANK_FOLDER
        };
        Self::build(folder_identifier(&folder), ranking, folder, services, options, None)
    }

    fn build(
        identifier: String,
        ranking: i32,
        folder: FolderKey,
        services: SyncServices,
        options: FolderJobOptions,
        owner: Option<Uuid>,
    ) -> Self {
        Self {
            core: JobCore::new(identifier, ranking),
            folder,
            services,
            owner: Mutex::new(owner),
            options: Mutex::new(options),
            state: Mutex::new(FolderJobState::Created),
            stats: Mutex::new(None),
        }
    }

    pub fn folder(&self) -> &FolderKey {
        &self.folder
    }

    pub fn options(&self) -> FolderJobOptions {
        *self.options.lock()
    }

    pub fn state(&self) -> FolderJobState {
        *self.state.lock()
    }

    /// Statistics of the finished run, if it got past exclusivity
    pub fn stats(&self) -> Option<FolderSyncStats> {
        self.stats.lock().clone()
    }

    fn owner(&self) -> Option<Uuid> {
        *self.owner.lock()
    }

    fn set_state(&self, state: FolderJobState) {
        *self.state.lock() = state;
    }

    /// A fresh job resuming the remaining work of this one
    ///
    /// Gets its own identifier so it is admitted while this run is still
    /// registered as running, and inherits this run's hold on the folder.
    fn continuation(&self) -> FolderJob {
        let mut options = self.options();
        options.continuation = true;
        let identifier = format!(
            "{}#cont-{}",
            folder_identifier(&self.folder),
            Uuid::new_v4().simple()
        );
        Self::build(
            identifier,
            self.ranking(),
            self.folder.clone(),
            self.services.clone(),
            options,
            self.owner(),
        )
    }

    /// Set the syncing flag; bookkeeping failures count as "not acquired"
    fn acquire(&self, options: &FolderJobOptions) -> Option<Uuid> {
        let bookkeeping = &self.services.bookkeeping;
        let lease = self.services.settings.lock_lease;

        if let Err(e) = bookkeeping.insert_if_absent(&self.folder) {
            warn!("Bookkeeping unavailable for {}: {:#}", self.folder, e);
            return None;
        }

        if !options.force {
            match bookkeeping.record(&self.folder) {
                Ok(Some(record)) if !staleness_elapsed(record.last_synced_at, options.staleness) => {
                    debug!("Folder {} was synced recently, skipping", self.folder);
                    return None;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Bookkeeping unavailable for {}: {:#}", self.folder, e);
                    return None;
                }
            }
        }

        let attempt = if options.force {
            AcquireOptions::forced(lease)
        } else {
            AcquireOptions::stale_after(options.staleness, lease)
        };
        match bookkeeping.try_acquire(&self.folder, attempt) {
            Ok(Acquisition::Acquired) => {
                *self.owner.lock() = Some(attempt.owner);
                Some(attempt.owner)
            }
            Ok(Acquisition::RecentlySynced) => {
                debug!("Folder {} was synced recently, skipping", self.folder);
                None
            }
            Ok(Acquisition::Held) => {
                debug!("Folder {} is being synced elsewhere, skipping", self.folder);
                None
            }
            Err(e) => {
                warn!("Could not acquire {}: {:#}", self.folder, e);
                None
            }
        }
    }

    /// Restart the lease inherited from the yielding run
    ///
    /// Fails if the folder was taken over while this continuation waited.
    fn renew(&self, owner: Uuid) -> bool {
        match self.services.bookkeeping.renew(&self.folder, owner, Utc::now()) {
            Ok(true) => true,
            Ok(false) => {
                warn!(
                    "Folder {} was taken over while its continuation was queued, dropping it",
                    self.folder
                );
                self.owner.lock().take();
                false
            }
            Err(e) => {
                warn!("Could not renew sync flag of {}: {:#}", self.folder, e);
                false
            }
        }
    }

    /// Index new messages chunk by chunk; returns how many ids were handled
    fn add_new(
        &self,
        scheduler: &dyn Scheduler,
        options: &FolderJobOptions,
        new_ids: &[MessageId],
        stats: &mut FolderSyncStats,
    ) -> Result<usize> {
        if new_ids.is_empty() {
            return Ok(0);
        }

        let chunk_size = match options.chunk_size {
            0 => new_ids.len(),
            size => size,
        };
        let settings = &self.services.settings;
        let mut completion = options
            .fan_out
            .then(|| CompletionService::new(scheduler, settings.completion_capacity));

        let mut processed = 0;
        let mut interrupted = false;
        for (n, chunk) in new_ids.chunks(chunk_size).enumerate() {
            if n > 0 {
                if self.core.cancel_token().is_cancelled() {
                    interrupted = true;
                    break;
                }
                if scheduler.has_higher_ranked_job_in_queue(self.ranking()) {
                    debug!(
                        "Yielding {} after {} of {} new messages",
                        self.folder,
                        processed,
                        new_ids.len()
                    );
                    break;
                }
            }

            match completion.as_mut() {
                Some(service) => {
                    let sub_job = AddByIdJob::chunk(
                        self.folder.clone(),
                        chunk.to_vec(),
                        self.services.clone(),
                        self.ranking(),
                    );
                    service.submit(Job::AddById(sub_job));
                    stats.fanned_out += 1;
                }
                None => self.index_chunk(chunk, stats)?,
            }
            processed += chunk.len();
        }

        // Sub-jobs must not outlive the hold on the folder
        if let Some(service) = completion {
            service.wait_all();
        }
        if interrupted {
            return Err(IndexError::Interrupted.into());
        }
        Ok(processed)
    }

    /// Fetch full messages for a chunk and add them with per-message fallback
    fn index_chunk(&self, chunk: &[MessageId], stats: &mut FolderSyncStats) -> Result<()> {
        let store = &self.services.store;
        let index = self.services.index.as_ref();

        let mut messages = Vec::with_capacity(chunk.len());
        for ids in chunk.chunks(self.services.settings.id_query_chunk.max(1)) {
            messages.extend(store.get_messages(
                &self.folder.mailbox,
                &self.folder.folder,
                ids,
                INDEXABLE_FIELDS,
            )?);
        }

        let outcome = add_with_fallback(index, &messages)?;
        submit_content(index, &messages, &outcome);
        stats.indexed += outcome.written;
        stats.failed += outcome.failed.len();
        Ok(())
    }

    fn reconcile(&self, scheduler: &dyn Scheduler) -> Result<()> {
        let start = Instant::now();
        let options = self.options();
        let mut stats = FolderSyncStats::default();

        self.set_state(FolderJobState::AcquiringExclusivity);
        let owner = match self.owner() {
            Some(owner) if self.renew(owner) => Some(owner),
            Some(_) => None,
            None => self.acquire(&options),
        };
        let Some(owner) = owner else {
            self.set_state(FolderJobState::Done);
            return Ok(());
        };
        let lock = FolderLock {
            job: self,
            owner,
            active: true,
        };

        self.set_state(FolderJobState::Reconciling);
        let store = &self.services.store;
        let index = self.services.index.as_ref();
        let cancel = self.core.cancel_token();

        if !store.folder_exists(&self.folder.mailbox, &self.folder.folder)? {
            info!("Folder {} no longer exists, dropping it from the index", self.folder);
            index.delete_folder(&self.folder)?;
            self.services.bookkeeping.delete(&self.folder, owner)?;
            lock.hand_over();
            stats.folder_removed = true;
            stats.duration_ms = start.elapsed().as_millis() as u64;
            *self.stats.lock() = Some(stats);
            self.set_state(FolderJobState::Done);
            return Ok(());
        }

        let store_side = store.search_messages(
            &self.folder.mailbox,
            &self.folder.folder,
            None,
            SortOrder::Natural,
            SYNC_FIELDS,
        )?;
        let index_side = index.all_messages(&self.folder, SYNC_FIELDS, cancel)?;
        let delta = compute_delta(&store_side, &index_side, options.ignore_deleted);
        stats.new_messages = delta.new_ids.len();

        self.set_state(FolderJobState::Converging);
        if !delta.deleted_ids.is_empty() {
            index.delete_messages(&self.folder, &delta.deleted_ids)?;
            stats.deleted = delta.deleted_ids.len();
        }
        if !delta.changed.is_empty() {
            let outcome = change_with_fallback(index, &delta.changed)?;
            stats.changed = outcome.written;
            stats.failed += outcome.failed.len();
        }

        let processed = self.add_new(scheduler, &options, &delta.new_ids, &mut stats)?;
        if processed < delta.new_ids.len() {
            let continuation = self.continuation();
            let identifier = continuation.identifier().to_string();
            if scheduler.add_job(Job::Folder(continuation)) {
                debug!("Re-enqueued {} as {}", self.folder, identifier);
                stats.yielded = true;
                lock.hand_over();
            } else {
                warn!(
                    "Could not re-enqueue {}, {} new messages left for the next run",
                    self.folder,
                    delta.new_ids.len() - processed
                );
                lock.abandon();
            }
        } else {
            lock.complete(Utc::now());
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(
            "Synced folder {}: {} new ({} indexed), {} changed, {} deleted, {} failed{} in {}ms",
            self.folder,
            stats.new_messages,
            stats.indexed,
            stats.changed,
            stats.deleted,
            stats.failed,
            if stats.yielded { ", yielded" } else { "" },
            stats.duration_ms
        );
        *self.stats.lock() = Some(stats);
        self.set_state(FolderJobState::Done);
        Ok(())
    }
}

impl SyncJob for FolderJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, scheduler: &dyn Scheduler) -> Result<()> {
        self.reconcile(scheduler)
    }

    fn merge_from(&self, other: &Job) -> bool {
        match other {
            Job::Folder(other) if other.folder == self.folder => {
                *self.options.lock() = other.options();
                true
            }
            _ => false,
        }
    }

    fn on_cancel(&self) {
        self.set_state(FolderJobState::Cancelled);
        let Some(owner) = self.owner() else {
            return;
        };
        match self.services.bookkeeping.delete(&self.folder, owner) {
            Ok(true) => debug!("Dropped sync record of cancelled {}", self.folder),
            Ok(false) => debug!("Sync record of {} is held elsewhere, keeping it", self.folder),
            Err(e) => warn!("Failed to drop sync record of {}: {:#}", self.folder, e),
        }
    }
}
