//! Composition root wiring configuration, collaborators and the job queue

use std::collections::BTreeSet;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use chrono::Utc;
use log::{debug, info, warn};
use parking_lot::{Condvar, Mutex};

use crate::bookkeeping::SqliteBookkeeping;
use crate::config::{IndexBackendConfig, IndexConfig, SyncConfig};
use crate::index::{
    ContentSink, HttpIndexBackend, IndexBackend, SearchIndex, TantivyBackend,
};
use crate::jobs::{
    AddByIdJob, ChangeByIdJob, ElapsedFolderJob, FlagsObserverJob, FolderJob, FolderJobOptions,
    Job, JobQueue, MailAccountJob, QueueStats, RemoveByIdJob, Scheduler, SyncServices,
};
use crate::models::{FolderKey, MailMessage, MailboxKey, MessageId};
use crate::store::MailStoreReader;

/// Open the index backend a configuration names
pub fn open_backend(config: &IndexConfig) -> Result<Arc<dyn IndexBackend>> {
    let backend: Arc<dyn IndexBackend> = match &config.backend {
        IndexBackendConfig::Tantivy { path: Some(path) } => Arc::new(
            TantivyBackend::open(path)
                .with_context(|| format!("Failed to open search index at {}", path.display()))?,
        ),
        IndexBackendConfig::Tantivy { path: None } => {
            Arc::new(TantivyBackend::in_memory().context("Failed to create search index")?)
        }
        IndexBackendConfig::Http {
            url,
            read_timeout_ms,
        } => Arc::new(
            HttpIndexBackend::new(url, read_timeout_ms.map(StdDuration::from_millis))
                .with_context(|| format!("Invalid index service url {}", url))?,
        ),
    };
    Ok(backend)
}

/// Stop signal shared with the sweep thread
#[derive(Default)]
struct SweepSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

/// Keeps the index of the registered mailboxes in line with the mail store
///
/// Event hooks (`messages_added` and friends) enqueue incremental jobs;
/// `sync_account`/`sync_folder` enqueue reconciliations; a sweep thread
/// periodically re-checks folders whose last sync is older than the
/// staleness span.
pub struct SyncEngine {
    config: SyncConfig,
    services: SyncServices,
    queue: Arc<JobQueue>,
    mailboxes: Arc<Mutex<BTreeSet<MailboxKey>>>,
    signal: Arc<SweepSignal>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Build the engine from configuration around a mail store
    pub fn new(config: SyncConfig, store: Arc<dyn MailStoreReader>) -> Result<Self> {
        Self::build(config, store, None)
    }

    /// Like [`SyncEngine::new`], handing indexed messages to an enrichment sink
    pub fn with_content_sink(
        config: SyncConfig,
        store: Arc<dyn MailStoreReader>,
        sink: Arc<dyn ContentSink>,
    ) -> Result<Self> {
        Self::build(config, store, Some(sink))
    }

    fn build(
        config: SyncConfig,
        store: Arc<dyn MailStoreReader>,
        sink: Option<Arc<dyn ContentSink>>,
    ) -> Result<Self> {
        let bookkeeping = match &config.bookkeeping_db {
            Some(path) => SqliteBookkeeping::open(path)?,
            None => SqliteBookkeeping::in_memory()?,
        };

        let backend = open_backend(&config.index)?;
        let mut index = SearchIndex::new(backend, config.index.settings());
        if let Some(sink) = sink {
            index = index.with_content_sink(sink);
        }

        let services = SyncServices::new(
            store,
            Arc::new(bookkeeping),
            Arc::new(index),
            config.job_settings(),
        );
        Ok(Self::from_services(config, services))
    }

    /// Engine over caller-provided collaborators
    pub fn from_services(config: SyncConfig, services: SyncServices) -> Self {
        let queue = Arc::new(JobQueue::new(config.queue_capacity));
        Self {
            config,
            services,
            queue,
            mailboxes: Arc::new(Mutex::new(BTreeSet::new())),
            signal: Arc::new(SweepSignal::default()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn services(&self) -> &SyncServices {
        &self.services
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    pub fn stats(&self) -> QueueStats {
        self.queue.stats()
    }

    /// Start the worker pool and, if configured, the sweep thread
    pub fn start(&self) -> Result<()> {
        self.queue
            .start(self.config.workers)
            .context("Failed to start index sync workers")?;

        let interval = self.config.sweep_interval_secs;
        if interval == 0 {
            return Ok(());
        }

        let mut sweeper = self.sweeper.lock();
        if sweeper.is_some() {
            return Ok(());
        }
        let signal = Arc::clone(&self.signal);
        let mailboxes = Arc::clone(&self.mailboxes);
        let queue = Arc::clone(&self.queue);
        let services = self.services.clone();
        let handle = std::thread::Builder::new()
            .name("index-sync-sweeper".to_string())
            .spawn(move || {
                sweep_loop(
                    &signal,
                    &mailboxes,
                    queue.as_ref(),
                    &services,
                    StdDuration::from_secs(interval),
                )
            })
            .context("Failed to start sweep thread")?;
        *sweeper = Some(handle);
        info!("Sweeping stale folders every {}s", interval);
        Ok(())
    }

    /// Stop the sweep thread, cancel queued and running jobs and join the workers
    pub fn shutdown(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();
        if let Some(handle) = self.sweeper.lock().take()
            && handle.join().is_err()
        {
            warn!("Sweep thread panicked");
        }
        self.queue.shutdown();
    }

    /// Include a mailbox in the periodic sweep
    pub fn register_mailbox(&self, mailbox: MailboxKey) {
        if self.mailboxes.lock().insert(mailbox) {
            debug!("Registered mailbox {} for sweeping", mailbox);
        }
    }

    pub fn registered_mailboxes(&self) -> Vec<MailboxKey> {
        self.mailboxes.lock().iter().copied().collect()
    }

    /// Reconcile every folder of an account (or only `folders`)
    pub fn sync_account(&self, mailbox: MailboxKey, folders: Option<Vec<String>>) -> bool {
        self.register_mailbox(mailbox);
        let job = match folders {
            Some(folders) => MailAccountJob::with_filter(mailbox, folders, self.services.clone()),
            None => MailAccountJob::new(mailbox, self.services.clone()),
        };
        self.queue.add_job(Job::MailAccount(job))
    }

    /// Reconcile one folder; `force` ignores the staleness span
    pub fn sync_folder(&self, folder: FolderKey, force: bool) -> bool {
        self.register_mailbox(folder.mailbox);
        let mut options = FolderJobOptions::from_settings(&self.services.settings);
        if force {
            options = options.forced();
        }
        let job = FolderJob::with_options(folder, self.services.clone(), options);
        self.queue.add_job(Job::Folder(job))
    }

    pub fn messages_added(&self, folder: FolderKey, ids: Vec<MessageId>) -> bool {
        if ids.is_empty() {
            return true;
        }
        let job = AddByIdJob::new(folder, ids, self.services.clone());
        self.queue.add_job(Job::AddById(job))
    }

    pub fn messages_changed(&self, folder: FolderKey, ids: Vec<MessageId>) -> bool {
        if ids.is_empty() {
            return true;
        }
        let job = ChangeByIdJob::new(folder, ids, self.services.clone());
        self.queue.add_job(Job::ChangeById(job))
    }

    pub fn messages_removed(&self, folder: FolderKey, ids: Vec<MessageId>) -> bool {
        if ids.is_empty() {
            return true;
        }
        let job = RemoveByIdJob::new(folder, ids, self.services.clone());
        self.queue.add_job(Job::RemoveById(job))
    }

    /// Push flag changes from a store-side snapshot of messages
    pub fn flags_changed(&self, folder: FolderKey, snapshot: Vec<MailMessage>) -> bool {
        if snapshot.is_empty() {
            return true;
        }
        let job = FlagsObserverJob::new(folder, snapshot, self.services.clone());
        self.queue.add_job(Job::FlagsObserver(job))
    }

    /// Enqueue a stale-folder sweep for every registered mailbox now
    pub fn sweep(&self) -> usize {
        enqueue_sweep(&self.mailboxes, self.queue.as_ref(), &self.services)
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn enqueue_sweep(
    mailboxes: &Mutex<BTreeSet<MailboxKey>>,
    scheduler: &dyn Scheduler,
    services: &SyncServices,
) -> usize {
    let mailboxes: Vec<MailboxKey> = mailboxes.lock().iter().copied().collect();
    let now = Utc::now();
    let mut enqueued = 0;
    for mailbox in mailboxes {
        let job = ElapsedFolderJob::new(mailbox, now, services.clone());
        if scheduler.add_job(Job::ElapsedFolder(job)) {
            enqueued += 1;
        }
    }
    enqueued
}

fn sweep_loop(
    signal: &SweepSignal,
    mailboxes: &Mutex<BTreeSet<MailboxKey>>,
    scheduler: &dyn Scheduler,
    services: &SyncServices,
    interval: StdDuration,
) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        let enqueued = enqueue_sweep(mailboxes, scheduler, services);
        debug!("Sweep enqueued {} mailbox checks", enqueued);
    }
    debug!("Sweep thread exiting");
}
