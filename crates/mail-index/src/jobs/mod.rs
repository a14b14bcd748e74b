//! Sync jobs and their scheduling
//!
//! Every job shares the identity/ranking/gate pattern of [`SyncJob`]:
//! - [`FolderJob`] reconciles one folder between store and index
//! - [`AddByIdJob`], [`ChangeByIdJob`], [`RemoveByIdJob`] and
//!   [`FlagsObserverJob`] apply event-driven changes to explicit id lists
//! - [`MailAccountJob`] and [`ElapsedFolderJob`] discover folders to reconcile
//!
//! [`JobQueue`] admits, merges and runs them on a worker pool.

mod completion;
mod discovery;
mod folder;
mod gate;
mod incremental;
mod job;
mod queue;
mod reconcile;

pub use completion::{CompletionService, CompletionTracker};
pub use discovery::{ElapsedFolderJob, MailAccountJob};
pub use folder::{FolderJob, FolderJobOptions, FolderJobState, FolderSyncStats};
pub use gate::{GateState, JobGate};
pub use incremental::{AddByIdJob, ChangeByIdJob, FlagsObserverJob, RemoveByIdJob};
pub use job::{Job, JobCore, JobOutcome, SyncJob};
pub use queue::{JobQueue, QueueStats, Scheduler};
pub use reconcile::{SyncDelta, compute_delta};

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Duration;
use log::{debug, warn};

use crate::bookkeeping::SyncBookkeeping;
use crate::index::{IndexAdapter, IndexError};
use crate::models::{MailMessage, MessageId};
use crate::store::MailStoreReader;

/// Ranking of discovery jobs
pub const RANK_DISCOVERY: i32 = -10;
/// Ranking of regular folder reconciliations
pub const RANK_FOLDER: i32 = 0;
/// Ranking of folder reconciliations that skip the staleness check
pub const RANK_FORCED_FOLDER: i32 = 5;
/// Ranking of event-driven incremental jobs
pub const RANK_INCREMENTAL: i32 = 10;

/// Tuning shared by all jobs
#[derive(Debug, Clone)]
pub struct JobSettings {
    /// Minimum time between two reconciliations of a folder
    pub staleness: Duration,
    /// A `syncing` flag older than this may be taken over
    pub lock_lease: Duration,
    /// Ids per addition chunk; 0 processes the whole set as one chunk
    pub chunk_size: usize,
    /// Submit addition chunks as sub-jobs instead of running them inline
    pub fan_out: bool,
    /// Sub-jobs a folder job keeps in flight
    pub completion_capacity: usize,
    /// Ids per store or index lookup
    pub id_query_chunk: usize,
}

impl Default for JobSettings {
    fn default() -> Self {
        Self {
            staleness: Duration::hours(1),
            lock_lease: Duration::hours(1),
            chunk_size: 0,
            fan_out: false,
            completion_capacity: 16,
            id_query_chunk: 500,
        }
    }
}

/// Collaborators handed to every job
#[derive(Clone)]
pub struct SyncServices {
    pub store: Arc<dyn MailStoreReader>,
    pub bookkeeping: Arc<dyn SyncBookkeeping>,
    pub index: Arc<dyn IndexAdapter>,
    pub settings: Arc<JobSettings>,
}

impl SyncServices {
    pub fn new(
        store: Arc<dyn MailStoreReader>,
        bookkeeping: Arc<dyn SyncBookkeeping>,
        index: Arc<dyn IndexAdapter>,
        settings: JobSettings,
    ) -> Self {
        Self {
            store,
            bookkeeping,
            index,
            settings: Arc::new(settings),
        }
    }
}

/// Result of a batch write with per-message fallback
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOutcome {
    pub written: usize,
    /// Messages that failed on their own
    pub failed: Vec<MessageId>,
}

/// Write a batch; if the batch fails, retry each message on its own
///
/// Each message that still fails is logged once at warn level. Only an
/// interruption aborts.
fn write_with_fallback(
    messages: &[MailMessage],
    what: &str,
    write: impl Fn(&[MailMessage]) -> Result<(), IndexError>,
) -> Result<WriteOutcome, IndexError> {
    let mut outcome = WriteOutcome::default();
    if messages.is_empty() {
        return Ok(outcome);
    }

    match write(messages) {
        Ok(()) => {
            outcome.written = messages.len();
            return Ok(outcome);
        }
        Err(IndexError::Interrupted) => return Err(IndexError::Interrupted),
        Err(e) if messages.len() == 1 => {
            warn!("Failed to {} message {}: {}", what, messages[0].id, e);
            outcome.failed.push(messages[0].id.clone());
            return Ok(outcome);
        }
        Err(e) => {
            debug!(
                "Batch {} of {} messages failed, retrying one by one: {}",
                what,
                messages.len(),
                e
            );
        }
    }

    for message in messages {
        match write(std::slice::from_ref(message)) {
            Ok(()) => outcome.written += 1,
            Err(IndexError::Interrupted) => return Err(IndexError::Interrupted),
            Err(e) => {
                warn!("Failed to {} message {}: {}", what, message.id, e);
                outcome.failed.push(message.id.clone());
            }
        }
    }
    Ok(outcome)
}

/// `add` with per-message fallback
pub fn add_with_fallback(
    index: &dyn IndexAdapter,
    messages: &[MailMessage],
) -> Result<WriteOutcome, IndexError> {
    write_with_fallback(messages, "index", |batch| index.add(batch))
}

/// `change` with per-message fallback
pub fn change_with_fallback(
    index: &dyn IndexAdapter,
    messages: &[MailMessage],
) -> Result<WriteOutcome, IndexError> {
    write_with_fallback(messages, "update", |batch| index.change(batch))
}

/// Hand freshly indexed messages to the enrichment sink
fn submit_content(index: &dyn IndexAdapter, messages: &[MailMessage], outcome: &WriteOutcome) {
    let failed: HashSet<&MessageId> = outcome.failed.iter().collect();
    for message in messages {
        if !failed.contains(&message.id) {
            index.add_content(message);
        }
    }
    index.flush_content();
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fixtures shared by the job tests

    use super::*;
    use crate::bookkeeping::SqliteBookkeeping;
    use crate::index::{IndexSettings, InMemoryIndexBackend, SearchIndex};
    use crate::models::{FolderKey, MailboxKey, MessageFlags};
    use crate::store::InMemoryMailStore;

    pub struct Fixture {
        pub store: Arc<InMemoryMailStore>,
        pub backend: Arc<InMemoryIndexBackend>,
        pub bookkeeping: Arc<SqliteBookkeeping>,
        pub services: SyncServices,
    }

    pub fn mailbox() -> MailboxKey {
        MailboxKey::new(1, 42, 0)
    }

    pub fn inbox() -> FolderKey {
        mailbox().folder("INBOX")
    }

    pub fn message(folder: &FolderKey, id: &str) -> MailMessage {
        MailMessage::builder(folder, id)
            .subject(format!("Subject {}", id))
            .flags(MessageFlags::SEEN)
            .build()
    }

    pub fn fixture(settings: JobSettings) -> Fixture {
        let store = Arc::new(InMemoryMailStore::new());
        let backend = Arc::new(InMemoryIndexBackend::new());
        let bookkeeping = Arc::new(SqliteBookkeeping::in_memory().unwrap());
        let index = Arc::new(SearchIndex::new(backend.clone(), IndexSettings::default()));
        let services = SyncServices::new(store.clone(), bookkeeping.clone(), index, settings);
        Fixture {
            store,
            backend,
            bookkeeping,
            services,
        }
    }
}
