//! Mail index crate - keeps a full-text mail index consistent with the mail store
//!
//! This crate provides:
//! - Domain models (MailMessage, FolderKey, SyncRecord)
//! - Mail store read trait with an in-memory implementation
//! - SQLite sync bookkeeping with cross-process exclusivity
//! - Index adapter over Tantivy, a remote JSON index service, or memory
//! - Sync jobs (folder reconciliation, incremental updates, discovery)
//! - Priority job queue with merge-on-admission and a worker pool
//!
//! The library logs through the `log` facade and never installs a logger.

pub mod bookkeeping;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod index;
pub mod jobs;
pub mod models;
pub mod store;

pub use bookkeeping::{AcquireOptions, Acquisition, SqliteBookkeeping, SyncBookkeeping, staleness_elapsed};
pub use cancel::CancelToken;
pub use config::{IndexBackendConfig, IndexConfig, SyncConfig};
pub use engine::{SyncEngine, open_backend};
pub use index::{
    ChannelContentSink, ContentItem, ContentSink, HttpIndexBackend, InMemoryIndexBackend,
    IndexAdapter, IndexBackend, IndexError, IndexErrorKind, IndexSettings, NoopContentSink,
    SearchCriteria, SearchIndex, TantivyBackend,
};
pub use jobs::{
    // Job kinds
    AddByIdJob, ChangeByIdJob, ElapsedFolderJob, FlagsObserverJob, FolderJob, MailAccountJob,
    RemoveByIdJob,
    // Job plumbing
    CompletionService, CompletionTracker, Job, JobOutcome, JobQueue, JobSettings, QueueStats,
    Scheduler, SyncJob, SyncServices,
    // Reconciliation
    FolderJobOptions, FolderJobState, FolderSyncStats, SyncDelta, compute_delta,
    add_with_fallback, change_with_fallback,
};
pub use models::{
    EmailAddress, FolderInfo, FolderKey, INDEXABLE_FIELDS, MailMessage, MailboxKey, MessageField,
    MessageFlags, MessageId, SYNC_FIELDS, SortOrder, SyncRecord,
};
pub use store::{InMemoryMailStore, MailStoreReader};
