//! Bookkeeping trait definitions

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::models::{FolderKey, MailboxKey, SyncRecord};

/// Outcome of an exclusivity attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// The caller now holds the folder
    Acquired,
    /// The folder was synced within the staleness span
    RecentlySynced,
    /// Another actor holds the folder
    Held,
}

/// Parameters of an exclusivity attempt
#[derive(Debug, Clone, Copy)]
pub struct AcquireOptions {
    pub now: DateTime<Utc>,
    /// Refuse when the folder was synced after this instant (None = forced)
    pub not_synced_since: Option<DateTime<Utc>>,
    /// A holder older than this lease is considered dead
    pub lease: Duration,
    /// Token the acquisition is stored under; release, renew and delete must present it
    pub owner: Uuid,
}

impl AcquireOptions {
    /// Acquire unless synced within `staleness`
    pub fn stale_after(staleness: Duration, lease: Duration) -> Self {
        let now = Utc::now();
        Self {
            now,
            not_synced_since: Some(now - staleness),
            lease,
            owner: Uuid::new_v4(),
        }
    }

    /// Acquire regardless of when the folder was last synced
    pub fn forced(lease: Duration) -> Self {
        Self {
            now: Utc::now(),
            not_synced_since: None,
            lease,
            owner: Uuid::new_v4(),
        }
    }
}

/// Store for folder sync records
pub trait SyncBookkeeping: Send + Sync {
    /// Get the record for a folder
    fn record(&self, key: &FolderKey) -> Result<Option<SyncRecord>>;

    /// Create an idle, never-synced record; returns false if one exists
    fn insert_if_absent(&self, key: &FolderKey) -> Result<bool>;

    /// Set the syncing flag if it is clear (or its holder's lease expired)
    fn try_acquire(&self, key: &FolderKey, options: AcquireOptions) -> Result<Acquisition>;

    /// Restart the lease of a held folder; false if `owner` no longer holds it
    fn renew(&self, key: &FolderKey, owner: Uuid, now: DateTime<Utc>) -> Result<bool>;

    /// Clear the syncing flag held by `owner`, recording a completed sync
    /// when `synced_at` is given
    ///
    /// Returns false (and changes nothing) if someone else holds the folder.
    fn release(&self, key: &FolderKey, owner: Uuid, synced_at: Option<DateTime<Utc>>) -> Result<bool>;

    /// Drop the record of a folder unless another owner holds it
    fn delete(&self, key: &FolderKey, owner: Uuid) -> Result<bool>;

    /// Records of a mailbox that were never synced or last synced before `older_than`
    fn list_stale(&self, mailbox: &MailboxKey, older_than: DateTime<Utc>) -> Result<Vec<SyncRecord>>;
}
