//! Bookkeeping record for folder reconciliation

use super::FolderKey;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Last-synced bookkeeping for one folder
///
/// One record exists per folder that has been reconciled at least once.
/// `syncing` is the cross-process exclusivity flag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub key: FolderKey,
    /// When the last reconciliation completed (None if never)
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Whether some job currently holds the folder
    pub syncing: bool,
    /// When the current holder acquired the folder
    pub sync_started_at: Option<DateTime<Utc>>,
}

impl SyncRecord {
    /// A fresh record that has never completed a sync
    pub fn new(key: FolderKey) -> Self {
        Self {
            key,
            last_synced_at: None,
            syncing: false,
            sync_started_at: None,
        }
    }

    /// Whether the current holder has exceeded the lock lease
    pub fn lock_expired(&self, now: DateTime<Utc>, lease: chrono::Duration) -> bool {
        match (self.syncing, self.sync_started_at) {
            (false, _) => true,
            (true, None) => true,
            (true, Some(started)) => now - started >= lease,
        }
    }
}
