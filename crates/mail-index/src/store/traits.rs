//! Mail store trait definitions

use std::ops::Range;

use crate::models::{FolderInfo, MailMessage, MailboxKey, MessageField, MessageId, SortOrder};
use anyhow::Result;

/// Read API of the mail store
///
/// Every call is scoped to one mailbox. Returned messages carry at least
/// their identity plus the requested fields; implementations may return more.
pub trait MailStoreReader: Send + Sync {
    /// List the direct children of `parent` ("" lists the top level)
    fn list_subfolders(&self, mailbox: &MailboxKey, parent: &str) -> Result<Vec<FolderInfo>>;

    /// Check whether a folder exists
    fn folder_exists(&self, mailbox: &MailboxKey, folder: &str) -> Result<bool>;

    /// List messages of a folder, optionally restricted to a range of the sorted result
    fn search_messages(
        &self,
        mailbox: &MailboxKey,
        folder: &str,
        range: Option<Range<usize>>,
        sort: SortOrder,
        fields: &[MessageField],
    ) -> Result<Vec<MailMessage>>;

    /// Fetch specific messages; ids that no longer exist are silently skipped
    fn get_messages(
        &self,
        mailbox: &MailboxKey,
        folder: &str,
        ids: &[MessageId],
        fields: &[MessageField],
    ) -> Result<Vec<MailMessage>>;
}
