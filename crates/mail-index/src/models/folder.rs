//! Mailbox and folder identity

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one mail account of one user inside one tenant context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MailboxKey {
    pub context_id: i32,
    pub user_id: i32,
    pub account_id: i32,
}

impl MailboxKey {
    pub fn new(context_id: i32, user_id: i32, account_id: i32) -> Self {
        Self {
            context_id,
            user_id,
            account_id,
        }
    }

    /// Key for a folder of this mailbox
    pub fn folder(&self, name: impl Into<String>) -> FolderKey {
        FolderKey {
            mailbox: *self,
            folder: name.into(),
        }
    }
}

impl fmt::Display for MailboxKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.context_id, self.user_id, self.account_id)
    }
}

/// Identifies one folder of one mailbox
///
/// This is the key of a bookkeeping row and the scope of a folder job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderKey {
    pub mailbox: MailboxKey,
    pub folder: String,
}

impl FolderKey {
    pub fn new(mailbox: MailboxKey, folder: impl Into<String>) -> Self {
        Self {
            mailbox,
            folder: folder.into(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.folder
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.mailbox, self.folder)
    }
}

/// A folder as reported by the mail store's folder listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderInfo {
    /// Full folder name including parents, e.g. "INBOX/Receipts"
    pub full_name: String,
    /// Whether the folder has children worth descending into
    pub has_subfolders: bool,
    /// Whether the folder can contain messages (some are containers only)
    pub holds_messages: bool,
}

impl FolderInfo {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            has_subfolders: false,
            holds_messages: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_folder_key_display() {
        let key = MailboxKey::new(1, 42, 0).folder("INBOX/Receipts");
        assert_eq!(key.to_string(), "1/42/0/INBOX/Receipts");
        assert_eq!(key.as_str(), "INBOX/Receipts");
    }

    #[test]
    fn test_folder_keys_compare_by_mailbox_and_name() {
        let mailbox = MailboxKey::new(1, 2, 3);
        assert_eq!(mailbox.folder("INBOX"), FolderKey::new(mailbox, "INBOX"));
        assert_ne!(mailbox.folder("INBOX"), MailboxKey::new(1, 2, 4).folder("INBOX"));
    }
}
