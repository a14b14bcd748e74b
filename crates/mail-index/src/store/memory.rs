//! In-memory mail store
//!
//! Backs the test suite and embedders that already hold their mail in
//! memory. Folders are separated by `/`.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ops::Range;

use anyhow::{Result, bail};
use parking_lot::RwLock;

use super::MailStoreReader;
use crate::models::{
    FolderInfo, FolderKey, MailMessage, MailboxKey, MessageField, MessageFlags, MessageId,
    SortOrder,
};

const SEPARATOR: char = '/';

type Folders = BTreeMap<String, BTreeMap<MessageId, MailMessage>>;

/// In-memory implementation of MailStoreReader with mutation helpers
#[derive(Default)]
pub struct InMemoryMailStore {
    mailboxes: RwLock<HashMap<MailboxKey, Folders>>,
}

impl InMemoryMailStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty folder (no-op if it exists)
    pub fn create_folder(&self, key: &FolderKey) {
        self.mailboxes
            .write()
            .entry(key.mailbox)
            .or_default()
            .entry(key.folder.clone())
            .or_default();
    }

    /// Delete a folder together with its messages
    pub fn delete_folder(&self, key: &FolderKey) -> bool {
        self.mailboxes
            .write()
            .get_mut(&key.mailbox)
            .is_some_and(|folders| folders.remove(&key.folder).is_some())
    }

    /// Insert or replace a message, creating its folder on demand
    pub fn put_message(&self, message: MailMessage) {
        self.mailboxes
            .write()
            .entry(message.mailbox)
            .or_default()
            .entry(message.folder.clone())
            .or_default()
            .insert(message.id.clone(), message);
    }

    pub fn remove_message(&self, key: &FolderKey, id: &MessageId) -> Option<MailMessage> {
        self.mailboxes
            .write()
            .get_mut(&key.mailbox)
            .and_then(|folders| folders.get_mut(&key.folder))
            .and_then(|messages| messages.remove(id))
    }

    /// Replace the system flags of a message
    pub fn set_flags(&self, key: &FolderKey, id: &MessageId, flags: MessageFlags) -> Result<()> {
        self.update_message(key, id, |message| message.flags = flags)
    }

    /// Apply an in-place edit to a stored message
    pub fn update_message(
        &self,
        key: &FolderKey,
        id: &MessageId,
        edit: impl FnOnce(&mut MailMessage),
    ) -> Result<()> {
        let mut mailboxes = self.mailboxes.write();
        let Some(message) = mailboxes
            .get_mut(&key.mailbox)
            .and_then(|folders| folders.get_mut(&key.folder))
            .and_then(|messages| messages.get_mut(id))
        else {
            bail!("message {} not found in {}", id, key);
        };
        edit(message);
        Ok(())
    }

    pub fn count_messages(&self, key: &FolderKey) -> usize {
        self.mailboxes
            .read()
            .get(&key.mailbox)
            .and_then(|folders| folders.get(&key.folder))
            .map_or(0, BTreeMap::len)
    }
}

/// Direct child of `parent` that `name` lives under, if any
fn child_of<'a>(parent: &str, name: &'a str) -> Option<&'a str> {
    let rest = if parent.is_empty() {
        name
    } else {
        name.strip_prefix(parent)?.strip_prefix(SEPARATOR)?
    };
    if rest.is_empty() {
        return None;
    }
    let child_len = rest.find(SEPARATOR).unwrap_or(rest.len());
    Some(&name[..name.len() - rest.len() + child_len])
}

impl MailStoreReader for InMemoryMailStore {
    fn list_subfolders(&self, mailbox: &MailboxKey, parent: &str) -> Result<Vec<FolderInfo>> {
        let mailboxes = self.mailboxes.read();
        let Some(folders) = mailboxes.get(mailbox) else {
            return Ok(Vec::new());
        };

        let children: BTreeSet<&str> = folders
            .keys()
            .filter_map(|name| child_of(parent, name))
            .collect();

        Ok(children
            .into_iter()
            .map(|child| FolderInfo {
                full_name: child.to_string(),
                has_subfolders: folders.keys().any(|name| {
                    name.strip_prefix(child)
                        .is_some_and(|rest| rest.starts_with(SEPARATOR))
                }),
                holds_messages: folders.contains_key(child),
            })
            .collect())
    }

    fn folder_exists(&self, mailbox: &MailboxKey, folder: &str) -> Result<bool> {
        Ok(self
            .mailboxes
            .read()
            .get(mailbox)
            .is_some_and(|folders| folders.contains_key(folder)))
    }

    fn search_messages(
        &self,
        mailbox: &MailboxKey,
        folder: &str,
        range: Option<Range<usize>>,
        sort: SortOrder,
        fields: &[MessageField],
    ) -> Result<Vec<MailMessage>> {
        let mailboxes = self.mailboxes.read();
        let Some(messages) = mailboxes.get(mailbox).and_then(|folders| folders.get(folder))
        else {
            bail!("folder {} does not exist", folder);
        };

        let mut listed: Vec<&MailMessage> = messages.values().collect();
        match sort {
            SortOrder::Natural => {}
            SortOrder::ReceivedAscending => listed.sort_by_key(|m| m.received_at),
            SortOrder::ReceivedDescending => {
                listed.sort_by_key(|m| std::cmp::Reverse(m.received_at))
            }
        }

        let range = range.unwrap_or(0..listed.len());
        Ok(listed
            .into_iter()
            .skip(range.start)
            .take(range.end.saturating_sub(range.start))
            .map(|m| m.project(fields))
            .collect())
    }

    fn get_messages(
        &self,
        mailbox: &MailboxKey,
        folder: &str,
        ids: &[MessageId],
        fields: &[MessageField],
    ) -> Result<Vec<MailMessage>> {
        let mailboxes = self.mailboxes.read();
        let Some(messages) = mailboxes.get(mailbox).and_then(|folders| folders.get(folder))
        else {
            bail!("folder {} does not exist", folder);
        };

        Ok(ids
            .iter()
            .filter_map(|id| messages.get(id))
            .map(|m| m.project(fields))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SYNC_FIELDS;
    use chrono::{Duration, Utc};

    fn mailbox() -> MailboxKey {
        MailboxKey::new(1, 7, 0)
    }

    fn message(folder: &FolderKey, id: &str, age_hours: i64) -> MailMessage {
        MailMessage::builder(folder, id)
            .subject(format!("Message {}", id))
            .received_at(Utc::now() - Duration::hours(age_hours))
            .flags(MessageFlags::SEEN)
            .build()
    }

    #[test]
    fn test_list_subfolders() {
        let store = InMemoryMailStore::new();
        for name in ["INBOX", "INBOX/Receipts", "INBOX/Receipts/2024", "Archive/2023"] {
            store.create_folder(&mailbox().folder(name));
        }

        let top = store.list_subfolders(&mailbox(), "").unwrap();
        let names: Vec<_> = top.iter().map(|f| f.full_name.as_str()).collect();
        assert_eq!(names, vec!["Archive", "INBOX"]);

        // "Archive" only exists as a parent path
        assert!(!top[0].holds_messages);
        assert!(top[0].has_subfolders);
        assert!(top[1].holds_messages);

        let inbox_children = store.list_subfolders(&mailbox(), "INBOX").unwrap();
        assert_eq!(inbox_children.len(), 1);
        assert_eq!(inbox_children[0].full_name, "INBOX/Receipts");
        assert!(inbox_children[0].has_subfolders);
    }

    #[test]
    fn test_search_messages_sorted_and_ranged() {
        let store = InMemoryMailStore::new();
        let inbox = mailbox().folder("INBOX");
        store.put_message(message(&inbox, "a", 3));
        store.put_message(message(&inbox, "b", 1));
        store.put_message(message(&inbox, "c", 2));

        let newest_first = store
            .search_messages(&mailbox(), "INBOX", None, SortOrder::ReceivedDescending, SYNC_FIELDS)
            .unwrap();
        let ids: Vec<_> = newest_first.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c", "a"]);
        assert!(newest_first[0].subject.is_empty(), "subject was not requested");

        let page = store
            .search_messages(&mailbox(), "INBOX", Some(1..2), SortOrder::ReceivedAscending, &[])
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id.as_str(), "c");
    }

    #[test]
    fn test_get_messages_skips_missing_ids() {
        let store = InMemoryMailStore::new();
        let inbox = mailbox().folder("INBOX");
        store.put_message(message(&inbox, "a", 1));

        let found = store
            .get_messages(
                &mailbox(),
                "INBOX",
                &[MessageId::new("a"), MessageId::new("gone")],
                SYNC_FIELDS,
            )
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].flags, MessageFlags::SEEN);
    }

    #[test]
    fn test_missing_folder() {
        let store = InMemoryMailStore::new();
        assert!(!store.folder_exists(&mailbox(), "INBOX").unwrap());
        assert!(
            store
                .search_messages(&mailbox(), "INBOX", None, SortOrder::Natural, &[])
                .is_err()
        );
    }

    #[test]
    fn test_set_flags() {
        let store = InMemoryMailStore::new();
        let inbox = mailbox().folder("INBOX");
        store.put_message(message(&inbox, "a", 1));
        store
            .set_flags(&inbox, &MessageId::new("a"), MessageFlags::FLAGGED)
            .unwrap();

        let found = store
            .get_messages(&mailbox(), "INBOX", &[MessageId::new("a")], SYNC_FIELDS)
            .unwrap();
        assert_eq!(found[0].flags, MessageFlags::FLAGGED);
        assert!(store.set_flags(&inbox, &MessageId::new("zzz"), MessageFlags::SEEN).is_err());
    }
}
