//! Store/index diff for one folder

use std::collections::{HashMap, HashSet};

use crate::models::{MailMessage, MessageId};

/// Index mutations needed to make the index match the store
///
/// Every message id lands in at most one of the three buckets.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncDelta {
    /// In the store, missing from the index (store order)
    pub new_ids: Vec<MessageId>,
    /// In the index, gone from the store
    pub deleted_ids: Vec<MessageId>,
    /// In both with differing flags, color label or user flags; store copies
    pub changed: Vec<MailMessage>,
}

impl SyncDelta {
    pub fn is_empty(&self) -> bool {
        self.new_ids.is_empty() && self.deleted_ids.is_empty() && self.changed.is_empty()
    }
}

/// Diff the store's and the index's view of a folder
///
/// With `ignore_deleted` the deletion bucket stays empty.
pub fn compute_delta(store: &[MailMessage], index: &[MailMessage], ignore_deleted: bool) -> SyncDelta {
    let indexed: HashMap<&MessageId, &MailMessage> = index.iter().map(|m| (&m.id, m)).collect();
    let mut delta = SyncDelta::default();

    for message in store {
        match indexed.get(&message.id) {
            None => delta.new_ids.push(message.id.clone()),
            Some(copy) if message.sync_fields_differ(copy) => delta.changed.push(message.clone()),
            Some(_) => {}
        }
    }

    if !ignore_deleted {
        let live: HashSet<&MessageId> = store.iter().map(|m| &m.id).collect();
        delta.deleted_ids = index
            .iter()
            .filter(|m| !live.contains(&m.id))
            .map(|m| m.id.clone())
            .collect();
    }

    delta
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{MailboxKey, MessageFlags};

    fn msg(id: &str, flags: MessageFlags) -> MailMessage {
        MailMessage::builder(&MailboxKey::new(1, 1, 0).folder("INBOX"), id)
            .flags(flags)
            .build()
    }

    fn ids(ids: &[MessageId]) -> Vec<&str> {
        ids.iter().map(MessageId::as_str).collect()
    }

    #[test]
    fn test_partition() {
        let store = vec![
            msg("1", MessageFlags::SEEN),
            msg("2", MessageFlags::SEEN),
            msg("3", MessageFlags::FLAGGED),
            msg("5", MessageFlags::empty()),
        ];
        let index = vec![
            msg("2", MessageFlags::SEEN),
            msg("3", MessageFlags::SEEN),
            msg("4", MessageFlags::SEEN),
        ];

        let delta = compute_delta(&store, &index, false);
        assert_eq!(ids(&delta.new_ids), vec!["1", "5"]);
        assert_eq!(ids(&delta.deleted_ids), vec!["4"]);
        assert_eq!(delta.changed.len(), 1);
        assert_eq!(delta.changed[0].id.as_str(), "3");
        assert_eq!(delta.changed[0].flags, MessageFlags::FLAGGED, "store copy wins");
    }

    #[test]
    fn test_buckets_are_disjoint_and_cover_both_sides() {
        let store: Vec<_> = (0..40)
            .filter(|i| i % 3 != 0)
            .map(|i| msg(&i.to_string(), MessageFlags(i % 4)))
            .collect();
        let index: Vec<_> = (0..40)
            .filter(|i| i % 2 == 0)
            .map(|i| msg(&i.to_string(), MessageFlags(i % 5)))
            .collect();

        let delta = compute_delta(&store, &index, false);
        let new: HashSet<_> = delta.new_ids.iter().collect();
        let deleted: HashSet<_> = delta.deleted_ids.iter().collect();
        let changed: HashSet<_> = delta.changed.iter().map(|m| &m.id).collect();

        assert!(new.is_disjoint(&deleted));
        assert!(new.is_disjoint(&changed));
        assert!(deleted.is_disjoint(&changed));

        let store_ids: HashSet<_> = store.iter().map(|m| &m.id).collect();
        let index_ids: HashSet<_> = index.iter().map(|m| &m.id).collect();
        let only_store: HashSet<_> = store_ids.difference(&index_ids).copied().collect();
        let only_index: HashSet<_> = index_ids.difference(&store_ids).copied().collect();
        let common: HashSet<_> = store_ids.intersection(&index_ids).copied().collect();
        assert_eq!(new, only_store);
        assert_eq!(deleted, only_index);
        assert!(changed.is_subset(&common));
    }

    #[test]
    fn test_ignore_deleted() {
        let delta = compute_delta(&[], &[msg("1", MessageFlags::SEEN)], true);
        assert!(delta.is_empty());
    }

    #[test]
    fn test_unchanged_folder_has_empty_delta() {
        let side = vec![msg("1", MessageFlags::SEEN), msg("2", MessageFlags::empty())];
        assert!(compute_delta(&side, &side, false).is_empty());
    }
}
