//! Event-driven jobs working on explicit id lists

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::Result;
use log::info;
use parking_lot::Mutex;
use uuid::Uuid;

use super::job::{Job, JobCore, SyncJob};
use super::queue::Scheduler;
use super::{
    RANK_INCREMENTAL, SyncServices, add_with_fallback, change_with_fallback, submit_content,
};
use crate::index::IndexError;
use crate::models::{FolderKey, INDEXABLE_FIELDS, MailMessage, MessageField, MessageId, SYNC_FIELDS};

/// Append ids not yet present, keeping first-seen order
fn merge_ids(into: &mut Vec<MessageId>, more: &[MessageId]) {
    let mut seen: HashSet<MessageId> = into.iter().cloned().collect();
    for id in more {
        if seen.insert(id.clone()) {
            into.push(id.clone());
        }
    }
}

/// Read messages from the store in `id_query_chunk` sized lookups
fn fetch_from_store(
    services: &SyncServices,
    core: &JobCore,
    folder: &FolderKey,
    ids: &[MessageId],
    fields: &[MessageField],
) -> Result<Vec<MailMessage>> {
    let mut messages = Vec::with_capacity(ids.len());
    for chunk in ids.chunks(services.settings.id_query_chunk.max(1)) {
        if core.is_cancelled() {
            return Err(IndexError::Interrupted.into());
        }
        messages.extend(
            services
                .store
                .get_messages(&folder.mailbox, &folder.folder, chunk, fields)?,
        );
    }
    Ok(messages)
}

/// Indexes specific messages of a folder
pub struct AddByIdJob {
    core: JobCore,
    folder: FolderKey,
    ids: Mutex<Vec<MessageId>>,
    services: SyncServices,
}

impl AddByIdJob {
    pub fn new(folder: FolderKey, ids: Vec<MessageId>, services: SyncServices) -> Self {
        Self {
            core: JobCore::new(format!("add:{}", folder), RANK_INCREMENTAL),
            folder,
            ids: Mutex::new(ids),
            services,
        }
    }

    /// Sub-job for one chunk of a folder reconciliation
    ///
    /// Gets a unique identifier so sibling chunks never merge, and the
    /// parent's ranking so the parent does not yield to its own children.
    pub fn chunk(folder: FolderKey, ids: Vec<MessageId>, services: SyncServices, ranking: i32) -> Self {
        let identifier = format!("add:{}#{}", folder, Uuid::new_v4().simple());
        Self {
            core: JobCore::new(identifier, ranking),
            folder,
            ids: Mutex::new(ids),
            services,
        }
    }

    pub fn folder(&self) -> &FolderKey {
        &self.folder
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.ids.lock().clone()
    }
}

impl SyncJob for AddByIdJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, _scheduler: &dyn Scheduler) -> Result<()> {
        let start = Instant::now();
        let ids = self.ids();
        let messages = fetch_from_store(&self.services, &self.core, &self.folder, &ids, INDEXABLE_FIELDS)?;

        let index = self.services.index.as_ref();
        let outcome = add_with_fallback(index, &messages)?;
        submit_content(index, &messages, &outcome);

        info!(
            "Indexed {} of {} messages in {} ({} failed) in {}ms",
            outcome.written,
            ids.len(),
            self.folder,
            outcome.failed.len(),
            start.elapsed().as_millis()
        );
        Ok(())
    }

    fn merge_from(&self, other: &Job) -> bool {
        match other {
            Job::AddById(other) if other.folder == self.folder => {
                merge_ids(&mut self.ids.lock(), &other.ids());
                true
            }
            _ => false,
        }
    }
}

/// Pushes the current flags of specific messages to the index
pub struct ChangeByIdJob {
    core: JobCore,
    folder: FolderKey,
    ids: Mutex<Vec<MessageId>>,
    services: SyncServices,
}

impl ChangeByIdJob {
    pub fn new(folder: FolderKey, ids: Vec<MessageId>, services: SyncServices) -> Self {
        Self {
            core: JobCore::new(format!("change:{}", folder), RANK_INCREMENTAL),
            folder,
            ids: Mutex::new(ids),
            services,
        }
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.ids.lock().clone()
    }
}

impl SyncJob for ChangeByIdJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, _scheduler: &dyn Scheduler) -> Result<()> {
        let ids = self.ids();
        let messages = fetch_from_store(&self.services, &self.core, &self.folder, &ids, SYNC_FIELDS)?;
        let outcome = change_with_fallback(self.services.index.as_ref(), &messages)?;
        info!(
            "Updated {} of {} messages in {}",
            outcome.written,
            ids.len(),
            self.folder
        );
        Ok(())
    }

    fn merge_from(&self, other: &Job) -> bool {
        match other {
            Job::ChangeById(other) if other.folder == self.folder => {
                merge_ids(&mut self.ids.lock(), &other.ids());
                true
            }
            _ => false,
        }
    }
}

/// Removes specific messages from the index
pub struct RemoveByIdJob {
    core: JobCore,
    folder: FolderKey,
    ids: Mutex<Vec<MessageId>>,
    services: SyncServices,
}

impl RemoveByIdJob {
    pub fn new(folder: FolderKey, ids: Vec<MessageId>, services: SyncServices) -> Self {
        Self {
            core: JobCore::new(format!("remove:{}", folder), RANK_INCREMENTAL),
            folder,
            ids: Mutex::new(ids),
            services,
        }
    }

    pub fn ids(&self) -> Vec<MessageId> {
        self.ids.lock().clone()
    }
}

impl SyncJob for RemoveByIdJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, _scheduler: &dyn Scheduler) -> Result<()> {
        let ids = self.ids();
        if ids.is_empty() {
            return Ok(());
        }
        self.services.index.delete_messages(&self.folder, &ids)?;
        info!("Removed {} messages from {}", ids.len(), self.folder);
        Ok(())
    }

    fn merge_from(&self, other: &Job) -> bool {
        match other {
            Job::RemoveById(other) if other.folder == self.folder => {
                merge_ids(&mut self.ids.lock(), &other.ids());
                true
            }
            _ => false,
        }
    }
}

/// Reconciles flags only, against a store-side snapshot supplied by the caller
///
/// Messages missing from the index are left to the next folder run.
pub struct FlagsObserverJob {
    core: JobCore,
    folder: FolderKey,
    snapshot: Mutex<Vec<MailMessage>>,
    services: SyncServices,
}

impl FlagsObserverJob {
    pub fn new(folder: FolderKey, snapshot: Vec<MailMessage>, services: SyncServices) -> Self {
        Self {
            core: JobCore::new(format!("flags:{}", folder), RANK_INCREMENTAL),
            folder,
            snapshot: Mutex::new(snapshot),
            services,
        }
    }

    pub fn snapshot(&self) -> Vec<MailMessage> {
        self.snapshot.lock().clone()
    }
}

impl SyncJob for FlagsObserverJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, _scheduler: &dyn Scheduler) -> Result<()> {
        let snapshot = self.snapshot();
        let index = self.services.index.as_ref();
        let ids: Vec<MessageId> = snapshot.iter().map(|m| m.id.clone()).collect();

        let mut indexed = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(self.services.settings.id_query_chunk.max(1)) {
            indexed.extend(index.fetch_by_id(&self.folder, chunk, SYNC_FIELDS, self.core.cancel_token())?);
        }

        let live_by_id: HashMap<&MessageId, &MailMessage> =
            snapshot.iter().map(|m| (&m.id, m)).collect();
        let changed: Vec<MailMessage> = indexed
            .into_iter()
            .filter_map(|mut copy| {
                let live = live_by_id.get(&copy.id)?;
                if live.flags == copy.flags {
                    return None;
                }
                copy.flags = live.flags;
                Some(copy)
            })
            .collect();

        let outcome = change_with_fallback(index, &changed)?;
        info!(
            "Flags of {} of {} observed messages in {} updated",
            outcome.written,
            snapshot.len(),
            self.folder
        );
        Ok(())
    }

    fn merge_from(&self, other: &Job) -> bool {
        let Job::FlagsObserver(other) = other else {
            return false;
        };
        if other.folder != self.folder {
            return false;
        }

        let mut snapshot = self.snapshot.lock();
        let mut positions: HashMap<MessageId, usize> = snapshot
            .iter()
            .enumerate()
            .map(|(n, m)| (m.id.clone(), n))
            .collect();
        for message in other.snapshot() {
            match positions.get(&message.id) {
                Some(&n) => snapshot[n] = message,
                None => {
                    positions.insert(message.id.clone(), snapshot.len());
                    snapshot.push(message);
                }
            }
        }
        true
    }
}
