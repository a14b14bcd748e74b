//! Jobs that find folders needing reconciliation

use std::collections::BTreeSet;

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;

use super::folder::FolderJob;
use super::job::{Job, JobCore, SyncJob};
use super::queue::Scheduler;
use super::{RANK_DISCOVERY, SyncServices};
use crate::index::IndexError;
use crate::models::MailboxKey;

/// Walks an account's folder tree and enqueues a folder job per folder
///
/// With a filter, only folders whose full name is in it are enqueued; the
/// walk still descends through folders outside the filter.
pub struct MailAccountJob {
    core: JobCore,
    mailbox: MailboxKey,
    filter: Mutex<Option<BTreeSet<String>>>,
    services: SyncServices,
}

impl MailAccountJob {
    pub fn new(mailbox: MailboxKey, services: SyncServices) -> Self {
        Self::build(mailbox, None, services)
    }

    pub fn with_filter(
        mailbox: MailboxKey,
        folders: impl IntoIterator<Item = String>,
        services: SyncServices,
    ) -> Self {
        Self::build(mailbox, Some(folders.into_iter().collect()), services)
    }

    fn build(mailbox: MailboxKey, filter: Option<BTreeSet<String>>, services: SyncServices) -> Self {
        Self {
            core: JobCore::new(format!("account:{}", mailbox), RANK_DISCOVERY),
            mailbox,
            filter: Mutex::new(filter),
            services,
        }
    }

    pub fn filter(&self) -> Option<BTreeSet<String>> {
        self.filter.lock().clone()
    }
}

impl SyncJob for MailAccountJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, scheduler: &dyn Scheduler) -> Result<()> {
        let filter = self.filter();
        let store = &self.services.store;
        let mut parents = vec![String::new()];
        let mut enqueued = 0;

        while let Some(parent) = parents.pop() {
            if self.core.is_cancelled() {
                return Err(IndexError::Interrupted.into());
            }
            for folder in store.list_subfolders(&self.mailbox, &parent)? {
                if folder.has_subfolders {
                    parents.push(folder.full_name.clone());
                }
                if !folder.holds_messages {
                    continue;
                }
                if filter.as_ref().is_some_and(|f| !f.contains(&folder.full_name)) {
                    continue;
                }
                let job = FolderJob::new(self.mailbox.folder(folder.full_name), self.services.clone());
                if scheduler.add_job(Job::Folder(job)) {
                    enqueued += 1;
                }
            }
        }

        info!("Enqueued {} folder jobs for {}", enqueued, self.mailbox);
        Ok(())
    }

    fn merge_from(&self, other: &Job) -> bool {
        let Job::MailAccount(other) = other else {
            return false;
        };
        if other.mailbox != self.mailbox {
            return false;
        }

        let mut filter = self.filter.lock();
        *filter = match (filter.take(), other.filter()) {
            (Some(mut mine), Some(theirs)) => {
                mine.extend(theirs);
                Some(mine)
            }
            // No filter means every folder
            _ => None,
        };
        true
    }
}

/// Enqueues folder jobs for an account's folders whose last sync is too old
///
/// A job performed before its `start_at` completes without sweeping and is
/// not re-enqueued. That sweep is dropped; the engine's sweeper submits a
/// fresh job every interval.
pub struct ElapsedFolderJob {
    core: JobCore,
    mailbox: MailboxKey,
    start_at: Mutex<DateTime<Utc>>,
    services: SyncServices,
}

impl ElapsedFolderJob {
    pub fn new(mailbox: MailboxKey, start_at: DateTime<Utc>, services: SyncServices) -> Self {
        Self {
            core: JobCore::new(format!("elapsed:{}", mailbox), RANK_DISCOVERY),
            mailbox,
            start_at: Mutex::new(start_at),
            services,
        }
    }

    pub fn start_at(&self) -> DateTime<Utc> {
        *self.start_at.lock()
    }
}

impl SyncJob for ElapsedFolderJob {
    fn core(&self) -> &JobCore {
        &self.core
    }

    fn execute(&self, scheduler: &dyn Scheduler) -> Result<()> {
        let now = Utc::now();
        let start_at = self.start_at();
        if now < start_at {
            debug!("Sweep of {} not due until {}, dropping it", self.mailbox, start_at);
            return Ok(());
        }

        let cutoff = now - self.services.settings.staleness;
        let stale = self.services.bookkeeping.list_stale(&self.mailbox, cutoff)?;
        let mut enqueued = 0;
        for record in stale {
            let job = FolderJob::new(record.key, self.services.clone());
            if scheduler.add_job(Job::Folder(job)) {
                enqueued += 1;
            }
        }

        info!("Enqueued {} stale folders of {}", enqueued, self.mailbox);
        Ok(())
    }

    fn merge_from(&self, other: &Job) -> bool {
        match other {
            Job::ElapsedFolder(other) if other.mailbox == self.mailbox => {
                *self.start_at.lock() = other.start_at();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use crate::bookkeeping::{AcquireOptions, SyncBookkeeping};
    use crate::jobs::{JobOutcome, JobQueue};
    use chrono::Duration;

    fn folder_jobs(queue: &JobQueue) -> Vec<String> {
        let mut ids = queue.pending_identifiers();
        ids.sort();
        ids
    }

    #[test]
    fn test_account_walk_enqueues_every_folder() {
        let fixture = fixture(Default::default());
        for name in ["INBOX", "INBOX/Receipts", "INBOX/Receipts/2024", "Sent"] {
            fixture.store.create_folder(&mailbox().folder(name));
        }
        let queue = JobQueue::new(10);

        let job = MailAccountJob::new(mailbox(), fixture.services.clone());
        assert_eq!(job.perform(&queue), JobOutcome::Completed);

        let expected: Vec<String> = ["INBOX", "INBOX/Receipts", "INBOX/Receipts/2024", "Sent"]
            .iter()
            .map(|name| format!("folder:{}", mailbox().folder(*name)))
            .collect();
        assert_eq!(folder_jobs(&queue), expected);
    }

    #[test]
    fn test_account_walk_honours_filter() {
        let fixture = fixture(Default::default());
        for name in ["INBOX", "INBOX/Receipts", "Sent"] {
            fixture.store.create_folder(&mailbox().folder(name));
        }
        let queue = JobQueue::new(10);

        let job = MailAccountJob::with_filter(mailbox(), ["INBOX/Receipts".to_string()], fixture.services.clone());
        job.perform(&queue);

        assert_eq!(
            folder_jobs(&queue),
            vec![format!("folder:{}", mailbox().folder("INBOX/Receipts"))]
        );
    }

    #[test]
    fn test_account_filter_merge() {
        let fixture = fixture(Default::default());
        let queued = MailAccountJob::with_filter(mailbox(), ["INBOX".to_string()], fixture.services.clone());
        let narrower = MailAccountJob::with_filter(mailbox(), ["Sent".to_string()], fixture.services.clone());
        assert!(queued.replace_with(&Job::MailAccount(narrower)));
        assert_eq!(queued.filter().map(|f| f.len()), Some(2));

        let everything = MailAccountJob::new(mailbox(), fixture.services.clone());
        assert!(queued.replace_with(&Job::MailAccount(everything)));
        assert!(queued.filter().is_none());
    }

    #[test]
    fn test_elapsed_job_before_start_time_is_dropped() {
        let fixture = fixture(Default::default());
        fixture.bookkeeping.insert_if_absent(&inbox()).unwrap();
        let queue = JobQueue::new(10);

        let later = ElapsedFolderJob::new(mailbox(), Utc::now() + Duration::hours(1), fixture.services.clone());
        assert_eq!(later.perform(&queue), JobOutcome::Completed);
        assert!(queue.is_empty());
        assert_eq!(later.perform(&queue), JobOutcome::Skipped, "consumed, not rescheduled");

        let due = ElapsedFolderJob::new(mailbox(), Utc::now(), fixture.services.clone());
        due.perform(&queue);
        assert_eq!(folder_jobs(&queue), vec![format!("folder:{}", inbox())]);
    }

    #[test]
    fn test_elapsed_job_skips_fresh_folders() {
        let fixture = fixture(Default::default());
        let sent = mailbox().folder("Sent");
        for key in [inbox(), sent.clone()] {
            fixture.bookkeeping.insert_if_absent(&key).unwrap();
        }
        let holder = AcquireOptions::forced(Duration::hours(1));
        fixture.bookkeeping.try_acquire(&sent, holder).unwrap();
        fixture
            .bookkeeping
            .release(&sent, holder.owner, Some(Utc::now()))
            .unwrap();
        let queue = JobQueue::new(10);

        ElapsedFolderJob::new(mailbox(), Utc::now(), fixture.services.clone()).perform(&queue);
        assert_eq!(folder_jobs(&queue), vec![format!("folder:{}", inbox())]);
    }
}
