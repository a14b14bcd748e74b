//! [`IndexAdapter`] over a connection-level [`IndexBackend`]

use std::ops::Range;
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::{
    ContentItem, ContentSink, FieldUpdate, IndexAdapter, IndexBackend, IndexError, NoopContentSink,
    Page, PageRequest, SearchCriteria, WriteOp,
};
use crate::cancel::CancelToken;
use crate::models::{FolderKey, MailMessage, MailboxKey, MessageField, MessageId, SortOrder};

/// Default number of documents requested per page
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Default number of ids per delete statement
pub const DEFAULT_DELETE_BATCH_SIZE: usize = 1000;

/// Tuning of the adapter's request shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexSettings {
    pub page_size: usize,
    pub delete_batch_size: usize,
}

impl Default for IndexSettings {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            delete_batch_size: DEFAULT_DELETE_BATCH_SIZE,
        }
    }
}

/// The production [`IndexAdapter`]
///
/// Writes are serialized and each one is committed as a unit; a failed
/// write is rolled back. A write that times out is retried once, as a
/// whole, on the backend's no-read-timeout variant.
pub struct SearchIndex {
    backend: Arc<dyn IndexBackend>,
    settings: IndexSettings,
    content: Arc<dyn ContentSink>,
    write_lock: Mutex<()>,
}

impl SearchIndex {
    pub fn new(backend: Arc<dyn IndexBackend>, settings: IndexSettings) -> Self {
        Self {
            backend,
            settings,
            content: Arc::new(NoopContentSink),
            write_lock: Mutex::new(()),
        }
    }

    /// Route [`IndexAdapter::add_content`] to an enrichment pipeline
    pub fn with_content_sink(mut self, sink: Arc<dyn ContentSink>) -> Self {
        self.content = sink;
        self
    }

    pub fn settings(&self) -> IndexSettings {
        self.settings
    }

    fn apply(&self, ops: Vec<WriteOp>) -> Result<(), IndexError> {
        if ops.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock();
        match write_and_commit(self.backend.as_ref(), &ops) {
            Err(e) if e.is_timeout() => {
                warn!("Index write timed out, retrying without read timeout: {}", e);
                match self.backend.without_read_timeout() {
                    Some(patient) => write_and_commit(patient.as_ref(), &ops),
                    None => write_and_commit(self.backend.as_ref(), &ops),
                }
            }
            other => other,
        }
    }
}

fn write_and_commit(backend: &dyn IndexBackend, ops: &[WriteOp]) -> Result<(), IndexError> {
    let result = backend.write(ops).and_then(|()| backend.commit());
    if let Err(e) = &result {
        debug!("Index write of {} ops failed, rolling back: {}", ops.len(), e);
        if let Err(rollback) = backend.rollback() {
            warn!("Index rollback failed: {}", rollback);
        }
    }
    result
}

impl IndexAdapter for SearchIndex {
    fn query_messages(
        &self,
        mailbox: &MailboxKey,
        criteria: &SearchCriteria,
        sort: SortOrder,
        range: Option<Range<usize>>,
        fields: &[MessageField],
        cancel: &CancelToken,
    ) -> Result<Vec<MailMessage>, IndexError> {
        let (start, end) = match range {
            Some(range) => (range.start, range.end),
            None => (0, usize::MAX),
        };
        let page_size = self.settings.page_size.max(1);

        let mut messages = Vec::new();
        let mut offset = start;
        while offset < end {
            if cancel.is_cancelled() {
                return Err(IndexError::Interrupted);
            }

            let request = PageRequest {
                mailbox,
                criteria,
                sort,
                offset,
                limit: page_size.min(end - offset),
                fields,
            };
            let Page {
                messages: page,
                total,
            } = self.backend.search(&request)?;

            if page.is_empty() {
                break;
            }
            offset += page.len();
            messages.extend(page);
            if offset >= total {
                break;
            }
        }

        Ok(messages)
    }

    fn add(&self, messages: &[MailMessage]) -> Result<(), IndexError> {
        self.apply(messages.iter().cloned().map(WriteOp::Upsert).collect())
    }

    fn change(&self, messages: &[MailMessage]) -> Result<(), IndexError> {
        self.apply(
            messages
                .iter()
                .map(|m| WriteOp::Update(FieldUpdate::from(m)))
                .collect(),
        )
    }

    fn delete_messages(&self, folder: &FolderKey, ids: &[MessageId]) -> Result<(), IndexError> {
        let ops = ids
            .chunks(self.settings.delete_batch_size.max(1))
            .map(|chunk| WriteOp::Delete {
                folder: folder.clone(),
                ids: chunk.to_vec(),
            })
            .collect();
        self.apply(ops)
    }

    fn delete_folder(&self, folder: &FolderKey) -> Result<(), IndexError> {
        self.apply(vec![WriteOp::DeleteFolder(folder.clone())])
    }

    fn contains_folder(&self, folder: &FolderKey) -> Result<bool, IndexError> {
        let criteria = SearchCriteria::folder(folder.folder.clone());
        let page = self.backend.search(&PageRequest {
            mailbox: &folder.mailbox,
            criteria: &criteria,
            sort: SortOrder::Natural,
            offset: 0,
            limit: 1,
            fields: &[],
        })?;
        Ok(page.total > 0)
    }

    fn add_content(&self, message: &MailMessage) {
        self.content.submit(ContentItem::new(message));
    }

    fn flush_content(&self) {
        self.content.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::InMemoryIndexBackend;
    use crate::models::SYNC_FIELDS;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn inbox() -> FolderKey {
        MailboxKey::new(1, 1, 0).folder("INBOX")
    }

    fn messages(count: usize) -> Vec<MailMessage> {
        (0..count)
            .map(|i| MailMessage::builder(&inbox(), format!("{:05}", i)).build())
            .collect()
    }

    /// Counts searches and cancels a token after a number of pages
    struct CountingBackend {
        inner: InMemoryIndexBackend,
        searches: AtomicUsize,
        cancel_after: Option<(usize, CancelToken)>,
    }

    impl IndexBackend for CountingBackend {
        fn search(&self, request: &PageRequest<'_>) -> Result<Page, IndexError> {
            let n = self.searches.fetch_add(1, Ordering::SeqCst) + 1;
            if let Some((after, token)) = &self.cancel_after
                && n >= *after
            {
                token.cancel();
            }
            self.inner.search(request)
        }

        fn write(&self, ops: &[WriteOp]) -> Result<(), IndexError> {
            self.inner.write(ops)
        }

        fn commit(&self) -> Result<(), IndexError> {
            self.inner.commit()
        }

        fn rollback(&self) -> Result<(), IndexError> {
            self.inner.rollback()
        }
    }

    /// Times out on the first commit only
    struct TimeoutOnceBackend {
        inner: InMemoryIndexBackend,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
    }

    impl IndexBackend for TimeoutOnceBackend {
        fn search(&self, request: &PageRequest<'_>) -> Result<Page, IndexError> {
            self.inner.search(request)
        }

        fn write(&self, ops: &[WriteOp]) -> Result<(), IndexError> {
            self.inner.write(ops)
        }

        fn commit(&self) -> Result<(), IndexError> {
            if self.commits.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(IndexError::timed_out("read timed out"));
            }
            self.inner.commit()
        }

        fn rollback(&self) -> Result<(), IndexError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            self.inner.rollback()
        }
    }

    #[test]
    fn test_query_pages_transparently() {
        let backend = Arc::new(CountingBackend {
            inner: InMemoryIndexBackend::new(),
            searches: AtomicUsize::new(0),
            cancel_after: None,
        });
        let index = SearchIndex::new(
            backend.clone(),
            IndexSettings {
                page_size: 10,
                ..IndexSettings::default()
            },
        );
        index.add(&messages(25)).unwrap();

        let all = index
            .all_messages(&inbox(), SYNC_FIELDS, &CancelToken::new())
            .unwrap();
        assert_eq!(all.len(), 25);
        assert_eq!(backend.searches.load(Ordering::SeqCst), 3);

        let ranged = index
            .query_messages(
                &inbox().mailbox,
                &SearchCriteria::folder("INBOX"),
                SortOrder::Natural,
                Some(5..17),
                &[],
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(ranged.len(), 12);
        assert_eq!(ranged[0].id.as_str(), "00005");
    }

    #[test]
    fn test_query_interrupted_between_pages() {
        let token = CancelToken::new();
        let backend = Arc::new(CountingBackend {
            inner: InMemoryIndexBackend::new(),
            searches: AtomicUsize::new(0),
            cancel_after: Some((1, token.clone())),
        });
        let index = SearchIndex::new(
            backend.clone(),
            IndexSettings {
                page_size: 10,
                ..IndexSettings::default()
            },
        );
        index.add(&messages(25)).unwrap();

        let result = index.all_messages(&inbox(), &[], &token);
        assert!(matches!(result, Err(IndexError::Interrupted)));
        assert_eq!(backend.searches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_timeout_retried_once() {
        let backend = Arc::new(TimeoutOnceBackend {
            inner: InMemoryIndexBackend::new(),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
        });
        let index = SearchIndex::new(backend.clone(), IndexSettings::default());

        index.add(&messages(3)).unwrap();
        assert_eq!(backend.commits.load(Ordering::SeqCst), 2);
        assert_eq!(backend.rollbacks.load(Ordering::SeqCst), 1);
        assert!(index.contains_folder(&inbox()).unwrap());
        assert_eq!(
            index.all_messages(&inbox(), &[], &CancelToken::new()).unwrap().len(),
            3
        );
    }

    #[test]
    fn test_fault_is_not_retried() {
        struct RejectingBackend {
            commits: AtomicUsize,
        }

        impl IndexBackend for RejectingBackend {
            fn search(&self, _request: &PageRequest<'_>) -> Result<Page, IndexError> {
                Ok(Page::default())
            }

            fn write(&self, _ops: &[WriteOp]) -> Result<(), IndexError> {
                Ok(())
            }

            fn commit(&self) -> Result<(), IndexError> {
                self.commits.fetch_add(1, Ordering::SeqCst);
                Err(IndexError::Fault("document rejected".into()))
            }

            fn rollback(&self) -> Result<(), IndexError> {
                Ok(())
            }
        }

        let backend = Arc::new(RejectingBackend {
            commits: AtomicUsize::new(0),
        });
        let index = SearchIndex::new(backend.clone(), IndexSettings::default());

        let err = index.add(&messages(2)).unwrap_err();
        assert_eq!(err.kind(), crate::index::IndexErrorKind::Fault);
        assert_eq!(backend.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_delete_messages_in_batches() {
        let backend = Arc::new(InMemoryIndexBackend::new());
        let index = SearchIndex::new(
            backend.clone(),
            IndexSettings {
                page_size: 100,
                delete_batch_size: 4,
            },
        );
        let all = messages(10);
        index.add(&all).unwrap();

        let ids: Vec<_> = all.iter().take(9).map(|m| m.id.clone()).collect();
        index.delete_messages(&inbox(), &ids).unwrap();

        let left = index.all_messages(&inbox(), &[], &CancelToken::new()).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].id.as_str(), "00009");
        assert_eq!(backend.commit_count(), 2);
    }

    #[test]
    fn test_change_only_touches_sync_fields() {
        let index = SearchIndex::new(Arc::new(InMemoryIndexBackend::new()), IndexSettings::default());
        let original = MailMessage::builder(&inbox(), "1").subject("Hello").build();
        index.add_one(&original).unwrap();

        let mut update = original.clone();
        update.subject = "ignored".to_string();
        update.flags = crate::models::MessageFlags::SEEN;
        index.change(&[update]).unwrap();

        let stored = index
            .fetch_by_id(
                &inbox(),
                &[MessageId::new("1")],
                crate::models::INDEXABLE_FIELDS,
                &CancelToken::new(),
            )
            .unwrap();
        assert_eq!(stored[0].subject, "Hello");
        assert_eq!(stored[0].flags, crate::models::MessageFlags::SEEN);
    }

    #[test]
    fn test_delete_folder() {
        let index = SearchIndex::new(Arc::new(InMemoryIndexBackend::new()), IndexSettings::default());
        index.add(&messages(3)).unwrap();
        assert!(index.contains_folder(&inbox()).unwrap());

        index.delete_folder(&inbox()).unwrap();
        assert!(!index.contains_folder(&inbox()).unwrap());
    }
}
