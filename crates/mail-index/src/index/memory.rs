//! In-memory index backend
//!
//! Same staging semantics as the real backends: writes are invisible
//! until committed and dropped on rollback.

use std::collections::BTreeMap;

use parking_lot::{Mutex, RwLock};

use super::{IndexBackend, IndexError, Page, PageRequest, WriteOp};
use crate::models::{FolderKey, MailMessage, MessageId, SortOrder};

type DocKey = (FolderKey, MessageId);

/// Index backend holding committed documents in a map
#[derive(Default)]
pub struct InMemoryIndexBackend {
    documents: RwLock<BTreeMap<DocKey, MailMessage>>,
    staged: Mutex<Vec<WriteOp>>,
    commits: Mutex<usize>,
}

impl InMemoryIndexBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of committed documents across all folders
    pub fn document_count(&self) -> usize {
        self.documents.read().len()
    }

    /// Number of commits that applied at least one operation
    pub fn commit_count(&self) -> usize {
        *self.commits.lock()
    }

    /// Committed copy of a document
    pub fn document(&self, folder: &FolderKey, id: &MessageId) -> Option<MailMessage> {
        self.documents
            .read()
            .get(&(folder.clone(), id.clone()))
            .cloned()
    }

    fn apply(documents: &mut BTreeMap<DocKey, MailMessage>, op: WriteOp) {
        match op {
            WriteOp::Upsert(message) => {
                documents.insert((message.folder_key(), message.id.clone()), message);
            }
            WriteOp::Update(update) => {
                if let Some(doc) = documents.get_mut(&(update.folder.clone(), update.id.clone())) {
                    update.apply_to(doc);
                }
            }
            WriteOp::Delete { folder, ids } => {
                for id in ids {
                    documents.remove(&(folder.clone(), id));
                }
            }
            WriteOp::DeleteFolder(folder) => {
                documents.retain(|(key, _), _| *key != folder);
            }
        }
    }
}

fn matches_text(message: &MailMessage, text: &str) -> bool {
    let needle = text.to_lowercase();
    let contains = |haystack: &str| haystack.to_lowercase().contains(&needle);

    contains(&message.subject)
        || message.body_text.as_deref().is_some_and(contains)
        || message.from.iter().any(|a| contains(&a.display()))
        || message
            .to
            .iter()
            .chain(message.cc.iter())
            .any(|a| contains(&a.display()))
}

impl IndexBackend for InMemoryIndexBackend {
    fn search(&self, request: &PageRequest<'_>) -> Result<Page, IndexError> {
        if request.limit == 0 {
            return Err(IndexError::Unexpected("page limit must be positive".into()));
        }

        let documents = self.documents.read();
        let criteria = request.criteria;
        let mut hits: Vec<&MailMessage> = documents
            .values()
            .filter(|m| m.mailbox == *request.mailbox)
            .filter(|m| criteria.folder.as_ref().is_none_or(|f| m.folder == *f))
            .filter(|m| criteria.ids.as_ref().is_none_or(|ids| ids.contains(&m.id)))
            .filter(|m| criteria.text.as_ref().is_none_or(|t| matches_text(m, t)))
            .collect();

        match request.sort {
            SortOrder::Natural => {}
            SortOrder::ReceivedAscending => hits.sort_by_key(|m| m.received_at),
            SortOrder::ReceivedDescending => hits.sort_by_key(|m| std::cmp::Reverse(m.received_at)),
        }

        let total = hits.len();
        let messages = hits
            .into_iter()
            .skip(request.offset)
            .take(request.limit)
            .map(|m| m.project(request.fields))
            .collect();

        Ok(Page { messages, total })
    }

    fn write(&self, ops: &[WriteOp]) -> Result<(), IndexError> {
        self.staged.lock().extend_from_slice(ops);
        Ok(())
    }

    fn commit(&self) -> Result<(), IndexError> {
        let staged = std::mem::take(&mut *self.staged.lock());
        if staged.is_empty() {
            return Ok(());
        }

        let mut documents = self.documents.write();
        for op in staged {
            Self::apply(&mut documents, op);
        }
        *self.commits.lock() += 1;
        Ok(())
    }

    fn rollback(&self) -> Result<(), IndexError> {
        self.staged.lock().clear();
        Ok(())
    }
}
