//! Adapter to the external search index
//!
//! Jobs talk to the index exclusively through [`IndexAdapter`]. The
//! [`SearchIndex`] implementation owns the paging, commit/rollback and
//! retry discipline and delegates the wire work to an [`IndexBackend`]:
//! a local Tantivy index, a remote HTTP service, or an in-memory fake.

mod adapter;
mod content;
mod error;
mod http;
mod memory;
mod schema;
mod tantivy;

pub use adapter::{IndexSettings, SearchIndex};
pub use content::{ChannelContentSink, ContentItem, ContentSink, NoopContentSink};
pub use error::{IndexError, IndexErrorKind};
pub use http::HttpIndexBackend;
pub use memory::InMemoryIndexBackend;
pub use self::tantivy::TantivyBackend;

use std::collections::BTreeSet;
use std::ops::Range;
use std::sync::Arc;

use crate::cancel::CancelToken;
use crate::models::{
    FolderKey, MailMessage, MailboxKey, MessageField, MessageFlags, MessageId, SortOrder,
};

/// Restrictions of an index query; all present restrictions must match
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SearchCriteria {
    pub folder: Option<String>,
    pub ids: Option<Vec<MessageId>>,
    /// Free text matched against subject, body and addresses
    pub text: Option<String>,
}

impl SearchCriteria {
    pub fn folder(folder: impl Into<String>) -> Self {
        Self {
            folder: Some(folder.into()),
            ..Self::default()
        }
    }

    pub fn with_ids(mut self, ids: &[MessageId]) -> Self {
        self.ids = Some(ids.to_vec());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }
}

/// One page request sent to a backend
#[derive(Debug, Clone)]
pub struct PageRequest<'a> {
    pub mailbox: &'a MailboxKey,
    pub criteria: &'a SearchCriteria,
    pub sort: SortOrder,
    pub offset: usize,
    /// Always at least 1
    pub limit: usize,
    pub fields: &'a [MessageField],
}

/// One page of results plus the total number of matches
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub messages: Vec<MailMessage>,
    pub total: usize,
}

/// Selective update of the fields reconciliation owns
#[derive(Debug, Clone, PartialEq)]
pub struct FieldUpdate {
    pub folder: FolderKey,
    pub id: MessageId,
    pub flags: MessageFlags,
    pub color_label: i32,
    pub user_flags: BTreeSet<String>,
}

impl From<&MailMessage> for FieldUpdate {
    fn from(message: &MailMessage) -> Self {
        Self {
            folder: message.folder_key(),
            id: message.id.clone(),
            flags: message.flags,
            color_label: message.color_label,
            user_flags: message.user_flags.clone(),
        }
    }
}

impl FieldUpdate {
    /// Apply the update onto a full document
    pub fn apply_to(&self, message: &mut MailMessage) {
        message.flags = self.flags;
        message.color_label = self.color_label;
        message.user_flags = self.user_flags.clone();
    }
}

/// A staged index mutation
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Add or fully replace a document
    Upsert(MailMessage),
    /// Update flag fields of an existing document; missing documents are skipped
    Update(FieldUpdate),
    Delete { folder: FolderKey, ids: Vec<MessageId> },
    DeleteFolder(FolderKey),
}

/// Connection-level access to an index service
///
/// `write` stages operations which become visible on `commit` and are
/// discarded on `rollback`. Callers serialize write/commit sequences.
pub trait IndexBackend: Send + Sync {
    fn search(&self, request: &PageRequest<'_>) -> Result<Page, IndexError>;

    fn write(&self, ops: &[WriteOp]) -> Result<(), IndexError>;

    fn commit(&self) -> Result<(), IndexError>;

    fn rollback(&self) -> Result<(), IndexError>;

    /// Variant of this backend without a read timeout, for the retry after a timeout
    fn without_read_timeout(&self) -> Option<Arc<dyn IndexBackend>> {
        None
    }
}

/// Operations jobs need from the search index
pub trait IndexAdapter: Send + Sync {
    /// Query with transparent paging until `range` or the result is exhausted
    ///
    /// `cancel` is checked before every page.
    fn query_messages(
        &self,
        mailbox: &MailboxKey,
        criteria: &SearchCriteria,
        sort: SortOrder,
        range: Option<Range<usize>>,
        fields: &[MessageField],
        cancel: &CancelToken,
    ) -> Result<Vec<MailMessage>, IndexError>;

    /// Every indexed message of a folder
    fn all_messages(
        &self,
        folder: &FolderKey,
        fields: &[MessageField],
        cancel: &CancelToken,
    ) -> Result<Vec<MailMessage>, IndexError> {
        self.query_messages(
            &folder.mailbox,
            &SearchCriteria::folder(folder.folder.clone()),
            SortOrder::Natural,
            None,
            fields,
            cancel,
        )
    }

    /// Indexed copies of specific messages
    ///
    /// Meant for small-to-medium id sets; callers chunk large ones.
    fn fetch_by_id(
        &self,
        folder: &FolderKey,
        ids: &[MessageId],
        fields: &[MessageField],
        cancel: &CancelToken,
    ) -> Result<Vec<MailMessage>, IndexError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.query_messages(
            &folder.mailbox,
            &SearchCriteria::folder(folder.folder.clone()).with_ids(ids),
            SortOrder::Natural,
            None,
            fields,
            cancel,
        )
    }

    /// Index messages; commits all of them or none
    fn add(&self, messages: &[MailMessage]) -> Result<(), IndexError>;

    fn add_one(&self, message: &MailMessage) -> Result<(), IndexError> {
        self.add(std::slice::from_ref(message))
    }

    /// Push flags, color label and user flags of already indexed messages
    fn change(&self, messages: &[MailMessage]) -> Result<(), IndexError>;

    fn delete_messages(&self, folder: &FolderKey, ids: &[MessageId]) -> Result<(), IndexError>;

    fn delete_folder(&self, folder: &FolderKey) -> Result<(), IndexError>;

    fn contains_folder(&self, folder: &FolderKey) -> Result<bool, IndexError>;

    /// Queue a message for content enrichment without waiting for it
    fn add_content(&self, message: &MailMessage);

    fn flush_content(&self);
}
