//! Domain models shared by the store, bookkeeping and index layers

mod folder;
mod message;
mod sync_record;

pub use folder::{FolderInfo, FolderKey, MailboxKey};
pub use message::{
    EmailAddress, INDEXABLE_FIELDS, MailMessage, MessageBuilder, MessageField, MessageFlags,
    MessageId, SYNC_FIELDS, SortOrder,
};
pub use sync_record::SyncRecord;
