//! Message model shared by the mail store and the search index

use super::{FolderKey, MailboxKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Identifier of a message inside its folder (the store's UID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// System flags of a message as a bit set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageFlags(pub u32);

impl MessageFlags {
    pub const ANSWERED: Self = Self(1);
    pub const DELETED: Self = Self(1 << 1);
    pub const DRAFT: Self = Self(1 << 2);
    pub const FLAGGED: Self = Self(1 << 3);
    pub const RECENT: Self = Self(1 << 4);
    pub const SEEN: Self = Self(1 << 5);
    pub const FORWARDED: Self = Self(1 << 6);
    pub const SPAM: Self = Self(1 << 7);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for MessageFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"');
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            };
        }

        Self::new(s)
    }

    /// Format the address the way it is written to the index
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// Fields a caller can request from the store or the index
///
/// Identity (mailbox, folder, id) is always present and not part of the set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageField {
    Flags,
    ColorLabel,
    UserFlags,
    Subject,
    From,
    Recipients,
    ReceivedDate,
    Size,
    Body,
    Attachment,
}

/// The fields reconciliation compares: store's copy always wins for these
pub const SYNC_FIELDS: &[MessageField] = &[
    MessageField::Flags,
    MessageField::ColorLabel,
    MessageField::UserFlags,
];

/// Everything the search index stores for a message
pub const INDEXABLE_FIELDS: &[MessageField] = &[
    MessageField::Flags,
    MessageField::ColorLabel,
    MessageField::UserFlags,
    MessageField::Subject,
    MessageField::From,
    MessageField::Recipients,
    MessageField::ReceivedDate,
    MessageField::Size,
    MessageField::Body,
    MessageField::Attachment,
];

/// Sort order for message listings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SortOrder {
    /// Whatever order the source finds cheapest
    #[default]
    Natural,
    ReceivedAscending,
    ReceivedDescending,
}

/// A message as seen by the store or the index
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MailMessage {
    pub mailbox: MailboxKey,
    pub folder: String,
    pub id: MessageId,
    pub flags: MessageFlags,
    /// Color label, 0 means none
    pub color_label: i32,
    /// User-defined keywords
    pub user_flags: BTreeSet<String>,
    pub subject: String,
    pub from: Option<EmailAddress>,
    pub to: Vec<EmailAddress>,
    pub cc: Vec<EmailAddress>,
    pub received_at: Option<DateTime<Utc>>,
    pub size: u64,
    /// Plain text body, only populated when [`MessageField::Body`] was requested
    pub body_text: Option<String>,
    pub has_attachment: bool,
}

impl MailMessage {
    pub fn builder(folder: &FolderKey, id: impl Into<MessageId>) -> MessageBuilder {
        MessageBuilder::new(folder, id.into())
    }

    pub fn folder_key(&self) -> FolderKey {
        FolderKey::new(self.mailbox, self.folder.clone())
    }

    /// Whether the fields reconciliation cares about differ
    pub fn sync_fields_differ(&self, other: &MailMessage) -> bool {
        self.flags != other.flags
            || self.color_label != other.color_label
            || self.user_flags != other.user_flags
    }

    /// Copy of this message reduced to the requested fields
    pub fn project(&self, fields: &[MessageField]) -> MailMessage {
        let wants = |field| fields.contains(&field);
        MailMessage {
            mailbox: self.mailbox,
            folder: self.folder.clone(),
            id: self.id.clone(),
            flags: if wants(MessageField::Flags) {
                self.flags
            } else {
                MessageFlags::empty()
            },
            color_label: if wants(MessageField::ColorLabel) {
                self.color_label
            } else {
                0
            },
            user_flags: if wants(MessageField::UserFlags) {
                self.user_flags.clone()
            } else {
                BTreeSet::new()
            },
            subject: if wants(MessageField::Subject) {
                self.subject.clone()
            } else {
                String::new()
            },
            from: self.from.clone().filter(|_| wants(MessageField::From)),
            to: if wants(MessageField::Recipients) {
                self.to.clone()
            } else {
                Vec::new()
            },
            cc: if wants(MessageField::Recipients) {
                self.cc.clone()
            } else {
                Vec::new()
            },
            received_at: self.received_at.filter(|_| wants(MessageField::ReceivedDate)),
            size: if wants(MessageField::Size) { self.size } else { 0 },
            body_text: self.body_text.clone().filter(|_| wants(MessageField::Body)),
            has_attachment: wants(MessageField::Attachment) && self.has_attachment,
        }
    }
}

/// Builder for creating MailMessage instances
pub struct MessageBuilder {
    message: MailMessage,
}

impl MessageBuilder {
    fn new(folder: &FolderKey, id: MessageId) -> Self {
        Self {
            message: MailMessage {
                mailbox: folder.mailbox,
                folder: folder.folder.clone(),
                id,
                flags: MessageFlags::empty(),
                color_label: 0,
                user_flags: BTreeSet::new(),
                subject: String::new(),
                from: None,
                to: Vec::new(),
                cc: Vec::new(),
                received_at: None,
                size: 0,
                body_text: None,
                has_attachment: false,
            },
        }
    }

    pub fn flags(mut self, flags: MessageFlags) -> Self {
        self.message.flags = flags;
        self
    }

    pub fn color_label(mut self, color_label: i32) -> Self {
        self.message.color_label = color_label;
        self
    }

    pub fn user_flag(mut self, flag: impl Into<String>) -> Self {
        self.message.user_flags.insert(flag.into());
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = subject.into();
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.message.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.message.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.message.cc = cc;
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.message.received_at = Some(received_at);
        self
    }

    pub fn size(mut self, size: u64) -> Self {
        self.message.size = size;
        self
    }

    pub fn body_text(mut self, body: impl Into<String>) -> Self {
        self.message.body_text = Some(body.into());
        self
    }

    pub fn has_attachment(mut self, has_attachment: bool) -> Self {
        self.message.has_attachment = has_attachment;
        self
    }

    pub fn build(self) -> MailMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inbox() -> FolderKey {
        MailboxKey::new(1, 1, 0).folder("INBOX")
    }

    #[test]
    fn test_parse_email_with_name() {
        let addr = EmailAddress::parse("\"John Doe\" <john@example.com>");
        assert_eq!(addr.name, Some("John Doe".to_string()));
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_email_without_name() {
        let addr = EmailAddress::parse("<john@example.com>");
        assert_eq!(addr.name, None);
        assert_eq!(addr.email, "john@example.com");
        assert_eq!(EmailAddress::parse(" jane@example.com ").display(), "jane@example.com");
    }

    #[test]
    fn test_flags_bit_operations() {
        let mut flags = MessageFlags::SEEN | MessageFlags::FLAGGED;
        assert!(flags.contains(MessageFlags::SEEN));
        flags.remove(MessageFlags::SEEN);
        assert!(!flags.contains(MessageFlags::SEEN));
        flags.insert(MessageFlags::ANSWERED);
        assert_eq!(flags, MessageFlags::FLAGGED | MessageFlags::ANSWERED);
    }

    #[test]
    fn test_sync_fields_differ() {
        let base = MailMessage::builder(&inbox(), "1")
            .flags(MessageFlags::SEEN)
            .subject("Hello")
            .build();

        let mut other = base.clone();
        other.subject = "Changed subject".to_string();
        assert!(!base.sync_fields_differ(&other));

        other.user_flags.insert("$Work".to_string());
        assert!(base.sync_fields_differ(&other));

        let mut colored = base.clone();
        colored.color_label = 3;
        assert!(base.sync_fields_differ(&colored));
    }

    #[test]
    fn test_project_keeps_identity_and_requested_fields() {
        let message = MailMessage::builder(&inbox(), "7")
            .flags(MessageFlags::SEEN)
            .color_label(2)
            .user_flag("$Later")
            .subject("Quarterly report")
            .from(EmailAddress::new("boss@example.com"))
            .body_text("numbers")
            .size(1024)
            .build();

        let projected = message.project(SYNC_FIELDS);
        assert_eq!(projected.id, message.id);
        assert_eq!(projected.folder, "INBOX");
        assert_eq!(projected.flags, MessageFlags::SEEN);
        assert_eq!(projected.color_label, 2);
        assert!(projected.user_flags.contains("$Later"));
        assert!(projected.subject.is_empty());
        assert!(projected.from.is_none());
        assert!(projected.body_text.is_none());
        assert_eq!(projected.size, 0);

        assert_eq!(message.project(INDEXABLE_FIELDS), message);
    }
}
