//! Local Tantivy index backend

use std::collections::BTreeSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::Mutex;
use rayon::prelude::*;
use tantivy::collector::{Count, TopDocs};
use tantivy::directory::MmapDirectory;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, TermQuery};
use tantivy::schema::{IndexRecordOption, Term, Value};
use tantivy::{DocAddress, Index, IndexReader, IndexWriter, Order, ReloadPolicy, TantivyDocument};

use super::schema::{SchemaFields, build_schema};
use super::{IndexBackend, IndexError, Page, PageRequest, WriteOp};
use crate::models::{
    EmailAddress, FolderKey, MailMessage, MailboxKey, MessageFlags, MessageId, SortOrder,
};

/// Default heap size for the index writer (50MB)
const DEFAULT_HEAP_SIZE: usize = 50_000_000;

const NO_DATE: i64 = i64::MIN;

fn uid(folder: &FolderKey, id: &MessageId) -> String {
    format!("{}\u{1f}{}", folder, id)
}

/// Index backend over an embedded Tantivy index
pub struct TantivyBackend {
    index: Index,
    reader: IndexReader,
    fields: SchemaFields,
    writer: Mutex<Option<IndexWriter>>,
}

impl std::fmt::Debug for TantivyBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TantivyBackend")
            .field("index", &"<tantivy::Index>")
            .finish()
    }
}

impl TantivyBackend {
    /// Open or create an index directory
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)?;

        let dir = MmapDirectory::open(path).map_err(|e| IndexError::Fault(e.to_string()))?;
        let index = Index::open_or_create(dir, build_schema())?;
        info!("Opened search index at {}", path.display());
        Self::with_index(index)
    }

    /// Create an index that lives in RAM
    pub fn in_memory() -> Result<Self, IndexError> {
        Self::with_index(Index::create_in_ram(build_schema()))
    }

    fn with_index(index: Index) -> Result<Self, IndexError> {
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::Manual)
            .try_into()?;
        let fields = SchemaFields::new(&index.schema())?;

        Ok(Self {
            index,
            reader,
            fields,
            writer: Mutex::new(None),
        })
    }

    fn with_writer<R>(
        &self,
        f: impl FnOnce(&mut IndexWriter) -> Result<R, IndexError>,
    ) -> Result<R, IndexError> {
        let mut guard = self.writer.lock();
        if guard.is_none() {
            *guard = Some(self.index.writer(DEFAULT_HEAP_SIZE)?);
        }
        let Some(writer) = guard.as_mut() else {
            return Err(IndexError::Unexpected("index writer unavailable".into()));
        };
        f(writer)
    }

    fn build_query(&self, request: &PageRequest<'_>) -> Result<Box<dyn Query>, IndexError> {
        let term_query = |field, text: &str| -> Box<dyn Query> {
            Box::new(TermQuery::new(
                Term::from_field_text(field, text),
                IndexRecordOption::Basic,
            ))
        };

        let criteria = request.criteria;
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = vec![(
            Occur::Must,
            term_query(self.fields.mailbox_key, &request.mailbox.to_string()),
        )];

        if let Some(folder) = &criteria.folder {
            let key = request.mailbox.folder(folder.clone());
            clauses.push((Occur::Must, term_query(self.fields.folder_key, &key.to_string())));

            if let Some(ids) = &criteria.ids {
                let any_id = ids
                    .iter()
                    .map(|id| (Occur::Should, term_query(self.fields.uid, &uid(&key, id))))
                    .collect();
                clauses.push((Occur::Must, Box::new(BooleanQuery::new(any_id))));
            }
        } else if let Some(ids) = &criteria.ids {
            let any_id = ids
                .iter()
                .map(|id| (Occur::Should, term_query(self.fields.message_id, id.as_str())))
                .collect();
            clauses.push((Occur::Must, Box::new(BooleanQuery::new(any_id))));
        }

        if let Some(text) = &criteria.text {
            let parser = QueryParser::for_index(&self.index, self.fields.text_fields());
            let text_query = parser
                .parse_query(text)
                .map_err(|e| IndexError::Fault(format!("invalid query {:?}: {}", text, e)))?;
            clauses.push((Occur::Must, text_query));
        }

        Ok(Box::new(BooleanQuery::new(clauses)))
    }

    fn to_document(&self, message: &MailMessage) -> TantivyDocument {
        let f = &self.fields;
        let folder = message.folder_key();
        let mut doc = TantivyDocument::new();

        doc.add_text(f.uid, uid(&folder, &message.id));
        doc.add_text(f.mailbox_key, message.mailbox.to_string());
        doc.add_text(f.folder_key, folder.to_string());
        doc.add_text(f.folder, &message.folder);
        doc.add_text(f.message_id, message.id.as_str());
        doc.add_i64(f.context_id, message.mailbox.context_id.into());
        doc.add_i64(f.user_id, message.mailbox.user_id.into());
        doc.add_i64(f.account_id, message.mailbox.account_id.into());

        doc.add_u64(f.flags, message.flags.bits().into());
        doc.add_i64(f.color_label, message.color_label.into());
        for flag in &message.user_flags {
            doc.add_text(f.user_flags, flag);
        }

        doc.add_text(f.subject, &message.subject);
        if let Some(body) = &message.body_text {
            doc.add_text(f.body_text, body);
        }
        if let Some(from) = &message.from {
            doc.add_text(f.from, from.display());
        }
        for to in &message.to {
            doc.add_text(f.to, to.display());
        }
        for cc in &message.cc {
            doc.add_text(f.cc, cc.display());
        }

        doc.add_i64(
            f.received_at_ms,
            message.received_at.map_or(NO_DATE, |d| d.timestamp_millis()),
        );
        doc.add_u64(f.size, message.size);
        doc.add_u64(f.has_attachment, u64::from(message.has_attachment));
        doc
    }

    fn from_document(&self, doc: &TantivyDocument) -> Result<MailMessage, IndexError> {
        let f = &self.fields;
        let text = |field| doc.get_first(field).and_then(|v| v.as_str()).map(str::to_string);
        let int = |field| doc.get_first(field).and_then(|v| v.as_i64()).unwrap_or_default();
        let uint = |field| doc.get_first(field).and_then(|v| v.as_u64()).unwrap_or_default();
        let all = |field| {
            doc.get_all(field)
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect::<Vec<_>>()
        };

        let (Some(folder), Some(id)) = (text(f.folder), text(f.message_id)) else {
            return Err(IndexError::Unexpected(
                "indexed document without folder or message id".into(),
            ));
        };

        let mailbox = MailboxKey::new(
            int(f.context_id) as i32,
            int(f.user_id) as i32,
            int(f.account_id) as i32,
        );
        let received_at = match int(f.received_at_ms) {
            NO_DATE => None,
            ms => DateTime::<Utc>::from_timestamp_millis(ms),
        };

        Ok(MailMessage {
            mailbox,
            folder,
            id: MessageId::new(id),
            flags: MessageFlags(uint(f.flags) as u32),
            color_label: int(f.color_label) as i32,
            user_flags: all(f.user_flags).into_iter().collect::<BTreeSet<_>>(),
            subject: text(f.subject).unwrap_or_default(),
            from: text(f.from).map(|a| EmailAddress::parse(&a)),
            to: all(f.to).iter().map(|a| EmailAddress::parse(a)).collect(),
            cc: all(f.cc).iter().map(|a| EmailAddress::parse(a)).collect(),
            received_at,
            size: uint(f.size),
            body_text: text(f.body_text),
            has_attachment: uint(f.has_attachment) != 0,
        })
    }

    /// Committed document by uid
    fn stored(&self, folder: &FolderKey, id: &MessageId) -> Result<Option<MailMessage>, IndexError> {
        let searcher = self.reader.searcher();
        let query = TermQuery::new(
            Term::from_field_text(self.fields.uid, &uid(folder, id)),
            IndexRecordOption::Basic,
        );
        let hits = searcher.search(&query, &TopDocs::with_limit(1))?;
        match hits.first() {
            Some((_, address)) => {
                let doc: TantivyDocument = searcher.doc(*address)?;
                self.from_document(&doc).map(Some)
            }
            None => Ok(None),
        }
    }
}

impl IndexBackend for TantivyBackend {
    fn search(&self, request: &PageRequest<'_>) -> Result<Page, IndexError> {
        if request.limit == 0 {
            return Err(IndexError::Unexpected("page limit must be positive".into()));
        }

        let searcher = self.reader.searcher();
        let query = self.build_query(request)?;
        let top = TopDocs::with_limit(request.limit).and_offset(request.offset);

        let (total, addresses): (usize, Vec<DocAddress>) = match request.sort {
            SortOrder::Natural => {
                let (total, hits) = searcher.search(&query, &(Count, top))?;
                (total, hits.into_iter().map(|(_, a)| a).collect())
            }
            SortOrder::ReceivedAscending | SortOrder::ReceivedDescending => {
                let order = if request.sort == SortOrder::ReceivedAscending {
                    Order::Asc
                } else {
                    Order::Desc
                };
                let sorted = top.order_by_fast_field::<i64>("received_at_ms", order);
                let (total, hits) = searcher.search(&query, &(Count, sorted))?;
                (total, hits.into_iter().map(|(_, a)| a).collect())
            }
        };

        let mut messages = Vec::with_capacity(addresses.len());
        for address in addresses {
            let doc: TantivyDocument = searcher.doc(address)?;
            messages.push(self.from_document(&doc)?.project(request.fields));
        }

        Ok(Page { messages, total })
    }

    fn write(&self, ops: &[WriteOp]) -> Result<(), IndexError> {
        let documents: Vec<Option<TantivyDocument>> = ops
            .par_iter()
            .map(|op| match op {
                WriteOp::Upsert(message) => Some(self.to_document(message)),
                _ => None,
            })
            .collect();

        self.with_writer(|writer| {
            for (op, document) in ops.iter().zip(documents) {
                match (op, document) {
                    (WriteOp::Upsert(message), Some(document)) => {
                        let key = uid(&message.folder_key(), &message.id);
                        writer.delete_term(Term::from_field_text(self.fields.uid, &key));
                        writer.add_document(document)?;
                    }
                    (WriteOp::Update(update), _) => {
                        let Some(mut message) = self.stored(&update.folder, &update.id)? else {
                            debug!("Skipping update of unindexed message {}", update.id);
                            continue;
                        };
                        update.apply_to(&mut message);
                        writer.delete_term(Term::from_field_text(
                            self.fields.uid,
                            &uid(&update.folder, &update.id),
                        ));
                        writer.add_document(self.to_document(&message))?;
                    }
                    (WriteOp::Delete { folder, ids }, _) => {
                        for id in ids {
                            writer.delete_term(Term::from_field_text(
                                self.fields.uid,
                                &uid(folder, id),
                            ));
                        }
                    }
                    (WriteOp::DeleteFolder(folder), _) => {
                        writer.delete_term(Term::from_field_text(
                            self.fields.folder_key,
                            &folder.to_string(),
                        ));
                    }
                    (WriteOp::Upsert(_), None) => {
                        return Err(IndexError::Unexpected("upsert without document".into()));
                    }
                }
            }
            Ok(())
        })
    }

    fn commit(&self) -> Result<(), IndexError> {
        self.with_writer(|writer| {
            writer.commit()?;
            Ok(())
        })?;
        self.reader.reload()?;
        Ok(())
    }

    fn rollback(&self) -> Result<(), IndexError> {
        self.with_writer(|writer| {
            writer.rollback()?;
            Ok(())
        })
    }
}
