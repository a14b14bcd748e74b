//! Remote index backend speaking a Solr-style JSON API
//!
//! Queries go to `{base}/query` using the JSON request API, mutations to
//! `{base}/update`. Updates stay invisible until an explicit commit.
//! Uses synchronous HTTP (ureq) like the rest of the crate.

use std::collections::HashSet;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use ureq::Agent;
use url::Url;

use super::{IndexBackend, IndexError, Page, PageRequest, WriteOp};
use crate::models::{
    EmailAddress, FolderKey, MailMessage, MailboxKey, MessageField, MessageFlags, MessageId,
    SortOrder,
};

/// Stored fields of an indexed message, as the service returns them
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
struct IndexDocument {
    uid: String,
    mailbox_key: String,
    folder_key: String,
    context_id: i32,
    user_id: i32,
    account_id: i32,
    folder: String,
    message_id: String,
    flags: u32,
    color_label: i32,
    user_flags: Vec<String>,
    subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    body_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    from: Option<String>,
    to: Vec<String>,
    cc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    received_at_ms: Option<i64>,
    size: u64,
    has_attachment: bool,
}

impl From<&MailMessage> for IndexDocument {
    fn from(m: &MailMessage) -> Self {
        let folder = m.folder_key();
        Self {
            uid: uid(&folder, &m.id),
            mailbox_key: m.mailbox.to_string(),
            folder_key: folder.to_string(),
            context_id: m.mailbox.context_id,
            user_id: m.mailbox.user_id,
            account_id: m.mailbox.account_id,
            folder: m.folder.clone(),
            message_id: m.id.to_string(),
            flags: m.flags.bits(),
            color_label: m.color_label,
            user_flags: m.user_flags.iter().cloned().collect(),
            subject: m.subject.clone(),
            body_text: m.body_text.clone(),
            from: m.from.as_ref().map(EmailAddress::display),
            to: m.to.iter().map(EmailAddress::display).collect(),
            cc: m.cc.iter().map(EmailAddress::display).collect(),
            received_at_ms: m.received_at.map(|d| d.timestamp_millis()),
            size: m.size,
            has_attachment: m.has_attachment,
        }
    }
}

impl IndexDocument {
    fn into_message(self) -> MailMessage {
        MailMessage {
            mailbox: MailboxKey::new(self.context_id, self.user_id, self.account_id),
            folder: self.folder,
            id: MessageId::new(self.message_id),
            flags: MessageFlags(self.flags),
            color_label: self.color_label,
            user_flags: self.user_flags.into_iter().collect(),
            subject: self.subject,
            from: self.from.as_deref().map(EmailAddress::parse),
            to: self.to.iter().map(|a| EmailAddress::parse(a)).collect(),
            cc: self.cc.iter().map(|a| EmailAddress::parse(a)).collect(),
            received_at: self
                .received_at_ms
                .and_then(DateTime::<Utc>::from_timestamp_millis),
            size: self.size,
            body_text: self.body_text,
            has_attachment: self.has_attachment,
        }
    }
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    response: QueryResult,
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    #[serde(rename = "numFound")]
    num_found: usize,
    #[serde(default)]
    docs: Vec<IndexDocument>,
}

fn uid(folder: &FolderKey, id: &MessageId) -> String {
    format!("{}\u{1f}{}", folder, id)
}

/// Quote a value as a phrase term
fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

fn field_names(fields: &[MessageField]) -> Vec<&'static str> {
    let mut names = vec!["folder", "message_id", "context_id", "user_id", "account_id"];
    for field in fields {
        names.extend_from_slice(match field {
            MessageField::Flags => &["flags"][..],
            MessageField::ColorLabel => &["color_label"][..],
            MessageField::UserFlags => &["user_flags"][..],
            MessageField::Subject => &["subject"][..],
            MessageField::From => &["from"][..],
            MessageField::Recipients => &["to", "cc"][..],
            MessageField::ReceivedDate => &["received_at_ms"][..],
            MessageField::Size => &["size"][..],
            MessageField::Body => &["body_text"][..],
            MessageField::Attachment => &["has_attachment"][..],
        });
    }
    names
}

/// JSON request body for one page
fn query_body(request: &PageRequest<'_>) -> Value {
    let criteria = request.criteria;
    let mut filters = vec![format!("mailbox_key:{}", quote(&request.mailbox.to_string()))];

    if let Some(folder) = &criteria.folder {
        let key = request.mailbox.folder(folder.clone());
        filters.push(format!("folder_key:{}", quote(&key.to_string())));
        if let Some(ids) = &criteria.ids {
            let uids: Vec<_> = ids.iter().map(|id| quote(&uid(&key, id))).collect();
            filters.push(format!("uid:({})", uids.join(" OR ")));
        }
    } else if let Some(ids) = &criteria.ids {
        let ids: Vec<_> = ids.iter().map(|id| quote(id.as_str())).collect();
        filters.push(format!("message_id:({})", ids.join(" OR ")));
    }

    let mut body = json!({
        "query": criteria.text.as_deref().map_or("*:*".to_string(), quote),
        "filter": filters,
        "offset": request.offset,
        "limit": request.limit,
        "fields": field_names(request.fields).join(","),
    });
    if criteria.text.is_some() {
        body["params"] = json!({ "defType": "edismax", "qf": "subject body_text from to cc" });
    }
    match request.sort {
        SortOrder::Natural => {}
        SortOrder::ReceivedAscending => body["sort"] = json!("received_at_ms asc"),
        SortOrder::ReceivedDescending => body["sort"] = json!("received_at_ms desc"),
    }
    body
}

fn map_error(err: ureq::Error) -> IndexError {
    match err {
        ureq::Error::Timeout(t) => IndexError::timed_out(format!("index request timed out: {}", t)),
        ureq::Error::Io(e) => IndexError::Io(e),
        ureq::Error::StatusCode(code) => {
            IndexError::Fault(format!("index service answered HTTP {}", code))
        }
        other => IndexError::Io(io::Error::other(other.to_string())),
    }
}

/// Index backend over HTTP
///
/// Holds two agents: the regular one with a read timeout, and one without
/// for the single retry after a timeout.
pub struct HttpIndexBackend {
    base: Url,
    agent: Agent,
    patient: Option<Arc<HttpIndexBackend>>,
}

impl HttpIndexBackend {
    /// Connect to `base_url`; `read_timeout` bounds waiting for a response
    pub fn new(base_url: &str, read_timeout: Option<Duration>) -> Result<Self, IndexError> {
        let mut base = Url::parse(base_url)
            .map_err(|e| IndexError::Unexpected(format!("invalid index url {}: {}", base_url, e)))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }

        let patient = read_timeout.map(|_| {
            Arc::new(Self {
                base: base.clone(),
                agent: build_agent(None),
                patient: None,
            })
        });

        Ok(Self {
            base,
            agent: build_agent(read_timeout),
            patient,
        })
    }

    fn endpoint(&self, path: &str) -> Result<Url, IndexError> {
        self.base
            .join(path)
            .map_err(|e| IndexError::Unexpected(format!("invalid index endpoint {}: {}", path, e)))
    }

    fn post(&self, path: &str, body: &Value) -> Result<String, IndexError> {
        let url = self.endpoint(path)?;
        let mut response = self
            .agent
            .post(url.as_str())
            .header("Accept", "application/json")
            .send_json(body)
            .map_err(map_error)?;
        response.body_mut().read_to_string().map_err(map_error)
    }

    fn update(&self, body: &Value) -> Result<(), IndexError> {
        self.post("update", body)?;
        Ok(())
    }

    /// Uids among `uids` that are committed in the index
    fn existing(&self, folder: &FolderKey, uids: &[String]) -> Result<HashSet<String>, IndexError> {
        let quoted: Vec<_> = uids.iter().map(|u| quote(u)).collect();
        let body = json!({
            "query": "*:*",
            "filter": [
                format!("folder_key:{}", quote(&folder.to_string())),
                format!("uid:({})", quoted.join(" OR ")),
            ],
            "offset": 0,
            "limit": uids.len(),
            "fields": "uid",
        });
        let text = self.post("query", &body)?;
        let parsed: QueryResponse = serde_json::from_str(&text)
            .map_err(|e| IndexError::Unexpected(format!("unreadable index response: {}", e)))?;
        Ok(parsed.response.docs.into_iter().map(|d| d.uid).collect())
    }

    fn flush_adds(&self, adds: &mut Vec<IndexDocument>) -> Result<(), IndexError> {
        if adds.is_empty() {
            return Ok(());
        }
        let body = serde_json::to_value(std::mem::take(adds))
            .map_err(|e| IndexError::Unexpected(e.to_string()))?;
        self.update(&body)
    }
}

fn build_agent(read_timeout: Option<Duration>) -> Agent {
    let config = Agent::config_builder()
        .timeout_recv_response(read_timeout)
        .timeout_recv_body(read_timeout)
        .build();
    Agent::new_with_config(config)
}

impl IndexBackend for HttpIndexBackend {
    fn search(&self, request: &PageRequest<'_>) -> Result<Page, IndexError> {
        if request.limit == 0 {
            return Err(IndexError::Unexpected("page limit must be positive".into()));
        }

        let text = self.post("query", &query_body(request))?;
        let parsed: QueryResponse = serde_json::from_str(&text)
            .map_err(|e| IndexError::Unexpected(format!("unreadable index response: {}", e)))?;

        Ok(Page {
            total: parsed.response.num_found,
            messages: parsed
                .response
                .docs
                .into_iter()
                .map(|d| d.into_message().project(request.fields))
                .collect(),
        })
    }

    fn write(&self, ops: &[WriteOp]) -> Result<(), IndexError> {
        let mut adds = Vec::new();
        for op in ops {
            match op {
                WriteOp::Upsert(message) => adds.push(IndexDocument::from(message)),
                WriteOp::Update(update) => {
                    self.flush_adds(&mut adds)?;
                    let key = uid(&update.folder, &update.id);
                    if !self.existing(&update.folder, std::slice::from_ref(&key))?.contains(&key) {
                        debug!("Skipping update of unindexed message {}", update.id);
                        continue;
                    }
                    self.update(&json!([{
                        "uid": key,
                        "flags": { "set": update.flags.bits() },
                        "color_label": { "set": update.color_label },
                        "user_flags": { "set": update.user_flags },
                    }]))?;
                }
                WriteOp::Delete { folder, ids } => {
                    self.flush_adds(&mut adds)?;
                    let uids: Vec<_> = ids.iter().map(|id| uid(folder, id)).collect();
                    self.update(&json!({ "delete": uids }))?;
                }
                WriteOp::DeleteFolder(folder) => {
                    self.flush_adds(&mut adds)?;
                    let query = format!("folder_key:{}", quote(&folder.to_string()));
                    self.update(&json!({ "delete": { "query": query } }))?;
                }
            }
        }
        self.flush_adds(&mut adds)
    }

    fn commit(&self) -> Result<(), IndexError> {
        self.update(&json!({ "commit": {} }))
    }

    fn rollback(&self) -> Result<(), IndexError> {
        self.update(&json!({ "rollback": {} }))
    }

    fn without_read_timeout(&self) -> Option<Arc<dyn IndexBackend>> {
        self.patient
            .clone()
            .map(|backend| backend as Arc<dyn IndexBackend>)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::SearchCriteria;
    use crate::models::{INDEXABLE_FIELDS, SYNC_FIELDS};
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;

    fn inbox() -> FolderKey {
        MailboxKey::new(2, 5, 0).folder("INBOX")
    }

    /// Serve one canned JSON response per connection and return the request bodies
    fn serve(responses: Vec<String>) -> (String, std::thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/solr/mail", listener.local_addr().unwrap());
        let handle = std::thread::spawn(move || {
            let mut bodies = Vec::new();
            for response in responses {
                let (stream, _) = listener.accept().unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut content_length = 0;
                loop {
                    let mut line = String::new();
                    reader.read_line(&mut line).unwrap();
                    let line = line.trim_end();
                    if line.is_empty() {
                        break;
                    }
                    if let Some((name, value)) = line.split_once(':')
                        && name.eq_ignore_ascii_case("content-length")
                    {
                        content_length = value.trim().parse().unwrap();
                    }
                }
                let mut body = vec![0; content_length];
                reader.read_exact(&mut body).unwrap();
                bodies.push(String::from_utf8(body).unwrap());

                let mut stream = stream;
                write!(
                    stream,
                    "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    response.len(),
                    response
                )
                .unwrap();
            }
            bodies
        });
        (url, handle)
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[test]
    fn test_query_body_shape() {
        let mailbox = inbox().mailbox;
        let criteria = SearchCriteria::folder("INBOX").with_ids(&[MessageId::new("7")]);
        let body = query_body(&PageRequest {
            mailbox: &mailbox,
            criteria: &criteria,
            sort: SortOrder::ReceivedDescending,
            offset: 20,
            limit: 10,
            fields: SYNC_FIELDS,
        });

        assert_eq!(body["query"], "*:*");
        assert_eq!(body["offset"], 20);
        assert_eq!(body["limit"], 10);
        assert_eq!(body["sort"], "received_at_ms desc");
        let filters = body["filter"].as_array().unwrap();
        assert_eq!(filters[0], "mailbox_key:\"2/5/0\"");
        assert_eq!(filters[1], "folder_key:\"2/5/0/INBOX\"");
        assert!(filters[2].as_str().unwrap().starts_with("uid:("));
        assert!(body["fields"].as_str().unwrap().contains("user_flags"));
    }

    #[test]
    fn test_document_conversion() {
        let message = MailMessage::builder(&inbox(), "9")
            .subject("Lunch")
            .from(EmailAddress::with_name("Carol", "carol@example.com"))
            .flags(MessageFlags::FLAGGED)
            .user_flag("$Todo")
            .build();
        let doc = IndexDocument::from(&message);
        assert_eq!(doc.folder_key, "2/5/0/INBOX");
        assert_eq!(doc.into_message(), message);
    }

    #[test]
    fn test_search_parses_response() {
        let response = json!({
            "response": {
                "numFound": 42,
                "docs": [
                    { "folder": "INBOX", "message_id": "1", "context_id": 2, "user_id": 5,
                      "account_id": 0, "flags": 32, "subject": "Hi" }
                ]
            }
        })
        .to_string();
        let (url, server) = serve(vec![response]);
        let backend = HttpIndexBackend::new(&url, Some(Duration::from_secs(5))).unwrap();

        let mailbox = inbox().mailbox;
        let page = backend
            .search(&PageRequest {
                mailbox: &mailbox,
                criteria: &SearchCriteria::folder("INBOX"),
                sort: SortOrder::Natural,
                offset: 0,
                limit: 1,
                fields: INDEXABLE_FIELDS,
            })
            .unwrap();

        assert_eq!(page.total, 42);
        assert_eq!(page.messages[0].id.as_str(), "1");
        assert_eq!(page.messages[0].flags, MessageFlags::SEEN);
        assert_eq!(page.messages[0].mailbox, mailbox);

        let bodies = server.join().unwrap();
        assert_eq!(bodies.len(), 1);
    }

    #[test]
    fn test_unreadable_response_is_unexpected() {
        let (url, server) = serve(vec!["not json".to_string(), "not json".to_string()]);
        let backend = HttpIndexBackend::new(&url, None).unwrap();
        assert!(backend.without_read_timeout().is_none());

        // Update responses are not interpreted
        backend.commit().unwrap();

        let mailbox = inbox().mailbox;
        let err = backend
            .search(&PageRequest {
                mailbox: &mailbox,
                criteria: &SearchCriteria::default(),
                sort: SortOrder::Natural,
                offset: 0,
                limit: 10,
                fields: &[],
            })
            .unwrap_err();
        assert_eq!(err.kind(), crate::index::IndexErrorKind::Unexpected);
        server.join().unwrap();
    }

    #[test]
    fn test_read_timeout_is_timeout_class() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}/", listener.local_addr().unwrap());
        let server = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(800));
            drop(stream);
        });

        let backend = HttpIndexBackend::new(&url, Some(Duration::from_millis(100))).unwrap();
        let err = backend.commit().unwrap_err();
        assert!(err.is_timeout(), "unexpected error: {}", err);
        assert!(backend.without_read_timeout().is_some());
        server.join().unwrap();
    }
}
