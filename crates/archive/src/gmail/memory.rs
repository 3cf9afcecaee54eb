//! In-memory mailbox implementing the remote traits
//!
//! Serves fixture threads, attachments, labels and contacts with offset
//! page tokens (`offset-N`). Failures can be scripted per page, thread or
//! attachment, and calls are counted so tests can assert on what was fetched.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::prelude::*;

use super::api::{
    AttachmentBody, ConnectionsResponse, GmailLabel, GmailThread, ListLabelsResponse,
    ListThreadsResponse, Person, ThreadRef,
};
use super::{ClientProvider, ContactRemote, LabelRemote, MailRemote};
use crate::error::RemoteError;

#[derive(Default)]
struct MailboxState {
    page_size: usize,
    threads: Vec<GmailThread>,
    attachments: HashMap<(String, String), String>,
    labels: Vec<GmailLabel>,
    people: Vec<Person>,

    list_failures: HashMap<String, VecDeque<RemoteError>>,
    thread_failures: HashMap<String, VecDeque<RemoteError>>,
    attachment_failures: HashMap<String, VecDeque<RemoteError>>,

    list_calls: Vec<Option<String>>,
    thread_fetches: HashMap<String, usize>,
    attachment_fetches: usize,
    deleted: Vec<String>,
    clients_created: usize,
}

/// A scripted mailbox; clones share state
#[derive(Clone)]
pub struct InMemoryMailbox {
    state: Arc<Mutex<MailboxState>>,
}

impl InMemoryMailbox {
    pub fn new(page_size: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MailboxState {
                page_size: page_size.max(1),
                ..Default::default()
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, MailboxState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Page token pointing at the `offset`-th thread
    pub fn page_token(offset: usize) -> String {
        format!("offset-{}", offset)
    }

    fn parse_token(token: Option<&str>) -> Result<usize, RemoteError> {
        match token.filter(|t| !t.is_empty()) {
            None => Ok(0),
            Some(t) => t
                .strip_prefix("offset-")
                .and_then(|n| n.parse().ok())
                .ok_or_else(|| RemoteError::Fatal(format!("invalid page token {}", t))),
        }
    }

    pub fn add_thread(&self, thread: GmailThread) {
        self.state().threads.push(thread);
    }

    /// Serve `data` (encoded as URL-safe base64) for an attachment
    pub fn add_attachment(&self, message_id: &str, attachment_id: &str, data: &[u8]) {
        self.add_attachment_data(message_id, attachment_id, BASE64_URL_SAFE_NO_PAD.encode(data));
    }

    /// Serve an attachment body verbatim, encoded or not
    pub fn add_attachment_data(&self, message_id: &str, attachment_id: &str, data: String) {
        self.state()
            .attachments
            .insert((message_id.to_string(), attachment_id.to_string()), data);
    }

    pub fn add_label(&self, label: GmailLabel) {
        self.state().labels.push(label);
    }

    pub fn add_person(&self, person: Person) {
        self.state().people.push(person);
    }

    /// Fail the listing at `page_token` (None = first page) with each error in turn
    pub fn fail_listing(&self, page_token: Option<&str>, errors: Vec<RemoteError>) {
        self.state()
            .list_failures
            .entry(page_token.unwrap_or_default().to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_thread(&self, thread_id: &str, errors: Vec<RemoteError>) {
        self.state()
            .thread_failures
            .entry(thread_id.to_string())
            .or_default()
            .extend(errors);
    }

    pub fn fail_attachment(&self, attachment_id: &str, errors: Vec<RemoteError>) {
        self.state()
            .attachment_failures
            .entry(attachment_id.to_string())
            .or_default()
            .extend(errors);
    }

    /// Page tokens requested so far, in call order
    pub fn list_calls(&self) -> Vec<Option<String>> {
        self.state().list_calls.clone()
    }

    pub fn thread_fetches(&self, thread_id: &str) -> usize {
        self.state()
            .thread_fetches
            .get(thread_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn attachment_fetches(&self) -> usize {
        self.state().attachment_fetches
    }

    /// Message ids deleted so far. Fixture data stays in place so page tokens remain stable.
    pub fn deleted(&self) -> Vec<String> {
        self.state().deleted.clone()
    }

    pub fn clients_created(&self) -> usize {
        self.state().clients_created
    }
}

fn next_failure(
    failures: &mut HashMap<String, VecDeque<RemoteError>>,
    key: &str,
) -> Option<RemoteError> {
    failures.get_mut(key).and_then(VecDeque::pop_front)
}

impl MailRemote for InMemoryMailbox {
    /// The query is not evaluated; every fixture thread matches.
    fn list_threads(
        &self,
        _query: &str,
        page_token: Option<&str>,
    ) -> Result<ListThreadsResponse, RemoteError> {
        let mut state = self.state();
        state.list_calls.push(page_token.map(str::to_string));

        if let Some(err) = next_failure(&mut state.list_failures, page_token.unwrap_or_default()) {
            return Err(err);
        }

        let offset = Self::parse_token(page_token)?;
        let end = (offset + state.page_size).min(state.threads.len());
        let threads = state
            .threads
            .get(offset..end)
            .unwrap_or_default()
            .iter()
            .map(|t| ThreadRef {
                id: t.id.clone(),
                snippet: t.snippet.clone(),
                history_id: t.history_id.clone(),
            })
            .collect();

        Ok(ListThreadsResponse {
            threads,
            next_page_token: (end < state.threads.len()).then(|| Self::page_token(end)),
            result_size_estimate: Some(state.threads.len() as u32),
        })
    }

    fn get_thread(&self, id: &str) -> Result<GmailThread, RemoteError> {
        let mut state = self.state();
        *state.thread_fetches.entry(id.to_string()).or_default() += 1;

        if let Some(err) = next_failure(&mut state.thread_failures, id) {
            return Err(err);
        }

        state
            .threads
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("thread {}", id)))
    }

    fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, RemoteError> {
        let mut state = self.state();
        state.attachment_fetches += 1;

        if let Some(err) = next_failure(&mut state.attachment_failures, attachment_id) {
            return Err(err);
        }

        let data = state
            .attachments
            .get(&(message_id.to_string(), attachment_id.to_string()))
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("attachment {}", attachment_id)))?;

        Ok(AttachmentBody {
            size: data.len() as u64,
            data,
        })
    }

    fn delete_message(&self, id: &str) -> Result<(), RemoteError> {
        self.state().deleted.push(id.to_string());
        Ok(())
    }
}

impl LabelRemote for InMemoryMailbox {
    fn list_labels(&self) -> Result<ListLabelsResponse, RemoteError> {
        let labels = self
            .state()
            .labels
            .iter()
            .map(|l| GmailLabel {
                id: l.id.clone(),
                name: l.name.clone(),
                label_type: l.label_type.clone(),
                ..Default::default()
            })
            .collect();
        Ok(ListLabelsResponse { labels })
    }

    fn get_label(&self, id: &str) -> Result<GmailLabel, RemoteError> {
        self.state()
            .labels
            .iter()
            .find(|l| l.id == id)
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(format!("label {}", id)))
    }
}

impl ContactRemote for InMemoryMailbox {
    fn list_connections(
        &self,
        page_token: Option<&str>,
    ) -> Result<ConnectionsResponse, RemoteError> {
        let state = self.state();
        let offset = Self::parse_token(page_token)?;
        let end = (offset + state.page_size).min(state.people.len());
        Ok(ConnectionsResponse {
            connections: state.people.get(offset..end).unwrap_or_default().to_vec(),
            next_page_token: (end < state.people.len()).then(|| Self::page_token(end)),
        })
    }
}

impl ClientProvider for InMemoryMailbox {
    fn mail(&self, _owner: &str) -> anyhow::Result<Box<dyn MailRemote>> {
        self.state().clients_created += 1;
        Ok(Box::new(self.clone()))
    }

    fn labels(&self, _owner: &str) -> anyhow::Result<Box<dyn LabelRemote>> {
        self.state().clients_created += 1;
        Ok(Box::new(self.clone()))
    }

    fn contacts(&self, _owner: &str) -> anyhow::Result<Box<dyn ContactRemote>> {
        self.state().clients_created += 1;
        Ok(Box::new(self.clone()))
    }
}

/// Builders for wire-format fixtures
pub mod fixtures {
    use base64::prelude::*;

    use crate::gmail::api::{GmailMessage, GmailThread, Header, MessagePart, PartBody};

    fn header(name: &str, value: &str) -> Header {
        Header {
            name: name.to_string(),
            value: value.to_string(),
        }
    }

    /// A single-part text/plain message
    pub fn simple_message(id: &str, thread_id: &str, internal_date: i64, subject: &str, body: &str) -> GmailMessage {
        GmailMessage {
            id: id.to_string(),
            thread_id: thread_id.to_string(),
            label_ids: vec!["INBOX".to_string()],
            snippet: body.chars().take(100).collect(),
            history_id: "100".to_string(),
            internal_date: internal_date.to_string(),
            size_estimate: body.len() as u64,
            payload: Some(MessagePart {
                part_id: String::new(),
                mime_type: "text/plain".to_string(),
                filename: String::new(),
                headers: vec![
                    header("Subject", subject),
                    header("From", "Sender <sender@example.com>"),
                    header("To", "me@example.com"),
                ],
                body: PartBody {
                    attachment_id: None,
                    size: body.len() as u64,
                    data: Some(BASE64_URL_SAFE_NO_PAD.encode(body.as_bytes())),
                },
                parts: Vec::new(),
            }),
        }
    }

    /// Turn the message into multipart/mixed with an extra attachment part
    pub fn with_attachment(
        mut message: GmailMessage,
        attachment_id: &str,
        filename: &str,
        size: u64,
    ) -> GmailMessage {
        let Some(root) = message.payload.take() else {
            return message;
        };
        let part_index = 1 + root.parts.len();
        let body_part = MessagePart {
            part_id: "0".to_string(),
            headers: Vec::new(),
            ..root.clone()
        };
        let attachment = MessagePart {
            part_id: part_index.to_string(),
            mime_type: "application/octet-stream".to_string(),
            filename: filename.to_string(),
            headers: vec![header(
                "Content-Disposition",
                &format!("attachment; filename=\"{}\"", filename),
            )],
            body: PartBody {
                attachment_id: Some(attachment_id.to_string()),
                size,
                data: None,
            },
            parts: Vec::new(),
        };
        let parts = if root.mime_type.starts_with("multipart/") {
            let mut parts = root.parts.clone();
            parts.push(attachment);
            parts
        } else {
            vec![body_part, attachment]
        };
        message.payload = Some(MessagePart {
            part_id: String::new(),
            mime_type: "multipart/mixed".to_string(),
            filename: String::new(),
            headers: root.headers,
            body: PartBody::default(),
            parts,
        });
        message
    }

    /// A thread whose history id is the last message's
    pub fn thread_of(id: &str, messages: Vec<GmailMessage>) -> GmailThread {
        GmailThread {
            id: id.to_string(),
            history_id: messages
                .last()
                .map(|m| m.history_id.clone())
                .unwrap_or_default(),
            snippet: messages
                .last()
                .map(|m| m.snippet.clone())
                .unwrap_or_default(),
            messages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn mailbox_with(count: usize, page_size: usize) -> InMemoryMailbox {
        let mailbox = InMemoryMailbox::new(page_size);
        for i in 0..count {
            let id = format!("t{}", i);
            mailbox.add_thread(thread_of(
                &id,
                vec![simple_message(&format!("m{}", i), &id, 1_000, "s", "b")],
            ));
        }
        mailbox
    }

    #[test]
    fn test_paging() {
        let mailbox = mailbox_with(5, 2);

        let first = mailbox.list_threads("", None).unwrap();
        assert_eq!(first.threads.len(), 2);
        assert_eq!(first.next_page_token.as_deref(), Some("offset-2"));

        let last = mailbox.list_threads("", Some("offset-4")).unwrap();
        assert_eq!(last.threads.len(), 1);
        assert!(last.next_page_token.is_none());

        assert_eq!(
            mailbox.list_calls(),
            vec![None, Some("offset-4".to_string())]
        );
    }

    #[test]
    fn test_scripted_failures_are_consumed() {
        let mailbox = mailbox_with(1, 10);
        mailbox.fail_listing(None, vec![RemoteError::RateLimited]);
        mailbox.fail_thread("t0", vec![RemoteError::Fatal("bad".into())]);

        assert_eq!(mailbox.list_threads("", None).unwrap_err(), RemoteError::RateLimited);
        assert!(mailbox.list_threads("", None).is_ok());

        assert!(mailbox.get_thread("t0").is_err());
        assert!(mailbox.get_thread("t0").is_ok());
        assert_eq!(mailbox.thread_fetches("t0"), 2);
    }

    #[test]
    fn test_attachment_fixture() {
        let mailbox = InMemoryMailbox::new(10);
        let message = with_attachment(simple_message("m1", "t1", 1_000, "s", "b"), "a1", "x.bin", 3);
        let payload = message.payload.as_ref().unwrap();
        assert_eq!(payload.mime_type, "multipart/mixed");
        assert_eq!(payload.parts.len(), 2);
        assert_eq!(payload.parts[1].body.attachment_id.as_deref(), Some("a1"));

        mailbox.add_attachment("m1", "a1", b"abc");
        let body = mailbox.get_attachment("m1", "a1").unwrap();
        assert_eq!(body.data, "YWJj");
        assert!(matches!(
            mailbox.get_attachment("m1", "missing"),
            Err(RemoteError::NotFound(_))
        ));
    }
}
