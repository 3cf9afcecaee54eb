//! Storage trait definitions

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::{
    Attachment, Contact, Label, Message, MessageId, RawMessage, SyncRun, SyncRunId, Thread,
    ThreadId,
};

/// Case-insensitive substring search over archived threads.
///
/// `text` matches any of subject, snippet, from, to, text body or HTML body.
/// Field terms narrow further; every set term has to match the same message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThreadSearch {
    pub text: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

impl ThreadSearch {
    pub fn text(query: impl Into<String>) -> Self {
        Self {
            text: Some(query.into()),
            ..Self::default()
        }
    }

    /// Terms that are set and non-blank, lower-cased
    pub fn terms(&self) -> SearchTerms {
        fn norm(term: &Option<String>) -> Option<String> {
            term.as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_lowercase)
        }
        SearchTerms {
            text: norm(&self.text),
            from: norm(&self.from),
            to: norm(&self.to),
            subject: norm(&self.subject),
            body: norm(&self.body),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.terms() == SearchTerms::default()
    }
}

/// Normalized form of a [`ThreadSearch`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchTerms {
    pub text: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub subject: Option<String>,
    pub body: Option<String>,
}

impl SearchTerms {
    /// In-memory evaluation against one message of a thread
    pub fn matches(&self, thread: &Thread, message: &Message) -> bool {
        let contains = |haystack: &str, needle: &str| haystack.to_lowercase().contains(needle);
        let any_addr = |addrs: &[String], needle: &str| addrs.iter().any(|a| contains(a, needle));

        if let Some(text) = &self.text {
            let hit = contains(&message.subject, text)
                || contains(&thread.snippet, text)
                || contains(&message.snippet, text)
                || any_addr(&message.from, text)
                || any_addr(&message.to, text)
                || contains(&message.body_text, text)
                || contains(&message.body_html, text);
            if !hit {
                return false;
            }
        }
        if let Some(from) = &self.from
            && !any_addr(&message.from, from)
        {
            return false;
        }
        if let Some(to) = &self.to
            && !any_addr(&message.to, to)
        {
            return false;
        }
        if let Some(subject) = &self.subject
            && !contains(&message.subject, subject)
        {
            return false;
        }
        if let Some(body) = &self.body
            && !(contains(&message.body_text, body) || contains(&message.body_html, body))
        {
            return false;
        }
        true
    }
}

/// Per-owner entity counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveStats {
    pub threads: u64,
    pub messages: u64,
    pub attachments: u64,
    pub blob_attachments: u64,
    pub labels: u64,
    pub contacts: u64,
}

/// Trait for archive storage operations
///
/// Every entity is keyed by owner plus its natural key. Writes are upserts
/// (attachments: insert-if-absent) and nothing here deletes archived mail.
pub trait ArchiveStore: Send + Sync {
    // === Threads ===

    /// Insert or update a thread by (owner, id)
    fn upsert_thread(&self, thread: Thread) -> Result<()>;

    fn get_thread(&self, owner: &str, id: &ThreadId) -> Result<Option<Thread>>;

    /// List threads, ordered by last_message_at descending
    fn list_threads(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<Thread>>;

    /// List threads carrying the given label, ordered by last_message_at descending
    fn list_threads_by_label(
        &self,
        owner: &str,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>>;

    /// Threads with at least one message matching the search, newest first
    fn search_threads(
        &self,
        owner: &str,
        search: &ThreadSearch,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>>;

    // === Messages ===

    /// Insert or update a message by (owner, id, thread id)
    fn upsert_message(&self, message: Message) -> Result<()>;

    fn get_message(&self, owner: &str, id: &MessageId) -> Result<Option<Message>>;

    /// Messages of a thread, newest first
    fn list_messages_for_thread(&self, owner: &str, thread_id: &ThreadId) -> Result<Vec<Message>>;

    // === Raw payloads ===

    fn upsert_raw_message(&self, raw: RawMessage) -> Result<()>;

    fn get_raw_message(&self, owner: &str, id: &MessageId) -> Result<Option<RawMessage>>;

    /// Raw payloads of a thread, oldest first
    fn list_raw_messages_for_thread(
        &self,
        owner: &str,
        thread_id: &ThreadId,
    ) -> Result<Vec<RawMessage>>;

    // === Attachments ===

    /// Insert unless a record for (owner, id) exists. Returns true if inserted.
    fn insert_attachment_if_absent(&self, attachment: Attachment) -> Result<bool>;

    fn has_attachment(&self, owner: &str, id: &str) -> Result<bool>;

    fn get_attachment(&self, owner: &str, id: &str) -> Result<Option<Attachment>>;

    fn list_attachments_for_message(
        &self,
        owner: &str,
        message_id: &MessageId,
    ) -> Result<Vec<Attachment>>;

    // === Labels ===

    /// Insert or update a label with full details
    fn upsert_label(&self, label: Label) -> Result<()>;

    /// Insert a label only if it is unknown. Returns true if inserted.
    fn ensure_label(&self, label: Label) -> Result<bool>;

    fn list_labels(&self, owner: &str) -> Result<Vec<Label>>;

    // === Contacts ===

    fn upsert_contact(&self, contact: Contact) -> Result<()>;

    fn list_contacts(&self, owner: &str) -> Result<Vec<Contact>>;

    // === Sync runs ===

    /// Store a new run and return its assigned ID
    fn create_sync_run(&self, run: &SyncRun) -> Result<SyncRunId>;

    /// Overwrite an existing run
    fn save_sync_run(&self, run: &SyncRun) -> Result<()>;

    fn get_sync_run(&self, id: SyncRunId) -> Result<Option<SyncRun>>;

    /// Runs of an owner, newest first
    fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>>;

    /// Pending and running runs, across all owners
    fn list_resumable_runs(&self) -> Result<Vec<SyncRun>>;

    /// Finished user-originated daily runs, across all owners
    fn list_daily_user_runs(&self) -> Result<Vec<SyncRun>>;

    /// The most recently created run scheduled from `parent`
    fn latest_scheduled_run(&self, parent: SyncRunId) -> Result<Option<SyncRun>>;

    // === Stats ===

    fn stats(&self, owner: &str) -> Result<ArchiveStats>;
}
