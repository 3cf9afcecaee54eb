//! Thread model: the archived view of a Gmail conversation

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::message::{DateParts, Message, datetime_from_millis};

/// Unique identifier for a thread (Gmail thread ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for ThreadId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A conversation with header fields denormalized from one of its messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub owner: String,
    pub id: ThreadId,
    pub history_id: u64,
    pub snippet: String,
    pub subject: String,
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Internal date of the message the header fields were copied from
    pub internal_date: i64,
    pub date_parts: DateParts,
    pub message_count: usize,
    pub attachment_count: usize,
    pub first_message_at: DateTime<Utc>,
    pub last_message_at: DateTime<Utc>,
    /// Union of the labels of every message
    pub label_ids: Vec<String>,
}

impl Thread {
    /// Build the thread aggregate from its decoded messages.
    ///
    /// Header fields come from the message whose history ID equals the
    /// thread's; when none matches, the newest message is used instead.
    /// Returns `None` for a thread without messages.
    pub fn aggregate(
        owner: &str,
        id: &ThreadId,
        history_id: u64,
        snippet: &str,
        messages: &[Message],
    ) -> Option<Thread> {
        let newest = messages.iter().max_by_key(|m| m.internal_date)?;
        let source = messages
            .iter()
            .find(|m| m.history_id == history_id)
            .unwrap_or(newest);

        let first = messages.iter().map(|m| m.internal_date).min()?;
        let last = newest.internal_date;

        let label_ids: BTreeSet<&String> = messages.iter().flat_map(|m| &m.label_ids).collect();

        let snippet = if snippet.is_empty() {
            source.snippet.clone()
        } else {
            snippet.to_string()
        };

        Some(Thread {
            owner: owner.to_string(),
            id: id.clone(),
            history_id,
            snippet,
            subject: source.subject.clone(),
            from: source.from.clone(),
            to: source.to.clone(),
            cc: source.cc.clone(),
            bcc: source.bcc.clone(),
            internal_date: source.internal_date,
            date_parts: source.date_parts.clone(),
            message_count: messages.len(),
            attachment_count: messages.iter().map(|m| m.attachments.len()).sum(),
            first_message_at: datetime_from_millis(first),
            last_message_at: datetime_from_millis(last),
            label_ids: label_ids.into_iter().cloned().collect(),
        })
    }
}
