//! Thread query functions

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Attachment, Message, MessageId, StorageMode, Thread, ThreadId};
use crate::storage::{ArchiveStore, ThreadSearch};

/// Summary information for listing a thread
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    pub id: ThreadId,
    pub subject: String,
    pub snippet: String,
    /// Addresses of the thread's header message sender
    pub from: Vec<String>,
    pub last_message_at: DateTime<Utc>,
    pub message_count: usize,
    pub attachment_count: usize,
    pub label_ids: Vec<String>,
}

impl From<Thread> for ThreadSummary {
    fn from(thread: Thread) -> Self {
        Self {
            id: thread.id,
            subject: thread.subject,
            snippet: thread.snippet,
            from: thread.from,
            last_message_at: thread.last_message_at,
            message_count: thread.message_count,
            attachment_count: thread.attachment_count,
            label_ids: thread.label_ids,
        }
    }
}

/// Attachment metadata without its bytes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub id: String,
    pub message_id: MessageId,
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
    pub storage_mode: StorageMode,
}

impl From<Attachment> for AttachmentSummary {
    fn from(attachment: Attachment) -> Self {
        let storage_mode = attachment.storage_mode();
        Self {
            id: attachment.id,
            message_id: attachment.message_id,
            filename: attachment.filename,
            mime_type: attachment.mime_type,
            size: attachment.size,
            storage_mode,
        }
    }
}

/// Detailed thread information including all messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadDetail {
    pub thread: Thread,
    /// Oldest first
    pub messages: Vec<Message>,
    /// Archived attachments of every message, in message order
    pub attachments: Vec<AttachmentSummary>,
}

/// List an owner's threads, newest first
pub fn list_threads(
    store: &dyn ArchiveStore,
    owner: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<ThreadSummary>> {
    let threads = store.list_threads(owner, limit, offset)?;
    Ok(threads.into_iter().map(ThreadSummary::from).collect())
}

/// List threads carrying `label` on at least one message, newest first
pub fn list_threads_by_label(
    store: &dyn ArchiveStore,
    owner: &str,
    label: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<ThreadSummary>> {
    let threads = store.list_threads_by_label(owner, label, limit, offset)?;
    Ok(threads.into_iter().map(ThreadSummary::from).collect())
}

/// Case-insensitive substring search; an empty search lists every thread
pub fn search_threads(
    store: &dyn ArchiveStore,
    owner: &str,
    search: &ThreadSearch,
    limit: usize,
    offset: usize,
) -> Result<Vec<ThreadSummary>> {
    let threads = if search.is_empty() {
        store.list_threads(owner, limit, offset)?
    } else {
        store.search_threads(owner, search, limit, offset)?
    };
    Ok(threads.into_iter().map(ThreadSummary::from).collect())
}

/// Get a thread with its messages and attachment metadata
pub fn get_thread_detail(
    store: &dyn ArchiveStore,
    owner: &str,
    thread_id: &ThreadId,
) -> Result<Option<ThreadDetail>> {
    let thread = match store.get_thread(owner, thread_id)? {
        Some(t) => t,
        None => return Ok(None),
    };

    let mut messages = store.list_messages_for_thread(owner, thread_id)?;
    messages.sort_by_key(|m| m.internal_date);

    let mut attachments = Vec::new();
    for message in &messages {
        let stored = store.list_attachments_for_message(owner, &message.id)?;
        attachments.extend(stored.into_iter().map(AttachmentSummary::from));
    }

    Ok(Some(ThreadDetail {
        thread,
        messages,
        attachments,
    }))
}
