//! In-memory storage implementations
//!
//! Used by tests and by the engine's own unit tests. Every write takes a
//! single write lock, so upserts are atomic per natural key.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{Result, anyhow};

use super::blob::{BlobKey, BlobStore};
use super::traits::{ArchiveStats, ArchiveStore, ThreadSearch};
use crate::models::{
    Attachment, Contact, Label, Message, MessageId, RawMessage, RunKind, RunOrigin, RunStatus,
    StorageMode, SyncRun, SyncRunId, Thread, ThreadId,
};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write()
        .map_err(|_| anyhow!("in-memory store lock poisoned"))
}

type OwnerKey = (String, String);
type MessageKey = (String, String, String);

fn key(owner: &str, id: &str) -> OwnerKey {
    (owner.to_string(), id.to_string())
}

/// In-memory implementation of [`ArchiveStore`]
#[derive(Default)]
pub struct InMemoryArchiveStore {
    threads: RwLock<HashMap<OwnerKey, Thread>>,
    messages: RwLock<HashMap<MessageKey, Message>>,
    raw_messages: RwLock<HashMap<MessageKey, RawMessage>>,
    attachments: RwLock<HashMap<OwnerKey, Attachment>>,
    labels: RwLock<HashMap<OwnerKey, Label>>,
    contacts: RwLock<HashMap<OwnerKey, Contact>>,
    runs: RwLock<RunTable>,
}

#[derive(Default)]
struct RunTable {
    next_id: SyncRunId,
    runs: HashMap<SyncRunId, SyncRun>,
}

impl InMemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sorted_threads(&self, owner: &str, filter: impl Fn(&Thread) -> bool) -> Result<Vec<Thread>> {
        let threads = read(&self.threads)?;
        let mut out: Vec<Thread> = threads
            .values()
            .filter(|t| t.owner == owner && filter(t))
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(out)
    }

    fn runs_where(&self, filter: impl Fn(&SyncRun) -> bool) -> Result<Vec<SyncRun>> {
        let table = read(&self.runs)?;
        let mut out: Vec<SyncRun> = table.runs.values().filter(|r| filter(r)).cloned().collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }
}

fn page<T>(items: Vec<T>, limit: usize, offset: usize) -> Vec<T> {
    items.into_iter().skip(offset).take(limit).collect()
}

impl ArchiveStore for InMemoryArchiveStore {
    fn upsert_thread(&self, thread: Thread) -> Result<()> {
        let mut threads = write(&self.threads)?;
        threads.insert(key(&thread.owner, thread.id.as_str()), thread);
        Ok(())
    }

    fn get_thread(&self, owner: &str, id: &ThreadId) -> Result<Option<Thread>> {
        Ok(read(&self.threads)?.get(&key(owner, id.as_str())).cloned())
    }

    fn list_threads(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<Thread>> {
        Ok(page(self.sorted_threads(owner, |_| true)?, limit, offset))
    }

    fn list_threads_by_label(
        &self,
        owner: &str,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>> {
        let threads = self.sorted_threads(owner, |t| t.label_ids.iter().any(|l| l == label))?;
        Ok(page(threads, limit, offset))
    }

    fn search_threads(
        &self,
        owner: &str,
        search: &ThreadSearch,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>> {
        let terms = search.terms();
        let messages = read(&self.messages)?;
        let threads = self.sorted_threads(owner, |thread| {
            messages.values().any(|m| {
                m.owner == owner && m.thread_id == thread.id && terms.matches(thread, m)
            })
        })?;
        Ok(page(threads, limit, offset))
    }

    fn upsert_message(&self, message: Message) -> Result<()> {
        let mut messages = write(&self.messages)?;
        messages.insert(
            (
                message.owner.clone(),
                message.id.0.clone(),
                message.thread_id.0.clone(),
            ),
            message,
        );
        Ok(())
    }

    fn get_message(&self, owner: &str, id: &MessageId) -> Result<Option<Message>> {
        let messages = read(&self.messages)?;
        Ok(messages
            .values()
            .find(|m| m.owner == owner && &m.id == id)
            .cloned())
    }

    fn list_messages_for_thread(&self, owner: &str, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let messages = read(&self.messages)?;
        let mut out: Vec<Message> = messages
            .values()
            .filter(|m| m.owner == owner && &m.thread_id == thread_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.internal_date.cmp(&a.internal_date));
        Ok(out)
    }

    fn upsert_raw_message(&self, raw: RawMessage) -> Result<()> {
        let mut raw_messages = write(&self.raw_messages)?;
        raw_messages.insert(
            (raw.owner.clone(), raw.id.0.clone(), raw.thread_id.0.clone()),
            raw,
        );
        Ok(())
    }

    fn get_raw_message(&self, owner: &str, id: &MessageId) -> Result<Option<RawMessage>> {
        let raw_messages = read(&self.raw_messages)?;
        Ok(raw_messages
            .values()
            .find(|r| r.owner == owner && &r.id == id)
            .cloned())
    }

    fn list_raw_messages_for_thread(
        &self,
        owner: &str,
        thread_id: &ThreadId,
    ) -> Result<Vec<RawMessage>> {
        let raw_messages = read(&self.raw_messages)?;
        let mut out: Vec<RawMessage> = raw_messages
            .values()
            .filter(|r| r.owner == owner && &r.thread_id == thread_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.internal_date);
        Ok(out)
    }

    fn insert_attachment_if_absent(&self, attachment: Attachment) -> Result<bool> {
        let mut attachments = write(&self.attachments)?;
        let k = key(&attachment.owner, &attachment.id);
        if attachments.contains_key(&k) {
            return Ok(false);
        }
        attachments.insert(k, attachment);
        Ok(true)
    }

    fn has_attachment(&self, owner: &str, id: &str) -> Result<bool> {
        Ok(read(&self.attachments)?.contains_key(&key(owner, id)))
    }

    fn get_attachment(&self, owner: &str, id: &str) -> Result<Option<Attachment>> {
        Ok(read(&self.attachments)?.get(&key(owner, id)).cloned())
    }

    fn list_attachments_for_message(
        &self,
        owner: &str,
        message_id: &MessageId,
    ) -> Result<Vec<Attachment>> {
        let attachments = read(&self.attachments)?;
        let mut out: Vec<Attachment> = attachments
            .values()
            .filter(|a| a.owner == owner && &a.message_id == message_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.part_id.cmp(&b.part_id));
        Ok(out)
    }

    fn upsert_label(&self, label: Label) -> Result<()> {
        let mut labels = write(&self.labels)?;
        labels.insert(key(&label.owner, label.id.as_str()), label);
        Ok(())
    }

    fn ensure_label(&self, label: Label) -> Result<bool> {
        let mut labels = write(&self.labels)?;
        let k = key(&label.owner, label.id.as_str());
        if labels.contains_key(&k) {
            return Ok(false);
        }
        labels.insert(k, label);
        Ok(true)
    }

    fn list_labels(&self, owner: &str) -> Result<Vec<Label>> {
        let labels = read(&self.labels)?;
        let mut out: Vec<Label> = labels.values().filter(|l| l.owner == owner).cloned().collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn upsert_contact(&self, contact: Contact) -> Result<()> {
        let mut contacts = write(&self.contacts)?;
        contacts.insert(key(&contact.owner, &contact.resource_name), contact);
        Ok(())
    }

    fn list_contacts(&self, owner: &str) -> Result<Vec<Contact>> {
        let contacts = read(&self.contacts)?;
        let mut out: Vec<Contact> = contacts
            .values()
            .filter(|c| c.owner == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            (&a.last_name, &a.first_name, &a.resource_name).cmp(&(
                &b.last_name,
                &b.first_name,
                &b.resource_name,
            ))
        });
        Ok(out)
    }

    fn create_sync_run(&self, run: &SyncRun) -> Result<SyncRunId> {
        let mut table = write(&self.runs)?;
        table.next_id += 1;
        let id = table.next_id;
        let mut stored = run.clone();
        stored.id = id;
        table.runs.insert(id, stored);
        Ok(id)
    }

    fn save_sync_run(&self, run: &SyncRun) -> Result<()> {
        let mut table = write(&self.runs)?;
        match table.runs.get_mut(&run.id) {
            Some(existing) => {
                *existing = run.clone();
                Ok(())
            }
            None => Err(anyhow!("sync run {} does not exist", run.id)),
        }
    }

    fn get_sync_run(&self, id: SyncRunId) -> Result<Option<SyncRun>> {
        Ok(read(&self.runs)?.runs.get(&id).cloned())
    }

    fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>> {
        let mut runs = self.runs_where(|r| r.owner == owner)?;
        runs.reverse();
        Ok(runs)
    }

    fn list_resumable_runs(&self) -> Result<Vec<SyncRun>> {
        self.runs_where(SyncRun::is_resumable)
    }

    fn list_daily_user_runs(&self) -> Result<Vec<SyncRun>> {
        self.runs_where(|r| {
            r.origin == RunOrigin::User && r.kind == RunKind::Daily && r.status == RunStatus::Done
        })
    }

    fn latest_scheduled_run(&self, parent: SyncRunId) -> Result<Option<SyncRun>> {
        let runs = self.runs_where(|r| r.kind.parent() == Some(parent))?;
        Ok(runs.into_iter().last())
    }

    fn stats(&self, owner: &str) -> Result<ArchiveStats> {
        let attachments = read(&self.attachments)?;
        let owned: Vec<&Attachment> = attachments.values().filter(|a| a.owner == owner).collect();
        Ok(ArchiveStats {
            threads: read(&self.threads)?.values().filter(|t| t.owner == owner).count() as u64,
            messages: read(&self.messages)?.values().filter(|m| m.owner == owner).count() as u64,
            attachments: owned.len() as u64,
            blob_attachments: owned
                .iter()
                .filter(|a| a.storage_mode() == StorageMode::Blob)
                .count() as u64,
            labels: read(&self.labels)?.values().filter(|l| l.owner == owner).count() as u64,
            contacts: read(&self.contacts)?.values().filter(|c| c.owner == owner).count() as u64,
        })
    }
}

/// In-memory implementation of [`BlobStore`]
#[derive(Default)]
pub struct InMemoryBlobStore {
    chunks: RwLock<HashMap<(BlobKey, u32), Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of chunks currently stored, across all blobs
    pub fn chunk_count(&self) -> usize {
        self.chunks.read().map(|c| c.len()).unwrap_or(0)
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put_chunk(&self, key: &BlobKey, index: u32, data: &[u8]) -> Result<()> {
        write(&self.chunks)?.insert((key.clone(), index), data.to_vec());
        Ok(())
    }

    fn get_chunk(&self, key: &BlobKey, index: u32) -> Result<Option<Vec<u8>>> {
        Ok(read(&self.chunks)?.get(&(key.clone(), index)).cloned())
    }

    fn delete(&self, key: &BlobKey) -> Result<()> {
        write(&self.chunks)?.retain(|(k, _), _| k != key);
        Ok(())
    }
}
