//! ArchiveService: the dependency container behind the CLI
//!
//! Built once at startup from settings and credentials, it owns the store,
//! blob store, client provider and run executor, and exposes the read and
//! sync operations front ends need.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use crate::config::{ArchiveSettings, GmailCredentials};
use crate::gmail::{
    ClientProvider, FileTokenStore, GmailClientProvider, GoogleTokenEndpoint, MessageDecoder,
    TokenRefresher, decode_base64,
};
use crate::models::{
    AttachmentData, Contact, Label, Message, RunKind, RunOrigin, SyncRun, SyncRunId, SyncTarget,
    Thread, ThreadId,
};
use crate::query::{self, ThreadDetail, ThreadSummary};
use crate::storage::{
    ArchiveStats, ArchiveStore, BlobStore, FileBlobStore, SqliteArchiveStore, ThreadSearch,
};
use crate::sync::{RunExecutor, SyncEngine, SyncScheduler};

/// Database filename inside the data directory
const DATABASE_FILE: &str = "archive.db";
/// Blob directory inside the data directory
const BLOB_DIR: &str = "blobs";

/// Parameters of a user-requested sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub owner: String,
    /// Gmail search query; empty archives everything
    pub query: String,
    pub target: SyncTarget,
    pub kind: RunKind,
    pub delete_after_archive: bool,
}

impl SyncRequest {
    /// A manual mail sync of everything matching `query`
    pub fn mail(owner: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            query: query.into(),
            target: SyncTarget::Mail,
            kind: RunKind::Manual,
            delete_after_archive: false,
        }
    }

    pub fn labels(owner: impl Into<String>) -> Self {
        Self {
            target: SyncTarget::Labels,
            ..Self::mail(owner, "")
        }
    }

    pub fn contacts(owner: impl Into<String>) -> Self {
        Self {
            target: SyncTarget::Contacts,
            ..Self::mail(owner, "")
        }
    }

    /// Seed the daily incremental schedule once this run finishes
    pub fn daily(mut self) -> Self {
        self.kind = RunKind::Daily;
        self
    }

    pub fn delete_after_archive(mut self, delete: bool) -> Self {
        self.delete_after_archive = delete;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.owner.trim().is_empty() {
            bail!("Sync owner must not be empty");
        }
        if let RunKind::Scheduled { .. } = self.kind {
            bail!("Scheduled runs are created by the scheduler");
        }
        if self.target != SyncTarget::Mail {
            if self.kind == RunKind::Daily {
                bail!("Daily runs are only supported for mail");
            }
            if self.delete_after_archive {
                bail!("Delete-after-archive is only supported for mail");
            }
        }
        Ok(())
    }

    fn into_run(self) -> SyncRun {
        SyncRun::new(
            self.owner,
            self.query,
            RunOrigin::User,
            self.target,
            self.kind,
        )
        .with_delete_after_archive(self.delete_after_archive)
    }
}

pub struct ArchiveService {
    store: Arc<dyn ArchiveStore>,
    blobs: Arc<dyn BlobStore>,
    executor: RunExecutor,
    settings: ArchiveSettings,
}

impl ArchiveService {
    /// SQLite store and file blobs in the data directory, Gmail clients
    /// authorized from the token files in the config directory
    pub fn open(settings: ArchiveSettings, credentials: GmailCredentials) -> Result<Self> {
        let data_dir = settings.data_dir()?;
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
        log::info!("[ARCHIVE] Opening archive in {:?}", data_dir);

        let store = SqliteArchiveStore::new(data_dir.join(DATABASE_FILE))?;
        let blobs = FileBlobStore::new(data_dir.join(BLOB_DIR))?;

        let tokens = FileTokenStore::default_location()?;
        let endpoint = GoogleTokenEndpoint::new(credentials, settings.http_timeout());
        let refresher = TokenRefresher::new(
            Arc::new(tokens),
            Arc::new(endpoint),
            settings.token_refresh_window(),
        );
        let clients =
            GmailClientProvider::new(refresher, settings.http_timeout(), settings.page_size);

        Self::with_components(
            Arc::new(store),
            Arc::new(blobs),
            Arc::new(clients),
            settings,
        )
    }

    pub fn with_components(
        store: Arc<dyn ArchiveStore>,
        blobs: Arc<dyn BlobStore>,
        clients: Arc<dyn ClientProvider>,
        settings: ArchiveSettings,
    ) -> Result<Self> {
        let engine = SyncEngine::new(store.clone(), blobs.clone(), clients, settings.clone())?;
        Ok(Self {
            store,
            blobs,
            executor: RunExecutor::new(Arc::new(engine)),
            settings,
        })
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// Create a run for `request` and start it in the background
    pub fn trigger_sync(&self, request: SyncRequest) -> Result<SyncRunId> {
        let id = self.create_run(request)?;
        self.executor.launch(id)?;
        Ok(id)
    }

    /// Create a run for `request` and execute it on the calling thread
    pub fn run_sync_blocking(&self, request: SyncRequest) -> Result<SyncRun> {
        let id = self.create_run(request)?;
        self.executor.run_blocking(id)
    }

    fn create_run(&self, request: SyncRequest) -> Result<SyncRunId> {
        request.validate()?;
        let run = request.into_run();
        let id = self.store.create_sync_run(&run)?;
        log::info!(
            "[ARCHIVE] Created {} {} run {} for {}",
            run.kind.as_str(),
            run.target.as_str(),
            id,
            run.owner
        );
        Ok(id)
    }

    /// Start a new run continuing from a failed run's last checkpoint
    pub fn retry_sync(&self, failed: SyncRunId) -> Result<SyncRunId> {
        let run = self
            .store
            .get_sync_run(failed)?
            .with_context(|| format!("Sync run {} not found", failed))?;
        let retry = SyncRun::retry_of(&run)?;
        let id = self.store.create_sync_run(&retry)?;
        log::info!(
            "[ARCHIVE] Retrying run {} as {} from cursor {:?}",
            failed,
            id,
            retry.next_cursor
        );
        self.executor.launch(id)?;
        Ok(id)
    }

    /// Resume an interrupted run on the calling thread
    pub fn resume_sync_blocking(&self, id: SyncRunId) -> Result<SyncRun> {
        self.executor.run_blocking(id)
    }

    pub fn cancel_sync(&self, id: SyncRunId) -> bool {
        self.executor.cancel(id)
    }

    pub fn cancel_all(&self) {
        self.executor.cancel_all();
    }

    /// Block until no run is executing; `false` on timeout
    pub fn wait_for_idle(&self, timeout: Duration) -> bool {
        self.executor.wait_for_idle(timeout)
    }

    /// Runs of `owner`, newest first
    pub fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>> {
        self.store.list_sync_runs(owner)
    }

    pub fn get_sync_run(&self, id: SyncRunId) -> Result<Option<SyncRun>> {
        self.store.get_sync_run(id)
    }

    /// Scheduler wired to this service's store and executor
    pub fn scheduler(&self) -> SyncScheduler {
        SyncScheduler::new(
            self.store.clone(),
            Arc::new(self.executor.clone()),
            self.settings.schedule_interval(),
        )
    }

    // ========================================================================
    // Reads
    // ========================================================================

    pub fn get_thread(&self, owner: &str, thread_id: &str) -> Result<Option<ThreadDetail>> {
        query::get_thread_detail(self.store.as_ref(), owner, &ThreadId::new(thread_id))
    }

    /// Messages of a thread, oldest first
    pub fn get_messages(&self, owner: &str, thread_id: &str) -> Result<Vec<Message>> {
        let mut messages = self
            .store
            .list_messages_for_thread(owner, &ThreadId::new(thread_id))?;
        messages.sort_by_key(|m| m.internal_date);
        Ok(messages)
    }

    /// Decoded bytes of an archived attachment, from either storage tier
    pub fn get_attachment_bytes(&self, owner: &str, attachment_id: &str) -> Result<Option<Vec<u8>>> {
        let Some(attachment) = self.store.get_attachment(owner, attachment_id)? else {
            return Ok(None);
        };

        let bytes = match &attachment.data {
            AttachmentData::Inline { data } => decode_base64(data)
                .with_context(|| format!("Attachment {} has corrupt inline data", attachment_id))?,
            AttachmentData::Blob { blob } => self
                .blobs
                .get(blob)?
                .with_context(|| format!("Blob for attachment {} is missing", attachment_id))?,
        };
        Ok(Some(bytes))
    }

    pub fn list_threads(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<ThreadSummary>> {
        query::list_threads(self.store.as_ref(), owner, limit, offset)
    }

    pub fn list_threads_by_label(
        &self,
        owner: &str,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ThreadSummary>> {
        query::list_threads_by_label(self.store.as_ref(), owner, label, limit, offset)
    }

    pub fn search_threads(
        &self,
        owner: &str,
        search: &ThreadSearch,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ThreadSummary>> {
        query::search_threads(self.store.as_ref(), owner, search, limit, offset)
    }

    pub fn list_labels(&self, owner: &str) -> Result<Vec<Label>> {
        self.store.list_labels(owner)
    }

    pub fn list_contacts(&self, owner: &str) -> Result<Vec<Contact>> {
        self.store.list_contacts(owner)
    }

    pub fn stats(&self, owner: &str) -> Result<ArchiveStats> {
        self.store.stats(owner)
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    /// Rebuild a thread's messages from their raw payloads without fetching
    ///
    /// Returns the rebuilt thread, or `None` if nothing raw is archived for it.
    pub fn redecode_thread(&self, owner: &str, thread_id: &str) -> Result<Option<Thread>> {
        let thread_id = ThreadId::new(thread_id);
        let raws = self.store.list_raw_messages_for_thread(owner, &thread_id)?;
        if raws.is_empty() {
            return Ok(None);
        }

        let existing = self.store.get_thread(owner, &thread_id)?;
        let messages: Vec<Message> = raws.iter().map(MessageDecoder::decode).collect();
        for message in &messages {
            self.store.upsert_message(message.clone())?;
        }

        let (history_id, snippet) = match &existing {
            Some(thread) => (thread.history_id, thread.snippet.as_str()),
            None => (
                messages.iter().map(|m| m.history_id).max().unwrap_or_default(),
                "",
            ),
        };
        let thread = Thread::aggregate(owner, &thread_id, history_id, snippet, &messages)
            .context("Raw messages produced an empty thread")?;
        self.store.upsert_thread(thread.clone())?;

        log::info!(
            "[ARCHIVE] Re-decoded {} messages of thread {}",
            messages.len(),
            thread_id
        );
        Ok(Some(thread))
    }
}
