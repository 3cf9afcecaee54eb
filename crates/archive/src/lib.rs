//! Archive crate - Mailbox archiving for Gmail
//!
//! This crate provides:
//! - Domain models (Thread, Message, RawMessage, Attachment, Label, Contact, SyncRun)
//! - Gmail and People API clients with OAuth token refresh
//! - Storage traits with SQLite, file blob and in-memory implementations
//! - A resumable, concurrent sync engine and its background scheduler
//! - Query functions and the `ArchiveService` container used by front ends

pub mod config;
pub mod error;
pub mod gmail;
pub mod models;
pub mod query;
pub mod service;
pub mod storage;
pub mod sync;

pub use config::{ArchiveSettings, GmailCredentials};
pub use error::{RemoteError, SyncError};
pub use gmail::{ClientProvider, ContactRemote, InMemoryMailbox, LabelRemote, MailRemote, StoredToken};
pub use models::{
    Attachment, AttachmentData, Contact, Label, Message, MessageId, RawMessage, RunKind,
    RunOrigin, RunStatus, StorageMode, SyncRun, SyncRunId, SyncTarget, Thread, ThreadId,
};
pub use query::{AttachmentSummary, ThreadDetail, ThreadSummary};
pub use service::{ArchiveService, SyncRequest};
pub use storage::{
    ArchiveStats, ArchiveStore, BlobStore, FileBlobStore, InMemoryArchiveStore,
    InMemoryBlobStore, SqliteArchiveStore, ThreadSearch,
};
pub use sync::{CancelToken, RunExecutor, SchedulerHandle, SyncEngine, SyncScheduler, TickReport};
