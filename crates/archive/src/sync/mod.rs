//! Sync engine for archiving a remote mailbox
//!
//! Runs are resumable: the cursor of a run only moves once everything its
//! page produced has been written, so an interrupted run continues from the
//! last checkpoint without re-archiving earlier pages.

mod attachments;
mod cancel;
mod engine;
mod executor;
mod lister;
mod scheduler;
mod thread_syncer;

pub use attachments::{AttachmentPersister, PersistOutcome};
pub use cancel::CancelToken;
pub use engine::SyncEngine;
pub use executor::RunExecutor;
pub use lister::{ContactLister, LabelLister, Page, ThreadLister, with_retry};
pub use scheduler::{RunLauncher, SchedulerHandle, SyncScheduler, TickReport};
pub use thread_syncer::{PageOutcome, SyncedThread, ThreadSyncer};
