//! Executes one sync run end to end
//!
//! Mail runs loop over listing pages. Each page is archived on the worker
//! pool, optionally deleted remotely, and only then checkpointed: the run's
//! cursor is saved after everything the page produced is durable.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use rayon::{ThreadPool, ThreadPoolBuilder};

use super::cancel::CancelToken;
use super::lister::{ContactLister, LabelLister, ThreadLister, with_retry};
use super::thread_syncer::ThreadSyncer;
use crate::config::ArchiveSettings;
use crate::error::SyncError;
use crate::gmail::{ClientProvider, MailRemote, normalize_contact, normalize_label};
use crate::models::{
    ItemFailure, MessageId, PageProgress, SyncRun, SyncRunId, SyncTarget, TransitionError,
};
use crate::storage::{ArchiveStore, BlobStore};

fn client_error(err: anyhow::Error) -> SyncError {
    SyncError::Transient(format!("could not create remote client: {:#}", err))
}

fn checkpoint_error(err: TransitionError) -> SyncError {
    SyncError::Fatal(err.to_string())
}

pub struct SyncEngine {
    store: Arc<dyn ArchiveStore>,
    blobs: Arc<dyn BlobStore>,
    clients: Arc<dyn ClientProvider>,
    settings: ArchiveSettings,
    pool: ThreadPool,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn ArchiveStore>,
        blobs: Arc<dyn BlobStore>,
        clients: Arc<dyn ClientProvider>,
        settings: ArchiveSettings,
    ) -> Result<Self> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(settings.worker_threads.max(1))
            .thread_name(|i| format!("sync-worker-{}", i))
            .build()
            .context("Failed to build sync worker pool")?;

        Ok(Self {
            store,
            blobs,
            clients,
            settings,
            pool,
        })
    }

    /// Run `run_id` until it finishes, fails or is cancelled
    ///
    /// A cancelled run is left `running` at its last checkpoint so the
    /// scheduler can resume it. `Err` is only returned when the run itself
    /// could not be loaded or saved.
    pub fn execute(&self, run_id: SyncRunId, cancel: &CancelToken) -> Result<SyncRun> {
        let mut run = self
            .store
            .get_sync_run(run_id)?
            .with_context(|| format!("Sync run {} not found", run_id))?;

        run.start()?;
        self.store.save_sync_run(&run)?;
        log::info!(
            "[SYNC] Run {} started: owner={} target={} query={:?} resume_from={:?}",
            run.id,
            run.owner,
            run.target.as_str(),
            run.query,
            run.next_cursor
        );

        let result = match run.target {
            SyncTarget::Mail => self.sync_mail(&mut run, cancel),
            SyncTarget::Labels => self.sync_labels(&mut run, cancel),
            SyncTarget::Contacts => self.sync_contacts(&mut run, cancel),
        };

        match result {
            Ok(()) => {
                run.complete()?;
                log::info!(
                    "[SYNC] Run {} done: {} pages, {} items, {} failures",
                    run.id,
                    run.pages_completed,
                    run.thread_count,
                    run.failures.len()
                );
            }
            Err(SyncError::Cancelled) => {
                log::info!(
                    "[SYNC] Run {} cancelled after {} pages",
                    run.id,
                    run.pages_completed
                );
                return Ok(run);
            }
            Err(err) => {
                log::error!("[SYNC] Run {} failed: {}", run.id, err);
                run.fail(err.to_string())?;
            }
        }

        self.store.save_sync_run(&run)?;
        Ok(run)
    }

    fn sync_mail(&self, run: &mut SyncRun, cancel: &CancelToken) -> Result<(), SyncError> {
        if run.next_cursor.is_none() && run.pages_completed > 0 {
            return Ok(());
        }

        let owner = run.owner.clone();
        let query = run.query.clone();
        let backoff = self.settings.rate_limit_backoff();
        let mut cursor = run.next_cursor.clone();

        loop {
            cancel.check()?;

            let remote = self.clients.mail(&owner).map_err(client_error)?;
            let page = ThreadLister::new(remote.as_ref(), &query, backoff).page(cursor.as_deref())?;
            log::debug!(
                "[SYNC] Run {} page {:?}: {} threads",
                run.id,
                cursor,
                page.items.len()
            );

            let syncer = ThreadSyncer::new(
                &owner,
                self.store.as_ref(),
                self.blobs.as_ref(),
                remote.as_ref(),
                &self.settings,
                cancel,
            );
            let outcome = syncer.sync_page(&self.pool, &page.items)?;

            let delete_failures = if run.delete_after_archive {
                let ids: Vec<MessageId> = outcome.deletable_message_ids().cloned().collect();
                self.delete_remote(remote.as_ref(), &ids)
            } else {
                Vec::new()
            };

            let mut progress: PageProgress = outcome.into_progress();
            progress.failures.extend(delete_failures);

            run.record_page(cursor.clone(), page.next_cursor.clone(), progress)
                .map_err(checkpoint_error)?;
            self.store
                .save_sync_run(run)
                .map_err(SyncError::persistence)?;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }

    /// Delete archived messages remotely; failures are returned, not raised
    fn delete_remote(&self, remote: &dyn MailRemote, ids: &[MessageId]) -> Vec<ItemFailure> {
        let backoff = self.settings.rate_limit_backoff();
        let mut failures = Vec::new();
        for id in ids {
            if let Err(err) = with_retry(backoff, "message delete", || {
                remote.delete_message(id.as_str())
            }) {
                log::warn!("[SYNC] Could not delete message {}: {}", id, err);
                failures.push(ItemFailure {
                    item: format!("delete:{}", id),
                    error: err.to_string(),
                    at: Utc::now(),
                });
            }
        }
        if !ids.is_empty() {
            log::info!(
                "[SYNC] Deleted {} of {} archived messages",
                ids.len() - failures.len(),
                ids.len()
            );
        }
        failures
    }

    fn sync_labels(&self, run: &mut SyncRun, cancel: &CancelToken) -> Result<(), SyncError> {
        cancel.check()?;

        let remote = self.clients.labels(&run.owner).map_err(client_error)?;
        let labels = LabelLister::new(remote.as_ref(), self.settings.rate_limit_backoff()).list()?;

        let count = labels.len() as u64;
        for label in labels {
            self.store
                .upsert_label(normalize_label(&run.owner, label))
                .map_err(SyncError::persistence)?;
        }

        run.record_page(
            None,
            None,
            PageProgress {
                threads: count,
                ..Default::default()
            },
        )
        .map_err(checkpoint_error)?;
        Ok(())
    }

    fn sync_contacts(&self, run: &mut SyncRun, cancel: &CancelToken) -> Result<(), SyncError> {
        if run.next_cursor.is_none() && run.pages_completed > 0 {
            return Ok(());
        }

        let owner = run.owner.clone();
        let backoff = self.settings.rate_limit_backoff();
        let mut cursor = run.next_cursor.clone();

        loop {
            cancel.check()?;

            let remote = self.clients.contacts(&owner).map_err(client_error)?;
            let page = ContactLister::new(remote.as_ref(), backoff).page(cursor.as_deref())?;

            let count = page.items.len() as u64;
            for person in page.items {
                self.store
                    .upsert_contact(normalize_contact(&owner, person))
                    .map_err(SyncError::persistence)?;
            }

            run.record_page(
                cursor.clone(),
                page.next_cursor.clone(),
                PageProgress {
                    threads: count,
                    ..Default::default()
                },
            )
            .map_err(checkpoint_error)?;
            self.store
                .save_sync_run(run)
                .map_err(SyncError::persistence)?;

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::gmail::InMemoryMailbox;
    use crate::gmail::api::{GmailLabel, Person, PersonEmail};
    use crate::gmail::fixtures::{simple_message, thread_of};
    use crate::models::{RunKind, RunOrigin, RunStatus};
    use crate::storage::{InMemoryArchiveStore, InMemoryBlobStore};

    const OWNER: &str = "me@example.com";

    fn create_engine(mailbox: &InMemoryMailbox) -> (SyncEngine, Arc<InMemoryArchiveStore>) {
        let store = Arc::new(InMemoryArchiveStore::new());
        let settings = ArchiveSettings {
            worker_threads: 2,
            rate_limit_backoff_ms: 0,
            ..Default::default()
        };
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(InMemoryBlobStore::new()),
            Arc::new(mailbox.clone()),
            settings,
        )
        .unwrap();
        (engine, store)
    }

    fn mailbox_with_threads(count: usize, page_size: usize) -> InMemoryMailbox {
        let mailbox = InMemoryMailbox::new(page_size);
        for i in 0..count {
            let id = format!("t{}", i);
            mailbox.add_thread(thread_of(
                &id,
                vec![simple_message(
                    &format!("m{}", i),
                    &id,
                    1_704_067_200_000 + i as i64 * 86_400_000,
                    "subject",
                    "body",
                )],
            ));
        }
        mailbox
    }

    fn create_run(store: &InMemoryArchiveStore, target: SyncTarget, delete: bool) -> SyncRunId {
        let run = SyncRun::new(OWNER, "", RunOrigin::User, target, RunKind::Manual)
            .with_delete_after_archive(delete);
        store.create_sync_run(&run).unwrap()
    }

    #[test]
    fn test_mail_run_walks_every_page() {
        let mailbox = mailbox_with_threads(5, 2);
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Mail, false);

        let run = engine.execute(id, &CancelToken::new()).unwrap();

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.pages_completed, 3);
        assert_eq!(run.thread_count, 5);
        assert_eq!(run.page_cursor.as_deref(), Some("offset-4"));
        assert!(run.next_cursor.is_none());
        assert_eq!(store.stats(OWNER).unwrap().threads, 5);
        // One client per page
        assert_eq!(mailbox.clients_created(), 3);
        assert!(mailbox.deleted().is_empty());
    }

    #[test]
    fn test_malformed_listing_fails_run() {
        let mailbox = mailbox_with_threads(3, 2);
        mailbox.fail_listing(Some("offset-2"), vec![RemoteError::Fatal("garbage".into())]);
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Mail, false);

        let run = engine.execute(id, &CancelToken::new()).unwrap();

        assert_eq!(run.status, RunStatus::Error);
        assert_eq!(run.next_cursor.as_deref(), Some("offset-2"));
        assert!(run.last_error.unwrap().contains("garbage"));
        assert_eq!(store.get_sync_run(id).unwrap().unwrap().status, RunStatus::Error);
    }

    #[test]
    fn test_delete_after_archive() {
        let mailbox = mailbox_with_threads(3, 2);
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Mail, true);

        let run = engine.execute(id, &CancelToken::new()).unwrap();

        assert_eq!(run.status, RunStatus::Done);
        let mut deleted = mailbox.deleted();
        deleted.sort();
        assert_eq!(deleted, vec!["m0", "m1", "m2"]);
    }

    #[test]
    fn test_failed_thread_is_not_deleted() {
        let mailbox = mailbox_with_threads(2, 10);
        mailbox.fail_thread("t1", vec![RemoteError::Fatal("bad".into())]);
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Mail, true);

        let run = engine.execute(id, &CancelToken::new()).unwrap();

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.thread_count, 1);
        assert_eq!(run.failures.len(), 1);
        assert_eq!(run.failures[0].item, "thread:t1");
        assert_eq!(mailbox.deleted(), vec!["m0"]);
    }

    #[test]
    fn test_cancelled_run_stays_running() {
        let mailbox = mailbox_with_threads(3, 2);
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Mail, false);
        let cancel = CancelToken::new();
        cancel.cancel();

        let run = engine.execute(id, &cancel).unwrap();

        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.pages_completed, 0);
        assert!(mailbox.list_calls().is_empty());
    }

    #[test]
    fn test_label_run() {
        let mailbox = InMemoryMailbox::new(10);
        for (id, name) in [("INBOX", "INBOX"), ("Label_1", "Receipts")] {
            mailbox.add_label(GmailLabel {
                id: id.into(),
                name: name.into(),
                threads_total: Some(3),
                ..Default::default()
            });
        }
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Labels, false);

        let run = engine.execute(id, &CancelToken::new()).unwrap();

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.thread_count, 2);
        let labels = store.list_labels(OWNER).unwrap();
        assert_eq!(labels.len(), 2);
        assert!(labels.iter().all(|l| l.threads_total == 3));
    }

    #[test]
    fn test_contact_run_pages() {
        let mailbox = InMemoryMailbox::new(2);
        for i in 0..3 {
            mailbox.add_person(Person {
                resource_name: format!("people/c{}", i),
                email_addresses: vec![PersonEmail {
                    value: Some(format!("friend{}@example.com", i)),
                }],
                ..Default::default()
            });
        }
        let (engine, store) = create_engine(&mailbox);
        let id = create_run(&store, SyncTarget::Contacts, false);

        let run = engine.execute(id, &CancelToken::new()).unwrap();

        assert_eq!(run.status, RunStatus::Done);
        assert_eq!(run.pages_completed, 2);
        assert_eq!(store.list_contacts(OWNER).unwrap().len(), 3);
    }

    #[test]
    fn test_unknown_run() {
        let mailbox = InMemoryMailbox::new(2);
        let (engine, _store) = create_engine(&mailbox);
        assert!(engine.execute(42, &CancelToken::new()).is_err());
    }
}
