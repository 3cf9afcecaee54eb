//! Per-thread ingestion and the per-page barrier

use chrono::{NaiveDate, Utc};
use rayon::ThreadPool;
use rayon::prelude::*;

use super::attachments::AttachmentPersister;
use super::cancel::CancelToken;
use super::lister::with_retry;
use crate::config::ArchiveSettings;
use crate::error::SyncError;
use crate::gmail::api::ThreadRef;
use crate::gmail::{MailRemote, MessageDecoder, normalize_message};
use crate::models::{
    ItemFailure, Label, Message, MessageId, PageProgress, Thread, ThreadId, datetime_from_millis,
};
use crate::storage::{ArchiveStore, BlobStore};

/// Result of archiving one thread
#[derive(Debug, Clone)]
pub struct SyncedThread {
    pub thread_id: ThreadId,
    pub message_ids: Vec<MessageId>,
    pub newest_message_date: Option<NaiveDate>,
    pub oldest_message_date: Option<NaiveDate>,
    /// Attachments that could not be archived
    pub failures: Vec<ItemFailure>,
}

/// Result of one page once every thread task has finished
#[derive(Debug, Clone, Default)]
pub struct PageOutcome {
    pub threads: Vec<SyncedThread>,
    pub failures: Vec<ItemFailure>,
}

impl PageOutcome {
    /// Message ids of threads archived without any failure, in page order
    ///
    /// A thread with an unarchived attachment keeps all of its messages
    /// remotely so a later run can retry the attachment.
    pub fn deletable_message_ids(&self) -> impl Iterator<Item = &MessageId> {
        self.threads
            .iter()
            .filter(|t| t.failures.is_empty())
            .flat_map(|t| t.message_ids.iter())
    }

    pub fn into_progress(self) -> PageProgress {
        let newest = self.threads.iter().filter_map(|t| t.newest_message_date).max();
        let oldest = self.threads.iter().filter_map(|t| t.oldest_message_date).min();
        let threads = self.threads.len() as u64;
        let mut failures = self.failures;
        for thread in self.threads {
            failures.extend(thread.failures);
        }
        PageProgress {
            threads,
            newest_message_date: newest,
            oldest_message_date: oldest,
            failures,
        }
    }
}

fn failure(item: String, error: &SyncError) -> ItemFailure {
    ItemFailure {
        item,
        error: error.to_string(),
        at: Utc::now(),
    }
}

pub struct ThreadSyncer<'a> {
    owner: &'a str,
    store: &'a dyn ArchiveStore,
    blobs: &'a dyn BlobStore,
    remote: &'a dyn MailRemote,
    settings: &'a ArchiveSettings,
    cancel: &'a CancelToken,
}

impl<'a> ThreadSyncer<'a> {
    pub fn new(
        owner: &'a str,
        store: &'a dyn ArchiveStore,
        blobs: &'a dyn BlobStore,
        remote: &'a dyn MailRemote,
        settings: &'a ArchiveSettings,
        cancel: &'a CancelToken,
    ) -> Self {
        Self {
            owner,
            store,
            blobs,
            remote,
            settings,
            cancel,
        }
    }

    /// Fetch, decode and persist one thread
    ///
    /// Raw payloads, messages, attachments and placeholder labels are written
    /// before the thread aggregate, so a stored thread always has its messages.
    pub fn sync_thread(&self, summary: &ThreadRef) -> Result<SyncedThread, SyncError> {
        self.cancel.check()?;

        let backoff = self.settings.rate_limit_backoff();
        let detail = with_retry(backoff, "thread fetch", || self.remote.get_thread(&summary.id))?;

        let history_source = if detail.history_id.is_empty() {
            &summary.history_id
        } else {
            &detail.history_id
        };
        let history_id: u64 = if history_source.is_empty() {
            0
        } else {
            history_source.parse().map_err(|_| {
                SyncError::Fatal(format!(
                    "thread {} has invalid historyId {:?}",
                    summary.id, history_source
                ))
            })?
        };

        let persister = AttachmentPersister::new(self.store, self.blobs, self.remote)
            .with_limits(
                self.settings.inline_attachment_limit,
                self.settings.blob_chunk_size,
            )
            .with_backoff(backoff);

        let mut messages: Vec<Message> = Vec::with_capacity(detail.messages.len());
        let mut failures = Vec::new();

        for wire in &detail.messages {
            let raw = normalize_message(self.owner, wire)?;
            let message = MessageDecoder::decode(&raw);

            for reference in &message.attachments {
                match persister.persist(&message, reference) {
                    Ok(_) => {}
                    Err(err) if !err.aborts_page() => {
                        log::warn!(
                            "[SYNC] Attachment {} of message {} not archived: {}",
                            reference.attachment_id,
                            message.id,
                            err
                        );
                        failures.push(failure(
                            format!("attachment:{}", reference.attachment_id),
                            &err,
                        ));
                    }
                    Err(err) => return Err(err),
                }
            }

            self.store
                .upsert_raw_message(raw)
                .map_err(SyncError::persistence)?;

            for label in &message.label_ids {
                self.store
                    .ensure_label(Label::placeholder(self.owner, label))
                    .map_err(SyncError::persistence)?;
            }

            self.store
                .upsert_message(message.clone())
                .map_err(SyncError::persistence)?;
            messages.push(message);
        }

        let thread_id = ThreadId::new(&summary.id);
        let snippet = if detail.snippet.is_empty() {
            &summary.snippet
        } else {
            &detail.snippet
        };
        let thread = Thread::aggregate(self.owner, &thread_id, history_id, snippet, &messages)
            .ok_or_else(|| SyncError::Fatal(format!("thread {} has no messages", summary.id)))?;

        self.store
            .upsert_thread(thread)
            .map_err(SyncError::persistence)?;

        let date = |millis: i64| datetime_from_millis(millis).date_naive();
        Ok(SyncedThread {
            thread_id,
            message_ids: messages.iter().map(|m| m.id.clone()).collect(),
            newest_message_date: messages.iter().map(|m| m.internal_date).max().map(date),
            oldest_message_date: messages.iter().map(|m| m.internal_date).min().map(date),
            failures,
        })
    }

    /// Archive every thread of a page on the pool and wait for all of them
    ///
    /// A fatal thread error is recorded and its siblings continue. Any other
    /// error fails the page once all tasks have finished.
    pub fn sync_page(
        &self,
        pool: &ThreadPool,
        threads: &[ThreadRef],
    ) -> Result<PageOutcome, SyncError> {
        let results: Vec<(&ThreadRef, Result<SyncedThread, SyncError>)> = pool.install(|| {
            threads
                .par_iter()
                .map(|summary| (summary, self.sync_thread(summary)))
                .collect()
        });

        let mut outcome = PageOutcome::default();
        let mut abort = None;
        for (summary, result) in results {
            match result {
                Ok(synced) => outcome.threads.push(synced),
                Err(err) if err.aborts_page() => {
                    log::warn!("[SYNC] Thread {} aborted the page: {}", summary.id, err);
                    abort.get_or_insert(err);
                }
                Err(err) => {
                    log::warn!("[SYNC] Thread {} failed: {}", summary.id, err);
                    outcome.failures.push(failure(format!("thread:{}", summary.id), &err));
                }
            }
        }

        match abort {
            Some(err) => Err(err),
            None => Ok(outcome),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use crate::gmail::InMemoryMailbox;
    use crate::gmail::fixtures::{simple_message, thread_of, with_attachment};
    use crate::storage::{InMemoryArchiveStore, InMemoryBlobStore};

    const OWNER: &str = "me@example.com";

    struct Fixture {
        store: InMemoryArchiveStore,
        blobs: InMemoryBlobStore,
        mailbox: InMemoryMailbox,
        settings: ArchiveSettings,
        cancel: CancelToken,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                store: InMemoryArchiveStore::new(),
                blobs: InMemoryBlobStore::new(),
                mailbox: InMemoryMailbox::new(10),
                settings: ArchiveSettings {
                    rate_limit_backoff_ms: 0,
                    ..Default::default()
                },
                cancel: CancelToken::new(),
            }
        }

        fn syncer(&self) -> ThreadSyncer<'_> {
            ThreadSyncer::new(
                OWNER,
                &self.store,
                &self.blobs,
                &self.mailbox,
                &self.settings,
                &self.cancel,
            )
        }
    }

    fn summary(id: &str) -> ThreadRef {
        ThreadRef {
            id: id.to_string(),
            snippet: String::new(),
            history_id: "100".to_string(),
        }
    }

    #[test]
    fn test_thread_aggregate_uses_matching_history_id() {
        let fx = Fixture::new();
        let mut first = simple_message("m1", "t1", 1_704_000_000_000, "Original", "one");
        first.history_id = "100".to_string();
        let mut reply = simple_message("m2", "t1", 1_704_100_000_000, "Re: Original", "two");
        reply.history_id = "105".to_string();
        let mut thread = thread_of("t1", vec![first, reply]);
        thread.history_id = "100".to_string();
        fx.mailbox.add_thread(thread);

        let synced = fx.syncer().sync_thread(&summary("t1")).unwrap();
        assert_eq!(synced.message_ids.len(), 2);

        let stored = fx.store.get_thread(OWNER, &ThreadId::new("t1")).unwrap().unwrap();
        assert_eq!(stored.subject, "Original");
        assert_eq!(stored.message_count, 2);
        assert_eq!(stored.history_id, 100);
        assert_eq!(
            fx.store.list_raw_messages_for_thread(OWNER, &ThreadId::new("t1")).unwrap().len(),
            2
        );
        assert_eq!(fx.store.list_labels(OWNER).unwrap().len(), 1);
    }

    #[test]
    fn test_attachment_failure_is_recorded_not_fatal() {
        let fx = Fixture::new();
        let message = with_attachment(simple_message("m1", "t1", 1_000, "s", "b"), "a1", "x.bin", 4);
        fx.mailbox.add_thread(thread_of("t1", vec![message]));
        fx.mailbox.add_attachment_data("m1", "a1", "%%%".to_string());

        let synced = fx.syncer().sync_thread(&summary("t1")).unwrap();
        assert_eq!(synced.failures.len(), 1);
        assert_eq!(synced.failures[0].item, "attachment:a1");
        assert!(fx.store.get_thread(OWNER, &ThreadId::new("t1")).unwrap().is_some());
    }

    #[test]
    fn test_fatal_thread_does_not_abort_siblings() {
        let fx = Fixture::new();
        for id in ["t1", "t2", "t3"] {
            let message = simple_message(&format!("m-{}", id), id, 1_000, "s", "b");
            fx.mailbox.add_thread(thread_of(id, vec![message]));
        }
        fx.mailbox.fail_thread("t2", vec![RemoteError::Fatal("malformed".into())]);

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let outcome = fx
            .syncer()
            .sync_page(&pool, &[summary("t1"), summary("t2"), summary("t3")])
            .unwrap();

        assert_eq!(outcome.threads.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].item, "thread:t2");
        assert_eq!(outcome.deletable_message_ids().count(), 2);
    }

    #[test]
    fn test_thread_with_failed_attachment_is_not_deletable() {
        let fx = Fixture::new();
        let broken = with_attachment(simple_message("m1", "t1", 1_000, "s", "b"), "a1", "x.bin", 4);
        fx.mailbox.add_thread(thread_of("t1", vec![broken]));
        fx.mailbox.add_attachment_data("m1", "a1", "%%%".to_string());
        fx.mailbox
            .add_thread(thread_of("t2", vec![simple_message("m2", "t2", 2_000, "s", "b")]));

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let outcome = fx
            .syncer()
            .sync_page(&pool, &[summary("t1"), summary("t2")])
            .unwrap();

        assert_eq!(outcome.threads.len(), 2);
        let deletable: Vec<&str> = outcome.deletable_message_ids().map(|id| id.as_str()).collect();
        assert_eq!(deletable, vec!["m2"]);
    }

    #[test]
    fn test_transient_thread_aborts_page() {
        let fx = Fixture::new();
        for id in ["t1", "t2"] {
            let message = simple_message(&format!("m-{}", id), id, 1_000, "s", "b");
            fx.mailbox.add_thread(thread_of(id, vec![message]));
        }
        fx.mailbox.fail_thread(
            "t2",
            vec![RemoteError::RateLimited, RemoteError::RateLimited],
        );

        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let result = fx.syncer().sync_page(&pool, &[summary("t1"), summary("t2")]);

        assert!(matches!(result, Err(SyncError::Transient(_))));
        assert_eq!(fx.mailbox.thread_fetches("t2"), 2);
    }

    #[test]
    fn test_cancelled_before_fetch() {
        let fx = Fixture::new();
        fx.mailbox.add_thread(thread_of("t1", vec![simple_message("m1", "t1", 1_000, "s", "b")]));
        fx.cancel.cancel();

        assert_eq!(
            fx.syncer().sync_thread(&summary("t1")).unwrap_err(),
            SyncError::Cancelled
        );
        assert_eq!(fx.mailbox.thread_fetches("t1"), 0);
    }

    #[test]
    fn test_page_progress_dates() {
        let outcome = PageOutcome {
            threads: vec![
                SyncedThread {
                    thread_id: ThreadId::new("t1"),
                    message_ids: vec![],
                    newest_message_date: NaiveDate::from_ymd_opt(2024, 1, 5),
                    oldest_message_date: NaiveDate::from_ymd_opt(2024, 1, 2),
                    failures: vec![],
                },
                SyncedThread {
                    thread_id: ThreadId::new("t2"),
                    message_ids: vec![],
                    newest_message_date: NaiveDate::from_ymd_opt(2024, 1, 7),
                    oldest_message_date: NaiveDate::from_ymd_opt(2024, 1, 3),
                    failures: vec![],
                },
            ],
            failures: vec![],
        };

        let progress = outcome.into_progress();
        assert_eq!(progress.threads, 2);
        assert_eq!(progress.newest_message_date, NaiveDate::from_ymd_opt(2024, 1, 7));
        assert_eq!(progress.oldest_message_date, NaiveDate::from_ymd_opt(2024, 1, 2));
    }
}
