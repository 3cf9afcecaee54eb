//! Paginated listing of threads, labels and contacts
//!
//! Every remote call gets exactly one retry after a backoff when it fails
//! with a retryable error. A second failure is returned as-is and converted
//! to a [`SyncError`] by the caller's `?`.

use std::time::Duration;

use crate::error::{RemoteError, SyncError};
use crate::gmail::api::{GmailLabel, Person, ThreadRef};
use crate::gmail::{ContactRemote, LabelRemote, MailRemote};

/// One page of listing results
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Absent on the last page
    pub next_cursor: Option<String>,
}

impl<T> Page<T> {
    fn new(items: Vec<T>, next_cursor: Option<String>) -> Self {
        Self {
            items,
            next_cursor: next_cursor.filter(|c| !c.is_empty()),
        }
    }
}

/// Run `call`, retrying once after `backoff` on a retryable error
pub fn with_retry<T>(
    backoff: Duration,
    what: &str,
    mut call: impl FnMut() -> Result<T, RemoteError>,
) -> Result<T, RemoteError> {
    match call() {
        Err(err) if err.is_retryable() => {
            log::warn!("[SYNC] {} failed ({}), retrying in {:?}", what, err, backoff);
            std::thread::sleep(backoff);
            call()
        }
        result => result,
    }
}

pub struct ThreadLister<'a> {
    remote: &'a dyn MailRemote,
    query: &'a str,
    backoff: Duration,
}

impl<'a> ThreadLister<'a> {
    pub fn new(remote: &'a dyn MailRemote, query: &'a str, backoff: Duration) -> Self {
        Self {
            remote,
            query,
            backoff,
        }
    }

    pub fn page(&self, cursor: Option<&str>) -> Result<Page<ThreadRef>, SyncError> {
        let response = with_retry(self.backoff, "thread listing", || {
            self.remote.list_threads(self.query, cursor)
        })?;
        Ok(Page::new(response.threads, response.next_page_token))
    }
}

pub struct LabelLister<'a> {
    remote: &'a dyn LabelRemote,
    backoff: Duration,
}

impl<'a> LabelLister<'a> {
    pub fn new(remote: &'a dyn LabelRemote, backoff: Duration) -> Self {
        Self { remote, backoff }
    }

    /// List all labels, then fetch each one's detail
    ///
    /// A label that disappears between the two calls keeps its listing entry.
    pub fn list(&self) -> Result<Vec<GmailLabel>, SyncError> {
        let listing = with_retry(self.backoff, "label listing", || self.remote.list_labels())?;

        let mut labels = Vec::with_capacity(listing.labels.len());
        for summary in listing.labels {
            match with_retry(self.backoff, "label fetch", || self.remote.get_label(&summary.id)) {
                Ok(detail) => labels.push(detail),
                Err(RemoteError::NotFound(_)) => {
                    log::warn!("[SYNC] Label {} vanished during listing", summary.id);
                    labels.push(summary);
                }
                Err(err) => return Err(err.into()),
            }
        }
        Ok(labels)
    }
}

pub struct ContactLister<'a> {
    remote: &'a dyn ContactRemote,
    backoff: Duration,
}

impl<'a> ContactLister<'a> {
    pub fn new(remote: &'a dyn ContactRemote, backoff: Duration) -> Self {
        Self { remote, backoff }
    }

    pub fn page(&self, cursor: Option<&str>) -> Result<Page<Person>, SyncError> {
        let response = with_retry(self.backoff, "contact listing", || {
            self.remote.list_connections(cursor)
        })?;
        Ok(Page::new(response.connections, response.next_page_token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gmail::InMemoryMailbox;
    use crate::gmail::fixtures::{simple_message, thread_of};

    fn mailbox(threads: usize) -> InMemoryMailbox {
        let mailbox = InMemoryMailbox::new(2);
        for i in 0..threads {
            let id = format!("t{}", i);
            mailbox.add_thread(thread_of(
                &id,
                vec![simple_message(&format!("m{}", i), &id, 1_000, "s", "b")],
            ));
        }
        mailbox
    }

    #[test]
    fn test_rate_limit_is_retried_once() {
        let mailbox = mailbox(3);
        mailbox.fail_listing(None, vec![RemoteError::RateLimited]);

        let lister = ThreadLister::new(&mailbox, "", Duration::ZERO);
        let page = lister.page(None).unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.next_cursor.as_deref(), Some("offset-2"));
        assert_eq!(mailbox.list_calls().len(), 2);
    }

    #[test]
    fn test_persistent_rate_limit_is_transient() {
        let mailbox = mailbox(3);
        mailbox.fail_listing(None, vec![RemoteError::RateLimited, RemoteError::RateLimited]);

        let lister = ThreadLister::new(&mailbox, "", Duration::ZERO);
        assert!(matches!(lister.page(None), Err(SyncError::Transient(_))));
        assert_eq!(mailbox.list_calls().len(), 2);
    }

    #[test]
    fn test_malformed_page_is_not_retried() {
        let mailbox = mailbox(3);
        mailbox.fail_listing(None, vec![RemoteError::Fatal("garbage".into())]);

        let lister = ThreadLister::new(&mailbox, "", Duration::ZERO);
        assert!(matches!(lister.page(None), Err(SyncError::Fatal(_))));
        assert_eq!(mailbox.list_calls().len(), 1);
    }

    #[test]
    fn test_last_page_has_no_cursor() {
        let mailbox = mailbox(3);
        let lister = ThreadLister::new(&mailbox, "", Duration::ZERO);
        let page = lister.page(Some("offset-2")).unwrap();
        assert_eq!(page.items.len(), 1);
        assert!(page.next_cursor.is_none());
    }

    #[test]
    fn test_label_lister_fetches_details() {
        let mailbox = InMemoryMailbox::new(10);
        mailbox.add_label(GmailLabel {
            id: "Label_1".into(),
            name: "Receipts".into(),
            messages_total: Some(4),
            ..Default::default()
        });

        let labels = LabelLister::new(&mailbox, Duration::ZERO).list().unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].messages_total, Some(4));
    }
}
