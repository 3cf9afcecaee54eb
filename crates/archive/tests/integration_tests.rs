//! End-to-end sync tests: SQLite store and file blobs on disk, in-memory mailbox

use std::sync::Arc;
use std::time::Duration;

use archive::error::RemoteError;
use archive::gmail::api::{GmailLabel, Person, PersonEmail, PersonName};
use archive::gmail::fixtures::{simple_message, thread_of, with_attachment};
use archive::{
    ArchiveService, ArchiveSettings, ArchiveStore, FileBlobStore, InMemoryMailbox, RunKind,
    RunOrigin, RunStatus, SqliteArchiveStore, StorageMode, SyncRequest, SyncRun, SyncTarget,
    ThreadId, ThreadSearch,
};
use chrono::NaiveDate;
use tempfile::TempDir;

const OWNER: &str = "me@example.com";
/// 2024-01-01T00:00:00Z
const JAN_1: i64 = 1_704_067_200_000;
const DAY: i64 = 86_400_000;
const WAIT: Duration = Duration::from_secs(30);

struct Harness {
    service: ArchiveService,
    store: Arc<SqliteArchiveStore>,
    mailbox: InMemoryMailbox,
    _dir: TempDir,
}

fn create_harness(page_size: usize) -> Harness {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(SqliteArchiveStore::new(dir.path().join("archive.db")).unwrap());
    let blobs = Arc::new(FileBlobStore::new(dir.path().join("blobs")).unwrap());
    let mailbox = InMemoryMailbox::new(page_size);
    let settings = ArchiveSettings {
        data_dir: Some(dir.path().to_path_buf()),
        worker_threads: 4,
        rate_limit_backoff_ms: 0,
        ..Default::default()
    };
    let service =
        ArchiveService::with_components(store.clone(), blobs, Arc::new(mailbox.clone()), settings)
            .unwrap();
    Harness {
        service,
        store,
        mailbox,
        _dir: dir,
    }
}

/// `count` single-message threads, one per day starting 2024-01-01
fn add_threads(mailbox: &InMemoryMailbox, count: usize) {
    for i in 0..count {
        let id = format!("t{}", i);
        mailbox.add_thread(thread_of(
            &id,
            vec![simple_message(
                &format!("m{}", i),
                &id,
                JAN_1 + i as i64 * DAY,
                &format!("Subject {}", i),
                &format!("Body of message {}", i),
            )],
        ));
    }
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

#[test]
fn test_persistent_rate_limit_then_retry_resumes_at_cursor() {
    let h = create_harness(2);
    add_threads(&h.mailbox, 6);
    h.mailbox.fail_listing(
        Some("offset-2"),
        vec![RemoteError::RateLimited, RemoteError::RateLimited],
    );

    let failed = h.service.run_sync_blocking(SyncRequest::mail(OWNER, "")).unwrap();
    assert_eq!(failed.status, RunStatus::Error);
    assert_eq!(failed.pages_completed, 1);
    assert_eq!(failed.thread_count, 2);
    assert_eq!(failed.next_cursor.as_deref(), Some("offset-2"));
    assert!(failed.last_error.as_deref().unwrap().contains("rate limit"));

    let page_one = h.store.get_thread(OWNER, &ThreadId::new("t0")).unwrap().unwrap();

    let retry_id = h.service.retry_sync(failed.id).unwrap();
    assert!(h.service.wait_for_idle(WAIT));

    let retry = h.service.get_sync_run(retry_id).unwrap().unwrap();
    assert_eq!(retry.status, RunStatus::Done);
    assert_eq!(retry.pages_completed, 2);
    assert_eq!(retry.thread_count, 4);

    // The failed run is untouched
    let original = h.service.get_sync_run(failed.id).unwrap().unwrap();
    assert_eq!(original.status, RunStatus::Error);

    // Page 1 was not listed or fetched again
    let calls = h.mailbox.list_calls();
    assert_eq!(calls.iter().filter(|c| c.is_none()).count(), 1);
    assert_eq!(h.mailbox.thread_fetches("t0"), 1);
    assert_eq!(h.mailbox.thread_fetches("t1"), 1);
    assert_eq!(
        h.store.get_thread(OWNER, &ThreadId::new("t0")).unwrap().unwrap(),
        page_one
    );
    assert_eq!(h.service.stats(OWNER).unwrap().threads, 6);
}

#[test]
fn test_interrupted_run_is_resumed_by_scheduler() {
    let h = create_harness(2);
    add_threads(&h.mailbox, 6);

    // A run that committed page 1 and then crashed
    let mut run = SyncRun::new(OWNER, "", RunOrigin::User, SyncTarget::Mail, RunKind::Manual);
    run.id = h.store.create_sync_run(&run).unwrap();
    run.start().unwrap();
    run.record_page(None, Some("offset-2".into()), Default::default())
        .unwrap();
    h.store.save_sync_run(&run).unwrap();

    let report = h.service.scheduler().tick(date(2024, 2, 1)).unwrap();
    assert_eq!(report.resumed, vec![run.id]);
    assert!(h.service.wait_for_idle(WAIT));

    let resumed = h.service.get_sync_run(run.id).unwrap().unwrap();
    assert_eq!(resumed.status, RunStatus::Done);
    assert_eq!(resumed.pages_completed, 3);
    assert_eq!(resumed.thread_count, 4);
    assert_eq!(h.mailbox.thread_fetches("t0"), 0);
    assert_eq!(h.mailbox.thread_fetches("t5"), 1);
    assert!(h.store.get_thread(OWNER, &ThreadId::new("t0")).unwrap().is_none());
}

#[test]
fn test_rerun_is_idempotent() {
    let h = create_harness(3);
    add_threads(&h.mailbox, 4);
    let message = with_attachment(
        simple_message("m-att", "t-att", JAN_1, "Report", "attached"),
        "att-1",
        "report.csv",
        5,
    );
    h.mailbox.add_thread(thread_of("t-att", vec![message]));
    h.mailbox.add_attachment("m-att", "att-1", b"a,b,c");

    let first = h.service.run_sync_blocking(SyncRequest::mail(OWNER, "")).unwrap();
    let stats = h.service.stats(OWNER).unwrap();
    let second = h.service.run_sync_blocking(SyncRequest::mail(OWNER, "")).unwrap();

    assert_eq!(first.status, RunStatus::Done);
    assert_eq!(second.status, RunStatus::Done);
    assert_eq!(h.service.stats(OWNER).unwrap(), stats);
    assert_eq!(stats.threads, 5);
    assert_eq!(stats.messages, 5);
    assert_eq!(stats.attachments, 1);
    assert_eq!(h.mailbox.attachment_fetches(), 1);
    assert_eq!(h.service.list_sync_runs(OWNER).unwrap().len(), 2);
}

#[test]
fn test_attachment_tiering_boundary() {
    let h = create_harness(10);
    for (i, size) in [150_000usize, 150_001].into_iter().enumerate() {
        let thread = format!("t{}", i);
        let message_id = format!("m{}", i);
        let attachment_id = format!("a{}", i);
        let message = with_attachment(
            simple_message(&message_id, &thread, JAN_1, "Files", "see attached"),
            &attachment_id,
            "file.bin",
            size as u64,
        );
        h.mailbox.add_thread(thread_of(&thread, vec![message]));
        h.mailbox
            .add_attachment(&message_id, &attachment_id, &vec![i as u8 + 1; size]);
    }

    let run = h.service.run_sync_blocking(SyncRequest::mail(OWNER, "")).unwrap();
    assert_eq!(run.status, RunStatus::Done);
    assert!(run.failures.is_empty());

    let inline = h.store.get_attachment(OWNER, "a0").unwrap().unwrap();
    let blob = h.store.get_attachment(OWNER, "a1").unwrap().unwrap();
    assert_eq!(inline.storage_mode(), StorageMode::Inline);
    assert_eq!(blob.storage_mode(), StorageMode::Blob);
    assert_eq!(blob.size, 150_001);

    assert_eq!(
        h.service.get_attachment_bytes(OWNER, "a0").unwrap().unwrap(),
        vec![1u8; 150_000]
    );
    assert_eq!(
        h.service.get_attachment_bytes(OWNER, "a1").unwrap().unwrap(),
        vec![2u8; 150_001]
    );
    assert_eq!(h.service.stats(OWNER).unwrap().blob_attachments, 1);
}

#[test]
fn test_delete_after_archive() {
    let h = create_harness(2);
    add_threads(&h.mailbox, 3);

    let run = h
        .service
        .run_sync_blocking(SyncRequest::mail(OWNER, "").delete_after_archive(true))
        .unwrap();

    assert_eq!(run.status, RunStatus::Done);
    assert!(run.delete_after_archive);
    let mut deleted = h.mailbox.deleted();
    deleted.sort();
    assert_eq!(deleted, vec!["m0", "m1", "m2"]);
    // Local copies stay
    assert_eq!(h.service.stats(OWNER).unwrap().messages, 3);
}

#[test]
fn test_delete_keeps_messages_with_unarchived_attachments() {
    let h = create_harness(2);
    let message = with_attachment(
        simple_message("m0", "t0", JAN_1, "Invoice", "See attached"),
        "a0",
        "invoice.pdf",
        16,
    );
    h.mailbox.add_thread(thread_of("t0", vec![message]));
    h.mailbox
        .add_attachment_data("m0", "a0", "!!!not base64!!!".to_string());

    let run = h
        .service
        .run_sync_blocking(SyncRequest::mail(OWNER, "").delete_after_archive(true))
        .unwrap();

    assert_eq!(run.status, RunStatus::Done);
    let items: Vec<&str> = run.failures.iter().map(|f| f.item.as_str()).collect();
    assert_eq!(items, vec!["attachment:a0"]);
    assert!(h.mailbox.deleted().is_empty());
    assert!(h.service.get_attachment_bytes(OWNER, "a0").unwrap().is_none());
}

#[test]
fn test_labels_and_contacts() {
    let h = create_harness(2);
    h.mailbox.add_label(GmailLabel {
        id: "Label_7".into(),
        name: "Receipts".into(),
        label_type: Some("user".into()),
        messages_total: Some(12),
        messages_unread: Some(2),
        ..Default::default()
    });
    for i in 0..3 {
        h.mailbox.add_person(Person {
            resource_name: format!("people/c{}", i),
            names: vec![PersonName {
                given_name: Some(format!("Friend{}", i)),
                family_name: Some("Example".into()),
            }],
            email_addresses: vec![PersonEmail {
                value: Some(format!("friend{}@example.com", i)),
            }],
            ..Default::default()
        });
    }

    let labels = h.service.run_sync_blocking(SyncRequest::labels(OWNER)).unwrap();
    let contacts = h.service.run_sync_blocking(SyncRequest::contacts(OWNER)).unwrap();
    assert_eq!(labels.status, RunStatus::Done);
    assert_eq!(contacts.status, RunStatus::Done);
    assert_eq!(contacts.thread_count, 3);

    let stored = h.service.list_labels(OWNER).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].name, "Receipts");
    assert_eq!(stored[0].messages_total, 12);

    let people = h.service.list_contacts(OWNER).unwrap();
    assert_eq!(people.len(), 3);
    assert!(people.iter().any(|c| c.email == "friend1@example.com"));
}

#[test]
fn test_daily_schedule_advances_one_day_per_window() {
    let h = create_harness(10);
    // Newest message on 2024-01-04
    add_threads(&h.mailbox, 4);

    let daily = h
        .service
        .run_sync_blocking(SyncRequest::mail(OWNER, "").daily())
        .unwrap();
    assert_eq!(daily.status, RunStatus::Done);
    assert_eq!(daily.anchor_date, Some(date(2024, 1, 4)));

    let scheduler = h.service.scheduler();
    let first = scheduler.tick(date(2024, 1, 10)).unwrap();
    assert_eq!(first.scheduled.len(), 1);
    assert!(h.service.wait_for_idle(WAIT));

    let window = h.service.get_sync_run(first.scheduled[0]).unwrap().unwrap();
    assert_eq!(window.query, "after:2024/01/04 before:2024/01/05");
    assert_eq!(window.origin, RunOrigin::System);
    assert_eq!(window.status, RunStatus::Done);
    assert_eq!(window.anchor_date, Some(date(2024, 1, 5)));

    let second = scheduler.tick(date(2024, 1, 10)).unwrap();
    assert!(h.service.wait_for_idle(WAIT));
    let window = h.service.get_sync_run(second.scheduled[0]).unwrap().unwrap();
    assert_eq!(window.query, "after:2024/01/05 before:2024/01/06");
    assert_eq!(window.anchor_date, Some(date(2024, 1, 6)));
}

#[test]
fn test_empty_window_still_advances() {
    let h = create_harness(10);
    let mut daily = SyncRun::new(OWNER, "", RunOrigin::User, SyncTarget::Mail, RunKind::Daily);
    daily.id = h.store.create_sync_run(&daily).unwrap();
    daily.status = RunStatus::Done;
    daily.anchor_date = Some(date(2024, 1, 5));
    h.store.save_sync_run(&daily).unwrap();

    let report = h.service.scheduler().tick(date(2024, 1, 10)).unwrap();
    assert!(h.service.wait_for_idle(WAIT));

    let window = h.service.get_sync_run(report.scheduled[0]).unwrap().unwrap();
    assert_eq!(window.query, "after:2024/01/05 before:2024/01/06");
    assert_eq!(window.status, RunStatus::Done);
    assert_eq!(window.thread_count, 0);
    assert_eq!(window.anchor_date, Some(date(2024, 1, 6)));
}

#[test]
fn test_search_after_sync() {
    let h = create_harness(10);
    add_threads(&h.mailbox, 3);
    h.service.run_sync_blocking(SyncRequest::mail(OWNER, "")).unwrap();

    let hits = h
        .service
        .search_threads(OWNER, &ThreadSearch::text("message 2"), 10, 0)
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id.as_str(), "t2");

    let by_sender = ThreadSearch {
        from: Some("SENDER@example.com".into()),
        ..Default::default()
    };
    assert_eq!(h.service.search_threads(OWNER, &by_sender, 10, 0).unwrap().len(), 3);

    let inbox = h.service.list_threads_by_label(OWNER, "INBOX", 10, 0).unwrap();
    assert_eq!(inbox.len(), 3);
    assert_eq!(inbox[0].id.as_str(), "t2");
}
