//! Background scheduler: crash recovery and daily incremental windows
//!
//! Every tick relaunches unfinished runs (interrupted ones continue from
//! their cursor, ones that never committed a page start over), then
//! schedules the next one-day
//! window for each finished user daily run. The anchor date stored on each
//! scheduled run is the day after its window, so the schedule advances one
//! day per window even when that day had no mail.

use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};

use crate::models::{SyncRun, SyncRunId};
use crate::storage::ArchiveStore;

/// Starts runs in the background
pub trait RunLauncher: Send + Sync {
    fn is_active(&self, id: SyncRunId) -> bool;

    /// `false` if the run was already executing
    fn launch(&self, id: SyncRunId) -> Result<bool>;
}

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub resumed: Vec<SyncRunId>,
    /// New scheduled runs
    pub scheduled: Vec<SyncRunId>,
    /// Daily runs with nothing to schedule: no anchor, or a window still executing
    pub skipped: Vec<SyncRunId>,
}

pub struct SyncScheduler {
    store: Arc<dyn ArchiveStore>,
    launcher: Arc<dyn RunLauncher>,
    interval: Duration,
}

impl SyncScheduler {
    pub fn new(
        store: Arc<dyn ArchiveStore>,
        launcher: Arc<dyn RunLauncher>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            interval,
        }
    }

    /// One pass of recovery and scheduling. Windows are only created for
    /// days before `today`.
    pub fn tick(&self, today: NaiveDate) -> Result<TickReport> {
        let mut report = TickReport::default();

        for run in self.store.list_resumable_runs()? {
            if self.launcher.is_active(run.id) {
                continue;
            }
            log::info!(
                "[SCHEDULER] Resuming {} run {} at cursor {:?}",
                run.status,
                run.id,
                run.next_cursor
            );
            if self.launcher.launch(run.id)? {
                report.resumed.push(run.id);
            }
        }

        for parent in self.store.list_daily_user_runs()? {
            let latest = self.store.latest_scheduled_run(parent.id)?;
            if let Some(pending) = latest.as_ref().filter(|r| !r.is_terminal()) {
                log::debug!(
                    "[SCHEDULER] Daily run {} still has window {} in progress",
                    parent.id,
                    pending.id
                );
                report.skipped.push(parent.id);
                continue;
            }

            let source = latest.as_ref().unwrap_or(&parent);
            let Some(day) = source.anchor_date else {
                log::warn!(
                    "[SCHEDULER] Daily run {} has no anchor date, skipping",
                    source.id
                );
                report.skipped.push(parent.id);
                continue;
            };
            if day >= today {
                continue;
            }

            let run = SyncRun::scheduled(&parent, parent.id, day);
            let id = self.store.create_sync_run(&run)?;
            log::info!(
                "[SCHEDULER] Scheduled run {} for {} ({:?}) from daily run {}",
                id,
                run.owner,
                run.query,
                parent.id
            );
            self.launcher.launch(id)?;
            report.scheduled.push(id);
        }

        Ok(report)
    }

    /// Run the loop on a background thread: tick now, then every interval
    pub fn spawn(self) -> Result<SchedulerHandle> {
        let (stop, stopped) = mpsc::channel::<()>();
        let thread = std::thread::Builder::new()
            .name("sync-scheduler".to_string())
            .spawn(move || {
                loop {
                    match self.tick(Utc::now().date_naive()) {
                        Ok(report) => log::info!(
                            "[SCHEDULER] Tick: {} resumed, {} scheduled, {} skipped",
                            report.resumed.len(),
                            report.scheduled.len(),
                            report.skipped.len()
                        ),
                        Err(e) => log::error!("[SCHEDULER] Tick failed: {:#}", e),
                    }
                    match stopped.recv_timeout(self.interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        _ => break,
                    }
                }
                log::info!("[SCHEDULER] Stopped");
            })
            .context("Failed to spawn scheduler thread")?;

        Ok(SchedulerHandle { stop, thread })
    }
}

pub struct SchedulerHandle {
    stop: Sender<()>,
    thread: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Block for as long as the scheduler runs
    pub fn join(self) {
        if self.thread.join().is_err() {
            log::error!("[SCHEDULER] Scheduler thread panicked");
        }
    }

    /// Stop the loop and wait for the current tick to finish
    pub fn shutdown(self) {
        let _ = self.stop.send(());
        if self.thread.join().is_err() {
            log::error!("[SCHEDULER] Scheduler thread panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PageProgress, RunKind, RunOrigin, RunStatus, SyncTarget};
    use crate::storage::InMemoryArchiveStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingLauncher {
        active: Mutex<Vec<SyncRunId>>,
        launched: Mutex<Vec<SyncRunId>>,
    }

    impl RunLauncher for RecordingLauncher {
        fn is_active(&self, id: SyncRunId) -> bool {
            self.active.lock().unwrap().contains(&id)
        }

        fn launch(&self, id: SyncRunId) -> Result<bool> {
            self.launched.lock().unwrap().push(id);
            Ok(true)
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn setup() -> (SyncScheduler, Arc<InMemoryArchiveStore>, Arc<RecordingLauncher>) {
        let store = Arc::new(InMemoryArchiveStore::new());
        let launcher = Arc::new(RecordingLauncher::default());
        let scheduler = SyncScheduler::new(store.clone(), launcher.clone(), Duration::from_secs(60));
        (scheduler, store, launcher)
    }

    fn finished_daily_run(store: &InMemoryArchiveStore, anchor: Option<NaiveDate>) -> SyncRun {
        let mut run = SyncRun::new(
            "me@example.com",
            "",
            RunOrigin::User,
            SyncTarget::Mail,
            RunKind::Daily,
        );
        run.id = store.create_sync_run(&run).unwrap();
        run.status = RunStatus::Done;
        run.anchor_date = anchor;
        store.save_sync_run(&run).unwrap();
        run
    }

    #[test]
    fn test_schedules_next_day_from_anchor() {
        let (scheduler, store, launcher) = setup();
        let parent = finished_daily_run(&store, Some(date(2024, 1, 5)));

        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert_eq!(report.scheduled.len(), 1);

        let run = store.get_sync_run(report.scheduled[0]).unwrap().unwrap();
        assert_eq!(run.query, "after:2024/01/05 before:2024/01/06");
        assert_eq!(run.anchor_date, Some(date(2024, 1, 6)));
        assert_eq!(run.origin, RunOrigin::System);
        assert_eq!(run.kind, RunKind::Scheduled { parent: parent.id });
        assert_eq!(*launcher.launched.lock().unwrap(), report.scheduled);
    }

    #[test]
    fn test_continues_from_latest_scheduled_run() {
        let (scheduler, store, _launcher) = setup();
        let parent = finished_daily_run(&store, Some(date(2024, 1, 5)));

        let first = scheduler.tick(date(2024, 1, 10)).unwrap().scheduled[0];
        let mut window = store.get_sync_run(first).unwrap().unwrap();
        window.start().unwrap();
        window.record_page(None, None, PageProgress::default()).unwrap();
        window.complete().unwrap();
        store.save_sync_run(&window).unwrap();

        let second = scheduler.tick(date(2024, 1, 10)).unwrap().scheduled[0];
        let run = store.get_sync_run(second).unwrap().unwrap();
        assert_eq!(run.query, "after:2024/01/06 before:2024/01/07");
        assert_eq!(run.anchor_date, Some(date(2024, 1, 7)));
        assert_eq!(run.kind.parent(), Some(parent.id));
    }

    #[test]
    fn test_window_in_progress_is_skipped() {
        let (scheduler, store, _launcher) = setup();
        let parent = finished_daily_run(&store, Some(date(2024, 1, 5)));

        scheduler.tick(date(2024, 1, 10)).unwrap();
        let report = scheduler.tick(date(2024, 1, 10)).unwrap();

        assert!(report.scheduled.is_empty());
        assert_eq!(report.skipped, vec![parent.id]);
    }

    #[test]
    fn test_missing_anchor_and_future_windows() {
        let (scheduler, store, _launcher) = setup();
        let no_anchor = finished_daily_run(&store, None);
        finished_daily_run(&store, Some(date(2024, 1, 10)));

        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert!(report.scheduled.is_empty());
        assert_eq!(report.skipped, vec![no_anchor.id]);
    }

    #[test]
    fn test_resumes_interrupted_runs_once() {
        let (scheduler, store, launcher) = setup();
        let mut run = SyncRun::new(
            "me@example.com",
            "",
            RunOrigin::User,
            SyncTarget::Mail,
            RunKind::Manual,
        );
        run.id = store.create_sync_run(&run).unwrap();
        run.start().unwrap();
        run.record_page(None, Some("offset-2".into()), PageProgress::default())
            .unwrap();
        store.save_sync_run(&run).unwrap();

        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert_eq!(report.resumed, vec![run.id]);

        launcher.active.lock().unwrap().push(run.id);
        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert!(report.resumed.is_empty());
    }

    #[test]
    fn test_window_crashed_on_first_page_is_resumed() {
        let (scheduler, store, launcher) = setup();
        let parent = finished_daily_run(&store, Some(date(2024, 1, 5)));

        let window_id = scheduler.tick(date(2024, 1, 10)).unwrap().scheduled[0];
        let mut window = store.get_sync_run(window_id).unwrap().unwrap();
        window.start().unwrap();
        store.save_sync_run(&window).unwrap();

        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert_eq!(report.resumed, vec![window_id]);
        assert_eq!(report.skipped, vec![parent.id]);
        assert_eq!(*launcher.launched.lock().unwrap(), vec![window_id, window_id]);

        window.record_page(None, None, PageProgress::default()).unwrap();
        window.complete().unwrap();
        store.save_sync_run(&window).unwrap();

        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert!(report.resumed.is_empty());
        assert_eq!(report.scheduled.len(), 1);
        let next = store.get_sync_run(report.scheduled[0]).unwrap().unwrap();
        assert_eq!(next.query, "after:2024/01/06 before:2024/01/07");
    }

    #[test]
    fn test_pending_window_is_launched_again() {
        let (scheduler, store, launcher) = setup();
        let parent = finished_daily_run(&store, Some(date(2024, 1, 5)));
        let window = SyncRun::scheduled(&parent, parent.id, date(2024, 1, 5));
        let window_id = store.create_sync_run(&window).unwrap();

        let report = scheduler.tick(date(2024, 1, 10)).unwrap();
        assert_eq!(report.resumed, vec![window_id]);
        assert!(report.scheduled.is_empty());
        assert_eq!(*launcher.launched.lock().unwrap(), vec![window_id]);
    }

    #[test]
    fn test_spawn_and_shutdown() {
        let (scheduler, store, launcher) = setup();
        finished_daily_run(&store, Some(date(2000, 1, 1)));

        let handle = scheduler.spawn().unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while launcher.launched.lock().unwrap().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        handle.shutdown();

        assert_eq!(launcher.launched.lock().unwrap().len(), 1);
    }
}
