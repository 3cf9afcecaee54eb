//! Persisted state of one sync invocation
//!
//! A run moves `pending -> running -> {done, error}`. Cursor fields only
//! change through [`SyncRun::record_page`], which the engine calls after a
//! page is durable, so a crashed run can always continue from `next_cursor`.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Store-assigned identifier; zero until the run is first saved
pub type SyncRunId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOrigin {
    User,
    System,
}

impl RunOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOrigin::User => "user",
            RunOrigin::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(RunOrigin::User),
            "system" => Some(RunOrigin::System),
            _ => None,
        }
    }
}

/// What a run archives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTarget {
    Mail,
    Labels,
    Contacts,
}

impl SyncTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncTarget::Mail => "mail",
            SyncTarget::Labels => "labels",
            SyncTarget::Contacts => "contacts",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mail" => Some(SyncTarget::Mail),
            "labels" => Some(SyncTarget::Labels),
            "contacts" => Some(SyncTarget::Contacts),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RunKind {
    /// One-off run requested by a user
    Manual,
    /// User run that seeds the daily incremental schedule
    Daily,
    /// Daily window created by the scheduler from a `Daily` run
    Scheduled { parent: SyncRunId },
}

impl RunKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunKind::Manual => "manual",
            RunKind::Daily => "daily",
            RunKind::Scheduled { .. } => "scheduled",
        }
    }

    pub fn parent(&self) -> Option<SyncRunId> {
        match self {
            RunKind::Scheduled { parent } => Some(*parent),
            _ => None,
        }
    }

    pub fn parse(s: &str, parent: Option<SyncRunId>) -> Option<Self> {
        match (s, parent) {
            ("manual", _) => Some(RunKind::Manual),
            ("daily", _) => Some(RunKind::Daily),
            ("scheduled", Some(parent)) => Some(RunKind::Scheduled { parent }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Error,
    Done,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Error => "error",
            RunStatus::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RunStatus::Pending),
            "running" => Some(RunStatus::Running),
            "error" => Some(RunStatus::Error),
            "done" => Some(RunStatus::Done),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, RunStatus::Done | RunStatus::Error)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A rejected state transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot {action} sync run {id} in status {status}")]
pub struct TransitionError {
    pub id: SyncRunId,
    pub status: RunStatus,
    pub action: &'static str,
}

/// An item that failed without aborting the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemFailure {
    /// e.g. `thread:abc`, `attachment:xyz`, `delete:123`
    pub item: String,
    pub error: String,
    pub at: DateTime<Utc>,
}

/// Counters gathered while processing one page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageProgress {
    pub threads: u64,
    pub newest_message_date: Option<NaiveDate>,
    pub oldest_message_date: Option<NaiveDate>,
    pub failures: Vec<ItemFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRun {
    pub id: SyncRunId,
    pub owner: String,
    /// Provider search query (Gmail `q` syntax)
    pub query: String,
    pub origin: RunOrigin,
    pub target: SyncTarget,
    pub kind: RunKind,
    pub delete_after_archive: bool,
    pub status: RunStatus,
    /// Cursor that fetched the last committed page
    pub page_cursor: Option<String>,
    /// Cursor of the next page to fetch; `None` before the first page
    pub next_cursor: Option<String>,
    pub pages_completed: u32,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Threads (or labels, contacts) archived so far
    pub thread_count: u64,
    /// Date of the newest message processed (listings are newest first)
    pub first_message_date: Option<NaiveDate>,
    /// Date of the oldest message processed
    pub last_message_date: Option<NaiveDate>,
    /// Day the next scheduled window starts from
    pub anchor_date: Option<NaiveDate>,
    pub last_error: Option<String>,
    pub failures: Vec<ItemFailure>,
}

impl SyncRun {
    pub fn new(
        owner: impl Into<String>,
        query: impl Into<String>,
        origin: RunOrigin,
        target: SyncTarget,
        kind: RunKind,
    ) -> Self {
        Self {
            id: 0,
            owner: owner.into(),
            query: query.into(),
            origin,
            target,
            kind,
            delete_after_archive: false,
            status: RunStatus::Pending,
            page_cursor: None,
            next_cursor: None,
            pages_completed: 0,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            thread_count: 0,
            first_message_date: None,
            last_message_date: None,
            anchor_date: None,
            last_error: None,
            failures: Vec::new(),
        }
    }

    pub fn with_delete_after_archive(mut self, delete: bool) -> Self {
        self.delete_after_archive = delete;
        self
    }

    /// A system run covering the single day `day`, scheduled from `parent`.
    ///
    /// The new run's anchor is already `day + 1`, so the schedule moves
    /// forward even when the window turns out to be empty.
    pub fn scheduled(parent: &SyncRun, parent_id: SyncRunId, day: NaiveDate) -> Self {
        let mut run = Self::new(
            parent.owner.clone(),
            daily_window_query(day),
            RunOrigin::System,
            SyncTarget::Mail,
            RunKind::Scheduled { parent: parent_id },
        );
        run.delete_after_archive = parent.delete_after_archive;
        run.anchor_date = day.succ_opt();
        run
    }

    /// A fresh run that picks up where a failed run stopped.
    ///
    /// The failed run stays terminal; only its cursor is carried over.
    pub fn retry_of(failed: &SyncRun) -> Result<Self, TransitionError> {
        if failed.status != RunStatus::Error {
            return Err(failed.transition_error("retry"));
        }
        let mut run = Self::new(
            failed.owner.clone(),
            failed.query.clone(),
            failed.origin,
            failed.target,
            failed.kind,
        );
        run.delete_after_archive = failed.delete_after_archive;
        run.page_cursor = failed.page_cursor.clone();
        run.next_cursor = failed.next_cursor.clone();
        run.anchor_date = failed.anchor_date;
        Ok(run)
    }

    /// Move to `running`. Starting a running run again is how resumption works.
    pub fn start(&mut self) -> Result<(), TransitionError> {
        match self.status {
            RunStatus::Pending | RunStatus::Running => {
                self.status = RunStatus::Running;
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                Ok(())
            }
            _ => Err(self.transition_error("start")),
        }
    }

    /// Commit a processed page. Call only once the page is durable.
    pub fn record_page(
        &mut self,
        page_cursor: Option<String>,
        next_cursor: Option<String>,
        progress: PageProgress,
    ) -> Result<(), TransitionError> {
        if self.status != RunStatus::Running {
            return Err(self.transition_error("record a page for"));
        }
        self.page_cursor = page_cursor;
        self.next_cursor = next_cursor.filter(|c| !c.is_empty());
        self.pages_completed += 1;
        self.thread_count += progress.threads;
        if let Some(newest) = progress.newest_message_date {
            self.first_message_date = Some(self.first_message_date.map_or(newest, |d| d.max(newest)));
        }
        if let Some(oldest) = progress.oldest_message_date {
            self.last_message_date = Some(self.last_message_date.map_or(oldest, |d| d.min(oldest)));
        }
        self.failures.extend(progress.failures);
        Ok(())
    }

    pub fn record_failure(&mut self, item: impl Into<String>, error: impl Into<String>) {
        self.failures.push(ItemFailure {
            item: item.into(),
            error: error.into(),
            at: Utc::now(),
        });
    }

    /// Finish successfully.
    ///
    /// A user daily run without an anchor takes the newest message date it
    /// saw (or today) so the scheduler has a day to continue from.
    pub fn complete(&mut self) -> Result<(), TransitionError> {
        if self.status != RunStatus::Running {
            return Err(self.transition_error("complete"));
        }
        let now = Utc::now();
        if self.kind == RunKind::Daily && self.anchor_date.is_none() {
            self.anchor_date = Some(self.first_message_date.unwrap_or(now.date_naive()));
        }
        self.status = RunStatus::Done;
        self.ended_at = Some(now);
        Ok(())
    }

    /// Stop with an error; cursor fields keep the last committed page.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), TransitionError> {
        if self.status.is_terminal() {
            return Err(self.transition_error("fail"));
        }
        self.status = RunStatus::Error;
        self.last_error = Some(error.into());
        self.ended_at = Some(Utc::now());
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Not finished: either never started, or interrupted mid-run
    ///
    /// A run without a next cursor restarts from its first page.
    pub fn is_resumable(&self) -> bool {
        !self.is_terminal()
    }

    fn transition_error(&self, action: &'static str) -> TransitionError {
        TransitionError {
            id: self.id,
            status: self.status,
            action,
        }
    }
}

/// Gmail query for the single day starting at `day`
pub fn daily_window_query(day: NaiveDate) -> String {
    let next = day.succ_opt().unwrap_or(day);
    format!(
        "after:{} before:{}",
        day.format("%Y/%m/%d"),
        next.format("%Y/%m/%d")
    )
}
