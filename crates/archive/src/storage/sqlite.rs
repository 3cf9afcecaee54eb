//! SQLite-based archive storage

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, params, params_from_iter};
use rusqlite_migration::{M, Migrations};
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::traits::{ArchiveStats, ArchiveStore, ThreadSearch};
use crate::models::{
    Attachment, AttachmentData, Contact, DateParts, Label, LabelId, LabelType, Message,
    MessageId, RawMessage, RunKind, RunOrigin, RunStatus, SyncRun, SyncRunId, SyncTarget,
    Thread, ThreadId, datetime_from_millis,
};

/// Database migrations
///
/// Each migration is applied in order. The user_version pragma tracks which
/// migrations have been applied.
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![
        // Migration 1: Initial schema
        M::up(
            r#"
            CREATE TABLE threads (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                history_id INTEGER NOT NULL,
                snippet TEXT NOT NULL,
                subject TEXT NOT NULL,
                from_addrs TEXT NOT NULL,   -- JSON array
                to_addrs TEXT NOT NULL,
                cc_addrs TEXT NOT NULL,
                bcc_addrs TEXT NOT NULL,
                internal_date INTEGER NOT NULL,
                message_count INTEGER NOT NULL DEFAULT 0,
                attachment_count INTEGER NOT NULL DEFAULT 0,
                first_message_at INTEGER NOT NULL,  -- millis
                last_message_at INTEGER NOT NULL,   -- millis
                label_ids TEXT NOT NULL,
                PRIMARY KEY (owner, id)
            );

            CREATE INDEX idx_threads_last_message_at
                ON threads(owner, last_message_at DESC);

            -- Thread-label index for list_threads_by_label
            CREATE TABLE thread_labels (
                owner TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                label_id TEXT NOT NULL,
                last_message_at INTEGER NOT NULL,
                PRIMARY KEY (owner, thread_id, label_id)
            );

            CREATE INDEX idx_thread_labels_query
                ON thread_labels(owner, label_id, last_message_at DESC);

            -- Bodies stay uncompressed so LIKE search can see them
            CREATE TABLE messages (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                history_id INTEGER NOT NULL,
                snippet TEXT NOT NULL,
                subject TEXT NOT NULL,
                headers TEXT NOT NULL,
                from_addrs TEXT NOT NULL,
                to_addrs TEXT NOT NULL,
                cc_addrs TEXT NOT NULL,
                bcc_addrs TEXT NOT NULL,
                body_text TEXT NOT NULL,
                body_html TEXT NOT NULL,
                label_ids TEXT NOT NULL,
                attachments TEXT NOT NULL,
                internal_date INTEGER NOT NULL,
                decode_errors TEXT NOT NULL DEFAULT '[]',
                PRIMARY KEY (owner, id, thread_id)
            );

            CREATE INDEX idx_messages_thread
                ON messages(owner, thread_id, internal_date DESC);

            -- Verbatim remote payloads, zstd-compressed JSON
            CREATE TABLE raw_messages (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                internal_date INTEGER NOT NULL,
                payload BLOB NOT NULL,
                PRIMARY KEY (owner, id, thread_id)
            );

            CREATE INDEX idx_raw_messages_thread ON raw_messages(owner, thread_id);

            CREATE TABLE attachments (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                thread_id TEXT NOT NULL,
                part_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                mime_type TEXT NOT NULL,
                size INTEGER NOT NULL,
                headers TEXT NOT NULL,
                storage_mode TEXT NOT NULL,
                inline_data TEXT,
                blob_ref TEXT,
                PRIMARY KEY (owner, id)
            );

            CREATE INDEX idx_attachments_message ON attachments(owner, message_id);

            CREATE TABLE labels (
                owner TEXT NOT NULL,
                id TEXT NOT NULL,
                name TEXT NOT NULL,
                label_type TEXT NOT NULL,
                message_list_visibility TEXT,
                label_list_visibility TEXT,
                messages_total INTEGER NOT NULL DEFAULT 0,
                messages_unread INTEGER NOT NULL DEFAULT 0,
                threads_total INTEGER NOT NULL DEFAULT 0,
                threads_unread INTEGER NOT NULL DEFAULT 0,
                background_color TEXT,
                text_color TEXT,
                PRIMARY KEY (owner, id)
            );

            CREATE TABLE sync_runs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                owner TEXT NOT NULL,
                query TEXT NOT NULL,
                origin TEXT NOT NULL,
                target TEXT NOT NULL,
                kind TEXT NOT NULL,
                parent_id INTEGER,
                delete_after_archive INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                page_cursor TEXT,
                next_cursor TEXT,
                pages_completed INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                ended_at TEXT,
                thread_count INTEGER NOT NULL DEFAULT 0,
                first_message_date TEXT,
                last_message_date TEXT,
                anchor_date TEXT,
                last_error TEXT,
                failures TEXT NOT NULL DEFAULT '[]'
            );

            CREATE INDEX idx_sync_runs_owner ON sync_runs(owner, id DESC);
            CREATE INDEX idx_sync_runs_status ON sync_runs(status);
            CREATE INDEX idx_sync_runs_parent ON sync_runs(parent_id, id DESC);
            "#,
        ),
        // Migration 2: People API contacts
        M::up(
            r#"
            CREATE TABLE contacts (
                owner TEXT NOT NULL,
                resource_name TEXT NOT NULL,
                first_name TEXT NOT NULL DEFAULT '',
                last_name TEXT NOT NULL DEFAULT '',
                company TEXT NOT NULL DEFAULT '',
                title TEXT NOT NULL DEFAULT '',
                email TEXT NOT NULL DEFAULT '',
                phone TEXT NOT NULL DEFAULT '',
                PRIMARY KEY (owner, resource_name)
            );
            "#,
        ),
    ])
}

const THREAD_COLUMNS: &str = "t.owner, t.id, t.history_id, t.snippet, t.subject, t.from_addrs, \
     t.to_addrs, t.cc_addrs, t.bcc_addrs, t.internal_date, t.message_count, t.attachment_count, \
     t.first_message_at, t.last_message_at, t.label_ids";

const MESSAGE_COLUMNS: &str = "owner, id, thread_id, history_id, snippet, subject, headers, \
     from_addrs, to_addrs, cc_addrs, bcc_addrs, body_text, body_html, label_ids, attachments, \
     internal_date, decode_errors";

const ATTACHMENT_COLUMNS: &str = "owner, id, message_id, thread_id, part_id, filename, \
     mime_type, size, headers, storage_mode, inline_data, blob_ref";

const LABEL_COLUMNS: &str = "owner, id, name, label_type, message_list_visibility, \
     label_list_visibility, messages_total, messages_unread, threads_total, threads_unread, \
     background_color, text_color";

const RUN_COLUMNS: &str = "id, owner, query, origin, target, kind, parent_id, \
     delete_after_archive, status, page_cursor, next_cursor, pages_completed, created_at, \
     started_at, ended_at, thread_count, first_message_date, last_message_date, anchor_date, \
     last_error, failures";

fn conversion_error(idx: usize, msg: impl Into<String>) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, msg.into().into())
}

fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    parse_time(&text).ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", text)))
}

fn opt_time_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| parse_time(&t).ok_or_else(|| conversion_error(idx, format!("bad timestamp {}", t))))
        .transpose()
}

fn opt_date_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<NaiveDate>> {
    let text: Option<String> = row.get(idx)?;
    text.map(|t| {
        NaiveDate::parse_from_str(&t, "%Y-%m-%d")
            .map_err(|_| conversion_error(idx, format!("bad date {}", t)))
    })
    .transpose()
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn fmt_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn fmt_date(d: NaiveDate) -> String {
    d.format("%Y-%m-%d").to_string()
}

fn to_json<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).context("Failed to serialize column")
}

fn opt_text(value: Option<String>) -> Value {
    value.map(Value::Text).unwrap_or(Value::Null)
}

/// Escape a term for `LIKE ... ESCAPE '\'`
fn like_pattern(term: &str) -> String {
    let escaped = term
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_");
    format!("%{}%", escaped)
}

fn row_to_thread(row: &Row<'_>) -> rusqlite::Result<Thread> {
    let internal_date: i64 = row.get(9)?;
    Ok(Thread {
        owner: row.get(0)?,
        id: ThreadId::new(row.get::<_, String>(1)?),
        history_id: row.get::<_, i64>(2)? as u64,
        snippet: row.get(3)?,
        subject: row.get(4)?,
        from: json_col(row, 5)?,
        to: json_col(row, 6)?,
        cc: json_col(row, 7)?,
        bcc: json_col(row, 8)?,
        internal_date,
        date_parts: DateParts::from_millis(internal_date),
        message_count: row.get::<_, i64>(10)? as usize,
        attachment_count: row.get::<_, i64>(11)? as usize,
        first_message_at: datetime_from_millis(row.get(12)?),
        last_message_at: datetime_from_millis(row.get(13)?),
        label_ids: json_col(row, 14)?,
    })
}

fn row_to_message(row: &Row<'_>) -> rusqlite::Result<Message> {
    let internal_date: i64 = row.get(15)?;
    Ok(Message {
        owner: row.get(0)?,
        id: MessageId::new(row.get::<_, String>(1)?),
        thread_id: ThreadId::new(row.get::<_, String>(2)?),
        history_id: row.get::<_, i64>(3)? as u64,
        snippet: row.get(4)?,
        subject: row.get(5)?,
        headers: json_col(row, 6)?,
        from: json_col(row, 7)?,
        to: json_col(row, 8)?,
        cc: json_col(row, 9)?,
        bcc: json_col(row, 10)?,
        body_text: row.get(11)?,
        body_html: row.get(12)?,
        label_ids: json_col(row, 13)?,
        attachments: json_col(row, 14)?,
        internal_date,
        date_parts: DateParts::from_millis(internal_date),
        decode_errors: json_col(row, 16)?,
    })
}

fn row_to_attachment(row: &Row<'_>) -> rusqlite::Result<Attachment> {
    let mode: String = row.get(9)?;
    let data = match mode.as_str() {
        "inline" => AttachmentData::Inline {
            data: row.get::<_, Option<String>>(10)?.unwrap_or_default(),
        },
        "blob" => AttachmentData::Blob {
            blob: json_col(row, 11)?,
        },
        other => return Err(conversion_error(9, format!("unknown storage mode {}", other))),
    };
    Ok(Attachment {
        owner: row.get(0)?,
        id: row.get(1)?,
        message_id: MessageId::new(row.get::<_, String>(2)?),
        thread_id: ThreadId::new(row.get::<_, String>(3)?),
        part_id: row.get(4)?,
        filename: row.get(5)?,
        mime_type: row.get(6)?,
        size: row.get::<_, i64>(7)? as u64,
        headers: json_col(row, 8)?,
        data,
    })
}

fn row_to_label(row: &Row<'_>) -> rusqlite::Result<Label> {
    Ok(Label {
        owner: row.get(0)?,
        id: LabelId::new(row.get::<_, String>(1)?),
        name: row.get(2)?,
        label_type: LabelType::parse(&row.get::<_, String>(3)?),
        message_list_visibility: row.get(4)?,
        label_list_visibility: row.get(5)?,
        messages_total: row.get(6)?,
        messages_unread: row.get(7)?,
        threads_total: row.get(8)?,
        threads_unread: row.get(9)?,
        background_color: row.get(10)?,
        text_color: row.get(11)?,
    })
}

fn row_to_contact(row: &Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        owner: row.get(0)?,
        resource_name: row.get(1)?,
        first_name: row.get(2)?,
        last_name: row.get(3)?,
        company: row.get(4)?,
        title: row.get(5)?,
        email: row.get(6)?,
        phone: row.get(7)?,
    })
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<SyncRun> {
    let origin: String = row.get(3)?;
    let target: String = row.get(4)?;
    let kind: String = row.get(5)?;
    let parent: Option<i64> = row.get(6)?;
    let status: String = row.get(8)?;

    Ok(SyncRun {
        id: row.get(0)?,
        owner: row.get(1)?,
        query: row.get(2)?,
        origin: RunOrigin::parse(&origin)
            .ok_or_else(|| conversion_error(3, format!("unknown origin {}", origin)))?,
        target: SyncTarget::parse(&target)
            .ok_or_else(|| conversion_error(4, format!("unknown target {}", target)))?,
        kind: RunKind::parse(&kind, parent)
            .ok_or_else(|| conversion_error(5, format!("bad kind {}", kind)))?,
        delete_after_archive: row.get(7)?,
        status: RunStatus::parse(&status)
            .ok_or_else(|| conversion_error(8, format!("unknown status {}", status)))?,
        page_cursor: row.get(9)?,
        next_cursor: row.get(10)?,
        pages_completed: row.get(11)?,
        created_at: time_col(row, 12)?,
        started_at: opt_time_col(row, 13)?,
        ended_at: opt_time_col(row, 14)?,
        thread_count: row.get::<_, i64>(15)? as u64,
        first_message_date: opt_date_col(row, 16)?,
        last_message_date: opt_date_col(row, 17)?,
        anchor_date: opt_date_col(row, 18)?,
        last_error: row.get(19)?,
        failures: json_col(row, 20)?,
    })
}

/// Values for every run column except `id`, in `RUN_COLUMNS` order
fn run_values(run: &SyncRun) -> Result<Vec<Value>> {
    Ok(vec![
        Value::Text(run.owner.clone()),
        Value::Text(run.query.clone()),
        Value::Text(run.origin.as_str().to_string()),
        Value::Text(run.target.as_str().to_string()),
        Value::Text(run.kind.as_str().to_string()),
        run.kind.parent().map(Value::Integer).unwrap_or(Value::Null),
        Value::Integer(run.delete_after_archive as i64),
        Value::Text(run.status.as_str().to_string()),
        opt_text(run.page_cursor.clone()),
        opt_text(run.next_cursor.clone()),
        Value::Integer(run.pages_completed as i64),
        Value::Text(fmt_time(run.created_at)),
        opt_text(run.started_at.map(fmt_time)),
        opt_text(run.ended_at.map(fmt_time)),
        Value::Integer(run.thread_count as i64),
        opt_text(run.first_message_date.map(fmt_date)),
        opt_text(run.last_message_date.map(fmt_date)),
        opt_text(run.anchor_date.map(fmt_date)),
        opt_text(run.last_error.clone()),
        Value::Text(to_json(&run.failures)?),
    ])
}

/// SQLite-based archive storage
///
/// One connection guarded by a mutex; every natural-key write is a single
/// `INSERT ... ON CONFLICT` statement so concurrent writers never duplicate.
pub struct SqliteArchiveStore {
    conn: Mutex<Connection>,
}

impl SqliteArchiveStore {
    /// Open (or create) the archive database at `db_path`
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open database at {:?}", db_path.as_ref()))?;
        Self::from_connection(conn)
    }

    /// In-memory database, mostly for tests
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> Result<Self> {
        // WAL lets readers run during sync writes; NORMAL is safe with WAL
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA cache_size = -64000;
            PRAGMA temp_store = MEMORY;
            PRAGMA mmap_size = 268435456;
            PRAGMA foreign_keys = ON;
            "#,
        )?;
        conn.busy_timeout(Duration::from_secs(5))?;

        migrations()
            .to_latest(&mut conn)
            .context("Failed to run database migrations")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| anyhow!("database connection lock poisoned"))
    }

    fn query_threads(&self, sql: &str, values: Vec<Value>) -> Result<Vec<Thread>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(sql)?;
        let threads = stmt
            .query_map(params_from_iter(values), row_to_thread)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(threads)
    }

    fn query_runs(&self, filter: &str, values: Vec<Value>) -> Result<Vec<SyncRun>> {
        let conn = self.conn()?;
        let sql = format!("SELECT {} FROM sync_runs {}", RUN_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let runs = stmt
            .query_map(params_from_iter(values), row_to_run)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(runs)
    }

    fn count(&self, table: &str, owner: &str, extra: &str) -> Result<u64> {
        let conn = self.conn()?;
        let sql = format!("SELECT COUNT(*) FROM {} WHERE owner = ?1 {}", table, extra);
        let count: i64 = conn.query_row(&sql, [owner], |row| row.get(0))?;
        Ok(count as u64)
    }
}

impl ArchiveStore for SqliteArchiveStore {
    fn upsert_thread(&self, thread: Thread) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let last_message_at = thread.last_message_at.timestamp_millis();

        // ON CONFLICT DO UPDATE keeps the row identity stable
        tx.execute(
            "INSERT INTO threads
             (owner, id, history_id, snippet, subject, from_addrs, to_addrs, cc_addrs,
              bcc_addrs, internal_date, message_count, attachment_count, first_message_at,
              last_message_at, label_ids)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
             ON CONFLICT(owner, id) DO UPDATE SET
                history_id = excluded.history_id,
                snippet = excluded.snippet,
                subject = excluded.subject,
                from_addrs = excluded.from_addrs,
                to_addrs = excluded.to_addrs,
                cc_addrs = excluded.cc_addrs,
                bcc_addrs = excluded.bcc_addrs,
                internal_date = excluded.internal_date,
                message_count = excluded.message_count,
                attachment_count = excluded.attachment_count,
                first_message_at = excluded.first_message_at,
                last_message_at = excluded.last_message_at,
                label_ids = excluded.label_ids",
            params![
                thread.owner,
                thread.id.as_str(),
                thread.history_id as i64,
                thread.snippet,
                thread.subject,
                to_json(&thread.from)?,
                to_json(&thread.to)?,
                to_json(&thread.cc)?,
                to_json(&thread.bcc)?,
                thread.internal_date,
                thread.message_count as i64,
                thread.attachment_count as i64,
                thread.first_message_at.timestamp_millis(),
                last_message_at,
                to_json(&thread.label_ids)?,
            ],
        )?;

        tx.execute(
            "DELETE FROM thread_labels WHERE owner = ?1 AND thread_id = ?2",
            params![thread.owner, thread.id.as_str()],
        )?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO thread_labels (owner, thread_id, label_id, last_message_at)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for label in &thread.label_ids {
                stmt.execute(params![thread.owner, thread.id.as_str(), label, last_message_at])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn get_thread(&self, owner: &str, id: &ThreadId) -> Result<Option<Thread>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM threads t WHERE t.owner = ?1 AND t.id = ?2",
            THREAD_COLUMNS
        );
        let thread = conn
            .query_row(&sql, params![owner, id.as_str()], row_to_thread)
            .optional()?;
        Ok(thread)
    }

    fn list_threads(&self, owner: &str, limit: usize, offset: usize) -> Result<Vec<Thread>> {
        let sql = format!(
            "SELECT {} FROM threads t WHERE t.owner = ?1
             ORDER BY t.last_message_at DESC, t.id LIMIT {} OFFSET {}",
            THREAD_COLUMNS, limit, offset
        );
        self.query_threads(&sql, vec![Value::Text(owner.to_string())])
    }

    fn list_threads_by_label(
        &self,
        owner: &str,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>> {
        let sql = format!(
            "SELECT {} FROM thread_labels tl
             JOIN threads t ON t.owner = tl.owner AND t.id = tl.thread_id
             WHERE tl.owner = ?1 AND tl.label_id = ?2
             ORDER BY tl.last_message_at DESC, t.id LIMIT {} OFFSET {}",
            THREAD_COLUMNS, limit, offset
        );
        self.query_threads(
            &sql,
            vec![Value::Text(owner.to_string()), Value::Text(label.to_string())],
        )
    }

    fn search_threads(
        &self,
        owner: &str,
        search: &ThreadSearch,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>> {
        let terms = search.terms();
        let mut values = vec![Value::Text(owner.to_string())];
        let mut conditions = Vec::new();

        let mut bind = |term: &str| {
            values.push(Value::Text(like_pattern(term)));
            format!("?{}", values.len())
        };

        if let Some(text) = &terms.text {
            let p = bind(text);
            conditions.push(format!(
                "(m.subject LIKE {p} ESCAPE '\\' OR t.snippet LIKE {p} ESCAPE '\\' \
                 OR m.snippet LIKE {p} ESCAPE '\\' OR m.from_addrs LIKE {p} ESCAPE '\\' \
                 OR m.to_addrs LIKE {p} ESCAPE '\\' OR m.body_text LIKE {p} ESCAPE '\\' \
                 OR m.body_html LIKE {p} ESCAPE '\\')"
            ));
        }
        if let Some(from) = &terms.from {
            let p = bind(from);
            conditions.push(format!("m.from_addrs LIKE {p} ESCAPE '\\'"));
        }
        if let Some(to) = &terms.to {
            let p = bind(to);
            conditions.push(format!("m.to_addrs LIKE {p} ESCAPE '\\'"));
        }
        if let Some(subject) = &terms.subject {
            let p = bind(subject);
            conditions.push(format!("m.subject LIKE {p} ESCAPE '\\'"));
        }
        if let Some(body) = &terms.body {
            let p = bind(body);
            conditions.push(format!(
                "(m.body_text LIKE {p} ESCAPE '\\' OR m.body_html LIKE {p} ESCAPE '\\')"
            ));
        }

        let condition = if conditions.is_empty() {
            "1 = 1".to_string()
        } else {
            conditions.join(" AND ")
        };

        let sql = format!(
            "SELECT {} FROM threads t
             WHERE t.owner = ?1 AND EXISTS (
                SELECT 1 FROM messages m
                WHERE m.owner = t.owner AND m.thread_id = t.id AND {}
             )
             ORDER BY t.last_message_at DESC, t.id LIMIT {} OFFSET {}",
            THREAD_COLUMNS, condition, limit, offset
        );
        self.query_threads(&sql, values)
    }

    fn upsert_message(&self, message: Message) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO messages
             (owner, id, thread_id, history_id, snippet, subject, headers, from_addrs,
              to_addrs, cc_addrs, bcc_addrs, body_text, body_html, label_ids, attachments,
              internal_date, decode_errors)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)
             ON CONFLICT(owner, id, thread_id) DO UPDATE SET
                history_id = excluded.history_id,
                snippet = excluded.snippet,
                subject = excluded.subject,
                headers = excluded.headers,
                from_addrs = excluded.from_addrs,
                to_addrs = excluded.to_addrs,
                cc_addrs = excluded.cc_addrs,
                bcc_addrs = excluded.bcc_addrs,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                label_ids = excluded.label_ids,
                attachments = excluded.attachments,
                internal_date = excluded.internal_date,
                decode_errors = excluded.decode_errors",
            params![
                message.owner,
                message.id.as_str(),
                message.thread_id.as_str(),
                message.history_id as i64,
                message.snippet,
                message.subject,
                to_json(&message.headers)?,
                to_json(&message.from)?,
                to_json(&message.to)?,
                to_json(&message.cc)?,
                to_json(&message.bcc)?,
                message.body_text,
                message.body_html,
                to_json(&message.label_ids)?,
                to_json(&message.attachments)?,
                message.internal_date,
                to_json(&message.decode_errors)?,
            ],
        )?;
        Ok(())
    }

    fn get_message(&self, owner: &str, id: &MessageId) -> Result<Option<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE owner = ?1 AND id = ?2 LIMIT 1",
            MESSAGE_COLUMNS
        );
        let message = conn
            .query_row(&sql, params![owner, id.as_str()], row_to_message)
            .optional()?;
        Ok(message)
    }

    fn list_messages_for_thread(&self, owner: &str, thread_id: &ThreadId) -> Result<Vec<Message>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM messages WHERE owner = ?1 AND thread_id = ?2
             ORDER BY internal_date DESC, id",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let messages = stmt
            .query_map(params![owner, thread_id.as_str()], row_to_message)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(messages)
    }

    fn upsert_raw_message(&self, raw: RawMessage) -> Result<()> {
        let json = serde_json::to_vec(&raw).context("Failed to serialize raw message")?;
        let payload = zstd::encode_all(json.as_slice(), 3).context("Failed to compress raw message")?;

        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO raw_messages (owner, id, thread_id, internal_date, payload)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(owner, id, thread_id) DO UPDATE SET
                internal_date = excluded.internal_date,
                payload = excluded.payload",
            params![
                raw.owner,
                raw.id.as_str(),
                raw.thread_id.as_str(),
                raw.internal_date,
                payload,
            ],
        )?;
        Ok(())
    }

    fn get_raw_message(&self, owner: &str, id: &MessageId) -> Result<Option<RawMessage>> {
        let payload: Option<Vec<u8>> = {
            let conn = self.conn()?;
            conn.query_row(
                "SELECT payload FROM raw_messages WHERE owner = ?1 AND id = ?2 LIMIT 1",
                params![owner, id.as_str()],
                |row| row.get(0),
            )
            .optional()?
        };
        payload.map(|p| decode_raw(&p)).transpose()
    }

    fn list_raw_messages_for_thread(
        &self,
        owner: &str,
        thread_id: &ThreadId,
    ) -> Result<Vec<RawMessage>> {
        let payloads: Vec<Vec<u8>> = {
            let conn = self.conn()?;
            let mut stmt = conn.prepare(
                "SELECT payload FROM raw_messages WHERE owner = ?1 AND thread_id = ?2
                 ORDER BY internal_date ASC, id",
            )?;
            stmt.query_map(params![owner, thread_id.as_str()], |row| row.get(0))?
                .collect::<Result<Vec<_>, _>>()?
        };
        payloads.iter().map(|p| decode_raw(p)).collect()
    }

    fn insert_attachment_if_absent(&self, attachment: Attachment) -> Result<bool> {
        let (inline_data, blob_ref) = match &attachment.data {
            AttachmentData::Inline { data } => (Some(data.clone()), None),
            AttachmentData::Blob { blob } => (None, Some(to_json(blob)?)),
        };

        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO attachments
             (owner, id, message_id, thread_id, part_id, filename, mime_type, size, headers,
              storage_mode, inline_data, blob_ref)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(owner, id) DO NOTHING",
            params![
                attachment.owner,
                attachment.id,
                attachment.message_id.as_str(),
                attachment.thread_id.as_str(),
                attachment.part_id,
                attachment.filename,
                attachment.mime_type,
                attachment.size as i64,
                to_json(&attachment.headers)?,
                attachment.storage_mode().as_str(),
                inline_data,
                blob_ref,
            ],
        )?;
        Ok(inserted == 1)
    }

    fn has_attachment(&self, owner: &str, id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM attachments WHERE owner = ?1 AND id = ?2)",
            params![owner, id],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn get_attachment(&self, owner: &str, id: &str) -> Result<Option<Attachment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM attachments WHERE owner = ?1 AND id = ?2",
            ATTACHMENT_COLUMNS
        );
        let attachment = conn
            .query_row(&sql, params![owner, id], row_to_attachment)
            .optional()?;
        Ok(attachment)
    }

    fn list_attachments_for_message(
        &self,
        owner: &str,
        message_id: &MessageId,
    ) -> Result<Vec<Attachment>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM attachments WHERE owner = ?1 AND message_id = ?2 ORDER BY part_id",
            ATTACHMENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let attachments = stmt
            .query_map(params![owner, message_id.as_str()], row_to_attachment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(attachments)
    }

    fn upsert_label(&self, label: Label) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO labels
             (owner, id, name, label_type, message_list_visibility, label_list_visibility,
              messages_total, messages_unread, threads_total, threads_unread,
              background_color, text_color)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(owner, id) DO UPDATE SET
                name = excluded.name,
                label_type = excluded.label_type,
                message_list_visibility = excluded.message_list_visibility,
                label_list_visibility = excluded.label_list_visibility,
                messages_total = excluded.messages_total,
                messages_unread = excluded.messages_unread,
                threads_total = excluded.threads_total,
                threads_unread = excluded.threads_unread,
                background_color = excluded.background_color,
                text_color = excluded.text_color",
            params![
                label.owner,
                label.id.as_str(),
                label.name,
                label.label_type.as_str(),
                label.message_list_visibility,
                label.label_list_visibility,
                label.messages_total,
                label.messages_unread,
                label.threads_total,
                label.threads_unread,
                label.background_color,
                label.text_color,
            ],
        )?;
        Ok(())
    }

    fn ensure_label(&self, label: Label) -> Result<bool> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO labels (owner, id, name, label_type)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(owner, id) DO NOTHING",
            params![
                label.owner,
                label.id.as_str(),
                label.name,
                label.label_type.as_str()
            ],
        )?;
        Ok(inserted == 1)
    }

    fn list_labels(&self, owner: &str) -> Result<Vec<Label>> {
        let conn = self.conn()?;
        let sql = format!(
            "SELECT {} FROM labels WHERE owner = ?1 ORDER BY name",
            LABEL_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let labels = stmt
            .query_map([owner], row_to_label)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(labels)
    }

    fn upsert_contact(&self, contact: Contact) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO contacts
             (owner, resource_name, first_name, last_name, company, title, email, phone)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(owner, resource_name) DO UPDATE SET
                first_name = excluded.first_name,
                last_name = excluded.last_name,
                company = excluded.company,
                title = excluded.title,
                email = excluded.email,
                phone = excluded.phone",
            params![
                contact.owner,
                contact.resource_name,
                contact.first_name,
                contact.last_name,
                contact.company,
                contact.title,
                contact.email,
                contact.phone,
            ],
        )?;
        Ok(())
    }

    fn list_contacts(&self, owner: &str) -> Result<Vec<Contact>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT owner, resource_name, first_name, last_name, company, title, email, phone
             FROM contacts WHERE owner = ?1 ORDER BY last_name, first_name, resource_name",
        )?;
        let contacts = stmt
            .query_map([owner], row_to_contact)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(contacts)
    }

    fn create_sync_run(&self, run: &SyncRun) -> Result<SyncRunId> {
        let values = run_values(run)?;
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO sync_runs
             (owner, query, origin, target, kind, parent_id, delete_after_archive, status,
              page_cursor, next_cursor, pages_completed, created_at, started_at, ended_at,
              thread_count, first_message_date, last_message_date, anchor_date, last_error,
              failures)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16,
                     ?17, ?18, ?19, ?20)",
            params_from_iter(values),
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn save_sync_run(&self, run: &SyncRun) -> Result<()> {
        let mut values = run_values(run)?;
        values.push(Value::Integer(run.id));
        let conn = self.conn()?;
        let updated = conn.execute(
            "UPDATE sync_runs SET
                owner = ?1, query = ?2, origin = ?3, target = ?4, kind = ?5, parent_id = ?6,
                delete_after_archive = ?7, status = ?8, page_cursor = ?9, next_cursor = ?10,
                pages_completed = ?11, created_at = ?12, started_at = ?13, ended_at = ?14,
                thread_count = ?15, first_message_date = ?16, last_message_date = ?17,
                anchor_date = ?18, last_error = ?19, failures = ?20
             WHERE id = ?21",
            params_from_iter(values),
        )?;
        if updated == 0 {
            bail!("sync run {} does not exist", run.id);
        }
        Ok(())
    }

    fn get_sync_run(&self, id: SyncRunId) -> Result<Option<SyncRun>> {
        let runs = self.query_runs("WHERE id = ?1", vec![Value::Integer(id)])?;
        Ok(runs.into_iter().next())
    }

    fn list_sync_runs(&self, owner: &str) -> Result<Vec<SyncRun>> {
        self.query_runs(
            "WHERE owner = ?1 ORDER BY id DESC",
            vec![Value::Text(owner.to_string())],
        )
    }

    fn list_resumable_runs(&self) -> Result<Vec<SyncRun>> {
        self.query_runs(
            "WHERE status IN ('pending', 'running') ORDER BY id",
            Vec::new(),
        )
    }

    fn list_daily_user_runs(&self) -> Result<Vec<SyncRun>> {
        self.query_runs(
            "WHERE origin = 'user' AND kind = 'daily' AND status = 'done' ORDER BY id",
            Vec::new(),
        )
    }

    fn latest_scheduled_run(&self, parent: SyncRunId) -> Result<Option<SyncRun>> {
        let runs = self.query_runs(
            "WHERE kind = 'scheduled' AND parent_id = ?1 ORDER BY id DESC LIMIT 1",
            vec![Value::Integer(parent)],
        )?;
        Ok(runs.into_iter().next())
    }

    fn stats(&self, owner: &str) -> Result<ArchiveStats> {
        Ok(ArchiveStats {
            threads: self.count("threads", owner, "")?,
            messages: self.count("messages", owner, "")?,
            attachments: self.count("attachments", owner, "")?,
            blob_attachments: self.count("attachments", owner, "AND storage_mode = 'blob'")?,
            labels: self.count("labels", owner, "")?,
            contacts: self.count("contacts", owner, "")?,
        })
    }
}

fn decode_raw(payload: &[u8]) -> Result<RawMessage> {
    let json = zstd::decode_all(payload).context("Failed to decompress raw message")?;
    serde_json::from_slice(&json).context("Failed to parse raw message")
}
