//! Message model: a decoded Gmail message as stored in the archive

use std::collections::BTreeMap;

use super::ThreadId;
use chrono::{DateTime, Datelike, NaiveDate, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a message (Gmail message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailAddress {
    pub name: Option<String>,
    pub email: String,
}

impl EmailAddress {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Parse an address like `"Jane Doe" <jane@example.com>` or a bare address
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"').trim();
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: (!name.is_empty()).then(|| name.to_string()),
                email: email.to_string(),
            };
        }

        Self::new(s)
    }

    /// Split a header value holding several addresses.
    ///
    /// Commas inside quoted display names or angle brackets do not split.
    pub fn parse_list(s: &str) -> Vec<Self> {
        let mut out = Vec::new();
        let mut current = String::new();
        let mut in_quotes = false;
        let mut in_angle = false;

        for c in s.chars() {
            match c {
                '"' => in_quotes = !in_quotes,
                '<' if !in_quotes => in_angle = true,
                '>' if !in_quotes => in_angle = false,
                ',' if !in_quotes && !in_angle => {
                    out.push(Self::parse(&current));
                    current.clear();
                    continue;
                }
                _ => {}
            }
            current.push(c);
        }
        out.push(Self::parse(&current));

        out.retain(|addr| !addr.email.is_empty());
        out
    }
}

/// Calendar decomposition of a message timestamp (UTC)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateParts {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `HH:MM:SS`
    pub time: String,
    pub year: i32,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
}

impl DateParts {
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self {
            date: dt.format("%Y-%m-%d").to_string(),
            time: dt.format("%H:%M:%S").to_string(),
            year: dt.year(),
            month: dt.month(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
        }
    }

    /// Decompose Gmail's internal date (milliseconds since epoch)
    pub fn from_millis(millis: i64) -> Self {
        Self::from_datetime(datetime_from_millis(millis))
    }

    pub fn naive_date(&self) -> Option<NaiveDate> {
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

/// Convert milliseconds since epoch to a UTC timestamp, clamping garbage to the epoch
pub fn datetime_from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// A reference to an attachment found while decoding a message.
///
/// The bytes are fetched separately by the attachment persister.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Gmail attachment ID
    pub attachment_id: String,
    /// Part ID within the message (e.g. "1.2")
    pub part_id: String,
    pub filename: String,
    pub mime_type: String,
    /// Size reported by the provider, in bytes
    pub size: u64,
    /// Headers of the MIME part
    pub headers: BTreeMap<String, String>,
}

/// A single decoded email message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Mailbox owner
    pub owner: String,
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub history_id: u64,
    pub snippet: String,
    pub subject: String,
    /// Header name to value; a repeated header keeps its last value
    pub headers: BTreeMap<String, String>,
    /// Lower-cased addresses per role
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
    /// Concatenation of every text/plain part, in encounter order
    pub body_text: String,
    /// Concatenation of every text/html part, in encounter order
    pub body_html: String,
    pub label_ids: Vec<String>,
    pub attachments: Vec<AttachmentRef>,
    /// Gmail's internal timestamp (milliseconds since epoch)
    pub internal_date: i64,
    pub date_parts: DateParts,
    /// Parts that could not be decoded; their bodies hold a placeholder
    #[serde(default)]
    pub decode_errors: Vec<String>,
}

impl Message {
    pub fn builder(
        owner: impl Into<String>,
        id: impl Into<MessageId>,
        thread_id: impl Into<ThreadId>,
    ) -> MessageBuilder {
        MessageBuilder::new(owner.into(), id.into(), thread_id.into())
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        datetime_from_millis(self.internal_date)
    }

    /// Header lookup ignoring case
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builder for [`Message`], mostly used when constructing fixtures
pub struct MessageBuilder {
    message: Message,
}

impl MessageBuilder {
    fn new(owner: String, id: MessageId, thread_id: ThreadId) -> Self {
        Self {
            message: Message {
                owner,
                id,
                thread_id,
                history_id: 0,
                snippet: String::new(),
                subject: String::new(),
                headers: BTreeMap::new(),
                from: Vec::new(),
                to: Vec::new(),
                cc: Vec::new(),
                bcc: Vec::new(),
                body_text: String::new(),
                body_html: String::new(),
                label_ids: Vec::new(),
                attachments: Vec::new(),
                internal_date: 0,
                date_parts: DateParts::from_millis(0),
                decode_errors: Vec::new(),
            },
        }
    }

    pub fn history_id(mut self, history_id: u64) -> Self {
        self.message.history_id = history_id;
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.message.snippet = snippet.into();
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.message.subject = subject.into();
        self
    }

    pub fn from(mut self, from: impl Into<String>) -> Self {
        self.message.from = vec![from.into()];
        self
    }

    pub fn to(mut self, to: Vec<String>) -> Self {
        self.message.to = to;
        self
    }

    pub fn body_text(mut self, text: impl Into<String>) -> Self {
        self.message.body_text = text.into();
        self
    }

    pub fn body_html(mut self, html: impl Into<String>) -> Self {
        self.message.body_html = html.into();
        self
    }

    pub fn label_ids(mut self, labels: Vec<String>) -> Self {
        self.message.label_ids = labels;
        self
    }

    pub fn attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.message.attachments = attachments;
        self
    }

    pub fn internal_date(mut self, millis: i64) -> Self {
        self.message.internal_date = millis;
        self.message.date_parts = DateParts::from_millis(millis);
        self
    }

    pub fn build(self) -> Message {
        self.message
    }
}
