//! Verbatim mirror of a remote message payload
//!
//! Kept so bodies can be re-decoded later without fetching from Gmail again.
//! These types are owned by the archive; the wire structs in `gmail::api`
//! are mapped onto them in `gmail::normalize`.

use serde::{Deserialize, Serialize};

use super::{MessageId, ThreadId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawMessage {
    pub owner: String,
    pub id: MessageId,
    pub thread_id: ThreadId,
    pub history_id: u64,
    pub internal_date: i64,
    pub label_ids: Vec<String>,
    pub snippet: String,
    pub size_estimate: u64,
    pub payload: RawPart,
}

/// One node of the MIME part tree
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPart {
    pub part_id: String,
    pub mime_type: String,
    pub filename: String,
    pub headers: Vec<RawHeader>,
    pub body: RawBody,
    pub parts: Vec<RawPart>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawBody {
    /// Set when the body has to be fetched separately
    pub attachment_id: Option<String>,
    pub size: u64,
    /// Base64 (usually URL-safe) encoded inline data
    pub data: Option<String>,
}

impl RawPart {
    pub fn is_container(&self) -> bool {
        !self.parts.is_empty()
    }
}
