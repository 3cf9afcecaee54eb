//! Attachment record with size-tiered storage

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{MessageId, ThreadId};
use crate::storage::BlobRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    Inline,
    Blob,
}

impl StorageMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageMode::Inline => "inline",
            StorageMode::Blob => "blob",
        }
    }
}

/// Where the attachment bytes live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum AttachmentData {
    /// Bytes re-encoded as URL-safe base64 inside the record
    Inline { data: String },
    /// Bytes in chunked blob storage
    Blob { blob: BlobRef },
}

/// An archived attachment, unique per (owner, attachment id)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub owner: String,
    /// Gmail attachment ID
    pub id: String,
    pub message_id: MessageId,
    pub thread_id: ThreadId,
    pub part_id: String,
    pub filename: String,
    pub mime_type: String,
    /// Decoded size in bytes
    pub size: u64,
    pub headers: BTreeMap<String, String>,
    pub data: AttachmentData,
}

impl Attachment {
    pub fn storage_mode(&self) -> StorageMode {
        match self.data {
            AttachmentData::Inline { .. } => StorageMode::Inline,
            AttachmentData::Blob { .. } => StorageMode::Blob,
        }
    }
}
