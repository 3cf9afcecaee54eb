//! Blob storage for attachment bytes too large to keep inline
//!
//! Large values are written as a sequence of fixed-size chunks. The
//! resulting [`BlobRef`] is stored on the attachment record and is all that
//! is needed to read the bytes back.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};

/// Identifies one blob within an owner's namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlobKey {
    pub owner: String,
    /// File-name-safe identifier, e.g. `18c2f0a1b2.att.1-2`
    pub name: String,
}

impl BlobKey {
    /// Key for the attachment in part `part_id` of message `message_id`
    pub fn attachment(owner: &str, message_id: &str, part_id: &str) -> Self {
        let part = if part_id.is_empty() { "0" } else { part_id };
        Self {
            owner: owner.to_string(),
            name: format!("{}.att.{}", sanitize(message_id), sanitize(part)),
        }
    }
}

/// Replace anything that is not safe in a file name
pub(crate) fn sanitize(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '@' | '-' | '_') {
                c
            } else if c == '.' {
                '-'
            } else {
                '_'
            }
        })
        .collect()
}

/// What an attachment record keeps to locate its blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRef {
    pub key: BlobKey,
    pub chunk_count: u32,
    pub chunk_size: u32,
    /// Total length in bytes
    pub length: u64,
}

/// Trait for chunked blob storage
///
/// Implementations only deal with individual chunks; splitting and
/// reassembly is shared in [`BlobStore::put`] and [`BlobStore::get`].
pub trait BlobStore: Send + Sync {
    /// Store one chunk, replacing an existing chunk with the same index
    fn put_chunk(&self, key: &BlobKey, index: u32, data: &[u8]) -> Result<()>;

    /// Read one chunk, `None` if it was never written
    fn get_chunk(&self, key: &BlobKey, index: u32) -> Result<Option<Vec<u8>>>;

    /// Remove every chunk of a blob
    fn delete(&self, key: &BlobKey) -> Result<()>;

    /// Split `data` into sequential chunks of `chunk_size` bytes and store them
    fn put(&self, key: &BlobKey, data: &[u8], chunk_size: usize) -> Result<BlobRef> {
        let chunk_size = chunk_size.max(1);
        let mut chunk_count = 0u32;
        for (index, chunk) in data.chunks(chunk_size).enumerate() {
            self.put_chunk(key, index as u32, chunk)?;
            chunk_count += 1;
        }
        Ok(BlobRef {
            key: key.clone(),
            chunk_count,
            chunk_size: chunk_size as u32,
            length: data.len() as u64,
        })
    }

    /// Reassemble a blob; `None` if its first chunk is missing
    fn get(&self, blob: &BlobRef) -> Result<Option<Vec<u8>>> {
        let mut data = Vec::with_capacity(blob.length as usize);
        for index in 0..blob.chunk_count {
            match self.get_chunk(&blob.key, index)? {
                Some(chunk) => data.extend_from_slice(&chunk),
                None if index == 0 => return Ok(None),
                None => bail!(
                    "blob {} is missing chunk {} of {}",
                    blob.key.name,
                    index,
                    blob.chunk_count
                ),
            }
        }
        if data.len() as u64 != blob.length {
            bail!(
                "blob {} has {} bytes, expected {}",
                blob.key.name,
                data.len(),
                blob.length
            );
        }
        Ok(Some(data))
    }
}
