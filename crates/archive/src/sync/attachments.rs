//! Attachment download and size-tiered storage

use std::time::Duration;

use base64::prelude::*;

use super::lister::with_retry;
use crate::error::SyncError;
use crate::gmail::{MailRemote, decode_base64};
use crate::models::{Attachment, AttachmentData, AttachmentRef, Message};
use crate::storage::{ArchiveStore, BlobKey, BlobStore};

/// What happened to one attachment reference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    /// A record already existed; nothing was fetched
    Skipped,
    Inline,
    Blob,
}

pub struct AttachmentPersister<'a> {
    store: &'a dyn ArchiveStore,
    blobs: &'a dyn BlobStore,
    remote: &'a dyn MailRemote,
    inline_limit: usize,
    chunk_size: usize,
    backoff: Duration,
}

impl<'a> AttachmentPersister<'a> {
    pub fn new(
        store: &'a dyn ArchiveStore,
        blobs: &'a dyn BlobStore,
        remote: &'a dyn MailRemote,
    ) -> Self {
        Self {
            store,
            blobs,
            remote,
            inline_limit: 150_000,
            chunk_size: 255 * 1024,
            backoff: Duration::from_secs(1),
        }
    }

    pub fn with_limits(mut self, inline_limit: usize, chunk_size: usize) -> Self {
        self.inline_limit = inline_limit;
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Store one referenced attachment unless it is already archived
    ///
    /// Undecodable data is [`SyncError::Fatal`] and leaves no record behind,
    /// so a later run fetches it again.
    pub fn persist(
        &self,
        message: &Message,
        reference: &AttachmentRef,
    ) -> Result<PersistOutcome, SyncError> {
        let owner = message.owner.as_str();
        if self
            .store
            .has_attachment(owner, &reference.attachment_id)
            .map_err(SyncError::persistence)?
        {
            return Ok(PersistOutcome::Skipped);
        }

        let body = with_retry(self.backoff, "attachment fetch", || {
            self.remote
                .get_attachment(message.id.as_str(), &reference.attachment_id)
        })?;

        let bytes = decode_base64(&body.data).map_err(|e| {
            SyncError::Fatal(format!(
                "attachment {} of message {} is undecodable: {}",
                reference.attachment_id, message.id, e
            ))
        })?;

        let (data, outcome) = if bytes.len() > self.inline_limit {
            let key = BlobKey::attachment(owner, message.id.as_str(), &reference.part_id);
            let blob = self
                .blobs
                .put(&key, &bytes, self.chunk_size)
                .map_err(SyncError::persistence)?;
            (AttachmentData::Blob { blob }, PersistOutcome::Blob)
        } else {
            let data = BASE64_URL_SAFE.encode(&bytes);
            (AttachmentData::Inline { data }, PersistOutcome::Inline)
        };

        let inserted = self
            .store
            .insert_attachment_if_absent(Attachment {
                owner: owner.to_string(),
                id: reference.attachment_id.clone(),
                message_id: message.id.clone(),
                thread_id: message.thread_id.clone(),
                part_id: reference.part_id.clone(),
                filename: reference.filename.clone(),
                mime_type: reference.mime_type.clone(),
                size: bytes.len() as u64,
                headers: reference.headers.clone(),
                data,
            })
            .map_err(SyncError::persistence)?;

        if !inserted {
            log::debug!(
                "Attachment {} was archived concurrently",
                reference.attachment_id
            );
            return Ok(PersistOutcome::Skipped);
        }
        Ok(outcome)
    }
}
