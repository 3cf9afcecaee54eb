//! Storage layer for archived mail
//!
//! Structured records live behind [`ArchiveStore`], large attachment bytes
//! behind [`BlobStore`].

mod blob;
mod blob_file;
mod memory;
mod sqlite;
mod traits;

pub use blob::{BlobKey, BlobRef, BlobStore};
pub use blob_file::FileBlobStore;
pub use memory::{InMemoryArchiveStore, InMemoryBlobStore};
pub use sqlite::SqliteArchiveStore;
pub use traits::{ArchiveStats, ArchiveStore, SearchTerms, ThreadSearch};
