//! Read-side queries over the archive
//!
//! Shapes stored records for the CLI and any browsing front end.

mod threads;

pub use threads::{
    AttachmentSummary, ThreadDetail, ThreadSummary, get_thread_detail, list_threads,
    list_threads_by_label, search_threads,
};
