//! Domain models for archived mail entities

mod attachment;
mod contact;
mod label;
mod message;
mod raw;
mod sync_run;
mod thread;

pub use attachment::{Attachment, AttachmentData, StorageMode};
pub use contact::Contact;
pub use label::{Label, LabelId, LabelType};
pub use message::{
    AttachmentRef, DateParts, EmailAddress, Message, MessageBuilder, MessageId,
    datetime_from_millis,
};
pub use raw::{RawBody, RawHeader, RawMessage, RawPart};
pub use sync_run::{
    ItemFailure, PageProgress, RunKind, RunOrigin, RunStatus, SyncRun, SyncRunId, SyncTarget,
    TransitionError, daily_window_query,
};
pub use thread::{Thread, ThreadId};
