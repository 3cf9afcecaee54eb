//! Gmail and People API integration
//!
//! This module provides:
//! - Wire DTOs for the Gmail and People APIs
//! - Remote client traits the sync engine depends on
//! - HTTP clients, token refresh and response normalization
//! - MIME part decoding into text/HTML bodies and attachment references
//! - An in-memory mailbox used by tests

mod auth;
mod client;
mod decode;
mod memory;
mod normalize;
mod people;

pub use auth::{
    FileTokenStore, GmailClientProvider, GoogleTokenEndpoint, StoredToken, TokenEndpoint,
    TokenRefresher, TokenStore, needs_refresh,
};
pub use client::GmailClient;
pub use decode::{MessageDecoder, decode_base64};
pub use memory::{InMemoryMailbox, fixtures};
pub use normalize::{normalize_contact, normalize_label, normalize_message};
pub use people::PeopleClient;

use crate::error::RemoteError;

/// Gmail and People API response types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from listing threads
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListThreadsResponse {
        #[serde(default)]
        pub threads: Vec<ThreadRef>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Thread summary as it appears in a listing
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ThreadRef {
        pub id: String,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub history_id: String,
    }

    /// Full thread with messages (format=full)
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailThread {
        pub id: String,
        #[serde(default)]
        pub history_id: String,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub messages: Vec<GmailMessage>,
    }

    /// Full message from Gmail API
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailMessage {
        pub id: String,
        pub thread_id: String,
        #[serde(default)]
        pub label_ids: Vec<String>,
        #[serde(default)]
        pub snippet: String,
        #[serde(default)]
        pub history_id: String,
        /// Milliseconds since epoch, as a decimal string
        #[serde(default)]
        pub internal_date: String,
        #[serde(default)]
        pub size_estimate: u64,
        pub payload: Option<MessagePart>,
    }

    /// One node of the MIME part tree; the payload root is a part too
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        #[serde(default)]
        pub part_id: String,
        #[serde(default)]
        pub mime_type: String,
        #[serde(default)]
        pub filename: String,
        #[serde(default)]
        pub headers: Vec<Header>,
        #[serde(default)]
        pub body: PartBody,
        #[serde(default)]
        pub parts: Vec<MessagePart>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Part body: inline data, or an attachment id to fetch separately
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PartBody {
        pub attachment_id: Option<String>,
        #[serde(default)]
        pub size: u64,
        pub data: Option<String>,
    }

    /// Response from messages.attachments.get
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct AttachmentBody {
        #[serde(default)]
        pub size: u64,
        #[serde(default)]
        pub data: String,
    }

    /// Response from listing labels
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct ListLabelsResponse {
        #[serde(default)]
        pub labels: Vec<GmailLabel>,
    }

    /// Label from Gmail API; counts and colors only come from labels.get
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct GmailLabel {
        pub id: String,
        #[serde(default)]
        pub name: String,
        #[serde(rename = "type")]
        pub label_type: Option<String>,
        pub message_list_visibility: Option<String>,
        pub label_list_visibility: Option<String>,
        pub messages_total: Option<u32>,
        pub messages_unread: Option<u32>,
        pub threads_total: Option<u32>,
        pub threads_unread: Option<u32>,
        pub color: Option<LabelColor>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct LabelColor {
        pub background_color: Option<String>,
        pub text_color: Option<String>,
    }

    /// Response from people.connections.list
    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ConnectionsResponse {
        #[serde(default)]
        pub connections: Vec<Person>,
        pub next_page_token: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct Person {
        pub resource_name: String,
        #[serde(default)]
        pub names: Vec<PersonName>,
        #[serde(default)]
        pub email_addresses: Vec<PersonEmail>,
        #[serde(default)]
        pub phone_numbers: Vec<PersonPhone>,
        #[serde(default)]
        pub organizations: Vec<PersonOrganization>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PersonName {
        pub given_name: Option<String>,
        pub family_name: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct PersonEmail {
        pub value: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct PersonPhone {
        pub value: Option<String>,
        pub canonical_form: Option<String>,
    }

    #[derive(Debug, Clone, Default, Serialize, Deserialize)]
    pub struct PersonOrganization {
        pub name: Option<String>,
        pub title: Option<String>,
    }
}

/// Remote mailbox operations used by the sync engine
pub trait MailRemote: Send + Sync {
    /// One page of threads matching `query`; `page_token` None means the first page
    fn list_threads(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<api::ListThreadsResponse, RemoteError>;

    fn get_thread(&self, id: &str) -> Result<api::GmailThread, RemoteError>;

    fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<api::AttachmentBody, RemoteError>;

    /// Permanently delete a message
    fn delete_message(&self, id: &str) -> Result<(), RemoteError>;
}

pub trait LabelRemote: Send + Sync {
    /// Label ids and names only
    fn list_labels(&self) -> Result<api::ListLabelsResponse, RemoteError>;

    /// Full label detail including counts and colors
    fn get_label(&self, id: &str) -> Result<api::GmailLabel, RemoteError>;
}

pub trait ContactRemote: Send + Sync {
    fn list_connections(
        &self,
        page_token: Option<&str>,
    ) -> Result<api::ConnectionsResponse, RemoteError>;
}

/// Creates authorized remote clients for an owner
///
/// Called once per page so a long run always works with a fresh token.
pub trait ClientProvider: Send + Sync {
    fn mail(&self, owner: &str) -> anyhow::Result<Box<dyn MailRemote>>;

    fn labels(&self, owner: &str) -> anyhow::Result<Box<dyn LabelRemote>>;

    fn contacts(&self, owner: &str) -> anyhow::Result<Box<dyn ContactRemote>>;
}
