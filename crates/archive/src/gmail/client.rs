//! Gmail API HTTP client
//!
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Every request
//! carries a global timeout; HTTP status codes are classified into
//! [`RemoteError`] kinds instead of being surfaced as transport errors.

use std::time::Duration;

use serde::de::DeserializeOwned;
use ureq::Agent;
use url::Url;

use super::api::{AttachmentBody, GmailLabel, GmailThread, ListLabelsResponse, ListThreadsResponse};
use super::{LabelRemote, MailRemote};
use crate::error::RemoteError;

/// Largest response body we are willing to buffer (attachments are capped at 25MB)
const MAX_BODY_BYTES: u64 = 64 * 1024 * 1024;

/// Authorized JSON-over-HTTP plumbing shared by the Gmail and People clients
pub(crate) struct ApiTransport {
    agent: Agent,
    access_token: String,
}

impl ApiTransport {
    pub(crate) fn new(access_token: String, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .http_status_as_error(false)
            .build();
        Self {
            agent: Agent::new_with_config(config),
            access_token,
        }
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.access_token)
    }

    pub(crate) fn get_json<T: DeserializeOwned>(&self, url: &Url) -> Result<T, RemoteError> {
        let mut response = self
            .agent
            .get(url.as_str())
            .header("Authorization", &self.bearer())
            .call()
            .map_err(classify)?;

        let status = response.status().as_u16();
        let body = response
            .body_mut()
            .with_config()
            .limit(MAX_BODY_BYTES)
            .read_to_string()
            .map_err(classify)?;

        if !(200..300).contains(&status) {
            return Err(status_error(status, &body));
        }

        serde_json::from_str(&body)
            .map_err(|e| RemoteError::Fatal(format!("invalid response from {}: {}", url.path(), e)))
    }

    pub(crate) fn delete(&self, url: &Url) -> Result<(), RemoteError> {
        let mut response = self
            .agent
            .delete(url.as_str())
            .header("Authorization", &self.bearer())
            .call()
            .map_err(classify)?;

        let status = response.status().as_u16();
        if (200..300).contains(&status) {
            return Ok(());
        }
        let body = response.body_mut().read_to_string().unwrap_or_default();
        Err(status_error(status, &body))
    }
}

/// Map a non-2xx status to an error kind
pub(crate) fn status_error(status: u16, body: &str) -> RemoteError {
    let detail: String = body.chars().take(200).collect();
    match status {
        429 => RemoteError::RateLimited,
        403 if body.contains("rateLimitExceeded") || body.contains("userRateLimitExceeded") => {
            RemoteError::RateLimited
        }
        404 => RemoteError::NotFound(detail),
        408 | 500..=599 => RemoteError::Transient(format!("HTTP {}: {}", status, detail)),
        _ => RemoteError::Fatal(format!("HTTP {}: {}", status, detail)),
    }
}

/// Transport failures (timeouts, DNS, resets) are worth one more try
fn classify(err: ureq::Error) -> RemoteError {
    match err {
        ureq::Error::StatusCode(status) => status_error(status, ""),
        other => RemoteError::Transient(other.to_string()),
    }
}

pub(crate) fn build_url(base: &str, path: &str, params: &[(&str, &str)]) -> Result<Url, RemoteError> {
    Url::parse_with_params(&format!("{}{}", base, path), params)
        .map_err(|e| RemoteError::Fatal(format!("invalid request URL: {}", e)))
}

/// Gmail API client for one authorized mailbox
pub struct GmailClient {
    transport: ApiTransport,
    page_size: u32,
}

impl GmailClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    pub fn new(access_token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport: ApiTransport::new(access_token.into(), timeout),
            page_size: 100,
        }
    }

    /// Threads per listing page (1-500)
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, 500);
        self
    }

    fn threads_url(&self, query: &str, page_token: Option<&str>) -> Result<Url, RemoteError> {
        let page_size = self.page_size.to_string();
        let mut params = vec![("maxResults", page_size.as_str())];
        if !query.is_empty() {
            params.push(("q", query));
        }
        if let Some(token) = page_token.filter(|t| !t.is_empty()) {
            params.push(("pageToken", token));
        }
        build_url(Self::BASE_URL, "/users/me/threads", &params)
    }
}

impl MailRemote for GmailClient {
    fn list_threads(
        &self,
        query: &str,
        page_token: Option<&str>,
    ) -> Result<ListThreadsResponse, RemoteError> {
        let url = self.threads_url(query, page_token)?;
        self.transport.get_json(&url)
    }

    fn get_thread(&self, id: &str) -> Result<GmailThread, RemoteError> {
        let path = format!("/users/me/threads/{}", urlencoding::encode(id));
        let url = build_url(Self::BASE_URL, &path, &[("format", "full")])?;
        self.transport.get_json(&url)
    }

    fn get_attachment(
        &self,
        message_id: &str,
        attachment_id: &str,
    ) -> Result<AttachmentBody, RemoteError> {
        let path = format!(
            "/users/me/messages/{}/attachments/{}",
            urlencoding::encode(message_id),
            urlencoding::encode(attachment_id)
        );
        let url = build_url(Self::BASE_URL, &path, &[])?;
        self.transport.get_json(&url)
    }

    fn delete_message(&self, id: &str) -> Result<(), RemoteError> {
        let path = format!("/users/me/messages/{}", urlencoding::encode(id));
        let url = build_url(Self::BASE_URL, &path, &[])?;
        self.transport.delete(&url)
    }
}

impl LabelRemote for GmailClient {
    fn list_labels(&self) -> Result<ListLabelsResponse, RemoteError> {
        let url = build_url(Self::BASE_URL, "/users/me/labels", &[])?;
        self.transport.get_json(&url)
    }

    fn get_label(&self, id: &str) -> Result<GmailLabel, RemoteError> {
        let path = format!("/users/me/labels/{}", urlencoding::encode(id));
        let url = build_url(Self::BASE_URL, &path, &[])?;
        self.transport.get_json(&url)
    }
}
