//! People API client for the owner's contacts

use std::time::Duration;

use url::Url;

use super::ContactRemote;
use super::api::ConnectionsResponse;
use super::client::{ApiTransport, build_url};
use crate::error::RemoteError;

pub struct PeopleClient {
    transport: ApiTransport,
}

impl PeopleClient {
    const BASE_URL: &'static str = "https://people.googleapis.com/v1";

    /// Fields requested for every connection
    const PERSON_FIELDS: &'static str = "emailAddresses,names,phoneNumbers,organizations";

    const PAGE_SIZE: &'static str = "100";

    pub fn new(access_token: impl Into<String>, timeout: Duration) -> Self {
        Self {
            transport: ApiTransport::new(access_token.into(), timeout),
        }
    }

    fn connections_url(page_token: Option<&str>) -> Result<Url, RemoteError> {
        let mut params = vec![
            ("personFields", Self::PERSON_FIELDS),
            ("pageSize", Self::PAGE_SIZE),
        ];
        if let Some(token) = page_token.filter(|t| !t.is_empty()) {
            params.push(("pageToken", token));
        }
        build_url(Self::BASE_URL, "/people/me/connections", &params)
    }
}

impl ContactRemote for PeopleClient {
    fn list_connections(
        &self,
        page_token: Option<&str>,
    ) -> Result<ConnectionsResponse, RemoteError> {
        let url = Self::connections_url(page_token)?;
        self.transport.get_json(&url)
    }
}
