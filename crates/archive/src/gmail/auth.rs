//! OAuth2 token storage and refresh
//!
//! Tokens are obtained out of band (see `archiver token import`) and stored
//! per owner. Before clients are created for a page, the stored token is
//! refreshed if it expires within the configured window.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use ureq::Agent;

use super::{ClientProvider, ContactRemote, GmailClient, LabelRemote, MailRemote, PeopleClient};
use crate::config::GmailCredentials;

/// Stored token data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix seconds; `None` means the token does not expire
    pub expires_at: Option<i64>,
}

/// Token response from Google
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: Option<u64>,
}

/// Persistence for per-owner tokens
pub trait TokenStore: Send + Sync {
    fn load(&self, owner: &str) -> Result<Option<StoredToken>>;

    fn save(&self, owner: &str, token: &StoredToken) -> Result<()>;
}

/// One JSON file per owner: `<dir>/<owner>.json`
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// `tokens/` inside the config directory
    pub fn default_location() -> Result<Self> {
        let dir = config::tokens_dir().context("Could not determine the archiver home directory")?;
        Ok(Self::new(dir))
    }

    fn path(&self, owner: &str) -> PathBuf {
        self.dir.join(config::token_file_name(owner))
    }
}

impl TokenStore for FileTokenStore {
    fn load(&self, owner: &str) -> Result<Option<StoredToken>> {
        config::load_optional(&self.path(owner))
    }

    fn save(&self, owner: &str, token: &StoredToken) -> Result<()> {
        config::save_private_file(&self.path(owner), token)
    }
}

/// Exchanges a refresh token for a new access token
pub trait TokenEndpoint: Send + Sync {
    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse>;
}

/// Google's OAuth2 token endpoint
pub struct GoogleTokenEndpoint {
    credentials: GmailCredentials,
    agent: Agent,
}

impl GoogleTokenEndpoint {
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    pub fn new(credentials: GmailCredentials, timeout: Duration) -> Self {
        let config = Agent::config_builder()
            .timeout_global(Some(timeout))
            .build();
        Self {
            credentials,
            agent: Agent::new_with_config(config),
        }
    }
}

impl TokenEndpoint for GoogleTokenEndpoint {
    fn refresh(&self, refresh_token: &str) -> Result<TokenResponse> {
        let mut response = self
            .agent
            .post(Self::TOKEN_URL)
            .send_form([
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .context("Failed to refresh access token")?;

        let token: TokenResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse refresh token response")?;
        Ok(token)
    }
}

/// Whether a token expiring at `expires_at` must be refreshed at `now`
pub fn needs_refresh(expires_at: Option<i64>, now: i64, window_secs: i64) -> bool {
    match expires_at {
        Some(expires_at) => expires_at - now <= window_secs,
        None => false,
    }
}

pub struct TokenRefresher {
    store: Arc<dyn TokenStore>,
    endpoint: Arc<dyn TokenEndpoint>,
    window: Duration,
}

impl TokenRefresher {
    pub fn new(store: Arc<dyn TokenStore>, endpoint: Arc<dyn TokenEndpoint>, window: Duration) -> Self {
        Self {
            store,
            endpoint,
            window,
        }
    }

    /// A usable access token for `owner`, refreshing and persisting it if needed
    pub fn valid_token(&self, owner: &str) -> Result<String> {
        let token = self
            .store
            .load(owner)?
            .with_context(|| format!("No token stored for {}", owner))?;

        let now = chrono::Utc::now().timestamp();
        if !needs_refresh(token.expires_at, now, self.window.as_secs() as i64) {
            return Ok(token.access_token);
        }

        let Some(refresh_token) = token.refresh_token.clone() else {
            bail!("Token for {} is expiring and has no refresh token", owner);
        };

        log::info!("[AUTH] Refreshing access token for {}", owner);
        let response = self
            .endpoint
            .refresh(&refresh_token)
            .with_context(|| format!("Token refresh failed for {}", owner))?;

        // Preserve the refresh token if not returned
        let refreshed = StoredToken {
            access_token: response.access_token,
            refresh_token: response.refresh_token.or(Some(refresh_token)),
            expires_at: response.expires_in.map(|secs| now + secs as i64),
        };
        self.store.save(owner, &refreshed)?;
        Ok(refreshed.access_token)
    }
}

/// Builds Gmail and People clients with a freshly validated token
pub struct GmailClientProvider {
    refresher: TokenRefresher,
    timeout: Duration,
    page_size: u32,
}

impl GmailClientProvider {
    pub fn new(refresher: TokenRefresher, timeout: Duration, page_size: u32) -> Self {
        Self {
            refresher,
            timeout,
            page_size,
        }
    }

    fn gmail(&self, owner: &str) -> Result<GmailClient> {
        let token = self.refresher.valid_token(owner)?;
        Ok(GmailClient::new(token, self.timeout).with_page_size(self.page_size))
    }
}

impl ClientProvider for GmailClientProvider {
    fn mail(&self, owner: &str) -> Result<Box<dyn MailRemote>> {
        Ok(Box::new(self.gmail(owner)?))
    }

    fn labels(&self, owner: &str) -> Result<Box<dyn LabelRemote>> {
        Ok(Box::new(self.gmail(owner)?))
    }

    fn contacts(&self, owner: &str) -> Result<Box<dyn ContactRemote>> {
        let token = self.refresher.valid_token(owner)?;
        Ok(Box::new(PeopleClient::new(token, self.timeout)))
    }
}
