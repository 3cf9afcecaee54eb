//! Configuration for the archiver
//!
//! Two things are loaded from the config directory:
//! - [`GmailCredentials`]: the OAuth client used to refresh tokens, from
//!   compile-time env, `google-credentials.json`, or runtime env vars.
//! - [`ArchiveSettings`]: tunables in `archive.json`; every field has a default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// OAuth credentials for Gmail API access
#[derive(Debug, Clone)]
pub struct GmailCredentials {
    pub client_id: String,
    pub client_secret: String,
}

/// Google Cloud Console credential file format
#[derive(Deserialize)]
struct GoogleCredentialFile {
    installed: Option<InstalledCredentials>,
    web: Option<InstalledCredentials>,
}

#[derive(Deserialize)]
struct InstalledCredentials {
    client_id: String,
    client_secret: String,
}

impl GmailCredentials {
    /// Compile-time env, then the credentials file, then runtime env vars
    pub fn load() -> Result<Self> {
        if let Some(creds) = Self::from_compile_time() {
            return Ok(creds);
        }

        if let Some(path) = config::credentials_path()
            && let Some(creds) = config::load_optional::<GoogleCredentialFile>(&path)?
        {
            return Self::from_credential_file(creds);
        }

        Self::from_env()
    }

    /// Build with: GOOGLE_CLIENT_ID=xxx GOOGLE_CLIENT_SECRET=yyy cargo build --release
    pub fn from_compile_time() -> Option<Self> {
        let client_id = option_env!("GOOGLE_CLIENT_ID")?;
        let client_secret = option_env!("GOOGLE_CLIENT_SECRET")?;
        if client_id.is_empty() || client_secret.is_empty() {
            return None;
        }
        Some(Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
        })
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let creds: GoogleCredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(creds)
    }

    fn from_credential_file(creds: GoogleCredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let installed = creds
            .installed
            .or(creds.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: installed.client_id,
            client_secret: installed.client_secret,
        })
    }

    /// Parse credentials from JSON string (Google Cloud Console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let creds: GoogleCredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(creds)
    }

    pub fn from_env() -> Result<Self> {
        let client_id = std::env::var("GMAIL_CLIENT_ID")
            .context("GMAIL_CLIENT_ID environment variable not set")?;
        let client_secret = std::env::var("GMAIL_CLIENT_SECRET")
            .context("GMAIL_CLIENT_SECRET environment variable not set")?;

        Ok(Self {
            client_id,
            client_secret,
        })
    }
}

/// Archiver tunables
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveSettings {
    /// Where the database and blobs live; defaults to the config directory
    pub data_dir: Option<PathBuf>,
    /// Size of the per-page worker pool
    pub worker_threads: usize,
    /// Attachments larger than this many decoded bytes go to blob storage
    pub inline_attachment_limit: usize,
    pub blob_chunk_size: usize,
    pub schedule_interval_secs: u64,
    /// Pause before the single retry of a rate-limited call
    pub rate_limit_backoff_ms: u64,
    pub http_timeout_secs: u64,
    /// Refresh tokens expiring within this window
    pub token_refresh_window_secs: u64,
    /// Threads per listing page
    pub page_size: u32,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            data_dir: None,
            worker_threads: 8,
            inline_attachment_limit: 150_000,
            blob_chunk_size: 255 * 1024,
            schedule_interval_secs: 24 * 60 * 60,
            rate_limit_backoff_ms: 1000,
            http_timeout_secs: 60,
            token_refresh_window_secs: 2 * 60 * 60,
            page_size: 100,
        }
    }
}

impl ArchiveSettings {
    /// `archive.json` from the config directory, or defaults if it is absent
    pub fn load() -> Result<Self> {
        let settings = match config::settings_path() {
            Some(path) => config::load_optional(&path)?,
            None => None,
        };
        Ok(settings.unwrap_or_default())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        config::load_json_file(path)
    }

    /// Resolved data directory
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => config::home().context("Could not determine the archiver home directory"),
        }
    }

    pub fn schedule_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_interval_secs)
    }

    pub fn rate_limit_backoff(&self) -> Duration {
        Duration::from_millis(self.rate_limit_backoff_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn token_refresh_window(&self) -> Duration {
        Duration::from_secs(self.token_refresh_window_secs)
    }
}
