//! Archiver home directory layout and JSON file helpers
//!
//! ```text
//! ~/.config/mail-archive/          (or $MAIL_ARCHIVE_HOME)
//!   archive.json                   settings, every field optional
//!   google-credentials.json        OAuth client from the Cloud Console
//!   tokens/<owner>.json            one OAuth token per mailbox, mode 0600
//! ```
//!
//! Call [`init`] at startup so the directories exist before anything is saved.

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Directory name under the platform config dir
const APP_DIR: &str = "mail-archive";

/// Environment variable that overrides the home directory
pub const HOME_ENV: &str = "MAIL_ARCHIVE_HOME";

pub const SETTINGS_FILE: &str = "archive.json";
pub const CREDENTIALS_FILE: &str = "google-credentials.json";
pub const TOKENS_DIR: &str = "tokens";

/// Create the home and token directories; returns the home path
pub fn init() -> Result<PathBuf> {
    let home = home_dir()?;
    create_dir(&home.join(TOKENS_DIR))?;
    Ok(home)
}

/// `$MAIL_ARCHIVE_HOME`, else `<platform config dir>/mail-archive`
pub fn home() -> Option<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(home));
    }
    dirs::config_dir().map(|p| p.join(APP_DIR))
}

/// [`home`], created if missing
pub fn home_dir() -> Result<PathBuf> {
    let dir = home().context("Could not determine the archiver home directory")?;
    create_dir(&dir)?;
    Ok(dir)
}

pub fn settings_path() -> Option<PathBuf> {
    home().map(|p| p.join(SETTINGS_FILE))
}

pub fn credentials_path() -> Option<PathBuf> {
    home().map(|p| p.join(CREDENTIALS_FILE))
}

pub fn tokens_dir() -> Option<PathBuf> {
    home().map(|p| p.join(TOKENS_DIR))
}

/// File name for an owner's token. Path separators become `_`.
pub fn token_file_name(owner: &str) -> String {
    let name: String = owner
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    format!("{}.json", name)
}

/// Parse a JSON file
pub fn load_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Parse a JSON file, `None` if it does not exist
pub fn load_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(content) => serde_json::from_str(&content)
            .map(Some)
            .with_context(|| format!("Failed to parse {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Write pretty JSON through a temporary sibling and rename it into place
pub fn save_json_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, value, false)
}

/// Like [`save_json_file`], readable by the current user only (tokens)
pub fn save_private_file<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    write_atomic(path, value, true)
}

fn write_atomic<T: Serialize>(path: &Path, value: &T, private: bool) -> Result<()> {
    if let Some(parent) = path.parent() {
        create_dir(parent)?;
    }
    let content = serde_json::to_string_pretty(value)?;
    let temp_path = path.with_extension("tmp");
    std::fs::write(&temp_path, content)
        .with_context(|| format!("Failed to write {}", temp_path.display()))?;
    if private {
        restrict_to_owner(&temp_path)?;
    }
    std::fs::rename(&temp_path, path)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

#[cfg(unix)]
fn restrict_to_owner(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_to_owner(_path: &Path) -> Result<()> {
    Ok(())
}

fn create_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create directory {}", dir.display()))
}
