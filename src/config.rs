//! Runtime configuration, read once from the environment.

use std::path::PathBuf;

use anyhow::{anyhow, Result};

use crate::graph::GRAPH_API_BASE;

const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com/consumers";

/// Everything the sync job needs from its environment.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Azure AD public-client application id.
    pub client_id: String,
    /// OAuth authority URL (tenant or `consumers`).
    pub authority: String,
    /// Contact address the mailbox query is restricted to. `None` disables
    /// the server-side contact filter entirely.
    pub target_email: Option<String>,
    /// When set, only flagged messages seed the sync and their conversations
    /// are expanded afterwards.
    pub flagged_only: bool,
    /// Path of the SQLite document store.
    pub db_path: PathBuf,
    /// Graph API base URL, overridable for tests.
    pub graph_api_base: String,
    /// Cloudinary credentials; `None` disables uploads (inline images fall
    /// back to placeholders).
    pub cloudinary: Option<CloudinaryConfig>,
}

#[derive(Debug, Clone)]
pub struct CloudinaryConfig {
    pub cloud_name: String,
    pub api_key: String,
    pub api_secret: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let client_id = env_var("MTS_CLIENT_ID")
            .ok_or_else(|| anyhow!("missing mail account client id (MTS_CLIENT_ID)"))?;

        let db_path = match env_var("MTS_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        Ok(Self {
            client_id,
            authority: env_var("MTS_AUTHORITY").unwrap_or_else(|| DEFAULT_AUTHORITY.to_string()),
            target_email: env_var("MTS_TARGET_EMAIL"),
            flagged_only: env_var("MTS_FILTER_FLAGGED")
                .is_some_and(|value| value.eq_ignore_ascii_case("true")),
            db_path,
            graph_api_base: env_var("MTS_GRAPH_API_BASE")
                .unwrap_or_else(|| GRAPH_API_BASE.to_string()),
            cloudinary: CloudinaryConfig::from_env(),
        })
    }
}

impl CloudinaryConfig {
    fn from_env() -> Option<Self> {
        Some(Self {
            cloud_name: env_var("CLOUDINARY_CLOUD_NAME")?,
            api_key: env_var("CLOUDINARY_API_KEY")?,
            api_secret: env_var("CLOUDINARY_API_SECRET")?,
        })
    }
}

pub fn default_db_path() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or_else(|| anyhow!("failed to determine home directory"))?;
    Ok(home.join(".mts").join("mts.db"))
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
