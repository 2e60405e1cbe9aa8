use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::SyncError;

/// Endpoints and identity settings for the sync layer.
///
/// Defaults target the Google Drive v3 API; a deployment overrides them by
/// editing the persisted JSON file. The OAuth scope is restricted to files
/// created by this app.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SyncConfig {
    pub api_base_url: String,
    pub userinfo_url: String,
    pub revoke_url: String,
    pub oauth_client_id: String,
    pub oauth_scope: String,
    /// The single name-addressed data file this app maintains per folder.
    pub canonical_file_name: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: "https://www.googleapis.com".to_string(),
            userinfo_url: "https://www.googleapis.com/oauth2/v2/userinfo".to_string(),
            revoke_url: "https://oauth2.googleapis.com/revoke".to_string(),
            oauth_client_id: String::new(),
            oauth_scope: "https://www.googleapis.com/auth/drive.file".to_string(),
            canonical_file_name: "teamtrack-data.json".to_string(),
        }
    }
}

impl SyncConfig {
    /// Reads the config file, falling back to defaults when it is missing
    /// or unreadable.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            let content = fs::read_to_string(path).unwrap_or_default();
            serde_json::from_str(&content).unwrap_or_default()
        } else {
            SyncConfig::default()
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), SyncError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SyncError::Write(e.to_string()))?;
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| SyncError::Write(e.to_string()))?;
        fs::write(path, content).map_err(|e| SyncError::Write(e.to_string()))?;
        Ok(())
    }
}
