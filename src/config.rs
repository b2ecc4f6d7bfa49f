// Recipe Sync Configuration Module
// Persistent sync engine configuration storage

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::providers::http_retry::HttpRetryConfig;
use crate::providers::{
    ProviderType, DEFAULT_BUNDLE_FILE_NAME, DEFAULT_LEGACY_FOLDER_NAME, DEFAULT_META_FILE_NAME,
    MAX_DOWNLOAD_TO_BYTES,
};

pub const ENV_GOOGLE_CLIENT_ID: &str = "RECIPE_SYNC_GOOGLE_CLIENT_ID";
pub const ENV_GOOGLE_CLIENT_SECRET: &str = "RECIPE_SYNC_GOOGLE_CLIENT_SECRET";
pub const ENV_ONEDRIVE_CLIENT_ID: &str = "RECIPE_SYNC_ONEDRIVE_CLIENT_ID";

/// Sync engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Google desktop OAuth client (loopback flow)
    #[serde(default)]
    pub google: OAuthClientSettings,
    /// Microsoft identity platform client
    #[serde(default)]
    pub onedrive: OAuthClientSettings,
    /// Loopback callback port (0 = ephemeral)
    #[serde(default)]
    pub callback_port: u16,
    /// How long to wait for the browser consent redirect
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
    #[serde(default = "default_bundle_file_name")]
    pub bundle_file_name: String,
    #[serde(default = "default_meta_file_name")]
    pub meta_file_name: String,
    /// Folder searched for on first connect by pre-registry installs
    #[serde(default = "default_legacy_folder_name")]
    pub legacy_folder_name: String,
    #[serde(default = "default_max_download_bytes")]
    pub max_download_bytes: u64,
    /// Name-conflict behavior for OneDrive folder creation
    #[serde(default)]
    pub onedrive_conflict_behavior: ConflictBehavior,
    #[serde(default = "default_provider")]
    pub default_provider: ProviderType,
    #[serde(default)]
    pub retry: HttpRetryConfig,
    /// Where the registry and credential files live (default: platform data dir)
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
}

/// OAuth client id/secret pair
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OAuthClientSettings {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Option<String>,
}

/// `@microsoft.graph.conflictBehavior` values
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConflictBehavior {
    Fail,
    Replace,
    #[default]
    Rename,
}

impl ConflictBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Rename => "rename",
        }
    }
}

fn default_auth_timeout() -> u64 {
    300
}

fn default_bundle_file_name() -> String {
    DEFAULT_BUNDLE_FILE_NAME.to_string()
}

fn default_meta_file_name() -> String {
    DEFAULT_META_FILE_NAME.to_string()
}

fn default_legacy_folder_name() -> String {
    DEFAULT_LEGACY_FOLDER_NAME.to_string()
}

fn default_max_download_bytes() -> u64 {
    MAX_DOWNLOAD_TO_BYTES
}

fn default_provider() -> ProviderType {
    ProviderType::GoogleDrive
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            google: OAuthClientSettings::default(),
            onedrive: OAuthClientSettings::default(),
            callback_port: 0,
            auth_timeout_secs: default_auth_timeout(),
            bundle_file_name: default_bundle_file_name(),
            meta_file_name: default_meta_file_name(),
            legacy_folder_name: default_legacy_folder_name(),
            max_download_bytes: default_max_download_bytes(),
            onedrive_conflict_behavior: ConflictBehavior::default(),
            default_provider: default_provider(),
            retry: HttpRetryConfig::default(),
            data_dir: None,
        }
    }
}

impl SyncConfig {
    /// Apply `RECIPE_SYNC_*` environment overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup(ENV_GOOGLE_CLIENT_ID).filter(|v| !v.is_empty()) {
            self.google.client_id = id;
        }
        if let Some(secret) = lookup(ENV_GOOGLE_CLIENT_SECRET).filter(|v| !v.is_empty()) {
            self.google.client_secret = Some(secret);
        }
        if let Some(id) = lookup(ENV_ONEDRIVE_CLIENT_ID).filter(|v| !v.is_empty()) {
            self.onedrive.client_id = id;
        }
    }

    /// Directory holding the registry and local credential files
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .or_else(dirs::home_dir)
                .unwrap_or_else(|| PathBuf::from("."))
                .join("recipe-sync")
        })
    }

    pub fn registry_path(&self) -> PathBuf {
        self.data_dir().join("repositories.json")
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.data_dir().join("credentials")
    }
}

/// Get the path to the config file
pub fn get_config_path() -> PathBuf {
    let config_dir = dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")));
    config_dir.join("recipe-sync").join("sync_config.json")
}

/// Load configuration from disk, then apply environment overrides
pub fn load_sync_config() -> SyncConfig {
    let mut config = load_sync_config_from(&get_config_path());
    config.apply_env_overrides();
    config
}

/// Load configuration from a specific file, falling back to defaults
pub fn load_sync_config_from(config_path: &Path) -> SyncConfig {
    if config_path.exists() {
        match fs::read_to_string(config_path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(config) => return config,
                Err(e) => {
                    tracing::warn!("Failed to parse sync config: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read sync config: {}", e);
            }
        }
    }

    SyncConfig::default()
}

/// Save configuration to disk
pub fn save_sync_config(config: &SyncConfig) -> Result<(), String> {
    save_sync_config_to(config, &get_config_path())
}

pub fn save_sync_config_to(config: &SyncConfig, config_path: &Path) -> Result<(), String> {
    if let Some(parent) = config_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;

    fs::write(config_path, content)
        .map_err(|e| format!("Failed to write config: {}", e))?;

    tracing::info!("Sync config saved to {:?}", config_path);
    Ok(())
}

fn validate_file_name(label: &str, name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err(format!("{} cannot be empty", label));
    }
    if name.contains('/') || name.contains('\\') {
        return Err(format!("{} must be a plain file name", label));
    }
    Ok(())
}

/// Validate engine-wide settings
pub fn validate_config(config: &SyncConfig) -> Result<(), String> {
    validate_file_name("Bundle file name", &config.bundle_file_name)?;
    validate_file_name("Meta file name", &config.meta_file_name)?;
    if config.bundle_file_name == config.meta_file_name {
        return Err("Bundle and meta file names must differ".to_string());
    }
    validate_file_name("Legacy folder name", &config.legacy_folder_name)?;
    if config.max_download_bytes == 0 {
        return Err("Download size limit must be greater than zero".to_string());
    }
    if config.auth_timeout_secs == 0 {
        return Err("Authentication timeout must be greater than zero".to_string());
    }
    Ok(())
}

/// Validate the client settings needed to sign in to a provider from a desktop
pub fn validate_provider(config: &SyncConfig, provider: ProviderType) -> Result<(), String> {
    match provider {
        ProviderType::GoogleDrive => {
            if config.google.client_id.is_empty() {
                return Err(format!("Google Drive requires a client id ({})", ENV_GOOGLE_CLIENT_ID));
            }
            if config.google.client_secret.as_deref().unwrap_or("").is_empty() {
                return Err(format!(
                    "Google Drive desktop sign-in requires a client secret ({})",
                    ENV_GOOGLE_CLIENT_SECRET
                ));
            }
        }
        ProviderType::OneDrive => {
            if config.onedrive.client_id.is_empty() {
                return Err(format!("OneDrive requires a client id ({})", ENV_ONEDRIVE_CLIENT_ID));
            }
        }
    }
    Ok(())
}
