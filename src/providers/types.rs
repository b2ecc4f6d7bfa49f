//! Shared types for storage providers
//!
//! Provider identifiers, the static capability table, the remote documents
//! exchanged with every backend (bundle + meta sidecar) and the provider
//! error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::credential_store::CredentialError;

/// Default name of the bundle file stored in every repository folder
pub const DEFAULT_BUNDLE_FILE_NAME: &str = "recipes_bundle.json";

/// Default name of the hidden metadata sidecar
pub const DEFAULT_META_FILE_NAME: &str = ".recipes_meta.json";

/// Folder name used by installs that predate the repository registry
pub const DEFAULT_LEGACY_FOLDER_NAME: &str = "RecipeSync";

/// Streamed downloads abort once this many bytes have been received
pub const MAX_DOWNLOAD_TO_BYTES: u64 = 10 * 1024 * 1024;

/// Supported storage provider types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
    /// Google Drive (native sign-in on mobile, loopback OAuth2 on desktop)
    GoogleDrive,
    /// Microsoft OneDrive (Microsoft Graph)
    OneDrive,
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderType::GoogleDrive => write!(f, "Google Drive"),
            ProviderType::OneDrive => write!(f, "OneDrive"),
        }
    }
}

impl FromStr for ProviderType {
    type Err = ProviderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "google_drive" | "googledrive" | "gdrive" | "google" => Ok(ProviderType::GoogleDrive),
            "one_drive" | "onedrive" => Ok(ProviderType::OneDrive),
            other => Err(ProviderError::InvalidConfig(format!("Unknown provider: {}", other))),
        }
    }
}

impl ProviderType {
    /// Stable key used in persisted state and deep links
    pub fn as_key(&self) -> &'static str {
        match self {
            ProviderType::GoogleDrive => "google_drive",
            ProviderType::OneDrive => "one_drive",
        }
    }

    pub fn all() -> [ProviderType; 2] {
        [ProviderType::GoogleDrive, ProviderType::OneDrive]
    }

    /// Static capability flags for this backend
    pub fn capabilities(&self) -> ProviderCapabilities {
        match self {
            ProviderType::GoogleDrive => ProviderCapabilities {
                supports_automatic_sync: true,
                supports_fast_meta_check: true,
                supports_atomic_writes: true,
                supports_folders: true,
                is_advanced: false,
            },
            // Graph simple upload replaces content in place; an interrupted
            // PUT can leave a truncated file behind.
            ProviderType::OneDrive => ProviderCapabilities {
                supports_automatic_sync: true,
                supports_fast_meta_check: true,
                supports_atomic_writes: false,
                supports_folders: true,
                is_advanced: true,
            },
        }
    }
}

/// Immutable per-provider feature flags consumed by the orchestrator and callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCapabilities {
    pub supports_automatic_sync: bool,
    pub supports_fast_meta_check: bool,
    pub supports_atomic_writes: bool,
    pub supports_folders: bool,
    pub is_advanced: bool,
}

/// Serialized recipe payload. Opaque to the sync engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecipeBundle(pub serde_json::Value);

impl RecipeBundle {
    pub fn new(value: serde_json::Value) -> Self {
        Self(value)
    }

    pub fn into_inner(self) -> serde_json::Value {
        self.0
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, ProviderError> {
        serde_json::to_vec(&self.0)
            .map_err(|e| ProviderError::ParseError(format!("Failed to serialize bundle: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ProviderError> {
        serde_json::from_slice(bytes)
            .map(Self)
            .map_err(|e| ProviderError::ParseError(format!("Invalid bundle: {}", e)))
    }
}

/// Sidecar document written next to the bundle for cheap change detection
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageMeta {
    pub recipe_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    /// Fields written by other clients, preserved on round trip
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl StorageMeta {
    pub fn new(recipe_count: u64) -> Self {
        Self {
            recipe_count,
            updated_at: Some(chrono::Utc::now()),
            ..Default::default()
        }
    }
}

/// Share permission for folder sharing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharePermission {
    /// Permission role: "reader", "writer"
    pub role: String,
    /// Target type: "user", "group", "domain", "anyone"
    pub target_type: String,
    /// Target email or identifier
    pub target: String,
    /// Send a notification email to the target
    pub notify: bool,
}

impl SharePermission {
    pub fn writer(email: &str, notify: bool) -> Self {
        Self {
            role: "writer".to_string(),
            target_type: "user".to_string(),
            target: email.to_string(),
            notify,
        }
    }
}

/// Provider error types
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Not connected to storage provider")]
    NotConnected,

    #[error("Authentication cancelled by user")]
    AuthenticationCancelled,

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Token refresh failed: {0}")]
    TokenRefreshFailed(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Repository folder '{name}' was not found in your files or in items shared with you")]
    RepositoryNotFoundInAnyLocation { name: String },

    #[error("Download exceeds size limit of {limit} bytes")]
    SizeLimitExceeded { limit: u64 },

    #[error("API error {status}: {body}")]
    RemoteApi { status: u16, body: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not supported: {0}")]
    NotSupported(String),

    #[error("Credential store error: {0}")]
    Credential(#[from] CredentialError),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Build the error for an unexpected HTTP status
    pub fn remote(status: reqwest::StatusCode, body: String) -> Self {
        ProviderError::RemoteApi { status: status.as_u16(), body }
    }
}
