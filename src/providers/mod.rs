//! Storage Providers Module
//!
//! Every cloud backend implements [`StorageProvider`], a folder-scoped contract
//! for moving one bundle file and one metadata sidecar. Backend differences
//! that callers must respect are published as [`ProviderCapabilities`] instead
//! of being hidden behind divergent method behavior.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │             StorageProvider Trait            │
//! │  connect, push, pull, meta, folders, verify  │
//! └──────────────────────────────────────────────┘
//!               │                     │
//!               ▼                     ▼
//!       ┌──────────────┐      ┌──────────────┐
//!       │ Google Drive │      │   OneDrive   │
//!       └──────────────┘      └──────────────┘
//!               │                     │
//!               └──── TokenManager ───┘
//!                  (SessionStrategy +
//!                   CredentialStore)
//! ```

pub mod types;
pub mod http_retry;
pub mod oauth2;
pub mod session;
pub mod google_drive;
pub mod onedrive;
#[cfg(test)]
pub mod fake;

pub use types::*;
pub use google_drive::GoogleDriveProvider;
pub use onedrive::OneDriveProvider;
pub use oauth2::{OAuth2Manager, OAuthConfig};
pub use session::{NativeSignIn, SessionStrategy, TokenManager};

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::credential_store::{CredentialStore, FolderPointer};
use http_retry::HttpRetryConfig;

/// Adapter shared between the orchestrator and the verification sweeper
pub type SharedProvider = Arc<tokio::sync::Mutex<Box<dyn StorageProvider>>>;

/// Unified storage provider trait
///
/// An adapter is pointed at one remote folder at a time (the active
/// repository). All file operations act on that folder.
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Get the provider type identifier
    fn provider_type(&self) -> ProviderType;

    /// Get display name for this provider instance
    fn display_name(&self) -> String;

    fn capabilities(&self) -> ProviderCapabilities {
        self.provider_type().capabilities()
    }

    /// Interactive sign-in. `Ok(false)` means the user cancelled.
    async fn connect(&mut self) -> Result<bool, ProviderError>;

    /// Silent sign-in from persisted credentials. Never fails.
    async fn restore_session(&mut self) -> bool;

    /// Revoke and forget the local session. Remote data is untouched.
    async fn disconnect(&mut self) -> Result<(), ProviderError>;

    /// Live session with a token that has not passed its expiry
    fn is_connected(&self) -> bool;

    /// Folder the adapter currently reads from and writes to
    fn active_folder(&self) -> Option<FolderPointer>;

    /// Upload the bundle, replacing any existing bundle file
    async fn push(&mut self, bundle: &RecipeBundle) -> Result<(), ProviderError>;

    /// Download the bundle. `None` when the folder has no bundle yet.
    async fn pull(&mut self) -> Result<Option<RecipeBundle>, ProviderError>;

    /// Read the metadata sidecar. `None` when absent.
    async fn get_meta(&mut self) -> Result<Option<StorageMeta>, ProviderError>;

    async fn update_meta(&mut self, meta: &StorageMeta) -> Result<(), ProviderError>;

    /// Create a folder for a new repository and return its id.
    /// Signs in first (silently, then interactively) when needed.
    async fn create_folder(&mut self, name: &str) -> Result<String, ProviderError>;

    /// Verify access to a folder, then make it the active folder
    async fn switch_repository(&mut self, folder_id: &str, name: &str) -> Result<(), ProviderError>;

    /// Lightweight access probe: `Ok(false)` for missing or forbidden folders
    async fn verify_folder_access(&mut self, folder_id: &str) -> Result<bool, ProviderError>;

    /// Find a folder by display name in every location the backend searches
    async fn resolve_folder(&mut self, name: &str) -> Result<String, ProviderError>;

    /// Look for the folder used before repositories existed
    async fn find_legacy_folder(&mut self, _name: &str) -> Result<Option<String>, ProviderError> {
        Ok(None)
    }

    /// Check if provider supports sharing folders with other accounts
    fn supports_sharing(&self) -> bool {
        false
    }

    /// Grant another account access to a folder
    async fn share_folder(&mut self, _folder_id: &str, _permission: &SharePermission) -> Result<(), ProviderError> {
        Err(ProviderError::NotSupported("share_folder".to_string()))
    }
}

/// Settings every adapter shares
#[derive(Debug, Clone)]
pub struct AdapterSettings {
    pub bundle_file_name: String,
    pub meta_file_name: String,
    pub max_download_bytes: u64,
    pub retry: HttpRetryConfig,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            bundle_file_name: DEFAULT_BUNDLE_FILE_NAME.to_string(),
            meta_file_name: DEFAULT_META_FILE_NAME.to_string(),
            max_download_bytes: MAX_DOWNLOAD_TO_BYTES,
            retry: HttpRetryConfig::default(),
        }
    }
}

impl AdapterSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            bundle_file_name: config.bundle_file_name.clone(),
            meta_file_name: config.meta_file_name.clone(),
            max_download_bytes: config.max_download_bytes,
            retry: config.retry.clone(),
        }
    }
}

/// Pass 2xx responses through, turn anything else into `RemoteApi`
pub async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let text = response.text().await.unwrap_or_default();
    Err(ProviderError::remote(status, text))
}

/// Read a response body, aborting once more than `limit` bytes have arrived
pub async fn response_bytes_with_limit(response: reqwest::Response, limit: u64) -> Result<Vec<u8>, ProviderError> {
    use futures_util::StreamExt;

    if let Some(cl) = response.content_length() {
        if cl > limit {
            return Err(ProviderError::SizeLimitExceeded { limit });
        }
    }

    let mut stream = response.bytes_stream();
    let mut body = Vec::new();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        if body.len() as u64 + chunk.len() as u64 > limit {
            return Err(ProviderError::SizeLimitExceeded { limit });
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Provider factory for creating provider instances
pub struct ProviderFactory;

impl ProviderFactory {
    /// Build an adapter, choosing its session strategy for the current platform
    pub fn create(
        provider: ProviderType,
        config: &SyncConfig,
        store: Arc<dyn CredentialStore>,
        native: Option<Arc<dyn NativeSignIn>>,
    ) -> Result<Box<dyn StorageProvider>, ProviderError> {
        let settings = AdapterSettings::from_config(config);
        let timeout = Duration::from_secs(config.auth_timeout_secs);

        match provider {
            ProviderType::GoogleDrive => {
                let strategy = session::select_google_strategy(session::Platform::current(), native, || {
                    let oauth = OAuthConfig::google_with_port(
                        &config.google.client_id,
                        config.google.client_secret.as_deref().unwrap_or_default(),
                        config.callback_port,
                    );
                    session::LoopbackConsentStrategy::new(oauth, config.callback_port, timeout)
                        .with_revoke_url(google_drive::GOOGLE_REVOKE_URL)
                })?;
                let tokens = TokenManager::new(provider, strategy, store);
                Ok(Box::new(GoogleDriveProvider::new(tokens, settings)))
            }
            ProviderType::OneDrive => {
                let oauth = OAuthConfig::onedrive_with_port(
                    &config.onedrive.client_id,
                    config.onedrive.client_secret.as_deref(),
                    config.callback_port,
                );
                let strategy = session::LoopbackConsentStrategy::new(oauth, config.callback_port, timeout);
                let tokens = TokenManager::new(provider, Box::new(strategy), store);
                Ok(Box::new(
                    OneDriveProvider::new(tokens, settings)
                        .with_conflict_behavior(config.onedrive_conflict_behavior),
                ))
            }
        }
    }

    /// Get list of all supported provider types
    pub fn supported_types() -> Vec<ProviderType> {
        ProviderType::all().to_vec()
    }
}

/// Wrap an adapter for sharing across tasks
pub fn shared(provider: Box<dyn StorageProvider>) -> SharedProvider {
    Arc::new(tokio::sync::Mutex::new(provider))
}
