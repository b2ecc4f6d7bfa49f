// Recipe Sync Credential Store
// Tokens go to the OS keyring when available, otherwise to owner-only JSON files.
// Non-secret folder pointers always live in plain JSON next to the registry.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::providers::ProviderType;

const SERVICE_NAME: &str = "recipe-sync";

/// Seconds before the real expiry at which a token is treated as expired
pub const EXPIRY_BUFFER_SECS: i64 = 300;

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Keyring error: {0}")]
    Keyring(String),
    #[error("Credential not found: {0}")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

// ============ Persisted Records ============

/// OAuth session material for one provider
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredCredentials {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>, // Unix timestamp
    pub token_type: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Desktop client pairing the refresh token was issued to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
}

impl StoredCredentials {
    pub fn bearer(access_token: &str, expires_at: Option<i64>) -> Self {
        Self {
            access_token: access_token.to_string(),
            refresh_token: None,
            expires_at,
            token_type: "Bearer".to_string(),
            scopes: Vec::new(),
            client_id: None,
            client_secret: None,
        }
    }

    /// Check if token is expired (with 5 min buffer)
    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp() + EXPIRY_BUFFER_SECS,
            None => false, // No expiry = assume valid
        }
    }

    /// Check if the token has actually passed its expiry
    pub fn is_past_expiry(&self) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= chrono::Utc::now().timestamp(),
            None => false,
        }
    }
}

impl fmt::Debug for StoredCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoredCredentials")
            .field("access_token", &"<redacted>")
            .field("refresh_token", &self.refresh_token.as_ref().map(|_| "<redacted>"))
            .field("expires_at", &self.expires_at)
            .field("token_type", &self.token_type)
            .field("scopes", &self.scopes)
            .field("client_id", &self.client_id)
            .finish()
    }
}

/// Active remote folder for a provider (not secret)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderPointer {
    pub folder_id: String,
    pub display_path: String,
}

// ============ Store Contract ============

/// Persistence for provider sessions, injected into every adapter
pub trait CredentialStore: Send + Sync {
    fn load_credentials(&self, provider: ProviderType) -> Result<Option<StoredCredentials>, CredentialError>;
    fn save_credentials(&self, provider: ProviderType, credentials: &StoredCredentials) -> Result<(), CredentialError>;
    fn clear_credentials(&self, provider: ProviderType) -> Result<(), CredentialError>;

    fn load_folder(&self, provider: ProviderType) -> Result<Option<FolderPointer>, CredentialError>;
    fn save_folder(&self, provider: ProviderType, folder: &FolderPointer) -> Result<(), CredentialError>;
    fn clear_folder(&self, provider: ProviderType) -> Result<(), CredentialError>;

    /// Remove everything stored for a provider
    fn clear(&self, provider: ProviderType) -> Result<(), CredentialError> {
        self.clear_credentials(provider)?;
        self.clear_folder(provider)
    }
}

fn account_name(provider: ProviderType) -> String {
    format!("oauth_{}", provider.as_key())
}

fn to_json<T: Serialize>(value: &T) -> Result<String, CredentialError> {
    serde_json::to_string_pretty(value).map_err(|e| CredentialError::Serialization(e.to_string()))
}

fn from_json<T: for<'de> Deserialize<'de>>(json: &str) -> Result<T, CredentialError> {
    serde_json::from_str(json).map_err(|e| CredentialError::Serialization(e.to_string()))
}

// ============ File Backend ============

/// JSON files with owner-only permissions
pub struct FileCredentialStore {
    dir: PathBuf,
}

impl FileCredentialStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn token_path(&self, provider: ProviderType) -> PathBuf {
        self.dir.join(format!("oauth2_{}.json", provider.as_key()))
    }

    fn folder_path(&self, provider: ProviderType) -> PathBuf {
        self.dir.join(format!("folder_{}.json", provider.as_key()))
    }

    fn ensure_dir(&self) -> Result<(), CredentialError> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir)?;
            ensure_secure_permissions(&self.dir)?;
        }
        Ok(())
    }

    fn read_optional<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Option<T>, CredentialError> {
        match std::fs::read_to_string(path) {
            Ok(json) => from_json(&json).map(Some),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

impl CredentialStore for FileCredentialStore {
    fn load_credentials(&self, provider: ProviderType) -> Result<Option<StoredCredentials>, CredentialError> {
        Self::read_optional(&self.token_path(provider))
    }

    fn save_credentials(&self, provider: ProviderType, credentials: &StoredCredentials) -> Result<(), CredentialError> {
        self.ensure_dir()?;
        let path = self.token_path(provider);
        std::fs::write(&path, to_json(credentials)?)?;
        ensure_secure_permissions(&path)?;
        info!("Tokens stored in file for {}", provider);
        Ok(())
    }

    fn clear_credentials(&self, provider: ProviderType) -> Result<(), CredentialError> {
        secure_delete(&self.token_path(provider))
    }

    fn load_folder(&self, provider: ProviderType) -> Result<Option<FolderPointer>, CredentialError> {
        Self::read_optional(&self.folder_path(provider))
    }

    fn save_folder(&self, provider: ProviderType, folder: &FolderPointer) -> Result<(), CredentialError> {
        self.ensure_dir()?;
        std::fs::write(self.folder_path(provider), to_json(folder)?)?;
        Ok(())
    }

    fn clear_folder(&self, provider: ProviderType) -> Result<(), CredentialError> {
        let path = self.folder_path(provider);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ============ OS Keyring Backend ============

/// Tokens in the OS keyring, folder pointers in plain files
pub struct KeyringCredentialStore {
    plain: FileCredentialStore,
}

impl KeyringCredentialStore {
    /// Try to create a store using OS keyring. Returns None if keyring unavailable.
    pub fn with_keyring(plain_dir: impl Into<PathBuf>) -> Option<Self> {
        let entry = keyring::Entry::new(SERVICE_NAME, "__probe__").ok()?;
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => {}
            Err(keyring::Error::NoStorageAccess(_)) | Err(keyring::Error::PlatformFailure(_)) => return None,
            Err(e) => debug!("Keyring probe returned {}, proceeding", e),
        }
        Some(Self { plain: FileCredentialStore::new(plain_dir) })
    }

    fn entry(provider: ProviderType) -> Result<keyring::Entry, CredentialError> {
        keyring::Entry::new(SERVICE_NAME, &account_name(provider))
            .map_err(|e| CredentialError::Keyring(e.to_string()))
    }
}

impl CredentialStore for KeyringCredentialStore {
    fn load_credentials(&self, provider: ProviderType) -> Result<Option<StoredCredentials>, CredentialError> {
        match Self::entry(provider)?.get_password() {
            Ok(json) => from_json(&json).map(Some),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(CredentialError::Keyring(e.to_string())),
        }
    }

    fn save_credentials(&self, provider: ProviderType, credentials: &StoredCredentials) -> Result<(), CredentialError> {
        Self::entry(provider)?
            .set_password(&to_json(credentials)?)
            .map_err(|e| CredentialError::Keyring(e.to_string()))?;
        info!("Credential stored in OS keyring: {}", account_name(provider));
        Ok(())
    }

    fn clear_credentials(&self, provider: ProviderType) -> Result<(), CredentialError> {
        match Self::entry(provider)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => {}
            Err(e) => return Err(CredentialError::Keyring(e.to_string())),
        }
        info!("Credential deleted from OS keyring: {}", account_name(provider));
        Ok(())
    }

    fn load_folder(&self, provider: ProviderType) -> Result<Option<FolderPointer>, CredentialError> {
        self.plain.load_folder(provider)
    }

    fn save_folder(&self, provider: ProviderType, folder: &FolderPointer) -> Result<(), CredentialError> {
        self.plain.save_folder(provider, folder)
    }

    fn clear_folder(&self, provider: ProviderType) -> Result<(), CredentialError> {
        self.plain.clear_folder(provider)
    }
}

// ============ In-Memory Backend ============

/// Process-local store, used by tests and ephemeral sessions
#[derive(Default)]
pub struct MemoryCredentialStore {
    credentials: Mutex<HashMap<ProviderType, StoredCredentials>>,
    folders: Mutex<HashMap<ProviderType, FolderPointer>>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialStore for MemoryCredentialStore {
    fn load_credentials(&self, provider: ProviderType) -> Result<Option<StoredCredentials>, CredentialError> {
        let map = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(&provider).cloned())
    }

    fn save_credentials(&self, provider: ProviderType, credentials: &StoredCredentials) -> Result<(), CredentialError> {
        let mut map = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(provider, credentials.clone());
        Ok(())
    }

    fn clear_credentials(&self, provider: ProviderType) -> Result<(), CredentialError> {
        let mut map = self.credentials.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&provider);
        Ok(())
    }

    fn load_folder(&self, provider: ProviderType) -> Result<Option<FolderPointer>, CredentialError> {
        let map = self.folders.lock().unwrap_or_else(|e| e.into_inner());
        Ok(map.get(&provider).cloned())
    }

    fn save_folder(&self, provider: ProviderType, folder: &FolderPointer) -> Result<(), CredentialError> {
        let mut map = self.folders.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(provider, folder.clone());
        Ok(())
    }

    fn clear_folder(&self, provider: ProviderType) -> Result<(), CredentialError> {
        let mut map = self.folders.lock().unwrap_or_else(|e| e.into_inner());
        map.remove(&provider);
        Ok(())
    }
}

/// Pick the best available backend: OS keyring, then owner-only files
pub fn open_default_store(dir: &Path) -> Box<dyn CredentialStore> {
    match KeyringCredentialStore::with_keyring(dir) {
        Some(store) => Box::new(store),
        None => {
            warn!("OS keyring unavailable, storing tokens in {:?}", dir);
            Box::new(FileCredentialStore::new(dir))
        }
    }
}

// ============ File Helpers ============

/// Restrict a file to 0600 (directories to 0700)
pub fn ensure_secure_permissions(path: &Path) -> Result<(), CredentialError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}

/// Securely delete a file (overwrite with zeros, then random bytes, then remove)
pub fn secure_delete(path: &Path) -> Result<(), CredentialError> {
    if path.exists() {
        let size = std::fs::metadata(path)?.len() as usize;
        if size > 0 {
            std::fs::write(path, vec![0u8; size])?;
            let mut random = vec![0u8; size];
            rand::thread_rng().fill_bytes(&mut random);
            std::fs::write(path, &random)?;
        }
        std::fs::remove_file(path)?;
        info!("Securely deleted: {:?}", path);
    }
    Ok(())
}
