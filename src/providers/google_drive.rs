//! Google Drive Storage Provider
//!
//! Implements StorageProvider for Google Drive using the Drive API v3.
//! A repository is a Drive folder; the bundle and the meta sidecar are plain
//! files inside it, looked up by name on every operation.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{
    ensure_success, http_retry::send_with_retry, response_bytes_with_limit, AdapterSettings, ProviderError,
    ProviderType, RecipeBundle, SharePermission, StorageMeta, StorageProvider, TokenManager,
};
use crate::credential_store::FolderPointer;

/// Google Drive API base URL
pub const DRIVE_API_BASE: &str = "https://www.googleapis.com/drive/v3";
pub const UPLOAD_API_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
pub const GOOGLE_REVOKE_URL: &str = "https://oauth2.googleapis.com/revoke";

const FOLDER_MIME_TYPE: &str = "application/vnd.google-apps.folder";
const JSON_MIME_TYPE: &str = "application/json";

/// Google Drive file metadata from API
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[serde(default)]
    trashed: bool,
}

/// Google Drive file list response
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFileList {
    files: Vec<DriveFile>,
}

/// Escape a value for a Drive `q` string literal
fn escape_query(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Google Drive Storage Provider
pub struct GoogleDriveProvider {
    tokens: TokenManager,
    settings: AdapterSettings,
    client: reqwest::Client,
    api_base: String,
    upload_base: String,
    folder: Option<FolderPointer>,
}

impl GoogleDriveProvider {
    pub fn new(tokens: TokenManager, settings: AdapterSettings) -> Self {
        Self {
            tokens,
            settings,
            client: reqwest::Client::new(),
            api_base: DRIVE_API_BASE.to_string(),
            upload_base: UPLOAD_API_BASE.to_string(),
            folder: None,
        }
    }

    /// Override the API endpoints (proxies, tests)
    pub fn with_endpoints(mut self, api_base: &str, upload_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
        self.upload_base = upload_base.trim_end_matches('/').to_string();
        self
    }

    /// Get authorization header
    async fn auth_header(&self) -> Result<HeaderValue, ProviderError> {
        use secrecy::ExposeSecret;
        let token = self.tokens.access_token().await?;
        HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
            .map_err(|e| ProviderError::Other(format!("Invalid token: {}", e)))
    }

    async fn ensure_connected(&self) -> Result<(), ProviderError> {
        self.tokens.ensure_session().await
    }

    fn active_folder_id(&self) -> Result<String, ProviderError> {
        self.folder.as_ref()
            .map(|f| f.folder_id.clone())
            .ok_or_else(|| ProviderError::FolderNotFound("No active folder selected".to_string()))
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let request = builder
            .header(AUTHORIZATION, self.auth_header().await?)
            .build()
            .map_err(|e| ProviderError::Other(format!("Invalid request: {}", e)))?;
        send_with_retry(&self.client, request, &self.settings.retry).await
    }

    async fn list_files(&self, query: &str) -> Result<Vec<DriveFile>, ProviderError> {
        let url = format!(
            "{}/files?q={}&fields=files(id,name,mimeType,trashed)&pageSize=100",
            self.api_base, urlencoding::encode(query)
        );
        let response = ensure_success(self.send(self.client.get(&url)).await?).await?;
        let list: DriveFileList = response.json().await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        Ok(list.files)
    }

    /// Find a file by name in a parent folder
    async fn find_by_name(&self, name: &str, parent_id: &str) -> Result<Option<DriveFile>, ProviderError> {
        let query = format!(
            "name='{}' and '{}' in parents and trashed=false",
            escape_query(name), escape_query(parent_id)
        );
        match self.list_files(&query).await {
            Ok(files) => Ok(files.into_iter().next()),
            Err(ProviderError::RemoteApi { status: 404, .. }) => {
                Err(ProviderError::FolderNotFound(parent_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    async fn find_folder(&self, name: &str, parent_id: Option<&str>) -> Result<Option<String>, ProviderError> {
        let mut query = format!(
            "name='{}' and mimeType='{}' and trashed=false",
            escape_query(name), FOLDER_MIME_TYPE
        );
        if let Some(parent) = parent_id {
            query.push_str(&format!(" and '{}' in parents", escape_query(parent)));
        }
        Ok(self.list_files(&query).await?.into_iter().next().map(|f| f.id))
    }

    /// Upload a file into the active folder, replacing an existing one of the same name
    async fn upload_file(&self, name: &str, content: Vec<u8>) -> Result<(), ProviderError> {
        let folder_id = self.active_folder_id()?;

        if let Some(existing) = self.find_by_name(name, &folder_id).await? {
            let url = format!("{}/files/{}?uploadType=media", self.upload_base, existing.id);
            let request = self.client
                .patch(&url)
                .header(CONTENT_TYPE, JSON_MIME_TYPE)
                .body(content);
            ensure_success(self.send(request).await?).await?;
            debug!("Updated {} ({})", name, existing.id);
            return Ok(());
        }

        let metadata = serde_json::json!({
            "name": name,
            "parents": [folder_id],
            "mimeType": JSON_MIME_TYPE,
        });

        let boundary = "recipe_sync_boundary";
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.extend_from_slice(metadata.to_string().as_bytes());
        body.extend_from_slice(format!("\r\n--{}\r\n", boundary).as_bytes());
        body.extend_from_slice(format!("Content-Type: {}\r\n\r\n", JSON_MIME_TYPE).as_bytes());
        body.extend_from_slice(&content);
        body.extend_from_slice(format!("\r\n--{}--", boundary).as_bytes());

        let url = format!("{}/files?uploadType=multipart", self.upload_base);
        let request = self.client
            .post(&url)
            .header(CONTENT_TYPE, format!("multipart/related; boundary={}", boundary))
            .body(body);
        ensure_success(self.send(request).await?).await?;
        debug!("Created {} in {}", name, folder_id);
        Ok(())
    }

    /// Download a file from the active folder. `None` if it does not exist.
    async fn download_file(&self, name: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let folder_id = self.active_folder_id()?;
        let Some(file) = self.find_by_name(name, &folder_id).await? else {
            return Ok(None);
        };

        let url = format!("{}/files/{}?alt=media", self.api_base, file.id);
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        response_bytes_with_limit(response, self.settings.max_download_bytes).await.map(Some)
    }

    /// Make sure a session exists, signing in silently and then interactively
    async fn ensure_authenticated(&mut self) -> Result<(), ProviderError> {
        if self.tokens.is_connected() || self.restore_session().await {
            return Ok(());
        }
        if self.connect().await? {
            Ok(())
        } else {
            Err(ProviderError::AuthenticationCancelled)
        }
    }

    fn load_saved_folder(&mut self) {
        if self.folder.is_some() {
            return;
        }
        match self.tokens.store().load_folder(ProviderType::GoogleDrive) {
            Ok(folder) => self.folder = folder,
            Err(e) => warn!("Could not read saved Google Drive folder: {}", e),
        }
    }
}

#[async_trait]
impl StorageProvider for GoogleDriveProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::GoogleDrive
    }

    fn display_name(&self) -> String {
        match &self.folder {
            Some(folder) => format!("Google Drive ({})", folder.display_path),
            None => "Google Drive".to_string(),
        }
    }

    async fn connect(&mut self) -> Result<bool, ProviderError> {
        let connected = self.tokens.sign_in().await?;
        if connected {
            self.load_saved_folder();
        }
        Ok(connected)
    }

    async fn restore_session(&mut self) -> bool {
        let restored = self.tokens.restore().await;
        if restored {
            self.load_saved_folder();
        }
        restored
    }

    async fn disconnect(&mut self) -> Result<(), ProviderError> {
        self.tokens.sign_out().await?;
        self.tokens.store().clear_folder(ProviderType::GoogleDrive)?;
        self.folder = None;
        info!("Disconnected from Google Drive");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.tokens.is_connected()
    }

    fn active_folder(&self) -> Option<FolderPointer> {
        self.folder.clone()
    }

    async fn push(&mut self, bundle: &RecipeBundle) -> Result<(), ProviderError> {
        self.ensure_connected().await?;
        let bytes = bundle.to_bytes()?;
        let size = bytes.len();
        self.upload_file(&self.settings.bundle_file_name, bytes).await?;
        info!("Uploaded bundle ({} bytes) to Google Drive", size);
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<RecipeBundle>, ProviderError> {
        self.ensure_connected().await?;
        match self.download_file(&self.settings.bundle_file_name).await? {
            Some(bytes) => RecipeBundle::from_bytes(&bytes).map(Some),
            None => Ok(None),
        }
    }

    async fn get_meta(&mut self) -> Result<Option<StorageMeta>, ProviderError> {
        self.ensure_connected().await?;
        match self.download_file(&self.settings.meta_file_name).await? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| ProviderError::ParseError(format!("Invalid meta file: {}", e))),
            None => Ok(None),
        }
    }

    async fn update_meta(&mut self, meta: &StorageMeta) -> Result<(), ProviderError> {
        self.ensure_connected().await?;
        let bytes = serde_json::to_vec(meta)
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;
        self.upload_file(&self.settings.meta_file_name, bytes).await
    }

    async fn create_folder(&mut self, name: &str) -> Result<String, ProviderError> {
        self.ensure_authenticated().await?;

        let body = serde_json::json!({
            "name": name,
            "mimeType": FOLDER_MIME_TYPE,
            "parents": ["root"],
        });
        let url = format!("{}/files?fields=id", self.api_base);
        let response = ensure_success(self.send(self.client.post(&url).json(&body)).await?).await?;
        let created: DriveFile = response.json().await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        info!("Created Google Drive folder {} ({})", name, created.id);
        Ok(created.id)
    }

    async fn switch_repository(&mut self, folder_id: &str, name: &str) -> Result<(), ProviderError> {
        self.ensure_connected().await?;
        let folder_id = if folder_id.is_empty() {
            self.resolve_folder(name).await?
        } else {
            folder_id.to_string()
        };

        if !self.verify_folder_access(&folder_id).await? {
            return Err(ProviderError::AccessDenied(format!(
                "Folder '{}' is missing or you no longer have access to it", name
            )));
        }

        let pointer = FolderPointer { folder_id, display_path: name.to_string() };
        self.tokens.store().save_folder(ProviderType::GoogleDrive, &pointer)?;
        info!("Google Drive now using folder {} ({})", pointer.display_path, pointer.folder_id);
        self.folder = Some(pointer);
        Ok(())
    }

    async fn verify_folder_access(&mut self, folder_id: &str) -> Result<bool, ProviderError> {
        self.ensure_connected().await?;
        let url = format!(
            "{}/files/{}?fields=id,name,mimeType,trashed&supportsAllDrives=true",
            self.api_base, urlencoding::encode(folder_id)
        );
        let response = self.send(self.client.get(&url)).await?;

        match response.status().as_u16() {
            403 | 404 => {
                debug!("Folder {} not accessible ({})", folder_id, response.status());
                Ok(false)
            }
            _ => {
                let response = ensure_success(response).await?;
                let file: DriveFile = response.json().await
                    .map_err(|e| ProviderError::ParseError(e.to_string()))?;
                Ok(!file.trashed && file.mime_type.as_deref() == Some(FOLDER_MIME_TYPE))
            }
        }
    }

    async fn resolve_folder(&mut self, name: &str) -> Result<String, ProviderError> {
        self.ensure_connected().await?;
        // The default `user` corpus covers My Drive and items shared with the user
        self.find_folder(name, None).await?
            .ok_or_else(|| ProviderError::FolderNotFound(name.to_string()))
    }

    async fn find_legacy_folder(&mut self, name: &str) -> Result<Option<String>, ProviderError> {
        self.ensure_connected().await?;
        let found = self.find_folder(name, Some("root")).await?;
        if let Some(ref id) = found {
            info!("Found legacy Google Drive folder {} ({})", name, id);
        }
        Ok(found)
    }

    fn supports_sharing(&self) -> bool {
        true
    }

    async fn share_folder(&mut self, folder_id: &str, permission: &SharePermission) -> Result<(), ProviderError> {
        self.ensure_connected().await?;
        let url = format!(
            "{}/files/{}/permissions?sendNotificationEmail={}",
            self.api_base, urlencoding::encode(folder_id), permission.notify
        );
        let body = serde_json::json!({
            "role": permission.role,
            "type": permission.target_type,
            "emailAddress": permission.target,
        });
        ensure_success(self.send(self.client.post(&url).json(&body)).await?).await?;
        info!("Shared Google Drive folder {} as {}", folder_id, permission.role);
        Ok(())
    }
}
