//! OneDrive Storage Provider
//!
//! Implements StorageProvider for Microsoft OneDrive using the Microsoft Graph API.
//!
//! Folders shared by another account live in that account's drive, so a
//! repository folder id is stored as `drive_id/item_id` when it is remote and
//! as a bare `item_id` when it sits in the user's own drive.

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;
use std::fmt;
use tracing::{debug, info, warn};

use super::{
    ensure_success, http_retry::send_with_retry, response_bytes_with_limit, AdapterSettings, ProviderError,
    ProviderType, RecipeBundle, SharePermission, StorageMeta, StorageProvider, TokenManager,
};
use crate::config::ConflictBehavior;
use crate::credential_store::FolderPointer;

/// Microsoft Graph API base URL
pub const GRAPH_API_BASE: &str = "https://graph.microsoft.com/v1.0";

/// Graph rejects simple PUT uploads above 4 MiB
const SIMPLE_UPLOAD_LIMIT: usize = 4 * 1024 * 1024;
/// Upload session chunks must be a multiple of 320 KiB
const UPLOAD_CHUNK_SIZE: usize = 10 * 320 * 1024;

/// OneDrive item metadata
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveItem {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    folder: Option<FolderFacet>,
    #[serde(default)]
    remote_item: Option<RemoteItem>,
}

#[derive(Debug, Deserialize)]
struct FolderFacet {}

/// Pointer into another account's drive (items shared with the user)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RemoteItem {
    id: String,
    #[serde(default)]
    folder: Option<FolderFacet>,
    #[serde(default)]
    parent_reference: Option<ParentReference>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ParentReference {
    drive_id: Option<String>,
}

/// List children response
#[derive(Debug, Deserialize)]
struct ChildrenResponse {
    value: Vec<DriveItem>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadSession {
    upload_url: String,
}

/// Location of a OneDrive folder, possibly in another user's drive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneDriveFolderRef {
    pub drive_id: Option<String>,
    pub item_id: String,
}

impl OneDriveFolderRef {
    pub fn parse(folder_id: &str) -> Self {
        match folder_id.split_once('/') {
            Some((drive, item)) if !drive.is_empty() => Self {
                drive_id: Some(drive.to_string()),
                item_id: item.to_string(),
            },
            _ => Self {
                drive_id: None,
                item_id: folder_id.trim_start_matches('/').to_string(),
            },
        }
    }
}

impl fmt::Display for OneDriveFolderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.drive_id {
            Some(drive) => write!(f, "{}/{}", drive, self.item_id),
            None => write!(f, "{}", self.item_id),
        }
    }
}

/// Graph invitation roles use `read`/`write`
fn graph_role(role: &str) -> &str {
    match role {
        "writer" | "write" => "write",
        "reader" | "read" => "read",
        other => other,
    }
}

/// OneDrive Storage Provider
pub struct OneDriveProvider {
    tokens: TokenManager,
    settings: AdapterSettings,
    client: reqwest::Client,
    api_base: String,
    conflict_behavior: ConflictBehavior,
    folder: Option<FolderPointer>,
}

impl OneDriveProvider {
    pub fn new(tokens: TokenManager, settings: AdapterSettings) -> Self {
        Self {
            tokens,
            settings,
            client: reqwest::Client::new(),
            api_base: GRAPH_API_BASE.to_string(),
            conflict_behavior: ConflictBehavior::default(),
            folder: None,
        }
    }

    /// What Graph does when a created folder's name is already taken
    pub fn with_conflict_behavior(mut self, behavior: ConflictBehavior) -> Self {
        self.conflict_behavior = behavior;
        self
    }

    pub fn with_api_base(mut self, api_base: &str) -> Self {
        self.api_base = api_base.trim_end_matches('/').to_string();
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

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, ProviderError> {
        let request = builder
            .header(AUTHORIZATION, self.auth_header().await?)
            .build()
            .map_err(|e| ProviderError::Other(format!("Invalid request: {}", e)))?;
        send_with_retry(&self.client, request, &self.settings.retry).await
    }

    /// Build path for an item, in the owner's drive when known
    fn api_item(&self, folder: &OneDriveFolderRef) -> String {
        match &folder.drive_id {
            Some(drive) => format!("{}/drives/{}/items/{}", self.api_base, drive, folder.item_id),
            None => format!("{}/me/drive/items/{}", self.api_base, folder.item_id),
        }
    }

    /// `:/name:` addressing of a file inside the active folder
    fn api_file(&self, name: &str) -> Result<String, ProviderError> {
        let folder = self.folder.as_ref()
            .ok_or_else(|| ProviderError::FolderNotFound("No active folder selected".to_string()))?;
        let folder_ref = OneDriveFolderRef::parse(&folder.folder_id);
        Ok(format!("{}:/{}:", self.api_item(&folder_ref), urlencoding::encode(name)))
    }

    /// List a collection with pagination
    async fn list_all(&self, first_url: String) -> Result<Vec<DriveItem>, ProviderError> {
        let mut all_items = Vec::new();
        let mut url = first_url;

        loop {
            let response = ensure_success(self.send(self.client.get(&url)).await?).await?;
            let result: ChildrenResponse = response.json().await
                .map_err(|e| ProviderError::ParseError(e.to_string()))?;

            all_items.extend(result.value);

            match result.next_link {
                Some(next) => url = next,
                None => break,
            }
        }

        Ok(all_items)
    }

    /// Folder with this name directly under the user's drive root
    async fn find_in_root(&self, name: &str) -> Result<Option<OneDriveFolderRef>, ProviderError> {
        let url = format!("{}/me/drive/root/children?$select=id,name,folder", self.api_base);
        let found = self.list_all(url).await?
            .into_iter()
            .find(|item| item.folder.is_some() && item.name == name)
            .map(|item| OneDriveFolderRef { drive_id: None, item_id: item.id });
        Ok(found)
    }

    /// Folder with this name among items other accounts shared with the user
    async fn find_in_shared(&self, name: &str) -> Result<Option<OneDriveFolderRef>, ProviderError> {
        let url = format!("{}/me/drive/sharedWithMe", self.api_base);
        let found = self.list_all(url).await?
            .into_iter()
            .filter(|item| item.name == name)
            .filter_map(|item| item.remote_item)
            .find(|remote| remote.folder.is_some())
            .map(|remote| OneDriveFolderRef {
                drive_id: remote.parent_reference.and_then(|p| p.drive_id),
                item_id: remote.id,
            });
        Ok(found)
    }

    async fn upload_file(&self, name: &str, content: Vec<u8>) -> Result<(), ProviderError> {
        let file_url = self.api_file(name)?;

        if content.len() <= SIMPLE_UPLOAD_LIMIT {
            let url = format!("{}/content?@microsoft.graph.conflictBehavior=replace", file_url);
            let request = self.client
                .put(&url)
                .header(CONTENT_TYPE, "application/json")
                .body(content);
            ensure_success(self.send(request).await?).await?;
            return Ok(());
        }

        self.upload_in_session(&file_url, content).await
    }

    /// Chunked upload through an upload session, for files over the simple PUT limit
    async fn upload_in_session(&self, file_url: &str, data: Vec<u8>) -> Result<(), ProviderError> {
        let total_size = data.len();
        let body = serde_json::json!({
            "item": {
                "@microsoft.graph.conflictBehavior": "replace"
            }
        });

        let url = format!("{}/createUploadSession", file_url);
        let response = ensure_success(self.send(self.client.post(&url).json(&body)).await?).await?;
        let session: UploadSession = response.json().await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        let mut offset = 0usize;
        while offset < total_size {
            let end = std::cmp::min(offset + UPLOAD_CHUNK_SIZE, total_size);
            let chunk = data[offset..end].to_vec();

            // The upload URL is pre-authenticated and must not carry a bearer token
            let request = self.client
                .put(&session.upload_url)
                .header("Content-Range", format!("bytes {}-{}/{}", offset, end - 1, total_size))
                .body(chunk)
                .build()
                .map_err(|e| ProviderError::Other(format!("Invalid request: {}", e)))?;
            ensure_success(send_with_retry(&self.client, request, &self.settings.retry).await?).await?;

            debug!("Uploaded bytes {}-{} of {}", offset, end - 1, total_size);
            offset = end;
        }
        Ok(())
    }

    /// Download a file from the active folder. `None` if it does not exist.
    async fn download_file(&self, name: &str) -> Result<Option<Vec<u8>>, ProviderError> {
        let url = format!("{}/content", self.api_file(name)?);
        let response = self.send(self.client.get(&url)).await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = ensure_success(response).await?;
        response_bytes_with_limit(response, self.settings.max_download_bytes).await.map(Some)
    }

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
        match self.tokens.store().load_folder(ProviderType::OneDrive) {
            Ok(folder) => self.folder = folder,
            Err(e) => warn!("Could not read saved OneDrive folder: {}", e),
        }
    }
}

#[async_trait]
impl StorageProvider for OneDriveProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::OneDrive
    }

    fn display_name(&self) -> String {
        match &self.folder {
            Some(folder) => format!("OneDrive ({})", folder.display_path),
            None => "OneDrive".to_string(),
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
        self.tokens.store().clear_folder(ProviderType::OneDrive)?;
        self.folder = None;
        info!("Disconnected from OneDrive");
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
        info!("Uploaded bundle ({} bytes) to OneDrive", size);
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
            "folder": {},
            "@microsoft.graph.conflictBehavior": self.conflict_behavior.as_str()
        });
        let url = format!("{}/me/drive/root/children", self.api_base);
        let response = ensure_success(self.send(self.client.post(&url).json(&body)).await?).await?;
        let item: DriveItem = response.json().await
            .map_err(|e| ProviderError::ParseError(e.to_string()))?;

        if item.name != name && !item.name.is_empty() {
            info!("OneDrive renamed new folder {} to {}", name, item.name);
        }
        info!("Created OneDrive folder {} ({})", name, item.id);
        Ok(item.id)
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
        self.tokens.store().save_folder(ProviderType::OneDrive, &pointer)?;
        info!("OneDrive now using folder {} ({})", pointer.display_path, pointer.folder_id);
        self.folder = Some(pointer);
        Ok(())
    }

    async fn verify_folder_access(&mut self, folder_id: &str) -> Result<bool, ProviderError> {
        self.ensure_connected().await?;
        let url = format!("{}?$select=id,name,folder", self.api_item(&OneDriveFolderRef::parse(folder_id)));
        let response = self.send(self.client.get(&url)).await?;

        match response.status().as_u16() {
            403 | 404 => {
                debug!("Folder {} not accessible ({})", folder_id, response.status());
                Ok(false)
            }
            _ => {
                let response = ensure_success(response).await?;
                let item: DriveItem = response.json().await
                    .map_err(|e| ProviderError::ParseError(e.to_string()))?;
                Ok(item.folder.is_some())
            }
        }
    }

    async fn resolve_folder(&mut self, name: &str) -> Result<String, ProviderError> {
        self.ensure_connected().await?;

        if let Some(found) = self.find_in_root(name).await? {
            debug!("Resolved {} in personal drive", name);
            return Ok(found.to_string());
        }
        if let Some(found) = self.find_in_shared(name).await? {
            debug!("Resolved {} in shared items", name);
            return Ok(found.to_string());
        }

        Err(ProviderError::RepositoryNotFoundInAnyLocation { name: name.to_string() })
    }

    async fn find_legacy_folder(&mut self, name: &str) -> Result<Option<String>, ProviderError> {
        self.ensure_connected().await?;
        let found = self.find_in_root(name).await?.map(|f| f.to_string());
        if let Some(ref id) = found {
            info!("Found legacy OneDrive folder {} ({})", name, id);
        }
        Ok(found)
    }

    fn supports_sharing(&self) -> bool {
        true
    }

    async fn share_folder(&mut self, folder_id: &str, permission: &SharePermission) -> Result<(), ProviderError> {
        self.ensure_connected().await?;
        let url = format!("{}/invite", self.api_item(&OneDriveFolderRef::parse(folder_id)));

        let body = serde_json::json!({
            "recipients": [{
                "email": permission.target
            }],
            "roles": [graph_role(&permission.role)],
            "requireSignIn": true,
            "sendInvitation": permission.notify
        });

        ensure_success(self.send(self.client.post(&url).json(&body)).await?).await?;
        info!("Shared OneDrive folder {} with {}", folder_id, permission.target);
        Ok(())
    }
}
