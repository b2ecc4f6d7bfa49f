//! In-memory provider for orchestrator and sweeper tests

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::{
    ProviderCapabilities, ProviderError, ProviderType, RecipeBundle, SharePermission, StorageMeta,
    StorageProvider,
};
use crate::credential_store::FolderPointer;

/// What the fake "cloud" holds, shared with the test for inspection
#[derive(Debug, Default)]
pub struct RemoteState {
    /// folder id -> folder name
    pub folders: HashMap<String, String>,
    pub bundles: HashMap<String, RecipeBundle>,
    pub metas: HashMap<String, StorageMeta>,
    pub denied: HashSet<String>,
    pub offline: bool,
    pub calls: Vec<String>,
}

impl RemoteState {
    pub fn calls_to(&self, prefix: &str) -> usize {
        self.calls.iter().filter(|c| c.starts_with(prefix)).count()
    }
}

pub struct FakeProvider {
    provider: ProviderType,
    capabilities: ProviderCapabilities,
    connected: bool,
    session_stored: bool,
    sign_in_accepted: bool,
    folder: Option<FolderPointer>,
    remote: Arc<Mutex<RemoteState>>,
}

impl FakeProvider {
    pub fn new(provider: ProviderType) -> (Self, Arc<Mutex<RemoteState>>) {
        let remote = Arc::new(Mutex::new(RemoteState::default()));
        let fake = Self {
            provider,
            capabilities: provider.capabilities(),
            connected: false,
            session_stored: true,
            sign_in_accepted: true,
            folder: None,
            remote: remote.clone(),
        };
        (fake, remote)
    }

    pub fn connected(mut self) -> Self {
        self.connected = true;
        self
    }

    pub fn declining_sign_in(mut self) -> Self {
        self.sign_in_accepted = false;
        self
    }

    pub fn with_capabilities(mut self, capabilities: ProviderCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn record(&self, call: String) -> std::sync::MutexGuard<'_, RemoteState> {
        let mut remote = self.remote.lock().unwrap();
        remote.calls.push(call);
        remote
    }

    fn online(&self, remote: &RemoteState) -> Result<(), ProviderError> {
        if !self.connected {
            return Err(ProviderError::NotConnected);
        }
        if remote.offline {
            return Err(ProviderError::NetworkError("offline".to_string()));
        }
        Ok(())
    }

    fn folder_id(&self) -> Result<String, ProviderError> {
        self.folder.as_ref()
            .map(|f| f.folder_id.clone())
            .ok_or_else(|| ProviderError::FolderNotFound("No active folder selected".to_string()))
    }
}

#[async_trait]
impl StorageProvider for FakeProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider
    }

    fn display_name(&self) -> String {
        format!("Fake {}", self.provider)
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    async fn connect(&mut self) -> Result<bool, ProviderError> {
        self.record("connect".to_string());
        self.connected = self.sign_in_accepted;
        Ok(self.connected)
    }

    async fn restore_session(&mut self) -> bool {
        self.record("restore".to_string());
        self.connected = self.session_stored;
        self.connected
    }

    async fn disconnect(&mut self) -> Result<(), ProviderError> {
        self.record("disconnect".to_string());
        self.connected = false;
        self.session_stored = false;
        self.folder = None;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn active_folder(&self) -> Option<FolderPointer> {
        self.folder.clone()
    }

    async fn push(&mut self, bundle: &RecipeBundle) -> Result<(), ProviderError> {
        let folder = self.folder_id();
        let mut remote = self.record("push".to_string());
        self.online(&remote)?;
        remote.bundles.insert(folder?, bundle.clone());
        Ok(())
    }

    async fn pull(&mut self) -> Result<Option<RecipeBundle>, ProviderError> {
        let folder = self.folder_id();
        let remote = self.record("pull".to_string());
        self.online(&remote)?;
        Ok(remote.bundles.get(&folder?).cloned())
    }

    async fn get_meta(&mut self) -> Result<Option<StorageMeta>, ProviderError> {
        let folder = self.folder_id();
        let remote = self.record("get_meta".to_string());
        self.online(&remote)?;
        Ok(remote.metas.get(&folder?).cloned())
    }

    async fn update_meta(&mut self, meta: &StorageMeta) -> Result<(), ProviderError> {
        let folder = self.folder_id();
        let mut remote = self.record("update_meta".to_string());
        self.online(&remote)?;
        remote.metas.insert(folder?, meta.clone());
        Ok(())
    }

    async fn create_folder(&mut self, name: &str) -> Result<String, ProviderError> {
        if !self.connected && !self.restore_session().await && !self.connect().await? {
            return Err(ProviderError::AuthenticationCancelled);
        }
        let mut remote = self.record(format!("create_folder:{}", name));
        self.online(&remote)?;
        let id = format!("folder-{}", remote.folders.len() + 1);
        remote.folders.insert(id.clone(), name.to_string());
        Ok(id)
    }

    async fn switch_repository(&mut self, folder_id: &str, name: &str) -> Result<(), ProviderError> {
        if !self.verify_folder_access(folder_id).await? {
            return Err(ProviderError::AccessDenied(format!("Folder '{}' is not accessible", name)));
        }
        self.folder = Some(FolderPointer {
            folder_id: folder_id.to_string(),
            display_path: name.to_string(),
        });
        Ok(())
    }

    async fn verify_folder_access(&mut self, folder_id: &str) -> Result<bool, ProviderError> {
        let remote = self.record(format!("verify:{}", folder_id));
        self.online(&remote)?;
        Ok(remote.folders.contains_key(folder_id) && !remote.denied.contains(folder_id))
    }

    async fn resolve_folder(&mut self, name: &str) -> Result<String, ProviderError> {
        let remote = self.record(format!("resolve:{}", name));
        self.online(&remote)?;
        remote.folders.iter()
            .find(|(_, n)| n.as_str() == name)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| ProviderError::FolderNotFound(name.to_string()))
    }

    async fn find_legacy_folder(&mut self, name: &str) -> Result<Option<String>, ProviderError> {
        let remote = self.record("find_legacy".to_string());
        self.online(&remote)?;
        Ok(remote.folders.iter()
            .filter(|(_, folder_name)| folder_name.as_str() == name)
            .map(|(id, _)| id.clone())
            .min())
    }

    fn supports_sharing(&self) -> bool {
        true
    }

    async fn share_folder(&mut self, folder_id: &str, permission: &SharePermission) -> Result<(), ProviderError> {
        let remote = self.record(format!("share:{}:{}:{}", folder_id, permission.role, permission.target));
        self.online(&remote)?;
        Ok(())
    }
}
