// Recipe Sync Orchestrator
// Routes bundle/meta traffic to the active repository's provider

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::credential_store::CredentialStore;
use crate::deep_link::{DeepLinkError, RepositoryLink};
use crate::providers::{
    shared, NativeSignIn, ProviderCapabilities, ProviderError, ProviderFactory, ProviderType,
    RecipeBundle, SharePermission, SharedProvider, StorageMeta, StorageProvider,
};
use crate::registry::{RegistryError, Repository, RepositoryRegistry, VerificationState};
use crate::sweeper::{spawn_sweep, SweepHandle};

/// Display name of the repository created when none exists yet
pub const DEFAULT_REPOSITORY_NAME: &str = "Default";

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("{0} is not available")]
    ProviderUnavailable(ProviderType),
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    DeepLink(#[from] DeepLinkError),
}

/// Sync orchestrator: registry + one shared adapter per provider
pub struct SyncOrchestrator {
    registry: Arc<RepositoryRegistry>,
    providers: HashMap<ProviderType, SharedProvider>,
    default_provider: ProviderType,
    legacy_folder_name: String,
    last_sweep: std::sync::Mutex<Option<SweepHandle>>,
}

impl SyncOrchestrator {
    pub fn new(registry: Arc<RepositoryRegistry>, default_provider: ProviderType, legacy_folder_name: &str) -> Self {
        Self {
            registry,
            providers: HashMap::new(),
            default_provider,
            legacy_folder_name: legacy_folder_name.to_string(),
            last_sweep: std::sync::Mutex::new(None),
        }
    }

    /// Build every supported adapter from configuration
    pub fn from_config(
        config: &SyncConfig,
        registry: Arc<RepositoryRegistry>,
        store: Arc<dyn CredentialStore>,
        native: Option<Arc<dyn NativeSignIn>>,
    ) -> Result<Self, SyncError> {
        let mut orchestrator = Self::new(registry, config.default_provider, &config.legacy_folder_name);
        for provider in ProviderFactory::supported_types() {
            let adapter = ProviderFactory::create(provider, config, store.clone(), native.clone())?;
            orchestrator = orchestrator.with_provider(adapter);
        }
        Ok(orchestrator)
    }

    pub fn with_provider(mut self, adapter: Box<dyn StorageProvider>) -> Self {
        self.providers.insert(adapter.provider_type(), shared(adapter));
        self
    }

    pub fn registry(&self) -> &Arc<RepositoryRegistry> {
        &self.registry
    }

    pub fn provider(&self, provider: ProviderType) -> Result<SharedProvider, SyncError> {
        self.providers
            .get(&provider)
            .cloned()
            .ok_or(SyncError::ProviderUnavailable(provider))
    }

    pub async fn capabilities(&self, provider: ProviderType) -> Result<ProviderCapabilities, SyncError> {
        Ok(self.provider(provider)?.lock().await.capabilities())
    }

    pub async fn is_connected(&self, provider: ProviderType) -> bool {
        match self.providers.get(&provider) {
            Some(adapter) => adapter.lock().await.is_connected(),
            None => false,
        }
    }

    /// Most recent verification sweep, if any ran
    pub fn last_sweep(&self) -> Option<SweepHandle> {
        self.last_sweep.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    // ============ Sessions ============

    /// Interactive sign-in. `Ok(false)` when the user cancelled.
    pub async fn connect(&self, provider: ProviderType) -> Result<bool, SyncError> {
        let connected = self.provider(provider)?.lock().await.connect().await?;
        if connected {
            self.after_connect(provider).await;
        }
        Ok(connected)
    }

    /// Silently restore every provider with stored credentials
    pub async fn restore_sessions(&self) -> Vec<ProviderType> {
        let mut restored = Vec::new();
        for provider in ProviderType::all() {
            let Some(adapter) = self.providers.get(&provider) else {
                continue;
            };
            let ok = adapter.lock().await.restore_session().await;
            if ok {
                self.after_connect(provider).await;
                restored.push(provider);
            }
        }
        restored
    }

    pub async fn disconnect(&self, provider: ProviderType) -> Result<(), SyncError> {
        self.provider(provider)?.lock().await.disconnect().await?;
        Ok(())
    }

    async fn after_connect(&self, provider: ProviderType) {
        if let Err(e) = self.migrate_legacy(provider).await {
            warn!("{} legacy folder lookup failed: {}", provider, e);
        }
        if let Err(e) = self.sweep(provider) {
            warn!("Could not start verification sweep: {}", e);
        }
    }

    /// Start a verification sweep for `provider` in the background
    pub fn sweep(&self, provider: ProviderType) -> Result<SweepHandle, SyncError> {
        let handle = spawn_sweep(provider, self.provider(provider)?, self.registry.clone());
        *self.last_sweep.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle.clone());
        Ok(handle)
    }

    /// Register the folder used before repositories existed, once per provider
    async fn migrate_legacy(&self, provider: ProviderType) -> Result<Option<Repository>, SyncError> {
        if self.registry.is_legacy_migration_done(provider).await {
            return Ok(None);
        }
        if self.registry.has_repositories_for(provider).await {
            self.registry.mark_legacy_migration_done(provider).await?;
            return Ok(None);
        }

        let found = self.provider(provider)?.lock().await
            .find_legacy_folder(&self.legacy_folder_name).await?;
        self.registry.mark_legacy_migration_done(provider).await?;

        let Some(folder_id) = found else {
            debug!("No legacy {} folder found", provider);
            return Ok(None);
        };
        let activate = self.registry.get_active_repository().await.is_none();
        let repo = self.registry
            .add_repository(DEFAULT_REPOSITORY_NAME, &folder_id, provider, activate, false)
            .await?;
        info!("Migrated legacy {} folder as repository {}", provider, repo.id);
        Ok(Some(repo))
    }

    // ============ Repository resolution ============

    /// Active repository, falling back to the legacy folder on the default
    /// provider and creating that folder only when it does not exist
    async fn active_or_default(&self) -> Result<Repository, SyncError> {
        if let Some(repo) = self.registry.get_active_repository().await {
            return Ok(repo);
        }

        let provider = self.default_provider;
        let folder_id = {
            let mut adapter = self.provider(provider)?.lock_owned().await;
            if !adapter.is_connected() && !adapter.restore_session().await && !adapter.connect().await? {
                return Err(ProviderError::AuthenticationCancelled.into());
            }
            match adapter.find_legacy_folder(&self.legacy_folder_name).await? {
                Some(folder_id) => {
                    info!("Using existing {} folder '{}'", provider, self.legacy_folder_name);
                    folder_id
                }
                None => adapter.create_folder(&self.legacy_folder_name).await?,
            }
        };
        self.registry.mark_legacy_migration_done(provider).await?;

        let repo = self.registry
            .add_repository(DEFAULT_REPOSITORY_NAME, &folder_id, provider, true, false)
            .await?;
        info!("Registered default {} repository {}", provider, repo.id);
        Ok(repo)
    }

    /// Active repository and its adapter, locked and pointed at the repository's folder.
    /// The guard is held until the caller's transfer finishes.
    async fn prepare(&self) -> Result<(Repository, OwnedMutexGuard<Box<dyn StorageProvider>>), SyncError> {
        let repo = self.active_or_default().await?;
        let mut adapter = self.provider(repo.provider)?.lock_owned().await;
        let current = adapter.active_folder().map(|f| f.folder_id);
        if current.as_deref() != Some(repo.folder_id.as_str()) {
            debug!("Switching {} adapter to {}", repo.provider, repo.name);
            adapter.switch_repository(&repo.folder_id, &repo.name).await?;
        }
        Ok((repo, adapter))
    }

    // ============ Bundle and meta ============

    pub async fn push(&self, bundle: &RecipeBundle) -> Result<(), SyncError> {
        let (repo, mut adapter) = self.prepare().await?;
        adapter.push(bundle).await?;
        drop(adapter);
        self.registry.update_last_synced(&repo.id).await?;
        info!("Pushed bundle to {}", repo.name);
        Ok(())
    }

    /// `Ok(None)` when the repository holds no bundle yet
    pub async fn pull(&self) -> Result<Option<RecipeBundle>, SyncError> {
        let (repo, mut adapter) = self.prepare().await?;
        let bundle = adapter.pull().await?;
        drop(adapter);
        if bundle.is_some() {
            self.registry.update_last_synced(&repo.id).await?;
            info!("Pulled bundle from {}", repo.name);
        } else {
            debug!("Repository {} has no bundle yet", repo.name);
        }
        Ok(bundle)
    }

    pub async fn get_meta(&self) -> Result<Option<StorageMeta>, SyncError> {
        let provider = match self.registry.get_active_repository().await {
            Some(repo) => repo.provider,
            None => self.default_provider,
        };
        if !self.capabilities(provider).await?.supports_fast_meta_check {
            return Ok(None);
        }

        let (_, mut adapter) = self.prepare().await?;
        Ok(adapter.get_meta().await?)
    }

    pub async fn update_meta(&self, meta: &StorageMeta) -> Result<(), SyncError> {
        let (_, mut adapter) = self.prepare().await?;
        adapter.update_meta(meta).await?;
        Ok(())
    }

    // ============ Repository management ============

    /// Create a remote folder and make it the active, verified repository
    pub async fn create_repository(&self, provider: ProviderType, name: &str) -> Result<Repository, SyncError> {
        let folder_id = self.provider(provider)?.lock().await.create_folder(name).await?;
        let repo = self.registry.add_repository(name, &folder_id, provider, true, false).await?;
        Ok(repo)
    }

    /// Verify access and make `id` the active repository.
    /// Inaccessible pending repositories are marked access-denied.
    pub async fn switch_repository(&self, id: &str) -> Result<Repository, SyncError> {
        let repo = self.registry
            .get_repository(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let adapter = self.provider(repo.provider)?;

        let switched = adapter.lock().await.switch_repository(&repo.folder_id, &repo.name).await;
        match switched {
            Ok(()) => {
                if repo.verification_state() == VerificationState::Pending {
                    self.registry.mark_as_verified(&repo.id).await?;
                }
                Ok(self.registry.set_active_repository(&repo.id).await?)
            }
            Err(e @ ProviderError::AccessDenied(_)) => {
                self.registry.mark_as_access_denied(&repo.id).await?;
                Err(e.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Register a repository someone shared through a deep link.
    /// It stays pending until the next sweep confirms access.
    pub async fn register_shared_repository(&self, link: &str) -> Result<Repository, SyncError> {
        let link = RepositoryLink::parse(link)?;
        self.provider(link.provider)?;
        let repo = self.registry
            .add_repository(&link.name, &link.folder_id, link.provider, false, true)
            .await?;
        Ok(repo)
    }

    pub async fn remove_repository(&self, id: &str) -> Result<Repository, SyncError> {
        Ok(self.registry.remove_repository(id).await?)
    }

    /// Grant `email` write access and return the link to send them
    pub async fn share_repository(&self, id: &str, email: &str, notify: bool) -> Result<String, SyncError> {
        let repo = self.registry
            .get_repository(id)
            .await
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        let adapter = self.provider(repo.provider)?;
        adapter.lock().await
            .share_folder(&repo.folder_id, &SharePermission::writer(email, notify))
            .await?;
        Ok(RepositoryLink::new(repo.provider, &repo.folder_id, &repo.name).to_link())
    }
}
