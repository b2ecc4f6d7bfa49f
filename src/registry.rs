// Repository Registry
// Named cloud folders the app can sync with, persisted as JSON

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::providers::ProviderType;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Repository not found: {0}")]
    NotFound(String),
    #[error("Registry I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Registry file is invalid: {0}")]
    Serialization(String),
}

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

/// Where a repository stands in the access verification lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationState {
    Pending,
    Verified,
    AccessDenied,
}

/// A registered cloud folder used as a sync target
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Repository {
    pub id: String,
    pub name: String,
    pub provider: ProviderType,
    /// Provider-specific remote identifier
    pub folder_id: String,
    #[serde(default)]
    pub is_active: bool,
    #[serde(default)]
    pub is_pending_verification: bool,
    #[serde(default)]
    pub access_denied: bool,
    #[serde(default)]
    pub last_synced: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn verification_state(&self) -> VerificationState {
        if self.access_denied {
            VerificationState::AccessDenied
        } else if self.is_pending_verification {
            VerificationState::Pending
        } else {
            VerificationState::Verified
        }
    }
}

/// On-disk layout of the registry file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct RegistryFile {
    #[serde(default)]
    repositories: Vec<Repository>,
    /// Providers whose pre-registry folder lookup already ran
    #[serde(default)]
    legacy_migrated: Vec<ProviderType>,
}

impl RegistryFile {
    fn find_mut(&mut self, id: &str) -> Result<&mut Repository, RegistryError> {
        self.repositories
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))
    }

    fn clear_active(&mut self) {
        for repo in self.repositories.iter_mut() {
            repo.is_active = false;
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Repository registry backed by a JSON file, or memory only.
///
/// Every mutation runs under one async lock and is written out before the
/// lock is released. If the write fails the in-memory state is rolled back,
/// so readers never observe a change that was not persisted.
pub struct RepositoryRegistry {
    path: Option<PathBuf>,
    state: tokio::sync::Mutex<RegistryFile>,
}

impl RepositoryRegistry {
    /// Open the registry at `path`. A missing file is an empty registry.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, RegistryError> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(json) => serde_json::from_str(&json)
                .map_err(|e| RegistryError::Serialization(format!("{}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => RegistryFile::default(),
            Err(e) => return Err(e.into()),
        };
        debug!("Repository registry opened at {}", path.display());
        Ok(Self {
            path: Some(path),
            state: tokio::sync::Mutex::new(state),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: tokio::sync::Mutex::new(RegistryFile::default()),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, state: &RegistryFile) -> Result<(), RegistryError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(state)
            .map_err(|e| RegistryError::Serialization(e.to_string()))?;

        // Atomic write: temp file + rename
        let tmp_path = path.with_extension("json.tmp");
        tokio::fs::write(&tmp_path, json).await?;
        tokio::fs::rename(&tmp_path, path).await?;
        Ok(())
    }

    /// Apply `change` and persist it, or leave the registry untouched
    async fn mutate<T>(
        &self,
        change: impl FnOnce(&mut RegistryFile) -> Result<T, RegistryError>,
    ) -> Result<T, RegistryError> {
        let mut state = self.state.lock().await;
        let snapshot = state.clone();

        let result = match change(&mut *state) {
            Ok(value) => self.persist(&*state).await.map(|_| value),
            Err(e) => Err(e),
        };
        if let Err(ref e) = result {
            warn!("Registry change rolled back: {}", e);
            *state = snapshot;
        }
        result
    }

    pub async fn load_repositories(&self) -> Vec<Repository> {
        self.state.lock().await.repositories.clone()
    }

    /// Register a folder. Registering the same provider folder twice returns
    /// the existing record (activated if requested).
    pub async fn add_repository(
        &self,
        name: &str,
        folder_id: &str,
        provider: ProviderType,
        is_active: bool,
        is_pending_verification: bool,
    ) -> Result<Repository, RegistryError> {
        self.mutate(|state| {
            let existing = state.repositories
                .iter()
                .position(|r| r.provider == provider && r.folder_id == folder_id);

            if let Some(index) = existing {
                if is_active {
                    state.clear_active();
                    state.repositories[index].is_active = true;
                }
                debug!("Repository {} already registered", state.repositories[index].id);
                return Ok(state.repositories[index].clone());
            }

            if is_active {
                state.clear_active();
            }
            let repo = Repository {
                id: uuid::Uuid::new_v4().to_string(),
                name: name.to_string(),
                provider,
                folder_id: folder_id.to_string(),
                is_active,
                is_pending_verification,
                access_denied: false,
                last_synced: None,
                created_at: Utc::now(),
            };
            state.repositories.push(repo.clone());
            info!("Registered repository {} ({}) on {}", repo.name, repo.id, provider);
            Ok(repo)
        })
        .await
    }

    /// Make `id` the only active repository
    pub async fn set_active_repository(&self, id: &str) -> Result<Repository, RegistryError> {
        self.mutate(|state| {
            state.find_mut(id)?;
            state.clear_active();
            let repo = state.find_mut(id)?;
            repo.is_active = true;
            info!("Active repository is now {} ({})", repo.name, repo.id);
            Ok(repo.clone())
        })
        .await
    }

    /// Forget a repository locally. The remote folder is left alone.
    pub async fn remove_repository(&self, id: &str) -> Result<Repository, RegistryError> {
        self.mutate(|state| {
            let index = state.repositories
                .iter()
                .position(|r| r.id == id)
                .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
            let removed = state.repositories.remove(index);
            info!("Removed repository {} ({})", removed.name, removed.id);
            Ok(removed)
        })
        .await
    }

    /// Pending -> Verified. A no-op once the repository left pending.
    pub async fn mark_as_verified(&self, id: &str) -> Result<VerificationState, RegistryError> {
        self.mutate(|state| {
            let repo = state.find_mut(id)?;
            if repo.verification_state() == VerificationState::Pending {
                repo.is_pending_verification = false;
                info!("Repository {} verified", repo.name);
            }
            Ok(repo.verification_state())
        })
        .await
    }

    /// Pending -> AccessDenied. A no-op once the repository left pending.
    pub async fn mark_as_access_denied(&self, id: &str) -> Result<VerificationState, RegistryError> {
        self.mutate(|state| {
            let repo = state.find_mut(id)?;
            if repo.verification_state() == VerificationState::Pending {
                repo.is_pending_verification = false;
                repo.access_denied = true;
                warn!("Repository {} is not accessible", repo.name);
            }
            Ok(repo.verification_state())
        })
        .await
    }

    pub async fn update_last_synced(&self, id: &str) -> Result<DateTime<Utc>, RegistryError> {
        self.mutate(|state| {
            let now = Utc::now();
            state.find_mut(id)?.last_synced = Some(now);
            Ok(now)
        })
        .await
    }

    pub async fn get_active_repository(&self) -> Option<Repository> {
        self.state.lock().await.repositories.iter().find(|r| r.is_active).cloned()
    }

    pub async fn get_pending_repositories(&self) -> Vec<Repository> {
        self.state.lock().await.repositories
            .iter()
            .filter(|r| r.verification_state() == VerificationState::Pending)
            .cloned()
            .collect()
    }

    pub async fn get_repository(&self, id: &str) -> Option<Repository> {
        self.state.lock().await.repositories.iter().find(|r| r.id == id).cloned()
    }

    pub async fn find_by_folder(&self, provider: ProviderType, folder_id: &str) -> Option<Repository> {
        self.state.lock().await.repositories
            .iter()
            .find(|r| r.provider == provider && r.folder_id == folder_id)
            .cloned()
    }

    pub async fn has_repositories_for(&self, provider: ProviderType) -> bool {
        self.state.lock().await.repositories.iter().any(|r| r.provider == provider)
    }

    pub async fn is_legacy_migration_done(&self, provider: ProviderType) -> bool {
        self.state.lock().await.legacy_migrated.contains(&provider)
    }

    pub async fn mark_legacy_migration_done(&self, provider: ProviderType) -> Result<(), RegistryError> {
        self.mutate(|state| {
            if !state.legacy_migrated.contains(&provider) {
                state.legacy_migrated.push(provider);
            }
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    async fn active_count(registry: &RepositoryRegistry) -> usize {
        registry.load_repositories().await.iter().filter(|r| r.is_active).count()
    }

    #[tokio::test]
    async fn test_add_active_clears_previous_active() {
        let registry = RepositoryRegistry::in_memory();
        let a = registry.add_repository("A", "FA", ProviderType::GoogleDrive, true, false).await.unwrap();
        let b = registry.add_repository("B", "FB", ProviderType::OneDrive, true, false).await.unwrap();

        assert_eq!(active_count(&registry).await, 1);
        assert_eq!(registry.get_active_repository().await.unwrap().id, b.id);
        assert!(!registry.get_repository(&a.id).await.unwrap().is_active);
    }

    #[tokio::test]
    async fn test_switch_a_b_a() {
        let registry = RepositoryRegistry::in_memory();
        let a = registry.add_repository("A", "FA", ProviderType::GoogleDrive, true, false).await.unwrap();
        let b = registry.add_repository("B", "FB", ProviderType::GoogleDrive, false, false).await.unwrap();

        registry.set_active_repository(&b.id).await.unwrap();
        assert_eq!(active_count(&registry).await, 1);
        registry.set_active_repository(&a.id).await.unwrap();
        assert_eq!(active_count(&registry).await, 1);
        assert_eq!(registry.get_active_repository().await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_set_active_unknown_id_keeps_state() {
        let registry = RepositoryRegistry::in_memory();
        let a = registry.add_repository("A", "FA", ProviderType::GoogleDrive, true, false).await.unwrap();

        assert!(matches!(
            registry.set_active_repository("nope").await,
            Err(RegistryError::NotFound(_))
        ));
        assert_eq!(registry.get_active_repository().await.unwrap().id, a.id);
    }

    #[tokio::test]
    async fn test_duplicate_folder_returns_existing() {
        let registry = RepositoryRegistry::in_memory();
        let first = registry.add_repository("Shared", "F9", ProviderType::OneDrive, false, true).await.unwrap();
        let second = registry.add_repository("Shared again", "F9", ProviderType::OneDrive, true, true).await.unwrap();

        assert_eq!(first.id, second.id);
        assert!(second.is_active);
        assert_eq!(registry.load_repositories().await.len(), 1);
    }

    #[tokio::test]
    async fn test_remove_active_leaves_none_active() {
        let registry = RepositoryRegistry::in_memory();
        let a = registry.add_repository("A", "FA", ProviderType::GoogleDrive, true, false).await.unwrap();
        registry.remove_repository(&a.id).await.unwrap();

        assert!(registry.get_active_repository().await.is_none());
        assert!(matches!(registry.remove_repository(&a.id).await, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_verification_transitions_are_terminal() {
        let registry = RepositoryRegistry::in_memory();
        let r = registry.add_repository("R", "F1", ProviderType::GoogleDrive, false, true).await.unwrap();
        assert_eq!(r.verification_state(), VerificationState::Pending);
        assert_eq!(registry.get_pending_repositories().await.len(), 1);

        assert_eq!(registry.mark_as_verified(&r.id).await.unwrap(), VerificationState::Verified);
        assert_eq!(registry.mark_as_verified(&r.id).await.unwrap(), VerificationState::Verified);
        assert_eq!(registry.mark_as_access_denied(&r.id).await.unwrap(), VerificationState::Verified);

        let d = registry.add_repository("D", "F2", ProviderType::GoogleDrive, false, true).await.unwrap();
        assert_eq!(registry.mark_as_access_denied(&d.id).await.unwrap(), VerificationState::AccessDenied);
        assert_eq!(registry.mark_as_verified(&d.id).await.unwrap(), VerificationState::AccessDenied);

        assert!(registry.get_pending_repositories().await.is_empty());
        let stored = registry.get_repository(&d.id).await.unwrap();
        assert!(stored.access_denied);
        assert!(!stored.is_pending_verification);
    }

    #[tokio::test]
    async fn test_update_last_synced() {
        let registry = RepositoryRegistry::in_memory();
        let r = registry.add_repository("R", "F1", ProviderType::OneDrive, true, false).await.unwrap();
        assert!(r.last_synced.is_none());

        let at = registry.update_last_synced(&r.id).await.unwrap();
        assert_eq!(registry.get_repository(&r.id).await.unwrap().last_synced, Some(at));
    }

    #[tokio::test]
    async fn test_file_registry_persists_across_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repositories.json");

        let registry = RepositoryRegistry::open(&path).await.unwrap();
        let r = registry.add_repository("Family", "F1", ProviderType::GoogleDrive, true, true).await.unwrap();
        registry.mark_legacy_migration_done(ProviderType::GoogleDrive).await.unwrap();
        drop(registry);

        let reopened = RepositoryRegistry::open(&path).await.unwrap();
        let repos = reopened.load_repositories().await;
        assert_eq!(repos, vec![r]);
        assert!(reopened.is_legacy_migration_done(ProviderType::GoogleDrive).await);
        assert!(!reopened.is_legacy_migration_done(ProviderType::OneDrive).await);
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_persist_rolls_back() {
        let dir = tempfile::tempdir().unwrap();
        let parent = dir.path().join("state");
        let registry = RepositoryRegistry::open(parent.join("repositories.json")).await.unwrap();
        // A plain file where the directory should go makes every write fail
        std::fs::write(&parent, b"file").unwrap();

        let result = registry.add_repository("A", "FA", ProviderType::GoogleDrive, true, false).await;

        assert!(matches!(result, Err(RegistryError::Io(_))));
        assert!(registry.load_repositories().await.is_empty());
    }

    #[tokio::test]
    async fn test_corrupt_registry_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("repositories.json");
        std::fs::write(&path, b"{ not json").unwrap();

        assert!(matches!(
            RepositoryRegistry::open(&path).await,
            Err(RegistryError::Serialization(_))
        ));
    }
}
