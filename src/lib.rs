// RecipeSync - external storage sync for the recipe app
// Repositories (cloud folders) on Google Drive and OneDrive, one bundle + meta file each

pub mod config;
pub mod credential_store;
pub mod deep_link;
pub mod providers;
pub mod registry;
pub mod sweeper;
pub mod sync_engine;

pub use config::{load_sync_config, save_sync_config, SyncConfig};
pub use credential_store::{CredentialError, CredentialStore, FolderPointer, StoredCredentials};
pub use deep_link::{DeepLinkError, RepositoryLink};
pub use providers::{
    ProviderCapabilities, ProviderError, ProviderType, RecipeBundle, StorageMeta, StorageProvider,
};
pub use registry::{RegistryError, Repository, RepositoryRegistry, VerificationState};
pub use sweeper::{SweepHandle, SweepReport, SweepStatus};
pub use sync_engine::{SyncError, SyncOrchestrator};
