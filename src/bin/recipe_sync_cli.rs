//! RecipeSync CLI: manage cloud repositories and move recipe bundles
//!
//! Usage:
//!   recipe-sync-cli connect google_drive      Sign in (opens the browser)
//!   recipe-sync-cli repos                     List registered repositories
//!   recipe-sync-cli create one_drive Family   Create and activate a repository
//!   recipe-sync-cli push recipes.json         Upload a bundle to the active repository
//!   recipe-sync-cli pull [out.json]           Download the active bundle

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use recipe_sync::config::{get_config_path, load_sync_config, validate_config, validate_provider};
use recipe_sync::credential_store::{open_default_store, CredentialStore};
use recipe_sync::{ProviderType, RecipeBundle, RepositoryRegistry, StorageMeta, SweepStatus, SyncOrchestrator};

#[derive(Parser)]
#[command(
    name = "recipe-sync-cli",
    about = "RecipeSync CLI: sync recipe bundles with Google Drive and OneDrive",
    version
)]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Sign in to a provider
    Connect {
        #[arg(value_parser = parse_provider)]
        provider: ProviderType,
    },
    /// Sign out and forget stored tokens (remote data is kept)
    Disconnect {
        #[arg(value_parser = parse_provider)]
        provider: ProviderType,
    },
    /// Show connection state and configuration
    Status,
    /// List registered repositories
    Repos,
    /// Create a remote folder and make it the active repository
    Create {
        #[arg(value_parser = parse_provider)]
        provider: ProviderType,
        name: String,
    },
    /// Make a repository active
    Switch {
        id: String,
    },
    /// Register a repository from a recipesync:// link
    AddShared {
        link: String,
    },
    /// Remove a repository from this device (remote folder is kept)
    Remove {
        id: String,
    },
    /// Upload a bundle file to the active repository
    Push {
        file: PathBuf,
    },
    /// Download the active repository's bundle
    Pull {
        /// Output file (default: stdout)
        output: Option<PathBuf>,
    },
    /// Show or update the metadata sidecar
    Meta {
        /// Write a new recipe count instead of reading
        #[arg(long)]
        set_count: Option<u64>,
    },
    /// Give another account write access to a repository
    Share {
        id: String,
        email: String,
        /// Send a notification email
        #[arg(long)]
        notify: bool,
    },
}

fn parse_provider(value: &str) -> std::result::Result<ProviderType, String> {
    ProviderType::from_str(value).map_err(|e| e.to_string())
}

fn init_logging(verbose: bool) {
    let default = if verbose { "recipe_sync=debug" } else { "recipe_sync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = load_sync_config();
    validate_config(&config).map_err(anyhow::Error::msg).context("Invalid configuration")?;

    let store: Arc<dyn CredentialStore> = Arc::from(open_default_store(&config.credentials_dir()));
    let registry = Arc::new(
        RepositoryRegistry::open(config.registry_path())
            .await
            .context("Could not open repository registry")?,
    );
    let sync = SyncOrchestrator::from_config(&config, registry.clone(), store, None)?;

    let restored = sync.restore_sessions().await;
    tracing::debug!("Restored sessions: {:?}", restored);

    match cli.command {
        Commands::Connect { provider } => {
            validate_provider(&config, provider).map_err(anyhow::Error::msg)?;
            if sync.connect(provider).await? {
                println!("Connected to {}", provider);
            } else {
                bail!("Sign-in to {} was cancelled", provider);
            }
        }
        Commands::Disconnect { provider } => {
            sync.disconnect(provider).await?;
            println!("Disconnected from {}", provider);
        }
        Commands::Status => {
            println!("Config: {}", get_config_path().display());
            println!("Registry: {}", config.registry_path().display());
            for provider in ProviderType::all() {
                let state = if sync.is_connected(provider).await { "connected" } else { "not connected" };
                println!("{:<14} {}", provider.to_string(), state);
            }
        }
        Commands::Repos => {
            let repos = registry.load_repositories().await;
            if repos.is_empty() {
                println!("No repositories registered");
            }
            for repo in repos {
                let marker = if repo.is_active { "*" } else { " " };
                let synced = repo.last_synced
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{} {}  {:<24} {:<14} {:<14} last sync: {}",
                    marker, repo.id, repo.name, repo.provider.to_string(),
                    format!("{:?}", repo.verification_state()), synced
                );
            }
        }
        Commands::Create { provider, name } => {
            let repo = sync.create_repository(provider, &name).await?;
            println!("Created {} ({}) on {}", repo.name, repo.id, provider);
        }
        Commands::Switch { id } => {
            let repo = sync.switch_repository(&id).await?;
            println!("Active repository: {}", repo.name);
        }
        Commands::AddShared { link } => {
            let repo = sync.register_shared_repository(&link).await?;
            println!("Registered {} ({}); access will be verified on next connect", repo.name, repo.id);
        }
        Commands::Remove { id } => {
            let repo = sync.remove_repository(&id).await?;
            println!("Removed {} from this device", repo.name);
        }
        Commands::Push { file } => {
            let bytes = std::fs::read(&file).with_context(|| format!("Could not read {}", file.display()))?;
            let bundle = RecipeBundle::from_bytes(&bytes)?;
            sync.push(&bundle).await?;
            println!("Pushed {}", file.display());
        }
        Commands::Pull { output } => match sync.pull().await? {
            Some(bundle) => {
                let json = serde_json::to_string_pretty(&bundle)?;
                match output {
                    Some(path) => {
                        std::fs::write(&path, json).with_context(|| format!("Could not write {}", path.display()))?;
                        println!("Saved bundle to {}", path.display());
                    }
                    None => println!("{}", json),
                }
            }
            None => println!("The active repository has no bundle yet"),
        },
        Commands::Meta { set_count } => match set_count {
            Some(count) => {
                sync.update_meta(&StorageMeta::new(count)).await?;
                println!("Metadata updated");
            }
            None => match sync.get_meta().await? {
                Some(meta) => println!("{}", serde_json::to_string_pretty(&meta)?),
                None => println!("No metadata available"),
            },
        },
        Commands::Share { id, email, notify } => {
            let link = sync.share_repository(&id, &email, notify).await?;
            println!("Shared with {}. Send them this link:\n{}", email, link);
        }
    }

    // Let a verification sweep started by this run finish before exiting
    if let Some(sweep) = sync.last_sweep() {
        if let SweepStatus::Failed(reason) = sweep.wait().await {
            tracing::warn!("Verification sweep failed: {}", reason);
        }
    }

    Ok(())
}
