// Pending-Verification Sweeper
// Confirms access to repositories registered before access was known

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::providers::{ProviderType, SharedProvider};
use crate::registry::{RegistryError, RepositoryRegistry, VerificationState};

/// Outcome of one pass over the pending repositories of a provider
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub verified: Vec<String>,
    pub denied: Vec<String>,
    /// Left pending because the probe failed (offline, server error)
    pub unchanged: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SweepStatus {
    Running,
    Finished(SweepReport),
    Failed(String),
}

/// Observer for a sweep running in the background
#[derive(Debug, Clone)]
pub struct SweepHandle {
    provider: ProviderType,
    status: watch::Receiver<SweepStatus>,
}

impl SweepHandle {
    pub fn provider(&self) -> ProviderType {
        self.provider
    }

    pub fn status(&self) -> SweepStatus {
        self.status.borrow().clone()
    }

    pub fn is_finished(&self) -> bool {
        !matches!(*self.status.borrow(), SweepStatus::Running)
    }

    /// Wait until the sweep has finished or failed
    pub async fn wait(&self) -> SweepStatus {
        let mut status = self.status.clone();
        let finished = status.wait_for(|s| !matches!(s, SweepStatus::Running)).await
            .map(|done| done.clone());
        finished.unwrap_or_else(|_| SweepStatus::Failed("Sweep ended without reporting".to_string()))
    }
}

/// Verify every pending repository of `provider` once.
///
/// 403/404 marks the repository access-denied, success marks it verified,
/// any other failure leaves it pending for the next connect.
pub async fn run_sweep(
    provider: ProviderType,
    adapter: &SharedProvider,
    registry: &RepositoryRegistry,
) -> Result<SweepReport, RegistryError> {
    let mut report = SweepReport::default();
    let pending: Vec<_> = registry.get_pending_repositories().await
        .into_iter()
        .filter(|r| r.provider == provider)
        .collect();

    if pending.is_empty() {
        debug!("No pending {} repositories to verify", provider);
        return Ok(report);
    }

    for repo in pending {
        let probe = adapter.lock().await.verify_folder_access(&repo.folder_id).await;
        match probe {
            Ok(true) => {
                if registry.mark_as_verified(&repo.id).await? == VerificationState::Verified {
                    report.verified.push(repo.id);
                }
            }
            Ok(false) => {
                if registry.mark_as_access_denied(&repo.id).await? == VerificationState::AccessDenied {
                    report.denied.push(repo.id);
                }
            }
            Err(e) => {
                warn!("Could not verify repository {}: {}", repo.name, e);
                report.unchanged.push(repo.id);
            }
        }
    }

    Ok(report)
}

/// Run a sweep on a detached task and return a handle to observe it
pub fn spawn_sweep(
    provider: ProviderType,
    adapter: SharedProvider,
    registry: Arc<RepositoryRegistry>,
) -> SweepHandle {
    let (tx, rx) = watch::channel(SweepStatus::Running);

    let worker = tokio::spawn(async move { run_sweep(provider, &adapter, &registry).await });

    // Supervisor: a panicking worker still ends in a terminal status
    tokio::spawn(async move {
        let status = match worker.await {
            Ok(Ok(report)) => {
                info!(
                    "{} verification sweep: {} verified, {} denied, {} unchanged",
                    provider, report.verified.len(), report.denied.len(), report.unchanged.len()
                );
                SweepStatus::Finished(report)
            }
            Ok(Err(e)) => {
                warn!("{} verification sweep aborted: {}", provider, e);
                SweepStatus::Failed(e.to_string())
            }
            Err(e) => {
                error!("{} verification sweep task failed: {}", provider, e);
                SweepStatus::Failed(e.to_string())
            }
        };
        let _ = tx.send(status);
    });

    SweepHandle { provider, status: rx }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::fake::FakeProvider;
    use crate::providers::shared;

    async fn fixture() -> (SharedProvider, Arc<std::sync::Mutex<crate::providers::fake::RemoteState>>, Arc<RepositoryRegistry>) {
        let (fake, remote) = FakeProvider::new(ProviderType::GoogleDrive);
        (shared(Box::new(fake.connected())), remote, Arc::new(RepositoryRegistry::in_memory()))
    }

    #[tokio::test]
    async fn test_pending_repository_becomes_verified() {
        let (adapter, remote, registry) = fixture().await;
        remote.lock().unwrap().folders.insert("F1".to_string(), "Family".to_string());
        let r1 = registry.add_repository("Family", "F1", ProviderType::GoogleDrive, false, true).await.unwrap();

        let report = run_sweep(ProviderType::GoogleDrive, &adapter, &registry).await.unwrap();
        assert_eq!(report.verified, vec![r1.id.clone()]);

        let stored = registry.get_repository(&r1.id).await.unwrap();
        assert!(!stored.is_pending_verification);
        assert!(!stored.access_denied);
    }

    #[tokio::test]
    async fn test_mixed_outcomes() {
        let (adapter, remote, registry) = fixture().await;
        {
            let mut remote = remote.lock().unwrap();
            remote.folders.insert("OK".to_string(), "Ok".to_string());
            remote.folders.insert("NOPE".to_string(), "Nope".to_string());
            remote.denied.insert("NOPE".to_string());
        }
        let ok = registry.add_repository("Ok", "OK", ProviderType::GoogleDrive, false, true).await.unwrap();
        let nope = registry.add_repository("Nope", "NOPE", ProviderType::GoogleDrive, false, true).await.unwrap();
        let gone = registry.add_repository("Gone", "GONE", ProviderType::GoogleDrive, false, true).await.unwrap();
        let other = registry.add_repository("Other", "X", ProviderType::OneDrive, false, true).await.unwrap();

        let report = run_sweep(ProviderType::GoogleDrive, &adapter, &registry).await.unwrap();
        assert_eq!(report.verified, vec![ok.id]);
        assert_eq!(report.denied, vec![nope.id, gone.id]);
        assert!(report.unchanged.is_empty());

        // Other providers' repositories are not touched
        assert_eq!(registry.get_pending_repositories().await, vec![other]);
    }

    #[tokio::test]
    async fn test_offline_sweep_leaves_pending() {
        let (adapter, remote, registry) = fixture().await;
        remote.lock().unwrap().offline = true;
        let r = registry.add_repository("R", "F1", ProviderType::GoogleDrive, false, true).await.unwrap();

        let report = run_sweep(ProviderType::GoogleDrive, &adapter, &registry).await.unwrap();
        assert_eq!(report.unchanged, vec![r.id.clone()]);
        assert_eq!(
            registry.get_repository(&r.id).await.unwrap().verification_state(),
            VerificationState::Pending
        );
    }

    #[tokio::test]
    async fn test_spawned_sweep_reports_completion() {
        let (adapter, remote, registry) = fixture().await;
        remote.lock().unwrap().folders.insert("F1".to_string(), "Family".to_string());
        let r1 = registry.add_repository("Family", "F1", ProviderType::GoogleDrive, false, true).await.unwrap();

        let handle = spawn_sweep(ProviderType::GoogleDrive, adapter, registry.clone());
        assert_eq!(handle.provider(), ProviderType::GoogleDrive);

        let status = handle.wait().await;
        assert_eq!(status, SweepStatus::Finished(SweepReport {
            verified: vec![r1.id],
            ..SweepReport::default()
        }));
        assert!(handle.is_finished());
        assert!(registry.get_pending_repositories().await.is_empty());
    }
}
