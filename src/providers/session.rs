//! Session strategies and token lifecycle
//!
//! A provider signs in through exactly one [`SessionStrategy`], chosen once when
//! the adapter is built:
//!
//! - [`LoopbackConsentStrategy`]: browser consent + PKCE with a `127.0.0.1`
//!   redirect (desktop Google, OneDrive everywhere)
//! - [`NativeSignInStrategy`]: delegates to the platform account picker through
//!   the [`NativeSignIn`] bridge (mobile Google)
//!
//! [`TokenManager`] owns the live session for one provider, persists it through
//! the injected [`CredentialStore`] and serializes refreshes so that concurrent
//! callers never spend the same refresh token twice.

use async_trait::async_trait;
use secrecy::SecretString;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::oauth2::{bind_callback_listener_on_port, wait_for_callback, OAuth2Manager, OAuthConfig};
use super::{ProviderError, ProviderType};
use crate::credential_store::{CredentialStore, StoredCredentials};

/// How a provider obtains, refreshes and revokes its session
#[async_trait]
pub trait SessionStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Silent sign-in. Gets whatever was persisted last time and returns a
    /// usable session, or `None` when the user has to sign in interactively.
    async fn restore(&self, stored: Option<StoredCredentials>) -> Result<Option<StoredCredentials>, ProviderError>;

    /// Interactive sign-in. `None` means the user cancelled.
    async fn sign_in(&self) -> Result<Option<StoredCredentials>, ProviderError>;

    async fn refresh(&self, current: &StoredCredentials) -> Result<StoredCredentials, ProviderError>;

    /// Best-effort server-side revocation
    async fn revoke(&self, _current: &StoredCredentials) -> Result<(), ProviderError> {
        Ok(())
    }
}

/// Opens the consent URL for the user
pub type BrowserLauncher = Arc<dyn Fn(&str) -> std::io::Result<()> + Send + Sync>;

fn system_browser() -> BrowserLauncher {
    Arc::new(|url: &str| open::that(url))
}

// ============ Loopback consent (desktop) ============

pub struct LoopbackConsentStrategy {
    oauth: OAuth2Manager,
    config: OAuthConfig,
    callback_port: u16,
    timeout: Duration,
    revoke_url: Option<String>,
    client: reqwest::Client,
    browser: BrowserLauncher,
}

impl LoopbackConsentStrategy {
    pub fn new(config: OAuthConfig, callback_port: u16, timeout: Duration) -> Self {
        Self {
            oauth: OAuth2Manager::new(),
            config,
            callback_port,
            timeout,
            revoke_url: None,
            client: reqwest::Client::new(),
            browser: system_browser(),
        }
    }

    /// Token revocation endpoint (RFC 7009 style `token=` form post)
    pub fn with_revoke_url(mut self, url: &str) -> Self {
        self.revoke_url = Some(url.to_string());
        self
    }

    pub fn with_browser(mut self, browser: BrowserLauncher) -> Self {
        self.browser = browser;
        self
    }

    /// Refresh with the client the token was issued to, if it differs from the current one
    fn config_for(&self, credentials: &StoredCredentials) -> OAuthConfig {
        let mut config = self.config.clone();
        if let Some(ref client_id) = credentials.client_id {
            if *client_id != config.client_id {
                config.client_id = client_id.clone();
                config.client_secret = credentials.client_secret.clone();
            }
        }
        config
    }
}

#[async_trait]
impl SessionStrategy for LoopbackConsentStrategy {
    fn name(&self) -> &'static str {
        "loopback-consent"
    }

    async fn restore(&self, stored: Option<StoredCredentials>) -> Result<Option<StoredCredentials>, ProviderError> {
        let Some(stored) = stored else {
            return Ok(None);
        };
        if !stored.is_expired() {
            return Ok(Some(stored));
        }
        if stored.refresh_token.is_none() {
            debug!("{} session expired without refresh token", self.config.provider);
            return Ok(None);
        }
        // Proactive refresh at restore time
        self.refresh(&stored).await.map(Some)
    }

    async fn sign_in(&self) -> Result<Option<StoredCredentials>, ProviderError> {
        if self.config.client_id.is_empty() {
            return Err(ProviderError::InvalidConfig(format!("{} client id is not configured", self.config.provider)));
        }

        let (listener, port) = bind_callback_listener_on_port(self.callback_port).await?;
        let config = self.config.clone().with_port(port);
        let (auth_url, expected_state) = self.oauth.start_auth_flow(&config).await?;

        if let Err(e) = (self.browser)(&auth_url) {
            warn!("Could not open browser ({}). Open this URL manually: {}", e, auth_url);
        }

        let (code, state) = match tokio::time::timeout(self.timeout, wait_for_callback(listener)).await {
            Ok(Ok(pair)) => pair,
            Ok(Err(ProviderError::AuthenticationCancelled)) => {
                self.oauth.abandon_flow(&expected_state).await;
                info!("{} sign-in declined by user", config.provider);
                return Ok(None);
            }
            Ok(Err(e)) => {
                self.oauth.abandon_flow(&expected_state).await;
                return Err(e);
            }
            Err(_) => {
                self.oauth.abandon_flow(&expected_state).await;
                info!("{} sign-in timed out after {:?}", config.provider, self.timeout);
                return Ok(None);
            }
        };

        if state != expected_state {
            self.oauth.abandon_flow(&expected_state).await;
            return Err(ProviderError::AuthenticationFailed("OAuth state mismatch".to_string()));
        }

        self.oauth.complete_auth_flow(&config, &code, &state).await.map(Some)
    }

    async fn refresh(&self, current: &StoredCredentials) -> Result<StoredCredentials, ProviderError> {
        let refresh_token = current.refresh_token.as_deref()
            .ok_or_else(|| ProviderError::TokenRefreshFailed("No refresh token available".to_string()))?;
        self.oauth.refresh_tokens(&self.config_for(current), refresh_token).await
    }

    async fn revoke(&self, current: &StoredCredentials) -> Result<(), ProviderError> {
        let Some(ref url) = self.revoke_url else {
            return Ok(());
        };
        let token = current.refresh_token.as_deref().unwrap_or(&current.access_token);
        let body = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("token", token)
            .finish();
        let response = self.client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body)
            .send()
            .await
            .map_err(|e| ProviderError::NetworkError(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::remote(status, body));
        }
        info!("{} token revoked", self.config.provider);
        Ok(())
    }
}

// ============ Native sign-in (mobile) ============

/// Account returned by the platform sign-in SDK
#[derive(Debug, Clone)]
pub struct NativeAccount {
    pub access_token: String,
    pub expires_at: Option<i64>,
    pub email: Option<String>,
}

/// Bridge to the platform account picker (implemented by the host app)
#[async_trait]
pub trait NativeSignIn: Send + Sync {
    /// Reuse the account the platform remembers; `None` if there is none
    async fn sign_in_silently(&self) -> Result<Option<NativeAccount>, ProviderError>;
    /// Show the account picker; `None` if the user dismissed it
    async fn sign_in(&self) -> Result<Option<NativeAccount>, ProviderError>;
    async fn sign_out(&self) -> Result<(), ProviderError>;
}

pub struct NativeSignInStrategy {
    bridge: Arc<dyn NativeSignIn>,
    scopes: Vec<String>,
}

impl NativeSignInStrategy {
    pub fn new(bridge: Arc<dyn NativeSignIn>, scopes: Vec<String>) -> Self {
        Self { bridge, scopes }
    }

    fn to_credentials(&self, account: NativeAccount) -> StoredCredentials {
        let mut credentials = StoredCredentials::bearer(&account.access_token, account.expires_at);
        credentials.scopes = self.scopes.clone();
        credentials
    }
}

#[async_trait]
impl SessionStrategy for NativeSignInStrategy {
    fn name(&self) -> &'static str {
        "native-sign-in"
    }

    async fn restore(&self, _stored: Option<StoredCredentials>) -> Result<Option<StoredCredentials>, ProviderError> {
        // The platform SDK owns the account; persisted tokens are only a cache.
        Ok(self.bridge.sign_in_silently().await?.map(|a| self.to_credentials(a)))
    }

    async fn sign_in(&self) -> Result<Option<StoredCredentials>, ProviderError> {
        if let Some(account) = self.bridge.sign_in_silently().await? {
            return Ok(Some(self.to_credentials(account)));
        }
        Ok(self.bridge.sign_in().await?.map(|a| self.to_credentials(a)))
    }

    async fn refresh(&self, _current: &StoredCredentials) -> Result<StoredCredentials, ProviderError> {
        self.bridge.sign_in_silently().await?
            .map(|a| self.to_credentials(a))
            .ok_or_else(|| ProviderError::TokenRefreshFailed("Platform account no longer signed in".to_string()))
    }

    async fn revoke(&self, _current: &StoredCredentials) -> Result<(), ProviderError> {
        self.bridge.sign_out().await
    }
}

// ============ Strategy selection ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    Desktop,
    Mobile,
}

impl Platform {
    pub fn current() -> Self {
        if cfg!(any(target_os = "android", target_os = "ios")) {
            Platform::Mobile
        } else {
            Platform::Desktop
        }
    }
}

/// Pick the Google strategy for a platform. Mobile requires the native bridge.
pub fn select_google_strategy(
    platform: Platform,
    native: Option<Arc<dyn NativeSignIn>>,
    loopback: impl FnOnce() -> LoopbackConsentStrategy,
) -> Result<Box<dyn SessionStrategy>, ProviderError> {
    match platform {
        Platform::Mobile => {
            let bridge = native.ok_or_else(|| {
                ProviderError::InvalidConfig("Native sign-in bridge is required on mobile".to_string())
            })?;
            Ok(Box::new(NativeSignInStrategy::new(
                bridge,
                vec!["https://www.googleapis.com/auth/drive".to_string()],
            )))
        }
        Platform::Desktop => Ok(Box::new(loopback())),
    }
}

// ============ Token manager ============

pub struct TokenManager {
    provider: ProviderType,
    strategy: Box<dyn SessionStrategy>,
    store: Arc<dyn CredentialStore>,
    session: RwLock<Option<StoredCredentials>>,
    refresh_lock: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(provider: ProviderType, strategy: Box<dyn SessionStrategy>, store: Arc<dyn CredentialStore>) -> Self {
        Self {
            provider,
            strategy,
            store,
            session: RwLock::new(None),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn CredentialStore> {
        &self.store
    }

    fn snapshot(&self) -> Option<StoredCredentials> {
        self.session.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_session(&self, credentials: Option<StoredCredentials>) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = credentials;
    }

    fn persist(&self, credentials: &StoredCredentials) -> Result<(), ProviderError> {
        self.store.save_credentials(self.provider, credentials)?;
        Ok(())
    }

    /// Live session whose token has not passed its expiry
    pub fn is_connected(&self) -> bool {
        self.snapshot().is_some_and(|c| !c.is_past_expiry())
    }

    /// Usable session for an API call. A session past its expiry is refreshed
    /// first; only a failed refresh reports the provider as disconnected.
    pub async fn ensure_session(&self) -> Result<(), ProviderError> {
        if self.is_connected() {
            return Ok(());
        }
        if self.snapshot().is_none() {
            return Err(ProviderError::NotConnected);
        }
        self.access_token().await.map(|_| ())
    }

    /// Silent restore. Never fails: problems degrade to "disconnected".
    pub async fn restore(&self) -> bool {
        let _guard = self.refresh_lock.lock().await;
        let stored = match self.store.load_credentials(self.provider) {
            Ok(stored) => stored,
            Err(e) => {
                warn!("Could not read stored {} credentials: {}", self.provider, e);
                None
            }
        };

        match self.strategy.restore(stored.clone()).await {
            Ok(Some(credentials)) => {
                if stored.as_ref() != Some(&credentials) {
                    if let Err(e) = self.persist(&credentials) {
                        warn!("Could not persist restored {} session: {}", self.provider, e);
                    }
                }
                self.set_session(Some(credentials));
                info!("{} session restored ({})", self.provider, self.strategy.name());
                true
            }
            Ok(None) => {
                self.set_session(None);
                false
            }
            Err(e) => {
                warn!("{} session restore failed: {}", self.provider, e);
                self.set_session(None);
                false
            }
        }
    }

    /// Interactive sign-in. `Ok(false)` when the user cancelled.
    pub async fn sign_in(&self) -> Result<bool, ProviderError> {
        let _guard = self.refresh_lock.lock().await;
        match self.strategy.sign_in().await {
            Ok(Some(credentials)) => {
                self.persist(&credentials)?;
                self.set_session(Some(credentials));
                info!("{} connected ({})", self.provider, self.strategy.name());
                Ok(true)
            }
            Ok(None) | Err(ProviderError::AuthenticationCancelled) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Current access token, refreshing first if it is inside the expiry buffer
    pub async fn access_token(&self) -> Result<SecretString, ProviderError> {
        let current = self.snapshot().ok_or(ProviderError::NotConnected)?;
        if !current.is_expired() {
            return Ok(SecretString::from(current.access_token));
        }

        let _guard = self.refresh_lock.lock().await;
        // Another task may have refreshed while we waited
        let current = self.snapshot().ok_or(ProviderError::NotConnected)?;
        if !current.is_expired() {
            return Ok(SecretString::from(current.access_token));
        }

        match self.strategy.refresh(&current).await {
            Ok(refreshed) => {
                self.persist(&refreshed)?;
                let token = SecretString::from(refreshed.access_token.clone());
                self.set_session(Some(refreshed));
                Ok(token)
            }
            Err(e) => {
                warn!("{} token refresh failed, session dropped: {}", self.provider, e);
                self.set_session(None);
                Err(match e {
                    ProviderError::TokenRefreshFailed(msg) => ProviderError::TokenRefreshFailed(msg),
                    other => ProviderError::TokenRefreshFailed(other.to_string()),
                })
            }
        }
    }

    /// Revoke (best effort) and forget the session locally
    pub async fn sign_out(&self) -> Result<(), ProviderError> {
        let _guard = self.refresh_lock.lock().await;
        let current = self.session.write().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(ref credentials) = current {
            if let Err(e) = self.strategy.revoke(credentials).await {
                warn!("{} revocation failed: {}", self.provider, e);
            }
        }
        self.store.clear_credentials(self.provider)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::MemoryCredentialStore;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    /// Strategy that counts refreshes and hands out numbered tokens
    struct CountingStrategy {
        refreshes: Arc<AtomicUsize>,
        fail_refresh: bool,
    }

    #[async_trait]
    impl SessionStrategy for CountingStrategy {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn restore(&self, stored: Option<StoredCredentials>) -> Result<Option<StoredCredentials>, ProviderError> {
            Ok(stored)
        }

        async fn sign_in(&self) -> Result<Option<StoredCredentials>, ProviderError> {
            Ok(Some(StoredCredentials::bearer("interactive", Some(now() + 3600))))
        }

        async fn refresh(&self, _current: &StoredCredentials) -> Result<StoredCredentials, ProviderError> {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if self.fail_refresh {
                return Err(ProviderError::AuthenticationFailed("invalid_grant".to_string()));
            }
            let n = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(StoredCredentials::bearer(&format!("refreshed-{}", n), Some(now() + 3600)))
        }
    }

    fn manager_with(store: Arc<MemoryCredentialStore>, fail_refresh: bool) -> (Arc<TokenManager>, Arc<AtomicUsize>) {
        let refreshes = Arc::new(AtomicUsize::new(0));
        let strategy = CountingStrategy { refreshes: refreshes.clone(), fail_refresh };
        let manager = TokenManager::new(ProviderType::GoogleDrive, Box::new(strategy), store);
        (Arc::new(manager), refreshes)
    }

    #[tokio::test]
    async fn test_not_connected_without_session() {
        let (manager, _) = manager_with(Arc::new(MemoryCredentialStore::new()), false);
        assert!(!manager.is_connected());
        assert!(matches!(manager.access_token().await, Err(ProviderError::NotConnected)));
        assert!(!manager.restore().await);
    }

    #[tokio::test]
    async fn test_refresh_is_single_flight() {
        use secrecy::ExposeSecret;

        let store = Arc::new(MemoryCredentialStore::new());
        store.save_credentials(ProviderType::GoogleDrive, &StoredCredentials::bearer("stale", Some(now() + 10))).unwrap();
        let (manager, refreshes) = manager_with(store.clone(), false);
        assert!(manager.restore().await);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            tasks.push(tokio::spawn(async move {
                manager.access_token().await.map(|t| t.expose_secret().to_string())
            }));
        }
        for task in tasks {
            assert_eq!(task.await.unwrap().unwrap(), "refreshed-1");
        }
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);

        let persisted = store.load_credentials(ProviderType::GoogleDrive).unwrap().unwrap();
        assert_eq!(persisted.access_token, "refreshed-1");
    }

    #[tokio::test]
    async fn test_failed_refresh_disconnects() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.save_credentials(ProviderType::GoogleDrive, &StoredCredentials::bearer("stale", Some(now() + 10))).unwrap();
        let (manager, _) = manager_with(store, true);
        assert!(manager.restore().await);
        assert!(manager.is_connected());

        assert!(matches!(manager.access_token().await, Err(ProviderError::TokenRefreshFailed(_))));
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_is_connected_tracks_hard_expiry() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.save_credentials(ProviderType::GoogleDrive, &StoredCredentials::bearer("old", Some(now() - 5))).unwrap();
        let (manager, _) = manager_with(store, false);
        assert!(manager.restore().await);
        assert!(!manager.is_connected());
    }

    #[tokio::test]
    async fn test_ensure_session_refreshes_past_expiry() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.save_credentials(ProviderType::GoogleDrive, &StoredCredentials::bearer("old", Some(now() - 5))).unwrap();
        let (manager, refreshes) = manager_with(store, false);
        assert!(manager.restore().await);

        manager.ensure_session().await.unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
        assert!(manager.is_connected());

        // Already live: no second refresh
        manager.ensure_session().await.unwrap();
        assert_eq!(refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_ensure_session_reports_failed_refresh() {
        let store = Arc::new(MemoryCredentialStore::new());
        store.save_credentials(ProviderType::GoogleDrive, &StoredCredentials::bearer("old", Some(now() - 5))).unwrap();
        let (manager, _) = manager_with(store, true);
        assert!(manager.restore().await);

        assert!(matches!(manager.ensure_session().await, Err(ProviderError::TokenRefreshFailed(_))));
        assert!(matches!(manager.ensure_session().await, Err(ProviderError::NotConnected)));
    }

    #[tokio::test]
    async fn test_sign_in_and_sign_out() {
        let store = Arc::new(MemoryCredentialStore::new());
        let (manager, _) = manager_with(store.clone(), false);
        assert!(manager.sign_in().await.unwrap());
        assert!(manager.is_connected());
        assert!(store.load_credentials(ProviderType::GoogleDrive).unwrap().is_some());

        manager.sign_out().await.unwrap();
        assert!(!manager.is_connected());
        assert!(store.load_credentials(ProviderType::GoogleDrive).unwrap().is_none());
    }

    struct FakeBridge {
        silent: Option<NativeAccount>,
        interactive: Option<NativeAccount>,
    }

    #[async_trait]
    impl NativeSignIn for FakeBridge {
        async fn sign_in_silently(&self) -> Result<Option<NativeAccount>, ProviderError> {
            Ok(self.silent.clone())
        }
        async fn sign_in(&self) -> Result<Option<NativeAccount>, ProviderError> {
            Ok(self.interactive.clone())
        }
        async fn sign_out(&self) -> Result<(), ProviderError> {
            Ok(())
        }
    }

    fn account(token: &str) -> NativeAccount {
        NativeAccount { access_token: token.to_string(), expires_at: Some(now() + 3600), email: None }
    }

    #[tokio::test]
    async fn test_native_strategy_prefers_silent() {
        let strategy = NativeSignInStrategy::new(
            Arc::new(FakeBridge { silent: Some(account("silent")), interactive: Some(account("picker")) }),
            vec![],
        );
        assert_eq!(strategy.sign_in().await.unwrap().unwrap().access_token, "silent");

        let strategy = NativeSignInStrategy::new(
            Arc::new(FakeBridge { silent: None, interactive: None }),
            vec![],
        );
        assert!(strategy.sign_in().await.unwrap().is_none());
        assert!(strategy.restore(None).await.unwrap().is_none());
        assert!(matches!(
            strategy.refresh(&StoredCredentials::bearer("x", None)).await,
            Err(ProviderError::TokenRefreshFailed(_))
        ));
    }

    #[test]
    fn test_strategy_selection() {
        let loopback = || LoopbackConsentStrategy::new(
            OAuthConfig::google_with_port("id", "secret", 0),
            0,
            Duration::from_secs(1),
        );
        let desktop = select_google_strategy(Platform::Desktop, None, loopback).unwrap();
        assert_eq!(desktop.name(), "loopback-consent");

        assert!(select_google_strategy(Platform::Mobile, None, loopback).is_err());

        let bridge: Arc<dyn NativeSignIn> = Arc::new(FakeBridge { silent: None, interactive: None });
        let mobile = select_google_strategy(Platform::Mobile, Some(bridge), loopback).unwrap();
        assert_eq!(mobile.name(), "native-sign-in");
    }

    #[tokio::test]
    async fn test_loopback_restore_refreshes_expired_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("refresh_token=rt-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "fresh",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .expect(1)
            .mount(&server)
            .await;

        let config = OAuthConfig::google_with_port("id", "secret", 0)
            .with_endpoints("https://accounts.example.com/auth", &format!("{}/token", server.uri()));
        let strategy = LoopbackConsentStrategy::new(config, 0, Duration::from_secs(5));

        let mut stored = StoredCredentials::bearer("expired", Some(now() - 60));
        stored.refresh_token = Some("rt-1".to_string());
        let restored = strategy.restore(Some(stored)).await.unwrap().unwrap();
        assert_eq!(restored.access_token, "fresh");
        assert_eq!(restored.refresh_token.as_deref(), Some("rt-1"));

        // Valid sessions are returned untouched
        let valid = StoredCredentials::bearer("valid", Some(now() + 3600));
        assert_eq!(strategy.restore(Some(valid.clone())).await.unwrap(), Some(valid));
    }

    #[tokio::test]
    async fn test_loopback_sign_in_end_to_end() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=browser-code"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "desktop-at",
                "refresh_token": "desktop-rt",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        // Stands in for the user approving consent in the browser
        let browser: BrowserLauncher = Arc::new(|auth_url: &str| {
            let parsed = url::Url::parse(auth_url).map_err(std::io::Error::other)?;
            let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
            let redirect = params.get("redirect_uri").cloned().unwrap_or_default();
            let state = params.get("state").cloned().unwrap_or_default();
            tokio::spawn(async move {
                let _ = reqwest::get(format!("{}?code=browser-code&state={}", redirect, state)).await;
            });
            Ok(())
        });

        let config = OAuthConfig::google_with_port("id", "secret", 0)
            .with_endpoints("https://accounts.example.com/auth", &format!("{}/token", server.uri()));
        let strategy = LoopbackConsentStrategy::new(config, 0, Duration::from_secs(10)).with_browser(browser);

        let credentials = strategy.sign_in().await.unwrap().unwrap();
        assert_eq!(credentials.access_token, "desktop-at");
        assert_eq!(credentials.refresh_token.as_deref(), Some("desktop-rt"));
    }

    #[tokio::test]
    async fn test_loopback_sign_in_declined() {
        let browser: BrowserLauncher = Arc::new(|auth_url: &str| {
            let parsed = url::Url::parse(auth_url).map_err(std::io::Error::other)?;
            let redirect = parsed.query_pairs()
                .find(|(k, _)| k == "redirect_uri")
                .map(|(_, v)| v.into_owned())
                .unwrap_or_default();
            tokio::spawn(async move {
                let _ = reqwest::get(format!("{}?error=access_denied", redirect)).await;
            });
            Ok(())
        });

        let config = OAuthConfig::onedrive_with_port("id", None, 0);
        let strategy = LoopbackConsentStrategy::new(config, 0, Duration::from_secs(10)).with_browser(browser);
        assert!(strategy.sign_in().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revoke_posts_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/revoke"))
            .and(header("content-type", "application/x-www-form-urlencoded"))
            .and(body_string_contains("token=rt-9"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let strategy = LoopbackConsentStrategy::new(OAuthConfig::google_with_port("id", "s", 0), 0, Duration::from_secs(1))
            .with_revoke_url(&format!("{}/revoke", server.uri()));
        let mut credentials = StoredCredentials::bearer("at", None);
        credentials.refresh_token = Some("rt-9".to_string());
        strategy.revoke(&credentials).await.unwrap();
    }
}
