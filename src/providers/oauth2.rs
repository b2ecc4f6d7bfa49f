//! OAuth2 Authentication Module
//!
//! Authorization-code + PKCE flow against Google and the Microsoft identity
//! platform, with a loopback (`127.0.0.1`) redirect listener for desktops.
//! Token persistence is the caller's job (see `session::TokenManager`).

use oauth2::{
    basic::BasicClient, AuthUrl, AuthorizationCode, ClientId, ClientSecret,
    CsrfToken, EndpointNotSet, EndpointSet, PkceCodeChallenge, PkceCodeVerifier,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use super::{ProviderError, ProviderType};
use crate::credential_store::StoredCredentials;

/// Configured OAuth2 client with auth and token endpoints set (v5 typestates)
type ConfiguredClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const MICROSOFT_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
pub const MICROSOFT_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";

/// Simple error wrapper for the oauth2 HTTP client adapter.
#[derive(Debug)]
struct OAuth2TransportError(String);

impl std::fmt::Display for OAuth2TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for OAuth2TransportError {}

/// Bridges reqwest 0.13 with oauth2's `AsyncHttpClient` trait
/// (oauth2 v5's built-in reqwest support targets reqwest 0.12).
struct OAuth2HttpClient;

impl<'c> oauth2::AsyncHttpClient<'c> for OAuth2HttpClient {
    type Error = oauth2::HttpClientError<OAuth2TransportError>;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = Result<oauth2::HttpResponse, Self::Error>> + Send + Sync + 'c>,
    >;

    fn call(&'c self, request: oauth2::HttpRequest) -> Self::Future {
        Box::pin(async move {
            let client = reqwest::Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let method = reqwest::Method::from_bytes(request.method().as_str().as_bytes())
                .unwrap_or(reqwest::Method::POST);
            let url = request.uri().to_string();

            let mut builder = client.request(method, &url);
            for (name, value) in request.headers() {
                builder = builder.header(name.as_str(), value.as_bytes());
            }
            builder = builder.body(request.into_body());

            let response = builder.send().await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let status_code = response.status().as_u16();
            let headers = response.headers().clone();
            let body = response.bytes().await
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))?;

            let mut http_response = http::Response::builder()
                .status(http::StatusCode::from_u16(status_code).unwrap_or(http::StatusCode::INTERNAL_SERVER_ERROR));
            for (name, value) in headers.iter() {
                http_response = http_response.header(name.as_str(), value.as_bytes());
            }
            http_response
                .body(body.to_vec())
                .map_err(|e| oauth2::HttpClientError::Other(e.to_string()))
        })
    }
}

/// OAuth2 configuration for a provider
#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub provider: ProviderType,
    pub client_id: String,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    /// Extra query parameters for the authorization URL
    pub extra_auth_params: Vec<(String, String)>,
}

impl OAuthConfig {
    /// Google desktop (loopback) client. `access_type=offline` + `prompt=consent`
    /// make Google return a refresh token on every consent.
    pub fn google_with_port(client_id: &str, client_secret: &str, port: u16) -> Self {
        Self {
            provider: ProviderType::GoogleDrive,
            client_id: client_id.to_string(),
            client_secret: Some(client_secret.to_string()),
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: vec!["https://www.googleapis.com/auth/drive".to_string()],
            redirect_uri: loopback_redirect(port),
            extra_auth_params: vec![
                ("access_type".to_string(), "offline".to_string()),
                ("prompt".to_string(), "consent".to_string()),
            ],
        }
    }

    /// Microsoft identity platform client; `offline_access` yields a refresh token
    pub fn onedrive_with_port(client_id: &str, client_secret: Option<&str>, port: u16) -> Self {
        Self {
            provider: ProviderType::OneDrive,
            client_id: client_id.to_string(),
            client_secret: client_secret.filter(|s| !s.is_empty()).map(str::to_string),
            auth_url: MICROSOFT_AUTH_URL.to_string(),
            token_url: MICROSOFT_TOKEN_URL.to_string(),
            scopes: vec![
                "Files.ReadWrite".to_string(),
                "Files.ReadWrite.All".to_string(),
                "offline_access".to_string(),
            ],
            redirect_uri: loopback_redirect(port),
            extra_auth_params: vec![],
        }
    }

    /// Point the config at different endpoints (self-hosted proxies, tests)
    pub fn with_endpoints(mut self, auth_url: &str, token_url: &str) -> Self {
        self.auth_url = auth_url.to_string();
        self.token_url = token_url.to_string();
        self
    }

    /// Same client, redirecting to a freshly bound loopback port
    pub fn with_port(mut self, port: u16) -> Self {
        self.redirect_uri = loopback_redirect(port);
        self
    }
}

fn loopback_redirect(port: u16) -> String {
    format!("http://127.0.0.1:{}/callback", port)
}

/// OAuth2 Manager for handling authentication flows
pub struct OAuth2Manager {
    /// Pending PKCE verifiers for ongoing auth flows, keyed by CSRF state
    pending_verifiers: Arc<RwLock<HashMap<String, PkceCodeVerifier>>>,
}

impl OAuth2Manager {
    pub fn new() -> Self {
        Self {
            pending_verifiers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start OAuth2 authorization flow - returns (URL to open in browser, state)
    pub async fn start_auth_flow(&self, config: &OAuthConfig) -> Result<(String, String), ProviderError> {
        let client = self.create_client(config)?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let (auth_url, csrf_token) = {
            let mut auth_builder = client
                .authorize_url(CsrfToken::new_random)
                .set_pkce_challenge(pkce_challenge);
            for scope in &config.scopes {
                auth_builder = auth_builder.add_scope(Scope::new(scope.clone()));
            }
            for (key, value) in &config.extra_auth_params {
                auth_builder = auth_builder.add_extra_param(key, value);
            }
            auth_builder.url()
        };

        let state = csrf_token.secret().clone();
        self.pending_verifiers.write().await.insert(state.clone(), pkce_verifier);

        info!("OAuth2 auth URL generated for {}", config.provider);
        Ok((auth_url.to_string(), state))
    }

    /// Complete OAuth2 flow with authorization code
    pub async fn complete_auth_flow(
        &self,
        config: &OAuthConfig,
        code: &str,
        state: &str,
    ) -> Result<StoredCredentials, ProviderError> {
        let verifier = self.pending_verifiers.write().await
            .remove(state)
            .ok_or_else(|| ProviderError::AuthenticationFailed(
                "Invalid state token - authorization flow expired or invalid".to_string()
            ))?;

        let client = self.create_client(config)?;
        let token_result = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(verifier)
            .request_async(&OAuth2HttpClient)
            .await
            .map_err(|e| ProviderError::AuthenticationFailed(format!("Token exchange failed: {}", e)))?;

        info!("OAuth2 tokens obtained for {}", config.provider);
        Ok(Self::to_credentials(config, &token_result, None))
    }

    /// Refresh access token using refresh token
    pub async fn refresh_tokens(
        &self,
        config: &OAuthConfig,
        refresh_token: &str,
    ) -> Result<StoredCredentials, ProviderError> {
        let client = self.create_client(config)?;
        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&OAuth2HttpClient)
            .await
            .map_err(|e| ProviderError::TokenRefreshFailed(e.to_string()))?;

        debug!("OAuth2 tokens refreshed for {}", config.provider);
        Ok(Self::to_credentials(config, &token_result, Some(refresh_token)))
    }

    /// Drop a pending flow (timeout or cancellation)
    pub async fn abandon_flow(&self, state: &str) {
        self.pending_verifiers.write().await.remove(state);
    }

    fn to_credentials(
        config: &OAuthConfig,
        token_result: &oauth2::basic::BasicTokenResponse,
        previous_refresh: Option<&str>,
    ) -> StoredCredentials {
        let expires_at = token_result.expires_in()
            .map(|d| chrono::Utc::now().timestamp() + d.as_secs() as i64);

        StoredCredentials {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token()
                .map(|t| t.secret().clone())
                .or_else(|| previous_refresh.map(str::to_string)), // Keep old refresh token if not returned
            expires_at,
            token_type: "Bearer".to_string(),
            scopes: config.scopes.clone(),
            client_id: Some(config.client_id.clone()),
            client_secret: config.client_secret.clone(),
        }
    }

    /// Create OAuth2 client from config (v5 builder API)
    fn create_client(&self, config: &OAuthConfig) -> Result<ConfiguredClient, ProviderError> {
        let client_id = ClientId::new(config.client_id.clone());

        let auth_url = AuthUrl::new(config.auth_url.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid auth URL: {}", e)))?;
        let token_url = TokenUrl::new(config.token_url.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid token URL: {}", e)))?;
        let redirect_url = RedirectUrl::new(config.redirect_uri.clone())
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid redirect URL: {}", e)))?;

        let mut client = BasicClient::new(client_id)
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);

        if let Some(ref secret) = config.client_secret {
            client = client.set_client_secret(ClientSecret::new(secret.clone()));
        }

        Ok(client)
    }
}

impl Default for OAuth2Manager {
    fn default() -> Self {
        Self::new()
    }
}

/// Bind the OAuth2 callback listener on a specific port (0 = ephemeral).
/// Returns the listener and the actual port assigned by the OS.
pub async fn bind_callback_listener_on_port(port: u16) -> Result<(tokio::net::TcpListener, u16), ProviderError> {
    let listener = tokio::net::TcpListener::bind(format!("127.0.0.1:{}", port))
        .await
        .map_err(|e| ProviderError::Other(format!("Failed to bind callback server on port {}: {}", port, e)))?;

    let actual_port = listener.local_addr()
        .map(|a| a.port())
        .map_err(|e| ProviderError::Other(format!("Failed to get local port: {}", e)))?;

    info!("OAuth callback listener bound on port {}", actual_port);
    Ok((listener, actual_port))
}

const CALLBACK_PAGE: &str = "<!DOCTYPE html><html lang=\"en\"><head><meta charset=\"utf-8\">\
<title>Recipe Sync</title></head><body style=\"font-family:sans-serif;text-align:center;padding-top:15vh\">\
<h1>Authorization complete</h1><p>You can close this window and return to the app.</p></body></html>";

fn http_response(status: &str, body: &str) -> String {
    format!(
        "HTTP/1.1 {}\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    )
}

/// Wait for the OAuth2 redirect on an already-bound listener.
/// Requests for other paths (favicon probes) are answered with 404 and skipped.
/// Returns (code, state) extracted from the callback request.
pub async fn wait_for_callback(listener: tokio::net::TcpListener) -> Result<(String, String), ProviderError> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    loop {
        let (mut socket, _) = listener.accept()
            .await
            .map_err(|e| ProviderError::Other(format!("Failed to accept connection: {}", e)))?;

        let mut buffer = vec![0u8; 4096];
        let n = socket.read(&mut buffer)
            .await
            .map_err(|e| ProviderError::Other(format!("Failed to read request: {}", e)))?;
        let request = String::from_utf8_lossy(&buffer[..n]);

        let is_callback = request.lines().next()
            .and_then(|line| line.split_whitespace().nth(1))
            .is_some_and(|target| target.starts_with("/callback"));
        if !is_callback {
            let _ = socket.write_all(http_response("404 Not Found", "").as_bytes()).await;
            continue;
        }

        let parsed = parse_callback_request(&request);
        let page = match &parsed {
            Ok(_) => http_response("200 OK", CALLBACK_PAGE),
            Err(e) => http_response("400 Bad Request", &format!("<h1>Authorization failed</h1><p>{}</p>", e)),
        };
        socket.write_all(page.as_bytes())
            .await
            .map_err(|e| ProviderError::Other(format!("Failed to send response: {}", e)))?;

        return parsed;
    }
}

/// Parse OAuth callback request to extract code and state
fn parse_callback_request(request: &str) -> Result<(String, String), ProviderError> {
    let first_line = request.lines().next()
        .ok_or_else(|| ProviderError::AuthenticationFailed("Empty request".to_string()))?;

    // GET /callback?code=xxx&state=yyy HTTP/1.1
    let target = first_line.split_whitespace().nth(1)
        .ok_or_else(|| ProviderError::AuthenticationFailed("Invalid request format".to_string()))?;

    let query = target.split_once('?')
        .map(|(_, q)| q)
        .ok_or_else(|| ProviderError::AuthenticationFailed("No query parameters".to_string()))?;

    let mut code = None;
    let mut state = None;

    for param in query.split('&') {
        let (key, value) = param.split_once('=').unwrap_or((param, ""));
        let value = urlencoding::decode(value).map(|v| v.into_owned()).unwrap_or_default();

        match key {
            "code" => code = Some(value),
            "state" => state = Some(value),
            "error" if value == "access_denied" => return Err(ProviderError::AuthenticationCancelled),
            "error" => return Err(ProviderError::AuthenticationFailed(format!("OAuth error: {}", value))),
            _ => {}
        }
    }

    let code = code.ok_or_else(|| ProviderError::AuthenticationFailed("Missing code".to_string()))?;
    let state = state.ok_or_else(|| ProviderError::AuthenticationFailed("Missing state".to_string()))?;

    Ok((code, state))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_parse_callback_request() {
        let request = "GET /callback?code=abc123&state=xyz789 HTTP/1.1\r\nHost: localhost\r\n";
        let (code, state) = parse_callback_request(request).unwrap();
        assert_eq!(code, "abc123");
        assert_eq!(state, "xyz789");
    }

    #[test]
    fn test_parse_callback_decodes_values() {
        let request = "GET /callback?state=s%2F1&code=4%2F0Ab HTTP/1.1\r\n";
        let (code, state) = parse_callback_request(request).unwrap();
        assert_eq!(code, "4/0Ab");
        assert_eq!(state, "s/1");
    }

    #[test]
    fn test_parse_callback_user_declined() {
        let request = "GET /callback?error=access_denied&state=s HTTP/1.1\r\n";
        assert!(matches!(parse_callback_request(request), Err(ProviderError::AuthenticationCancelled)));

        let request = "GET /callback?error=invalid_scope HTTP/1.1\r\n";
        assert!(matches!(parse_callback_request(request), Err(ProviderError::AuthenticationFailed(_))));
    }

    #[test]
    fn test_oauth_configs() {
        let google = OAuthConfig::google_with_port("id", "secret", 8765);
        assert_eq!(google.provider, ProviderType::GoogleDrive);
        assert_eq!(google.redirect_uri, "http://127.0.0.1:8765/callback");
        assert!(google.extra_auth_params.iter().any(|(k, v)| k == "access_type" && v == "offline"));

        let onedrive = OAuthConfig::onedrive_with_port("id", Some(""), 0);
        assert!(onedrive.client_secret.is_none());
        assert!(onedrive.scopes.iter().any(|s| s == "offline_access"));
    }

    #[tokio::test]
    async fn test_auth_url_carries_pkce_and_state() {
        let manager = OAuth2Manager::new();
        let config = OAuthConfig::google_with_port("my-client", "secret", 4000);
        let (url, state) = manager.start_auth_flow(&config).await.unwrap();

        let parsed = url::Url::parse(&url).unwrap();
        let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();
        assert_eq!(params.get("client_id").map(String::as_str), Some("my-client"));
        assert_eq!(params.get("state"), Some(&state));
        assert_eq!(params.get("code_challenge_method").map(String::as_str), Some("S256"));
        assert_eq!(params.get("access_type").map(String::as_str), Some("offline"));
    }

    #[tokio::test]
    async fn test_complete_flow_exchanges_code() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("code=the-code"))
            .and(body_string_contains("code_verifier="))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-1",
                "refresh_token": "rt-1",
                "token_type": "Bearer",
                "expires_in": 3600
            })))
            .mount(&server)
            .await;

        let config = OAuthConfig::onedrive_with_port("client", None, 4001)
            .with_endpoints("https://login.example.com/authorize", &format!("{}/token", server.uri()));
        let manager = OAuth2Manager::new();
        let (_, state) = manager.start_auth_flow(&config).await.unwrap();

        let creds = manager.complete_auth_flow(&config, "the-code", &state).await.unwrap();
        assert_eq!(creds.access_token, "at-1");
        assert_eq!(creds.refresh_token.as_deref(), Some("rt-1"));
        assert!(!creds.is_expired());

        // State is single-use
        assert!(manager.complete_auth_flow(&config, "the-code", &state).await.is_err());
    }

    #[tokio::test]
    async fn test_refresh_keeps_old_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "at-2",
                "token_type": "bearer",
                "expires_in": 3599
            })))
            .mount(&server)
            .await;

        let config = OAuthConfig::google_with_port("client", "secret", 0)
            .with_endpoints("https://accounts.example.com/auth", &format!("{}/token", server.uri()));
        let creds = OAuth2Manager::new().refresh_tokens(&config, "rt-old").await.unwrap();
        assert_eq!(creds.access_token, "at-2");
        assert_eq!(creds.refresh_token.as_deref(), Some("rt-old"));
        assert_eq!(creds.client_id.as_deref(), Some("client"));
    }

    #[tokio::test]
    async fn test_refresh_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant"
            })))
            .mount(&server)
            .await;

        let config = OAuthConfig::google_with_port("client", "secret", 0)
            .with_endpoints("https://accounts.example.com/auth", &format!("{}/token", server.uri()));
        let result = OAuth2Manager::new().refresh_tokens(&config, "revoked").await;
        assert!(matches!(result, Err(ProviderError::TokenRefreshFailed(_))));
    }

    #[tokio::test]
    async fn test_loopback_listener_receives_code() {
        let (listener, port) = bind_callback_listener_on_port(0).await.unwrap();
        let waiter = tokio::spawn(wait_for_callback(listener));

        let base = format!("http://127.0.0.1:{}", port);
        let favicon = reqwest::get(format!("{}/favicon.ico", base)).await.unwrap();
        assert_eq!(favicon.status().as_u16(), 404);

        let page = reqwest::get(format!("{}/callback?code=c0de&state=st4te", base)).await.unwrap();
        assert_eq!(page.status().as_u16(), 200);

        let (code, state) = waiter.await.unwrap().unwrap();
        assert_eq!(code, "c0de");
        assert_eq!(state, "st4te");
    }
}
