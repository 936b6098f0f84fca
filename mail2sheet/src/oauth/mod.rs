//! OAuth2 authentication module
//!
//! Implements the Google installed-app flow with PKCE:
//! - authorization URL with `access_type=offline` so a refresh token is issued
//! - code exchange and refresh against the token endpoint
//! - client secrets read from the JSON file downloaded from the Cloud console

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, Scope, TokenUrl,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::types::error::SyncError;

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Read mail, remove the UNREAD label, and append to spreadsheets
pub const GOOGLE_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/gmail.modify",
    "https://www.googleapis.com/auth/spreadsheets",
];

/// Errors that can occur during OAuth operations
#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("OAuth configuration error: {0}")]
    Configuration(String),

    #[error("OAuth request failed: {0}")]
    Request(String),

    #[error("Token exchange failed: {0}")]
    TokenExchange(String),

    #[error("Invalid state parameter")]
    InvalidState,

    #[error("No pending OAuth flow found")]
    NoPendingFlow,

    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

impl From<OAuthError> for SyncError {
    fn from(err: OAuthError) -> Self {
        match err {
            OAuthError::Configuration(msg) => SyncError::Config(msg),
            OAuthError::Request(msg) => SyncError::Other(format!("OAuth request failed: {}", msg)),
            other => SyncError::AuthExpired(other.to_string()),
        }
    }
}

/// OAuth2 tokens
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OAuthTokens {
    /// Access token for API requests
    pub access_token: String,
    /// Refresh token for obtaining new access tokens
    pub refresh_token: Option<String>,
    /// Token expiration time (Unix timestamp)
    pub expires_at: Option<i64>,
    /// Scopes granted
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl OAuthTokens {
    /// Check if tokens need refresh (within 5 minutes of expiry)
    pub fn should_refresh(&self, now: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at - now < 300,
            // No expiry info, assume we should refresh
            None => true,
        }
    }
}

/// OAuth2 client registration
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderConfig {
    pub client_id: String,
    /// Installed-app secrets are not confidential but Google still expects them
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
}

/// `{"installed": {...}}` or `{"web": {...}}` as downloaded from Google
#[derive(Debug, Deserialize)]
struct ClientSecretFile {
    installed: Option<ClientSecretEntry>,
    web: Option<ClientSecretEntry>,
}

#[derive(Debug, Deserialize)]
struct ClientSecretEntry {
    client_id: String,
    client_secret: Option<String>,
    auth_uri: Option<String>,
    token_uri: Option<String>,
}

impl ProviderConfig {
    pub fn google(client_id: impl Into<String>, client_secret: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret,
            auth_url: GOOGLE_AUTH_URL.to_string(),
            token_url: GOOGLE_TOKEN_URL.to_string(),
            scopes: GOOGLE_SCOPES.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn from_client_secret_json(content: &str) -> Result<Self, OAuthError> {
        let file: ClientSecretFile = serde_json::from_str(content)
            .map_err(|e| OAuthError::Configuration(format!("Invalid client secret file: {}", e)))?;

        let entry = file.installed.or(file.web).ok_or_else(|| {
            OAuthError::Configuration(
                "Client secret file has neither an \"installed\" nor a \"web\" section".into(),
            )
        })?;

        if entry.client_id.trim().is_empty() {
            return Err(OAuthError::Configuration("client_id is empty".into()));
        }

        let mut config = Self::google(entry.client_id, entry.client_secret);
        if let Some(auth_uri) = entry.auth_uri {
            config.auth_url = auth_uri;
        }
        if let Some(token_uri) = entry.token_uri {
            config.token_url = token_uri;
        }
        Ok(config)
    }

    pub fn from_client_secret_file(path: &Path) -> Result<Self, OAuthError> {
        let content = fs::read_to_string(path).map_err(|e| {
            OAuthError::Configuration(format!("Failed to read client secret {:?}: {}", path, e))
        })?;
        Self::from_client_secret_json(&content)
    }
}

/// Pending OAuth flow state
#[derive(Debug)]
struct PendingOAuthFlow {
    pkce_verifier: PkceCodeVerifier,
    csrf_token: String,
    redirect_uri: String,
}

/// OAuth2 manager for handling authentication flows
pub struct OAuthManager {
    config: ProviderConfig,
    /// Pending OAuth flows keyed by state parameter
    pending_flows: Mutex<HashMap<String, PendingOAuthFlow>>,
    http: reqwest::Client,
}

impl OAuthManager {
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            config,
            pending_flows: Mutex::new(HashMap::new()),
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Start an OAuth2 authorization flow
    ///
    /// Returns the authorization URL to open in the browser and the state
    /// token the redirect must echo back.
    pub fn start_auth_flow(&self, redirect_uri: &str) -> Result<(String, String), OAuthError> {
        let config = &self.config;

        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let csrf_token = generate_state_token();

        let client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_auth_uri(
                AuthUrl::new(config.auth_url.clone())
                    .map_err(|e| OAuthError::Configuration(e.to_string()))?,
            )
            .set_token_uri(
                TokenUrl::new(config.token_url.clone())
                    .map_err(|e| OAuthError::Configuration(e.to_string()))?,
            )
            .set_redirect_uri(
                RedirectUrl::new(redirect_uri.to_string())
                    .map_err(|e| OAuthError::Configuration(e.to_string()))?,
            );

        let client = if let Some(secret) = &config.client_secret {
            client.set_client_secret(ClientSecret::new(secret.clone()))
        } else {
            client
        };

        let mut auth_request = client
            .authorize_url(|| CsrfToken::new(csrf_token.clone()))
            .set_pkce_challenge(pkce_challenge);

        for scope in &config.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }

        // Google only issues a refresh token with offline access + consent
        let auth_url = auth_request
            .add_extra_param("access_type", "offline")
            .add_extra_param("prompt", "consent")
            .url()
            .0
            .to_string();

        self.pending_flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                csrf_token.clone(),
                PendingOAuthFlow {
                    pkce_verifier,
                    csrf_token: csrf_token.clone(),
                    redirect_uri: redirect_uri.to_string(),
                },
            );

        info!("Started OAuth flow with state {}", csrf_token);

        Ok((auth_url, csrf_token))
    }

    /// Complete an OAuth2 authorization flow with the authorization code
    pub async fn complete_auth_flow(&self, code: &str, state: &str) -> Result<OAuthTokens, OAuthError> {
        let pending = self
            .pending_flows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(state)
            .ok_or(OAuthError::NoPendingFlow)?;

        if pending.csrf_token != state {
            return Err(OAuthError::InvalidState);
        }

        info!("Completing OAuth flow");

        exchange_code_for_tokens(
            &self.http,
            &self.config,
            code,
            &pending.pkce_verifier,
            &pending.redirect_uri,
        )
        .await
    }

    /// Refresh an access token using a refresh token
    pub async fn refresh_tokens(&self, refresh_token: &str) -> Result<OAuthTokens, OAuthError> {
        info!("Refreshing OAuth access token");
        refresh_access_token(&self.http, &self.config, refresh_token).await
    }
}

// ============================================================================
// Token exchange
// ============================================================================

/// Exchange authorization code for tokens
async fn exchange_code_for_tokens(
    http: &reqwest::Client,
    config: &ProviderConfig,
    code: &str,
    pkce_verifier: &PkceCodeVerifier,
    redirect_uri: &str,
) -> Result<OAuthTokens, OAuthError> {
    let mut params = vec![
        ("grant_type", "authorization_code"),
        ("code", code),
        ("redirect_uri", redirect_uri),
        ("client_id", config.client_id.as_str()),
        ("code_verifier", pkce_verifier.secret().as_str()),
    ];
    if let Some(secret) = &config.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    debug!("Exchanging authorization code for tokens");

    let response = http
        .post(&config.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        warn!("Token exchange failed: {}", error_text);
        return Err(OAuthError::TokenExchange(error_text));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| OAuthError::TokenExchange(e.to_string()))?;

    Ok(token_response.into_tokens(None, config, chrono::Utc::now().timestamp()))
}

/// Refresh an access token
async fn refresh_access_token(
    http: &reqwest::Client,
    config: &ProviderConfig,
    refresh_token: &str,
) -> Result<OAuthTokens, OAuthError> {
    let mut params = vec![
        ("grant_type", "refresh_token"),
        ("refresh_token", refresh_token),
        ("client_id", config.client_id.as_str()),
    ];
    if let Some(secret) = &config.client_secret {
        params.push(("client_secret", secret.as_str()));
    }

    debug!("Refreshing access token");

    let response = http
        .post(&config.token_url)
        .form(&params)
        .send()
        .await
        .map_err(|e| OAuthError::Request(e.to_string()))?;

    if !response.status().is_success() {
        let error_text = response.text().await.unwrap_or_default();
        warn!("Token refresh failed: {}", error_text);
        return Err(OAuthError::RefreshFailed(error_text));
    }

    let token_response: TokenResponse = response
        .json()
        .await
        .map_err(|e| OAuthError::RefreshFailed(e.to_string()))?;

    Ok(token_response.into_tokens(Some(refresh_token), config, chrono::Utc::now().timestamp()))
}

// ============================================================================
// Token response parsing
// ============================================================================

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
    scope: Option<String>,
}

impl TokenResponse {
    /// Google does not return a new refresh token on refresh, so the
    /// previous one is carried over
    fn into_tokens(self, previous_refresh: Option<&str>, config: &ProviderConfig, now: i64) -> OAuthTokens {
        let expires_at = self.expires_in.map(|secs| now + secs as i64);
        let scopes = match self.scope {
            Some(scope) => scope.split_whitespace().map(str::to_string).collect(),
            None => config.scopes.clone(),
        };
        OAuthTokens {
            access_token: self.access_token,
            refresh_token: self
                .refresh_token
                .or_else(|| previous_refresh.map(str::to_string)),
            expires_at,
            scopes,
        }
    }
}

/// Generate a cryptographically secure state token
fn generate_state_token() -> String {
    let mut rng = rand::thread_rng();
    let bytes: [u8; 32] = rng.gen();
    URL_SAFE_NO_PAD.encode(bytes)
}
