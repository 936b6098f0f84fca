//! Credential storage
//!
//! OAuth tokens live in a JSON file next to the client secret. Adapters ask a
//! `CredentialProvider` for a bearer token before each request; the file
//! provider refreshes it shortly before expiry and writes the new token back.

use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::oauth::{OAuthManager, OAuthTokens};
use crate::sync::checkpoint::write_private;
use crate::types::error::{Result, SyncError};

/// Source of bearer tokens for provider requests
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// A currently valid access token
    async fn access_token(&self) -> Result<String>;
}

/// Exchanges a refresh token for new tokens
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens>;
}

#[async_trait]
impl TokenRefresher for OAuthManager {
    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
        Ok(self.refresh_tokens(refresh_token).await?)
    }
}

/// JSON file holding the OAuth tokens
#[derive(Debug, Clone)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load stored tokens. A missing file means the tool was never authorized.
    pub fn load(&self) -> Result<OAuthTokens> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(SyncError::AuthExpired(format!(
                    "no token file at {:?}",
                    self.path
                )));
            }
            Err(e) => return Err(SyncError::Io(format!("Failed to read {:?}: {}", self.path, e))),
        };

        let tokens: OAuthTokens = serde_json::from_str(&content).map_err(|e| {
            SyncError::AuthExpired(format!("token file {:?} is unreadable: {}", self.path, e))
        })?;
        debug!("Loaded OAuth tokens from {:?}", self.path);
        Ok(tokens)
    }

    pub fn save(&self, tokens: &OAuthTokens) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(tokens)?;
        write_private(&self.path, &bytes)?;
        info!("Stored OAuth tokens in {:?}", self.path);
        Ok(())
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }
}

/// Token provider backed by a `TokenStore`, refreshing on demand
pub struct FileCredentialProvider {
    store: TokenStore,
    refresher: Arc<dyn TokenRefresher>,
    cached: Mutex<Option<OAuthTokens>>,
}

impl FileCredentialProvider {
    pub fn new(store: TokenStore, refresher: Arc<dyn TokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            cached: Mutex::new(None),
        }
    }
}

#[async_trait]
impl CredentialProvider for FileCredentialProvider {
    async fn access_token(&self) -> Result<String> {
        let mut cached = self.cached.lock().await;

        let tokens = match cached.take() {
            Some(tokens) => tokens,
            None => self.store.load()?,
        };

        let now = chrono::Utc::now().timestamp();
        let tokens = if tokens.should_refresh(now) {
            let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
                SyncError::AuthExpired("access token expired and no refresh token is stored".into())
            })?;
            let refreshed = self.refresher.refresh(&refresh_token).await?;
            self.store.save(&refreshed)?;
            refreshed
        } else {
            tokens
        };

        let access_token = tokens.access_token.clone();
        *cached = Some(tokens);
        Ok(access_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingRefresher {
        calls: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl TokenRefresher for CountingRefresher {
        async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SyncError::AuthExpired("invalid_grant".into()));
            }
            Ok(OAuthTokens {
                access_token: "fresh".into(),
                refresh_token: Some(refresh_token.to_string()),
                expires_at: Some(chrono::Utc::now().timestamp() + 3600),
                scopes: vec![],
            })
        }
    }

    fn refresher(fail: bool) -> Arc<CountingRefresher> {
        Arc::new(CountingRefresher {
            calls: AtomicU32::new(0),
            fail,
        })
    }

    fn tokens(expires_in: i64) -> OAuthTokens {
        OAuthTokens {
            access_token: "stored".into(),
            refresh_token: Some("refresh".into()),
            expires_at: Some(chrono::Utc::now().timestamp() + expires_in),
            scopes: vec!["https://www.googleapis.com/auth/spreadsheets".into()],
        }
    }

    #[tokio::test]
    async fn test_missing_token_file_is_auth_expired() {
        let dir = tempfile::tempdir().unwrap();
        let provider = FileCredentialProvider::new(
            TokenStore::new(dir.path().join("token.json")),
            refresher(false),
        );
        let err = provider.access_token().await.unwrap_err();
        assert_eq!(err.exit_code(), 10);
    }

    #[tokio::test]
    async fn test_valid_token_used_without_refresh() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store.save(&tokens(3600)).unwrap();
        let refresher = refresher(false);

        let provider = FileCredentialProvider::new(store, refresher.clone());
        assert_eq!(provider.access_token().await.unwrap(), "stored");
        assert_eq!(provider.access_token().await.unwrap(), "stored");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_expiring_token_refreshed_and_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store.save(&tokens(30)).unwrap();
        let refresher = refresher(false);

        let provider = FileCredentialProvider::new(store.clone(), refresher.clone());
        assert_eq!(provider.access_token().await.unwrap(), "fresh");
        assert_eq!(provider.access_token().await.unwrap(), "fresh");
        assert_eq!(refresher.calls.load(Ordering::SeqCst), 1);

        let saved = store.load().unwrap();
        assert_eq!(saved.access_token, "fresh");
        assert_eq!(saved.refresh_token.as_deref(), Some("refresh"));
    }

    #[tokio::test]
    async fn test_failed_refresh_is_auth_expired() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        store.save(&tokens(-10)).unwrap();

        let provider = FileCredentialProvider::new(store.clone(), refresher(true));
        let err = provider.access_token().await.unwrap_err();
        assert!(matches!(err, SyncError::AuthExpired(_)));
        // The stored token is left as it was
        assert_eq!(store.load().unwrap().access_token, "stored");
    }

    #[tokio::test]
    async fn test_expired_token_without_refresh_token() {
        let dir = tempfile::tempdir().unwrap();
        let store = TokenStore::new(dir.path().join("token.json"));
        let mut expired = tokens(-10);
        expired.refresh_token = None;
        store.save(&expired).unwrap();

        let provider = FileCredentialProvider::new(store, refresher(false));
        assert!(matches!(
            provider.access_token().await,
            Err(SyncError::AuthExpired(_))
        ));
    }

    #[test]
    fn test_garbled_token_file_is_auth_expired() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        fs::write(&path, "{").unwrap();
        assert!(matches!(
            TokenStore::new(path).load(),
            Err(SyncError::AuthExpired(_))
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_saved_tokens_are_private_even_over_stale_temp_file() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        // Left behind by an interrupted save under a permissive umask
        let stale = dir.path().join("token.json.tmp");
        fs::write(&stale, "{}").unwrap();
        fs::set_permissions(&stale, fs::Permissions::from_mode(0o644)).unwrap();

        let store = TokenStore::new(&path);
        store.save(&tokens(3600)).unwrap();

        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert!(!stale.exists());
        assert_eq!(store.load().unwrap().access_token, "stored");
    }
}
