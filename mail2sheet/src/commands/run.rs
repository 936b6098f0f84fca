use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::warn;

use crate::adapters::gmail::GmailSource;
use crate::adapters::sheets::SheetsSink;
use crate::config::AppConfig;
use crate::credentials::{CredentialProvider, FileCredentialProvider, TokenStore};
use crate::oauth::{OAuthManager, ProviderConfig};
use crate::sync::checkpoint::CheckpointStore;
use crate::sync::engine::{RunReport, SyncEngine};
use crate::sync::retry::RetryPolicy;
use crate::types::error::Result;

/// Build the engine from configuration
pub fn build_engine(config: &AppConfig) -> Result<SyncEngine> {
    let provider = ProviderConfig::from_client_secret_file(&config.paths.client_secret)?;
    let oauth = Arc::new(OAuthManager::new(provider));
    let credentials: Arc<dyn CredentialProvider> = Arc::new(FileCredentialProvider::new(
        TokenStore::new(&config.paths.token),
        oauth,
    ));

    let request_retry = RetryPolicy::for_requests(&config.retry);
    let source = GmailSource::new(&config.source, credentials.clone(), request_retry);
    let sink = SheetsSink::new(&config.sink, credentials, request_retry);

    Ok(SyncEngine::new(
        Arc::new(source),
        Arc::new(sink),
        CheckpointStore::new(&config.paths.checkpoint),
        RetryPolicy::for_appends(&config.retry),
    ))
}

/// Run one sync; Ctrl-C stops it after the message in flight
pub async fn run_sync(config: &AppConfig) -> Result<RunReport> {
    let engine = build_engine(config)?;

    let shutdown = engine.shutdown_handle();
    let signal_task = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current message");
            shutdown.store(true, Ordering::SeqCst);
        }
    });

    let result = engine.run().await;
    signal_task.abort();
    result
}
