//! One-time browser sign-in
//!
//! Listens on a loopback port, prints the consent URL, and waits for Google
//! to redirect back with the authorization code.

use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::AppConfig;
use crate::credentials::TokenStore;
use crate::oauth::{OAuthManager, ProviderConfig};
use crate::types::error::{Result, SyncError};

const REDIRECT_TIMEOUT: Duration = Duration::from_secs(300);

/// What arrived on the loopback listener
#[derive(Debug, PartialEq, Eq)]
enum Redirect {
    Code { code: String, state: String },
    Denied(String),
    /// Anything else the browser asks for, such as `/favicon.ico`
    Unrelated,
    /// Not an HTTP request line at all, e.g. a preconnect that sent nothing
    Malformed,
}

pub async fn authorize(config: &AppConfig, port: u16) -> Result<()> {
    let provider = ProviderConfig::from_client_secret_file(&config.paths.client_secret)?;
    let manager = OAuthManager::new(provider);

    let listener = TcpListener::bind(("127.0.0.1", port)).await?;
    let redirect_uri = format!("http://127.0.0.1:{}/", listener.local_addr()?.port());
    let (auth_url, _state) = manager.start_auth_flow(&redirect_uri)?;

    println!("Open this URL in your browser to authorize mail2sheet:\n\n{}\n", auth_url);
    info!("Waiting for the authorization redirect on {}", redirect_uri);

    let (code, state) = tokio::time::timeout(REDIRECT_TIMEOUT, wait_for_redirect(&listener))
        .await
        .map_err(|_| SyncError::Other("Timed out waiting for the browser redirect".into()))??;

    let tokens = manager.complete_auth_flow(&code, &state).await?;
    if tokens.refresh_token.is_none() {
        warn!("No refresh token was issued; runs will fail once the access token expires");
    }

    let store = TokenStore::new(&config.paths.token);
    store.save(&tokens)?;
    println!("Authorized. Tokens saved to {}", store.path().display());
    Ok(())
}

async fn wait_for_redirect(listener: &TcpListener) -> Result<(String, String)> {
    loop {
        let (mut stream, peer) = listener.accept().await?;
        debug!("Loopback connection from {}", peer);

        let mut buf = vec![0u8; 8192];
        let n = match stream.read(&mut buf).await {
            Ok(n) => n,
            Err(e) => {
                debug!("Dropping loopback connection from {}: {}", peer, e);
                continue;
            }
        };
        let request = String::from_utf8_lossy(&buf[..n]);

        match parse_redirect(&request) {
            Redirect::Code { code, state } => {
                respond(&mut stream, "200 OK", "Authorization complete. You can close this tab.").await;
                return Ok((code, state));
            }
            Redirect::Denied(reason) => {
                respond(&mut stream, "200 OK", "Authorization was denied.").await;
                return Err(SyncError::AuthExpired(format!("authorization denied: {}", reason)));
            }
            Redirect::Unrelated => respond(&mut stream, "404 Not Found", "").await,
            Redirect::Malformed => {
                debug!("Ignoring malformed request from {}", peer);
                respond(&mut stream, "400 Bad Request", "").await
            }
        }
    }
}

fn parse_redirect(request: &str) -> Redirect {
    let Some(target) = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
    else {
        return Redirect::Malformed;
    };
    let Ok(url) = Url::parse(&format!("http://127.0.0.1{}", target)) else {
        return Redirect::Malformed;
    };
    let mut params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(error) = params.remove("error") {
        return Redirect::Denied(error);
    }
    match (params.remove("code"), params.remove("state")) {
        (Some(code), Some(state)) => Redirect::Code { code, state },
        _ => Redirect::Unrelated,
    }
}

async fn respond(stream: &mut TcpStream, status: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );
    if let Err(e) = stream.write_all(response.as_bytes()).await {
        debug!("Failed to answer loopback request: {}", e);
    }
}
