use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::error::SyncError;

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Mailbox side
    #[serde(default)]
    pub source: SourceConfig,

    /// Spreadsheet side
    pub sink: SinkConfig,

    /// Credential and state file locations
    #[serde(default)]
    pub paths: PathsConfig,

    /// Retry tuning for transient provider errors
    #[serde(default)]
    pub retry: RetryConfig,

    /// Optional log file, written in addition to stderr
    pub log_file: Option<PathBuf>,

    /// File this configuration was read from
    #[serde(skip)]
    pub source_path: Option<PathBuf>,
}

/// Mailbox query configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Gmail search query selecting candidate messages
    #[serde(default = "default_query")]
    pub query: String,

    /// Only pick up messages whose subject contains this keyword
    pub subject_filter: Option<String>,

    /// Maximum number of messages listed per run
    #[serde(default = "default_max_results")]
    pub max_results: u32,
}

/// Spreadsheet destination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkConfig {
    /// Google Sheets spreadsheet id
    pub spreadsheet_id: String,

    /// Tab name inside the spreadsheet
    #[serde(default = "default_sheet_name")]
    pub sheet_name: String,
}

/// File locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// OAuth client secrets downloaded from the Google Cloud console
    #[serde(default = "default_client_secret_path")]
    pub client_secret: PathBuf,

    /// Stored OAuth tokens
    #[serde(default = "default_token_path")]
    pub token: PathBuf,

    /// Checkpoint of already handled message ids
    #[serde(default = "default_checkpoint_path")]
    pub checkpoint: PathBuf,
}

/// Exponential backoff settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per provider request (adapter boundary)
    #[serde(default = "default_request_attempts")]
    pub request_attempts: u32,

    /// Attempts per row append (sync engine)
    #[serde(default = "default_append_attempts")]
    pub append_attempts: u32,

    /// First backoff delay in milliseconds
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Backoff cap in milliseconds
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_query() -> String {
    "is:unread in:inbox".to_string()
}

fn default_max_results() -> u32 {
    50
}

fn default_sheet_name() -> String {
    "Sheet1".to_string()
}

fn default_client_secret_path() -> PathBuf {
    PathBuf::from("credentials").join("credentials.json")
}

fn default_token_path() -> PathBuf {
    PathBuf::from("credentials").join("token.json")
}

fn default_checkpoint_path() -> PathBuf {
    PathBuf::from("credentials").join("state.json")
}

fn default_request_attempts() -> u32 {
    5
}

fn default_append_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    2_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            query: default_query(),
            subject_filter: None,
            max_results: default_max_results(),
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            client_secret: default_client_secret_path(),
            token: default_token_path(),
            checkpoint: default_checkpoint_path(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            request_attempts: default_request_attempts(),
            append_attempts: default_append_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl SourceConfig {
    /// Full mailbox search query, including the optional subject filter
    pub fn effective_query(&self) -> String {
        match self.subject_filter.as_deref().map(str::trim) {
            Some(filter) if !filter.is_empty() => {
                format!("{} subject:\"{}\"", self.query, filter.replace('"', ""))
            }
            _ => self.query.clone(),
        }
    }
}

impl AppConfig {
    /// Parse a TOML document. Relative paths resolve against `base_dir`.
    pub fn from_toml_str(content: &str, base_dir: Option<&Path>) -> Result<Self, SyncError> {
        let mut config: AppConfig = toml::from_str(content)
            .map_err(|e| SyncError::Config(format!("Failed to parse config: {}", e)))?;

        if let Some(base) = base_dir {
            config.resolve_paths(base);
        }

        Ok(config)
    }

    fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.paths.client_secret);
        resolve(&mut self.paths.token);
        resolve(&mut self.paths.checkpoint);
        if let Some(log_file) = self.log_file.as_mut() {
            resolve(log_file);
        }
    }

    /// Apply `MAIL2SHEET_*` overrides from an environment lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(id) = lookup("MAIL2SHEET_SPREADSHEET_ID") {
            self.sink.spreadsheet_id = id;
        }
        if let Some(name) = lookup("MAIL2SHEET_SHEET_NAME") {
            self.sink.sheet_name = name;
        }
        if let Some(filter) = lookup("MAIL2SHEET_SUBJECT_FILTER") {
            self.source.subject_filter = Some(filter).filter(|f| !f.trim().is_empty());
        }
        if let Some(max) = lookup("MAIL2SHEET_MAX_RESULTS") {
            self.source.max_results = max.trim().parse().map_err(|_| {
                SyncError::Config(format!("MAIL2SHEET_MAX_RESULTS is not a number: {}", max))
            })?;
        }
        Ok(())
    }

    /// Reject configurations that cannot produce a working run
    pub fn validate(&self) -> Result<(), SyncError> {
        if self.sink.spreadsheet_id.trim().is_empty() {
            return Err(SyncError::Config("sink.spreadsheet_id is not set".into()));
        }
        if self.sink.sheet_name.trim().is_empty() {
            return Err(SyncError::Config("sink.sheet_name is empty".into()));
        }
        if !(1..=500).contains(&self.source.max_results) {
            return Err(SyncError::Config(format!(
                "source.max_results must be between 1 and 500, got {}",
                self.source.max_results
            )));
        }
        if self.retry.request_attempts == 0 || self.retry.append_attempts == 0 {
            return Err(SyncError::Config("retry attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Get default config paths
pub fn default_config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();

    // XDG config path
    if let Some(config_dir) = dirs::config_dir() {
        paths.push(config_dir.join("mail2sheet").join("config.toml"));
    }

    // Home directory fallback
    if let Some(home_dir) = dirs::home_dir() {
        paths.push(home_dir.join(".config").join("mail2sheet").join("config.toml"));
    }

    paths.push(PathBuf::from("mail2sheet.toml"));

    paths
}

/// Load configuration from an explicit path or the first default path found
pub fn load_config(explicit: Option<&Path>) -> Result<AppConfig, SyncError> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => default_config_paths()
            .into_iter()
            .find(|p| p.exists())
            .ok_or_else(|| {
                SyncError::Config(
                    "No config file found; pass --config or create mail2sheet.toml".into(),
                )
            })?,
    };

    let mut config = load_config_from_path(&path)?;
    config.apply_env_overrides(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

/// Load configuration from a specific path
pub fn load_config_from_path(path: &Path) -> Result<AppConfig, SyncError> {
    let content = fs::read_to_string(path)
        .map_err(|e| SyncError::Config(format!("Failed to read config {:?}: {}", path, e)))?;

    let mut config = AppConfig::from_toml_str(&content, path.parent())?;
    config.source_path = Some(path.to_path_buf());
    Ok(config)
}
