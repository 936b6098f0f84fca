//! mail2sheet - append unread mailbox messages to a spreadsheet
//!
//! Each run lists unread messages, turns every message not yet recorded into
//! one spreadsheet row, marks it read, and remembers it in a local
//! checkpoint so that no message is ever appended twice.
//!
//! ## Module Organization
//!
//! - `commands/`: CLI command handlers (thin wrappers)
//! - `sync/`: Sync engine, checkpoint store, normalizer, run lock, retries
//! - `adapters/`: Gmail and Google Sheets over HTTP
//! - `oauth/`: OAuth2 installed-app flow
//! - `credentials/`: Token storage and refresh
//! - `config/`: Configuration management
//! - `types/`: Data structures and the error type

pub mod adapters;
pub mod commands;
pub mod config;
pub mod credentials;
pub mod oauth;
pub mod sync;
pub mod types;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::types::error::Result;

#[derive(Debug, Parser)]
#[command(name = "mail2sheet", version, about = "Append unread mail to a Google Sheet, once per message")]
pub struct Cli {
    /// Path to the configuration file
    #[arg(long, short, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, PartialEq, Eq, Subcommand)]
pub enum Command {
    /// Run one sync (the default)
    Run,
    /// Sign in with Google and store the tokens
    Authorize {
        /// Loopback port for the redirect; 0 picks a free one
        #[arg(long, default_value_t = 0)]
        port: u16,
    },
    /// Show checkpoint and lock state without changing anything
    Status,
}

pub async fn run(cli: Cli, config: AppConfig) -> Result<()> {
    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            commands::run::run_sync(&config).await?;
        }
        Command::Authorize { port } => {
            commands::authorize::authorize(&config, port).await?;
        }
        Command::Status => {
            let report = commands::status::status(&config)?;
            println!("{}", report);
        }
    }
    Ok(())
}
