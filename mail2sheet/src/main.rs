use clap::Parser;
use std::fs::{self, OpenOptions};
use std::path::Path;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter, Layer};

use mail2sheet_lib::{config, Cli};

fn env_filter() -> EnvFilter {
    // In debug builds, default to debug level for our crates
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if cfg!(debug_assertions) {
            EnvFilter::new("mail2sheet_lib=debug,mail2sheet=debug,warn")
        } else {
            EnvFilter::new("mail2sheet_lib=info,mail2sheet=info,warn")
        }
    })
}

fn init_tracing(log_file: Option<&Path>) {
    let file_layer = log_file.and_then(|path| {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            let _ = fs::create_dir_all(parent);
        }
        match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(env_filter()),
            ),
            Err(e) => {
                eprintln!("mail2sheet: cannot open log file {}: {}", path.display(), e);
                None
            }
        }
    });

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(env_filter()),
        )
        .with(file_layer)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match config::load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("mail2sheet: {}", e);
            std::process::exit(e.exit_code());
        }
    };

    init_tracing(config.log_file.as_deref());
    info!("Starting mail2sheet {}", env!("CARGO_PKG_VERSION"));
    if let Some(path) = &config.source_path {
        info!("Loaded configuration from: {:?}", path);
    }

    if let Err(e) = mail2sheet_lib::run(cli, config).await {
        error!("{}", e);
        std::process::exit(e.exit_code());
    }
}
