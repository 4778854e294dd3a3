// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Folding@home client CLI
//!
//! Command-line entry point: parses arguments and an optional config file,
//! starts the local control surface, and drives the app loop until shutdown.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Result};
use clap::Parser;
use fah_client::app::{App, AppConfig};
use fah_client::http_client::ReqwestHttpClient;
use fah_client::system::AlwaysAvailable;

mod control_server;

/// Equivalent to the regex `[^<>;&'"]{1,64}`: 1-64 characters, none of
/// which are HTML/shell-special.
fn is_valid_machine_name(name: &str) -> bool {
    let len = name.chars().count();
    (1..=64).contains(&len) && !name.chars().any(|c| "<>;&'\"".contains(c))
}

#[derive(Parser)]
#[command(name = "fah-client")]
#[command(author, version, about = "Folding@home client", long_about = None)]
struct Cli {
    /// Path to a config file (optional; CLI flags override its contents)
    #[arg(value_name = "CONFIG_FILE")]
    config_file: Option<PathBuf>,

    /// Account token to link this machine with
    #[arg(long, value_name = "TOKEN")]
    account_token: Option<String>,

    /// Human-readable machine name, must match [^<>;&'"]{1,64}
    #[arg(long, value_name = "NAME")]
    machine_name: Option<String>,

    /// Assignment/account API server base URL
    #[arg(long, default_value = "https://api.foldingathome.org")]
    api_server: String,

    /// Comma-separated list of assignment server base URLs
    #[arg(long, value_delimiter = ',', default_value = "https://assign1.foldingathome.org")]
    assignment_servers: Vec<String>,

    /// Open a browser to the local control surface on startup
    #[arg(long)]
    open_web_control: bool,

    /// Port for the local control surface's WebSocket/HTTP server
    #[arg(long, default_value = "7396")]
    control_port: u16,

    /// Log verbosity: error, warn, info, debug, trace
    #[arg(long, default_value = "info")]
    verbosity: String,

    /// Write logs to this file in addition to stderr
    #[arg(long, value_name = "PATH")]
    log: Option<PathBuf>,
}

fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    if let Err(e) = validate(&cli) {
        eprintln!("error: {e}");
        std::process::exit(1);
    }

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(cli))
}

fn validate(cli: &Cli) -> Result<()> {
    if let Some(name) = &cli.machine_name {
        if !is_valid_machine_name(name) {
            bail!("--machine-name must be 1-64 characters and may not contain < > ; & ' \"");
        }
    }
    Ok(())
}

async fn async_main(cli: Cli) -> Result<()> {
    init_logging(&cli.verbosity, cli.log.as_deref())?;

    let config = AppConfig {
        api_server: cli.api_server.clone(),
        assignment_servers: cli.assignment_servers.clone(),
        machine_name: cli.machine_name.clone().unwrap_or_else(default_machine_name),
    };

    let http = Arc::new(ReqwestHttpClient::new()?);
    let system = Arc::new(AlwaysAvailable);
    let mut app = App::new(config, http, system)?;

    if let Some(token) = cli.account_token {
        app.account.request_link(token)?;
    }

    let control_handle = control_server::spawn(cli.control_port, app.bus.subscribe());
    if cli.open_web_control {
        let url = format!("http://127.0.0.1:{}", cli.control_port);
        tracing::info!("local control surface available at {url}");
    }

    tracing::info!(machine = %app.config.machine_name, "fah-client starting");

    let mut shutdown = Box::pin(tokio::signal::ctrl_c());
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, finishing in-flight work units");
                app.request_shutdown();
                if app.all_units_stopped() {
                    break;
                }
            }
            _ = tokio::time::sleep(std::time::Duration::from_millis(250)) => {
                if app.shutdown_requested() && app.all_units_stopped() {
                    break;
                }
                app.tick(std::time::SystemTime::now()).await;
            }
        }
    }

    control_handle.abort();
    tracing::info!("fah-client stopped cleanly");
    Ok(())
}

fn default_machine_name() -> String {
    hostname_or_fallback()
}

fn hostname_or_fallback() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "fah-client".to_string())
}

fn init_logging(verbosity: &str, log_file: Option<&std::path::Path>) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| verbosity.parse().unwrap_or_else(|_| "info".into()));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter);

    if let Some(path) = log_file {
        let file = std::fs::OpenOptions::new().create(true).append(true).open(path)?;
        subscriber
            .with_writer(move || file.try_clone().expect("log file handle is clonable"))
            .init();
    } else {
        subscriber.init();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        assert!(is_valid_machine_name("laptop"));
        assert!(is_valid_machine_name("a"));
    }

    #[test]
    fn rejects_empty_and_overlong_names() {
        assert!(!is_valid_machine_name(""));
        assert!(!is_valid_machine_name(&"a".repeat(65)));
    }

    #[test]
    fn rejects_shell_and_html_special_characters() {
        for bad in ["<script>", "a;b", "a&b", "a'b", "a\"b"] {
            assert!(!is_valid_machine_name(bad), "expected {bad} to be rejected");
        }
    }
}
