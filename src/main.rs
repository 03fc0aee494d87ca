//! Finrag server binary
//!
//! Usage:
//!   finrag-server [OPTIONS]
//!
//! Options:
//!   --config <PATH>      Path to configuration file (default: config.toml)
//!   --host <HOST>        Override the API server host
//!   --port <PORT>        Override the API server port

use finrag::api::{start_server, AppState};
use finrag::config::ServiceConfig;
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Debug)]
struct CliArgs {
    config_path: PathBuf,
    host: Option<String>,
    port: Option<u16>,
}

impl Default for CliArgs {
    fn default() -> Self {
        Self {
            config_path: PathBuf::from("config.toml"),
            host: None,
            port: None,
        }
    }
}

fn parse_args() -> CliArgs {
    let mut parsed = CliArgs::default();
    let mut args = std::env::args().skip(1);

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                if let Some(path) = args.next() {
                    parsed.config_path = PathBuf::from(path);
                }
            }
            "--host" => {
                parsed.host = args.next();
            }
            "--port" => {
                if let Some(port) = args.next() {
                    parsed.port = port.parse().ok();
                }
            }
            "--help" | "-h" => {
                println!(
                    "finrag-server {}\n\nOptions:\n  --config <PATH>  configuration file (default: config.toml)\n  --host <HOST>    bind host override\n  --port <PORT>    bind port override",
                    finrag::VERSION
                );
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {}", other);
                std::process::exit(2);
            }
        }
    }

    parsed
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args();

    let mut config = if args.config_path.exists() {
        ServiceConfig::from_file(&args.config_path)?
    } else {
        info!(
            "No config file at {}, using defaults with environment overrides",
            args.config_path.display()
        );
        let mut config = ServiceConfig::default();
        config.apply_env_overrides();
        config
    };

    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return Err(e);
    }

    info!("Starting finrag {}", finrag::VERSION);
    let state = AppState::new(config.clone()).await?;

    // Periodic session eviction per the configured inactivity window
    {
        let sessions = state.sessions.clone();
        let window = chrono::Duration::days(config.sessions.inactivity_window_days);
        let interval = std::time::Duration::from_secs(config.sessions.eviction_interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if let Err(e) = sessions.evict_inactive(window).await {
                    error!("Session eviction failed: {}", e);
                }
            }
        });
    }

    start_server(state, &config.server.host, config.server.port).await?;
    Ok(())
}
