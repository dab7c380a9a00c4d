//! Beacon CLI binary.
//!
//! Keeps a device session alive against a control server.
//!
//! # Commands
//!
//! - `run` - Connect and hold the session until Ctrl-C, then disconnect
//! - `device-id` - Print (minting if needed) the persisted device identifier

use std::path::PathBuf;

use beacon::{resolve_device_id, Config, FileStore, SessionClient, SessionState, VERSION};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "beacon")]
#[command(version = VERSION)]
#[command(about = "Beacon - persistent device session client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect and keep the session alive until Ctrl-C
    Run {
        /// TOML configuration file (BEACON_* variables override it)
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Control server URL (ws:// or wss://)
        #[arg(short, long)]
        server: Option<String>,

        /// API key sent with the connection
        #[arg(short = 'k', long)]
        api_key: Option<String>,

        /// Log level when RUST_LOG is unset
        #[arg(long, default_value = "info")]
        log_level: String,

        /// Emit logs as JSON lines
        #[arg(long)]
        json_logs: bool,
    },

    /// Print the persisted device identifier
    DeviceId {
        /// TOML configuration file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            server,
            api_key,
            log_level,
            json_logs,
        } => cmd_run(config, server, api_key, &log_level, json_logs),

        Commands::DeviceId { config } => cmd_device_id(config),
    }
}

fn load_config(path: Option<PathBuf>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    Ok(config.with_env())
}

fn init_logging(log_level: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level));

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn cmd_run(
    config: Option<PathBuf>,
    server: Option<String>,
    api_key: Option<String>,
    log_level: &str,
    json_logs: bool,
) -> anyhow::Result<()> {
    init_logging(log_level, json_logs);

    let mut config = load_config(config)?;
    if let Some(server) = server {
        config.session.server_url = server;
    }
    if let Some(api_key) = api_key {
        config.session.api_key = api_key;
    }
    config.validate()?;

    tracing::info!("Starting beacon {} against {}", VERSION, config.session.server_url);

    let max_attempts = config.session.max_reconnect_attempts;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let client = SessionClient::builder(config).build()?;
        tracing::info!(device_id = client.device_id(), "Device identity resolved");

        let mut status = client.subscribe();
        client.connect().await;

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                result = &mut shutdown => {
                    result?;
                    tracing::info!("Shutdown requested");
                    break;
                },
                changed = status.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let current = status.borrow_and_update().clone();
                    let exhausted = max_attempts.is_some_and(|max| current.reconnect_attempts >= max);
                    if current.state == SessionState::Disconnected && !current.reconnect_pending && exhausted {
                        tracing::warn!(
                            attempts = current.reconnect_attempts,
                            "Session stopped reconnecting"
                        );
                        break;
                    }
                },
            }
        }

        client.disconnect().await;
        let traffic = client.traffic().read();
        tracing::info!(
            upload = traffic.upload_bytes,
            download = traffic.download_bytes,
            "Session closed with unreported traffic"
        );
        Ok::<_, anyhow::Error>(())
    })
}

fn cmd_device_id(config: Option<PathBuf>) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let store = FileStore::new(config.identity.resolved_path());
    let id = resolve_device_id(&store, &config.identity.namespace, &config.session.device_type);
    println!("{id}");
    Ok(())
}
