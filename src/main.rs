//! paramrelay - avatar parameter relay
//!
//! Pairs one listener connection per user (the avatar client reporting live
//! parameter state) with any number of trigger dashboards that observe and
//! change those parameters.

use clap::{Parser as ClapParser, Subcommand};
use paramrelay::{
    config::{ConfigError, RelayConfig},
    relay::Relay,
    server,
    store::MemoryStore,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// paramrelay - avatar parameter relay
#[derive(ClapParser, Debug)]
#[command(name = "paramrelay", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the relay server
    Serve {
        /// Address to bind the HTTP/WebSocket server (overrides the config file)
        #[arg(long, env = "PARAMRELAY_BIND")]
        bind: Option<SocketAddr>,

        /// Path to the TOML config file
        #[arg(long, env = "PARAMRELAY_CONFIG", default_value = "paramrelay.toml")]
        config: PathBuf,

        /// TOML fixture used to seed the in-memory store
        #[arg(long, env = "PARAMRELAY_FIXTURE")]
        fixture: Option<PathBuf>,
    },

    /// Print the effective configuration and exit
    Config {
        /// Path to the TOML config file
        #[arg(long, env = "PARAMRELAY_CONFIG", default_value = "paramrelay.toml")]
        config: PathBuf,
    },
}

#[derive(Error, Debug)]
pub enum RelayServerError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),

    #[error("config encode error: {0}")]
    Encode(#[from] toml::ser::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), RelayServerError> {
    let cli = Cli::parse();
    init_tracing();

    match cli.command {
        Commands::Serve { bind, config, fixture } => run_server(bind, config, fixture).await,
        Commands::Config { config } => {
            let config = RelayConfig::load(&config)?;
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "paramrelay=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn run_server(
    bind: Option<SocketAddr>,
    config_path: PathBuf,
    fixture: Option<PathBuf>,
) -> Result<(), RelayServerError> {
    let mut config = RelayConfig::load(&config_path)?;
    if let Some(bind) = bind {
        config.bind = bind;
    }

    let store = match fixture {
        Some(path) => {
            tracing::info!(path = %path.display(), "seeding store from fixture");
            MemoryStore::from_fixture(&path)?
        }
        None => {
            tracing::warn!("no fixture given, starting with an empty store");
            MemoryStore::new()
        }
    };

    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    let relay = Relay::new(Arc::new(store), config);
    server::run(listener, relay, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        tracing::info!("received Ctrl+C");
    })
    .await?;
    Ok(())
}
