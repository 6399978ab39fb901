//! SOHT2 - TCP over HTTP tunnel
//!
//! One binary for both ends: `soht2 server` exposes the tunnel API, `soht2
//! client` forwards local ports through it.

mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use soht2_client::{ClientConfig, Soht2Client};
use soht2_server::{ServerConfig, Soht2Server};
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const VERSION: &str = concat!(
    env!("GIT_TAG"),
    " (",
    env!("GIT_HASH"),
    ", built ",
    env!("BUILD_TIME"),
    ")"
);

/// SOHT2 - Socket over HTTP tunnel
#[derive(Parser, Debug)]
#[command(name = "soht2")]
#[command(about = "SOHT2 - Tunnel TCP connections over plain HTTP")]
#[command(version = VERSION)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the tunnel server
    #[command(long_about = r#"
Run the tunnel server. Clients open tunnels to TCP targets through its
HTTP API at /api/connection.

EXAMPLES:
  soht2 server --config server.yaml
  soht2 server --bind 0.0.0.0:8080

ENVIRONMENT VARIABLES:
  SOHT2_CONFIG  Configuration file
  SOHT2_BIND    Address to listen on
    "#)]
    Server {
        /// YAML configuration file
        #[arg(short, long, env = "SOHT2_CONFIG")]
        config: Option<PathBuf>,

        /// Address to listen on (overrides the configuration file)
        #[arg(long, env = "SOHT2_BIND")]
        bind: Option<SocketAddr>,
    },

    /// Forward local ports through a tunnel server
    #[command(long_about = r#"
Listen on local ports and forward every accepted connection through the
tunnel server to its remote target.

EXAMPLES:
  soht2 client --config client.yaml
  soht2 client --url http://tunnel:8080/api/connection \
    --username user1 --password secret \
    --forward 2222:ssh.internal:22

ENVIRONMENT VARIABLES:
  SOHT2_CONFIG    Configuration file
  SOHT2_URL       Server connection URL
  SOHT2_USERNAME  Tunnel user
  SOHT2_PASSWORD  Tunnel password
    "#)]
    Client {
        /// YAML configuration file
        #[arg(short, long, env = "SOHT2_CONFIG")]
        config: Option<PathBuf>,

        /// Server connection URL (e.g. http://host:8080/api/connection)
        #[arg(long, env = "SOHT2_URL")]
        url: Option<String>,

        #[arg(long, env = "SOHT2_USERNAME")]
        username: Option<String>,

        #[arg(long, env = "SOHT2_PASSWORD", hide_env_values = true)]
        password: Option<String>,

        /// LOCAL_PORT:REMOTE_HOST:REMOTE_PORT, may be repeated
        #[arg(short, long = "forward", value_name = "SPEC")]
        forwards: Vec<String>,
    },

    /// Print an Argon2 hash for the server user directory
    HashPassword {
        password: String,
    },
}

/// Setup logging; `RUST_LOG` takes precedence over `--verbose`
fn setup_logging(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

async fn run_server(config_path: Option<PathBuf>, bind: Option<SocketAddr>) -> Result<()> {
    let mut config: ServerConfig = config::load_yaml(config_path.as_deref())?;
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }

    let bind_addr = config.bind_addr;
    let server = Soht2Server::from_config(config).context("Invalid server configuration")?;
    server
        .start(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
            info!("Received Ctrl+C, shutting down...");
        })
        .await
        .with_context(|| format!("Server on {} failed", bind_addr))
}

async fn run_client(
    config_path: Option<PathBuf>,
    url: Option<String>,
    username: Option<String>,
    password: Option<String>,
    forwards: Vec<String>,
) -> Result<()> {
    let mut config: ClientConfig = config::load_yaml(config_path.as_deref())?;
    if let Some(url) = url {
        config.url = url;
    }
    if let Some(username) = username {
        config.username = username;
    }
    if let Some(password) = password {
        config.password = password;
    }
    for forward in &forwards {
        config.connections.push(config::parse_forward(forward)?);
    }

    if config.connections.is_empty() {
        anyhow::bail!("No connections configured; use --forward or the configuration file");
    }
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("Invalid client configuration")?;

    let handle = Soht2Client::new(config)
        .context("Failed to create client")?
        .start()
        .await
        .context("Failed to bind local ports")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    info!("Received Ctrl+C, shutting down...");
    handle.stop().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    match cli.command {
        Commands::Server { config, bind } => {
            info!("SOHT2 server {}", VERSION);
            run_server(config, bind).await
        }
        Commands::Client {
            config,
            url,
            username,
            password,
            forwards,
        } => {
            info!("SOHT2 client {}", VERSION);
            run_client(config, url, username, password, forwards).await
        }
        Commands::HashPassword { password } => {
            let hash = soht2_server::hash_password(&password).context("Failed to hash password")?;
            println!("{}", hash);
            Ok(())
        }
    }
}
