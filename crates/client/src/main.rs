//! # toolrelay
//!
//! Serve a local tool catalog to remote agents through a relay server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use toolrelay_client::{ClientConfig, RelayClient, RetryConfig};
use toolrelay_core::{Catalog, ToolExecutor};
use toolrelay_mcp::McpHandler;
use tracing_subscriber::EnvFilter;

/// toolrelay - expose a local tool catalog as a public MCP endpoint
#[derive(Parser)]
#[command(name = "toolrelay")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connect to a relay and serve the catalog until interrupted
    Serve {
        /// Tool catalog (TOML, or JSON by `.json` extension)
        #[arg(long, env = "TOOLRELAY_CATALOG")]
        catalog: PathBuf,

        /// Relay server URL
        #[arg(long, env = "TOOLRELAY_RELAY_URL")]
        relay: String,

        /// Subdomain to request
        #[arg(long)]
        subdomain: Option<String>,

        /// Bearer token agents must present
        #[arg(long, env = "TOOLRELAY_ACCESS_TOKEN", conflicts_with = "generate_token")]
        token: Option<String>,

        /// Generate a random bearer token
        #[arg(long)]
        generate_token: bool,

        /// Secret the relay requires to accept tunnels
        #[arg(long, env = "TOOLRELAY_REGISTRATION_SECRET")]
        registration_secret: Option<String>,

        /// Give up after this many failed reconnects (default: never)
        #[arg(long)]
        max_retries: Option<u32>,

        /// Seconds without relay traffic before the tunnel counts as dropped
        #[arg(long, default_value = "90")]
        idle_timeout_secs: u64,
    },
    /// Validate a catalog and list its tools
    Check {
        /// Tool catalog (TOML, or JSON by `.json` extension)
        #[arg(long, env = "TOOLRELAY_CATALOG")]
        catalog: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "toolrelay_client=debug,toolrelay_mcp=debug,toolrelay_core=debug"
    } else {
        "toolrelay_client=info,toolrelay_mcp=info,toolrelay_core=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    match cli.command {
        Commands::Serve {
            catalog,
            relay,
            subdomain,
            token,
            generate_token,
            registration_secret,
            max_retries,
            idle_timeout_secs,
        } => {
            let catalog = load_catalog(&catalog)?;

            let mut config = ClientConfig::parse(&relay)
                .with_context(|| format!("invalid relay URL '{}'", relay))?;
            config.subdomain = subdomain;
            config.access_token = match token {
                Some(token) => Some(token),
                None if generate_token => Some(uuid::Uuid::new_v4().simple().to_string()),
                None => None,
            };
            config.registration_secret = registration_secret;
            config.idle_timeout = Duration::from_secs(idle_timeout_secs);
            config.retry_config = RetryConfig {
                max_retries,
                ..Default::default()
            };
            serve(catalog, config).await
        }
        Commands::Check { catalog } => {
            let catalog = load_catalog(&catalog)?;
            print_catalog(&catalog);
            Ok(())
        }
    }
}

fn load_catalog(path: &Path) -> Result<Catalog> {
    let catalog = Catalog::load(path)
        .with_context(|| format!("failed to load catalog {}", path.display()))?;
    tracing::info!(tools = catalog.len(), "Loaded tool catalog");
    Ok(catalog)
}

async fn serve(catalog: Catalog, config: ClientConfig) -> Result<()> {
    let access_token = config.access_token.clone();
    let handler = Arc::new(
        McpHandler::new(Arc::new(catalog), Arc::new(ToolExecutor::new()))
            .with_server_info("toolrelay", env!("CARGO_PKG_VERSION")),
    );
    let client = RelayClient::new(config, handler);

    let connection = client
        .connect()
        .await
        .context("failed to connect to relay")?;

    println!("Public endpoint: {}", connection.session.sse_endpoint());
    if let Some(token) = &access_token {
        println!("Access token:    {}", token);
    }

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, shutting down");
                shutdown.cancel();
            }
        }
    });

    client.run(connection, shutdown).await?;
    Ok(())
}

fn print_catalog(catalog: &Catalog) {
    println!("{} tool(s)", catalog.len());
    for tool in catalog.iter() {
        println!("  {} - {}", tool.name, tool.description);
        for param in &tool.parameters {
            let required = if param.required { ", required" } else { "" };
            match &param.description {
                Some(description) => {
                    println!("      {} ({}{}): {}", param.name, param.param_type, required, description)
                }
                None => println!("      {} ({}{})", param.name, param.param_type, required),
            }
        }
    }
}
