// Standalone MCP server binary: serves a tool catalog over stdio

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use toolrelay_core::{Catalog, ToolExecutor};
use toolrelay_mcp::{McpHandler, McpServer};

#[derive(Parser, Debug)]
#[command(name = "toolrelay-mcp", version, about = "Serve a tool catalog to a local MCP client over stdio")]
struct Cli {
    /// Tool catalog (TOML, or JSON by `.json` extension)
    #[arg(long, env = "TOOLRELAY_CATALOG")]
    catalog: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    // stdout carries protocol frames only
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "toolrelay_mcp=info,toolrelay_core=info".into()),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();

    let catalog = Catalog::load(&cli.catalog)
        .with_context(|| format!("failed to load catalog {}", cli.catalog.display()))?;
    tracing::info!(tools = catalog.len(), "Loaded tool catalog");

    let handler = Arc::new(McpHandler::new(
        Arc::new(catalog),
        Arc::new(ToolExecutor::new()),
    ));

    McpServer::new(handler).start().await
}
