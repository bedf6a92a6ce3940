use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use toolrelay_server::{AppState, RelayConfig};

#[derive(Parser, Debug)]
#[command(name = "toolrelay-relay")]
#[command(about = "Relay server exposing local tool catalogs as public MCP endpoints", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "toolrelay-relay.toml", env = "TOOLRELAY_RELAY_CONFIG")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, default_value = "8080", env = "TOOLRELAY_RELAY_PORT")]
    port: u16,

    /// Host to bind to
    #[arg(long, default_value = "127.0.0.1", env = "TOOLRELAY_RELAY_HOST")]
    host: String,

    /// Override the configured base domain
    #[arg(long, env = "TOOLRELAY_BASE_DOMAIN")]
    base_domain: Option<String>,

    /// Emit logs as JSON lines
    #[arg(long, env = "TOOLRELAY_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "toolrelay_server=info,tower_http=info".into());
    if args.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    let mut config = RelayConfig::load(&args.config)?;
    if let Some(base_domain) = args.base_domain {
        config.base_domain = base_domain;
    }
    config.validate()?;

    tracing::info!(
        base_domain = %config.base_domain,
        lease_secs = config.lease_secs,
        "Starting toolrelay relay"
    );

    let addr = format!("{}:{}", args.host, args.port);
    toolrelay_server::serve(&addr, AppState::new(config)).await
}
