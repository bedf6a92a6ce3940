//! # toolrelay client
//!
//! Keeps one outbound tunnel from a local tool catalog to a relay server and
//! serves the MCP traffic the relay forwards over it.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use toolrelay_client::{ClientConfig, ClientResult, RelayClient};
//! use toolrelay_core::{Catalog, ToolExecutor};
//! use toolrelay_mcp::McpHandler;
//!
//! # async fn example() -> ClientResult<()> {
//! let catalog = Catalog::load("tools.toml").expect("valid catalog");
//! let handler = Arc::new(McpHandler::new(Arc::new(catalog), Arc::new(ToolExecutor::new())));
//!
//! let client = RelayClient::new(ClientConfig::parse("wss://relay.example.com")?, handler);
//! let connection = client.connect().await?;
//! println!("Agents connect to {}", connection.session.sse_endpoint());
//!
//! client.run(connection, CancellationToken::new()).await
//! # }
//! ```

pub mod config;
pub mod error;
pub mod tunnel;

pub use config::{ClientConfig, RetryConfig};
pub use error::{ClientError, ClientResult};
pub use tunnel::{Connection, RelayClient, Session};
