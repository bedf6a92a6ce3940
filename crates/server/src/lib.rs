// Relay server: public MCP endpoints per subdomain, tunnelled to relay clients

pub mod api;
pub mod config;
pub mod error;
pub mod middleware;
pub mod pending;
pub mod registry;
pub mod tenant;
pub mod websocket;

pub use api::{create_router, serve, serve_with_listener};
pub use config::{AppState, RelayConfig};
pub use error::RelayError;
pub use registry::{InMemoryRouteTable, RouteTable};
