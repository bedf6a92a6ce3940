// MCP (Model Context Protocol) server side of the tool tunnel
//
// The handler is transport-agnostic; `server` wires it to stdio and the relay
// client wires it to the tunnel.

pub mod framing;
pub mod handler;
pub mod protocol;
pub mod server;

pub use framing::{Assembled, MessageAssembler};
pub use handler::{McpHandler, SessionState, LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS};
pub use server::McpServer;
