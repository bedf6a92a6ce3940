// Wire frames exchanged between a relay client and the relay server
//
// Frames travel as WebSocket text messages, one JSON object each, tagged by
// `type`. MCP payloads ride inside `request`/`response` untouched.

use serde::{Deserialize, Serialize};

/// Tunnel protocol version sent in `hello`
pub const TUNNEL_PROTOCOL_VERSION: u32 = 1;

/// Identifies one agent-facing stream (SSE session, WebSocket, or POST) on a tenant
pub type StreamId = String;

/// Relay-assigned, per-connection request identifier
pub type RequestId = u64;

/// Frames sent by the relay client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Hello {
        version: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subdomain: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lease_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        access_token: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        registration_secret: Option<String>,
    },
    /// Reply to a `request`; `message` is absent for notifications
    Response {
        request_id: RequestId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<serde_json::Value>,
    },
    Pong,
}

/// Frames sent by the relay server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        connection_id: String,
        subdomain: String,
        public_url: String,
        lease_token: String,
        lease_secs: u64,
    },
    Rejected {
        reason: String,
    },
    StreamOpened {
        stream_id: StreamId,
    },
    StreamClosed {
        stream_id: StreamId,
    },
    Request {
        request_id: RequestId,
        stream_id: StreamId,
        message: serde_json::Value,
    },
    /// The relay gave up waiting; abort the call
    Cancel {
        request_id: RequestId,
    },
    Ping,
}
