// MCP protocol types and definitions (JSON-RPC 2.0)

use serde::{Deserialize, Serialize};
use toolrelay_core::{ErrorKind, ExecutionResult, ToolOutput, ToolSummary};

pub const PARSE_ERROR: i32 = -32700;
pub const INVALID_REQUEST: i32 = -32600;
pub const METHOD_NOT_FOUND: i32 = -32601;
pub const INVALID_PARAMS: i32 = -32602;
pub const INTERNAL_ERROR: i32 = -32603;
pub const CONNECTION_CLOSED: i32 = -32000;
pub const REQUEST_TIMEOUT: i32 = -32001;
pub const SERVER_NOT_INITIALIZED: i32 = -32002;
pub const UNAVAILABLE: i32 = -32003;
pub const REQUEST_CANCELLED: i32 = -32800;

/// JSON-RPC 2.0 Request (a notification when `id` is absent)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<serde_json::Value>,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    pub fn new(
        id: impl Into<serde_json::Value>,
        method: impl Into<String>,
        params: Option<serde_json::Value>,
    ) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: Some(id.into()),
            method: method.into(),
            params,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id: None,
            method: method.into(),
            params,
        }
    }

    pub fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    pub fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn error(id: serde_json::Value, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn into_value(self) -> serde_json::Value {
        // only strings, numbers and maps inside; serialization cannot fail
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// JSON-RPC 2.0 Error; `data.kind` carries the [`ErrorKind`]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl JsonRpcError {
    /// Build an error whose JSON-RPC code follows from its kind
    pub fn from_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        let code = match kind {
            ErrorKind::ParseError => PARSE_ERROR,
            ErrorKind::InvalidRequest | ErrorKind::DuplicateRequest => INVALID_REQUEST,
            ErrorKind::UnknownMethod => METHOD_NOT_FOUND,
            ErrorKind::NotFound | ErrorKind::Validation => INVALID_PARAMS,
            ErrorKind::ProtocolOrder => SERVER_NOT_INITIALIZED,
            ErrorKind::ConnectionClosed => CONNECTION_CLOSED,
            ErrorKind::Timeout => REQUEST_TIMEOUT,
            ErrorKind::Cancelled => REQUEST_CANCELLED,
            ErrorKind::Unavailable | ErrorKind::Busy | ErrorKind::Unauthorized => UNAVAILABLE,
            _ => INTERNAL_ERROR,
        };
        Self {
            code,
            message: message.into(),
            data: Some(serde_json::json!({ "kind": kind })),
        }
    }

    pub fn parse_error(detail: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::ParseError, format!("Parse error: {}", detail.into()))
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::from_kind(ErrorKind::InvalidRequest, message)
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::from_kind(ErrorKind::UnknownMethod, format!("Method not found: {}", method))
    }

    pub fn not_initialized(method: &str) -> Self {
        Self::from_kind(
            ErrorKind::ProtocolOrder,
            format!("'{}' received before initialize", method),
        )
    }

    /// The kind recorded in `data.kind`, if any
    pub fn kind(&self) -> Option<ErrorKind> {
        self.data
            .as_ref()
            .and_then(|d| d.get("kind"))
            .and_then(|k| serde_json::from_value(k.clone()).ok())
    }
}

/// List tools response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListToolsResult {
    pub tools: Vec<ToolSummary>,
}

/// Call tool request params
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolParams {
    pub name: String,
    #[serde(default)]
    pub arguments: serde_json::Value,
}

/// Call tool response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallToolResult {
    pub content: Vec<ToolContent>,
    #[serde(rename = "structuredContent", skip_serializing_if = "Option::is_none")]
    pub structured_content: Option<serde_json::Value>,
    #[serde(rename = "isError", skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
    #[serde(rename = "_meta", skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
}

impl From<ExecutionResult> for CallToolResult {
    fn from(result: ExecutionResult) -> Self {
        let mut content = Vec::new();
        let text = result.output.to_text();
        if !text.is_empty() || result.success {
            content.push(ToolContent::text(text));
        }
        if let (Some(kind), Some(message)) = (result.error_kind, &result.message) {
            content.push(ToolContent::error(format!("{} ({})", message, kind)));
        }

        let structured_content = match &result.output {
            ToolOutput::Structured(value @ serde_json::Value::Object(_)) => Some(value.clone()),
            _ => None,
        };

        let mut meta = serde_json::Map::new();
        if let Some(kind) = result.error_kind {
            meta.insert("errorKind".to_string(), kind.as_str().into());
        }
        if let Some(code) = result.exit_code {
            meta.insert("exitCode".to_string(), code.into());
        }
        if let Some(status) = result.status {
            meta.insert("status".to_string(), status.into());
        }
        meta.insert("durationMs".to_string(), result.duration_ms.into());

        Self {
            content,
            structured_content,
            is_error: Some(!result.success),
            meta: Some(serde_json::Value::Object(meta)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ToolContent {
    #[serde(rename = "text")]
    Text { text: String },
}

impl ToolContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn error(text: impl Into<String>) -> Self {
        Self::Text {
            text: format!("Error: {}", text.into()),
        }
    }
}

/// Initialize request params
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InitializeParams {
    #[serde(rename = "protocolVersion", default)]
    pub protocol_version: Option<String>,
    #[serde(default)]
    pub capabilities: serde_json::Value,
    #[serde(rename = "clientInfo", default)]
    pub client_info: Option<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub name: String,
    #[serde(default)]
    pub version: String,
}

/// Initialize response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitializeResult {
    #[serde(rename = "protocolVersion")]
    pub protocol_version: String,
    pub capabilities: ServerCapabilities,
    #[serde(rename = "serverInfo")]
    pub server_info: ServerInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerCapabilities {
    pub tools: Option<ToolsCapability>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolsCapability {
    #[serde(rename = "listChanged")]
    pub list_changed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}
