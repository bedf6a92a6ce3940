// Per-connection MCP protocol handler
//
// Every transport (stdio, relay tunnel) feeds whole JSON-RPC messages in here
// keyed by a connection id and writes back whatever comes out. Tool calls on
// one connection run concurrently and are correlated purely by request id.

use crate::framing::{Assembled, MessageAssembler};
use crate::protocol::*;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use toolrelay_core::{Catalog, ErrorKind, Execute};

/// Protocol revisions this handler speaks, oldest first
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &["2024-11-05", "2025-03-26", "2025-06-18"];

pub const LATEST_PROTOCOL_VERSION: &str = "2025-06-18";

const KNOWN_METHODS: &[&str] = &["initialize", "ping", "tools/list", "tools/call"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Ready,
    /// Ready with at least one tool call in flight
    Executing,
    Closed,
}

struct InFlight {
    seq: u64,
    token: CancellationToken,
}

#[derive(Default)]
struct Session {
    initialized: bool,
    protocol_version: Option<String>,
    client_info: Option<ClientInfo>,
    in_flight: HashMap<String, InFlight>,
}

/// Catalog plus its pre-serialised `tools/list` result
struct CatalogView {
    catalog: Arc<Catalog>,
    tools_list: Value,
}

impl CatalogView {
    fn new(catalog: Arc<Catalog>) -> Self {
        let tools_list = serde_json::to_value(ListToolsResult {
            tools: catalog.list().to_vec(),
        })
        .unwrap_or_else(|_| serde_json::json!({ "tools": [] }));
        Self {
            catalog,
            tools_list,
        }
    }
}

pub struct McpHandler {
    catalog: RwLock<Arc<CatalogView>>,
    executor: Arc<dyn Execute>,
    server_info: ServerInfo,
    sessions: Mutex<HashMap<String, Session>>,
    next_seq: AtomicU64,
}

impl McpHandler {
    pub fn new(catalog: Arc<Catalog>, executor: Arc<dyn Execute>) -> Self {
        Self {
            catalog: RwLock::new(Arc::new(CatalogView::new(catalog))),
            executor,
            server_info: ServerInfo {
                name: "toolrelay".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            sessions: Mutex::new(HashMap::new()),
            next_seq: AtomicU64::new(1),
        }
    }

    pub fn with_server_info(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.server_info = ServerInfo {
            name: name.into(),
            version: version.into(),
        };
        self
    }

    pub fn catalog(&self) -> Arc<Catalog> {
        self.catalog.read().catalog.clone()
    }

    /// Swap in a new catalog. Calls already running keep their tool definition.
    pub fn replace_catalog(&self, catalog: Arc<Catalog>) {
        tracing::info!(tools = catalog.len(), "Catalog replaced");
        *self.catalog.write() = Arc::new(CatalogView::new(catalog));
    }

    /// Start tracking a connection. `initialize` on an unknown connection opens it
    /// too; anything else there is answered with `connection_closed`.
    pub fn open(&self, conn: &str) {
        self.sessions.lock().entry(conn.to_string()).or_default();
        tracing::debug!(connection = %conn, "MCP connection opened");
    }

    /// Tear down a connection; in-flight calls resolve as `connection_closed`
    pub fn close(&self, conn: &str) {
        let Some(session) = self.sessions.lock().remove(conn) else {
            return;
        };
        let pending = session.in_flight.len();
        for entry in session.in_flight.into_values() {
            entry.token.cancel();
        }
        tracing::debug!(connection = %conn, pending, "MCP connection closed");
    }

    /// Unknown and closed connections both report `Closed`
    pub fn state(&self, conn: &str) -> SessionState {
        match self.sessions.lock().get(conn) {
            None => SessionState::Closed,
            Some(s) if !s.initialized => SessionState::Uninitialized,
            Some(s) if !s.in_flight.is_empty() => SessionState::Executing,
            Some(_) => SessionState::Ready,
        }
    }

    pub fn in_flight(&self, conn: &str) -> usize {
        self.sessions
            .lock()
            .get(conn)
            .map(|s| s.in_flight.len())
            .unwrap_or(0)
    }

    pub fn client_info(&self, conn: &str) -> Option<ClientInfo> {
        self.sessions
            .lock()
            .get(conn)
            .and_then(|s| s.client_info.clone())
    }

    pub fn protocol_version(&self, conn: &str) -> Option<String> {
        self.sessions
            .lock()
            .get(conn)
            .and_then(|s| s.protocol_version.clone())
    }

    /// Handle raw text holding exactly one message or batch
    pub async fn handle_text(&self, conn: &str, text: &str) -> Option<Value> {
        match MessageAssembler::parse_complete(text) {
            Assembled::Message(message) => self.handle_message(conn, message).await,
            Assembled::Malformed(detail) => Some(
                JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error(detail)).into_value(),
            ),
        }
    }

    /// Handle one parsed message or batch. `None` means nothing to send back.
    pub async fn handle_message(&self, conn: &str, message: Value) -> Option<Value> {
        match message {
            Value::Array(items) if items.is_empty() => Some(
                JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::invalid_request("empty batch"),
                )
                .into_value(),
            ),
            Value::Array(items) => {
                let responses: Vec<Value> =
                    join_all(items.into_iter().map(|item| self.handle_single(conn, item)))
                        .await
                        .into_iter()
                        .flatten()
                        .collect();
                if responses.is_empty() {
                    None
                } else {
                    Some(Value::Array(responses))
                }
            }
            message => self.handle_single(conn, message).await,
        }
    }

    async fn handle_single(&self, conn: &str, message: Value) -> Option<Value> {
        let Some(object) = message.as_object() else {
            return Some(
                JsonRpcResponse::error(
                    Value::Null,
                    JsonRpcError::invalid_request("message must be a JSON object"),
                )
                .into_value(),
            );
        };

        // responses from the client; this server never issues requests
        if !object.contains_key("method")
            && (object.contains_key("result") || object.contains_key("error"))
        {
            tracing::debug!(connection = %conn, "Ignoring client response");
            return None;
        }

        let raw_id = object.get("id").cloned().unwrap_or(Value::Null);
        let request: JsonRpcRequest = match serde_json::from_value(message) {
            Ok(request) => request,
            Err(e) => {
                return Some(
                    JsonRpcResponse::error(
                        raw_id,
                        JsonRpcError::invalid_request(format!("Invalid request: {}", e)),
                    )
                    .into_value(),
                )
            }
        };

        if request.jsonrpc != "2.0" {
            return Some(
                JsonRpcResponse::error(
                    raw_id,
                    JsonRpcError::invalid_request("jsonrpc must be \"2.0\""),
                )
                .into_value(),
            );
        }

        let Some(id) = request.id.clone() else {
            self.handle_notification(conn, &request);
            return None;
        };

        let outcome = self.dispatch(conn, &request).await;
        let response = match outcome {
            Ok(result) => JsonRpcResponse::success(id, result),
            Err(error) => {
                tracing::debug!(
                    connection = %conn,
                    method = %request.method,
                    kind = ?error.kind(),
                    "Request failed"
                );
                JsonRpcResponse::error(id, error)
            }
        };
        Some(response.into_value())
    }

    fn handle_notification(&self, conn: &str, request: &JsonRpcRequest) {
        match request.method.as_str() {
            "notifications/initialized" => {
                tracing::debug!(connection = %conn, "Client finished initialization");
            }
            "notifications/cancelled" => {
                let Some(request_id) = request.params.as_ref().and_then(|p| p.get("requestId"))
                else {
                    return;
                };
                let key = request_id.to_string();
                let token = self
                    .sessions
                    .lock()
                    .get(conn)
                    .and_then(|s| s.in_flight.get(&key))
                    .map(|entry| entry.token.clone());
                if let Some(token) = token {
                    tracing::info!(connection = %conn, request_id = %key, "Cancelling tool call");
                    token.cancel();
                }
            }
            other => {
                tracing::debug!(connection = %conn, method = %other, "Ignoring notification");
            }
        }
    }

    async fn dispatch(&self, conn: &str, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let method = request.method.as_str();
        if !KNOWN_METHODS.contains(&method) {
            return Err(JsonRpcError::method_not_found(method));
        }

        let initialized = {
            let mut sessions = self.sessions.lock();
            match sessions.get(conn) {
                Some(session) => session.initialized,
                None if method == "initialize" => {
                    sessions.insert(conn.to_string(), Session::default());
                    false
                }
                None => return Err(connection_closed()),
            }
        };

        match (method, initialized) {
            ("initialize", false) => self.initialize(conn, request.params.clone()),
            ("initialize", true) => Err(JsonRpcError::from_kind(
                ErrorKind::ProtocolOrder,
                "connection is already initialized",
            )),
            (_, false) => Err(JsonRpcError::not_initialized(method)),
            ("ping", true) => Ok(serde_json::json!({})),
            ("tools/list", true) => Ok(self.catalog.read().tools_list.clone()),
            ("tools/call", true) => self.call_tool(conn, request).await,
            _ => Err(JsonRpcError::method_not_found(method)),
        }
    }

    fn initialize(&self, conn: &str, params: Option<Value>) -> Result<Value, JsonRpcError> {
        let params: InitializeParams = match params {
            None | Some(Value::Null) => InitializeParams::default(),
            Some(params) => serde_json::from_value(params).map_err(|e| {
                JsonRpcError::from_kind(
                    ErrorKind::Validation,
                    format!("invalid initialize params: {}", e),
                )
            })?,
        };

        let protocol_version = params
            .protocol_version
            .as_deref()
            .filter(|v| SUPPORTED_PROTOCOL_VERSIONS.contains(v))
            .unwrap_or(LATEST_PROTOCOL_VERSION)
            .to_string();

        {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(conn).ok_or_else(connection_closed)?;
            session.initialized = true;
            session.protocol_version = Some(protocol_version.clone());
            session.client_info = params.client_info.clone();
        }

        tracing::info!(
            connection = %conn,
            protocol_version = %protocol_version,
            client = params.client_info.as_ref().map(|c| c.name.as_str()).unwrap_or("unknown"),
            "MCP session initialized"
        );

        let result = InitializeResult {
            protocol_version,
            capabilities: ServerCapabilities {
                tools: Some(ToolsCapability {
                    list_changed: false,
                }),
            },
            server_info: self.server_info.clone(),
        };
        serde_json::to_value(result)
            .map_err(|e| JsonRpcError::from_kind(ErrorKind::InvalidRequest, e.to_string()))
    }

    async fn call_tool(&self, conn: &str, request: &JsonRpcRequest) -> Result<Value, JsonRpcError> {
        let params: CallToolParams =
            serde_json::from_value(request.params.clone().unwrap_or(Value::Null)).map_err(|e| {
                JsonRpcError::from_kind(
                    ErrorKind::Validation,
                    format!("invalid tools/call params: {}", e),
                )
            })?;

        let tool = self
            .catalog
            .read()
            .catalog
            .lookup(&params.name)
            .cloned()
            .ok_or_else(|| {
                JsonRpcError::from_kind(
                    ErrorKind::NotFound,
                    format!("Unknown tool: {}", params.name),
                )
            })?;

        let arguments = tool
            .validate_arguments(&params.arguments)
            .map_err(|e| JsonRpcError::from_kind(ErrorKind::Validation, e.to_string()))?;

        let key = request
            .id
            .as_ref()
            .map(Value::to_string)
            .unwrap_or_default();
        let token = CancellationToken::new();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        {
            let mut sessions = self.sessions.lock();
            let session = sessions.get_mut(conn).ok_or_else(connection_closed)?;
            if session.in_flight.contains_key(&key) {
                return Err(JsonRpcError::from_kind(
                    ErrorKind::DuplicateRequest,
                    format!("request id {} is already in flight", key),
                ));
            }
            session.in_flight.insert(
                key.clone(),
                InFlight {
                    seq,
                    token: token.clone(),
                },
            );
        }
        let _guard = InFlightGuard {
            handler: self,
            conn,
            key: &key,
            seq,
        };

        tracing::debug!(connection = %conn, tool = %tool.name, request_id = %key, "Calling tool");

        tokio::select! {
            result = self.executor.execute(&tool, arguments) => {
                serde_json::to_value(CallToolResult::from(result)).map_err(|e| {
                    JsonRpcError::from_kind(ErrorKind::InvalidRequest, e.to_string())
                })
            }
            _ = token.cancelled() => {
                if self.sessions.lock().contains_key(conn) {
                    Err(JsonRpcError::from_kind(ErrorKind::Cancelled, "request was cancelled"))
                } else {
                    Err(JsonRpcError::from_kind(
                        ErrorKind::ConnectionClosed,
                        "connection closed before the call completed",
                    ))
                }
            }
        }
    }
}

fn connection_closed() -> JsonRpcError {
    JsonRpcError::from_kind(ErrorKind::ConnectionClosed, "connection is not open")
}

/// Removes an in-flight entry however the call ends
struct InFlightGuard<'a> {
    handler: &'a McpHandler,
    conn: &'a str,
    key: &'a str,
    seq: u64,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut sessions = self.handler.sessions.lock();
        if let Some(session) = sessions.get_mut(self.conn) {
            if session.in_flight.get(self.key).map(|e| e.seq) == Some(self.seq) {
                session.in_flight.remove(self.key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use toolrelay_core::{ExecutionResult, ToolDefinition, ToolOutput};

    const CATALOG: &str = r#"
[[tools]]
name = "echo"
description = "Echo a message"

[[tools.parameters]]
name = "msg"
type = "string"
required = true

[tools.shell]
command = "echo {{msg}}"
timeout_secs = 5

[[tools]]
name = "slow"
description = "Never finishes on its own"

[tools.shell]
argv = ["sleep", "30"]
"#;

    /// Records calls; `slow` blocks until dropped
    #[derive(Default)]
    struct FakeExecutor {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Execute for FakeExecutor {
        async fn execute(&self, tool: &ToolDefinition, params: Map<String, Value>) -> ExecutionResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if tool.name == "slow" {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            let msg = params.get("msg").and_then(Value::as_str).unwrap_or_default();
            ExecutionResult::ok(ToolOutput::Text(format!("{}\n", msg)), Duration::ZERO)
        }
    }

    fn handler() -> (Arc<McpHandler>, Arc<FakeExecutor>) {
        let catalog = Arc::new(Catalog::from_toml_str(CATALOG).unwrap());
        let executor = Arc::new(FakeExecutor::default());
        (Arc::new(McpHandler::new(catalog, executor.clone())), executor)
    }

    async fn request(h: &McpHandler, conn: &str, id: i64, method: &str, params: Value) -> Value {
        h.handle_message(conn, json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await
            .unwrap()
    }

    async fn initialized() -> (Arc<McpHandler>, Arc<FakeExecutor>) {
        let (h, exec) = handler();
        h.open("c1");
        let response = request(&h, "c1", 0, "initialize", json!({"protocolVersion": "2025-03-26"})).await;
        assert!(response.get("result").is_some(), "{}", response);
        (h, exec)
    }

    async fn wait_for_in_flight(h: &McpHandler, conn: &str, n: usize) {
        for _ in 0..200 {
            if h.in_flight(conn) == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("in-flight count never reached {}", n);
    }

    #[tokio::test]
    async fn test_initialize_negotiates_version() {
        let (h, _) = handler();
        h.open("c1");
        assert_eq!(h.state("c1"), SessionState::Uninitialized);

        let response = request(
            &h,
            "c1",
            1,
            "initialize",
            json!({"protocolVersion": "2024-11-05", "clientInfo": {"name": "agent", "version": "2"}}),
        )
        .await;
        assert_eq!(response["result"]["protocolVersion"], "2024-11-05");
        assert_eq!(response["result"]["capabilities"]["tools"]["listChanged"], false);
        assert_eq!(response["result"]["serverInfo"]["name"], "toolrelay");
        assert_eq!(h.state("c1"), SessionState::Ready);
        assert_eq!(h.client_info("c1").unwrap().name, "agent");

        let (h, _) = handler();
        let response = request(&h, "c2", 1, "initialize", json!({"protocolVersion": "1999-01-01"})).await;
        assert_eq!(response["result"]["protocolVersion"], LATEST_PROTOCOL_VERSION);
        assert_eq!(h.protocol_version("c2").as_deref(), Some(LATEST_PROTOCOL_VERSION));
    }

    #[tokio::test]
    async fn test_methods_before_initialize_are_recoverable() {
        let (h, _) = handler();
        h.open("c1");

        let response = request(&h, "c1", 1, "tools/list", json!({})).await;
        assert_eq!(response["error"]["data"]["kind"], "protocol_order");
        assert_eq!(response["id"], 1);

        let response = request(&h, "c1", 2, "ping", json!({})).await;
        assert_eq!(response["error"]["data"]["kind"], "protocol_order");

        let response = request(&h, "c1", 3, "initialize", json!({})).await;
        assert!(response.get("result").is_some());
        let response = request(&h, "c1", 4, "tools/list", json!({})).await;
        assert_eq!(response["result"]["tools"][0]["name"], "echo");
    }

    #[tokio::test]
    async fn test_unknown_method_in_any_state() {
        let (h, _) = handler();
        h.open("c1");
        let response = request(&h, "c1", 1, "resources/list", json!({})).await;
        assert_eq!(response["error"]["code"], METHOD_NOT_FOUND);
        assert_eq!(response["error"]["data"]["kind"], "unknown_method");
        assert_eq!(h.state("c1"), SessionState::Uninitialized);

        let (h, _) = initialized().await;
        let response = request(&h, "c1", 1, "resources/list", json!({})).await;
        assert_eq!(response["error"]["data"]["kind"], "unknown_method");
        assert_eq!(h.state("c1"), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_second_initialize_rejected() {
        let (h, _) = initialized().await;
        let response = request(&h, "c1", 9, "initialize", json!({})).await;
        assert_eq!(response["error"]["data"]["kind"], "protocol_order");
        assert_eq!(h.state("c1"), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_tools_list_is_stable() {
        let (h, _) = initialized().await;
        let first = request(&h, "c1", 1, "tools/list", json!({})).await;
        let names: Vec<_> = first["result"]["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["echo", "slow"]);
        assert_eq!(first["result"]["tools"][0]["inputSchema"]["required"], json!(["msg"]));

        for id in 2..6 {
            let again = request(&h, "c1", id, "tools/list", Value::Null).await;
            assert_eq!(
                serde_json::to_string(&again["result"]).unwrap(),
                serde_json::to_string(&first["result"]).unwrap()
            );
        }
    }

    #[tokio::test]
    async fn test_call_tool() {
        let (h, exec) = initialized().await;
        let response = request(
            &h,
            "c1",
            5,
            "tools/call",
            json!({"name": "echo", "arguments": {"msg": "hi"}}),
        )
        .await;
        assert_eq!(response["id"], 5);
        assert_eq!(response["result"]["isError"], false);
        assert_eq!(response["result"]["content"][0]["text"], "hi\n");
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.in_flight("c1"), 0);
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_skip_executor() {
        let (h, exec) = initialized().await;

        let response = request(&h, "c1", 1, "tools/call", json!({"name": "missing", "arguments": {}})).await;
        assert_eq!(response["error"]["data"]["kind"], "not_found");

        let response = request(&h, "c1", 2, "tools/call", json!({"name": "echo", "arguments": {}})).await;
        assert_eq!(response["error"]["data"]["kind"], "validation");
        assert_eq!(response["error"]["code"], INVALID_PARAMS);

        let response = request(&h, "c1", 3, "tools/call", json!({"name": "echo", "arguments": {"msg": 3}})).await;
        assert_eq!(response["error"]["data"]["kind"], "validation");

        let response = request(&h, "c1", 4, "tools/call", json!({"arguments": {}})).await;
        assert_eq!(response["error"]["data"]["kind"], "validation");

        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_notifications_get_no_response() {
        let (h, _) = initialized().await;
        let out = h
            .handle_message("c1", json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(out.is_none());

        let out = h
            .handle_message("c1", json!({"jsonrpc": "2.0", "method": "notifications/whatever"}))
            .await;
        assert!(out.is_none());

        let out = h
            .handle_message("c1", json!({"jsonrpc": "2.0", "id": 7, "result": {}}))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_batch() {
        let (h, _) = initialized().await;
        let out = h
            .handle_message(
                "c1",
                json!([
                    {"jsonrpc": "2.0", "id": 1, "method": "ping"},
                    {"jsonrpc": "2.0", "method": "notifications/initialized"},
                    {"jsonrpc": "2.0", "id": 2, "method": "tools/call", "params": {"name": "echo", "arguments": {"msg": "b"}}}
                ]),
            )
            .await
            .unwrap();
        let items = out.as_array().unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0]["id"], 1);
        assert_eq!(items[0]["result"], json!({}));
        assert_eq!(items[1]["result"]["content"][0]["text"], "b\n");

        let out = h.handle_message("c1", json!([])).await.unwrap();
        assert_eq!(out["error"]["data"]["kind"], "invalid_request");

        let out = h
            .handle_message("c1", json!([{"jsonrpc": "2.0", "method": "notifications/initialized"}]))
            .await;
        assert!(out.is_none());
    }

    #[tokio::test]
    async fn test_malformed_messages() {
        let (h, _) = initialized().await;

        let out = h.handle_text("c1", "{\"jsonrpc\": \"2.0\", ").await.unwrap();
        assert_eq!(out["error"]["code"], PARSE_ERROR);
        assert_eq!(out["id"], Value::Null);

        let out = h.handle_text("c1", "{\"jsonrpc\": \"1.0\", \"id\": 4, \"method\": \"ping\"}").await.unwrap();
        assert_eq!(out["error"]["data"]["kind"], "invalid_request");
        assert_eq!(out["id"], 4);

        let out = h.handle_message("c1", json!({"jsonrpc": "2.0", "id": 5})).await.unwrap();
        assert_eq!(out["error"]["data"]["kind"], "invalid_request");

        // still usable
        let out = h.handle_text("c1", "{\"jsonrpc\": \"2.0\", \"id\": 6, \"method\": \"ping\"}").await.unwrap();
        assert_eq!(out["result"], json!({}));
    }

    #[tokio::test]
    async fn test_cancel_notification() {
        let (h, _) = initialized().await;
        let call = tokio::spawn({
            let h = h.clone();
            async move { request(&h, "c1", 11, "tools/call", json!({"name": "slow"})).await }
        });

        wait_for_in_flight(&h, "c1", 1).await;
        assert_eq!(h.state("c1"), SessionState::Executing);

        let out = h
            .handle_message(
                "c1",
                json!({"jsonrpc": "2.0", "method": "notifications/cancelled", "params": {"requestId": 11}}),
            )
            .await;
        assert!(out.is_none());

        let response = tokio::time::timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
        assert_eq!(response["error"]["data"]["kind"], "cancelled");
        assert_eq!(h.in_flight("c1"), 0);
        assert_eq!(h.state("c1"), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_close_fails_pending_calls() {
        let (h, _) = initialized().await;
        let calls: Vec<_> = (0..3)
            .map(|id| {
                let h = h.clone();
                tokio::spawn(async move { request(&h, "c1", id + 100, "tools/call", json!({"name": "slow"})).await })
            })
            .collect();

        wait_for_in_flight(&h, "c1", 3).await;
        h.close("c1");
        assert_eq!(h.state("c1"), SessionState::Closed);

        for call in calls {
            let response = tokio::time::timeout(Duration::from_secs(2), call).await.unwrap().unwrap();
            assert_eq!(response["error"]["data"]["kind"], "connection_closed");
        }
    }

    #[tokio::test]
    async fn test_closed_connection_is_not_revived() {
        let (h, exec) = initialized().await;
        h.close("c1");

        let response = request(&h, "c1", 1, "tools/call", json!({"name": "echo", "arguments": {"msg": "x"}})).await;
        assert_eq!(response["error"]["data"]["kind"], "connection_closed");
        let response = request(&h, "c1", 2, "tools/list", json!({})).await;
        assert_eq!(response["error"]["data"]["kind"], "connection_closed");
        let out = h
            .handle_message("c1", json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(out.is_none());

        assert_eq!(h.state("c1"), SessionState::Closed);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);

        // a fresh initialize starts over
        let response = request(&h, "c1", 3, "initialize", json!({})).await;
        assert!(response.get("result").is_some());
        assert_eq!(h.state("c1"), SessionState::Ready);
    }

    #[tokio::test]
    async fn test_duplicate_request_id() {
        let (h, _) = initialized().await;
        let first = tokio::spawn({
            let h = h.clone();
            async move { request(&h, "c1", 1, "tools/call", json!({"name": "slow"})).await }
        });
        wait_for_in_flight(&h, "c1", 1).await;

        let response = request(&h, "c1", 1, "tools/call", json!({"name": "echo", "arguments": {"msg": "x"}})).await;
        assert_eq!(response["error"]["data"]["kind"], "duplicate_request");
        assert_eq!(h.in_flight("c1"), 1);

        // same id on another connection is independent
        request(&h, "c2", 0, "initialize", json!({})).await;
        let response = request(&h, "c2", 1, "tools/call", json!({"name": "echo", "arguments": {"msg": "x"}})).await;
        assert_eq!(response["result"]["content"][0]["text"], "x\n");

        h.close("c1");
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_replace_catalog() {
        let (h, _) = initialized().await;
        let replacement = Catalog::from_toml_str(
            r#"
[[tools]]
name = "date"
[tools.shell]
argv = ["date"]
"#,
        )
        .unwrap();
        h.replace_catalog(Arc::new(replacement));

        let response = request(&h, "c1", 1, "tools/list", json!({})).await;
        assert_eq!(response["result"]["tools"].as_array().unwrap().len(), 1);
        assert_eq!(h.catalog().len(), 1);
        let response = request(&h, "c1", 2, "tools/call", json!({"name": "echo", "arguments": {"msg": "x"}})).await;
        assert_eq!(response["error"]["data"]["kind"], "not_found");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_echo_through_real_executor() {
        let catalog = Arc::new(Catalog::from_toml_str(CATALOG).unwrap());
        let h = McpHandler::new(catalog, Arc::new(toolrelay_core::ToolExecutor::new()));
        request(&h, "c1", 0, "initialize", json!({})).await;

        let response = request(
            &h,
            "c1",
            1,
            "tools/call",
            json!({"name": "echo", "arguments": {"msg": "hi"}}),
        )
        .await;
        assert_eq!(response["result"]["content"][0]["text"], "hi\n");
        assert_eq!(response["result"]["isError"], false);
    }
}
