// Agent-facing endpoints on `<subdomain>.<base_domain>`

use super::ApiResult;
use crate::config::AppState;
use crate::error::RelayError;
use crate::middleware::auth::presented_token;
use crate::tenant::{AgentStream, TenantHandle};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode, Uri},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use toolrelay_core::tunnel::StreamId;
use toolrelay_mcp::protocol::{JsonRpcError, JsonRpcResponse};
use toolrelay_mcp::{Assembled, MessageAssembler};

/// Session header for request/response MCP over `POST /mcp`
pub const SESSION_HEADER: &str = "mcp-session-id";

/// Resolve the tenant named by the request's host
pub fn resolve_tenant(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
) -> ApiResult<Arc<TenantHandle>> {
    let host = headers
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| uri.authority().map(|a| a.as_str()))
        .ok_or_else(|| RelayError::BadRequest("missing Host header".to_string()))?;

    let subdomain = state
        .config
        .tenant_from_host(host)
        .ok_or_else(|| RelayError::NotFound(format!("no tenant at host '{}'", host)))?;

    state
        .routes
        .resolve(&subdomain)
        .filter(|tenant| !tenant.is_closed())
        .ok_or(RelayError::Unavailable(subdomain))
}

/// Resolve the tenant and check the agent's access token
pub fn authorized_tenant(
    state: &AppState,
    headers: &HeaderMap,
    uri: &Uri,
) -> ApiResult<Arc<TenantHandle>> {
    let tenant = resolve_tenant(state, headers, uri)?;
    let token = presented_token(headers, uri);
    if tenant.authorize(token.as_deref()) {
        Ok(tenant)
    } else {
        tracing::warn!(subdomain = %tenant.subdomain, "Rejected agent request without a valid token");
        Err(RelayError::Unauthorized)
    }
}

fn parse_body(body: &str) -> Result<Value, Response> {
    match MessageAssembler::parse_complete(body) {
        Assembled::Message(message) => Ok(message),
        Assembled::Malformed(detail) => {
            let error = JsonRpcResponse::error(Value::Null, JsonRpcError::parse_error(detail));
            Err((StatusCode::BAD_REQUEST, Json(error.into_value())).into_response())
        }
    }
}

fn is_initialize(message: &Value) -> bool {
    match message {
        Value::Array(items) => items.iter().any(is_initialize),
        message => message.get("method").and_then(Value::as_str) == Some("initialize"),
    }
}

/// Forward in the background and push the answer to the agent stream
fn spawn_forward(tenant: Arc<TenantHandle>, stream_id: StreamId, message: Value, deadline: Duration) {
    tokio::spawn(async move {
        let reply = match tenant.forward(&stream_id, message.clone(), deadline).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::debug!(subdomain = %tenant.subdomain, error = %e, "Forwarding failed");
                e.to_jsonrpc(&message)
            }
        };
        if let Some(reply) = reply {
            tenant.push(&stream_id, reply);
        }
    });
}

/// `GET /sse`: event stream; the first event names the POST endpoint
pub async fn sse(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let tenant = authorized_tenant(&state, &headers, &uri)?;
    let mut stream = tenant.open_stream()?;
    let endpoint = format!("/message?session_id={}", stream.id);

    tracing::info!(subdomain = %tenant.subdomain, stream_id = %stream.id, "SSE stream opened");

    let events = async_stream::stream! {
        yield Ok::<_, Infallible>(Event::default().event("endpoint").data(endpoint));
        while let Some(message) = stream.recv().await {
            yield Ok(Event::default().event("message").data(message.to_string()));
        }
    };

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Deserialize)]
pub struct SessionQuery {
    pub session_id: String,
}

/// `POST /message?session_id=`: accept a message for an SSE stream
///
/// The session id was handed out to an authorized stream and acts as its
/// credential here.
pub async fn message(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> ApiResult<Response> {
    let tenant = resolve_tenant(&state, &headers, &uri)?;
    if !tenant.has_stream(&query.session_id) {
        return Err(RelayError::UnknownSession(query.session_id));
    }

    let message = match parse_body(&body) {
        Ok(message) => message,
        Err(response) => return Ok(response),
    };
    if tenant.is_busy() {
        return Err(RelayError::Busy);
    }

    spawn_forward(tenant, query.session_id, message, state.config.request_timeout());
    Ok(StatusCode::ACCEPTED.into_response())
}

/// `POST /mcp`: one request, one response
///
/// `initialize` without a session header starts a session whose id comes
/// back in `Mcp-Session-Id`; other headerless messages run on a throwaway
/// session. Sessions left unused expire.
pub async fn mcp_post(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
    body: String,
) -> ApiResult<Response> {
    let tenant = authorized_tenant(&state, &headers, &uri)?;
    let message = match parse_body(&body) {
        Ok(message) => message,
        Err(response) => return Ok(response),
    };

    let requested = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok());
    let session = match requested {
        Some(id) if tenant.touch(id) => None,
        Some(id) => return Err(RelayError::UnknownSession(id.to_string())),
        None => Some(tenant.open_session()?),
    };
    let stream_id = match &session {
        Some(session) => session.id.clone(),
        None => requested.unwrap_or_default().to_string(),
    };
    let initialize = is_initialize(&message);

    // an abandoned request drops the session guard and cancels the call
    let outcome = tenant
        .forward(&stream_id, message, state.config.request_timeout())
        .await;

    // only a successful initialize keeps a fresh session open
    let session_id = match session {
        Some(session) if initialize && outcome.is_ok() => Some(session.keep()),
        Some(_) => None,
        None => Some(stream_id),
    };

    let mut response = match outcome? {
        Some(reply) => Json(reply).into_response(),
        None => StatusCode::ACCEPTED.into_response(),
    };
    if let Some(id) = session_id {
        if let Ok(value) = HeaderValue::from_str(&id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }
    Ok(response)
}

/// `DELETE /mcp`: end a session started by `initialize`
pub async fn mcp_delete(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<StatusCode> {
    let tenant = authorized_tenant(&state, &headers, &uri)?;
    let id = headers
        .get(SESSION_HEADER)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| RelayError::BadRequest("missing Mcp-Session-Id header".to_string()))?;

    if tenant.close_stream(id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RelayError::UnknownSession(id.to_string()))
    }
}

/// `GET /ws`: full-duplex MCP over one WebSocket
pub async fn ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> ApiResult<Response> {
    let tenant = authorized_tenant(&state, &headers, &uri)?;
    let stream = tenant.open_stream()?;
    let deadline = state.config.request_timeout();

    tracing::info!(subdomain = %tenant.subdomain, stream_id = %stream.id, "Agent WebSocket opened");
    Ok(ws.on_upgrade(move |socket| agent_socket(socket, stream, deadline)))
}

async fn agent_socket(socket: WebSocket, mut stream: AgentStream, deadline: Duration) {
    let (mut sink, mut incoming) = socket.split();
    let tenant = stream.tenant().clone();
    let mut assembler = MessageAssembler::default();

    loop {
        tokio::select! {
            outbound = stream.recv() => {
                let Some(message) = outbound else { break };
                if sink.send(Message::Text(message.to_string().into())).await.is_err() {
                    break;
                }
            }
            inbound = incoming.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    for item in assembler.push(text.as_str()) {
                        match item {
                            Assembled::Message(message) => {
                                spawn_forward(tenant.clone(), stream.id.clone(), message, deadline);
                            }
                            Assembled::Malformed(detail) => {
                                let error = JsonRpcResponse::error(
                                    Value::Null,
                                    JsonRpcError::parse_error(detail),
                                );
                                tenant.push(&stream.id, error.into_value());
                            }
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Agent WebSocket error");
                    break;
                }
            }
        }
    }

    let _ = sink.close().await;
    tracing::info!(subdomain = %tenant.subdomain, stream_id = %stream.id, "Agent WebSocket closed");
}

/// `GET /health`
pub async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "toolrelay-relay",
        "version": env!("CARGO_PKG_VERSION"),
        "tenants": state.routes.len(),
    }))
}
