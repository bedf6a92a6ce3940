use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use toolrelay_core::ErrorKind;
use toolrelay_mcp::protocol::{JsonRpcError, JsonRpcResponse};

/// Failures surfaced to agents by the relay itself
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    #[error("no relay client is connected for '{0}'")]
    Unavailable(String),

    #[error("missing or invalid access token")]
    Unauthorized,

    #[error("relay client did not answer within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("too many requests in flight for this tenant")]
    Busy,

    #[error("relay client disconnected before answering")]
    ConnectionClosed,

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),
}

impl RelayError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unavailable(_) => ErrorKind::Unavailable,
            Self::Unauthorized => ErrorKind::Unauthorized,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Busy => ErrorKind::Busy,
            Self::ConnectionClosed => ErrorKind::ConnectionClosed,
            Self::UnknownSession(_) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::BadRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unavailable(_) | Self::ConnectionClosed => StatusCode::BAD_GATEWAY,
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Self::Busy => StatusCode::TOO_MANY_REQUESTS,
            Self::UnknownSession(_) | Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// JSON-RPC error responses for every request in `message`; `None` for notifications
    pub fn to_jsonrpc(&self, message: &Value) -> Option<Value> {
        let error_for = |id: &Value| {
            JsonRpcResponse::error(id.clone(), JsonRpcError::from_kind(self.kind(), self.to_string()))
                .into_value()
        };

        match message {
            Value::Array(items) => {
                let errors: Vec<Value> = items
                    .iter()
                    .filter_map(|item| item.get("id").filter(|id| !id.is_null()))
                    .map(error_for)
                    .collect();
                (!errors.is_empty()).then_some(Value::Array(errors))
            }
            message => message
                .get("id")
                .filter(|id| !id.is_null())
                .map(error_for),
        }
    }
}

/// API error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.kind().as_str().to_string(),
            details: Some(self.to_string()),
        };
        (self.status(), Json(body)).into_response()
    }
}
