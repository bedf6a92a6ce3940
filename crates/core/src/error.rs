// Error taxonomy shared by the catalog, executor, protocol handler and relay

use serde::{Deserialize, Serialize};
use std::fmt;

/// Machine-readable error kind carried through every MCP error surface.
///
/// The string form is what agents see in `error.data.kind` and in
/// `_meta.errorKind`, so variants must never be renamed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    ParseError,
    InvalidRequest,
    ProtocolOrder,
    UnknownMethod,
    NotFound,
    Validation,
    DuplicateRequest,
    Timeout,
    NonzeroExit,
    Signal,
    SpawnFailed,
    RenderError,
    HttpError,
    HttpStatus,
    JsonExtract,
    Cancelled,
    ConnectionClosed,
    Unavailable,
    Unauthorized,
    Busy,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::ParseError => "parse_error",
            Self::InvalidRequest => "invalid_request",
            Self::ProtocolOrder => "protocol_order",
            Self::UnknownMethod => "unknown_method",
            Self::NotFound => "not_found",
            Self::Validation => "validation",
            Self::DuplicateRequest => "duplicate_request",
            Self::Timeout => "timeout",
            Self::NonzeroExit => "nonzero_exit",
            Self::Signal => "signal",
            Self::SpawnFailed => "spawn_failed",
            Self::RenderError => "render_error",
            Self::HttpError => "http_error",
            Self::HttpStatus => "http_status",
            Self::JsonExtract => "json_extract",
            Self::Cancelled => "cancelled",
            Self::ConnectionClosed => "connection_closed",
            Self::Unavailable => "unavailable",
            Self::Unauthorized => "unauthorized",
            Self::Busy => "busy",
        }
    }

    /// Whether a caller may reasonably retry the same request unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::ConnectionClosed | Self::Unavailable | Self::Busy
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Catalog load failure. Fatal: the process must not start serving.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read catalog {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse catalog: {0}")]
    Parse(String),

    #[error("tool name must not be empty")]
    EmptyName,

    #[error("duplicate tool name: {0}")]
    DuplicateTool(String),

    #[error("tool '{tool}': duplicate parameter '{param}'")]
    DuplicateParameter { tool: String, param: String },

    #[error("tool '{tool}': required parameter '{param}' has no type")]
    MissingType { tool: String, param: String },

    #[error("tool '{tool}': template references undeclared parameter '{param}'")]
    UndeclaredParameter { tool: String, param: String },

    #[error("tool '{tool}': {message}")]
    InvalidTemplate { tool: String, message: String },

    #[error("tool '{0}' must declare exactly one of [shell] or [http]")]
    ExecutionVariant(String),

    #[error("tool '{tool}': {message}")]
    Invalid { tool: String, message: String },
}

/// Failure to render a template against concrete parameters.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TemplateError {
    #[error("unterminated placeholder starting at byte {0}")]
    Unterminated(usize),

    #[error("empty placeholder at byte {0}")]
    EmptyPlaceholder(usize),

    #[error("missing value for parameter '{0}'")]
    MissingParameter(String),

    #[error("environment variable '{0}' is not set")]
    UndefinedEnv(String),
}

/// Tool arguments rejected before any execution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("arguments must be a JSON object")]
    NotAnObject,

    #[error("missing required parameter '{0}'")]
    MissingRequired(String),

    #[error("parameter '{name}' must be of type {expected}")]
    WrongType { name: String, expected: String },

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),
}
