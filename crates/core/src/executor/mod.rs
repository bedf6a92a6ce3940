// Tool executor: runs one invocation to completion within its timeout

mod http;
mod shell;

pub use http::extract_json_path;

use crate::error::{ErrorKind, TemplateError};
use crate::template::{Environment, ProcessEnv};
use crate::types::{Execution, ExecutionResult, ToolDefinition, ToolOutput};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Grace period between SIGTERM and SIGKILL for timed-out processes
pub const DEFAULT_KILL_GRACE: Duration = Duration::from_secs(2);

/// Per-stream cap on captured output
pub const DEFAULT_MAX_OUTPUT_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub kill_grace: Duration,
    pub max_output_bytes: usize,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            kill_grace: DEFAULT_KILL_GRACE,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }
}

/// Shared, read-only state handed to an execution variant
pub struct InvokeContext<'a> {
    pub env: &'a dyn Environment,
    pub http: &'a reqwest::Client,
    pub settings: &'a ExecutorSettings,
}

/// One execution variant's capability: run with concrete parameters
#[async_trait::async_trait]
pub trait Invoke: Send + Sync {
    async fn invoke(&self, params: &Map<String, Value>, ctx: &InvokeContext<'_>) -> ExecutionResult;
}

#[async_trait::async_trait]
impl Invoke for Execution {
    async fn invoke(&self, params: &Map<String, Value>, ctx: &InvokeContext<'_>) -> ExecutionResult {
        match self {
            Self::Shell(shell) => shell.invoke(params, ctx).await,
            Self::Http(http) => http.invoke(params, ctx).await,
        }
    }
}

/// Runs a validated tool call
///
/// Implementations must always return within the tool's timeout plus the
/// kill grace period and never panic on tool failure.
#[async_trait::async_trait]
pub trait Execute: Send + Sync {
    async fn execute(&self, tool: &ToolDefinition, params: Map<String, Value>) -> ExecutionResult;
}

/// Default executor: subprocesses and outbound HTTP
pub struct ToolExecutor {
    http: reqwest::Client,
    env: Arc<dyn Environment>,
    settings: ExecutorSettings,
}

impl ToolExecutor {
    pub fn new() -> Self {
        Self::with_settings(ExecutorSettings::default())
    }

    pub fn with_settings(settings: ExecutorSettings) -> Self {
        let http = reqwest::Client::builder()
            .user_agent(concat!("toolrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();

        Self {
            http,
            env: Arc::new(ProcessEnv),
            settings,
        }
    }

    /// Replace the environment `${NAME}` placeholders resolve against
    pub fn with_env(mut self, env: Arc<dyn Environment>) -> Self {
        self.env = env;
        self
    }
}

impl Default for ToolExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Execute for ToolExecutor {
    async fn execute(&self, tool: &ToolDefinition, params: Map<String, Value>) -> ExecutionResult {
        let ctx = InvokeContext {
            env: self.env.as_ref(),
            http: &self.http,
            settings: &self.settings,
        };

        tracing::debug!(tool = %tool.name, kind = tool.execution.kind(), "Executing tool");
        let result = tool.execution.invoke(&params, &ctx).await;

        if result.success {
            tracing::info!(
                tool = %tool.name,
                duration_ms = result.duration_ms,
                "Tool call succeeded"
            );
        } else {
            tracing::warn!(
                tool = %tool.name,
                duration_ms = result.duration_ms,
                error_kind = ?result.error_kind,
                message = result.message.as_deref().unwrap_or(""),
                "Tool call failed"
            );
        }

        result
    }
}

fn render_failure(err: TemplateError, started: Instant) -> ExecutionResult {
    ExecutionResult::failed(
        ErrorKind::RenderError,
        err.to_string(),
        ToolOutput::default(),
        started.elapsed(),
    )
}

/// Cut text to at most `limit` bytes on a char boundary, marking the cut
fn truncate_output(mut text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut cut = limit;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
    text.push_str("\n[output truncated]");
    text
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncate_output() {
        assert_eq!(truncate_output("short".to_string(), 10), "short");
        assert_eq!(
            truncate_output("abcdef".to_string(), 3),
            "abc\n[output truncated]"
        );
        // 'é' is two bytes; never split it
        assert_eq!(truncate_output("aé".to_string(), 2), "a\n[output truncated]");
    }
}
