// Core types for declared tools and their execution results

use crate::error::ErrorKind;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Parameter type accepted by a tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamType {
    String,
    Integer,
    Boolean,
    Object,
    Array,
}

impl ParamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Integer => "integer",
            Self::Boolean => "boolean",
            Self::Object => "object",
            Self::Array => "array",
        }
    }

    /// Check whether a JSON value inhabits this type
    pub fn matches(&self, value: &serde_json::Value) -> bool {
        match self {
            Self::String => value.is_string(),
            Self::Integer => value.is_i64() || value.is_u64(),
            Self::Boolean => value.is_boolean(),
            Self::Object => value.is_object(),
            Self::Array => value.is_array(),
        }
    }
}

impl fmt::Display for ParamType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared tool parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// How a shell tool's command is handed to the OS
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandSpec {
    /// Rendered string passed to `sh -c`. Parameter values are not escaped.
    Shell(String),
    /// Program plus arguments, each rendered separately, no shell involved.
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::Shell(command) => vec![command.as_str()],
            Self::Argv(argv) => argv.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellExecution {
    pub command: CommandSpec,
    pub working_dir: Option<String>,
    pub timeout: Duration,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpExecution {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub body: Option<String>,
    pub timeout: Duration,
    pub json_extract_path: Option<String>,
}

/// Exactly one execution variant per tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    Shell(ShellExecution),
    Http(HttpExecution),
}

impl Execution {
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Shell(shell) => shell.timeout,
            Self::Http(http) => http.timeout,
        }
    }

    /// Every template string in this execution spec
    pub fn templates(&self) -> Vec<&str> {
        match self {
            Self::Shell(shell) => {
                let mut templates = shell.command.templates();
                if let Some(dir) = &shell.working_dir {
                    templates.push(dir.as_str());
                }
                templates
            }
            Self::Http(http) => {
                let mut templates = vec![http.url.as_str()];
                templates.extend(http.headers.values().map(String::as_str));
                if let Some(body) = &http.body {
                    templates.push(body.as_str());
                }
                templates
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Shell(_) => "shell",
            Self::Http(_) => "http",
        }
    }
}

/// A tool as loaded from the catalog
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: Vec<ParameterSpec>,
    pub execution: Execution,
}

impl ToolDefinition {
    pub fn parameter(&self, name: &str) -> Option<&ParameterSpec> {
        self.parameters.iter().find(|p| p.name == name)
    }

    /// JSON Schema describing the tool's arguments
    pub fn input_schema(&self) -> serde_json::Value {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();

        for param in &self.parameters {
            let mut property = serde_json::Map::new();
            property.insert("type".to_string(), param.param_type.as_str().into());
            if let Some(description) = &param.description {
                property.insert("description".to_string(), description.clone().into());
            }
            if let Some(default) = &param.default {
                property.insert("default".to_string(), default.clone());
            }
            properties.insert(param.name.clone(), serde_json::Value::Object(property));

            if param.required {
                required.push(serde_json::Value::String(param.name.clone()));
            }
        }

        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required
        })
    }
}

/// What `tools/list` exposes for one tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSummary {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: serde_json::Value,
}

/// Output payload of one execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ToolOutput {
    Text(String),
    Structured(serde_json::Value),
}

impl ToolOutput {
    /// Textual rendering for MCP text content
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Structured(value) => {
                serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
            }
        }
    }
}

impl Default for ToolOutput {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

/// Result of a single tool invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub success: bool,
    pub output: ToolOutput,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn ok(output: ToolOutput, duration: Duration) -> Self {
        Self {
            success: true,
            output,
            error_kind: None,
            exit_code: None,
            status: None,
            message: None,
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn failed(
        kind: ErrorKind,
        message: impl Into<String>,
        output: ToolOutput,
        duration: Duration,
    ) -> Self {
        Self {
            success: false,
            output,
            error_kind: Some(kind),
            exit_code: None,
            status: None,
            message: Some(message.into()),
            duration_ms: duration.as_millis() as u64,
        }
    }

    pub fn with_exit_code(mut self, code: Option<i32>) -> Self {
        self.exit_code = code;
        self
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }
}
