// Tool catalog: loading, validation, and ordered lookup

use crate::error::ConfigError;
use crate::template::TemplateEngine;
use crate::types::{
    CommandSpec, Execution, HttpExecution, ParamType, ParameterSpec, ShellExecution,
    ToolDefinition, ToolSummary,
};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Timeout applied when neither the tool nor the catalog sets one
pub const DEFAULT_TIMEOUT_SECS: f64 = 30.0;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    #[serde(default)]
    default_timeout_secs: Option<f64>,
    #[serde(default)]
    tools: Vec<ToolConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ToolConfig {
    name: String,
    #[serde(default)]
    description: String,
    #[serde(default)]
    parameters: Vec<ParameterConfig>,
    #[serde(default)]
    shell: Option<ShellConfig>,
    #[serde(default)]
    http: Option<HttpConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ParameterConfig {
    name: String,
    #[serde(rename = "type", default)]
    param_type: Option<ParamType>,
    #[serde(default)]
    required: bool,
    #[serde(default)]
    default: Option<serde_json::Value>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ShellConfig {
    #[serde(default, alias = "command_template")]
    command: Option<String>,
    #[serde(default)]
    argv: Option<Vec<String>>,
    #[serde(default)]
    working_dir: Option<String>,
    #[serde(default)]
    timeout_secs: Option<f64>,
    #[serde(default)]
    env: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct HttpConfig {
    #[serde(default = "default_method")]
    method: String,
    url: String,
    #[serde(default)]
    headers: BTreeMap<String, String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    timeout_secs: Option<f64>,
    #[serde(default)]
    json_extract_path: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Ordered, name-keyed collection of tools. Immutable once built.
#[derive(Debug, Clone)]
pub struct Catalog {
    tools: Vec<Arc<ToolDefinition>>,
    index: HashMap<String, usize>,
    summaries: Vec<ToolSummary>,
}

impl Catalog {
    /// Build a catalog from already-typed definitions, validating them
    pub fn from_tools(tools: Vec<ToolDefinition>) -> Result<Self, ConfigError> {
        let mut index = HashMap::new();
        let mut summaries = Vec::with_capacity(tools.len());
        let mut stored = Vec::with_capacity(tools.len());

        for tool in tools {
            validate_tool(&tool)?;

            if index.insert(tool.name.clone(), stored.len()).is_some() {
                return Err(ConfigError::DuplicateTool(tool.name));
            }

            summaries.push(ToolSummary {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema: tool.input_schema(),
            });
            stored.push(Arc::new(tool));
        }

        Ok(Self {
            tools: stored,
            index,
            summaries,
        })
    }

    /// Load a catalog file; `.json` is parsed as JSON, anything else as TOML
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let catalog = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&content)?,
            _ => Self::from_toml_str(&content)?,
        };

        tracing::info!(
            path = %path.display(),
            tools = catalog.len(),
            "Loaded tool catalog"
        );
        Ok(catalog)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile =
            toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    pub fn from_json_str(content: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile =
            serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_file(file)
    }

    fn from_file(file: CatalogFile) -> Result<Self, ConfigError> {
        let default_timeout = file.default_timeout_secs.unwrap_or(DEFAULT_TIMEOUT_SECS);
        let default_timeout = to_duration("catalog", default_timeout)?;

        let tools = file
            .tools
            .into_iter()
            .map(|tool| convert_tool(tool, default_timeout))
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_tools(tools)
    }

    /// Find a tool by name
    pub fn lookup(&self, name: &str) -> Option<&Arc<ToolDefinition>> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    /// Tool summaries in declaration order
    pub fn list(&self) -> &[ToolSummary] {
        &self.summaries
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ToolDefinition>> {
        self.tools.iter()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

fn to_duration(owner: &str, secs: f64) -> Result<Duration, ConfigError> {
    if !secs.is_finite() || secs <= 0.0 {
        return Err(ConfigError::Invalid {
            tool: owner.to_string(),
            message: format!("timeout_secs must be a positive number, got {}", secs),
        });
    }
    Ok(Duration::from_secs_f64(secs))
}

fn convert_tool(config: ToolConfig, default_timeout: Duration) -> Result<ToolDefinition, ConfigError> {
    let name = config.name;

    let mut parameters = Vec::with_capacity(config.parameters.len());
    for param in config.parameters {
        let param_type = match (param.param_type, param.required) {
            (Some(t), _) => t,
            (None, true) => {
                return Err(ConfigError::MissingType {
                    tool: name.clone(),
                    param: param.name,
                })
            }
            (None, false) => ParamType::String,
        };
        parameters.push(ParameterSpec {
            name: param.name,
            param_type,
            required: param.required,
            default: param.default,
            description: param.description,
        });
    }

    let execution = match (config.shell, config.http) {
        (Some(shell), None) => {
            let command = match (shell.command, shell.argv) {
                (Some(command), None) => CommandSpec::Shell(command),
                (None, Some(argv)) => CommandSpec::Argv(argv),
                _ => {
                    return Err(ConfigError::Invalid {
                        tool: name,
                        message: "[shell] needs exactly one of `command` or `argv`".to_string(),
                    })
                }
            };
            let timeout = match shell.timeout_secs {
                Some(secs) => to_duration(&name, secs)?,
                None => default_timeout,
            };
            Execution::Shell(ShellExecution {
                command,
                working_dir: shell.working_dir,
                timeout,
                env: shell.env,
            })
        }
        (None, Some(http)) => {
            let timeout = match http.timeout_secs {
                Some(secs) => to_duration(&name, secs)?,
                None => default_timeout,
            };
            Execution::Http(HttpExecution {
                method: http.method.to_ascii_uppercase(),
                url: http.url,
                headers: http.headers,
                body: http.body,
                timeout,
                json_extract_path: http.json_extract_path,
            })
        }
        _ => return Err(ConfigError::ExecutionVariant(name)),
    };

    Ok(ToolDefinition {
        name,
        description: config.description,
        parameters,
        execution,
    })
}

fn validate_tool(tool: &ToolDefinition) -> Result<(), ConfigError> {
    if tool.name.trim().is_empty() {
        return Err(ConfigError::EmptyName);
    }

    let mut declared = HashSet::new();
    for param in &tool.parameters {
        if !declared.insert(param.name.as_str()) {
            return Err(ConfigError::DuplicateParameter {
                tool: tool.name.clone(),
                param: param.name.clone(),
            });
        }
        if let Some(default) = &param.default {
            if !param.param_type.matches(default) {
                return Err(ConfigError::Invalid {
                    tool: tool.name.clone(),
                    message: format!(
                        "default for '{}' is not of type {}",
                        param.name, param.param_type
                    ),
                });
            }
        }
    }

    for template in tool.execution.templates() {
        let referenced = TemplateEngine::extract_parameters(template).map_err(|e| {
            ConfigError::InvalidTemplate {
                tool: tool.name.clone(),
                message: format!("invalid template '{}': {}", template, e),
            }
        })?;
        if let Some(param) = referenced.into_iter().find(|p| !declared.contains(p.as_str())) {
            return Err(ConfigError::UndeclaredParameter {
                tool: tool.name.clone(),
                param,
            });
        }
    }

    match &tool.execution {
        Execution::Shell(shell) => {
            if let CommandSpec::Argv(argv) = &shell.command {
                if argv.is_empty() {
                    return Err(ConfigError::Invalid {
                        tool: tool.name.clone(),
                        message: "argv must not be empty".to_string(),
                    });
                }
            }
        }
        Execution::Http(http) => {
            if reqwest::Method::from_bytes(http.method.as_bytes()).is_err() {
                return Err(ConfigError::Invalid {
                    tool: tool.name.clone(),
                    message: format!("invalid HTTP method '{}'", http.method),
                });
            }
        }
    }

    Ok(())
}
