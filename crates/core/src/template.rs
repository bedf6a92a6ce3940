// Template rendering for tool execution specs
//
// `{{name}}` substitutes a tool parameter, `${NAME}` expands an environment
// variable at render time, and `$$` is a literal dollar sign. Substitution
// is purely textual: nothing is quoted or escaped.

use crate::error::TemplateError;
use std::collections::{BTreeMap, HashMap};

/// Source of environment variables for `${NAME}` placeholders
pub trait Environment: Send + Sync {
    fn var(&self, name: &str) -> Option<String>;
}

/// The live process environment, read on every lookup
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessEnv;

impl Environment for ProcessEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

impl Environment for HashMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

impl Environment for BTreeMap<String, String> {
    fn var(&self, name: &str) -> Option<String> {
        self.get(name).cloned()
    }
}

/// Per-tool overrides layered over a base environment
pub struct Overlay<'a> {
    pub overrides: &'a BTreeMap<String, String>,
    pub base: &'a dyn Environment,
}

impl Environment for Overlay<'_> {
    fn var(&self, name: &str) -> Option<String> {
        self.overrides
            .get(name)
            .cloned()
            .or_else(|| self.base.var(name))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment<'a> {
    Literal(&'a str),
    Param(&'a str),
    Env(&'a str),
}

/// A placeholder reference found in a template
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum Placeholder {
    Param(String),
    Env(String),
}

/// Template engine for `{{param}}` / `${ENV}` substitution
pub struct TemplateEngine;

impl TemplateEngine {
    /// Render a template against parameters and an environment
    ///
    /// Every `{{name}}` must be present in `params`; absent optional
    /// parameters are expected to be passed as `null`, which renders empty.
    pub fn render(
        template: &str,
        params: &serde_json::Map<String, serde_json::Value>,
        env: &dyn Environment,
    ) -> Result<String, TemplateError> {
        let mut output = String::with_capacity(template.len());

        for segment in Self::parse(template)? {
            match segment {
                Segment::Literal(text) => output.push_str(text),
                Segment::Param(name) => {
                    let value = params
                        .get(name)
                        .ok_or_else(|| TemplateError::MissingParameter(name.to_string()))?;
                    output.push_str(&Self::render_value(value));
                }
                Segment::Env(name) => {
                    let value = env
                        .var(name)
                        .ok_or_else(|| TemplateError::UndefinedEnv(name.to_string()))?;
                    output.push_str(&value);
                }
            }
        }

        Ok(output)
    }

    /// Textual form of a parameter value
    pub fn render_value(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::Null => String::new(),
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    /// Extract placeholder references from a template
    pub fn extract_placeholders(template: &str) -> Result<Vec<Placeholder>, TemplateError> {
        let mut placeholders: Vec<Placeholder> = Self::parse(template)?
            .into_iter()
            .filter_map(|segment| match segment {
                Segment::Literal(_) => None,
                Segment::Param(name) => Some(Placeholder::Param(name.to_string())),
                Segment::Env(name) => Some(Placeholder::Env(name.to_string())),
            })
            .collect();

        placeholders.sort();
        placeholders.dedup();
        Ok(placeholders)
    }

    /// Parameter names referenced by a template
    pub fn extract_parameters(template: &str) -> Result<Vec<String>, TemplateError> {
        Ok(Self::extract_placeholders(template)?
            .into_iter()
            .filter_map(|p| match p {
                Placeholder::Param(name) => Some(name),
                Placeholder::Env(_) => None,
            })
            .collect())
    }

    fn parse(template: &str) -> Result<Vec<Segment<'_>>, TemplateError> {
        let mut segments = Vec::new();
        let mut literal_start = 0;
        let mut i = 0;

        while i < template.len() {
            let rest = &template[i..];

            let (segment, consumed) = if rest.starts_with("{{") {
                let end = rest[2..].find("}}").ok_or(TemplateError::Unterminated(i))?;
                let name = rest[2..2 + end].trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder(i));
                }
                (Segment::Param(name), end + 4)
            } else if rest.starts_with("$$") {
                (Segment::Literal(&template[i..i + 1]), 2)
            } else if rest.starts_with("${") {
                let end = rest[2..].find('}').ok_or(TemplateError::Unterminated(i))?;
                let name = rest[2..2 + end].trim();
                if name.is_empty() {
                    return Err(TemplateError::EmptyPlaceholder(i));
                }
                (Segment::Env(name), end + 3)
            } else {
                // advance one full char to stay on a UTF-8 boundary
                i += rest.chars().next().map(char::len_utf8).unwrap_or(1);
                continue;
            };

            if literal_start < i {
                segments.push(Segment::Literal(&template[literal_start..i]));
            }
            segments.push(segment);
            i += consumed;
            literal_start = i;
        }

        if literal_start < template.len() {
            segments.push(Segment::Literal(&template[literal_start..]));
        }

        Ok(segments)
    }
}
