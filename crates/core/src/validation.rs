// Argument validation against declared tool parameters

use crate::error::ValidationError;
use crate::types::ToolDefinition;
use serde_json::{Map, Value};

impl ToolDefinition {
    /// Check arguments and build the effective parameter map
    ///
    /// Absent or `null` arguments count as `{}`. Defaults fill absent
    /// parameters; absent optionals without a default become `null` so every
    /// declared parameter is present when templates are rendered.
    pub fn validate_arguments(&self, arguments: &Value) -> Result<Map<String, Value>, ValidationError> {
        let supplied = match arguments {
            Value::Null => Map::new(),
            Value::Object(map) => map.clone(),
            _ => return Err(ValidationError::NotAnObject),
        };

        if let Some(unknown) = supplied.keys().find(|k| self.parameter(k).is_none()) {
            return Err(ValidationError::UnknownParameter(unknown.clone()));
        }

        let mut effective = Map::with_capacity(self.parameters.len());
        for param in &self.parameters {
            match supplied.get(&param.name).filter(|v| !v.is_null()) {
                Some(value) => {
                    if !param.param_type.matches(value) {
                        return Err(ValidationError::WrongType {
                            name: param.name.clone(),
                            expected: param.param_type.to_string(),
                        });
                    }
                    effective.insert(param.name.clone(), value.clone());
                }
                None => match &param.default {
                    Some(default) => {
                        effective.insert(param.name.clone(), default.clone());
                    }
                    None if param.required => {
                        return Err(ValidationError::MissingRequired(param.name.clone()));
                    }
                    None => {
                        effective.insert(param.name.clone(), Value::Null);
                    }
                },
            }
        }

        Ok(effective)
    }
}
