// Core types and functionality for the toolrelay tool tunnel

pub mod catalog;
pub mod error;
pub mod executor;
pub mod template;
pub mod tunnel;
pub mod types;
mod validation;

pub use catalog::Catalog;
pub use error::{ConfigError, ErrorKind, TemplateError, ValidationError};
pub use executor::{Execute, ExecutorSettings, ToolExecutor};
pub use template::TemplateEngine;
pub use types::*;
