//! Error types shared by the sandbox and its backends.
//!
//! Only [`ConfigError`] ever escapes the public API: compile and script
//! failures are folded into a [`RunOutcome`](crate::RunOutcome) as data.

use thiserror::Error;

/// Invalid sandbox configuration, raised at construction time.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("script source too large ({actual} bytes, limit is {max} bytes)")]
    SourceTooLarge { max: usize, actual: usize },

    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("invalid binding name '{0}': must be an identifier")]
    InvalidBindingName(String),

    #[error("binding name '{0}' is reserved by the sandbox")]
    ReservedBindingName(String),

    #[error("cannot read config file {path}: {reason}")]
    Read { path: String, reason: String },

    #[error("cannot parse config file {path}: {reason}")]
    Parse { path: String, reason: String },
}

/// The backend could not turn source text into a runnable unit.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{message}")]
pub struct CompileError {
    pub message: String,
}

impl CompileError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// The script threw, or the asynchronous result it returned rejected.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{}", display_script_error(.name, .message))]
pub struct ScriptError {
    /// Error class reported by the interpreter (e.g. `ReferenceError`).
    pub name: Option<String>,
    pub message: String,
}

impl ScriptError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            name: None,
            message: message.into(),
        }
    }

    pub fn named(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            message: message.into(),
        }
    }
}

fn display_script_error(name: &Option<String>, message: &str) -> String {
    match name {
        Some(name) if !name.is_empty() => format!("{name}: {message}"),
        _ => message.to_string(),
    }
}
