// flowbot Core - Error types
//
// One error enum for the library crates. User-registered handlers return
// `anyhow::Result` and are converted at the boundary.

use thiserror::Error;

use crate::renderer::RenderError;

/// Result alias used across the flowbot crates
pub type FlowbotResult<T> = Result<T, FlowbotError>;

/// Errors produced by flowbot
#[derive(Debug, Error)]
pub enum FlowbotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid flow configuration: {0}")]
    InvalidFlow(String),

    #[error("Flow not found: {0}")]
    FlowNotFound(String),

    #[error("Step '{step}' not found in flow '{flow}'")]
    StepNotFound { flow: String, step: String },

    #[error("Render error: {0}")]
    Render(#[from] RenderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl FlowbotError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Whether this error is a missing-definition error (flow or step)
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FlowNotFound(_) | Self::StepNotFound { .. })
    }
}
