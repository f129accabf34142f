//! Error types for stagecrew operations.
//!
//! Defines error types for the outer subsystems:
//! - Definition catalog loading and validation
//! - Reasoning-service (completion) API interactions
//!
//! Engine-internal errors live in [`crate::engine::error`].

use thiserror::Error;

/// Errors that can occur while loading task/role/workflow definitions.
#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("Failed to parse definition file '{path}': {message}")]
    ParseError { path: String, message: String },

    #[error("Workflow '{workflow}' has an empty stage list")]
    EmptyStageList { workflow: String },

    #[error("Workflow '{workflow}' repeats stage name '{stage}'")]
    DuplicateStage { workflow: String, stage: String },

    #[error("Workflow '{workflow}' references unknown stage '{stage}' in '{field}'")]
    UnknownStage {
        workflow: String,
        stage: String,
        field: String,
    },

    #[error("Role '{0}' is defined more than once")]
    DuplicateRole(String),

    #[error("No enabled roles defined")]
    NoEnabledRoles,

    #[error("Task '{task}' names default worker '{role}' which is not defined")]
    UnknownDefaultWorker { task: String, role: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors that can occur when calling the reasoning service.
#[derive(Debug, Error)]
pub enum CompletionError {
    #[error("Worker '{role}' has no endpoint configured")]
    MissingEndpoint { role: String },

    #[error("Worker '{role}' has no model configured")]
    MissingModel { role: String },

    #[error("HTTP request failed: {0}")]
    RequestFailed(String),

    #[error("Failed to parse completion response: {0}")]
    ParseError(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Completion response contained no choices")]
    EmptyResponse,

    #[error("API error ({code}): {message}")]
    ApiError { code: u16, message: String },
}

impl CompletionError {
    /// Whether this failure is a configuration problem that retrying cannot fix.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            CompletionError::MissingEndpoint { .. } | CompletionError::MissingModel { .. }
        )
    }
}
