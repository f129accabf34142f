//! Engine error types and the terminal run report.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::CompletionError;

/// Run-terminating engine faults.
///
/// Quality failures and gate rejections are control flow, not errors; only
/// configuration faults, I/O faults, and exceeded ceilings surface here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Stage '{stage}' exceeded its retry ceiling of {limit}: {reason}")]
    StageRetryCeiling {
        stage: String,
        limit: u32,
        reason: String,
    },

    #[error("Rework ceiling of {limit} exceeded at stage '{stage}': {reason}")]
    ReworkCeiling {
        stage: String,
        limit: u32,
        reason: String,
    },

    #[error("Iteration ceiling of {limit} exceeded at stage '{stage}'")]
    IterationCeiling { stage: String, limit: u32 },

    #[error("Run cancelled during stage '{stage}'")]
    Cancelled { stage: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl EngineError {
    pub fn from_configuration(err: CompletionError) -> Self {
        EngineError::Configuration(err.to_string())
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TerminalStatus::Succeeded => "succeeded",
            TerminalStatus::Failed => "failed",
            TerminalStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Summary returned by the machine for every terminated run.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub status: TerminalStatus,
    /// Process-level convention: 0 success, 1 bounded failure, 143 cancelled.
    pub return_code: i32,
    pub failing_stage: Option<String>,
    pub reason: Option<String>,
    pub stages_executed: usize,
    pub rework_rounds: u32,
    pub deliverable: PathBuf,
    pub audit: PathBuf,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.status == TerminalStatus::Succeeded
    }
}
