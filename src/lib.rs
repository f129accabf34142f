//! stagecrew: multi-agent pipeline orchestration.
//!
//! A task brief flows through an ordered list of named stages, each executed
//! by a worker identity backed by a reasoning service. Workers may request
//! sandboxed shell commands; automated reviewers gate every stage and can
//! retry it in place or send the pipeline back to an earlier stage, bounded
//! by hard ceilings that guarantee termination.

pub mod artifacts;
pub mod audit;
pub mod cancel;
pub mod catalog;
pub mod cli;
pub mod engine;
pub mod error;
pub mod exec;
pub mod limiter;
pub mod llm;
pub mod protocol;

pub use engine::{EngineConfig, EngineError, PipelineMachine, RunRegistry, RunReport, TerminalStatus};
pub use error::{CatalogError, CompletionError};
pub use limiter::AdmissionLimiter;
