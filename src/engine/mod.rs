//! The orchestration engine.
//!
//! [`machine::PipelineMachine`] drives one run end to end: the stage cursor,
//! the tool-call bridge, collision rounds, quality gates, dispatch
//! re-planning and the hard ceilings. Everything here is private to one run
//! except [`registry::RunRegistry`], which external callers use to cancel
//! in-flight work.

pub mod bridge;
pub mod config;
pub mod error;
pub mod gate;
pub mod machine;
pub mod overlay;
pub mod planner;
pub mod registry;

pub use config::EngineConfig;
pub use error::{EngineError, RunReport, TerminalStatus};
pub use gate::{ArtifactPolicy, GateContext, KeywordArtifactPolicy, ReviewGate};
pub use machine::PipelineMachine;
pub use overlay::RoutingOverlay;
pub use registry::RunRegistry;
