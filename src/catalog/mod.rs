//! Definition catalog for tasks, worker identities and workflows.
//!
//! The engine never owns these records: they live in external files (YAML or
//! JSON) and are loaded read-only at run start. The catalog validates shape
//! up front so a malformed definition fails before any worker is invoked.

pub mod store;
pub mod types;

pub use store::{load_roles, load_task, load_workflow, write_run_status, RunStatus};
pub use types::{
    AcceptanceContract, RoleSet, StageDef, StageKind, TaskBrief, WorkerIdentity, WorkflowSpec,
};
