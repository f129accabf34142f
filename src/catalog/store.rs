//! File-backed loading for definition records and terminal status writeback.
//!
//! Files are YAML (JSON parses too, being a YAML subset). Loading always
//! validates; a definition that does not validate never reaches the engine.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

use super::types::{RoleSet, TaskBrief, WorkerIdentity, WorkflowSpec};

fn parse_error(path: &Path, err: serde_yaml::Error) -> CatalogError {
    CatalogError::ParseError {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Load a task definition from a file.
pub fn load_task<P: AsRef<Path>>(path: P) -> Result<TaskBrief, CatalogError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let task: TaskBrief = serde_yaml::from_str(&content).map_err(|e| parse_error(path, e))?;
    Ok(task)
}

/// Roles files are accepted both as a bare list and wrapped in a `roles` key.
#[derive(Deserialize)]
#[serde(untagged)]
enum RolesFile {
    Wrapped { roles: Vec<WorkerIdentity> },
    Bare(Vec<WorkerIdentity>),
}

/// Load and validate the worker identity set from a file.
pub fn load_roles<P: AsRef<Path>>(path: P) -> Result<RoleSet, CatalogError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let parsed: RolesFile = serde_yaml::from_str(&content).map_err(|e| parse_error(path, e))?;
    let roles = match parsed {
        RolesFile::Wrapped { roles } => RoleSet::new(roles),
        RolesFile::Bare(roles) => RoleSet::new(roles),
    };
    roles.validate()?;
    Ok(roles)
}

/// Load and validate a workflow definition from a file.
pub fn load_workflow<P: AsRef<Path>>(
    path: P,
    roles: &RoleSet,
) -> Result<WorkflowSpec, CatalogError> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)?;
    let workflow: WorkflowSpec =
        serde_yaml::from_str(&content).map_err(|e| parse_error(path, e))?;
    workflow.validate(roles)?;
    Ok(workflow)
}

/// Terminal status written back next to the run's artifacts.
///
/// This is the only thing the engine side ever writes toward the definition
/// store; task, role and workflow records stay read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStatus {
    pub run_id: String,
    pub status: String,
    pub return_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failing_stage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Write the terminal run status as JSON.
pub fn write_run_status<P: AsRef<Path>>(path: P, status: &RunStatus) -> std::io::Result<()> {
    let body = serde_json::to_string_pretty(status)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    fs::write(path, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_task_from_yaml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("task.yaml");
        fs::write(
            &path,
            r#"
id: demo-001
title: Summarize the repo
brief: Read the repository and produce a summary.
delivery: A markdown report under output/.
default_worker: implementer
"#,
        )
        .unwrap();

        let task = load_task(&path).unwrap();
        assert_eq!(task.id, "demo-001");
        assert_eq!(task.default_worker.as_deref(), Some("implementer"));
    }

    #[test]
    fn test_load_roles_bare_list_and_wrapped() {
        let dir = TempDir::new().unwrap();

        let bare = dir.path().join("bare.yaml");
        fs::write(&bare, "- name: lead\n- name: implementer\n").unwrap();
        let roles = load_roles(&bare).unwrap();
        assert_eq!(roles.roles.len(), 2);

        let wrapped = dir.path().join("wrapped.yaml");
        fs::write(&wrapped, "roles:\n  - name: lead\n").unwrap();
        let roles = load_roles(&wrapped).unwrap();
        assert!(roles.find("lead").is_some());
    }

    #[test]
    fn test_load_roles_rejects_all_disabled() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("roles.yaml");
        fs::write(&path, "- name: lead\n  enabled: false\n").unwrap();
        assert!(matches!(
            load_roles(&path),
            Err(CatalogError::NoEnabledRoles)
        ));
    }

    #[test]
    fn test_load_workflow_validates_references() {
        let dir = TempDir::new().unwrap();
        let roles_path = dir.path().join("roles.yaml");
        fs::write(&roles_path, "- name: lead\n").unwrap();
        let roles = load_roles(&roles_path).unwrap();

        let wf_path = dir.path().join("wf.yaml");
        fs::write(
            &wf_path,
            r#"
id: default
stages: [intake, implement, review, deliver]
assignments:
  implement: implementer
acceptance_stage: ship
"#,
        )
        .unwrap();
        assert!(matches!(
            load_workflow(&wf_path, &roles),
            Err(CatalogError::UnknownStage { .. })
        ));
    }

    #[test]
    fn test_run_status_round_trips_camel_case() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run_status.json");
        let status = RunStatus {
            run_id: "r-1234".to_string(),
            status: "failed".to_string(),
            return_code: 1,
            failing_stage: Some("implement".to_string()),
            reason: Some("stage retry ceiling".to_string()),
        };
        write_run_status(&path, &status).unwrap();
        let body = fs::read_to_string(&path).unwrap();
        assert!(body.contains("\"runId\""));
        assert!(body.contains("\"returnCode\""));
        assert!(body.contains("\"failingStage\""));
    }
}
