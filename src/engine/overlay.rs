//! Mutable per-run routing state, separate from the workflow definition.
//!
//! Dispatch plans rewrite worker assignment, active-stage membership, the
//! acceptance contract and the collision round count here; the
//! [`WorkflowSpec`](crate::catalog::WorkflowSpec) itself stays immutable for
//! the lifetime of the run.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::catalog::{AcceptanceContract, TaskBrief, WorkflowSpec};

#[derive(Debug, Clone)]
pub struct RoutingOverlay {
    /// Stage name -> assigned worker role. Seeded from the workflow,
    /// overwritten per-stage by accepted dispatch assignments.
    assignments: HashMap<String, String>,
    /// Stages the cursor will execute. Inactive stages are skipped.
    active: BTreeSet<String>,
    contract: AcceptanceContract,
    collision_rounds: u32,
}

impl RoutingOverlay {
    /// Initial overlay: every stage active, workflow assignments, contract
    /// derived from the task.
    pub fn new(workflow: &WorkflowSpec, task: &TaskBrief, collision_rounds: u32) -> Self {
        Self {
            assignments: workflow.assignments.clone(),
            active: workflow.stages.iter().cloned().collect(),
            contract: AcceptanceContract::from_task(task),
            collision_rounds,
        }
    }

    pub fn worker_for(&self, stage: &str) -> Option<&str> {
        self.assignments.get(stage).map(String::as_str)
    }

    pub fn assign(&mut self, stage: impl Into<String>, role: impl Into<String>) {
        self.assignments.insert(stage.into(), role.into());
    }

    pub fn is_active(&self, stage: &str) -> bool {
        self.active.contains(stage)
    }

    pub fn activate(&mut self, stage: impl Into<String>) {
        self.active.insert(stage.into());
    }

    pub fn deactivate(&mut self, stage: &str) {
        self.active.remove(stage);
    }

    /// Replace the whole active set.
    pub fn set_active(&mut self, stages: impl IntoIterator<Item = String>) {
        self.active = stages.into_iter().collect();
    }

    pub fn contract(&self) -> &AcceptanceContract {
        &self.contract
    }

    /// Wholesale contract replacement with per-field fallback.
    pub fn replace_contract(&mut self, update: AcceptanceContract) {
        self.contract = self.contract.replaced_with(update);
    }

    pub fn collision_rounds(&self) -> u32 {
        self.collision_rounds
    }

    pub fn set_collision_rounds(&mut self, rounds: u32) {
        self.collision_rounds = rounds;
    }

    /// Final assignment map, ordered for the audit.
    pub fn assignment_map(&self) -> BTreeMap<String, String> {
        self.assignments
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Active stages in workflow order.
    pub fn active_in_order(&self, workflow: &WorkflowSpec) -> Vec<String> {
        workflow
            .stages
            .iter()
            .filter(|s| self.active.contains(*s))
            .cloned()
            .collect()
    }

    /// Skipped stages in workflow order.
    pub fn skipped_in_order(&self, workflow: &WorkflowSpec) -> Vec<String> {
        workflow
            .stages
            .iter()
            .filter(|s| !self.active.contains(*s))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixtures() -> (WorkflowSpec, TaskBrief) {
        let workflow = WorkflowSpec::new(
            "wf",
            vec!["intake".into(), "implement".into(), "review".into()],
        )
        .with_assignment("implement", "implementer");
        let task = TaskBrief {
            id: "t".into(),
            title: "Report".into(),
            brief: "write it".into(),
            delivery: "markdown".into(),
            default_worker: None,
        };
        (workflow, task)
    }

    #[test]
    fn test_seeded_from_workflow() {
        let (workflow, task) = fixtures();
        let overlay = RoutingOverlay::new(&workflow, &task, 1);
        assert_eq!(overlay.worker_for("implement"), Some("implementer"));
        assert!(overlay.is_active("intake"));
        assert!(overlay.is_active("review"));
        assert_eq!(overlay.contract().delivery_form, "markdown");
    }

    #[test]
    fn test_membership_edits() {
        let (workflow, task) = fixtures();
        let mut overlay = RoutingOverlay::new(&workflow, &task, 1);
        overlay.deactivate("implement");
        assert!(!overlay.is_active("implement"));
        assert_eq!(overlay.skipped_in_order(&workflow), vec!["implement"]);
        overlay.activate("implement");
        assert_eq!(
            overlay.active_in_order(&workflow),
            vec!["intake", "implement", "review"]
        );
    }

    #[test]
    fn test_contract_replacement_keeps_prior_fields() {
        let (workflow, task) = fixtures();
        let mut overlay = RoutingOverlay::new(&workflow, &task, 1);
        overlay.replace_contract(AcceptanceContract {
            evidence: vec!["command output".into()],
            ..Default::default()
        });
        assert_eq!(overlay.contract().evidence, vec!["command output"]);
        // delivery_form fell back to the task-derived value.
        assert_eq!(overlay.contract().delivery_form, "markdown");
    }
}
