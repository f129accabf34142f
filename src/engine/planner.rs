//! Applies a dispatch plan to the routing overlay, with safety nets.

use tracing::{debug, info};

use crate::catalog::{RoleSet, StageKind, WorkflowSpec};
use crate::engine::overlay::RoutingOverlay;
use crate::protocol::DispatchPayload;

/// What a dispatch application changed, for logging and the audit.
#[derive(Debug, Default)]
pub struct DispatchSummary {
    pub assignments_accepted: usize,
    pub assignments_dropped: usize,
    pub membership_changed: bool,
    /// Stages the safety nets re-activated against the plan's wishes.
    pub forced_active: Vec<String>,
    pub contract_replaced: bool,
    pub collision_rounds: Option<u32>,
}

/// Apply the lead's plan to the overlay.
///
/// `cursor` is the index of the dispatch stage being executed; only stages
/// after it count as remaining for reassignment.
pub fn apply_dispatch(
    payload: DispatchPayload,
    workflow: &WorkflowSpec,
    roles: &RoleSet,
    overlay: &mut RoutingOverlay,
    cursor: usize,
    max_collision_rounds: u32,
) -> DispatchSummary {
    let mut summary = DispatchSummary::default();
    let defs = workflow.stage_defs();

    for assignment in payload.assignments {
        let remaining = workflow
            .position(&assignment.stage)
            .map(|i| i > cursor)
            .unwrap_or(false);
        if !remaining {
            debug!(
                stage = %assignment.stage,
                role = %assignment.role,
                "dropping assignment: stage is not a remaining stage"
            );
            summary.assignments_dropped += 1;
            continue;
        }
        if !roles.is_enabled(&assignment.role) {
            debug!(
                stage = %assignment.stage,
                role = %assignment.role,
                "dropping assignment: role is not an enabled identity"
            );
            summary.assignments_dropped += 1;
            continue;
        }
        overlay.assign(assignment.stage, assignment.role);
        summary.assignments_accepted += 1;
    }

    if !payload.active_stages.is_empty() {
        let filtered: Vec<String> = payload
            .active_stages
            .iter()
            .filter(|s| workflow.position(s).is_some())
            .cloned()
            .collect();
        overlay.set_active(filtered);
        summary.membership_changed = true;
    }
    for stage in &payload.skip_stages {
        if workflow.position(stage).is_some() {
            overlay.deactivate(stage);
            summary.membership_changed = true;
        }
    }

    // Quality and delivery checkpoints cannot be planned away.
    for def in &defs {
        let is_checkpoint = matches!(def.kind, StageKind::Verification | StageKind::Acceptance);
        if is_checkpoint && !overlay.is_active(&def.name) {
            overlay.activate(def.name.clone());
            summary.forced_active.push(def.name.clone());
        }
    }

    // A plan that deactivates every execution stage would produce a pipeline
    // that reviews work nobody did; re-activate the first one.
    let has_active_execution = defs
        .iter()
        .any(|d| d.kind == StageKind::Execution && overlay.is_active(&d.name));
    if !has_active_execution {
        if let Some(def) = defs.iter().find(|d| d.kind == StageKind::Execution) {
            overlay.activate(def.name.clone());
            summary.forced_active.push(def.name.clone());
        }
    }

    if let Some(contract) = payload.acceptance_contract {
        overlay.replace_contract(contract);
        summary.contract_replaced = true;
    }

    if let Some(rounds) = payload.collision_rounds {
        let clamped = rounds.min(max_collision_rounds);
        overlay.set_collision_rounds(clamped);
        summary.collision_rounds = Some(clamped);
    }

    info!(
        accepted = summary.assignments_accepted,
        dropped = summary.assignments_dropped,
        membership_changed = summary.membership_changed,
        forced = summary.forced_active.len(),
        "dispatch plan applied"
    );
    summary
}
