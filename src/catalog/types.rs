//! Core definition types: worker identities, workflows, tasks, contracts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::CatalogError;

/// A named worker identity bound to a reasoning-service endpoint.
///
/// Read-only during a run; assignments may move between identities but the
/// identities themselves never change mid-flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Role name used in stage assignments (e.g. "lead", "implementer").
    pub name: String,
    /// Chat-completions endpoint base URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Bearer credential for the endpoint.
    #[serde(default)]
    pub api_key: Option<String>,
    /// Model identifier sent with every request.
    #[serde(default)]
    pub model: Option<String>,
    /// System instruction opening every conversation with this identity.
    #[serde(default)]
    pub system_prompt: String,
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: Option<f64>,
    /// Maximum output tokens per completion.
    #[serde(default)]
    pub max_tokens: Option<u32>,
    /// Disabled identities are never assigned work.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl WorkerIdentity {
    /// Create a minimal enabled identity. Endpoint, model and instruction
    /// can be filled in afterwards (the CLI applies global overrides).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            endpoint: None,
            api_key: None,
            model: None,
            system_prompt: String::new(),
            temperature: None,
            max_tokens: None,
            enabled: true,
        }
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }
}

/// The set of worker identities available to a run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoleSet {
    pub roles: Vec<WorkerIdentity>,
}

impl RoleSet {
    pub fn new(roles: Vec<WorkerIdentity>) -> Self {
        Self { roles }
    }

    /// Look up an identity by name, enabled or not.
    pub fn find(&self, name: &str) -> Option<&WorkerIdentity> {
        self.roles.iter().find(|r| r.name == name)
    }

    /// Look up an enabled identity by name.
    pub fn find_enabled(&self, name: &str) -> Option<&WorkerIdentity> {
        self.roles.iter().find(|r| r.name == name && r.enabled)
    }

    /// Whether `name` refers to an enabled identity.
    pub fn is_enabled(&self, name: &str) -> bool {
        self.find_enabled(name).is_some()
    }

    /// First enabled identity whose name looks like a reviewer role.
    pub fn reviewer_like(&self) -> Option<&WorkerIdentity> {
        self.roles
            .iter()
            .filter(|r| r.enabled)
            .find(|r| contains_any(&r.name, REVIEWER_ROLE_MARKERS))
    }

    pub fn validate(&self) -> Result<(), CatalogError> {
        let mut seen = HashMap::new();
        for role in &self.roles {
            if seen.insert(role.name.clone(), ()).is_some() {
                return Err(CatalogError::DuplicateRole(role.name.clone()));
            }
        }
        if !self.roles.iter().any(|r| r.enabled) {
            return Err(CatalogError::NoEnabledRoles);
        }
        Ok(())
    }
}

/// What a task's deliverable must satisfy to pass acceptance gating.
///
/// Starts from a task-derived default; a dispatch plan may replace it
/// wholesale, with unset fields falling back to the previous contract.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AcceptanceContract {
    /// Questions the deliverable must answer.
    #[serde(default)]
    pub must_answer: Vec<String>,
    /// Evidence the deliverable must cite (files, command output, data).
    #[serde(default)]
    pub evidence: Vec<String>,
    /// Free-text hint about the expected delivery form.
    #[serde(default)]
    pub delivery_form: String,
    /// Behaviors the deliverable must avoid.
    #[serde(default)]
    pub forbidden: Vec<String>,
}

impl AcceptanceContract {
    /// Derive the initial contract from the task definition.
    pub fn from_task(task: &TaskBrief) -> Self {
        let mut must_answer = Vec::new();
        if !task.title.trim().is_empty() {
            must_answer.push(task.title.trim().to_string());
        }
        Self {
            must_answer,
            evidence: Vec::new(),
            delivery_form: task.delivery.trim().to_string(),
            forbidden: Vec::new(),
        }
    }

    /// Replace this contract with `update`, falling back per-field to the
    /// current values where the update left a field unset.
    pub fn replaced_with(&self, update: AcceptanceContract) -> Self {
        Self {
            must_answer: if update.must_answer.is_empty() {
                self.must_answer.clone()
            } else {
                update.must_answer
            },
            evidence: if update.evidence.is_empty() {
                self.evidence.clone()
            } else {
                update.evidence
            },
            delivery_form: if update.delivery_form.trim().is_empty() {
                self.delivery_form.clone()
            } else {
                update.delivery_form
            },
            forbidden: if update.forbidden.is_empty() {
                self.forbidden.clone()
            } else {
                update.forbidden
            },
        }
    }

    /// Render the contract as prompt text for worker conversations.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if !self.must_answer.is_empty() {
            out.push_str("Must answer:\n");
            for item in &self.must_answer {
                out.push_str(&format!("- {}\n", item));
            }
        }
        if !self.evidence.is_empty() {
            out.push_str("Required evidence:\n");
            for item in &self.evidence {
                out.push_str(&format!("- {}\n", item));
            }
        }
        if !self.delivery_form.is_empty() {
            out.push_str(&format!("Delivery form: {}\n", self.delivery_form));
        }
        if !self.forbidden.is_empty() {
            out.push_str("Forbidden:\n");
            for item in &self.forbidden {
                out.push_str(&format!("- {}\n", item));
            }
        }
        out
    }
}

/// One task to run a workflow against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskBrief {
    pub id: String,
    #[serde(default)]
    pub title: String,
    /// Free-text description of the work.
    pub brief: String,
    /// What the finished deliverable is expected to contain.
    #[serde(default)]
    pub delivery: String,
    /// Fallback worker when neither dispatch nor the workflow assigns one.
    #[serde(default)]
    pub default_worker: Option<String>,
}

// ---------------------------------------------------------------------------
// Stage classification
// ---------------------------------------------------------------------------

/// How the state machine treats a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    /// Planning stage: its output is fed to the dispatch planner.
    Dispatch,
    /// Produces work; gets collision rounds and a stage-local quality gate.
    Execution,
    /// Cross-stage check: its own output is the pipeline-level gate decision.
    Verification,
    /// Final pipeline gate before delivery.
    Acceptance,
    /// Any other stage; gated like execution stages.
    Support,
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageKind::Dispatch => "dispatch",
            StageKind::Execution => "execution",
            StageKind::Verification => "verification",
            StageKind::Acceptance => "acceptance",
            StageKind::Support => "support",
        };
        write!(f, "{}", s)
    }
}

/// A stage with its load-time classification and default worker.
#[derive(Debug, Clone)]
pub struct StageDef {
    pub name: String,
    pub kind: StageKind,
    pub default_worker: Option<String>,
}

// Name fragments used when a workflow does not classify its stages
// explicitly. Bilingual: these match the stage vocabulary the system is
// operated with in practice.
const DISPATCH_MARKERS: &[&str] = &[
    "dispatch", "intake", "plan", "triage", "需求理解", "需求分析", "规划", "调度", "分派",
];
const VERIFICATION_MARKERS: &[&str] = &[
    "review", "verify", "verification", "audit", "inspect", "复核", "审核", "审查", "验证", "质检",
];
const ACCEPTANCE_MARKERS: &[&str] = &[
    "deliver", "delivery", "acceptance", "release", "accept", "交付", "验收", "发布",
];
const EXECUTION_MARKERS: &[&str] = &[
    "implement",
    "execute",
    "execution",
    "develop",
    "build",
    "collect",
    "write",
    "research",
    "执行",
    "实现",
    "开发",
    "实施",
    "采集",
    "写作",
    "撰写",
    "研究",
];
const REVIEWER_ROLE_MARKERS: &[&str] = &[
    "review", "verifier", "qa", "审核", "复核", "质检", "验收",
];

fn contains_any(name: &str, markers: &[&str]) -> bool {
    let lower = name.to_lowercase();
    markers.iter().any(|m| lower.contains(m))
}

/// Classify a stage by its name alone.
pub fn classify_stage_name(name: &str) -> StageKind {
    if contains_any(name, ACCEPTANCE_MARKERS) {
        StageKind::Acceptance
    } else if contains_any(name, VERIFICATION_MARKERS) {
        StageKind::Verification
    } else if contains_any(name, DISPATCH_MARKERS) {
        StageKind::Dispatch
    } else if contains_any(name, EXECUTION_MARKERS) {
        StageKind::Execution
    } else {
        StageKind::Support
    }
}

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// An ordered workflow definition.
///
/// The stage list is fixed for the lifetime of a run: dispatch plans change
/// membership and assignment through a routing overlay, never this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    /// Ordered stage names. Never reordered or resized during a run.
    pub stages: Vec<String>,
    /// Stage name -> default worker role.
    #[serde(default)]
    pub assignments: HashMap<String, String>,
    /// Explicit dispatch stage; falls back to a name-matched first stage.
    #[serde(default)]
    pub dispatch_stage: Option<String>,
    /// Explicit cross-stage verification stages, unioned with name matches.
    #[serde(default)]
    pub verification_stages: Vec<String>,
    /// Explicit final acceptance stage; falls back to the last name match.
    #[serde(default)]
    pub acceptance_stage: Option<String>,
    /// Identity consulted by stage-local quality gates.
    #[serde(default)]
    pub reviewer_role: Option<String>,
}

impl WorkflowSpec {
    pub fn new(id: impl Into<String>, stages: Vec<String>) -> Self {
        Self {
            id: id.into(),
            stages,
            assignments: HashMap::new(),
            dispatch_stage: None,
            verification_stages: Vec::new(),
            acceptance_stage: None,
            reviewer_role: None,
        }
    }

    pub fn with_assignment(mut self, stage: impl Into<String>, role: impl Into<String>) -> Self {
        self.assignments.insert(stage.into(), role.into());
        self
    }

    pub fn position(&self, stage: &str) -> Option<usize> {
        self.stages.iter().position(|s| s == stage)
    }

    /// Resolve the kind of the stage at `index`, honoring explicit fields
    /// before name heuristics.
    pub fn kind_of(&self, index: usize) -> StageKind {
        let name = &self.stages[index];
        if let Some(acc) = self.resolved_acceptance_stage() {
            if acc == index {
                return StageKind::Acceptance;
            }
        }
        if self.verification_stages.iter().any(|s| s == name) {
            return StageKind::Verification;
        }
        if let Some(disp) = &self.dispatch_stage {
            if disp == name {
                return StageKind::Dispatch;
            }
        }
        match classify_stage_name(name) {
            // A name-matched acceptance stage that is not the resolved final
            // acceptance stage still acts as a mid-pipeline verification.
            StageKind::Acceptance => StageKind::Verification,
            kind => kind,
        }
    }

    /// Index of the final acceptance stage, if the workflow has one.
    pub fn resolved_acceptance_stage(&self) -> Option<usize> {
        if let Some(name) = &self.acceptance_stage {
            return self.position(name);
        }
        self.stages
            .iter()
            .rposition(|s| classify_stage_name(s) == StageKind::Acceptance)
    }

    /// Index of the dispatch stage, if the workflow has one.
    pub fn resolved_dispatch_stage(&self) -> Option<usize> {
        if let Some(name) = &self.dispatch_stage {
            return self.position(name);
        }
        // Only the first stage is considered for implicit dispatch: a
        // mid-pipeline "planning" stage is ordinary work.
        match self.stages.first() {
            Some(first) if classify_stage_name(first) == StageKind::Dispatch => Some(0),
            _ => None,
        }
    }

    /// All stages with their resolved kinds and default workers.
    pub fn stage_defs(&self) -> Vec<StageDef> {
        let dispatch = self.resolved_dispatch_stage();
        (0..self.stages.len())
            .map(|i| {
                let kind = if dispatch == Some(i) {
                    StageKind::Dispatch
                } else {
                    self.kind_of(i)
                };
                StageDef {
                    name: self.stages[i].clone(),
                    kind,
                    default_worker: self.assignments.get(&self.stages[i]).cloned(),
                }
            })
            .collect()
    }

    pub fn validate(&self, roles: &RoleSet) -> Result<(), CatalogError> {
        if self.stages.is_empty() {
            return Err(CatalogError::EmptyStageList {
                workflow: self.id.clone(),
            });
        }
        let mut seen = HashMap::new();
        for stage in &self.stages {
            if seen.insert(stage.clone(), ()).is_some() {
                return Err(CatalogError::DuplicateStage {
                    workflow: self.id.clone(),
                    stage: stage.clone(),
                });
            }
        }
        for (field, stage) in self
            .dispatch_stage
            .iter()
            .map(|s| ("dispatch_stage", s))
            .chain(self.acceptance_stage.iter().map(|s| ("acceptance_stage", s)))
            .chain(
                self.verification_stages
                    .iter()
                    .map(|s| ("verification_stages", s)),
            )
            .chain(self.assignments.keys().map(|s| ("assignments", s)))
        {
            if self.position(stage).is_none() {
                return Err(CatalogError::UnknownStage {
                    workflow: self.id.clone(),
                    stage: stage.clone(),
                    field: field.to_string(),
                });
            }
        }
        // Assignment targets must at least exist; enablement is re-checked
        // at resolution time because dispatch can reassign mid-run.
        let _ = roles;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workflow(stages: &[&str]) -> WorkflowSpec {
        WorkflowSpec::new("wf", stages.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn test_classify_stage_names() {
        assert_eq!(classify_stage_name("intake"), StageKind::Dispatch);
        assert_eq!(classify_stage_name("implement"), StageKind::Execution);
        assert_eq!(classify_stage_name("review"), StageKind::Verification);
        assert_eq!(classify_stage_name("deliver"), StageKind::Acceptance);
        assert_eq!(classify_stage_name("需求理解"), StageKind::Dispatch);
        assert_eq!(classify_stage_name("执行"), StageKind::Execution);
        assert_eq!(classify_stage_name("复核"), StageKind::Verification);
        assert_eq!(classify_stage_name("交付"), StageKind::Acceptance);
        assert_eq!(classify_stage_name("misc"), StageKind::Support);
    }

    #[test]
    fn test_stage_defs_resolve_kinds() {
        let wf = workflow(&["intake", "implement", "review", "deliver"]);
        let defs = wf.stage_defs();
        assert_eq!(defs[0].kind, StageKind::Dispatch);
        assert_eq!(defs[1].kind, StageKind::Execution);
        assert_eq!(defs[2].kind, StageKind::Verification);
        assert_eq!(defs[3].kind, StageKind::Acceptance);
    }

    #[test]
    fn test_explicit_fields_override_heuristics() {
        let mut wf = workflow(&["start", "work", "check", "ship"]);
        wf.dispatch_stage = Some("start".to_string());
        wf.verification_stages = vec!["check".to_string()];
        wf.acceptance_stage = Some("ship".to_string());
        let defs = wf.stage_defs();
        assert_eq!(defs[0].kind, StageKind::Dispatch);
        assert_eq!(defs[1].kind, StageKind::Support);
        assert_eq!(defs[2].kind, StageKind::Verification);
        assert_eq!(defs[3].kind, StageKind::Acceptance);
    }

    #[test]
    fn test_mid_pipeline_dispatch_name_is_not_dispatch() {
        let wf = workflow(&["implement", "plan-next", "deliver"]);
        assert_eq!(wf.resolved_dispatch_stage(), None);
    }

    #[test]
    fn test_earlier_delivery_name_becomes_verification() {
        let wf = workflow(&["implement", "交付初稿", "交付"]);
        let defs = wf.stage_defs();
        assert_eq!(defs[1].kind, StageKind::Verification);
        assert_eq!(defs[2].kind, StageKind::Acceptance);
    }

    #[test]
    fn test_validate_rejects_duplicate_stage() {
        let wf = workflow(&["a", "b", "a"]);
        let roles = RoleSet::new(vec![WorkerIdentity::new("lead")]);
        assert!(matches!(
            wf.validate(&roles),
            Err(CatalogError::DuplicateStage { .. })
        ));
    }

    #[test]
    fn test_validate_rejects_unknown_stage_reference() {
        let mut wf = workflow(&["a", "b"]);
        wf.acceptance_stage = Some("ship".to_string());
        let roles = RoleSet::new(vec![WorkerIdentity::new("lead")]);
        assert!(matches!(
            wf.validate(&roles),
            Err(CatalogError::UnknownStage { .. })
        ));
    }

    #[test]
    fn test_contract_replacement_falls_back_per_field() {
        let prev = AcceptanceContract {
            must_answer: vec!["origin".to_string()],
            evidence: vec!["logs".to_string()],
            delivery_form: "markdown report".to_string(),
            forbidden: vec!["fabrication".to_string()],
        };
        let update = AcceptanceContract {
            must_answer: vec!["new question".to_string()],
            ..Default::default()
        };
        let merged = prev.replaced_with(update);
        assert_eq!(merged.must_answer, vec!["new question".to_string()]);
        assert_eq!(merged.evidence, vec!["logs".to_string()]);
        assert_eq!(merged.delivery_form, "markdown report");
        assert_eq!(merged.forbidden, vec!["fabrication".to_string()]);
    }

    #[test]
    fn test_role_set_lookup_honors_enabled_flag() {
        let mut off = WorkerIdentity::new("reviewer");
        off.enabled = false;
        let roles = RoleSet::new(vec![WorkerIdentity::new("lead"), off]);
        assert!(roles.is_enabled("lead"));
        assert!(!roles.is_enabled("reviewer"));
        assert!(roles.find("reviewer").is_some());
    }
}
