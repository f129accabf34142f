//! The stage state machine driving one pipeline run.
//!
//! `RUNNING_STAGE -> {ADVANCE, RETRY_SAME_STAGE, REWORK_TO_EARLIER_STAGE,
//! TERMINATE_SUCCESS, TERMINATE_FAILURE}`. The cursor starts at stage 0 and
//! walks the workflow's fixed stage list; dispatch plans reroute work
//! through the overlay, quality gates retry or rework, and hard ceilings
//! guarantee termination. The deliverable and the audit are written exactly
//! once, whatever the terminal state.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn, Instrument};

use crate::artifacts::RunWorkspace;
use crate::audit::{AuditCeilings, AuditTrail, StageAuditRecord, StageDisposition};
use crate::cancel::CancelHandle;
use crate::catalog::{
    write_run_status, RoleSet, RunStatus, StageDef, StageKind, TaskBrief, WorkerIdentity,
    WorkflowSpec,
};
use crate::engine::bridge::{BridgeError, ToolCallBridge};
use crate::engine::config::EngineConfig;
use crate::engine::error::{EngineError, RunReport, TerminalStatus};
use crate::engine::gate::{decision_from_text, GateContext, ReviewGate};
use crate::engine::overlay::RoutingOverlay;
use crate::engine::planner::apply_dispatch;
use crate::llm::{ChatMessage, CompletionBackend};
use crate::protocol::{parse_dispatch, DecisionSource, ParseOutcome, ReviewDecision, Verdict};

// Appended to every worker's system instruction so the tool loop can parse
// its turns.
const ACTION_PROTOCOL: &str = "To run a shell command, reply with \
{\"action\": \"run_command\", \"command\": \"...\", \"reason\": \"...\"}. \
To finish the stage, reply with {\"action\": \"final\", \"content\": \"...\"}. \
One action per reply.";

/// Where the run ended up. Internal to the machine; the public surface is
/// [`RunReport`] / [`EngineError`].
enum Terminal {
    Success,
    Failure { stage: String, reason: String },
    Cancelled { stage: String },
    Configuration { stage: String, reason: String },
}

/// Mutable per-run state. Private to the machine task driving the run.
#[derive(Default)]
struct RunState {
    cursor: usize,
    iterations: u32,
    rework_rounds: u32,
    /// Stage name -> consecutive local-gate failures.
    retries: HashMap<String, u32>,
    /// Stage name -> executions so far (audit attempt numbering).
    attempts: HashMap<String, u32>,
    /// Worker name -> accumulated conversation.
    conversations: HashMap<String, Vec<ChatMessage>>,
    /// Output of the most recently completed stage (context handoff).
    last_output: String,
    /// Latest locally-accepted execution output (the work product).
    work_product: String,
    /// Work product last accepted by a pipeline-level gate.
    accepted_output: Option<String>,
    /// Execution history: (stage index, worker name), in execution order.
    history: Vec<(usize, String)>,
    /// Gate feedback injected into the next stage invocation.
    pending_rework: Option<String>,
}

impl RunState {
    fn conversation(&mut self, worker: &WorkerIdentity, task: &TaskBrief) -> &mut Vec<ChatMessage> {
        self.conversations
            .entry(worker.name.clone())
            .or_insert_with(|| vec![ChatMessage::system(system_prompt_for(worker, task))])
    }

    fn next_attempt(&mut self, stage: &str) -> u32 {
        let attempt = self.attempts.entry(stage.to_string()).or_insert(0);
        *attempt += 1;
        *attempt
    }
}

/// One configured pipeline run, ready to execute.
pub struct PipelineMachine {
    backend: Arc<dyn CompletionBackend>,
    task: TaskBrief,
    roles: RoleSet,
    workflow: WorkflowSpec,
    workspace: RunWorkspace,
    config: EngineConfig,
    gate: ReviewGate,
    cancel: CancelHandle,
    run_id: String,
}

impl PipelineMachine {
    pub fn new(
        backend: Arc<dyn CompletionBackend>,
        task: TaskBrief,
        roles: RoleSet,
        workflow: WorkflowSpec,
        workspace: RunWorkspace,
    ) -> Self {
        let run_id = workspace.run_id().to_string();
        Self {
            backend,
            task,
            roles,
            workflow,
            workspace,
            config: EngineConfig::default(),
            gate: ReviewGate::new(),
            cancel: CancelHandle::new(),
            run_id,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_gate(mut self, gate: ReviewGate) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Handle external callers use to stop this run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Execute the pipeline to termination.
    ///
    /// Success, bounded failure and cancellation all return a [`RunReport`];
    /// only configuration and I/O faults surface as [`EngineError`]. The
    /// deliverable, the audit and the status writeback are produced in every
    /// terminal state.
    pub async fn run(self) -> Result<RunReport, EngineError> {
        let span = tracing::info_span!("run", run = %self.run_id);
        self.run_inner().instrument(span).await
    }

    async fn run_inner(self) -> Result<RunReport, EngineError> {
        let defs = self.workflow.stage_defs();
        let ceiling = self.config.iteration_ceiling(defs.len());
        let mut overlay =
            RoutingOverlay::new(&self.workflow, &self.task, self.config.collision_rounds);
        let mut trail = AuditTrail::new(
            &self.run_id,
            &self.task.id,
            &self.workflow.id,
            AuditCeilings {
                stage_retries: self.config.max_stage_retries,
                rework_rounds: self.config.max_rework_rounds,
                iteration_ceiling: ceiling,
                tool_rounds: self.config.max_tool_rounds,
                collision_rounds_max: self.config.max_collision_rounds,
            },
        );
        let mut state = RunState::default();

        self.workspace.write_task_brief(&self.task)?;
        info!(
            task = %self.task.id,
            workflow = %self.workflow.id,
            stages = defs.len(),
            iteration_ceiling = ceiling,
            "run started"
        );

        let terminal = self
            .drive(&defs, ceiling, &mut overlay, &mut trail, &mut state)
            .await;

        let (status, return_code, failing_stage, reason) = match &terminal {
            Terminal::Success => (TerminalStatus::Succeeded, 0, None, None),
            Terminal::Failure { stage, reason } => (
                TerminalStatus::Failed,
                1,
                Some(stage.clone()),
                Some(reason.clone()),
            ),
            Terminal::Cancelled { stage } => (
                TerminalStatus::Cancelled,
                143,
                Some(stage.clone()),
                Some("run cancelled".to_string()),
            ),
            Terminal::Configuration { stage, reason } => (
                TerminalStatus::Failed,
                2,
                Some(stage.clone()),
                Some(reason.clone()),
            ),
        };

        let deliverable_body = self.compose_deliverable(status, reason.as_deref(), &state, &trail);
        let deliverable = self.workspace.write_deliverable(&deliverable_body)?;

        let stages_executed = trail.records().len();
        let rework_rounds = state.rework_rounds;
        let audit = trail.finalize(
            rework_rounds,
            overlay.assignment_map(),
            overlay.active_in_order(&self.workflow),
            overlay.skipped_in_order(&self.workflow),
            overlay.contract().clone(),
            status.to_string(),
            return_code,
            reason.clone(),
        );
        let audit_path = self.workspace.audit_path();
        audit.write_atomic(&audit_path)?;

        write_run_status(
            self.workspace.status_path(),
            &RunStatus {
                run_id: self.run_id.clone(),
                status: status.to_string(),
                return_code,
                failing_stage: failing_stage.clone(),
                reason: reason.clone(),
            },
        )?;

        info!(status = %status, return_code, stages = stages_executed, "run finished");

        if let Terminal::Configuration { reason, .. } = terminal {
            return Err(EngineError::Configuration(reason));
        }
        Ok(RunReport {
            run_id: self.run_id.clone(),
            status,
            return_code,
            failing_stage,
            reason,
            stages_executed,
            rework_rounds,
            deliverable,
            audit: audit_path,
        })
    }

    async fn drive(
        &self,
        defs: &[StageDef],
        ceiling: u32,
        overlay: &mut RoutingOverlay,
        trail: &mut AuditTrail,
        state: &mut RunState,
    ) -> Terminal {
        loop {
            if state.cursor >= defs.len() {
                return Terminal::Success;
            }
            let def = &defs[state.cursor];

            state.iterations += 1;
            if state.iterations > ceiling {
                let err = EngineError::IterationCeiling {
                    stage: def.name.clone(),
                    limit: ceiling,
                };
                warn!(stage = %def.name, limit = ceiling, "iteration ceiling exceeded");
                return Terminal::Failure {
                    stage: def.name.clone(),
                    reason: err.to_string(),
                };
            }

            if self.cancel.is_cancelled() {
                trail.append(
                    StageAuditRecord::begin(&def.name, def.kind, 0)
                        .finish(StageDisposition::Cancelled),
                );
                return Terminal::Cancelled {
                    stage: def.name.clone(),
                };
            }

            // Inactive stages are skipped, except the first stage, which
            // always runs: a dispatch plan cannot deactivate its own origin.
            if !overlay.is_active(&def.name) && state.cursor != 0 {
                debug!(stage = %def.name, "skipping inactive stage");
                trail.append(StageAuditRecord::skipped(
                    &def.name,
                    def.kind,
                    "stage not in the active set",
                ));
                state.cursor += 1;
                continue;
            }

            // Worker resolution: dispatch override -> workflow default ->
            // task default. Anything less is a configuration fault.
            let worker_name = overlay
                .worker_for(&def.name)
                .map(str::to_string)
                .or_else(|| self.task.default_worker.clone());
            let worker_name = match worker_name {
                Some(name) => name,
                None => {
                    return Terminal::Configuration {
                        stage: def.name.clone(),
                        reason: format!(
                            "no worker assigned to stage '{}' and the task has no default worker",
                            def.name
                        ),
                    };
                }
            };
            let worker = match self.roles.find_enabled(&worker_name) {
                Some(w) => w.clone(),
                None => {
                    return Terminal::Configuration {
                        stage: def.name.clone(),
                        reason: format!(
                            "stage '{}' resolves to worker '{}' which is missing or disabled",
                            def.name, worker_name
                        ),
                    };
                }
            };

            let attempt = state.next_attempt(&def.name);
            info!(
                stage = %def.name,
                kind = %def.kind,
                worker = %worker.name,
                attempt,
                "stage started"
            );
            let mut record = StageAuditRecord::begin(&def.name, def.kind, attempt);
            record.worker = Some(worker.name.clone());

            let prompt = self.stage_prompt(def, overlay, state);
            let baseline = self.workspace.snapshot();
            let bridge = ToolCallBridge::new(
                self.backend.as_ref(),
                &self.workspace,
                &self.task.id,
                &self.config,
            );

            let conversation = state.conversation(&worker, &self.task);
            conversation.push(ChatMessage::user(prompt));
            let mut outcome = match bridge
                .drive(&def.name, &worker, conversation, &self.cancel)
                .await
            {
                Ok(outcome) => outcome,
                Err(BridgeError::Cancelled) => {
                    trail.append(record.finish(StageDisposition::Cancelled));
                    return Terminal::Cancelled {
                        stage: def.name.clone(),
                    };
                }
                Err(BridgeError::Backend(e)) if e.is_configuration() => {
                    trail.append(record.finish(StageDisposition::Failed));
                    return Terminal::Configuration {
                        stage: def.name.clone(),
                        reason: e.to_string(),
                    };
                }
                Err(BridgeError::Backend(e)) => {
                    // Transport trouble rides the normal retry path.
                    warn!(stage = %def.name, error = %e, "completion failed");
                    let decision = ReviewDecision::fail(
                        format!("completion failed: {}", e),
                        DecisionSource::Heuristic,
                    );
                    match self.note_local_failure(def, decision, state, trail, record) {
                        Some(terminal) => return terminal,
                        None => continue,
                    }
                }
            };
            state.history.push((state.cursor, worker.name.clone()));

            let step_index = trail.records().len() + 1;
            match self
                .workspace
                .write_step_document(step_index, &def.name, &outcome.final_text)
            {
                Ok(path) => {
                    record.step_document = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string());
                }
                Err(e) => warn!(stage = %def.name, error = %e, "failed to write step document"),
            }

            match def.kind {
                StageKind::Dispatch => {
                    record.tool_events = outcome.tool_events;
                    record.produced_files = self.workspace.new_files_since(&baseline);
                    let disposition = match parse_dispatch(&outcome.final_text) {
                        ParseOutcome::Structured(payload) => {
                            apply_dispatch(
                                payload,
                                &self.workflow,
                                &self.roles,
                                overlay,
                                state.cursor,
                                self.config.max_collision_rounds,
                            );
                            StageDisposition::DispatchApplied
                        }
                        ParseOutcome::Heuristic(_) => {
                            debug!(stage = %def.name, "no actionable plan in dispatch output");
                            StageDisposition::Advanced
                        }
                        ParseOutcome::Unparseable => {
                            warn!(stage = %def.name, "empty dispatch output; keeping default routing");
                            StageDisposition::Advanced
                        }
                    };
                    trail.append(record.finish(disposition));
                    state.retries.insert(def.name.clone(), 0);
                    state.last_output = outcome.final_text;
                    state.cursor += 1;
                }

                StageKind::Verification | StageKind::Acceptance => {
                    // The assigned reviewer produced this stage's output;
                    // it is the pipeline-level gate decision.
                    record.tool_events = outcome.tool_events;
                    record.produced_files = self.workspace.new_files_since(&baseline);
                    let decision = decision_from_text(&outcome.final_text);
                    if decision.verdict == Verdict::Unknown {
                        warn!(
                            stage = %def.name,
                            "pipeline gate produced no verdict; passing with warning"
                        );
                    }

                    if decision.is_fail() {
                        state.rework_rounds += 1;
                        if state.rework_rounds > self.config.max_rework_rounds {
                            let err = EngineError::ReworkCeiling {
                                stage: def.name.clone(),
                                limit: self.config.max_rework_rounds,
                                reason: decision.reason.clone(),
                            };
                            record.decision = Some(decision);
                            trail.append(record.finish(StageDisposition::Failed));
                            return Terminal::Failure {
                                stage: def.name.clone(),
                                reason: err.to_string(),
                            };
                        }
                        let target = rework_target(&decision, state, overlay, defs, state.cursor);
                        info!(
                            stage = %def.name,
                            target = %defs[target].name,
                            rework_round = state.rework_rounds,
                            reason = %decision.reason,
                            "pipeline gate failed; reworking"
                        );
                        state.pending_rework = Some(rework_note(&decision));
                        record.decision = Some(decision);
                        trail.append(record.finish(StageDisposition::ReworkTriggered));
                        state.last_output = outcome.final_text;
                        state.cursor = target;
                    } else {
                        // The gate accepted the pipeline's work product.
                        state.accepted_output = Some(if state.work_product.is_empty() {
                            outcome.final_text.clone()
                        } else {
                            state.work_product.clone()
                        });
                        record.decision = Some(decision);
                        trail.append(record.finish(StageDisposition::Advanced));
                        state.retries.insert(def.name.clone(), 0);
                        state.last_output = outcome.final_text;
                        state.cursor += 1;
                    }
                }

                StageKind::Execution | StageKind::Support => {
                    let reviewer = self.resolve_reviewer(&worker);

                    // Adversarial collision rounds before the gate: the
                    // reviewer challenges, the worker revises.
                    let mut collisions = 0;
                    if reviewer.name != worker.name {
                        for _ in 0..overlay.collision_rounds() {
                            if self.cancel.is_cancelled() {
                                record.tool_events = outcome.tool_events;
                                trail.append(record.finish(StageDisposition::Cancelled));
                                return Terminal::Cancelled {
                                    stage: def.name.clone(),
                                };
                            }
                            let files = self.workspace.new_files_since(&baseline);
                            let ctx = GateContext {
                                stage: &def.name,
                                stage_output: &outcome.final_text,
                                tool_events: &outcome.tool_events,
                                new_files: &files,
                                task: &self.task,
                                contract: overlay.contract(),
                            };
                            let challenge = match self
                                .gate
                                .challenge(self.backend.as_ref(), &reviewer, &ctx)
                                .await
                            {
                                Ok(text) => text,
                                Err(e) if e.is_configuration() => {
                                    record.tool_events = outcome.tool_events;
                                    trail.append(record.finish(StageDisposition::Failed));
                                    return Terminal::Configuration {
                                        stage: def.name.clone(),
                                        reason: e.to_string(),
                                    };
                                }
                                Err(e) => {
                                    warn!(stage = %def.name, error = %e, "collision challenge failed");
                                    break;
                                }
                            };
                            if challenge.trim().is_empty() {
                                break;
                            }

                            let conversation = state.conversation(&worker, &self.task);
                            conversation.push(ChatMessage::user(format!(
                                "[REVIEW CHALLENGE]\n{}\n\nRevise your output accordingly, \
                                 then return the final answer.",
                                challenge.trim()
                            )));
                            match bridge
                                .drive(&def.name, &worker, conversation, &self.cancel)
                                .await
                            {
                                Ok(revised) => {
                                    outcome.tool_events.extend(revised.tool_events);
                                    outcome.final_text = revised.final_text;
                                    collisions += 1;
                                }
                                Err(BridgeError::Cancelled) => {
                                    record.tool_events = outcome.tool_events;
                                    trail.append(record.finish(StageDisposition::Cancelled));
                                    return Terminal::Cancelled {
                                        stage: def.name.clone(),
                                    };
                                }
                                Err(BridgeError::Backend(e)) if e.is_configuration() => {
                                    record.tool_events = outcome.tool_events;
                                    trail.append(record.finish(StageDisposition::Failed));
                                    return Terminal::Configuration {
                                        stage: def.name.clone(),
                                        reason: e.to_string(),
                                    };
                                }
                                Err(BridgeError::Backend(e)) => {
                                    warn!(stage = %def.name, error = %e, "collision revision failed");
                                    break;
                                }
                            }
                        }
                    }
                    record.collision_rounds = collisions;
                    record.tool_events = outcome.tool_events;
                    record.produced_files = self.workspace.new_files_since(&baseline);

                    // Stage-local quality gate.
                    let ctx = GateContext {
                        stage: &def.name,
                        stage_output: &outcome.final_text,
                        tool_events: &record.tool_events,
                        new_files: &record.produced_files,
                        task: &self.task,
                        contract: overlay.contract(),
                    };
                    let decision = match self
                        .gate
                        .evaluate(self.backend.as_ref(), &reviewer, &ctx)
                        .await
                    {
                        Ok(decision) => decision,
                        Err(e) if e.is_configuration() => {
                            trail.append(record.finish(StageDisposition::Failed));
                            return Terminal::Configuration {
                                stage: def.name.clone(),
                                reason: e.to_string(),
                            };
                        }
                        Err(e) => {
                            warn!(stage = %def.name, error = %e, "review round-trip failed");
                            ReviewDecision::fail(
                                format!("review round-trip failed: {}", e),
                                DecisionSource::Heuristic,
                            )
                        }
                    };
                    if decision.verdict == Verdict::Unknown {
                        warn!(
                            stage = %def.name,
                            "quality gate produced no verdict; passing with warning"
                        );
                    }

                    if decision.is_fail() {
                        match self.note_local_failure(def, decision, state, trail, record) {
                            Some(terminal) => return terminal,
                            None => continue,
                        }
                    }

                    record.decision = Some(decision);
                    trail.append(record.finish(StageDisposition::Advanced));
                    state.retries.insert(def.name.clone(), 0);
                    state.work_product = outcome.final_text.clone();
                    state.last_output = outcome.final_text;
                    state.cursor += 1;
                }
            }
        }
    }

    /// Register a stage-local gate failure: retry in place, or abort once
    /// the stage's retry ceiling is exceeded.
    fn note_local_failure(
        &self,
        def: &StageDef,
        decision: ReviewDecision,
        state: &mut RunState,
        trail: &mut AuditTrail,
        mut record: StageAuditRecord,
    ) -> Option<Terminal> {
        let count = state.retries.entry(def.name.clone()).or_insert(0);
        *count += 1;
        if *count > self.config.max_stage_retries {
            let err = EngineError::StageRetryCeiling {
                stage: def.name.clone(),
                limit: self.config.max_stage_retries,
                reason: decision.reason.clone(),
            };
            record.decision = Some(decision);
            trail.append(record.finish(StageDisposition::Failed));
            return Some(Terminal::Failure {
                stage: def.name.clone(),
                reason: err.to_string(),
            });
        }
        info!(
            stage = %def.name,
            retry = *count,
            limit = self.config.max_stage_retries,
            reason = %decision.reason,
            "stage-local gate failed; retrying"
        );
        state.pending_rework = Some(rework_note(&decision));
        record.decision = Some(decision);
        trail.append(record.finish(StageDisposition::Retried));
        None
    }

    /// Reviewer for collision rounds and stage-local gates: the workflow's
    /// named reviewer, else a reviewer-looking identity, else the stage's
    /// own worker (self-review).
    fn resolve_reviewer(&self, worker: &WorkerIdentity) -> WorkerIdentity {
        if let Some(name) = &self.workflow.reviewer_role {
            if let Some(found) = self.roles.find_enabled(name) {
                return found.clone();
            }
        }
        if let Some(found) = self.roles.reviewer_like() {
            return found.clone();
        }
        worker.clone()
    }

    fn stage_prompt(&self, def: &StageDef, overlay: &RoutingOverlay, state: &mut RunState) -> String {
        let mut prompt = format!(
            "[STAGE {}/{}] {} ({})\n\nTask: {}\n{}\n",
            self.workflow.position(&def.name).map(|i| i + 1).unwrap_or(0),
            self.workflow.stages.len(),
            def.name,
            def.kind,
            self.task.title.trim(),
            self.task.brief.trim()
        );
        if !self.task.delivery.trim().is_empty() {
            prompt.push_str(&format!("Delivery expectation: {}\n", self.task.delivery.trim()));
        }
        if !state.last_output.is_empty() {
            prompt.push_str(&format!(
                "\nPrevious stage output:\n{}\n",
                state.last_output
            ));
        }
        if let Some(note) = state.pending_rework.take() {
            prompt.push_str(&format!("\n[REWORK]\n{}\n", note));
        }

        match def.kind {
            StageKind::Dispatch => {
                let roles: Vec<&str> = self
                    .roles
                    .roles
                    .iter()
                    .filter(|r| r.enabled)
                    .map(|r| r.name.as_str())
                    .collect();
                prompt.push_str(&format!(
                    "\nPlan the remaining pipeline. Stages: {}. Enabled roles: {}.\n\
                     Reply with a JSON plan: {{\"assignments\": [{{\"stage\": .., \"role\": ..}}], \
                     \"active_stages\": [..], \"skip_stages\": [..], \
                     \"acceptance_contract\": {{..}}, \"collision_rounds\": n}}.",
                    self.workflow.stages.join(", "),
                    roles.join(", ")
                ));
            }
            StageKind::Verification | StageKind::Acceptance => {
                prompt.push_str(&format!(
                    "\nAcceptance contract:\n{}\nReview the work so far against the contract. \
                     Reply with a JSON decision: {{\"decision\": \"PASS\" or \"FAIL\", \
                     \"reason\": .., \"issues\": [..], \"send_back_role\": .., \
                     \"rework_instructions\": ..}}.",
                    overlay.contract().render()
                ));
            }
            StageKind::Execution | StageKind::Support => {
                prompt.push_str(
                    "\nDo the stage's work. Run commands as needed, then return the stage \
                     output as your final answer.",
                );
            }
        }
        prompt
    }

    fn compose_deliverable(
        &self,
        status: TerminalStatus,
        reason: Option<&str>,
        state: &RunState,
        trail: &AuditTrail,
    ) -> String {
        let title = if self.task.title.trim().is_empty() {
            self.task.id.clone()
        } else {
            self.task.title.trim().to_string()
        };
        let mut body = format!("# Deliverable: {}\n\n", title);
        match reason {
            Some(reason) if status != TerminalStatus::Succeeded => {
                body.push_str(&format!("Status: {} ({})\n\n", status, reason));
            }
            _ => body.push_str(&format!("Status: {}\n\n", status)),
        }

        let content = state
            .accepted_output
            .clone()
            .unwrap_or_else(|| {
                if state.work_product.is_empty() {
                    state.last_output.clone()
                } else {
                    state.work_product.clone()
                }
            });
        if content.trim().is_empty() {
            body.push_str("No stage output was accepted before termination.\n");
        } else {
            body.push_str(&content);
            body.push('\n');
        }

        let mut seen = Vec::new();
        for record in trail.records() {
            for file in &record.produced_files {
                if !seen.contains(file) {
                    seen.push(file.clone());
                }
            }
        }
        if !seen.is_empty() {
            body.push_str("\n## Produced files\n");
            for file in &seen {
                body.push_str(&format!("- {}\n", file));
            }
        }
        body
    }
}

/// Cursor target for a pipeline-gate rework: the stage most recently owned
/// by the blamed role, else the immediately preceding stage.
fn rework_target(
    decision: &ReviewDecision,
    state: &RunState,
    overlay: &RoutingOverlay,
    defs: &[StageDef],
    cursor: usize,
) -> usize {
    if let Some(role) = &decision.send_back_role {
        for (index, owner) in state.history.iter().rev() {
            if owner == role && *index < cursor && overlay.is_active(&defs[*index].name) {
                return *index;
            }
        }
        debug!(role = %role, "blame target owns no earlier stage; using the preceding stage");
    }
    cursor.saturating_sub(1)
}

fn rework_note(decision: &ReviewDecision) -> String {
    let mut note = format!("The previous result was rejected: {}", decision.reason);
    if !decision.issues.is_empty() {
        note.push_str("\nIssues:");
        for issue in &decision.issues {
            note.push_str(&format!("\n- {}", issue));
        }
    }
    if !decision.rework_instructions.trim().is_empty() {
        note.push_str(&format!(
            "\nInstructions: {}",
            decision.rework_instructions.trim()
        ));
    }
    note
}

fn system_prompt_for(worker: &WorkerIdentity, task: &TaskBrief) -> String {
    let base = if worker.system_prompt.trim().is_empty() {
        format!(
            "You are '{}', a worker in a staged pipeline working on task '{}'.",
            worker.name, task.id
        )
    } else {
        worker.system_prompt.clone()
    };
    format!("{}\n\n{}", base, ACTION_PROTOCOL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    use crate::audit::RunAudit;
    use crate::error::CompletionError;

    struct ScriptedBackend {
        responses: Mutex<Vec<String>>,
        call_count: AtomicUsize,
    }

    impl ScriptedBackend {
        fn new(responses: Vec<&str>) -> Self {
            Self {
                responses: Mutex::new(responses.into_iter().map(String::from).collect()),
                call_count: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CompletionBackend for ScriptedBackend {
        async fn complete(
            &self,
            _worker: &WorkerIdentity,
            _messages: &[ChatMessage],
        ) -> Result<String, CompletionError> {
            let idx = self.call_count.fetch_add(1, Ordering::SeqCst);
            let responses = self.responses.lock().expect("lock not poisoned");
            Ok(responses
                .get(idx)
                .cloned()
                .unwrap_or_else(|| r#"{"action": "final", "content": "done"}"#.to_string()))
        }
    }

    fn roles() -> RoleSet {
        RoleSet::new(vec![
            WorkerIdentity::new("lead"),
            WorkerIdentity::new("implementer"),
            WorkerIdentity::new("reviewer"),
        ])
    }

    fn four_stage_workflow() -> WorkflowSpec {
        WorkflowSpec::new(
            "wf",
            vec![
                "intake".into(),
                "implement".into(),
                "review".into(),
                "deliver".into(),
            ],
        )
        .with_assignment("intake", "lead")
        .with_assignment("implement", "implementer")
        .with_assignment("review", "reviewer")
        .with_assignment("deliver", "lead")
    }

    fn task(brief: &str) -> TaskBrief {
        TaskBrief {
            id: "t1".into(),
            title: "Test task".into(),
            brief: brief.into(),
            delivery: String::new(),
            default_worker: None,
        }
    }

    fn machine(
        backend: ScriptedBackend,
        workflow: WorkflowSpec,
        task: TaskBrief,
        dir: &TempDir,
    ) -> PipelineMachine {
        let workspace = RunWorkspace::create(dir.path(), "test").unwrap();
        PipelineMachine::new(Arc::new(backend), task, roles(), workflow, workspace)
            .with_config(
                EngineConfig::default()
                    .with_collision_rounds(0)
                    .with_max_stage_retries(2)
                    .with_max_rework_rounds(5),
            )
    }

    fn read_audit(dir: &TempDir) -> RunAudit {
        let body =
            std::fs::read_to_string(dir.path().join("run_test/run_audit.json")).unwrap();
        serde_json::from_str(&body).unwrap()
    }

    #[tokio::test]
    async fn test_happy_path_all_stages_pass() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(vec![
            // intake: dispatch plan
            r#"{"assignments": [{"stage": "implement", "role": "implementer"}], "collision_rounds": 0}"#,
            // implement: one command, then the final report
            r#"{"action": "run_command", "command": "echo checked", "reason": "verify env"}"#,
            r#"{"action": "final", "content": "the implement report"}"#,
            // implement's local gate (reviewer)
            r#"{"decision": "PASS", "reason": "solid work"}"#,
            // review stage: pipeline gate decision
            r#"{"decision": "PASS", "reason": "verified"}"#,
            // deliver stage: acceptance decision
            r#"{"decision": "PASS", "reason": "shipped"}"#,
        ]);
        let report = machine(backend, four_stage_workflow(), task("summarize the repo"), &dir)
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(report.return_code, 0);
        assert_eq!(report.stages_executed, 4);
        assert_eq!(report.rework_rounds, 0);

        let audit = read_audit(&dir);
        assert_eq!(audit.stages.len(), 4);
        assert_eq!(audit.status, "succeeded");
        let implement = &audit.stages[1];
        assert_eq!(implement.stage, "implement");
        assert_eq!(implement.tool_events.len(), 1);
        assert_eq!(implement.tool_events[0].exit_code, 0);

        let deliverable =
            std::fs::read_to_string(dir.path().join("run_test/output/deliverable.md")).unwrap();
        assert!(deliverable.contains("the implement report"));
        assert!(deliverable.contains("succeeded"));
    }

    #[tokio::test]
    async fn test_pipeline_gate_failure_reworks_blamed_stage() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(vec![
            // intake: no actionable plan
            "keep the current routing",
            // implement v1 + gate pass
            r#"{"action": "final", "content": "draft one"}"#,
            r#"{"decision": "PASS"}"#,
            // review: FAIL, blaming the implementer
            r#"{"decision": "FAIL", "reason": "draft too thin", "send_back_role": "implementer"}"#,
            // implement v2 + gate pass
            r#"{"action": "final", "content": "draft two"}"#,
            r#"{"decision": "PASS"}"#,
            // review: FAIL again
            r#"{"decision": "FAIL", "reason": "still thin", "send_back_role": "implementer"}"#,
            // implement v3 + gate pass
            r#"{"action": "final", "content": "draft three"}"#,
            r#"{"decision": "PASS"}"#,
            // review: PASS, then deliver: PASS
            r#"{"decision": "PASS", "reason": "good now"}"#,
            r#"{"decision": "PASS", "reason": "shipped"}"#,
        ]);
        let report = machine(backend, four_stage_workflow(), task("write a report"), &dir)
            .run()
            .await
            .unwrap();

        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(report.rework_rounds, 2);

        let audit = read_audit(&dir);
        let implement_attempts = audit
            .stages
            .iter()
            .filter(|r| r.stage == "implement")
            .count();
        assert_eq!(implement_attempts, 3);
        let review_records: Vec<_> = audit
            .stages
            .iter()
            .filter(|r| r.stage == "review")
            .collect();
        assert_eq!(review_records.len(), 3);
        assert_eq!(audit.rework_rounds_used, 2);

        let deliverable =
            std::fs::read_to_string(dir.path().join("run_test/output/deliverable.md")).unwrap();
        assert!(deliverable.contains("draft three"));
    }

    #[tokio::test]
    async fn test_stage_retry_ceiling_fails_the_run() {
        let dir = TempDir::new().unwrap();
        // Artifact-requiring task, but the worker never creates a file:
        // the gate auto-fails every attempt without consulting a reviewer.
        let backend = ScriptedBackend::new(vec![]);
        let workflow = WorkflowSpec::new(
            "wf",
            vec!["implement".into(), "deliver".into()],
        )
        .with_assignment("implement", "implementer")
        .with_assignment("deliver", "reviewer");

        let workspace = RunWorkspace::create(dir.path(), "test").unwrap();
        let report = PipelineMachine::new(
            Arc::new(backend),
            task("save the results as a csv file"),
            roles(),
            workflow,
            workspace,
        )
        .with_config(
            EngineConfig::default()
                .with_collision_rounds(0)
                .with_max_stage_retries(1),
        )
        .run()
        .await
        .unwrap();

        assert_eq!(report.status, TerminalStatus::Failed);
        assert_eq!(report.return_code, 1);
        assert_eq!(report.failing_stage.as_deref(), Some("implement"));
        let reason = report.reason.unwrap();
        assert!(reason.contains("implement"));
        assert!(reason.contains("retry ceiling"));

        let audit = read_audit(&dir);
        assert_eq!(audit.status, "failed");
        // attempt 1 retried, attempt 2 hit the ceiling
        assert_eq!(audit.stages.len(), 2);
        assert_eq!(audit.stages[1].disposition.to_string(), "failed");

        let deliverable =
            std::fs::read_to_string(dir.path().join("run_test/output/deliverable.md")).unwrap();
        assert!(deliverable.contains("failed"));
    }

    #[tokio::test]
    async fn test_cancelled_before_first_stage() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(vec![]);
        let m = machine(backend, four_stage_workflow(), task("anything"), &dir);
        m.cancel_handle().cancel();

        let report = m.run().await.unwrap();
        assert_eq!(report.status, TerminalStatus::Cancelled);
        assert_eq!(report.return_code, 143);

        let audit = read_audit(&dir);
        assert_eq!(audit.status, "cancelled");
    }

    #[tokio::test]
    async fn test_unresolvable_worker_is_a_configuration_error() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(vec![]);
        // No assignment for "implement" and no task default worker.
        let workflow = WorkflowSpec::new("wf", vec!["implement".into()]);
        let workspace = RunWorkspace::create(dir.path(), "test").unwrap();
        let result = PipelineMachine::new(
            Arc::new(backend),
            task("do something"),
            roles(),
            workflow,
            workspace,
        )
        .run()
        .await;

        match result {
            Err(EngineError::Configuration(reason)) => {
                assert!(reason.contains("implement"));
            }
            other => panic!("expected configuration error, got {:?}", other.map(|r| r.status)),
        }
        // The audit is still written on configuration aborts.
        let audit = read_audit(&dir);
        assert_eq!(audit.return_code, 2);
    }

    #[tokio::test]
    async fn test_unknown_verdict_passes_with_warning() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(vec![
            // implement + mute local gate
            r#"{"action": "final", "content": "analysis text"}"#,
            "thinking about it",
            // deliver: acceptance decision
            r#"{"decision": "PASS"}"#,
        ]);
        let workflow = WorkflowSpec::new(
            "wf",
            vec!["implement".into(), "deliver".into()],
        )
        .with_assignment("implement", "implementer")
        .with_assignment("deliver", "reviewer");
        let workspace = RunWorkspace::create(dir.path(), "test").unwrap();
        let report = PipelineMachine::new(
            Arc::new(backend),
            task("analyze the data"),
            roles(),
            workflow,
            workspace,
        )
        .with_config(EngineConfig::default().with_collision_rounds(0))
        .run()
        .await
        .unwrap();

        assert_eq!(report.status, TerminalStatus::Succeeded);
        let audit = read_audit(&dir);
        let implement = &audit.stages[0];
        let decision = implement.decision.as_ref().unwrap();
        assert_eq!(decision.verdict, Verdict::Unknown);
    }

    #[tokio::test]
    async fn test_dispatch_skip_plan_leaves_checkpoints_active() {
        let dir = TempDir::new().unwrap();
        let backend = ScriptedBackend::new(vec![
            // intake: plan tries to skip review and deliver along with research
            r#"{"active_stages": ["implement"]}"#,
            // implement + gate
            r#"{"action": "final", "content": "work"}"#,
            r#"{"decision": "PASS"}"#,
            // research is skipped (no call); review + deliver still run
            r#"{"decision": "PASS"}"#,
            r#"{"decision": "PASS"}"#,
        ]);
        let workflow = WorkflowSpec::new(
            "wf",
            vec![
                "intake".into(),
                "implement".into(),
                "research-notes".into(),
                "review".into(),
                "deliver".into(),
            ],
        )
        .with_assignment("intake", "lead")
        .with_assignment("implement", "implementer")
        .with_assignment("research-notes", "implementer")
        .with_assignment("review", "reviewer")
        .with_assignment("deliver", "lead");

        let report = machine(backend, workflow, task("write a summary"), &dir)
            .run()
            .await
            .unwrap();
        assert_eq!(report.status, TerminalStatus::Succeeded);

        let audit = read_audit(&dir);
        let research = audit
            .stages
            .iter()
            .find(|r| r.stage == "research-notes")
            .unwrap();
        assert_eq!(research.disposition.to_string(), "skipped");
        assert!(audit.stages.iter().any(|r| r.stage == "review"));
        assert!(audit.stages.iter().any(|r| r.stage == "deliver"));
        assert_eq!(audit.skipped_stages, vec!["research-notes".to_string()]);
    }
}
