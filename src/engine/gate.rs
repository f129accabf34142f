//! Quality gating: deterministic auto-fail rules, reviewer invocation,
//! decision parsing.

use std::sync::Arc;

use tracing::{debug, info};

use crate::audit::ToolEvent;
use crate::catalog::{AcceptanceContract, TaskBrief, WorkerIdentity};
use crate::error::CompletionError;
use crate::llm::{ChatMessage, CompletionBackend};
use crate::protocol::{parse_review, DecisionSource, ParseOutcome, ReviewDecision, Verdict};

/// Classifies whether a task demands real produced files.
///
/// The default is a keyword rule over the task text, a known source of
/// false positives and negatives; embedders and tests can swap it out.
pub trait ArtifactPolicy: Send + Sync {
    fn requires_artifacts(&self, task: &TaskBrief) -> bool;
}

// Task-text fragments implying a deliverable on disk. Bilingual, matching
// the vocabulary the system is operated with.
const ARTIFACT_MARKERS: &[&str] = &[
    "file",
    "script",
    "dataset",
    "csv",
    "zip",
    "export",
    "download",
    "spreadsheet",
    "文件",
    "脚本",
    "保存",
    "导出",
    "下载",
    "数据集",
    "压缩包",
    "文包",
    "表格",
];

/// Default policy: keyword scan over title, brief and delivery text.
#[derive(Debug, Default)]
pub struct KeywordArtifactPolicy;

impl ArtifactPolicy for KeywordArtifactPolicy {
    fn requires_artifacts(&self, task: &TaskBrief) -> bool {
        let text = format!("{} {} {}", task.title, task.brief, task.delivery).to_lowercase();
        ARTIFACT_MARKERS.iter().any(|m| text.contains(m))
    }
}

/// Everything a gate evaluation can see about the stage under review.
pub struct GateContext<'a> {
    pub stage: &'a str,
    pub stage_output: &'a str,
    pub tool_events: &'a [ToolEvent],
    /// New non-system files under the output directory after this stage.
    pub new_files: &'a [String],
    pub task: &'a TaskBrief,
    pub contract: &'a AcceptanceContract,
}

const DEFAULT_REVIEW_INSTRUCTION: &str = "You are a strict quality reviewer. \
Judge whether the stage output satisfies the task and the acceptance contract. \
Reply with a JSON object: {\"decision\": \"PASS\" or \"FAIL\", \"reason\": str, \
\"issues\": [str], \"send_back_role\": str, \"rework_instructions\": str}.";

/// Stage-local and pipeline-level quality gating.
pub struct ReviewGate {
    policy: Arc<dyn ArtifactPolicy>,
}

impl Default for ReviewGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReviewGate {
    pub fn new() -> Self {
        Self {
            policy: Arc::new(KeywordArtifactPolicy),
        }
    }

    pub fn with_policy(policy: Arc<dyn ArtifactPolicy>) -> Self {
        Self { policy }
    }

    /// Deterministic rules that fail a stage without a reviewer round-trip.
    pub fn auto_fail(&self, ctx: &GateContext<'_>) -> Option<ReviewDecision> {
        if !ctx.tool_events.is_empty() && ctx.tool_events.iter().all(|e| e.exit_code != 0) {
            return Some(ReviewDecision::fail(
                format!(
                    "all {} command executions in stage '{}' failed",
                    ctx.tool_events.len(),
                    ctx.stage
                ),
                DecisionSource::AutoFail,
            ));
        }
        if self.policy.requires_artifacts(ctx.task) && ctx.new_files.is_empty() {
            return Some(ReviewDecision::fail(
                format!(
                    "task requires produced files but stage '{}' created none",
                    ctx.stage
                ),
                DecisionSource::AutoFail,
            ));
        }
        None
    }

    /// Full stage-local gate: auto-fail rules first, then one reviewer
    /// round-trip, then decision parsing with keyword fallback.
    pub async fn evaluate(
        &self,
        backend: &dyn CompletionBackend,
        reviewer: &WorkerIdentity,
        ctx: &GateContext<'_>,
    ) -> Result<ReviewDecision, CompletionError> {
        if let Some(decision) = self.auto_fail(ctx) {
            info!(
                stage = ctx.stage,
                reason = %decision.reason,
                "stage auto-failed without consulting the reviewer"
            );
            return Ok(decision);
        }

        let messages = vec![
            ChatMessage::system(reviewer_instruction(reviewer)),
            ChatMessage::user(review_prompt(ctx)),
        ];
        let text = backend.complete(reviewer, &messages).await?;
        debug!(stage = ctx.stage, reviewer = %reviewer.name, "reviewer responded");
        Ok(decision_from_text(&text))
    }

    /// One adversarial challenge round: the reviewer critiques the output
    /// without issuing a verdict. Returns the challenge text.
    pub async fn challenge(
        &self,
        backend: &dyn CompletionBackend,
        reviewer: &WorkerIdentity,
        ctx: &GateContext<'_>,
    ) -> Result<String, CompletionError> {
        let messages = vec![
            ChatMessage::system(reviewer_instruction(reviewer)),
            ChatMessage::user(challenge_prompt(ctx)),
        ];
        backend.complete(reviewer, &messages).await
    }
}

/// Parse free reviewer text into a decision; no signal at all becomes
/// UNKNOWN, which gates treat as pass-with-warning.
pub fn decision_from_text(text: &str) -> ReviewDecision {
    match parse_review(text) {
        ParseOutcome::Structured(d) | ParseOutcome::Heuristic(d) => d,
        ParseOutcome::Unparseable => ReviewDecision {
            verdict: Verdict::Unknown,
            reason: "reviewer returned no decision".to_string(),
            issues: Vec::new(),
            send_back_role: None,
            rework_instructions: String::new(),
            source: DecisionSource::Heuristic,
        },
    }
}

fn reviewer_instruction(reviewer: &WorkerIdentity) -> String {
    if reviewer.system_prompt.trim().is_empty() {
        DEFAULT_REVIEW_INSTRUCTION.to_string()
    } else {
        reviewer.system_prompt.clone()
    }
}

fn review_prompt(ctx: &GateContext<'_>) -> String {
    let mut prompt = format!(
        "Task: {}\n\nStage under review: {}\n\nAcceptance contract:\n{}\n",
        ctx.task.brief.trim(),
        ctx.stage,
        ctx.contract.render()
    );
    if !ctx.tool_events.is_empty() {
        prompt.push_str(&format!(
            "\nCommands run: {} (exit codes: {})\n",
            ctx.tool_events.len(),
            ctx.tool_events
                .iter()
                .map(|e| e.exit_code.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ));
    }
    if !ctx.new_files.is_empty() {
        prompt.push_str(&format!("Files produced: {}\n", ctx.new_files.join(", ")));
    }
    prompt.push_str(&format!("\nStage output:\n{}\n", ctx.stage_output));
    prompt.push_str("\nReply with the JSON decision object.");
    prompt
}

fn challenge_prompt(ctx: &GateContext<'_>) -> String {
    format!(
        "Task: {}\n\nStage: {}\n\nOutput draft:\n{}\n\nChallenge this draft: \
name concrete weaknesses, missing evidence, or contract violations the \
author must address. Do not issue a verdict.",
        ctx.task.brief.trim(),
        ctx.stage,
        ctx.stage_output
    )
}
