//! Bounded tool-round loop for one stage invocation.
//!
//! `AWAIT_MODEL -> (run_command | final)`: the worker's response either
//! requests a shell command or declares the stage output. Command requests
//! pass the guard, run under the stage deadline, and their results return to
//! the conversation as user turns; the loop re-prompts until a final answer
//! or the round budget runs out, in which case the last assistant response
//! is the stage output.

use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use crate::artifacts::RunWorkspace;
use crate::audit::ToolEvent;
use crate::cancel::CancelHandle;
use crate::catalog::WorkerIdentity;
use crate::engine::config::EngineConfig;
use crate::error::CompletionError;
use crate::exec::{run_command, screen_command, CommandRequest};
use crate::llm::{ChatMessage, CompletionBackend};
use crate::protocol::{parse_worker_action, ParseOutcome, WorkerAction};

/// Why the bridge stopped without producing a stage output.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("run cancelled before the stage completed")]
    Cancelled,

    #[error(transparent)]
    Backend(#[from] CompletionError),
}

/// What one stage invocation produced.
#[derive(Debug, Clone)]
pub struct BridgeOutcome {
    /// The stage output text.
    pub final_text: String,
    /// Every command round, in issue order.
    pub tool_events: Vec<ToolEvent>,
    /// Completion calls made.
    pub rounds: u32,
}

/// Drives worker conversations for the state machine.
pub struct ToolCallBridge<'a> {
    backend: &'a dyn CompletionBackend,
    workspace: &'a RunWorkspace,
    task_id: &'a str,
    max_tool_rounds: u32,
    command_deadline: Duration,
}

impl<'a> ToolCallBridge<'a> {
    pub fn new(
        backend: &'a dyn CompletionBackend,
        workspace: &'a RunWorkspace,
        task_id: &'a str,
        config: &EngineConfig,
    ) -> Self {
        Self {
            backend,
            workspace,
            task_id,
            max_tool_rounds: config.max_tool_rounds,
            command_deadline: config.command_deadline,
        }
    }

    /// Run the tool loop until a final answer, budget exhaustion, or
    /// cancellation. Assistant and result turns are appended to
    /// `conversation` as they happen.
    pub async fn drive(
        &self,
        stage: &str,
        worker: &WorkerIdentity,
        conversation: &mut Vec<ChatMessage>,
        cancel: &CancelHandle,
    ) -> Result<BridgeOutcome, BridgeError> {
        let mut events: Vec<ToolEvent> = Vec::new();
        let mut last_text = String::new();

        for round in 1..=self.max_tool_rounds {
            if cancel.is_cancelled() {
                return Err(BridgeError::Cancelled);
            }

            let text = self.backend.complete(worker, conversation).await?;
            conversation.push(ChatMessage::assistant(&text));
            last_text = text.clone();

            match parse_worker_action(&text) {
                ParseOutcome::Structured(WorkerAction::RunCommand { command, reason })
                | ParseOutcome::Heuristic(WorkerAction::RunCommand { command, reason }) => {
                    debug!(stage, round, reason = %reason, "worker requested a command");
                    let (event, cancelled) =
                        self.execute(events.len() + 1, &command, cancel).await;
                    debug!(
                        stage,
                        round,
                        budget = self.max_tool_rounds,
                        exit_code = event.exit_code,
                        timed_out = event.timed_out,
                        rejected = event.rejected,
                        "tool round finished"
                    );
                    conversation.push(ChatMessage::user(result_feedback(
                        round,
                        self.max_tool_rounds,
                        &event,
                    )));
                    events.push(event);
                    if cancelled {
                        return Err(BridgeError::Cancelled);
                    }
                }
                ParseOutcome::Structured(WorkerAction::Final { content })
                | ParseOutcome::Heuristic(WorkerAction::Final { content }) => {
                    return Ok(BridgeOutcome {
                        final_text: content,
                        tool_events: events,
                        rounds: round,
                    });
                }
                ParseOutcome::Unparseable => {
                    warn!(stage, round, "empty worker response treated as final answer");
                    return Ok(BridgeOutcome {
                        final_text: text.trim().to_string(),
                        tool_events: events,
                        rounds: round,
                    });
                }
            }
        }

        // Budget exhausted: the last assistant response is the stage output.
        debug!(
            stage,
            budget = self.max_tool_rounds,
            "tool round budget exhausted"
        );
        Ok(BridgeOutcome {
            final_text: last_text,
            tool_events: events,
            rounds: self.max_tool_rounds,
        })
    }

    /// Screen and execute one command. Returns the event and whether a
    /// cancellation was observed mid-command.
    async fn execute(
        &self,
        event_index: usize,
        command: &str,
        cancel: &CancelHandle,
    ) -> (ToolEvent, bool) {
        if let Err(veto) = screen_command(command) {
            warn!(command, veto = %veto, "command rejected by guard");
            let event = ToolEvent {
                round: event_index,
                command: command.to_string(),
                exit_code: -1,
                timed_out: false,
                rejected: true,
                output_tail: format!("Command rejected: {}", veto),
            };
            return (event, false);
        }

        let mut request = CommandRequest::new(command, self.workspace.output_dir())
            .with_deadline(self.command_deadline);
        for (key, value) in self.workspace.command_env(self.task_id) {
            request = request.with_env(key, value);
        }

        match run_command(&request, Some(cancel)).await {
            Ok(outcome) => {
                let cancelled = outcome.cancelled;
                let event = ToolEvent {
                    round: event_index,
                    command: command.to_string(),
                    exit_code: outcome.exit_code,
                    timed_out: outcome.timed_out,
                    rejected: false,
                    output_tail: outcome.output,
                };
                (event, cancelled)
            }
            Err(e) => {
                warn!(command, error = %e, "failed to launch command");
                let event = ToolEvent {
                    round: event_index,
                    command: command.to_string(),
                    exit_code: -1,
                    timed_out: false,
                    rejected: false,
                    output_tail: format!("Failed to launch command: {}", e),
                };
                (event, false)
            }
        }
    }
}

/// Conversation turn carrying a command result back to the worker.
fn result_feedback(round: u32, budget: u32, event: &ToolEvent) -> String {
    if event.rejected {
        return format!(
            "[SYSTEM] {}\nPick a safer command or return a final answer.",
            event.output_tail
        );
    }
    format!(
        "[SYSTEM] Command result (round {}/{}): exit_code={} timed_out={}\n{}",
        round, budget, event.exit_code, event.timed_out, event.output_tail
    )
}
