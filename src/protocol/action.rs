//! Worker action payloads: request a command, or declare a final answer.

use serde::Deserialize;

use super::{extract, ParseOutcome};

/// What a worker asked the engine to do with its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerAction {
    /// Execute a shell command in the run's working directory.
    RunCommand { command: String, reason: String },
    /// The worker is done; `content` is the stage output.
    Final { content: String },
}

/// Wire shape: `{"action": "run_command", ...}` / `{"action": "final", ...}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum ActionPayload {
    RunCommand {
        command: String,
        #[serde(default)]
        reason: String,
    },
    Final {
        #[serde(default)]
        content: String,
    },
}

/// Parse a worker response into an action.
///
/// A response with no embedded payload is the final answer by convention
/// (heuristic outcome); only an empty response is unparseable.
pub fn parse_worker_action(text: &str) -> ParseOutcome<WorkerAction> {
    if let Some(payload) = extract::first_payload::<ActionPayload>(text) {
        let action = match payload {
            ActionPayload::RunCommand { command, reason } => {
                WorkerAction::RunCommand { command, reason }
            }
            ActionPayload::Final { content } => {
                // An empty "final" payload still ends the loop; fall back to
                // the surrounding prose as the answer body.
                let content = if content.trim().is_empty() {
                    text.trim().to_string()
                } else {
                    content
                };
                WorkerAction::Final { content }
            }
        };
        return ParseOutcome::Structured(action);
    }

    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParseOutcome::Unparseable;
    }
    ParseOutcome::Heuristic(WorkerAction::Final {
        content: trimmed.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run_command() {
        let text = r#"{"action": "run_command", "command": "ls -la", "reason": "inspect workdir"}"#;
        match parse_worker_action(text) {
            ParseOutcome::Structured(WorkerAction::RunCommand { command, reason }) => {
                assert_eq!(command, "ls -la");
                assert_eq!(reason, "inspect workdir");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_parse_final_with_content() {
        let text = "Summary below.\n```json\n{\"action\": \"final\", \"content\": \"all done\"}\n```";
        match parse_worker_action(text) {
            ParseOutcome::Structured(WorkerAction::Final { content }) => {
                assert_eq!(content, "all done");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_final_with_empty_content_uses_surrounding_text() {
        let text = "The answer is 42.\n{\"action\": \"final\"}";
        match parse_worker_action(text) {
            ParseOutcome::Structured(WorkerAction::Final { content }) => {
                assert!(content.contains("42"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_plain_prose_is_heuristic_final() {
        match parse_worker_action("Everything checks out; we are finished.") {
            ParseOutcome::Heuristic(WorkerAction::Final { content }) => {
                assert!(content.starts_with("Everything"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_run_command_missing_command_field_degrades() {
        // Tagged but malformed: no command to run, so the text is treated
        // as a final answer rather than aborting the round.
        let text = r#"{"action": "run_command", "reason": "forgot the command"}"#;
        match parse_worker_action(text) {
            ParseOutcome::Heuristic(WorkerAction::Final { .. }) => {}
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_empty_response_is_unparseable() {
        assert_eq!(parse_worker_action(""), ParseOutcome::Unparseable);
        assert_eq!(parse_worker_action("   \n "), ParseOutcome::Unparseable);
    }

    #[test]
    fn test_unrelated_json_is_heuristic_final() {
        let text = r#"Result data: {"count": 3}"#;
        match parse_worker_action(text) {
            ParseOutcome::Heuristic(WorkerAction::Final { content }) => {
                assert!(content.contains("count"));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
