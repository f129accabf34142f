//! Structured payloads exchanged with worker identities.
//!
//! Workers answer in free text that may embed a JSON payload (worker
//! actions, review decisions, dispatch plans). Parsing is best-effort:
//! a well-formed payload is preferred, keyword/shape heuristics recover
//! what they can, and only genuinely empty responses are unparseable.
//! Consumers must handle all three outcomes; none of them aborts a run.

pub mod action;
pub mod dispatch;
pub mod extract;
pub mod review;

pub use action::{parse_worker_action, WorkerAction};
pub use dispatch::{parse_dispatch, DispatchPayload, StageAssignment};
pub use extract::{first_payload, json_objects};
pub use review::{parse_review, DecisionSource, ReviewDecision, Verdict};

/// How a payload was recovered from a worker response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseOutcome<T> {
    /// A well-formed embedded payload was found.
    Structured(T),
    /// No payload; fields recovered by keyword or shape heuristics.
    Heuristic(T),
    /// Nothing recoverable from the response.
    Unparseable,
}

impl<T> ParseOutcome<T> {
    pub fn is_structured(&self) -> bool {
        matches!(self, ParseOutcome::Structured(_))
    }

    /// The recovered value, if any, discarding how it was obtained.
    pub fn into_option(self) -> Option<T> {
        match self {
            ParseOutcome::Structured(v) | ParseOutcome::Heuristic(v) => Some(v),
            ParseOutcome::Unparseable => None,
        }
    }
}
