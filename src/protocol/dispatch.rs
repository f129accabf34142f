//! Dispatch-plan payloads produced by the lead identity.

use serde::Deserialize;
use serde_json::Value;

use crate::catalog::AcceptanceContract;

use super::{extract, ParseOutcome};

/// One stage→worker reassignment.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StageAssignment {
    pub stage: String,
    pub role: String,
}

/// Wire shape: `{"assignments": [{"stage","role"}], "active_stages": [..],
/// "skip_stages": [..], "acceptance_contract": {..}, "collision_rounds": n}`.
///
/// Every field is optional; an absent field means "no change".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DispatchPayload {
    #[serde(default)]
    pub assignments: Vec<StageAssignment>,
    #[serde(default)]
    pub active_stages: Vec<String>,
    #[serde(default)]
    pub skip_stages: Vec<String>,
    #[serde(default)]
    pub acceptance_contract: Option<AcceptanceContract>,
    #[serde(default)]
    pub collision_rounds: Option<u32>,
}

const DISPATCH_KEYS: &[&str] = &[
    "assignments",
    "active_stages",
    "skip_stages",
    "acceptance_contract",
    "collision_rounds",
];

fn looks_like_dispatch(value: &Value) -> bool {
    value
        .as_object()
        .map(|map| DISPATCH_KEYS.iter().any(|k| map.contains_key(*k)))
        .unwrap_or(false)
}

/// Parse the lead's planning response.
///
/// Since every payload field defaults, a bare `{}` would deserialize too;
/// only objects carrying at least one recognized key count as a plan. Prose
/// without a plan degrades to an empty payload, which applies as a no-op.
pub fn parse_dispatch(text: &str) -> ParseOutcome<DispatchPayload> {
    for value in extract::json_objects(text) {
        if !looks_like_dispatch(&value) {
            continue;
        }
        if let Ok(payload) = serde_json::from_value::<DispatchPayload>(value) {
            return ParseOutcome::Structured(payload);
        }
    }

    if text.trim().is_empty() {
        return ParseOutcome::Unparseable;
    }
    ParseOutcome::Heuristic(DispatchPayload::default())
}
