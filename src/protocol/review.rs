//! Reviewer decision payloads and keyword fallback.

use serde::{Deserialize, Serialize};

use super::{extract, ParseOutcome};

/// Reviewer verdict over a stage output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    /// The reviewer gave no usable signal either way.
    Unknown,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Unknown => "UNKNOWN",
        };
        write!(f, "{}", s)
    }
}

/// How a decision was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionSource {
    /// Parsed from an embedded decision payload.
    Structured,
    /// Recovered from accept/reject vocabulary in free text.
    Heuristic,
    /// Produced by a deterministic engine rule, no reviewer consulted.
    AutoFail,
}

/// One gate decision. Produced fresh per evaluation, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewDecision {
    pub verdict: Verdict,
    pub reason: String,
    #[serde(default)]
    pub issues: Vec<String>,
    /// Role the reviewer blames; rework jumps target its latest stage.
    #[serde(default)]
    pub send_back_role: Option<String>,
    #[serde(default)]
    pub rework_instructions: String,
    pub source: DecisionSource,
}

impl ReviewDecision {
    pub fn pass(reason: impl Into<String>, source: DecisionSource) -> Self {
        Self {
            verdict: Verdict::Pass,
            reason: reason.into(),
            issues: Vec::new(),
            send_back_role: None,
            rework_instructions: String::new(),
            source,
        }
    }

    pub fn fail(reason: impl Into<String>, source: DecisionSource) -> Self {
        Self {
            verdict: Verdict::Fail,
            reason: reason.into(),
            issues: Vec::new(),
            send_back_role: None,
            rework_instructions: String::new(),
            source,
        }
    }

    pub fn is_fail(&self) -> bool {
        self.verdict == Verdict::Fail
    }
}

/// Wire shape: `{"decision": "PASS"|"FAIL", "reason": .., "issues": [..],
/// "send_back_role": .., "rework_instructions": ..}`.
#[derive(Debug, Deserialize)]
struct ReviewPayload {
    decision: String,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    issues: Vec<String>,
    #[serde(default)]
    send_back_role: Option<String>,
    #[serde(default)]
    rework_instructions: String,
}

// Rejection vocabulary is checked before acceptance: "不通过" contains
// "通过" and "did not pass" contains "pass".
const REJECT_MARKERS: &[&str] = &[
    "fail", "reject", "not pass", "不通过", "不合格", "驳回", "拒绝", "返工", "退回",
];
const ACCEPT_MARKERS: &[&str] = &[
    "pass", "approve", "lgtm", "accept", "通过", "合格", "没有问题", "没问题",
];

fn verdict_from_keyword(text: &str) -> Option<Verdict> {
    let lower = text.to_lowercase();
    if REJECT_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(Verdict::Fail);
    }
    if ACCEPT_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(Verdict::Pass);
    }
    None
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

/// Parse a reviewer response into a decision.
pub fn parse_review(text: &str) -> ParseOutcome<ReviewDecision> {
    if let Some(payload) = extract::first_payload::<ReviewPayload>(text) {
        let verdict = match verdict_from_keyword(&payload.decision) {
            Some(v) => v,
            None => Verdict::Unknown,
        };
        let reason = if payload.reason.trim().is_empty() {
            first_line(text)
        } else {
            payload.reason
        };
        return ParseOutcome::Structured(ReviewDecision {
            verdict,
            reason,
            issues: payload.issues,
            send_back_role: payload.send_back_role.filter(|r| !r.trim().is_empty()),
            rework_instructions: payload.rework_instructions,
            source: DecisionSource::Structured,
        });
    }

    let verdict = match verdict_from_keyword(text) {
        Some(v) => v,
        None if text.trim().is_empty() => return ParseOutcome::Unparseable,
        None => Verdict::Unknown,
    };
    ParseOutcome::Heuristic(ReviewDecision {
        verdict,
        reason: first_line(text),
        issues: Vec::new(),
        send_back_role: None,
        rework_instructions: String::new(),
        source: DecisionSource::Heuristic,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_structured_fail_with_blame() {
        let text = r#"Review complete.
{"decision": "FAIL", "reason": "missing evidence", "issues": ["no data cited"], "send_back_role": "implementer", "rework_instructions": "cite the collected data"}"#;
        match parse_review(text) {
            ParseOutcome::Structured(d) => {
                assert_eq!(d.verdict, Verdict::Fail);
                assert_eq!(d.reason, "missing evidence");
                assert_eq!(d.issues, vec!["no data cited".to_string()]);
                assert_eq!(d.send_back_role.as_deref(), Some("implementer"));
                assert_eq!(d.source, DecisionSource::Structured);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_structured_pass_without_reason_uses_first_line() {
        let text = "Looks solid overall.\n{\"decision\": \"PASS\"}";
        match parse_review(text) {
            ParseOutcome::Structured(d) => {
                assert_eq!(d.verdict, Verdict::Pass);
                assert_eq!(d.reason, "Looks solid overall.");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_chinese_decision_values() {
        match parse_review(r#"{"decision": "不通过", "reason": "数据不足"}"#) {
            ParseOutcome::Structured(d) => assert_eq!(d.verdict, Verdict::Fail),
            other => panic!("unexpected outcome: {:?}", other),
        }
        match parse_review(r#"{"decision": "通过"}"#) {
            ParseOutcome::Structured(d) => assert_eq!(d.verdict, Verdict::Pass),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_keyword_fallback_rejection_beats_acceptance() {
        match parse_review("结论:不通过,需要补充来源。") {
            ParseOutcome::Heuristic(d) => {
                assert_eq!(d.verdict, Verdict::Fail);
                assert_eq!(d.source, DecisionSource::Heuristic);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        match parse_review("The work did not pass review.") {
            ParseOutcome::Heuristic(d) => assert_eq!(d.verdict, Verdict::Fail),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_keyword_fallback_acceptance() {
        match parse_review("LGTM, ship it.") {
            ParseOutcome::Heuristic(d) => {
                assert_eq!(d.verdict, Verdict::Pass);
                assert_eq!(d.reason, "LGTM, ship it.");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_no_signal_is_unknown() {
        match parse_review("I have some thoughts about the weather.") {
            ParseOutcome::Heuristic(d) => assert_eq!(d.verdict, Verdict::Unknown),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_empty_text_is_unparseable() {
        assert!(matches!(parse_review("  \n"), ParseOutcome::Unparseable));
    }

    #[test]
    fn test_blank_send_back_role_dropped() {
        let text = r#"{"decision": "FAIL", "send_back_role": "  "}"#;
        match parse_review(text) {
            ParseOutcome::Structured(d) => assert!(d.send_back_role.is_none()),
            other => panic!("unexpected outcome: {:?}", other),
        }
    }
}
