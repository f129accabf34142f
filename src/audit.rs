//! Run-level audit trail.
//!
//! One immutable record per stage execution, including skipped and
//! gate-rejected ones, accumulated in memory and serialized exactly once at
//! run termination. Nothing partial ever reaches disk, so the audit file is
//! internally consistent whenever it exists. Keys are camelCase to match
//! the audit documents the surrounding tooling already consumes.

use std::collections::BTreeMap;
use std::io;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::catalog::{AcceptanceContract, StageKind};
use crate::protocol::ReviewDecision;

/// One requested command execution within a stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    /// 1-based tool round within the stage invocation.
    pub round: usize,
    pub command: String,
    pub exit_code: i32,
    pub timed_out: bool,
    /// Denylist rejections never reach the process runner.
    #[serde(default)]
    pub rejected: bool,
    /// Tail of the combined output fed back to the worker.
    pub output_tail: String,
}

/// How a stage execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageDisposition {
    /// Passed its gate (or had none) and the cursor moved on.
    Advanced,
    /// Local gate failed; the same stage runs again.
    Retried,
    /// Pipeline gate failed; the cursor jumped backward.
    ReworkTriggered,
    /// Inactive stage, no worker invoked.
    Skipped,
    /// Dispatch stage whose plan was applied to the routing overlay.
    DispatchApplied,
    /// The run terminated on this execution (ceiling or configuration).
    Failed,
    /// The run observed its stop signal during this execution.
    Cancelled,
}

impl std::fmt::Display for StageDisposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StageDisposition::Advanced => "advanced",
            StageDisposition::Retried => "retried",
            StageDisposition::ReworkTriggered => "rework_triggered",
            StageDisposition::Skipped => "skipped",
            StageDisposition::DispatchApplied => "dispatch_applied",
            StageDisposition::Failed => "failed",
            StageDisposition::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Immutable record of one stage execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageAuditRecord {
    pub stage: String,
    pub kind: StageKind,
    /// 1-based attempt counter for this stage name.
    pub attempt: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub disposition: StageDisposition,
    #[serde(default)]
    pub tool_events: Vec<ToolEvent>,
    /// Collision (challenge/revise) rounds run before the gate.
    #[serde(default)]
    pub collision_rounds: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub decision: Option<ReviewDecision>,
    /// New non-system files under the output directory after this stage.
    #[serde(default)]
    pub produced_files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_document: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
}

impl StageAuditRecord {
    /// Open a record at invocation time; [`finish`](Self::finish) seals it.
    pub fn begin(stage: impl Into<String>, kind: StageKind, attempt: u32) -> Self {
        let now = Utc::now();
        Self {
            stage: stage.into(),
            kind,
            attempt,
            worker: None,
            started_at: now,
            finished_at: now,
            duration_ms: 0,
            disposition: StageDisposition::Advanced,
            tool_events: Vec::new(),
            collision_rounds: 0,
            decision: None,
            produced_files: Vec::new(),
            step_document: None,
            skip_reason: None,
        }
    }

    /// Seal the record with its disposition and timing.
    pub fn finish(mut self, disposition: StageDisposition) -> Self {
        self.finished_at = Utc::now();
        self.duration_ms = (self.finished_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.disposition = disposition;
        self
    }

    /// Record for a stage that was skipped without invoking a worker.
    pub fn skipped(
        stage: impl Into<String>,
        kind: StageKind,
        reason: impl Into<String>,
    ) -> Self {
        let mut record = Self::begin(stage, kind, 0);
        record.skip_reason = Some(reason.into());
        record.finish(StageDisposition::Skipped)
    }
}

/// Ceilings in force for a run, kept in the audit for diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditCeilings {
    pub stage_retries: u32,
    pub rework_rounds: u32,
    pub iteration_ceiling: u32,
    pub tool_rounds: u32,
    pub collision_rounds_max: u32,
}

/// The run's permanent audit artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunAudit {
    pub run_id: String,
    pub task_id: String,
    pub workflow_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ceilings: AuditCeilings,
    pub rework_rounds_used: u32,
    pub stages: Vec<StageAuditRecord>,
    /// Final stage→worker map after all dispatch overlays.
    pub assignments: BTreeMap<String, String>,
    pub active_stages: Vec<String>,
    pub skipped_stages: Vec<String>,
    pub acceptance_contract: AcceptanceContract,
    pub status: String,
    pub return_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

impl RunAudit {
    /// Serialize once, atomically: write a sibling temp file, then rename
    /// into place.
    pub fn write_atomic<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        let body = serde_json::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        let mut file = tempfile::NamedTempFile::new_in(parent)?;
        io::Write::write_all(&mut file, body.as_bytes())?;
        file.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Append-only in-memory ledger for one run.
#[derive(Debug)]
pub struct AuditTrail {
    run_id: String,
    task_id: String,
    workflow_id: String,
    started_at: DateTime<Utc>,
    ceilings: AuditCeilings,
    records: Vec<StageAuditRecord>,
}

impl AuditTrail {
    pub fn new(
        run_id: impl Into<String>,
        task_id: impl Into<String>,
        workflow_id: impl Into<String>,
        ceilings: AuditCeilings,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            workflow_id: workflow_id.into(),
            started_at: Utc::now(),
            ceilings,
            records: Vec::new(),
        }
    }

    pub fn append(&mut self, record: StageAuditRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[StageAuditRecord] {
        &self.records
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Latest gate reason on record, for run-terminating diagnostics.
    pub fn last_gate_reason(&self) -> Option<String> {
        self.records
            .iter()
            .rev()
            .find_map(|r| r.decision.as_ref().map(|d| d.reason.clone()))
    }

    /// Seal the ledger into the permanent audit artifact.
    #[allow(clippy::too_many_arguments)]
    pub fn finalize(
        self,
        rework_rounds_used: u32,
        assignments: BTreeMap<String, String>,
        active_stages: Vec<String>,
        skipped_stages: Vec<String>,
        acceptance_contract: AcceptanceContract,
        status: impl Into<String>,
        return_code: i32,
        failure_reason: Option<String>,
    ) -> RunAudit {
        RunAudit {
            run_id: self.run_id,
            task_id: self.task_id,
            workflow_id: self.workflow_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            ceilings: self.ceilings,
            rework_rounds_used,
            stages: self.records,
            assignments,
            active_stages,
            skipped_stages,
            acceptance_contract,
            status: status.into(),
            return_code,
            failure_reason,
        }
    }
}
