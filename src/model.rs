// src/model.rs
//
// =============================================================================
// MARLIN-SUPER: DATA MODEL (§3)
// =============================================================================
//
// The durable record shapes shared with the MDS, plus the transient
// locate-response type. Field names here are part of the wire contract
// (§6) and must not be renamed casually.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque, user-assigned job identifier. Kept as a plain string since the
/// MDS treats it as an opaque key, not a UUID (§3).
pub type JobId = String;

/// One stage of a job. Opaque to the supervisor beyond its position in
/// `phases` — the agent interprets its contents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Phase(pub serde_json::Value);

/// Coarse job status (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobRecordState {
    Unassigned,
    Running,
    Done,
}

/// The durable job record, keyed by `jobId` (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    #[serde(rename = "jobId")]
    pub job_id: JobId,

    /// Ordered, non-empty sequence of phase descriptors.
    pub phases: Vec<Phase>,

    /// Ordered sequence of object keys supplying phase 0.
    #[serde(rename = "inputKeys")]
    pub input_keys: Vec<String>,

    /// Supervisor identity currently owning the job. Absent ⇒ unassigned.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,

    /// Last-update timestamp maintained by the owning supervisor, in ms
    /// since the Unix epoch (matches the orchestrator's `updated_at_ms`
    /// convention in `checkpoint.rs`).
    pub mtime: i64,

    pub state: JobRecordState,

    /// User-visible failure explanation once a job reaches `Done` via a
    /// fatal outcome (§7).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<String>,
}

impl JobRecord {
    /// Copy of the record with `worker` set to `self`, per §9's note that
    /// the candidate and stored record must never share mutable state.
    pub fn with_worker(&self, worker: impl Into<String>) -> Self {
        let mut candidate = self.clone();
        candidate.worker = Some(worker.into());
        candidate
    }
}

/// Outcome of executing one key within a task group (§3).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskResultKind {
    Ok,
    Fail,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub key: String,
    pub result: TaskResultKind,
    #[serde(default)]
    pub outputs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskGroupState {
    Dispatched,
    Running,
    Done,
}

/// Durable task-group record, keyed by `taskGroupId` (§3, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskGroupRecord {
    #[serde(rename = "jobId")]
    pub job_id: JobId,
    #[serde(rename = "taskGroupId")]
    pub task_group_id: Uuid,
    #[serde(rename = "phaseNum")]
    pub phase_num: usize,
    pub host: String,

    #[serde(rename = "inputKeys")]
    pub input_keys: Vec<String>,

    /// Phase descriptor copied from the job at creation time, so the agent
    /// can execute without the job record (§3).
    pub phase: Phase,

    pub state: TaskGroupState,

    #[serde(default)]
    pub results: Vec<TaskResult>,
}

impl TaskGroupRecord {
    /// Invariant 3 (§3): a task group whose phase exceeds the job's phase
    /// count is malformed.
    pub fn is_in_range(&self, phase_count: usize) -> bool {
        self.phase_num < phase_count
    }

    /// A phase is complete for this group when every result is a terminal
    /// outcome and the group itself reports `done` (§4.3.3).
    pub fn is_done_and_all_ok(&self) -> bool {
        self.state == TaskGroupState::Done
            && self
                .results
                .iter()
                .all(|r| r.result == TaskResultKind::Ok)
    }

    pub fn has_any_failure(&self) -> bool {
        self.state == TaskGroupState::Done
            && self
                .results
                .iter()
                .any(|r| r.result == TaskResultKind::Fail)
    }
}

/// Transient response from the locate service: `key -> [host]` in
/// preference order, first preferred. An empty list means unlocatable (§3).
#[derive(Debug, Clone, Default)]
pub struct LocateResponse {
    pub hosts_by_key: std::collections::HashMap<String, Vec<String>>,
}

impl LocateResponse {
    pub fn hosts_for(&self, key: &str) -> &[String] {
        self.hosts_by_key
            .get(key)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}
