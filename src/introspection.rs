// src/introspection.rs
//
// =============================================================================
// MARLIN-SUPER: INTROSPECTION SURFACE (§4.5)
// =============================================================================
//
// A flat, read-only snapshot keyed by kind and identifier. Grounded on
// `checkpoint.rs`'s read API (`get_jobs_summary`, `get_active_workers`) —
// the same idea of a decoupled, lock-free read model for operators and
// tests — but simplified to an in-memory copy since there is no TUI here
// (§9: "Global singleton supervisor used by the introspection surface in
// the source is an artifact; pass the supervisor handle explicitly").

use serde::Serialize;

use crate::job::JobMachineState;

#[derive(Debug, Clone, Serialize)]
pub struct JobSnapshotView {
    pub job_id: String,
    pub state: String,
    pub phase_index: usize,
    pub phase_count: usize,
    pub pending_op: bool,
    pub unassigned_key_count: usize,
    /// Keys the locate service could not place on any host during the
    /// current phase (§4.4 step 4); excluded from task groups but not
    /// fatal.
    pub unlocatable_key_count: usize,
    pub consecutive_transient_failures: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshotView {
    pub uuid: String,
    pub owned_job_count: usize,
    pub owned_job_cap: usize,
    pub uptime_secs: u64,
}

/// The `{worker, jobs}` read-only types named in §6. A snapshot is a copy;
/// no locks are held once this struct exists.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub worker: WorkerSnapshotView,
    pub jobs: Vec<JobSnapshotView>,
}

impl Snapshot {
    pub fn job(&self, job_id: &str) -> Option<&JobSnapshotView> {
        self.jobs.iter().find(|j| j.job_id == job_id)
    }
}

pub fn state_name(state: JobMachineState) -> &'static str {
    match state {
        JobMachineState::Unassigned => "unassigned",
        JobMachineState::Uninitialized => "uninitialized",
        JobMachineState::Planning => "planning",
        JobMachineState::Running => "running",
        JobMachineState::Done => "done",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_name_covers_every_variant() {
        for (state, name) in [
            (JobMachineState::Unassigned, "unassigned"),
            (JobMachineState::Uninitialized, "uninitialized"),
            (JobMachineState::Planning, "planning"),
            (JobMachineState::Running, "running"),
            (JobMachineState::Done, "done"),
        ] {
            assert_eq!(state_name(state), name);
        }
    }
}
