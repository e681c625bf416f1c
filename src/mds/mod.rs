// src/mds/mod.rs
//
// =============================================================================
// MARLIN-SUPER: MDS GATEWAY (§4.1)
// =============================================================================
//
// The single typed facade over the metadata store. Everything the
// supervisor and planner know about durability goes through this trait —
// the core is tested against `memory::InMemoryMds` and deployed against
// `sqlite::SqliteMds`.

pub mod memory;
pub mod sqlite;

use crate::error::MdsError;
use crate::model::{JobRecord, TaskGroupRecord};
use async_trait::async_trait;

/// A lazy, restartable stream of task-group change notifications for one
/// job (§4.1 `watchTaskGroups`). The supervisor polls this once per tick
/// while the job is RUNNING; it is not a push subscription.
#[async_trait]
pub trait TaskGroupWatch: Send {
    /// Returns task-group records that changed since the last poll
    /// (inclusive of the first poll, which returns every record that
    /// existed when the watch was created).
    async fn poll(&mut self) -> Result<Vec<TaskGroupRecord>, MdsError>;
}

/// Per-record outcome of a bulk `saveTaskGroups` call (§4.1: "partial
/// success surfaces per-record outcomes").
#[derive(Debug)]
pub struct SaveOutcome {
    pub task_group_id: uuid::Uuid,
    pub outcome: Result<(), MdsError>,
}

#[async_trait]
pub trait MdsGateway: Send + Sync {
    /// Scans for job records with no `worker`, or whose `mtime` is older
    /// than the configured staleness threshold. Idempotent; may over-report.
    /// Emits no events itself — the caller (Supervisor) turns each returned
    /// record into an `onJob` event.
    async fn find_unassigned_jobs(&self) -> Result<Vec<JobRecord>, MdsError>;

    /// Conditional write: succeeds only if the stored `worker` equals
    /// `expected_worker`. On success, atomically sets `worker` and
    /// refreshes `mtime`, returning the stored record. `Conflict` if
    /// another supervisor won the race; `Transient` on store unavailability.
    async fn assign_job(
        &self,
        candidate: &JobRecord,
        expected_worker: Option<&str>,
    ) -> Result<JobRecord, MdsError>;

    /// Refreshes `mtime` on a job this supervisor owns. `Conflict` if
    /// `worker` no longer matches (lock lost).
    async fn heartbeat(&self, job_id: &str, worker: &str) -> Result<(), MdsError>;

    /// Ordered sequence of task-group records for the job. Restartable;
    /// may include records later superseded.
    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroupRecord>, MdsError>;

    /// Writes new task-group records. A create fails with `Conflict` for
    /// that record if the `taskGroupId` already exists.
    async fn save_task_groups(&self, groups: &[TaskGroupRecord]) -> Vec<SaveOutcome>;

    /// Opens a restartable watch over a job's task groups.
    async fn watch_task_groups(
        &self,
        job_id: &str,
    ) -> Result<Box<dyn TaskGroupWatch>, MdsError>;
}

/// Schema validation at the gateway boundary (§9: "this specification
/// requires schema validation... rejecting malformed records as Validation
/// errors"). Called by gateway implementations on every record read back
/// from storage, never on records about to be written (writers are
/// trusted to have built valid records via `model`).
pub fn validate_job_record(record: &JobRecord) -> Result<(), MdsError> {
    if record.phases.is_empty() {
        return Err(MdsError::Validation(format!(
            "job {} has empty phases",
            record.job_id
        )));
    }
    Ok(())
}

/// Invariants 3 and 4 (§3): out-of-range `phaseNum` and duplicate
/// `taskGroupId` records are dropped, not fatal. Returns the filtered,
/// deduplicated list plus a count of how many were dropped (for logging).
pub fn filter_valid_task_groups(
    records: Vec<TaskGroupRecord>,
    phase_count: usize,
) -> (Vec<TaskGroupRecord>, usize) {
    use std::collections::HashSet;

    let mut seen = HashSet::new();
    let mut dropped = 0;
    let mut kept = Vec::with_capacity(records.len());

    for record in records {
        if !record.is_in_range(phase_count) {
            log::warn!(
                "dropping task group {} for job {}: phaseNum {} out of range ({} phases)",
                record.task_group_id,
                record.job_id,
                record.phase_num,
                phase_count
            );
            dropped += 1;
            continue;
        }
        if record.input_keys.is_empty() {
            log::warn!(
                "dropping task group {}: empty inputKeys",
                record.task_group_id
            );
            dropped += 1;
            continue;
        }
        if !seen.insert(record.task_group_id) {
            log::warn!(
                "dropping duplicate task group id {}",
                record.task_group_id
            );
            dropped += 1;
            continue;
        }
        kept.push(record);
    }

    (kept, dropped)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Phase, TaskGroupRecord, TaskGroupState};

    fn group(phase_num: usize, id: uuid::Uuid, keys: Vec<&str>) -> TaskGroupRecord {
        TaskGroupRecord {
            job_id: "job-1".into(),
            task_group_id: id,
            phase_num,
            host: "hA".into(),
            input_keys: keys.into_iter().map(String::from).collect(),
            phase: Phase(serde_json::json!({})),
            state: TaskGroupState::Dispatched,
            results: vec![],
        }
    }

    #[test]
    fn drops_out_of_range_and_duplicate_groups() {
        let id1 = uuid::Uuid::new_v4();
        let records = vec![
            group(0, id1, vec!["k1"]),
            group(5, uuid::Uuid::new_v4(), vec!["k2"]), // out of range
            group(0, id1, vec!["k1"]),                  // duplicate id
            group(0, uuid::Uuid::new_v4(), vec![]),     // empty inputKeys
        ];

        let (kept, dropped) = filter_valid_task_groups(records, 2);
        assert_eq!(kept.len(), 1);
        assert_eq!(dropped, 3);
    }
}
