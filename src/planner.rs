// src/planner.rs
//
// =============================================================================
// MARLIN-SUPER: PHASE PLANNER (§4.4)
// =============================================================================
//
// taskGroupAssign, entered in PLANNING. Grounded on `marketplace.rs`'s
// `schedule_work` (partition work by capacity, batch the grants) and
// `workflow.rs`'s `add_smart_node` (insert-if-not-already-present against
// an identity computed from the record, making re-entry idempotent).

use std::collections::{HashMap, HashSet};

use uuid::Uuid;

use crate::locate::LocateService;
use crate::mds::MdsGateway;
use crate::model::{JobRecord, Phase, TaskGroupRecord, TaskGroupState, TaskResultKind};

/// Everything the planner needs about the current phase's slot, passed by
/// value since the caller has already dropped its lock before awaiting.
#[derive(Clone, Default)]
pub struct PlannerInput {
    pub phase_num: usize,
    pub phase: Phase,
    pub input: Vec<String>,
    pub existing_groups: HashMap<Uuid, TaskGroupRecord>,
}

pub struct PlannerOutput {
    pub input: Vec<String>,
    pub new_groups: HashMap<Uuid, TaskGroupRecord>,
    pub unassigned_keys: HashSet<String>,
    pub unlocatable: Vec<String>,
    pub advance_to_running: bool,
}

/// Step 1: resolve the phase's input key set, only when the slot hasn't
/// been populated yet (an empty `groups` map plus empty `input` is how the
/// supervisor represents "never entered this phase").
pub fn resolve_input(
    phase_num: usize,
    existing_input: &[String],
    job: &JobRecord,
    prior_phase_groups: &[TaskGroupRecord],
) -> Vec<String> {
    if !existing_input.is_empty() {
        return existing_input.to_vec();
    }
    if phase_num == 0 {
        return job.input_keys.clone();
    }
    let mut out = Vec::new();
    for group in prior_phase_groups {
        for result in &group.results {
            if result.result == TaskResultKind::Ok {
                out.extend(result.outputs.iter().cloned());
            }
        }
    }
    out
}

/// Step 2 (also Invariant 5, §3/§8): recomputed on every entry, since a
/// prior entry into this function may have persisted new groups.
pub fn unassigned_keys(input: &[String], groups: &HashMap<Uuid, TaskGroupRecord>) -> HashSet<String> {
    let assigned: HashSet<&String> = groups.values().flat_map(|g| g.input_keys.iter()).collect();
    input
        .iter()
        .filter(|k| !assigned.contains(k))
        .cloned()
        .collect()
}

/// Runs one planner entry end to end: locate, partition, persist. Returns
/// the resolved input/groups/unassigned set and whether the phase is fully
/// assigned (§4.4 step 6). `job_id` identifies the job for the new records;
/// `existing_groups` must already reflect every group persisted so far for
/// this phase (steps 2's subtraction is only correct against the full set).
pub async fn task_group_assign(
    gateway: &dyn MdsGateway,
    locate: &dyn LocateService,
    job_id: &str,
    input: PlannerInput,
) -> Result<PlannerOutput, crate::error::MdsError> {
    let unassigned = unassigned_keys(&input.input, &input.existing_groups);

    if unassigned.is_empty() {
        return Ok(PlannerOutput {
            input: input.input,
            new_groups: HashMap::new(),
            unassigned_keys: unassigned,
            unlocatable: Vec::new(),
            advance_to_running: true,
        });
    }

    // Step 3 — locate. A stable, sorted order keeps planning deterministic
    // across restarts for the same durable state (useful for tests).
    let mut keys: Vec<String> = unassigned.iter().cloned().collect();
    keys.sort();
    let located = locate.locate(&keys).await;

    // Step 4 — partition by first preferred host.
    let mut by_host: HashMap<String, Vec<String>> = HashMap::new();
    let mut unlocatable = Vec::new();
    for key in &keys {
        match located.hosts_for(key).first() {
            Some(host) => by_host.entry(host.clone()).or_default().push(key.clone()),
            None => unlocatable.push(key.clone()),
        }
    }

    let mut new_groups = HashMap::new();
    let mut to_persist = Vec::new();
    for (host, host_keys) in by_host {
        let group = TaskGroupRecord {
            job_id: job_id.to_string(),
            task_group_id: Uuid::new_v4(),
            phase_num: input.phase_num,
            host,
            input_keys: host_keys,
            phase: input.phase.clone(),
            state: TaskGroupState::Dispatched,
            results: Vec::new(),
        };
        to_persist.push(group);
    }

    // Step 5 — persist. A UUID collision with an existing id is impossible
    // and would indicate a broken UUID source; log loudly rather than panic.
    let outcomes = gateway.save_task_groups(&to_persist).await;
    for (group, outcome) in to_persist.into_iter().zip(outcomes) {
        match outcome.outcome {
            Ok(()) => {
                new_groups.insert(group.task_group_id, group);
            }
            Err(e) if e.is_conflict() => {
                log::error!(
                    "impossible: fresh task group {} collided on create: {e}",
                    group.task_group_id
                );
            }
            Err(e) => {
                log::warn!("failed to persist task group {}: {e}", group.task_group_id);
            }
        }
    }

    let mut merged = input.existing_groups;
    merged.extend(new_groups.clone());
    let remaining = unassigned_keys(&input.input, &merged);
    // Keys with an empty host list are removed from `unassignedKeys` either
    // way (§4.4 step 4); they never get a task group.
    let remaining: HashSet<String> = remaining
        .into_iter()
        .filter(|k| !unlocatable.contains(k))
        .collect();

    Ok(PlannerOutput {
        input: input.input,
        advance_to_running: remaining.is_empty(),
        new_groups,
        unassigned_keys: remaining,
        unlocatable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::StaticLocate;
    use crate::mds::memory::InMemoryMds;
    use crate::model::{TaskResult, TaskResultKind};

    fn job(input_keys: Vec<&str>) -> JobRecord {
        crate::mds::memory::fresh_job("job-1", input_keys, 1)
    }

    #[test]
    fn resolves_phase_zero_input_from_job_record() {
        let j = job(vec!["k1", "k2"]);
        let resolved = resolve_input(0, &[], &j, &[]);
        assert_eq!(resolved, vec!["k1".to_string(), "k2".to_string()]);
    }

    #[test]
    fn resolves_later_phase_input_from_prior_ok_results() {
        let g = TaskGroupRecord {
            job_id: "job-1".into(),
            task_group_id: Uuid::new_v4(),
            phase_num: 0,
            host: "hA".into(),
            input_keys: vec!["k1".into()],
            phase: Phase(serde_json::json!({})),
            state: TaskGroupState::Done,
            results: vec![
                TaskResult {
                    key: "k1".into(),
                    result: TaskResultKind::Ok,
                    outputs: vec!["o1".into(), "o2".into()],
                },
            ],
        };
        let resolved = resolve_input(1, &[], &job(vec![]), std::slice::from_ref(&g));
        assert_eq!(resolved, vec!["o1".to_string(), "o2".to_string()]);
    }

    #[tokio::test]
    async fn idempotent_reentry_assigns_only_missing_keys() {
        let gateway = InMemoryMds::default();
        let mut locate = StaticLocate::empty();
        locate.insert("k1", vec!["hA".into()]);
        locate.insert("k2", vec!["hA".into()]);
        locate.insert("k3", vec!["hB".into()]);

        let first = task_group_assign(
            &gateway,
            &locate,
            "job-1",
            PlannerInput {
                phase_num: 0,
                phase: Phase(serde_json::json!({})),
                input: vec!["k1".into(), "k2".into(), "k3".into()],
                existing_groups: HashMap::new(),
            },
        )
        .await
        .unwrap();
        assert!(first.advance_to_running);
        assert_eq!(first.new_groups.len(), 2);

        // Re-entry with the same durable groups should produce no new writes.
        let second = task_group_assign(
            &gateway,
            &locate,
            "job-1",
            PlannerInput {
                phase_num: 0,
                phase: Phase(serde_json::json!({})),
                input: vec!["k1".into(), "k2".into(), "k3".into()],
                existing_groups: first.new_groups.clone(),
            },
        )
        .await
        .unwrap();
        assert!(second.new_groups.is_empty());
        assert!(second.advance_to_running);
    }

    #[tokio::test]
    async fn unlocatable_key_is_dropped_from_unassigned_without_a_group() {
        let gateway = InMemoryMds::default();
        let mut locate = StaticLocate::empty();
        locate.insert("k1", vec!["hA".into()]);
        // k2 intentionally absent -> unlocatable.

        let out = task_group_assign(
            &gateway,
            &locate,
            "job-1",
            PlannerInput {
                phase_num: 0,
                phase: Phase(serde_json::json!({})),
                input: vec!["k1".into(), "k2".into()],
                existing_groups: HashMap::new(),
            },
        )
        .await
        .unwrap();

        assert_eq!(out.unlocatable, vec!["k2".to_string()]);
        assert!(out.unassigned_keys.is_empty());
        assert!(out.advance_to_running);
    }
}
