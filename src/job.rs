// src/job.rs
//
// =============================================================================
// MARLIN-SUPER: JOB STATE MACHINE (§4.3)
// =============================================================================
//
// Per-job lifecycle and its single in-flight operation guard. Grounded on
// `marketplace.rs`'s `NodeState` (compact in-memory bookkeeping alongside a
// durable record) for the shape of `JobState`, and on `guardian.rs`'s
// permit-guarded spawn + post-completion liveness check for how a single
// outstanding async operation is run without the control loop awaiting it.
//
// The control loop itself lives in `supervisor.rs`; this module holds the
// pure per-state transition logic plus the `JobState` struct it mutates.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::timeout;
use uuid::Uuid;

use crate::error::MdsError;
use crate::locate::LocateService;
use crate::mds::{filter_valid_task_groups, MdsGateway, TaskGroupWatch};
use crate::model::{JobId, JobRecord, TaskGroupRecord};
use crate::planner::{self, PlannerInput};

/// §4.3's state diagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobMachineState {
    Unassigned,
    Uninitialized,
    Planning,
    Running,
    Done,
}

/// Per-phase slot (§3): resolved input, durable groups observed or written
/// for this phase, and the set-difference unassigned keys.
#[derive(Debug, Clone, Default)]
pub struct PhaseSlot {
    pub input: Vec<String>,
    pub groups: HashMap<Uuid, TaskGroupRecord>,
    /// Keys the locate service could not place on any host, most recently
    /// computed by `taskGroupAssign` step 4 (§4.4). Recorded here for
    /// introspection and logging; they never get a task group, and their
    /// presence does not block the phase from advancing.
    pub unlocatable: Vec<String>,
}

/// The full per-job in-memory state. Held behind `Arc<tokio::sync::Mutex<_>>`
/// in the supervisor's job table so a spawned operation can be handed a
/// clone of the `Arc` without the table itself being locked across an await.
pub struct JobState {
    pub job_id: JobId,
    pub record: JobRecord,
    pub state: JobMachineState,
    pub state_entered_at: Instant,
    pub phase_index: usize,
    pub slot: PhaseSlot,
    /// §3 invariant 6 / §5: set on call entry, cleared in the completion
    /// handler. A job with `pending_op = true` is skipped by `tick()`.
    pub pending_op: bool,
    /// Flipped to `false` by `dropJob`; checked by completion handlers
    /// before they touch `self` (§4.2, §5 "Cancellation").
    pub alive: Arc<AtomicBool>,
    pub consecutive_transient_failures: u32,
    /// `worker` previously observed on this job record, used as
    /// `expectedWorker` in `assignJob` (absent for a never-before-owned job).
    pub prior_worker: Option<String>,
    /// The open `watchTaskGroups` handle for the current RUNNING phase, if
    /// one has been initiated (§4.3.3). Not part of `JobSnapshot`: a watch
    /// is a stateful stream, not a cheap value, so the dispatcher moves it
    /// out of here for the duration of one op and puts it back afterward
    /// rather than cloning it.
    pub task_group_watch: Option<Box<dyn TaskGroupWatch>>,
}

impl JobState {
    pub fn new(record: JobRecord) -> Self {
        let prior_worker = record.worker.clone();
        Self {
            job_id: record.job_id.clone(),
            record,
            state: JobMachineState::Unassigned,
            state_entered_at: Instant::now(),
            phase_index: 0,
            slot: PhaseSlot::default(),
            pending_op: false,
            alive: Arc::new(AtomicBool::new(true)),
            consecutive_transient_failures: 0,
            prior_worker,
            task_group_watch: None,
        }
    }

    fn enter(&mut self, state: JobMachineState) {
        self.state = state;
        self.state_entered_at = Instant::now();
    }

    pub fn snapshot(&self) -> JobSnapshot {
        JobSnapshot {
            job_id: self.job_id.clone(),
            state: self.state,
            record: self.record.clone(),
            phase_index: self.phase_index,
            slot_input: self.slot.input.clone(),
            slot_groups: self.slot.groups.clone(),
            prior_worker: self.prior_worker.clone(),
        }
    }
}

#[derive(Clone)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub state: JobMachineState,
    pub record: JobRecord,
    pub phase_index: usize,
    pub slot_input: Vec<String>,
    pub slot_groups: HashMap<Uuid, TaskGroupRecord>,
    pub prior_worker: Option<String>,
}

/// What the completion handler should do with the in-memory job table entry
/// once it has applied an outcome to `JobState`.
pub enum TableAction {
    /// Keep tracking the job; if `retick` the supervisor dispatches another
    /// tick for it immediately (§4.3: several transitions "transition ...
    /// and immediately tick").
    Keep { retick: bool },
    /// Remove the job from the table (`Conflict`, lock lost, or DONE).
    Drop,
}

/// Result of running one op for the job's current state. Produced with no
/// lock held; `apply` below mutates the real `JobState` under its lock.
pub enum JobOutcome {
    AssignOk(JobRecord),
    AssignConflict,
    AssignTransient,
    RestoreOk {
        phase_index: usize,
        groups: HashMap<Uuid, TaskGroupRecord>,
    },
    RestoreTransient,
    PlanOk {
        input: Vec<String>,
        groups: HashMap<Uuid, TaskGroupRecord>,
        unlocatable: Vec<String>,
        advance_to_running: bool,
    },
    PlanTransient,
    PhaseAdvanced {
        next_phase: usize,
    },
    JobDoneOk,
    JobDoneFatal(String),
    StillRunning {
        groups: HashMap<Uuid, TaskGroupRecord>,
    },
    LockLost,
}

/// Runs the operation appropriate to `snapshot.state` against the gateway
/// (and locate service, for PLANNING). This is the only place that awaits
/// an MDS call on behalf of a job; it holds no lock on the real `JobState`.
/// `watch` is the job's open `watchTaskGroups` handle, if any, moved out of
/// `JobState` for the duration of the call and handed back in the returned
/// tuple so the dispatcher can put it back.
pub async fn run_tick_op(
    snapshot: JobSnapshot,
    worker: &str,
    gateway: &dyn MdsGateway,
    locate: &dyn LocateService,
    op_timeout: Duration,
    watch: Option<Box<dyn TaskGroupWatch>>,
) -> (JobOutcome, Option<Box<dyn TaskGroupWatch>>) {
    match snapshot.state {
        JobMachineState::Unassigned => {
            (job_assign(snapshot, worker, gateway, op_timeout).await, None)
        }
        JobMachineState::Uninitialized => {
            (job_restore(snapshot, gateway, op_timeout).await, None)
        }
        JobMachineState::Planning => {
            // §7 "Lock lost (heartbeat Conflict)": PLANNING and RUNNING are
            // the two states a job can sit in for long enough that
            // `staleness_ms` could elapse without another MDS write ever
            // happening on its behalf, so both heartbeat here before doing
            // their own work.
            if let Some(outcome) = check_lock_lost(&snapshot, worker, gateway, op_timeout).await {
                return (outcome, None);
            }
            (
                task_group_assign(snapshot, gateway, locate, op_timeout).await,
                None,
            )
        }
        JobMachineState::Running => {
            if let Some(outcome) = check_lock_lost(&snapshot, worker, gateway, op_timeout).await {
                return (outcome, None);
            }
            evaluate_running(snapshot, worker, gateway, op_timeout, watch).await
        }
        JobMachineState::Done => {
            log::error!(
                "impossible: tick dispatched for job {} in terminal state DONE",
                snapshot.job_id
            );
            (JobOutcome::JobDoneOk, None)
        }
    }
}

/// Refreshes `mtime` via `heartbeat` and converts a `Conflict` into
/// `JobOutcome::LockLost` (§7). A transient heartbeat failure is logged and
/// otherwise ignored for this tick — it doesn't block the state's own
/// operation, since the next tick will try again.
async fn check_lock_lost(
    snapshot: &JobSnapshot,
    worker: &str,
    gateway: &dyn MdsGateway,
    op_timeout: Duration,
) -> Option<JobOutcome> {
    match heartbeat(&snapshot.job_id, worker, gateway, op_timeout).await {
        Ok(()) => None,
        Err(e) if e.is_conflict() => {
            log::warn!(
                "heartbeat conflict for job {}: lock lost, dropping",
                snapshot.job_id
            );
            Some(JobOutcome::LockLost)
        }
        Err(e) => {
            log::warn!("heartbeat failed for job {}: {e}", snapshot.job_id);
            None
        }
    }
}

/// §4.3.1
async fn job_assign(
    snapshot: JobSnapshot,
    worker: &str,
    gateway: &dyn MdsGateway,
    op_timeout: Duration,
) -> JobOutcome {
    let mut candidate = snapshot.record.with_worker(worker);
    // §3/§6: `state` is the durable three-way status (unassigned/running/
    // done). Once a supervisor wins ownership there is no separate durable
    // state for planning vs. running — the finer-grained `JobMachineState`
    // is in-memory only.
    candidate.state = crate::model::JobRecordState::Running;
    let result = timeout(
        op_timeout,
        gateway.assign_job(&candidate, snapshot.prior_worker.as_deref()),
    )
    .await;

    match result {
        Ok(Ok(record)) => JobOutcome::AssignOk(record),
        Ok(Err(e)) if e.is_conflict() => JobOutcome::AssignConflict,
        Ok(Err(e)) => {
            log::warn!("assignJob transient failure for {}: {e}", snapshot.job_id);
            JobOutcome::AssignTransient
        }
        Err(_) => {
            log::warn!("assignJob timed out for {}", snapshot.job_id);
            JobOutcome::AssignTransient
        }
    }
}

/// §4.3.2
async fn job_restore(
    snapshot: JobSnapshot,
    gateway: &dyn MdsGateway,
    op_timeout: Duration,
) -> JobOutcome {
    let result = timeout(op_timeout, gateway.list_task_groups(&snapshot.job_id)).await;
    let records = match result {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            log::warn!("listTaskGroups transient failure for {}: {e}", snapshot.job_id);
            return JobOutcome::RestoreTransient;
        }
        Err(_) => {
            log::warn!("listTaskGroups timed out for {}", snapshot.job_id);
            return JobOutcome::RestoreTransient;
        }
    };

    let phase_count = snapshot.record.phases.len();
    let (valid, dropped) = filter_valid_task_groups(records, phase_count);
    if dropped > 0 {
        log::warn!(
            "job {}: dropped {dropped} malformed task group record(s) during restore",
            snapshot.job_id
        );
    }

    // Rationale (§4.3.2): presence of a record in phase k proves phases < k
    // completed; their groups are not reconstructed, only the max observed
    // phase and phase k's own groups matter going forward.
    let max_phase = valid.iter().map(|g| g.phase_num).max();
    let phase_index = max_phase.unwrap_or(0);
    let groups = valid
        .into_iter()
        .filter(|g| g.phase_num == phase_index)
        .map(|g| (g.task_group_id, g))
        .collect();

    JobOutcome::RestoreOk {
        phase_index,
        groups,
    }
}

/// §4.4, delegating the actual plan/locate/persist to `planner`.
async fn task_group_assign(
    snapshot: JobSnapshot,
    gateway: &dyn MdsGateway,
    locate: &dyn LocateService,
    op_timeout: Duration,
) -> JobOutcome {
    let input = planner::resolve_input(
        snapshot.phase_index,
        &snapshot.slot_input,
        &snapshot.record,
        &snapshot
            .slot_groups
            .values()
            .cloned()
            .collect::<Vec<_>>(),
    );

    let phase = snapshot
        .record
        .phases
        .get(snapshot.phase_index)
        .cloned()
        .unwrap_or_else(|| {
            log::error!(
                "impossible: job {} phaseIndex {} out of range",
                snapshot.job_id,
                snapshot.phase_index
            );
            crate::model::Phase(serde_json::Value::Null)
        });

    let op = planner::task_group_assign(
        gateway,
        locate,
        &snapshot.job_id,
        PlannerInput {
            phase_num: snapshot.phase_index,
            phase,
            input,
            existing_groups: snapshot.slot_groups,
        },
    );

    match timeout(op_timeout, op).await {
        Ok(Ok(out)) => JobOutcome::PlanOk {
            input: out.input,
            groups: out.new_groups,
            unlocatable: out.unlocatable,
            advance_to_running: out.advance_to_running,
        },
        Ok(Err(e)) => {
            log::warn!("taskGroupAssign transient failure for {}: {e}", snapshot.job_id);
            JobOutcome::PlanTransient
        }
        Err(_) => {
            log::warn!("taskGroupAssign timed out for {}", snapshot.job_id);
            JobOutcome::PlanTransient
        }
    }
}

/// §4.3.3: "initiate/refresh `watchTaskGroups`, then evaluate phase
/// completion." `watch` is `Some` once the watch has already been
/// initiated on a prior tick; this call only ever initiates it once per
/// phase and polls it (an incremental diff, not a full list) on every
/// subsequent tick, merging the diff into the phase's accumulated groups.
async fn evaluate_running(
    snapshot: JobSnapshot,
    worker: &str,
    gateway: &dyn MdsGateway,
    op_timeout: Duration,
    watch: Option<Box<dyn TaskGroupWatch>>,
) -> (JobOutcome, Option<Box<dyn TaskGroupWatch>>) {
    let mut watch = match watch {
        Some(watch) => watch,
        None => match timeout(op_timeout, gateway.watch_task_groups(&snapshot.job_id)).await {
            Ok(Ok(watch)) => watch,
            Ok(Err(e)) => {
                log::warn!("watchTaskGroups failed to initiate for {}: {e}", snapshot.job_id);
                return (
                    JobOutcome::StillRunning {
                        groups: snapshot.slot_groups,
                    },
                    None,
                );
            }
            Err(_) => {
                log::warn!("watchTaskGroups timed out initiating for {}", snapshot.job_id);
                return (
                    JobOutcome::StillRunning {
                        groups: snapshot.slot_groups,
                    },
                    None,
                );
            }
        },
    };

    let delta = match timeout(op_timeout, watch.poll()).await {
        Ok(Ok(records)) => records,
        Ok(Err(e)) => {
            log::warn!("watch refresh transient failure for {}: {e}", snapshot.job_id);
            return (
                JobOutcome::StillRunning {
                    groups: snapshot.slot_groups,
                },
                Some(watch),
            );
        }
        Err(_) => {
            log::warn!("watch refresh timed out for {}", snapshot.job_id);
            return (
                JobOutcome::StillRunning {
                    groups: snapshot.slot_groups,
                },
                Some(watch),
            );
        }
    };

    let phase_count = snapshot.record.phases.len();
    let (valid, _dropped) = filter_valid_task_groups(delta, phase_count);

    let mut groups = snapshot.slot_groups;
    for g in valid {
        if g.phase_num == snapshot.phase_index {
            groups.insert(g.task_group_id, g);
        }
    }

    if groups.is_empty() {
        return (JobOutcome::StillRunning { groups }, Some(watch));
    }

    let all_done = groups.values().all(|g| g.is_done_and_all_ok() || g.has_any_failure());
    if !all_done {
        return (JobOutcome::StillRunning { groups }, Some(watch));
    }

    let any_fatal_failure = groups.values().any(|g| g.has_any_failure());
    if any_fatal_failure {
        // §4.3.3 / §7: a retry-exhausted failure is surfaced by the agent
        // as a terminal `fail` result; the core treats any such result as
        // job-fatal since retry policy lives entirely with the agent.
        let reason = format!(
            "phase {} reported unrecoverable task failures",
            snapshot.phase_index
        );
        persist_completion(&snapshot.record, worker, Some(reason.clone()), gateway, op_timeout).await;
        return (JobOutcome::JobDoneFatal(reason), None);
    }

    if snapshot.phase_index + 1 < phase_count {
        (
            JobOutcome::PhaseAdvanced {
                next_phase: snapshot.phase_index + 1,
            },
            None,
        )
    } else {
        persist_completion(&snapshot.record, worker, None, gateway, op_timeout).await;
        (JobOutcome::JobDoneOk, None)
    }
}

/// §7 "User-visible failure": the gateway has no dedicated "complete job"
/// operation, so the terminal record (state=done, results set) is written
/// back through `assignJob`'s conditional write — this supervisor already
/// owns the job, so the call is also a final proof-of-ownership check.
/// Takes the job's durable record directly (rather than the whole
/// `JobSnapshot`) so callers that have already moved `slot_groups` out of
/// the snapshot can still call this with what remains.
async fn persist_completion(
    record: &JobRecord,
    worker: &str,
    reason: Option<String>,
    gateway: &dyn MdsGateway,
    op_timeout: Duration,
) {
    let mut final_record = record.with_worker(worker);
    final_record.state = crate::model::JobRecordState::Done;
    final_record.results = reason;

    match timeout(op_timeout, gateway.assign_job(&final_record, Some(worker))).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => log::warn!(
            "failed to persist terminal state for job {}: {e}",
            record.job_id
        ),
        Err(_) => log::warn!(
            "timed out persisting terminal state for job {}",
            record.job_id
        ),
    }
}

/// Applies an outcome to the real, locked `JobState`. Called by the
/// supervisor after re-acquiring the lock and checking `alive` (§5
/// "Completion handlers must first check ... otherwise discard").
pub fn apply_outcome(
    job: &mut JobState,
    outcome: JobOutcome,
    max_transient_retries: Option<u32>,
) -> TableAction {
    job.pending_op = false;

    match outcome {
        JobOutcome::AssignOk(record) => {
            job.record = record;
            job.consecutive_transient_failures = 0;
            job.enter(JobMachineState::Uninitialized);
            TableAction::Keep { retick: true }
        }
        JobOutcome::AssignConflict => TableAction::Drop,
        JobOutcome::AssignTransient => bump_transient(job, max_transient_retries),

        JobOutcome::RestoreOk {
            phase_index,
            groups,
        } => {
            job.phase_index = phase_index;
            job.slot = PhaseSlot {
                input: Vec::new(),
                groups,
                unlocatable: Vec::new(),
            };
            job.consecutive_transient_failures = 0;
            job.enter(JobMachineState::Planning);
            TableAction::Keep { retick: true }
        }
        JobOutcome::RestoreTransient => bump_transient(job, max_transient_retries),

        JobOutcome::PlanOk {
            input,
            groups,
            unlocatable,
            advance_to_running,
        } => {
            job.slot.input = input;
            job.slot.groups.extend(groups);
            // Recomputed fresh on every planner entry (§4.4 step 4), same as
            // `unassignedKeys` — a key can only stop being unlocatable by a
            // later locate() call finding it, never by carrying the old list.
            if !unlocatable.is_empty() {
                log::warn!(
                    "job {}: {} key(s) unlocatable in phase {}, excluded from task groups: {:?}",
                    job.job_id,
                    unlocatable.len(),
                    job.phase_index,
                    unlocatable
                );
            }
            job.slot.unlocatable = unlocatable;
            job.consecutive_transient_failures = 0;
            if advance_to_running {
                job.enter(JobMachineState::Running);
            }
            TableAction::Keep { retick: advance_to_running }
        }
        JobOutcome::PlanTransient => bump_transient(job, max_transient_retries),

        JobOutcome::PhaseAdvanced { next_phase } => {
            job.phase_index = next_phase;
            job.slot = PhaseSlot::default();
            job.consecutive_transient_failures = 0;
            job.enter(JobMachineState::Planning);
            TableAction::Keep { retick: true }
        }
        JobOutcome::JobDoneOk => {
            job.record.results = None;
            job.enter(JobMachineState::Done);
            TableAction::Drop
        }
        JobOutcome::JobDoneFatal(reason) => {
            job.record.results = Some(reason);
            job.enter(JobMachineState::Done);
            TableAction::Drop
        }
        JobOutcome::StillRunning { groups } => {
            job.slot.groups.extend(groups);
            job.consecutive_transient_failures = 0;
            TableAction::Keep { retick: false }
        }
        JobOutcome::LockLost => TableAction::Drop,
    }
}

fn bump_transient(job: &mut JobState, max_transient_retries: Option<u32>) -> TableAction {
    job.consecutive_transient_failures += 1;
    if let Some(max) = max_transient_retries {
        if job.consecutive_transient_failures > max {
            job.record.results = Some(format!(
                "exceeded {max} consecutive transient failures in state {:?}",
                job.state
            ));
            job.enter(JobMachineState::Done);
            return TableAction::Drop;
        }
    }
    TableAction::Keep { retick: false }
}

/// §7 "Lock lost": heartbeat conflict or discovery of an owned job as
/// unassigned. Called once per tick by `check_lock_lost` for PLANNING and
/// RUNNING jobs, so `mtime` keeps refreshing — and a lost lock is detected
/// — even during phases that make no other MDS write for longer than
/// `staleness_ms`.
pub async fn heartbeat(
    job_id: &str,
    worker: &str,
    gateway: &dyn MdsGateway,
    op_timeout: Duration,
) -> Result<(), MdsError> {
    match timeout(op_timeout, gateway.heartbeat(job_id, worker)).await {
        Ok(result) => result,
        Err(_) => Err(MdsError::Transient("heartbeat timed out".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locate::StaticLocate;
    use crate::mds::memory::{fresh_job, InMemoryMds};

    const TIMEOUT: Duration = Duration::from_secs(1);

    #[tokio::test]
    async fn assign_succeeds_then_restore_finds_no_groups() {
        let gateway = InMemoryMds::default();
        let job_record = fresh_job("job-1", vec!["k1"], 1);
        gateway.put_job(job_record.clone()).await;

        let mut job = JobState::new(job_record);
        let snap = job.snapshot();
        let outcome = job_assign(snap, "super-a", &gateway, TIMEOUT).await;
        assert!(apply_outcome_ok(&mut job, outcome));
        assert_eq!(job.state, JobMachineState::Uninitialized);

        let snap = job.snapshot();
        let outcome = job_restore(snap, &gateway, TIMEOUT).await;
        assert!(apply_outcome_ok(&mut job, outcome));
        assert_eq!(job.state, JobMachineState::Planning);
        assert_eq!(job.phase_index, 0);
    }

    #[tokio::test]
    async fn assign_conflict_drops_job() {
        let gateway = InMemoryMds::default();
        let job_record = fresh_job("job-1", vec!["k1"], 1);
        gateway.put_job(job_record.with_worker("someone-else")).await;

        let job = JobState::new(job_record);
        let snap = job.snapshot();
        let outcome = job_assign(snap, "super-a", &gateway, TIMEOUT).await;
        assert!(matches!(outcome, JobOutcome::AssignConflict));
    }

    #[tokio::test]
    async fn planning_reaches_running_when_all_keys_assigned() {
        let gateway = InMemoryMds::default();
        let mut locate = StaticLocate::empty();
        locate.insert("k1", vec!["hA".into()]);

        let mut job = JobState::new(fresh_job("job-1", vec!["k1"], 1));
        job.state = JobMachineState::Planning;

        let snap = job.snapshot();
        let outcome = task_group_assign(snap, &gateway, &locate, TIMEOUT).await;
        assert!(apply_outcome_ok(&mut job, outcome));
        assert_eq!(job.state, JobMachineState::Running);
        assert_eq!(job.slot.groups.len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_conflict_yields_lock_lost() {
        let gateway = InMemoryMds::default();
        let job_record = fresh_job("job-1", vec!["k1"], 1);
        // Owned by someone else: a heartbeat from "super-a" must conflict.
        gateway.put_job(job_record.clone().with_worker("someone-else")).await;

        let job = JobState::new(job_record);
        let snap = job.snapshot();
        let outcome = check_lock_lost(&snap, "super-a", &gateway, TIMEOUT).await;
        assert!(matches!(outcome, Some(JobOutcome::LockLost)));
    }

    #[tokio::test]
    async fn heartbeat_ok_does_not_interrupt_planning() {
        let gateway = InMemoryMds::default();
        let mut locate = StaticLocate::empty();
        locate.insert("k1", vec!["hA".into()]);

        let job_record = fresh_job("job-1", vec!["k1"], 1).with_worker("super-a");
        gateway.put_job(job_record.clone()).await;

        let mut job = JobState::new(job_record);
        job.state = JobMachineState::Planning;

        let snap = job.snapshot();
        let (outcome, watch) =
            run_tick_op(snap, "super-a", &gateway, &locate, TIMEOUT, None).await;
        assert!(watch.is_none());
        assert!(apply_outcome_ok(&mut job, outcome));
        assert_eq!(job.state, JobMachineState::Running);
    }

    #[test]
    fn unlocatable_keys_are_recorded_on_the_phase_slot() {
        let mut job = JobState::new(fresh_job("job-1", vec!["k1", "k2"], 1));
        let outcome = JobOutcome::PlanOk {
            input: vec!["k1".into(), "k2".into()],
            groups: HashMap::new(),
            unlocatable: vec!["k2".into()],
            advance_to_running: true,
        };
        apply_outcome(&mut job, outcome, None);
        assert_eq!(job.slot.unlocatable, vec!["k2".to_string()]);
    }

    #[tokio::test]
    async fn running_job_completes_via_watch_task_groups() {
        let gateway = InMemoryMds::default();
        let job_record = fresh_job("job-1", vec!["k1"], 1).with_worker("super-a");
        gateway.put_job(job_record.clone()).await;

        let group = crate::model::TaskGroupRecord {
            job_id: "job-1".into(),
            task_group_id: Uuid::new_v4(),
            phase_num: 0,
            host: "hA".into(),
            input_keys: vec!["k1".into()],
            phase: crate::model::Phase(serde_json::json!({})),
            state: crate::model::TaskGroupState::Done,
            results: vec![crate::model::TaskResult {
                key: "k1".into(),
                result: crate::model::TaskResultKind::Ok,
                outputs: vec![],
            }],
        };
        gateway.simulate_agent_update("job-1", group).await;

        let mut job = JobState::new(job_record);
        job.state = JobMachineState::Running;

        let snap = job.snapshot();
        let (outcome, watch) =
            evaluate_running(snap, "super-a", &gateway, TIMEOUT, None).await;
        assert!(watch.is_none());
        assert!(matches!(outcome, JobOutcome::JobDoneOk));

        let stored = gateway.get_job("job-1").await.unwrap();
        assert_eq!(stored.state, crate::model::JobRecordState::Done);
    }

    fn apply_outcome_ok(job: &mut JobState, outcome: JobOutcome) -> bool {
        matches!(apply_outcome(job, outcome, None), TableAction::Keep { .. })
    }
}
