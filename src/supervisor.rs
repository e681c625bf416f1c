// src/supervisor.rs
//
// =============================================================================
// MARLIN-SUPER: SUPERVISOR (§4.2)
// =============================================================================
//
// Owns the tick timer, the job table, and discovery. Grounded on
// `marketplace.rs`'s `MarketplaceCoordinator::tick` for the single
// entry-point shape (drain discovery, iterate jobs, reschedule) and on
// `main.rs`'s `run_coordinator_loop` for the timer-driven outer loop
// (interval, logged-not-propagated errors). The per-job spawn/liveness
// dispatch is `guardian.rs`'s `try_accept_job` pattern applied per tick
// instead of per job-submission.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;

use tokio::sync::Mutex as AsyncMutex;
use tokio::time::interval;

use crate::config::SupervisorConfig;
use crate::introspection::{self, JobSnapshotView, Snapshot, WorkerSnapshotView};
use crate::job::{self, JobMachineState, JobState, TableAction};
use crate::locate::LocateService;
use crate::mds::MdsGateway;
use crate::model::{JobId, JobRecord};

type JobHandle = Arc<AsyncMutex<JobState>>;

pub struct Supervisor {
    pub uuid: String,
    config: SupervisorConfig,
    gateway: Arc<dyn MdsGateway>,
    locate: Arc<dyn LocateService>,
    jobs: StdMutex<HashMap<JobId, JobHandle>>,
    started_at: Instant,
    /// §4.2 "Timer discipline: exactly one pending tick timer at any
    /// moment; asserted on re-arm."
    loop_started: AtomicBool,
}

impl Supervisor {
    pub fn new(
        config: SupervisorConfig,
        gateway: Arc<dyn MdsGateway>,
        locate: Arc<dyn LocateService>,
    ) -> Arc<Self> {
        let uuid = config.uuid.clone();
        Arc::new(Self {
            uuid,
            config,
            gateway,
            locate,
            jobs: StdMutex::new(HashMap::new()),
            started_at: Instant::now(),
            loop_started: AtomicBool::new(false),
        })
    }

    /// Records start time and schedules the recurring tick loop plus the
    /// separate discovery loop (§4.2 `start()`, §6 `findInterval` vs
    /// `tickInterval`). Must be called exactly once per supervisor.
    pub fn start(self: &Arc<Self>) {
        assert!(
            !self.loop_started.swap(true, Ordering::SeqCst),
            "Supervisor::start called twice: timer discipline violated"
        );

        let sup = self.clone();
        tokio::spawn(async move {
            let mut ticker = interval(sup.config.tick_interval());
            loop {
                ticker.tick().await;
                sup.tick();
            }
        });

        let discover_sup = self.clone();
        tokio::spawn(async move {
            let mut finder = interval(discover_sup.config.find_interval());
            loop {
                finder.tick().await;
                discover_sup.clone().run_discovery().await;
            }
        });
    }

    /// §4.2 `tick()`. Never awaits: dispatches every tracked job and
    /// returns. Rescheduling itself is the caller's job (the interval loop
    /// in `start`), which only re-arms after this synchronous phase
    /// returns.
    pub fn tick(self: &Arc<Self>) {
        let handles: Vec<JobHandle> = {
            let table = self.jobs.lock().expect("job table poisoned");
            table.values().cloned().collect()
        };

        for handle in handles {
            Self::dispatch_tick(self.clone(), handle);
        }
    }

    async fn run_discovery(self: Arc<Self>) {
        match self.gateway.find_unassigned_jobs().await {
            Ok(records) => {
                for record in records {
                    self.on_job(record);
                }
            }
            Err(e) => log::warn!("findUnassignedJobs failed: {e}"),
        }
    }

    /// §4.2 `onJob(record)`.
    pub fn on_job(self: &Arc<Self>, record: JobRecord) {
        let job_id = record.job_id.clone();
        let mut table = self.jobs.lock().expect("job table poisoned");

        match table.get(&job_id) {
            None => {
                if table.len() >= self.config.owned_job_cap {
                    log::warn!(
                        "owned-job cap ({}) reached; dropping discovery of {job_id}",
                        self.config.owned_job_cap
                    );
                    return;
                }
                let handle = Arc::new(AsyncMutex::new(JobState::new(record)));
                table.insert(job_id.clone(), handle.clone());
                drop(table);
                Self::dispatch_tick(self.clone(), handle);
            }
            Some(handle) => {
                let handle = handle.clone();
                drop(table);
                let sup = self.clone();
                tokio::spawn(async move {
                    let already_racing = {
                        let guard = handle.lock().await;
                        guard.state == JobMachineState::Unassigned
                    };
                    if already_racing {
                        return;
                    }
                    log::warn!(
                        "job {job_id} rediscovered as unassigned while owned locally; \
                         presuming lock lost"
                    );
                    sup.drop_job(&job_id);
                    sup.on_job(record);
                });
            }
        }
    }

    /// §4.2 `dropJob(jobId)`. Removes the table entry; any in-flight
    /// operation discovers this via the `alive` flag and discards its
    /// result instead of mutating a dangling `JobState`.
    pub fn drop_job(&self, job_id: &str) {
        let removed = self.jobs.lock().expect("job table poisoned").remove(job_id);
        if let Some(handle) = removed {
            // We can't synchronously flip `alive` without awaiting the
            // lock; hand it off. The flag only needs to be false by the
            // time a completion handler observes it, not immediately.
            tokio::spawn(async move {
                let guard = handle.lock().await;
                guard.alive.store(false, Ordering::SeqCst);
            });
        }
    }

    /// The single-flight spawn/liveness pattern (§5): try to take the
    /// per-job slot without blocking the caller, run the op with no lock
    /// held, then re-acquire and apply iff the job is still alive.
    fn dispatch_tick(sup: Arc<Self>, handle: JobHandle) {
        let (snapshot, watch) = {
            let mut guard = match handle.try_lock() {
                Ok(g) => g,
                Err(_) => return, // a completion handler is currently applying its result
            };
            if guard.pending_op || !guard.alive.load(Ordering::SeqCst) {
                return;
            }
            guard.pending_op = true;
            // The open watch, if any, is moved out for the duration of the
            // op (§4.3.3) rather than cloned — it's a stateful stream, not
            // a value — and handed back when the outcome is applied.
            (guard.snapshot(), guard.task_group_watch.take())
        };

        let job_id = snapshot.job_id.clone();
        let worker = sup.uuid.clone();
        let op_timeout = sup.config.op_timeout();
        let gateway = sup.gateway.clone();
        let locate = sup.locate.clone();
        let max_retries = sup.config.max_transient_retries;
        let handle_for_op = handle.clone();
        let sup_for_op = sup.clone();

        tokio::spawn(async move {
            let (outcome, watch) = job::run_tick_op(
                snapshot,
                &worker,
                gateway.as_ref(),
                locate.as_ref(),
                op_timeout,
                watch,
            )
            .await;

            let mut guard = handle_for_op.lock().await;
            if !guard.alive.load(Ordering::SeqCst) {
                log::debug!("discarding completion for dropped job {job_id}");
                return;
            }

            guard.task_group_watch = watch;
            let action = job::apply_outcome(&mut guard, outcome, max_retries);
            let retick = matches!(action, TableAction::Keep { retick: true });
            let should_drop = matches!(action, TableAction::Drop);
            drop(guard);

            if should_drop {
                sup_for_op.drop_job(&job_id);
            } else if retick {
                Self::dispatch_tick(sup_for_op, handle_for_op);
            }
        });
    }

    /// §4.5 introspection snapshot.
    pub async fn snapshot(&self) -> Snapshot {
        let handles: Vec<JobHandle> = {
            let table = self.jobs.lock().expect("job table poisoned");
            table.values().cloned().collect()
        };

        let mut jobs = Vec::with_capacity(handles.len());
        for handle in &handles {
            let guard = handle.lock().await;
            jobs.push(JobSnapshotView {
                job_id: guard.job_id.clone(),
                state: introspection::state_name(guard.state).to_string(),
                phase_index: guard.phase_index,
                phase_count: guard.record.phases.len(),
                pending_op: guard.pending_op,
                unassigned_key_count: crate::planner::unassigned_keys(
                    &guard.slot.input,
                    &guard.slot.groups,
                )
                .len(),
                unlocatable_key_count: guard.slot.unlocatable.len(),
                consecutive_transient_failures: guard.consecutive_transient_failures,
            });
        }

        Snapshot {
            worker: WorkerSnapshotView {
                uuid: self.uuid.clone(),
                owned_job_count: jobs.len(),
                owned_job_cap: self.config.owned_job_cap,
                uptime_secs: self.started_at.elapsed().as_secs(),
            },
            jobs,
        }
    }

    pub fn owned_job_count(&self) -> usize {
        self.jobs.lock().expect("job table poisoned").len()
    }
}
