// src/mds/memory.rs
//
// In-memory MDS double. Grounded on `r4ntix-arrow-ballista`'s
// `InMemoryClusterState`/`InMemoryJobState` (an `Arc<Mutex<..>>`-guarded
// stand-in for the real KV store, used so the core's logic can be tested
// without etcd/sled) and on the orchestrator's own `Arc<Mutex<T>>` +
// lock-briefly-then-release style (`guardian.rs`'s `ResourceLedger`).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{validate_job_record, MdsGateway, SaveOutcome, TaskGroupWatch};
use crate::error::MdsError;
use crate::model::{JobRecord, JobRecordState, TaskGroupRecord};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

struct TaskGroupSlot {
    record: TaskGroupRecord,
    rev: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<String, JobRecord>,
    task_groups: HashMap<String, HashMap<Uuid, TaskGroupSlot>>,
    rev_counter: u64,
}

/// In-memory, single-process stand-in for the metadata store. Multiple
/// `InMemoryMds` handles cloned from the same `new()` call share state, so
/// a test can run several `Supervisor`s against one store to exercise
/// mutual exclusion (§8 property 1).
#[derive(Clone)]
pub struct InMemoryMds {
    inner: Arc<Mutex<Inner>>,
    staleness: Duration,
}

impl InMemoryMds {
    pub fn new(staleness: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            staleness,
        }
    }

    /// Test/demo seeding helper — not part of the gateway contract.
    pub async fn put_job(&self, record: JobRecord) {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(record.job_id.clone(), record);
    }

    pub async fn get_job(&self, job_id: &str) -> Option<JobRecord> {
        self.inner.lock().await.jobs.get(job_id).cloned()
    }

    /// Simulates an agent writing back results for a task group — the
    /// core never does this itself (agents are out of scope, §1), but
    /// tests need a way to drive phase completion.
    pub async fn simulate_agent_update(&self, job_id: &str, group: TaskGroupRecord) {
        let mut inner = self.inner.lock().await;
        inner.rev_counter += 1;
        let rev = inner.rev_counter;
        inner
            .task_groups
            .entry(job_id.to_string())
            .or_default()
            .insert(
                group.task_group_id,
                TaskGroupSlot {
                    record: group,
                    rev,
                },
            );
    }
}

#[async_trait]
impl MdsGateway for InMemoryMds {
    async fn find_unassigned_jobs(&self) -> Result<Vec<JobRecord>, MdsError> {
        let inner = self.inner.lock().await;
        let now = now_ms();
        let stale_ms = self.staleness.as_millis() as i64;

        let mut out = Vec::new();
        for job in inner.jobs.values() {
            if validate_job_record(job).is_err() {
                continue;
            }
            let unassigned = job.worker.is_none();
            let abandoned = job.worker.is_some() && now - job.mtime > stale_ms;
            if unassigned || abandoned {
                out.push(job.clone());
            }
        }
        Ok(out)
    }

    async fn assign_job(
        &self,
        candidate: &JobRecord,
        expected_worker: Option<&str>,
    ) -> Result<JobRecord, MdsError> {
        let mut inner = self.inner.lock().await;
        let stored = inner
            .jobs
            .get(&candidate.job_id)
            .ok_or_else(|| MdsError::NotFound(candidate.job_id.clone()))?;

        if stored.worker.as_deref() != expected_worker {
            return Err(MdsError::Conflict(format!(
                "job {} owned by {:?}, expected {:?}",
                candidate.job_id, stored.worker, expected_worker
            )));
        }

        let mut next = candidate.clone();
        next.mtime = now_ms();
        inner.jobs.insert(next.job_id.clone(), next.clone());
        Ok(next)
    }

    async fn heartbeat(&self, job_id: &str, worker: &str) -> Result<(), MdsError> {
        let mut inner = self.inner.lock().await;
        let job = inner
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| MdsError::NotFound(job_id.to_string()))?;

        if job.worker.as_deref() != Some(worker) {
            return Err(MdsError::Conflict(format!(
                "lock lost on job {job_id}: owned by {:?}",
                job.worker
            )));
        }
        job.mtime = now_ms();
        Ok(())
    }

    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroupRecord>, MdsError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .task_groups
            .get(job_id)
            .map(|m| m.values().map(|s| s.record.clone()).collect())
            .unwrap_or_default())
    }

    async fn save_task_groups(&self, groups: &[TaskGroupRecord]) -> Vec<SaveOutcome> {
        let mut inner = self.inner.lock().await;
        let mut out = Vec::with_capacity(groups.len());

        for group in groups {
            let job_map = inner.task_groups.entry(group.job_id.clone()).or_default();
            if job_map.contains_key(&group.task_group_id) {
                out.push(SaveOutcome {
                    task_group_id: group.task_group_id,
                    outcome: Err(MdsError::Conflict(format!(
                        "task group {} already exists",
                        group.task_group_id
                    ))),
                });
                continue;
            }
            inner.rev_counter += 1;
            let rev = inner.rev_counter;
            inner
                .task_groups
                .get_mut(&group.job_id)
                .unwrap()
                .insert(
                    group.task_group_id,
                    TaskGroupSlot {
                        record: group.clone(),
                        rev,
                    },
                );
            out.push(SaveOutcome {
                task_group_id: group.task_group_id,
                outcome: Ok(()),
            });
        }
        out
    }

    async fn watch_task_groups(
        &self,
        job_id: &str,
    ) -> Result<Box<dyn TaskGroupWatch>, MdsError> {
        Ok(Box::new(MemoryWatch {
            inner: self.inner.clone(),
            job_id: job_id.to_string(),
            last_rev: 0,
        }))
    }
}

struct MemoryWatch {
    inner: Arc<Mutex<Inner>>,
    job_id: String,
    last_rev: u64,
}

#[async_trait]
impl TaskGroupWatch for MemoryWatch {
    async fn poll(&mut self) -> Result<Vec<TaskGroupRecord>, MdsError> {
        let inner = self.inner.lock().await;
        let mut max_seen = self.last_rev;
        let mut out = Vec::new();

        if let Some(groups) = inner.task_groups.get(&self.job_id) {
            for slot in groups.values() {
                if slot.rev > self.last_rev {
                    out.push(slot.record.clone());
                    max_seen = max_seen.max(slot.rev);
                }
            }
        }
        self.last_rev = max_seen;
        Ok(out)
    }
}

impl Default for InMemoryMds {
    fn default() -> Self {
        Self::new(Duration::from_secs(60))
    }
}

/// Convenience for unassigned-job discovery in tests: jobs created with
/// `JobRecordState::Unassigned` and no worker are always reported.
pub fn fresh_job(job_id: &str, input_keys: Vec<&str>, phases: usize) -> JobRecord {
    JobRecord {
        job_id: job_id.to_string(),
        phases: (0..phases.max(1))
            .map(|_| crate::model::Phase(serde_json::json!({})))
            .collect(),
        input_keys: input_keys.into_iter().map(String::from).collect(),
        worker: None,
        mtime: now_ms(),
        state: JobRecordState::Unassigned,
        results: None,
    }
}
