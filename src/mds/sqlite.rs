// src/mds/sqlite.rs
//
// Durable MDS backend. Grounded on `checkpoint.rs`'s `CheckpointStore`:
// same "hybrid relational" pattern (hot fields as columns, full record as
// JSON text), the same HPC-safe pragmas, and the same defensive
// deserialize-skip-on-error behavior on restore. The one real departure is
// that `assign_job` needs a true conditional write, which `checkpoint.rs`
// never does (it only ever upserts unconditionally) — that half is
// grounded on `r4ntix-arrow-ballista`'s `try_acquire_job` instead.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{validate_job_record, MdsGateway, SaveOutcome, TaskGroupWatch};
use crate::error::MdsError;
use crate::model::{JobRecord, TaskGroupRecord};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub struct SqliteMds {
    conn: Arc<Mutex<Connection>>,
    #[allow(dead_code)]
    path: PathBuf,
    staleness_ms: i64,
}

impl SqliteMds {
    pub fn open(path: impl AsRef<Path>, staleness_ms: i64) -> Result<Self, MdsError> {
        let conn = Connection::open(path.as_ref())
            .map_err(|e| MdsError::Fatal(format!("failed to open mds db: {e}")))?;

        // HPC-safe journaling, matching the orchestrator's checkpoint store:
        // DELETE mode avoids WAL files on shared filesystems, busy_timeout
        // absorbs contention from introspection readers.
        conn.execute_batch(
            "PRAGMA journal_mode=DELETE;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=10000;",
        )?;

        conn.execute_batch(
            "BEGIN;
            CREATE TABLE IF NOT EXISTS jobs (
                job_id TEXT PRIMARY KEY,
                worker TEXT,
                mtime INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_mtime ON jobs(mtime);

            CREATE TABLE IF NOT EXISTS task_groups (
                task_group_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                phase_num INTEGER NOT NULL,
                rev INTEGER NOT NULL,
                full_json TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tg_job ON task_groups(job_id);
            CREATE INDEX IF NOT EXISTS idx_tg_rev ON task_groups(job_id, rev);
            COMMIT;",
        )?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.as_ref().to_path_buf(),
            staleness_ms,
        })
    }
}

#[async_trait]
impl MdsGateway for SqliteMds {
    async fn find_unassigned_jobs(&self) -> Result<Vec<JobRecord>, MdsError> {
        let conn = self.conn.lock().await;
        let now = now_ms();

        let mut stmt = conn.prepare(
            "SELECT full_json FROM jobs
             WHERE worker IS NULL OR (mtime < ?1)
             ORDER BY mtime ASC",
        )?;
        let rows = stmt.query_map(params![now - self.staleness_ms], |r| {
            let json: String = r.get(0)?;
            Ok(json)
        })?;

        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<JobRecord>(&json) {
                Ok(record) if validate_job_record(&record).is_ok() => out.push(record),
                Ok(record) => {
                    log::warn!("skipping invalid job record {}", record.job_id);
                }
                Err(e) => log::warn!("failed to deserialize job record during scan: {e}"),
            }
        }
        Ok(out)
    }

    async fn assign_job(
        &self,
        candidate: &JobRecord,
        expected_worker: Option<&str>,
    ) -> Result<JobRecord, MdsError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let row: Option<Option<String>> = tx
            .query_row(
                "SELECT worker FROM jobs WHERE job_id = ?1",
                params![candidate.job_id],
                |r| r.get(0),
            )
            .optional()?;
        let stored_worker = match row {
            Some(worker) => worker,
            None => return Err(MdsError::NotFound(candidate.job_id.clone())),
        };

        if stored_worker.as_deref() != expected_worker {
            return Err(MdsError::Conflict(format!(
                "job {} owned by {:?}, expected {:?}",
                candidate.job_id, stored_worker, expected_worker
            )));
        }

        let mut next = candidate.clone();
        next.mtime = now_ms();
        let json = serde_json::to_string(&next)?;

        tx.execute(
            "UPDATE jobs SET worker = ?2, mtime = ?3, full_json = ?4 WHERE job_id = ?1",
            params![next.job_id, next.worker, next.mtime, json],
        )?;
        tx.commit()?;
        Ok(next)
    }

    async fn heartbeat(&self, job_id: &str, worker: &str) -> Result<(), MdsError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE jobs SET mtime = ?3 WHERE job_id = ?1 AND worker = ?2",
            params![job_id, worker, now_ms()],
        )?;
        if rows == 0 {
            return Err(MdsError::Conflict(format!(
                "lock lost on job {job_id} (heartbeat by {worker} rejected)"
            )));
        }
        Ok(())
    }

    async fn list_task_groups(&self, job_id: &str) -> Result<Vec<TaskGroupRecord>, MdsError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT full_json FROM task_groups WHERE job_id = ?1 ORDER BY rev ASC",
        )?;
        let rows = stmt.query_map(params![job_id], |r| {
            let json: String = r.get(0)?;
            Ok(json)
        })?;

        let mut out = Vec::new();
        for row in rows {
            let json = row?;
            match serde_json::from_str::<TaskGroupRecord>(&json) {
                Ok(record) => out.push(record),
                Err(e) => log::warn!("failed to deserialize task group during list: {e}"),
            }
        }
        Ok(out)
    }

    async fn save_task_groups(&self, groups: &[TaskGroupRecord]) -> Vec<SaveOutcome> {
        let mut outcomes = Vec::with_capacity(groups.len());
        let mut conn = self.conn.lock().await;

        let tx = match conn.transaction() {
            Ok(tx) => tx,
            Err(e) => {
                let err = MdsError::from(e);
                return groups
                    .iter()
                    .map(|g| SaveOutcome {
                        task_group_id: g.task_group_id,
                        outcome: Err(MdsError::Transient(err.to_string())),
                    })
                    .collect();
            }
        };

        for group in groups {
            let next_rev: i64 = tx
                .query_row("SELECT COALESCE(MAX(rev), 0) + 1 FROM task_groups", [], |r| {
                    r.get(0)
                })
                .unwrap_or(1);

            let json = match serde_json::to_string(group) {
                Ok(j) => j,
                Err(e) => {
                    outcomes.push(SaveOutcome {
                        task_group_id: group.task_group_id,
                        outcome: Err(MdsError::from(e)),
                    });
                    continue;
                }
            };

            let result = tx.execute(
                "INSERT INTO task_groups (task_group_id, job_id, phase_num, rev, full_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    group.task_group_id.to_string(),
                    group.job_id,
                    group.phase_num as i64,
                    next_rev,
                    json
                ],
            );

            let outcome = match result {
                Ok(_) => Ok(()),
                Err(rusqlite::Error::SqliteFailure(e, _))
                    if e.code == rusqlite::ErrorCode::ConstraintViolation =>
                {
                    Err(MdsError::Conflict(format!(
                        "task group {} already exists",
                        group.task_group_id
                    )))
                }
                Err(e) => Err(MdsError::from(e)),
            };
            outcomes.push(SaveOutcome {
                task_group_id: group.task_group_id,
                outcome,
            });
        }

        if let Err(e) = tx.commit() {
            log::error!("save_task_groups commit failed: {e}");
            return groups
                .iter()
                .map(|g| SaveOutcome {
                    task_group_id: g.task_group_id,
                    outcome: Err(MdsError::Transient(format!("commit failed: {e}"))),
                })
                .collect();
        }
        outcomes
    }

    async fn watch_task_groups(
        &self,
        job_id: &str,
    ) -> Result<Box<dyn TaskGroupWatch>, MdsError> {
        Ok(Box::new(SqliteWatch {
            conn: self.conn.clone(),
            job_id: job_id.to_string(),
            last_rev: 0,
        }))
    }
}

struct SqliteWatch {
    conn: Arc<Mutex<Connection>>,
    job_id: String,
    last_rev: i64,
}

#[async_trait]
impl TaskGroupWatch for SqliteWatch {
    async fn poll(&mut self) -> Result<Vec<TaskGroupRecord>, MdsError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT rev, full_json FROM task_groups
             WHERE job_id = ?1 AND rev > ?2
             ORDER BY rev ASC",
        )?;
        let rows = stmt.query_map(params![self.job_id, self.last_rev], |r| {
            let rev: i64 = r.get(0)?;
            let json: String = r.get(1)?;
            Ok((rev, json))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (rev, json) = row?;
            self.last_rev = self.last_rev.max(rev);
            match serde_json::from_str::<TaskGroupRecord>(&json) {
                Ok(record) => out.push(record),
                Err(e) => log::warn!("failed to deserialize watched task group: {e}"),
            }
        }
        Ok(out)
    }
}

/// Inserts a job record, for seeding by the CLI and by tests. Distinct from
/// `assign_job` since the first write has no prior owner to race against.
pub fn seed_job(conn: &Connection, record: &JobRecord) -> Result<(), MdsError> {
    let json = serde_json::to_string(record)?;
    conn.execute(
        "INSERT INTO jobs (job_id, worker, mtime, full_json) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(job_id) DO UPDATE SET
            worker = excluded.worker, mtime = excluded.mtime, full_json = excluded.full_json",
        params![record.job_id, record.worker, record.mtime, json],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{JobRecordState, Phase};

    fn fresh(job_id: &str) -> JobRecord {
        JobRecord {
            job_id: job_id.to_string(),
            phases: vec![Phase(serde_json::json!({}))],
            input_keys: vec!["k1".into()],
            worker: None,
            mtime: now_ms(),
            state: JobRecordState::Unassigned,
            results: None,
        }
    }

    #[tokio::test]
    async fn assign_is_conditional_on_expected_worker() {
        let store = SqliteMds::open(":memory:", 60_000).unwrap();
        {
            let conn = store.conn.lock().await;
            seed_job(&conn, &fresh("job-1")).unwrap();
        }

        let job = fresh("job-1");
        let assigned = store.assign_job(&job.with_worker("super-a"), None).await.unwrap();
        assert_eq!(assigned.worker.as_deref(), Some("super-a"));

        let race = store
            .assign_job(&job.with_worker("super-b"), None)
            .await;
        assert!(matches!(race, Err(MdsError::Conflict(_))));
    }

    #[tokio::test]
    async fn save_task_groups_rejects_duplicate_id() {
        let store = SqliteMds::open(":memory:", 60_000).unwrap();
        let group = TaskGroupRecord {
            job_id: "job-1".into(),
            task_group_id: Uuid::new_v4(),
            phase_num: 0,
            host: "hA".into(),
            input_keys: vec!["k1".into()],
            phase: Phase(serde_json::json!({})),
            state: crate::model::TaskGroupState::Dispatched,
            results: vec![],
        };

        let first = store.save_task_groups(&[group.clone()]).await;
        assert!(first[0].outcome.is_ok());

        let second = store.save_task_groups(&[group]).await;
        assert!(matches!(second[0].outcome, Err(MdsError::Conflict(_))));
    }
}
