// src/config.rs
//
// §6 "Configuration" plus the ambient-stack additions this implementation
// needs (op_timeout, owned_job_cap, max_transient_retries — §9 Open
// Questions). Grounded on `main.rs`'s `Cli`/`Commands` (`clap::Parser`)
// for the CLI surface; the struct itself is serde-derived the way the
// orchestrator's `JobConfig` is, so it can also be loaded from a file.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

fn default_find_interval_ms() -> u64 {
    5000
}
fn default_tick_interval_ms() -> u64 {
    1000
}
fn default_jobs_bucket() -> String {
    "marlinJobs".into()
}
fn default_task_groups_bucket() -> String {
    "marlinTaskGroups".into()
}
fn default_op_timeout_ms() -> u64 {
    10_000
}
fn default_owned_job_cap() -> usize {
    256
}
fn default_uuid() -> String {
    Uuid::new_v4().to_string()
}

/// §6 recognized options, plus the three Open Question decisions recorded
/// in DESIGN.md. Deserializable from JSON config files; CLI flags in
/// `main.rs` override individual fields after loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Supervisor identity used in conditional writes (§6).
    #[serde(default = "default_uuid")]
    pub uuid: String,

    #[serde(default = "default_find_interval_ms")]
    pub find_interval_ms: u64,

    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_jobs_bucket")]
    pub jobs_bucket: String,

    #[serde(default = "default_task_groups_bucket")]
    pub task_groups_bucket: String,

    /// Bounded wall-clock deadline for every MDS Gateway call (§5
    /// "Timeouts"). Not named in §6; required by §5 to keep `pendingOp`
    /// from wedging, so it gets a default here.
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,

    /// Per-supervisor cap on owned jobs (§5 "Backpressure", §9 Open
    /// Question "assignment cap"). Jobs discovered beyond the cap are
    /// dropped at `onJob`.
    #[serde(default = "default_owned_job_cap")]
    pub owned_job_cap: usize,

    /// §9 Open Question "retry budget". `None` reproduces the source's
    /// unbounded tick-driven retry; `Some(n)` escalates a job to a fatal
    /// DONE outcome after `n` consecutive transient failures in one state.
    #[serde(default)]
    pub max_transient_retries: Option<u32>,

    /// Staleness threshold used by `findUnassignedJobs` to treat an
    /// owned-but-quiet job as abandoned (§4.1).
    #[serde(default = "default_staleness_ms")]
    pub staleness_ms: i64,
}

fn default_staleness_ms() -> i64 {
    30_000
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            uuid: default_uuid(),
            find_interval_ms: default_find_interval_ms(),
            tick_interval_ms: default_tick_interval_ms(),
            jobs_bucket: default_jobs_bucket(),
            task_groups_bucket: default_task_groups_bucket(),
            op_timeout_ms: default_op_timeout_ms(),
            owned_job_cap: default_owned_job_cap(),
            max_transient_retries: None,
            staleness_ms: default_staleness_ms(),
        }
    }
}

impl SupervisorConfig {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn find_interval(&self) -> Duration {
        Duration::from_millis(self.find_interval_ms)
    }

    pub fn op_timeout(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn staleness(&self) -> Duration {
        Duration::from_millis(self.staleness_ms.max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec_section_six() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.find_interval_ms, 5000);
        assert_eq!(cfg.tick_interval_ms, 1000);
        assert_eq!(cfg.jobs_bucket, "marlinJobs");
        assert_eq!(cfg.task_groups_bucket, "marlinTaskGroups");
        assert_eq!(cfg.owned_job_cap, 256);
        assert!(cfg.max_transient_retries.is_none());
    }

    #[test]
    fn partial_json_fills_in_remaining_defaults() {
        let cfg: SupervisorConfig = serde_json::from_str(r#"{"uuid":"super-1"}"#).unwrap();
        assert_eq!(cfg.uuid, "super-1");
        assert_eq!(cfg.tick_interval_ms, 1000);
    }
}
