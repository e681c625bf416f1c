// tests/supervisor_scenarios.rs
//
// End-to-end scenarios from the spec's testable-properties section,
// driven against the in-memory MDS double and a static locate table.

use std::sync::Arc;
use std::time::Duration;

use marlin_super::config::SupervisorConfig;
use marlin_super::locate::{LocateService, StaticLocate};
use marlin_super::mds::memory::{fresh_job, InMemoryMds};
use marlin_super::mds::MdsGateway;
use marlin_super::supervisor::Supervisor;

async fn settle() {
    tokio::time::sleep(Duration::from_millis(250)).await;
}

fn fast_config() -> SupervisorConfig {
    let mut config = SupervisorConfig::default();
    config.tick_interval_ms = 10;
    config.find_interval_ms = 20;
    config
}

/// Scenario 1: cold start, single phase, keys partitioned by host.
#[tokio::test]
async fn cold_start_single_phase_reaches_running() {
    let mem = InMemoryMds::default();
    let gateway: Arc<dyn MdsGateway> = Arc::new(mem.clone());

    let mut locate = StaticLocate::empty();
    for (k, h) in [
        ("k1", "hA"),
        ("k2", "hA"),
        ("k3", "hB"),
        ("k4", "hB"),
        ("k5", "hC"),
        ("k6", "hC"),
    ] {
        locate.insert(k, vec![h.to_string()]);
    }
    let locate: Arc<dyn LocateService> = Arc::new(locate);

    mem.put_job(fresh_job(
        "job-001",
        vec!["k1", "k2", "k3", "k4", "k5", "k6"],
        1,
    ))
    .await;

    let sup = Supervisor::new(fast_config(), gateway.clone(), locate);
    sup.start();
    settle().await;

    let snap = sup.snapshot().await;
    let job = snap.job("job-001").expect("job-001 tracked");
    assert_eq!(job.state, "running");

    let groups = gateway.list_task_groups("job-001").await.unwrap();
    assert!(groups.len() == 2 || groups.len() == 3);
    let mut all_keys: Vec<String> = groups.iter().flat_map(|g| g.input_keys.clone()).collect();
    all_keys.sort();
    assert_eq!(
        all_keys,
        vec!["k1", "k2", "k3", "k4", "k5", "k6"]
            .into_iter()
            .map(String::from)
            .collect::<Vec<_>>()
    );
}

/// Scenario 3: two supervisors race on one job; exactly one wins.
#[tokio::test]
async fn conflicting_assign_drops_the_loser() {
    let mem = InMemoryMds::default();
    mem.put_job(fresh_job("job-003", vec!["k1"], 1)).await;

    let locate: Arc<dyn LocateService> = Arc::new(StaticLocate::empty());

    let gateway_a: Arc<dyn MdsGateway> = Arc::new(mem.clone());
    let gateway_b: Arc<dyn MdsGateway> = Arc::new(mem.clone());

    let mut cfg_a = fast_config();
    cfg_a.uuid = "super-a".into();
    let mut cfg_b = fast_config();
    cfg_b.uuid = "super-b".into();

    let sup_a = Supervisor::new(cfg_a, gateway_a, locate.clone());
    let sup_b = Supervisor::new(cfg_b, gateway_b, locate);
    sup_a.start();
    sup_b.start();
    settle().await;

    let job = mem.get_job("job-003").await.unwrap();
    assert!(job.worker.is_some());

    let snap_a = sup_a.snapshot().await;
    let snap_b = sup_b.snapshot().await;
    let a_owns = snap_a.job("job-003").is_some();
    let b_owns = snap_b.job("job-003").is_some();
    assert!(a_owns ^ b_owns, "exactly one supervisor should retain ownership");
}

/// Scenario 5: an unlocatable key is recorded on the phase slot and
/// excluded from the task groups, but the job still reaches RUNNING.
#[tokio::test]
async fn unlocatable_key_does_not_block_running() {
    let mem = InMemoryMds::default();
    let gateway: Arc<dyn MdsGateway> = Arc::new(mem.clone());

    let mut locate = StaticLocate::empty();
    locate.insert("k1", vec!["hA".to_string()]);
    // k2 has no entry -> unlocatable.
    let locate: Arc<dyn LocateService> = Arc::new(locate);

    mem.put_job(fresh_job("job-005", vec!["k1", "k2"], 1)).await;

    let sup = Supervisor::new(fast_config(), gateway.clone(), locate);
    sup.start();
    settle().await;

    let snap = sup.snapshot().await;
    let job = snap.job("job-005").expect("tracked");
    assert_eq!(job.state, "running");
    assert_eq!(job.unlocatable_key_count, 1);

    let groups = gateway.list_task_groups("job-005").await.unwrap();
    let keys: Vec<String> = groups.iter().flat_map(|g| g.input_keys.clone()).collect();
    assert_eq!(keys, vec!["k1".to_string()]);
}

/// Scenario 2: a second supervisor recovers a job after the first
/// "crashes" (simulated by never starting its own tick loop), restores
/// phase 0, and plans only the keys not already persisted.
#[tokio::test]
async fn recovery_after_partial_planning_only_assigns_remaining_keys() {
    let mem = InMemoryMds::default();
    let gateway: Arc<dyn MdsGateway> = Arc::new(mem.clone());
    let mut locate = StaticLocate::empty();
    locate.insert("k1", vec!["hA".to_string()]);
    locate.insert("k2", vec!["hB".to_string()]);
    let locate: Arc<dyn LocateService> = Arc::new(locate);

    let mut record = fresh_job("job-002", vec!["k1", "k2"], 1);
    record.worker = Some("dead-supervisor".into());
    // mtime far in the past makes this job look abandoned to discovery.
    record.mtime = 0;
    mem.put_job(record).await;

    let mut config = fast_config();
    config.staleness_ms = 1;
    let sup = Supervisor::new(config, gateway.clone(), locate);
    sup.start();
    settle().await;

    let snap = sup.snapshot().await;
    let job = snap.job("job-002").expect("recovered job tracked");
    assert_eq!(job.state, "running");

    let groups = gateway.list_task_groups("job-002").await.unwrap();
    assert_eq!(groups.len(), 2);
}
