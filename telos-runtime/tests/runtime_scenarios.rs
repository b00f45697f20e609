//! End-to-end scenarios over a full runtime context

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use telos_autonomic::{ChaosExperiment, Feature, HazardKind};
use telos_bridge::Task;
use telos_cognition::{Goal, GoalKind};
use telos_config::TelosConfig;
use telos_federation::CoherenceEvent;
use telos_kernel::{Concept, Dtype};
use telos_runtime::TelosRuntime;
use telos_store::OutboxState;

fn test_config(dir: &Path) -> TelosConfig {
    let mut config = TelosConfig::default()
        .with_data_dir(dir)
        .with_workers(2);
    config.worker_heartbeat_ms = 40;
    config.outbox_backoff_base_ms = 1;
    config.outbox_backoff_max_ms = 10;
    config
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn round_trip_task_preserves_handle_discipline() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = TelosRuntime::initialize(test_config(dir.path())).await.unwrap();
    assert_eq!(runtime.status().bridge.active_workers, 2);

    let owner = runtime.table().register_owner();
    let h1 = runtime.allocate_vector(owner, &vec![1.0f32; 128]).unwrap();
    let h2 = runtime
        .table()
        .allocate(128, Dtype::F32, owner)
        .unwrap();

    let task = Task::builder("vsa_bind")
        .input(h1.href().clone())
        .input(h1.href().clone())
        .output(h2.href().clone())
        .build();
    let result = runtime.bridge().submit_task(task).wait().await.unwrap();
    assert_eq!(result.payload["elements"], 128);

    // Output populated, both handles live at their original retain counts.
    let bound = runtime.table().map(h2.href()).unwrap().read_f32().unwrap();
    assert!(bound.iter().all(|v| *v == 1.0));
    assert_eq!(runtime.table().refcount(h1.href()), Some(1));
    assert_eq!(runtime.table().refcount(h2.href()), Some(1));

    runtime.shutdown().await;
    assert!(!runtime.bridge().is_initialized());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn coherence_after_update_never_serves_stale_vectors() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = TelosRuntime::initialize(test_config(dir.path())).await.unwrap();
    let fabric = runtime.fabric().clone();

    let id = fabric.store().allocate_id().unwrap();
    fabric
        .write_concept(Concept::labeled(id, "seven"), Some(vec![0.1, 0.2]))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || fabric.index().contains(id)).await,
        "initial insert never reached L2"
    );

    // Pre-populate L1 with the soon-to-be-stale vector.
    fabric.cache().put(id, vec![0.1, 0.2]);

    fabric
        .write_concept(Concept::labeled(id, "seven"), Some(vec![0.9, 0.8]))
        .await
        .unwrap();
    assert!(
        wait_until(Duration::from_secs(2), || {
            fabric.index().vector_of(id) == Some(vec![0.9, 0.8])
        })
        .await,
        "update never reached L2"
    );

    // P3: after the coherence hop, L1 serves the new vector or nothing.
    match fabric.cache().get(id) {
        None => {}
        Some(vector) => assert_eq!(vector.as_ref(), &vec![0.9, 0.8]),
    }

    let results = fabric.search(&[0.9, 0.8], 1, None).unwrap();
    assert_eq!(results[0].0, id);
    assert!(results[0].1 > 0.999);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn impasse_creates_subgoal_then_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = TelosRuntime::initialize(test_config(dir.path())).await.unwrap();
    let mut goals = runtime.engine().subscribe_goals();

    // All proposals refuse a concept-less recall: operator-no-change.
    let goal = Goal::new(GoalKind::Recall, "recall the unnamed")
        .with_feature("domain", "void");
    let report = runtime.run_goal(goal.clone()).await;
    assert!(report.success, "report: {report:?}");
    assert_eq!(report.chunks_compiled, 1);

    let root_seen = goals.recv().await.unwrap();
    assert_eq!(root_seen.id, goal.id);
    let subgoal = goals.recv().await.unwrap();
    assert_eq!(subgoal.kind, GoalKind::Discovery);

    let chunk = &runtime.engine().chunks().live()[0];
    assert_eq!(chunk.condition.goal_kind, GoalKind::Discovery);
    assert_eq!(chunk.condition.features["domain"], "void");
    assert_eq!(chunk.operators, vec!["discovery.fallback".to_string()]);

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn worker_crash_is_recovered_with_one_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.worker_retry = 1;
    let runtime = TelosRuntime::initialize(config).await.unwrap();

    let crashes = Arc::new(AtomicUsize::new(0));
    {
        let crashes = Arc::clone(&crashes);
        runtime
            .bridge()
            .registry()
            .unwrap()
            .register_fn("test.crash_once", move |_ctx| {
                if crashes.fetch_add(1, Ordering::SeqCst) == 0 {
                    panic!("killed mid-task");
                }
                Ok(serde_json::json!({"ok": true}))
            });
    }

    let result = runtime
        .bridge()
        .submit_task(
            Task::builder("test.crash_once")
                .deadline(Duration::from_secs(5))
                .build(),
        )
        .wait()
        .await
        .unwrap();
    assert_eq!(result.payload["ok"], true);
    assert_eq!(runtime.bridge().metrics().retried, 1);

    assert!(
        wait_until(Duration::from_secs(2), || {
            runtime.status().bridge.active_workers == 2
        })
        .await,
        "worker pool never recovered to full strength"
    );

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn chaos_breach_triggers_memory_management_adaptation() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    // Small budget so the hazard ballast dominates; hair-trigger controller.
    config.l1_capacity_bytes = 4096;
    config.free_energy_threshold = 0.5;
    config.free_energy_dwell_samples = 1;
    let runtime = TelosRuntime::initialize(config).await.unwrap();

    let mut goals = runtime.engine().subscribe_goals();

    // Same experiment as the registry's CEP-005, resampled fast for tests.
    runtime.chaos().register(ChaosExperiment {
        id: "CEP-005".to_string(),
        target: "federated-memory".to_string(),
        hazard: HazardKind::MemoryPressure,
        steady_state: Arc::new(|s| s.get(Feature::MemoryPressure) < 0.95),
        sample_interval: Duration::from_millis(5),
        budget_samples: 100,
    });

    let report = runtime.chaos().run("CEP-005").await.unwrap();
    let breach = report.breach.expect("memory pressure breach");
    assert!(breach.sample.get(Feature::MemoryPressure) >= 0.95);
    assert!(runtime.controller().stats().adaptations >= 1);

    // The adaptation goal reaches the cognitive goal stream.
    let mut saw_adaptation = false;
    for _ in 0..16 {
        match tokio::time::timeout(Duration::from_secs(2), goals.recv()).await {
            Ok(Ok(goal)) => {
                if goal.kind == GoalKind::Adaptation
                    && goal.strategy.as_deref() == Some("memory-management")
                {
                    saw_adaptation = true;
                    break;
                }
            }
            _ => break,
        }
    }
    assert!(saw_adaptation, "no memory-management adaptation goal observed");

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn outbox_dead_letter_keeps_l1_invalidated() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.outbox_max_attempts = 2;
    let runtime = TelosRuntime::initialize(config).await.unwrap();
    let fabric = runtime.fabric().clone();
    let mut events = fabric.coordinator().subscribe();

    fabric
        .coordinator()
        .inject_apply_fault(Some(Box::new(|_record| {
            Err("deterministic l2 outage".to_string())
        })));

    let id = fabric.store().allocate_id().unwrap();
    fabric.cache().put(id, vec![9.9]);
    let sequence = fabric
        .write_concept(Concept::new(id), Some(vec![1.0]))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_secs(3), || {
            fabric
                .store()
                .outbox_get(sequence)
                .ok()
                .flatten()
                .map(|r| r.state == OutboxState::Dead)
                .unwrap_or(false)
        })
        .await,
        "record never dead-lettered"
    );

    let mut saw_failure = false;
    while let Ok(event) = events.try_recv() {
        if let CoherenceEvent::CoherenceFailure { sequence: seq, .. } = event {
            if seq == sequence {
                saw_failure = true;
            }
        }
    }
    assert!(saw_failure, "no coherence failure event");

    // L1 was invalidated on the first attempt and never repopulated.
    assert!(fabric.cache().get(id).is_none());
    assert!(!fabric.index().contains(id));

    runtime.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn runtime_operations_are_registered() {
    let dir = tempfile::tempdir().unwrap();
    let runtime = TelosRuntime::initialize(test_config(dir.path())).await.unwrap();

    let fabric = runtime.fabric().clone();
    let id = fabric.store().allocate_id().unwrap();
    fabric
        .write_concept(Concept::new(id), Some(vec![1.0, 0.0]))
        .await
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || fabric.index().contains(id)).await);

    // ann_search through the task ABI.
    let result = runtime
        .bridge()
        .submit_task(
            Task::builder("ann_search")
                .config(serde_json::json!({"query": [1.0, 0.0], "k": 1}))
                .build(),
        )
        .wait()
        .await
        .unwrap();
    let results = result.payload["results"].as_array().unwrap();
    assert_eq!(results[0][0], id.as_u64());

    // bridge_metrics through the task ABI.
    let metrics = runtime
        .bridge()
        .submit_task(Task::builder("bridge_metrics.snapshot").build())
        .wait()
        .await
        .unwrap();
    assert!(metrics.payload["submitted"].as_u64().unwrap() >= 1);

    runtime.shutdown().await;
}
