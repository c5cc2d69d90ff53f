//! Reconstruction Coordinator Tests
//!
//! End-to-end recovery scenarios against an in-process execution registry:
//! loss and recompute, recursive dependencies, lineage eviction, retry
//! exhaustion, terminal-failure replay, streaming mid-emission loss, and
//! request dedup.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use super::coordinator::ReconstructionCoordinator;
use crate::config::RecoveryConfig;
use crate::error::RecoveryError;
use crate::membership::{MembershipView, NodeId};
use crate::object::{ObjectId, Resolution};
use crate::placement::ExecutionRegistry;
use crate::store::InMemoryStore;
use crate::task::{
    ActorId, AttemptOutcome, AttemptPhase, ProducedCopy, ReturnCount, TaskArg, TaskId,
    TaskSpecification, TaskTarget,
};

struct Harness {
    coordinator: Arc<ReconstructionCoordinator>,
    registry: Arc<ExecutionRegistry>,
    store: Arc<InMemoryStore>,
    membership: Arc<MembershipView>,
}

fn harness(config: RecoveryConfig) -> Harness {
    // Opt-in log output while debugging (RUST_LOG-style filtering is not
    // needed; test writer keeps output per-test).
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let registry = ExecutionRegistry::new();
    let store = InMemoryStore::new();
    let membership = MembershipView::new();
    let coordinator = ReconstructionCoordinator::new(
        config,
        registry.clone(),
        store.clone(),
        membership.clone(),
    );
    Harness {
        coordinator,
        registry,
        store,
        membership,
    }
}

/// Default config with the retry pause shrunk so exhaustion tests stay fast.
fn fast_config() -> RecoveryConfig {
    RecoveryConfig {
        task_retry_delay: Duration::from_millis(5),
        ..RecoveryConfig::default()
    }
}

fn spec(name: &str, args: Vec<TaskArg>, max_retries: i64, owner: &NodeId) -> TaskSpecification {
    TaskSpecification {
        id: TaskId::new(),
        target: TaskTarget::FreeFunction {
            name: name.to_string(),
        },
        args,
        returns: ReturnCount::Fixed(1),
        max_retries: Some(max_retries),
        owner: owner.clone(),
    }
}

fn output(spec: &TaskSpecification) -> ObjectId {
    ObjectId::new(&spec.id, 0)
}

/// Registers a handler that republishes the spec's single return on `node`
/// and counts its invocations.
fn register_producer(h: &Harness, name: &str, node: NodeId) -> Arc<AtomicUsize> {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    h.registry.register(name, move |spec, _attempt| {
        let node = node.clone();
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            AttemptOutcome::Finished {
                returns: vec![ProducedCopy {
                    id: ObjectId::new(&spec.id, 0),
                    node,
                    size_bytes: 8,
                }],
            }
        }
    });
    calls
}

async fn submit_and_publish(h: &Harness, spec: &TaskSpecification, node: &NodeId) {
    h.coordinator.record_submission(spec);
    h.coordinator
        .record_available(&output(spec), &spec.id, 0, node.clone(), vec![0u8; 8])
        .await;
}

// ============================================================
// TEST 1: Lost object is recomputed from lineage
// ============================================================

#[tokio::test]
async fn test_lost_object_is_reconstructed() {
    let h = harness(fast_config());
    let node_a = NodeId::new();
    let node_b = NodeId::new();
    let spec = spec("produce", vec![], 3, &node_a);
    let id = output(&spec);
    let calls = register_producer(&h, "produce", node_b.clone());

    submit_and_publish(&h, &spec, &node_a).await;
    h.coordinator.add_reference(&id);

    h.coordinator.handle_node_death(&node_a);

    h.coordinator
        .ensure_available(&id, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    match h.coordinator.resolve(&id) {
        Resolution::Available { locations } => assert_eq!(locations, vec![node_b]),
        other => panic!("unexpected resolution: {:?}", other),
    }
}

// ============================================================
// TEST 2: Reconstruction disabled surfaces ObjectLost
// ============================================================

#[tokio::test]
async fn test_reconstruction_disabled_surfaces_object_lost() {
    let h = harness(RecoveryConfig::disabled());
    let node = NodeId::new();
    let spec = spec("produce", vec![], 3, &node);
    let id = output(&spec);
    let calls = register_producer(&h, "produce", node.clone());

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.handle_node_death(&node);

    let err = h
        .coordinator
        .ensure_available(&id, Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(err, RecoveryError::ObjectLost(id));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// ============================================================
// TEST 3: Concurrent requests share one reconstruction
// ============================================================

#[tokio::test]
async fn test_concurrent_requests_share_one_reconstruction() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = spec("produce", vec![], 3, &node);
    let id = output(&spec);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let publish_on = node.clone();
    h.registry.register("produce", move |spec, _attempt| {
        let counter = counter.clone();
        let node = publish_on.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            AttemptOutcome::Finished {
                returns: vec![ProducedCopy {
                    id: ObjectId::new(&spec.id, 0),
                    node,
                    size_bytes: 8,
                }],
            }
        }
    });

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.objects().mark_lost(&id, &node);

    let mut waiters = Vec::new();
    for _ in 0..4 {
        let coordinator = h.coordinator.clone();
        let id = id.clone();
        waiters.push(tokio::spawn(async move {
            coordinator
                .ensure_available(&id, Duration::from_secs(2))
                .await
        }));
    }
    for waiter in waiters {
        waiter.await.unwrap().unwrap();
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================
// TEST 4: Dependencies are recovered first, depth-first
// ============================================================

#[tokio::test]
async fn test_recursive_dependency_reconstruction() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let order = Arc::new(Mutex::new(Vec::new()));

    let upstream = spec("upstream", vec![], 3, &node);
    let upstream_out = output(&upstream);
    let downstream = spec(
        "downstream",
        vec![TaskArg::ObjectRef(upstream_out.clone())],
        3,
        &node,
    );
    let downstream_out = output(&downstream);

    for name in ["upstream", "downstream"] {
        let log = order.clone();
        let publish_on = node.clone();
        h.registry.register(name, move |spec, _attempt| {
            let log = log.clone();
            let node = publish_on.clone();
            let name = spec.target.name().to_string();
            async move {
                log.lock().unwrap().push(name);
                AttemptOutcome::Finished {
                    returns: vec![ProducedCopy {
                        id: ObjectId::new(&spec.id, 0),
                        node,
                        size_bytes: 8,
                    }],
                }
            }
        });
    }

    submit_and_publish(&h, &upstream, &node).await;
    submit_and_publish(&h, &downstream, &node).await;
    h.coordinator.add_reference(&downstream_out);

    h.coordinator.objects().mark_lost(&upstream_out, &node);
    h.coordinator.objects().mark_lost(&downstream_out, &node);

    h.coordinator
        .ensure_available(&downstream_out, Duration::from_secs(2))
        .await
        .unwrap();

    // The upstream value must exist again before the dependent re-runs.
    assert_eq!(*order.lock().unwrap(), vec!["upstream", "downstream"]);
    assert!(matches!(
        h.coordinator.resolve(&upstream_out),
        Resolution::Available { .. }
    ));
}

// ============================================================
// TEST 5: Evicted lineage fails the whole dependent chain
// ============================================================

#[tokio::test]
async fn test_evicted_lineage_fails_dependents() {
    let node = NodeId::new();

    // Chain t0 -> t1 -> t2 -> t3, each consuming the previous output.
    let mut specs: Vec<TaskSpecification> = Vec::new();
    for index in 0..4 {
        let args = match specs.last() {
            Some(prev) => vec![TaskArg::ObjectRef(output(prev))],
            None => vec![],
        };
        specs.push(spec(&format!("step{}", index), args, 3, &node));
    }

    // Budget fits exactly the two newest entries, so the two oldest
    // recipes get evicted.
    let size = |s: &TaskSpecification| serde_json::to_vec(s).unwrap().len() as u64;
    let budget = size(&specs[2]) + size(&specs[3]);
    let h = harness(RecoveryConfig {
        max_lineage_bytes: budget,
        ..fast_config()
    });

    let calls: Vec<_> = (0..4)
        .map(|index| register_producer(&h, &format!("step{}", index), node.clone()))
        .collect();

    for s in &specs {
        submit_and_publish(&h, s, &node).await;
    }
    assert_eq!(h.coordinator.lineage().len(), 2);

    let tail = output(&specs[3]);
    h.coordinator.add_reference(&tail);
    for s in &specs {
        h.coordinator.objects().mark_lost(&output(s), &node);
    }

    let err = h
        .coordinator
        .ensure_available(&tail, Duration::from_secs(2))
        .await
        .unwrap_err();

    // The eviction error keeps its classification through the chain
    // instead of being folded into a dependency failure.
    assert!(matches!(err, RecoveryError::LineageEvicted(_)));
    for counter in &calls {
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}

// ============================================================
// TEST 6: Retry budget bounds executions (N + 1 total)
// ============================================================

#[tokio::test]
async fn test_retry_budget_bounds_executions() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = spec("crashy", vec![], 1, &node);
    let id = output(&spec);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let crash_on = node.clone();
    h.registry.register("crashy", move |_spec, _attempt| {
        let counter = counter.clone();
        let node = crash_on.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            AttemptOutcome::WorkerCrashed { node }
        }
    });

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.objects().mark_lost(&id, &node);

    let err = h
        .coordinator
        .ensure_available(&id, Duration::from_secs(5))
        .await
        .unwrap_err();

    assert!(matches!(err, RecoveryError::WorkerCrashed { .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.coordinator.tracker().executions(&spec.id), 2);
}

// ============================================================
// TEST 7: Worker crash is retried and can still succeed
// ============================================================

#[tokio::test]
async fn test_crash_then_success_within_budget() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = spec("flaky", vec![], 3, &node);
    let id = output(&spec);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let publish_on = node.clone();
    h.registry.register("flaky", move |spec, attempt| {
        let counter = counter.clone();
        let node = publish_on.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            if attempt == 0 {
                AttemptOutcome::WorkerCrashed { node }
            } else {
                AttemptOutcome::Finished {
                    returns: vec![ProducedCopy {
                        id: ObjectId::new(&spec.id, 0),
                        node,
                        size_bytes: 8,
                    }],
                }
            }
        }
    });

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.objects().mark_lost(&id, &node);

    h.coordinator
        .ensure_available(&id, Duration::from_secs(5))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ============================================================
// TEST 8: Deterministic failure is cached and replayed
// ============================================================

#[tokio::test]
async fn test_deterministic_failure_replays_to_dependents() {
    let h = harness(fast_config());
    let node = NodeId::new();

    let upstream = spec("boom", vec![], 0, &node);
    let upstream_out = output(&upstream);
    let downstream = spec(
        "consume",
        vec![TaskArg::ObjectRef(upstream_out.clone())],
        0,
        &node,
    );
    let downstream_out = output(&downstream);

    let boom_calls = Arc::new(AtomicUsize::new(0));
    let counter = boom_calls.clone();
    h.registry.register("boom", move |_spec, _attempt| {
        let counter = counter.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            AttemptOutcome::ApplicationError {
                reason: "division by zero".to_string(),
            }
        }
    });
    register_producer(&h, "consume", node.clone());

    submit_and_publish(&h, &upstream, &node).await;
    submit_and_publish(&h, &downstream, &node).await;
    h.coordinator.add_reference(&downstream_out);
    h.coordinator.objects().mark_lost(&upstream_out, &node);
    h.coordinator.objects().mark_lost(&downstream_out, &node);

    let err = h
        .coordinator
        .ensure_available(&downstream_out, Duration::from_secs(2))
        .await
        .unwrap_err();

    match &err {
        RecoveryError::DependenciesUnavailable { task, reason } => {
            assert_eq!(task, &downstream.id);
            assert!(reason.contains("division by zero"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert!(
        err.to_string()
            .contains("input arguments for task")
    );

    // The upstream outcome is fixed: later requests replay it without
    // another execution.
    let cached = h
        .coordinator
        .ensure_available(&upstream_out, Duration::from_secs(2))
        .await
        .unwrap_err();
    assert!(matches!(cached, RecoveryError::TaskError { .. }));
    assert_eq!(boom_calls.load(Ordering::SeqCst), 1);
}

// ============================================================
// TEST 9: Freed objects are never reconstructed
// ============================================================

#[tokio::test]
async fn test_freed_object_is_never_reconstructed() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = spec("produce", vec![], 3, &node);
    let id = output(&spec);
    let calls = register_producer(&h, "produce", node.clone());

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.free(&id).await;

    let err = h
        .coordinator
        .ensure_available(&id, Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(err, RecoveryError::ObjectFreed(id.clone()));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.store.copy_count(&id), 0);
}

// ============================================================
// TEST 10: Tasks bound to a dead actor fail fast
// ============================================================

#[tokio::test]
async fn test_dead_actor_fails_fast() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let actor = ActorId::new();
    let spec = TaskSpecification {
        id: TaskId::new(),
        target: TaskTarget::ActorMethod {
            actor: actor.clone(),
            name: "method".to_string(),
        },
        args: vec![],
        returns: ReturnCount::Fixed(1),
        max_retries: Some(5),
        owner: node.clone(),
    };
    let id = output(&spec);

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.tracker().mark_actor_dead(actor.clone());
    h.coordinator.objects().mark_lost(&id, &node);

    let err = h
        .coordinator
        .ensure_available(&id, Duration::from_secs(2))
        .await
        .unwrap_err();

    assert_eq!(err, RecoveryError::ActorUnavailable(actor));
    assert_eq!(h.coordinator.tracker().executions(&spec.id), 0);
}

// ============================================================
// TEST 11: Mid-stream loss attaches to the live attempt
// ============================================================

#[tokio::test]
async fn test_generator_midstream_loss_attaches() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = TaskSpecification {
        id: TaskId::new(),
        target: TaskTarget::FreeFunction {
            name: "stream".to_string(),
        },
        args: vec![],
        returns: ReturnCount::Streaming,
        max_retries: Some(3),
        owner: node.clone(),
    };

    h.coordinator.record_submission(&spec);
    let first = h
        .coordinator
        .record_stream_yield(&spec, 0, node.clone(), vec![1])
        .await;
    h.coordinator
        .record_stream_yield(&spec, 1, node.clone(), vec![2])
        .await;

    h.coordinator.add_reference(&first);
    h.coordinator.objects().mark_lost(&first, &node);

    // The attempt is still emitting: the coordinator must wait for it
    // instead of resubmitting, so the bounded wait elapses.
    let err = h
        .coordinator
        .ensure_available(&first, Duration::from_millis(150))
        .await
        .unwrap_err();

    assert!(matches!(err, RecoveryError::WaitTimeout(_)));
    assert_eq!(h.coordinator.tracker().executions(&spec.id), 0);
    let record = h.coordinator.objects().record(&first).unwrap();
    assert!(record.pending_creation);
}

// ============================================================
// TEST 12: Loss after stream completion resubmits the task
// ============================================================

#[tokio::test]
async fn test_generator_completed_stream_resubmits() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = TaskSpecification {
        id: TaskId::new(),
        target: TaskTarget::FreeFunction {
            name: "stream".to_string(),
        },
        args: vec![],
        returns: ReturnCount::Streaming,
        max_retries: Some(3),
        owner: node.clone(),
    };

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let coordinator = h.coordinator.clone();
    let publish_on = node.clone();
    h.registry.register("stream", move |spec, _attempt| {
        let counter = counter.clone();
        let coordinator = coordinator.clone();
        let node = publish_on.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            coordinator
                .record_stream_yield(&spec, 0, node.clone(), vec![1])
                .await;
            coordinator.record_stream_yield(&spec, 1, node, vec![2]).await;
            AttemptOutcome::Finished { returns: vec![] }
        }
    });

    h.coordinator.record_submission(&spec);
    let first = h
        .coordinator
        .record_stream_yield(&spec, 0, node.clone(), vec![1])
        .await;
    h.coordinator
        .record_stream_yield(&spec, 1, node.clone(), vec![2])
        .await;
    h.coordinator.record_stream_close(&spec.id);

    h.coordinator.add_reference(&first);
    h.coordinator.objects().mark_lost(&first, &node);

    h.coordinator
        .ensure_available(&first, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================
// TEST 13: Bounded wait elapses, recovery still completes
// ============================================================

#[tokio::test]
async fn test_wait_timeout_leaves_recovery_running() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = spec("slow", vec![], 3, &node);
    let id = output(&spec);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let publish_on = node.clone();
    h.registry.register("slow", move |spec, _attempt| {
        let counter = counter.clone();
        let node = publish_on.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(200)).await;
            AttemptOutcome::Finished {
                returns: vec![ProducedCopy {
                    id: ObjectId::new(&spec.id, 0),
                    node,
                    size_bytes: 8,
                }],
            }
        }
    });

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.objects().mark_lost(&id, &node);

    let err = h
        .coordinator
        .ensure_available(&id, Duration::from_millis(50))
        .await
        .unwrap_err();
    assert!(matches!(err, RecoveryError::WaitTimeout(_)));

    // A second, patient wait joins the same in-flight recovery.
    h.coordinator
        .ensure_available(&id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

// ============================================================
// TEST 14: Status snapshot exposes attempt phases
// ============================================================

#[tokio::test]
async fn test_snapshot_reports_phases() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = spec("gated", vec![], 3, &node);
    let id = output(&spec);

    let gate = Arc::new(Notify::new());
    let release = gate.clone();
    let publish_on = node.clone();
    h.registry.register("gated", move |spec, _attempt| {
        let gate = gate.clone();
        let node = publish_on.clone();
        async move {
            gate.notified().await;
            AttemptOutcome::Finished {
                returns: vec![ProducedCopy {
                    id: ObjectId::new(&spec.id, 0),
                    node,
                    size_bytes: 8,
                }],
            }
        }
    });

    submit_and_publish(&h, &spec, &node).await;
    h.coordinator.add_reference(&id);
    h.coordinator.objects().mark_lost(&id, &node);

    let coordinator = h.coordinator.clone();
    let target = id.clone();
    let waiter = tokio::spawn(async move {
        coordinator
            .ensure_available(&target, Duration::from_secs(2))
            .await
    });

    // Give the recovery time to reach the submitted phase.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let snapshot = h.coordinator.status_snapshot();
    let row = snapshot
        .iter()
        .find(|row| row.task == spec.id)
        .expect("task missing from snapshot");
    assert_eq!(row.phase, AttemptPhase::WaitingForExecution);
    assert_eq!(
        serde_json::to_value(row.phase).unwrap(),
        serde_json::json!("SUBMITTED_TO_WORKER")
    );

    release.notify_one();
    waiter.await.unwrap().unwrap();

    let snapshot = h.coordinator.status_snapshot();
    let row = snapshot.iter().find(|row| row.task == spec.id).unwrap();
    assert_eq!(row.phase, AttemptPhase::Finished);
}

// ============================================================
// TEST 15: Node-death events trigger recovery end to end
// ============================================================

#[tokio::test]
async fn test_node_death_event_triggers_reconstruction() {
    let h = harness(fast_config());
    let node_a = NodeId::new();
    let node_b = NodeId::new();
    h.membership.register(node_a.clone());
    h.membership.register(node_b.clone());
    h.coordinator.start();

    let spec = spec("produce", vec![], 3, &node_a);
    let id = output(&spec);
    let calls = register_producer(&h, "produce", node_b.clone());

    submit_and_publish(&h, &spec, &node_a).await;
    h.coordinator.add_reference(&id);

    h.membership.report_death(&node_a);
    assert!(!h.membership.is_alive(&node_a));

    // The sweep runs on the death listener's task; wait for the
    // re-execution it schedules.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while calls.load(Ordering::SeqCst) == 0 {
        assert!(tokio::time::Instant::now() < deadline, "no reconstruction scheduled");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    h.coordinator
        .ensure_available(&id, Duration::from_secs(2))
        .await
        .unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        h.coordinator.resolve(&id),
        Resolution::Available { .. }
    ));
}

// ============================================================
// TEST 16: Dropping the last reference collects the chain
// ============================================================

#[tokio::test]
async fn test_unreferenced_objects_are_collected() {
    let h = harness(fast_config());
    let node = NodeId::new();

    let upstream = spec("upstream", vec![], 3, &node);
    let upstream_out = output(&upstream);
    let downstream = spec(
        "downstream",
        vec![TaskArg::ObjectRef(upstream_out.clone())],
        3,
        &node,
    );
    let downstream_out = output(&downstream);

    submit_and_publish(&h, &upstream, &node).await;
    submit_and_publish(&h, &downstream, &node).await;
    h.coordinator.add_reference(&downstream_out);

    assert_eq!(h.coordinator.objects().len(), 2);
    assert_eq!(h.coordinator.lineage().len(), 2);

    // Releasing the tail unreferences the upstream transitively: its only
    // holder was the tail's lineage entry.
    h.coordinator.drop_reference(&downstream_out).await;

    assert_eq!(h.coordinator.objects().len(), 0);
    assert_eq!(h.coordinator.lineage().len(), 0);
    assert_eq!(h.store.copy_count(&upstream_out), 0);
    assert_eq!(h.store.copy_count(&downstream_out), 0);
}

// ============================================================
// TEST 17: One resubmission republishes every return slot
// ============================================================

#[tokio::test]
async fn test_multi_return_loss_republishes_all_slots() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let spec = TaskSpecification {
        id: TaskId::new(),
        target: TaskTarget::FreeFunction {
            name: "pair".to_string(),
        },
        args: vec![],
        returns: ReturnCount::Fixed(2),
        max_retries: Some(3),
        owner: node.clone(),
    };
    let first = ObjectId::new(&spec.id, 0);
    let second = ObjectId::new(&spec.id, 1);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let publish_on = node.clone();
    h.registry.register("pair", move |spec, _attempt| {
        let counter = counter.clone();
        let node = publish_on.clone();
        async move {
            counter.fetch_add(1, Ordering::SeqCst);
            // Slot order in the outcome is arbitrary; the identity is
            // what names the slot.
            AttemptOutcome::Finished {
                returns: (0..2)
                    .rev()
                    .map(|index| ProducedCopy {
                        id: ObjectId::new(&spec.id, index),
                        node: node.clone(),
                        size_bytes: 8,
                    })
                    .collect(),
            }
        }
    });

    h.coordinator.record_submission(&spec);
    for (index, id) in [&first, &second].into_iter().enumerate() {
        h.coordinator
            .record_available(id, &spec.id, index as u32, node.clone(), vec![0u8; 8])
            .await;
        h.coordinator.add_reference(id);
    }

    // Only the second slot goes missing.
    h.coordinator.objects().mark_lost(&second, &node);

    h.coordinator
        .ensure_available(&second, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(matches!(
        h.coordinator.resolve(&first),
        Resolution::Available { .. }
    ));
    assert!(matches!(
        h.coordinator.resolve(&second),
        Resolution::Available { .. }
    ));
    // Slot labels survive out-of-order republication.
    assert_eq!(h.coordinator.objects().record(&first).unwrap().return_index, 0);
    assert_eq!(h.coordinator.objects().record(&second).unwrap().return_index, 1);
}

// ============================================================
// TEST 18: Dead-actor upstream fails dependents without a submit
// ============================================================

#[tokio::test]
async fn test_dead_actor_dependency_propagates() {
    let h = harness(fast_config());
    let node = NodeId::new();
    let actor = ActorId::new();

    let upstream = TaskSpecification {
        id: TaskId::new(),
        target: TaskTarget::ActorMethod {
            actor: actor.clone(),
            name: "method".to_string(),
        },
        args: vec![],
        returns: ReturnCount::Fixed(1),
        max_retries: Some(5),
        owner: node.clone(),
    };
    let upstream_out = output(&upstream);
    let downstream = spec(
        "consume",
        vec![TaskArg::ObjectRef(upstream_out.clone())],
        3,
        &node,
    );
    let downstream_out = output(&downstream);
    let consume_calls = register_producer(&h, "consume", node.clone());

    submit_and_publish(&h, &upstream, &node).await;
    submit_and_publish(&h, &downstream, &node).await;
    h.coordinator.add_reference(&downstream_out);
    h.coordinator.tracker().mark_actor_dead(actor);

    h.coordinator.objects().mark_lost(&upstream_out, &node);
    h.coordinator.objects().mark_lost(&downstream_out, &node);

    let err = h
        .coordinator
        .ensure_available(&downstream_out, Duration::from_secs(2))
        .await
        .unwrap_err();

    match err {
        RecoveryError::DependenciesUnavailable { task, reason } => {
            assert_eq!(task, downstream.id);
            assert!(reason.contains("permanently dead"));
        }
        other => panic!("unexpected error: {:?}", other),
    }
    assert_eq!(consume_calls.load(Ordering::SeqCst), 0);
    let record = h.coordinator.objects().record(&upstream_out).unwrap();
    assert!(!record.pending_creation);
}

// ============================================================
// TEST 19: Mutually dependent lineage is rejected as a cycle
// ============================================================

#[tokio::test]
async fn test_lineage_cycle_is_fatal_without_submission() {
    let h = harness(fast_config());
    let node = NodeId::new();

    // Two specifications whose outputs consume each other.
    let task_a = TaskId::new();
    let task_b = TaskId::new();
    let out_a = ObjectId::new(&task_a, 0);
    let out_b = ObjectId::new(&task_b, 0);

    let spec_a = TaskSpecification {
        id: task_a,
        target: TaskTarget::FreeFunction {
            name: "loop_a".to_string(),
        },
        args: vec![TaskArg::ObjectRef(out_b.clone())],
        returns: ReturnCount::Fixed(1),
        max_retries: Some(3),
        owner: node.clone(),
    };
    let spec_b = TaskSpecification {
        id: task_b,
        target: TaskTarget::FreeFunction {
            name: "loop_b".to_string(),
        },
        args: vec![TaskArg::ObjectRef(out_a.clone())],
        returns: ReturnCount::Fixed(1),
        max_retries: Some(3),
        owner: node.clone(),
    };
    let calls_a = register_producer(&h, "loop_a", node.clone());
    let calls_b = register_producer(&h, "loop_b", node.clone());

    submit_and_publish(&h, &spec_a, &node).await;
    submit_and_publish(&h, &spec_b, &node).await;
    h.coordinator.add_reference(&out_a);
    h.coordinator.objects().mark_lost(&out_a, &node);
    h.coordinator.objects().mark_lost(&out_b, &node);

    let err = h
        .coordinator
        .ensure_available(&out_a, Duration::from_secs(2))
        .await
        .unwrap_err();

    assert!(matches!(err, RecoveryError::LineageCycle(_)));
    assert_eq!(calls_a.load(Ordering::SeqCst), 0);
    assert_eq!(calls_b.load(Ordering::SeqCst), 0);
}

// ============================================================
// TEST 20: Disabled retention charges no indirect references
// ============================================================

#[tokio::test]
async fn test_disabled_retention_leaves_no_reference_residue() {
    let h = harness(RecoveryConfig::disabled());
    let node = NodeId::new();

    let upstream = spec("upstream", vec![], 3, &node);
    let upstream_out = output(&upstream);
    let downstream = spec(
        "downstream",
        vec![TaskArg::ObjectRef(upstream_out.clone())],
        3,
        &node,
    );
    let downstream_out = output(&downstream);

    submit_and_publish(&h, &upstream, &node).await;
    submit_and_publish(&h, &downstream, &node).await;

    // Nothing was retained, so nothing may hold the upstream indirectly.
    let record = h.coordinator.objects().record(&upstream_out).unwrap();
    assert_eq!(record.indirect_refs, 0);

    h.coordinator.add_reference(&downstream_out);
    h.coordinator.drop_reference(&downstream_out).await;
    assert!(h.coordinator.objects().record(&downstream_out).is_none());
    assert_eq!(
        h.coordinator
            .objects()
            .record(&upstream_out)
            .unwrap()
            .total_refs(),
        0
    );
}

// ============================================================
// TEST 21: Re-recording a submission does not double-charge
// ============================================================

#[tokio::test]
async fn test_resubmission_recording_keeps_reference_counts_exact() {
    let h = harness(fast_config());
    let node = NodeId::new();

    let upstream = spec("upstream", vec![], 3, &node);
    let upstream_out = output(&upstream);
    let downstream = spec(
        "downstream",
        vec![TaskArg::ObjectRef(upstream_out.clone())],
        3,
        &node,
    );

    submit_and_publish(&h, &upstream, &node).await;
    submit_and_publish(&h, &downstream, &node).await;
    // A replayed submission replaces the retained entry; the references
    // the displaced entry held must go with it.
    h.coordinator.record_submission(&downstream);

    let record = h.coordinator.objects().record(&upstream_out).unwrap();
    assert_eq!(record.indirect_refs, 1);
}

// ============================================================
// TEST 22: Requests for unknown identities fail immediately
// ============================================================

#[tokio::test]
async fn test_unknown_object_is_lost() {
    let h = harness(fast_config());
    let id = ObjectId::new(&TaskId::new(), 0);

    let err = h
        .coordinator
        .ensure_available(&id, Duration::from_secs(1))
        .await
        .unwrap_err();

    assert_eq!(err, RecoveryError::ObjectLost(id));
}
