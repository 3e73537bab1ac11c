use super::*;
use crate::event_bus::EventKind;
use crate::models::TaskState;
use std::sync::atomic::AtomicU64;

struct EventCounts {
    started: Arc<AtomicU64>,
    completed: Arc<AtomicU64>,
    failed: Arc<AtomicU64>,
}

async fn count_events(bus: &EventBus) -> EventCounts {
    let started = Arc::new(AtomicU64::new(0));
    let completed = Arc::new(AtomicU64::new(0));
    let failed = Arc::new(AtomicU64::new(0));

    let s = started.clone();
    bus.subscribe(EventKind::TaskStarted, "count-started", move |_| {
        s.fetch_add(1, Ordering::SeqCst);
    })
    .await;
    let c = completed.clone();
    bus.subscribe(EventKind::TaskCompleted, "count-completed", move |_| {
        c.fetch_add(1, Ordering::SeqCst);
    })
    .await;
    let f = failed.clone();
    bus.subscribe(EventKind::TaskFailed, "count-failed", move |_| {
        f.fetch_add(1, Ordering::SeqCst);
    })
    .await;

    EventCounts {
        started,
        completed,
        failed,
    }
}

/// Linear DAG of three: starts are strictly ordered, one task runs at a
/// time, all succeed.
#[tokio::test]
async fn linear_chain_executes_in_dependency_order() {
    let invoker = RecordingInvoker::new();
    let mut config = test_config();
    config.class_limits.insert(AgentClass::Scribe, 2);
    let (orchestrator, _, _) = harness(config, invoker.clone());

    let ids = orchestrator
        .submit_batch(
            vec![
                chain_task("a", AgentClass::Scribe, &[], json!({})),
                chain_task("b", AgentClass::Scribe, &["a"], json!({})),
                chain_task("c", AgentClass::Scribe, &["b"], json!({})),
            ],
            None,
        )
        .await
        .unwrap();
    let results = orchestrator.await_all(&ids, None).await;

    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.outcome.is_success()));
    assert_eq!(invoker.start_order(), vec!["a", "b", "c"]);
    // A chain admits no overlap.
    assert_eq!(invoker.max_observed_concurrency(), 1);
}

/// Fan-out/fan-in: the middle layer runs at most two at a time under a
/// class limit of 2, and the join task starts only after all three
/// succeeded.
#[tokio::test]
async fn fan_out_fan_in_respects_class_limit() {
    let invoker = RecordingInvoker::new();
    let mut config = test_config();
    config.class_limits.insert(AgentClass::Reviewer, 2);
    let (orchestrator, _, _) = harness(config, invoker.clone());

    let ids = orchestrator
        .submit_batch(
            vec![
                chain_task("a", AgentClass::Reviewer, &[], json!({})),
                chain_task("b", AgentClass::Reviewer, &["a"], json!({"sleep_ms": 60})),
                chain_task("c", AgentClass::Reviewer, &["a"], json!({"sleep_ms": 60})),
                chain_task("d", AgentClass::Reviewer, &["a"], json!({"sleep_ms": 60})),
                chain_task("e", AgentClass::Reviewer, &["b", "c", "d"], json!({})),
            ],
            None,
        )
        .await
        .unwrap();
    let results = orchestrator.await_all(&ids, None).await;

    assert_eq!(results.len(), 5);
    assert!(results.iter().all(|r| r.outcome.is_success()));

    let order = invoker.start_order();
    assert_eq!(order.first().map(String::as_str), Some("a"));
    assert_eq!(order.last().map(String::as_str), Some("e"));
    assert!(invoker.max_observed_for_class(AgentClass::Reviewer) <= 2);
}

/// Dependency failure cascade: the failed root is Failed, dependents are
/// Cancelled with the root as cause, and none of them ever started.
#[tokio::test]
async fn failure_cascades_to_transitive_dependents() {
    let invoker = RecordingInvoker::new();
    let (orchestrator, bus, _) = harness(test_config(), invoker.clone());
    let counts = count_events(&bus).await;

    let ids = orchestrator
        .submit_batch(
            vec![
                chain_task("a", AgentClass::Scribe, &[], json!({"behavior": "permanent"})),
                chain_task("b", AgentClass::Scribe, &["a"], json!({})),
                chain_task("c", AgentClass::Scribe, &["b"], json!({})),
            ],
            None,
        )
        .await
        .unwrap();
    let results = orchestrator.await_all(&ids, None).await;

    assert_eq!(orchestrator.task_state("a").await, Some(TaskState::Failed));
    assert_eq!(orchestrator.task_state("b").await, Some(TaskState::Cancelled));
    assert_eq!(orchestrator.task_state("c").await, Some(TaskState::Cancelled));

    // Dependents were never invoked.
    assert_eq!(invoker.start_count("b"), 0);
    assert_eq!(invoker.start_count("c"), 0);

    // Cancellation cause points at the originating failure.
    let b = results.iter().find(|r| r.task_id == "b").unwrap();
    match &b.outcome {
        crate::models::TaskOutcome::Failure { error } => assert!(error.contains("a")),
        other => panic!("Expected failure outcome, got {other:?}"),
    }

    // Event pairing: one start, one failure, nothing completed.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(counts.started.load(Ordering::SeqCst), 1);
    assert_eq!(counts.completed.load(Ordering::SeqCst), 0);
    assert_eq!(counts.failed.load(Ordering::SeqCst), 1);
}

/// Event pairing across a mixed run: every started task closes with
/// exactly one completion or failure event.
#[tokio::test]
async fn started_events_pair_with_terminal_events() {
    let invoker = RecordingInvoker::new();
    let (orchestrator, bus, _) = harness(test_config(), invoker.clone());
    let counts = count_events(&bus).await;

    let ids = orchestrator
        .submit_batch(
            vec![
                chain_task("ok1", AgentClass::Architect, &[], json!({})),
                chain_task("ok2", AgentClass::Maestro, &[], json!({})),
                chain_task("bad", AgentClass::Reviewer, &[], json!({"behavior": "permanent"})),
                chain_task("flaky", AgentClass::BugHunter, &[], json!({"behavior": "flaky"})),
            ],
            None,
        )
        .await
        .unwrap();
    orchestrator.await_all(&ids, None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = counts.started.load(Ordering::SeqCst);
    let completed = counts.completed.load(Ordering::SeqCst);
    let failed = counts.failed.load(Ordering::SeqCst);
    assert_eq!(started, 4);
    assert_eq!(completed, 3);
    assert_eq!(failed, 1);
    assert_eq!(started, completed + failed);
}

/// Global cap: with max_concurrent = 2, the invoker never observes more
/// than two in-flight calls regardless of class limits.
#[tokio::test]
async fn global_concurrency_cap_bounds_in_flight_calls() {
    let invoker = RecordingInvoker::new();
    let mut config = test_config();
    config.limiter.max_concurrent = 2;
    for class in AgentClass::ALL {
        config.class_limits.insert(class, 8);
    }
    let (orchestrator, _, _) = harness(config, invoker.clone());

    let tasks: Vec<Task> = (0..6)
        .map(|i| {
            chain_task(
                &format!("t{i}"),
                AgentClass::ALL[i % AgentClass::ALL.len()],
                &[],
                json!({"sleep_ms": 50}),
            )
        })
        .collect();
    let ids = orchestrator.submit_batch(tasks, None).await.unwrap();
    let results = orchestrator.await_all(&ids, None).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.outcome.is_success()));
    assert!(invoker.max_observed_concurrency() <= 2);
}

/// Strategy growth is real capacity: under Balanced the worker pool
/// holds half the in-flight cap in reserve, and pinning Aggressive
/// raises observed concurrency past that baseline while the hard cap
/// still bounds it.
#[tokio::test]
async fn aggressive_strategy_raises_achievable_concurrency() {
    let invoker = RecordingInvoker::new();
    let mut config = test_config();
    config.limiter.max_concurrent = 4;
    // Class limits sum well past the cap, so neither they nor the
    // limiter are the binding gate under Balanced.
    for class in AgentClass::ALL {
        config.class_limits.insert(class, 8);
    }
    let (orchestrator, _, _) = harness(config, invoker.clone());

    let balanced: Vec<Task> = (0..6)
        .map(|i| {
            chain_task(
                &format!("b{i}"),
                AgentClass::Scribe,
                &[],
                json!({"sleep_ms": 80}),
            )
        })
        .collect();
    let ids = orchestrator.submit_batch(balanced, None).await.unwrap();
    orchestrator.await_all(&ids, None).await;
    assert_eq!(invoker.max_observed_concurrency(), 2);

    orchestrator.adaptive().set_turbo(true);
    let aggressive: Vec<Task> = (0..6)
        .map(|i| {
            chain_task(
                &format!("a{i}"),
                AgentClass::Scribe,
                &[],
                json!({"sleep_ms": 80}),
            )
        })
        .collect();
    let ids = orchestrator.submit_batch(aggressive, None).await.unwrap();
    let results = orchestrator.await_all(&ids, None).await;

    assert!(results.iter().all(|r| r.outcome.is_success()));
    // The grown pool admits more concurrent calls than the Balanced
    // baseline, and never more than the hard cap.
    assert!(invoker.max_observed_concurrency() > 2);
    assert!(invoker.max_observed_concurrency() <= 4);
}

/// Diamond: one shared dependency resolving two parallel branches that
/// join again.
#[tokio::test]
async fn diamond_dag_joins_correctly() {
    let invoker = RecordingInvoker::new();
    let (orchestrator, bus, _) = harness(test_config(), invoker.clone());

    let resolved = Arc::new(AtomicU64::new(0));
    let r = resolved.clone();
    bus.subscribe(EventKind::DependencyResolved, "count-resolved", move |_| {
        r.fetch_add(1, Ordering::SeqCst);
    })
    .await;

    let ids = orchestrator
        .submit_batch(
            vec![
                chain_task("root", AgentClass::Architect, &[], json!({})),
                chain_task("left", AgentClass::Maestro, &["root"], json!({})),
                chain_task("right", AgentClass::Reviewer, &["root"], json!({})),
                chain_task("join", AgentClass::Scribe, &["left", "right"], json!({})),
            ],
            None,
        )
        .await
        .unwrap();
    let results = orchestrator.await_all(&ids, None).await;

    assert!(results.iter().all(|r| r.outcome.is_success()));
    let order = invoker.start_order();
    assert_eq!(order.first().map(String::as_str), Some("root"));
    assert_eq!(order.last().map(String::as_str), Some("join"));

    tokio::time::sleep(Duration::from_millis(100)).await;
    // root->left, root->right, left->join, right->join.
    assert_eq!(resolved.load(Ordering::SeqCst), 4);
}

/// Shutdown-token cancellation: cancel_all drives every non-terminal
/// task to Cancelled and quiesce returns within the grace period.
#[tokio::test]
async fn cancel_all_then_quiesce_terminates_everything() {
    let invoker = RecordingInvoker::new();
    let (orchestrator, _, _) = harness(test_config(), invoker.clone());

    let ids = orchestrator
        .submit_batch(
            vec![
                chain_task("long1", AgentClass::Scribe, &[], json!({"sleep_ms": 30_000})),
                chain_task("long2", AgentClass::Maestro, &[], json!({"sleep_ms": 30_000})),
                chain_task("blocked", AgentClass::Scribe, &["long1"], json!({})),
            ],
            None,
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    orchestrator.cancel_all().await;
    orchestrator
        .quiesce(Duration::from_secs(5))
        .await
        .expect("all tasks should cancel within the grace period");

    for id in &ids {
        let state = orchestrator.task_state(id).await.unwrap();
        assert!(state.is_terminal(), "task {id} ended in {state:?}");
    }
}
