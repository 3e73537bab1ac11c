use super::test_helpers::*;
use crate::api::HealthSource;
use crate::models::Objective;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn objective_flows_from_queue_to_cached_artifact() {
    let dir = tempfile::tempdir().unwrap();
    let stack = build_stack(test_config(&dir), Arc::new(ChainPlanner));

    let objective = Objective::new(json!({"goal": "forge a report"}), 5, 3);
    let fingerprint = objective.fingerprint();
    stack.queue.enqueue(objective).await.unwrap();

    let runner = stack.runner.clone();
    let running = tokio::spawn(async move { runner.run().await });

    let done = eventually(Duration::from_secs(10), || async {
        stack.cache.get(&fingerprint).await.is_some()
            && stack.queue.in_flight_count().await == 0
            && stack.queue.depth().await == 0
    })
    .await;
    assert!(done, "objective did not complete end to end");

    // The artifact maps every task id to its output.
    let artifact = stack.cache.get(&fingerprint).await.unwrap();
    assert_eq!(artifact.as_object().unwrap().len(), 2);

    stack.runner.shutdown().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_planner_sends_objective_to_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(&dir);
    // One attempt only: the first nack dead-letters it.
    config.queue.max_retries = 1;
    let stack = build_stack(config, Arc::new(FailingPlanner));

    stack
        .queue
        .enqueue_payload(json!({"goal": "impossible"}), 1)
        .await
        .unwrap();

    let runner = stack.runner.clone();
    let running = tokio::spawn(async move { runner.run().await });

    let dead = eventually(Duration::from_secs(10), || async {
        stack.queue.dead_letter_count().await == 1
    })
    .await;
    assert!(dead, "objective was not dead-lettered");
    assert_eq!(stack.queue.depth().await, 0);

    stack.runner.shutdown().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn failing_tasks_exhaust_objective_retries_into_dead_letter() {
    let dir = tempfile::tempdir().unwrap();
    let stack = build_stack(test_config(&dir), Arc::new(ChainPlanner));

    // Both planned tasks inherit the failing payload. Each cycle nacks
    // the objective; after three attempts it is dead-lettered.
    let objective = Objective::new(json!({"behavior": "permanent"}), 1, 3);
    stack.queue.enqueue(objective).await.unwrap();

    let runner = stack.runner.clone();
    let running = tokio::spawn(async move { runner.run().await });

    let dead = eventually(Duration::from_secs(15), || async {
        stack.queue.dead_letter_count().await == 1
    })
    .await;
    assert!(dead, "objective did not exhaust its retry budget");
    assert_eq!(stack.queue.depth().await, 0);

    stack.runner.shutdown().await.unwrap();
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_with_in_flight_work_is_bounded() {
    let dir = tempfile::tempdir().unwrap();
    let stack = build_stack(test_config(&dir), Arc::new(ChainPlanner));

    // A task that would run for 30s; the cooperative invoker stops on
    // cancellation, so shutdown completes within the grace period.
    let objective = Objective::new(json!({"sleep_ms": 30_000}), 5, 3);
    stack.queue.enqueue(objective).await.unwrap();

    let runner = stack.runner.clone();
    let running = tokio::spawn(async move { runner.run().await });

    let started = eventually(Duration::from_secs(5), || async {
        stack
            .orchestrator
            .class_statuses()
            .await
            .values()
            .any(|s| s.running > 0)
    })
    .await;
    assert!(started, "no task ever started");

    let begun = std::time::Instant::now();
    stack.runner.shutdown().await.unwrap();
    assert!(begun.elapsed() < Duration::from_secs(10));
    running.await.unwrap().unwrap();
}

#[tokio::test]
async fn health_snapshot_reflects_the_assembled_system() {
    let dir = tempfile::tempdir().unwrap();
    let stack = build_stack(test_config(&dir), Arc::new(ChainPlanner));

    let health = HealthSource::new(
        stack.queue.clone(),
        stack.orchestrator.clone(),
        stack.cache.clone(),
        stack.bus.clone(),
    );
    let snapshot = health.snapshot().await;

    assert_eq!(snapshot.service, "hephaestus-core");
    assert_eq!(snapshot.classes.len(), crate::models::AgentClass::ALL.len());
    assert_eq!(snapshot.queue.depth, 0);
    assert!(!snapshot.backpressure);
    assert_eq!(snapshot.limiter.keys.len(), 1);
    assert_eq!(
        snapshot.adaptive.strategy,
        crate::adaptive::ConcurrencyStrategy::Balanced
    );
}

#[tokio::test]
async fn health_endpoint_serves_json() {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    let dir = tempfile::tempdir().unwrap();
    let config = test_config(&dir);
    let stack = build_stack(config.clone(), Arc::new(ChainPlanner));

    let source = Arc::new(HealthSource::new(
        stack.queue.clone(),
        stack.orchestrator.clone(),
        stack.cache.clone(),
        stack.bus.clone(),
    ));
    let server = crate::api::ApiServer::new(config.api, source);

    let response = server
        .router()
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let parsed: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(parsed["service"], "hephaestus-core");
    assert!(parsed["classes"].is_object());
}
