//! Job lifecycle integration tests.
//!
//! Tests that verify how definitions turn into scheduled ticks and how
//! duplicated or stale deliveries are absorbed.

use crate::common::{fire_ticks, scheduled_job, tick_nonce};
use chrono::{TimeZone, Utc};
use cronkeeper::testing::TestHarness;
use cronkeeper::{
    ActionPayload, Channel, EngineConfig, EngineError, Environment, JobId, Nonce, StateKind,
};

/// Test: A new job is enabled with exactly one tick at its next fire time.
#[tokio::test]
async fn test_new_job_gets_single_tick() {
    let harness = TestHarness::new();
    scheduled_job(&harness, "p/j1").await;

    let ticks = harness.queue.tasks_on(Channel::Timers);
    assert_eq!(harness.queue.len(), 1);
    assert_eq!(ticks.len(), 1);
    assert_eq!(ticks[0].eta, Utc.with_ymd_and_hms(2024, 1, 15, 12, 1, 0).unwrap());

    let job = harness.job("p/j1").await;
    assert!(job.enabled);
    assert_eq!(job.revision, "rev1");
    assert_eq!(job.schedule, "* * * * *");
    assert_eq!(job.state.kind, StateKind::Scheduled);
    assert_eq!(job.state.tick_nonce, Some(tick_nonce(&ticks[0])));
}

/// Test: Re-applying the same revision writes nothing and queues nothing.
#[tokio::test]
async fn test_repeated_update_is_noop() {
    let harness = TestHarness::new();
    let def = TestHarness::definition("p/j1", "* * * * *");

    harness.engine.update_job(&def).await.unwrap();
    assert_eq!(harness.storage.job_writes(), 1);

    harness.engine.update_job(&def).await.unwrap();
    harness.engine.update_job(&def).await.unwrap();

    assert_eq!(harness.storage.job_writes(), 1);
    assert_eq!(harness.queue.len(), 1);
}

/// Test: A new revision with the same schedule keeps the pending tick.
#[tokio::test]
async fn test_new_revision_keeps_pending_tick() {
    let harness = TestHarness::new();
    scheduled_job(&harness, "p/j1").await;
    let before = harness.job("p/j1").await;

    let mut def = TestHarness::definition("p/j1", "* * * * *");
    def.revision = "rev2".into();
    def.payload = br#"{"command":"true"}"#.to_vec();
    harness.engine.update_job(&def).await.unwrap();

    let after = harness.job("p/j1").await;
    assert_eq!(after.revision, "rev2");
    assert_eq!(after.payload, def.payload);
    assert_eq!(after.state, before.state);
    assert_eq!(harness.queue.len(), 1);
}

/// Test: A schedule change re-arms the tick and makes the old one stale.
#[tokio::test]
async fn test_schedule_change_rearms_tick() {
    let harness = TestHarness::new();
    scheduled_job(&harness, "p/j1").await;
    let old_tick = harness.take(Channel::Timers).remove(0);

    let mut def = TestHarness::definition("p/j1", "0 * * * *");
    def.revision = "rev2".into();
    harness.engine.update_job(&def).await.unwrap();

    let new_ticks = harness.queue.tasks_on(Channel::Timers);
    assert_eq!(new_ticks.len(), 1);
    assert_eq!(
        new_ticks[0].eta,
        Utc.with_ymd_and_hms(2024, 1, 15, 13, 0, 0).unwrap()
    );
    assert_ne!(tick_nonce(&new_ticks[0]), tick_nonce(&old_tick));

    // The superseded tick is absorbed without effect
    let before = harness.job("p/j1").await;
    harness.deliver(&old_tick, 0).await.unwrap();
    assert_eq!(harness.job("p/j1").await, before);
    assert!(harness.queue.tasks_on(Channel::Invocations).is_empty());
}

/// Test: A duplicated tick queues a single start request.
#[tokio::test]
async fn test_duplicate_tick_queues_one_start() {
    let harness = TestHarness::new();
    scheduled_job(&harness, "p/j1").await;
    let tick = harness.take(Channel::Timers).remove(0);

    harness.deliver(&tick, 0).await.unwrap();
    harness.deliver(&tick, 1).await.unwrap();
    harness.deliver(&tick, 0).await.unwrap();

    let starts = harness.take(Channel::Invocations);
    assert_eq!(starts.len(), 1);
    assert!(harness.queue.is_empty());

    let job = harness.job("p/j1").await;
    assert_eq!(job.state.kind, StateKind::Queued);
    match ActionPayload::decode(&starts[0].payload).unwrap() {
        ActionPayload::Start {
            job_id,
            invocation_nonce,
        } => {
            assert_eq!(job_id, JobId::new("p/j1"));
            assert_eq!(job.state.invocation_nonce, Some(invocation_nonce));
        }
        other => panic!("expected a start request, got {:?}", other),
    }
}

/// Test: A tick with a nonce the job never issued is ignored.
#[tokio::test]
async fn test_unknown_tick_nonce_ignored() {
    let harness = TestHarness::new();
    let job_id = scheduled_job(&harness, "p/j1").await;
    let before = harness.job("p/j1").await;
    let writes = harness.storage.job_writes();

    harness
        .engine
        .timer_tick(&job_id, Nonce::new(9999))
        .await
        .unwrap();

    assert_eq!(harness.job("p/j1").await, before);
    assert_eq!(harness.storage.job_writes(), writes);
}

/// Test: A tick for a job that does not exist is dropped without writes.
#[tokio::test]
async fn test_tick_for_missing_job() {
    let harness = TestHarness::new();

    harness
        .engine
        .timer_tick(&JobId::new("p/ghost"), Nonce::new(1))
        .await
        .unwrap();

    assert_eq!(harness.storage.job_writes(), 0);
    assert!(harness.engine.job(&JobId::new("p/ghost")).await.unwrap().is_none());
}

/// Test: Disabling drops the pending tick; re-enabling arms a new one.
#[tokio::test]
async fn test_disable_then_reenable() {
    let harness = TestHarness::new();
    let job_id = scheduled_job(&harness, "p/j1").await;
    let old_tick = harness.take(Channel::Timers).remove(0);

    harness.engine.disable_job(&job_id).await.unwrap();
    let job = harness.job("p/j1").await;
    assert!(!job.enabled);
    assert_eq!(job.state.kind, StateKind::Disabled);

    harness.deliver(&old_tick, 0).await.unwrap();
    assert!(harness.queue.is_empty());

    // Disabling twice is a no-op
    let writes = harness.storage.job_writes();
    harness.engine.disable_job(&job_id).await.unwrap();
    assert_eq!(harness.storage.job_writes(), writes);

    // Same revision as before, but the job is disabled so it is not skipped
    harness
        .engine
        .update_job(&TestHarness::definition("p/j1", "* * * * *"))
        .await
        .unwrap();
    let job = harness.job("p/j1").await;
    assert!(job.enabled);
    assert_eq!(job.state.kind, StateKind::Scheduled);
    assert_eq!(harness.queue.tasks_on(Channel::Timers).len(), 1);
}

/// Test: A schedule that does not parse is a fatal error and stores nothing.
#[tokio::test]
async fn test_bad_schedule_is_fatal() {
    let harness = TestHarness::new();
    let def = TestHarness::definition("p/j1", "not a schedule");

    let err = harness.engine.update_job(&def).await.unwrap_err();
    assert!(matches!(err, EngineError::BadSchedule { .. }));
    assert!(!err.is_transient());

    assert!(harness.engine.job(&def.job_id).await.unwrap().is_none());
    assert!(harness.queue.is_empty());
}

/// Test: A new revision with a broken schedule leaves the running job alone,
/// no matter how often it is retried.
#[tokio::test]
async fn test_bad_schedule_keeps_existing_job() {
    let harness = TestHarness::new();
    scheduled_job(&harness, "p/j1").await;
    let before = harness.job("p/j1").await;

    let mut def = TestHarness::definition("p/j1", "not a schedule");
    def.revision = "rev2".into();
    for _ in 0..3 {
        let err = harness.engine.update_job(&def).await.unwrap_err();
        assert!(matches!(err, EngineError::BadSchedule { .. }));
        assert!(!err.is_transient());
    }

    let job = harness.job("p/j1").await;
    assert_eq!(job, before);
    assert_eq!(job.schedule, "* * * * *");
    assert_eq!(harness.queue.len(), 1);

    // The tick armed under the old schedule still fires
    let starts = fire_ticks(&harness).await;
    assert_eq!(starts.len(), 1);
    assert_eq!(harness.job("p/j1").await.state.kind, StateKind::Queued);
}

/// Test: Malformed job IDs are rejected.
#[tokio::test]
async fn test_invalid_job_id_rejected() {
    let harness = TestHarness::new();

    for id in ["noslash", "/j", "p/", "p/a/b"] {
        let err = harness
            .engine
            .update_job(&TestHarness::definition(id, "* * * * *"))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidJobId(_)), "{}", id);
    }
    assert_eq!(harness.storage.job_writes(), 0);
}

/// Test: Contention is retried and only the committed attempt's tick counts.
#[tokio::test]
async fn test_contention_is_retried() {
    let harness = TestHarness::new();
    harness.storage.inject_contention(2);

    scheduled_job(&harness, "p/j1").await;

    // One tick per attempt was queued; the first two are stale
    let ticks = harness.take(Channel::Timers);
    assert_eq!(ticks.len(), 3);
    let job = harness.job("p/j1").await;
    assert_eq!(job.state.tick_nonce, Some(tick_nonce(&ticks[2])));

    harness.deliver(&ticks[0], 0).await.unwrap();
    harness.deliver(&ticks[1], 0).await.unwrap();
    assert!(harness.queue.is_empty());

    harness.deliver(&ticks[2], 0).await.unwrap();
    assert_eq!(harness.queue.tasks_on(Channel::Invocations).len(), 1);
}

/// Test: Running out of transaction attempts is a transient storage error.
#[tokio::test]
async fn test_contention_exhaustion_is_transient() {
    let config = EngineConfig {
        transaction_attempts: 3,
        ..EngineConfig::default()
    };
    let harness = TestHarness::with_config(config);
    harness.storage.inject_contention(3);

    let err = harness
        .engine
        .update_job(&TestHarness::definition("p/j1", "* * * * *"))
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::Storage(_)));
    assert!(err.is_transient());
    assert!(harness.engine.job(&JobId::new("p/j1")).await.unwrap().is_none());
}

/// Test: A failed commit is transient and a later retry applies the update.
#[tokio::test]
async fn test_commit_failure_is_transient() {
    let harness = TestHarness::new();
    harness.storage.inject_commit_failures(1);
    let def = TestHarness::definition("p/j1", "* * * * *");

    let err = harness.engine.update_job(&def).await.unwrap_err();
    assert!(matches!(err, EngineError::Storage(_)));
    assert!(err.is_transient());
    assert!(harness.engine.job(&def.job_id).await.unwrap().is_none());
    assert_eq!(harness.storage.job_writes(), 0);

    harness.engine.update_job(&def).await.unwrap();

    // The tick queued by the failed attempt is stale
    let ticks = harness.queue.tasks_on(Channel::Timers);
    assert_eq!(ticks.len(), 2);
    let job = harness.job("p/j1").await;
    assert_eq!(job.state.kind, StateKind::Scheduled);
    assert_eq!(job.state.tick_nonce, Some(tick_nonce(&ticks[1])));
    assert_ne!(job.state.tick_nonce, Some(tick_nonce(&ticks[0])));
}

/// Test: Queue failures abort the transaction and can be retried.
#[tokio::test]
async fn test_queue_failure_aborts_update() {
    let harness = TestHarness::new();
    harness.queue.fail_next(1);
    let def = TestHarness::definition("p/j1", "* * * * *");

    let err = harness.engine.update_job(&def).await.unwrap_err();
    assert!(matches!(err, EngineError::Queue(_)));
    assert!(err.is_transient());
    assert!(harness.engine.job(&def.job_id).await.unwrap().is_none());

    harness.engine.update_job(&def).await.unwrap();
    assert_eq!(harness.job("p/j1").await.state.kind, StateKind::Scheduled);
}

/// Test: Serialized actions are routed by kind; garbage is fatal.
#[tokio::test]
async fn test_execute_serialized_action() {
    let harness = TestHarness::new();
    let job_id = scheduled_job(&harness, "p/j1").await;
    let nonce = harness.job("p/j1").await.state.tick_nonce.unwrap();

    let payload = ActionPayload::Tick {
        job_id: job_id.clone(),
        tick_nonce: nonce,
    }
    .encode()
    .unwrap();
    harness
        .engine
        .execute_serialized_action(&payload, 0)
        .await
        .unwrap();
    assert_eq!(harness.job("p/j1").await.state.kind, StateKind::Queued);

    let err = harness
        .engine
        .execute_serialized_action(b"not json", 0)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::BadPayload(_)));
    assert!(!err.is_transient());
}

/// Test: Resetting jobs is refused outside a dev server.
#[tokio::test]
async fn test_reset_requires_dev_server() {
    let harness = TestHarness::new();
    scheduled_job(&harness, "p/j1").await;

    let err = harness
        .engine
        .reset_all_jobs_on_dev_server()
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::NotDevServer));
    assert_eq!(harness.queue.len(), 1);
}

/// Test: Resetting on a dev server drops queued work and re-arms every job.
#[tokio::test]
async fn test_reset_on_dev_server() {
    let config = EngineConfig {
        environment: Environment::DevServer,
        ..EngineConfig::default()
    };
    let harness = TestHarness::with_config(config);
    scheduled_job(&harness, "p/j1").await;
    scheduled_job(&harness, "p/j2").await;

    // j1 is waiting for its start request
    let stale_tick = harness
        .take(Channel::Timers)
        .into_iter()
        .find(|t| ActionPayload::decode(&t.payload).unwrap().job_id() == &JobId::new("p/j2"))
        .unwrap();
    harness
        .engine
        .timer_tick(
            &JobId::new("p/j1"),
            harness.job("p/j1").await.state.tick_nonce.unwrap(),
        )
        .await
        .unwrap();
    let stale_start = harness.take(Channel::Invocations).remove(0);

    harness.engine.reset_all_jobs_on_dev_server().await.unwrap();

    for id in ["p/j1", "p/j2"] {
        let job = harness.job(id).await;
        assert!(job.enabled);
        assert_eq!(job.state.kind, StateKind::Scheduled);
    }
    assert_eq!(harness.queue.tasks_on(Channel::Timers).len(), 2);

    harness.deliver(&stale_tick, 0).await.unwrap();
    harness.deliver(&stale_start, 0).await.unwrap();
    assert_eq!(harness.executor.launch_count(), 0);
    assert!(harness.queue.tasks_on(Channel::Invocations).is_empty());

    // The re-armed ticks work as usual
    assert_eq!(fire_ticks(&harness).await.len(), 2);
}
