//! External command integration tests.
//!
//! Tests that run real processes through [`CommandExecutor`]. They rely on
//! `sh` and `true` being available.

use cronkeeper::testing::{ManualClock, TestHarness};
use cronkeeper::{
    ActionPayload, Channel, CommandExecutor, CommandPayload, Engine, EngineError, InMemoryQueue,
    InMemoryStorage, InvocationRecord, InvocationStatus, JobDefinition, JobId, StateKind,
};
use std::sync::Arc;
use std::time::Duration;

/// Run one invocation of a job whose payload is `payload`.
async fn run_once(payload: Vec<u8>) -> (Engine, Result<(), EngineError>, InvocationRecord) {
    let queue = InMemoryQueue::new();
    let engine = Engine::builder(
        Arc::new(InMemoryStorage::new()),
        Arc::new(queue.clone()),
        Arc::new(CommandExecutor::new()),
    )
    .clock(Arc::new(ManualClock::new(TestHarness::start_time())))
    .build();

    let job_id = JobId::new("p/cmd");
    engine
        .update_job(&JobDefinition {
            job_id: job_id.clone(),
            revision: "rev1".into(),
            schedule: "* * * * *".into(),
            payload,
        })
        .await
        .unwrap();

    let tick = queue.drain().remove(0);
    engine.execute_serialized_action(&tick.payload, 0).await.unwrap();
    let start = queue.drain().remove(0);
    assert_eq!(start.channel, Channel::Invocations);
    assert!(matches!(
        ActionPayload::decode(&start.payload).unwrap(),
        ActionPayload::Start { .. }
    ));

    let result = engine.execute_serialized_action(&start.payload, 0).await;
    let invocation = engine.invocations(&job_id, 1).await.unwrap().remove(0);
    (engine, result, invocation)
}

/// Test: A command exiting with 0 succeeds.
#[tokio::test]
async fn test_command_success() {
    let payload = CommandPayload::new("true").to_bytes().unwrap();
    let (engine, result, inv) = run_once(payload).await;

    result.unwrap();
    assert_eq!(inv.status, InvocationStatus::Succeeded);
    assert!(inv.debug_log.contains("Running: true"));
    assert!(inv.debug_log.contains("Exit code: 0"));

    let job = engine.job(&JobId::new("p/cmd")).await.unwrap().unwrap();
    assert_eq!(job.state.kind, StateKind::Scheduled);
}

/// Test: A non-zero exit fails the invocation and keeps the output tail.
#[tokio::test]
async fn test_command_failure_captures_output() {
    let payload = CommandPayload::new("sh")
        .args(["-c", "echo out; echo err >&2; exit 3"])
        .to_bytes()
        .unwrap();
    let (_, result, inv) = run_once(payload).await;

    result.unwrap();
    assert_eq!(inv.status, InvocationStatus::Failed);
    assert!(inv.debug_log.contains("Exit code: 3"));
    assert!(inv.debug_log.contains("stdout:\nout"));
    assert!(inv.debug_log.contains("stderr:\nerr"));
}

/// Test: A command running past its timeout is killed and fails.
#[tokio::test]
async fn test_command_timeout() {
    let payload = CommandPayload::new("sleep")
        .args(["5"])
        .timeout(Duration::from_secs(1))
        .to_bytes()
        .unwrap();
    let (_, result, inv) = run_once(payload).await;

    result.unwrap();
    assert_eq!(inv.status, InvocationStatus::Failed);
    assert!(inv.debug_log.contains("timed out"));
}

/// Test: A program that cannot be spawned is a fatal launch error.
#[tokio::test]
async fn test_command_spawn_failure() {
    let payload = CommandPayload::new("/definitely/not/a/program")
        .to_bytes()
        .unwrap();
    let (engine, result, inv) = run_once(payload).await;

    let err = result.unwrap_err();
    assert!(matches!(err, EngineError::Launch(_)));
    assert!(!err.is_transient());
    assert_eq!(inv.status, InvocationStatus::Failed);
    assert!(inv.debug_log.contains("failed to spawn"));

    let job = engine.job(&JobId::new("p/cmd")).await.unwrap().unwrap();
    assert_eq!(job.state.kind, StateKind::Scheduled);
}

/// Test: A payload that is not a command is rejected.
#[tokio::test]
async fn test_command_bad_payload() {
    let (_, result, inv) = run_once(b"{}".to_vec()).await;

    let err = result.unwrap_err();
    assert!(!err.is_transient());
    assert_eq!(inv.status, InvocationStatus::Failed);
}
