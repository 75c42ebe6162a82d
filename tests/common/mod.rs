//! Common test utilities shared across integration tests.

#![allow(dead_code)]

use cronkeeper::testing::TestHarness;
use cronkeeper::{ActionPayload, Channel, DelayedTask, JobId, Nonce};
use std::time::Duration;

/// Create an enabled every-minute job and return its ID.
pub async fn scheduled_job(harness: &TestHarness, job_id: &str) -> JobId {
    harness
        .engine
        .update_job(&TestHarness::definition(job_id, "* * * * *"))
        .await
        .unwrap();
    JobId::new(job_id)
}

/// Deliver every pending tick and return the start requests they queued.
pub async fn fire_ticks(harness: &TestHarness) -> Vec<DelayedTask> {
    for result in harness.deliver_channel(Channel::Timers).await {
        result.unwrap();
    }
    harness.take(Channel::Invocations)
}

/// Schedule a job, fire its tick and return the single start request.
pub async fn queued_job(harness: &TestHarness, job_id: &str) -> (JobId, DelayedTask) {
    let job_id = scheduled_job(harness, job_id).await;
    let mut starts = fire_ticks(harness).await;
    assert_eq!(starts.len(), 1, "expected exactly one start request");
    (job_id, starts.remove(0))
}

/// Nonce carried by a tick task.
pub fn tick_nonce(task: &DelayedTask) -> Nonce {
    match ActionPayload::decode(&task.payload).unwrap() {
        ActionPayload::Tick { tick_nonce, .. } => tick_nonce,
        other => panic!("expected a tick, got {:?}", other),
    }
}

/// Wait for a condition to hold, polling every 10ms.
///
/// # Panics
///
/// Panics if the timeout is reached before the condition holds.
pub async fn wait_for<F>(what: &str, timeout: Duration, condition: F)
where
    F: Fn() -> bool,
{
    let start = tokio::time::Instant::now();
    while !condition() {
        if start.elapsed() > timeout {
            panic!("Timeout waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
