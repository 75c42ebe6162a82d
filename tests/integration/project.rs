//! Project sync integration tests.
//!
//! Tests that verify whole projects are brought in line with their
//! definitions, including definitions loaded from YAML files.

use cronkeeper::testing::TestHarness;
use cronkeeper::{
    Channel, EngineError, JobDefinition, JobId, ProjectId, StateKind,
    load_definitions_from_directory,
};

fn defs(ids: &[&str]) -> Vec<JobDefinition> {
    ids.iter()
        .map(|id| TestHarness::definition(id, "* * * * *"))
        .collect()
}

/// Test: Definitions are created and jobs missing from them are disabled.
#[tokio::test]
async fn test_update_project_jobs_diff() {
    let harness = TestHarness::new();
    let project = ProjectId::new("p");

    harness
        .engine
        .update_project_jobs(&project, &defs(&["p/a", "p/b", "p/c"]))
        .await
        .unwrap();
    assert_eq!(harness.queue.tasks_on(Channel::Timers).len(), 3);

    harness
        .engine
        .update_project_jobs(&project, &defs(&["p/a", "p/c"]))
        .await
        .unwrap();

    assert!(harness.job("p/a").await.enabled);
    assert!(harness.job("p/c").await.enabled);
    let removed = harness.job("p/b").await;
    assert!(!removed.enabled);
    assert_eq!(removed.state.kind, StateKind::Disabled);

    // Nothing else changed, so nothing new was queued
    assert_eq!(harness.queue.len(), 3);
}

/// Test: Other projects are left alone.
#[tokio::test]
async fn test_update_project_jobs_is_scoped() {
    let harness = TestHarness::new();

    harness
        .engine
        .update_project_jobs(&ProjectId::new("p"), &defs(&["p/a"]))
        .await
        .unwrap();
    harness
        .engine
        .update_project_jobs(&ProjectId::new("q"), &defs(&["q/a"]))
        .await
        .unwrap();

    assert_eq!(
        harness.engine.get_all_projects().await.unwrap(),
        vec![ProjectId::new("p"), ProjectId::new("q")]
    );

    harness
        .engine
        .update_project_jobs(&ProjectId::new("q"), &[])
        .await
        .unwrap();

    assert!(harness.job("p/a").await.enabled);
    assert!(!harness.job("q/a").await.enabled);
    assert_eq!(
        harness.engine.get_all_projects().await.unwrap(),
        vec![ProjectId::new("p")]
    );
}

/// Test: Definitions for another project are rejected without blocking the
/// valid ones.
#[tokio::test]
async fn test_wrong_project_rejected() {
    let harness = TestHarness::new();
    let mut definitions = defs(&["p/a", "q/x"]);
    definitions.push(TestHarness::definition("noslash", "* * * * *"));

    let err = harness
        .engine
        .update_project_jobs(&ProjectId::new("p"), &definitions)
        .await
        .unwrap_err();

    let EngineError::Multiple(errors) = err else {
        panic!("expected a batch error");
    };
    assert_eq!(errors.len(), 2);
    assert!(errors.iter().any(|e| matches!(
        e,
        EngineError::WrongProject { job_id, .. } if job_id == &JobId::new("q/x")
    )));
    assert!(errors.iter().any(|e| matches!(e, EngineError::InvalidJobId(_))));

    assert!(harness.job("p/a").await.enabled);
    assert!(harness.engine.job(&JobId::new("q/x")).await.unwrap().is_none());
}

/// Test: One bad definition does not prevent the others from being applied.
#[tokio::test]
async fn test_bad_schedule_in_batch() {
    let harness = TestHarness::new();
    let definitions = vec![
        TestHarness::definition("p/good", "*/5 * * * *"),
        TestHarness::definition("p/bad", "61 * * * *"),
    ];

    let err = harness
        .engine
        .update_project_jobs(&ProjectId::new("p"), &definitions)
        .await
        .unwrap_err();

    let EngineError::Multiple(errors) = err else {
        panic!("expected a batch error");
    };
    assert_eq!(errors.len(), 1);
    assert!(matches!(errors[0], EngineError::BadSchedule { .. }));
    assert_eq!(harness.job("p/good").await.state.kind, StateKind::Scheduled);
}

/// Test: Definitions loaded from a directory drive the engine.
#[tokio::test]
async fn test_definitions_from_directory() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("infra.yaml"),
        r#"
jobs:
  - name: backup
    schedule: "0 3 * * *"
    payload:
      command: backup.sh
  - name: heartbeat
    schedule: "@hourly"
"#,
    )
    .unwrap();

    let harness = TestHarness::new();
    let projects = load_definitions_from_directory(dir.path()).unwrap();
    assert_eq!(projects.len(), 1);
    for project in &projects {
        harness
            .engine
            .update_project_jobs(&project.project, &project.definitions)
            .await
            .unwrap();
    }

    let backup = harness.job("infra/backup").await;
    assert_eq!(backup.revision, projects[0].revision);
    assert_eq!(backup.state.kind, StateKind::Scheduled);
    let payload: serde_json::Value = serde_json::from_slice(&backup.payload).unwrap();
    assert_eq!(payload["command"], "backup.sh");
    assert_eq!(harness.job("infra/heartbeat").await.schedule, "@hourly");

    // Reloading the unchanged file writes nothing
    let writes = harness.storage.job_writes();
    let reloaded = load_definitions_from_directory(dir.path()).unwrap();
    harness
        .engine
        .update_project_jobs(&reloaded[0].project, &reloaded[0].definitions)
        .await
        .unwrap();
    assert_eq!(harness.storage.job_writes(), writes);
}
