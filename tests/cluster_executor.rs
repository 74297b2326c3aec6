// tests/cluster_executor.rs

mod common;
use crate::common::{init_tracing, quiet_logs, unit_spec, with_timeout};

use std::time::{Duration, Instant};

use gangway::engine::{RunFailure, TerminationSignal};
use gangway::exec::cluster::{
    ClusterExecutor, ClusterSettings, POD_COMPLETED_REASON, PodCondition, PodEventKind, PodPhase,
    PodSnapshot,
};
use gangway::exec::logs::LogCopyError;
use gangway::spec::ExecutionProfile;
use gangway_test_utils::fake_cluster::{FakeClusterClient, event, exited, phase};

fn settings() -> ClusterSettings {
    ClusterSettings {
        run_timeout: Duration::from_secs(30),
        watch_timeout: Duration::from_secs(60),
        log_since: Duration::from_secs(300),
        log_drain: Duration::from_secs(2),
    }
}

#[tokio::test]
async fn successful_pod_is_created_and_deleted_once() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern().with_init_steps(Vec::new()), 0, &[]);
    let client = FakeClusterClient::new()
        .with_events(vec![
            event(PodEventKind::Added, PodSnapshot::with_phase(PodPhase::Pending)),
            phase(PodPhase::Running),
            phase(PodPhase::Succeeded),
        ])
        .with_logs(&spec.name, b"hello\n")
        .into_arc();

    let exec = ClusterExecutor::new(client.clone(), settings(), logs);
    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;

    assert_eq!(result, Ok(()));
    assert_eq!(client.created_count(), 1);
    assert_eq!(client.deleted_count(), 1);
    assert_eq!(*client.deleted.lock().unwrap(), vec![spec.name.clone()]);
}

#[tokio::test]
async fn non_zero_exit_wins_over_completed_condition() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let mut pod = PodSnapshot::with_phase(PodPhase::Running);
    pod.container_statuses.push(exited(&spec.name, 2));
    pod.conditions.push(PodCondition {
        kind: "Ready".to_string(),
        status: false,
        reason: Some(POD_COMPLETED_REASON.to_string()),
    });
    let client = FakeClusterClient::new()
        .with_events(vec![event(PodEventKind::Modified, pod)])
        .into_arc();

    let exec = ClusterExecutor::new(client.clone(), settings(), logs);
    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;

    assert_eq!(
        result,
        Err(RunFailure::NonZeroExit {
            unit: spec.name.clone(),
            container: spec.name.clone(),
            code: 2,
        })
    );
    assert_eq!(client.created_count(), client.deleted_count());
}

#[tokio::test]
async fn termination_returns_promptly_and_deletes_the_pod() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 1, &[]);
    let client = FakeClusterClient::new()
        .with_events(vec![phase(PodPhase::Pending)])
        .hold_open()
        .into_arc();
    let exec = ClusterExecutor::new(client.clone(), settings(), logs);

    let term = TerminationSignal::new();
    let trigger = term.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = with_timeout(exec.run(&spec, &term)).await;

    assert_eq!(result, Err(RunFailure::Terminated { unit: spec.name.clone() }));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(client.deleted_count(), 1);
    // Level-triggered: still observed as fired afterwards.
    assert!(term.is_cancelled());
}

#[tokio::test]
async fn already_fired_signal_creates_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());
    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let client = FakeClusterClient::new().into_arc();
    let exec = ClusterExecutor::new(client.clone(), settings(), logs);

    let term = TerminationSignal::new();
    term.cancel();
    let result = exec.run(&spec, &term).await;

    assert!(matches!(result, Err(RunFailure::Terminated { .. })));
    assert_eq!(client.created_count(), 0);
    assert_eq!(client.deleted_count(), 0);
}

#[tokio::test]
async fn closed_watch_is_an_orphaned_pod_failure() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let client = FakeClusterClient::new()
        .with_events(vec![phase(PodPhase::Pending)])
        .into_arc();
    let exec = ClusterExecutor::new(client.clone(), settings(), logs);

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;

    assert!(matches!(result, Err(RunFailure::WatchBroken { .. })));
    assert_eq!(client.deleted_count(), 1);
}

#[tokio::test]
async fn run_timeout_fires_before_the_watch_ceiling() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let client = FakeClusterClient::new()
        .with_events(vec![phase(PodPhase::Running)])
        .hold_open()
        .into_arc();
    let exec = ClusterExecutor::new(
        client.clone(),
        ClusterSettings {
            run_timeout: Duration::from_millis(200),
            ..settings()
        },
        logs,
    );

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;

    assert_eq!(
        result,
        Err(RunFailure::TimedOut {
            unit: spec.name.clone(),
            after: Duration::from_millis(200),
        })
    );
    assert_eq!(client.deleted_count(), 1);
}

#[tokio::test]
async fn creation_failure_leaves_nothing_to_delete() {
    let dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(dir.path());
    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let client = FakeClusterClient::new().failing_create().into_arc();
    let exec = ClusterExecutor::new(client.clone(), settings(), logs);

    let result = exec.run(&spec, &TerminationSignal::new()).await;

    assert!(matches!(result, Err(RunFailure::Creation(_))));
    assert_eq!(client.deleted_count(), 0);
}

#[tokio::test]
async fn logs_land_on_disk_in_order_for_every_container() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, mut errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let main_body: &[u8] = b"step 1\nstep 2\r\nstep 3\n";
    let client = FakeClusterClient::new()
        .with_events(vec![phase(PodPhase::Running), phase(PodPhase::Succeeded)])
        .with_logs("init", b"trust anchors\n")
        .with_logs(&spec.name, main_body)
        .into_arc();
    let exec = ClusterExecutor::new(client.clone(), settings(), logs);

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;
    assert_eq!(result, Ok(()));

    let main_log = std::fs::read(dir.path().join(format!("{0}-{0}.log", spec.name))).unwrap();
    assert_eq!(main_log, main_body);
    let init_log = std::fs::read(dir.path().join(format!("{}-init.log", spec.name))).unwrap();
    assert_eq!(init_log, b"trust anchors\n");

    let mut requested = client.log_requests.lock().unwrap().clone();
    requested.sort();
    assert_eq!(requested, vec![spec.name.clone(), "init".to_string()]);
    assert!(errors.try_recv().is_err());
}

#[tokio::test]
async fn failing_log_stream_does_not_fail_the_run() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let (logs, mut errors) = quiet_logs(dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    // No log body for "init": its stream cannot be opened.
    let client = FakeClusterClient::new()
        .with_events(vec![phase(PodPhase::Running), phase(PodPhase::Succeeded)])
        .with_logs(&spec.name, b"ok\n")
        .into_arc();
    let exec = ClusterExecutor::new(client.clone(), settings(), logs);

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;
    assert_eq!(result, Ok(()));

    let err = errors.try_recv().unwrap();
    assert!(matches!(err, LogCopyError::Stream { ref container, .. } if container == "init"));
    let main_log = std::fs::read(dir.path().join(format!("{0}-{0}.log", spec.name))).unwrap();
    assert_eq!(main_log, b"ok\n");
}
