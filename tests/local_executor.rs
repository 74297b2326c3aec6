// tests/local_executor.rs

mod common;
use crate::common::{init_tracing, quiet_logs, unit_spec, with_timeout};

use std::path::PathBuf;
use std::time::{Duration, Instant};

use gangway::engine::{RunFailure, TerminationSignal};
use gangway::exec::local::{LOCAL_MODE_ENV, LocalExecutor, LocalSettings};
use gangway::spec::{EnvVar, ExecutionProfile};
use gangway_test_utils::fake_runtime::FakeLocalRuntime;

fn settings(work_dir: PathBuf) -> LocalSettings {
    LocalSettings {
        host_uid: 1000,
        work_dir,
        // chcon is not available everywhere tests run.
        selinux_label: None,
        log_drain: Duration::from_secs(2),
        ..LocalSettings::default()
    }
}

#[tokio::test]
async fn ephemeral_scratch_is_bound_and_cleaned_on_success() {
    init_tracing();
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new().exiting_with(0).into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;
    assert_eq!(result, Ok(()));

    let scratch = work.path().join(&spec.name);
    let created = runtime.created.lock().unwrap().clone();
    assert_eq!(created[0].binds[0].source, scratch);
    assert_eq!(created[0].binds[0].destination, "/srv");
    assert_eq!(created[1].name, format!("{}-cleaner", spec.name));
    assert_eq!(created[1].user, "root");

    assert_eq!(
        runtime.removed_names(),
        vec![spec.name.clone(), format!("{}-cleaner", spec.name)]
    );
    assert!(!scratch.exists());
}

#[tokio::test]
async fn ephemeral_scratch_is_cleaned_on_failure_too() {
    init_tracing();
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new().exiting_with(3).into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;
    assert_eq!(
        result,
        Err(RunFailure::NonZeroExit {
            unit: spec.name.clone(),
            container: spec.name.clone(),
            code: 3,
        })
    );

    assert_eq!(runtime.created_names().len(), 2);
    assert!(!work.path().join(&spec.name).exists());
}

#[tokio::test]
async fn pre_bound_scratch_is_kept_and_not_cleaned() {
    init_tracing();
    let work = tempfile::tempdir().unwrap();
    let host = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new().into_arc();
    let exec = LocalExecutor::new(
        runtime.clone(),
        LocalSettings {
            scratch_dir: Some(host.path().to_path_buf()),
            ..settings(work.path().to_path_buf())
        },
        logs,
    );

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;
    assert_eq!(result, Ok(()));

    assert_eq!(runtime.created_names(), vec![spec.name.clone()]);
    assert_eq!(runtime.removed_names(), vec![spec.name.clone()]);
    assert!(host.path().exists());
}

#[tokio::test]
async fn termination_tears_down_exactly_once() {
    init_tracing();
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new().blocking_until_removed().into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

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
    // Main container and cleaner, each removed once.
    assert_eq!(
        runtime.removed_names(),
        vec![spec.name.clone(), format!("{}-cleaner", spec.name)]
    );
    assert!(!work.path().join(&spec.name).exists());
}

#[tokio::test]
async fn container_sees_local_marker_and_caller_env() {
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[EnvVar::new("FOO", "bar")]);
    let runtime = FakeLocalRuntime::new().into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    with_timeout(exec.run(&spec, &TerminationSignal::new()))
        .await
        .unwrap();

    let created = runtime.created.lock().unwrap();
    let env = &created[0].env;
    assert!(env.contains(&EnvVar::new(LOCAL_MODE_ENV, "1")));
    assert!(env.contains(&EnvVar::new("FOO", "bar")));
    assert!(created[0].privileged && created[0].host_network);
    assert_eq!(created[0].uid_map[0].host_id, 1000);
}

#[tokio::test]
async fn attach_output_is_logged_under_the_unit_name() {
    init_tracing();
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new()
        .with_output(b"building\ndone\n")
        .into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    with_timeout(exec.run(&spec, &TerminationSignal::new()))
        .await
        .unwrap();

    let log = std::fs::read(logs_dir.path().join(format!("{0}-{0}.log", spec.name))).unwrap();
    assert_eq!(log, b"building\ndone\n");
}

#[tokio::test]
async fn create_failure_discards_scratch() {
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new().failing_create().into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    let result = exec.run(&spec, &TerminationSignal::new()).await;

    assert!(matches!(result, Err(RunFailure::Creation(_))));
    assert!(runtime.removed_names().is_empty());
    assert!(!work.path().join(&spec.name).exists());
}

#[tokio::test]
async fn start_failure_is_a_backend_error_and_still_cleans_up() {
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new().failing_start().into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    let result = with_timeout(exec.run(&spec, &TerminationSignal::new())).await;

    assert!(matches!(result, Err(RunFailure::Backend(_))));
    assert_eq!(
        runtime.removed_names(),
        vec![spec.name.clone(), format!("{}-cleaner", spec.name)]
    );
    assert!(!work.path().join(&spec.name).exists());
}

#[tokio::test]
async fn termination_during_start_is_reported_as_terminated() {
    init_tracing();
    let work = tempfile::tempdir().unwrap();
    let logs_dir = tempfile::tempdir().unwrap();
    let (logs, _errors) = quiet_logs(logs_dir.path());

    let spec = unit_spec(ExecutionProfile::modern(), 0, &[]);
    let runtime = FakeLocalRuntime::new()
        .with_start_delay(Duration::from_millis(300))
        .into_arc();
    let exec = LocalExecutor::new(runtime.clone(), settings(work.path().to_path_buf()), logs);

    let term = TerminationSignal::new();
    let trigger = term.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let result = with_timeout(exec.run(&spec, &term)).await;

    assert_eq!(result, Err(RunFailure::Terminated { unit: spec.name.clone() }));
    assert_eq!(
        runtime.removed_names(),
        vec![spec.name.clone(), format!("{}-cleaner", spec.name)]
    );
    assert!(!work.path().join(&spec.name).exists());
}
