// src/exec/cluster.rs

//! Cluster executor: runs a [`UnitSpec`] as a pod and supervises it through
//! a watch on that pod.
//!
//! The pod is deleted with a zero grace period on every exit path. Once
//! creation succeeds a [`PodReaper`] is armed; the normal path reaps it
//! explicitly, and if the run future is dropped mid-flight the reaper's
//! `Drop` schedules the delete on the runtime instead.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::{ExecutionResult, RunFailure, TerminationSignal};
use crate::errors::Result;
use crate::exec::backend::BoxFuture;
use crate::exec::logs::{LogMultiplexer, LogStream, drain_copies};
use crate::spec::UnitSpec;

/// Condition reason some orchestrators report once every container is done.
pub const POD_COMPLETED_REASON: &str = "PodCompleted";

/// What `create` hands back: the pod's name and the resource version the
/// watch should start from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodHandle {
    pub name: String,
    pub resource_version: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodCondition {
    pub kind: String,
    pub status: bool,
    pub reason: Option<String>,
}

/// A container status; `exit_code` is set once the container terminated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerState {
    pub name: String,
    pub exit_code: Option<i32>,
}

/// The parts of a pod the watch loop looks at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub phase: PodPhase,
    pub reason: Option<String>,
    pub conditions: Vec<PodCondition>,
    pub init_container_statuses: Vec<ContainerState>,
    pub container_statuses: Vec<ContainerState>,
}

impl PodSnapshot {
    pub fn with_phase(phase: PodPhase) -> Self {
        Self {
            phase,
            reason: None,
            conditions: Vec::new(),
            init_container_statuses: Vec::new(),
            container_statuses: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodEvent {
    pub kind: PodEventKind,
    pub pod: PodSnapshot,
}

/// Watch subscription. The sender side closing means the watch broke.
pub type PodEventStream = mpsc::Receiver<Result<PodEvent>>;

/// Pod API consumed by the executor.
pub trait ClusterClient: Send + Sync + 'static {
    fn create_pod<'a>(&'a self, spec: &'a UnitSpec) -> BoxFuture<'a, Result<PodHandle>>;

    /// Watch one pod by name starting at `from_version`; the server closes
    /// the stream after `timeout`.
    fn watch_pod<'a>(
        &'a self,
        name: &'a str,
        from_version: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<PodEventStream>>;

    /// Follow one container's logs starting `since` before now.
    fn pod_logs<'a>(
        &'a self,
        name: &'a str,
        container: &'a str,
        since: Duration,
    ) -> BoxFuture<'a, Result<LogStream>>;

    fn delete_pod<'a>(&'a self, name: &'a str, grace: Duration) -> BoxFuture<'a, Result<()>>;
}

/// Timing knobs for the cluster backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterSettings {
    /// Absolute run timeout.
    pub run_timeout: Duration,
    /// Hard ceiling on the watch subscription; a backstop, longer than
    /// `run_timeout`.
    pub watch_timeout: Duration,
    /// Window before "now" each log read starts at.
    pub log_since: Duration,
    /// Time log copies get to finish after the result is decided.
    pub log_drain: Duration,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            run_timeout: Duration::from_secs(90 * 60),
            watch_timeout: Duration::from_secs(2 * 60 * 60),
            log_since: Duration::from_secs(300),
            log_drain: Duration::from_secs(5),
        }
    }
}

/// Outcome of evaluating one watch event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Evaluation {
    /// The pod was seen running and logs have not been started yet.
    pub start_logs: bool,
    /// Set once the event decides the run.
    pub finished: Option<ExecutionResult>,
}

impl Evaluation {
    fn finish(result: ExecutionResult) -> Self {
        Self {
            start_logs: false,
            finished: Some(result),
        }
    }
}

/// Evaluate one watch event. Checks run in a fixed order:
///
/// 1. any terminated container with a non-zero exit code fails the run;
/// 2. an explicit `PodCompleted` condition reason succeeds it;
/// 3. running (and whether logs must start now), a deleted pod fails;
/// 4. terminal phase, last, so a pod that is both running and complete is
///    still reported complete.
pub fn evaluate(unit: &str, event: &PodEvent, logs_started: bool) -> Evaluation {
    if let Some(failure) = failed_container(unit, &event.pod) {
        return Evaluation::finish(Err(failure));
    }

    if has_completed_condition(&event.pod) {
        return Evaluation::finish(Ok(()));
    }

    let running = match pod_running(unit, event) {
        Ok(running) => running,
        Err(failure) => return Evaluation::finish(Err(failure)),
    };

    Evaluation {
        start_logs: running && !logs_started,
        finished: pod_completed(unit, &event.pod),
    }
}

fn failed_container(unit: &str, pod: &PodSnapshot) -> Option<RunFailure> {
    pod.init_container_statuses
        .iter()
        .chain(&pod.container_statuses)
        .find_map(|c| match c.exit_code {
            Some(code) if code != 0 => Some(RunFailure::NonZeroExit {
                unit: unit.to_string(),
                container: c.name.clone(),
                code: i64::from(code),
            }),
            _ => None,
        })
}

fn has_completed_condition(pod: &PodSnapshot) -> bool {
    pod.conditions
        .iter()
        .any(|c| c.reason.as_deref() == Some(POD_COMPLETED_REASON))
}

fn pod_running(unit: &str, event: &PodEvent) -> std::result::Result<bool, RunFailure> {
    if event.kind == PodEventKind::Deleted {
        return Err(RunFailure::WatchBroken {
            unit: unit.to_string(),
            reason: "pod was deleted".to_string(),
        });
    }
    Ok(event.pod.phase == PodPhase::Running)
}

fn pod_completed(unit: &str, pod: &PodSnapshot) -> Option<ExecutionResult> {
    match pod.phase {
        PodPhase::Succeeded => Some(Ok(())),
        PodPhase::Failed => Some(Err(RunFailure::UnitFailed {
            unit: unit.to_string(),
            reason: pod
                .reason
                .clone()
                .unwrap_or_else(|| "pod phase Failed".to_string()),
        })),
        _ => None,
    }
}

/// Runs units as pods on a managed cluster.
pub struct ClusterExecutor<C: ClusterClient> {
    client: Arc<C>,
    settings: ClusterSettings,
    logs: LogMultiplexer,
}

impl<C: ClusterClient> std::fmt::Debug for ClusterExecutor<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterExecutor")
            .field("settings", &self.settings)
            .field("logs", &self.logs)
            .finish_non_exhaustive()
    }
}

impl<C: ClusterClient> ClusterExecutor<C> {
    pub fn new(client: Arc<C>, settings: ClusterSettings, logs: LogMultiplexer) -> Self {
        Self {
            client,
            settings,
            logs,
        }
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    /// Create, watch and always delete one pod.
    pub async fn run(&self, spec: &UnitSpec, term: &TerminationSignal) -> ExecutionResult {
        if term.is_cancelled() {
            return Err(RunFailure::Terminated {
                unit: spec.name.clone(),
            });
        }

        let handle = self.client.create_pod(spec).await.map_err(|e| {
            error!(pod = %spec.name, error = %e, "failed to create pod");
            RunFailure::Creation(format!("pod {}: {e}", spec.name))
        })?;
        info!(pod = %handle.name, resource_version = %handle.resource_version, "pod created");

        let reaper = PodReaper::arm(Arc::clone(&self.client), handle.name.clone());
        let log_stop = term.child_token();
        let mut log_tasks = Vec::new();

        let result = tokio::select! {
            biased;
            _ = term.cancelled() => {
                warn!(pod = %handle.name, "pod was signalled to terminate by the caller");
                Err(RunFailure::Terminated { unit: spec.name.clone() })
            }
            _ = tokio::time::sleep(self.settings.run_timeout) => {
                warn!(pod = %handle.name, timeout = ?self.settings.run_timeout, "pod did not complete work in time");
                Err(RunFailure::TimedOut { unit: spec.name.clone(), after: self.settings.run_timeout })
            }
            result = self.watch(spec, &handle, term, &log_stop, &mut log_tasks) => result,
        };

        self.drain_logs(log_tasks, &log_stop).await;
        reaper.reap().await;

        match &result {
            Ok(()) => info!(pod = %handle.name, "pod has completed"),
            Err(failure) => error!(pod = %handle.name, error = %failure, "pod run failed"),
        }
        result
    }

    async fn watch(
        &self,
        spec: &UnitSpec,
        handle: &PodHandle,
        term: &TerminationSignal,
        log_stop: &TerminationSignal,
        log_tasks: &mut Vec<JoinHandle<()>>,
    ) -> ExecutionResult {
        let broken = |reason: String| RunFailure::WatchBroken {
            unit: spec.name.clone(),
            reason,
        };

        let mut events = self
            .client
            .watch_pod(&handle.name, &handle.resource_version, self.settings.watch_timeout)
            .await
            .map_err(|e| broken(format!("failed to open watch: {e}")))?;
        debug!(pod = %handle.name, "watch opened");

        let mut logs_started = false;

        loop {
            if term.is_cancelled() {
                return Err(RunFailure::Terminated {
                    unit: spec.name.clone(),
                });
            }

            let next = tokio::select! {
                biased;
                _ = term.cancelled() => {
                    return Err(RunFailure::Terminated { unit: spec.name.clone() });
                }
                next = events.recv() => next,
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    error!(pod = %handle.name, error = %e, "watch reported an error");
                    return Err(broken(e.to_string()));
                }
                None => {
                    error!(pod = %handle.name, "failed watching pod: channel closed");
                    return Err(broken("watch channel closed".to_string()));
                }
            };

            let evaluation = evaluate(&spec.name, &event, logs_started);

            if evaluation.start_logs {
                info!(pod = %handle.name, "starting logging");
                self.start_logs(spec, handle, log_stop, log_tasks);
                logs_started = true;
            }

            if let Some(result) = evaluation.finished {
                return result;
            }

            let reasons: Vec<&str> = event
                .pod
                .conditions
                .iter()
                .filter_map(|c| c.reason.as_deref())
                .collect();
            info!(
                pod = %handle.name,
                phase = ?event.pod.phase,
                running = logs_started,
                conditions = ?reasons,
                "waiting..."
            );
        }
    }

    /// One copy task per container, init containers first.
    fn start_logs(
        &self,
        spec: &UnitSpec,
        handle: &PodHandle,
        log_stop: &TerminationSignal,
        log_tasks: &mut Vec<JoinHandle<()>>,
    ) {
        for container in spec.container_names() {
            let client = Arc::clone(&self.client);
            let pod = handle.name.clone();
            let name = container.clone();
            let since = self.settings.log_since;

            let open = async move { client.pod_logs(&pod, &name, since).await };
            log_tasks.push(self.logs.spawn(
                handle.name.clone(),
                container,
                open,
                log_stop.clone(),
            ));
        }
    }

    async fn drain_logs(&self, tasks: Vec<JoinHandle<()>>, log_stop: &TerminationSignal) {
        drain_copies(tasks, self.settings.log_drain, log_stop).await;
    }
}

/// Scoped delete of a created pod.
struct PodReaper<C: ClusterClient> {
    client: Arc<C>,
    name: String,
    armed: bool,
}

impl<C: ClusterClient> PodReaper<C> {
    fn arm(client: Arc<C>, name: String) -> Self {
        Self {
            client,
            name,
            armed: true,
        }
    }

    async fn reap(mut self) {
        self.armed = false;
        delete_pod(self.client.as_ref(), &self.name).await;
    }
}

impl<C: ClusterClient> Drop for PodReaper<C> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let client = Arc::clone(&self.client);
        let name = std::mem::take(&mut self.name);
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                warn!(pod = %name, "run abandoned; deleting pod in background");
                rt.spawn(async move { delete_pod(client.as_ref(), &name).await });
            }
            Err(_) => error!(pod = %name, "no runtime left to delete pod; it may leak"),
        }
    }
}

/// Zero-grace delete. Failures are logged only: the run's result is
/// already decided.
async fn delete_pod<C: ClusterClient>(client: &C, name: &str) {
    match client.delete_pod(name, Duration::ZERO).await {
        Ok(()) => info!(pod = %name, "pod deleted"),
        Err(e) => error!(pod = %name, error = %e, "failed to delete pod"),
    }
}
