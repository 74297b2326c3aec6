// src/exec/local.rs

//! Local executor: runs a [`UnitSpec`] as a single container against a
//! local runtime socket, attached directly to its console.
//!
//! Teardown is a single idempotent step shared by every trigger (exit,
//! caller termination, the run's own context being cancelled): remove the
//! container, then, for an ephemeral scratch dir, let a root helper
//! container wipe it before removing the host entry.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWrite;
use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::engine::{ExecutionResult, RunFailure, TerminationSignal};
use crate::errors::{GangwayError, Result};
use crate::exec::backend::BoxFuture;
use crate::exec::logs::{LogCopyError, LogMultiplexer, LogStream, drain_copies};
use crate::exec::scratch::ScratchDir;
use crate::spec::{EnvVar, SCRATCH_MOUNT_PATH, UnitSpec, merge_env};

/// Set in the container so the worker knows it runs without a cluster.
pub const LOCAL_MODE_ENV: &str = "GANGWAY_FORCE_NO_CLUSTER";

/// Non-root identity the build runs as inside the container.
pub const BUILDER_USER: &str = "builder";

/// First in-container UID of the secondary mapping.
pub const SUBORDINATE_CONTAINER_UID: u32 = 1000;

/// One contiguous UID range mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdMapping {
    pub container_id: u32,
    pub host_id: u32,
    pub size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindMount {
    pub source: PathBuf,
    pub destination: String,
    pub read_only: bool,
}

/// Container-creation request for the local runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRequest {
    pub name: String,
    pub image: String,
    pub entrypoint: Vec<String>,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub working_dir: String,
    pub host_network: bool,
    pub privileged: bool,
    pub user: String,
    pub uid_map: Vec<IdMapping>,
    pub devices: Vec<String>,
    pub binds: Vec<BindMount>,
    pub tty: bool,
    pub stdin: bool,
    pub labels: BTreeMap<String, String>,
}

impl ContainerRequest {
    /// Translate a unit into a privileged, host-networked container running
    /// as the builder user, with `scratch` bound at the scratch mount path.
    pub fn for_unit(spec: &UnitSpec, scratch: &Path, settings: &LocalSettings) -> Self {
        Self {
            name: spec.name.clone(),
            image: spec.image.clone(),
            entrypoint: spec.command.clone(),
            command: spec.args.clone(),
            env: merge_env(&spec.env, &[EnvVar::new(LOCAL_MODE_ENV, "1")]),
            working_dir: spec.working_dir.clone(),
            host_network: true,
            privileged: true,
            user: BUILDER_USER.to_string(),
            uid_map: vec![
                IdMapping {
                    container_id: 0,
                    host_id: settings.host_uid,
                    size: 1,
                },
                IdMapping {
                    container_id: SUBORDINATE_CONTAINER_UID,
                    host_id: 1,
                    size: settings.subordinate_range,
                },
            ],
            devices: settings.devices.clone(),
            binds: vec![BindMount {
                source: scratch.to_path_buf(),
                destination: SCRATCH_MOUNT_PATH.to_string(),
                read_only: false,
            }],
            tty: true,
            stdin: settings.forward_stdin,
            labels: spec.labels.clone(),
        }
    }

    /// Helper that recursively deletes the scratch area as in-container
    /// root, which can remove files the remapped build UIDs left behind.
    pub fn cleaner(&self) -> Self {
        Self {
            name: format!("{}-cleaner", self.name),
            entrypoint: vec![
                "/bin/rm".to_string(),
                "-rvf".to_string(),
                format!("{SCRATCH_MOUNT_PATH}/"),
            ],
            command: Vec::new(),
            user: "root".to_string(),
            tty: false,
            stdin: false,
            ..self.clone()
        }
    }
}

/// Console streams of an attached container.
pub struct AttachSession {
    pub output: LogStream,
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

/// Local container runtime API consumed by the executor. Implementations
/// are already connected to the runtime socket.
pub trait LocalRuntime: Send + Sync + 'static {
    fn create_container<'a>(&'a self, request: &'a ContainerRequest) -> BoxFuture<'a, Result<String>>;

    fn start_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;

    fn attach_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AttachSession>>;

    /// Resolves with the container's exit code.
    fn wait_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<i64>>;

    fn remove_container<'a>(&'a self, id: &'a str, force: bool, volumes: bool) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSettings {
    /// Host UID that in-container root maps to.
    pub host_uid: u32,
    /// Size of the secondary UID range.
    pub subordinate_range: u32,
    /// Caller pre-bound scratch directory.
    pub scratch_dir: Option<PathBuf>,
    /// Parent of ephemeral scratch directories.
    pub work_dir: PathBuf,
    /// Mandatory-access-control label for ephemeral scratch directories.
    pub selinux_label: Option<String>,
    /// Host device nodes passed through.
    pub devices: Vec<String>,
    pub forward_stdin: bool,
    pub log_drain: Duration,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            host_uid: 0,
            subordinate_range: 200_000,
            scratch_dir: None,
            work_dir: PathBuf::from(SCRATCH_MOUNT_PATH),
            selinux_label: Some("system_u:object_r:container_file_t:s0".to_string()),
            devices: vec!["/dev/kvm".to_string(), "/dev/fuse".to_string()],
            forward_stdin: false,
            log_drain: Duration::from_secs(5),
        }
    }
}

/// Runs units as containers on the local runtime.
pub struct LocalExecutor<R: LocalRuntime> {
    runtime: Arc<R>,
    settings: LocalSettings,
    logs: LogMultiplexer,
}

impl<R: LocalRuntime> std::fmt::Debug for LocalExecutor<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalExecutor")
            .field("settings", &self.settings)
            .field("logs", &self.logs)
            .finish_non_exhaustive()
    }
}

impl<R: LocalRuntime> LocalExecutor<R> {
    pub fn new(runtime: Arc<R>, settings: LocalSettings, logs: LogMultiplexer) -> Self {
        Self {
            runtime,
            settings,
            logs,
        }
    }

    pub fn settings(&self) -> &LocalSettings {
        &self.settings
    }

    /// Create, start, attach, wait, and always tear down one container.
    pub async fn run(&self, spec: &UnitSpec, term: &TerminationSignal) -> ExecutionResult {
        if term.is_cancelled() {
            return Err(RunFailure::Terminated {
                unit: spec.name.clone(),
            });
        }

        let scratch = ScratchDir::resolve(
            &spec.name,
            self.settings.scratch_dir.as_deref(),
            &self.settings.work_dir,
            self.settings.selinux_label.as_deref(),
        )
        .await
        .map_err(|e| RunFailure::Creation(format!("scratch area for {}: {e}", spec.name)))?;

        let request = ContainerRequest::for_unit(spec, scratch.path(), &self.settings);
        info!(
            unit = %spec.name,
            image = %request.image,
            scratch = ?scratch.path(),
            ephemeral = scratch.is_ephemeral(),
            "creating container"
        );

        let id = match self.runtime.create_container(&request).await {
            Ok(id) => id,
            Err(e) => {
                error!(unit = %spec.name, error = %e, "failed to create container");
                scratch.discard().await;
                return Err(RunFailure::Creation(format!("container {}: {e}", spec.name)));
            }
        };

        let teardown = Arc::new(Teardown {
            runtime: Arc::clone(&self.runtime),
            container_id: id.clone(),
            unit: spec.name.clone(),
            cleaner: request.cleaner(),
            scratch,
            done: OnceCell::new(),
        });

        // The run's own context: a child of `term`, also cancelled when this
        // future completes or is dropped.
        let run_ctx = term.child_token();
        let _ctx_guard = run_ctx.clone().drop_guard();
        let trigger = spawn_teardown_trigger(Arc::clone(&teardown), term.clone(), run_ctx.clone());

        let result = self.supervise(spec, &id, term, &run_ctx).await;

        teardown.run().await;
        run_ctx.cancel();
        if let Err(e) = trigger.await {
            debug!(unit = %spec.name, error = %e, "teardown trigger task ended abnormally");
        }

        match &result {
            Ok(()) => info!(unit = %spec.name, "container completed"),
            Err(failure) => error!(unit = %spec.name, error = %failure, "work container failed"),
        }
        result
    }

    async fn supervise(
        &self,
        spec: &UnitSpec,
        id: &str,
        term: &TerminationSignal,
        run_ctx: &CancellationToken,
    ) -> ExecutionResult {
        let terminated = || RunFailure::Terminated {
            unit: spec.name.clone(),
        };

        tokio::select! {
            biased;
            _ = term.cancelled() => {
                warn!(unit = %spec.name, "terminated while starting container");
                return Err(terminated());
            }
            started = self.runtime.start_container(id) => started.map_err(|e| {
                if term.is_cancelled() {
                    return terminated();
                }
                error!(unit = %spec.name, error = %e, "start of container failed");
                RunFailure::Backend(format!("start of container {} failed: {e}", spec.name))
            })?,
        }
        info!(unit = %spec.name, container_id = %id, "container started; binding stdio");

        let log_stop = term.child_token();
        let mut copies = Vec::new();
        let mut stdin_task = None;

        let attached = tokio::select! {
            biased;
            _ = term.cancelled() => {
                warn!(unit = %spec.name, "terminated while attaching to container");
                return Err(terminated());
            }
            attached = self.runtime.attach_container(id) => attached,
        };

        match attached {
            Ok(AttachSession { output, input }) => {
                let open = async move { Ok::<LogStream, GangwayError>(output) };
                copies.push(self.logs.spawn(
                    spec.name.clone(),
                    spec.name.clone(),
                    open,
                    log_stop.clone(),
                ));
                if self.settings.forward_stdin {
                    stdin_task = Some(spawn_stdin_forwarder(input, log_stop.clone()));
                }
            }
            Err(e) => self.logs.report(LogCopyError::Stream {
                unit: spec.name.clone(),
                container: spec.name.clone(),
                reason: e.to_string(),
            }),
        }

        let result = tokio::select! {
            biased;
            _ = term.cancelled() => {
                warn!(unit = %spec.name, "container was signalled to terminate by the caller");
                Err(terminated())
            }
            _ = run_ctx.cancelled() => {
                Err(RunFailure::Backend(format!("run context for {} cancelled", spec.name)))
            }
            waited = self.runtime.wait_container(id) => match waited {
                Ok(0) => Ok(()),
                Ok(code) => Err(RunFailure::NonZeroExit {
                    unit: spec.name.clone(),
                    container: spec.name.clone(),
                    code,
                }),
                Err(e) => Err(RunFailure::Backend(format!("waiting for container {}: {e}", spec.name))),
            },
        };

        if let Some(task) = stdin_task {
            task.abort();
        }
        drain_copies(copies, self.settings.log_drain, &log_stop).await;
        result
    }
}

fn spawn_teardown_trigger<R: LocalRuntime>(
    teardown: Arc<Teardown<R>>,
    term: TerminationSignal,
    run_ctx: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            biased;
            _ = term.cancelled() => debug!(unit = %teardown.unit, "termination signal fired; tearing down"),
            _ = run_ctx.cancelled() => debug!(unit = %teardown.unit, "run context finished; tearing down"),
        }
        teardown.run().await;
    })
}

fn spawn_stdin_forwarder(
    mut input: Pin<Box<dyn AsyncWrite + Send>>,
    stop: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdin = tokio::io::stdin();
        tokio::select! {
            _ = stop.cancelled() => {}
            copied = tokio::io::copy(&mut stdin, &mut input) => {
                if let Err(e) = copied {
                    debug!(error = %e, "stdin forwarding ended");
                }
            }
        }
    })
}

/// Single, idempotent cleanup of one local run.
struct Teardown<R: LocalRuntime> {
    runtime: Arc<R>,
    container_id: String,
    unit: String,
    cleaner: ContainerRequest,
    scratch: ScratchDir,
    done: OnceCell<()>,
}

impl<R: LocalRuntime> Teardown<R> {
    /// Every caller waits for the one execution; later calls are no-ops.
    async fn run(&self) {
        self.done.get_or_init(|| self.execute()).await;
    }

    async fn execute(&self) {
        info!(unit = %self.unit, "tearing down container");
        if let Err(e) = self
            .runtime
            .remove_container(&self.container_id, true, true)
            .await
        {
            warn!(unit = %self.unit, error = %e, "failed to remove container");
        }

        if self.scratch.is_ephemeral() {
            self.clean_scratch().await;
        }
    }

    async fn clean_scratch(&self) {
        info!(unit = %self.unit, dir = ?self.scratch.path(), "cleaning up ephemeral scratch area");

        match self.runtime.create_container(&self.cleaner).await {
            Ok(id) => {
                match self.runtime.start_container(&id).await {
                    Ok(()) => match self.runtime.wait_container(&id).await {
                        Ok(0) => debug!(unit = %self.unit, "scratch cleaner finished"),
                        Ok(code) => warn!(unit = %self.unit, exit_code = code, "scratch cleaner exited non-zero"),
                        Err(e) => warn!(unit = %self.unit, error = %e, "failed waiting for scratch cleaner"),
                    },
                    Err(e) => warn!(unit = %self.unit, error = %e, "failed to start scratch cleaner"),
                }
                if let Err(e) = self.runtime.remove_container(&id, true, true).await {
                    warn!(unit = %self.unit, error = %e, "failed to remove scratch cleaner");
                }
            }
            Err(e) => warn!(unit = %self.unit, error = %e, "failed to create scratch cleaner"),
        }

        self.scratch.discard().await;
    }
}
