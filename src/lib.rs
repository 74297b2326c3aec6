// src/lib.rs

pub mod cli;
pub mod client;
pub mod config;
pub mod engine;
pub mod errors;
pub mod exec;
pub mod logging;
pub mod spec;

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::cli::CliArgs;
use crate::client::{ClusterInfo, KubeClusterClient, PodmanRuntime, discover, podman};
use crate::config::{ConfigFile, default_config_path, load_and_validate};
use crate::engine::{RunFailure, TerminationSignal, Worker};
use crate::exec::{Backend, BackendKind, ClusterExecutor, Console, LocalExecutor, LogMultiplexer};
use crate::spec::{ExecutionProfile, SpecBuilder, UnitSpec};

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - cluster discovery and profile selection
/// - spec builder and the selected backend
/// - Ctrl-C handling
pub async fn run(args: CliArgs) -> Result<()> {
    let explicit = args.config.is_some();
    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let cfg = load_and_validate(&config_path, explicit)
        .with_context(|| format!("loading config from {config_path:?}"))?;

    let cluster = discover().await.map_err(|e| RunFailure::Connection(e.to_string()))?;
    let kind = BackendKind::select(cluster.in_cluster);
    let profile = cfg.profile(ExecutionProfile::for_version(cluster.version.as_ref())?);
    info!(backend = %kind, profile = ?profile.kind, "selected backend");

    let builder = SpecBuilder::new(cfg.spec_defaults(), profile).with_extra_mounts(cfg.extra_mounts());
    let meta = args.build_meta();

    if args.dry_run {
        let spec = builder
            .build(&meta, args.index, &args.env)
            .map_err(|e| RunFailure::InvalidSpec(e.to_string()))?;
        print_dry_run(kind, &spec);
        return Ok(());
    }

    let (logs, log_errors) = LogMultiplexer::new(cfg.engine.logs_dir.clone(), Console::stdout());
    let backend = connect_backend(&cfg, cluster, logs).await?;
    let mut worker = Worker::new(builder, backend).with_log_errors(log_errors);

    let term = TerminationSignal::new();
    {
        let term = term.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            warn!("interrupt received; terminating worker");
            term.cancel();
        });
    }

    worker
        .run_worker(&meta, args.index, &args.env, &term)
        .await
        .map_err(anyhow::Error::from)
}

async fn connect_backend(
    cfg: &ConfigFile,
    cluster: ClusterInfo,
    logs: LogMultiplexer,
) -> Result<Backend<KubeClusterClient, PodmanRuntime>> {
    if let Some(client) = cluster.client.filter(|_| cluster.in_cluster) {
        let pods = KubeClusterClient::new(client, cfg.pod.namespace.as_deref());
        let exec = ClusterExecutor::new(Arc::new(pods), cfg.cluster_settings(), logs);
        return Ok(Backend::Cluster(exec));
    }

    let socket = cfg
        .local
        .socket
        .clone()
        .unwrap_or_else(podman::default_socket_path);
    if cfg.local.start_socket {
        if let Err(e) = podman::start_user_socket().await {
            warn!(error = %e, "could not start podman.socket; trying to connect anyway");
        }
    }
    let runtime = PodmanRuntime::connect(&socket)
        .await
        .map_err(|e| RunFailure::Connection(e.to_string()))?;

    let host_uid = nix::unistd::getuid().as_raw();
    let exec = LocalExecutor::new(Arc::new(runtime), cfg.local_settings(host_uid), logs);
    Ok(Backend::Local(exec))
}

fn print_dry_run(kind: BackendKind, spec: &UnitSpec) {
    println!("gangway dry-run");
    println!("  backend = {kind}");
    println!("  unit    = {}", spec.name);
    println!("  image   = {}", spec.image);
    println!("  command = {:?} {:?}", spec.command, spec.args);
    println!("  workdir = {}", spec.working_dir);
    println!(
        "  resources: cpu={} memory={} devices={:?}",
        spec.resources.cpu, spec.resources.memory, spec.resources.devices
    );
    if spec.security.privileged {
        println!("  privileged (uid={:?} gid={:?})", spec.security.run_as_user, spec.security.run_as_group);
    }
    if let Some(init) = &spec.init {
        println!("  init container '{}':", init.name);
        for line in init.args.last().map(String::as_str).unwrap_or_default().lines() {
            println!("      {line}");
        }
    }
    println!("  env:");
    for var in &spec.env {
        println!("    {var}");
    }
    println!("  mounts:");
    for m in &spec.mounts {
        println!("    {} -> {} ({:?})", m.name, m.mount_path, m.source);
    }
}
