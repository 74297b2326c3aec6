// src/client/k8s.rs

//! [`ClusterClient`] over the Kubernetes API using `kube`.
//!
//! Watch events and log bytes are forwarded from background tasks through
//! channels, so the executor only ever sees owned, `'static` streams.

use std::collections::BTreeMap;
use std::io;
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::{AsyncReadExt, StreamExt};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerStatus, EmptyDirVolumeSource,
    EnvVar as KubeEnvVar, Pod, PodSpec, PodStatus, ResourceRequirements as KubeResources,
    SecretVolumeSource, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{DeleteParams, LogParams, PostParams, WatchEvent, WatchParams};
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use crate::errors::{GangwayError, Result};
use crate::exec::backend::BoxFuture;
use crate::exec::cluster::{
    ClusterClient, ContainerState, PodCondition, PodEvent, PodEventKind, PodEventStream, PodHandle,
    PodPhase, PodSnapshot,
};
use crate::exec::logs::{LogStream, stream_closed};
use crate::spec::{MountPoint, UnitSpec, VolumeSource};

/// Longest single watch request the client library accepts; longer
/// ceilings are covered by re-opening from the last seen version.
const MAX_WATCH_REQUEST: Duration = Duration::from_secs(290);

const WATCH_BUFFER: usize = 32;
const LOG_BUFFER: usize = 64;
const LOG_CHUNK: usize = 8 * 1024;

/// Pod API bound to one namespace.
#[derive(Clone)]
pub struct KubeClusterClient {
    pods: Api<Pod>,
}

impl std::fmt::Debug for KubeClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterClient").finish_non_exhaustive()
    }
}

impl KubeClusterClient {
    /// Use `namespace`, or the client's default namespace (the pod's own
    /// namespace when running in-cluster).
    pub fn new(client: Client, namespace: Option<&str>) -> Self {
        let pods = match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::default_namespaced(client),
        };
        Self { pods }
    }
}

impl ClusterClient for KubeClusterClient {
    fn create_pod<'a>(&'a self, spec: &'a UnitSpec) -> BoxFuture<'a, Result<PodHandle>> {
        Box::pin(async move {
            let pod = build_pod(spec);
            let created = self.pods.create(&PostParams::default(), &pod).await?;
            Ok(PodHandle {
                name: created.name_any(),
                resource_version: created.resource_version().unwrap_or_default(),
            })
        })
    }

    fn watch_pod<'a>(
        &'a self,
        name: &'a str,
        from_version: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<PodEventStream>> {
        Box::pin(async move {
            let (tx, rx) = mpsc::channel(WATCH_BUFFER);
            tokio::spawn(forward_watch(
                self.pods.clone(),
                name.to_string(),
                from_version.to_string(),
                timeout,
                tx,
            ));
            Ok(rx)
        })
    }

    fn pod_logs<'a>(
        &'a self,
        name: &'a str,
        container: &'a str,
        since: Duration,
    ) -> BoxFuture<'a, Result<LogStream>> {
        Box::pin(async move {
            let params = LogParams {
                container: Some(container.to_string()),
                follow: true,
                since_seconds: Some(since.as_secs() as i64),
                ..Default::default()
            };

            let (opened_tx, opened_rx) = oneshot::channel();
            let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(LOG_BUFFER);
            tokio::spawn(forward_logs(
                self.pods.clone(),
                name.to_string(),
                params,
                opened_tx,
                tx,
            ));

            match opened_rx.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e.into()),
                Err(_) => {
                    return Err(GangwayError::ClusterApi(format!(
                        "log stream for {name}/{container} ended before opening"
                    )));
                }
            }

            let chunks = futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|chunk| (chunk, rx))
            });
            Ok(Box::pin(StreamReader::new(Box::pin(chunks))) as LogStream)
        })
    }

    fn delete_pod<'a>(&'a self, name: &'a str, grace: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let params = DeleteParams {
                grace_period_seconds: Some(grace.as_secs() as u32),
                ..Default::default()
            };
            match self.pods.delete(name, &params).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(resp)) if resp.code == 404 => {
                    debug!(pod = %name, "pod already gone");
                    Ok(())
                }
                Err(e) => Err(e.into()),
            }
        })
    }
}

/// Re-open the watch from the last seen version until `ceiling` elapses.
/// Dropping `tx` tells the executor the watch is over.
async fn forward_watch(
    pods: Api<Pod>,
    name: String,
    mut version: String,
    ceiling: Duration,
    tx: mpsc::Sender<Result<PodEvent>>,
) {
    let started = Instant::now();
    let selector = format!("metadata.name={name}");

    loop {
        let remaining = ceiling.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            warn!(pod = %name, ceiling = ?ceiling, "watch ceiling reached");
            return;
        }
        let request = remaining.min(MAX_WATCH_REQUEST).as_secs().max(1) as u32;
        let params = WatchParams::default().fields(&selector).timeout(request);

        // The stream may borrow `version`; track progress separately.
        let mut latest = version.clone();
        {
            let stream = match pods.watch(&params, &version).await {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = tx.send(Err(e.into())).await;
                    return;
                }
            };
            let mut stream = std::pin::pin!(stream);

            while let Some(item) = stream.next().await {
                let (kind, pod) = match item {
                    Ok(WatchEvent::Added(pod)) => (PodEventKind::Added, pod),
                    Ok(WatchEvent::Modified(pod)) => (PodEventKind::Modified, pod),
                    Ok(WatchEvent::Deleted(pod)) => (PodEventKind::Deleted, pod),
                    Ok(WatchEvent::Bookmark(mark)) => {
                        latest = mark.metadata.resource_version;
                        continue;
                    }
                    Ok(WatchEvent::Error(resp)) => {
                        let err = GangwayError::ClusterApi(format!(
                            "watch error {}: {}",
                            resp.code, resp.message
                        ));
                        let _ = tx.send(Err(err)).await;
                        return;
                    }
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };

                if let Some(v) = pod.resource_version() {
                    latest = v;
                }
                let event = PodEvent {
                    kind,
                    pod: snapshot(&pod),
                };
                if tx.send(Ok(event)).await.is_err() {
                    // Executor stopped listening.
                    return;
                }
            }
        }
        version = latest;
        debug!(pod = %name, resource_version = %version, "watch request closed; re-opening");
    }
}

async fn forward_logs(
    pods: Api<Pod>,
    name: String,
    params: LogParams,
    opened: oneshot::Sender<std::result::Result<(), kube::Error>>,
    tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let reader = match pods.log_stream(&name, &params).await {
        Ok(reader) => reader,
        Err(e) => {
            let _ = opened.send(Err(e));
            return;
        }
    };
    if opened.send(Ok(())).is_err() {
        return;
    }

    let mut reader = Box::pin(reader);
    let mut buf = vec![0u8; LOG_CHUNK];
    loop {
        let chunk = match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => Ok(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if is_closed_by_server(&e) => Err(stream_closed()),
            Err(e) => Err(e),
        };
        let last = chunk.is_err();
        if tx.send(chunk).await.is_err() || last {
            return;
        }
    }
}

/// Body errors surfacing when the pod is deleted under a following reader.
fn is_closed_by_server(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset | io::ErrorKind::BrokenPipe
    )
}

/// Translate a unit into the pod object submitted to the API.
pub fn build_pod(spec: &UnitSpec) -> Pod {
    let env: Vec<KubeEnvVar> = spec
        .env
        .iter()
        .map(|e| KubeEnvVar {
            name: e.name.clone(),
            value: Some(e.value.clone()),
            ..Default::default()
        })
        .collect();

    let mounts: Vec<VolumeMount> = spec
        .mounts
        .iter()
        .map(|m| VolumeMount {
            name: m.name.clone(),
            mount_path: m.mount_path.clone(),
            ..Default::default()
        })
        .collect();

    let mut quantities: BTreeMap<String, Quantity> = BTreeMap::from([
        ("cpu".to_string(), Quantity(spec.resources.cpu.clone())),
        ("memory".to_string(), Quantity(spec.resources.memory.clone())),
    ]);
    for (device, count) in &spec.resources.devices {
        quantities.insert(device.clone(), Quantity(count.to_string()));
    }
    let resources = KubeResources {
        requests: Some(quantities.clone()),
        limits: Some(quantities),
        ..Default::default()
    };

    let security = SecurityContext {
        privileged: Some(spec.security.privileged),
        run_as_user: spec.security.run_as_user,
        run_as_group: spec.security.run_as_group,
        ..Default::default()
    };

    let container = |name: &str, command: Vec<String>, args: Vec<String>| Container {
        name: name.to_string(),
        image: Some(spec.image.clone()),
        image_pull_policy: Some("Always".to_string()),
        command: Some(command),
        args: Some(args),
        env: Some(env.clone()),
        working_dir: Some(spec.working_dir.clone()),
        resources: Some(resources.clone()),
        security_context: Some(security.clone()),
        volume_mounts: Some(mounts.clone()),
        ..Default::default()
    };

    let main = container(&spec.name, spec.command.clone(), spec.args.clone());
    let init = spec
        .init
        .as_ref()
        .map(|init| vec![container(&init.name, spec.command.clone(), init.args.clone())]);

    Pod {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            active_deadline_seconds: Some(spec.active_deadline.as_secs() as i64),
            termination_grace_period_seconds: Some(spec.termination_grace.as_secs() as i64),
            automount_service_account_token: Some(true),
            service_account_name: spec.service_account.clone(),
            restart_policy: Some("Never".to_string()),
            init_containers: init,
            containers: vec![main],
            volumes: Some(spec.mounts.iter().map(volume).collect()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn volume(mount: &MountPoint) -> Volume {
    let mut volume = Volume {
        name: mount.name.clone(),
        ..Default::default()
    };
    match &mount.source {
        VolumeSource::EmptyDir => volume.empty_dir = Some(EmptyDirVolumeSource::default()),
        VolumeSource::Secret { secret_name } => {
            volume.secret = Some(SecretVolumeSource {
                secret_name: Some(secret_name.clone()),
                ..Default::default()
            })
        }
        VolumeSource::ConfigMap { name } => {
            volume.config_map = Some(ConfigMapVolumeSource {
                name: name.clone(),
                ..Default::default()
            })
        }
    }
    volume
}

/// Reduce a pod object to what the watch loop evaluates.
pub fn snapshot(pod: &Pod) -> PodSnapshot {
    let Some(status) = pod.status.as_ref() else {
        return PodSnapshot::with_phase(PodPhase::Pending);
    };
    snapshot_status(status)
}

fn snapshot_status(status: &PodStatus) -> PodSnapshot {
    let phase = match status.phase.as_deref() {
        Some("Pending") | None => PodPhase::Pending,
        Some("Running") => PodPhase::Running,
        Some("Succeeded") => PodPhase::Succeeded,
        Some("Failed") => PodPhase::Failed,
        Some(other) => {
            info!(phase = %other, "unrecognised pod phase");
            PodPhase::Unknown
        }
    };

    PodSnapshot {
        phase,
        reason: status.reason.clone(),
        conditions: status
            .conditions
            .iter()
            .flatten()
            .map(|c| PodCondition {
                kind: c.type_.clone(),
                status: c.status == "True",
                reason: c.reason.clone(),
            })
            .collect(),
        init_container_statuses: container_states(status.init_container_statuses.as_deref()),
        container_statuses: container_states(status.container_statuses.as_deref()),
    }
}

fn container_states(statuses: Option<&[ContainerStatus]>) -> Vec<ContainerState> {
    statuses
        .unwrap_or_default()
        .iter()
        .map(|s| ContainerState {
            name: s.name.clone(),
            exit_code: s
                .state
                .as_ref()
                .and_then(|st| st.terminated.as_ref())
                .map(|t| t.exit_code),
        })
        .collect()
}
