// src/client/podman.rs

//! [`LocalRuntime`] over the podman socket, spoken through `bollard`'s
//! Docker-compatible API.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use bollard::container::{
    AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
    RemoveContainerOptions, WaitContainerOptions,
};
use bollard::models::{DeviceMapping, HostConfig};
use bollard::{API_DEFAULT_VERSION, Docker};
use futures::{StreamExt, TryStreamExt};
use tokio::process::Command;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::errors::{GangwayError, Result};
use crate::exec::backend::BoxFuture;
use crate::exec::local::{AttachSession, ContainerRequest, IdMapping, LocalRuntime};
use crate::exec::logs::LogStream;

/// Seconds the HTTP client waits on a single API request.
const REQUEST_TIMEOUT_SECS: u64 = 600;

/// `$XDG_RUNTIME_DIR/podman/podman.sock`, falling back to the
/// `/run/user/<uid>` convention.
pub fn default_socket_path() -> PathBuf {
    let runtime_dir = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(format!("/run/user/{}", nix::unistd::getuid())));
    runtime_dir.join("podman").join("podman.sock")
}

/// `systemctl --user start podman.socket`
pub async fn start_user_socket() -> Result<()> {
    let output = Command::new("systemctl")
        .args(["--user", "start", "podman.socket"])
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        return Err(GangwayError::Connection(format!(
            "failed to start podman.socket: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    debug!("podman.socket started");
    Ok(())
}

/// Connected podman API client.
#[derive(Debug, Clone)]
pub struct PodmanRuntime {
    docker: Docker,
}

impl PodmanRuntime {
    /// Connect to the socket at `socket` and check that it answers.
    pub async fn connect(socket: &Path) -> Result<Self> {
        let path = socket.to_str().ok_or_else(|| {
            GangwayError::Connection(format!("socket path {socket:?} is not valid UTF-8"))
        })?;
        let docker = Docker::connect_with_unix(path, REQUEST_TIMEOUT_SECS, API_DEFAULT_VERSION)
            .map_err(|e| GangwayError::Connection(format!("connecting to {path}: {e}")))?;
        docker
            .ping()
            .await
            .map_err(|e| GangwayError::Connection(format!("podman socket {path} not answering: {e}")))?;

        info!(socket = %path, "connected to podman socket");
        Ok(Self { docker })
    }
}

impl LocalRuntime for PodmanRuntime {
    fn create_container<'a>(&'a self, request: &'a ContainerRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            let options = CreateContainerOptions {
                name: request.name.clone(),
                ..Default::default()
            };
            let created = self
                .docker
                .create_container(Some(options), container_config(request))
                .await?;
            for warning in &created.warnings {
                debug!(container = %request.name, %warning, "runtime warning");
            }
            Ok(created.id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.docker.start_container::<String>(id, None).await?;
            Ok(())
        })
    }

    fn attach_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<AttachSession>> {
        Box::pin(async move {
            let options = AttachContainerOptions::<String> {
                stdin: Some(true),
                stdout: Some(true),
                stderr: Some(true),
                stream: Some(true),
                logs: Some(true),
                detach_keys: None,
            };
            let AttachContainerResults { output, input } =
                self.docker.attach_container(id, Some(options)).await?;

            let bytes = output
                .map_ok(|chunk| chunk.into_bytes())
                .map_err(io::Error::other);
            Ok(AttachSession {
                output: Box::pin(StreamReader::new(bytes)) as LogStream,
                input,
            })
        })
    }

    fn wait_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            let mut waits = Box::pin(
                self.docker
                    .wait_container(id, None::<WaitContainerOptions<String>>),
            );
            match waits.next().await {
                Some(Ok(response)) => Ok(response.status_code),
                // The API reports a non-zero exit as an error carrying the code.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => Ok(code),
                Some(Err(e)) => Err(e.into()),
                None => Err(GangwayError::RuntimeApi(format!(
                    "wait on container {id} ended without a status"
                ))),
            }
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, force: bool, volumes: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let options = RemoveContainerOptions {
                force,
                v: volumes,
                ..Default::default()
            };
            self.docker.remove_container(id, Some(options)).await?;
            Ok(())
        })
    }
}

/// Create-body for one request.
pub fn container_config(request: &ContainerRequest) -> Config<String> {
    let env = request.env.iter().map(|e| e.to_string()).collect();
    let binds = request
        .binds
        .iter()
        .map(|b| {
            let mode = if b.read_only { "ro" } else { "rw" };
            format!("{}:{}:{mode}", b.source.display(), b.destination)
        })
        .collect();
    let devices = request
        .devices
        .iter()
        .map(|d| DeviceMapping {
            path_on_host: Some(d.clone()),
            path_in_container: Some(d.clone()),
            cgroup_permissions: Some("rwm".to_string()),
        })
        .collect();

    Config {
        image: Some(request.image.clone()),
        entrypoint: Some(request.entrypoint.clone()),
        cmd: (!request.command.is_empty()).then(|| request.command.clone()),
        env: Some(env),
        working_dir: Some(request.working_dir.clone()),
        user: Some(request.user.clone()),
        tty: Some(request.tty),
        open_stdin: Some(request.stdin),
        attach_stdin: Some(request.stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        labels: Some(
            request
                .labels
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect::<HashMap<_, _>>(),
        ),
        host_config: Some(HostConfig {
            network_mode: request.host_network.then(|| "host".to_string()),
            privileged: Some(request.privileged),
            binds: Some(binds),
            devices: Some(devices),
            userns_mode: userns_mode(&request.uid_map),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Podman's `auto` user namespace with each mapping forced present.
pub fn userns_mode(mappings: &[IdMapping]) -> Option<String> {
    if mappings.is_empty() {
        return None;
    }
    let forced: Vec<String> = mappings
        .iter()
        .map(|m| format!("uidmapping={}:{}:{}", m.container_id, m.host_id, m.size))
        .collect();
    Some(format!("auto:{}", forced.join(",")))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::exec::local::BindMount;
    use crate::spec::EnvVar;

    fn request() -> ContainerRequest {
        ContainerRequest {
            name: "b1-5-worker-0".to_string(),
            image: "img".to_string(),
            entrypoint: vec!["/usr/bin/dumb-init".to_string()],
            command: vec!["/usr/bin/gangway".to_string(), "builder".to_string()],
            env: vec![EnvVar::new("GANGWAY_FORCE_NO_CLUSTER", "1")],
            working_dir: "/srv".to_string(),
            host_network: true,
            privileged: true,
            user: "builder".to_string(),
            uid_map: vec![
                IdMapping { container_id: 0, host_id: 1000, size: 1 },
                IdMapping { container_id: 1000, host_id: 1, size: 200_000 },
            ],
            devices: vec!["/dev/kvm".to_string()],
            binds: vec![BindMount {
                source: PathBuf::from("/var/tmp/b1"),
                destination: "/srv".to_string(),
                read_only: false,
            }],
            tty: true,
            stdin: false,
            labels: BTreeMap::new(),
        }
    }

    #[test]
    fn userns_mode_forces_each_mapping() {
        let req = request();
        assert_eq!(
            userns_mode(&req.uid_map).as_deref(),
            Some("auto:uidmapping=0:1000:1,uidmapping=1000:1:200000")
        );
        assert_eq!(userns_mode(&[]), None);
    }

    #[test]
    fn config_binds_scratch_and_passes_devices() {
        let config = container_config(&request());
        let host = config.host_config.unwrap();

        assert_eq!(host.network_mode.as_deref(), Some("host"));
        assert_eq!(host.privileged, Some(true));
        assert_eq!(host.binds.unwrap(), vec!["/var/tmp/b1:/srv:rw".to_string()]);
        assert_eq!(
            host.devices.unwrap()[0].path_on_host.as_deref(),
            Some("/dev/kvm")
        );
        assert_eq!(config.env.unwrap(), vec!["GANGWAY_FORCE_NO_CLUSTER=1".to_string()]);
        assert_eq!(config.user.as_deref(), Some("builder"));
        assert_eq!(config.tty, Some(true));
    }

    #[test]
    fn cleaner_has_no_command_arguments() {
        let config = container_config(&request().cleaner());
        assert_eq!(config.cmd, None);
        assert_eq!(config.user.as_deref(), Some("root"));
        assert_eq!(config.open_stdin, Some(false));
    }
}
