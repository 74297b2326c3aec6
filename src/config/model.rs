// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// logs_dir = "/srv/logs"
/// run_timeout = "90m"
///
/// [pod]
/// cpu = "4"
/// memory = "8Gi"
///
/// [local]
/// scratch_dir = "/var/tmp/build"
///
/// [[volume]]
/// name = "aws"
/// mount_path = "/srv/secrets/aws"
/// secret = "aws-creds"
/// ```
///
/// Every section is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: RawEngineSection,

    #[serde(default)]
    pub pod: RawPodSection,

    #[serde(default)]
    pub local: RawLocalSection,

    /// Extra secret / config-map mounts from `[[volume]]`.
    #[serde(default)]
    pub volume: Vec<VolumeConfig>,
}

/// `[engine]` section; durations are still strings here.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawEngineSection {
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Parent of ephemeral scratch directories on the local backend.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_run_timeout")]
    pub run_timeout: String,

    #[serde(default = "default_watch_timeout")]
    pub watch_timeout: String,

    #[serde(default = "default_log_since")]
    pub log_since: String,

    #[serde(default = "default_log_drain")]
    pub log_drain: String,
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("/srv/logs")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/srv")
}

fn default_run_timeout() -> String {
    "90m".to_string()
}

fn default_watch_timeout() -> String {
    "2h".to_string()
}

fn default_log_since() -> String {
    "5m".to_string()
}

fn default_log_drain() -> String {
    "5s".to_string()
}

impl Default for RawEngineSection {
    fn default() -> Self {
        Self {
            logs_dir: default_logs_dir(),
            work_dir: default_work_dir(),
            run_timeout: default_run_timeout(),
            watch_timeout: default_watch_timeout(),
            log_since: default_log_since(),
            log_drain: default_log_drain(),
        }
    }
}

/// `[pod]` section: what every unit runs and how it is bounded.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawPodSection {
    #[serde(default = "default_command")]
    pub command: Vec<String>,

    #[serde(default = "default_args")]
    pub args: Vec<String>,

    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    #[serde(default = "default_cpu")]
    pub cpu: String,

    #[serde(default = "default_memory")]
    pub memory: String,

    #[serde(default = "default_active_deadline")]
    pub active_deadline: String,

    #[serde(default = "default_termination_grace")]
    pub termination_grace: String,

    /// If `None`, the client's default namespace is used.
    #[serde(default)]
    pub namespace: Option<String>,
}

fn default_command() -> Vec<String> {
    vec!["/usr/bin/dumb-init".to_string()]
}

fn default_args() -> Vec<String> {
    vec!["/usr/bin/gangway".to_string(), "builder".to_string()]
}

fn default_working_dir() -> String {
    "/srv".to_string()
}

fn default_cpu() -> String {
    crate::spec::profile::DEFAULT_CPU.to_string()
}

fn default_memory() -> String {
    crate::spec::profile::DEFAULT_MEMORY.to_string()
}

fn default_active_deadline() -> String {
    "30m".to_string()
}

fn default_termination_grace() -> String {
    "5m".to_string()
}

impl Default for RawPodSection {
    fn default() -> Self {
        Self {
            command: default_command(),
            args: default_args(),
            working_dir: default_working_dir(),
            cpu: default_cpu(),
            memory: default_memory(),
            active_deadline: default_active_deadline(),
            termination_grace: default_termination_grace(),
            namespace: None,
        }
    }
}

/// `[local]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawLocalSection {
    /// If `None`, `$XDG_RUNTIME_DIR/podman/podman.sock`.
    #[serde(default)]
    pub socket: Option<PathBuf>,

    /// Start the user's `podman.socket` unit before connecting.
    #[serde(default = "default_true")]
    pub start_socket: bool,

    /// Pre-bound scratch directory; kept after the run.
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// An empty string disables labelling.
    #[serde(default = "default_selinux_label")]
    pub selinux_label: String,

    #[serde(default = "default_devices")]
    pub devices: Vec<String>,

    #[serde(default)]
    pub forward_stdin: bool,
}

fn default_true() -> bool {
    true
}

fn default_selinux_label() -> String {
    "system_u:object_r:container_file_t:s0".to_string()
}

fn default_devices() -> Vec<String> {
    vec!["/dev/kvm".to_string(), "/dev/fuse".to_string()]
}

impl Default for RawLocalSection {
    fn default() -> Self {
        Self {
            socket: None,
            start_socket: default_true(),
            scratch_dir: None,
            selinux_label: default_selinux_label(),
            devices: default_devices(),
            forward_stdin: false,
        }
    }
}

/// `[[volume]]` entry. Exactly one of `secret` / `config_map` must be set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VolumeConfig {
    pub name: String,
    pub mount_path: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub config_map: Option<String>,
}

/// Validated `[engine]` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub logs_dir: PathBuf,
    pub work_dir: PathBuf,
    pub run_timeout: Duration,
    pub watch_timeout: Duration,
    pub log_since: Duration,
    pub log_drain: Duration,
}

/// Validated `[pod]` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodConfig {
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub cpu: String,
    pub memory: String,
    pub active_deadline: Duration,
    pub termination_grace: Duration,
    pub namespace: Option<String>,
}

/// Validated `[local]` values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub socket: Option<PathBuf>,
    pub start_socket: bool,
    pub scratch_dir: Option<PathBuf>,
    pub selinux_label: Option<String>,
    pub devices: Vec<String>,
    pub forward_stdin: bool,
}

/// Validated configuration. Only obtainable through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigFile {
    pub engine: EngineConfig,
    pub pod: PodConfig,
    pub local: LocalConfig,
    pub volumes: Vec<VolumeConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        engine: EngineConfig,
        pod: PodConfig,
        local: LocalConfig,
        volumes: Vec<VolumeConfig>,
    ) -> Self {
        Self {
            engine,
            pod,
            local,
            volumes,
        }
    }
}
