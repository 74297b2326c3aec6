// src/spec/mod.rs

//! Backend-neutral description of one worker unit.
//!
//! - [`profile`] holds the version-dependent [`ExecutionProfile`].
//! - [`builder`] turns build metadata + caller environment into a
//!   [`UnitSpec`] without touching the network.
//!
//! Both executors consume the same `UnitSpec`; neither mutates it.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub mod builder;
pub mod profile;

pub use builder::{SpecBuilder, SpecDefaults, init_script, merge_env};
pub use profile::{ClusterVersion, ExecutionProfile, ProfileKind};

/// Path of the shared scratch area inside every unit.
pub const SCRATCH_MOUNT_PATH: &str = "/srv";

/// Name of the auxiliary init container, when one is emitted.
pub const INIT_CONTAINER_NAME: &str = "init";

/// One `NAME=value` environment entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

impl fmt::Display for EnvVar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.name, self.value)
    }
}

impl FromStr for EnvVar {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((name, value)) if !name.trim().is_empty() => {
                Ok(EnvVar::new(name.trim(), value))
            }
            _ => Err(format!("invalid environment entry '{s}' (expected KEY=VALUE)")),
        }
    }
}

/// Metadata of the build this worker belongs to.
///
/// Parsing it out of the surrounding build object is the caller's job; the
/// builder only validates what it needs to derive a unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BuildMeta {
    /// Name of the build configuration (e.g. `"b1"`).
    pub build_config: String,
    /// Sequence number of the build, kept as the caller supplied it.
    pub build_number: String,
    /// Container image reference the worker runs.
    pub image: String,
    pub service_account: Option<String>,
    pub labels: BTreeMap<String, String>,
}

/// Where a mount point's content comes from on the cluster backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    EmptyDir,
    Secret { secret_name: String },
    ConfigMap { name: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountPoint {
    pub name: String,
    pub mount_path: String,
    pub source: VolumeSource,
}

impl MountPoint {
    pub fn empty_dir(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
            source: VolumeSource::EmptyDir,
        }
    }
}

/// CPU/memory (Kubernetes quantity strings) plus extended device resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequirements {
    pub cpu: String,
    pub memory: String,
    pub devices: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityProfile {
    pub privileged: bool,
    pub run_as_user: Option<i64>,
    pub run_as_group: Option<i64>,
}

/// Auxiliary container that runs the profile's init steps before the main
/// process. Shares image, env, mounts and security with the main container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitContainer {
    pub name: String,
    pub args: Vec<String>,
}

/// Immutable description of one worker unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSpec {
    /// `{buildconfig}-{buildnumber}-worker-{index}`; also the main
    /// container's name.
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<EnvVar>,
    pub working_dir: String,
    pub resources: ResourceRequirements,
    pub security: SecurityProfile,
    pub init: Option<InitContainer>,
    pub mounts: Vec<MountPoint>,
    pub labels: BTreeMap<String, String>,
    pub service_account: Option<String>,
    pub active_deadline: Duration,
    pub termination_grace: Duration,
}

impl UnitSpec {
    /// Container names in log order: init container first, then the main one.
    pub fn container_names(&self) -> Vec<String> {
        let mut names = Vec::with_capacity(2);
        if let Some(init) = &self.init {
            names.push(init.name.clone());
        }
        names.push(self.name.clone());
        names
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }

    pub fn scratch_mount(&self) -> Option<&MountPoint> {
        self.mounts.iter().find(|m| m.mount_path == SCRATCH_MOUNT_PATH)
    }
}
