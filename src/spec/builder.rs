// src/spec/builder.rs

//! Deterministic construction of a [`UnitSpec`].

use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info};

use crate::errors::{GangwayError, Result};
use crate::spec::{
    BuildMeta, EnvVar, ExecutionProfile, INIT_CONTAINER_NAME, InitContainer, MountPoint,
    SCRATCH_MOUNT_PATH, UnitSpec,
};

/// PATH exported at the top of the init script.
const INIT_PATH: &str = "/usr/sbin:/usr/bin:/usr/local/bin:/usr/local/sbin:$PATH";

const MAX_UNIT_NAME_LEN: usize = 63;

/// Process-wide defaults every unit starts from.
///
/// Built once at startup (usually from the config file) and handed to the
/// builder; nothing mutates it afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecDefaults {
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub working_dir: String,
    pub base_env: Vec<EnvVar>,
    pub base_mounts: Vec<MountPoint>,
    pub active_deadline: Duration,
    pub termination_grace: Duration,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            command: vec!["/usr/bin/dumb-init".to_string()],
            args: vec!["/usr/bin/gangway".to_string(), "builder".to_string()],
            working_dir: SCRATCH_MOUNT_PATH.to_string(),
            base_env: vec![
                EnvVar::new("SSL_CERT_FILE", "/etc/containers/cert.d/ca.crt"),
                EnvVar::new("OSCONTAINER_CERT_DIR", "/etc/containers/cert.d"),
            ],
            base_mounts: vec![
                MountPoint::empty_dir("srv", SCRATCH_MOUNT_PATH),
                MountPoint::empty_dir("pki-trust", "/etc/pki/ca-trust/extracted"),
                MountPoint::empty_dir("pki-anchors", "/etc/pki/ca-trust/anchors"),
                MountPoint::empty_dir("container-certs", "/etc/containers/cert.d"),
            ],
            active_deadline: Duration::from_secs(30 * 60),
            termination_grace: Duration::from_secs(5 * 60),
        }
    }
}

/// Produces [`UnitSpec`]s from build metadata. Never makes a network call.
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    defaults: SpecDefaults,
    profile: ExecutionProfile,
    extra_mounts: Vec<MountPoint>,
}

impl SpecBuilder {
    pub fn new(defaults: SpecDefaults, profile: ExecutionProfile) -> Self {
        Self {
            defaults,
            profile,
            extra_mounts: Vec::new(),
        }
    }

    /// Append pre-computed secret / config-map mounts after the base ones.
    pub fn with_extra_mounts(mut self, mounts: Vec<MountPoint>) -> Self {
        self.extra_mounts = mounts;
        self
    }

    pub fn profile(&self) -> &ExecutionProfile {
        &self.profile
    }

    pub fn defaults(&self) -> &SpecDefaults {
        &self.defaults
    }

    /// `{buildconfig}-{buildnumber}-worker-{index}`.
    pub fn unit_name(meta: &BuildMeta, index: u32) -> String {
        format!("{}-{}-worker-{}", meta.build_config, meta.build_number, index)
    }

    pub fn build(&self, meta: &BuildMeta, index: u32, env: &[EnvVar]) -> Result<UnitSpec> {
        validate_meta(meta)?;

        let name = Self::unit_name(meta, index);
        validate_unit_name(&name)?;
        info!(unit = %name, profile = ?self.profile.kind, "building unit spec");

        let init = if self.profile.init_steps.is_empty() {
            None
        } else {
            debug!(unit = %name, steps = self.profile.init_steps.len(), "init container defined");
            Some(InitContainer {
                name: INIT_CONTAINER_NAME.to_string(),
                args: vec![
                    "/bin/bash".to_string(),
                    "-xc".to_string(),
                    init_script(&self.profile.init_steps),
                ],
            })
        };

        let mut mounts = self.defaults.base_mounts.clone();
        mounts.extend(self.extra_mounts.iter().cloned());

        Ok(UnitSpec {
            name,
            image: meta.image.clone(),
            command: self.defaults.command.clone(),
            args: self.defaults.args.clone(),
            env: merge_env(&self.defaults.base_env, env),
            working_dir: self.defaults.working_dir.clone(),
            resources: self.profile.resources.clone(),
            security: self.profile.security.clone(),
            init,
            mounts,
            labels: meta.labels.clone(),
            service_account: meta.service_account.clone(),
            active_deadline: self.defaults.active_deadline,
            termination_grace: self.defaults.termination_grace,
        })
    }
}

/// Base entries first, caller entries after. A caller entry whose name is
/// already present replaces the value in place, so the result never holds
/// duplicate names.
pub fn merge_env(base: &[EnvVar], caller: &[EnvVar]) -> Vec<EnvVar> {
    let mut merged: Vec<EnvVar> = Vec::with_capacity(base.len() + caller.len());
    for var in base.iter().chain(caller) {
        match merged.iter_mut().find(|e| e.name == var.name) {
            Some(existing) => existing.value = var.value.clone(),
            None => merged.push(var.clone()),
        }
    }
    merged
}

/// Single bash script running every init step in order with a fixed PATH.
pub fn init_script(steps: &[String]) -> String {
    format!(
        "#!/bin/bash\nexport PATH={INIT_PATH}\n{}\n",
        steps.join("\n")
    )
}

fn validate_meta(meta: &BuildMeta) -> Result<()> {
    if meta.build_config.trim().is_empty() {
        return Err(GangwayError::InvalidMetadata(
            "build config name is empty".to_string(),
        ));
    }
    if meta.build_number.trim().is_empty() {
        return Err(GangwayError::InvalidMetadata(
            "build number is empty".to_string(),
        ));
    }
    if meta.image.trim().is_empty() {
        return Err(GangwayError::InvalidMetadata(
            "worker image reference is empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_unit_name(name: &str) -> Result<()> {
    static DNS_LABEL: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    let re = DNS_LABEL
        .get_or_init(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$"))
        .as_ref()
        .map_err(|e| GangwayError::Other(anyhow::anyhow!("unit name pattern: {e}")))?;

    if name.len() > MAX_UNIT_NAME_LEN {
        return Err(GangwayError::InvalidMetadata(format!(
            "unit name '{name}' is longer than {MAX_UNIT_NAME_LEN} characters"
        )));
    }
    if !re.is_match(name) {
        return Err(GangwayError::InvalidMetadata(format!(
            "unit name '{name}' is not a valid DNS-1123 label"
        )));
    }
    Ok(())
}
