// src/config/validate.rs

use std::collections::BTreeSet;
use std::time::Duration;

use crate::config::duration::parse_duration;
use crate::config::model::{
    ConfigFile, EngineConfig, LocalConfig, PodConfig, RawConfigFile, RawEngineSection,
    RawLocalSection, RawPodSection, VolumeConfig,
};
use crate::errors::{GangwayError, Result};
use crate::spec::SpecDefaults;

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = GangwayError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        let engine = validate_engine(&raw.engine)?;
        let pod = validate_pod(&raw.pod)?;
        let local = validate_local(raw.local)?;
        validate_volumes(&raw.volume)?;
        Ok(ConfigFile::new_unchecked(engine, pod, local, raw.volume))
    }
}

fn duration_field(section: &str, key: &str, value: &str) -> Result<Duration> {
    let parsed = parse_duration(value)
        .map_err(|e| GangwayError::ConfigError(format!("[{section}].{key}: {e}")))?;
    if parsed.is_zero() {
        return Err(GangwayError::ConfigError(format!(
            "[{section}].{key} must be greater than zero"
        )));
    }
    Ok(parsed)
}

fn validate_engine(raw: &RawEngineSection) -> Result<EngineConfig> {
    if raw.logs_dir.as_os_str().is_empty() {
        return Err(GangwayError::ConfigError(
            "[engine].logs_dir must not be empty".to_string(),
        ));
    }
    if raw.work_dir.as_os_str().is_empty() {
        return Err(GangwayError::ConfigError(
            "[engine].work_dir must not be empty".to_string(),
        ));
    }

    let engine = EngineConfig {
        logs_dir: raw.logs_dir.clone(),
        work_dir: raw.work_dir.clone(),
        run_timeout: duration_field("engine", "run_timeout", &raw.run_timeout)?,
        watch_timeout: duration_field("engine", "watch_timeout", &raw.watch_timeout)?,
        log_since: duration_field("engine", "log_since", &raw.log_since)?,
        log_drain: duration_field("engine", "log_drain", &raw.log_drain)?,
    };

    if engine.watch_timeout <= engine.run_timeout {
        return Err(GangwayError::ConfigError(format!(
            "[engine].watch_timeout ({:?}) must be longer than run_timeout ({:?})",
            engine.watch_timeout, engine.run_timeout
        )));
    }
    Ok(engine)
}

fn validate_pod(raw: &RawPodSection) -> Result<PodConfig> {
    if raw.command.is_empty() {
        return Err(GangwayError::ConfigError(
            "[pod].command must name an executable".to_string(),
        ));
    }
    if raw.cpu.trim().is_empty() || raw.memory.trim().is_empty() {
        return Err(GangwayError::ConfigError(
            "[pod].cpu and [pod].memory must not be empty".to_string(),
        ));
    }
    if !raw.working_dir.starts_with('/') {
        return Err(GangwayError::ConfigError(format!(
            "[pod].working_dir must be absolute (got '{}')",
            raw.working_dir
        )));
    }

    Ok(PodConfig {
        command: raw.command.clone(),
        args: raw.args.clone(),
        working_dir: raw.working_dir.clone(),
        cpu: raw.cpu.clone(),
        memory: raw.memory.clone(),
        active_deadline: duration_field("pod", "active_deadline", &raw.active_deadline)?,
        termination_grace: duration_field("pod", "termination_grace", &raw.termination_grace)?,
        namespace: raw.namespace.clone().filter(|ns| !ns.trim().is_empty()),
    })
}

fn validate_local(raw: RawLocalSection) -> Result<LocalConfig> {
    for device in &raw.devices {
        if !device.starts_with("/dev/") {
            return Err(GangwayError::ConfigError(format!(
                "[local].devices entry '{device}' is not a device path"
            )));
        }
    }

    let label = raw.selinux_label.trim().to_string();
    Ok(LocalConfig {
        socket: raw.socket,
        start_socket: raw.start_socket,
        scratch_dir: raw.scratch_dir,
        selinux_label: (!label.is_empty()).then_some(label),
        devices: raw.devices,
        forward_stdin: raw.forward_stdin,
    })
}

fn validate_volumes(volumes: &[VolumeConfig]) -> Result<()> {
    let base_mounts = SpecDefaults::default().base_mounts;
    let mut names: BTreeSet<&str> = base_mounts.iter().map(|m| m.name.as_str()).collect();
    let mut paths: BTreeSet<&str> = base_mounts.iter().map(|m| m.mount_path.as_str()).collect();

    for vol in volumes {
        if vol.name.trim().is_empty() {
            return Err(GangwayError::ConfigError(
                "[[volume]] entry without a name".to_string(),
            ));
        }
        match (&vol.secret, &vol.config_map) {
            (Some(_), None) | (None, Some(_)) => {}
            _ => {
                return Err(GangwayError::ConfigError(format!(
                    "volume '{}' must set exactly one of `secret` or `config_map`",
                    vol.name
                )));
            }
        }
        if !vol.mount_path.starts_with('/') {
            return Err(GangwayError::ConfigError(format!(
                "volume '{}' mount_path must be absolute",
                vol.name
            )));
        }
        if !names.insert(vol.name.as_str()) {
            return Err(GangwayError::ConfigError(format!(
                "duplicate volume name '{}'",
                vol.name
            )));
        }
        if !paths.insert(vol.mount_path.as_str()) {
            return Err(GangwayError::ConfigError(format!(
                "volume '{}' mount_path '{}' collides with another mount",
                vol.name, vol.mount_path
            )));
        }
    }
    Ok(())
}
