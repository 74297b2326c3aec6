// src/config/settings.rs

//! Turn a validated [`ConfigFile`] into the immutable settings the builder
//! and executors take.

use crate::config::model::{ConfigFile, VolumeConfig};
use crate::exec::cluster::ClusterSettings;
use crate::exec::local::LocalSettings;
use crate::spec::{ExecutionProfile, MountPoint, SpecDefaults, VolumeSource};

impl ConfigFile {
    pub fn spec_defaults(&self) -> SpecDefaults {
        SpecDefaults {
            command: self.pod.command.clone(),
            args: self.pod.args.clone(),
            working_dir: self.pod.working_dir.clone(),
            active_deadline: self.pod.active_deadline,
            termination_grace: self.pod.termination_grace,
            ..SpecDefaults::default()
        }
    }

    /// Apply `[pod]` resource overrides to the detected profile.
    pub fn profile(&self, detected: ExecutionProfile) -> ExecutionProfile {
        detected.with_base_resources(self.pod.cpu.clone(), self.pod.memory.clone())
    }

    pub fn extra_mounts(&self) -> Vec<MountPoint> {
        self.volumes.iter().filter_map(mount_point).collect()
    }

    pub fn cluster_settings(&self) -> ClusterSettings {
        ClusterSettings {
            run_timeout: self.engine.run_timeout,
            watch_timeout: self.engine.watch_timeout,
            log_since: self.engine.log_since,
            log_drain: self.engine.log_drain,
        }
    }

    pub fn local_settings(&self, host_uid: u32) -> LocalSettings {
        LocalSettings {
            host_uid,
            scratch_dir: self.local.scratch_dir.clone(),
            work_dir: self.engine.work_dir.clone(),
            selinux_label: self.local.selinux_label.clone(),
            devices: self.local.devices.clone(),
            forward_stdin: self.local.forward_stdin,
            log_drain: self.engine.log_drain,
            ..LocalSettings::default()
        }
    }
}

fn mount_point(vol: &VolumeConfig) -> Option<MountPoint> {
    let source = match (&vol.secret, &vol.config_map) {
        (Some(secret), _) => VolumeSource::Secret {
            secret_name: secret.clone(),
        },
        (None, Some(name)) => VolumeSource::ConfigMap { name: name.clone() },
        (None, None) => return None,
    };
    Some(MountPoint {
        name: vol.name.clone(),
        mount_path: vol.mount_path.clone(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::model::RawConfigFile;

    #[test]
    fn settings_follow_the_file() {
        let raw: RawConfigFile = toml::from_str(
            r#"
            [engine]
            run_timeout = "10m"
            watch_timeout = "20m"
            log_drain = "250ms"

            [pod]
            cpu = "4"
            memory = "8Gi"

            [local]
            forward_stdin = true

            [[volume]]
            name = "opts"
            mount_path = "/srv/opts"
            config_map = "build-opts"
            "#,
        )
        .unwrap();
        let cfg = ConfigFile::try_from(raw).unwrap();

        let cluster = cfg.cluster_settings();
        assert_eq!(cluster.run_timeout, Duration::from_secs(600));
        assert_eq!(cluster.log_drain, Duration::from_millis(250));

        let local = cfg.local_settings(1000);
        assert_eq!(local.host_uid, 1000);
        assert!(local.forward_stdin);
        assert_eq!(local.subordinate_range, 200_000);

        let profile = cfg.profile(ExecutionProfile::modern());
        assert_eq!(profile.resources.cpu, "4");
        assert_eq!(profile.resources.devices.len(), 1);

        assert_eq!(
            cfg.extra_mounts(),
            vec![MountPoint {
                name: "opts".to_string(),
                mount_path: "/srv/opts".to_string(),
                source: VolumeSource::ConfigMap {
                    name: "build-opts".to_string()
                },
            }]
        );
    }
}
