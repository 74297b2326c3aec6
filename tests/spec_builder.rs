// tests/spec_builder.rs

mod common;
use crate::common::BuildMetaBuilder;

use gangway::spec::profile::KVM_DEVICE_RESOURCE;
use gangway::spec::{
    ClusterVersion, EnvVar, ExecutionProfile, ProfileKind, SpecBuilder, SpecDefaults,
    VolumeSource,
};

fn builder_for(minor: &str) -> SpecBuilder {
    let profile = ExecutionProfile::for_version(Some(&ClusterVersion::new("1", minor))).unwrap();
    SpecBuilder::new(SpecDefaults::default(), profile)
}

#[test]
fn unit_is_named_after_build_and_index() {
    let spec = builder_for("29")
        .build(&BuildMetaBuilder::new().build(), 5, &[])
        .unwrap();
    assert_eq!(spec.name, "b1-5-worker-5");
    assert_eq!(spec.image, "quay.io/example/builder:latest");
    assert_eq!(spec.working_dir, "/srv");
}

#[test]
fn legacy_cluster_runs_privileged_with_device_repair() {
    for minor in ["11", "11+"] {
        let spec = builder_for(minor)
            .build(&BuildMetaBuilder::new().build(), 0, &[])
            .unwrap();

        assert!(spec.security.privileged, "minor {minor}");
        assert_eq!(spec.security.run_as_user, Some(0));
        assert_eq!(spec.security.run_as_group, Some(1000));
        assert!(spec.resources.devices.is_empty());

        let init = spec.init.as_ref().unwrap();
        let script = init.args.last().unwrap();
        assert!(script.contains("update-ca-trust"));
        assert!(script.contains("chmod 0666 /dev/kvm"));
    }
}

#[test]
fn modern_cluster_requests_kvm_and_skips_device_repair() {
    let builder = builder_for("27");
    assert_eq!(builder.profile().kind, ProfileKind::Modern);

    let spec = builder.build(&BuildMetaBuilder::new().build(), 0, &[]).unwrap();
    assert!(!spec.security.privileged);
    assert_eq!(spec.security.run_as_user, None);
    assert_eq!(spec.resources.devices.get(KVM_DEVICE_RESOURCE), Some(&1));

    let script = spec.init.as_ref().unwrap().args.last().unwrap().clone();
    assert!(script.starts_with("#!/bin/bash\nexport PATH="));
    assert!(script.contains("update-ca-trust"));
    assert!(!script.contains("/dev/kvm"));
}

#[test]
fn unparsable_version_is_an_error() {
    let err = ExecutionProfile::for_version(Some(&ClusterVersion::new("1", "eleven")));
    assert!(err.is_err());
}

#[test]
fn no_cluster_means_modern_profile() {
    let profile = ExecutionProfile::for_version(None).unwrap();
    assert_eq!(profile.kind, ProfileKind::Modern);
}

#[test]
fn caller_env_follows_base_env_and_overrides_in_place() {
    let spec = builder_for("27")
        .build(
            &BuildMetaBuilder::new().build(),
            0,
            &[
                EnvVar::new("BUILD_ID", "42"),
                EnvVar::new("SSL_CERT_FILE", "/tmp/ca.crt"),
            ],
        )
        .unwrap();

    let names: Vec<&str> = spec.env.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["SSL_CERT_FILE", "OSCONTAINER_CERT_DIR", "BUILD_ID"]);
    assert_eq!(spec.env_value("SSL_CERT_FILE"), Some("/tmp/ca.crt"));
}

#[test]
fn labels_service_account_and_mounts_carry_through() {
    let meta = BuildMetaBuilder::new()
        .service_account("builder")
        .label("team", "os")
        .build();
    let extra = gangway::spec::MountPoint {
        name: "aws".to_string(),
        mount_path: "/srv/secrets/aws".to_string(),
        source: VolumeSource::Secret {
            secret_name: "aws-creds".to_string(),
        },
    };
    let spec = builder_for("27")
        .with_extra_mounts(vec![extra.clone()])
        .build(&meta, 0, &[])
        .unwrap();

    assert_eq!(spec.service_account.as_deref(), Some("builder"));
    assert_eq!(spec.labels.get("team").map(String::as_str), Some("os"));
    assert_eq!(spec.scratch_mount().map(|m| m.name.as_str()), Some("srv"));
    assert_eq!(spec.mounts.last(), Some(&extra));
}

#[test]
fn same_inputs_build_identical_specs() {
    let builder = builder_for("11");
    let meta = BuildMetaBuilder::new().build();
    let env = [EnvVar::new("A", "1")];
    assert_eq!(
        builder.build(&meta, 3, &env).unwrap(),
        builder.build(&meta, 3, &env).unwrap()
    );
}
