// src/spec/profile.rs

//! Version-dependent execution policy.
//!
//! Detection happens once, before any unit is built: the discovery
//! collaborator reports the orchestrator version and [`ExecutionProfile::for_version`]
//! turns it into an immutable policy bundle held by the spec builder.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{GangwayError, Result};
use crate::spec::{ResourceRequirements, SecurityProfile};

/// Extended resource name of the KVM device plugin.
pub const KVM_DEVICE_RESOURCE: &str = "devices.kubevirt.io/kvm";

/// Minor version reported by the legacy orchestrator line.
pub const LEGACY_MINOR_VERSION: u32 = 11;

pub const DEFAULT_CPU: &str = "2";
pub const DEFAULT_MEMORY: &str = "4Gi";

/// Trust-anchor setup shared by every profile.
const TRUST_ANCHOR_STEPS: &[&str] = &[
    "mkdir -vp /etc/pki/ca-trust/extracted/{openssl,pem,java,edk2}",
    "cp -av /etc/pki/ca-trust/source/anchors2/*{crt,pem} /etc/pki/ca-trust/anchors/ || :",
    "cp -av /run/secrets/kubernetes.io/serviceaccount/ca.crt /etc/pki/ca-trust/anchors/cluster-ca.crt || :",
    "cp -av /run/secrets/kubernetes.io/serviceaccount/service-ca.crt /etc/pki/ca-trust/anchors/service-ca.crt || :",
    "update-ca-trust",
    "mkdir -vp /etc/containers/certs.d",
    "cat /run/secrets/kubernetes.io/serviceaccount/*crt >> /etc/containers/certs.d/ca.crt || :",
    "cat /etc/pki/ca-trust/extracted/pem/* >> /etc/containers/certs.d/ca.crt || :",
];

/// On the legacy line /dev/kvm is rarely world read-write.
const DEVICE_REPAIR_STEPS: &[&str] = &[
    "/usr/bin/chmod 0666 /dev/kvm || echo missing kvm",
    "/usr/bin/stat /dev/kvm || :",
];

/// Version triple as reported by the orchestrator's version endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterVersion {
    pub major: String,
    pub minor: String,
    pub git_version: String,
}

impl ClusterVersion {
    pub fn new(major: impl Into<String>, minor: impl Into<String>) -> Self {
        Self {
            major: major.into(),
            minor: minor.into(),
            git_version: String::new(),
        }
    }

    /// Numeric minor version; suffixes such as the `+` some distributions
    /// append (`"11+"`) are ignored.
    pub fn minor_number(&self) -> Result<u32> {
        static LEADING_DIGITS: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
        let re = LEADING_DIGITS
            .get_or_init(|| Regex::new(r"^\s*(\d+)"))
            .as_ref()
            .map_err(|e| GangwayError::Other(anyhow::anyhow!("version pattern: {e}")))?;

        re.captures(&self.minor)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
            .ok_or_else(|| {
                GangwayError::ClusterApi(format!(
                    "cannot parse orchestrator minor version '{}'",
                    self.minor
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileKind {
    /// Privileged, fixed UID/GID, repairs device permissions at init.
    Legacy,
    /// Unprivileged, KVM provided by the device plugin.
    Modern,
}

/// Security, resources and init steps selected for the detected version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionProfile {
    pub kind: ProfileKind,
    pub security: SecurityProfile,
    pub resources: ResourceRequirements,
    pub init_steps: Vec<String>,
}

impl ExecutionProfile {
    pub fn legacy() -> Self {
        Self {
            kind: ProfileKind::Legacy,
            security: SecurityProfile {
                privileged: true,
                run_as_user: Some(0),
                run_as_group: Some(1000),
            },
            resources: ResourceRequirements {
                cpu: DEFAULT_CPU.to_string(),
                memory: DEFAULT_MEMORY.to_string(),
                devices: BTreeMap::new(),
            },
            init_steps: TRUST_ANCHOR_STEPS
                .iter()
                .chain(DEVICE_REPAIR_STEPS)
                .map(|s| s.to_string())
                .collect(),
        }
    }

    pub fn modern() -> Self {
        Self {
            kind: ProfileKind::Modern,
            security: SecurityProfile::default(),
            resources: ResourceRequirements {
                cpu: DEFAULT_CPU.to_string(),
                memory: DEFAULT_MEMORY.to_string(),
                devices: BTreeMap::from([(KVM_DEVICE_RESOURCE.to_string(), 1)]),
            },
            init_steps: TRUST_ANCHOR_STEPS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Pick the profile for an in-cluster version, or the modern profile
    /// when there is no cluster.
    pub fn for_version(version: Option<&ClusterVersion>) -> Result<Self> {
        let Some(version) = version else {
            return Ok(Self::modern());
        };

        if version.minor_number()? == LEGACY_MINOR_VERSION {
            Ok(Self::legacy())
        } else {
            Ok(Self::modern())
        }
    }

    /// Override the CPU/memory quantities, keeping device requests.
    pub fn with_base_resources(mut self, cpu: impl Into<String>, memory: impl Into<String>) -> Self {
        self.resources.cpu = cpu.into();
        self.resources.memory = memory.into();
        self
    }

    /// Replace the init steps entirely; an empty list suppresses the init
    /// container.
    pub fn with_init_steps(mut self, steps: Vec<String>) -> Self {
        self.init_steps = steps;
        self
    }
}
