// src/client/discovery.rs

//! Cluster membership and version detection, run once at startup.

use kube::Client;
use tracing::{info, warn};

use crate::errors::{GangwayError, Result};
use crate::exec::local::LOCAL_MODE_ENV;
use crate::spec::ClusterVersion;

/// Set by the orchestrator in every pod it schedules.
pub const SERVICE_HOST_ENV: &str = "KUBERNETES_SERVICE_HOST";

/// What startup learned about the environment.
#[derive(Clone)]
pub struct ClusterInfo {
    pub in_cluster: bool,
    pub version: Option<ClusterVersion>,
    pub client: Option<Client>,
}

impl std::fmt::Debug for ClusterInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterInfo")
            .field("in_cluster", &self.in_cluster)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl ClusterInfo {
    pub fn local() -> Self {
        Self {
            in_cluster: false,
            version: None,
            client: None,
        }
    }
}

/// Membership from the process environment only; no network calls.
///
/// `GANGWAY_FORCE_NO_CLUSTER` wins so a local worker (which has it set by
/// the local executor) never tries to reach a cluster.
pub fn running_in_cluster<F>(lookup: F) -> bool
where
    F: Fn(&str) -> Option<String>,
{
    if lookup(LOCAL_MODE_ENV).is_some_and(|v| !v.is_empty()) {
        return false;
    }
    lookup(SERVICE_HOST_ENV).is_some_and(|v| !v.is_empty())
}

/// Detect membership and, in-cluster, connect and read the server version.
pub async fn discover() -> Result<ClusterInfo> {
    if !running_in_cluster(|k| std::env::var(k).ok()) {
        info!("not running in a cluster; using the local container runtime");
        return Ok(ClusterInfo::local());
    }

    let client = Client::try_default()
        .await
        .map_err(|e| GangwayError::Connection(format!("building cluster client: {e}")))?;
    let info = client
        .apiserver_version()
        .await
        .map_err(|e| GangwayError::Connection(format!("querying server version: {e}")))?;

    let version = ClusterVersion {
        major: info.major,
        minor: info.minor,
        git_version: info.git_version,
    };
    if version.minor_number().is_err() {
        warn!(minor = %version.minor, "server reported an unparsable minor version");
    }
    info!(major = %version.major, minor = %version.minor, git = %version.git_version, "detected cluster version");

    Ok(ClusterInfo {
        in_cluster: true,
        version: Some(version),
        client: Some(client),
    })
}
