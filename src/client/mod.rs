// src/client/mod.rs

//! Concrete transports behind the executor seams.
//!
//! - [`k8s`]: pods through the Kubernetes API.
//! - [`podman`]: containers through the podman socket.
//! - [`discovery`]: cluster membership and version.

pub mod discovery;
pub mod k8s;
pub mod podman;

pub use discovery::{ClusterInfo, discover};
pub use k8s::KubeClusterClient;
pub use podman::PodmanRuntime;
