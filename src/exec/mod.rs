// src/exec/mod.rs

//! Executors that take a [`crate::spec::UnitSpec`] to a terminal
//! [`crate::engine::ExecutionResult`].
//!
//! - [`cluster`]: pod on a managed cluster, supervised through a watch.
//! - [`local`]: container on the local runtime socket, attached directly.
//! - [`logs`]: per-container log fan-out shared by both.
//! - [`selector`]: picks one of the two at startup.

pub mod backend;
pub mod cluster;
pub mod local;
pub mod logs;
pub mod scratch;
pub mod selector;

pub use backend::{BoxFuture, WorkerBackend};
pub use cluster::{ClusterClient, ClusterExecutor, ClusterSettings};
pub use local::{LocalExecutor, LocalRuntime, LocalSettings};
pub use logs::{Console, LogCopyError, LogMultiplexer};
pub use selector::{Backend, BackendKind};
