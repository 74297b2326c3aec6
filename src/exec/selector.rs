// src/exec/selector.rs

//! Backend selection: the only place that knows both executors exist.

use std::fmt;

use crate::engine::{ExecutionResult, TerminationSignal};
use crate::exec::backend::{BoxFuture, WorkerBackend};
use crate::exec::cluster::{ClusterClient, ClusterExecutor};
use crate::exec::local::{LocalExecutor, LocalRuntime};
use crate::spec::UnitSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Cluster,
    Local,
}

impl BackendKind {
    /// Managed cluster when running inside one, local runtime otherwise.
    pub fn select(in_cluster: bool) -> Self {
        if in_cluster {
            BackendKind::Cluster
        } else {
            BackendKind::Local
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cluster => f.write_str("cluster"),
            BackendKind::Local => f.write_str("local"),
        }
    }
}

/// Tagged dispatch over the two executors.
pub enum Backend<C: ClusterClient, R: LocalRuntime> {
    Cluster(ClusterExecutor<C>),
    Local(LocalExecutor<R>),
}

impl<C: ClusterClient, R: LocalRuntime> fmt::Debug for Backend<C, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Cluster(exec) => f.debug_tuple("Cluster").field(exec).finish(),
            Backend::Local(exec) => f.debug_tuple("Local").field(exec).finish(),
        }
    }
}

impl<C: ClusterClient, R: LocalRuntime> Backend<C, R> {
    pub fn kind(&self) -> BackendKind {
        match self {
            Backend::Cluster(_) => BackendKind::Cluster,
            Backend::Local(_) => BackendKind::Local,
        }
    }
}

impl<C: ClusterClient, R: LocalRuntime> WorkerBackend for Backend<C, R> {
    fn run<'a>(
        &'a self,
        spec: &'a UnitSpec,
        term: &'a TerminationSignal,
    ) -> BoxFuture<'a, ExecutionResult> {
        match self {
            Backend::Cluster(exec) => Box::pin(exec.run(spec, term)),
            Backend::Local(exec) => Box::pin(exec.run(spec, term)),
        }
    }
}
