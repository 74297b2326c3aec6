// src/exec/backend.rs

//! The one contract both executors implement.
//!
//! The worker talks to a `WorkerBackend` instead of a concrete executor, so
//! the cluster and local executors stay leaves that know nothing of each
//! other. Tests can plug in their own backend.

use std::future::Future;
use std::pin::Pin;

use crate::engine::{ExecutionResult, TerminationSignal};
use crate::exec::cluster::{ClusterClient, ClusterExecutor};
use crate::exec::local::{LocalExecutor, LocalRuntime};
use crate::spec::UnitSpec;

/// Boxed, `Send` future used at every trait seam in this crate.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Run a unit to completion on some backend.
pub trait WorkerBackend: Send + Sync {
    /// Create the unit, supervise it until it finishes, times out or `term`
    /// fires, and remove everything it created before returning.
    fn run<'a>(
        &'a self,
        spec: &'a UnitSpec,
        term: &'a TerminationSignal,
    ) -> BoxFuture<'a, ExecutionResult>;
}

impl<C: ClusterClient> WorkerBackend for ClusterExecutor<C> {
    fn run<'a>(
        &'a self,
        spec: &'a UnitSpec,
        term: &'a TerminationSignal,
    ) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(ClusterExecutor::run(self, spec, term))
    }
}

impl<R: LocalRuntime> WorkerBackend for LocalExecutor<R> {
    fn run<'a>(
        &'a self,
        spec: &'a UnitSpec,
        term: &'a TerminationSignal,
    ) -> BoxFuture<'a, ExecutionResult> {
        Box::pin(LocalExecutor::run(self, spec, term))
    }
}
