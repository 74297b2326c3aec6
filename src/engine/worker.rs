// src/engine/worker.rs

//! Caller-facing entry point: build the unit, hand it to the active backend.

use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::engine::{ExecutionResult, RunFailure, TerminationSignal};
use crate::exec::backend::WorkerBackend;
use crate::exec::logs::LogCopyError;
use crate::spec::{BuildMeta, EnvVar, SpecBuilder, UnitSpec};

/// One worker supervisor: a spec builder bound to a backend.
pub struct Worker<B: WorkerBackend> {
    builder: SpecBuilder,
    backend: B,
    log_errors: Option<mpsc::UnboundedReceiver<LogCopyError>>,
}

impl<B: WorkerBackend> Worker<B> {
    pub fn new(builder: SpecBuilder, backend: B) -> Self {
        Self {
            builder,
            backend,
            log_errors: None,
        }
    }

    /// Attach the log multiplexer's error channel; whatever it collected is
    /// logged after each run.
    pub fn with_log_errors(mut self, rx: mpsc::UnboundedReceiver<LogCopyError>) -> Self {
        self.log_errors = Some(rx);
        self
    }

    pub fn builder(&self) -> &SpecBuilder {
        &self.builder
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Build the unit spec without running it.
    pub fn plan(&self, meta: &BuildMeta, index: u32, env: &[EnvVar]) -> Result<UnitSpec, RunFailure> {
        self.builder
            .build(meta, index, env)
            .map_err(|e| RunFailure::InvalidSpec(e.to_string()))
    }

    /// Run worker `index` of the build described by `meta` to completion.
    ///
    /// `env` is merged over the base environment. `term` aborts the run;
    /// cleanup still happens before this returns.
    pub async fn run_worker(
        &mut self,
        meta: &BuildMeta,
        index: u32,
        env: &[EnvVar],
        term: &TerminationSignal,
    ) -> ExecutionResult {
        let spec = self.plan(meta, index, env)?;

        let started = Instant::now();
        info!(unit = %spec.name, image = %spec.image, "starting worker");
        let result = self.backend.run(&spec, term).await;
        info!(unit = %spec.name, elapsed = ?started.elapsed(), ok = result.is_ok(), "worker finished");

        self.report_log_errors();
        result
    }

    fn report_log_errors(&mut self) {
        let Some(rx) = self.log_errors.as_mut() else {
            return;
        };
        let mut count = 0usize;
        while let Ok(err) = rx.try_recv() {
            count += 1;
            warn!(error = %err, "log copy failed during run");
        }
        if count > 0 {
            warn!(count, "some container logs may be incomplete");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::exec::backend::BoxFuture;
    use crate::spec::{ExecutionProfile, SpecDefaults};

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<UnitSpec>>,
    }

    impl WorkerBackend for Recording {
        fn run<'a>(
            &'a self,
            spec: &'a UnitSpec,
            _term: &'a TerminationSignal,
        ) -> BoxFuture<'a, ExecutionResult> {
            self.seen.lock().unwrap().push(spec.clone());
            Box::pin(async { Ok(()) })
        }
    }

    fn worker() -> Worker<Recording> {
        Worker::new(
            SpecBuilder::new(SpecDefaults::default(), ExecutionProfile::modern()),
            Recording::default(),
        )
    }

    #[tokio::test]
    async fn invalid_metadata_never_reaches_backend() {
        let mut w = worker();
        let meta = BuildMeta::default();
        let result = w.run_worker(&meta, 0, &[], &TerminationSignal::new()).await;

        assert!(matches!(result, Err(RunFailure::InvalidSpec(_))));
        assert!(w.backend().seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn caller_env_reaches_backend() {
        let mut w = worker();
        let meta = BuildMeta {
            build_config: "b1".to_string(),
            build_number: "5".to_string(),
            image: "img".to_string(),
            ..Default::default()
        };
        let env = [EnvVar::new("FOO", "bar")];
        w.run_worker(&meta, 2, &env, &TerminationSignal::new())
            .await
            .unwrap();

        let seen = w.backend().seen.lock().unwrap();
        assert_eq!(seen[0].name, "b1-5-worker-2");
        assert_eq!(seen[0].env_value("FOO"), Some("bar"));
    }
}
