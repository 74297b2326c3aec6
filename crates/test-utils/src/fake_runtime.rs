use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use gangway::errors::{GangwayError, Result};
use gangway::exec::BoxFuture;
use gangway::exec::local::{AttachSession, ContainerRequest, LocalRuntime};
use gangway::exec::logs::LogStream;

/// A fake local container runtime that:
/// - hands out ids `c-0`, `c-1`, ... and records every request
/// - replays `attach_output` on the main container's attach session
/// - exits the main container with `exit_code`, or, with `block`, only once
///   it has been removed
/// - always exits cleaner helpers with 0
/// - with `start_delay`, takes that long to start the main container and
///   rejects the start if it was removed meanwhile
#[derive(Default)]
pub struct FakeLocalRuntime {
    exit_code: i64,
    block: bool,
    fail_create: bool,
    fail_start: bool,
    start_delay: Option<Duration>,
    attach_output: Vec<u8>,
    next_id: AtomicUsize,
    names: Mutex<HashMap<String, String>>,
    removed_signals: Mutex<HashMap<String, CancellationToken>>,
    pub created: Mutex<Vec<ContainerRequest>>,
    pub started: Mutex<Vec<String>>,
    pub removed: Mutex<Vec<String>>,
}

impl FakeLocalRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn exiting_with(mut self, code: i64) -> Self {
        self.exit_code = code;
        self
    }

    pub fn blocking_until_removed(mut self) -> Self {
        self.block = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_start(mut self) -> Self {
        self.fail_start = true;
        self
    }

    pub fn with_start_delay(mut self, delay: Duration) -> Self {
        self.start_delay = Some(delay);
        self
    }

    pub fn with_output(mut self, output: &[u8]) -> Self {
        self.attach_output = output.to_vec();
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Names of created containers, in creation order.
    pub fn created_names(&self) -> Vec<String> {
        self.created
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.name.clone())
            .collect()
    }

    /// Names of removed containers, in removal order.
    pub fn removed_names(&self) -> Vec<String> {
        let names = self.names.lock().unwrap();
        self.removed
            .lock()
            .unwrap()
            .iter()
            .map(|id| names.get(id).cloned().unwrap_or_else(|| id.clone()))
            .collect()
    }

    fn name_of(&self, id: &str) -> Option<String> {
        self.names.lock().unwrap().get(id).cloned()
    }

    fn is_cleaner(&self, id: &str) -> bool {
        self.name_of(id).is_some_and(|n| n.ends_with("-cleaner"))
    }
}

impl LocalRuntime for FakeLocalRuntime {
    fn create_container<'a>(&'a self, request: &'a ContainerRequest) -> BoxFuture<'a, Result<String>> {
        Box::pin(async move {
            if self.fail_create && !request.name.ends_with("-cleaner") {
                return Err(GangwayError::RuntimeApi("image not known".to_string()));
            }
            let id = format!("c-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            self.names.lock().unwrap().insert(id.clone(), request.name.clone());
            self.removed_signals
                .lock()
                .unwrap()
                .insert(id.clone(), CancellationToken::new());
            self.created.lock().unwrap().push(request.clone());
            Ok(id)
        })
    }

    fn start_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if self.fail_start && !self.is_cleaner(id) {
                return Err(GangwayError::RuntimeApi("OCI runtime error".to_string()));
            }
            if let Some(delay) = self.start_delay.filter(|_| !self.is_cleaner(id)) {
                tokio::time::sleep(delay).await;
                if self.removed.lock().unwrap().iter().any(|r| r == id) {
                    return Err(GangwayError::RuntimeApi(format!("no such container {id}")));
                }
            }
            self.started.lock().unwrap().push(id.to_string());
            Ok(())
        })
    }

    fn attach_container<'a>(&'a self, _id: &'a str) -> BoxFuture<'a, Result<AttachSession>> {
        Box::pin(async move {
            Ok(AttachSession {
                output: Box::pin(Cursor::new(self.attach_output.clone())) as LogStream,
                input: Box::pin(tokio::io::sink()),
            })
        })
    }

    fn wait_container<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<i64>> {
        Box::pin(async move {
            if self.is_cleaner(id) {
                return Ok(0);
            }
            if self.block {
                let removed = self.removed_signals.lock().unwrap().get(id).cloned();
                match removed {
                    Some(token) => token.cancelled().await,
                    None => return Err(GangwayError::RuntimeApi(format!("no such container {id}"))),
                }
                return Ok(137);
            }
            Ok(self.exit_code)
        })
    }

    fn remove_container<'a>(&'a self, id: &'a str, _force: bool, _volumes: bool) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.removed.lock().unwrap().push(id.to_string());
            if let Some(token) = self.removed_signals.lock().unwrap().get(id) {
                token.cancel();
            }
            Ok(())
        })
    }
}
