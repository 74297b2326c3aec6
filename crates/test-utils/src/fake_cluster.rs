use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use gangway::errors::{GangwayError, Result};
use gangway::exec::BoxFuture;
use gangway::exec::cluster::{
    ClusterClient, ContainerState, PodEvent, PodEventKind, PodEventStream, PodHandle, PodPhase,
    PodSnapshot,
};
use gangway::exec::logs::LogStream;
use gangway::spec::UnitSpec;

/// A fake pod API that:
/// - records created and deleted pods
/// - replays a scripted list of watch events
/// - serves scripted log bodies per container
///
/// With `hold_open`, the watch stays open after the script until the pod
/// is deleted; otherwise it closes once the script is exhausted.
#[derive(Default)]
pub struct FakeClusterClient {
    events: Vec<PodEvent>,
    event_delay: Duration,
    hold_open: bool,
    fail_create: bool,
    logs: HashMap<String, Vec<u8>>,
    pub created: Mutex<Vec<UnitSpec>>,
    pub deleted: Mutex<Vec<String>>,
    pub log_requests: Mutex<Vec<String>>,
    watches: AtomicUsize,
    gone: CancellationToken,
}

impl FakeClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(mut self, events: Vec<PodEvent>) -> Self {
        self.events = events;
        self
    }

    pub fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn with_logs(mut self, container: &str, body: &[u8]) -> Self {
        self.logs.insert(container.to_string(), body.to_vec());
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().unwrap().len()
    }

    pub fn deleted_count(&self) -> usize {
        self.deleted.lock().unwrap().len()
    }

    pub fn watch_count(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }
}

impl ClusterClient for FakeClusterClient {
    fn create_pod<'a>(&'a self, spec: &'a UnitSpec) -> BoxFuture<'a, Result<PodHandle>> {
        Box::pin(async move {
            if self.fail_create {
                return Err(GangwayError::ClusterApi("pods is forbidden".to_string()));
            }
            self.created.lock().unwrap().push(spec.clone());
            Ok(PodHandle {
                name: spec.name.clone(),
                resource_version: "1".to_string(),
            })
        })
    }

    fn watch_pod<'a>(
        &'a self,
        _name: &'a str,
        _from_version: &'a str,
        _timeout: Duration,
    ) -> BoxFuture<'a, Result<PodEventStream>> {
        Box::pin(async move {
            self.watches.fetch_add(1, Ordering::SeqCst);
            let (tx, rx) = mpsc::channel(16);
            let events = self.events.clone();
            let delay = self.event_delay;
            let hold_open = self.hold_open;
            let gone = self.gone.clone();

            tokio::spawn(async move {
                for event in events {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                if hold_open {
                    gone.cancelled().await;
                }
            });
            Ok(rx)
        })
    }

    fn pod_logs<'a>(
        &'a self,
        _name: &'a str,
        container: &'a str,
        _since: Duration,
    ) -> BoxFuture<'a, Result<LogStream>> {
        Box::pin(async move {
            self.log_requests.lock().unwrap().push(container.to_string());
            match self.logs.get(container) {
                Some(body) => Ok(Box::pin(Cursor::new(body.clone())) as LogStream),
                None => Err(GangwayError::ClusterApi(format!(
                    "container {container} not found"
                ))),
            }
        })
    }

    fn delete_pod<'a>(&'a self, name: &'a str, _grace: Duration) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.deleted.lock().unwrap().push(name.to_string());
            self.gone.cancel();
            Ok(())
        })
    }
}

/// Watch event helpers.
pub fn event(kind: PodEventKind, pod: PodSnapshot) -> PodEvent {
    PodEvent { kind, pod }
}

pub fn phase(phase: PodPhase) -> PodEvent {
    event(PodEventKind::Modified, PodSnapshot::with_phase(phase))
}

pub fn exited(container: &str, code: i32) -> ContainerState {
    ContainerState {
        name: container.to_string(),
        exit_code: Some(code),
    }
}
