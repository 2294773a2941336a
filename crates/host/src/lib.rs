//! Stoppable watch host.
//!
//! Encapsulates the watch loops and work queues behind one cancellation
//! token: `start` spawns every registered worker's watches and consumer
//! loop, `stop` cancels the token and waits for all of them to exit. While
//! stopped, no watch is open and no worker can receive events, which is
//! what lets a coordinator swap the enforced sets safely.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use kube::{core::ApiResource, Client};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vigil_core::{ApiObject, ObjectKey};

mod watch;
mod worker;

pub use watch::{EventKind, WatchEvent};

/// Whether watches span the whole cluster or stay confined to the
/// namespace their reference names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ScopeMode {
    #[default]
    Cluster,
    PerNamespace,
}

/// Construction-time tunables. The host reads no environment variables.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// First retry delay after a failed reconciliation.
    pub backoff_base: Duration,
    /// Ceiling for the reconcile retry delay.
    pub backoff_max: Duration,
    /// Delay between watch stream errors before reconnecting.
    pub watch_retry: Duration,
    /// Capacity of each worker's key queue.
    pub queue_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(300),
            watch_retry: Duration::from_secs(5),
            queue_capacity: 256,
        }
    }
}

/// The kind a watch is opened on, resolved through discovery before the
/// host starts.
#[derive(Debug, Clone)]
pub struct WatchTarget {
    pub ar: ApiResource,
    pub namespaced: bool,
    /// Namespace the watch is scoped to in `PerNamespace` mode; `None`
    /// means cluster-wide (cluster-scoped kinds, or references whose
    /// namespace is only known after template rendering).
    pub namespace: Option<String>,
}

/// Maps raw watch events to the worker keys they should enqueue. An empty
/// result drops the event.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn map(&self, event: &WatchEvent) -> Result<Vec<ObjectKey>>;
}

/// One reconciler invocation per dequeued key; errors requeue the key with
/// exponential backoff.
#[async_trait]
pub trait Reconcile: Send + Sync {
    async fn reconcile(&self, key: ObjectKey) -> Result<()>;
}

/// A watch registration: one kind, one sink.
pub struct WatchSpec {
    pub target: WatchTarget,
    pub sink: Arc<dyn EventSink>,
}

/// A worker descriptor: its watches, its reconciler, and the synthetic
/// keys enqueued at start.
pub struct WorkerSpec {
    pub name: String,
    pub watches: Vec<WatchSpec>,
    pub reconciler: Arc<dyn Reconcile>,
    pub initial_keys: Vec<ObjectKey>,
}

struct HostState {
    cancel: Option<CancellationToken>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// A set of watch loops and worker queues that start and stop as a unit.
pub struct Host {
    client: Client,
    scope: ScopeMode,
    config: HostConfig,
    state: Mutex<HostState>,
}

impl Host {
    pub fn new(client: Client, scope: ScopeMode, config: HostConfig) -> Self {
        Self {
            client,
            scope,
            config,
            state: Mutex::new(HostState {
                cancel: None,
                tasks: Vec::new(),
            }),
        }
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.cancel.is_some()
    }

    /// Spawn every worker's queue consumer and watch loops. Starting a
    /// started host is a logged no-op.
    pub async fn start(&self, workers: Vec<WorkerSpec>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.cancel.is_some() {
            warn!("start called on a started host");
            return Ok(());
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();

        for spec in workers {
            let (queue_tx, queue_rx) =
                tokio::sync::mpsc::channel::<ObjectKey>(self.config.queue_capacity);

            for key in &spec.initial_keys {
                // capacity is sized well above any initial set; a full
                // queue here means the configuration is broken
                if queue_tx.try_send(key.clone()).is_err() {
                    warn!(worker = %spec.name, key = %key, "initial key dropped: queue full");
                }
            }

            for watch in spec.watches {
                let namespace = match self.scope {
                    ScopeMode::Cluster => None,
                    ScopeMode::PerNamespace => watch.target.namespace.clone(),
                };
                tasks.push(tokio::spawn(watch::run_watch(
                    self.client.clone(),
                    watch.target.ar.clone(),
                    watch.target.namespaced,
                    namespace,
                    watch.sink,
                    queue_tx.clone(),
                    cancel.child_token(),
                    self.config.watch_retry,
                    spec.name.clone(),
                )));
            }

            tasks.push(tokio::spawn(worker::run_worker(
                spec.name,
                spec.reconciler,
                queue_rx,
                queue_tx,
                cancel.child_token(),
                self.config.clone(),
            )));
        }

        info!(tasks = tasks.len(), "host started");
        state.cancel = Some(cancel);
        state.tasks = tasks;
        Ok(())
    }

    /// Cancel every loop and wait for them to exit.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        let cancel = match state.cancel.take() {
            Some(c) => c,
            None => return,
        };
        cancel.cancel();
        for task in state.tasks.drain(..) {
            let _ = task.await;
        }
        info!("host stopped");
    }
}

/// Convert a dynamic object seen on a watch stream.
pub(crate) fn event_object(obj: &kube::core::DynamicObject, ar: &ApiResource) -> Result<ApiObject> {
    vigil_resolve::object_from_dynamic(obj, ar)
}
