//! One watch loop per registered kind: stream events, map them through the
//! worker's sink, and enqueue the resulting keys.

use std::sync::Arc;
use std::time::Duration;

use futures::TryStreamExt;
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject},
    runtime::watcher::{self, Event},
    Client,
};
use metrics::counter;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vigil_core::{ApiObject, ObjectKey};

use crate::EventSink;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Create or update, including items replayed on watch (re)start.
    Applied,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub object: ApiObject,
}

#[allow(clippy::too_many_arguments)]
pub(crate) async fn run_watch(
    client: Client,
    ar: ApiResource,
    namespaced: bool,
    namespace: Option<String>,
    sink: Arc<dyn EventSink>,
    queue: mpsc::Sender<ObjectKey>,
    cancel: CancellationToken,
    retry: Duration,
    worker: String,
) {
    let api: Api<DynamicObject> =
        vigil_resolve::dynamic_api(client, &ar, namespaced, namespace.as_deref());
    info!(worker = %worker, kind = %ar.kind, ns = ?namespace, "watch starting");

    loop {
        let stream = watcher::watcher(api.clone(), watcher::Config::default());
        futures::pin_mut!(stream);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(worker = %worker, kind = %ar.kind, "watch cancelled");
                    return;
                }
                next = stream.try_next() => {
                    match next {
                        Ok(Some(Event::Applied(obj))) => {
                            dispatch(&ar, EventKind::Applied, &obj, &sink, &queue, &worker).await;
                        }
                        Ok(Some(Event::Deleted(obj))) => {
                            dispatch(&ar, EventKind::Deleted, &obj, &sink, &queue, &worker).await;
                        }
                        Ok(Some(Event::Restarted(list))) => {
                            debug!(worker = %worker, kind = %ar.kind, count = list.len(), "watch restarted");
                            for obj in &list {
                                dispatch(&ar, EventKind::Applied, obj, &sink, &queue, &worker).await;
                            }
                        }
                        Ok(None) => {
                            warn!(worker = %worker, kind = %ar.kind, "watch stream ended; reopening");
                            counter!("vigil_watch_restarts_total", 1u64);
                            break;
                        }
                        Err(e) => {
                            warn!(worker = %worker, kind = %ar.kind, error = %e, "watch stream error");
                            counter!("vigil_watch_errors_total", 1u64);
                            tokio::select! {
                                _ = cancel.cancelled() => return,
                                _ = tokio::time::sleep(retry) => {}
                            }
                        }
                    }
                }
            }
        }
    }
}

async fn dispatch(
    ar: &ApiResource,
    kind: EventKind,
    obj: &DynamicObject,
    sink: &Arc<dyn EventSink>,
    queue: &mpsc::Sender<ObjectKey>,
    worker: &str,
) {
    let object = match crate::event_object(obj, ar) {
        Ok(o) => o,
        Err(e) => {
            warn!(worker = %worker, error = %e, "skipping malformed watch object");
            return;
        }
    };
    let event = WatchEvent { kind, object };
    let keys = match sink.map(&event).await {
        Ok(keys) => keys,
        Err(e) => {
            warn!(worker = %worker, error = %e, "event sink failed; dropping event");
            counter!("vigil_sink_errors_total", 1u64);
            return;
        }
    };
    for key in keys {
        if queue.send(key).await.is_err() {
            // consumer gone: the host is shutting down
            return;
        }
    }
}
