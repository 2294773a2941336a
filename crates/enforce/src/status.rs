//! Condition bookkeeping and the status fan-in channel.
//!
//! Each worker owns a condition store; every mutation posts the parent's
//! identity onto a shared bounded channel. The channel never blocks a
//! reconciliation: on a full buffer the event is dropped, which is safe
//! because consumers always re-read the full condition maps.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::trace;
use vigil_core::{conditions, Condition, ParentRef};

/// Bucket used for patch-worker conditions that could not be anchored to a
/// target object (the target lookup itself failed).
pub const RECONCILER_BUCKET: &str = "reconciler";

/// Conditions per resource long key.
pub type ResourceConditions = HashMap<String, Vec<Condition>>;
/// Conditions per patch name, then per target short key.
pub type PatchConditions = HashMap<String, HashMap<String, Vec<Condition>>>;

/// Sending side of the status fan-in channel, cloned into every worker.
#[derive(Clone)]
pub struct StatusSink {
    parent: ParentRef,
    tx: mpsc::Sender<ParentRef>,
}

impl StatusSink {
    pub fn new(parent: ParentRef, tx: mpsc::Sender<ParentRef>) -> Self {
        Self { parent, tx }
    }

    /// Post a status-changed event. Dropped when the buffer is full or the
    /// consumer is gone.
    pub fn notify(&self) {
        if self.tx.try_send(self.parent.clone()).is_err() {
            trace!(parent = %self.parent, "status event dropped");
        }
    }
}

/// Condition list of a resource worker.
pub struct ConditionStore {
    conditions: Mutex<Vec<Condition>>,
    sink: StatusSink,
}

impl ConditionStore {
    /// A new store starts in `Initializing` without notifying: the
    /// coordinator is mid-restart and the consumer will be poked by the
    /// first real reconcile.
    pub fn new(sink: StatusSink, observed_generation: i64) -> Self {
        Self {
            conditions: Mutex::new(vec![Condition::initializing(observed_generation)]),
            sink,
        }
    }

    pub fn set(&self, condition: Condition) {
        {
            let mut list = self.conditions.lock().unwrap();
            conditions::add_or_replace(&mut list, condition);
        }
        self.sink.notify();
    }

    pub fn get(&self) -> Vec<Condition> {
        self.conditions.lock().unwrap().clone()
    }

    pub fn latest_is_error(&self) -> bool {
        let list = self.conditions.lock().unwrap();
        conditions::latest(&list).map_or(false, |c| c.is_error())
    }
}

/// Condition lists of a patch worker, keyed by target short key.
pub struct PatchConditionStore {
    conditions: Mutex<HashMap<String, Vec<Condition>>>,
    sink: StatusSink,
}

impl PatchConditionStore {
    pub fn new(sink: StatusSink) -> Self {
        let mut map = HashMap::new();
        map.insert(RECONCILER_BUCKET.to_string(), vec![Condition::initializing(0)]);
        Self {
            conditions: Mutex::new(map),
            sink,
        }
    }

    pub fn set(&self, target_key: &str, condition: Condition) {
        {
            let mut map = self.conditions.lock().unwrap();
            let list = map.entry(target_key.to_string()).or_default();
            conditions::add_or_replace(list, condition);
        }
        self.sink.notify();
    }

    pub fn snapshot(&self) -> HashMap<String, Vec<Condition>> {
        self.conditions.lock().unwrap().clone()
    }

    pub fn any_latest_error(&self) -> bool {
        let map = self.conditions.lock().unwrap();
        map.values()
            .any(|list| conditions::latest(list).map_or(false, |c| c.is_error()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vigil_core::ConditionType;

    fn sink() -> (StatusSink, mpsc::Receiver<ParentRef>) {
        let (tx, rx) = mpsc::channel(4);
        (
            StatusSink::new(
                ParentRef {
                    namespace: "ns".into(),
                    name: "parent".into(),
                },
                tx,
            ),
            rx,
        )
    }

    #[test]
    fn stores_start_initializing_without_notifying() {
        let (sink, mut rx) = sink();
        let store = ConditionStore::new(sink, 3);
        let list = store.get();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].condition_type, ConditionType::Initializing);
        assert_eq!(list[0].observed_generation, 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn set_replaces_and_notifies() {
        let (sink, mut rx) = sink();
        let store = ConditionStore::new(sink, 0);
        store.set(Condition::success(1));
        store.set(Condition::success(2));
        assert_eq!(store.get().len(), 2); // Initializing + Success
        assert_eq!(rx.try_recv().unwrap().name, "parent");
        assert_eq!(rx.try_recv().unwrap().name, "parent");
    }

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = StatusSink::new(
            ParentRef {
                namespace: "ns".into(),
                name: "parent".into(),
            },
            tx,
        );
        let store = ConditionStore::new(sink, 0);
        for i in 0..16 {
            store.set(Condition::success(i));
        }
        // no deadlock, no panic; the consumer re-reads full state anyway
        assert!(store.get().len() == 2);
    }

    #[test]
    fn patch_store_keys_by_target_and_tracks_errors() {
        let (sink, _rx) = sink();
        let store = PatchConditionStore::new(sink);
        assert!(store.snapshot().contains_key(RECONCILER_BUCKET));
        store.set("apps/web-1", Condition::success(4));
        assert!(!store.any_latest_error());
        store.set("apps/web-2", Condition::error(2, "patch rejected"));
        assert!(store.any_latest_error());
        let snap = store.snapshot();
        assert_eq!(snap["apps/web-1"].len(), 1);
        assert_eq!(snap["apps/web-2"][0].observed_generation, 2);
    }

    #[test]
    fn latest_error_reflects_most_recent_outcome() {
        let (sink, _rx) = sink();
        let store = ConditionStore::new(sink, 0);
        store.set(Condition::error(1, "boom"));
        assert!(store.latest_is_error());
        store.set(Condition::success(2));
        assert!(!store.latest_is_error());
    }
}
