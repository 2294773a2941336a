//! Resource worker: keeps one declared object present and equal to its
//! declared form, modulo excluded paths.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{
    api::{Api, Patch, PatchParams, PostParams},
    core::{ApiResource, DynamicObject},
    Client,
};
use tracing::{debug, info, warn};
use vigil_core::{strip, Condition, DeclaredResource, ObjectKey};
use vigil_host::{EventKind, EventSink, Reconcile, WatchEvent, WatchSpec, WatchTarget, WorkerSpec};
use vigil_resolve::{dynamic_api, DiscoveryCache};

use crate::status::{ConditionStore, StatusSink};

pub struct ResourceWorker {
    resource: DeclaredResource,
    client: Client,
    ar: ApiResource,
    namespaced: bool,
    store: Arc<ConditionStore>,
}

impl ResourceWorker {
    /// Build the worker descriptor: one watch on the declared GVK filtered
    /// to the declared namespace/name, plus a synthetic first key so the
    /// initial pass never depends on observing the object.
    pub async fn build(
        discovery: &DiscoveryCache,
        resource: DeclaredResource,
        sink: StatusSink,
    ) -> Result<(WorkerSpec, Arc<ConditionStore>)> {
        let gvk = resource.object.gvk();
        let (ar, namespaced) = discovery.api_resource(&gvk).await?;
        let store = Arc::new(ConditionStore::new(sink, resource.object.generation()));
        let key = resource.object.object_key();
        let name = format!("resource:{}", resource.key());

        let worker = Arc::new(ResourceWorker {
            resource: resource.clone(),
            client: discovery.client(),
            ar: ar.clone(),
            namespaced,
            store: store.clone(),
        });

        let filter = Arc::new(ResourceEventFilter {
            client: discovery.client(),
            key: key.clone(),
        });

        let spec = WorkerSpec {
            name,
            watches: vec![WatchSpec {
                target: WatchTarget {
                    ar,
                    namespaced,
                    namespace: resource.object.namespace().map(|s| s.to_string()),
                },
                sink: filter,
            }],
            reconciler: worker,
            initial_keys: vec![key],
        };
        Ok((spec, store))
    }

    pub fn status(&self) -> Vec<Condition> {
        self.store.get()
    }

    async fn create_declared(&self, api: &Api<DynamicObject>) -> Result<()> {
        let obj: DynamicObject = serde_json::from_value(self.resource.object.content().clone())
            .context("building object for create")?;
        api.create(&PostParams::default(), &obj)
            .await
            .context("creating declared object")?;
        info!(key = %self.resource.key(), "declared object created");
        Ok(())
    }
}

#[async_trait]
impl Reconcile for ResourceWorker {
    async fn reconcile(&self, key: ObjectKey) -> Result<()> {
        let api = dynamic_api(
            self.client.clone(),
            &self.ar,
            self.namespaced,
            key.namespace.as_deref(),
        );

        let live = match api.get_opt(&key.name).await {
            Ok(live) => live,
            Err(e) => {
                let err = anyhow!(e).context("fetching live object");
                self.store.set(Condition::error(0, format!("{:#}", err)));
                return Err(err);
            }
        };

        let live = match live {
            Some(obj) => vigil_resolve::object_from_dynamic(&obj, &self.ar)?,
            None => {
                // recreate; generation of the fresh object is unknown here
                if let Err(e) = self.create_declared(&api).await {
                    self.store.set(Condition::error(0, format!("{:#}", e)));
                    return Err(e);
                }
                self.store.set(Condition::success(0));
                return Ok(());
            }
        };

        let paths = &self.resource.excluded_paths;
        let equal = strip::stripped_equal(self.resource.object.content(), live.content(), paths)?;
        if equal {
            debug!(key = %self.resource.key(), "live object matches declared form");
            self.store.set(Condition::success(live.generation()));
            return Ok(());
        }

        let payload = strip::strip(self.resource.object.content(), paths)?;
        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Merge(&payload))
            .await
        {
            Ok(_) => {
                info!(key = %self.resource.key(), "drift corrected");
                self.store.set(Condition::success(live.generation()));
                Ok(())
            }
            Err(e) => {
                let err = anyhow!(e).context("patching drifted object");
                self.store
                    .set(Condition::error(live.generation(), format!("{:#}", err)));
                Err(err)
            }
        }
    }
}

/// Accepts events for exactly the declared `(namespace, name)`. A delete
/// fires only when the enclosing namespace is not itself going away; the
/// namespace is read directly from the API server, never from a cache.
struct ResourceEventFilter {
    client: Client,
    key: ObjectKey,
}

impl ResourceEventFilter {
    async fn namespace_terminating(&self, namespace: &str) -> bool {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.get_opt(namespace).await {
            Ok(Some(ns)) => ns.metadata.deletion_timestamp.is_some(),
            Ok(None) => false,
            Err(e) => {
                // the API server rejects writes in a terminating namespace
                // anyway, so reconcile rather than silently stall
                warn!(namespace = %namespace, error = %e, "namespace lookup failed");
                false
            }
        }
    }
}

#[async_trait]
impl EventSink for ResourceEventFilter {
    async fn map(&self, event: &WatchEvent) -> Result<Vec<ObjectKey>> {
        if event.object.object_key() != self.key {
            return Ok(vec![]);
        }
        if event.kind == EventKind::Deleted {
            if let Some(ns) = self.key.namespace.as_deref() {
                if self.namespace_terminating(ns).await {
                    debug!(key = %self.key, "namespace terminating; not recreating");
                    return Ok(vec![]);
                }
            }
        }
        Ok(vec![self.key.clone()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use vigil_core::ApiObject;

    #[test]
    fn declared_strip_payload_is_the_merge_patch() {
        let object = ApiObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-a", "namespace": "ns1", "labels": {"x": "y"}},
            "data": {"foo": "bar"}
        }))
        .unwrap();
        let declared = DeclaredResource::new(object, Vec::<String>::new());
        let payload =
            strip::strip(declared.object.content(), &declared.excluded_paths).unwrap();
        // metadata is excluded by default, so the patch never fights the
        // server over labels/annotations
        assert!(payload.get("metadata").is_none());
        assert_eq!(payload["data"]["foo"], "bar");
    }

    #[test]
    fn drift_detection_honors_excluded_paths() {
        let declared = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-a", "namespace": "ns1"},
            "data": {"foo": "bar"}
        });
        let live_same = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-a", "namespace": "ns1", "resourceVersion": "7"},
            "status": {"noise": true},
            "data": {"foo": "bar"}
        });
        let live_drifted = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-a", "namespace": "ns1"},
            "data": {"foo": "baz"}
        });
        let resource = DeclaredResource::new(
            ApiObject::from_value(declared).unwrap(),
            Vec::<String>::new(),
        );
        let paths = &resource.excluded_paths;
        assert!(strip::stripped_equal(resource.object.content(), &live_same, paths).unwrap());
        assert!(!strip::stripped_equal(resource.object.content(), &live_drifted, paths).unwrap());
    }
}
