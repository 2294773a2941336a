//! Patch worker: renders a template from the target object and its source
//! references, and applies the result to every object the target
//! reference selects.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use async_trait::async_trait;
use kube::{
    api::{Patch, PatchParams},
    core::ApiResource,
    Client,
};
use serde_json::Value as Json;
use tracing::{debug, info};
use vigil_core::{
    gvk_from_api_version, ApiObject, Condition, DeclaredPatch, ObjectKey, PatchType, SourceRef,
    TargetRef,
};
use vigil_host::{EventKind, EventSink, Reconcile, WatchEvent, WatchSpec, WatchTarget, WorkerSpec};
use vigil_resolve::{dynamic_api, fieldpath, DiscoveryCache, Resolver};
use vigil_tmpl::Engine;

use crate::status::{PatchConditionStore, StatusSink, RECONCILER_BUCKET};

pub struct PatchWorker {
    patch: DeclaredPatch,
    client: Client,
    resolver: Arc<Resolver>,
    engine: Arc<Engine>,
    target_ar: ApiResource,
    target_namespaced: bool,
    store: Arc<PatchConditionStore>,
}

impl PatchWorker {
    /// Build the worker descriptor: one watch on the target kind plus one
    /// per source reference. Source watches with a templated namespace
    /// fall back to cluster-wide scope.
    pub async fn build(
        discovery: Arc<DiscoveryCache>,
        resolver: Arc<Resolver>,
        engine: Arc<Engine>,
        patch: DeclaredPatch,
        sink: StatusSink,
    ) -> Result<(WorkerSpec, Arc<PatchConditionStore>)> {
        let target_gvk = gvk_from_api_version(&patch.target.api_version, &patch.target.kind);
        let (target_ar, target_namespaced) = discovery.api_resource(&target_gvk).await?;
        let store = Arc::new(PatchConditionStore::new(sink));

        let worker = Arc::new(PatchWorker {
            patch: patch.clone(),
            client: discovery.client(),
            resolver: resolver.clone(),
            engine: engine.clone(),
            target_ar: target_ar.clone(),
            target_namespaced,
            store: store.clone(),
        });

        let mut watches = vec![WatchSpec {
            target: WatchTarget {
                ar: target_ar,
                namespaced: target_namespaced,
                namespace: patch.target.namespace.clone(),
            },
            sink: Arc::new(TargetEventFilter {
                resolver: resolver.clone(),
                target: patch.target.clone(),
                last_seen: Mutex::new(HashMap::new()),
            }),
        }];

        for source in &patch.sources {
            let source_gvk = gvk_from_api_version(&source.api_version, &source.kind);
            let (source_ar, source_namespaced) = discovery.api_resource(&source_gvk).await?;
            let namespace = if source.is_templated() || source.namespace.is_empty() {
                None
            } else {
                Some(source.namespace.clone())
            };
            watches.push(WatchSpec {
                target: WatchTarget {
                    ar: source_ar,
                    namespaced: source_namespaced,
                    namespace,
                },
                sink: Arc::new(SourceEventFilter {
                    resolver: resolver.clone(),
                    target: patch.target.clone(),
                    source: source.clone(),
                    last_seen: Mutex::new(HashMap::new()),
                }),
            });
        }

        // patches have no synthetic first key for multi-instance targets;
        // the initial watch replay enqueues every currently selected object
        let spec = WorkerSpec {
            name: format!("patch:{}", patch.name),
            watches,
            reconciler: worker,
            initial_keys: vec![],
        };
        Ok((spec, store))
    }

    fn kube_patch(&self, body: Vec<u8>) -> Result<(Patch<Json>, PatchParams)> {
        let value: Json = serde_json::from_slice(&body).context("parsing rendered patch")?;
        Ok(match self.patch.patch_type {
            PatchType::Json => {
                let ops: json_patch::Patch =
                    serde_json::from_value(value).context("parsing RFC-6902 operations")?;
                (Patch::Json(ops), PatchParams::default())
            }
            PatchType::Merge => (Patch::Merge(value), PatchParams::default()),
            PatchType::StrategicMerge => (Patch::Strategic(value), PatchParams::default()),
            PatchType::Apply => (Patch::Apply(value), PatchParams::apply("vigil")),
        })
    }
}

#[async_trait]
impl Reconcile for PatchWorker {
    async fn reconcile(&self, key: ObjectKey) -> Result<()> {
        // 1. resolve the live target; failures here have no object to
        //    anchor a condition on
        let target = match self.resolver.resolve_at(&self.patch.target, &key).await {
            Ok(t) => t,
            Err(e) => {
                self.store
                    .set(RECONCILER_BUCKET, Condition::error(0, format!("{:#}", e)));
                return Err(e);
            }
        };
        let target_key = target.short_key();

        // 2. resolve and project every source in declaration order
        let mut sources: Vec<Json> = Vec::with_capacity(self.patch.sources.len());
        for source in &self.patch.sources {
            match self.resolver.resolve_source_value(source, &target).await {
                Ok(v) => sources.push(v),
                Err(e) => {
                    self.store
                        .set(&target_key, Condition::error(target.generation(), format!("{:#}", e)));
                    return Err(e);
                }
            }
        }

        // 3. render the template, 4. apply with the declared patch type
        let outcome = async {
            let body = self
                .engine
                .render_patch(&self.patch.template, target.content(), &sources)
                .context("rendering patch template")?;
            let (patch, params) = self.kube_patch(body)?;
            let api = dynamic_api(
                self.client.clone(),
                &self.target_ar,
                self.target_namespaced,
                target.namespace(),
            );
            api.patch(target.name(), &params, &patch)
                .await
                .context("applying rendered patch")?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        match outcome {
            Ok(()) => {
                info!(patch = %self.patch.name, target = %target_key, "patch applied");
                self.store
                    .set(&target_key, Condition::success(target.generation()));
                Ok(())
            }
            Err(e) => {
                self.store
                    .set(&target_key, Condition::error(target.generation(), format!("{:#}", e)));
                Err(e)
            }
        }
    }
}

/// Target watch filter: selection rules plus an update-noise comparison of
/// the serialized object minus resourceVersion/managedFields.
struct TargetEventFilter {
    resolver: Arc<Resolver>,
    target: TargetRef,
    last_seen: Mutex<HashMap<ObjectKey, Json>>,
}

#[async_trait]
impl EventSink for TargetEventFilter {
    async fn map(&self, event: &WatchEvent) -> Result<Vec<ObjectKey>> {
        if event.kind == EventKind::Deleted {
            // a vanished target cannot be patched; nothing to do
            return Ok(vec![]);
        }
        if !self.resolver.selects(&self.target, &event.object).await? {
            return Ok(vec![]);
        }
        let key = event.object.object_key();
        let current = event.object.without_volatile();
        let mut seen = self.last_seen.lock().unwrap();
        if seen.get(&key) == Some(&current) {
            return Ok(vec![]);
        }
        seen.insert(key.clone(), current);
        Ok(vec![key])
    }
}

/// Source watch filter: relevance is decided by resolving which targets
/// currently reference the event object; exactly those target keys are
/// enqueued. With a field path set, updates that leave the projected
/// sub-tree unchanged are dropped.
struct SourceEventFilter {
    resolver: Arc<Resolver>,
    target: TargetRef,
    source: SourceRef,
    last_seen: Mutex<HashMap<ObjectKey, Json>>,
}

impl SourceEventFilter {
    fn observed_value(&self, object: &ApiObject) -> Json {
        match self.source.field_path.as_deref() {
            Some(path) => fieldpath::project(object.content(), Some(path))
                // a vanished projection is itself a change
                .unwrap_or(Json::Null),
            None => object.without_volatile(),
        }
    }
}

#[async_trait]
impl EventSink for SourceEventFilter {
    async fn map(&self, event: &WatchEvent) -> Result<Vec<ObjectKey>> {
        if event.kind == EventKind::Deleted {
            // losing a source gives nothing to recompute the patch from
            return Ok(vec![]);
        }
        if event.object.api_version() != self.source.api_version
            || event.object.kind() != self.source.kind
        {
            return Ok(vec![]);
        }

        let event_key = event.object.object_key();
        let observed = self.observed_value(&event.object);
        {
            let mut seen = self.last_seen.lock().unwrap();
            if seen.get(&event_key) == Some(&observed) {
                return Ok(vec![]);
            }
            seen.insert(event_key.clone(), observed);
        }

        // literal references short-circuit: a non-matching object cannot be
        // relevant to any target
        if !self.source.is_templated() {
            let literal_matches = event_key.name == self.source.name
                && (self.source.namespace.is_empty()
                    || event_key.namespace.as_deref() == Some(self.source.namespace.as_str()));
            if !literal_matches {
                return Ok(vec![]);
            }
            return self.resolver.target_keys(&self.target).await;
        }

        // templated references: resolve the current targets and keep those
        // whose rendered source reference is the event object
        let selection = self.resolver.selection(&self.target).await?;
        let targets = if selection.multiple {
            self.resolver.resolve_multiple(&self.target).await?
        } else {
            vec![self.resolver.resolve_single(&self.target).await?]
        };
        let mut keys = Vec::new();
        for target in &targets {
            let rendered = self
                .resolver
                .rendered_source_key(&self.source, target)
                .await?;
            if rendered == event_key {
                keys.push(target.object_key());
            }
        }
        debug!(source = %event_key, enqueued = keys.len(), "source event mapped to targets");
        Ok(keys)
    }
}
