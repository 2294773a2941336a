//! Enforcing coordinator: owns the workers for one parent resource,
//! diffing desired sets against enforced sets and driving the host's
//! stop/start lifecycle.

use std::collections::HashMap;
use std::sync::Mutex as StdMutex;

use anyhow::{anyhow, Context, Result};
use kube::{api::DeleteParams, Client};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use vigil_core::declared::{diff_resources, patches_differ};
use vigil_core::{DeclaredPatch, DeclaredResource, ParentRef};
use vigil_host::{Host, HostConfig, ScopeMode};
use vigil_resolve::{dynamic_api, DiscoveryCache, Resolver};
use vigil_tmpl::Engine;

use crate::patch::PatchWorker;
use crate::resource::ResourceWorker;
use crate::status::{
    ConditionStore, PatchConditionStore, PatchConditions, ResourceConditions, StatusSink,
};
use crate::validate::Validator;
use crate::{EnforceError, EnforceResult};

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub host: HostConfig,
    /// Buffer of the status fan-in channel; overflow drops events.
    pub status_capacity: usize,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            status_capacity: 64,
        }
    }
}

struct Inner {
    resources: Vec<DeclaredResource>,
    patches: Vec<DeclaredPatch>,
    resource_stores: HashMap<String, Arc<ConditionStore>>,
    patch_stores: HashMap<String, Arc<PatchConditionStore>>,
}

/// One coordinator per parent custom resource. All lifecycle operations
/// serialize on an internal mutex; the enforced sets are only replaced
/// while the host is stopped.
pub struct Coordinator {
    parent: ParentRef,
    discovery: Arc<DiscoveryCache>,
    engine: Arc<Engine>,
    resolver: Arc<Resolver>,
    validator: Validator,
    host: Host,
    status_tx: mpsc::Sender<ParentRef>,
    status_rx: StdMutex<Option<mpsc::Receiver<ParentRef>>>,
    inner: Mutex<Inner>,
}

impl Coordinator {
    pub fn new(
        client: Client,
        parent: ParentRef,
        scope: ScopeMode,
        options: CoordinatorOptions,
    ) -> Self {
        let discovery = Arc::new(DiscoveryCache::new(client.clone()));
        let engine = Arc::new(Engine::new());
        let resolver = Arc::new(Resolver::new(discovery.clone(), engine.clone()));
        let validator = Validator::new(discovery.clone(), engine.clone());
        let host = Host::new(client, scope, options.host.clone());
        let (status_tx, status_rx) = mpsc::channel(options.status_capacity);
        Self {
            parent,
            discovery,
            engine,
            resolver,
            validator,
            host,
            status_tx,
            status_rx: StdMutex::new(Some(status_rx)),
            inner: Mutex::new(Inner {
                resources: Vec::new(),
                patches: Vec::new(),
                resource_stores: HashMap::new(),
                patch_stores: HashMap::new(),
            }),
        }
    }

    /// Take the receiving end of the status channel. Yields `None` after
    /// the first call; there is exactly one consumer.
    pub fn status_events(&self) -> Option<mpsc::Receiver<ParentRef>> {
        self.status_rx.lock().unwrap().take()
    }

    pub async fn is_started(&self) -> bool {
        self.host.is_started().await
    }

    /// The currently enforced resource set.
    pub async fn resources(&self) -> Vec<DeclaredResource> {
        self.inner.lock().await.resources.clone()
    }

    /// The currently enforced patch set.
    pub async fn patches(&self) -> Vec<DeclaredPatch> {
        self.inner.lock().await.patches.clone()
    }

    /// Idempotent reconcile step: validate, diff, and when the sets
    /// changed, delete removed resources, then restart the host with
    /// fresh workers. Calling with identical sets while running is a
    /// no-op with no side effects.
    pub async fn update(
        &self,
        desired_resources: Vec<DeclaredResource>,
        desired_patches: Vec<DeclaredPatch>,
    ) -> EnforceResult<()> {
        let mut inner = self.inner.lock().await;

        self.validator
            .validate(&desired_resources, &desired_patches)
            .await?;

        let resource_diff = diff_resources(&inner.resources, &desired_resources);
        let patches_changed = patches_differ(&inner.patches, &desired_patches);
        if !resource_diff.changed && !patches_changed && self.host.is_started().await {
            debug!(parent = %self.parent, "desired sets unchanged");
            return Ok(());
        }

        // deletions precede the restart so a removed resource never sits
        // in a window where a stale worker could re-enforce it
        for gone in &resource_diff.to_delete {
            self.delete_resource(gone).await.map_err(|e| {
                warn!(parent = %self.parent, key = %gone.key(), error = ?e, "delete failed");
                EnforceError::from(e)
            })?;
        }

        self.host.stop().await;
        inner.resources = desired_resources;
        inner.patches = desired_patches;
        self.start_workers(&mut inner).await?;
        info!(
            parent = %self.parent,
            resources = inner.resources.len(),
            patches = inner.patches.len(),
            "enforced sets replaced"
        );
        Ok(())
    }

    /// Stop enforcing. With `delete_resources`, every object in the
    /// current resource set is removed from the cluster, best-effort.
    /// Safe to call on a never-started coordinator.
    pub async fn terminate(&self, delete_resources: bool) -> EnforceResult<()> {
        let inner = self.inner.lock().await;
        self.host.stop().await;
        if delete_resources {
            let mut errors = Vec::new();
            for resource in &inner.resources {
                if let Err(e) = self.delete_resource(resource).await {
                    warn!(parent = %self.parent, key = %resource.key(), error = ?e, "delete failed");
                    errors.push(format!("{}: {:#}", resource.key(), e));
                }
            }
            if !errors.is_empty() {
                return Err(EnforceError::Internal(errors.join("; ")));
            }
        }
        Ok(())
    }

    /// Current condition maps. A stopped coordinator reports empty maps.
    pub async fn status(&self) -> (ResourceConditions, PatchConditions) {
        self.collect_status(false).await
    }

    /// Like `status`, filtered to workers whose most recent condition is
    /// an error.
    pub async fn failing_status(&self) -> (ResourceConditions, PatchConditions) {
        self.collect_status(true).await
    }

    async fn collect_status(&self, failing_only: bool) -> (ResourceConditions, PatchConditions) {
        let inner = self.inner.lock().await;
        if !self.host.is_started().await {
            return (HashMap::new(), HashMap::new());
        }
        let resources = inner
            .resource_stores
            .iter()
            .filter(|(_, store)| !failing_only || store.latest_is_error())
            .map(|(key, store)| (key.clone(), store.get()))
            .collect();
        let patches = inner
            .patch_stores
            .iter()
            .filter(|(_, store)| !failing_only || store.any_latest_error())
            .map(|(name, store)| (name.clone(), store.snapshot()))
            .collect();
        (resources, patches)
    }

    async fn start_workers(&self, inner: &mut Inner) -> EnforceResult<()> {
        let mut specs = Vec::new();
        let mut resource_stores = HashMap::new();
        let mut patch_stores = HashMap::new();

        for resource in &inner.resources {
            let sink = StatusSink::new(self.parent.clone(), self.status_tx.clone());
            let (spec, store) = ResourceWorker::build(&self.discovery, resource.clone(), sink)
                .await
                .map_err(EnforceError::from)?;
            resource_stores.insert(resource.key(), store);
            specs.push(spec);
        }
        for patch in &inner.patches {
            let sink = StatusSink::new(self.parent.clone(), self.status_tx.clone());
            let (spec, store) = PatchWorker::build(
                self.discovery.clone(),
                self.resolver.clone(),
                self.engine.clone(),
                patch.clone(),
                sink,
            )
            .await
            .map_err(EnforceError::from)?;
            patch_stores.insert(patch.name.clone(), store);
            specs.push(spec);
        }

        inner.resource_stores = resource_stores;
        inner.patch_stores = patch_stores;
        // a failed start leaves the coordinator stopped; the next update
        // runs through the same path and can recover
        self.host.start(specs).await.map_err(EnforceError::from)
    }

    /// Delete a declared resource from the cluster; a missing object is
    /// a success.
    async fn delete_resource(&self, resource: &DeclaredResource) -> Result<()> {
        let gvk = resource.object.gvk();
        let (ar, namespaced) = self.discovery.api_resource(&gvk).await?;
        let api = dynamic_api(
            self.discovery.client(),
            &ar,
            namespaced,
            resource.object.namespace(),
        );
        match api
            .delete(resource.object.name(), &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(key = %resource.key(), "resource deleted");
                Ok(())
            }
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(anyhow!(e)).with_context(|| format!("deleting {}", resource.key())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offline_coordinator() -> Coordinator {
        let config = kube::Config::new("http://127.0.0.1:1".parse().unwrap());
        let client = Client::try_from(config).expect("offline client");
        Coordinator::new(
            client,
            ParentRef {
                namespace: "ns".into(),
                name: "parent".into(),
            },
            ScopeMode::Cluster,
            CoordinatorOptions::default(),
        )
    }

    #[tokio::test]
    async fn status_is_empty_before_any_start() {
        let coordinator = offline_coordinator();
        let (resources, patches) = coordinator.status().await;
        assert!(resources.is_empty());
        assert!(patches.is_empty());
    }

    #[tokio::test]
    async fn status_events_hands_out_one_receiver() {
        let coordinator = offline_coordinator();
        assert!(coordinator.status_events().is_some());
        assert!(coordinator.status_events().is_none());
    }

    #[tokio::test]
    async fn terminate_without_start_is_safe() {
        let coordinator = offline_coordinator();
        coordinator.terminate(false).await.expect("terminate");
    }
}
