//! Discovery metadata and object-reference resolution.
//!
//! The discovery cache is owned by one coordinator; GVK existence is
//! validated at admission time, so entries never need invalidation within
//! the lifetime of an enforced set.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{anyhow, Result};
use kube::{
    api::Api,
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::debug;

pub mod fieldpath;
pub mod reference;

pub use fieldpath::project;
pub use reference::{object_from_dynamic, Resolver, Selection};

fn gvk_key(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}

/// Coordinator-scoped cache of GVK -> (ApiResource, namespaced).
pub struct DiscoveryCache {
    client: Client,
    entries: RwLock<HashMap<String, (ApiResource, bool)>>,
}

impl DiscoveryCache {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Look a GVK up, running discovery on a cache miss. Returns `None`
    /// when the cluster does not serve the kind.
    pub async fn lookup(&self, gvk: &GroupVersionKind) -> Result<Option<(ApiResource, bool)>> {
        let key = gvk_key(gvk);
        if let Some(hit) = self.entries.read().unwrap().get(&key).cloned() {
            return Ok(Some(hit));
        }
        debug!(gvk = %key, "discovery cache miss");
        let discovery = Discovery::new(self.client.clone()).run().await?;
        let mut found = None;
        for group in discovery.groups() {
            for (ar, caps) in group.recommended_resources() {
                if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                    let namespaced = matches!(caps.scope, Scope::Namespaced);
                    found = Some((ar.clone(), namespaced));
                }
            }
        }
        if let Some(ref hit) = found {
            self.entries.write().unwrap().insert(key, hit.clone());
        }
        Ok(found)
    }

    /// Like `lookup`, but an unserved GVK is an error.
    pub async fn api_resource(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
        self.lookup(gvk)
            .await?
            .ok_or_else(|| anyhow!("GVK not served by cluster: {}", gvk_key(gvk)))
    }

    pub async fn is_defined(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.lookup(gvk).await?.is_some())
    }

    pub async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool> {
        Ok(self.api_resource(gvk).await?.1)
    }

    /// Seed an entry without touching the cluster (tests and validators
    /// that already ran discovery).
    pub fn seed(&self, gvk: &GroupVersionKind, ar: ApiResource, namespaced: bool) {
        self.entries
            .write()
            .unwrap()
            .insert(gvk_key(gvk), (ar, namespaced));
    }
}

/// Build a dynamic API handle scoped to the right namespace.
pub fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    namespaced: bool,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    if namespaced {
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, ar),
            None => Api::all_with(client, ar),
        }
    } else {
        Api::all_with(client, ar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_keys_skip_the_empty_core_group() {
        let core = GroupVersionKind {
            group: String::new(),
            version: "v1".into(),
            kind: "ConfigMap".into(),
        };
        assert_eq!(gvk_key(&core), "v1/ConfigMap");
        let grouped = GroupVersionKind {
            group: "apps".into(),
            version: "v1".into(),
            kind: "Deployment".into(),
        };
        assert_eq!(gvk_key(&grouped), "apps/v1/Deployment");
    }
}
