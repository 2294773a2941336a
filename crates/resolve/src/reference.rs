//! Target and source reference resolution.
//!
//! A target reference selects one or many live objects depending on which
//! of namespace/name are set and whether the kind is namespaced; source
//! references always resolve to a single object, with name and namespace
//! rendered as templates against the current target.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::{
    api::ListParams,
    core::{ApiResource, DynamicObject},
};
use tracing::debug;
use vigil_core::{ApiObject, ObjectKey, SourceRef, TargetRef};
use vigil_tmpl::Engine;

use crate::{dynamic_api, fieldpath, DiscoveryCache};

/// How a target reference selects live objects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selection {
    /// More than one object may match.
    pub multiple: bool,
    /// The selection is confined to one namespace.
    pub namespaced_selection: bool,
}

/// Classify a reference given the kind's scope and which fields are set.
pub fn classify(namespaced: bool, namespace: Option<&str>, name: Option<&str>) -> Selection {
    if namespaced {
        match (namespace, name) {
            (None, _) => Selection { multiple: true, namespaced_selection: false },
            (Some(_), None) => Selection { multiple: true, namespaced_selection: true },
            (Some(_), Some(_)) => Selection { multiple: false, namespaced_selection: true },
        }
    } else {
        Selection {
            multiple: name.is_none(),
            namespaced_selection: false,
        }
    }
}

/// Client-side label selector match (matchLabels + matchExpressions).
/// `None` selects everything.
pub fn selector_matches(
    selector: Option<&LabelSelector>,
    labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let selector = match selector {
        Some(s) => s,
        None => return Ok(true),
    };
    if let Some(required) = &selector.match_labels {
        for (k, v) in required {
            if labels.get(k) != Some(v) {
                return Ok(false);
            }
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let current = labels.get(&expr.key);
            let values = expr.values.as_deref().unwrap_or(&[]);
            let ok = match expr.operator.as_str() {
                "In" => current.map_or(false, |v| values.iter().any(|x| x == v)),
                "NotIn" => current.map_or(true, |v| !values.iter().any(|x| x == v)),
                "Exists" => current.is_some(),
                "DoesNotExist" => current.is_none(),
                other => return Err(anyhow!("unknown selector operator: {}", other)),
            };
            if !ok {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Server-side representation of a label selector for list calls.
pub fn selector_string(selector: Option<&LabelSelector>) -> Result<Option<String>> {
    let selector = match selector {
        Some(s) => s,
        None => return Ok(None),
    };
    let mut parts = Vec::new();
    if let Some(required) = &selector.match_labels {
        for (k, v) in required {
            parts.push(format!("{}={}", k, v));
        }
    }
    if let Some(exprs) = &selector.match_expressions {
        for expr in exprs {
            let values = expr.values.as_deref().unwrap_or(&[]);
            match expr.operator.as_str() {
                "In" => parts.push(format!("{} in ({})", expr.key, values.join(","))),
                "NotIn" => parts.push(format!("{} notin ({})", expr.key, values.join(","))),
                "Exists" => parts.push(expr.key.clone()),
                "DoesNotExist" => parts.push(format!("!{}", expr.key)),
                other => return Err(anyhow!("unknown selector operator: {}", other)),
            }
        }
    }
    if parts.is_empty() {
        Ok(None)
    } else {
        Ok(Some(parts.join(",")))
    }
}

/// Rebuild an [`ApiObject`] from a dynamic API response, restoring type
/// metadata that list items may omit.
pub fn object_from_dynamic(obj: &DynamicObject, ar: &ApiResource) -> Result<ApiObject> {
    let mut raw = serde_json::to_value(obj).context("serializing dynamic object")?;
    // list items can come back without type metadata; restore it from the
    // resolved ApiResource so keys stay stable
    if raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
        raw["apiVersion"] = serde_json::Value::String(ar.api_version.clone());
    }
    if raw.get("kind").and_then(|v| v.as_str()).unwrap_or("").is_empty() {
        raw["kind"] = serde_json::Value::String(ar.kind.clone());
    }
    ApiObject::from_value(raw)
}

/// Resolves references against the live cluster through a shared discovery
/// cache and template engine.
pub struct Resolver {
    discovery: Arc<DiscoveryCache>,
    engine: Arc<Engine>,
}

impl Resolver {
    pub fn new(discovery: Arc<DiscoveryCache>, engine: Arc<Engine>) -> Self {
        Self { discovery, engine }
    }

    pub fn discovery(&self) -> &DiscoveryCache {
        &self.discovery
    }

    async fn target_meta(&self, target: &TargetRef) -> Result<(ApiResource, bool)> {
        let gvk = vigil_core::gvk_from_api_version(&target.api_version, &target.kind);
        self.discovery.api_resource(&gvk).await
    }

    pub async fn selection(&self, target: &TargetRef) -> Result<Selection> {
        let (_, namespaced) = self.target_meta(target).await?;
        Ok(classify(
            namespaced,
            target.namespace.as_deref(),
            target.name.as_deref(),
        ))
    }

    /// Resolve a single-instance target. Errors when the reference selects
    /// multiple objects.
    pub async fn resolve_single(&self, target: &TargetRef) -> Result<ApiObject> {
        let (ar, namespaced) = self.target_meta(target).await?;
        let selection = classify(namespaced, target.namespace.as_deref(), target.name.as_deref());
        if selection.multiple {
            return Err(anyhow!("target reference selects multiple instances"));
        }
        let name = match target.name.as_deref() {
            Some(n) => n,
            None => return Err(anyhow!("single selection requires a name")),
        };
        let api = dynamic_api(
            self.discovery.client(),
            &ar,
            namespaced,
            target.namespace.as_deref(),
        );
        let obj = api
            .get(name)
            .await
            .with_context(|| format!("fetching target {}", name))?;
        object_from_dynamic(&obj, &ar)
    }

    /// Resolve every object a multi-instance target currently selects.
    /// The label selector runs server-side; annotation and name filters
    /// are applied over the returned list.
    pub async fn resolve_multiple(&self, target: &TargetRef) -> Result<Vec<ApiObject>> {
        let (ar, namespaced) = self.target_meta(target).await?;
        let selection = classify(namespaced, target.namespace.as_deref(), target.name.as_deref());
        if !selection.multiple {
            return Err(anyhow!("target reference selects a single instance"));
        }
        let namespace = if selection.namespaced_selection {
            target.namespace.as_deref()
        } else {
            None
        };
        let api = dynamic_api(self.discovery.client(), &ar, namespaced, namespace);
        let mut params = ListParams::default();
        if let Some(sel) = selector_string(target.label_selector.as_ref())? {
            params = params.labels(&sel);
        }
        let list = api.list(&params).await.context("listing target objects")?;
        let mut out = Vec::new();
        for item in &list.items {
            let obj = object_from_dynamic(item, &ar)?;
            if !selector_matches(target.annotation_selector.as_ref(), &obj.annotations())? {
                continue;
            }
            if let Some(name) = target.name.as_deref() {
                if obj.name() != name {
                    continue;
                }
            }
            out.push(obj);
        }
        debug!(kind = %target.kind, selected = out.len(), "resolved multi-instance target");
        Ok(out)
    }

    /// Deterministic fetch of the target instance behind a reconcile key:
    /// single-instance references resolve as declared, multi-instance ones
    /// pin namespace and name from the key.
    pub async fn resolve_at(&self, target: &TargetRef, key: &ObjectKey) -> Result<ApiObject> {
        let (ar, namespaced) = self.target_meta(target).await?;
        let selection = classify(namespaced, target.namespace.as_deref(), target.name.as_deref());
        if !selection.multiple {
            return self.resolve_single(target).await;
        }
        let namespace = if namespaced { key.namespace.as_deref() } else { None };
        let api = dynamic_api(self.discovery.client(), &ar, namespaced, namespace);
        let obj = api
            .get(&key.name)
            .await
            .with_context(|| format!("fetching target {}", key))?;
        object_from_dynamic(&obj, &ar)
    }

    /// The keys of every object the target currently selects.
    pub async fn target_keys(&self, target: &TargetRef) -> Result<Vec<ObjectKey>> {
        let selection = self.selection(target).await?;
        if selection.multiple {
            Ok(self
                .resolve_multiple(target)
                .await?
                .iter()
                .map(|o| o.object_key())
                .collect())
        } else {
            Ok(vec![ObjectKey::new(
                target.namespace.as_deref(),
                target.name.as_deref().unwrap_or(""),
            )])
        }
    }

    /// Whether the passed object is selected by the target reference.
    pub async fn selects(&self, target: &TargetRef, obj: &ApiObject) -> Result<bool> {
        if obj.api_version() != target.api_version || obj.kind() != target.kind {
            return Ok(false);
        }
        let (_, namespaced) = self.target_meta(target).await?;
        if namespaced {
            if let Some(ns) = target.namespace.as_deref() {
                if obj.namespace() != Some(ns) {
                    return Ok(false);
                }
            }
        }
        if let Some(name) = target.name.as_deref() {
            return Ok(obj.name() == name);
        }
        Ok(selector_matches(target.label_selector.as_ref(), &obj.labels())?
            && selector_matches(target.annotation_selector.as_ref(), &obj.annotations())?)
    }

    /// Render a source reference's namespace and name against a target
    /// object. Cluster-scoped source kinds drop the namespace.
    pub async fn rendered_source_key(
        &self,
        source: &SourceRef,
        target: &ApiObject,
    ) -> Result<ObjectKey> {
        let gvk = vigil_core::gvk_from_api_version(&source.api_version, &source.kind);
        let (_, namespaced) = self.discovery.api_resource(&gvk).await?;
        let name = self
            .engine
            .render_reference(&source.name, target.content())
            .context("rendering source name template")?;
        if name.is_empty() {
            return Err(anyhow!("source name rendered empty"));
        }
        if !namespaced {
            return Ok(ObjectKey::new(None, &name));
        }
        let namespace = self
            .engine
            .render_reference(&source.namespace, target.content())
            .context("rendering source namespace template")?;
        if namespace.is_empty() {
            return Err(anyhow!("namespace required for namespaced source kind"));
        }
        Ok(ObjectKey::new(Some(&namespace), &name))
    }

    /// Fetch the single source object a reference resolves to for the
    /// given target.
    pub async fn resolve_source(&self, source: &SourceRef, target: &ApiObject) -> Result<ApiObject> {
        let gvk = vigil_core::gvk_from_api_version(&source.api_version, &source.kind);
        let (ar, namespaced) = self.discovery.api_resource(&gvk).await?;
        let key = self.rendered_source_key(source, target).await?;
        let api = dynamic_api(
            self.discovery.client(),
            &ar,
            namespaced,
            key.namespace.as_deref(),
        );
        let obj = api
            .get(&key.name)
            .await
            .with_context(|| format!("fetching source {}", key))?;
        object_from_dynamic(&obj, &ar)
    }

    /// Resolve a source and project it through its field path.
    pub async fn resolve_source_value(
        &self,
        source: &SourceRef,
        target: &ApiObject,
    ) -> Result<serde_json::Value> {
        let obj = self.resolve_source(source, target).await?;
        fieldpath::project(obj.content(), source.field_path.as_deref())
    }
}
