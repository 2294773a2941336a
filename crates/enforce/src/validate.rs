//! Admission validation: a desired set is checked against the live API
//! server before the coordinator accepts it. All problems are accumulated
//! into one multi-error so the caller sees the full picture at once.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams},
    core::GroupVersionKind,
};
use serde_json::Value as Json;
use tracing::debug;
use vigil_core::{DeclaredPatch, DeclaredResource};
use vigil_resolve::DiscoveryCache;
use vigil_tmpl::Engine;

use crate::{EnforceError, EnforceResult};

pub struct Validator {
    discovery: Arc<DiscoveryCache>,
    engine: Arc<Engine>,
}

impl Validator {
    pub fn new(discovery: Arc<DiscoveryCache>, engine: Arc<Engine>) -> Self {
        Self { discovery, engine }
    }

    /// Validate a whole desired set. Returns `ValidationError` carrying
    /// every problem found; the running state is never touched.
    pub async fn validate(
        &self,
        resources: &[DeclaredResource],
        patches: &[DeclaredPatch],
    ) -> EnforceResult<()> {
        let mut errors = patch_name_errors(patches);
        let mut discovery_errors = Vec::new();
        let mut crd_cache: HashMap<String, Option<Json>> = HashMap::new();

        for resource in resources {
            for path in &resource.excluded_paths {
                if let Err(e) = vigil_core::strip::normalize_path(path) {
                    errors.push(format!("{}: {:#}", resource.key(), e));
                }
            }
            let gvk = resource.object.gvk();
            match self.discovery.lookup(&gvk).await {
                Err(e) => discovery_errors.push(format!(
                    "discovery failed for {}: {:#}",
                    resource.key(),
                    e
                )),
                Ok(None) => errors.push(format!(
                    "resource type not defined: {}/{}",
                    resource.object.api_version(),
                    resource.object.kind()
                )),
                Ok(Some((_, namespaced))) => {
                    if namespaced && resource.object.namespace().is_none() {
                        errors.push(format!(
                            "namespaced resources must specify a namespace: {}",
                            resource.key()
                        ));
                    }
                    match self.crd_schema(&gvk, &mut crd_cache).await {
                        Ok(Some(schema)) => {
                            schema_errors(
                                resource.object.content(),
                                &schema,
                                &resource.key(),
                                &mut errors,
                            );
                        }
                        // built-in kinds have no CRD; discovery existence
                        // and the namespacing rule remain their gate
                        Ok(None) => {}
                        Err(e) => errors.push(format!(
                            "unable to fetch schema for {}: {:#}",
                            resource.key(),
                            e
                        )),
                    }
                }
            }
        }

        for patch in patches {
            if let Err(e) = self.engine.validate(&patch.template) {
                errors.push(format!("patch {}: {:#}", patch.name, e));
            }
            for source in &patch.sources {
                for tmpl in [&source.name, &source.namespace] {
                    if let Err(e) = self.engine.validate(tmpl) {
                        errors.push(format!("patch {}: source reference: {:#}", patch.name, e));
                    }
                }
            }

            let mut gvks = vec![vigil_core::gvk_from_api_version(
                &patch.target.api_version,
                &patch.target.kind,
            )];
            for source in &patch.sources {
                gvks.push(vigil_core::gvk_from_api_version(
                    &source.api_version,
                    &source.kind,
                ));
            }
            for gvk in gvks {
                match self.discovery.is_defined(&gvk).await {
                    Err(e) => discovery_errors.push(format!(
                        "patch {}: discovery failed for {}/{}: {:#}",
                        patch.name, gvk.group, gvk.kind, e
                    )),
                    Ok(false) => errors.push(format!(
                        "patch {}: resource type not defined: {} {}",
                        patch.name, gvk.api_version(), gvk.kind
                    )),
                    Ok(true) => {}
                }
            }
        }

        // a broken discovery surface says nothing about the desired set
        // itself; report it as its own kind
        if !discovery_errors.is_empty() {
            return Err(EnforceError::Discovery(discovery_errors.join("; ")));
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(EnforceError::Validation(errors))
        }
    }

    /// Fetch the `openAPIV3Schema` of the CRD backing a GVK, if any.
    async fn crd_schema(
        &self,
        gvk: &GroupVersionKind,
        cache: &mut HashMap<String, Option<Json>>,
    ) -> Result<Option<Json>> {
        if gvk.group.is_empty() {
            return Ok(None);
        }
        let cache_key = format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind);
        if let Some(hit) = cache.get(&cache_key) {
            return Ok(hit.clone());
        }
        let api: Api<CustomResourceDefinition> = Api::all(self.discovery.client());
        let crds = api
            .list(&ListParams::default())
            .await
            .context("listing CustomResourceDefinitions")?;
        let mut found = None;
        for crd in crds {
            let v = serde_json::to_value(&crd)?;
            let spec = match v.get("spec") {
                Some(s) => s,
                None => continue,
            };
            let group = spec.get("group").and_then(|s| s.as_str()).unwrap_or("");
            let kind = spec
                .get("names")
                .and_then(|n| n.get("kind"))
                .and_then(|s| s.as_str())
                .unwrap_or("");
            if group != gvk.group || kind != gvk.kind {
                continue;
            }
            let versions = spec
                .get("versions")
                .and_then(|vv| vv.as_array())
                .cloned()
                .unwrap_or_default();
            found = versions
                .iter()
                .find(|ver| ver.get("name").and_then(|s| s.as_str()) == Some(gvk.version.as_str()))
                .and_then(|ver| ver.get("schema"))
                .and_then(|s| s.get("openAPIV3Schema"))
                .cloned();
            break;
        }
        debug!(gvk = %cache_key, found = found.is_some(), "CRD schema lookup");
        cache.insert(cache_key, found.clone());
        Ok(found)
    }
}

/// Patch names must be non-empty and unique within the parent.
pub(crate) fn patch_name_errors(patches: &[DeclaredPatch]) -> Vec<String> {
    let mut errors = Vec::new();
    let mut seen = HashSet::new();
    for patch in patches {
        if patch.name.is_empty() {
            errors.push("patch name must not be empty".to_string());
        } else if !seen.insert(patch.name.as_str()) {
            errors.push(format!("duplicate patch name: {}", patch.name));
        }
    }
    errors
}

/// Structural conformance of a value against an OpenAPI v3 schema node.
/// Flags type mismatches and missing required fields; unknown fields are
/// only an error where the schema closes the object.
pub(crate) fn schema_errors(value: &Json, schema: &Json, path: &str, errors: &mut Vec<String>) {
    if schema
        .get("x-kubernetes-preserve-unknown-fields")
        .and_then(|b| b.as_bool())
        .unwrap_or(false)
    {
        return;
    }
    if schema
        .get("x-kubernetes-int-or-string")
        .and_then(|b| b.as_bool())
        .unwrap_or(false)
    {
        if !value.is_number() && !value.is_string() {
            errors.push(format!("{}: expected integer or string", path));
        }
        return;
    }

    let ty = schema.get("type").and_then(|t| t.as_str()).unwrap_or("");
    match ty {
        "object" => {
            let obj = match value.as_object() {
                Some(o) => o,
                None => {
                    errors.push(format!("{}: expected object", path));
                    return;
                }
            };
            if let Some(required) = schema.get("required").and_then(|r| r.as_array()) {
                for req in required {
                    if let Some(field) = req.as_str() {
                        if !obj.contains_key(field) {
                            errors.push(format!("{}: missing required field {:?}", path, field));
                        }
                    }
                }
            }
            let props = schema.get("properties").and_then(|p| p.as_object());
            let additional = schema.get("additionalProperties");
            for (k, v) in obj {
                let child_path = format!("{}.{}", path, k);
                if let Some(child_schema) = props.and_then(|p| p.get(k)) {
                    schema_errors(v, child_schema, &child_path, errors);
                } else if let Some(additional) = additional {
                    match additional {
                        Json::Bool(false) => {
                            errors.push(format!("{}: unknown field", child_path))
                        }
                        Json::Object(_) => schema_errors(v, additional, &child_path, errors),
                        _ => {}
                    }
                }
            }
        }
        "array" => {
            let arr = match value.as_array() {
                Some(a) => a,
                None => {
                    errors.push(format!("{}: expected array", path));
                    return;
                }
            };
            if let Some(items) = schema.get("items") {
                for (i, item) in arr.iter().enumerate() {
                    schema_errors(item, items, &format!("{}[{}]", path, i), errors);
                }
            }
        }
        "string" => {
            if !value.is_string() {
                errors.push(format!("{}: expected string", path));
            }
        }
        "integer" => {
            if !value.is_i64() && !value.is_u64() {
                errors.push(format!("{}: expected integer", path));
            }
        }
        "number" => {
            if !value.is_number() {
                errors.push(format!("{}: expected number", path));
            }
        }
        "boolean" => {
            if !value.is_boolean() {
                errors.push(format!("{}: expected boolean", path));
            }
        }
        // untyped nodes accept anything
        _ => {}
    }
}
