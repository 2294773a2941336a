//! Vigil core types: opaque API objects, identity keys, conditions and
//! declared resource/patch sets shared by every crate in the workspace.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Result};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

pub mod conditions;
pub mod declared;
pub mod strip;

pub use conditions::{Condition, ConditionReason, ConditionStatus, ConditionType};
pub use declared::{
    DeclaredPatch, DeclaredResource, PatchType, SourceRef, TargetRef, DEFAULT_EXCLUDED_PATHS,
};

/// Short identity of an object within a kind: `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self {
            namespace: namespace.map(|s| s.to_string()),
            name: name.to_string(),
        }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace.as_deref().unwrap_or(""), self.name)
    }
}

/// Identity of the parent custom resource owning a coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParentRef {
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for ParentRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Split an `apiVersion` string into `(group, version)`.
pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build a GVK from `apiVersion` + `kind`.
pub fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = split_api_version(api_version);
    GroupVersionKind {
        group,
        version,
        kind: kind.to_string(),
    }
}

/// An API object carried as its raw JSON tree. All structural operations
/// (strip, compare, projection) work on this form; typed views are never
/// needed inside the enforcing core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApiObject {
    raw: Json,
}

impl ApiObject {
    /// Accept a JSON tree as an API object. Requires `apiVersion`, `kind`
    /// and `metadata.name`.
    pub fn from_value(raw: Json) -> Result<Self> {
        let obj = Self { raw };
        if obj.api_version().is_empty() {
            return Err(anyhow!("object missing apiVersion"));
        }
        if obj.kind().is_empty() {
            return Err(anyhow!("object missing kind"));
        }
        if obj.name().is_empty() {
            return Err(anyhow!("object missing metadata.name"));
        }
        Ok(obj)
    }

    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let val: serde_yaml::Value = serde_yaml::from_str(yaml)?;
        Self::from_value(serde_json::to_value(val)?)
    }

    pub fn content(&self) -> &Json {
        &self.raw
    }

    pub fn into_content(self) -> Json {
        self.raw
    }

    fn meta_str(&self, field: &str) -> &str {
        self.raw
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_str())
            .unwrap_or("")
    }

    pub fn api_version(&self) -> &str {
        self.raw.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn kind(&self) -> &str {
        self.raw.get("kind").and_then(|v| v.as_str()).unwrap_or("")
    }

    pub fn gvk(&self) -> GroupVersionKind {
        gvk_from_api_version(self.api_version(), self.kind())
    }

    pub fn name(&self) -> &str {
        self.meta_str("name")
    }

    pub fn namespace(&self) -> Option<&str> {
        let ns = self.meta_str("namespace");
        if ns.is_empty() {
            None
        } else {
            Some(ns)
        }
    }

    pub fn generation(&self) -> i64 {
        self.raw
            .get("metadata")
            .and_then(|m| m.get("generation"))
            .and_then(|v| v.as_i64())
            .unwrap_or(0)
    }

    pub fn resource_version(&self) -> Option<&str> {
        let rv = self.meta_str("resourceVersion");
        if rv.is_empty() {
            None
        } else {
            Some(rv)
        }
    }

    pub fn deletion_timestamp(&self) -> Option<&str> {
        let ts = self.meta_str("deletionTimestamp");
        if ts.is_empty() {
            None
        } else {
            Some(ts)
        }
    }

    pub fn labels(&self) -> std::collections::BTreeMap<String, String> {
        self.meta_map("labels")
    }

    pub fn annotations(&self) -> std::collections::BTreeMap<String, String> {
        self.meta_map("annotations")
    }

    fn meta_map(&self, field: &str) -> std::collections::BTreeMap<String, String> {
        let mut out = std::collections::BTreeMap::new();
        if let Some(map) = self
            .raw
            .get("metadata")
            .and_then(|m| m.get(field))
            .and_then(|v| v.as_object())
        {
            for (k, v) in map {
                if let Some(s) = v.as_str() {
                    out.insert(k.clone(), s.to_string());
                }
            }
        }
        out
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace(), self.name())
    }

    /// Long key `kind/apiVersion/namespace/name`; cluster-scoped objects
    /// carry an empty namespace segment.
    pub fn long_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.kind(),
            self.api_version(),
            self.namespace().unwrap_or(""),
            self.name()
        )
    }

    /// Short key `namespace/name`.
    pub fn short_key(&self) -> String {
        self.object_key().to_string()
    }

    /// Serialized form minus `metadata.resourceVersion` and
    /// `metadata.managedFields`, used by event filters to drop no-change
    /// update notifications.
    pub fn without_volatile(&self) -> Json {
        let mut v = self.raw.clone();
        if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("resourceVersion");
            meta.remove("managedFields");
        }
        v
    }
}

pub mod prelude {
    pub use super::{
        ApiObject, Condition, ConditionReason, ConditionType, DeclaredPatch, DeclaredResource,
        ObjectKey, ParentRef, PatchType, SourceRef, TargetRef,
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cm() -> ApiObject {
        ApiObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm-a",
                "namespace": "ns1",
                "generation": 3,
                "resourceVersion": "101",
                "managedFields": [{"manager": "kubectl"}],
                "labels": {"tier": "web"}
            },
            "data": {"foo": "bar"}
        }))
        .expect("valid object")
    }

    #[test]
    fn identity_accessors() {
        let obj = cm();
        assert_eq!(obj.api_version(), "v1");
        assert_eq!(obj.kind(), "ConfigMap");
        assert_eq!(obj.namespace(), Some("ns1"));
        assert_eq!(obj.name(), "cm-a");
        assert_eq!(obj.generation(), 3);
        assert_eq!(obj.resource_version(), Some("101"));
        assert_eq!(obj.labels().get("tier").map(String::as_str), Some("web"));
    }

    #[test]
    fn keys_follow_the_documented_shapes() {
        let obj = cm();
        assert_eq!(obj.long_key(), "ConfigMap/v1/ns1/cm-a");
        assert_eq!(obj.short_key(), "ns1/cm-a");

        let cluster = ApiObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "Namespace",
            "metadata": {"name": "ns1"}
        }))
        .unwrap();
        assert_eq!(cluster.long_key(), "Namespace/v1//ns1");
    }

    #[test]
    fn gvk_split_handles_core_and_grouped() {
        assert_eq!(split_api_version("v1"), (String::new(), "v1".into()));
        assert_eq!(split_api_version("apps/v1"), ("apps".into(), "v1".into()));
        let gvk = gvk_from_api_version("networking.k8s.io/v1", "Ingress");
        assert_eq!(gvk.group, "networking.k8s.io");
        assert_eq!(gvk.kind, "Ingress");
    }

    #[test]
    fn rejects_objects_without_identity() {
        assert!(ApiObject::from_value(json!({"kind": "ConfigMap"})).is_err());
        assert!(ApiObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {}
        }))
        .is_err());
    }

    #[test]
    fn without_volatile_prunes_noise_only() {
        let v = cm().without_volatile();
        let meta = v.get("metadata").unwrap().as_object().unwrap();
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("managedFields"));
        assert!(meta.contains_key("generation"));
        assert_eq!(v.get("data").unwrap()["foo"], "bar");
    }

    #[test]
    fn from_yaml_parses_manifests() {
        let obj = ApiObject::from_yaml("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: x\n")
            .unwrap();
        assert_eq!(obj.name(), "x");
        assert_eq!(obj.namespace(), None);
    }
}
