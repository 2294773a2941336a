//! Declared resources and patches: the desired state handed to a
//! coordinator, plus the wire-level manifests they are parsed from and the
//! set-difference helpers the coordinator diffs with.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use anyhow::{anyhow, Context, Result};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use serde::{Deserialize, Serialize};

use crate::{ApiObject, ObjectKey};

/// Paths excluded from comparison on every declared resource.
pub const DEFAULT_EXCLUDED_PATHS: [&str; 3] = [".metadata", ".status", ".spec.replicas"];

/// A resource to be kept bit-identical on the cluster, modulo excluded paths.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeclaredResource {
    pub object: ApiObject,
    pub excluded_paths: BTreeSet<String>,
}

impl DeclaredResource {
    /// Wrap an object, always unioning the default excluded paths with the
    /// user-supplied ones.
    pub fn new<I, S>(object: ApiObject, excluded_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut paths: BTreeSet<String> =
            DEFAULT_EXCLUDED_PATHS.iter().map(|s| s.to_string()).collect();
        paths.extend(excluded_paths.into_iter().map(Into::into));
        Self {
            object,
            excluded_paths: paths,
        }
    }

    /// Identity key: full GVK + namespace + name.
    pub fn key(&self) -> String {
        self.object.long_key()
    }
}

/// A structured pointer to the object(s) a patch is applied to.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<LabelSelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<LabelSelector>,
}

/// A structured pointer to one input object of a patch template.
/// `namespace` and `name` are themselves templates rendered against the
/// target object at event time.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_path: Option<String>,
}

impl SourceRef {
    /// Whether name or namespace carry template markup and therefore can
    /// only be resolved once a target object is known.
    pub fn is_templated(&self) -> bool {
        self.namespace.contains("{{") || self.name.contains("{{")
    }
}

/// Content type of the patch submitted to the API server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchType {
    Json,
    Merge,
    #[default]
    StrategicMerge,
    Apply,
}

impl PatchType {
    pub fn content_type(&self) -> &'static str {
        match self {
            PatchType::Json => "application/json-patch+json",
            PatchType::Merge => "application/merge-patch+json",
            PatchType::StrategicMerge => "application/strategic-merge-patch+json",
            PatchType::Apply => "application/apply-patch+yaml",
        }
    }
}

impl std::str::FromStr for PatchType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "application/json-patch+json" => Ok(PatchType::Json),
            "application/merge-patch+json" => Ok(PatchType::Merge),
            "" | "application/strategic-merge-patch+json" => Ok(PatchType::StrategicMerge),
            "application/apply-patch+yaml" => Ok(PatchType::Apply),
            other => Err(anyhow!("unknown patch type: {}", other)),
        }
    }
}

impl Serialize for PatchType {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.content_type())
    }
}

impl<'de> Deserialize<'de> for PatchType {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A patch to be continually applied to every object the target reference
/// selects, fed by the source references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeclaredPatch {
    pub name: String,
    pub target: TargetRef,
    #[serde(default)]
    pub sources: Vec<SourceRef>,
    #[serde(default)]
    pub patch_type: PatchType,
    pub template: String,
}

// ---------------- wire-level manifests ----------------

/// One entry of the parent CR's `resources` list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceManifest {
    /// Raw YAML of the object to enforce.
    pub object: String,
    #[serde(default)]
    pub excluded_paths: Vec<String>,
}

impl ResourceManifest {
    pub fn parse(&self) -> Result<DeclaredResource> {
        let object = ApiObject::from_yaml(&self.object).context("parsing resource manifest")?;
        Ok(DeclaredResource::new(object, self.excluded_paths.clone()))
    }
}

/// One entry of the parent CR's `patches` map; the map key becomes the
/// patch name.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PatchManifest {
    pub target_object_ref: TargetRef,
    #[serde(default)]
    pub source_object_refs: Vec<SourceRef>,
    #[serde(default)]
    pub patch_type: PatchType,
    pub patch_template: String,
}

impl PatchManifest {
    pub fn parse(&self, name: &str) -> DeclaredPatch {
        DeclaredPatch {
            name: name.to_string(),
            target: self.target_object_ref.clone(),
            sources: self.source_object_refs.clone(),
            patch_type: self.patch_type,
            template: self.patch_template.clone(),
        }
    }
}

/// Parse a whole `patches` map in a stable order.
pub fn parse_patches(manifests: &BTreeMap<String, PatchManifest>) -> Vec<DeclaredPatch> {
    manifests.iter().map(|(name, m)| m.parse(name)).collect()
}

// ---------------- set differences ----------------

/// Outcome of diffing the currently enforced resources against a desired set.
#[derive(Debug, Clone, Default)]
pub struct ResourceDiff {
    /// The sets differ in value terms; a restart is required.
    pub changed: bool,
    /// Resources whose identity key is in the current set but not the
    /// desired one; they must be deleted from the cluster before restart.
    pub to_delete: Vec<DeclaredResource>,
}

/// Resource equality is deep equality of the object plus the excluded-path
/// set; deletions are computed by identity key only.
pub fn diff_resources(current: &[DeclaredResource], desired: &[DeclaredResource]) -> ResourceDiff {
    let desired_keys: HashSet<String> = desired.iter().map(|r| r.key()).collect();
    let to_delete: Vec<DeclaredResource> = current
        .iter()
        .filter(|r| !desired_keys.contains(&r.key()))
        .cloned()
        .collect();

    let current_by_key: HashMap<String, &DeclaredResource> =
        current.iter().map(|r| (r.key(), r)).collect();
    let changed = current.len() != desired.len()
        || desired
            .iter()
            .any(|r| current_by_key.get(&r.key()).map_or(true, |c| *c != r));

    ResourceDiff { changed, to_delete }
}

/// Patch equality is deep equality of the entire declaration, keyed by name.
pub fn patches_differ(current: &[DeclaredPatch], desired: &[DeclaredPatch]) -> bool {
    if current.len() != desired.len() {
        return true;
    }
    let current_by_name: HashMap<&str, &DeclaredPatch> =
        current.iter().map(|p| (p.name.as_str(), p)).collect();
    desired
        .iter()
        .any(|p| current_by_name.get(p.name.as_str()).map_or(true, |c| *c != p))
}

/// The object key a target reference pins down, when it selects a single
/// instance by literal namespace + name.
pub fn literal_target_key(target: &TargetRef) -> Option<ObjectKey> {
    target
        .name
        .as_deref()
        .map(|name| ObjectKey::new(target.namespace.as_deref(), name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn resource(name: &str, data: &str) -> DeclaredResource {
        let object = ApiObject::from_value(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": "ns1"},
            "data": {"foo": data}
        }))
        .unwrap();
        DeclaredResource::new(object, Vec::<String>::new())
    }

    #[test]
    fn defaults_are_always_excluded() {
        let r = resource("cm-a", "bar");
        for p in DEFAULT_EXCLUDED_PATHS {
            assert!(r.excluded_paths.contains(p));
        }
        let r = DeclaredResource::new(r.object, [".data.volatile"]);
        assert!(r.excluded_paths.contains(".data.volatile"));
        assert!(r.excluded_paths.contains(".metadata"));
    }

    #[test]
    fn diff_reports_identity_removals_only() {
        let current = vec![resource("cm-a", "bar"), resource("cm-b", "bar")];
        let desired = vec![resource("cm-a", "bar"), resource("cm-c", "bar")];
        let diff = diff_resources(&current, &desired);
        assert!(diff.changed);
        assert_eq!(diff.to_delete.len(), 1);
        assert_eq!(diff.to_delete[0].object.name(), "cm-b");
    }

    #[test]
    fn value_change_restarts_without_deleting() {
        let current = vec![resource("cm-a", "bar")];
        let desired = vec![resource("cm-a", "baz")];
        let diff = diff_resources(&current, &desired);
        assert!(diff.changed);
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn identical_sets_are_a_no_op() {
        let current = vec![resource("cm-a", "bar")];
        let desired = vec![resource("cm-a", "bar")];
        let diff = diff_resources(&current, &desired);
        assert!(!diff.changed);
        assert!(diff.to_delete.is_empty());
    }

    #[test]
    fn excluded_path_change_counts_as_different() {
        let current = vec![resource("cm-a", "bar")];
        let mut desired = current.clone();
        desired[0].excluded_paths.insert(".data.extra".into());
        assert!(diff_resources(&current, &desired).changed);
    }

    #[test]
    fn patch_template_change_is_observed() {
        let p = DeclaredPatch {
            name: "p1".into(),
            target: TargetRef {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                ..Default::default()
            },
            sources: vec![],
            patch_type: PatchType::StrategicMerge,
            template: "spec: {}".into(),
        };
        let mut q = p.clone();
        assert!(!patches_differ(&[p.clone()], &[q.clone()]));
        q.template = "spec: {replicas: 1}".into();
        assert!(patches_differ(&[p], &[q]));
    }

    #[test]
    fn patch_type_round_trips_through_content_type() {
        for (s, t) in [
            ("application/json-patch+json", PatchType::Json),
            ("application/merge-patch+json", PatchType::Merge),
            ("application/strategic-merge-patch+json", PatchType::StrategicMerge),
            ("application/apply-patch+yaml", PatchType::Apply),
        ] {
            assert_eq!(s.parse::<PatchType>().unwrap(), t);
            assert_eq!(t.content_type(), s);
        }
        assert_eq!("".parse::<PatchType>().unwrap(), PatchType::StrategicMerge);
        assert!("application/nope".parse::<PatchType>().is_err());
    }

    #[test]
    fn manifests_parse_into_declared_forms() {
        let rm = ResourceManifest {
            object: "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: cm-a\n  namespace: ns1\ndata:\n  foo: bar\n".into(),
            excluded_paths: vec![".data.volatile".into()],
        };
        let declared = rm.parse().unwrap();
        assert_eq!(declared.key(), "ConfigMap/v1/ns1/cm-a");
        assert!(declared.excluded_paths.contains(".data.volatile"));

        let pm: PatchManifest = serde_yaml::from_str(
            r#"
targetObjectRef:
  apiVersion: apps/v1
  kind: Deployment
  namespace: apps
  labelSelector:
    matchLabels:
      tier: web
sourceObjectRefs:
  - apiVersion: v1
    kind: ConfigMap
    namespace: apps
    name: global
patchTemplate: "spec: {}"
"#,
        )
        .unwrap();
        let patch = pm.parse("p1");
        assert_eq!(patch.name, "p1");
        assert_eq!(patch.patch_type, PatchType::StrategicMerge);
        assert_eq!(patch.sources.len(), 1);
        assert_eq!(
            patch
                .target
                .label_selector
                .as_ref()
                .and_then(|s| s.match_labels.as_ref())
                .and_then(|m| m.get("tier"))
                .map(String::as_str),
            Some("web")
        );
    }

    #[test]
    fn templated_source_detection() {
        let s = SourceRef {
            api_version: "v1".into(),
            kind: "Secret".into(),
            namespace: "{{ metadata.namespace }}".into(),
            name: "fixed".into(),
            field_path: None,
        };
        assert!(s.is_templated());
        let s = SourceRef { namespace: "ns1".into(), name: "fixed".into(), ..s };
        assert!(!s.is_templated());
    }
}
