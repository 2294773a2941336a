//! Excluded-path strip: removes a configured set of JSON paths from an
//! object tree before structural comparison. Missing paths are tolerated,
//! so `.status` can be excluded on objects that never grew one.

use anyhow::{anyhow, Result};
use serde_json::Value as Json;

/// One step of a normalized path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

/// Normalize a relaxed path expression into segments. Accepts `.a.b`,
/// `a.b`, `$.a.b` and bracket indexing `a.b[2]`.
pub fn normalize_path(path: &str) -> Result<Vec<PathSeg>> {
    let trimmed = path.trim();
    let trimmed = trimmed.strip_prefix('$').unwrap_or(trimmed);
    let trimmed = trimmed.strip_prefix('.').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(anyhow!("empty path expression: {:?}", path));
    }

    let mut segs = Vec::new();
    for part in trimmed.split('.') {
        if part.is_empty() {
            return Err(anyhow!("empty segment in path: {:?}", path));
        }
        let mut rest = part;
        let key_end = rest.find('[').unwrap_or(rest.len());
        let key = &rest[..key_end];
        if !key.is_empty() {
            segs.push(PathSeg::Key(key.to_string()));
        }
        rest = &rest[key_end..];
        while let Some(stripped) = rest.strip_prefix('[') {
            let close = stripped
                .find(']')
                .ok_or_else(|| anyhow!("unterminated index in path: {:?}", path))?;
            let idx: usize = stripped[..close]
                .parse()
                .map_err(|_| anyhow!("non-numeric index in path: {:?}", path))?;
            segs.push(PathSeg::Index(idx));
            rest = &stripped[close + 1..];
        }
        if !rest.is_empty() {
            return Err(anyhow!("malformed segment in path: {:?}", path));
        }
    }
    Ok(segs)
}

/// Remove one normalized path from the tree. Absent paths are a no-op.
fn remove_path(value: &mut Json, segs: &[PathSeg]) {
    let (last, parents) = match segs.split_last() {
        Some(split) => split,
        None => return,
    };
    let mut cur = value;
    for seg in parents {
        cur = match seg {
            PathSeg::Key(k) => match cur.get_mut(k.as_str()) {
                Some(v) => v,
                None => return,
            },
            PathSeg::Index(i) => match cur.get_mut(*i) {
                Some(v) => v,
                None => return,
            },
        };
    }
    match last {
        PathSeg::Key(k) => {
            if let Some(map) = cur.as_object_mut() {
                map.remove(k.as_str());
            }
        }
        PathSeg::Index(i) => {
            if let Some(arr) = cur.as_array_mut() {
                if *i < arr.len() {
                    arr.remove(*i);
                }
            }
        }
    }
}

/// Return a copy of `value` with every excluded path removed.
pub fn strip<'a, I>(value: &Json, paths: I) -> Result<Json>
where
    I: IntoIterator<Item = &'a String>,
{
    let mut out = value.clone();
    for path in paths {
        let segs = normalize_path(path)?;
        remove_path(&mut out, &segs);
    }
    Ok(out)
}

/// Deep equality of the two stripped forms.
pub fn stripped_equal<'a, I>(left: &Json, right: &Json, paths: I) -> Result<bool>
where
    I: IntoIterator<Item = &'a String> + Clone,
{
    Ok(strip(left, paths.clone())? == strip(right, paths)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeSet;

    fn paths(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn normalize_accepts_relaxed_forms() {
        for p in [".metadata.name", "metadata.name", "$.metadata.name"] {
            assert_eq!(
                normalize_path(p).unwrap(),
                vec![PathSeg::Key("metadata".into()), PathSeg::Key("name".into())]
            );
        }
        assert_eq!(
            normalize_path("spec.containers[2].image").unwrap(),
            vec![
                PathSeg::Key("spec".into()),
                PathSeg::Key("containers".into()),
                PathSeg::Index(2),
                PathSeg::Key("image".into()),
            ]
        );
    }

    #[test]
    fn normalize_rejects_garbage() {
        assert!(normalize_path("").is_err());
        assert!(normalize_path(".").is_err());
        assert!(normalize_path("a..b").is_err());
        assert!(normalize_path("a[x]").is_err());
        assert!(normalize_path("a[1").is_err());
    }

    #[test]
    fn strip_removes_defaults_and_tolerates_missing() {
        let obj = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-a", "resourceVersion": "9"},
            "data": {"foo": "bar"}
        });
        let stripped = strip(&obj, &paths(&[".metadata", ".status", ".spec.replicas"])).unwrap();
        assert!(stripped.get("metadata").is_none());
        assert!(stripped.get("status").is_none());
        assert_eq!(stripped["data"]["foo"], "bar");
    }

    #[test]
    fn strip_removes_array_elements() {
        let obj = json!({"spec": {"containers": [{"name": "a"}, {"name": "b"}]}});
        let stripped = strip(&obj, &paths(&[".spec.containers[0]"])).unwrap();
        assert_eq!(stripped["spec"]["containers"], json!([{"name": "b"}]));
        // out-of-range index is tolerated
        let same = strip(&obj, &paths(&[".spec.containers[9]"])).unwrap();
        assert_eq!(same, obj);
    }

    #[test]
    fn stripped_equal_ignores_excluded_drift() {
        let declared = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": "cm-a", "namespace": "ns1"},
            "data": {"foo": "bar"}
        });
        let live = json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "cm-a",
                "namespace": "ns1",
                "resourceVersion": "42",
                "uid": "d4f0"
            },
            "status": {"phase": "Active"},
            "data": {"foo": "bar"}
        });
        let p = paths(&[".metadata", ".status", ".spec.replicas"]);
        assert!(stripped_equal(&declared, &live, &p).unwrap());

        let mut drifted = live.clone();
        drifted["data"]["foo"] = json!("baz");
        assert!(!stripped_equal(&declared, &drifted, &p).unwrap());
    }
}
