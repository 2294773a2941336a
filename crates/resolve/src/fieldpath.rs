//! Field-path projection for source references.
//!
//! Accepts the relaxed expression forms `metadata.name`, `.metadata.name`,
//! `{metadata.name}` and `{.metadata.name}` with optional `[index]`
//! segments, and returns the first value the path reaches.

use anyhow::{anyhow, Result};
use serde_json::Value as Json;
use vigil_core::strip::{normalize_path, PathSeg};

/// Strip optional surrounding braces from a relaxed expression.
fn unwrap_braces(expr: &str) -> Result<&str> {
    let expr = expr.trim();
    if let Some(inner) = expr.strip_prefix('{') {
        inner
            .strip_suffix('}')
            .ok_or_else(|| anyhow!("unbalanced braces in field path: {:?}", expr))
    } else if expr.contains('}') {
        Err(anyhow!("unbalanced braces in field path: {:?}", expr))
    } else {
        Ok(expr)
    }
}

fn extract<'a>(root: &'a Json, segs: &[PathSeg]) -> Option<&'a Json> {
    let mut cur = root;
    for seg in segs {
        cur = match seg {
            PathSeg::Key(k) => cur.get(k.as_str())?,
            PathSeg::Index(i) => cur.get(*i)?,
        };
    }
    Some(cur)
}

/// Project an object's content through a field path. An empty or absent
/// path yields the whole content; a path that reaches nothing is an error
/// (the caller treats the source as unusable, not as null).
pub fn project(content: &Json, field_path: Option<&str>) -> Result<Json> {
    let expr = match field_path {
        None => return Ok(content.clone()),
        Some(e) if e.trim().is_empty() => return Ok(content.clone()),
        Some(e) => e,
    };
    let segs = normalize_path(unwrap_braces(expr)?)?;
    extract(content, &segs)
        .cloned()
        .ok_or_else(|| anyhow!("field path returned no result: {:?}", expr))
}
