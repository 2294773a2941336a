//! Template engine for patch templates and templated object references.
//!
//! A thin wrapper over MiniJinja with a Helm-flavored filter set. One engine
//! is owned per coordinator; templates never see the filesystem or the
//! process environment.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use minijinja::{context, Environment, UndefinedBehavior};
use serde::Serialize;
use serde_json::Value as Json;

mod filters;
mod functions;

/// Rendering engine with the vigil filter/function set registered.
pub struct Engine {
    env: Environment<'static>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        let mut env = Environment::new();
        // Chainable lets templates probe optional fields without erroring
        // mid-chain, which object trees need constantly.
        env.set_undefined_behavior(UndefinedBehavior::Chainable);

        env.add_filter("toyaml", filters::toyaml);
        env.add_filter("tojson", filters::tojson);
        env.add_filter("b64encode", filters::b64encode);
        env.add_filter("b64decode", filters::b64decode);
        env.add_filter("quote", filters::quote);
        env.add_filter("squote", filters::squote);
        env.add_filter("indent", filters::indent);
        env.add_filter("nindent", filters::nindent);
        env.add_filter("sha256", filters::sha256sum);
        env.add_filter("trunc", filters::trunc);
        env.add_filter("trimprefix", filters::trimprefix);
        env.add_filter("trimsuffix", filters::trimsuffix);

        env.add_function("fail", functions::fail);
        env.add_function("dict", functions::dict);
        env.add_function("list", functions::list);
        env.add_function("coalesce", functions::coalesce);

        Self { env }
    }

    /// Parse-check a template source without rendering it. Used at
    /// admission time so a bad template is rejected before any worker runs.
    pub fn validate(&self, source: &str) -> Result<()> {
        self.env
            .template_from_str(source)
            .map(|_| ())
            .map_err(|e| anyhow!("template parse error: {}", e))
    }

    /// Render a template source with an arbitrary serializable context.
    pub fn render<S: Serialize>(&self, source: &str, ctx: S) -> Result<String> {
        self.env
            .render_str(source, ctx)
            .map_err(|e| anyhow!("template render error: {}", e))
    }

    /// Render a one-line reference template (source name/namespace) with the
    /// target object's content as the root context. Plain strings pass
    /// through untouched.
    pub fn render_reference(&self, source: &str, target: &Json) -> Result<String> {
        if !source.contains("{{") && !source.contains("{%") {
            return Ok(source.to_string());
        }
        self.render(source, target)
    }

    /// Render a patch template and convert the YAML output to JSON bytes.
    /// Bindings: `target` (target object content), `sources` (projected
    /// source values in declaration order), `params` (`[target, sources...]`).
    pub fn render_patch(&self, source: &str, target: &Json, sources: &[Json]) -> Result<Vec<u8>> {
        let mut params: Vec<&Json> = Vec::with_capacity(sources.len() + 1);
        params.push(target);
        params.extend(sources.iter());
        let rendered = self.render(
            source,
            context! { target => target, sources => sources, params => params },
        )?;
        yaml_to_json(&rendered)
    }
}

/// Convert rendered YAML into compact JSON bytes.
pub fn yaml_to_json(yaml: &str) -> Result<Vec<u8>> {
    let val: serde_yaml::Value =
        serde_yaml::from_str(yaml).context("parsing rendered template as YAML")?;
    let json: Json = serde_json::to_value(val).context("converting rendered YAML to JSON")?;
    serde_json::to_vec(&json).context("serializing rendered patch")
}
