//! Mustache-subset template compilation and interpolation (§4.3).
//!
//! Only dotted-path `{{a.b.c}}` lookups are supported — no helpers, no
//! sections, no partials, matching the Non-goals of general-purpose
//! template syntax. Compiled templates are cached process-wide keyed by
//! the source string, the same monotonic, insert-only `DashMap` pattern
//! used elsewhere in the crate (see [`crate::response_cache`]).

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

use crate::workflow::context::ExecutionContext;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Path(String),
}

/// A parsed template: alternating literal and `{{path}}` segments.
#[derive(Debug, Clone)]
pub struct CompiledTemplate {
    segments: Vec<Segment>,
}

impl CompiledTemplate {
    fn compile(source: &str) -> Self {
        let mut segments = Vec::new();
        let mut rest = source;

        while let Some(start) = rest.find("{{") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_string()));
            }
            let after_open = &rest[start + 2..];
            match after_open.find("}}") {
                Some(end) => {
                    let path = after_open[..end].trim().to_string();
                    segments.push(Segment::Path(path));
                    rest = &after_open[end + 2..];
                }
                None => {
                    // Unterminated `{{`: treat the rest as a literal rather
                    // than erroring, so a stray brace in free-form text
                    // doesn't break interpolation.
                    segments.push(Segment::Literal(rest[start..].to_string()));
                    rest = "";
                    break;
                }
            }
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_string()));
        }

        Self { segments }
    }

    /// Whether this template is exactly one `{{path}}` placeholder with no
    /// surrounding text — rendered as the looked-up value's native JSON
    /// type rather than stringified, so `{{steps.x.output}}` can
    /// interpolate an object or number, not just a string.
    fn is_single_placeholder(&self) -> bool {
        matches!(self.segments.as_slice(), [Segment::Path(_)])
    }

    pub fn render(&self, ctx: &ExecutionContext) -> Value {
        if self.is_single_placeholder() {
            let Segment::Path(path) = &self.segments[0] else { unreachable!() };
            return ctx.lookup(path).unwrap_or(Value::Null);
        }

        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Path(path) => {
                    let value = ctx.lookup(path).unwrap_or(Value::Null);
                    rendered.push_str(&value_to_string(&value));
                }
            }
        }
        Value::String(rendered)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Process-wide, insert-only cache of compiled templates keyed by source
/// string (§4.3: "every compiled template is cached process-wide").
#[derive(Debug, Default)]
pub struct TemplateCache {
    compiled: DashMap<String, Arc<CompiledTemplate>>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn get_or_compile(&self, source: &str) -> Arc<CompiledTemplate> {
        if let Some(hit) = self.compiled.get(source) {
            return hit.clone();
        }
        let compiled = Arc::new(CompiledTemplate::compile(source));
        self.compiled.insert(source.to_string(), compiled.clone());
        compiled
    }

    /// Interpolate every string leaf of `value` against `ctx`, recursing
    /// into objects and arrays; non-string leaves pass through unchanged.
    pub fn interpolate(&self, value: &Value, ctx: &ExecutionContext) -> Value {
        match value {
            Value::String(s) => self.get_or_compile(s).render(ctx),
            Value::Object(map) => {
                let mut out = serde_json::Map::with_capacity(map.len());
                for (k, v) in map {
                    out.insert(k.clone(), self.interpolate(v, ctx));
                }
                Value::Object(out)
            }
            Value::Array(items) => Value::Array(items.iter().map(|v| self.interpolate(v, ctx)).collect()),
            other => other.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_placeholder_preserves_native_type() {
        let cache = TemplateCache::new();
        let mut ctx = ExecutionContext::new(serde_json::json!({}));
        ctx.record_output("fetch", serde_json::json!({"count": 3}));

        let rendered = cache.interpolate(&serde_json::json!("{{steps.fetch.output.count}}"), &ctx);
        assert_eq!(rendered, serde_json::json!(3));
    }

    #[test]
    fn mixed_text_and_placeholder_stringifies() {
        let cache = TemplateCache::new();
        let ctx = ExecutionContext::new(serde_json::json!({"name": "ada"}));

        let rendered = cache.interpolate(&serde_json::json!("hello {{input.name}}!"), &ctx);
        assert_eq!(rendered, serde_json::json!("hello ada!"));
    }

    #[test]
    fn interpolation_recurses_into_nested_objects() {
        let cache = TemplateCache::new();
        let ctx = ExecutionContext::new(serde_json::json!({"id": 42}));

        let rendered = cache.interpolate(
            &serde_json::json!({"path": "/users/{{input.id}}", "nested": {"value": "{{input.id}}"}}),
            &ctx,
        );
        assert_eq!(rendered["path"], serde_json::json!("/users/42"));
        assert_eq!(rendered["nested"]["value"], serde_json::json!(42));
    }

    #[test]
    fn repeated_compilation_is_cached() {
        let cache = TemplateCache::new();
        let ctx = ExecutionContext::new(serde_json::json!({}));
        cache.interpolate(&serde_json::json!("{{input.x}}"), &ctx);
        cache.interpolate(&serde_json::json!("{{input.x}}"), &ctx);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn missing_path_renders_null() {
        let cache = TemplateCache::new();
        let ctx = ExecutionContext::new(serde_json::json!({}));
        let rendered = cache.interpolate(&serde_json::json!("{{steps.missing.output}}"), &ctx);
        assert_eq!(rendered, Value::Null);
    }
}
