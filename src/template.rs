//! Template engine for dynamic responses.
//!
//! Uses Handlebars to render `{{...}}` expressions inside response payloads
//! against the call context.

use crate::config::{Metadata, Payload};
use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::Serialize;
use serde_json::Value;
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::warn;

/// Maximum nesting depth walked when rendering a payload.
pub const MAX_RECURSION_DEPTH: usize = 250;

/// Compiled templates kept in the registry before falling back to one-off
/// rendering.
const MAX_CACHED_TEMPLATES: usize = 1024;

/// Renders templated payloads. Implementations must be pure.
pub trait Renderer: Send + Sync {
    fn render(&self, payload: &Payload, ctx: &RenderContext<'_>) -> Payload;
}

/// Call state visible to templates.
#[derive(Debug, Clone)]
pub struct RenderContext<'a> {
    pub stub_id: &'a str,
    /// The request the message answers, if any
    pub request: Option<&'a Payload>,
    pub requests: &'a [Payload],
    pub headers: &'a Metadata,
    /// Index of the message being produced
    pub message_index: usize,
    pub request_time: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TemplateData<'a> {
    request: &'a Payload,
    requests: &'a [Payload],
    headers: &'a Metadata,
    message_index: usize,
    request_time: String,
    stub_id: &'a str,
}

/// Error rendering a single template string.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error(transparent)]
    Parse(#[from] handlebars::TemplateError),
    #[error(transparent)]
    Render(#[from] handlebars::RenderError),
}

/// Template engine for rendering dynamic responses.
///
/// Template strings are compiled once and cached in the registry, keyed by
/// their source text.
pub struct TemplateEngine {
    handlebars: RwLock<Handlebars<'static>>,
}

impl TemplateEngine {
    /// Create a new template engine.
    pub fn new() -> Self {
        let mut handlebars = Handlebars::new();

        // Register custom helpers
        handlebars.register_helper("json", Box::new(json_helper));
        handlebars.register_helper("uuid", Box::new(uuid_helper));
        handlebars.register_helper("now", Box::new(now_helper));
        handlebars.register_helper("random", Box::new(random_helper));
        handlebars.register_helper("default", Box::new(default_helper));
        handlebars.register_helper("upper", Box::new(upper_helper));
        handlebars.register_helper("lower", Box::new(lower_helper));
        handlebars.register_helper("base64", Box::new(base64_helper));

        // Payloads are protobuf JSON, not HTML
        handlebars.register_escape_fn(handlebars::no_escape);

        Self {
            handlebars: RwLock::new(handlebars),
        }
    }

    /// Render one template string against a prepared context value.
    pub fn render_str(&self, template: &str, data: &Value) -> Result<String, TemplateError> {
        {
            let registry = self.handlebars.read().unwrap_or_else(PoisonError::into_inner);
            if registry.has_template(template) {
                return Ok(registry.render(template, data)?);
            }
            if registry.get_templates().len() >= MAX_CACHED_TEMPLATES {
                return Ok(registry.render_template(template, data)?);
            }
        }

        let mut registry = self.handlebars.write().unwrap_or_else(PoisonError::into_inner);
        if !registry.has_template(template) {
            registry.register_template_string(template, template)?;
        }
        Ok(registry.render(template, data)?)
    }

    /// Number of compiled templates currently cached.
    pub fn cached_templates(&self) -> usize {
        self.handlebars
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get_templates()
            .len()
    }

    fn render_value(&self, value: &Value, data: &Value, depth: usize) -> Value {
        if depth > MAX_RECURSION_DEPTH {
            return value.clone();
        }

        match value {
            Value::String(s) if is_template(s) => match self.render_str(s, data) {
                Ok(rendered) => Value::String(rendered),
                Err(e) => {
                    warn!(template = %s, error = %e, "Template rendering failed");
                    value.clone()
                }
            },
            Value::Array(items) => Value::Array(
                items
                    .iter()
                    .map(|v| self.render_value(v, data, depth + 1))
                    .collect(),
            ),
            Value::Object(map) => Value::Object(self.render_map(map, data, depth + 1)),
            _ => value.clone(),
        }
    }

    fn render_map(&self, map: &Payload, data: &Value, depth: usize) -> Payload {
        map.iter()
            .map(|(k, v)| (k.clone(), self.render_value(v, data, depth)))
            .collect()
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Renderer for TemplateEngine {
    fn render(&self, payload: &Payload, ctx: &RenderContext<'_>) -> Payload {
        if !has_templates(payload, 0) {
            return payload.clone();
        }

        let empty = Payload::new();
        let data = TemplateData {
            request: ctx.request.unwrap_or(&empty),
            requests: ctx.requests,
            headers: ctx.headers,
            message_index: ctx.message_index,
            request_time: ctx.request_time.to_rfc3339(),
            stub_id: ctx.stub_id,
        };
        let data = match serde_json::to_value(&data) {
            Ok(data) => data,
            Err(e) => {
                warn!(stub_id = %ctx.stub_id, error = %e, "Failed to build template context");
                return payload.clone();
            }
        };

        self.render_map(payload, &data, 0)
    }
}

/// Whether a string contains template syntax.
pub fn is_template(s: &str) -> bool {
    s.contains("{{") && s.contains("}}")
}

fn has_templates(map: &Payload, depth: usize) -> bool {
    map.values().any(|v| value_has_templates(v, depth + 1))
}

fn value_has_templates(value: &Value, depth: usize) -> bool {
    if depth > MAX_RECURSION_DEPTH {
        return false;
    }
    match value {
        Value::String(s) => is_template(s),
        Value::Array(items) => items.iter().any(|v| value_has_templates(v, depth + 1)),
        Value::Object(map) => has_templates(map, depth),
        _ => false,
    }
}

// Custom Handlebars helpers

fn json_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    match h.param(0).map(|v| v.value()) {
        Some(Value::String(s)) => out.write(s)?,
        Some(v) => out.write(&serde_json::to_string(v).unwrap_or_default())?,
        None => {}
    }
    Ok(())
}

fn uuid_helper(
    _: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    out.write(&uuid::Uuid::new_v4().to_string())?;
    Ok(())
}

fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let format = h
        .param(0)
        .and_then(|v| v.value().as_str())
        .unwrap_or("%Y-%m-%dT%H:%M:%S%.3fZ");

    out.write(&Utc::now().format(format).to_string())?;
    Ok(())
}

fn random_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use rand::Rng;

    let min = h.param(0).and_then(|v| v.value().as_i64()).unwrap_or(0);
    let max = h.param(1).and_then(|v| v.value().as_i64()).unwrap_or(100);

    let value = if max > min {
        rand::thread_rng().gen_range(min..=max)
    } else {
        min
    };
    out.write(&value.to_string())?;
    Ok(())
}

fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).map(|v| v.value());
    let default = h.param(1).and_then(|v| v.value().as_str()).unwrap_or("");

    match value {
        Some(Value::String(s)) if !s.is_empty() => out.write(s)?,
        Some(Value::String(_)) | Some(Value::Null) | None => out.write(default)?,
        Some(v) => out.write(&v.to_string())?,
    }
    Ok(())
}

fn upper_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_uppercase())?;
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&value.to_lowercase())?;
    Ok(())
}

/// Encode a string as standard base64, the JSON form of protobuf `bytes`.
fn base64_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use base64::Engine;

    let value = h.param(0).and_then(|v| v.value().as_str()).unwrap_or("");
    out.write(&base64::engine::general_purpose::STANDARD.encode(value))?;
    Ok(())
}
