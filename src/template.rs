//! Template engine for dynamic values.
//!
//! Uses Handlebars for rendering against the request [`Context`]. Every
//! templated configuration value (paths, cache keys, urls, headers, bodies,
//! statuses) goes through [`TemplateEngine::render`].

use crate::context::Context;
use handlebars::Handlebars;
use regex::Regex;
use serde_json::Value;
use std::borrow::Cow;

/// Template failures.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TemplateError {
    /// The template does not parse.
    #[error("template syntax error: {0}")]
    Syntax(String),
    /// The template parsed but could not be rendered.
    #[error("template render error: {0}")]
    Render(String),
}

/// Template engine for rendering configuration values.
pub struct TemplateEngine {
    handlebars: Handlebars<'static>,
    leading_dot: Regex,
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

        // Don't escape HTML by default (we're not rendering HTML)
        handlebars.register_escape_fn(handlebars::no_escape);

        Self {
            handlebars,
            leading_dot: Regex::new(r"\{\{(~?\s*)\.([A-Za-z_@])").expect("static regex"),
        }
    }

    /// Check that a template parses, without rendering it.
    pub fn check(&self, template: &str) -> Result<(), TemplateError> {
        handlebars::Template::compile(&self.normalize(template))
            .map(|_| ())
            .map_err(|e| TemplateError::Syntax(e.to_string()))
    }

    /// Render a template string against a request context.
    pub fn render(&self, template: &str, context: &Context) -> Result<String, TemplateError> {
        if !template.contains("{{") {
            return Ok(template.to_string());
        }
        self.handlebars
            .render_template(&self.normalize(template), context)
            .map_err(|e| TemplateError::Render(e.to_string()))
    }

    /// `{{.form.name}}` and `{{form.name}}` address the same value.
    fn normalize<'a>(&self, template: &'a str) -> Cow<'a, str> {
        self.leading_dot.replace_all(template, "{{${1}${2}")
    }
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new()
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
    let rendered = match h.param(0).map(|v| v.value()) {
        Some(serde_json::Value::String(s)) => match serde_json::from_str::<serde_json::Value>(s) {
            Ok(json) => serde_json::to_string(&json).unwrap_or_default(),
            Err(_) => s.clone(),
        },
        Some(value) => serde_json::to_string(value).unwrap_or_default(),
        None => String::new(),
    };
    out.write(&rendered)?;
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

/// `{{now}}` is RFC 3339 in UTC, `{{now "unix"}}` epoch seconds, any other
/// argument a strftime format. `offset=<seconds>` shifts the instant, so
/// expiry fields can be mocked as `{{now offset=3600}}`.
fn now_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    use chrono::{SecondsFormat, TimeDelta, Utc};

    let offset = h
        .hash_get("offset")
        .and_then(|v| v.value().as_i64())
        .and_then(TimeDelta::try_seconds)
        .unwrap_or_else(TimeDelta::zero);
    let now = Utc::now()
        .checked_add_signed(offset)
        .unwrap_or_else(Utc::now);

    let rendered = match h.param(0).and_then(|v| v.value().as_str()) {
        None => now.to_rfc3339_opts(SecondsFormat::Millis, true),
        Some("unix") => now.timestamp().to_string(),
        Some(format) => now.format(format).to_string(),
    };
    out.write(&rendered)?;
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

    let mut rng = rand::thread_rng();
    let value = if max > min { rng.gen_range(min..=max) } else { min };
    out.write(&value.to_string())?;
    Ok(())
}

/// First parameter that holds something. Null, empty strings and empty
/// arrays or objects count as missing, so
/// `{{default __request__.data.items form.items "[]"}}` falls through.
fn default_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    let chosen = h
        .params()
        .iter()
        .map(|param| param.value())
        .find(|value| !is_blank(value));
    if let Some(value) = chosen {
        out.write(&as_text(value))?;
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
    if let Some(param) = h.param(0) {
        out.write(&as_text(param.value()).to_uppercase())?;
    }
    Ok(())
}

fn lower_helper(
    h: &handlebars::Helper,
    _: &Handlebars,
    _: &handlebars::Context,
    _: &mut handlebars::RenderContext,
    out: &mut dyn handlebars::Output,
) -> handlebars::HelperResult {
    if let Some(param) = h.param(0) {
        out.write(&as_text(param.value()).to_lowercase())?;
    }
    Ok(())
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Strings as-is, null as nothing, everything else as compact JSON.
fn as_text(value: &Value) -> Cow<'_, str> {
    match value {
        Value::String(s) => Cow::Borrowed(s),
        Value::Null => Cow::Borrowed(""),
        other => Cow::Owned(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> Context {
        let mut ctx = Context::new();
        ctx.insert("id", json!("123"));
        ctx.insert("form", json!({"name": "Ada", "tags": ["a", "b"]}));
        ctx.insert("headers", json!({"user-agent": "test-client"}));
        ctx
    }

    #[test]
    fn test_simple_template() {
        let engine = TemplateEngine::new();
        let result = engine.render("User ID: {{id}}", &context()).unwrap();
        assert_eq!(result, "User ID: 123");
    }

    #[test]
    fn test_leading_dot_paths() {
        let engine = TemplateEngine::new();
        let ctx = context();
        assert_eq!(engine.render("{{.form.name}}", &ctx).unwrap(), "Ada");
        assert_eq!(engine.render("{{ .form.name }}", &ctx).unwrap(), "Ada");
        assert_eq!(engine.render("{{form.name}}", &ctx).unwrap(), "Ada");
    }

    #[test]
    fn test_hyphenated_keys() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("Client: {{headers.user-agent}}", &context())
            .unwrap();
        assert_eq!(result, "Client: test-client");
    }

    #[test]
    fn test_missing_value_renders_empty() {
        let engine = TemplateEngine::new();
        let result = engine.render("[{{form.missing}}]", &context()).unwrap();
        assert_eq!(result, "[]");
    }

    #[test]
    fn test_plain_string_passes_through() {
        let engine = TemplateEngine::new();
        assert_eq!(engine.render("no templates", &context()).unwrap(), "no templates");
    }

    #[test]
    fn test_check_rejects_malformed() {
        let engine = TemplateEngine::new();
        assert!(engine.check("{{form.name}}").is_ok());
        assert!(engine.check("{{#if form}}unterminated").is_err());
        assert!(engine.check("{{form.name").is_err());
    }

    #[test]
    fn test_uuid_helper() {
        let engine = TemplateEngine::new();
        let result = engine.render("ID: {{uuid}}", &context()).unwrap();

        assert!(result.starts_with("ID: "));
        let uuid = &result[4..];
        assert_eq!(uuid.len(), 36);
        assert_eq!(uuid.chars().nth(14), Some('4'));
    }

    #[test]
    fn test_json_helper() {
        let engine = TemplateEngine::new();
        let result = engine.render("{{json form.tags}}", &context()).unwrap();
        assert_eq!(result, r#"["a","b"]"#);
    }

    #[test]
    fn test_default_helper() {
        let engine = TemplateEngine::new();
        let result = engine
            .render("Value: {{default form.missing \"fallback\"}}", &context())
            .unwrap();
        assert_eq!(result, "Value: fallback");
    }

    #[test]
    fn test_default_skips_empty_collections() {
        let engine = TemplateEngine::new();
        let mut ctx = context();
        ctx.insert("empty", json!({"list": [], "map": {}, "text": ""}));

        assert_eq!(engine.render("{{default empty.list \"none\"}}", &ctx).unwrap(), "none");
        assert_eq!(engine.render("{{default empty.map \"none\"}}", &ctx).unwrap(), "none");
        assert_eq!(engine.render("{{default empty.text \"none\"}}", &ctx).unwrap(), "none");
        assert_eq!(
            engine.render("{{default empty.list form.tags \"none\"}}", &ctx).unwrap(),
            r#"["a","b"]"#
        );
    }

    #[test]
    fn test_default_keeps_falsy_scalars() {
        let engine = TemplateEngine::new();
        let mut ctx = context();
        ctx.insert("flags", json!({"enabled": false, "count": 0}));

        assert_eq!(engine.render("{{default flags.enabled true}}", &ctx).unwrap(), "false");
        assert_eq!(engine.render("{{default flags.count 9}}", &ctx).unwrap(), "0");
        assert_eq!(engine.render("{{default flags.missing 9}}", &ctx).unwrap(), "9");
    }

    #[test]
    fn test_upper_lower_helpers() {
        let engine = TemplateEngine::new();
        let result = engine
            .render(
                "Upper: {{upper form.name}}, Lower: {{lower form.name}}",
                &context(),
            )
            .unwrap();
        assert_eq!(result, "Upper: ADA, Lower: ada");
    }

    #[test]
    fn test_upper_lower_stringify_non_strings() {
        let engine = TemplateEngine::new();
        let mut ctx = context();
        ctx.insert("reply", json!({"ok": true, "code": "e-42", "missing": null}));

        assert_eq!(engine.render("{{upper reply.ok}}", &ctx).unwrap(), "TRUE");
        assert_eq!(engine.render("{{upper reply.code}}", &ctx).unwrap(), "E-42");
        assert_eq!(engine.render("{{lower form.tags}}", &ctx).unwrap(), r#"["a","b"]"#);
        assert_eq!(engine.render("[{{upper reply.missing}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_now_formats() {
        let engine = TemplateEngine::new();
        let ctx = context();

        let rendered = engine.render("{{now}}", &ctx).unwrap();
        let parsed = chrono::DateTime::parse_from_rfc3339(&rendered).unwrap();
        assert!((chrono::Utc::now() - parsed.with_timezone(&chrono::Utc)).num_seconds().abs() < 5);

        let unix: i64 = engine.render("{{now \"unix\"}}", &ctx).unwrap().parse().unwrap();
        let later: i64 = engine
            .render("{{now \"unix\" offset=3600}}", &ctx)
            .unwrap()
            .parse()
            .unwrap();
        assert!((3599..=3601).contains(&(later - unix)));

        let year = engine.render("{{now \"%Y\"}}", &ctx).unwrap();
        assert_eq!(year.len(), 4);
    }

    #[test]
    fn test_random_helper_in_range() {
        let engine = TemplateEngine::new();
        let value: i64 = engine
            .render("{{random 5 10}}", &context())
            .unwrap()
            .parse()
            .unwrap();
        assert!((5..=10).contains(&value));
    }
}
