use std::collections::BTreeMap;

use serde_json::Value;

use crate::crd::app_set::{ApplicationSet, ApplicationSetTemplate};
use crate::crd::application::Application;
use crate::generators::ParamMap;
use kube::ResourceExt;

#[derive(thiserror::Error, Debug)]
pub enum RenderErr {
    #[error("failed to serialize template: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("rendered application has an empty name")]
    EmptyName,
}

/// How generated parameters are exposed to `{{...}}` placeholders.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TemplateMode {
    /// Parameters are flattened to dotted string keys and every value is
    /// stringified before substitution.
    Flat,
    /// Placeholders resolve dotted paths against the parameter tree; a
    /// placeholder that spans a whole string splices the value in with
    /// its structure intact.
    Structured,
}

impl TemplateMode {
    pub fn for_app_set(appset: &ApplicationSet) -> Self {
        if appset.spec.structured_params {
            TemplateMode::Structured
        } else {
            TemplateMode::Flat
        }
    }
}

/// Expand a template against one parameter map into a concrete member
/// application. Neither input is mutated.
pub fn render_application(
    template: &ApplicationSetTemplate,
    params: &ParamMap,
    mode: TemplateMode,
    appset: &ApplicationSet,
) -> Result<Application, RenderErr> {
    let mut tree = serde_json::to_value(template)?;
    substitute(&mut tree, params, mode);
    let rendered: ApplicationSetTemplate = serde_json::from_value(tree)?;

    if rendered.metadata.name.is_empty() {
        return Err(RenderErr::EmptyName);
    }

    let mut app = Application::default();
    app.metadata.name = Some(rendered.metadata.name);
    app.metadata.namespace = Some(
        rendered
            .metadata
            .namespace
            .unwrap_or_else(|| appset.namespace().unwrap_or_default()),
    );
    if !rendered.metadata.labels.is_empty() {
        app.metadata.labels = Some(rendered.metadata.labels);
    }
    if !rendered.metadata.annotations.is_empty() {
        app.metadata.annotations = Some(rendered.metadata.annotations);
    }
    if !rendered.metadata.finalizers.is_empty() {
        app.metadata.finalizers = Some(rendered.metadata.finalizers);
    }
    app.spec = rendered.spec;
    Ok(app)
}

fn substitute(tree: &mut Value, params: &ParamMap, mode: TemplateMode) {
    let flat = match mode {
        TemplateMode::Flat => Some(flatten_params(params)),
        TemplateMode::Structured => None,
    };
    walk(tree, &mut |s: &str| -> Option<Value> {
        match mode {
            TemplateMode::Flat => substitute_flat(s, flat.as_ref().unwrap()),
            TemplateMode::Structured => substitute_structured(s, params),
        }
    });
}

fn walk(value: &mut Value, subst: &mut impl FnMut(&str) -> Option<Value>) {
    match value {
        Value::String(s) => {
            if let Some(replacement) = subst(s) {
                *value = replacement;
            }
        }
        Value::Array(items) => {
            for item in items {
                walk(item, subst);
            }
        }
        Value::Object(map) => {
            for (_, item) in map.iter_mut() {
                walk(item, subst);
            }
        }
        _ => {}
    }
}

fn substitute_flat(s: &str, flat: &BTreeMap<String, String>) -> Option<Value> {
    let out = replace_placeholders(s, |key| flat.get(key).cloned());
    (out != s).then_some(Value::String(out))
}

fn substitute_structured(s: &str, params: &ParamMap) -> Option<Value> {
    // A placeholder spanning the whole string is spliced in as-is so
    // non-string values keep their shape.
    if let Some(key) = sole_placeholder(s) {
        if let Some(value) = lookup_path(params, key) {
            return Some(value.clone());
        }
        return None;
    }
    let out = replace_placeholders(s, |key| {
        lookup_path(params, key).map(stringify)
    });
    (out != s).then_some(Value::String(out))
}

/// Replace every resolvable `{{key}}` occurrence; unresolved placeholders
/// are left in place.
fn replace_placeholders(
    input: &str,
    mut resolve: impl FnMut(&str) -> Option<String>,
) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find("}}") {
            Some(end) => {
                let key = after[..end].trim();
                match resolve(key) {
                    Some(value) => out.push_str(&value),
                    None => {
                        out.push_str(&rest[start..start + 2 + end + 2]);
                    }
                }
                rest = &after[end + 2..];
            }
            None => {
                out.push_str(&rest[start..]);
                return out;
            }
        }
    }
    out.push_str(rest);
    out
}

/// The trimmed placeholder key when the whole string is one placeholder.
fn sole_placeholder(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    let inner = trimmed.strip_prefix("{{")?.strip_suffix("}}")?;
    if inner.contains("{{") || inner.contains("}}") {
        return None;
    }
    Some(inner.trim())
}

fn lookup_path<'a>(params: &'a ParamMap, dotted: &str) -> Option<&'a Value> {
    let mut segments = dotted.split('.');
    let mut current = params.get(segments.next()?)?;
    for segment in segments {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => {
                items.get(segment.parse::<usize>().ok()?)?
            }
            _ => return None,
        };
    }
    Some(current)
}

fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn flatten_params(params: &ParamMap) -> BTreeMap<String, String> {
    let mut flat = BTreeMap::new();
    for (key, value) in params {
        flatten_into(&mut flat, key.clone(), value);
    }
    flat
}

fn flatten_into(
    flat: &mut BTreeMap<String, String>,
    prefix: String,
    value: &Value,
) {
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                flatten_into(flat, format!("{prefix}.{key}"), item);
            }
        }
        Value::Array(items) => {
            for (idx, item) in items.iter().enumerate() {
                flatten_into(flat, format!("{prefix}.{idx}"), item);
            }
        }
        scalar => {
            flat.insert(prefix, stringify(scalar));
        }
    }
}
