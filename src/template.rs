//! `{name}` placeholder substitution over request templates.
//!
//! A template is plain JSON plus one extra variant: a generator call,
//! written `{func: <name>, params: [...]}` in scenario files, which is
//! invoked in place at substitution time instead of being rewritten
//! textually.

use crate::model::Context;
use chrono::Utc;
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, LazyLock};
use tracing::warn;

/// A value generator, called with its (already substituted) params.
pub type GeneratorFn = Arc<dyn Fn(&[Value]) -> Value + Send + Sync>;

/// Generators addressable by name from templates.
pub type GeneratorTable = HashMap<String, GeneratorFn>;

static PLACEHOLDER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\{([A-Za-z0-9_.\-]+)\}")
        .expect("failed to compile placeholder regex")
});

/// Request template (body) with optional generator calls.
#[derive(Debug, Clone, Deserialize)]
#[serde(from = "Value")]
pub enum Template {
    /// Null, booleans and numbers.
    Literal(Value),
    Text(String),
    Array(Vec<Template>),
    Object(Vec<(String, Template)>),
    Generator(GeneratorCall),
}

/// A deferred generator invocation.
#[derive(Debug, Clone)]
pub struct GeneratorCall {
    pub func: GeneratorRef,
    pub params: Vec<Value>,
}

#[derive(Clone)]
pub enum GeneratorRef {
    /// Looked up in the generator table when substituted.
    Named(String),
    Func(GeneratorFn),
}

impl fmt::Debug for GeneratorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GeneratorRef::Named(name) => {
                f.debug_tuple("Named").field(name).finish()
            }
            GeneratorRef::Func(_) => f.write_str("Func(<fn>)"),
        }
    }
}

impl Template {
    /// A generator call backed by a function rather than a name.
    pub fn generator<F>(f: F, params: Vec<Value>) -> Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        Template::Generator(GeneratorCall {
            func: GeneratorRef::Func(Arc::new(f)),
            params,
        })
    }

    /// A generator call resolved by name at substitution time.
    pub fn named_generator(name: impl Into<String>, params: Vec<Value>) -> Self {
        Template::Generator(GeneratorCall {
            func: GeneratorRef::Named(name.into()),
            params,
        })
    }
}

impl From<Value> for Template {
    fn from(value: Value) -> Self {
        match value {
            Value::String(s) => Template::Text(s),
            Value::Array(items) => {
                Template::Array(items.into_iter().map(Template::from).collect())
            }
            Value::Object(map) => match generator_call(&map) {
                Some(call) => Template::Generator(call),
                None => Template::Object(
                    map.into_iter()
                        .map(|(k, v)| (k, Template::from(v)))
                        .collect(),
                ),
            },
            other => Template::Literal(other),
        }
    }
}

impl From<&str> for Template {
    fn from(value: &str) -> Self {
        Template::Text(value.to_string())
    }
}

/// Recognise `{func: "name"}` / `{func: "name", params: ...}`.
fn generator_call(map: &Map<String, Value>) -> Option<GeneratorCall> {
    let name = map.get("func")?.as_str()?;
    if map.keys().any(|k| k != "func" && k != "params") {
        return None;
    }
    let params = match map.get("params") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(items)) => items.clone(),
        Some(other) => vec![other.clone()],
    };
    Some(GeneratorCall {
        func: GeneratorRef::Named(name.to_string()),
        params,
    })
}

/// Replace every `{key}` whose key exists in `context`.
///
/// Strings are inserted verbatim, other values as JSON. Unknown
/// placeholders are left as they are.
pub fn substitute_str(text: &str, context: &Context) -> String {
    if !text.contains('{') {
        return text.to_string();
    }
    PLACEHOLDER_RE
        .replace_all(text, |caps: &regex::Captures| {
            match context.get(&caps[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(value) => value.to_string(),
                None => caps[0].to_string(),
            }
        })
        .into_owned()
}

/// Substitute placeholders through a plain JSON value.
pub fn substitute_value(value: &Value, context: &Context) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_str(s, context)),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| substitute_value(v, context)).collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), substitute_value(v, context)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Render a template against the context, invoking generator calls.
pub fn substitute(
    template: &Template,
    context: &Context,
    generators: &GeneratorTable,
) -> Value {
    match template {
        Template::Literal(value) => value.clone(),
        Template::Text(text) => Value::String(substitute_str(text, context)),
        Template::Array(items) => Value::Array(
            items
                .iter()
                .map(|t| substitute(t, context, generators))
                .collect(),
        ),
        Template::Object(entries) => Value::Object(
            entries
                .iter()
                .map(|(k, t)| (k.clone(), substitute(t, context, generators)))
                .collect(),
        ),
        Template::Generator(call) => {
            let params: Vec<Value> = call
                .params
                .iter()
                .map(|p| substitute_value(p, context))
                .collect();
            match &call.func {
                GeneratorRef::Func(f) => f(&params),
                GeneratorRef::Named(name) => match generators.get(name) {
                    Some(f) => f(&params),
                    None => {
                        warn!("unknown generator '{}', using null", name);
                        Value::Null
                    }
                },
            }
        }
    }
}

/// `uuid`, `randomInt`, `randomString`, `randomEmail`, `timestamp`
/// and `isoDate`.
pub fn builtin_generators() -> GeneratorTable {
    let mut table: GeneratorTable = HashMap::new();

    table.insert(
        "uuid".into(),
        Arc::new(|_: &[Value]| Value::String(uuid::Uuid::new_v4().to_string())),
    );
    table.insert(
        "randomInt".into(),
        Arc::new(|params: &[Value]| {
            let min = param_i64(params, 0).unwrap_or(0);
            let max = param_i64(params, 1).unwrap_or(1000).max(min);
            Value::from(rand::thread_rng().gen_range(min..=max))
        }),
    );
    table.insert(
        "randomString".into(),
        Arc::new(|params: &[Value]| {
            let len = param_i64(params, 0).unwrap_or(8).max(0) as usize;
            Value::String(random_alphanumeric(len))
        }),
    );
    table.insert(
        "randomEmail".into(),
        Arc::new(|params: &[Value]| {
            let domain = params
                .first()
                .and_then(Value::as_str)
                .unwrap_or("example.com");
            Value::String(format!(
                "user_{}@{domain}",
                random_alphanumeric(8).to_lowercase()
            ))
        }),
    );
    table.insert(
        "timestamp".into(),
        Arc::new(|_: &[Value]| Value::from(Utc::now().timestamp_millis())),
    );
    table.insert(
        "isoDate".into(),
        Arc::new(|_: &[Value]| Value::String(Utc::now().to_rfc3339())),
    );

    table
}

fn param_i64(params: &[Value], idx: usize) -> Option<i64> {
    match params.get(idx)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn random_alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => panic!("context fixture must be an object"),
        }
    }

    #[test]
    fn test_plain_string_unchanged() {
        let context = ctx(json!({"id": "abc"}));
        assert_eq!(substitute_str("/items", &context), "/items");
    }

    #[test]
    fn test_placeholders_replaced() {
        let context = ctx(json!({"id": "abc", "n": 3, "user.name": "bo"}));
        assert_eq!(
            substitute_str("/items/{id}?n={n}&u={user.name}", &context),
            "/items/abc?n=3&u=bo"
        );
    }

    #[test]
    fn test_unknown_placeholder_kept_and_idempotent() {
        let mut context = ctx(json!({"a": "1"}));
        let once = substitute_str("{a}/{b}", &context);
        assert_eq!(once, "1/{b}");

        context.insert("b".into(), json!("2"));
        let twice = substitute_str(&once, &context);
        assert_eq!(twice, "1/2");
        assert_eq!(substitute_str(&twice, &context), twice);
    }

    #[test]
    fn test_non_identifier_braces_untouched() {
        let context = ctx(json!({"a": "1"}));
        assert_eq!(substitute_str("{ a } {a b} {}", &context), "{ a } {a b} {}");
    }

    #[test]
    fn test_nested_template_preserves_key_order() {
        let template = Template::from(json!({
            "z": "{name}",
            "a": [1, "{name}", {"deep": "{name}!"}],
            "m": true
        }));
        let context = ctx(json!({"name": "kit"}));
        let value = substitute(&template, &context, &builtin_generators());
        assert_eq!(
            value,
            json!({"z": "kit", "a": [1, "kit", {"deep": "kit!"}], "m": true})
        );
        let keys: Vec<&String> = value.as_object().unwrap().keys().collect();
        assert_eq!(keys, vec!["z", "a", "m"]);
    }

    #[test]
    fn test_generator_call_invoked() {
        let template = Template::from(json!({
            "id": {"func": "uuid"},
            "n": {"func": "randomInt", "params": [5, 5]},
            "tag": {"func": "echo", "params": ["{x}"]}
        }));
        let mut generators = builtin_generators();
        generators.insert(
            "echo".into(),
            Arc::new(|params: &[Value]| params[0].clone()),
        );
        let value = substitute(&template, &ctx(json!({"x": "y"})), &generators);

        assert_eq!(value["id"].as_str().map(str::len), Some(36));
        assert_eq!(value["n"], json!(5));
        assert_eq!(value["tag"], json!("y"));
    }

    #[test]
    fn test_object_with_extra_keys_is_not_generator() {
        let template = Template::from(json!({"func": "uuid", "other": 1}));
        assert!(matches!(template, Template::Object(_)));
    }

    #[test]
    fn test_function_generator() {
        let template = Template::generator(|_| json!(42), vec![]);
        let value = substitute(&template, &Context::new(), &GeneratorTable::new());
        assert_eq!(value, json!(42));
    }

    #[test]
    fn test_unknown_generator_is_null() {
        let template = Template::named_generator("nope", vec![]);
        let value = substitute(&template, &Context::new(), &builtin_generators());
        assert_eq!(value, Value::Null);
    }
}
