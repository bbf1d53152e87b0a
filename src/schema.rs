//! Recursive structural validation of response data.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchemaType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl SchemaType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            SchemaType::String => value.is_string(),
            SchemaType::Number => value.is_number(),
            SchemaType::Integer => {
                value.is_i64()
                    || value.is_u64()
                    || value.as_f64().is_some_and(|f| f.fract() == 0.0)
            }
            SchemaType::Boolean => value.is_boolean(),
            SchemaType::Object => value.is_object(),
            SchemaType::Array => value.is_array(),
            SchemaType::Null => value.is_null(),
        }
    }
}

/// Escape hatch: arbitrary check over the data at a schema node.
#[derive(Clone)]
pub struct SchemaCheck(Arc<dyn Fn(&Value) -> bool + Send + Sync>);

impl SchemaCheck {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }
}

impl fmt::Debug for SchemaCheck {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SchemaCheck(<fn>)")
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    #[serde(default, rename = "type")]
    pub kind: Option<SchemaType>,
    #[serde(default, rename = "enum")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, Schema>,
    #[serde(default)]
    pub items: Option<Box<Schema>>,
    #[serde(default)]
    pub min_items: Option<usize>,
    #[serde(default)]
    pub max_items: Option<usize>,
    #[serde(default)]
    pub min_length: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub pattern: Option<String>,
    #[serde(default)]
    pub minimum: Option<f64>,
    #[serde(default)]
    pub maximum: Option<f64>,
    #[serde(skip)]
    pub validate: Option<SchemaCheck>,
}

impl Schema {
    pub fn of_type(kind: SchemaType) -> Self {
        Self {
            kind: Some(kind),
            ..Self::default()
        }
    }

    pub fn property(mut self, name: impl Into<String>, schema: Schema) -> Self {
        self.properties.insert(name.into(), schema);
        self
    }

    pub fn require(mut self, name: impl Into<String>) -> Self {
        self.required.push(name.into());
        self
    }

    pub fn items(mut self, schema: Schema) -> Self {
        self.items = Some(Box::new(schema));
        self
    }

    pub fn check<F>(mut self, f: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.validate = Some(SchemaCheck::new(f));
        self
    }
}

/// First violation found, with the path it occurred at (`$.a.b[2]`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    pub path: String,
    pub message: String,
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

pub fn validate_schema(
    schema: &Schema,
    data: &Value,
) -> Result<(), SchemaViolation> {
    check_node(schema, data, "$")
}

fn check_node(
    schema: &Schema,
    data: &Value,
    path: &str,
) -> Result<(), SchemaViolation> {
    let fail = |message: String| {
        Err(SchemaViolation {
            path: path.to_string(),
            message,
        })
    };

    if let Some(kind) = schema.kind {
        if !kind.matches(data) {
            return fail(format!("expected {kind:?}, got {}", type_name(data)));
        }
    }

    if let Some(allowed) = &schema.allowed {
        if !allowed.contains(data) {
            return fail(format!("{data} is not one of {allowed:?}"));
        }
    }

    if let Value::Object(map) = data {
        for field in &schema.required {
            if !map.contains_key(field) {
                return fail(format!("missing required field '{field}'"));
            }
        }
        for (name, sub) in &schema.properties {
            if let Some(value) = map.get(name) {
                check_node(sub, value, &format!("{path}.{name}"))?;
            }
        }
    }

    if let Value::Array(items) = data {
        if let Some(min) = schema.min_items {
            if items.len() < min {
                return fail(format!(
                    "expected at least {min} items, got {}",
                    items.len()
                ));
            }
        }
        if let Some(max) = schema.max_items {
            if items.len() > max {
                return fail(format!(
                    "expected at most {max} items, got {}",
                    items.len()
                ));
            }
        }
        if let Some(item_schema) = &schema.items {
            for (idx, item) in items.iter().enumerate() {
                check_node(item_schema, item, &format!("{path}[{idx}]"))?;
            }
        }
    }

    if let Value::String(s) = data {
        let len = s.chars().count();
        if let Some(min) = schema.min_length {
            if len < min {
                return fail(format!("length {len} is below minimum {min}"));
            }
        }
        if let Some(max) = schema.max_length {
            if len > max {
                return fail(format!("length {len} exceeds maximum {max}"));
            }
        }
        if let Some(pattern) = &schema.pattern {
            match Regex::new(pattern) {
                Ok(re) if re.is_match(s) => {}
                Ok(_) => {
                    return fail(format!("'{s}' does not match /{pattern}/"))
                }
                Err(e) => return fail(format!("invalid pattern: {e}")),
            }
        }
    }

    if let Some(n) = data.as_f64() {
        if let Some(min) = schema.minimum {
            if n < min {
                return fail(format!("{n} is below minimum {min}"));
            }
        }
        if let Some(max) = schema.maximum {
            if n > max {
                return fail(format!("{n} exceeds maximum {max}"));
            }
        }
    }

    if let Some(check) = &schema.validate {
        if !(check.0)(data) {
            return fail("custom validation failed".to_string());
        }
    }

    Ok(())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
