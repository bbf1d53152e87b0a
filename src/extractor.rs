//! Extraction of named variables from responses.
//!
//! Every entry of an [`ExtractionSpec`] is evaluated in isolation: an
//! entry that fails is reported as a [`Diagnostic`] and left out of
//! the result, while the remaining entries are still extracted.

use crate::error::Diagnostic;
use crate::model::{Context, Response};
use crate::path::{resolve_path, resolve_value};
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

type SyncExtractFn = dyn Fn(&Response) -> Result<Value> + Send + Sync;
type AsyncExtractFn =
    dyn Fn(Response) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A user-supplied extraction function over the whole response.
///
/// `Lookup` backs the built-ins: `None` leaves the variable unset.
#[derive(Clone)]
pub enum CustomExtractor {
    Sync(Arc<SyncExtractFn>),
    Async(Arc<AsyncExtractFn>),
    Lookup(fn(&Response) -> Option<Value>),
}

impl CustomExtractor {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Response) -> Result<Value> + Send + Sync + 'static,
    {
        CustomExtractor::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        CustomExtractor::Async(Arc::new(move |response| f(response).boxed()))
    }

    pub async fn call(&self, response: &Response) -> Result<Option<Value>> {
        match self {
            CustomExtractor::Sync(f) => f(response).map(Some),
            CustomExtractor::Async(f) => f(response.clone()).await.map(Some),
            CustomExtractor::Lookup(f) => Ok(f(response)),
        }
    }
}

impl fmt::Debug for CustomExtractor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CustomExtractor::Sync(_) => f.write_str("CustomExtractor::Sync(<fn>)"),
            CustomExtractor::Async(_) => f.write_str("CustomExtractor::Async(<fn>)"),
            CustomExtractor::Lookup(_) => f.write_str("CustomExtractor::Lookup(<fn>)"),
        }
    }
}

/// Named extractors, built-in and registered.
pub type ExtractorTable = HashMap<String, CustomExtractor>;

/// Ordered mapping from output variable name to rule.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(try_from = "Value")]
pub struct ExtractionSpec {
    entries: Vec<(String, ExtractionRule)>,
}

impl ExtractionSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(
        mut self,
        name: impl Into<String>,
        rule: impl Into<ExtractionRule>,
    ) -> Self {
        self.entries.push((name.into(), rule.into()));
        self
    }

    pub fn entries(&self) -> &[(String, ExtractionRule)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[derive(Debug, Clone)]
pub enum ExtractionRule {
    /// A registered extractor name, otherwise a response path.
    Path(String),
    Custom(CustomExtractor),
    Complex(ComplexRule),
    /// Unrecognised shape, skipped with a diagnostic.
    Unsupported(Value),
}

impl ExtractionRule {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Response) -> Result<Value> + Send + Sync + 'static,
    {
        ExtractionRule::Custom(CustomExtractor::new(f))
    }

    pub fn computed<F>(f: F) -> Self
    where
        F: Fn(&Response) -> Result<Value> + Send + Sync + 'static,
    {
        ExtractionRule::Complex(ComplexRule::Computed(CustomExtractor::new(f)))
    }

    pub fn multiple(spec: ExtractionSpec) -> Self {
        ExtractionRule::Complex(ComplexRule::Multiple(spec))
    }
}

impl From<&str> for ExtractionRule {
    fn from(path: &str) -> Self {
        ExtractionRule::Path(path.to_string())
    }
}

impl From<String> for ExtractionRule {
    fn from(path: String) -> Self {
        ExtractionRule::Path(path)
    }
}

impl From<CustomExtractor> for ExtractionRule {
    fn from(f: CustomExtractor) -> Self {
        ExtractionRule::Custom(f)
    }
}

#[derive(Debug, Clone)]
pub enum ComplexRule {
    Path(PathRule),
    Multiple(ExtractionSpec),
    Conditional(ConditionalRule),
    Array(ArrayRule),
    Regex(RegexRule),
    Computed(CustomExtractor),
}

macro_rules! complex_from {
    ($($ty:ident => $variant:ident),*) => {$(
        impl From<$ty> for ExtractionRule {
            fn from(rule: $ty) -> Self {
                ExtractionRule::Complex(ComplexRule::$variant(rule))
            }
        }
    )*};
}

complex_from!(
    PathRule => Path,
    ConditionalRule => Conditional,
    ArrayRule => Array,
    RegexRule => Regex
);

/// `path` with optional `transform`, `filter` and `default`.
#[derive(Debug, Clone)]
pub struct PathRule {
    pub path: String,
    pub transform: Option<ValueTransform>,
    pub filter: Option<ValueFilter>,
    pub default: Option<Value>,
}

impl PathRule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            transform: None,
            filter: None,
            default: None,
        }
    }

    pub fn transform(mut self, transform: ValueTransform) -> Self {
        self.transform = Some(transform);
        self
    }

    pub fn transform_with<F>(self, f: F) -> Self
    where
        F: Fn(Value, &Response) -> Result<Value> + Send + Sync + 'static,
    {
        self.transform(ValueTransform::Custom(Arc::new(f)))
    }

    pub fn filter(mut self, filter: ValueFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn filter_with<F>(self, f: F) -> Self
    where
        F: Fn(&Value, &Response) -> bool + Send + Sync + 'static,
    {
        self.filter(ValueFilter::Custom(Arc::new(f)))
    }

    pub fn or_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Clone)]
pub enum ValueTransform {
    /// A built-in transform such as `number` or `uppercase`.
    Named(String),
    Custom(Arc<dyn Fn(Value, &Response) -> Result<Value> + Send + Sync>),
}

impl fmt::Debug for ValueTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueTransform::Named(name) => f.debug_tuple("Named").field(name).finish(),
            ValueTransform::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

#[derive(Clone)]
pub enum ValueFilter {
    /// Condition evaluated with the extracted value as `data`.
    When(Condition),
    Custom(Arc<dyn Fn(&Value, &Response) -> bool + Send + Sync>),
}

impl fmt::Debug for ValueFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueFilter::When(cond) => f.debug_tuple("When").field(cond).finish(),
            ValueFilter::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Ordered `{if, then}` branches; the first matching one wins.
#[derive(Debug, Clone, Default)]
pub struct ConditionalRule {
    pub branches: Vec<(Condition, ExtractionRule)>,
    pub default: Option<Value>,
}

impl ConditionalRule {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, condition: Condition, rule: impl Into<ExtractionRule>) -> Self {
        self.branches.push((condition, rule.into()));
        self
    }

    pub fn otherwise(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// Operations over an array found at `path`.
///
/// `filter` runs first; then at most one of `find`, `map` or `pluck`
/// shapes the output.
#[derive(Debug, Clone)]
pub struct ArrayRule {
    pub path: String,
    pub filter: Option<Condition>,
    pub projection: Option<ArrayProjection>,
    pub default: Option<Value>,
}

#[derive(Debug, Clone)]
pub enum ArrayProjection {
    /// Apply a rule to each element as if it were a response body.
    Map(Box<ExtractionRule>),
    Find(Condition),
    Pluck(String),
}

impl ArrayRule {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            filter: None,
            projection: None,
            default: None,
        }
    }

    pub fn filter(mut self, condition: Condition) -> Self {
        self.filter = Some(condition);
        self
    }

    pub fn map(mut self, rule: impl Into<ExtractionRule>) -> Self {
        self.projection = Some(ArrayProjection::Map(Box::new(rule.into())));
        self
    }

    pub fn find(mut self, condition: Condition) -> Self {
        self.projection = Some(ArrayProjection::Find(condition));
        self
    }

    pub fn pluck(mut self, path: impl Into<String>) -> Self {
        self.projection = Some(ArrayProjection::Pluck(path.into()));
        self
    }

    pub fn or_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

#[derive(Debug, Clone)]
pub enum RegexGroup {
    Index(usize),
    Name(String),
}

/// Pattern match over a string source; yields one capture group.
#[derive(Debug, Clone)]
pub struct RegexRule {
    pub pattern: Regex,
    pub group: RegexGroup,
    /// Path of the source string; the serialized response when unset.
    pub source: Option<String>,
    pub default: Option<Value>,
}

impl RegexRule {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
            group: RegexGroup::Index(0),
            source: None,
            default: None,
        })
    }

    pub fn group(mut self, idx: usize) -> Self {
        self.group = RegexGroup::Index(idx);
        self
    }

    pub fn named_group(mut self, name: impl Into<String>) -> Self {
        self.group = RegexGroup::Name(name.into());
        self
    }

    pub fn source(mut self, path: impl Into<String>) -> Self {
        self.source = Some(path.into());
        self
    }

    pub fn or_default(mut self, value: Value) -> Self {
        self.default = Some(value);
        self
    }
}

/// A boolean test over a response.
#[derive(Clone)]
pub enum Condition {
    Custom(Arc<dyn Fn(&Response) -> Result<bool> + Send + Sync>),
    Equals { path: String, value: Value },
    NotEquals { path: String, value: Value },
    Matches { path: String, pattern: String },
    Exists { path: String, exists: bool },
    Status(u16),
    StatusRange(u16, u16),
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Custom(_) => f.write_str("Custom(<fn>)"),
            Condition::Equals { path, value } => {
                write!(f, "Equals({path} == {value})")
            }
            Condition::NotEquals { path, value } => {
                write!(f, "NotEquals({path} != {value})")
            }
            Condition::Matches { path, pattern } => {
                write!(f, "Matches({path} =~ /{pattern}/)")
            }
            Condition::Exists { path, exists } => {
                write!(f, "Exists({path}: {exists})")
            }
            Condition::Status(code) => write!(f, "Status({code})"),
            Condition::StatusRange(min, max) => {
                write!(f, "StatusRange({min}..={max})")
            }
        }
    }
}

impl Condition {
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&Response) -> Result<bool> + Send + Sync + 'static,
    {
        Condition::Custom(Arc::new(f))
    }

    pub fn equals(path: impl Into<String>, value: Value) -> Self {
        Condition::Equals {
            path: path.into(),
            value,
        }
    }

    pub fn exists(path: impl Into<String>) -> Self {
        Condition::Exists {
            path: path.into(),
            exists: true,
        }
    }

    /// Evaluate the condition; `Err` means the condition itself could
    /// not be evaluated.
    pub fn evaluate(&self, response: &Response) -> Result<bool, String> {
        match self {
            Condition::Custom(f) => f(response).map_err(|e| e.to_string()),
            Condition::Equals { path, value } => Ok(resolve_path(path, response)
                .is_some_and(|actual| loose_eq(&actual, value))),
            Condition::NotEquals { path, value } => Ok(!resolve_path(path, response)
                .is_some_and(|actual| loose_eq(&actual, value))),
            Condition::Matches { path, pattern } => {
                let re = Regex::new(pattern)
                    .map_err(|e| format!("invalid pattern /{pattern}/: {e}"))?;
                Ok(resolve_path(path, response)
                    .is_some_and(|actual| re.is_match(&value_to_text(&actual))))
            }
            Condition::Exists { path, exists } => {
                let present = resolve_path(path, response)
                    .is_some_and(|v| !v.is_null());
                Ok(present == *exists)
            }
            Condition::Status(code) => Ok(response.status == *code),
            Condition::StatusRange(min, max) => {
                Ok((*min..=*max).contains(&response.status))
            }
        }
    }

    /// Parse the data form of a condition.
    pub fn from_value(value: &Value) -> Result<Self, String> {
        let map = value
            .as_object()
            .ok_or_else(|| format!("condition must be a mapping, got {value}"))?;

        if let Some(status) = map.get("status") {
            return as_status(status).map(Condition::Status);
        }
        if let Some(range) = map.get("statusRange") {
            let bounds = range
                .as_array()
                .filter(|b| b.len() == 2)
                .ok_or("statusRange must be [min, max]")?;
            return Ok(Condition::StatusRange(
                as_status(&bounds[0])?,
                as_status(&bounds[1])?,
            ));
        }

        let path = map
            .get("path")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("condition needs a 'path': {value}"))?
            .to_string();

        if let Some(expected) = map.get("equals") {
            Ok(Condition::Equals {
                path,
                value: expected.clone(),
            })
        } else if let Some(expected) = map.get("notEquals") {
            Ok(Condition::NotEquals {
                path,
                value: expected.clone(),
            })
        } else if let Some(pattern) = map.get("matches") {
            let pattern = pattern
                .as_str()
                .ok_or("'matches' must be a string")?
                .to_string();
            Ok(Condition::Matches { path, pattern })
        } else if let Some(exists) = map.get("exists") {
            let exists = exists.as_bool().ok_or("'exists' must be a boolean")?;
            Ok(Condition::Exists { path, exists })
        } else {
            Err(format!("unsupported condition: {value}"))
        }
    }
}

fn as_status(value: &Value) -> Result<u16, String> {
    value
        .as_u64()
        .and_then(|n| u16::try_from(n).ok())
        .ok_or_else(|| format!("invalid status code: {value}"))
}

/// Equality that treats `1` and `1.0` as the same number.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        _ => a == b,
    }
}

pub(crate) fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Values and diagnostics produced by one extraction pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub values: Context,
    pub diagnostics: Vec<Diagnostic>,
}

/// Evaluates extraction specs against responses.
pub struct Extractor<'a> {
    extractors: &'a ExtractorTable,
}

impl<'a> Extractor<'a> {
    pub fn new(extractors: &'a ExtractorTable) -> Self {
        Self { extractors }
    }

    pub async fn extract(
        &self,
        spec: &ExtractionSpec,
        response: &Response,
    ) -> Extraction {
        let mut extraction = Extraction::default();

        for (name, rule) in spec.entries() {
            let outcome = self
                .evaluate(rule, response, name, &mut extraction.diagnostics)
                .await;
            match outcome {
                Ok(Some(value)) => {
                    debug!("extracted '{}' = {}", name, value);
                    extraction.values.insert(name.clone(), value);
                }
                Ok(None) => {
                    debug!("extraction '{}' resolved to nothing", name);
                }
                Err(message) => {
                    warn!("extraction '{}' failed: {}", name, message);
                    extraction
                        .diagnostics
                        .push(Diagnostic::new(name.clone(), message));
                }
            }
        }

        extraction
    }

    /// `Ok(None)` means the rule resolved to nothing (undefined).
    fn evaluate<'b>(
        &'b self,
        rule: &'b ExtractionRule,
        response: &'b Response,
        key: &'b str,
        diagnostics: &'b mut Vec<Diagnostic>,
    ) -> BoxFuture<'b, Result<Option<Value>, String>> {
        async move {
            match rule {
                ExtractionRule::Path(path) => {
                    if let Some(extractor) = self.extractors.get(path) {
                        return extractor
                            .call(response)
                            .await
                            .map_err(|e| e.to_string());
                    }
                    Ok(resolve_path(path, response))
                }
                ExtractionRule::Custom(extractor) => extractor
                    .call(response)
                    .await
                    .map_err(|e| e.to_string()),
                ExtractionRule::Complex(complex) => {
                    self.evaluate_complex(complex, response, key, diagnostics)
                        .await
                }
                ExtractionRule::Unsupported(value) => {
                    Err(format!("unsupported extraction rule: {value}"))
                }
            }
        }
        .boxed()
    }

    async fn evaluate_complex(
        &self,
        rule: &ComplexRule,
        response: &Response,
        key: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Option<Value>, String> {
        match rule {
            ComplexRule::Path(rule) => self.evaluate_path_rule(rule, response, key, diagnostics),
            ComplexRule::Multiple(spec) => {
                let mut nested = Map::new();
                for (name, sub) in spec.entries() {
                    let sub_key = format!("{key}.{name}");
                    match self.evaluate(sub, response, &sub_key, diagnostics).await {
                        Ok(Some(value)) => {
                            nested.insert(name.clone(), value);
                        }
                        Ok(None) => {}
                        Err(message) => {
                            warn!("extraction '{}' failed: {}", sub_key, message);
                            diagnostics.push(Diagnostic::new(sub_key, message));
                        }
                    }
                }
                Ok(Some(Value::Object(nested)))
            }
            ComplexRule::Conditional(rule) => {
                for (condition, then) in &rule.branches {
                    if check_condition(condition, response, key, diagnostics) {
                        return self.evaluate(then, response, key, diagnostics).await;
                    }
                }
                Ok(rule.default.clone())
            }
            ComplexRule::Array(rule) => {
                self.evaluate_array(rule, response, key, diagnostics).await
            }
            ComplexRule::Regex(rule) => Ok(evaluate_regex(rule, response)),
            ComplexRule::Computed(extractor) => extractor
                .call(response)
                .await
                .map_err(|e| e.to_string()),
        }
    }

    fn evaluate_path_rule(
        &self,
        rule: &PathRule,
        response: &Response,
        key: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Option<Value>, String> {
        let mut value = resolve_path(&rule.path, response);

        if let Some(transform) = &rule.transform {
            value = match value {
                Some(current) if !current.is_null() => {
                    Some(apply_transform(transform, current, response)?)
                }
                other => other,
            };
        }

        if let Some(filter) = &rule.filter {
            let keep = match (filter, value.as_ref()) {
                (_, None) => true,
                (ValueFilter::Custom(f), Some(current)) => f(current, response),
                (ValueFilter::When(condition), Some(current)) => check_condition(
                    condition,
                    &response.synthetic(current.clone()),
                    key,
                    diagnostics,
                ),
            };
            if !keep {
                value = Some(Value::Null);
            }
        }

        match value {
            None | Some(Value::Null) if rule.default.is_some() => Ok(rule.default.clone()),
            other => Ok(other),
        }
    }

    async fn evaluate_array(
        &self,
        rule: &ArrayRule,
        response: &Response,
        key: &str,
        diagnostics: &mut Vec<Diagnostic>,
    ) -> Result<Option<Value>, String> {
        let items = match resolve_path(&rule.path, response) {
            Some(Value::Array(items)) => items,
            _ => {
                return Ok(Some(
                    rule.default.clone().unwrap_or(Value::Array(Vec::new())),
                ))
            }
        };

        let mut selected = Vec::with_capacity(items.len());
        for item in items {
            let keep = match &rule.filter {
                Some(condition) => check_condition(
                    condition,
                    &response.synthetic(item.clone()),
                    key,
                    diagnostics,
                ),
                None => true,
            };
            if keep {
                selected.push(item);
            }
        }

        match &rule.projection {
            None => Ok(Some(Value::Array(selected))),
            Some(ArrayProjection::Find(condition)) => {
                for item in selected {
                    let element = response.synthetic(item);
                    if check_condition(condition, &element, key, diagnostics) {
                        return Ok(Some(element.data));
                    }
                }
                Ok(rule.default.clone())
            }
            Some(ArrayProjection::Pluck(path)) => Ok(Some(Value::Array(
                selected
                    .iter()
                    .map(|item| resolve_value(path, item).cloned().unwrap_or(Value::Null))
                    .collect(),
            ))),
            Some(ArrayProjection::Map(sub)) => {
                let mut mapped = Vec::with_capacity(selected.len());
                for item in selected {
                    let element = response.synthetic(item);
                    let value = self.evaluate(sub, &element, key, diagnostics).await?;
                    mapped.push(value.unwrap_or(Value::Null));
                }
                Ok(Some(Value::Array(mapped)))
            }
        }
    }
}

/// Evaluate a condition, treating evaluation errors as `false`.
pub(crate) fn check_condition(
    condition: &Condition,
    response: &Response,
    key: &str,
    diagnostics: &mut Vec<Diagnostic>,
) -> bool {
    match condition.evaluate(response) {
        Ok(result) => result,
        Err(message) => {
            warn!("condition in '{}' failed: {}", key, message);
            diagnostics.push(Diagnostic::new(key, format!("condition failed: {message}")));
            false
        }
    }
}

fn evaluate_regex(rule: &RegexRule, response: &Response) -> Option<Value> {
    let source = match &rule.source {
        Some(path) => resolve_path(path, response).map(|v| value_to_text(&v)),
        None => serde_json::to_string(response).ok(),
    };

    let captured = source.and_then(|text| {
        let caps = rule.pattern.captures(&text)?;
        let group = match &rule.group {
            RegexGroup::Index(idx) => caps.get(*idx),
            RegexGroup::Name(name) => caps.name(name),
        };
        group.map(|m| Value::String(m.as_str().to_string()))
    });

    captured.or_else(|| rule.default.clone())
}

fn apply_transform(
    transform: &ValueTransform,
    value: Value,
    response: &Response,
) -> Result<Value, String> {
    match transform {
        ValueTransform::Custom(f) => f(value, response).map_err(|e| e.to_string()),
        ValueTransform::Named(name) => named_transform(name, value),
    }
}

/// Built-in transforms addressable from scenario files.
fn named_transform(name: &str, value: Value) -> Result<Value, String> {
    let type_error = |value: &Value| format!("cannot apply '{name}' to {value}");

    match name {
        "number" => match value {
            Value::Number(n) => Ok(Value::Number(n)),
            Value::Bool(b) => Ok(Value::from(u8::from(b))),
            Value::String(s) => {
                let trimmed = s.trim();
                if let Ok(n) = trimmed.parse::<i64>() {
                    Ok(Value::from(n))
                } else {
                    trimmed
                        .parse::<f64>()
                        .ok()
                        .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
                        .ok_or_else(|| type_error(&Value::String(s.clone())))
                }
            }
            other => Err(type_error(&other)),
        },
        "integer" => {
            let number = named_transform("number", value)?;
            match number.as_i64() {
                Some(n) => Ok(Value::from(n)),
                None => number
                    .as_f64()
                    .map(|f| Value::from(f.trunc() as i64))
                    .ok_or_else(|| type_error(&number)),
            }
        }
        "string" => Ok(Value::String(value_to_text(&value))),
        "boolean" => Ok(Value::Bool(is_truthy(&value))),
        "uppercase" | "lowercase" | "trim" => {
            let s = value.as_str().ok_or_else(|| type_error(&value))?;
            Ok(Value::String(match name {
                "uppercase" => s.to_uppercase(),
                "lowercase" => s.to_lowercase(),
                _ => s.trim().to_string(),
            }))
        }
        "length" => match &value {
            Value::String(s) => Ok(Value::from(s.chars().count())),
            Value::Array(items) => Ok(Value::from(items.len())),
            Value::Object(map) => Ok(Value::from(map.len())),
            _ => Err(type_error(&value)),
        },
        "json" => {
            let s = value.as_str().ok_or_else(|| type_error(&value))?;
            serde_json::from_str(s).map_err(|e| format!("invalid JSON: {e}"))
        }
        "first" | "last" => {
            let items = value.as_array().ok_or_else(|| type_error(&value))?;
            let item = if name == "first" { items.first() } else { items.last() };
            Ok(item.cloned().unwrap_or(Value::Null))
        }
        _ => Err(format!("unknown transform '{name}'")),
    }
}

/// JavaScript-style truthiness of a JSON value.
pub(crate) fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

impl TryFrom<Value> for ExtractionSpec {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let map = match value {
            Value::Object(map) => map,
            other => return Err(format!("extract must be a mapping, got {other}")),
        };
        let entries = map
            .into_iter()
            .map(|(name, rule)| {
                ExtractionRule::from_value(rule)
                    .map(|rule| (name.clone(), rule))
                    .map_err(|e| format!("extract '{name}': {e}"))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }
}

impl ExtractionRule {
    /// Parse the data form of a rule.
    ///
    /// Malformed known keywords are errors; objects with no known
    /// keyword become [`ExtractionRule::Unsupported`].
    pub fn from_value(value: Value) -> Result<Self, String> {
        let map = match value {
            Value::String(path) => return Ok(ExtractionRule::Path(path)),
            Value::Object(map) => map,
            other => return Ok(ExtractionRule::Unsupported(other)),
        };

        let default = map.get("default").cloned();

        if let Some(multiple) = map.get("multiple") {
            let spec = ExtractionSpec::try_from(multiple.clone())?;
            return Ok(ExtractionRule::multiple(spec));
        }

        if let Some(branches) = map.get("conditional") {
            let branches = branches
                .as_array()
                .ok_or("'conditional' must be a list")?
                .iter()
                .map(parse_branch)
                .collect::<Result<Vec<_>, String>>()?;
            return Ok(ConditionalRule { branches, default }.into());
        }

        if let Some(array) = map.get("array") {
            return parse_array_rule(array, default).map(Into::into);
        }

        if let Some(regex) = map.get("regex") {
            return parse_regex_rule(regex, &map, default).map(Into::into);
        }

        if let Some(path) = map.get("path") {
            let path = path.as_str().ok_or("'path' must be a string")?;
            let transform = match map.get("transform") {
                None => None,
                Some(Value::String(name)) => Some(ValueTransform::Named(name.clone())),
                Some(other) => return Err(format!("'transform' must be a name, got {other}")),
            };
            let filter = map
                .get("filter")
                .map(Condition::from_value)
                .transpose()?
                .map(ValueFilter::When);
            return Ok(PathRule {
                path: path.to_string(),
                transform,
                filter,
                default,
            }
            .into());
        }

        if let Some(computed) = map.get("computed") {
            let name = computed
                .as_str()
                .ok_or("'computed' must name a registered extractor")?;
            return Ok(ExtractionRule::Path(name.to_string()));
        }

        Ok(ExtractionRule::Unsupported(Value::Object(map)))
    }
}

fn parse_branch(branch: &Value) -> Result<(Condition, ExtractionRule), String> {
    let cond = branch.get("if").ok_or("conditional branch needs 'if'")?;
    let then = branch.get("then").ok_or("conditional branch needs 'then'")?;
    Ok((
        Condition::from_value(cond)?,
        ExtractionRule::from_value(then.clone())?,
    ))
}

fn parse_array_rule(array: &Value, default: Option<Value>) -> Result<ArrayRule, String> {
    let map = array.as_object().ok_or("'array' must be a mapping")?;
    let path = match map.get("path") {
        None => "data".to_string(),
        Some(Value::String(path)) => path.clone(),
        Some(other) => return Err(format!("array 'path' must be a string, got {other}")),
    };
    let filter = map.get("filter").map(Condition::from_value).transpose()?;
    let projection = if let Some(rule) = map.get("map") {
        Some(ArrayProjection::Map(Box::new(ExtractionRule::from_value(
            rule.clone(),
        )?)))
    } else if let Some(cond) = map.get("find") {
        Some(ArrayProjection::Find(Condition::from_value(cond)?))
    } else if let Some(path) = map.get("pluck") {
        let path = path.as_str().ok_or("'pluck' must be a path string")?;
        Some(ArrayProjection::Pluck(path.to_string()))
    } else {
        None
    };
    Ok(ArrayRule {
        path,
        filter,
        projection,
        default: default.or_else(|| map.get("default").cloned()),
    })
}

fn parse_regex_rule(
    regex: &Value,
    outer: &Map<String, Value>,
    default: Option<Value>,
) -> Result<RegexRule, String> {
    // Either `regex: "<pattern>"` with siblings, or a nested mapping.
    let (pattern, options) = match regex {
        Value::String(pattern) => (pattern.as_str(), outer),
        Value::Object(inner) => (
            inner
                .get("pattern")
                .and_then(Value::as_str)
                .ok_or("regex needs a 'pattern'")?,
            inner,
        ),
        other => return Err(format!("'regex' must be a pattern, got {other}")),
    };

    let mut rule = RegexRule::new(pattern).map_err(|e| format!("invalid regex: {e}"))?;
    match options.get("group") {
        None => {}
        Some(Value::Number(n)) => {
            let idx = n.as_u64().ok_or("regex 'group' must be a non-negative index")?;
            rule = rule.group(idx as usize);
        }
        Some(Value::String(name)) => rule = rule.named_group(name.clone()),
        Some(other) => return Err(format!("invalid regex group: {other}")),
    }
    if let Some(source) = options.get("source") {
        let source = source.as_str().ok_or("regex 'source' must be a path")?;
        rule = rule.source(source);
    }
    rule.default = default.or_else(|| options.get("default").cloned());
    Ok(rule)
}

/// `id`, `token`, `location`, `status`, `statusText`, `contentType`,
/// `headers`, `body`, `count`, `ids` and `firstId`.
pub fn builtin_extractors() -> ExtractorTable {
    let mut table = ExtractorTable::new();

    let mut add = |name: &str, f: fn(&Response) -> Option<Value>| {
        table.insert(name.to_string(), CustomExtractor::Lookup(f));
    };

    add("id", |r| resolve_path("id", r).filter(|v| !v.is_null()));
    add("token", |r| {
        ["token", "access_token", "accessToken", "auth.token"]
            .iter()
            .find_map(|path| resolve_path(path, r).filter(|v| !v.is_null()))
    });
    add("location", |r| r.header("location").map(|v| Value::String(v.to_string())));
    add("status", |r| Some(Value::from(r.status)));
    add("statusText", |r| Some(Value::String(r.status_text.clone())));
    add("contentType", |r| {
        r.header("content-type").map(|v| Value::String(v.to_string()))
    });
    add("headers", |r| {
        Some(Value::Object(
            r.headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ))
    });
    add("body", |r| Some(r.data.clone()));
    add("count", |r| match &r.data {
        Value::Array(items) => Some(Value::from(items.len())),
        Value::Object(map) => map
            .get("items")
            .or_else(|| map.get("data"))
            .and_then(Value::as_array)
            .map(|items| Value::from(items.len())),
        _ => None,
    });
    add("ids", |r| match &r.data {
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .filter_map(|item| item.get("id").cloned())
                .collect(),
        )),
        _ => Some(Value::Array(Vec::new())),
    });
    add("firstId", |r| resolve_path("[0].id", r).filter(|v| !v.is_null()));

    table
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use serde_json::json;

    fn response(data: Value) -> Response {
        Response::new(200)
            .with_header("Content-Type", "application/json")
            .with_header("Location", "/items/42")
            .with_data(data)
    }

    async fn run(spec: &ExtractionSpec, response: &Response) -> Extraction {
        let table = builtin_extractors();
        Extractor::new(&table).extract(spec, response).await
    }

    fn spec(value: Value) -> ExtractionSpec {
        ExtractionSpec::try_from(value).unwrap()
    }

    #[tokio::test]
    async fn test_path_and_builtin_rules() {
        let res = response(json!({"id": "abc", "user": {"name": "kim"}}));
        let out = run(
            &spec(json!({
                "id": "data.id",
                "name": "user.name",
                "where": "location",
                "code": "status"
            })),
            &res,
        )
        .await;
        assert_eq!(
            out.values,
            spec_ctx(json!({"id": "abc", "name": "kim", "where": "/items/42", "code": 200}))
        );
        assert!(out.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_failing_entry_is_isolated() {
        let res = response(json!({"id": "abc"}));
        let spec = ExtractionSpec::new()
            .with("boom", ExtractionRule::custom(|_| Err(anyhow!("kaboom"))))
            .with("id", "data.id");
        let out = run(&spec, &res).await;

        assert_eq!(out.values.get("id"), Some(&json!("abc")));
        assert!(!out.values.contains_key("boom"));
        assert_eq!(out.diagnostics.len(), 1);
        assert_eq!(out.diagnostics[0].key, "boom");
        assert!(out.diagnostics[0].message.contains("kaboom"));
    }

    #[tokio::test]
    async fn test_unresolved_path_is_absent() {
        let out = run(&spec(json!({"missing": "a.b.c"})), &response(json!({}))).await;
        assert!(out.values.is_empty());
        assert!(out.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn test_path_rule_transform_filter_default() {
        let res = response(json!({"price": "12", "name": " Bob ", "age": 15}));
        let out = run(
            &spec(json!({
                "price": {"path": "price", "transform": "number"},
                "name": {"path": "name", "transform": "trim"},
                "adult": {
                    "path": "age",
                    "filter": {"path": "data", "equals": 18},
                    "default": "minor"
                },
                "fallback": {"path": "nope", "default": 0}
            })),
            &res,
        )
        .await;
        assert_eq!(
            out.values,
            spec_ctx(json!({"price": 12, "name": "Bob", "adult": "minor", "fallback": 0}))
        );
    }

    #[tokio::test]
    async fn test_custom_transform_and_filter() {
        let res = response(json!({"n": 4}));
        let spec = ExtractionSpec::new()
            .with(
                "doubled",
                PathRule::new("n").transform_with(|v, _| {
                    Ok(json!(v.as_i64().unwrap_or(0) * 2))
                }),
            )
            .with(
                "odd",
                PathRule::new("n").filter_with(|v, _| v.as_i64() == Some(3)),
            );
        let out = run(&spec, &res).await;
        assert_eq!(out.values.get("doubled"), Some(&json!(8)));
        assert_eq!(out.values.get("odd"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn test_unknown_transform_is_entry_failure() {
        let out = run(
            &spec(json!({"x": {"path": "a", "transform": "reverse"}, "a": "a"})),
            &response(json!({"a": "s"})),
        )
        .await;
        assert_eq!(out.values, spec_ctx(json!({"a": "s"})));
        assert_eq!(out.diagnostics[0].key, "x");
    }

    #[tokio::test]
    async fn test_multiple_builds_nested_mapping() {
        let res = response(json!({"user": {"id": 1, "email": "a@b.c"}}));
        let out = run(
            &spec(json!({
                "user": {"multiple": {"id": "user.id", "email": "user.email", "gone": "user.x"}}
            })),
            &res,
        )
        .await;
        assert_eq!(out.values.get("user"), Some(&json!({"id": 1, "email": "a@b.c"})));
    }

    #[tokio::test]
    async fn test_conditional_first_match_wins() {
        let res = response(json!({"kind": "premium", "discount": 20}));
        let rule = json!({
            "conditional": [
                {"if": {"status": 404}, "then": "missing"},
                {"if": {"path": "kind", "equals": "premium"}, "then": "discount"},
                {"if": {"statusRange": [200, 299]}, "then": "kind"}
            ],
            "default": 0
        });
        let out = run(&spec(json!({"d": rule.clone()})), &res).await;
        assert_eq!(out.values.get("d"), Some(&json!(20)));

        let other = Response::new(500).with_data(json!({}));
        let out = run(&spec(json!({"d": rule})), &other).await;
        assert_eq!(out.values.get("d"), Some(&json!(0)));
    }

    #[tokio::test]
    async fn test_bad_condition_pattern_counts_as_false() {
        let res = response(json!({"a": "x"}));
        let out = run(
            &spec(json!({
                "v": {
                    "conditional": [{"if": {"path": "a", "matches": "("}, "then": "a"}],
                    "default": "none"
                }
            })),
            &res,
        )
        .await;
        assert_eq!(out.values.get("v"), Some(&json!("none")));
        assert_eq!(out.diagnostics.len(), 1);
    }

    #[tokio::test]
    async fn test_array_operations() {
        let res = response(json!({"items": [
            {"id": 1, "name": "a", "active": true},
            {"id": 2, "name": "b", "active": false},
            {"id": 3, "name": "c", "active": true}
        ]}));
        let out = run(
            &spec(json!({
                "names": {"array": {"path": "data.items", "map": "name"}},
                "active": {"array": {"path": "items", "filter": {"path": "active", "equals": true}, "pluck": "id"}},
                "second": {"array": {"path": "items", "find": {"path": "id", "equals": 2}}},
                "none": {"array": {"path": "items", "find": {"path": "id", "equals": 9}}, "default": "nope"},
                "notArray": {"array": {"path": "items[0]"}}
            })),
            &res,
        )
        .await;
        assert_eq!(out.values.get("names"), Some(&json!(["a", "b", "c"])));
        assert_eq!(out.values.get("active"), Some(&json!([1, 3])));
        assert_eq!(
            out.values.get("second"),
            Some(&json!({"id": 2, "name": "b", "active": false}))
        );
        assert_eq!(out.values.get("none"), Some(&json!("nope")));
        assert_eq!(out.values.get("notArray"), Some(&json!([])));
    }

    #[tokio::test]
    async fn test_regex_rule() {
        let res = response(json!({"message": "order #8812 created"}));
        let out = run(
            &spec(json!({
                "order": {"regex": "#(\\d+)", "group": 1, "source": "message"},
                "whole": {"regex": {"pattern": "\\d+", "source": "message"}},
                "named": {"regex": "order #(?P<num>\\d+)", "group": "num"},
                "miss": {"regex": "zzz", "default": "none"}
            })),
            &res,
        )
        .await;
        assert_eq!(out.values.get("order"), Some(&json!("8812")));
        assert_eq!(out.values.get("whole"), Some(&json!("8812")));
        assert_eq!(out.values.get("named"), Some(&json!("8812")));
        assert_eq!(out.values.get("miss"), Some(&json!("none")));
    }

    #[test]
    fn test_invalid_regex_rejected_at_parse() {
        assert!(ExtractionSpec::try_from(json!({"x": {"regex": "("}})).is_err());
    }

    #[tokio::test]
    async fn test_computed_and_async_custom() {
        let res = response(json!({"a": 2, "b": 3}));
        let spec = ExtractionSpec::new()
            .with(
                "sum",
                ExtractionRule::computed(|r| {
                    Ok(json!(r.data["a"].as_i64().unwrap_or(0) + r.data["b"].as_i64().unwrap_or(0)))
                }),
            )
            .with(
                "later",
                CustomExtractor::from_async(|r: Response| async move {
                    Ok::<_, anyhow::Error>(r.data["a"].clone())
                }),
            );
        let out = run(&spec, &res).await;
        assert_eq!(out.values.get("sum"), Some(&json!(5)));
        assert_eq!(out.values.get("later"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn test_unsupported_shape_skipped() {
        let out = run(
            &spec(json!({"odd": {"what": 1}, "num": 5, "id": "id"})),
            &response(json!({"id": 7})),
        )
        .await;
        assert_eq!(out.values, spec_ctx(json!({"id": 7})));
        let keys: Vec<&str> = out.diagnostics.iter().map(|d| d.key.as_str()).collect();
        assert_eq!(keys, vec!["odd", "num"]);
    }

    #[tokio::test]
    async fn test_builtin_token_and_count() {
        let res = response(json!({"access_token": "t0k", "items": [1, 2, 3]}));
        let out = run(&spec(json!({"t": "token", "n": "count"})), &res).await;
        assert_eq!(out.values, spec_ctx(json!({"t": "t0k", "n": 3})));
    }

    #[tokio::test]
    async fn test_builtin_misses_leave_keys_absent() {
        let res = Response::new(200).with_data(json!({"other": 1}));
        let out = run(
            &spec(json!({
                "id": "id",
                "t": "token",
                "where": "location",
                "type": "contentType",
                "n": "count",
                "first": "firstId",
                "code": "status"
            })),
            &res,
        )
        .await;
        assert_eq!(out.values, spec_ctx(json!({"code": 200})));
        assert!(out.diagnostics.is_empty());
    }

    #[test]
    fn test_condition_forms() {
        let res = response(json!({"name": "alice", "n": 1.0}));
        let eval = |v: Value| Condition::from_value(&v).unwrap().evaluate(&res).unwrap();
        assert!(eval(json!({"path": "name", "equals": "alice"})));
        assert!(eval(json!({"path": "n", "equals": 1})));
        assert!(eval(json!({"path": "name", "notEquals": "bob"})));
        assert!(eval(json!({"path": "name", "matches": "^al"})));
        assert!(eval(json!({"path": "name", "exists": true})));
        assert!(eval(json!({"path": "age", "exists": false})));
        assert!(eval(json!({"status": 200})));
        assert!(!eval(json!({"statusRange": [400, 499]})));
        assert!(Condition::from_value(&json!({"path": "x"})).is_err());
    }

    fn spec_ctx(value: Value) -> Context {
        match value {
            Value::Object(map) => map,
            _ => Context::new(),
        }
    }
}
