//! Response validation.
//!
//! A [`ValidationSpec`] is a predicate over a [`Response`]. Errors
//! raised while evaluating one are reported as diagnostics and count
//! as a failed validation; they never escape [`Validator::validate`].

use crate::error::Diagnostic;
use crate::extractor::{is_truthy, loose_eq, value_to_text};
use crate::model::Response;
use crate::path::resolve_path;
use crate::schema::{validate_schema, Schema};
use anyhow::Result;
use futures::future::{BoxFuture, FutureExt};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// Nesting limit for named references, guarding against cycles.
const MAX_DEPTH: usize = 32;

type SyncPredicateFn = dyn Fn(&Response) -> Result<Value> + Send + Sync;
type AsyncPredicateFn =
    dyn Fn(Response) -> BoxFuture<'static, Result<Value>> + Send + Sync;

/// A user-supplied predicate. Results that are not booleans are
/// coerced by truthiness.
#[derive(Clone)]
pub enum Predicate {
    Sync(Arc<SyncPredicateFn>),
    Async(Arc<AsyncPredicateFn>),
}

impl Predicate {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        Predicate::Sync(Arc::new(move |r| Ok(Value::Bool(f(r)))))
    }

    /// A predicate that may fail or return a non-boolean value.
    pub fn fallible<F>(f: F) -> Self
    where
        F: Fn(&Response) -> Result<Value> + Send + Sync + 'static,
    {
        Predicate::Sync(Arc::new(f))
    }

    pub fn from_async<F, Fut>(f: F) -> Self
    where
        F: Fn(Response) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Predicate::Async(Arc::new(move |response| f(response).boxed()))
    }

    async fn call(&self, response: &Response) -> Result<Value> {
        match self {
            Predicate::Sync(f) => f(response),
            Predicate::Async(f) => f(response.clone()).await,
        }
    }
}

impl fmt::Debug for Predicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Predicate::Sync(_) => f.write_str("Predicate::Sync(<fn>)"),
            Predicate::Async(_) => f.write_str("Predicate::Async(<fn>)"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "Value")]
pub enum ValidationSpec {
    Predicate(Predicate),
    /// Reference to a registered validator.
    Named(String),
    /// Object form: every entry must pass, checked in order.
    All(Vec<(String, ValidationSpec)>),
    Check(Check),
    And(Vec<ValidationSpec>),
    Or(Vec<ValidationSpec>),
    Not(Box<ValidationSpec>),
}

/// Parameterised built-in checks.
#[derive(Debug, Clone)]
pub enum Check {
    Status(u16),
    StatusIn(Vec<u16>),
    StatusRange(u16, u16),
    ContentType(String),
    HasField(String),
    FieldEquals(String, Value),
    FieldMatches(String, Regex),
    ArrayLength(String, usize),
    ArrayNotEmpty(String),
    HasHeader(String),
    HeaderEquals(String, String),
    Schema(Box<Schema>),
}

impl Check {
    fn evaluate(&self, response: &Response) -> Result<(), String> {
        let ensure = |ok: bool, message: String| if ok { Ok(()) } else { Err(message) };

        match self {
            Check::Status(code) => ensure(
                response.status == *code,
                format!("expected status {code}, got {}", response.status),
            ),
            Check::StatusIn(codes) => ensure(
                codes.contains(&response.status),
                format!("expected status in {codes:?}, got {}", response.status),
            ),
            Check::StatusRange(min, max) => ensure(
                (*min..=*max).contains(&response.status),
                format!("expected status {min}..={max}, got {}", response.status),
            ),
            Check::ContentType(expected) => {
                let actual = response.header("content-type").unwrap_or_default();
                ensure(
                    actual.to_ascii_lowercase().contains(&expected.to_ascii_lowercase()),
                    format!("expected content-type '{expected}', got '{actual}'"),
                )
            }
            Check::HasField(path) => ensure(
                resolve_path(path, response).is_some(),
                format!("field '{path}' is missing"),
            ),
            Check::FieldEquals(path, expected) => match resolve_path(path, response) {
                Some(actual) => ensure(
                    loose_eq(&actual, expected),
                    format!("field '{path}' is {actual}, expected {expected}"),
                ),
                None => Err(format!("field '{path}' is missing")),
            },
            Check::FieldMatches(path, re) => match resolve_path(path, response) {
                Some(actual) => ensure(
                    re.is_match(&value_to_text(&actual)),
                    format!("field '{path}' ({actual}) does not match /{re}/"),
                ),
                None => Err(format!("field '{path}' is missing")),
            },
            Check::ArrayLength(path, expected) => match resolve_path(path, response) {
                Some(Value::Array(items)) => ensure(
                    items.len() == *expected,
                    format!("'{path}' has {} items, expected {expected}", items.len()),
                ),
                _ => Err(format!("'{path}' is not an array")),
            },
            Check::ArrayNotEmpty(path) => match resolve_path(path, response) {
                Some(Value::Array(items)) => {
                    ensure(!items.is_empty(), format!("'{path}' is empty"))
                }
                _ => Err(format!("'{path}' is not an array")),
            },
            Check::HasHeader(name) => ensure(
                response.header(name).is_some(),
                format!("header '{name}' is missing"),
            ),
            Check::HeaderEquals(name, expected) => match response.header(name) {
                Some(actual) => ensure(
                    actual == expected,
                    format!("header '{name}' is '{actual}', expected '{expected}'"),
                ),
                None => Err(format!("header '{name}' is missing")),
            },
            Check::Schema(schema) => {
                validate_schema(schema, &response.data).map_err(|v| v.to_string())
            }
        }
    }
}

impl From<Check> for ValidationSpec {
    fn from(check: Check) -> Self {
        ValidationSpec::Check(check)
    }
}

impl From<Predicate> for ValidationSpec {
    fn from(predicate: Predicate) -> Self {
        ValidationSpec::Predicate(predicate)
    }
}

impl From<&str> for ValidationSpec {
    fn from(name: &str) -> Self {
        ValidationSpec::Named(name.to_string())
    }
}

/// Named validators, built-in and registered.
pub type ValidatorTable = HashMap<String, ValidationSpec>;

/// Outcome of a validation, with the reasons it failed.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Validation {
    pub passed: bool,
    pub diagnostics: Vec<Diagnostic>,
}

impl Validation {
    /// Failure summary for error messages.
    pub fn reason(&self) -> String {
        self.diagnostics
            .last()
            .map(ToString::to_string)
            .unwrap_or_else(|| "validator returned false".to_string())
    }
}

pub struct Validator<'a> {
    validators: &'a ValidatorTable,
}

impl<'a> Validator<'a> {
    pub fn new(validators: &'a ValidatorTable) -> Self {
        Self { validators }
    }

    pub async fn validate(&self, spec: &ValidationSpec, response: &Response) -> Validation {
        let mut diagnostics = Vec::new();
        let passed = self
            .evaluate(spec, response, "validate", 0, &mut diagnostics)
            .await;
        Validation { passed, diagnostics }
    }

    /// Shorthand for `validate(..).await.passed`.
    pub async fn check(&self, spec: &ValidationSpec, response: &Response) -> bool {
        self.validate(spec, response).await.passed
    }

    fn evaluate<'b>(
        &'b self,
        spec: &'b ValidationSpec,
        response: &'b Response,
        key: &'b str,
        depth: usize,
        diagnostics: &'b mut Vec<Diagnostic>,
    ) -> BoxFuture<'b, bool> {
        async move {
            if depth > MAX_DEPTH {
                diagnostics.push(Diagnostic::new(key, "validator nesting too deep"));
                return false;
            }

            match spec {
                ValidationSpec::Predicate(predicate) => match predicate.call(response).await {
                    Ok(Value::Bool(result)) => {
                        if !result {
                            diagnostics.push(Diagnostic::new(key, "predicate returned false"));
                        }
                        result
                    }
                    Ok(other) => {
                        let result = is_truthy(&other);
                        warn!(
                            "validator '{}' returned non-boolean {}, treating as {}",
                            key, other, result
                        );
                        diagnostics.push(Diagnostic::new(
                            key,
                            format!("non-boolean result {other} coerced to {result}"),
                        ));
                        result
                    }
                    Err(e) => {
                        warn!("validator '{}' raised an error: {}", key, e);
                        diagnostics.push(Diagnostic::new(key, format!("error: {e}")));
                        false
                    }
                },
                ValidationSpec::Named(name) => match self.validators.get(name) {
                    Some(inner) => {
                        self.evaluate(inner, response, name, depth + 1, diagnostics)
                            .await
                    }
                    None => {
                        warn!("unknown validator '{}'", name);
                        diagnostics.push(Diagnostic::new(
                            name.as_str(),
                            "unknown validator",
                        ));
                        false
                    }
                },
                ValidationSpec::All(entries) => {
                    for (name, inner) in entries {
                        let before = diagnostics.len();
                        if !self
                            .evaluate(inner, response, name, depth + 1, diagnostics)
                            .await
                        {
                            debug!("validation key '{}' failed", name);
                            let message = match diagnostics[before..].last() {
                                Some(cause) if cause.key == *name => {
                                    format!("validation '{name}' failed: {}", cause.message)
                                }
                                Some(cause) => format!("validation '{name}' failed: {cause}"),
                                None => format!("validation '{name}' failed"),
                            };
                            diagnostics.push(Diagnostic::new(name.as_str(), message));
                            return false;
                        }
                    }
                    true
                }
                ValidationSpec::Check(check) => match check.evaluate(response) {
                    Ok(()) => true,
                    Err(message) => {
                        diagnostics.push(Diagnostic::new(key, message));
                        false
                    }
                },
                ValidationSpec::And(specs) => {
                    for inner in specs {
                        if !self.evaluate(inner, response, key, depth + 1, diagnostics).await {
                            return false;
                        }
                    }
                    true
                }
                ValidationSpec::Or(specs) => {
                    let mut failures = Vec::new();
                    for inner in specs {
                        if self.evaluate(inner, response, key, depth + 1, &mut failures).await {
                            return true;
                        }
                    }
                    diagnostics.extend(failures);
                    diagnostics.push(Diagnostic::new(key, "no alternative passed"));
                    false
                }
                ValidationSpec::Not(inner) => {
                    let mut ignored = Vec::new();
                    let result = self
                        .evaluate(inner, response, key, depth + 1, &mut ignored)
                        .await;
                    if result {
                        diagnostics.push(Diagnostic::new(key, "negated validation passed"));
                    }
                    !result
                }
            }
        }
        .boxed()
    }
}

impl TryFrom<Value> for ValidationSpec {
    type Error = String;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::String(name) => Ok(ValidationSpec::Named(name)),
            Value::Object(map) => {
                if map.len() == 1 {
                    if let Some((key, arg)) = map.iter().next() {
                        if let Some(spec) = parse_keyword(key, arg)? {
                            return Ok(spec);
                        }
                    }
                }
                let entries = map
                    .into_iter()
                    .map(|(name, inner)| {
                        ValidationSpec::try_from(inner)
                            .map(|spec| (name.clone(), spec))
                            .map_err(|e| format!("validate '{name}': {e}"))
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ValidationSpec::All(entries))
            }
            other => Err(format!(
                "validate must be a validator name or mapping, got {other}"
            )),
        }
    }
}

/// Single-key objects naming a built-in check, e.g. `{status: 201}`.
fn parse_keyword(key: &str, arg: &Value) -> Result<Option<ValidationSpec>, String> {
    let text = |what: &str| {
        arg.as_str()
            .map(str::to_string)
            .ok_or_else(|| format!("'{key}' expects {what}, got {arg}"))
    };
    let field = |name: &str| {
        arg.get(name)
            .cloned()
            .ok_or_else(|| format!("'{key}' needs '{name}'"))
    };
    let status = |v: &Value| {
        v.as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| format!("invalid status code: {v}"))
    };
    let list = |v: &Value| -> Result<Vec<ValidationSpec>, String> {
        v.as_array()
            .ok_or_else(|| format!("'{key}' expects a list"))?
            .iter()
            .cloned()
            .map(ValidationSpec::try_from)
            .collect()
    };

    let spec = match key {
        "status" => match arg {
            Value::Array(codes) => Check::StatusIn(
                codes.iter().map(status).collect::<Result<_, _>>()?,
            )
            .into(),
            other => Check::Status(status(other)?).into(),
        },
        "statusRange" => {
            let bounds = arg
                .as_array()
                .filter(|b| b.len() == 2)
                .ok_or("statusRange must be [min, max]")?;
            Check::StatusRange(status(&bounds[0])?, status(&bounds[1])?).into()
        }
        "contentType" => Check::ContentType(text("a string")?).into(),
        "hasField" => Check::HasField(text("a path")?).into(),
        "fieldEquals" => Check::FieldEquals(
            field("path")?.as_str().ok_or("'path' must be a string")?.to_string(),
            field("value")?,
        )
        .into(),
        "fieldMatches" => {
            let path = field("path")?;
            let pattern = field("pattern")?;
            let re = Regex::new(pattern.as_str().ok_or("'pattern' must be a string")?)
                .map_err(|e| format!("invalid pattern: {e}"))?;
            Check::FieldMatches(
                path.as_str().ok_or("'path' must be a string")?.to_string(),
                re,
            )
            .into()
        }
        "arrayLength" => {
            let path = field("path")?;
            let length = field("length")?;
            Check::ArrayLength(
                path.as_str().ok_or("'path' must be a string")?.to_string(),
                length.as_u64().ok_or("'length' must be a number")? as usize,
            )
            .into()
        }
        "arrayNotEmpty" => Check::ArrayNotEmpty(text("a path")?).into(),
        "hasHeader" => Check::HasHeader(text("a header name")?).into(),
        "headerEquals" => {
            let name = field("name")?;
            let value = field("value")?;
            Check::HeaderEquals(
                name.as_str().ok_or("'name' must be a string")?.to_string(),
                value_to_text(&value),
            )
            .into()
        }
        "schema" => {
            let schema: Schema = serde_json::from_value(arg.clone())
                .map_err(|e| format!("invalid schema: {e}"))?;
            Check::Schema(Box::new(schema)).into()
        }
        "and" => ValidationSpec::And(list(arg)?),
        "or" => ValidationSpec::Or(list(arg)?),
        "not" => ValidationSpec::Not(Box::new(ValidationSpec::try_from(arg.clone())?)),
        _ => return Ok(None),
    };
    Ok(Some(spec))
}

/// Builders for the built-in validator library.
pub mod validators {
    use super::*;

    pub fn status(code: u16) -> ValidationSpec {
        Check::Status(code).into()
    }

    pub fn status_in(codes: &[u16]) -> ValidationSpec {
        Check::StatusIn(codes.to_vec()).into()
    }

    pub fn status_range(min: u16, max: u16) -> ValidationSpec {
        Check::StatusRange(min, max).into()
    }

    pub fn success() -> ValidationSpec {
        status_range(200, 299)
    }

    pub fn ok() -> ValidationSpec {
        status(200)
    }

    pub fn created() -> ValidationSpec {
        status(201)
    }

    pub fn no_content() -> ValidationSpec {
        status(204)
    }

    pub fn bad_request() -> ValidationSpec {
        status(400)
    }

    pub fn unauthorized() -> ValidationSpec {
        status(401)
    }

    pub fn forbidden() -> ValidationSpec {
        status(403)
    }

    pub fn not_found() -> ValidationSpec {
        status(404)
    }

    pub fn client_error() -> ValidationSpec {
        status_range(400, 499)
    }

    pub fn server_error() -> ValidationSpec {
        status_range(500, 599)
    }

    pub fn content_type(expected: &str) -> ValidationSpec {
        Check::ContentType(expected.to_string()).into()
    }

    pub fn is_json() -> ValidationSpec {
        content_type("application/json")
    }

    pub fn has_field(path: &str) -> ValidationSpec {
        Check::HasField(path.to_string()).into()
    }

    pub fn field_equals(path: &str, value: Value) -> ValidationSpec {
        Check::FieldEquals(path.to_string(), value).into()
    }

    pub fn field_matches(path: &str, pattern: &str) -> Result<ValidationSpec, regex::Error> {
        Ok(Check::FieldMatches(path.to_string(), Regex::new(pattern)?).into())
    }

    pub fn array_length(path: &str, length: usize) -> ValidationSpec {
        Check::ArrayLength(path.to_string(), length).into()
    }

    pub fn array_not_empty(path: &str) -> ValidationSpec {
        Check::ArrayNotEmpty(path.to_string()).into()
    }

    pub fn has_header(name: &str) -> ValidationSpec {
        Check::HasHeader(name.to_string()).into()
    }

    pub fn header_equals(name: &str, value: &str) -> ValidationSpec {
        Check::HeaderEquals(name.to_string(), value.to_string()).into()
    }

    pub fn schema(schema: Schema) -> ValidationSpec {
        Check::Schema(Box::new(schema)).into()
    }

    pub fn predicate<F>(f: F) -> ValidationSpec
    where
        F: Fn(&Response) -> bool + Send + Sync + 'static,
    {
        Predicate::new(f).into()
    }

    pub fn and(a: ValidationSpec, b: ValidationSpec) -> ValidationSpec {
        ValidationSpec::And(vec![a, b])
    }

    pub fn or(a: ValidationSpec, b: ValidationSpec) -> ValidationSpec {
        ValidationSpec::Or(vec![a, b])
    }

    pub fn not(spec: ValidationSpec) -> ValidationSpec {
        ValidationSpec::Not(Box::new(spec))
    }

    pub fn all(specs: Vec<ValidationSpec>) -> ValidationSpec {
        ValidationSpec::And(specs)
    }

    pub fn any(specs: Vec<ValidationSpec>) -> ValidationSpec {
        ValidationSpec::Or(specs)
    }
}

/// Validators addressable by name from scenario files.
pub fn builtin_validators() -> ValidatorTable {
    use validators::*;

    let mut table = ValidatorTable::new();
    table.insert("success".into(), success());
    table.insert("ok".into(), ok());
    table.insert("created".into(), created());
    table.insert("noContent".into(), no_content());
    table.insert("badRequest".into(), bad_request());
    table.insert("unauthorized".into(), unauthorized());
    table.insert("forbidden".into(), forbidden());
    table.insert("notFound".into(), not_found());
    table.insert("clientError".into(), client_error());
    table.insert("serverError".into(), server_error());
    table.insert("json".into(), is_json());
    table.insert(
        "hasData".into(),
        predicate(|r| !r.data.is_null()),
    );
    table
}
