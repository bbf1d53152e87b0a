//! Scenario, step and response data model.

use crate::config::RunnerConfig;
use crate::error::{Diagnostic, ScenarioError};
use crate::extractor::ExtractionSpec;
use crate::template::Template;
use crate::validator::ValidationSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Variables accumulated during a run, keyed by name.
pub type Context = Map<String, Value>;

/// The step type used when a step does not declare one.
pub const DEFAULT_STEP_TYPE: &str = "http";

/// A named, ordered sequence of steps.
#[derive(Debug, Clone, Deserialize)]
pub struct Scenario {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Tags for filtering and grouping scenarios.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Initial variables. Caller-supplied variables override these.
    #[serde(default)]
    pub vars: Context,
    /// Runner configuration declared next to the scenario.
    #[serde(default)]
    pub config: RunnerConfig,
    pub steps: Vec<Step>,
}

/// A single request-validate-extract unit of work.
#[derive(Debug, Clone, Deserialize)]
pub struct Step {
    pub name: String,
    /// Step type; `None` means [`DEFAULT_STEP_TYPE`].
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub method: Option<HttpMethod>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub body: Option<Template>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub validate: Option<ValidationSpec>,
    #[serde(default)]
    pub extract: Option<ExtractionSpec>,
    /// Rewrites the body after variable substitution. Only
    /// available when building steps in code.
    #[serde(skip)]
    pub transform: Option<BodyTransform>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
    Options,
}

impl HttpMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            HttpMethod::Get => "GET",
            HttpMethod::Post => "POST",
            HttpMethod::Put => "PUT",
            HttpMethod::Patch => "PATCH",
            HttpMethod::Delete => "DELETE",
            HttpMethod::Head => "HEAD",
            HttpMethod::Options => "OPTIONS",
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `transform(body, context) -> body`
#[derive(Clone)]
pub struct BodyTransform(
    Arc<dyn Fn(Value, &Context) -> Value + Send + Sync>,
);

impl BodyTransform {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(Value, &Context) -> Value + Send + Sync + 'static,
    {
        Self(Arc::new(f))
    }

    pub fn apply(&self, body: Value, context: &Context) -> Value {
        (self.0)(body, context)
    }
}

impl fmt::Debug for BodyTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BodyTransform(<fn>)")
    }
}

/// A fully substituted request handed to the transport.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Request {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
}

/// Response as seen by validators and extractors.
///
/// Header names are stored lower-cased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub data: Value,
}

impl Response {
    /// A response with the canonical reason phrase for `status` and
    /// no headers or data.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            status_text: canonical_reason(status).to_string(),
            headers: HashMap::new(),
            data: Value::Null,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_header(
        mut self,
        name: impl AsRef<str>,
        value: impl Into<String>,
    ) -> Self {
        self.headers
            .insert(name.as_ref().to_ascii_lowercase(), value.into());
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .get(&lower)
            .or_else(|| {
                self.headers
                    .iter()
                    .find(|(k, _)| k.eq_ignore_ascii_case(name))
                    .map(|(_, v)| v)
            })
            .map(String::as_str)
    }

    /// The same response with `data` replaced, used when array
    /// elements are evaluated as if they were whole responses.
    pub fn synthetic(&self, data: Value) -> Self {
        Self {
            status: self.status,
            status_text: self.status_text.clone(),
            headers: self.headers.clone(),
            data,
        }
    }
}

pub(crate) fn canonical_reason(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|code| code.canonical_reason())
        .unwrap_or("")
}

/// Outcome of one executed step. Never mutated after it is recorded.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    pub step: String,
    /// 1-based position in the scenario.
    pub index: usize,
    pub success: bool,
    pub response: Option<Response>,
    pub error: Option<String>,
    /// Variables this step merged into the context.
    pub extracted: Context,
    pub diagnostics: Vec<Diagnostic>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct RunSummary {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
}

impl RunSummary {
    pub fn from_results(results: &[StepResult]) -> Self {
        let successful = results.iter().filter(|r| r.success).count();
        Self {
            total: results.len(),
            successful,
            failed: results.len() - successful,
        }
    }
}

/// Bundle handed to reporters once a run ends.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub scenario_name: String,
    pub success: bool,
    pub error: Option<String>,
    pub results: Vec<StepResult>,
    pub context: Context,
    pub timestamp: String,
    pub summary: RunSummary,
    pub duration_ms: u64,
}

impl Scenario {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            description: None,
            tags: Vec::new(),
            vars: Context::new(),
            config: RunnerConfig::default(),
            steps,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.vars.insert(name.into(), value);
        self
    }

    /// Parse and structurally validate a YAML scenario.
    pub fn from_yaml(yaml: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_yaml::from_str(yaml)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Parse and structurally validate a JSON scenario.
    pub fn from_json(json: &str) -> Result<Self, ScenarioError> {
        let scenario: Self = serde_json::from_str(json)?;
        scenario.validate()?;
        Ok(scenario)
    }

    /// Check the invariants that must hold before a run starts.
    ///
    /// Steps of a non-default type are not required to carry a
    /// method or url; their handler decides what they need.
    pub fn validate(&self) -> Result<(), ScenarioError> {
        if self.name.trim().is_empty() {
            return Err(ScenarioError::MissingName);
        }
        if self.steps.is_empty() {
            return Err(ScenarioError::NoSteps(self.name.clone()));
        }
        for (idx, step) in self.steps.iter().enumerate() {
            let index = idx + 1;
            if step.name.trim().is_empty() {
                return Err(ScenarioError::MissingStepName { index });
            }
            if !step.is_http() {
                continue;
            }
            if step.method.is_none() {
                return Err(ScenarioError::MissingField {
                    index,
                    name: step.name.clone(),
                    field: "method",
                });
            }
            if step.url.as_deref().map_or(true, str::is_empty) {
                return Err(ScenarioError::MissingField {
                    index,
                    name: step.name.clone(),
                    field: "url",
                });
            }
        }
        Ok(())
    }
}

impl Step {
    /// An HTTP step with no body, validation or extraction.
    pub fn http(
        name: impl Into<String>,
        method: HttpMethod,
        url: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            kind: None,
            method: Some(method),
            url: Some(url.into()),
            body: None,
            headers: HashMap::new(),
            validate: None,
            extract: None,
            transform: None,
        }
    }

    /// A step handled by the custom step type `kind`.
    pub fn custom(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: Some(kind.into()),
            method: None,
            url: None,
            body: None,
            headers: HashMap::new(),
            validate: None,
            extract: None,
            transform: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Template>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_header(
        mut self,
        name: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_validate(mut self, spec: impl Into<ValidationSpec>) -> Self {
        self.validate = Some(spec.into());
        self
    }

    pub fn with_extract(mut self, spec: ExtractionSpec) -> Self {
        self.extract = Some(spec);
        self
    }

    pub fn with_transform<F>(mut self, f: F) -> Self
    where
        F: Fn(Value, &Context) -> Value + Send + Sync + 'static,
    {
        self.transform = Some(BodyTransform::new(f));
        self
    }

    /// The declared type, or [`DEFAULT_STEP_TYPE`].
    pub fn kind(&self) -> &str {
        self.kind.as_deref().unwrap_or(DEFAULT_STEP_TYPE)
    }

    pub fn is_http(&self) -> bool {
        self.kind() == DEFAULT_STEP_TYPE
    }
}
