//! Single step execution: substitute, dispatch (or simulate),
//! validate, extract.

use crate::config::RunnerConfig;
use crate::error::{Diagnostic, StepError};
use crate::extractor::Extractor;
use crate::model::{Context, Request, Response, Step};
use crate::registry::Registry;
use crate::template::{substitute, substitute_str};
use crate::transport::Transport;
use crate::validator::Validator;
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::json;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// What a successful step produced.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub response: Option<Response>,
    /// Variables merged into the context.
    pub extracted: Context,
    pub diagnostics: Vec<Diagnostic>,
}

/// A fatal step error together with whatever the step got to see
/// before failing.
#[derive(Debug)]
pub struct StepFailure {
    pub error: StepError,
    pub response: Option<Response>,
    pub diagnostics: Vec<Diagnostic>,
}

impl From<StepError> for StepFailure {
    fn from(error: StepError) -> Self {
        Self {
            error,
            response: None,
            diagnostics: Vec::new(),
        }
    }
}

/// Executes steps of a custom type in place of the HTTP pipeline.
///
/// The returned `extracted` values are merged into the context by the
/// executor.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn handle(&self, step: &Step, context: &Context) -> Result<StepOutcome>;
}

type HandlerFn =
    dyn for<'a> Fn(&'a Step, &'a Context) -> BoxFuture<'a, Result<StepOutcome>> + Send + Sync;

/// Adapts an async closure into a [`StepHandler`].
#[derive(Clone)]
pub struct FnStepHandler(Arc<HandlerFn>);

impl FnStepHandler {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(&'a Step, &'a Context) -> BoxFuture<'a, Result<StepOutcome>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl StepHandler for FnStepHandler {
    async fn handle(&self, step: &Step, context: &Context) -> Result<StepOutcome> {
        (self.0)(step, context).await
    }
}

impl fmt::Debug for FnStepHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnStepHandler(<fn>)")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepPhase {
    Pending,
    Substituting,
    Simulating,
    Dispatching,
    Validating,
    Extracting,
    Done,
    Failed,
}

pub struct StepExecutor<'a> {
    config: &'a RunnerConfig,
    transport: &'a dyn Transport,
    registry: &'a Registry,
}

impl<'a> StepExecutor<'a> {
    pub fn new(
        config: &'a RunnerConfig,
        transport: &'a dyn Transport,
        registry: &'a Registry,
    ) -> Self {
        Self {
            config,
            transport,
            registry,
        }
    }

    /// Run one step against `context`, merging extracted values into
    /// it on success. On failure the context is left untouched.
    pub async fn execute(
        &self,
        step: &Step,
        context: &mut Context,
    ) -> Result<StepOutcome, StepFailure> {
        enter(step, StepPhase::Pending);

        let result = if step.is_http() {
            self.execute_http(step, context).await
        } else if let Some(handler) = self.registry.step_handler(step.kind()) {
            handler
                .handle(step, context)
                .await
                .map_err(|source| {
                    StepFailure::from(StepError::Handler {
                        step: step.name.clone(),
                        kind: step.kind().to_string(),
                        source,
                    })
                })
        } else {
            warn!(
                "No handler registered for step type '{}', running step '{}' as http",
                step.kind(),
                step.name
            );
            self.execute_http(step, context).await
        };

        match result {
            Ok(outcome) => {
                for (key, value) in &outcome.extracted {
                    context.insert(key.clone(), value.clone());
                }
                enter(step, StepPhase::Done);
                Ok(outcome)
            }
            Err(failure) => {
                enter(step, StepPhase::Failed);
                Err(failure)
            }
        }
    }

    async fn execute_http(
        &self,
        step: &Step,
        context: &Context,
    ) -> Result<StepOutcome, StepFailure> {
        enter(step, StepPhase::Substituting);
        let request = self.build_request(step, context)?;
        debug!("Request: {} {}", request.method, request.url);

        let response = if self.config.dry_run {
            enter(step, StepPhase::Simulating);
            simulate(step)
        } else {
            enter(step, StepPhase::Dispatching);
            self.transport
                .send(&request)
                .await
                .map_err(|source| StepError::Dispatch {
                    step: step.name.clone(),
                    source,
                })?
        };

        let mut diagnostics = Vec::new();

        if let Some(spec) = &step.validate {
            enter(step, StepPhase::Validating);
            let validation = Validator::new(self.registry.validators())
                .validate(spec, &response)
                .await;
            if !validation.passed {
                return Err(StepFailure {
                    error: StepError::Validation {
                        step: step.name.clone(),
                        reason: validation.reason(),
                    },
                    response: Some(response),
                    diagnostics: validation.diagnostics,
                });
            }
            diagnostics.extend(validation.diagnostics);
        }

        let mut extracted = Context::new();
        if let Some(spec) = &step.extract {
            enter(step, StepPhase::Extracting);
            let extraction = Extractor::new(self.registry.extractors())
                .extract(spec, &response)
                .await;
            extracted = extraction.values;
            diagnostics.extend(extraction.diagnostics);
        }

        Ok(StepOutcome {
            response: Some(response),
            extracted,
            diagnostics,
        })
    }

    fn build_request(&self, step: &Step, context: &Context) -> Result<Request, StepError> {
        let malformed = |reason: &str| StepError::Malformed {
            step: step.name.clone(),
            reason: reason.to_string(),
        };
        let method = step.method.ok_or_else(|| malformed("missing method"))?;
        let url = step
            .url
            .as_deref()
            .filter(|url| !url.is_empty())
            .ok_or_else(|| malformed("missing url"))?;

        let mut headers: HashMap<String, String> = self
            .config
            .headers
            .iter()
            .filter(|(name, _)| {
                !step.headers.keys().any(|own| own.eq_ignore_ascii_case(name))
            })
            .map(|(name, value)| (name.clone(), substitute_str(value, context)))
            .collect();
        for (name, value) in &step.headers {
            headers.insert(name.clone(), substitute_str(value, context));
        }

        let mut body = step
            .body
            .as_ref()
            .map(|template| substitute(template, context, self.registry.generators()));
        if let Some(transform) = &step.transform {
            body = Some(transform.apply(body.unwrap_or_default(), context));
        }

        Ok(Request {
            method,
            url: substitute_str(url, context),
            headers,
            body,
        })
    }
}

fn enter(step: &Step, phase: StepPhase) {
    debug!(step = %step.name, "step phase: {:?}", phase);
}

/// Synthetic response used in dry-run mode.
fn simulate(step: &Step) -> Response {
    Response::new(200)
        .with_header("content-type", "application/json")
        .with_data(json!({
            "id": uuid::Uuid::new_v4().to_string(),
            "message": format!("Simulated response for step '{}'", step.name),
            "simulated": true,
        }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::extractor::ExtractionSpec;
    use crate::model::HttpMethod;
    use crate::validator::validators;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingTransport {
        requests: Mutex<Vec<Request>>,
        response: Option<Response>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(&self, request: &Request) -> Result<Response, TransportError> {
            self.requests.lock().unwrap().push(request.clone());
            self.response
                .clone()
                .ok_or_else(|| TransportError::Network("connection refused".into()))
        }
    }

    fn ctx(value: serde_json::Value) -> Context {
        value.as_object().cloned().unwrap()
    }

    #[tokio::test]
    async fn test_request_substitution_and_header_merge() {
        let config = RunnerConfig::default()
            .with_header("Authorization", "Bearer {token}")
            .with_header("X-Default", "d");
        let transport = RecordingTransport {
            response: Some(Response::new(200)),
            ..Default::default()
        };
        let registry = Registry::with_builtins();
        let step = Step::http("get", HttpMethod::Put, "/users/{id}")
            .with_header("authorization", "Basic x")
            .with_body(json!({"name": "{name}", "id": "{id}"}))
            .with_transform(|mut body, context| {
                body["tag"] = context["name"].clone();
                body
            });
        let mut context = ctx(json!({"id": 7, "name": "kit", "token": "t"}));

        StepExecutor::new(&config, &transport, &registry)
            .execute(&step, &mut context)
            .await
            .unwrap();

        let sent = transport.requests.lock().unwrap()[0].clone();
        assert_eq!(sent.url, "/users/7");
        assert_eq!(sent.body, Some(json!({"name": "kit", "id": "7", "tag": "kit"})));
        assert_eq!(sent.headers.get("authorization").map(String::as_str), Some("Basic x"));
        assert!(!sent.headers.contains_key("Authorization"));
        assert_eq!(sent.headers.get("X-Default").map(String::as_str), Some("d"));
    }

    #[tokio::test]
    async fn test_dry_run_simulates_response() {
        let config = RunnerConfig::default().with_dry_run(true);
        let transport = RecordingTransport::default();
        let registry = Registry::with_builtins();
        let step = Step::http("create", HttpMethod::Post, "/items")
            .with_validate("json")
            .with_extract(ExtractionSpec::new().with("id", "id"));
        let mut context = Context::new();

        let outcome = StepExecutor::new(&config, &transport, &registry)
            .execute(&step, &mut context)
            .await
            .unwrap();

        assert!(transport.requests.lock().unwrap().is_empty());
        let response = outcome.response.unwrap();
        assert_eq!(response.status_text, "OK");
        assert_eq!(response.data["simulated"], json!(true));
        assert_eq!(
            response.data["message"],
            json!("Simulated response for step 'create'")
        );
        assert_eq!(context.get("id"), Some(&response.data["id"]));
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_context() {
        let config = RunnerConfig::default();
        let transport = RecordingTransport {
            response: Some(Response::new(404)),
            ..Default::default()
        };
        let registry = Registry::with_builtins();
        let step = Step::http("read", HttpMethod::Get, "/x")
            .with_validate(validators::ok())
            .with_extract(ExtractionSpec::new().with("status", "status"));
        let mut context = Context::new();

        let failure = StepExecutor::new(&config, &transport, &registry)
            .execute(&step, &mut context)
            .await
            .unwrap_err();

        assert!(matches!(failure.error, StepError::Validation { ref step, .. } if step == "read"));
        assert_eq!(failure.response.map(|r| r.status), Some(404));
        assert!(context.is_empty());
    }

    #[tokio::test]
    async fn test_transport_error_is_dispatch_failure() {
        let config = RunnerConfig::default();
        let transport = RecordingTransport::default();
        let registry = Registry::with_builtins();
        let step = Step::http("ping", HttpMethod::Get, "/ping");

        let failure = StepExecutor::new(&config, &transport, &registry)
            .execute(&step, &mut Context::new())
            .await
            .unwrap_err();
        assert!(matches!(
            failure.error,
            StepError::Dispatch { source: TransportError::Network(_), .. }
        ));
    }

    #[tokio::test]
    async fn test_unregistered_type_falls_back_to_http() {
        let config = RunnerConfig::default();
        let transport = RecordingTransport::default();
        let registry = Registry::with_builtins();
        let step = Step::custom("wait", "sleep");

        let failure = StepExecutor::new(&config, &transport, &registry)
            .execute(&step, &mut Context::new())
            .await
            .unwrap_err();
        assert!(matches!(failure.error, StepError::Malformed { .. }));
    }
}
