//! Tauon: sequential HTTP scenario runner.
//!
//! A [`Scenario`] is an ordered list of steps. Each step builds a
//! request from templates and the run context, sends it (or simulates
//! it in dry-run mode), validates the response and extracts variables
//! for later steps. The first failing step aborts the run.

pub mod config;
pub mod error;
pub mod executor;
pub mod extractor;
pub mod hooks;
pub mod model;
pub mod path;
pub mod registry;
pub mod reporter;
pub mod runner;
pub mod schema;
pub mod template;
pub mod transport;
pub mod validator;

pub use config::*;
pub use error::*;
pub use executor::{FnStepHandler, StepHandler, StepOutcome};
pub use extractor::{CustomExtractor, ExtractionRule, ExtractionSpec, Extractor};
pub use hooks::{FnMiddleware, HookEvent, HookPoint, Middleware};
pub use model::*;
pub use registry::Registry;
pub use reporter::{FileReporter, LogReporter, ReportFormat, Reporter};
pub use runner::*;
pub use schema::{Schema, SchemaType};
pub use template::Template;
pub use transport::{HttpTransport, Transport};
pub use validator::{validators, Predicate, ValidationSpec, Validator};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    struct Fixed(Response);

    #[async_trait::async_trait]
    impl Transport for Fixed {
        async fn send(&self, _request: &Request) -> Result<Response, TransportError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn test_yaml_scenario_end_to_end() {
        let yaml = r#"
name: users
vars:
  name: kit
steps:
  - name: create
    method: POST
    url: /users
    body:
      name: "{name}"
      ref: {func: uuid}
    validate:
      created: created
      hasId: {hasField: data.id}
    extract:
      userId: data.id
      upper:
        path: name
        transform: uppercase
"#;
        let scenario = Scenario::from_yaml(yaml).unwrap();
        let response = Response::new(201).with_data(json!({"id": "u_1", "name": "kit"}));
        let mut runner =
            ScenarioRunner::with_transport(RunnerConfig::default(), Arc::new(Fixed(response)));

        let report = runner.run(&scenario, Context::new()).await.unwrap();
        assert!(report.success);
        assert_eq!(report.context.get("userId"), Some(&json!("u_1")));
        assert_eq!(report.context.get("upper"), Some(&json!("KIT")));
        assert_eq!(report.summary.successful, 1);
    }
}
