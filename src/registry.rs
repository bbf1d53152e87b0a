//! Name-keyed capability registries owned by a runner.
//!
//! Registering under an existing name replaces the previous entry.

use crate::error::RegistryError;
use crate::executor::StepHandler;
use crate::extractor::{builtin_extractors, CustomExtractor, ExtractorTable};
use crate::hooks::{HookPoint, Middleware};
use crate::reporter::Reporter;
use crate::template::{builtin_generators, GeneratorFn, GeneratorTable};
use crate::validator::{builtin_validators, ValidationSpec, ValidatorTable};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct Registry {
    validators: ValidatorTable,
    extractors: ExtractorTable,
    generators: GeneratorTable,
    step_types: HashMap<String, Arc<dyn StepHandler>>,
    middleware: HashMap<HookPoint, Vec<Arc<dyn Middleware>>>,
    reporters: Vec<(String, Arc<dyn Reporter>)>,
}

impl Registry {
    /// An empty registry: no validators, extractors or generators.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with the built-in validators, extractors
    /// and generators.
    pub fn with_builtins() -> Self {
        Self {
            validators: builtin_validators(),
            extractors: builtin_extractors(),
            generators: builtin_generators(),
            ..Self::default()
        }
    }

    pub fn register_validator(
        &mut self,
        name: impl Into<String>,
        spec: impl Into<ValidationSpec>,
    ) -> &mut Self {
        let name = name.into();
        debug!("registering validator '{}'", name);
        self.validators.insert(name, spec.into());
        self
    }

    pub fn register_extractor(
        &mut self,
        name: impl Into<String>,
        extractor: CustomExtractor,
    ) -> &mut Self {
        let name = name.into();
        debug!("registering extractor '{}'", name);
        self.extractors.insert(name, extractor);
        self
    }

    pub fn register_generator<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&[Value]) -> Value + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("registering generator '{}'", name);
        let f: GeneratorFn = Arc::new(f);
        self.generators.insert(name, f);
        self
    }

    pub fn register_step_type(
        &mut self,
        kind: impl Into<String>,
        handler: impl StepHandler + 'static,
    ) -> &mut Self {
        let kind = kind.into();
        debug!("registering step type '{}'", kind);
        self.step_types.insert(kind, Arc::new(handler));
        self
    }

    /// Register middleware under a hook name such as `beforeStep`.
    pub fn register_middleware(
        &mut self,
        hook: &str,
        middleware: impl Middleware + 'static,
    ) -> Result<&mut Self, RegistryError> {
        let point = hook.parse::<HookPoint>()?;
        Ok(self.use_middleware(point, middleware))
    }

    /// Hooks at one point run in registration order.
    pub fn use_middleware(
        &mut self,
        point: HookPoint,
        middleware: impl Middleware + 'static,
    ) -> &mut Self {
        debug!("registering {} middleware", point);
        self.middleware
            .entry(point)
            .or_default()
            .push(Arc::new(middleware));
        self
    }

    pub fn register_reporter(
        &mut self,
        name: impl Into<String>,
        reporter: impl Reporter + 'static,
    ) -> &mut Self {
        let name = name.into();
        debug!("registering reporter '{}'", name);
        let reporter: Arc<dyn Reporter> = Arc::new(reporter);
        match self.reporters.iter_mut().find(|(existing, _)| *existing == name) {
            Some(slot) => slot.1 = reporter,
            None => self.reporters.push((name, reporter)),
        }
        self
    }

    pub fn validators(&self) -> &ValidatorTable {
        &self.validators
    }

    pub fn extractors(&self) -> &ExtractorTable {
        &self.extractors
    }

    pub fn generators(&self) -> &GeneratorTable {
        &self.generators
    }

    pub fn step_handler(&self, kind: &str) -> Option<&Arc<dyn StepHandler>> {
        self.step_types.get(kind)
    }

    pub fn middleware(&self, point: HookPoint) -> &[Arc<dyn Middleware>] {
        self.middleware
            .get(&point)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Reporters in registration order.
    pub fn reporters(&self) -> impl Iterator<Item = (&str, &Arc<dyn Reporter>)> {
        self.reporters
            .iter()
            .map(|(name, reporter)| (name.as_str(), reporter))
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut hooks: Vec<(HookPoint, usize)> = self
            .middleware
            .iter()
            .map(|(point, hooks)| (*point, hooks.len()))
            .collect();
        hooks.sort();
        f.debug_struct("Registry")
            .field("validators", &self.validators.len())
            .field("extractors", &self.extractors.len())
            .field("generators", &self.generators.len())
            .field("step_types", &self.step_types.keys().collect::<Vec<_>>())
            .field("middleware", &hooks)
            .field(
                "reporters",
                &self.reporters.iter().map(|(name, _)| name).collect::<Vec<_>>(),
            )
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::FnMiddleware;
    use crate::model::RunReport;
    use crate::validator::validators;
    use anyhow::Result;
    use async_trait::async_trait;

    struct Quiet;

    #[async_trait]
    impl Reporter for Quiet {
        async fn report(&self, _report: &RunReport) -> Result<()> {
            Ok(())
        }
    }

    fn noop() -> FnMiddleware {
        FnMiddleware::new(|_, _| Box::pin(async { Ok(()) }))
    }

    #[test]
    fn test_builtins_loaded() {
        let registry = Registry::with_builtins();
        assert!(registry.validators().contains_key("created"));
        assert!(registry.extractors().contains_key("id"));
        assert!(registry.generators().contains_key("uuid"));
        assert!(Registry::new().validators().is_empty());
    }

    #[test]
    fn test_last_registration_wins() {
        let mut registry = Registry::with_builtins();
        registry.register_validator("created", validators::status(200));
        assert!(matches!(
            registry.validators().get("created"),
            Some(ValidationSpec::Check(crate::validator::Check::Status(200)))
        ));

        registry
            .register_reporter("out", Quiet)
            .register_reporter("log", Quiet)
            .register_reporter("out", Quiet);
        let names: Vec<&str> = registry.reporters().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["out", "log"]);
    }

    #[test]
    fn test_middleware_registration() {
        let mut registry = Registry::new();
        registry.register_middleware("beforeStep", noop()).unwrap();
        registry.use_middleware(HookPoint::BeforeStep, noop());
        assert_eq!(registry.middleware(HookPoint::BeforeStep).len(), 2);
        assert!(registry.middleware(HookPoint::AfterScenario).is_empty());

        let err = registry.register_middleware("onError", noop()).unwrap_err();
        assert_eq!(err, RegistryError::UnknownHook("onError".into()));
    }
}
