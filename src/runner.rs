//! Scenario execution.

use crate::config::RunnerConfig;
use crate::error::{RunError, StepError};
use crate::executor::StepExecutor;
use crate::hooks::HookEvent;
use crate::model::{Context, RunReport, RunSummary, Scenario, StepResult};
use crate::registry::Registry;
use crate::transport::{HttpTransport, Transport};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};

/// Runs scenarios step by step, stopping at the first failing step.
///
/// The runner owns its registries; `run` takes `&mut self`, so they
/// cannot change while a scenario is executing. Results and context of
/// the most recent run stay available afterwards, including when the
/// run was aborted.
pub struct ScenarioRunner {
    config: RunnerConfig,
    transport: Arc<dyn Transport>,
    registry: Registry,
    results: Vec<StepResult>,
    context: Context,
}

impl ScenarioRunner {
    /// A runner sending real HTTP requests, with the built-in
    /// validators, extractors and generators registered.
    pub fn new(config: RunnerConfig) -> Self {
        let transport = Arc::new(HttpTransport::new(&config));
        Self::with_transport(config, transport)
    }

    pub fn with_transport(config: RunnerConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            config,
            transport,
            registry: Registry::with_builtins(),
            results: Vec::new(),
            context: Context::new(),
        }
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    /// Step results of the last run.
    pub fn results(&self) -> &[StepResult] {
        &self.results
    }

    /// Context at the end of the last run.
    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Execute `scenario`, seeding the context with its `vars`
    /// overlaid by `variables`.
    ///
    /// `afterScenario` middleware and every reporter run once the
    /// scenario ends, whether it completed or was aborted.
    #[instrument(skip(self, scenario, variables), fields(name = %scenario.name))]
    pub async fn run(
        &mut self,
        scenario: &Scenario,
        variables: Context,
    ) -> Result<RunReport, RunError> {
        scenario.validate()?;

        let start_time = Instant::now();
        self.results.clear();
        self.context = scenario.vars.clone();
        self.context.extend(variables);

        info!("Starting scenario: {}", scenario.name);
        if self.config.dry_run {
            info!("Dry run: requests will be simulated");
        }

        let mut outcome = self.run_steps(scenario).await;

        let after = fire(
            &self.registry,
            HookEvent::AfterScenario {
                scenario,
                results: &self.results,
            },
            &mut self.context,
        )
        .await;
        if outcome.is_ok() {
            outcome = after;
        } else if let Err(e) = after {
            warn!("{}", e);
        }

        let report = RunReport {
            scenario_name: scenario.name.clone(),
            success: outcome.is_ok(),
            error: outcome.as_ref().err().map(ToString::to_string),
            results: self.results.clone(),
            context: self.context.clone(),
            timestamp: Utc::now().to_rfc3339(),
            summary: RunSummary::from_results(&self.results),
            duration_ms: start_time.elapsed().as_millis() as u64,
        };

        for (name, reporter) in self.registry.reporters() {
            if let Err(e) = reporter.report(&report).await {
                warn!("Reporter '{}' failed: {:#}", name, e);
            }
        }

        info!(
            "Scenario finished: {} ({} ms) - Success: {}",
            scenario.name, report.duration_ms, report.success
        );

        outcome.map(|()| report)
    }

    async fn run_steps(&mut self, scenario: &Scenario) -> Result<(), RunError> {
        fire(
            &self.registry,
            HookEvent::BeforeScenario { scenario },
            &mut self.context,
        )
        .await?;

        let total = scenario.steps.len();
        for (idx, step) in scenario.steps.iter().enumerate() {
            let ordinal = idx + 1;
            if idx > 0 && self.config.delay_ms > 0 {
                tokio::time::sleep(self.config.delay()).await;
            }

            info!("Running step {}/{}: {}", ordinal, total, step.name);
            fire(
                &self.registry,
                HookEvent::BeforeStep { step, ordinal },
                &mut self.context,
            )
            .await?;

            let step_start = Instant::now();
            let executor =
                StepExecutor::new(&self.config, self.transport.as_ref(), &self.registry);
            let executed = executor.execute(step, &mut self.context).await;
            let duration_ms = step_start.elapsed().as_millis() as u64;

            match executed {
                Ok(outcome) => {
                    for diagnostic in &outcome.diagnostics {
                        warn!("step '{}': {}", step.name, diagnostic);
                    }
                    self.results.push(StepResult {
                        step: step.name.clone(),
                        index: ordinal,
                        success: true,
                        response: outcome.response,
                        error: None,
                        extracted: outcome.extracted,
                        diagnostics: outcome.diagnostics,
                        duration_ms,
                    });

                    if let Some(result) = self.results.last() {
                        fire(
                            &self.registry,
                            HookEvent::AfterStep {
                                step,
                                ordinal,
                                result,
                            },
                            &mut self.context,
                        )
                        .await?;
                    }
                }
                Err(failure) => {
                    error!("Step {} ({}) failed: {}", ordinal, step.name, failure.error);
                    self.results.push(StepResult {
                        step: step.name.clone(),
                        index: ordinal,
                        success: false,
                        response: failure.response,
                        error: Some(failure.error.to_string()),
                        extracted: Context::new(),
                        diagnostics: failure.diagnostics,
                        duration_ms,
                    });
                    info!("Stopping scenario due to step failure");
                    return Err(step_failed(ordinal, &step.name, failure.error));
                }
            }
        }

        Ok(())
    }
}

fn step_failed(ordinal: usize, name: &str, source: StepError) -> RunError {
    RunError::StepFailed {
        ordinal,
        name: name.to_string(),
        source,
    }
}

/// Invoke every middleware registered for the event's hook point, in
/// order. The first error stops the chain.
async fn fire(
    registry: &Registry,
    event: HookEvent<'_>,
    context: &mut Context,
) -> Result<(), RunError> {
    let hook = event.point();
    for middleware in registry.middleware(hook) {
        middleware
            .call(event, context)
            .await
            .map_err(|source| RunError::Middleware { hook, source })?;
    }
    Ok(())
}
