//! Lifecycle middleware.

use crate::model::{Context, Scenario, Step, StepResult};
use anyhow::Result;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Points in a run where middleware is invoked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum HookPoint {
    BeforeScenario,
    BeforeStep,
    AfterStep,
    AfterScenario,
}

impl HookPoint {
    pub const ALL: [HookPoint; 4] = [
        HookPoint::BeforeScenario,
        HookPoint::BeforeStep,
        HookPoint::AfterStep,
        HookPoint::AfterScenario,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            HookPoint::BeforeScenario => "beforeScenario",
            HookPoint::BeforeStep => "beforeStep",
            HookPoint::AfterStep => "afterStep",
            HookPoint::AfterScenario => "afterScenario",
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HookPoint {
    type Err = crate::error::RegistryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "beforeScenario" | "before_scenario" => Ok(HookPoint::BeforeScenario),
            "beforeStep" | "before_step" => Ok(HookPoint::BeforeStep),
            "afterStep" | "after_step" => Ok(HookPoint::AfterStep),
            "afterScenario" | "after_scenario" => Ok(HookPoint::AfterScenario),
            other => Err(crate::error::RegistryError::UnknownHook(other.to_string())),
        }
    }
}

/// What a hook is being invoked for.
#[derive(Debug, Clone, Copy)]
pub enum HookEvent<'a> {
    BeforeScenario {
        scenario: &'a Scenario,
    },
    BeforeStep {
        step: &'a Step,
        /// 1-based.
        ordinal: usize,
    },
    AfterStep {
        step: &'a Step,
        ordinal: usize,
        result: &'a StepResult,
    },
    /// Runs whether the scenario completed or was aborted.
    AfterScenario {
        scenario: &'a Scenario,
        results: &'a [StepResult],
    },
}

impl HookEvent<'_> {
    pub fn point(&self) -> HookPoint {
        match self {
            HookEvent::BeforeScenario { .. } => HookPoint::BeforeScenario,
            HookEvent::BeforeStep { .. } => HookPoint::BeforeStep,
            HookEvent::AfterStep { .. } => HookPoint::AfterStep,
            HookEvent::AfterScenario { .. } => HookPoint::AfterScenario,
        }
    }
}

/// A lifecycle hook. Hooks may read and modify the run context.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn call(&self, event: HookEvent<'_>, context: &mut Context) -> Result<()>;
}

type HookFn = dyn for<'a> Fn(HookEvent<'a>, &'a mut Context) -> BoxFuture<'a, Result<()>>
    + Send
    + Sync;

/// Adapts an async closure into [`Middleware`].
///
/// ```ignore
/// let hook = FnMiddleware::new(|event, context| {
///     Box::pin(async move {
///         context.insert("seen".into(), event.point().to_string().into());
///         Ok(())
///     })
/// });
/// ```
#[derive(Clone)]
pub struct FnMiddleware(Arc<HookFn>);

impl FnMiddleware {
    pub fn new<F>(f: F) -> Self
    where
        F: for<'a> Fn(HookEvent<'a>, &'a mut Context) -> BoxFuture<'a, Result<()>>
            + Send
            + Sync
            + 'static,
    {
        Self(Arc::new(f))
    }
}

#[async_trait]
impl Middleware for FnMiddleware {
    async fn call(&self, event: HookEvent<'_>, context: &mut Context) -> Result<()> {
        (self.0)(event, context).await
    }
}

impl fmt::Debug for FnMiddleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnMiddleware(<fn>)")
    }
}
