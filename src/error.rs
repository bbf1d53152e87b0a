//! Error types shared by the scenario engine.
//!
//! Only three kinds of failure end a run early: a step whose
//! validation returned false, a transport failure, and a failing
//! custom step handler. Everything else (extraction entries,
//! condition evaluation, reporters) is isolated and surfaces as a
//! [`Diagnostic`] or a log line.

use crate::hooks::HookPoint;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// A non-fatal problem recorded while evaluating an extraction or
/// validation entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// The extraction key, validation key or path the problem
    /// belongs to.
    pub key: String,
    pub message: String,
}

impl Diagnostic {
    pub fn new(key: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.key, self.message)
    }
}

/// Malformed scenario definition, detected before any step runs.
#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to parse scenario: {0}")]
    Parse(String),

    #[error("scenario name must not be empty")]
    MissingName,

    #[error("scenario '{0}' has no steps")]
    NoSteps(String),

    #[error("step {index} has no name")]
    MissingStepName { index: usize },

    #[error("step {index} ({name}): '{field}' is required for http steps")]
    MissingField {
        index: usize,
        name: String,
        field: &'static str,
    },
}

impl From<serde_yaml::Error> for ScenarioError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

impl From<serde_json::Error> for ScenarioError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}

/// Failure signalled by a [`Transport`](crate::transport::Transport).
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The server answered, but with an error status.
    #[error("server responded with {status} {status_text}: {body}")]
    Status {
        status: u16,
        status_text: String,
        body: String,
    },

    /// No response was received.
    #[error("network error: {0}")]
    Network(String),

    /// The request could not be built.
    #[error("invalid request: {0}")]
    Setup(String),
}

/// Scenario-fatal failure of a single step.
#[derive(Debug, Error)]
pub enum StepError {
    #[error("validation failed for step '{step}': {reason}")]
    Validation { step: String, reason: String },

    #[error("request failed for step '{step}': {source}")]
    Dispatch {
        step: String,
        #[source]
        source: TransportError,
    },

    #[error("handler for step type '{kind}' failed in step '{step}': {source}")]
    Handler {
        step: String,
        kind: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("step '{step}' cannot be dispatched: {reason}")]
    Malformed { step: String, reason: String },
}

/// Error returned from [`ScenarioRunner::run`](crate::runner::ScenarioRunner::run).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Structure(#[from] ScenarioError),

    #[error("step {ordinal} ({name}) failed: {source}")]
    StepFailed {
        /// 1-based position of the failing step.
        ordinal: usize,
        name: String,
        #[source]
        source: StepError,
    },

    #[error("{hook} middleware failed: {source}")]
    Middleware {
        hook: HookPoint,
        #[source]
        source: anyhow::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error(
        "unknown hook '{0}' (expected beforeScenario, beforeStep, \
         afterStep or afterScenario)"
    )]
    UnknownHook(String),
}
