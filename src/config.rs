//! Runner configuration and scenario file loading.

use crate::model::Scenario;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Settings shared by every step of a run.
///
/// Read from a scenario's `config:` block; unset fields take the
/// defaults below. Both `snake_case` and `camelCase` keys are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Prefix for relative step urls.
    #[serde(alias = "baseUrl")]
    pub base_url: Option<String>,
    /// Per-request timeout in seconds.
    #[serde(rename = "timeout")]
    pub timeout_secs: u64,
    /// Sent with every request; step headers win on conflict.
    pub headers: HashMap<String, String>,
    /// Simulate responses instead of sending requests.
    #[serde(alias = "dryRun")]
    pub dry_run: bool,
    pub verbose: bool,
    /// Pause between consecutive steps.
    #[serde(alias = "delayMs")]
    pub delay_ms: u64,
    /// Extra attempts after a network error or 5xx response.
    pub retries: u32,
    #[serde(alias = "retryDelayMs")]
    pub retry_delay_ms: u64,
    /// Treat non-2xx responses as transport failures.
    #[serde(alias = "failOnErrorStatus")]
    pub fail_on_error_status: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_secs: 30,
            headers: HashMap::new(),
            dry_run: false,
            verbose: false,
            delay_ms: 0,
            retries: 0,
            retry_delay_ms: 1000,
            fail_on_error_status: true,
        }
    }
}

impl RunnerConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
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

    pub fn with_dry_run(mut self, enabled: bool) -> Self {
        self.dry_run = enabled;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Finds and parses scenario files.
#[derive(Debug)]
pub struct ScenarioLoader {
    /// Directories searched by [`ScenarioLoader::load_all_scenarios`].
    pub scenario_paths: Vec<PathBuf>,
}

impl ScenarioLoader {
    pub fn new() -> Self {
        Self {
            scenario_paths: vec![PathBuf::from("tests/scenarios")],
        }
    }

    pub fn add_path<P: AsRef<Path>>(&mut self, path: P) -> &mut Self {
        self.scenario_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Load a single scenario file.
    ///
    /// `.json` files are parsed as JSON, everything else as YAML. The
    /// scenario is structurally validated before it is returned.
    pub fn load_scenario<P: AsRef<Path>>(&self, path: P) -> Result<Scenario> {
        let path = path.as_ref();
        info!("Loading scenario from {}", path.display());

        let content = fs::read_to_string(path).context(format!(
            "Failed to read scenario file: {}",
            path.display()
        ))?;

        let scenario = if path.extension().is_some_and(|ext| ext == "json") {
            Scenario::from_json(&content)
        } else {
            Scenario::from_yaml(&content)
        }
        .context(format!("Invalid scenario in {}", path.display()))?;

        debug!("Successfully loaded scenario: {}", scenario.name);
        Ok(scenario)
    }

    /// Load every scenario file directly inside `dir`, sorted by file
    /// name. Files that fail to load are skipped with a warning.
    pub fn load_scenarios_from_dir<P: AsRef<Path>>(
        &self,
        dir: P,
    ) -> Result<Vec<Scenario>> {
        let dir = dir.as_ref();
        info!("Loading scenarios from directory: {}", dir.display());

        let mut paths = Vec::new();
        for entry in fs::read_dir(dir).context(format!(
            "Failed to read directory: {}",
            dir.display()
        ))? {
            let path = entry?.path();
            if path.is_file() && is_scenario_file(&path) {
                paths.push(path);
            }
        }
        paths.sort();

        let mut scenarios = Vec::new();
        for path in paths {
            match self.load_scenario(&path) {
                Ok(scenario) => scenarios.push(scenario),
                Err(err) => {
                    warn!("Skipping {}: {:#}", path.display(), err);
                }
            }
        }

        info!(
            "Loaded {} scenarios from {}",
            scenarios.len(),
            dir.display()
        );
        Ok(scenarios)
    }

    pub fn load_all_scenarios(&self) -> Result<Vec<Scenario>> {
        let mut all_scenarios = Vec::new();

        for path in &self.scenario_paths {
            if path.is_dir() {
                match self.load_scenarios_from_dir(path) {
                    Ok(mut scenarios) => all_scenarios.append(&mut scenarios),
                    Err(err) => {
                        debug!(
                            "Failed to load scenarios from {}: {}",
                            path.display(),
                            err
                        );
                    }
                }
            }
        }

        info!("Loaded {} scenarios in total", all_scenarios.len());
        Ok(all_scenarios)
    }
}

impl Default for ScenarioLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// `.yaml`, `.yml` or `.json`.
fn is_scenario_file(path: &Path) -> bool {
    path.extension()
        .is_some_and(|ext| ext == "yaml" || ext == "yml" || ext == "json")
}
