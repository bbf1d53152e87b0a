//! Tauon CLI: run YAML/JSON HTTP scenarios.

use anyhow::{anyhow, Context as _, Result};
use clap::Parser;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::Instant;
use tauon::{
    Context, FileReporter, LogReporter, ReportFormat, RunnerConfig, Scenario,
    ScenarioLoader, ScenarioRunner,
};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Tauon - sequential HTTP scenario runner.
#[derive(Parser, Debug)]
#[command(name = "tauon", version, about)]
struct Cli {
    /// Scenario file or directory path.
    #[arg(short = 'p', long = "path")]
    scenario_path: Option<String>,

    /// Filter scenarios by name (partial match).
    #[arg(short = 'f', long = "filter")]
    filter: Option<String>,

    /// Initial variable, repeatable. Values are parsed as JSON when
    /// possible and kept as strings otherwise.
    #[arg(long = "var", value_name = "KEY=VALUE", value_parser = parse_var)]
    vars: Vec<(String, Value)>,

    /// Base URL override for all scenarios.
    #[arg(short = 'b', long = "base-url", env = "TAUON_BASE_URL")]
    base_url: Option<String>,

    /// Timeout in seconds per request.
    #[arg(short = 't', long = "timeout", env = "TAUON_TIMEOUT")]
    timeout: Option<u64>,

    /// Simulate responses instead of sending requests.
    #[arg(long = "dry-run")]
    dry_run: bool,

    /// Enable verbose logging.
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,

    /// Delay between steps in milliseconds.
    #[arg(long = "delay-ms")]
    delay_ms: Option<u64>,

    /// Retries on network errors and 5xx responses.
    #[arg(long = "retries", env = "TAUON_RETRIES")]
    retries: Option<u32>,

    /// Directory to save report files.
    #[arg(short = 'r', long = "report-dir")]
    report_dir: Option<PathBuf>,

    /// Report output format.
    #[arg(long = "report-format", value_enum, default_value = "json")]
    report_format: ReportFormat,
}

impl Cli {
    /// Layer command-line overrides on top of a scenario's config.
    fn apply_overrides(&self, mut config: RunnerConfig) -> RunnerConfig {
        if let Some(base_url) = &self.base_url {
            config.base_url = Some(base_url.clone());
        }
        if let Some(timeout) = self.timeout {
            config.timeout_secs = timeout;
        }
        if let Some(delay_ms) = self.delay_ms {
            config.delay_ms = delay_ms;
        }
        if let Some(retries) = self.retries {
            config.retries = retries;
        }
        config.dry_run |= self.dry_run;
        config.verbose |= self.verbose;
        config
    }
}

fn parse_var(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn init_tracing(verbose: bool) {
    if std::env::var_os("RUST_LOG").is_none() {
        let level = if verbose { "debug" } else { "info" };
        std::env::set_var("RUST_LOG", level);
    }

    if tracing::dispatcher::has_been_set() {
        return;
    }

    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_level(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .try_init();
}

fn load_scenarios(scenario_path: Option<&str>) -> Result<Vec<Scenario>> {
    let mut loader = ScenarioLoader::new();

    for path in ["tests/scenarios", "scenarios"] {
        if Path::new(path).exists() {
            loader.add_path(path);
        }
    }

    let scenarios = match scenario_path {
        Some(path) => {
            let path = PathBuf::from(path);
            if path.is_file() {
                vec![loader
                    .load_scenario(&path)
                    .context(format!("Failed to load scenario: {}", path.display()))?]
            } else if path.is_dir() {
                loader.load_scenarios_from_dir(&path).context(format!(
                    "Failed to load scenarios from directory: {}",
                    path.display()
                ))?
            } else {
                return Err(anyhow!("Path does not exist: {}", path.display()));
            }
        }
        None => loader.load_all_scenarios()?,
    };

    if scenarios.is_empty() {
        return Err(anyhow!("No scenarios found"));
    }
    Ok(scenarios)
}

async fn run_all(cli: &Cli, scenarios: Vec<Scenario>) -> Result<bool> {
    let filtered: Vec<Scenario> = match &cli.filter {
        Some(filter) => scenarios
            .into_iter()
            .filter(|s| s.name.to_lowercase().contains(&filter.to_lowercase()))
            .collect(),
        None => scenarios,
    };
    if filtered.is_empty() {
        return Err(anyhow!("No scenarios matching the filter were found"));
    }

    let variables: Context = cli.vars.iter().cloned().collect();
    let total = filtered.len();
    let total_start = Instant::now();
    let mut passed = 0;
    let mut failed = 0;

    info!("Running {} scenario(s)...", total);

    for (idx, scenario) in filtered.iter().enumerate() {
        info!("Scenario {}/{}: {}", idx + 1, total, scenario.name);

        let config = cli.apply_overrides(scenario.config.clone());
        let log_reporter = LogReporter::from(&config);
        let mut runner = ScenarioRunner::new(config);
        runner
            .registry_mut()
            .register_reporter("log", log_reporter);
        if let Some(dir) = &cli.report_dir {
            runner
                .registry_mut()
                .register_reporter("file", FileReporter::new(dir, cli.report_format));
        }

        match runner.run(scenario, variables.clone()).await {
            Ok(_) => passed += 1,
            Err(e) => {
                error!("\x1b[31mScenario failed: {} - {}\x1b[0m", scenario.name, e);
                failed += 1;
            }
        }
    }

    info!(
        "Summary:\n  Total: {}\n  \x1b[32mPassed: {}\x1b[0m\n  \x1b[31mFailed: {}\x1b[0m\n  Duration: {} ms",
        passed + failed,
        passed,
        failed,
        total_start.elapsed().as_millis()
    );

    Ok(failed == 0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose);

    let scenarios = load_scenarios(cli.scenario_path.as_deref())?;
    let success = run_all(&cli, scenarios).await?;

    if !success {
        exit(1);
    }

    Ok(())
}
