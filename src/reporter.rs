//! Run reporters.
//!
//! Every registered reporter receives the [`RunReport`] once a run
//! ends, whether it completed or was aborted. Reporter errors are
//! logged by the runner and never change the run's outcome.

use crate::config::RunnerConfig;
use crate::model::RunReport;
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use clap::ValueEnum;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

#[async_trait]
pub trait Reporter: Send + Sync {
    async fn report(&self, report: &RunReport) -> Result<()>;
}

/// Writes a pass/fail summary through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct LogReporter {
    /// Also log each step's response status and body.
    pub verbose: bool,
}

impl LogReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl From<&RunnerConfig> for LogReporter {
    fn from(config: &RunnerConfig) -> Self {
        Self::new(config.verbose)
    }
}

#[async_trait]
impl Reporter for LogReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        let status = if report.success {
            "\x1b[32mPASS\x1b[0m"
        } else {
            "\x1b[31mFAIL\x1b[0m"
        };
        info!(
            "{} scenario: {} ({} ms)",
            status, report.scenario_name, report.duration_ms
        );

        for result in &report.results {
            let step_status = if result.success {
                "\x1b[32m✓\x1b[0m"
            } else {
                "\x1b[31m✗\x1b[0m"
            };
            info!(
                "  {}. {} {} ({} ms)",
                result.index, step_status, result.step, result.duration_ms
            );

            if let Some(error) = &result.error {
                error!("     \x1b[31mError: {}\x1b[0m", error);
            }
            for diagnostic in &result.diagnostics {
                debug!("     {}", diagnostic);
            }

            if self.verbose {
                if let Some(response) = &result.response {
                    debug!(
                        "     Response: {} {}",
                        response.status, response.status_text
                    );
                    debug!("     Response body: {}", truncate(&response.data.to_string(), 500));
                }
            }
        }

        info!(
            "  total: {}, successful: {}, failed: {}",
            report.summary.total, report.summary.successful, report.summary.failed
        );
        Ok(())
    }
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...(truncated)", &text[..idx]),
        None => text.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ReportFormat {
    Json,
    Yaml,
    Text,
}

impl ReportFormat {
    fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Yaml => "yaml",
            ReportFormat::Text => "txt",
        }
    }
}

/// Saves one report file per run into a directory.
#[derive(Debug, Clone)]
pub struct FileReporter {
    dir: PathBuf,
    format: ReportFormat,
}

impl FileReporter {
    pub fn new(dir: impl Into<PathBuf>, format: ReportFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write the report and return the file it was saved to.
    pub async fn save(&self, report: &RunReport) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let sanitized_name = report.scenario_name.replace([' ', '/'], "_");
        let filename = format!(
            "{sanitized_name}-{}.{}",
            Utc::now().timestamp_millis(),
            self.format.extension()
        );

        let content = match self.format {
            ReportFormat::Json => serde_json::to_string_pretty(report)?,
            ReportFormat::Yaml => serde_yaml::to_string(report)?,
            ReportFormat::Text => render_text(report),
        };

        let path = self.dir.join(filename);
        tokio::fs::write(&path, content).await?;
        Ok(path)
    }
}

#[async_trait]
impl Reporter for FileReporter {
    async fn report(&self, report: &RunReport) -> Result<()> {
        let path = self.save(report).await?;
        info!("Report saved: {}", path.display());
        Ok(())
    }
}

fn render_text(report: &RunReport) -> String {
    let mut content = String::new();
    let pass_fail = |ok: bool| if ok { "PASS" } else { "FAIL" };

    let _ = writeln!(content, "Scenario: {}", report.scenario_name);
    let _ = writeln!(content, "Status: {}", pass_fail(report.success));
    if let Some(error) = &report.error {
        let _ = writeln!(content, "Error: {error}");
    }
    let _ = writeln!(content, "Timestamp: {}", report.timestamp);
    let _ = writeln!(content, "Duration: {} ms", report.duration_ms);
    let _ = writeln!(
        content,
        "Summary: {} total, {} successful, {} failed\n",
        report.summary.total, report.summary.successful, report.summary.failed
    );
    content.push_str("Steps:\n");
    for step in &report.results {
        let _ = writeln!(
            content,
            "  {}. {} ({})",
            step.index,
            step.step,
            pass_fail(step.success)
        );
        if let Some(error) = &step.error {
            let _ = writeln!(content, "     Error: {error}");
        }
        let _ = writeln!(content, "     Duration: {} ms", step.duration_ms);
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Context, Response, RunSummary, StepResult};
    use serde_json::json;

    fn sample_report() -> RunReport {
        let results = vec![
            StepResult {
                step: "create".into(),
                index: 1,
                success: true,
                response: Some(Response::new(201).with_data(json!({"id": "abc"}))),
                error: None,
                extracted: json!({"id": "abc"}).as_object().cloned().unwrap(),
                diagnostics: Vec::new(),
                duration_ms: 3,
            },
            StepResult {
                step: "read".into(),
                index: 2,
                success: false,
                response: Some(Response::new(404)),
                error: Some("validation failed".into()),
                extracted: Context::new(),
                diagnostics: Vec::new(),
                duration_ms: 2,
            },
        ];
        RunReport {
            scenario_name: "items / crud".into(),
            success: false,
            error: Some("step 2 (read) failed".into()),
            summary: RunSummary::from_results(&results),
            results,
            context: json!({"id": "abc"}).as_object().cloned().unwrap(),
            timestamp: "2024-01-01T00:00:00Z".into(),
            duration_ms: 5,
        }
    }

    #[tokio::test]
    async fn test_json_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileReporter::new(dir.path(), ReportFormat::Json);
        let path = reporter.save(&sample_report()).await.unwrap();

        let file_name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(file_name.starts_with("items___crud-"));
        assert!(file_name.ends_with(".json"));

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["scenarioName"], json!("items / crud"));
        assert_eq!(saved["summary"], json!({"total": 2, "successful": 1, "failed": 1}));
        assert_eq!(saved["results"][0]["response"]["statusText"], json!("Created"));
        assert_eq!(saved["context"], json!({"id": "abc"}));
    }

    #[tokio::test]
    async fn test_text_report_file() {
        let dir = tempfile::tempdir().unwrap();
        let reporter = FileReporter::new(dir.path().join("nested"), ReportFormat::Text);
        let path = reporter.save(&sample_report()).await.unwrap();

        let text = std::fs::read_to_string(path).unwrap();
        assert!(text.contains("Status: FAIL"));
        assert!(text.contains("  2. read (FAIL)"));
        assert!(text.contains("Error: validation failed"));
    }

    #[tokio::test]
    async fn test_log_reporter_never_fails() {
        LogReporter::new(true).report(&sample_report()).await.unwrap();
    }

    #[test]
    fn test_log_reporter_follows_config_verbosity() {
        let config: RunnerConfig = serde_yaml::from_str("verbose: true").unwrap();
        assert!(LogReporter::from(&config).verbose);
        assert!(!LogReporter::from(&RunnerConfig::default()).verbose);
    }

    #[test]
    fn test_truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééé", 2), "éé...(truncated)");
    }
}
