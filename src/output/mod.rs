//! Report rendering and delivery

use crate::error::AuditError;
use crate::orchestrator::AuditReport;
use crate::probes::CheckResult;
use colored::*;
use serde::Serialize;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("Unknown output format: {}", s)),
        }
    }
}

/// Where the report goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportDestination {
    Stdout,
    File(PathBuf),
}

/// Output configuration
#[derive(Debug, Clone)]
pub struct OutputConfig {
    pub format: OutputFormat,
    pub destination: ReportDestination,
    /// Only honoured on stdout; files are always plain
    pub colored: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: OutputFormat::Text,
            destination: ReportDestination::Stdout,
            colored: true,
        }
    }
}

/// Main output manager
pub struct OutputManager {
    config: OutputConfig,
}

impl OutputManager {
    pub fn new(config: OutputConfig) -> Self {
        Self { config }
    }

    /// Render `report` and deliver it to the configured destination
    pub fn write_report(&self, report: &AuditReport) -> crate::Result<()> {
        match &self.config.destination {
            ReportDestination::Stdout => {
                let output = self.render(report, self.config.colored)?;
                print!("{}", output);
            }
            ReportDestination::File(path) => {
                let output = self.render(report, false)?;
                let mut file = File::create(path).map_err(|e| {
                    AuditError::Output(format!(
                        "failed to create report file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                file.write_all(output.as_bytes()).map_err(|e| {
                    AuditError::Output(format!(
                        "failed to write report file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                log::info!("Report written to {}", path.display());
            }
        }
        Ok(())
    }

    /// Render without delivering
    pub fn render(&self, report: &AuditReport, colored: bool) -> crate::Result<String> {
        match self.config.format {
            OutputFormat::Text => Ok(format_text(report, colored)),
            OutputFormat::Json => format_json(report),
        }
    }
}

fn format_line(result: &CheckResult, colored: bool) -> String {
    let verdict = if result.pass {
        "pass".to_string()
    } else {
        format!("do not pass: {}", result.messages.join(", "))
    };

    if !colored {
        return format!("[{}]\t {}\n", result.name, verdict);
    }

    let verdict = if result.pass {
        verdict.green().bold()
    } else {
        verdict.red()
    };
    format!("[{}]\t {}\n", result.name.bold(), verdict)
}

/// One line per result
fn format_text(report: &AuditReport, colored: bool) -> String {
    report.results.iter().map(|result| format_line(result, colored)).collect()
}

#[derive(Serialize)]
struct JsonReport<'a> {
    started_at: String,
    elapsed_secs: f64,
    passed: usize,
    total: usize,
    results: &'a [CheckResult],
}

fn format_json(report: &AuditReport) -> crate::Result<String> {
    let json = JsonReport {
        started_at: report.started_at.to_rfc3339(),
        elapsed_secs: report.elapsed.as_secs_f64(),
        passed: report.passed(),
        total: report.results.len(),
        results: &report.results,
    };
    let mut rendered = serde_json::to_string_pretty(&json)?;
    rendered.push('\n');
    Ok(rendered)
}
