//! Output formatting for run reports

use clap::ValueEnum;
use colored::Colorize;
use sentinel_lib::{AnomalyEvent, DetectionRun, RunStatus, Severity};
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};

/// Output format for run reports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    /// Table format (default)
    #[default]
    Table,
    /// JSON format
    Json,
}

/// Outcome of one detector run
#[derive(Debug, Serialize)]
pub struct RunReport {
    pub detector: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run: Option<DetectionRun>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub anomalies: Vec<AnomalyEvent>,
}

impl RunReport {
    pub fn failed(&self) -> bool {
        self.error.is_some()
            || self
                .run
                .as_ref()
                .map_or(false, |run| run.status == RunStatus::Failed)
    }
}

#[derive(Tabled)]
struct AnomalyRow {
    #[tabled(rename = "Detector")]
    detector: String,
    #[tabled(rename = "Cohort")]
    cohort: String,
    #[tabled(rename = "Metric")]
    metric: String,
    #[tabled(rename = "Timestamp")]
    timestamp: String,
    #[tabled(rename = "Score")]
    score: String,
    #[tabled(rename = "Severity")]
    severity: String,
    #[tabled(rename = "Persisted")]
    persisted: u32,
}

impl AnomalyRow {
    fn new(detector: &str, event: &AnomalyEvent) -> Self {
        Self {
            detector: detector.to_string(),
            cohort: event.cohort_key.to_string(),
            metric: event.metric.clone(),
            timestamp: event.timestamp.to_rfc3339(),
            score: format!("{:.2}", event.score),
            severity: event.severity.to_string(),
            persisted: event.persisted_n,
        }
    }
}

/// Print reports in the requested format
pub fn print_reports(reports: &[RunReport], format: OutputFormat) -> anyhow::Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(reports)?);
        }
        OutputFormat::Table => {
            for report in reports {
                print_summary(report);
            }

            let rows: Vec<AnomalyRow> = reports
                .iter()
                .flat_map(|r| r.anomalies.iter().map(|e| AnomalyRow::new(&r.detector, e)))
                .collect();
            if rows.is_empty() {
                println!("{}", "No anomalies found".yellow());
            } else {
                println!("{}", Table::new(rows).with(Style::rounded()));
            }
        }
    }
    Ok(())
}

fn print_summary(report: &RunReport) {
    match (&report.run, &report.error) {
        (_, Some(error)) => {
            eprintln!("{} {}: {}", "✗".red().bold(), report.detector, error);
        }
        (Some(run), None) => {
            let worst = report.anomalies.iter().map(|e| e.severity).max();
            let line = format!(
                "{}: {} cohorts, {} anomalies ({})",
                report.detector, run.cohorts_processed, run.anomalies_found, run.status
            );
            match worst {
                Some(Severity::Critical) => println!("{} {}", "⚠".red().bold(), line),
                Some(_) => println!("{} {}", "⚠".yellow().bold(), line),
                None => println!("{} {}", "✓".green().bold(), line),
            }
        }
        (None, None) => {}
    }
}
