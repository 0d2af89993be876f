//! Cohort Sentinel - one-shot cohort anomaly detection
//!
//! Loads detector definitions, runs each enabled detector over a window of
//! cohort series read from a JSON file, and prints the resulting runs and
//! anomalies.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use prometheus::{Encoder, TextEncoder};
use sentinel_lib::{AnomalyService, InMemoryRepository};
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod config;
mod output;
mod source;

use output::{OutputFormat, RunReport};

/// Cohort metric anomaly detection
#[derive(Parser)]
#[command(name = "cohort-sentinel")]
#[command(author, version, about = "Detect anomalies in cohort metric series", long_about = None)]
struct Cli {
    /// Configuration file (TOML, JSON or YAML)
    #[arg(long, short, env = "SENTINEL_CONFIG")]
    config: Option<PathBuf>,

    /// JSON file with cohort series
    #[arg(long, short)]
    data: PathBuf,

    /// Window start (RFC 3339); defaults to seven days before the end
    #[arg(long)]
    from: Option<DateTime<Utc>>,

    /// Window end (RFC 3339, exclusive); defaults to now
    #[arg(long)]
    to: Option<DateTime<Utc>>,

    /// Only run the detector with this name
    #[arg(long)]
    detector: Option<String>,

    /// Output format
    #[arg(long, short, value_enum, default_value_t = OutputFormat::Table)]
    format: OutputFormat,

    /// Print Prometheus metrics to stderr after the runs
    #[arg(long)]
    emit_metrics: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr so stdout carries only the report
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = config::SentinelConfig::load(cli.config.as_deref())?;
    let to = cli.to.unwrap_or_else(Utc::now);
    let from = cli.from.unwrap_or(to - Duration::days(7));
    info!(
        detectors = config.detectors.len(),
        max_workers = config.job.max_workers,
        window_from = %from,
        window_to = %to,
        "Sentinel configured"
    );

    let definitions: Vec<_> = config
        .detectors
        .iter()
        .filter(|d| cli.detector.as_deref().map_or(true, |name| d.name == name))
        .collect();
    if definitions.is_empty() {
        bail!("no detectors to run; check the configuration and --detector");
    }

    let service = AnomalyService::new(
        Arc::new(source::JsonFileSource::new(&cli.data)),
        Arc::new(InMemoryRepository::new()),
        config.job.clone(),
    );

    let mut reports = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let detector = definition
            .to_config()
            .with_context(|| format!("Invalid detector `{}`", definition.name))?;
        if !detector.enabled {
            info!(detector = %detector.name, "Skipping disabled detector");
            continue;
        }

        let name = detector.name.clone();
        let id = service.register_detector(detector).await?;

        let report = match service.run_detection(id, from, to).await {
            Ok(run) => {
                let mut anomalies = service.get_recent_anomalies(Some(id), None).await?;
                anomalies.retain(|e| e.run_id == run.id);
                RunReport {
                    detector: name,
                    run: Some(run),
                    error: None,
                    anomalies,
                }
            }
            Err(err) => {
                warn!(detector = %name, error = %err, "Detection run failed");
                let run = match err.run_id() {
                    Some(run_id) => service.get_run(run_id).await?,
                    None => None,
                };
                RunReport {
                    detector: name,
                    run,
                    error: Some(err.to_string()),
                    anomalies: Vec::new(),
                }
            }
        };
        reports.push(report);
    }

    output::print_reports(&reports, cli.format)?;

    if cli.emit_metrics {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&prometheus::gather(), &mut buffer)
            .context("Failed to encode metrics")?;
        eprintln!("{}", String::from_utf8_lossy(&buffer));
    }

    let failed = reports.iter().filter(|r| r.failed()).count();
    if failed > 0 {
        bail!("{} detector run(s) failed", failed);
    }
    Ok(())
}
