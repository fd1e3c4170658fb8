// HackGPT worker
//
// Design Decision: The orchestrator runs in-process; this binary only wires
// configuration, built-in executors and a task file to it.
// Design Decision: Ctrl-C drains the pool with the configured shutdown grace.

mod executors;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use futures::future::join_all;
use hackgpt_orchestrator::telemetry::{init_telemetry, TelemetryConfig};
use hackgpt_orchestrator::{Orchestrator, OrchestratorConfig, TaskHandle, TaskSpec, TaskState};
use serde_json::json;

#[derive(Parser)]
#[command(name = "hackgpt-worker")]
#[command(about = "Run scan and analysis tasks through the HackGPT orchestrator")]
#[command(version)]
struct Cli {
    /// JSON file holding an array of task specs
    tasks: PathBuf,

    /// Max time to wait for the whole batch, in seconds
    #[arg(long, env = "HACKGPT_WAIT_SECS", default_value = "3600")]
    wait: u64,

    /// Output format
    #[arg(long, short, default_value = "text", value_parser = ["text", "json"])]
    output: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut telemetry_config = TelemetryConfig::from_env();
    if telemetry_config.log_filter.is_none() {
        telemetry_config.log_filter = Some("hackgpt_orchestrator=info,hackgpt_worker=info".into());
    }
    let _telemetry_guard = init_telemetry(telemetry_config);

    let config = OrchestratorConfig::from_env().context("Invalid HACKGPT_* configuration")?;
    let shutdown_grace = config.pool.shutdown_grace;

    let raw = tokio::fs::read_to_string(&cli.tasks)
        .await
        .with_context(|| format!("Failed to read {}", cli.tasks.display()))?;
    let specs: Vec<TaskSpec> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse task specs in {}", cli.tasks.display()))?;

    let orchestrator =
        Orchestrator::new(config, executors::builtin()).context("Failed to build orchestrator")?;
    orchestrator.start().await?;
    tracing::info!(tasks = specs.len(), "hackgpt-worker started");

    let mut handles = Vec::with_capacity(specs.len());
    for spec in specs {
        let operation = spec.payload.operation.clone();
        match orchestrator.submit(spec).await {
            Ok(handle) => handles.push(handle),
            Err(e) => tracing::error!(operation, error = %e, "Task rejected"),
        }
    }

    let wait = Duration::from_secs(cli.wait);
    tokio::select! {
        _ = join_all(handles.iter().map(|h| h.wait_record(wait))) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
        }
    }

    let report = orchestrator.shutdown(shutdown_grace).await?;
    print_results(&handles, &cli.output)?;
    tracing::info!(
        cancelled_pending = report.cancelled_pending,
        force_cancelled = report.force_cancelled,
        "Worker shutdown complete"
    );

    let failed = handles
        .iter()
        .filter(|h| h.status().is_some_and(|t| t.state != TaskState::Succeeded))
        .count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} tasks did not succeed", handles.len());
    }
    Ok(())
}

fn print_results(handles: &[TaskHandle], output: &str) -> Result<()> {
    let tasks: Vec<_> = handles.iter().filter_map(|h| h.status()).collect();

    if output == "json" {
        println!("{}", serde_json::to_string_pretty(&tasks)?);
        return Ok(());
    }

    for task in &tasks {
        let detail = match (&task.result, &task.error) {
            (Some(result), _) => result.to_string(),
            (None, Some(error)) => error.to_string(),
            (None, None) => json!(null).to_string(),
        };
        println!(
            "{}  {:<10} {:<12} attempts={}  {}",
            task.id, task.state, task.payload.operation, task.attempt_count, detail
        );
    }
    Ok(())
}
