use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use parkflow_config::PipelineConfig;
use parkflow_pipeline::{build_sinks, DirectorySource, IngestOutcome, PipelineContext, SinkProgress};

use crate::config::{open_store, pipeline_options};

pub async fn cmd_ingest(config: PipelineConfig, files: Vec<PathBuf>) -> Result<()> {
    let store = open_store(&config)?;
    let sinks = build_sinks(&config.sinks()?, &config.postgres.table)
        .await
        .context("Failed to set up sinks")?;
    let mut ctx = PipelineContext::open(store, sinks, pipeline_options(&config))?;

    for path in &files {
        let snapshot = DirectorySource::read_file(path).await?;
        let outcome = ctx
            .ingest(snapshot)
            .await
            .with_context(|| format!("Failed to ingest {}", path.display()))?;

        match outcome {
            IngestOutcome::Ingested {
                seq,
                changed,
                unchanged,
                dropped,
            } => println!(
                "{} {}: batch #{} ({} changed, {} unchanged, {} dropped)",
                "✓".green(),
                path.display(),
                seq,
                changed,
                unchanged,
                dropped
            ),
            IngestOutcome::Empty { dropped } => println!(
                "{} {}: no valid records ({} dropped)",
                "-".yellow(),
                path.display(),
                dropped
            ),
            IngestOutcome::Duplicate { .. } => {
                println!("{} {}: already ingested", "-".yellow(), path.display())
            }
            IngestOutcome::Malformed { reason } => {
                println!("{} {}: {}", "✗".red(), path.display(), reason)
            }
        }
    }

    // Deliver until every durable sink is idle, waiting out backoff delays.
    let mut dead_lettered = 0;
    loop {
        let progress = ctx.deliver().await?;
        if progress.iter().all(|p| *p == SinkProgress::Idle) {
            break;
        }
        dead_lettered += progress
            .iter()
            .filter(|p| matches!(p, SinkProgress::DeadLettered { .. }))
            .count();
        let delay = progress
            .iter()
            .filter_map(|p| match p {
                SinkProgress::RetryScheduled { delay, .. } => Some(*delay),
                _ => None,
            })
            .max();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    let stats = ctx.close().await?;
    println!(
        "\nIngested {} snapshot(s): {} changed rows, {} dropped records",
        stats.snapshots, stats.changed, stats.dropped
    );
    if dead_lettered > 0 {
        println!(
            "{}",
            format!(
                "{} batch(es) moved to the dead letter queue; see 'parkflow dlq list'",
                dead_lettered
            )
            .red()
        );
    }
    Ok(())
}
