use anyhow::{Context, Result};
use colored::Colorize;
use parkflow_config::{FeedSource, PipelineConfig};
use parkflow_pipeline::{
    build_sinks, run_pipeline, shutdown_signal, DirectorySource, HttpSource, IntervalTicker,
    PipelineContext,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::{open_store, pipeline_options};

pub async fn cmd_run(config: PipelineConfig) -> Result<()> {
    let feed = config.feed_source()?;
    let store = open_store(&config)?;
    let specs = config.sinks()?;
    let sinks = build_sinks(&specs, &config.postgres.table)
        .await
        .context("Failed to set up sinks")?;
    let ctx = PipelineContext::open(store, sinks, pipeline_options(&config))?;

    let shutdown = CancellationToken::new();
    let signalled = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        signalled.cancel();
    });

    info!(
        interval_secs = config.poll_interval_seconds,
        sinks = specs.len(),
        "Starting parkflow"
    );

    let ticker = IntervalTicker::new(config.poll_interval());
    let grace = config.shutdown_grace();
    let stats = match feed {
        FeedSource::Url(url) => {
            let source = HttpSource::new(url)?;
            run_pipeline(ctx, ticker, source, grace, shutdown).await?
        }
        FeedSource::Directory {
            path,
            delete_after_ingest,
        } => {
            let source = DirectorySource::new(path, delete_after_ingest);
            run_pipeline(ctx, ticker, source, grace, shutdown).await?
        }
    };

    println!(
        "\n{} {} batches, {} changed rows, {} dropped records",
        "Stopped:".green().bold(),
        stats.batches,
        stats.changed,
        stats.dropped
    );
    Ok(())
}
