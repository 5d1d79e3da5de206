use anyhow::{Context, Result};
use colored::Colorize;
use parkflow_config::{PipelineConfig, SinkEndpoint};
use parkflow_pg::PostgresSink;

use crate::config::open_store;

pub async fn cmd_setup(config: PipelineConfig) -> Result<()> {
    println!("Setting up parkflow...\n");

    // Opening the store creates its tables
    let store = open_store(&config)?;
    let summary = store.summary()?;
    println!(
        "  ✓ State database {} (last batch #{})",
        config.checkpoint_path().display(),
        summary.last_batch_seq
    );

    for spec in config.sinks()? {
        if let SinkEndpoint::Postgres { url } = &spec.endpoint {
            let sink = PostgresSink::connect(&spec.name, url.as_str(), &config.postgres.table)
                .await
                .with_context(|| format!("Failed to connect sink '{}' ({})", spec.name, spec.endpoint))?;
            sink.create_target_table()
                .await
                .with_context(|| format!("Failed to create table for sink '{}'", spec.name))?;
            println!(
                "  ✓ Postgres sink '{}': {} and __parkflow_commits",
                spec.name, config.postgres.table
            );
        }
    }

    println!("\n{}", "Setup complete!".green());
    println!("\nNext step:");
    println!("  Run: parkflow run\n");

    Ok(())
}
