use anyhow::Result;
use colored::Colorize;
use parkflow_config::PipelineConfig;
use parkflow_state::CheckpointStore;

use crate::config::open_store;

pub async fn cmd_status(config: PipelineConfig) -> Result<()> {
    let store = open_store(&config)?;
    let summary = store.summary()?;

    println!("\nState: {}", config.checkpoint_path().display());
    println!("  Facilities tracked: {}", summary.facilities);
    println!("  Last batch:         #{}", summary.last_batch_seq);
    println!("  Logged batches:     {}", summary.logged_batches);
    println!("  Dead letters:       {}", summary.dead_letters);

    let checkpoints = store.get_all_checkpoints()?;
    let durable: Vec<_> = config
        .sinks()?
        .into_iter()
        .filter(|s| s.endpoint.is_durable())
        .collect();

    if durable.is_empty() && checkpoints.is_empty() {
        println!("\nNo durable sinks configured.");
        return Ok(());
    }

    println!("\nSink Status:");
    println!(
        "{:<20} {:>10} {:>8} {:>12} {:>6}  {}",
        "Sink", "Batch", "Lag", "Rows", "DLQ", "Updated"
    );
    println!("{:-<80}", "");

    let mut names: Vec<String> = durable.iter().map(|s| s.name.clone()).collect();
    for (name, _) in &checkpoints {
        if !names.contains(name) {
            names.push(name.clone());
        }
    }

    for name in names {
        let checkpoint = checkpoints
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, c)| c.clone())
            .unwrap_or_default();
        let lag = summary.last_batch_seq.saturating_sub(checkpoint.seq);
        let dead = store.get_dead_letters(Some(&name), i64::MAX)?.len();
        let updated = checkpoint
            .updated_at
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string());
        let lag_text = format!("{:>8}", lag);
        let configured = durable.iter().any(|s| s.name == name);

        println!(
            "{:<20} {:>10} {} {:>12} {:>6}  {}{}",
            name,
            checkpoint.seq,
            if lag == 0 { lag_text.green() } else { lag_text.yellow() },
            checkpoint.rows_committed,
            dead,
            updated,
            if configured { "" } else { " (not configured)" }
        );
    }

    println!();
    Ok(())
}
