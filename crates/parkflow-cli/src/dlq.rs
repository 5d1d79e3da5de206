//! Dead letter queue command handlers.

use std::sync::Arc;

use anyhow::{Context, Result};
use colored::Colorize;
use dialoguer::Confirm;
use parkflow_config::PipelineConfig;
use parkflow_core::{Batch, DeliveryState, RetryPolicy};
use parkflow_pipeline::build_sinks;
use parkflow_sink::Sink;
use parkflow_state::{DeadLetter, SqliteStore};
use tracing::{info, warn};

/// List dead letters.
pub fn cmd_dlq_list(store: &SqliteStore, sink: Option<&str>, limit: i64) -> Result<()> {
    let entries = store.get_dead_letters(sink, limit)?;

    if entries.is_empty() {
        if let Some(name) = sink {
            println!("No dead letters for sink '{}'", name);
        } else {
            println!("No dead letters found.");
        }
        return Ok(());
    }

    println!("\nDead Letter Queue:");
    println!(
        "{:<6} {:<20} {:>8} {:>6} {:>9} {:<17} {}",
        "ID", "Sink", "Batch", "Rows", "Attempts", "Created", "Error"
    );
    println!("{:-<100}", "");

    for entry in &entries {
        println!(
            "{:<6} {:<20} {:>8} {:>6} {:>9} {:<17} {}",
            entry.id,
            truncate(&entry.sink_name, 20),
            entry.seq,
            entry.rows.len(),
            entry.attempts,
            entry.created_at.format("%Y-%m-%d %H:%M"),
            truncate(&entry.error_message, 40).red()
        );
    }

    println!("\nTotal: {} entries", entries.len());
    if entries.len() as i64 == limit {
        println!("(showing first {} - use --limit to see more)", limit);
    }

    Ok(())
}

/// Show a single dead letter.
pub fn cmd_dlq_show(store: &SqliteStore, id: i64) -> Result<()> {
    let entry = store
        .get_dead_letter(id)?
        .with_context(|| format!("Dead letter {} not found", id))?;

    println!("\nDead Letter #{}", entry.id);
    println!("{:-<60}", "");
    println!("Sink:         {}", entry.sink_name);
    println!("Batch:        #{}", entry.seq);
    println!("Attempts:     {}", entry.attempts);
    println!("Created:      {}", entry.created_at.format("%Y-%m-%d %H:%M:%S %Z"));
    println!("\nError Message:");
    println!("  {}", entry.error_message);
    println!("\nRows ({}):", entry.rows.len());
    println!(
        "{}",
        serde_json::to_string_pretty(&entry.rows).unwrap_or_else(|_| format!("{:?}", entry.rows))
    );

    Ok(())
}

/// Re-deliver dead letters to the sink that gave up on them. Entries that
/// commit are removed from the queue.
pub async fn cmd_dlq_retry(
    config: &PipelineConfig,
    store: &SqliteStore,
    id: Option<i64>,
    sink: Option<&str>,
) -> Result<()> {
    let entries = match (id, sink) {
        (Some(id), _) => vec![store
            .get_dead_letter(id)?
            .with_context(|| format!("Dead letter {} not found", id))?],
        (None, Some(name)) => store.get_dead_letters(Some(name), i64::MAX)?,
        (None, None) => anyhow::bail!("Either --id or --sink must be specified"),
    };

    if entries.is_empty() {
        println!("No dead letters to retry.");
        return Ok(());
    }

    let specs: Vec<_> = config
        .sinks()?
        .into_iter()
        .filter(|s| entries.iter().any(|e| e.sink_name == s.name))
        .collect();
    let sinks = build_sinks(&specs, &config.postgres.table)
        .await
        .context("Failed to set up sinks")?;
    let policy = config.retry_policy();

    let mut retried = 0;
    let mut failed = 0;
    for entry in &entries {
        let Some(sink) = sinks.iter().find(|s| s.name() == entry.sink_name) else {
            println!(
                "{} #{}: sink '{}' is not configured, skipping",
                "-".yellow(),
                entry.id,
                entry.sink_name
            );
            continue;
        };

        match redeliver(sink, entry, &policy).await {
            Ok(()) => {
                store.delete_dead_letter(entry.id)?;
                info!(id = entry.id, sink = %entry.sink_name, seq = entry.seq, "Dead letter re-delivered");
                println!(
                    "{} #{}: {} rows delivered to '{}'",
                    "✓".green(),
                    entry.id,
                    entry.rows.len(),
                    entry.sink_name
                );
                retried += 1;
            }
            Err(e) => {
                println!("{} #{}: {:#}", "✗".red(), entry.id, e);
                failed += 1;
            }
        }
    }

    for sink in &sinks {
        if let Err(e) = sink.close().await {
            warn!(sink = %sink.name(), error = %e, "Failed to close sink");
        }
    }

    println!("\nRetried {} entries, {} still failing.", retried, failed);
    Ok(())
}

async fn redeliver(sink: &Arc<dyn Sink>, entry: &DeadLetter, policy: &RetryPolicy) -> Result<()> {
    let batch = Batch {
        seq: entry.seq,
        ingested_at: entry.created_at,
        source: None,
        rows: entry.rows.clone(),
    };

    let mut state = DeliveryState::default();
    loop {
        let committing = state.begin()?;
        match sink.commit(&batch).await {
            Ok(()) => {
                committing.succeed()?;
                return Ok(());
            }
            Err(e) => {
                let failed = committing.fail(e.is_retryable(), policy)?;
                if failed.is_settled() {
                    return Err(e).with_context(|| {
                        format!("Failed after {} attempt(s)", failed.attempts())
                    });
                }

                let delay = policy.backoff(failed.attempts());
                warn!(
                    sink = %sink.name(),
                    attempt = failed.attempts(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Re-delivery failed, retrying"
                );
                tokio::time::sleep(delay).await;
                state = failed.retry()?;
            }
        }
    }
}

/// Clear dead letters.
pub fn cmd_dlq_clear(store: &SqliteStore, sink: Option<&str>, all: bool, yes: bool) -> Result<()> {
    if sink.is_none() && !all {
        anyhow::bail!("Either --sink or --all must be specified");
    }

    let count = store.get_dead_letters(sink, i64::MAX)?.len();
    if count == 0 {
        println!("No dead letters to clear.");
        return Ok(());
    }

    let scope = match sink {
        Some(name) => format!("{} dead letter(s) for sink '{}'", count, name),
        None => format!("all {} dead letter(s)", count),
    };

    if !yes {
        let confirmed = Confirm::new()
            .with_prompt(format!("Delete {}? This cannot be undone", scope))
            .default(false)
            .interact()?;
        if !confirmed {
            println!("Aborted.");
            return Ok(());
        }
    }

    let removed = store.clear_dead_letters(sink)?;
    info!(removed, sink = sink.unwrap_or("*"), "Cleared dead letters");
    println!("{}", format!("Cleared {} dead letter(s).", removed).green());

    Ok(())
}

/// Truncate a string to a maximum length.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", cut)
    }
}
