//! The long-running pipeline: fetch, ingest, deliver, shut down.

use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::context::{IngestOutcome, PipelineContext, RunStats};
use crate::error::{PipelineError, PipelineResult};
use crate::scheduler::Ticker;
use crate::source::{Snapshot, SnapshotSource};

/// Snapshots fetched but not yet ingested.
const FETCH_QUEUE: usize = 4;

/// Run until `shutdown` is cancelled, the ticker ends, or a fatal error.
///
/// Fetching runs on its own task and feeds a bounded queue; snapshots are
/// ingested strictly one after another; each durable sink delivers on its
/// own task. On shutdown in-flight commits get `grace` to finish before
/// they are aborted, leaving their checkpoints where they were.
pub async fn run_pipeline<T, S>(
    mut ctx: PipelineContext,
    ticker: T,
    source: S,
    grace: Duration,
    shutdown: CancellationToken,
) -> PipelineResult<RunStats>
where
    T: Ticker + 'static,
    S: SnapshotSource + 'static,
{
    let (tx, mut rx) = mpsc::channel(FETCH_QUEUE);
    let fetcher = tokio::spawn(fetch_loop(ticker, source, tx, shutdown.clone()));
    let workers = ctx.spawn_workers(&shutdown);

    let mut result = Ok(());
    loop {
        let snapshot = tokio::select! {
            biased;
            _ = shutdown.cancelled() => {
                info!("Shutdown requested");
                break;
            }
            snapshot = rx.recv() => snapshot,
        };

        let Some(snapshot) = snapshot else {
            info!("Snapshot source finished");
            break;
        };

        match ctx.ingest(snapshot).await {
            Ok(IngestOutcome::Ingested { seq, changed, .. }) => {
                debug!(seq, changed, "Batch queued for delivery");
            }
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Ingestion failed, stopping pipeline");
                result = Err(e);
                break;
            }
            Err(e) => warn!(error = %e, "Ingestion failed"),
        }
    }

    shutdown.cancel();
    drop(rx);
    if let Err(e) = fetcher.await {
        warn!(error = %e, "Fetch task ended abnormally");
    }

    let aborts: Vec<_> = workers.iter().map(|h| h.abort_handle()).collect();
    match tokio::time::timeout(grace, join_all(workers)).await {
        Ok(joined) => {
            for outcome in joined {
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        if result.is_ok() {
                            result = Err(e);
                        }
                    }
                    Err(e) => {
                        if result.is_ok() {
                            result = Err(PipelineError::Join(e.to_string()));
                        }
                    }
                }
            }
        }
        Err(_) => {
            warn!(
                grace_secs = grace.as_secs(),
                "Sink commits still running after grace period, aborting them"
            );
            for abort in aborts {
                abort.abort();
            }
        }
    }

    let stats = ctx.close().await?;
    result.map(|()| stats)
}

async fn fetch_loop<T: Ticker, S: SnapshotSource>(
    mut ticker: T,
    mut source: S,
    tx: mpsc::Sender<Snapshot>,
    shutdown: CancellationToken,
) {
    info!(source = %source.describe(), "Fetching snapshots");

    loop {
        let ticked = tokio::select! {
            _ = shutdown.cancelled() => break,
            ticked = ticker.tick() => ticked,
        };
        if !ticked {
            break;
        }

        let snapshots = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = source.poll() => polled,
        };

        match snapshots {
            Ok(snapshots) => {
                for snapshot in snapshots {
                    let sent = tokio::select! {
                        _ = shutdown.cancelled() => break,
                        sent = tx.send(snapshot) => sent,
                    };
                    if sent.is_err() {
                        return;
                    }
                }
            }
            // Fetch errors are transient; try again next tick.
            Err(e) => warn!(source = %source.describe(), error = %e, "Failed to fetch snapshot"),
        }
    }

    debug!("Fetch loop stopped");
}

/// Wait for a shutdown signal (SIGINT, SIGTERM, or SIGQUIT on Unix).
#[cfg(unix)]
pub async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut sigint, mut sigterm, mut sigquit) = match (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::quit()),
    ) {
        (Ok(int), Ok(term), Ok(quit)) => (int, term, quit),
        _ => {
            warn!("Failed to install signal handlers, falling back to Ctrl-C");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = sigint.recv() => {
            info!(signal = "SIGINT", "Signal received");
        }
        _ = sigterm.recv() => {
            info!(signal = "SIGTERM", "Signal received");
        }
        _ = sigquit.recv() => {
            info!(signal = "SIGQUIT", "Signal received");
        }
    }
}

/// Wait for Ctrl-C.
#[cfg(not(unix))]
pub async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!(signal = "ctrl-c", "Signal received");
    }
}
