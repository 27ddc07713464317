use tally_core::sync::{NetworkWatcher, SyncEvent};
use tally_core::EngineConfig;
use tokio::sync::broadcast::error::RecvError;

use crate::commands::common::{ensure_sync_configured, open_service};
use crate::commands::sync::format_report_lines;
use crate::error::CliError;

/// Run the scheduler and connectivity watcher until Ctrl-C.
pub async fn run_watch(as_json: bool, config: &EngineConfig) -> Result<(), CliError> {
    let service = open_service(config).await?;
    ensure_sync_configured(&service)?;

    let scheduler = service.start_scheduler(config.scheduler_config());
    let mut events = scheduler.subscribe();
    let watcher = NetworkWatcher::new(
        service.orchestrator().remote().backend().clone(),
        config.poll_interval,
        scheduler.clone(),
    )
    .spawn();

    // the watcher's first check arms a pass, which catches up on offline writes
    tracing::info!("Watching for changes; press Ctrl-C to stop");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event, as_json)?,
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Dropped scheduler events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.shutdown().await;
    watcher.abort();
    Ok(())
}

fn print_event(event: &SyncEvent, as_json: bool) -> Result<(), CliError> {
    if as_json {
        println!("{}", serde_json::to_string(event)?);
        return Ok(());
    }

    match event {
        SyncEvent::ConnectivityChanged { online } => {
            println!("{}", if *online { "Online" } else { "Offline" });
        }
        SyncEvent::PassStarted { mode, attempt } => {
            println!("Sync started ({mode:?}, attempt {attempt})");
        }
        SyncEvent::PassCompleted { report, .. } => {
            for line in format_report_lines(report) {
                println!("{line}");
            }
        }
        SyncEvent::PassFailed {
            error, retry_in_ms, ..
        } => match retry_in_ms {
            Some(delay) => println!("Sync failed: {error}; retrying in {delay} ms"),
            None => println!("Sync failed: {error}"),
        },
        SyncEvent::PassSkipped { reason } => println!("Sync skipped: {reason}"),
        SyncEvent::RetriesExhausted { attempts, error } => {
            println!("Sync gave up after {attempts} attempts: {error}");
        }
    }
    Ok(())
}
