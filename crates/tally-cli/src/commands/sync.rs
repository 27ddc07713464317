use tally_core::sync::SyncStatus;
use tally_core::{EngineConfig, SyncReport};

use crate::commands::common::{
    ensure_sync_configured, format_sync_conflict_lines, format_sync_timestamp, open_service,
    sync_conflict_to_item, SyncConflictItem,
};
use crate::error::CliError;

pub async fn run_sync(full: bool, config: &EngineConfig) -> Result<(), CliError> {
    let service = open_service(config).await?;
    ensure_sync_configured(&service)?;

    let report = if full {
        service.full_sync().await?
    } else {
        service.sync_now().await?
    };

    for line in format_report_lines(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_report_lines(report: &SyncReport) -> Vec<String> {
    let mut lines = vec![format!(
        "{} pushed, {} pulled, {} conflicts",
        report.total_pushed(),
        report.total_pulled(),
        report.conflicts.len()
    )];
    lines.extend(report.conflicts.iter().map(|conflict| {
        format!(
            "  {} {} -> {} ({})",
            conflict.kind,
            conflict.id,
            conflict.resolution.as_str(),
            conflict.reason
        )
    }));
    if report.success {
        lines.push("Sync completed".to_string());
    } else {
        lines.push(format!("Last attempt had {} errors:", report.errors.len()));
        lines.extend(report.errors.iter().map(|error| format!("  {error}")));
    }
    lines
}

pub async fn run_sync_status(as_json: bool, config: &EngineConfig) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let status = service.sync_status().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub fn format_status_lines(status: &SyncStatus) -> Vec<String> {
    vec![
        format!("phase:        {:?}", status.phase),
        format!(
            "last sync:    {}",
            format_sync_timestamp(status.metadata.last_sync_timestamp)
        ),
        format!(
            "last full:    {}",
            format_sync_timestamp(status.metadata.last_full_sync_timestamp)
        ),
        format!("pending:      {}", status.pending_changes),
    ]
}

pub async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    config: &EngineConfig,
) -> Result<(), CliError> {
    let service = open_service(config).await?;
    let conflicts = service.list_conflicts(limit).await?;

    if as_json {
        let json_items = conflicts
            .iter()
            .map(sync_conflict_to_item)
            .collect::<Vec<SyncConflictItem>>();
        println!("{}", serde_json::to_string_pretty(&json_items)?);
        return Ok(());
    }

    if conflicts.is_empty() {
        println!("No sync conflicts recorded.");
        return Ok(());
    }

    for line in format_sync_conflict_lines(&conflicts) {
        println!("{line}");
    }
    Ok(())
}
