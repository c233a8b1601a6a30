use std::path::Path;

use notesync_core::models::PendingLocalChange;
use notesync_core::ports::ChangeLedger;
use notesync_core::state::SyncReport;
use notesync_core::sync::SyncCacheMetadata;
use serde::Serialize;

use crate::commands::common::{
    format_sync_conflict_lines, format_sync_timestamp, open_database, sync_conflict_to_item,
    SyncConflictItem,
};
use crate::engine::{open_sync_context, SyncContext};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct SyncStatusReport {
    pub profile: String,
    pub blob_backend: String,
    pub blob_backend_error: Option<String>,
    pub pending: Vec<PendingLocalChange>,
    pub cache: SyncCacheMetadata,
}

pub async fn run_sync(db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let context = open_sync_context(db_path, profile).await?;
    let report = context.coordinator.refresh().await;
    context.coordinator.dispose();

    for line in format_sync_report(&report) {
        println!("{line}");
    }
    Ok(())
}

pub fn format_sync_report(report: &SyncReport) -> Vec<String> {
    if report.skipped {
        return vec!["Sync skipped; check NOTESYNC_PASSPHRASE and whether the profile is restricted".to_string()];
    }

    let mut lines = vec![format!(
        "Sync completed: {} pushed, {} applied, {} deleted",
        report.pushed, report.applied, report.deleted
    )];
    if report.deferred > 0 {
        lines.push(format!(
            "{} encrypted notes are waiting for NOTESYNC_PASSPHRASE",
            report.deferred
        ));
    }
    if !report.is_clean() {
        let ids = report
            .failed
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        lines.push(format!("Failed notes: {ids}"));
    }
    lines
}

pub async fn run_sync_status(
    db_path: &Path,
    profile: Option<&str>,
    as_json: bool,
) -> Result<(), CliError> {
    let context = open_sync_context(db_path, profile).await?;
    let report = collect_status(&context).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Profile:      {}", report.profile);
    match &report.blob_backend_error {
        Some(error) => println!("Blobs:        {} (unreachable: {error})", report.blob_backend),
        None => println!("Blobs:        {}", report.blob_backend),
    }
    println!(
        "Watermark:    {}",
        report
            .cache
            .last_synced_at
            .map_or_else(|| "never".to_string(), |at| format_sync_timestamp(at.timestamp_millis()))
    );
    if report.cache.is_resumable() {
        println!(
            "Pull session: interrupted, {} page(s) outstanding",
            report.cache.outstanding_pages.len()
        );
    }

    if report.pending.is_empty() {
        println!("No pending local changes.");
    } else {
        println!("Pending local changes:");
        for change in &report.pending {
            let error = change
                .last_error
                .as_deref()
                .map_or_else(String::new, |error| format!("  ({error})"));
            println!(
                "  note={:<6} {:<6} {:<11} retries={}{error}",
                change.local_id,
                change.action.to_string(),
                change.status.to_string(),
                change.retry_count
            );
        }
    }
    Ok(())
}

async fn collect_status(context: &SyncContext) -> Result<SyncStatusReport, CliError> {
    let blob_backend_error = context.blobs.check().await.err().map(|error| error.to_string());
    Ok(SyncStatusReport {
        profile: context.profile_name.clone(),
        blob_backend: context.blobs.describe(),
        blob_backend_error,
        pending: context.db.list_changes(true).await?,
        cache: context.coordinator.cache_metadata().await?,
    })
}

pub async fn run_sync_conflicts(
    limit: usize,
    as_json: bool,
    db_path: &Path,
) -> Result<(), CliError> {
    let db = open_database(db_path).await?;
    let conflicts = db.list_conflicts(limit).await?;

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

pub async fn run_sync_reset(db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let context = open_sync_context(db_path, profile).await?;
    context.coordinator.reset().await?;
    println!("Pull cache cleared; the next sync fetches every remote note again");
    Ok(())
}
