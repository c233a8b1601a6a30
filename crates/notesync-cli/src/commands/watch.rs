use std::path::Path;

use notesync_core::state::SyncEvent;
use notesync_core::sync::{SyncScheduler, SyncTrigger};
use tokio::sync::broadcast::error::RecvError;

use crate::commands::sync::format_sync_report;
use crate::engine::open_sync_context;
use crate::error::CliError;

/// Sync in the foreground: live feed, periodic passes and Ctrl-C shutdown.
pub async fn run_watch(db_path: &Path, profile: Option<&str>) -> Result<(), CliError> {
    let context = open_sync_context(db_path, profile).await?;
    let coordinator = context.coordinator.clone();
    let mut events = coordinator.subscribe_events();

    coordinator.start().await?;
    let scheduler = SyncScheduler::spawn(coordinator.clone(), context.config.poll_interval());
    if !scheduler.trigger(SyncTrigger::Manual) {
        tracing::warn!("Initial sync could not be queued");
    }
    println!("Watching profile '{}' (Ctrl-C to stop)", context.profile_name);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!("Dropped {skipped} sync events");
                }
                Err(RecvError::Closed) => break,
            },
        }
    }

    scheduler.shutdown().await;
    println!("Stopped");
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::NoteApplied(local_id) => println!("updated  {local_id}"),
        SyncEvent::NoteDeleted(local_id) => println!("deleted  {local_id}"),
        SyncEvent::NoteFailed { local_id, error } => println!("failed   {local_id}: {error}"),
        SyncEvent::Reset => println!("remote state reset, refetching"),
        SyncEvent::Finished(report) if !report.skipped => {
            for line in format_sync_report(report) {
                println!("{line}");
            }
        }
        SyncEvent::PhaseChanged(_) | SyncEvent::Finished(_) => {}
    }
}
