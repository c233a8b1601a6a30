//! notesync CLI - Offline-first notes from the command line
//!
//! Capture notes locally and sync them through a shared remote directory.

mod cli;
mod commands;
mod config_profiles;
mod crypto;
mod engine;
mod error;

use clap::{CommandFactory, Parser};
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands, SyncCommands};
use crate::commands::add::run_add;
use crate::commands::common::resolve_db_path;
use crate::commands::completions::run_completions;
use crate::commands::config::run_config;
use crate::commands::delete::run_delete;
use crate::commands::edit::run_edit;
use crate::commands::list::run_list;
use crate::commands::sync::{run_sync, run_sync_conflicts, run_sync_reset, run_sync_status};
use crate::commands::watch::run_watch;
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("notesync=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let profile = cli.profile.as_deref();

    match cli.command {
        Some(Commands::Add {
            title,
            labels,
            attachments,
            content,
        }) => {
            let db_path = resolve_db_path(cli.db_path)?;
            run_add(title.as_deref(), &labels, &attachments, &content, &db_path).await?;
        }
        Some(Commands::List { limit, label, json }) => {
            let db_path = resolve_db_path(cli.db_path)?;
            run_list(limit, label.as_deref(), json, &db_path).await?;
        }
        Some(Commands::Edit { id }) => run_edit(&id, &resolve_db_path(cli.db_path)?).await?,
        Some(Commands::Delete { id }) => run_delete(&id, &resolve_db_path(cli.db_path)?).await?,
        Some(Commands::Completions { shell, output }) => {
            run_completions(shell, output.as_deref())?;
        }
        Some(Commands::Sync { command }) => {
            let db_path = resolve_db_path(cli.db_path)?;
            match command {
                None => run_sync(&db_path, profile).await?,
                Some(SyncCommands::Status { json }) => {
                    run_sync_status(&db_path, profile, json).await?;
                }
                Some(SyncCommands::Conflicts { limit, json }) => {
                    run_sync_conflicts(limit, json, &db_path).await?;
                }
                Some(SyncCommands::Reset) => run_sync_reset(&db_path, profile).await?,
            }
        }
        Some(Commands::Watch) => run_watch(&resolve_db_path(cli.db_path)?, profile).await?,
        Some(Commands::Config { command }) => run_config(command, profile)?,
        None => {
            // Quick capture mode: notesync "my thought"
            if cli.note.is_empty() {
                Cli::command().print_help().map_err(CliError::Io)?;
                println!();
            } else {
                let db_path = resolve_db_path(cli.db_path)?;
                run_add(None, &[], &[], &cli.note, &db_path).await?;
            }
        }
    }

    Ok(())
}
