use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "notesync")]
#[command(about = "Offline-first notes that sync across devices")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Optional path to local database file
    #[arg(long, global = true, value_name = "PATH")]
    pub db_path: Option<PathBuf>,

    /// CLI profile name holding account and remote configuration
    #[arg(long, global = true, value_name = "NAME")]
    pub profile: Option<String>,

    /// Quick capture: notesync "my thought here"
    #[arg(trailing_var_arg = true)]
    pub note: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a new note
    #[command(alias = "new")]
    Add {
        /// Note title
        #[arg(short, long)]
        title: Option<String>,
        /// Label to attach (repeatable)
        #[arg(short, long = "label")]
        labels: Vec<String>,
        /// File to attach (repeatable)
        #[arg(short, long = "attach", value_name = "PATH")]
        attachments: Vec<PathBuf>,
        /// Note content
        content: Vec<String>,
    },
    /// List recent notes
    List {
        /// Number of notes to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Only notes carrying this label
        #[arg(long)]
        label: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Edit an existing note
    Edit {
        /// Local note ID or remote document ID
        id: String,
    },
    /// Delete an existing note
    Delete {
        /// Local note ID or remote document ID
        id: String,
    },
    /// Generate shell completion scripts
    Completions {
        /// Target shell
        #[arg(value_enum)]
        shell: CompletionShell,
        /// Optional output path (stdout when omitted)
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
    },
    /// Push local changes and pull remote ones (one pass)
    Sync {
        #[command(subcommand)]
        command: Option<SyncCommands>,
    },
    /// Keep syncing in the foreground until interrupted
    Watch,
    /// Configure CLI profiles
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum)]
pub enum CompletionShell {
    Bash,
    Zsh,
    Fish,
    #[value(name = "powershell")]
    PowerShell,
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, ValueEnum)]
pub enum BlobBackendArg {
    #[default]
    Folder,
    R2,
}

#[derive(Subcommand)]
pub enum SyncCommands {
    /// Show pending changes and the state of the pull cache
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List recently resolved sync conflicts
    Conflicts {
        /// Number of conflicts to show
        #[arg(short, long, default_value = "10")]
        limit: usize,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Forget the pull cache; the next sync fetches everything again
    Reset,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Initialize or update profile config
    Init {
        /// Profile name to initialize
        #[arg(long, value_name = "NAME")]
        profile: Option<String>,
        /// Account identifier notes are synced under
        #[arg(long, value_name = "ID")]
        user_id: Option<String>,
        /// Shared directory holding remote documents
        #[arg(long, value_name = "PATH")]
        remote_dir: Option<PathBuf>,
        /// Where attachment blobs are stored
        #[arg(long, value_enum)]
        blob_backend: Option<BlobBackendArg>,
        /// Blob directory for the folder backend (defaults to <remote-dir>/blobs)
        #[arg(long, value_name = "PATH")]
        blob_dir: Option<PathBuf>,
        /// Whether this account may push changes
        #[arg(long, value_name = "BOOL")]
        can_push: Option<bool>,
        /// Mark the account as one that may not sync at all
        #[arg(long, value_name = "BOOL")]
        restricted: Option<bool>,
        /// Path to a sync tuning JSON file
        #[arg(long, value_name = "PATH")]
        sync_config: Option<PathBuf>,
        /// Keep current active profile instead of activating this one
        #[arg(long)]
        no_activate: bool,
    },
}
