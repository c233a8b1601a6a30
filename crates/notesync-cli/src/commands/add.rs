use std::path::{Path, PathBuf};

use notesync_core::models::Attachment;
use notesync_core::Note;

use crate::commands::common::{attachment_kind_for, open_database, resolve_note_content};
use crate::error::CliError;

pub async fn run_add(
    title: Option<&str>,
    labels: &[String],
    attachments: &[PathBuf],
    content_parts: &[String],
    db_path: &Path,
) -> Result<(), CliError> {
    let content = if content_parts.is_empty() && (title.is_some() || !attachments.is_empty()) {
        String::new()
    } else {
        resolve_note_content(content_parts)?
    };

    let mut note = Note::new(title.map(str::trim).unwrap_or_default(), content);
    note.labels = labels
        .iter()
        .map(|label| label.trim().to_string())
        .filter(|label| !label.is_empty())
        .collect();
    for path in attachments {
        let path = std::fs::canonicalize(path)?;
        note.attachments.push(Attachment::new(
            attachment_kind_for(&path),
            path.to_string_lossy(),
        ));
    }

    let db = open_database(db_path).await?;
    let note = db.create_note(&note).await?;

    println!("{}", note.id);
    Ok(())
}
