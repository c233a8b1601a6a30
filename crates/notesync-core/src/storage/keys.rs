//! Object key helpers shared by blob backends.

use uuid::Uuid;

use crate::util::unix_millis_now;
use crate::{Error, Result};

/// Build a unique object key namespace for an attachment of `owner`.
///
/// `notes/<owner>/<unix-ms>-<uuid-v7>-<sanitized file name>`
pub fn build_attachment_key(owner: &str, file_name: &str) -> Result<String> {
    let owner = sanitize_token(owner);
    if owner.is_empty() {
        return Err(Error::InvalidInput(
            "Attachment owner cannot be empty".to_string(),
        ));
    }

    let file_name = sanitize_file_name(file_name);
    let ts = unix_millis_now();
    let id = Uuid::now_v7();

    Ok(format!("notes/{owner}/{ts}-{id}-{file_name}"))
}

/// Trim whitespace and slashes, rejecting empty keys and parent segments.
pub fn normalize_object_key(object_key: &str) -> Result<String> {
    let object_key = object_key.trim().trim_matches('/').to_string();
    if object_key.is_empty() {
        return Err(Error::InvalidInput(
            "Attachment object_key cannot be empty".to_string(),
        ));
    }
    if object_key.split('/').any(|segment| segment == "..") {
        return Err(Error::InvalidInput(format!(
            "Attachment object_key must not contain '..': {object_key}"
        )));
    }
    Ok(object_key)
}

/// Lowercase ASCII file name with a preserved extension.
pub fn sanitize_file_name(file_name: &str) -> String {
    let trimmed = file_name.trim().trim_matches('/');
    if trimmed.is_empty() {
        return "file".to_string();
    }

    let (stem, ext) = trimmed
        .rsplit_once('.')
        .map_or((trimmed, ""), |parts| parts);
    let stem = sanitize_token(stem);
    let stem = if stem.is_empty() {
        "file".to_string()
    } else {
        stem
    };
    let ext = sanitize_token(ext);

    if ext.is_empty() {
        stem
    } else {
        format!("{stem}.{ext}")
    }
}

/// Collapse every run of non-alphanumeric characters into one dash.
pub fn sanitize_token(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut last_dash = false;

    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }

    out.trim_matches('-').to_string()
}
