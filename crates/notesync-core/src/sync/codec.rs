//! Conversion between local notes and remote note documents.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

use crate::error::{Error, Result};
use crate::models::{
    Attachment, Note, NotePayload, RemoteAttachment, RemoteNoteDocument, REMOTE_SCHEMA_VERSION,
};
use crate::ports::EncryptionProvider;
use crate::util::millis_to_datetime;

impl From<&Note> for NotePayload {
    fn from(note: &Note) -> Self {
        Self {
            title: note.title.clone(),
            content: note.content.clone(),
            plain_text: note.plain_text.clone(),
            flags: note.flags,
            labels: note.labels.clone(),
            color: note.color.clone(),
            reminder_at: note.reminder_at,
        }
    }
}

/// Build the remote document of `note`, encrypting the payload when the
/// encryption subsystem is ready.
pub async fn encode_note(
    encryption: &dyn EncryptionProvider,
    note: &Note,
    attachments: Vec<RemoteAttachment>,
) -> Result<RemoteNoteDocument> {
    let payload = NotePayload::from(note);
    let (payload, encrypted_payload) = if encryption.is_ready() {
        let ciphertext = encryption.encrypt(&serde_json::to_vec(&payload)?).await?;
        (None, Some(BASE64.encode(ciphertext)))
    } else {
        (Some(payload), None)
    };

    Ok(RemoteNoteDocument {
        schema_version: REMOTE_SCHEMA_VERSION,
        local_id: note.id,
        updated_at: millis_to_datetime(note.updated_at),
        deleted: Some(false),
        payload,
        encrypted_payload,
        attachments,
    })
}

/// Read the note fields of a remote document.
pub async fn decode_payload(
    encryption: &dyn EncryptionProvider,
    doc_id: &str,
    doc: &RemoteNoteDocument,
) -> Result<NotePayload> {
    if let Some(encoded) = &doc.encrypted_payload {
        if !encryption.is_ready() {
            return Err(Error::EncryptionNotReady);
        }
        let ciphertext = BASE64
            .decode(encoded)
            .map_err(|error| Error::Decryption(format!("{doc_id}: {error}")))?;
        let plaintext = encryption.decrypt(&ciphertext).await?;
        return serde_json::from_slice(&plaintext).map_err(|error| Error::InvalidDocument {
            doc_id: doc_id.to_string(),
            reason: error.to_string(),
        });
    }

    doc.payload.clone().ok_or_else(|| Error::InvalidDocument {
        doc_id: doc_id.to_string(),
        reason: "document has no payload".to_string(),
    })
}

/// Copy a remote version into `note`, keeping its local identity.
pub fn apply_payload(
    note: &mut Note,
    doc_id: &str,
    doc: &RemoteNoteDocument,
    payload: NotePayload,
    attachments: Vec<Attachment>,
) {
    note.title = payload.title;
    note.content = payload.content;
    note.plain_text = payload.plain_text;
    note.flags = payload.flags;
    note.labels = payload.labels;
    note.color = payload.color;
    note.reminder_at = payload.reminder_at;
    note.attachments = attachments;
    note.updated_at = doc.updated_at_millis();
    note.remote_id = Some(doc_id.to_string());
    if note.id == 0 {
        note.created_at = note.updated_at;
    }
}
