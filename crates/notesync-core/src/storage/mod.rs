//! Concrete backends for the blob, document and file system ports.

mod folder;
mod keys;
mod local_fs;
mod r2;

pub use folder::{FolderBlobStore, FolderDocumentStore};
pub use keys::{build_attachment_key, normalize_object_key, sanitize_file_name, sanitize_token};
pub use local_fs::LocalFileSystem;
pub use r2::{R2Config, R2Storage};
