//! notesync-core - Offline-first note sync engine
//!
//! This crate contains the local note store, the persistent pull cache, the
//! conflict policy, attachment transfers and the sync coordinator shared by
//! every notesync front end.

pub mod config;
pub mod db;
pub mod error;
pub mod models;
pub mod ports;
pub mod services;
pub mod state;
pub mod storage;
pub mod sync;
pub mod util;

#[cfg(test)]
mod testing;

pub use config::SyncConfig;
pub use error::{Error, Result};
pub use models::{LocalId, Note};
