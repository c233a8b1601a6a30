//! Service layer over the local database

mod database;

pub use database::DatabaseService;
