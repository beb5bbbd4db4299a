//! Persistence layer - SQLite metadata store

mod database;

pub use database::{Database, HistoryEvent};
