//! # whisper-store
//!
//! Durable storage for the Whisper relay server, backed by SQLite.
//!
//! Holds everything that must survive a restart: identities, devices,
//! groups and their rosters, audit events, contact backups, attachment
//! records and grants, and bans. The crate exposes a synchronous
//! [`Database`] handle wrapping a `rusqlite::Connection` with typed helpers
//! for every table; multi-row mutations run inside a transaction.

pub mod accounts;
pub mod attachments;
pub mod audit;
pub mod backups;
pub mod database;
pub mod devices;
pub mod groups;
pub mod identities;
pub mod migrations;
pub mod models;

mod error;
mod time;

pub use database::Database;
pub use error::StoreError;
pub use models::*;
