//! # parley-store
//!
//! Durable storage for the Parley chat server, backed by SQLite.
//!
//! The crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection` and provides typed helpers for every domain model.
//! Message appends run the capability check and the insert inside a single
//! transaction, so a message is either fully persisted or not at all.

pub mod access;
pub mod database;
pub mod friendships;
pub mod groups;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod push_subscriptions;
pub mod reactions;

mod columns;
mod error;

pub use access::AccessPolicy;
pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
