//! # capsule-store
//!
//! SQLite persistence for Time Capsule Cloud.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection` with typed helpers for capsule records, encrypted
//! payload blobs and in-app notifications. Capsule state changes go through
//! conditional updates so concurrent writers (scheduler ticks, manual unlock
//! requests, other processes sharing the file) cannot double-apply them.

pub mod capsules;
pub mod database;
pub mod migrations;
pub mod models;
pub mod notifications;
pub mod payloads;

mod convert;
mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
