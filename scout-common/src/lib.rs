//! # Scout Common Library
//!
//! Shared code for the scout services including:
//! - Error type and result alias
//! - Bootstrap configuration loading (TOML + environment)
//! - Event types (ScoutEvent enum) and the EventBus
//! - SSE helpers for admin streams
//! - SQLite schema initialization
//! - Time helpers

pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod error;
pub mod events;
pub mod sse;
pub mod time;

pub use error::{Error, Result};
