//! Admin HTTP API for scout-refresh
//!
//! Operators start and stop the loop, force an immediate tick or discovery
//! run, and read queue depth, budget levels and aggregate health.

pub mod admin;
pub mod health;
pub mod sse;

pub use admin::admin_routes;
pub use health::health_routes;
pub use sse::event_stream;
