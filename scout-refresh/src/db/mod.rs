//! Database access for the refresh scheduler

pub mod entities;
pub mod scoring;

pub use entities::{EntityStore, SchedulerRun, SqliteEntityStore};
pub use scoring::{ScoringSink, SqliteScoringQueue};
