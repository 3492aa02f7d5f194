//! Domain models for the refresh scheduler

pub mod entity;
pub mod fetch;
pub mod payload;
pub mod task;

pub use entity::{AffiliationStatus, Entity, EntityKind, EntityRef};
pub use fetch::FetchResult;
pub use payload::{EntityPayload, FounderLink};
pub use task::{RefreshTask, TaskKey};
