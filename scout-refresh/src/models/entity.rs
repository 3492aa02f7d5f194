//! Tracked entities: companies and founders

use crate::models::FounderLink;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Company or founder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Company,
    Founder,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Company => "company",
            EntityKind::Founder => "founder",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = scout_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "company" => Ok(EntityKind::Company),
            "founder" => Ok(EntityKind::Founder),
            other => Err(scout_common::Error::InvalidInput(format!(
                "unknown entity kind '{}'",
                other
            ))),
        }
    }
}

/// University affiliation verdict
///
/// Moves only out of `Unknown`; a confirmed or rejected entity keeps its
/// status until someone overrides it by hand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffiliationStatus {
    #[default]
    Unknown,
    Confirmed,
    Rejected,
}

impl AffiliationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AffiliationStatus::Unknown => "unknown",
            AffiliationStatus::Confirmed => "confirmed",
            AffiliationStatus::Rejected => "rejected",
        }
    }

    /// Status after merging a fetched verdict into the current one
    pub fn merge(self, fetched: Option<AffiliationStatus>) -> AffiliationStatus {
        match (self, fetched) {
            (AffiliationStatus::Unknown, Some(next)) => next,
            (current, _) => current,
        }
    }
}

impl FromStr for AffiliationStatus {
    type Err = scout_common::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unknown" => Ok(AffiliationStatus::Unknown),
            "confirmed" => Ok(AffiliationStatus::Confirmed),
            "rejected" => Ok(AffiliationStatus::Rejected),
            other => Err(scout_common::Error::InvalidInput(format!(
                "unknown affiliation status '{}'",
                other
            ))),
        }
    }
}

/// The slice of an entity the scheduler and provider adapters need
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityRef {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    /// Known Twitter/X handle, used by timeline providers
    pub twitter_handle: Option<String>,
}

impl EntityRef {
    /// Refresh priority at `now`: age of the data in milliseconds
    ///
    /// Never-refreshed entities get the highest priority. Derived, never stored.
    pub fn refresh_priority(&self, now: DateTime<Utc>) -> i64 {
        match self.last_refreshed_at {
            None => i64::MAX,
            Some(ts) => (now - ts).num_milliseconds().max(0),
        }
    }
}

/// Full persisted entity record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub kind: EntityKind,
    pub name: String,
    pub summary: Option<String>,
    pub industry: Option<String>,
    pub location: Option<String>,
    pub founded: Option<String>,
    pub funding_stage: Option<String>,
    pub title: Option<String>,
    pub current_company: Option<String>,
    pub twitter_handle: Option<String>,
    pub linkedin_handle: Option<String>,
    pub twitter_summary: Option<String>,
    pub source_links: Vec<String>,
    pub affiliation_status: AffiliationStatus,
    pub relevance_score: Option<f64>,
    pub last_refreshed_at: Option<DateTime<Utc>>,
    pub refresh_blocked_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub founders: Vec<FounderLink>,
}
