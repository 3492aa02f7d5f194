//! Refreshed profile data returned by providers

use crate::models::AffiliationStatus;
use serde::{Deserialize, Serialize};

/// Partial profile update
///
/// `None` fields leave the stored value alone. Source links and founder
/// links are merged, never replaced.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityPayload {
    /// Canonical display name as reported by the provider
    pub name: Option<String>,
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
    pub affiliation_status: Option<AffiliationStatus>,
    /// Company only; ignored for founders
    pub founders: Vec<FounderLink>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FounderLink {
    pub name: String,
    pub title: Option<String>,
}

/// Union of `existing` and `incoming`, first occurrence wins
pub fn merge_links(existing: &[String], incoming: &[String]) -> Vec<String> {
    let mut merged: Vec<String> = Vec::with_capacity(existing.len() + incoming.len());
    for link in existing.iter().chain(incoming.iter()) {
        let link = link.trim();
        if !link.is_empty() && !merged.iter().any(|l| l == link) {
            merged.push(link.to_string());
        }
    }
    merged
}
