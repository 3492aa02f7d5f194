//! SerpApi web search: entity refresh and broad discovery queries

use crate::models::{AffiliationStatus, EntityKind, EntityPayload, EntityRef, FetchResult, FounderLink};
use crate::providers::{
    classify_status, classify_transport_error, retry_after_header, ProviderAdapter,
    DEFAULT_RETRY_AFTER,
};
use crate::services::discovery::{Candidate, DiscoveryQuery, DiscoverySource};
use async_trait::async_trait;
use reqwest::Url;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::debug;

pub const SERPAPI_BASE_URL: &str = "https://serpapi.com/search.json";

/// Source links kept per refresh
const MAX_SOURCE_LINKS: usize = 10;

/// Twitter/X paths that are not user handles
const RESERVED_TWITTER_PATHS: &[&str] = &["search", "hashtag", "i", "intent", "home", "share", "explore"];

/// One organic search result
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct OrganicResult {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub snippet: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    organic_results: Vec<OrganicResult>,
    error: Option<String>,
}

/// When a search result counts as evidence of the university affiliation
#[derive(Debug, Clone, PartialEq)]
pub struct AffiliationRule {
    /// e.g. "Duke University"
    pub institution: String,
    /// e.g. ["duke.edu"]
    pub domains: Vec<String>,
}

impl AffiliationRule {
    /// Confirmed when a result lives on an institution domain or names both
    /// the institution and the entity. Absence of evidence is not rejection.
    pub fn assess(&self, entity_name: &str, results: &[OrganicResult]) -> Option<AffiliationStatus> {
        let institution = self.institution.to_lowercase();
        let entity = entity_name.to_lowercase();

        let confirmed = results.iter().any(|r| {
            let on_domain = host_of(&r.link).is_some_and(|host| {
                self.domains
                    .iter()
                    .any(|d| host == d.as_str() || host.ends_with(&format!(".{}", d)))
            });
            let text = format!("{} {}", r.title, r.snippet.as_deref().unwrap_or("")).to_lowercase();
            on_domain || (!institution.is_empty() && text.contains(&institution) && text.contains(&entity))
        });

        confirmed.then_some(AffiliationStatus::Confirmed)
    }
}

/// Thin SerpApi client shared by the refresh adapter and discovery
pub struct SerpApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    results_per_query: u32,
    country: String,
}

impl SerpApiClient {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            api_key: api_key.into(),
            results_per_query: 20,
            country: "us".to_string(),
        }
    }

    pub fn with_results_per_query(mut self, num: u32) -> Self {
        self.results_per_query = num;
        self
    }

    /// Run one Google search; `time_filter` is a `qdr:` value such as `m6`
    pub async fn search(&self, query: &str, time_filter: Option<&str>) -> FetchResult<Vec<OrganicResult>> {
        let num = self.results_per_query.to_string();
        let mut params: Vec<(&str, &str)> = vec![
            ("engine", "google"),
            ("q", query),
            ("api_key", self.api_key.as_str()),
            ("num", num.as_str()),
            ("gl", self.country.as_str()),
        ];
        let tbs = time_filter.map(|tf| format!("qdr:{}", tf));
        if let Some(tbs) = tbs.as_deref() {
            params.push(("tbs", tbs));
        }

        debug!(query, time_filter, "Querying SerpApi");

        let response = match self.http.get(&self.base_url).query(&params).send().await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        if let Some(failure) = classify_status(response.status(), retry_after_header(response.headers())) {
            return failure;
        }

        let body: SearchResponse = match response.json().await {
            Ok(body) => body,
            Err(e) => return FetchResult::transient(format!("malformed SerpApi response: {}", e)),
        };

        match body.error {
            // SerpApi reports an empty result page as an error string
            Some(msg) if msg.contains("hasn't returned any results") => FetchResult::Success(Vec::new()),
            Some(msg) if msg.contains("run out of searches") => FetchResult::RateLimited {
                retry_after: DEFAULT_RETRY_AFTER,
            },
            Some(msg) => FetchResult::permanent(msg),
            None => FetchResult::Success(body.organic_results),
        }
    }
}

/// Entity refresh through web search
pub struct SerpProvider {
    client: Arc<SerpApiClient>,
    affiliation: AffiliationRule,
}

impl SerpProvider {
    pub fn new(client: Arc<SerpApiClient>, affiliation: AffiliationRule) -> Self {
        Self { client, affiliation }
    }

    fn query_for(&self, entity: &EntityRef) -> String {
        match entity.kind {
            EntityKind::Company => format!("\"{}\" startup", entity.name),
            EntityKind::Founder => format!("\"{}\" founder {}", entity.name, self.affiliation.institution),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SerpProvider {
    fn name(&self) -> &str {
        "serp"
    }

    async fn fetch(&self, entity: &EntityRef) -> FetchResult {
        let query = self.query_for(entity);
        match self.client.search(&query, None).await {
            FetchResult::Success(results) if results.is_empty() => {
                FetchResult::permanent(format!("no organic results for {}", entity.name))
            }
            other => other.map(|results| build_payload(entity, &results, &self.affiliation)),
        }
    }
}

/// Turn search results into a partial profile update
pub fn build_payload(entity: &EntityRef, results: &[OrganicResult], affiliation: &AffiliationRule) -> EntityPayload {
    let mut payload = EntityPayload {
        summary: results
            .iter()
            .filter_map(|r| r.snippet.as_deref())
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string),
        source_links: results
            .iter()
            .map(|r| r.link.trim())
            .filter(|l| !l.is_empty())
            .take(MAX_SOURCE_LINKS)
            .map(str::to_string)
            .collect(),
        affiliation_status: affiliation.assess(&entity.name, results),
        ..Default::default()
    };

    let profile_kind = match entity.kind {
        EntityKind::Company => "company",
        EntityKind::Founder => "in",
    };
    payload.linkedin_handle = results
        .iter()
        .find_map(|r| linkedin_slug(&r.link, profile_kind));
    payload.twitter_handle = results.iter().find_map(|r| twitter_handle(&r.link));

    match entity.kind {
        EntityKind::Founder => {
            let own_profile = results
                .iter()
                .find(|r| linkedin_slug(&r.link, "in").is_some())
                .map(|r| parse_profile_title(&r.title));
            if let Some((_, role, company)) = own_profile {
                payload.title = role;
                payload.current_company = company;
            }
        }
        EntityKind::Company => {
            let company = entity.name.to_lowercase();
            let mut seen = HashSet::new();
            for r in results {
                if linkedin_slug(&r.link, "in").is_none() {
                    continue;
                }
                let title_lower = r.title.to_lowercase();
                if !title_lower.contains("founder") || !title_lower.contains(&company) {
                    continue;
                }
                let (name, role, _) = parse_profile_title(&r.title);
                if !name.is_empty() && seen.insert(name.to_lowercase()) {
                    payload.founders.push(FounderLink { name, title: role });
                }
            }
        }
    }

    payload
}

/// Profile candidates found in broad search results
pub fn candidates_from_results(results: &[OrganicResult]) -> Vec<Candidate> {
    let mut seen = HashSet::new();
    let mut candidates = Vec::new();

    for r in results {
        let found = if let Some(slug) = linkedin_slug(&r.link, "company") {
            Some((EntityKind::Company, slug))
        } else if let Some(slug) = linkedin_slug(&r.link, "in") {
            Some((EntityKind::Founder, slug))
        } else {
            crunchbase_slug(&r.link).map(|slug| (EntityKind::Company, slug))
        };

        let Some((kind, slug)) = found else {
            continue;
        };

        let (title_name, _, _) = parse_profile_title(&r.title);
        let name = if title_name.is_empty() {
            humanize_slug(&slug)
        } else {
            title_name
        };

        if !name.is_empty() && seen.insert((kind, name.to_lowercase())) {
            candidates.push(Candidate { kind, name });
        }
    }

    candidates
}

/// Broad discovery searches through SerpApi
pub struct SerpDiscoverySource {
    client: Arc<SerpApiClient>,
}

impl SerpDiscoverySource {
    pub fn new(client: Arc<SerpApiClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl DiscoverySource for SerpDiscoverySource {
    fn provider(&self) -> &str {
        "serp"
    }

    async fn search(&self, query: &DiscoveryQuery) -> FetchResult<Vec<Candidate>> {
        self.client
            .search(&query.query, query.time_filter.as_deref())
            .await
            .map(|results| candidates_from_results(&results))
    }
}

fn host_of(link: &str) -> Option<String> {
    let url = Url::parse(link).ok()?;
    let host = url.host_str()?.to_lowercase();
    Some(host.strip_prefix("www.").unwrap_or(&host).to_string())
}

fn path_segments(link: &str) -> Vec<String> {
    Url::parse(link)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .map(|segs| segs.filter(|s| !s.is_empty()).map(str::to_string).collect())
        })
        .unwrap_or_default()
}

/// `linkedin.com/<kind>/<slug>` → slug
fn linkedin_slug(link: &str, kind: &str) -> Option<String> {
    let host = host_of(link)?;
    if host != "linkedin.com" && !host.ends_with(".linkedin.com") {
        return None;
    }
    match path_segments(link).as_slice() {
        [k, slug, ..] if k == kind => Some(slug.clone()),
        _ => None,
    }
}

fn crunchbase_slug(link: &str) -> Option<String> {
    if host_of(link)? != "crunchbase.com" {
        return None;
    }
    match path_segments(link).as_slice() {
        [k, slug, ..] if k == "organization" => Some(slug.clone()),
        _ => None,
    }
}

fn twitter_handle(link: &str) -> Option<String> {
    let host = host_of(link)?;
    if host != "twitter.com" && host != "x.com" {
        return None;
    }
    let segments = path_segments(link);
    let handle = segments.first()?;
    if RESERVED_TWITTER_PATHS.contains(&handle.as_str()) {
        return None;
    }
    Some(handle.trim_start_matches('@').to_string())
}

/// "Jane Doe - Co-Founder & CEO - Acme | LinkedIn" → (name, role, company)
fn parse_profile_title(title: &str) -> (String, Option<String>, Option<String>) {
    let main = title.split(" | ").next().unwrap_or("");
    let mut parts = main.split(" - ").map(str::trim).filter(|p| !p.is_empty());
    let name = parts.next().unwrap_or("").to_string();
    let role = parts.next().map(str::to_string);
    let company = parts.next().map(str::to_string);
    (name, role, company)
}

fn humanize_slug(slug: &str) -> String {
    slug.split('-')
        .filter(|w| !w.is_empty() && !w.chars().all(|c| c.is_ascii_digit()))
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(title: &str, link: &str, snippet: &str) -> OrganicResult {
        OrganicResult {
            title: title.to_string(),
            link: link.to_string(),
            snippet: Some(snippet.to_string()),
        }
    }

    fn duke() -> AffiliationRule {
        AffiliationRule {
            institution: "Duke University".to_string(),
            domains: vec!["duke.edu".to_string()],
        }
    }

    fn company(name: &str) -> EntityRef {
        EntityRef {
            id: 1,
            kind: EntityKind::Company,
            name: name.to_string(),
            last_refreshed_at: None,
            twitter_handle: None,
        }
    }

    #[test]
    fn test_company_payload_from_results() {
        let results = vec![
            result(
                "Acme Robotics | LinkedIn",
                "https://www.linkedin.com/company/acme-robotics/",
                "Acme builds warehouse robots.",
            ),
            result(
                "Jane Doe - Co-Founder & CEO - Acme Robotics | LinkedIn",
                "https://www.linkedin.com/in/janedoe",
                "Duke University alumna",
            ),
            result("Acme (@acmebots) / X", "https://x.com/acmebots", ""),
        ];

        let payload = build_payload(&company("Acme Robotics"), &results, &duke());

        assert_eq!(payload.summary.as_deref(), Some("Acme builds warehouse robots."));
        assert_eq!(payload.linkedin_handle.as_deref(), Some("acme-robotics"));
        assert_eq!(payload.twitter_handle.as_deref(), Some("acmebots"));
        assert_eq!(payload.source_links.len(), 3);
        assert_eq!(
            payload.founders,
            vec![FounderLink {
                name: "Jane Doe".to_string(),
                title: Some("Co-Founder & CEO".to_string()),
            }]
        );
        assert_eq!(payload.affiliation_status, Some(AffiliationStatus::Confirmed));
    }

    #[test]
    fn test_affiliation_confirmed_by_domain_or_mention() {
        let by_domain = vec![result("Startup spotlight", "https://today.duke.edu/2024/acme", "")];
        assert_eq!(
            duke().assess("Acme", &by_domain),
            Some(AffiliationStatus::Confirmed)
        );

        let by_mention = vec![result(
            "Acme raises seed round",
            "https://news.example/acme",
            "Founded by Duke University graduates",
        )];
        assert_eq!(
            duke().assess("Acme", &by_mention),
            Some(AffiliationStatus::Confirmed)
        );

        let unrelated = vec![result("Acme", "https://acme.example", "Robots")];
        assert_eq!(duke().assess("Acme", &unrelated), None);
    }

    #[test]
    fn test_founder_payload_reads_role_and_company() {
        let founder = EntityRef {
            kind: EntityKind::Founder,
            name: "Jane Doe".to_string(),
            ..company("")
        };
        let results = vec![result(
            "Jane Doe - Co-Founder - Acme Robotics | LinkedIn",
            "https://linkedin.com/in/janedoe",
            "Jane Doe, Duke University",
        )];

        let payload = build_payload(&founder, &results, &duke());
        assert_eq!(payload.title.as_deref(), Some("Co-Founder"));
        assert_eq!(payload.current_company.as_deref(), Some("Acme Robotics"));
        assert_eq!(payload.linkedin_handle.as_deref(), Some("janedoe"));
        assert_eq!(payload.affiliation_status, Some(AffiliationStatus::Confirmed));
        assert!(payload.founders.is_empty());
    }

    #[test]
    fn test_candidates_from_profile_links() {
        let results = vec![
            result("Acme Robotics | LinkedIn", "https://www.linkedin.com/company/acme-robotics", ""),
            result("", "https://www.crunchbase.com/organization/blue-fin-labs", ""),
            result("Jane Doe - Founder | LinkedIn", "https://www.linkedin.com/in/jane-doe", ""),
            result("ACME ROBOTICS | LinkedIn", "https://linkedin.com/company/acme-robotics-2", ""),
            result("Some article", "https://news.example/acme", ""),
        ];

        let candidates = candidates_from_results(&results);
        assert_eq!(
            candidates,
            vec![
                Candidate {
                    kind: EntityKind::Company,
                    name: "Acme Robotics".to_string()
                },
                Candidate {
                    kind: EntityKind::Company,
                    name: "Blue Fin Labs".to_string()
                },
                Candidate {
                    kind: EntityKind::Founder,
                    name: "Jane Doe".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_reserved_twitter_paths_are_not_handles() {
        assert_eq!(twitter_handle("https://twitter.com/search?q=acme"), None);
        assert_eq!(twitter_handle("https://twitter.com/acme/status/1"), Some("acme".to_string()));
        assert_eq!(twitter_handle("https://example.com/acme"), None);
    }
}
