//! Recent posts from a Nitter instance's RSS timeline

use crate::models::{EntityPayload, EntityRef, FetchResult};
use crate::providers::{classify_status, classify_transport_error, retry_after_header, ProviderAdapter};
use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

pub const NITTER_BASE_URL: &str = "https://nitter.net";

pub struct NitterProvider {
    http: reqwest::Client,
    base_url: String,
    max_posts: usize,
}

impl NitterProvider {
    pub fn new(http: reqwest::Client, base_url: impl Into<String>, max_posts: usize) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            max_posts,
        }
    }
}

#[async_trait]
impl ProviderAdapter for NitterProvider {
    fn name(&self) -> &str {
        "nitter"
    }

    async fn fetch(&self, entity: &EntityRef) -> FetchResult {
        // Nothing to look up yet; a search refresh may fill the handle in later
        let Some(handle) = entity.twitter_handle.as_deref().map(str::trim).filter(|h| !h.is_empty()) else {
            return FetchResult::Success(EntityPayload::default());
        };
        let handle = handle.trim_start_matches('@');

        let url = format!("{}/{}/rss", self.base_url, handle);
        debug!(entity_id = entity.id, handle, "Fetching Nitter timeline");

        let response = match self.http.get(&url).send().await {
            Ok(response) => response,
            Err(e) => return classify_transport_error(&e),
        };

        if let Some(failure) = classify_status(response.status(), retry_after_header(response.headers())) {
            return failure;
        }

        let body = match response.text().await {
            Ok(body) => body,
            Err(e) => return classify_transport_error(&e),
        };

        match timeline_payload(handle, &body, self.max_posts) {
            Ok(payload) => FetchResult::Success(payload),
            Err(e) => FetchResult::transient(format!("malformed RSS from {}: {}", self.base_url, e)),
        }
    }
}

/// Payload from an RSS document; an empty timeline yields an empty payload
pub fn timeline_payload(handle: &str, rss: &str, max_posts: usize) -> Result<EntityPayload, quick_xml::Error> {
    let posts: Vec<String> = item_titles(rss)?.into_iter().take(max_posts).collect();
    if posts.is_empty() {
        return Ok(EntityPayload::default());
    }

    Ok(EntityPayload {
        twitter_summary: Some(posts.join("\n")),
        source_links: vec![format!("https://twitter.com/{}", handle)],
        ..Default::default()
    })
}

/// `<title>` of every `<item>`, in document order
fn item_titles(rss: &str) -> Result<Vec<String>, quick_xml::Error> {
    let mut reader = Reader::from_str(rss);
    let mut titles = Vec::new();
    let mut in_item = false;
    let mut title: Option<String> = None;

    loop {
        match reader.read_event()? {
            Event::Start(ref e) => match e.local_name().as_ref() {
                b"item" => in_item = true,
                b"title" if in_item => title = Some(String::new()),
                _ => {}
            },
            Event::End(ref e) => match e.local_name().as_ref() {
                b"item" => in_item = false,
                b"title" => {
                    if let Some(text) = title.take() {
                        let text = text.trim();
                        if !text.is_empty() {
                            titles.push(text.to_string());
                        }
                    }
                }
                _ => {}
            },
            Event::Text(ref e) => {
                if let Some(text) = title.as_mut() {
                    text.push_str(&e.unescape()?);
                }
            }
            Event::CData(e) => {
                if let Some(text) = title.as_mut() {
                    text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(titles)
}
