use super::{SearchOptions, SearchResult, SourceAdapter, SourceError};
use crate::models::{ListingSource, ScrapedListing};
use crate::normalize;
use async_trait::async_trait;
use serde_json::json;
use std::{
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

const DEMO_CONDITIONS: [&str; 4] = ["new", "like new", "good", "fair"];

/// Deterministic offline fixtures, keyed on the query text.
pub struct DemoSource {
    source: ListingSource,
}

impl DemoSource {
    pub fn new(source: ListingSource) -> Self {
        Self { source }
    }

    fn link_for(&self, id: u64) -> String {
        match self.source {
            ListingSource::Craigslist => {
                format!("https://demo.craigslist.org/fuo/d/listing/{id}.html")
            }
            ListingSource::Facebook => {
                format!("https://www.facebook.com/marketplace/item/{id}/")
            }
        }
    }

    fn fixture(&self, query: &str, index: u64) -> Option<ScrapedListing> {
        let seed = seed_for(self.source, query);
        let id = 7_000_000_000 + (seed.wrapping_add(index) % 1_000_000_000);
        let dollars = 20 + (seed.wrapping_add(index * 37) % 480);
        let raw = json!({
            "id": id.to_string(),
            "title": format!("{} #{}", capitalize(query), index + 1),
            "price": format!("${dollars}"),
            "url": self.link_for(id),
            "condition": DEMO_CONDITIONS[(seed.wrapping_add(index) % DEMO_CONDITIONS.len() as u64) as usize],
            "location": "Minneapolis",
            "description": format!("Demo {} listing for '{query}'.", self.source),
        });
        normalize::from_raw(self.source, &raw)
    }
}

#[async_trait]
impl SourceAdapter for DemoSource {
    fn source(&self) -> ListingSource {
        self.source
    }

    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResult, SourceError> {
        let count = opts.limit.clamp(1, 4) as u64;
        let items = (0..count)
            .filter_map(|index| self.fixture(query, index))
            .collect();
        Ok(SearchResult {
            items,
            url: format!(
                "demo://{}/search?query={}",
                self.source,
                urlencoding::encode(query)
            ),
        })
    }

    async fn fetch_one(&self, url: &str) -> Result<ScrapedListing, SourceError> {
        let link =
            normalize::canonical_link(url).ok_or_else(|| SourceError::NotFound(url.to_string()))?;
        let raw = json!({
            "title": format!("Demo listing at {link}"),
            "price": "$100",
            "url": link,
            "condition": "good",
        });
        normalize::from_raw(self.source, &raw).ok_or_else(|| SourceError::NotFound(url.to_string()))
    }
}

fn seed_for(source: ListingSource, query: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    source.hash(&mut hasher);
    query.trim().to_ascii_lowercase().hash(&mut hasher);
    hasher.finish()
}

fn capitalize(value: &str) -> String {
    let trimmed = value.trim();
    let mut chars = trimmed.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => "Listing".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn demo_search_is_deterministic_per_query() {
        let source = DemoSource::new(ListingSource::Craigslist);
        let opts = SearchOptions {
            limit: 10,
            location: None,
        };
        let a = source.search("desk", &opts).await.expect("search");
        let b = source.search("Desk ", &opts).await.expect("search");
        assert_eq!(a.items.len(), 4);
        let links_a: Vec<_> = a.items.iter().map(|l| l.link.clone()).collect();
        let links_b: Vec<_> = b.items.iter().map(|l| l.link.clone()).collect();
        assert_eq!(links_a, links_b);
        assert!(a.items.iter().all(|l| l.external_id.is_some()));
        assert!(a.url.starts_with("demo://craigslist/search"));
    }

    #[tokio::test]
    async fn demo_fetch_one_canonicalizes_url() {
        let source = DemoSource::new(ListingSource::Facebook);
        let listing = source
            .fetch_one("https://www.facebook.com/marketplace/item/42/?ref=share")
            .await
            .expect("fetch");
        assert_eq!(listing.link, "https://www.facebook.com/marketplace/item/42/");
        assert_eq!(listing.external_id.as_deref(), Some("42"));
        assert!(source.fetch_one("not-a-url").await.is_err());
    }
}
