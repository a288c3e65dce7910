use super::{SearchOptions, SearchResult, SourceAdapter, SourceError};
use crate::http::build_client;
use crate::models::{ListingSource, ScrapedListing};
use crate::normalize;
use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

/// Pulls listings from a scrape feed that serves JSON.
///
/// The feed exposes `GET /search?query=&limit=&location=` returning either a
/// bare array or an object wrapping one under `items`/`results`, and
/// `GET /item?url=` returning one record (optionally under `item`). Records
/// are free-form; `normalize::from_raw` maps them.
pub struct FeedAdapter {
    source: ListingSource,
    base_url: String,
    http: Client,
}

impl FeedAdapter {
    pub fn new(source: ListingSource, base_url: String) -> Self {
        Self {
            source,
            base_url,
            http: build_client(),
        }
    }

    fn search_url(&self, query: &str, opts: &SearchOptions) -> String {
        let mut url = format!(
            "{}/search?query={}&limit={}",
            self.base_url,
            urlencoding::encode(query),
            opts.limit
        );
        if let Some(location) = &opts.location {
            url.push_str("&location=");
            url.push_str(&urlencoding::encode(location));
        }
        url
    }

    async fn get_json(&self, url: &str) -> Result<Value, SourceError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| SourceError::Http(err.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(SourceError::NotFound(url.to_string()));
        }
        if !response.status().is_success() {
            return Err(SourceError::Http(format!("HTTP {}", response.status())));
        }
        response
            .json()
            .await
            .map_err(|err| SourceError::Decode(err.to_string()))
    }
}

#[async_trait]
impl SourceAdapter for FeedAdapter {
    fn source(&self) -> ListingSource {
        self.source
    }

    async fn search(&self, query: &str, opts: &SearchOptions) -> Result<SearchResult, SourceError> {
        let url = self.search_url(query, opts);
        let body = self.get_json(&url).await?;
        let records = unwrap_records(body)?;
        let mut items: Vec<ScrapedListing> = records
            .iter()
            .filter_map(|raw| normalize::from_raw(self.source, raw))
            .collect();
        if items.len() < records.len() {
            warn!(
                target = "grader.sources",
                source = %self.source,
                dropped = records.len() - items.len(),
                "feed records without title or link were dropped"
            );
        }
        items.truncate(opts.limit.max(1));
        debug!(target = "grader.sources", source = %self.source, %url, count = items.len(), "feed search");
        Ok(SearchResult { items, url })
    }

    async fn fetch_one(&self, url: &str) -> Result<ScrapedListing, SourceError> {
        let request_url = format!("{}/item?url={}", self.base_url, urlencoding::encode(url));
        let body = self.get_json(&request_url).await?;
        let record = match body {
            Value::Object(mut obj) if obj.contains_key("item") => {
                obj.remove("item").unwrap_or(Value::Null)
            }
            other => other,
        };
        normalize::from_raw(self.source, &record).ok_or_else(|| {
            SourceError::Decode(format!("record for {url} lacks a title or link"))
        })
    }
}

fn unwrap_records(body: Value) -> Result<Vec<Value>, SourceError> {
    match body {
        Value::Array(items) => Ok(items),
        Value::Object(mut obj) => ["items", "results", "listings"]
            .iter()
            .find_map(|key| match obj.remove(*key) {
                Some(Value::Array(items)) => Some(items),
                _ => None,
            })
            .ok_or_else(|| SourceError::Decode("expected an array of listings".into())),
        _ => Err(SourceError::Decode("expected an array of listings".into())),
    }
}
