//! Fakes shared by the unit tests.

use crate::llm::{Grader, LlmError};
use crate::models::{ListingSource, ScrapedListing};
use crate::sources::{SearchOptions, SearchResult, SourceAdapter, SourceError};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

pub fn scraped(external_id: &str, title: &str) -> ScrapedListing {
    ScrapedListing {
        title: title.to_string(),
        price: "$40".to_string(),
        price_cents: Some(4000),
        link: format!("https://minneapolis.craigslist.org/fuo/d/item/{external_id}.html"),
        image: None,
        source: ListingSource::Craigslist,
        external_id: Some(external_id.to_string()),
        condition: Some("good".to_string()),
        listing_date: None,
        location: Some("Minneapolis".to_string()),
        seller_name: None,
        description: Some(format!("{title} in working order")),
        raw_data: Value::Null,
    }
}

pub fn verdict_json(score: u32, grade: &str) -> String {
    json!({
        "score": score,
        "grade": grade,
        "rationale": "looks fine",
        "flags": ["test"],
    })
    .to_string()
}

type Script = dyn Fn(usize, &str) -> Result<String, LlmError> + Send + Sync;

/// Grader whose reply is computed from the call index and the item prompt.
pub struct ScriptedGrader {
    calls: AtomicUsize,
    script: Box<Script>,
}

impl ScriptedGrader {
    pub fn new(
        script: impl Fn(usize, &str) -> Result<String, LlmError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            script: Box::new(script),
        }
    }

    pub fn always(text: &str) -> Self {
        let text = text.to_string();
        Self::new(move |_, _| Ok(text.clone()))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Grader for ScriptedGrader {
    fn model(&self) -> &str {
        "scripted"
    }

    async fn score(&self, _instructions: &str, item_prompt: &str) -> Result<String, LlmError> {
        let index = self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(index, item_prompt)
    }
}

/// Grader that blocks each call until the test adds a permit.
pub struct GatedGrader {
    pub gate: Arc<Semaphore>,
}

#[async_trait]
impl Grader for GatedGrader {
    fn model(&self) -> &str {
        "gated"
    }

    async fn score(&self, _instructions: &str, _item_prompt: &str) -> Result<String, LlmError> {
        let permit = self
            .gate
            .acquire()
            .await
            .map_err(|err| LlmError::Http(err.to_string()))?;
        permit.forget();
        Ok(verdict_json(75, "B"))
    }
}

/// Grader that holds each call briefly and records the peak number of
/// overlapping calls.
#[derive(Default)]
pub struct TrackingGrader {
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl TrackingGrader {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Grader for TrackingGrader {
    fn model(&self) -> &str {
        "tracking"
    }

    async fn score(&self, _instructions: &str, _item_prompt: &str) -> Result<String, LlmError> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        Ok(verdict_json(65, "C"))
    }
}

/// Source returning a fixed result set, or a fixed error.
pub struct StaticSource {
    pub source: ListingSource,
    pub items: Vec<ScrapedListing>,
    pub fail_with: Option<String>,
    pub searches: AtomicUsize,
}

impl StaticSource {
    pub fn new(items: Vec<ScrapedListing>) -> Self {
        Self {
            source: ListingSource::Craigslist,
            items,
            fail_with: None,
            searches: AtomicUsize::new(0),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_with: Some(message.to_string()),
            ..Self::new(Vec::new())
        }
    }
}

#[async_trait]
impl SourceAdapter for StaticSource {
    fn source(&self) -> ListingSource {
        self.source
    }

    async fn search(&self, query: &str, _opts: &SearchOptions) -> Result<SearchResult, SourceError> {
        self.searches.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_with {
            return Err(SourceError::Http(message.clone()));
        }
        Ok(SearchResult {
            items: self.items.clone(),
            url: format!("static://search?query={query}"),
        })
    }

    async fn fetch_one(&self, url: &str) -> Result<ScrapedListing, SourceError> {
        self.items
            .iter()
            .find(|item| item.link == url)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(url.to_string()))
    }
}
