use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::fmt;
use uuid::Uuid;

/// Marketplace a listing was scraped from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ListingSource {
    Craigslist,
    Facebook,
}

impl ListingSource {
    pub const ALL: [ListingSource; 2] = [ListingSource::Craigslist, ListingSource::Facebook];

    pub fn as_str(&self) -> &'static str {
        match self {
            ListingSource::Craigslist => "craigslist",
            ListingSource::Facebook => "facebook",
        }
    }
}

impl fmt::Display for ListingSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A listing as produced by a source adapter, before it has been persisted.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScrapedListing {
    pub title: String,
    pub price: String,
    pub price_cents: Option<i64>,
    pub link: String,
    pub image: Option<String>,
    pub source: ListingSource,
    pub external_id: Option<String>,
    pub condition: Option<String>,
    pub listing_date: Option<String>,
    pub location: Option<String>,
    pub seller_name: Option<String>,
    pub description: Option<String>,
    #[serde(default)]
    pub raw_data: Value,
}

impl ScrapedListing {
    pub fn identity(&self) -> Option<ListingIdentity> {
        self.external_id.as_ref().map(|id| ListingIdentity {
            source: self.source,
            external_id: id.clone(),
        })
    }
}

/// Source-scoped identity of a listing.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ListingIdentity {
    pub source: ListingSource,
    pub external_id: String,
}

/// A persisted listing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Listing {
    pub id: Uuid,
    #[serde(flatten)]
    pub data: ScrapedListing,
    pub created_at: DateTime<Utc>,
}

/// Identity assigned to a listing by the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoredRef {
    pub id: Uuid,
    pub link: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Run {
    pub id: Uuid,
    pub status: RunStatus,
    pub prompt_version: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub listings_scraped: u32,
    #[serde(default)]
    pub listings_graded: u32,
    #[serde(default)]
    pub listings_failed: u32,
    pub average_score: Option<u32>,
    pub error_message: Option<String>,
    pub triggered_by: Option<String>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewRun {
    pub id: Uuid,
    pub status: RunStatus,
    pub prompt_version: String,
    pub started_at: DateTime<Utc>,
    pub triggered_by: Option<String>,
}

/// Partial run update. Fields left as `None` are not written.
#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunUpdate {
    pub status: Option<RunStatus>,
    pub finished_at: Option<DateTime<Utc>>,
    pub listings_scraped: Option<u32>,
    pub listings_graded: Option<u32>,
    pub listings_failed: Option<u32>,
    pub average_score: Option<u32>,
    pub error_message: Option<String>,
}

impl RunUpdate {
    pub fn apply(&self, run: &mut Run) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(at) = self.finished_at {
            run.finished_at = Some(at);
        }
        if let Some(value) = self.listings_scraped {
            run.listings_scraped = value;
        }
        if let Some(value) = self.listings_graded {
            run.listings_graded = value;
        }
        if let Some(value) = self.listings_failed {
            run.listings_failed = value;
        }
        if let Some(value) = self.average_score {
            run.average_score = Some(value);
        }
        if let Some(message) = &self.error_message {
            run.error_message = Some(message.clone());
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    RunStarted,
    ScrapeStarted,
    ScrapeCompleted,
    ListingsStored,
    NothingToGrade,
    FeedbackLoaded,
    BatchStarted,
    GradingStarted,
    GradingCompleted,
    GradingFailed,
    RunCancelled,
    RunCompleted,
    RunFailed,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    pub run_id: Uuid,
    pub event_type: EventType,
    pub listing_id: Option<Uuid>,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GradeLetter {
    A,
    B,
    C,
    D,
    F,
}

impl GradeLetter {
    pub fn as_str(&self) -> &'static str {
        match self {
            GradeLetter::A => "A",
            GradeLetter::B => "B",
            GradeLetter::C => "C",
            GradeLetter::D => "D",
            GradeLetter::F => "F",
        }
    }

    pub fn parse(input: &str) -> Option<Self> {
        match input.trim().to_ascii_uppercase().as_str() {
            "A" => Some(GradeLetter::A),
            "B" => Some(GradeLetter::B),
            "C" => Some(GradeLetter::C),
            "D" => Some(GradeLetter::D),
            "F" => Some(GradeLetter::F),
            _ => None,
        }
    }
}

impl fmt::Display for GradeLetter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Grade {
    pub listing_id: Uuid,
    pub prompt_version: String,
    pub score: u32,
    pub grade: GradeLetter,
    pub rationale: String,
    pub flags: Vec<String>,
    pub model: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Agree,
    Disagree,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Agree => "agree",
            Verdict::Disagree => "disagree",
        }
    }
}

/// Reviewer signal on a past grade.
#[skip_serializing_none]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Feedback {
    pub listing_title: String,
    pub score: u32,
    pub grade: String,
    pub adjusted_score: Option<u32>,
    pub notes: Option<String>,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GradingCriteria {
    pub version: String,
    pub criteria_prompt: String,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Stats {
    pub prompt_version: String,
    pub total_listings: u64,
    #[serde(default)]
    pub by_source: std::collections::BTreeMap<String, u64>,
    pub graded: u64,
    pub ungraded: u64,
    pub average_score: Option<f64>,
    #[serde(default)]
    pub grade_distribution: std::collections::BTreeMap<String, u64>,
}

/// Timing and summary output of one orchestrator phase.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct PhaseReport {
    pub name: String,
    pub elapsed_ms: u128,
    pub timestamp: DateTime<Utc>,
    pub output: Value,
}

impl PhaseReport {
    pub fn new(name: &str, elapsed_ms: u128, output: Value) -> Self {
        Self {
            name: name.to_string(),
            elapsed_ms,
            timestamp: Utc::now(),
            output,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
