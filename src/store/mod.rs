mod memory;
mod supabase;

pub use memory::MemoryStore;
pub use supabase::SupabaseStore;

use crate::models::{
    Event, Feedback, Grade, GradingCriteria, Listing, ListingIdentity, NewRun, Run, RunUpdate,
    ScrapedListing, Stats, StoredRef, Verdict,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable storage for listings, grades, runs, events and reviewer feedback.
///
/// Implementations must make `upsert_listings` idempotent on `link` and merge
/// a candidate into the row that already holds its `(source, external_id)`;
/// the pipeline relies on that when duplicate checks degrade.
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or merge listings, keyed on `link`. Returns the stored identities.
    async fn upsert_listings(&self, items: &[ScrapedListing]) -> Result<Vec<StoredRef>, StoreError>;

    /// The subset of `identities` that already exist.
    async fn existing_identities(
        &self,
        identities: &[ListingIdentity],
    ) -> Result<HashSet<ListingIdentity>, StoreError>;

    /// Listings with no grade row for `prompt_version`, oldest first.
    async fn select_ungraded(
        &self,
        prompt_version: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError>;

    async fn insert_grade(&self, grade: &Grade) -> Result<(), StoreError>;

    async fn create_run(&self, run: &NewRun) -> Result<Run, StoreError>;

    async fn update_run(&self, id: Uuid, update: &RunUpdate) -> Result<(), StoreError>;

    async fn append_event(&self, event: &Event) -> Result<(), StoreError>;

    /// Most recent feedback first.
    async fn load_feedback(
        &self,
        prompt_version: &str,
        verdict: Verdict,
        limit: usize,
    ) -> Result<Vec<Feedback>, StoreError>;

    async fn active_criteria(&self) -> Result<GradingCriteria, StoreError>;

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError>;

    async fn latest_run(&self) -> Result<Option<Run>, StoreError>;

    async fn stats(&self, prompt_version: &str) -> Result<Stats, StoreError>;
}

/// Supabase when configured, otherwise an in-process store.
pub fn from_env() -> Arc<dyn Store> {
    match SupabaseStore::from_env() {
        Some(store) => {
            info!(target = "grader.store", "using supabase store");
            Arc::new(store)
        }
        None => {
            info!(
                target = "grader.store",
                "SUPABASE_URL not set; using in-memory store"
            );
            Arc::new(MemoryStore::default())
        }
    }
}
