use super::{Store, StoreError};
use crate::http::build_client;
use crate::models::{
    Event, Feedback, Grade, GradingCriteria, Listing, ListingIdentity, ListingSource, NewRun, Run,
    RunUpdate, ScrapedListing, Stats, StoredRef, Verdict,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::collections::HashSet;
use uuid::Uuid;

/// PostgREST-backed store. Table and RPC layout lives in `supabase/schema.sql`.
#[derive(Debug, Clone)]
pub struct SupabaseStore {
    base_url: String,
    service_key: String,
    http: Client,
}

#[derive(Debug, Deserialize)]
struct IdentityRow {
    source: ListingSource,
    external_id: String,
}

impl SupabaseStore {
    pub fn from_env() -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key,
            http: build_client(),
        })
    }

    fn rest(&self, path: &str) -> String {
        format!("{}/rest/v1/{path}", self.base_url)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| StoreError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(StoreError::Request(format!("HTTP {status}: {body}")));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, StoreError> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

fn upsert_payload(items: &[ScrapedListing]) -> Value {
    json!({ "p_items": items })
}

#[async_trait]
impl Store for SupabaseStore {
    async fn upsert_listings(&self, items: &[ScrapedListing]) -> Result<Vec<StoredRef>, StoreError> {
        if items.is_empty() {
            return Ok(Vec::new());
        }
        // merges on link, then on (source, external_id)
        let request = self
            .http
            .post(self.rest("rpc/upsert_listings"))
            .json(&upsert_payload(items));
        self.fetch(request).await
    }

    async fn existing_identities(
        &self,
        identities: &[ListingIdentity],
    ) -> Result<HashSet<ListingIdentity>, StoreError> {
        if identities.is_empty() {
            return Ok(HashSet::new());
        }
        let ids = identities
            .iter()
            .map(|id| format!("\"{}\"", id.external_id.replace('"', "")))
            .collect::<Vec<_>>()
            .join(",");
        let url = self.rest(&format!(
            "listings?select=source,external_id&external_id=in.({})",
            urlencoding::encode(&ids)
        ));
        let rows: Vec<IdentityRow> = self.fetch(self.http.get(url)).await?;
        let wanted: HashSet<&ListingIdentity> = identities.iter().collect();
        Ok(rows
            .into_iter()
            .map(|row| ListingIdentity {
                source: row.source,
                external_id: row.external_id,
            })
            .filter(|id| wanted.contains(id))
            .collect())
    }

    async fn select_ungraded(
        &self,
        prompt_version: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError> {
        let request = self.http.post(self.rest("rpc/ungraded_listings")).json(&json!({
            "p_prompt_version": prompt_version,
            "p_limit": limit,
        }));
        self.fetch(request).await
    }

    async fn insert_grade(&self, grade: &Grade) -> Result<(), StoreError> {
        let request = self
            .http
            .post(self.rest("grades?on_conflict=listing_id,prompt_version"))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(grade);
        self.send(request).await.map(|_| ())
    }

    async fn create_run(&self, run: &NewRun) -> Result<Run, StoreError> {
        let request = self
            .http
            .post(self.rest("runs"))
            .header("Prefer", "return=representation")
            .json(run);
        let mut rows: Vec<Run> = self.fetch(request).await?;
        rows.pop()
            .ok_or_else(|| StoreError::Deserialize("insert returned no run".into()))
    }

    async fn update_run(&self, id: Uuid, update: &RunUpdate) -> Result<(), StoreError> {
        let request = self
            .http
            .patch(self.rest(&format!("runs?id=eq.{id}")))
            .header("Prefer", "return=minimal")
            .json(update);
        self.send(request).await.map(|_| ())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let request = self
            .http
            .post(self.rest("run_events"))
            .header("Prefer", "return=minimal")
            .json(event);
        self.send(request).await.map(|_| ())
    }

    async fn load_feedback(
        &self,
        prompt_version: &str,
        verdict: Verdict,
        limit: usize,
    ) -> Result<Vec<Feedback>, StoreError> {
        let url = self.rest(&format!(
            "grade_feedback_view?prompt_version=eq.{}&verdict=eq.{}&order=created_at.desc&limit={limit}",
            urlencoding::encode(prompt_version),
            verdict.as_str(),
        ));
        self.fetch(self.http.get(url)).await
    }

    async fn active_criteria(&self) -> Result<GradingCriteria, StoreError> {
        let url = self.rest(
            "grading_criteria?is_active=eq.true&select=version,criteria_prompt&order=created_at.desc&limit=1",
        );
        let mut rows: Vec<GradingCriteria> = self.fetch(self.http.get(url)).await?;
        rows.pop()
            .ok_or_else(|| StoreError::NotFound("no active grading criteria".into()))
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let url = self.rest(&format!("runs?id=eq.{id}&limit=1"));
        let mut rows: Vec<Run> = self.fetch(self.http.get(url)).await?;
        Ok(rows.pop())
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        let url = self.rest("runs?order=started_at.desc&limit=1");
        let mut rows: Vec<Run> = self.fetch(self.http.get(url)).await?;
        Ok(rows.pop())
    }

    async fn stats(&self, prompt_version: &str) -> Result<Stats, StoreError> {
        let request = self
            .http
            .post(self.rest("rpc/listing_stats"))
            .json(&json!({ "p_prompt_version": prompt_version }));
        self.fetch(request).await
    }
}
