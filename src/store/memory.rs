use super::{Store, StoreError};
use crate::models::{
    Event, Feedback, Grade, GradingCriteria, Listing, ListingIdentity, NewRun, Run, RunUpdate,
    ScrapedListing, Stats, StoredRef, Verdict,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet};
use tokio::sync::Mutex;
use uuid::Uuid;

const DEFAULT_CRITERIA_VERSION: &str = "v1";

const DEFAULT_CRITERIA_PROMPT: &str = r#"
You grade secondhand marketplace listings for a buyer looking for good-value, well-described items.
Score each listing from 0 to 100 considering: price relative to typical resale value, item condition,
completeness and honesty of the description, photo availability, and red flags (scam patterns,
vague details, mismatched title and description, off-platform payment requests).
Map scores to letters: A 85-100, B 70-84, C 50-69, D 30-49, F 0-29.
"#;

/// In-process store used in demo mode and in tests.
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

struct Inner {
    listings: Vec<Listing>,
    by_link: HashMap<String, usize>,
    by_identity: HashMap<ListingIdentity, usize>,
    grades: HashMap<(Uuid, String), Grade>,
    runs: Vec<Run>,
    events: Vec<Event>,
    feedback: Vec<(String, Feedback)>,
    criteria: GradingCriteria,
    #[cfg(test)]
    faults: HashSet<&'static str>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::with_criteria(GradingCriteria {
            version: DEFAULT_CRITERIA_VERSION.to_string(),
            criteria_prompt: DEFAULT_CRITERIA_PROMPT.trim().to_string(),
        })
    }
}

impl MemoryStore {
    pub fn with_criteria(criteria: GradingCriteria) -> Self {
        Self {
            inner: Mutex::new(Inner {
                listings: Vec::new(),
                by_link: HashMap::new(),
                by_identity: HashMap::new(),
                grades: HashMap::new(),
                runs: Vec::new(),
                events: Vec::new(),
                feedback: Vec::new(),
                criteria,
                #[cfg(test)]
                faults: HashSet::new(),
            }),
        }
    }
}

#[cfg(test)]
impl MemoryStore {
    /// Makes the named trait operation fail until cleared.
    pub async fn fail_on(&self, op: &'static str) {
        self.inner.lock().await.faults.insert(op);
    }

    pub async fn clear_faults(&self) {
        self.inner.lock().await.faults.clear();
    }

    /// Records feedback; later calls are treated as more recent.
    pub async fn push_feedback(&self, prompt_version: &str, feedback: Feedback) {
        self.inner
            .lock()
            .await
            .feedback
            .push((prompt_version.to_string(), feedback));
    }

    pub async fn events(&self) -> Vec<Event> {
        self.inner.lock().await.events.clone()
    }

    pub async fn grades(&self) -> Vec<Grade> {
        self.inner.lock().await.grades.values().cloned().collect()
    }

    pub async fn listings(&self) -> Vec<Listing> {
        self.inner.lock().await.listings.clone()
    }
}

impl Inner {
    #[cfg(test)]
    fn check(&self, op: &'static str) -> Result<(), StoreError> {
        if self.faults.contains(op) {
            return Err(StoreError::Unavailable(format!("{op} failed")));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check(&self, _op: &'static str) -> Result<(), StoreError> {
        Ok(())
    }

    fn upsert(&mut self, item: &ScrapedListing) -> StoredRef {
        let existing = self
            .by_link
            .get(&item.link)
            .copied()
            .or_else(|| item.identity().and_then(|id| self.by_identity.get(&id).copied()));

        match existing {
            Some(idx) => {
                let listing = &mut self.listings[idx];
                let previous_link = std::mem::replace(&mut listing.data, item.clone()).link;
                if previous_link != item.link {
                    self.by_link.remove(&previous_link);
                    self.by_link.insert(item.link.clone(), idx);
                }
                if let Some(identity) = item.identity() {
                    self.by_identity.insert(identity, idx);
                }
                StoredRef {
                    id: self.listings[idx].id,
                    link: item.link.clone(),
                }
            }
            None => {
                let idx = self.listings.len();
                let listing = Listing {
                    id: Uuid::new_v4(),
                    data: item.clone(),
                    created_at: Utc::now(),
                };
                let stored = StoredRef {
                    id: listing.id,
                    link: item.link.clone(),
                };
                self.by_link.insert(item.link.clone(), idx);
                if let Some(identity) = item.identity() {
                    self.by_identity.insert(identity, idx);
                }
                self.listings.push(listing);
                stored
            }
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn upsert_listings(&self, items: &[ScrapedListing]) -> Result<Vec<StoredRef>, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check("upsert_listings")?;
        Ok(items.iter().map(|item| inner.upsert(item)).collect())
    }

    async fn existing_identities(
        &self,
        identities: &[ListingIdentity],
    ) -> Result<HashSet<ListingIdentity>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("existing_identities")?;
        Ok(identities
            .iter()
            .filter(|id| inner.by_identity.contains_key(*id))
            .cloned()
            .collect())
    }

    async fn select_ungraded(
        &self,
        prompt_version: &str,
        limit: Option<usize>,
    ) -> Result<Vec<Listing>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("select_ungraded")?;
        Ok(inner
            .listings
            .iter()
            .filter(|listing| {
                !inner
                    .grades
                    .contains_key(&(listing.id, prompt_version.to_string()))
            })
            .take(limit.unwrap_or(usize::MAX))
            .cloned()
            .collect())
    }

    async fn insert_grade(&self, grade: &Grade) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check("insert_grade")?;
        if !inner.listings.iter().any(|l| l.id == grade.listing_id) {
            return Err(StoreError::NotFound(format!("listing {}", grade.listing_id)));
        }
        inner.grades.insert(
            (grade.listing_id, grade.prompt_version.clone()),
            grade.clone(),
        );
        Ok(())
    }

    async fn create_run(&self, run: &NewRun) -> Result<Run, StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check("create_run")?;
        let created = Run {
            id: run.id,
            status: run.status,
            prompt_version: run.prompt_version.clone(),
            started_at: run.started_at,
            finished_at: None,
            listings_scraped: 0,
            listings_graded: 0,
            listings_failed: 0,
            average_score: None,
            error_message: None,
            triggered_by: run.triggered_by.clone(),
        };
        inner.runs.push(created.clone());
        Ok(created)
    }

    async fn update_run(&self, id: Uuid, update: &RunUpdate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check("update_run")?;
        let run = inner
            .runs
            .iter_mut()
            .find(|run| run.id == id)
            .ok_or_else(|| StoreError::NotFound(format!("run {id}")))?;
        update.apply(run);
        Ok(())
    }

    async fn append_event(&self, event: &Event) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.check("append_event")?;
        inner.events.push(event.clone());
        Ok(())
    }

    async fn load_feedback(
        &self,
        prompt_version: &str,
        verdict: Verdict,
        limit: usize,
    ) -> Result<Vec<Feedback>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("load_feedback")?;
        Ok(inner
            .feedback
            .iter()
            .rev()
            .filter(|(version, fb)| version == prompt_version && fb.verdict == verdict)
            .take(limit)
            .map(|(_, fb)| fb.clone())
            .collect())
    }

    async fn active_criteria(&self) -> Result<GradingCriteria, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("active_criteria")?;
        Ok(inner.criteria.clone())
    }

    async fn get_run(&self, id: Uuid) -> Result<Option<Run>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("get_run")?;
        Ok(inner.runs.iter().find(|run| run.id == id).cloned())
    }

    async fn latest_run(&self) -> Result<Option<Run>, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("latest_run")?;
        Ok(inner.runs.last().cloned())
    }

    async fn stats(&self, prompt_version: &str) -> Result<Stats, StoreError> {
        let inner = self.inner.lock().await;
        inner.check("stats")?;
        let mut by_source = BTreeMap::new();
        for listing in &inner.listings {
            *by_source
                .entry(listing.data.source.as_str().to_string())
                .or_insert(0) += 1;
        }
        let grades: Vec<&Grade> = inner
            .grades
            .values()
            .filter(|grade| grade.prompt_version == prompt_version)
            .collect();
        let mut grade_distribution = BTreeMap::new();
        for grade in &grades {
            *grade_distribution
                .entry(grade.grade.as_str().to_string())
                .or_insert(0) += 1;
        }
        let average_score = (!grades.is_empty()).then(|| {
            grades.iter().map(|g| f64::from(g.score)).sum::<f64>() / grades.len() as f64
        });
        let total = inner.listings.len() as u64;
        let graded = grades.len() as u64;
        Ok(Stats {
            prompt_version: prompt_version.to_string(),
            total_listings: total,
            by_source,
            graded,
            ungraded: total.saturating_sub(graded),
            average_score,
            grade_distribution,
        })
    }
}
