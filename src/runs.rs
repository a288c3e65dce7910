use crate::models::{Event, EventType, NewRun, RunStatus, RunUpdate};
use crate::store::{Store, StoreError};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Owns the run row and its append-only event log.
#[derive(Clone)]
pub struct RunTracker {
    store: Arc<dyn Store>,
}

impl RunTracker {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Creates the run row in `running` state. Without it there is nothing to
    /// attribute failures to, so callers treat an error here as fatal.
    pub async fn begin(
        &self,
        prompt_version: &str,
        triggered_by: Option<&str>,
    ) -> Result<Uuid, StoreError> {
        let run = NewRun {
            id: Uuid::new_v4(),
            status: RunStatus::Running,
            prompt_version: prompt_version.to_string(),
            started_at: Utc::now(),
            triggered_by: triggered_by.map(str::to_string),
        };
        let created = self.store.create_run(&run).await?;
        debug!(target = "grader.runs", run_id = %created.id, prompt_version, "run created");
        Ok(created.id)
    }

    pub async fn update(&self, run_id: Uuid, update: &RunUpdate) -> Result<(), StoreError> {
        self.store.update_run(run_id, update).await
    }

    /// Appends an audit event. Failures are logged and swallowed.
    pub async fn emit(
        &self,
        run_id: Uuid,
        event_type: EventType,
        listing_id: Option<Uuid>,
        payload: Value,
    ) {
        let event = Event {
            run_id,
            event_type,
            listing_id,
            payload,
            created_at: Utc::now(),
        };
        if let Err(err) = self.store.append_event(&event).await {
            warn!(
                target = "grader.runs",
                %run_id,
                event_type = ?event_type,
                error = %err,
                "event append failed"
            );
        }
    }
}
