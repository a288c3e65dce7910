//! Bounded-concurrency batch grading.
//!
//! Listings are split into sequential batches, each batch into windows of
//! `concurrency` items. A window's items run together and the engine waits
//! for all of them to settle before starting the next window, so at most
//! `concurrency` model calls are ever in flight. A failed item is counted and
//! logged; it never cancels its siblings or the batch.

use crate::llm::{Grader, LlmError};
use crate::models::{EventType, Grade, GradeLetter, Listing};
use crate::prompt::{InstructionBlock, build_item_prompt};
use crate::runs::RunTracker;
use crate::store::{Store, StoreError};
use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const DRY_RUN_MODEL: &str = "dry-run";

#[derive(Debug, Clone, Copy)]
pub struct GradingOptions {
    pub batch_size: usize,
    pub concurrency: usize,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GradingStats {
    pub graded: u32,
    pub failed: u32,
    /// Rounded mean of successful scores; 0 when nothing succeeded.
    pub average_score: u32,
    pub cancelled: bool,
}

/// A validated model verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GradeResult {
    pub score: u32,
    pub grade: GradeLetter,
    pub rationale: String,
    pub flags: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid grading response: {0}")]
pub struct InvalidResponse(pub String);

#[derive(Debug, Error)]
pub enum GradeItemError {
    #[error("model call failed: {0}")]
    Model(#[from] LlmError),
    #[error(transparent)]
    Invalid(#[from] InvalidResponse),
    #[error("grade not saved: {0}")]
    Store(#[from] StoreError),
}

pub struct GradingEngine {
    grader: Arc<dyn Grader>,
    store: Arc<dyn Store>,
    tracker: RunTracker,
}

impl GradingEngine {
    pub fn new(grader: Arc<dyn Grader>, store: Arc<dyn Store>, tracker: RunTracker) -> Self {
        Self {
            grader,
            store,
            tracker,
        }
    }

    /// Grades `listings` for `run_id`. Cancellation is checked before every
    /// batch and window; once observed, the stats gathered so far are returned.
    pub async fn grade_batch(
        &self,
        run_id: Uuid,
        listings: &[Listing],
        instructions: &InstructionBlock,
        opts: GradingOptions,
        cancel: &CancellationToken,
    ) -> GradingStats {
        let batch_size = opts.batch_size.max(1);
        let concurrency = opts.concurrency.max(1);
        let mut tally = Tally::default();
        let total_batches = listings.len().div_ceil(batch_size);

        'batches: for (batch_index, batch) in listings.chunks(batch_size).enumerate() {
            if cancel.is_cancelled() {
                tally.cancelled = true;
                break;
            }
            self.tracker
                .emit(
                    run_id,
                    EventType::BatchStarted,
                    None,
                    json!({
                        "batch": batch_index + 1,
                        "of": total_batches,
                        "size": batch.len(),
                    }),
                )
                .await;

            for window in batch.chunks(concurrency) {
                if cancel.is_cancelled() {
                    tally.cancelled = true;
                    break 'batches;
                }
                let outcomes = join_all(
                    window
                        .iter()
                        .map(|listing| self.grade_one(run_id, listing, instructions, opts.dry_run)),
                )
                .await;
                for outcome in outcomes {
                    tally.record(outcome);
                }
            }
            debug!(
                target = "grader.grading",
                %run_id,
                batch = batch_index + 1,
                graded = tally.graded,
                failed = tally.failed,
                "batch settled"
            );
        }

        let stats = tally.finish();
        info!(
            target = "grader.grading",
            %run_id,
            graded = stats.graded,
            failed = stats.failed,
            average_score = stats.average_score,
            cancelled = stats.cancelled,
            "grading finished"
        );
        stats
    }

    /// One item with its audit events. Errors stop at this boundary.
    async fn grade_one(
        &self,
        run_id: Uuid,
        listing: &Listing,
        instructions: &InstructionBlock,
        dry_run: bool,
    ) -> Option<u32> {
        let started = Instant::now();
        self.tracker
            .emit(
                run_id,
                EventType::GradingStarted,
                Some(listing.id),
                json!({ "title": listing.data.title, "dry_run": dry_run }),
            )
            .await;

        match self.grade_listing(listing, instructions, dry_run).await {
            Ok(grade) => {
                crate::metrics::item_graded("ok", started.elapsed().as_millis());
                self.tracker
                    .emit(
                        run_id,
                        EventType::GradingCompleted,
                        Some(listing.id),
                        json!({
                            "score": grade.score,
                            "grade": grade.grade,
                            "flags": grade.flags,
                            "model": grade.model,
                            "elapsed_ms": started.elapsed().as_millis() as u64,
                        }),
                    )
                    .await;
                Some(grade.score)
            }
            Err(err) => {
                crate::metrics::item_graded("failed", started.elapsed().as_millis());
                warn!(
                    target = "grader.grading",
                    %run_id,
                    listing_id = %listing.id,
                    error = %err,
                    "listing grading failed"
                );
                self.tracker
                    .emit(
                        run_id,
                        EventType::GradingFailed,
                        Some(listing.id),
                        json!({ "error": err.to_string() }),
                    )
                    .await;
                None
            }
        }
    }

    /// Scores and persists one listing without touching any run.
    pub async fn grade_listing(
        &self,
        listing: &Listing,
        instructions: &InstructionBlock,
        dry_run: bool,
    ) -> Result<Grade, GradeItemError> {
        let (result, model) = if dry_run {
            (dry_run_result(), DRY_RUN_MODEL.to_string())
        } else {
            let raw = self
                .grader
                .score(&instructions.text, &build_item_prompt(listing))
                .await?;
            (parse_grade_response(&raw)?, self.grader.model().to_string())
        };

        let grade = Grade {
            listing_id: listing.id,
            prompt_version: instructions.version.clone(),
            score: result.score,
            grade: result.grade,
            rationale: result.rationale,
            flags: result.flags,
            model,
        };
        self.store.insert_grade(&grade).await?;
        Ok(grade)
    }
}

#[derive(Default)]
struct Tally {
    graded: u32,
    failed: u32,
    score_sum: u64,
    cancelled: bool,
}

impl Tally {
    fn record(&mut self, outcome: Option<u32>) {
        match outcome {
            Some(score) => {
                self.graded += 1;
                self.score_sum += u64::from(score);
            }
            None => self.failed += 1,
        }
    }

    fn finish(self) -> GradingStats {
        let average_score = if self.graded == 0 {
            0
        } else {
            (self.score_sum as f64 / f64::from(self.graded)).round() as u32
        };
        GradingStats {
            graded: self.graded,
            failed: self.failed,
            average_score,
            cancelled: self.cancelled,
        }
    }
}

fn dry_run_result() -> GradeResult {
    GradeResult {
        score: 50,
        grade: GradeLetter::C,
        rationale: "dry run: no model call was made".to_string(),
        flags: Vec::new(),
    }
}

/// Validates raw model output. This is the only place model text is trusted.
///
/// Accepts bare JSON or JSON inside a ``` fence (with or without a language
/// tag). `score` must be numeric, `grade` and `rationale` strings; malformed
/// `flags` are treated as empty.
pub fn parse_grade_response(raw: &str) -> Result<GradeResult, InvalidResponse> {
    let body = strip_code_fence(raw);
    let value: Value = serde_json::from_str(body)
        .map_err(|err| InvalidResponse(format!("not json: {err}")))?;
    let obj = value
        .as_object()
        .ok_or_else(|| InvalidResponse("expected a json object".into()))?;

    let score = obj
        .get("score")
        .and_then(Value::as_f64)
        .ok_or_else(|| InvalidResponse("`score` is missing or not a number".into()))?;
    let grade_text = obj
        .get("grade")
        .and_then(Value::as_str)
        .ok_or_else(|| InvalidResponse("`grade` is missing or not a string".into()))?;
    let rationale = obj
        .get("rationale")
        .and_then(Value::as_str)
        .ok_or_else(|| InvalidResponse("`rationale` is missing or not a string".into()))?;
    let grade = GradeLetter::parse(grade_text)
        .ok_or_else(|| InvalidResponse(format!("unknown grade `{grade_text}`")))?;

    let mut flags: Vec<String> = Vec::new();
    if let Some(Value::Array(items)) = obj.get("flags") {
        for flag in items.iter().filter_map(Value::as_str).map(str::trim) {
            if !flag.is_empty() && !flags.iter().any(|f| f == flag) {
                flags.push(flag.to_string());
            }
        }
    }

    Ok(GradeResult {
        score: score.round().clamp(0.0, 100.0) as u32,
        grade,
        rationale: rationale.trim().to_string(),
        flags,
    })
}

fn strip_code_fence(input: &str) -> &str {
    let trimmed = input.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // optional language tag, on its own line or inline before the object
    let untagged = rest
        .trim_start_matches(|c: char| c.is_ascii_alphanumeric() || matches!(c, '_' | '+' | '-'));
    let body = if untagged.trim_start().starts_with('{') {
        untagged
    } else {
        match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest,
        }
    };
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim()
}
