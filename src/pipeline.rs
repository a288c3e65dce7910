use crate::config::PipelineConfig;
use crate::dedupe;
use crate::feedback::FeedbackLoader;
use crate::grading::{GradeItemError, GradingEngine, GradingOptions, GradingStats};
use crate::llm::{Grader, LlmClient, LlmConfig};
use crate::models::{
    EventType, Grade, GradingCriteria, Listing, PhaseReport, RunStatus, RunUpdate, ScrapedListing,
    Stats,
};
use crate::normalize;
use crate::prompt::{InstructionBlock, build_instructions};
use crate::runs::RunTracker;
use crate::sources::{self, SearchOptions, SourceAdapter, SourceError};
use crate::store::{self, Store, StoreError};
use chrono::Utc;
use serde::Serialize;
use serde_json::{Value, json};
use std::{future::Future, sync::Arc, time::Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Where a run currently is. Transitions are strictly forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Created,
    Scraping,
    Storing,
    Selecting,
    FeedbackLoading,
    Grading,
    Finalizing,
    Completed,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Created => "created",
            RunPhase::Scraping => "scraping",
            RunPhase::Storing => "storing",
            RunPhase::Selecting => "selecting",
            RunPhase::FeedbackLoading => "feedback_loading",
            RunPhase::Grading => "grading",
            RunPhase::Finalizing => "finalizing",
            RunPhase::Completed => "completed",
            RunPhase::Failed => "failed",
        }
    }
}

#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<PipelineConfig>,
    store: Arc<dyn Store>,
    sources: Arc<Vec<Arc<dyn SourceAdapter>>>,
    tracker: RunTracker,
    feedback: FeedbackLoader,
    engine: Arc<GradingEngine>,
}

#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    pub dry_run: bool,
    pub triggered_by: Option<String>,
}

/// A run that has been created and not yet executed.
pub struct ActiveRun {
    pub run_id: Uuid,
    pub criteria: GradingCriteria,
    pub dry_run: bool,
    cancel: CancellationToken,
    phase: watch::Sender<RunPhase>,
}

impl ActiveRun {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    fn enter(&self, phase: RunPhase) {
        self.phase.send_replace(phase);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub status: RunStatus,
    pub prompt_version: String,
    pub dry_run: bool,
    pub listings_scraped: u32,
    pub listings_stored: u32,
    pub listings_graded: u32,
    pub listings_failed: u32,
    pub average_score: Option<u32>,
    pub cancelled: bool,
    pub phases: Vec<PhaseReport>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AdhocGrade {
    pub listing: Listing,
    pub grade: Grade,
}

/// What the phases up to grading produced; finalization turns it into a summary.
struct Progress {
    scraped: u32,
    stored: u32,
    stats: Option<GradingStats>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        store: Arc<dyn Store>,
        sources: Vec<Arc<dyn SourceAdapter>>,
        grader: Arc<dyn Grader>,
    ) -> Self {
        let tracker = RunTracker::new(store.clone());
        let feedback = FeedbackLoader::new(
            store.clone(),
            config.feedback_disagreements,
            config.feedback_agreements,
        );
        let engine = GradingEngine::new(grader, store.clone(), tracker.clone());
        Self {
            config: Arc::new(config),
            store,
            sources: Arc::new(sources),
            tracker,
            feedback,
            engine: Arc::new(engine),
        }
    }

    pub fn from_env() -> Self {
        Self::new(
            PipelineConfig::from_env(),
            store::from_env(),
            sources::from_env(),
            Arc::new(LlmClient::new(LlmConfig::from_env())),
        )
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Creates the run row. Nothing is scraped yet.
    pub async fn begin(&self, request: RunRequest) -> Result<ActiveRun, PipelineError> {
        let criteria = self
            .store
            .active_criteria()
            .await
            .map_err(|err| PipelineError::internal("begin", err.to_string()))?;
        let run_id = self
            .tracker
            .begin(&criteria.version, request.triggered_by.as_deref())
            .await
            .map_err(|err| PipelineError::internal("begin", err.to_string()))?;
        info!(
            target = "grader.pipeline",
            %run_id,
            prompt_version = %criteria.version,
            dry_run = request.dry_run,
            triggered_by = ?request.triggered_by,
            "run started"
        );
        self.tracker
            .emit(
                run_id,
                EventType::RunStarted,
                None,
                json!({
                    "dry_run": request.dry_run,
                    "sources": self.sources.iter().map(|s| s.source()).collect::<Vec<_>>(),
                    "queries": self.config.queries,
                    "batch_size": self.config.batch_size,
                    "concurrency": self.config.concurrency,
                }),
            )
            .await;
        let (phase, _) = watch::channel(RunPhase::Created);
        Ok(ActiveRun {
            run_id,
            criteria,
            dry_run: request.dry_run,
            cancel: CancellationToken::new(),
            phase,
        })
    }

    /// Begins and executes a run in one call.
    #[cfg(test)]
    pub async fn run(&self, request: RunRequest) -> Result<RunSummary, PipelineError> {
        let active = self.begin(request).await?;
        self.execute(active).await
    }

    /// Drives a begun run to a terminal state.
    pub async fn execute(&self, run: ActiveRun) -> Result<RunSummary, PipelineError> {
        let mut phases = Vec::new();
        match self.drive(&run, &mut phases).await {
            Ok(progress) => self.finalize(&run, progress, phases).await,
            Err(err) => Err(self.fail(&run, err).await),
        }
    }

    async fn drive(
        &self,
        run: &ActiveRun,
        phases: &mut Vec<PhaseReport>,
    ) -> Result<Progress, PipelineError> {
        let scraped = self
            .capture_phase(run, RunPhase::Scraping, phases, self.scrape(run))
            .await?;
        let scraped_count = scraped.len() as u32;

        let stored = self
            .capture_phase(run, RunPhase::Storing, phases, self.persist(run, scraped))
            .await?;

        let pending = self
            .capture_phase(run, RunPhase::Selecting, phases, self.select(run))
            .await?;
        if pending.is_empty() {
            info!(target = "grader.pipeline", run_id = %run.run_id, "no ungraded listings; skipping grading");
            self.tracker
                .emit(run.run_id, EventType::NothingToGrade, None, json!({}))
                .await;
            return Ok(Progress {
                scraped: scraped_count,
                stored,
                stats: None,
            });
        }

        let instructions = self
            .capture_phase(run, RunPhase::FeedbackLoading, phases, self.instructions_for(run))
            .await?;

        let stats = self
            .capture_phase(run, RunPhase::Grading, phases, async {
                let opts = GradingOptions {
                    batch_size: self.config.batch_size,
                    concurrency: self.config.concurrency,
                    dry_run: run.dry_run,
                };
                let stats = self
                    .engine
                    .grade_batch(run.run_id, &pending, &instructions, opts, &run.cancel)
                    .await;
                Ok::<_, PipelineError>(PhaseOutcome::new(stats, json!(stats)))
            })
            .await?;

        Ok(Progress {
            scraped: scraped_count,
            stored,
            stats: Some(stats),
        })
    }

    async fn scrape(&self, run: &ActiveRun) -> Result<PhaseOutcome<Vec<ScrapedListing>>, PipelineError> {
        let opts = SearchOptions {
            limit: self.config.search_limit,
            location: self.config.search_location.clone(),
        };
        let mut items = Vec::new();
        let mut per_source = serde_json::Map::new();
        for adapter in self.sources.iter() {
            let source = adapter.source();
            let mut source_count = 0usize;
            for query in &self.config.queries {
                self.tracker
                    .emit(
                        run.run_id,
                        EventType::ScrapeStarted,
                        None,
                        json!({ "source": source, "query": query }),
                    )
                    .await;
                let result = adapter.search(query, &opts).await.map_err(|err| {
                    PipelineError::internal(
                        "scrape",
                        format!("{source} search for '{query}' failed: {err}"),
                    )
                })?;
                let normalized: Vec<ScrapedListing> = result
                    .items
                    .into_iter()
                    .filter_map(normalize::canonicalize)
                    .collect();
                self.tracker
                    .emit(
                        run.run_id,
                        EventType::ScrapeCompleted,
                        None,
                        json!({
                            "source": source,
                            "query": query,
                            "url": result.url,
                            "count": normalized.len(),
                        }),
                    )
                    .await;
                source_count += normalized.len();
                items.extend(normalized);
            }
            per_source.insert(source.as_str().to_string(), json!(source_count));
        }
        let output = json!({ "count": items.len(), "by_source": per_source });
        Ok(PhaseOutcome::new(items, output))
    }

    async fn persist(
        &self,
        run: &ActiveRun,
        scraped: Vec<ScrapedListing>,
    ) -> Result<PhaseOutcome<u32>, PipelineError> {
        let scraped_count = scraped.len() as u32;
        let fresh = dedupe::filter_new(self.store.as_ref(), scraped).await;
        let stored = self
            .store
            .upsert_listings(&fresh)
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))?;
        let stored_count = stored.len() as u32;

        let counters = RunUpdate {
            listings_scraped: Some(scraped_count),
            ..Default::default()
        };
        if let Err(err) = self.tracker.update(run.run_id, &counters).await {
            // rewritten at finalization
            warn!(target = "grader.pipeline", run_id = %run.run_id, error = %err, "scrape counter update failed");
        }

        let output = json!({
            "scraped": scraped_count,
            "new": fresh.len(),
            "stored": stored_count,
        });
        self.tracker
            .emit(run.run_id, EventType::ListingsStored, None, output.clone())
            .await;
        Ok(PhaseOutcome::new(stored_count, output))
    }

    async fn select(&self, run: &ActiveRun) -> Result<PhaseOutcome<Vec<Listing>>, PipelineError> {
        let pending = self
            .store
            .select_ungraded(&run.criteria.version, self.config.max_per_run)
            .await
            .map_err(|err| PipelineError::internal("select", err.to_string()))?;
        let output = json!({ "ungraded": pending.len(), "limit": self.config.max_per_run });
        Ok(PhaseOutcome::new(pending, output))
    }

    async fn instructions_for(
        &self,
        run: &ActiveRun,
    ) -> Result<PhaseOutcome<InstructionBlock>, PipelineError> {
        let sample = self.feedback.load(&run.criteria.version).await;
        if sample.is_empty() {
            info!(target = "grader.pipeline", run_id = %run.run_id, "no reviewer feedback for this prompt version");
        }
        let block = build_instructions(&run.criteria, &sample.disagreements, &sample.agreements);
        let output = json!({
            "prompt_version": block.version,
            "disagreements": block.disagreements,
            "agreements": block.agreements,
        });
        self.tracker
            .emit(run.run_id, EventType::FeedbackLoaded, None, output.clone())
            .await;
        Ok(PhaseOutcome::new(block, output))
    }

    async fn finalize(
        &self,
        run: &ActiveRun,
        progress: Progress,
        phases: Vec<PhaseReport>,
    ) -> Result<RunSummary, PipelineError> {
        run.enter(RunPhase::Finalizing);
        let stats = progress.stats.unwrap_or_default();
        let average_score = (stats.graded > 0).then_some(stats.average_score);
        let update = RunUpdate {
            status: Some(RunStatus::Completed),
            finished_at: Some(Utc::now()),
            listings_scraped: Some(progress.scraped),
            listings_graded: Some(stats.graded),
            listings_failed: Some(stats.failed),
            average_score,
            error_message: None,
        };
        let written = self.tracker.update(run.run_id, &update).await;

        if stats.cancelled {
            self.tracker
                .emit(
                    run.run_id,
                    EventType::RunCancelled,
                    None,
                    json!({ "graded": stats.graded, "failed": stats.failed }),
                )
                .await;
        }
        self.tracker
            .emit(
                run.run_id,
                EventType::RunCompleted,
                None,
                json!({
                    "scraped": progress.scraped,
                    "stored": progress.stored,
                    "graded": stats.graded,
                    "failed": stats.failed,
                    "average_score": average_score,
                    "cancelled": stats.cancelled,
                }),
            )
            .await;

        if let Err(err) = written {
            run.enter(RunPhase::Failed);
            error!(target = "grader.pipeline", run_id = %run.run_id, error = %err, "could not record run completion");
            return Err(PipelineError::internal(
                "finalize",
                format!("run finished but its status could not be saved: {err}"),
            ));
        }

        run.enter(RunPhase::Completed);
        info!(
            target = "grader.pipeline",
            run_id = %run.run_id,
            graded = stats.graded,
            failed = stats.failed,
            cancelled = stats.cancelled,
            "run completed"
        );
        Ok(RunSummary {
            run_id: run.run_id,
            status: RunStatus::Completed,
            prompt_version: run.criteria.version.clone(),
            dry_run: run.dry_run,
            listings_scraped: progress.scraped,
            listings_stored: progress.stored,
            listings_graded: stats.graded,
            listings_failed: stats.failed,
            average_score,
            cancelled: stats.cancelled,
            phases,
        })
    }

    /// Best-effort marks the run failed. Returns the error to surface, which
    /// carries both messages when the marking itself fails.
    async fn fail(&self, run: &ActiveRun, err: PipelineError) -> PipelineError {
        run.enter(RunPhase::Failed);
        error!(
            target = "grader.pipeline",
            run_id = %run.run_id,
            stage = err.stage(),
            error = %err.detail(),
            "run failed"
        );
        let update = RunUpdate {
            status: Some(RunStatus::Failed),
            finished_at: Some(Utc::now()),
            error_message: Some(err.detail().to_string()),
            ..Default::default()
        };
        let marked = self.tracker.update(run.run_id, &update).await;
        self.tracker
            .emit(
                run.run_id,
                EventType::RunFailed,
                None,
                json!({ "stage": err.stage(), "error": err.detail() }),
            )
            .await;
        match marked {
            Ok(()) => err,
            Err(mark_err) => PipelineError {
                message: format!(
                    "{}; additionally failed to mark run failed: {mark_err}",
                    err.detail()
                ),
                ..err
            },
        }
    }

    async fn capture_phase<T, Fut>(
        &self,
        run: &ActiveRun,
        phase: RunPhase,
        phases: &mut Vec<PhaseReport>,
        fut: Fut,
    ) -> Result<T, PipelineError>
    where
        Fut: Future<Output = Result<PhaseOutcome<T>, PipelineError>>,
    {
        run.enter(phase);
        let started = Instant::now();
        let outcome = fut.await?;
        let elapsed_ms = started.elapsed().as_millis();
        crate::metrics::phase_elapsed(phase.as_str(), elapsed_ms);
        phases.push(PhaseReport::new(phase.as_str(), elapsed_ms, outcome.output));
        Ok(outcome.value)
    }

    /// Grades one listing by URL outside of any run.
    pub async fn grade_url(&self, url: &str, dry_run: bool) -> Result<AdhocGrade, PipelineError> {
        let adapter = self
            .sources
            .iter()
            .find(|adapter| adapter.handles(url))
            .ok_or_else(|| PipelineError::invalid_input("grade_url", "unsupported listing url"))?;
        let scraped = adapter.fetch_one(url).await.map_err(|err| match err {
            SourceError::NotFound(_) => PipelineError::not_found("grade_url", err.to_string()),
            other => PipelineError::internal("grade_url", other.to_string()),
        })?;
        let scraped = normalize::canonicalize(scraped).ok_or_else(|| {
            PipelineError::internal("grade_url", "listing could not be normalized")
        })?;

        let stored = self
            .store
            .upsert_listings(std::slice::from_ref(&scraped))
            .await
            .map_err(|err| PipelineError::internal("store", err.to_string()))?;
        let stored = stored
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::internal("store", "upsert returned no listing"))?;
        let listing = Listing {
            id: stored.id,
            data: scraped,
            created_at: Utc::now(),
        };

        let instructions = self.current_instructions().await?;
        let grade = self
            .engine
            .grade_listing(&listing, &instructions, dry_run)
            .await
            .map_err(|err| match err {
                GradeItemError::Store(inner) => PipelineError::internal("store", inner.to_string()),
                other => PipelineError::internal("grade", other.to_string()),
            })?;
        info!(target = "grader.pipeline", listing_id = %listing.id, score = grade.score, "ad-hoc listing graded");
        Ok(AdhocGrade { listing, grade })
    }

    /// The instruction block a run started now would send.
    pub async fn current_instructions(&self) -> Result<InstructionBlock, PipelineError> {
        let criteria = self
            .store
            .active_criteria()
            .await
            .map_err(|err| PipelineError::internal("criteria", err.to_string()))?;
        let sample = self.feedback.load(&criteria.version).await;
        Ok(build_instructions(
            &criteria,
            &sample.disagreements,
            &sample.agreements,
        ))
    }

    pub async fn stats(&self) -> Result<Stats, PipelineError> {
        let criteria = self
            .store
            .active_criteria()
            .await
            .map_err(|err| PipelineError::internal("criteria", err.to_string()))?;
        self.store
            .stats(&criteria.version)
            .await
            .map_err(|err: StoreError| PipelineError::internal("stats", err.to_string()))
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    InvalidInput,
    NotFound,
    Internal,
}

impl PipelineError {
    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::with_kind(stage, message, PipelineErrorKind::Internal)
    }

    fn with_kind(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }
}

#[derive(Debug)]
pub struct PhaseOutcome<T> {
    pub value: T,
    pub output: Value,
}

impl<T> PhaseOutcome<T> {
    fn new(value: T, output: Value) -> Self {
        Self { value, output }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use crate::models::{Feedback, GradeLetter, Verdict};
    use crate::store::MemoryStore;
    use crate::testing::{ScriptedGrader, StaticSource, scraped, verdict_json};

    fn config() -> PipelineConfig {
        PipelineConfig {
            batch_size: 2,
            concurrency: 2,
            queries: vec!["desk".into()],
            ..PipelineConfig::default()
        }
    }

    fn pipeline(
        store: Arc<MemoryStore>,
        source: StaticSource,
        grader: Arc<ScriptedGrader>,
    ) -> Pipeline {
        Pipeline::new(config(), store, vec![Arc::new(source)], grader)
    }

    fn five_listings() -> Vec<ScrapedListing> {
        (1..=5)
            .map(|i| scraped(&i.to_string(), &format!("Desk {i}")))
            .collect()
    }

    async fn event_types(store: &MemoryStore) -> Vec<EventType> {
        store.events().await.into_iter().map(|e| e.event_type).collect()
    }

    #[tokio::test]
    async fn run_completes_with_item_failures_counted() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::new(|index, _| {
            if index == 1 {
                Err(LlmError::RateLimited)
            } else {
                Ok(verdict_json(80, "B"))
            }
        }));
        let summary = pipeline(store.clone(), StaticSource::new(five_listings()), grader)
            .run(RunRequest {
                dry_run: false,
                triggered_by: Some("ops".into()),
            })
            .await
            .expect("run");

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.listings_scraped, 5);
        assert_eq!(summary.listings_stored, 5);
        assert_eq!((summary.listings_graded, summary.listings_failed), (4, 1));
        assert_eq!(summary.average_score, Some(80));
        let names: Vec<_> = summary.phases.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["scraping", "storing", "selecting", "feedback_loading", "grading"]
        );

        let run = store
            .get_run(summary.run_id)
            .await
            .expect("get")
            .expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.listings_failed, 1);
        assert_eq!(run.average_score, Some(80));
        assert_eq!(run.triggered_by.as_deref(), Some("ops"));
        assert!(run.finished_at.is_some());

        let types = event_types(&store).await;
        assert_eq!(types.first(), Some(&EventType::RunStarted));
        assert_eq!(types.last(), Some(&EventType::RunCompleted));
        assert!(types.contains(&EventType::GradingFailed));
    }

    #[tokio::test]
    async fn nothing_to_grade_skips_grading() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let summary = pipeline(store.clone(), StaticSource::new(Vec::new()), grader.clone())
            .run(RunRequest::default())
            .await
            .expect("run");

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!((summary.listings_graded, summary.listings_failed), (0, 0));
        assert!(summary.average_score.is_none());
        assert_eq!(grader.calls(), 0);
        let run = store
            .get_run(summary.run_id)
            .await
            .expect("get")
            .expect("run");
        assert_eq!(run.status, RunStatus::Completed);
        assert!(run.average_score.is_none());
        assert!(event_types(&store).await.contains(&EventType::NothingToGrade));
    }

    #[tokio::test]
    async fn second_run_over_same_listings_grades_nothing_new() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(64, "C")));
        let pipeline = pipeline(store.clone(), StaticSource::new(five_listings()), grader.clone());
        pipeline.run(RunRequest::default()).await.expect("first");
        assert_eq!(grader.calls(), 5);

        let second = pipeline.run(RunRequest::default()).await.expect("second");
        assert_eq!(grader.calls(), 5);
        assert_eq!(second.listings_stored, 0);
        assert_eq!(second.listings_graded, 0);
        assert_eq!(store.listings().await.len(), 5);
    }

    #[tokio::test]
    async fn every_query_is_searched_once_per_source() {
        let store = Arc::new(MemoryStore::default());
        let source = Arc::new(StaticSource::new(vec![scraped("1", "Desk")]));
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(70, "B")));
        let summary = Pipeline::new(
            PipelineConfig {
                queries: vec!["desk".into(), "chair".into(), "lamp".into()],
                ..config()
            },
            store,
            vec![source.clone() as Arc<dyn SourceAdapter>],
            grader,
        )
        .run(RunRequest::default())
        .await
        .expect("run");
        assert_eq!(source.searches.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert_eq!(summary.listings_scraped, 3);
        assert_eq!(summary.listings_stored, 1);
    }

    #[tokio::test]
    async fn relisted_item_merges_when_duplicate_check_is_down() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(72, "B")));
        let original = scraped("7", "Desk");
        pipeline(store.clone(), StaticSource::new(vec![original.clone()]), grader.clone())
            .run(RunRequest::default())
            .await
            .expect("first");

        store.fail_on("existing_identities").await;
        let relisted = ScrapedListing {
            link: "https://minneapolis.craigslist.org/fuo/d/desk-relisted/7.html".into(),
            ..original
        };
        let source = StaticSource::new(vec![relisted.clone()]);
        let summary = pipeline(store.clone(), source, grader.clone())
            .run(RunRequest::default())
            .await
            .expect("degraded run");

        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.listings_stored, 1);
        let listings = store.listings().await;
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].data.link, relisted.link);
        assert_eq!(grader.calls(), 1);
    }

    #[tokio::test]
    async fn scrape_error_fails_the_run() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let pipeline = pipeline(store.clone(), StaticSource::failing("HTTP 503"), grader.clone());
        let active = pipeline.begin(RunRequest::default()).await.expect("begin");
        let run_id = active.run_id;
        let phase = active.phase();

        let err = pipeline.execute(active).await.expect_err("scrape failure");
        assert_eq!(err.stage(), "scrape");
        assert_eq!(err.kind(), PipelineErrorKind::Internal);
        assert_eq!(*phase.borrow(), RunPhase::Failed);

        let run = store.get_run(run_id).await.expect("get").expect("run");
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error_message.as_deref().is_some_and(|m| m.contains("HTTP 503")));
        assert!(event_types(&store).await.contains(&EventType::RunFailed));
        assert_eq!(grader.calls(), 0);
    }

    #[tokio::test]
    async fn store_error_fails_the_run() {
        let store = Arc::new(MemoryStore::default());
        store.fail_on("upsert_listings").await;
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let err = pipeline(store.clone(), StaticSource::new(five_listings()), grader)
            .run(RunRequest::default())
            .await
            .expect_err("store failure");
        assert_eq!(err.stage(), "store");
        let run = store.latest_run().await.expect("latest").expect("run");
        assert_eq!(run.status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn failure_to_mark_failed_surfaces_both_errors() {
        let store = Arc::new(MemoryStore::default());
        store.fail_on("select_ungraded").await;
        store.fail_on("update_run").await;
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let err = pipeline(store.clone(), StaticSource::new(five_listings()), grader)
            .run(RunRequest::default())
            .await
            .expect_err("select failure");
        assert_eq!(err.stage(), "select");
        assert!(err.detail().contains("select_ungraded failed"));
        assert!(err.detail().contains("additionally failed to mark run failed"));
    }

    #[tokio::test]
    async fn finalize_write_failure_is_returned() {
        let store = Arc::new(MemoryStore::default());
        store.fail_on("update_run").await;
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let err = pipeline(store.clone(), StaticSource::new(five_listings()), grader.clone())
            .run(RunRequest::default())
            .await
            .expect_err("finalize failure");
        assert_eq!(err.stage(), "finalize");
        assert_eq!(grader.calls(), 5);
        assert_eq!(store.grades().await.len(), 5);
    }

    #[tokio::test]
    async fn begin_failure_creates_no_run() {
        let store = Arc::new(MemoryStore::default());
        store.fail_on("create_run").await;
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let source = StaticSource::new(five_listings());
        let pipeline = pipeline(store.clone(), source, grader);
        let err = pipeline
            .run(RunRequest::default())
            .await
            .expect_err("begin failure");
        assert_eq!(err.stage(), "begin");
        store.clear_faults().await;
        assert!(store.latest_run().await.expect("latest").is_none());
    }

    #[tokio::test]
    async fn cancelled_run_still_completes() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let pipeline = pipeline(store.clone(), StaticSource::new(five_listings()), grader.clone());
        let active = pipeline.begin(RunRequest::default()).await.expect("begin");
        active.cancel_token().cancel();
        let summary = pipeline.execute(active).await.expect("run");
        assert_eq!(summary.status, RunStatus::Completed);
        assert!(summary.cancelled);
        assert_eq!(summary.listings_graded, 0);
        assert_eq!(grader.calls(), 0);
        let types = event_types(&store).await;
        assert!(types.contains(&EventType::RunCancelled));
        assert_eq!(types.last(), Some(&EventType::RunCompleted));
    }

    #[tokio::test]
    async fn dry_run_exercises_persistence_without_model() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let summary = pipeline(store.clone(), StaticSource::new(five_listings()), grader.clone())
            .run(RunRequest {
                dry_run: true,
                triggered_by: None,
            })
            .await
            .expect("run");
        assert!(summary.dry_run);
        assert_eq!(grader.calls(), 0);
        assert_eq!(summary.average_score, Some(50));
        let grades = store.grades().await;
        assert_eq!(grades.len(), 5);
        assert!(grades.iter().all(|g| g.grade == GradeLetter::C));
    }

    #[tokio::test]
    async fn feedback_reaches_the_grader_instructions() {
        let store = Arc::new(MemoryStore::default());
        store
            .push_feedback(
                "v1",
                Feedback {
                    listing_title: "Overpriced futon".into(),
                    score: 80,
                    grade: "B".into(),
                    adjusted_score: Some(35),
                    notes: Some("futons resell cheaply".into()),
                    verdict: Verdict::Disagree,
                },
            )
            .await;
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(80, "B")));
        let pipeline = pipeline(store, StaticSource::new(Vec::new()), grader);
        let block = pipeline.current_instructions().await.expect("instructions");
        assert_eq!(block.disagreements, 1);
        assert!(block.text.contains("Overpriced futon"));
    }

    #[tokio::test]
    async fn grade_url_grades_single_listing() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(91, "A")));
        let listings = five_listings();
        let link = listings[2].link.clone();
        let pipeline = pipeline(store.clone(), StaticSource::new(listings), grader);

        let adhoc = pipeline.grade_url(&link, false).await.expect("grade");
        assert_eq!(adhoc.grade.score, 91);
        assert_eq!(adhoc.grade.prompt_version, "v1");
        assert_eq!(store.grades().await.len(), 1);
        assert!(store.latest_run().await.expect("latest").is_none());

        let err = pipeline
            .grade_url("https://example.org/item/1", false)
            .await
            .expect_err("unsupported");
        assert_eq!(err.kind(), PipelineErrorKind::InvalidInput);

        let err = pipeline
            .grade_url("https://minneapolis.craigslist.org/fuo/d/item/404.html", false)
            .await
            .expect_err("missing");
        assert_eq!(err.kind(), PipelineErrorKind::NotFound);
    }

    #[tokio::test]
    async fn stats_reflect_active_version() {
        let store = Arc::new(MemoryStore::default());
        let grader = Arc::new(ScriptedGrader::always(&verdict_json(70, "B")));
        let pipeline = pipeline(store, StaticSource::new(five_listings()), grader);
        pipeline.run(RunRequest::default()).await.expect("run");
        let stats = pipeline.stats().await.expect("stats");
        assert_eq!(stats.total_listings, 5);
        assert_eq!(stats.graded, 5);
        assert_eq!(stats.ungraded, 0);
        assert_eq!(stats.grade_distribution.get("B"), Some(&5));
    }
}
