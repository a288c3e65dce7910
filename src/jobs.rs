use crate::{
    models::Run,
    pipeline::{Pipeline, PipelineError, RunPhase, RunRequest},
};
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio::sync::{Mutex, watch};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use uuid::Uuid;

/// Process-wide single-run flag.
#[derive(Clone, Default)]
pub struct RunSlot {
    busy: Arc<AtomicBool>,
}

/// Holds the slot until dropped.
pub struct SlotGuard {
    busy: Arc<AtomicBool>,
}

impl RunSlot {
    pub fn try_acquire(&self) -> Option<SlotGuard> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard {
                busy: self.busy.clone(),
            })
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("a run is already in progress")]
    Conflict,
    #[error("no run is in progress")]
    NoActiveRun,
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

struct ActiveHandle {
    run_id: Uuid,
    cancel: CancellationToken,
    phase: watch::Receiver<RunPhase>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunStatusView {
    pub active: bool,
    pub run_id: Option<Uuid>,
    pub phase: Option<RunPhase>,
    pub cancel_requested: bool,
    /// The active run's row, or the most recent run when idle.
    pub run: Option<Run>,
}

/// Starts runs in the background and answers status and cancel requests.
#[derive(Clone)]
pub struct RunController {
    pipeline: Pipeline,
    slot: RunSlot,
    active: Arc<Mutex<Option<ActiveHandle>>>,
}

impl RunController {
    pub fn new(pipeline: Pipeline) -> Self {
        Self {
            pipeline,
            slot: RunSlot::default(),
            active: Arc::new(Mutex::new(None)),
        }
    }

    /// Creates the run row and returns its id; scraping and grading continue
    /// on a spawned task.
    pub async fn start(&self, request: RunRequest) -> Result<Uuid, ControlError> {
        let guard = self.slot.try_acquire().ok_or(ControlError::Conflict)?;
        let active = self.pipeline.begin(request).await?;
        let run_id = active.run_id;
        *self.active.lock().await = Some(ActiveHandle {
            run_id,
            cancel: active.cancel_token(),
            phase: active.phase(),
        });

        let pipeline = self.pipeline.clone();
        let handles = self.active.clone();
        tokio::spawn(async move {
            let _guard = guard;
            match pipeline.execute(active).await {
                Ok(summary) => info!(
                    target = "grader.runs",
                    %run_id,
                    graded = summary.listings_graded,
                    failed = summary.listings_failed,
                    "background run finished"
                ),
                Err(err) => error!(
                    target = "grader.runs",
                    %run_id,
                    stage = err.stage(),
                    error = %err.detail(),
                    "background run failed"
                ),
            }
            handles.lock().await.take();
        });
        Ok(run_id)
    }

    /// Requests cancellation of the active run. Grading stops at the next
    /// batch or window boundary.
    pub async fn cancel(&self) -> Result<Uuid, ControlError> {
        let guard = self.active.lock().await;
        let handle = guard.as_ref().ok_or(ControlError::NoActiveRun)?;
        handle.cancel.cancel();
        info!(target = "grader.runs", run_id = %handle.run_id, "cancellation requested");
        Ok(handle.run_id)
    }

    pub async fn status(&self) -> Result<RunStatusView, ControlError> {
        let snapshot = self.active.lock().await.as_ref().map(|handle| {
            (
                handle.run_id,
                *handle.phase.borrow(),
                handle.cancel.is_cancelled(),
            )
        });
        let store = self.pipeline.store();
        let run = match snapshot {
            Some((run_id, _, _)) => store.get_run(run_id).await,
            None => store.latest_run().await,
        }
        .map_err(|err| PipelineError::internal("status", err.to_string()))?;
        Ok(RunStatusView {
            active: snapshot.is_some(),
            run_id: snapshot.map(|(id, _, _)| id),
            phase: snapshot.map(|(_, phase, _)| phase),
            cancel_requested: snapshot.is_some_and(|(_, _, cancelled)| cancelled),
            run,
        })
    }

    pub async fn run(&self, run_id: Uuid) -> Result<Run, ControlError> {
        self.pipeline
            .store()
            .get_run(run_id)
            .await
            .map_err(|err| PipelineError::internal("runs", err.to_string()))?
            .ok_or_else(|| PipelineError::not_found("runs", format!("run {run_id} not found")).into())
    }

    #[cfg(test)]
    pub fn is_busy(&self) -> bool {
        self.slot.is_busy()
    }
}
