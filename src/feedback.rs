use crate::models::{Feedback, Verdict};
use crate::store::Store;
use std::sync::Arc;
use tracing::warn;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeedbackSample {
    pub disagreements: Vec<Feedback>,
    pub agreements: Vec<Feedback>,
}

impl FeedbackSample {
    pub fn len(&self) -> usize {
        self.disagreements.len() + self.agreements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pulls bounded, most-recent-first samples of reviewer feedback.
#[derive(Clone)]
pub struct FeedbackLoader {
    store: Arc<dyn Store>,
    max_disagreements: usize,
    max_agreements: usize,
}

impl FeedbackLoader {
    pub fn new(store: Arc<dyn Store>, max_disagreements: usize, max_agreements: usize) -> Self {
        Self {
            store,
            max_disagreements,
            max_agreements,
        }
    }

    /// An unavailable feedback table yields an empty sample rather than an error.
    pub async fn load(&self, prompt_version: &str) -> FeedbackSample {
        FeedbackSample {
            disagreements: self
                .sample(prompt_version, Verdict::Disagree, self.max_disagreements)
                .await,
            agreements: self
                .sample(prompt_version, Verdict::Agree, self.max_agreements)
                .await,
        }
    }

    async fn sample(&self, prompt_version: &str, verdict: Verdict, limit: usize) -> Vec<Feedback> {
        if limit == 0 {
            return Vec::new();
        }
        match self.store.load_feedback(prompt_version, verdict, limit).await {
            Ok(mut rows) => {
                rows.truncate(limit);
                rows
            }
            Err(err) => {
                warn!(
                    target = "grader.feedback",
                    prompt_version,
                    verdict = verdict.as_str(),
                    error = %err,
                    "feedback load failed; grading without exemplars"
                );
                Vec::new()
            }
        }
    }
}
