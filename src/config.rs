use std::env;

/// Tunables for a pipeline run, read once at startup.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub batch_size: usize,
    pub concurrency: usize,
    /// Upper bound on listings graded per run; `None` grades every ungraded listing.
    pub max_per_run: Option<usize>,
    pub feedback_disagreements: usize,
    pub feedback_agreements: usize,
    pub queries: Vec<String>,
    pub search_limit: usize,
    pub search_location: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            concurrency: 3,
            max_per_run: None,
            feedback_disagreements: 5,
            feedback_agreements: 5,
            queries: vec!["furniture".to_string()],
            search_limit: 50,
            search_location: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            batch_size: positive("GRADER_BATCH_SIZE").unwrap_or(defaults.batch_size),
            concurrency: positive("GRADER_CONCURRENCY").unwrap_or(defaults.concurrency),
            max_per_run: positive("GRADER_MAX_PER_RUN"),
            feedback_disagreements: non_negative("GRADER_FEEDBACK_DISAGREEMENTS")
                .unwrap_or(defaults.feedback_disagreements),
            feedback_agreements: non_negative("GRADER_FEEDBACK_AGREEMENTS")
                .unwrap_or(defaults.feedback_agreements),
            queries: env::var("SEARCH_QUERIES")
                .ok()
                .map(|raw| parse_list(&raw))
                .filter(|list| !list.is_empty())
                .unwrap_or(defaults.queries),
            search_limit: positive("SEARCH_LIMIT").unwrap_or(defaults.search_limit),
            search_location: env::var("SEARCH_LOCATION")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
        }
    }
}

fn positive(key: &str) -> Option<usize> {
    non_negative(key).filter(|v| *v > 0)
}

fn non_negative(key: &str) -> Option<usize> {
    env::var(key).ok().and_then(|v| v.trim().parse::<usize>().ok())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
