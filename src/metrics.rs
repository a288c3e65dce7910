use tracing::trace;

// Trace-level counters; the Prometheus exporter scrapes nothing from these yet,
// they exist so log pipelines can aggregate them.

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "grader.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn phase_elapsed(phase: &'static str, elapsed_ms: u128) {
    trace!(
        target = "grader.metrics",
        phase = phase,
        elapsed_ms = elapsed_ms as u64,
        "phase_elapsed"
    );
}

pub fn item_graded(outcome: &'static str, elapsed_ms: u128) {
    trace!(
        target = "grader.metrics",
        outcome = outcome,
        elapsed_ms = elapsed_ms as u64,
        "item_graded"
    );
}
