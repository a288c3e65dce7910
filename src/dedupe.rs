use crate::models::{ListingIdentity, ScrapedListing};
use crate::store::Store;
use std::collections::HashSet;
use tracing::{debug, warn};

/// Drops candidates already stored under the same `(source, external_id)` and
/// collapses repeats within `candidates` (same identity or same link, first
/// wins). Identity-less candidates are left to the store's upsert on `link`.
///
/// A failed existence check degrades to "nothing is stored yet": the upsert
/// downstream is idempotent, so this only costs redundant writes.
pub async fn filter_new(store: &dyn Store, candidates: Vec<ScrapedListing>) -> Vec<ScrapedListing> {
    let mut seen_links = HashSet::new();
    let mut seen_ids = HashSet::new();
    let unique: Vec<ScrapedListing> = candidates
        .into_iter()
        .filter(|item| {
            let fresh_id = item.identity().is_none_or(|id| seen_ids.insert(id));
            fresh_id && seen_links.insert(item.link.clone())
        })
        .collect();

    let identities: Vec<ListingIdentity> = unique.iter().filter_map(|i| i.identity()).collect();
    if identities.is_empty() {
        return unique;
    }

    let existing = match store.existing_identities(&identities).await {
        Ok(existing) => existing,
        Err(err) => {
            warn!(
                target = "grader.dedupe",
                error = %err,
                candidates = unique.len(),
                "duplicate check unavailable; treating all candidates as new"
            );
            return unique;
        }
    };

    let before = unique.len();
    let fresh: Vec<ScrapedListing> = unique
        .into_iter()
        .filter(|item| item.identity().is_none_or(|id| !existing.contains(&id)))
        .collect();
    debug!(
        target = "grader.dedupe",
        kept = fresh.len(),
        dropped = before - fresh.len(),
        "filtered known listings"
    );
    fresh
}
