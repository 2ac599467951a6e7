//! Decides when a collection needs a new job.

use chrono::{Duration, NaiveDate};

use crate::job::{Collection, Job, RetrievalFrequency};

/// Whether a new job should be planned for the collection.
///
/// Frozen collections and collections with an incomplete job are never
/// planned. Otherwise a collection is due when it has no retrieval frequency,
/// has never completed a job, or its last completed job started at least one
/// retrieval interval before `today`. `Never` collections are retrieved once.
pub fn should_be_planned(collection: &Collection, jobs: &[Job], today: NaiveDate) -> bool {
    if collection.frozen {
        return false;
    }
    if jobs.iter().any(|job| !job.is_complete()) {
        return false;
    }

    let last_start = jobs
        .iter()
        .filter(|job| job.is_complete())
        .filter_map(|job| job.start)
        .max();

    let Some(frequency) = collection.retrieval_frequency else {
        return true;
    };
    let Some(last_start) = last_start else {
        return true;
    };

    match frequency {
        RetrievalFrequency::Never => false,
        _ => frequency.interval_days().is_some_and(|days| {
            today >= last_start.date_naive() + Duration::days(days)
        }),
    }
}
