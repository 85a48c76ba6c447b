//! Duplicate record resolution
//!
//! Overlapping uploads deliver the same device record more than once. Events
//! are ranked by the recency of their upload, stably sorted so the most recent
//! copy comes last, then reduced by three successive keep-last passes.

use crate::types::{Event, EventType, RankedEvent};
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use tracing::debug;

/// Deduplicated events plus the audit count
#[derive(Debug, Clone, Default)]
pub struct DedupOutcome {
    /// Surviving events in ascending `utc_time` order (ties by id)
    pub events: Vec<RankedEvent>,
    pub duplicates_removed: usize,
}

/// Resolver holding the upload recency ranking for one user
#[derive(Debug, Clone, Default)]
pub struct DuplicateResolver {
    ranks: HashMap<String, u32>,
}

impl DuplicateResolver {
    /// Rank uploads by upload time ascending (oldest = 1).
    ///
    /// Uploads sharing a timestamp are ordered by upload id; an upload id seen
    /// more than once keeps its earliest rank.
    pub fn new(uploads: &[Event]) -> Self {
        let mut ordered: Vec<(DateTime<Utc>, &str)> = uploads
            .iter()
            .filter_map(|u| u.upload_id.as_deref().map(|id| (u.utc_time, id)))
            .collect();
        ordered.sort();

        let mut ranks = HashMap::new();
        for (_, upload_id) in ordered {
            let next = ranks.len() as u32 + 1;
            ranks.entry(upload_id.to_string()).or_insert(next);
        }

        Self { ranks }
    }

    /// Recency rank of an upload; unknown or missing uploads rank 0 (oldest)
    pub fn rank_of(&self, upload_id: Option<&str>) -> u32 {
        upload_id
            .and_then(|id| self.ranks.get(id))
            .copied()
            .unwrap_or(0)
    }

    pub fn upload_count(&self) -> usize {
        self.ranks.len()
    }

    /// Remove duplicate copies of one event type's records
    pub fn resolve(&self, events: Vec<Event>) -> DedupOutcome {
        let before = events.len();

        let mut ranked: Vec<RankedEvent> = events
            .into_iter()
            .map(|mut event| {
                if event.device_time.is_none() {
                    event.device_time = Some(event.id.clone());
                }
                RankedEvent {
                    upload_rank: self.rank_of(event.upload_id.as_deref()),
                    event,
                }
            })
            .collect();

        // Oldest upload first so keep-last keeps the most recent copy
        ranked.sort_by(|a, b| {
            a.upload_rank
                .cmp(&b.upload_rank)
                .then_with(|| a.event.id.cmp(&b.event.id))
        });

        let ranked = keep_last_by(ranked, |r| (r.event.utc_time, payload_key(&r.event)));
        let ranked = keep_last_by(ranked, |r| {
            (r.event.device_time.clone(), payload_key(&r.event))
        });
        let mut ranked = keep_last_by(ranked, |r| r.event.utc_time);

        ranked.sort_by(|a, b| {
            a.event
                .utc_time
                .cmp(&b.event.utc_time)
                .then_with(|| a.event.id.cmp(&b.event.id))
        });

        let duplicates_removed = before - ranked.len();
        if duplicates_removed > 0 {
            debug!(removed = duplicates_removed, kept = ranked.len(), "removed duplicate records");
        }

        DedupOutcome {
            events: ranked,
            duplicates_removed,
        }
    }
}

/// Stable keep-last reduction: for each key only the last occurrence survives,
/// and survivors keep their relative order.
pub fn keep_last_by<T, K, F>(items: Vec<T>, key: F) -> Vec<T>
where
    K: Eq + Hash,
    F: Fn(&T) -> K,
{
    let mut seen = HashSet::with_capacity(items.len());
    let mut kept: Vec<T> = items
        .into_iter()
        .rev()
        .filter(|item| seen.insert(key(item)))
        .collect();
    kept.reverse();
    kept
}

/// Type-specific measured payload, compared bitwise
fn payload_key(event: &Event) -> [Option<u64>; 2] {
    let bits = |v: Option<f64>| v.map(f64::to_bits);
    match event.event_type {
        EventType::Cbg => [bits(event.value), None],
        EventType::Bolus => [bits(event.normal), bits(event.extended)],
        EventType::Basal => [bits(event.rate), bits(event.duration_ms)],
        EventType::Upload => [None, None],
    }
}
