//! Incremental re-ordering of the aggregate view.

use std::collections::HashSet;

use tracing::debug;

use super::types::{AggregateEntry, AggregateSnapshot};
use crate::SourceId;

/// Single writer of the [`AggregateSnapshot`].
///
/// Holds one entry per working-set source and recomputes the full ordering
/// after every applied update, so successive snapshots can never disagree
/// about ordering for the same entry set.
pub(crate) struct ResultMerger {
    query: String,
    pinned: HashSet<SourceId>,
    entries: Vec<AggregateEntry>,
}

impl ResultMerger {
    /// Build the initial view, already ordered.
    pub(crate) fn new(
        query: impl Into<String>,
        entries: Vec<AggregateEntry>,
        pinned: HashSet<SourceId>,
    ) -> Self {
        let mut merger = Self {
            query: query.into(),
            pinned,
            entries,
        };
        merger.reorder();
        merger
    }

    /// Replace one source's entry and recompute the full ordering.
    pub(crate) fn apply(&mut self, entry: AggregateEntry) -> AggregateSnapshot {
        match self
            .entries
            .iter_mut()
            .find(|e| e.source_id == entry.source_id)
        {
            Some(slot) => *slot = entry,
            None => {
                debug!(source = %entry.source_id, "ignoring update for source outside the working set");
                return self.snapshot();
            }
        }
        self.reorder();
        self.snapshot()
    }

    /// Current ordered view, cloned for publication.
    pub(crate) fn snapshot(&self) -> AggregateSnapshot {
        AggregateSnapshot {
            query: self.query.clone(),
            entries: self.entries.clone(),
        }
    }

    // Sources that actually have results bubble up, then pinned sources,
    // then alphabetically by display label.
    fn reorder(&mut self) {
        let pinned = &self.pinned;
        self.entries.sort_by_cached_key(|entry| {
            (
                !entry.has_results(),
                !pinned.contains(&entry.source_id),
                entry.label(),
            )
        });
    }
}
