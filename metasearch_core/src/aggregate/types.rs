//! Core types for the federated aggregation view.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::LocalEntity;
use crate::{Source, SourceId};

/// The ordered list of sources to query, plus the caller-supplied pinned ids.
///
/// Eligibility filtering (language, hidden, pinned-only) happens before this
/// is built; the pinned set is consumed purely as ordering input.
#[derive(Clone, Default)]
pub struct WorkingSet {
    pub sources: Vec<Arc<dyn Source>>,
    pub pinned: HashSet<SourceId>,
}

impl WorkingSet {
    pub fn new(sources: Vec<Arc<dyn Source>>) -> Self {
        Self {
            sources,
            pinned: HashSet::new(),
        }
    }

    /// Builder method to set the pinned source ids.
    pub fn with_pinned(mut self, pinned: impl IntoIterator<Item = SourceId>) -> Self {
        self.pinned = pinned.into_iter().collect();
        self
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// Completion state of one source within the current query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum EntryState {
    /// The source has not reported yet.
    Pending,

    /// The source completed with zero results or a failed call.
    Empty,

    /// The source completed with at least one reconciled entity.
    Loaded { entities: Vec<LocalEntity> },
}

/// One source's row in the aggregate view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateEntry {
    pub source_id: SourceId,
    pub source_name: String,
    pub source_lang: String,
    pub state: EntryState,
}

impl AggregateEntry {
    /// Entry for a source that has not reported yet.
    pub fn pending(source: &dyn Source) -> Self {
        Self::with_state(source, EntryState::Pending)
    }

    /// Entry for a source that completed with nothing to show.
    pub fn empty(source: &dyn Source) -> Self {
        Self::with_state(source, EntryState::Empty)
    }

    /// Entry for a completed source. An empty entity list normalizes to
    /// [`EntryState::Empty`].
    pub fn loaded(source: &dyn Source, entities: Vec<LocalEntity>) -> Self {
        let state = if entities.is_empty() {
            EntryState::Empty
        } else {
            EntryState::Loaded { entities }
        };
        Self::with_state(source, state)
    }

    fn with_state(source: &dyn Source, state: EntryState) -> Self {
        Self {
            source_id: source.id(),
            source_name: source.name().to_string(),
            source_lang: source.lang().to_string(),
            state,
        }
    }

    pub fn has_results(&self) -> bool {
        match &self.state {
            EntryState::Loaded { entities } => !entities.is_empty(),
            EntryState::Pending | EntryState::Empty => false,
        }
    }

    /// Composite label used as the final ordering tie-break.
    pub(crate) fn label(&self) -> String {
        format!("{} ({})", self.source_name, self.source_lang)
    }
}

/// The externally visible state of a federated query: one entry per
/// working-set source, fully re-ordered on every change.
///
/// Published as immutable clones; holders never observe a partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSnapshot {
    pub query: String,
    pub entries: Vec<AggregateEntry>,
}

impl AggregateSnapshot {
    /// Find a source's entry regardless of its current position.
    pub fn entry(&self, source_id: SourceId) -> Option<&AggregateEntry> {
        self.entries.iter().find(|e| e.source_id == source_id)
    }
}

/// Notification that the enrichment worker finished processing one entity.
#[derive(Clone)]
pub struct EnrichmentUpdate {
    pub source: Arc<dyn Source>,
    pub entity: LocalEntity,
}
