// src/lib.rs
pub mod aggregate;
pub mod error;
pub mod store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use crate::aggregate::{
    AggregateEntry, AggregateSnapshot, EnrichmentUpdate, EntryState, QueryCoordinator,
    QueryStreams, SnapshotResult, WorkingSet, DEFAULT_CONCURRENT_SOURCE_CALLS,
    MAX_RESULTS_PER_SOURCE,
};
pub use crate::error::{ReconciliationError, SourceError, StoreError};
pub use crate::store::{EntityId, LocalEntity, MemoryStore, ReconciliationStore};

/// Stable identifier of a content source.
///
/// Assigned by whoever supplies the working set; this crate only compares and
/// hashes it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct SourceId(pub i64);

impl std::fmt::Display for SourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Opaque filter payload forwarded verbatim to a source's search call.
///
/// Sources interpret their own keys; the aggregator never inspects it and
/// passes an empty list for federated queries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FilterList(pub serde_json::Map<String, Value>);

/// One result item as returned by a source.
///
/// Ephemeral: produced per query and mapped onto a persisted [`LocalEntity`]
/// through the reconciliation store, never stored directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRecord {
    /// Source-scoped identifier, unique within the owning source.
    pub url: String,

    /// Result title.
    pub title: String,

    /// Preview image reference, if the listing already carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,

    /// Short description or snippet.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// When the content was created/published.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

impl SearchRecord {
    /// Create a record with the required fields.
    pub fn new(url: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            title: title.into(),
            preview_url: None,
            description: None,
            published: None,
        }
    }

    /// Builder method to add a preview reference.
    pub fn with_preview_url(mut self, preview_url: impl Into<String>) -> Self {
        self.preview_url = Some(preview_url.into());
        self
    }

    /// Builder method to add a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Builder method to add a publication timestamp.
    pub fn with_published(mut self, published: DateTime<Utc>) -> Self {
        self.published = Some(published);
        self
    }
}

/// One page of search results from a source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchPage {
    pub records: Vec<SearchRecord>,

    /// Whether the source reports further pages. Carried for callers that
    /// page through a single source; federated queries only fetch page 1.
    pub has_more: bool,
}

/// Enriched fields returned by a detail fetch, merged into a [`LocalEntity`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecordDetail {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,
}

/// An independent content provider queried during a federated search.
///
/// Both calls are opaque network/IO operations outside this crate's control.
/// Timeout policy is delegated entirely to the implementation; a timeout
/// surfaces as a [`SourceError`] and is treated like any other failed call.
#[async_trait]
pub trait Source: Send + Sync {
    /// Returns the stable identifier of the source.
    fn id(&self) -> SourceId;

    /// Returns the display name of the source.
    fn name(&self) -> &str;

    /// Returns the language tag of the source.
    fn lang(&self) -> &str;

    /// Search the source for `query`, returning one page of records.
    async fn search(
        &self,
        page: u32,
        query: &str,
        filters: &FilterList,
    ) -> Result<SearchPage, SourceError>;

    /// Fetch the full detail of a previously reconciled entity.
    async fn fetch_detail(&self, entity: &LocalEntity) -> Result<RecordDetail, SourceError>;
}
