//! Bounded fan-out of one search call per source.

use std::sync::Arc;

use futures::stream::{self, Stream, StreamExt};
use tracing::debug;

use super::types::AggregateEntry;
use crate::error::ReconciliationError;
use crate::store::{LocalEntity, ReconciliationStore};
use crate::{FilterList, Source};

/// Maximum provider calls in flight per query.
pub const DEFAULT_CONCURRENT_SOURCE_CALLS: usize = 5;

/// A source's result list is truncated to this many records.
pub const MAX_RESULTS_PER_SOURCE: usize = 10;

/// Outcome of one source's search call, yielded in completion order.
pub(crate) struct SourceCompletion {
    pub(crate) source: Arc<dyn Source>,
    pub(crate) entry: AggregateEntry,

    /// Reconciled entities in result order; what the enrichment queue receives.
    pub(crate) batch: Vec<LocalEntity>,

    /// Records dropped because the store could not reconcile them.
    pub(crate) failures: Vec<ReconciliationError>,
}

/// Issues one search call per working-set source, at most `concurrency` of
/// them in flight, launching the next queued call as soon as a slot frees.
pub(crate) struct SourceFanout {
    query: Arc<str>,
    sources: Vec<Arc<dyn Source>>,
    store: Arc<dyn ReconciliationStore>,
    concurrency: usize,
}

impl SourceFanout {
    pub(crate) fn new(
        query: impl Into<Arc<str>>,
        sources: Vec<Arc<dyn Source>>,
        store: Arc<dyn ReconciliationStore>,
        concurrency: usize,
    ) -> Self {
        Self {
            query: query.into(),
            sources,
            store,
            concurrency: concurrency.max(1),
        }
    }

    /// Completion-order stream over the working set.
    ///
    /// Dropping the stream drops every in-flight call and issues no further
    /// ones; that is the whole-run cancellation path.
    pub(crate) fn into_stream(self) -> impl Stream<Item = SourceCompletion> + Send {
        let SourceFanout {
            query,
            sources,
            store,
            concurrency,
        } = self;

        stream::iter(sources)
            .map(move |source| {
                let query = Arc::clone(&query);
                let store = Arc::clone(&store);
                async move { query_source(source, &query, store).await }
            })
            .buffer_unordered(concurrency)
    }
}

/// Run one source's search and reconcile its records.
///
/// A failed call is isolated: it becomes that source's empty entry and cannot
/// affect any other in-flight or queued call. A record that fails to
/// reconcile is dropped from the batch and reported on the completion.
async fn query_source(
    source: Arc<dyn Source>,
    query: &str,
    store: Arc<dyn ReconciliationStore>,
) -> SourceCompletion {
    let page = match source.search(1, query, &FilterList::default()).await {
        Ok(page) => page,
        Err(error) => {
            debug!(source = %source.id(), %error, "source search failed, treating as empty");
            return SourceCompletion {
                entry: AggregateEntry::empty(source.as_ref()),
                source,
                batch: Vec::new(),
                failures: Vec::new(),
            };
        }
    };

    let mut batch = Vec::new();
    let mut failures = Vec::new();
    for record in page.records.into_iter().take(MAX_RESULTS_PER_SOURCE) {
        match store.find_or_create(source.id(), &record).await {
            Ok(entity) => batch.push(entity),
            Err(error) => failures.push(ReconciliationError {
                source_id: source.id(),
                url: record.url,
                source: error,
            }),
        }
    }

    SourceCompletion {
        entry: AggregateEntry::loaded(source.as_ref(), batch.clone()),
        source,
        batch,
        failures,
    }
}
