//! Query lifecycle: supersession, cancellation of stale work, and wiring of
//! fan-out, merge, and enrichment.

use std::sync::{Arc, Mutex, PoisonError};

use futures::StreamExt;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::enrichment::{EnrichmentPipeline, EnrichmentTask};
use super::fanout::{SourceFanout, DEFAULT_CONCURRENT_SOURCE_CALLS};
use super::merger::ResultMerger;
use super::types::{AggregateEntry, AggregateSnapshot, EnrichmentUpdate, WorkingSet};
use crate::error::ReconciliationError;
use crate::store::ReconciliationStore;

/// Item delivered on the snapshot stream.
///
/// The `Err` arm carries record-level reconciliation failures; the stream
/// keeps going afterward.
pub type SnapshotResult = Result<AggregateSnapshot, ReconciliationError>;

/// Receiving halves of the coordinator's two notification streams.
///
/// The streams are independent: enrichment updates have no 1:1 correlation
/// with snapshot emissions.
pub struct QueryStreams {
    pub snapshots: UnboundedReceiver<SnapshotResult>,
    pub enrichment: UnboundedReceiver<EnrichmentUpdate>,
}

/// Serializes emission against query supersession.
///
/// Every emission checks its generation and sends under the same lock that
/// `advance` takes, so once a new query has bumped the generation nothing
/// tagged to an older one can be delivered.
#[derive(Default)]
pub(crate) struct GenerationGate {
    current: Mutex<u64>,
}

impl GenerationGate {
    /// Supersede all prior generations and return the new current one.
    pub(crate) fn advance(&self) -> u64 {
        let mut current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *current += 1;
        *current
    }

    /// Deliver `value` unless `generation` has been superseded.
    pub(crate) fn send_if_current<T>(
        &self,
        generation: u64,
        tx: &UnboundedSender<T>,
        value: T,
    ) -> bool {
        let current = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *current != generation {
            return false;
        }
        tx.send(value).is_ok()
    }
}

struct ActiveQuery {
    query: Option<String>,
    fanout: Option<JoinHandle<()>>,
    enrichment: Option<JoinHandle<()>>,
}

/// Owns the lifecycle of "the current query" over a fixed working set.
///
/// Submitting a new query supersedes the previous one: outstanding fan-out
/// calls and the enrichment worker are cancelled, and nothing tagged to the
/// old query is delivered afterward. Cancellation is whole-query only; there
/// is no per-source cancellation.
pub struct QueryCoordinator {
    working_set: WorkingSet,
    store: Arc<dyn ReconciliationStore>,
    concurrency: usize,
    snapshot_tx: UnboundedSender<SnapshotResult>,
    update_tx: UnboundedSender<EnrichmentUpdate>,
    gate: Arc<GenerationGate>,
    active: Mutex<ActiveQuery>,
}

impl QueryCoordinator {
    /// Create a coordinator over `working_set`, returning it together with
    /// the receiving halves of its notification streams.
    pub fn new(
        working_set: WorkingSet,
        store: Arc<dyn ReconciliationStore>,
    ) -> (Self, QueryStreams) {
        let (snapshot_tx, snapshots) = mpsc::unbounded_channel();
        let (update_tx, enrichment) = mpsc::unbounded_channel();
        (
            Self {
                working_set,
                store,
                concurrency: DEFAULT_CONCURRENT_SOURCE_CALLS,
                snapshot_tx,
                update_tx,
                gate: Arc::new(GenerationGate::default()),
                active: Mutex::new(ActiveQuery {
                    query: None,
                    fanout: None,
                    enrichment: None,
                }),
            },
            QueryStreams {
                snapshots,
                enrichment,
            },
        )
    }

    /// Override the fan-out concurrency bound
    /// ([`DEFAULT_CONCURRENT_SOURCE_CALLS`] by default).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Text of the query currently being served, if any.
    pub fn active_query(&self) -> Option<String> {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .query
            .clone()
    }

    /// Start a federated search for `text`, superseding any previous query.
    ///
    /// Re-submitting the active query is a no-op, so duplicate triggers from
    /// the caller cannot restart the fan-out. Must be called from within a
    /// Tokio runtime; the call itself is fire-and-forget.
    pub fn submit_query(&self, text: &str) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);

        if active.query.as_deref() == Some(text) {
            debug!(query = %text, "query unchanged, ignoring");
            return;
        }

        info!(
            query = %text,
            sources = self.working_set.len(),
            "starting federated search"
        );

        // Supersede prior work before anything new is emitted.
        let generation = self.gate.advance();
        if let Some(handle) = active.fanout.take() {
            handle.abort();
        }
        if let Some(handle) = active.enrichment.take() {
            handle.abort();
        }
        active.query = Some(text.to_string());

        let pending: Vec<AggregateEntry> = self
            .working_set
            .sources
            .iter()
            .map(|source| AggregateEntry::pending(source.as_ref()))
            .collect();
        let mut merger = ResultMerger::new(text, pending, self.working_set.pinned.clone());
        self.gate
            .send_if_current(generation, &self.snapshot_tx, Ok(merger.snapshot()));

        if self.working_set.is_empty() {
            return;
        }

        let (task_tx, pipeline) = EnrichmentPipeline::channel(
            Arc::clone(&self.store),
            self.update_tx.clone(),
            Arc::clone(&self.gate),
            generation,
        );
        active.enrichment = Some(tokio::spawn(pipeline.run()));

        let fanout = SourceFanout::new(
            text,
            self.working_set.sources.clone(),
            Arc::clone(&self.store),
            self.concurrency,
        );
        let gate = Arc::clone(&self.gate);
        let snapshot_tx = self.snapshot_tx.clone();
        active.fanout = Some(tokio::spawn(async move {
            let mut completions = fanout.into_stream().boxed();
            while let Some(completion) = completions.next().await {
                for failure in completion.failures {
                    gate.send_if_current(generation, &snapshot_tx, Err(failure));
                }
                if !completion.batch.is_empty() {
                    let _ = task_tx.send(EnrichmentTask {
                        source: Arc::clone(&completion.source),
                        entities: completion.batch,
                    });
                }
                let snapshot = merger.apply(completion.entry);
                gate.send_if_current(generation, &snapshot_tx, Ok(snapshot));
            }
            debug!(generation, "fan-out complete");
            // task_tx drops here, letting the enrichment worker finish its
            // queue and exit.
        }));
    }
}

impl Drop for QueryCoordinator {
    fn drop(&mut self) {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(handle) = active.fanout.take() {
            handle.abort();
        }
        if let Some(handle) = active.enrichment.take() {
            handle.abort();
        }
    }
}
