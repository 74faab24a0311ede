//! Background hydration of entities still missing optional metadata.

use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

use super::coordinator::GenerationGate;
use super::types::EnrichmentUpdate;
use crate::store::{LocalEntity, ReconciliationStore};
use crate::Source;

/// A reconciled batch queued for hydration. Transient; discarded once
/// processed.
pub(crate) struct EnrichmentTask {
    pub(crate) source: Arc<dyn Source>,
    pub(crate) entities: Vec<LocalEntity>,
}

/// Sequential consumer of queued enrichment batches.
///
/// The producing side is an unbounded queue: offering a batch never blocks
/// the fan-out path and never drops, no matter how far the single worker
/// lags behind. Detail-fetch and persist failures are absorbed here; the
/// primary result stream never sees them.
pub(crate) struct EnrichmentPipeline {
    store: Arc<dyn ReconciliationStore>,
    tasks: UnboundedReceiver<EnrichmentTask>,
    updates: UnboundedSender<EnrichmentUpdate>,
    gate: Arc<GenerationGate>,
    generation: u64,
}

impl EnrichmentPipeline {
    /// Create the queue for one query generation, returning the producer
    /// handle and the worker to spawn.
    pub(crate) fn channel(
        store: Arc<dyn ReconciliationStore>,
        updates: UnboundedSender<EnrichmentUpdate>,
        gate: Arc<GenerationGate>,
        generation: u64,
    ) -> (UnboundedSender<EnrichmentTask>, Self) {
        let (tx, tasks) = mpsc::unbounded_channel();
        (
            tx,
            Self {
                store,
                tasks,
                updates,
                gate,
                generation,
            },
        )
    }

    /// Drain batches until every producer handle is gone.
    pub(crate) async fn run(mut self) {
        while let Some(task) = self.tasks.recv().await {
            self.process(task).await;
        }
        debug!(generation = self.generation, "enrichment queue drained");
    }

    async fn process(&self, task: EnrichmentTask) {
        for mut entity in task.entities {
            if !entity.needs_hydration() {
                continue;
            }

            match task.source.fetch_detail(&entity).await {
                Ok(detail) => {
                    entity.merge_detail(detail);
                    if let Err(error) = self.store.upsert(&entity).await {
                        warn!(
                            source = %entity.source_id,
                            url = %entity.url,
                            %error,
                            "failed to persist enriched entity"
                        );
                    }
                }
                Err(error) => {
                    // Keep whatever fields the entity already has; no retry.
                    debug!(
                        source = %entity.source_id,
                        url = %entity.url,
                        %error,
                        "detail fetch failed"
                    );
                }
            }

            self.gate.send_if_current(
                self.generation,
                &self.updates,
                EnrichmentUpdate {
                    source: Arc::clone(&task.source),
                    entity,
                },
            );
        }
    }
}
