//! Federated query aggregation.
//!
//! This module provides:
//! - `QueryCoordinator`: lifecycle of the current query (supersession,
//!   cancellation, wiring)
//! - `AggregateSnapshot`: the single ordered view, re-derived after every
//!   source completion
//! - `EnrichmentUpdate`: background hydration notifications, decoupled from
//!   the snapshot stream
//!
//! # Example
//!
//! ```ignore
//! use metasearch_core::{QueryCoordinator, WorkingSet};
//!
//! let (coordinator, mut streams) = QueryCoordinator::new(working_set, store);
//! coordinator.submit_query("one piece");
//! while let Some(Ok(snapshot)) = streams.snapshots.recv().await {
//!     render(snapshot);
//! }
//! ```

mod coordinator;
mod enrichment;
mod fanout;
mod merger;
mod types;

pub use coordinator::{QueryCoordinator, QueryStreams, SnapshotResult};
pub use fanout::{DEFAULT_CONCURRENT_SOURCE_CALLS, MAX_RESULTS_PER_SOURCE};
pub use types::{AggregateEntry, AggregateSnapshot, EnrichmentUpdate, EntryState, WorkingSet};
