use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metasearch_core::{
    AggregateEntry, AggregateSnapshot, EntryState, FilterList, LocalEntity, MemoryStore,
    QueryCoordinator, QueryStreams, ReconciliationStore, RecordDetail, SearchPage, SearchRecord,
    Source, SourceError, SourceId, StoreError, WorkingSet,
};
use tokio::time::{sleep, timeout};

#[derive(Clone, Copy)]
enum SearchOutcome {
    Records(usize),
    Fail,
}

#[derive(Clone, Copy)]
enum DetailOutcome {
    Enrich,
    Fail,
}

/// Tracks how many searches are in flight at once across the stubs sharing it.
#[derive(Default)]
struct Gauge {
    current: AtomicUsize,
    max: AtomicUsize,
}

impl Gauge {
    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max.fetch_max(now, Ordering::SeqCst);
    }

    fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    fn peak(&self) -> usize {
        self.max.load(Ordering::SeqCst)
    }
}

struct StubSource {
    id: SourceId,
    name: &'static str,
    lang: &'static str,
    outcome: SearchOutcome,
    detail: DetailOutcome,
    delay: Duration,
    search_calls: AtomicUsize,
    gauge: Option<Arc<Gauge>>,
}

impl StubSource {
    fn new(id: i64, name: &'static str, outcome: SearchOutcome) -> Self {
        Self {
            id: SourceId(id),
            name,
            lang: "en",
            outcome,
            detail: DetailOutcome::Enrich,
            delay: Duration::ZERO,
            search_calls: AtomicUsize::new(0),
            gauge: None,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    fn with_detail(mut self, detail: DetailOutcome) -> Self {
        self.detail = detail;
        self
    }

    fn with_gauge(mut self, gauge: Arc<Gauge>) -> Self {
        self.gauge = Some(gauge);
        self
    }

    fn calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Source for StubSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn name(&self) -> &str {
        self.name
    }

    fn lang(&self) -> &str {
        self.lang
    }

    async fn search(
        &self,
        page: u32,
        query: &str,
        _filters: &FilterList,
    ) -> Result<SearchPage, SourceError> {
        assert_eq!(page, 1, "federated queries only fetch the first page");
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gauge) = &self.gauge {
            gauge.enter();
        }
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
        if let Some(gauge) = &self.gauge {
            gauge.exit();
        }
        match self.outcome {
            SearchOutcome::Fail => Err(SourceError::Network("connection reset".into())),
            SearchOutcome::Records(count) => Ok(SearchPage {
                records: (0..count)
                    .map(|i| {
                        SearchRecord::new(
                            format!("/{}/{}", query, i),
                            format!("{} {} {}", self.name, query, i),
                        )
                    })
                    .collect(),
                has_more: false,
            }),
        }
    }

    async fn fetch_detail(&self, entity: &LocalEntity) -> Result<RecordDetail, SourceError> {
        match self.detail {
            DetailOutcome::Fail => Err(SourceError::Timeout("detail fetch timed out".into())),
            DetailOutcome::Enrich => Ok(RecordDetail {
                preview_url: Some(format!("https://covers.example{}.png", entity.url)),
                description: Some("hydrated".into()),
                published: None,
            }),
        }
    }
}

/// Store wrapper that refuses to reconcile one specific record.
struct FlakyStore {
    inner: MemoryStore,
    poison_url: &'static str,
}

#[async_trait]
impl ReconciliationStore for FlakyStore {
    async fn find_or_create(
        &self,
        source_id: SourceId,
        record: &SearchRecord,
    ) -> Result<LocalEntity, StoreError> {
        if record.url == self.poison_url {
            return Err(StoreError::Unavailable("storage offline".into()));
        }
        self.inner.find_or_create(source_id, record).await
    }

    async fn upsert(&self, entity: &LocalEntity) -> Result<(), StoreError> {
        self.inner.upsert(entity).await
    }
}

fn working_set(sources: &[&Arc<StubSource>]) -> WorkingSet {
    WorkingSet::new(
        sources
            .iter()
            .map(|s| Arc::clone(*s) as Arc<dyn Source>)
            .collect(),
    )
}

async fn next_event(
    streams: &mut QueryStreams,
) -> Result<AggregateSnapshot, metasearch_core::ReconciliationError> {
    timeout(Duration::from_secs(2), streams.snapshots.recv())
        .await
        .expect("timed out waiting for a snapshot")
        .expect("snapshot stream closed")
}

async fn next_snapshot(streams: &mut QueryStreams) -> AggregateSnapshot {
    next_event(streams)
        .await
        .expect("unexpected reconciliation error")
}

async fn next_update(streams: &mut QueryStreams) -> metasearch_core::EnrichmentUpdate {
    timeout(Duration::from_secs(2), streams.enrichment.recv())
        .await
        .expect("timed out waiting for an enrichment update")
        .expect("enrichment stream closed")
}

async fn assert_no_more_snapshots(streams: &mut QueryStreams, wait: Duration) {
    let extra = timeout(wait, streams.snapshots.recv()).await;
    assert!(extra.is_err(), "unexpected extra snapshot: {:?}", extra);
}

fn entry_ids(snapshot: &AggregateSnapshot) -> Vec<i64> {
    snapshot.entries.iter().map(|e| e.source_id.0).collect()
}

fn loaded_entities(entry: &AggregateEntry) -> &[LocalEntity] {
    match &entry.state {
        EntryState::Loaded { entities } => entities,
        other => panic!("expected a loaded entry, got {:?}", other),
    }
}

/// Entries holding results must always precede pending/empty ones.
fn assert_nonempty_prefix(snapshot: &AggregateSnapshot) {
    let mut seen_blank = false;
    for entry in &snapshot.entries {
        if entry.has_results() {
            assert!(
                !seen_blank,
                "source {} with results ranked after a blank entry",
                entry.source_id
            );
        } else {
            seen_blank = true;
        }
    }
}

#[tokio::test]
async fn pinned_empty_and_failed_sources_order_as_expected() {
    let ant = Arc::new(StubSource::new(1, "Ant", SearchOutcome::Records(0)));
    let bee = Arc::new(StubSource::new(2, "Bee", SearchOutcome::Records(3)));
    let cat = Arc::new(StubSource::new(3, "Cat", SearchOutcome::Fail));
    let set = working_set(&[&ant, &bee, &cat]).with_pinned([SourceId(1)]);

    let (coordinator, mut streams) =
        QueryCoordinator::new(set, Arc::new(MemoryStore::new()));
    coordinator.submit_query("hunter");

    let initial = next_snapshot(&mut streams).await;
    assert_eq!(initial.query, "hunter");
    // All pending: the pinned source leads, the rest follow by label.
    assert_eq!(entry_ids(&initial), vec![1, 2, 3]);
    assert!(initial
        .entries
        .iter()
        .all(|e| e.state == EntryState::Pending));

    let mut last = initial;
    for _ in 0..3 {
        last = next_snapshot(&mut streams).await;
        assert_nonempty_prefix(&last);
    }

    // Bee has results; Ant beats Cat on the pin tie-break.
    assert_eq!(entry_ids(&last), vec![2, 1, 3]);
    assert_eq!(loaded_entities(last.entry(SourceId(2)).unwrap()).len(), 3);
    assert_eq!(last.entry(SourceId(1)).unwrap().state, EntryState::Empty);
    assert_eq!(last.entry(SourceId(3)).unwrap().state, EntryState::Empty);
}

#[tokio::test]
async fn oversized_result_pages_are_truncated() {
    let source = Arc::new(StubSource::new(1, "Big", SearchOutcome::Records(50)));
    let store = Arc::new(MemoryStore::new());
    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&[&source]), store.clone());

    coordinator.submit_query("op");
    let _initial = next_snapshot(&mut streams).await;
    let snapshot = next_snapshot(&mut streams).await;

    let entities = loaded_entities(snapshot.entry(SourceId(1)).unwrap());
    assert_eq!(entities.len(), 10);
    // Result order survives reconciliation.
    assert_eq!(entities[0].url, "/op/0");
    assert_eq!(entities[9].url, "/op/9");
    assert_eq!(store.len(), 10);
}

#[tokio::test]
async fn resubmitting_the_active_query_is_a_no_op() {
    let source = Arc::new(StubSource::new(1, "Solo", SearchOutcome::Records(1)));
    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&[&source]), Arc::new(MemoryStore::new()));

    coordinator.submit_query("bleach");
    let _initial = next_snapshot(&mut streams).await;
    let _complete = next_snapshot(&mut streams).await;

    coordinator.submit_query("bleach");
    assert_no_more_snapshots(&mut streams, Duration::from_millis(200)).await;
    assert_eq!(source.calls(), 1);
    assert_eq!(coordinator.active_query().as_deref(), Some("bleach"));
}

#[tokio::test]
async fn superseded_queries_deliver_nothing() {
    let source = Arc::new(
        StubSource::new(1, "Slow", SearchOutcome::Records(2))
            .with_delay(Duration::from_millis(300)),
    );
    let store = Arc::new(MemoryStore::new());
    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&[&source]), store.clone());

    coordinator.submit_query("q1");
    coordinator.submit_query("q2");

    let first = next_snapshot(&mut streams).await;
    assert_eq!(first.query, "q1");
    let second = next_snapshot(&mut streams).await;
    assert_eq!(second.query, "q2");
    let third = next_snapshot(&mut streams).await;
    assert_eq!(third.query, "q2");
    assert!(third.entry(SourceId(1)).unwrap().has_results());

    // Long enough for the superseded run to have completed, had it survived.
    assert_no_more_snapshots(&mut streams, Duration::from_millis(500)).await;

    for _ in 0..2 {
        let update = next_update(&mut streams).await;
        assert!(update.entity.url.starts_with("/q2/"));
    }
    assert!(store.get(SourceId(1), "/q1/0").is_none());
    assert_eq!(store.len(), 2);
}

#[tokio::test]
async fn in_flight_calls_never_exceed_the_concurrency_bound() {
    let gauge = Arc::new(Gauge::default());
    let sources: Vec<Arc<StubSource>> = (1..=5)
        .map(|i| {
            Arc::new(
                StubSource::new(i, "Worker", SearchOutcome::Records(1))
                    .with_delay(Duration::from_millis(50))
                    .with_gauge(Arc::clone(&gauge)),
            )
        })
        .collect();
    let refs: Vec<&Arc<StubSource>> = sources.iter().collect();

    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&refs), Arc::new(MemoryStore::new()));
    let coordinator = coordinator.with_concurrency(2);

    coordinator.submit_query("load");
    for _ in 0..6 {
        let _ = next_snapshot(&mut streams).await;
    }

    assert_eq!(gauge.peak(), 2);
    for source in &sources {
        assert_eq!(source.calls(), 1);
    }
}

#[tokio::test]
async fn enrichment_hydrates_and_persists_entities() {
    let source = Arc::new(StubSource::new(1, "Rich", SearchOutcome::Records(2)));
    let store = Arc::new(MemoryStore::new());
    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&[&source]), store.clone());

    coordinator.submit_query("frieren");
    let _initial = next_snapshot(&mut streams).await;
    let snapshot = next_snapshot(&mut streams).await;
    // The primary view is delivered before hydration ever runs.
    for entity in loaded_entities(snapshot.entry(SourceId(1)).unwrap()) {
        assert!(entity.preview_url.is_none());
    }

    for _ in 0..2 {
        let update = next_update(&mut streams).await;
        assert_eq!(update.source.id(), SourceId(1));
        assert!(update.entity.hydrated);
        assert!(update.entity.preview_url.is_some());
        assert_eq!(update.entity.description.as_deref(), Some("hydrated"));

        let stored = store.get(SourceId(1), &update.entity.url).unwrap();
        assert_eq!(stored, update.entity);
    }
}

#[tokio::test]
async fn failed_detail_fetches_leave_entities_untouched() {
    let source = Arc::new(
        StubSource::new(1, "Flaky", SearchOutcome::Records(1))
            .with_detail(DetailOutcome::Fail),
    );
    let store = Arc::new(MemoryStore::new());
    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&[&source]), store.clone());

    coordinator.submit_query("gantz");
    let _initial = next_snapshot(&mut streams).await;
    let _complete = next_snapshot(&mut streams).await;

    let update = next_update(&mut streams).await;
    assert!(!update.entity.hydrated);
    assert!(update.entity.preview_url.is_none());

    let stored = store.get(SourceId(1), &update.entity.url).unwrap();
    assert!(!stored.hydrated);

    // No query-level error is ever raised for an enrichment failure.
    assert_no_more_snapshots(&mut streams, Duration::from_millis(200)).await;
}

#[tokio::test]
async fn reconciliation_failures_surface_without_aborting_the_query() {
    let source = Arc::new(StubSource::new(1, "Partial", SearchOutcome::Records(3)));
    let store = Arc::new(FlakyStore {
        inner: MemoryStore::new(),
        poison_url: "/piece/1",
    });
    let (coordinator, mut streams) =
        QueryCoordinator::new(working_set(&[&source]), store);

    coordinator.submit_query("piece");
    let _initial = next_snapshot(&mut streams).await;

    let error = next_event(&mut streams)
        .await
        .expect_err("the poisoned record must surface");
    assert_eq!(error.source_id, SourceId(1));
    assert_eq!(error.url, "/piece/1");
    assert!(matches!(error.source, StoreError::Unavailable(_)));

    let snapshot = next_snapshot(&mut streams).await;
    let entities = loaded_entities(snapshot.entry(SourceId(1)).unwrap());
    assert_eq!(entities.len(), 2);
    assert!(entities.iter().all(|e| e.url != "/piece/1"));
}

#[tokio::test]
async fn empty_working_set_yields_one_empty_snapshot() {
    let (coordinator, mut streams) =
        QueryCoordinator::new(WorkingSet::default(), Arc::new(MemoryStore::new()));

    coordinator.submit_query("anything");
    let snapshot = next_snapshot(&mut streams).await;
    assert_eq!(snapshot.query, "anything");
    assert!(snapshot.entries.is_empty());

    assert_no_more_snapshots(&mut streams, Duration::from_millis(200)).await;
    assert_eq!(coordinator.active_query().as_deref(), Some("anything"));
}
