use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::{RecordDetail, SearchRecord, SourceId};

/// Store-assigned identifier of a [`LocalEntity`].
pub type EntityId = i64;

/// Persisted identity for a record first seen during a search.
///
/// Keyed by `(source_id, url)`. Created once by
/// [`ReconciliationStore::find_or_create`] and from then on updated in place
/// only by the enrichment pipeline; never deleted by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocalEntity {
    /// Assigned by the store on creation.
    pub id: Option<EntityId>,

    pub source_id: SourceId,

    /// Source-scoped identifier, unique within the owning source.
    pub url: String,

    pub title: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub preview_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<DateTime<Utc>>,

    /// Whether a detail fetch has completed for this entity.
    pub hydrated: bool,
}

impl LocalEntity {
    /// Build a fresh, unpersisted entity from a provider record.
    pub fn from_record(record: &SearchRecord, source_id: SourceId) -> Self {
        Self {
            id: None,
            source_id,
            url: record.url.clone(),
            title: record.title.clone(),
            preview_url: record.preview_url.clone(),
            description: record.description.clone(),
            published: record.published,
            hydrated: false,
        }
    }

    /// Whether the enrichment pipeline still has work to do for this entity.
    pub fn needs_hydration(&self) -> bool {
        self.preview_url.is_none() && !self.hydrated
    }

    /// Merge enriched fields into the entity and mark it hydrated.
    ///
    /// `None` detail fields leave the existing value untouched.
    pub fn merge_detail(&mut self, detail: RecordDetail) {
        if detail.preview_url.is_some() {
            self.preview_url = detail.preview_url;
        }
        if detail.description.is_some() {
            self.description = detail.description;
        }
        if detail.published.is_some() {
            self.published = detail.published;
        }
        self.hydrated = true;
    }
}

/// Idempotent mapping from provider records to persisted local identities.
///
/// Implementations must make `find_or_create` atomic per key under concurrent
/// callers: exactly one entity is ever created for a given `(source_id, url)`,
/// and an existing entity is returned unmodified. Metadata is only refreshed
/// through `upsert`, which the enrichment pipeline calls after a successful
/// detail fetch.
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// Return the entity for `(source_id, record.url)`, creating it from
    /// `record` on first sighting.
    async fn find_or_create(
        &self,
        source_id: SourceId,
        record: &SearchRecord,
    ) -> Result<LocalEntity, StoreError>;

    /// Persist the current fields of an existing entity (idempotent).
    async fn upsert(&self, entity: &LocalEntity) -> Result<(), StoreError>;
}

/// A simple in-memory store, mainly for testing.
pub struct MemoryStore {
    entries: Mutex<HashMap<(SourceId, String), LocalEntity>>,
    next_id: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Look up an entity without creating it.
    pub fn get(&self, source_id: SourceId, url: &str) -> Option<LocalEntity> {
        self.entries
            .lock()
            .ok()?
            .get(&(source_id, url.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|map| map.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn find_or_create(
        &self,
        source_id: SourceId,
        record: &SearchRecord,
    ) -> Result<LocalEntity, StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?;

        let key = (source_id, record.url.clone());
        if let Some(existing) = entries.get(&key) {
            return Ok(existing.clone());
        }

        let mut entity = LocalEntity::from_record(record, source_id);
        entity.id = Some(self.next_id.fetch_add(1, Ordering::Relaxed));
        entries.insert(key, entity.clone());
        Ok(entity)
    }

    async fn upsert(&self, entity: &LocalEntity) -> Result<(), StoreError> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|e| StoreError::Persist(format!("lock poisoned: {}", e)))?;
        entries.insert((entity.source_id, entity.url.clone()), entity.clone());
        Ok(())
    }
}
