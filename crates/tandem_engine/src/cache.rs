//! Change cache: last-known sync state per entity, and change detection.
//!
//! The cache is the engine's memory. Every scan observation lands here first;
//! [`ChangeCache::detect_change`] classifies it against the stored state, and
//! confirmed writes commit back through [`ChangeCache::mark_synced`]. The
//! in-memory implementation is process-local; a scaled deployment swaps in an
//! implementation of the same trait over a shared store.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use tandem_model::{
    CanonicalKey, ContentHash, EntityKind, EntityRef, SyncDirection, SyncRecord, SystemKind,
};

/// One scan observation: an entity as its source system currently shows it.
///
/// `hash` is the digest of the record mapped into the other side's shape,
/// matching the per-side digest convention on [`SyncRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedChange {
    /// The entity as addressed by its source system.
    pub entity: EntityRef,
    /// Digest of the mapped record content.
    pub hash: ContentHash,
    /// The source system's last-modified timestamp for the record.
    pub modified_at: DateTime<Utc>,
}

impl ObservedChange {
    /// Observation of `entity` with the given mapped-content digest.
    pub fn new(entity: EntityRef, hash: ContentHash, modified_at: DateTime<Utc>) -> ObservedChange {
        ObservedChange {
            entity,
            hash,
            modified_at,
        }
    }

    /// The sync direction this observation feeds.
    pub fn direction(&self) -> SyncDirection {
        SyncDirection::from_source(self.entity.system)
    }
}

/// What an observation means relative to the stored state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeVerdict {
    /// Content matches the last synced state; nothing to do.
    Unchanged,
    /// Content changed on the source side only; safe to propagate.
    Changed,
    /// Both sides changed since they last agreed.
    Conflicting {
        /// The counterpart side's last observed modification time, for
        /// newest-wins resolution.
        counterpart_modified_at: Option<DateTime<Utc>>,
    },
}

/// Keyed store of per-entity sync state.
///
/// All methods are fallible; implementations reserve
/// [`SyncError::CacheUnavailable`] for backing-store failure, which aborts the
/// running cycle. Access to a given record is serialized by the
/// implementation; callers never hold any lock of their own across calls.
pub trait ChangeCache: Send + Sync {
    /// The record tracking `entity`, if it has ever been observed.
    fn get(&self, entity: &EntityRef) -> SyncResult<Option<SyncRecord>>;

    /// The record under `(kind, key)`, if present.
    fn get_by_key(&self, kind: EntityKind, key: &CanonicalKey) -> SyncResult<Option<SyncRecord>>;

    /// Records the observation and classifies it.
    ///
    /// First sight of an entity creates its record (minting the canonical
    /// key) and reports [`ChangeVerdict::Changed`].
    fn detect_change(&self, observed: &ObservedChange) -> SyncResult<ChangeVerdict>;

    /// Commits a confirmed write for `direction`.
    ///
    /// `target_hash` is the digest the write is expected to produce on the
    /// target side, or `None` when the payload could not be reverse-mapped.
    fn mark_synced(
        &self,
        kind: EntityKind,
        key: &CanonicalKey,
        direction: SyncDirection,
        source_hash: ContentHash,
        target_hash: Option<ContentHash>,
        at: DateTime<Utc>,
    ) -> SyncResult<()>;

    /// Links the record to its id on `system` after a successful create.
    ///
    /// Idempotent for the same id; returns `false` without modifying anything
    /// when a different id is already linked there.
    fn link_counterpart(
        &self,
        kind: EntityKind,
        key: &CanonicalKey,
        system: SystemKind,
        external_id: &str,
    ) -> SyncResult<bool>;

    /// Flags the record for manual review after a detected conflict.
    fn flag_conflict(&self, kind: EntityKind, key: &CanonicalKey) -> SyncResult<()>;

    /// Removes a record outright. Explicit reconciliation only.
    fn remove(&self, kind: EntityKind, key: &CanonicalKey) -> SyncResult<Option<SyncRecord>>;
}

#[derive(Default)]
struct CacheState {
    records: HashMap<(EntityKind, CanonicalKey), SyncRecord>,
    by_entity: HashMap<(EntityKind, SystemKind, String), CanonicalKey>,
}

/// Process-local [`ChangeCache`] over a single mutex.
///
/// The lock is held only for in-memory mutation, never across an external
/// call, so coarse locking stays safe under the worker pool.
#[derive(Default)]
pub struct MemoryChangeCache {
    state: Mutex<CacheState>,
}

impl MemoryChangeCache {
    /// Empty cache.
    pub fn new() -> MemoryChangeCache {
        MemoryChangeCache::default()
    }

    /// Number of tracked entities.
    pub fn len(&self) -> usize {
        self.state.lock().records.len()
    }

    /// True when nothing has been observed yet.
    pub fn is_empty(&self) -> bool {
        self.state.lock().records.is_empty()
    }
}

fn entity_key(entity: &EntityRef) -> (EntityKind, SystemKind, String) {
    (entity.kind, entity.system, entity.id.clone())
}

impl ChangeCache for MemoryChangeCache {
    fn get(&self, entity: &EntityRef) -> SyncResult<Option<SyncRecord>> {
        let state = self.state.lock();
        let Some(key) = state.by_entity.get(&entity_key(entity)) else {
            return Ok(None);
        };
        Ok(state.records.get(&(entity.kind, *key)).cloned())
    }

    fn get_by_key(&self, kind: EntityKind, key: &CanonicalKey) -> SyncResult<Option<SyncRecord>> {
        Ok(self.state.lock().records.get(&(kind, *key)).cloned())
    }

    fn detect_change(&self, observed: &ObservedChange) -> SyncResult<ChangeVerdict> {
        let mut state = self.state.lock();
        let entity = &observed.entity;
        let key = match state.by_entity.get(&entity_key(entity)) {
            Some(key) => *key,
            None => {
                let record = SyncRecord::first_observed(entity);
                let key = record.canonical_key;
                state.by_entity.insert(entity_key(entity), key);
                state.records.insert((entity.kind, key), record);
                key
            }
        };
        let record = state
            .records
            .get_mut(&(entity.kind, key))
            .ok_or_else(|| SyncError::cache_unavailable("canonical index points at a missing record"))?;

        let source = entity.system;
        record.observe(source, observed.hash, observed.modified_at);
        if *record.synced_hash.get(source) == Some(observed.hash) {
            return Ok(ChangeVerdict::Unchanged);
        }
        if record.drifted(source.other()) {
            return Ok(ChangeVerdict::Conflicting {
                counterpart_modified_at: *record.seen_at.get(source.other()),
            });
        }
        Ok(ChangeVerdict::Changed)
    }

    fn mark_synced(
        &self,
        kind: EntityKind,
        key: &CanonicalKey,
        direction: SyncDirection,
        source_hash: ContentHash,
        target_hash: Option<ContentHash>,
        at: DateTime<Utc>,
    ) -> SyncResult<()> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(&(kind, *key))
            .ok_or_else(|| SyncError::State(format!("no sync record for {kind} {key}")))?;
        record.mark_synced(direction, source_hash, target_hash, at);
        Ok(())
    }

    fn link_counterpart(
        &self,
        kind: EntityKind,
        key: &CanonicalKey,
        system: SystemKind,
        external_id: &str,
    ) -> SyncResult<bool> {
        let mut state = self.state.lock();
        let index_key = (kind, system, external_id.to_string());
        if let Some(owner) = state.by_entity.get(&index_key) {
            if owner != key {
                return Ok(false);
            }
        }
        let linked = match state.records.get_mut(&(kind, *key)) {
            Some(record) => record.link(system, external_id),
            None => {
                return Err(SyncError::State(format!("no sync record for {kind} {key}")));
            }
        };
        if linked {
            state.by_entity.insert(index_key, *key);
        }
        Ok(linked)
    }

    fn flag_conflict(&self, kind: EntityKind, key: &CanonicalKey) -> SyncResult<()> {
        let mut state = self.state.lock();
        let record = state
            .records
            .get_mut(&(kind, *key))
            .ok_or_else(|| SyncError::State(format!("no sync record for {kind} {key}")))?;
        record.conflict = true;
        Ok(())
    }

    fn remove(&self, kind: EntityKind, key: &CanonicalKey) -> SyncResult<Option<SyncRecord>> {
        let mut state = self.state.lock();
        let removed = state.records.remove(&(kind, *key));
        if removed.is_some() {
            state.by_entity.retain(|_, owner| owner != key);
        }
        Ok(removed)
    }
}
