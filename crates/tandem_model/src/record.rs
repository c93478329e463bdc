//! Source records, content digests, and per-entity sync state.

use crate::entity::{BySystem, EntityKind, EntityRef, SyncDirection, SystemKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fmt;
use uuid::Uuid;

/// A raw record as fetched from one system's change stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceRecord {
    /// The record's id in the source system.
    pub id: String,
    /// The source system's last-modified timestamp.
    pub modified_at: DateTime<Utc>,
    /// The record body as returned by the source API.
    pub fields: Value,
}

impl SourceRecord {
    /// Creates a record.
    pub fn new(id: impl Into<String>, modified_at: DateTime<Utc>, fields: Value) -> SourceRecord {
        SourceRecord {
            id: id.into(),
            modified_at,
            fields,
        }
    }
}

/// SHA-256 digest of a JSON value in canonical form.
///
/// Object keys are folded in sorted order and every node is tagged and
/// length-prefixed, so equal values always produce equal digests no matter
/// how the value was assembled.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Digests a JSON value.
    pub fn of(value: &Value) -> ContentHash {
        let mut hasher = Sha256::new();
        hash_value(&mut hasher, value);
        ContentHash(hasher.finalize().into())
    }

    /// Raw digest bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(64);
        for byte in self.0 {
            out.push_str(&format!("{byte:02x}"));
        }
        out
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.to_hex())
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

fn hash_value(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Null => hasher.update([0u8]),
        Value::Bool(b) => hasher.update([1u8, u8::from(*b)]),
        Value::Number(n) => {
            hasher.update([2u8]);
            hasher.update(n.to_string().as_bytes());
        }
        Value::String(s) => {
            hasher.update([3u8]);
            hasher.update((s.len() as u64).to_be_bytes());
            hasher.update(s.as_bytes());
        }
        Value::Array(items) => {
            hasher.update([4u8]);
            hasher.update((items.len() as u64).to_be_bytes());
            for item in items {
                hash_value(hasher, item);
            }
        }
        Value::Object(map) => {
            hasher.update([5u8]);
            hasher.update((map.len() as u64).to_be_bytes());
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for key in keys {
                hasher.update((key.len() as u64).to_be_bytes());
                hasher.update(key.as_bytes());
                if let Some(inner) = map.get(key) {
                    hash_value(hasher, inner);
                }
            }
        }
    }
}

/// Stable key linking one real-world entity's records across both systems.
///
/// Minted exactly once, when the entity first enters the change cache, and
/// never reassigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CanonicalKey(Uuid);

impl CanonicalKey {
    /// Mints a fresh key.
    pub fn new() -> CanonicalKey {
        CanonicalKey(Uuid::new_v4())
    }

    /// Wraps an existing uuid.
    pub const fn from_uuid(id: Uuid) -> CanonicalKey {
        CanonicalKey(id)
    }

    /// The inner uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for CanonicalKey {
    fn default() -> Self {
        CanonicalKey::new()
    }
}

impl fmt::Display for CanonicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Change-cache state for one entity: what each side last looked like and
/// when the sides last agreed.
///
/// Per-side digest convention: a side's digest is the hash of that side's
/// content *mapped into the other side's shape*, so a digest is comparable
/// across time and a writer can precompute the digest its own write will
/// produce on the counterpart side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Entity kind.
    pub kind: EntityKind,
    /// Minted once when the record first enters the cache; never changes.
    pub canonical_key: CanonicalKey,
    /// The entity's id in each system, linked at most once per side.
    pub external_ids: BySystem<Option<String>>,
    /// Digest per side as of the last confirmed sync.
    pub synced_hash: BySystem<Option<ContentHash>>,
    /// Latest observed digest per side (scan time, before any write).
    pub seen_hash: BySystem<Option<ContentHash>>,
    /// Source-reported modification time per side at last observation.
    pub seen_at: BySystem<Option<DateTime<Utc>>>,
    /// When the sides last agreed.
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Direction of the last applied write.
    pub last_direction: Option<SyncDirection>,
    /// Set when a bilateral edit was detected; cleared by the next sync.
    pub conflict: bool,
}

impl SyncRecord {
    /// New record for an entity first observed through `origin`.
    pub fn first_observed(origin: &EntityRef) -> SyncRecord {
        let mut external_ids = BySystem::default();
        external_ids.set(origin.system, Some(origin.id.clone()));
        SyncRecord {
            kind: origin.kind,
            canonical_key: CanonicalKey::new(),
            external_ids,
            synced_hash: BySystem::default(),
            seen_hash: BySystem::default(),
            seen_at: BySystem::default(),
            last_synced_at: None,
            last_direction: None,
            conflict: false,
        }
    }

    /// True if `system`'s observed content drifted from its synced content.
    pub fn drifted(&self, system: SystemKind) -> bool {
        self.seen_hash.get(system) != self.synced_hash.get(system)
    }

    /// Records a confirmed observation of `system`'s content.
    pub fn observe(&mut self, system: SystemKind, hash: ContentHash, modified_at: DateTime<Utc>) {
        self.seen_hash.set(system, Some(hash));
        self.seen_at.set(system, Some(modified_at));
    }

    /// Marks a confirmed write for `direction`: both sides now agree.
    ///
    /// `target_hash` is the digest the write is expected to produce on the
    /// target side (`None` when the payload could not be reverse-mapped); it
    /// is what lets the next scan of the target recognize the engine's own
    /// write and skip it.
    pub fn mark_synced(
        &mut self,
        direction: SyncDirection,
        source_hash: ContentHash,
        target_hash: Option<ContentHash>,
        at: DateTime<Utc>,
    ) {
        let source = direction.source();
        let target = direction.target();
        self.synced_hash.set(source, Some(source_hash));
        self.seen_hash.set(source, Some(source_hash));
        self.synced_hash.set(target, target_hash);
        self.seen_hash.set(target, target_hash);
        self.seen_at.set(target, Some(at));
        self.last_synced_at = Some(at);
        self.last_direction = Some(direction);
        self.conflict = false;
    }

    /// Links `system`'s external id. Idempotent for the same id.
    ///
    /// Returns `false` if a different id is already linked.
    pub fn link(&mut self, system: SystemKind, id: &str) -> bool {
        match self.external_ids.get(system) {
            Some(existing) => existing == id,
            None => {
                self.external_ids.set(system, Some(id.to_string()));
                true
            }
        }
    }

    /// True once both sides' ids are known.
    pub fn is_linked(&self) -> bool {
        self.external_ids.field_service.is_some() && self.external_ids.crm.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn utc(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn equal_values_hash_equal() {
        let a = json!({"name": "Ada", "age": 36, "tags": ["a", "b"]});
        let b = json!({"age": 36, "tags": ["a", "b"], "name": "Ada"});
        assert_eq!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn different_values_hash_differently() {
        let a = json!({"name": "Ada"});
        let b = json!({"name": "Ada "});
        assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn array_order_is_significant() {
        let a = json!(["x", "y"]);
        let b = json!(["y", "x"]);
        assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn nesting_is_unambiguous() {
        let a = json!({"a": {"b": 1}});
        let b = json!({"a": {}, "b": 1});
        assert_ne!(ContentHash::of(&a), ContentHash::of(&b));
    }

    #[test]
    fn hex_is_64_chars() {
        let h = ContentHash::of(&json!(null));
        assert_eq!(h.to_hex().len(), 64);
    }

    #[test]
    fn first_observed_sets_origin_id_only() {
        let origin = EntityRef::new(EntityKind::Customer, SystemKind::FieldService, "c-1");
        let rec = SyncRecord::first_observed(&origin);
        assert_eq!(rec.external_ids.field_service.as_deref(), Some("c-1"));
        assert_eq!(rec.external_ids.crm, None);
        assert!(!rec.is_linked());
        assert!(!rec.conflict);
    }

    #[test]
    fn drift_tracks_observation_vs_sync() {
        let origin = EntityRef::new(EntityKind::Customer, SystemKind::FieldService, "c-1");
        let mut rec = SyncRecord::first_observed(&origin);
        let h1 = ContentHash::of(&json!({"v": 1}));
        let h2 = ContentHash::of(&json!({"v": 2}));

        rec.observe(SystemKind::FieldService, h1, utc(10));
        assert!(rec.drifted(SystemKind::FieldService));

        rec.mark_synced(SyncDirection::FieldToCrm, h1, Some(h1), utc(20));
        assert!(!rec.drifted(SystemKind::FieldService));
        assert!(!rec.drifted(SystemKind::Crm));
        assert_eq!(rec.last_direction, Some(SyncDirection::FieldToCrm));

        rec.observe(SystemKind::Crm, h2, utc(30));
        assert!(rec.drifted(SystemKind::Crm));
        assert!(!rec.drifted(SystemKind::FieldService));
    }

    #[test]
    fn mark_synced_clears_conflict() {
        let origin = EntityRef::new(EntityKind::Appointment, SystemKind::Crm, "a-9");
        let mut rec = SyncRecord::first_observed(&origin);
        rec.conflict = true;
        let h = ContentHash::of(&json!({"v": 1}));
        rec.mark_synced(SyncDirection::CrmToField, h, None, utc(5));
        assert!(!rec.conflict);
        assert_eq!(rec.synced_hash.field_service, None);
        assert_eq!(rec.synced_hash.crm, Some(h));
    }

    #[test]
    fn link_is_idempotent_and_exclusive() {
        let origin = EntityRef::new(EntityKind::Customer, SystemKind::FieldService, "c-1");
        let mut rec = SyncRecord::first_observed(&origin);
        assert!(rec.link(SystemKind::Crm, "x-42"));
        assert!(rec.link(SystemKind::Crm, "x-42"));
        assert!(!rec.link(SystemKind::Crm, "x-43"));
        assert_eq!(rec.external_ids.crm.as_deref(), Some("x-42"));
        assert!(rec.is_linked());
    }

    fn json_leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(|n| json!(n)),
            "[a-z0-9 ]{0,12}".prop_map(Value::String),
        ]
    }

    fn json_value() -> impl Strategy<Value = Value> {
        json_leaf().prop_recursive(3, 24, 6, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Object(m.into_iter().collect())),
            ]
        })
    }

    proptest! {
        #[test]
        fn hashing_is_deterministic(value in json_value()) {
            prop_assert_eq!(ContentHash::of(&value), ContentHash::of(&value));
        }

        #[test]
        fn hash_survives_serde_roundtrip(value in json_value()) {
            let text = serde_json::to_string(&value).unwrap();
            let back: Value = serde_json::from_str(&text).unwrap();
            prop_assert_eq!(ContentHash::of(&value), ContentHash::of(&back));
        }
    }
}
