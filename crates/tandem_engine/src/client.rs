//! External-system clients.
//!
//! The engine never speaks to either platform directly; it is handed one
//! [`SystemClient`] per side. Real deployments wire HTTP clients here; tests
//! and local runs use [`MockSystemClient`].

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tandem_model::{EntityKind, SourceRecord, SystemKind};

/// A lazy, finite stream of changed records.
pub type RecordStream<'a> = Box<dyn Iterator<Item = SyncResult<SourceRecord>> + Send + 'a>;

/// One external system of record.
///
/// `list_changed` paginates internally; callers drain the returned stream
/// once per cycle. All calls are blocking and must bound their own timeouts.
pub trait SystemClient: Send + Sync {
    /// Which system this client reaches.
    fn system(&self) -> SystemKind;

    /// Records of `kind` modified after `since`.
    fn list_changed(&self, kind: EntityKind, since: DateTime<Utc>) -> SyncResult<RecordStream<'_>>;

    /// Creates a record, returning its new external id.
    fn create(&self, kind: EntityKind, record: &Value) -> SyncResult<String>;

    /// Replaces an existing record.
    fn update(&self, kind: EntityKind, external_id: &str, record: &Value) -> SyncResult<()>;

    /// Fetches a record.
    fn get(&self, kind: EntityKind, external_id: &str) -> SyncResult<Option<Value>>;
}

#[derive(Debug, Clone)]
struct StoredRecord {
    modified_at: DateTime<Utc>,
    fields: Value,
}

#[derive(Default)]
struct MockState {
    records: HashMap<EntityKind, BTreeMap<String, StoredRecord>>,
    fail_list: VecDeque<SyncError>,
    fail_stream: VecDeque<(usize, SyncError)>,
    fail_create: VecDeque<SyncError>,
    fail_update: VecDeque<SyncError>,
    now: Option<DateTime<Utc>>,
}

/// Scripted in-memory client for tests and local runs.
///
/// Records are seeded directly, failures are queued per operation and fire
/// once each, and every write is observable afterwards.
pub struct MockSystemClient {
    system: SystemKind,
    id_prefix: String,
    state: Mutex<MockState>,
    next_id: AtomicU64,
    list_calls: AtomicU64,
    create_calls: AtomicU64,
    update_calls: AtomicU64,
}

impl MockSystemClient {
    /// Client for `system` with an id prefix derived from it.
    pub fn new(system: SystemKind) -> MockSystemClient {
        let id_prefix = match system {
            SystemKind::FieldService => "fs-",
            SystemKind::Crm => "crm-",
        };
        MockSystemClient {
            system,
            id_prefix: id_prefix.to_string(),
            state: Mutex::new(MockState::default()),
            next_id: AtomicU64::new(100),
            list_calls: AtomicU64::new(0),
            create_calls: AtomicU64::new(0),
            update_calls: AtomicU64::new(0),
        }
    }

    /// Pins the clock used to stamp writes (defaults to wall time).
    pub fn set_now(&self, now: DateTime<Utc>) {
        self.state.lock().now = Some(now);
    }

    /// Seeds a record as if the system had it all along.
    pub fn seed_record(
        &self,
        kind: EntityKind,
        id: impl Into<String>,
        modified_at: DateTime<Utc>,
        fields: Value,
    ) {
        self.state
            .lock()
            .records
            .entry(kind)
            .or_default()
            .insert(id.into(), StoredRecord { modified_at, fields });
    }

    /// Queues an error for the next `list_changed` call.
    pub fn fail_next_list(&self, error: SyncError) {
        self.state.lock().fail_list.push_back(error);
    }

    /// Makes the next listing yield `n` records and then the error, as if a
    /// later page fetch had failed.
    pub fn fail_next_list_after(&self, n: usize, error: SyncError) {
        self.state.lock().fail_stream.push_back((n, error));
    }

    /// Queues an error for the next `create` call.
    pub fn fail_next_create(&self, error: SyncError) {
        self.state.lock().fail_create.push_back(error);
    }

    /// Queues an error for the next `update` call.
    pub fn fail_next_update(&self, error: SyncError) {
        self.state.lock().fail_update.push_back(error);
    }

    /// Current body of a record, if present.
    pub fn record(&self, kind: EntityKind, id: &str) -> Option<Value> {
        self.state
            .lock()
            .records
            .get(&kind)
            .and_then(|records| records.get(id))
            .map(|stored| stored.fields.clone())
    }

    /// Number of records of `kind`.
    pub fn record_count(&self, kind: EntityKind) -> usize {
        self.state
            .lock()
            .records
            .get(&kind)
            .map_or(0, |records| records.len())
    }

    /// Total `list_changed` calls.
    pub fn list_calls(&self) -> u64 {
        self.list_calls.load(Ordering::SeqCst)
    }

    /// Total `create` calls.
    pub fn create_calls(&self) -> u64 {
        self.create_calls.load(Ordering::SeqCst)
    }

    /// Total `update` calls.
    pub fn update_calls(&self) -> u64 {
        self.update_calls.load(Ordering::SeqCst)
    }

    fn now(&self, state: &MockState) -> DateTime<Utc> {
        state.now.unwrap_or_else(Utc::now)
    }
}

impl SystemClient for MockSystemClient {
    fn system(&self) -> SystemKind {
        self.system
    }

    fn list_changed(&self, kind: EntityKind, since: DateTime<Utc>) -> SyncResult<RecordStream<'_>> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(error) = state.fail_list.pop_front() {
            return Err(error);
        }
        let mut changed: Vec<SourceRecord> = state
            .records
            .get(&kind)
            .into_iter()
            .flatten()
            .filter(|(_, stored)| stored.modified_at > since)
            .map(|(id, stored)| SourceRecord::new(id.clone(), stored.modified_at, stored.fields.clone()))
            .collect();
        changed.sort_by(|a, b| a.modified_at.cmp(&b.modified_at).then_with(|| a.id.cmp(&b.id)));
        if let Some((n, error)) = state.fail_stream.pop_front() {
            let head = changed.into_iter().take(n).map(Ok);
            return Ok(Box::new(head.chain(std::iter::once(Err(error)))));
        }
        Ok(Box::new(changed.into_iter().map(Ok)))
    }

    fn create(&self, kind: EntityKind, record: &Value) -> SyncResult<String> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(error) = state.fail_create.pop_front() {
            return Err(error);
        }
        let id = format!("{}{}", self.id_prefix, self.next_id.fetch_add(1, Ordering::SeqCst));
        let modified_at = self.now(&state);
        state.records.entry(kind).or_default().insert(
            id.clone(),
            StoredRecord {
                modified_at,
                fields: record.clone(),
            },
        );
        Ok(id)
    }

    fn update(&self, kind: EntityKind, external_id: &str, record: &Value) -> SyncResult<()> {
        self.update_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.lock();
        if let Some(error) = state.fail_update.pop_front() {
            return Err(error);
        }
        let modified_at = self.now(&state);
        match state
            .records
            .get_mut(&kind)
            .and_then(|records| records.get_mut(external_id))
        {
            Some(stored) => {
                stored.fields = record.clone();
                stored.modified_at = modified_at;
                Ok(())
            }
            None => Err(SyncError::from_status(
                self.system,
                404,
                format!("no {kind} with id {external_id}"),
            )),
        }
    }

    fn get(&self, kind: EntityKind, external_id: &str) -> SyncResult<Option<Value>> {
        let state = self.state.lock();
        Ok(state
            .records
            .get(&kind)
            .and_then(|records| records.get(external_id))
            .map(|stored| stored.fields.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn utc(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn listing_respects_watermark_and_order() {
        let client = MockSystemClient::new(SystemKind::FieldService);
        client.seed_record(EntityKind::Customer, "c-2", utc(200), json!({"n": 2}));
        client.seed_record(EntityKind::Customer, "c-1", utc(100), json!({"n": 1}));
        client.seed_record(EntityKind::Customer, "c-3", utc(50), json!({"n": 3}));

        let stream = client.list_changed(EntityKind::Customer, utc(60)).unwrap();
        let records: Vec<SourceRecord> = stream.map(|r| r.unwrap()).collect();
        let ids: Vec<&str> = records.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["c-1", "c-2"]);
    }

    #[test]
    fn create_assigns_prefixed_ids() {
        let client = MockSystemClient::new(SystemKind::Crm);
        let id = client.create(EntityKind::Customer, &json!({"firstName": "Ada"})).unwrap();
        assert!(id.starts_with("crm-"));
        assert_eq!(client.record(EntityKind::Customer, &id), Some(json!({"firstName": "Ada"})));
        assert_eq!(client.create_calls(), 1);
    }

    #[test]
    fn scripted_failures_fire_once() {
        let client = MockSystemClient::new(SystemKind::Crm);
        client.fail_next_create(SyncError::from_status(SystemKind::Crm, 503, "maintenance"));
        assert!(client.create(EntityKind::Customer, &json!({})).is_err());
        assert!(client.create(EntityKind::Customer, &json!({})).is_ok());
    }

    #[test]
    fn scripted_mid_stream_failure_cuts_the_listing() {
        let client = MockSystemClient::new(SystemKind::FieldService);
        client.seed_record(EntityKind::Customer, "c-1", utc(10), json!({"n": 1}));
        client.seed_record(EntityKind::Customer, "c-2", utc(20), json!({"n": 2}));
        client.fail_next_list_after(1, SyncError::transient(SystemKind::FieldService, "cut"));

        let mut stream = client.list_changed(EntityKind::Customer, utc(0)).unwrap();
        assert_eq!(stream.next().unwrap().unwrap().id, "c-1");
        assert!(stream.next().unwrap().is_err());
        assert!(stream.next().is_none());

        // fires once; the listing after it is whole again
        let whole = client.list_changed(EntityKind::Customer, utc(0)).unwrap();
        assert_eq!(whole.count(), 2);
    }

    #[test]
    fn update_of_missing_record_is_permanent() {
        let client = MockSystemClient::new(SystemKind::FieldService);
        let err = client
            .update(EntityKind::Appointment, "fs-404", &json!({}))
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[test]
    fn pinned_clock_stamps_writes() {
        let client = MockSystemClient::new(SystemKind::Crm);
        client.set_now(utc(500));
        let id = client.create(EntityKind::Customer, &json!({"v": 1})).unwrap();
        let listed: Vec<SourceRecord> = client
            .list_changed(EntityKind::Customer, utc(499))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, id);
        assert_eq!(listed[0].modified_at, utc(500));
    }
}
