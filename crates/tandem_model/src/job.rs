//! Sync jobs and their lifecycle.
//!
//! A job is one entity write in one direction. The queue owns a job until it
//! reaches a terminal state; retries, leases, and dead-lettering are explicit
//! transitions on [`JobStatus`] rather than callbacks.

use crate::entity::{EntityKind, EntityRef, SyncDirection};
use crate::record::{CanonicalKey, ContentHash};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Unique id of a sync job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh id.
    pub fn new() -> JobId {
        JobId(Uuid::new_v4())
    }

    /// Wraps an existing uuid.
    pub const fn from_uuid(id: Uuid) -> JobId {
        JobId(id)
    }

    /// The inner uuid.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        JobId::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be delivered.
    Pending,
    /// Delivered to a worker; lease not yet expired.
    InFlight,
    /// Applied and acknowledged.
    Done,
    /// Failed transiently; waiting for its scheduled retry.
    Failed,
    /// Abandoned after exhausting retries or a permanent failure.
    DeadLettered,
}

impl JobStatus {
    /// True for states that still occupy the (entity, direction) slot.
    pub fn is_open(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::InFlight | JobStatus::Failed)
    }

    /// True once the queue will never deliver the job again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::DeadLettered)
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InFlight => "in_flight",
            JobStatus::Done => "done",
            JobStatus::Failed => "failed",
            JobStatus::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a scan hands to the queue for one observed change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Entity kind.
    pub kind: EntityKind,
    /// Direction of the write.
    pub direction: SyncDirection,
    /// The source-side reference that produced the change.
    pub entity_ref: EntityRef,
    /// Cache record the change belongs to.
    pub canonical_key: CanonicalKey,
    /// Mapped, target-shape payload to write.
    pub payload: Value,
    /// Digest of `payload`.
    pub source_hash: ContentHash,
    /// Source system's last-modified timestamp for the change.
    pub source_modified_at: DateTime<Utc>,
    /// Attempts before the job dead-letters, from the direction's config.
    pub max_attempts: u32,
}

/// A unit of work: one entity write in one direction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncJob {
    /// Queue-assigned id.
    pub id: JobId,
    /// Entity kind.
    pub kind: EntityKind,
    /// Direction of the write.
    pub direction: SyncDirection,
    /// The source-side reference that produced this job.
    pub entity_ref: EntityRef,
    /// Cache record this job belongs to.
    pub canonical_key: CanonicalKey,
    /// Mapped, target-shape payload to write.
    pub payload: Value,
    /// Digest of `payload`.
    pub source_hash: ContentHash,
    /// Source system's last-modified timestamp for the observed change.
    pub source_modified_at: DateTime<Utc>,
    /// Bumped every time a newer change is coalesced into this job.
    pub payload_rev: u64,
    /// Delivery attempts so far.
    pub attempt: u32,
    /// Attempts after which the job dead-letters.
    pub max_attempts: u32,
    /// Lifecycle state.
    pub status: JobStatus,
    /// When the job was first enqueued.
    pub enqueued_at: DateTime<Utc>,
    /// Earliest next delivery, set when a retry is scheduled.
    pub not_before: Option<DateTime<Utc>>,
    /// Lease expiry while in flight.
    pub lease_deadline: Option<DateTime<Utc>>,
    /// Last failure message, kept for dead-letter listings.
    pub last_error: Option<String>,
}

impl SyncJob {
    /// Creates a pending job from a scan observation.
    pub fn pending(seed: NewJob, now: DateTime<Utc>) -> SyncJob {
        SyncJob {
            id: JobId::new(),
            kind: seed.kind,
            direction: seed.direction,
            entity_ref: seed.entity_ref,
            canonical_key: seed.canonical_key,
            payload: seed.payload,
            source_hash: seed.source_hash,
            source_modified_at: seed.source_modified_at,
            payload_rev: 0,
            attempt: 0,
            max_attempts: seed.max_attempts,
            status: JobStatus::Pending,
            enqueued_at: now,
            not_before: None,
            lease_deadline: None,
            last_error: None,
        }
    }

    /// Folds a newer observation of the same entity into this job.
    pub fn coalesce(&mut self, seed: &NewJob) {
        self.payload = seed.payload.clone();
        self.source_hash = seed.source_hash;
        self.source_modified_at = seed.source_modified_at;
        self.payload_rev += 1;
    }

    /// True when the queue may deliver the job at `now`.
    pub fn deliverable_at(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Failed)
            && self.not_before.map_or(true, |t| t <= now)
    }

    /// True when the in-flight lease expired at `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::InFlight && self.lease_deadline.map_or(false, |d| d <= now)
    }

    /// Marks delivery to a worker: one more attempt, leased until `deadline`.
    pub fn begin_delivery(&mut self, deadline: DateTime<Utc>) {
        self.attempt += 1;
        self.status = JobStatus::InFlight;
        self.lease_deadline = Some(deadline);
        self.not_before = None;
    }

    /// Returns the job to the pending pool (lease reclaim or stale ack).
    pub fn release(&mut self) {
        self.status = JobStatus::Pending;
        self.lease_deadline = None;
    }

    /// Schedules a retry no earlier than `not_before`.
    pub fn schedule_retry(&mut self, not_before: DateTime<Utc>, error: &str) {
        self.status = JobStatus::Failed;
        self.not_before = Some(not_before);
        self.lease_deadline = None;
        self.last_error = Some(error.to_string());
    }

    /// Abandons the job permanently.
    pub fn dead_letter(&mut self, error: &str) {
        self.status = JobStatus::DeadLettered;
        self.lease_deadline = None;
        self.not_before = None;
        self.last_error = Some(error.to_string());
    }

    /// Marks the job applied and acknowledged.
    pub fn complete(&mut self) {
        self.status = JobStatus::Done;
        self.lease_deadline = None;
        self.not_before = None;
    }

    /// Puts a dead letter back in the pending pool with a fresh attempt
    /// budget. Manual recovery only; the prior failure message is kept until
    /// the next outcome overwrites it.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Pending;
        self.attempt = 0;
        self.enqueued_at = now;
        self.not_before = None;
        self.lease_deadline = None;
    }
}
