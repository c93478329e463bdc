//! Sync queue: ordered, at-least-once delivery of sync jobs.
//!
//! One open job per `(entity, direction)`; a second change to the same entity
//! coalesces into the existing job instead of duplicating it. Delivered jobs
//! hold a lease for the visibility timeout; an unacked job is delivered again
//! once the lease expires. Retried and abandoned jobs move through explicit
//! [`JobStatus`] transitions, never callbacks.

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};
use crate::retry::{RetryDecision, RetryPolicy};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use tandem_model::{EntityRef, JobId, JobStatus, NewJob, SyncDirection, SyncJob};
use tracing::{debug, warn};
use uuid::Uuid;

/// Result of acknowledging a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The job is done and archived.
    Completed,
    /// The payload was coalesced while in flight; the job went back to
    /// pending so the newest content still gets delivered.
    Released,
    /// The job was already resolved by another delivery.
    Superseded,
}

/// Result of negatively acknowledging a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackOutcome {
    /// A retry is scheduled no earlier than `not_before`.
    Rescheduled {
        /// Earliest next delivery.
        not_before: DateTime<Utc>,
    },
    /// The job was abandoned to the dead-letter archive.
    DeadLettered,
    /// The job was already resolved by another delivery.
    Superseded,
}

/// Ordered work queue of sync jobs.
///
/// Implementations reserve [`SyncError::QueueUnavailable`] for backing-store
/// failure, which aborts the running cycle. Delivery is at-least-once: a
/// consumer must be safe to apply the same job twice.
pub trait SyncQueue: Send + Sync {
    /// Adds a job, or coalesces it into the open job for the same
    /// `(entity, direction)`. Returns the id of the job that now carries the
    /// change.
    fn enqueue(&self, seed: NewJob) -> SyncResult<JobId>;

    /// Delivers up to `n` due jobs, oldest first, leasing each for the
    /// visibility timeout. Expired leases are reclaimed first.
    fn dequeue_batch(&self, n: usize) -> SyncResult<Vec<SyncJob>>;

    /// Confirms a delivered job, with the `payload_rev` the consumer applied.
    fn ack(&self, id: JobId, payload_rev: u64) -> SyncResult<AckOutcome>;

    /// Reports a failed delivery; the retry policy decides what happens.
    fn nack(&self, id: JobId, error: &SyncError) -> SyncResult<NackOutcome>;

    /// Drops the open job for `(entity, direction)` unless it is in flight.
    fn cancel_pending(&self, entity: &EntityRef, direction: SyncDirection) -> SyncResult<bool>;

    /// Dead letters, newest first.
    fn list_dead_letters(&self) -> SyncResult<Vec<SyncJob>>;

    /// Puts a dead letter back in the pending pool with a fresh attempt
    /// budget. Returns `false` when a newer open job already covers the same
    /// entity and direction; the dead letter is then discarded as superseded.
    fn retry_dead_letter(&self, id: JobId) -> SyncResult<bool>;

    /// Open (non-terminal) jobs.
    fn depth(&self) -> SyncResult<usize>;

    /// Jobs in the dead-letter archive.
    fn dead_letter_count(&self) -> SyncResult<usize>;
}

#[derive(Default)]
struct QueueState {
    open: HashMap<JobId, SyncJob>,
    by_pair: HashMap<(EntityRef, SyncDirection), JobId>,
    done: VecDeque<SyncJob>,
    dead: VecDeque<SyncJob>,
}

impl QueueState {
    fn unlink_pair(&mut self, job: &SyncJob) {
        let pair = (job.entity_ref.clone(), job.direction);
        if self.by_pair.get(&pair) == Some(&job.id) {
            self.by_pair.remove(&pair);
        }
    }

    /// Moves an open job into the done archive, dropping the oldest entry
    /// over `cap`.
    fn archive_done(&mut self, id: JobId, cap: usize) {
        if let Some(job) = self.open.remove(&id) {
            self.unlink_pair(&job);
            self.done.push_back(job);
            while self.done.len() > cap {
                self.done.pop_front();
            }
        }
    }

    /// Moves an open job into the dead-letter archive, dropping the oldest
    /// entry over `cap`.
    fn archive_dead(&mut self, id: JobId, cap: usize) {
        if let Some(job) = self.open.remove(&id) {
            self.unlink_pair(&job);
            self.dead.push_back(job);
            while self.dead.len() > cap {
                self.dead.pop_front();
            }
        }
    }
}

/// Process-local [`SyncQueue`] over a single mutex.
///
/// The lock covers in-memory transitions only; consumers perform their target
/// writes outside any queue call.
pub struct MemorySyncQueue {
    config: QueueConfig,
    retry: RetryPolicy,
    state: Mutex<QueueState>,
}

impl MemorySyncQueue {
    /// Queue with the given behavior and retry policy.
    pub fn new(config: QueueConfig, retry: RetryPolicy) -> MemorySyncQueue {
        MemorySyncQueue {
            config,
            retry,
            state: Mutex::new(QueueState::default()),
        }
    }

    /// Snapshot of a job wherever it currently lives.
    pub fn job(&self, id: JobId) -> Option<SyncJob> {
        let state = self.state.lock();
        state
            .open
            .get(&id)
            .or_else(|| state.done.iter().find(|j| j.id == id))
            .or_else(|| state.dead.iter().find(|j| j.id == id))
            .cloned()
    }
}

impl SyncQueue for MemorySyncQueue {
    fn enqueue(&self, seed: NewJob) -> SyncResult<JobId> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let pair = (seed.entity_ref.clone(), seed.direction);
        if let Some(&id) = state.by_pair.get(&pair) {
            if let Some(job) = state.open.get_mut(&id) {
                job.coalesce(&seed);
                debug!(
                    "coalesced change into job {} for {} (rev {})",
                    id, job.entity_ref, job.payload_rev
                );
                return Ok(id);
            }
            state.by_pair.remove(&pair);
        }
        let job = SyncJob::pending(seed, now);
        let id = job.id;
        state.by_pair.insert(pair, id);
        state.open.insert(id, job);
        Ok(id)
    }

    fn dequeue_batch(&self, n: usize) -> SyncResult<Vec<SyncJob>> {
        let now = Utc::now();
        let mut state = self.state.lock();

        let expired: Vec<JobId> = state
            .open
            .values()
            .filter(|job| job.lease_expired(now))
            .map(|job| job.id)
            .collect();
        for id in expired {
            let out_of_attempts = match state.open.get_mut(&id) {
                Some(job) if job.attempt >= job.max_attempts => {
                    job.dead_letter("lease expired after final attempt");
                    warn!("job {} dead-lettered: lease expired after final attempt", id);
                    true
                }
                Some(job) => {
                    debug!("reclaimed expired lease on job {} (attempt {})", id, job.attempt);
                    job.release();
                    false
                }
                None => false,
            };
            if out_of_attempts {
                state.archive_dead(id, self.config.dead_letter_archive);
            }
        }

        let mut due: Vec<(DateTime<Utc>, Uuid, JobId)> = state
            .open
            .values()
            .filter(|job| job.deliverable_at(now))
            .map(|job| (job.enqueued_at, job.id.as_uuid(), job.id))
            .collect();
        due.sort_by_key(|&(enqueued_at, uuid, _)| (enqueued_at, uuid));
        due.truncate(n);

        let deadline = now + self.config.visibility_timeout;
        let mut batch = Vec::with_capacity(due.len());
        for (_, _, id) in due {
            if let Some(job) = state.open.get_mut(&id) {
                job.begin_delivery(deadline);
                batch.push(job.clone());
            }
        }
        Ok(batch)
    }

    fn ack(&self, id: JobId, payload_rev: u64) -> SyncResult<AckOutcome> {
        let mut state = self.state.lock();
        let Some(job) = state.open.get_mut(&id) else {
            return Ok(AckOutcome::Superseded);
        };
        if job.payload_rev != payload_rev {
            job.release();
            debug!("job {} released on ack: payload coalesced while in flight", id);
            return Ok(AckOutcome::Released);
        }
        job.complete();
        state.archive_done(id, self.config.done_archive);
        Ok(AckOutcome::Completed)
    }

    fn nack(&self, id: JobId, error: &SyncError) -> SyncResult<NackOutcome> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(job) = state.open.get_mut(&id) else {
            return Ok(NackOutcome::Superseded);
        };
        match self.retry.assess(error, job.attempt, job.max_attempts) {
            RetryDecision::Retry { delay } => {
                let not_before = now + delay;
                job.schedule_retry(not_before, &error.to_string());
                debug!(
                    "job {} attempt {} failed, retry no earlier than {}: {}",
                    id, job.attempt, not_before, error
                );
                Ok(NackOutcome::Rescheduled { not_before })
            }
            RetryDecision::DeadLetter => {
                job.dead_letter(&error.to_string());
                warn!("job {} dead-lettered after attempt {}: {}", id, job.attempt, error);
                state.archive_dead(id, self.config.dead_letter_archive);
                Ok(NackOutcome::DeadLettered)
            }
        }
    }

    fn cancel_pending(&self, entity: &EntityRef, direction: SyncDirection) -> SyncResult<bool> {
        let mut state = self.state.lock();
        let pair = (entity.clone(), direction);
        let Some(&id) = state.by_pair.get(&pair) else {
            return Ok(false);
        };
        let cancellable = state
            .open
            .get(&id)
            .is_some_and(|job| job.status != JobStatus::InFlight);
        if !cancellable {
            return Ok(false);
        }
        state.open.remove(&id);
        state.by_pair.remove(&pair);
        debug!("cancelled pending job {} for {} {}", id, entity, direction);
        Ok(true)
    }

    fn list_dead_letters(&self) -> SyncResult<Vec<SyncJob>> {
        Ok(self.state.lock().dead.iter().rev().cloned().collect())
    }

    fn retry_dead_letter(&self, id: JobId) -> SyncResult<bool> {
        let now = Utc::now();
        let mut state = self.state.lock();
        let Some(pos) = state.dead.iter().position(|job| job.id == id) else {
            return Err(SyncError::State(format!("no dead letter {id}")));
        };
        let Some(mut job) = state.dead.remove(pos) else {
            return Err(SyncError::State(format!("no dead letter {id}")));
        };
        let pair = (job.entity_ref.clone(), job.direction);
        if state.by_pair.contains_key(&pair) {
            debug!("dead letter {} discarded: a newer job covers {}", id, job.entity_ref);
            return Ok(false);
        }
        job.requeue(now);
        state.by_pair.insert(pair, job.id);
        state.open.insert(job.id, job);
        Ok(true)
    }

    fn depth(&self) -> SyncResult<usize> {
        Ok(self.state.lock().open.len())
    }

    fn dead_letter_count(&self) -> SyncResult<usize> {
        Ok(self.state.lock().dead.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tandem_model::{CanonicalKey, ContentHash, EntityKind, SystemKind};

    fn instant_retry_queue(config: QueueConfig) -> MemorySyncQueue {
        let retry = RetryPolicy::new(
            RetryConfig::default()
                .with_base_delay(Duration::ZERO)
                .without_jitter(),
        );
        MemorySyncQueue::new(config, retry)
    }

    fn queue() -> MemorySyncQueue {
        instant_retry_queue(QueueConfig::default())
    }

    fn seed_for(id: &str, payload: Value) -> NewJob {
        NewJob {
            kind: EntityKind::Customer,
            direction: SyncDirection::FieldToCrm,
            entity_ref: EntityRef::new(EntityKind::Customer, SystemKind::FieldService, id),
            canonical_key: CanonicalKey::new(),
            source_hash: ContentHash::of(&payload),
            source_modified_at: Utc::now(),
            max_attempts: 3,
            payload,
        }
    }

    fn transient() -> SyncError {
        SyncError::transient(SystemKind::Crm, "connection reset")
    }

    fn permanent() -> SyncError {
        SyncError::from_status(SystemKind::Crm, 422, "invalid payload")
    }

    #[test]
    fn enqueue_deliver_ack_roundtrip() {
        let queue = queue();
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        assert_eq!(queue.depth().unwrap(), 1);

        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].attempt, 1);
        assert_eq!(batch[0].status, JobStatus::InFlight);

        assert_eq!(queue.ack(id, batch[0].payload_rev).unwrap(), AckOutcome::Completed);
        assert_eq!(queue.depth().unwrap(), 0);
        assert_eq!(queue.job(id).unwrap().status, JobStatus::Done);
    }

    #[test]
    fn second_change_coalesces_into_open_job() {
        let queue = queue();
        let first = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        let second = queue.enqueue(seed_for("c-1", json!({"v": 2}))).unwrap();
        assert_eq!(first, second);
        assert_eq!(queue.depth().unwrap(), 1);

        let batch = queue.dequeue_batch(10).unwrap();
        assert_eq!(batch[0].payload, json!({"v": 2}));
        assert_eq!(batch[0].payload_rev, 1);

        // different entity gets its own job
        queue.enqueue(seed_for("c-2", json!({"v": 1}))).unwrap();
        assert_eq!(queue.depth().unwrap(), 2);
    }

    #[test]
    fn stale_ack_releases_the_newer_payload() {
        let queue = queue();
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        let delivered = queue.dequeue_batch(1).unwrap().remove(0);

        queue.enqueue(seed_for("c-1", json!({"v": 2}))).unwrap();
        assert_eq!(
            queue.ack(id, delivered.payload_rev).unwrap(),
            AckOutcome::Released
        );
        assert_eq!(queue.depth().unwrap(), 1);

        let redelivered = queue.dequeue_batch(1).unwrap().remove(0);
        assert_eq!(redelivered.payload, json!({"v": 2}));
        assert_eq!(queue.ack(id, redelivered.payload_rev).unwrap(), AckOutcome::Completed);
        assert_eq!(queue.depth().unwrap(), 0);
    }

    #[test]
    fn transient_failure_schedules_retry_and_redelivers() {
        let queue = queue();
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        queue.dequeue_batch(1).unwrap();

        let outcome = queue.nack(id, &transient()).unwrap();
        assert!(matches!(outcome, NackOutcome::Rescheduled { .. }));
        assert_eq!(queue.job(id).unwrap().status, JobStatus::Failed);

        // zero base delay makes the retry due immediately
        let redelivered = queue.dequeue_batch(1).unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempt, 2);
    }

    #[test]
    fn permanent_failure_dead_letters_on_first_attempt() {
        let queue = queue();
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        queue.dequeue_batch(1).unwrap();

        assert_eq!(queue.nack(id, &permanent()).unwrap(), NackOutcome::DeadLettered);
        assert_eq!(queue.depth().unwrap(), 0);
        assert_eq!(queue.dead_letter_count().unwrap(), 1);

        let dead = queue.list_dead_letters().unwrap();
        assert_eq!(dead[0].id, id);
        assert_eq!(dead[0].attempt, 1);
        assert!(dead[0].last_error.as_deref().unwrap_or("").contains("422"));
        assert!(queue.dequeue_batch(10).unwrap().is_empty());
    }

    #[test]
    fn exhausted_attempts_dead_letter() {
        let queue = queue();
        let mut seed = seed_for("c-1", json!({"v": 1}));
        seed.max_attempts = 2;
        let id = queue.enqueue(seed).unwrap();

        queue.dequeue_batch(1).unwrap();
        assert!(matches!(
            queue.nack(id, &transient()).unwrap(),
            NackOutcome::Rescheduled { .. }
        ));
        queue.dequeue_batch(1).unwrap();
        assert_eq!(queue.nack(id, &transient()).unwrap(), NackOutcome::DeadLettered);

        let job = queue.job(id).unwrap();
        assert_eq!(job.status, JobStatus::DeadLettered);
        assert_eq!(job.attempt, 2);
    }

    #[test]
    fn expired_lease_is_redelivered() {
        let queue = instant_retry_queue(
            QueueConfig::default().with_visibility_timeout(Duration::ZERO),
        );
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();

        let first = queue.dequeue_batch(1).unwrap();
        assert_eq!(first[0].attempt, 1);

        // lease of zero expires immediately; next dequeue reclaims it
        let second = queue.dequeue_batch(1).unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].id, id);
        assert_eq!(second[0].attempt, 2);
    }

    #[test]
    fn expired_lease_after_final_attempt_dead_letters() {
        let queue = instant_retry_queue(
            QueueConfig::default().with_visibility_timeout(Duration::ZERO),
        );
        let mut seed = seed_for("c-1", json!({"v": 1}));
        seed.max_attempts = 1;
        let id = queue.enqueue(seed).unwrap();

        queue.dequeue_batch(1).unwrap();
        assert!(queue.dequeue_batch(1).unwrap().is_empty());
        assert_eq!(queue.dead_letter_count().unwrap(), 1);
        assert_eq!(queue.job(id).unwrap().attempt, 1);
    }

    #[test]
    fn cancel_only_reaches_undelivered_jobs() {
        let queue = queue();
        let entity = EntityRef::new(EntityKind::Customer, SystemKind::FieldService, "c-1");
        queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        assert!(queue.cancel_pending(&entity, SyncDirection::FieldToCrm).unwrap());
        assert_eq!(queue.depth().unwrap(), 0);

        queue.enqueue(seed_for("c-1", json!({"v": 2}))).unwrap();
        queue.dequeue_batch(1).unwrap();
        assert!(!queue.cancel_pending(&entity, SyncDirection::FieldToCrm).unwrap());
        assert_eq!(queue.depth().unwrap(), 1);
    }

    #[test]
    fn dead_letter_retry_requeues_with_fresh_budget() {
        let queue = queue();
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        queue.dequeue_batch(1).unwrap();
        queue.nack(id, &permanent()).unwrap();

        assert!(queue.retry_dead_letter(id).unwrap());
        assert_eq!(queue.dead_letter_count().unwrap(), 0);
        let job = queue.job(id).unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempt, 0);

        let redelivered = queue.dequeue_batch(1).unwrap();
        assert_eq!(redelivered[0].id, id);
    }

    #[test]
    fn dead_letter_retry_defers_to_a_newer_job() {
        let queue = queue();
        let id = queue.enqueue(seed_for("c-1", json!({"v": 1}))).unwrap();
        queue.dequeue_batch(1).unwrap();
        queue.nack(id, &permanent()).unwrap();

        let newer = queue.enqueue(seed_for("c-1", json!({"v": 2}))).unwrap();
        assert!(!queue.retry_dead_letter(id).unwrap());
        assert_eq!(queue.dead_letter_count().unwrap(), 0);
        assert_eq!(queue.depth().unwrap(), 1);
        assert!(queue.job(newer).is_some());
        assert!(queue.job(id).is_none());
    }

    #[test]
    fn unknown_dead_letter_is_an_error() {
        let queue = queue();
        assert!(queue.retry_dead_letter(JobId::new()).is_err());
    }

    #[test]
    fn done_archive_keeps_newest_up_to_cap() {
        let queue = instant_retry_queue(QueueConfig {
            done_archive: 2,
            ..QueueConfig::default()
        });
        let mut ids = Vec::new();
        for n in 0..3 {
            let id = queue.enqueue(seed_for(&format!("c-{n}"), json!({"v": n}))).unwrap();
            queue.dequeue_batch(1).unwrap();
            queue.ack(id, 0).unwrap();
            ids.push(id);
        }
        assert!(queue.job(ids[0]).is_none());
        assert!(queue.job(ids[1]).is_some());
        assert!(queue.job(ids[2]).is_some());
    }

    #[test]
    fn acks_for_vanished_jobs_are_superseded() {
        let queue = queue();
        assert_eq!(queue.ack(JobId::new(), 0).unwrap(), AckOutcome::Superseded);
        assert_eq!(
            queue.nack(JobId::new(), &transient()).unwrap(),
            NackOutcome::Superseded
        );
    }
}
