//! Scan and apply phases of one sync cycle.
//!
//! A cycle runs the requested directions' scans sequentially on the calling
//! thread while a shared pool of apply workers drains the queue and writes
//! to the targets. Scans and applies overlap freely; the pool exits once
//! every scan has finished and the queue has no deliverable work left.
//!
//! Failure handling is split by blast radius. A record that fails to map is
//! counted and skipped, the scan continues. A write that fails is nacked and
//! left to the retry policy. A queue or cache failure aborts the whole
//! cycle, and the affected directions' watermarks do not advance.

use crate::cache::{ChangeCache, ChangeVerdict, ObservedChange};
use crate::client::SystemClient;
use crate::config::EngineConfig;
use crate::error::{SyncError, SyncResult};
use crate::mapper::FieldMapper;
use crate::queue::SyncQueue;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem_model::{
    BySystem, ConflictWinner, ContentHash, CycleReport, EntityKind, EntityRef, NewJob,
    SourceRecord, SyncDirection, SyncJob, SyncRecord,
};
use tracing::{debug, warn};

/// How long an idle apply worker waits before polling the queue again.
const IDLE_POLL: Duration = Duration::from_millis(10);

/// Everything a cycle needs, shared across the scan thread and the pool.
pub(crate) struct SyncContext {
    /// One client per system.
    pub clients: BySystem<Arc<dyn SystemClient>>,
    /// Per-entity sync state.
    pub cache: Arc<dyn ChangeCache>,
    /// Pending writes.
    pub queue: Arc<dyn SyncQueue>,
    /// Field translation tables.
    pub mapper: FieldMapper,
    /// Engine configuration.
    pub config: EngineConfig,
}

/// What one cycle produced.
#[derive(Debug)]
pub(crate) struct CycleOutcome {
    /// Per `(direction, kind)` counters, sorted for stable output.
    pub reports: Vec<CycleReport>,
    /// Directions whose scan finished without aborting.
    pub clean_scans: Vec<SyncDirection>,
    /// First error that aborted a scan or an apply worker.
    pub error: Option<SyncError>,
}

/// Shared counters, merged into per-(direction, kind) reports at cycle end.
struct CycleTotals {
    reports: Mutex<HashMap<(SyncDirection, EntityKind), CycleReport>>,
}

impl CycleTotals {
    fn new() -> CycleTotals {
        CycleTotals {
            reports: Mutex::new(HashMap::new()),
        }
    }

    fn absorb(&self, report: CycleReport) {
        self.reports
            .lock()
            .entry((report.direction, report.kind))
            .or_insert_with(|| CycleReport::new(report.direction, report.kind))
            .absorb(&report);
    }

    fn bump(&self, direction: SyncDirection, kind: EntityKind, f: impl FnOnce(&mut CycleReport)) {
        let mut reports = self.reports.lock();
        f(reports
            .entry((direction, kind))
            .or_insert_with(|| CycleReport::new(direction, kind)));
    }

    fn add_created(&self, direction: SyncDirection, kind: EntityKind) {
        self.bump(direction, kind, |r| r.created += 1);
    }

    fn add_updated(&self, direction: SyncDirection, kind: EntityKind) {
        self.bump(direction, kind, |r| r.updated += 1);
    }

    fn add_failed(&self, direction: SyncDirection, kind: EntityKind) {
        self.bump(direction, kind, |r| r.failed += 1);
    }

    fn into_reports(self) -> Vec<CycleReport> {
        let mut reports: Vec<CycleReport> = self.reports.into_inner().into_values().collect();
        reports.sort_by_key(|r| (r.direction.as_str(), r.kind.as_str()));
        reports
    }
}

/// Runs one cycle: each `(direction, since)` scan in order, with the apply
/// pool draining the queue alongside.
///
/// Returns once the scans are done and the pool has drained every job that
/// is deliverable this cycle. Jobs waiting out a retry delay stay queued for
/// a later cycle.
pub(crate) fn run_cycle(
    ctx: &SyncContext,
    scans: &[(SyncDirection, DateTime<Utc>)],
) -> CycleOutcome {
    let totals = CycleTotals::new();
    let scan_done = AtomicBool::new(false);
    let mut clean_scans = Vec::new();
    let mut first_error: Option<SyncError> = None;

    thread::scope(|scope| {
        let mut workers = Vec::with_capacity(ctx.config.apply_workers);
        for _ in 0..ctx.config.apply_workers {
            workers.push(scope.spawn(|| apply_loop(ctx, &totals, &scan_done)));
        }

        for &(direction, since) in scans {
            match run_scan(ctx, &totals, direction, since) {
                Ok(()) => clean_scans.push(direction),
                Err(err) => {
                    warn!("{} scan aborted: {}", direction, err);
                    first_error.get_or_insert(err);
                }
            }
        }
        scan_done.store(true, Ordering::Release);

        for worker in workers {
            match worker.join() {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    warn!("apply worker aborted: {}", err);
                    first_error.get_or_insert(err);
                }
                Err(_) => {
                    first_error.get_or_insert(SyncError::State("apply worker panicked".into()));
                }
            }
        }
    });

    CycleOutcome {
        reports: totals.into_reports(),
        clean_scans,
        error: first_error,
    }
}

/// Scans every configured kind for one direction.
fn run_scan(
    ctx: &SyncContext,
    totals: &CycleTotals,
    direction: SyncDirection,
    since: DateTime<Utc>,
) -> SyncResult<()> {
    debug!("scanning {} for changes since {}", direction, since);
    for &kind in &ctx.config.kinds {
        scan_kind(ctx, totals, direction, kind, since)?;
    }
    Ok(())
}

/// Scans one `(direction, kind)`, folding whatever was counted into `totals`
/// even when the scan aborts partway.
fn scan_kind(
    ctx: &SyncContext,
    totals: &CycleTotals,
    direction: SyncDirection,
    kind: EntityKind,
    since: DateTime<Utc>,
) -> SyncResult<()> {
    let started = Instant::now();
    let mut report = CycleReport::new(direction, kind);
    let outcome = scan_records(ctx, direction, kind, since, &mut report);
    report.duration_ms = started.elapsed().as_millis() as u64;
    totals.absorb(report);
    outcome
}

fn scan_records(
    ctx: &SyncContext,
    direction: SyncDirection,
    kind: EntityKind,
    since: DateTime<Utc>,
    report: &mut CycleReport,
) -> SyncResult<()> {
    let source = ctx.clients.get(direction.source());
    for record in source.list_changed(kind, since)? {
        let record = record?;
        report.scanned += 1;
        match process_record(ctx, direction, kind, &record) {
            Ok(ScanAction::Skipped) => report.skipped += 1,
            Ok(ScanAction::Queued) => {}
            Ok(ScanAction::Conflict) => report.conflicts += 1,
            Err(SyncError::Mapping(err)) => {
                warn!("{} {} {} does not map: {}", direction, kind, record.id, err);
                report.failed += 1;
            }
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// What the scan did with one listed record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanAction {
    /// Content matches the last sync; nothing to do.
    Skipped,
    /// A write job was enqueued.
    Queued,
    /// A bilateral edit was detected and resolved per policy.
    Conflict,
}

/// Classifies one listed record and feeds the queue accordingly.
fn process_record(
    ctx: &SyncContext,
    direction: SyncDirection,
    kind: EntityKind,
    record: &SourceRecord,
) -> SyncResult<ScanAction> {
    let entity = EntityRef::new(kind, direction.source(), record.id.clone());
    let payload = ctx.mapper.map(kind, direction, &record.fields)?;
    let hash = ContentHash::of(&payload);
    let observed = ObservedChange::new(entity.clone(), hash, record.modified_at);

    let verdict = ctx.cache.detect_change(&observed)?;
    if matches!(verdict, ChangeVerdict::Unchanged) {
        return Ok(ScanAction::Skipped);
    }
    let state = ctx
        .cache
        .get(&entity)?
        .ok_or_else(|| SyncError::State(format!("no sync record for {entity}")))?;

    if let ChangeVerdict::Conflicting {
        counterpart_modified_at,
    } = verdict
    {
        ctx.cache.flag_conflict(kind, &state.canonical_key)?;
        let winner = ctx
            .config
            .conflict_policy
            .resolve(record.modified_at, counterpart_modified_at);
        warn!(
            "bilateral edit on {} resolved by {}: {:?} wins",
            entity, ctx.config.conflict_policy, winner
        );
        if winner == ConflictWinner::Target {
            return Ok(ScanAction::Conflict);
        }
        // Our side wins; any queued write from the other side is stale.
        if let Some(counterpart_id) = state.external_ids.get(direction.target()) {
            let counterpart = EntityRef::new(kind, direction.target(), counterpart_id.clone());
            if ctx.queue.cancel_pending(&counterpart, direction.opposite())? {
                debug!("cancelled the opposing pending write for {}", counterpart);
            }
        }
        enqueue_change(ctx, direction, &state, entity, payload, hash, record)?;
        return Ok(ScanAction::Conflict);
    }

    enqueue_change(ctx, direction, &state, entity, payload, hash, record)?;
    Ok(ScanAction::Queued)
}

fn enqueue_change(
    ctx: &SyncContext,
    direction: SyncDirection,
    state: &SyncRecord,
    entity: EntityRef,
    payload: Value,
    hash: ContentHash,
    record: &SourceRecord,
) -> SyncResult<()> {
    let seed = NewJob {
        kind: state.kind,
        direction,
        entity_ref: entity,
        canonical_key: state.canonical_key,
        payload,
        source_hash: hash,
        source_modified_at: record.modified_at,
        max_attempts: ctx.config.direction(direction).max_attempts,
    };
    ctx.queue.enqueue(seed)?;
    Ok(())
}

/// Pulls and applies jobs until the scans are done and the queue is drained.
///
/// Exiting requires an empty pull that started after the scan-done flag was
/// observed, so a job enqueued just before the flag flips is never stranded.
fn apply_loop(ctx: &SyncContext, totals: &CycleTotals, scan_done: &AtomicBool) -> SyncResult<()> {
    let batch = ctx.config.apply_batch();
    let mut draining = false;
    loop {
        let jobs = ctx.queue.dequeue_batch(batch)?;
        if jobs.is_empty() {
            if draining {
                return Ok(());
            }
            if scan_done.load(Ordering::Acquire) {
                draining = true;
            } else {
                thread::sleep(IDLE_POLL);
            }
            continue;
        }
        for job in jobs {
            apply_job(ctx, totals, &job)?;
        }
    }
}

/// Applies one delivered job and settles it with the queue.
///
/// Write failures are nacked and counted; only queue and cache failures
/// propagate and take the worker down.
fn apply_job(ctx: &SyncContext, totals: &CycleTotals, job: &SyncJob) -> SyncResult<()> {
    match write_target(ctx, job) {
        Ok(applied) => finish_job(ctx, totals, job, applied),
        Err(err) if err.is_infrastructure() => Err(err),
        Err(err) => {
            debug!(
                "apply of {} {} failed on attempt {}: {}",
                job.direction, job.entity_ref, job.attempt, err
            );
            totals.add_failed(job.direction, job.kind);
            ctx.queue.nack(job.id, &err)?;
            Ok(())
        }
    }
}

/// How the payload landed on the target.
enum Applied {
    Created(String),
    Updated,
}

/// Writes the job's payload to the target system.
///
/// The create-or-update decision reads the cache at apply time rather than
/// trusting anything captured at scan time, so a redelivered job whose first
/// attempt already created the target record turns into an update.
fn write_target(ctx: &SyncContext, job: &SyncJob) -> SyncResult<Applied> {
    let target = job.direction.target();
    let client = ctx.clients.get(target);
    let state = ctx
        .cache
        .get_by_key(job.kind, &job.canonical_key)?
        .ok_or_else(|| SyncError::State(format!("no sync record for job {}", job.id)))?;
    match state.external_ids.get(target) {
        Some(id) => {
            client.update(job.kind, id, &job.payload)?;
            Ok(Applied::Updated)
        }
        None => {
            let id = client.create(job.kind, &job.payload)?;
            debug!("created {} {} as {}", target, job.kind, id);
            Ok(Applied::Created(id))
        }
    }
}

/// Records a successful write: link on create, mark the cache synced, count
/// it, and only then ack so an interrupted worker redelivers instead of
/// losing the job.
fn finish_job(
    ctx: &SyncContext,
    totals: &CycleTotals,
    job: &SyncJob,
    applied: Applied,
) -> SyncResult<()> {
    let target = job.direction.target();
    if let Applied::Created(id) = &applied {
        let linked = ctx
            .cache
            .link_counterpart(job.kind, &job.canonical_key, target, id)?;
        if !linked {
            warn!(
                "{} is already linked to a different {} id; keeping the existing link",
                job.entity_ref, target
            );
        }
    }
    let expected = ctx
        .mapper
        .expected_target_hash(job.kind, job.direction, &job.payload);
    ctx.cache.mark_synced(
        job.kind,
        &job.canonical_key,
        job.direction,
        job.source_hash,
        expected,
        Utc::now(),
    )?;
    match applied {
        Applied::Created(_) => totals.add_created(job.direction, job.kind),
        Applied::Updated => totals.add_updated(job.direction, job.kind),
    }
    ctx.queue.ack(job.id, job.payload_rev)?;
    Ok(())
}
