//! Cycle scheduling and engine lifecycle.
//!
//! The orchestrator owns the per-direction watermarks and the schedule, and
//! runs cycles on the caller's thread. A scheduled timer and on-demand
//! triggers funnel into the same single-cycle gate: at most one cycle runs
//! at a time, a timer firing during a cycle is skipped, and a trigger that
//! arrives too soon is recorded and folded into the next cycle.

use crate::cache::{ChangeCache, MemoryChangeCache};
use crate::client::SystemClient;
use crate::config::{EngineConfig, SyncMode};
use crate::error::{SyncError, SyncResult};
use crate::mapper::FieldMapper;
use crate::queue::{MemorySyncQueue, SyncQueue};
use crate::retry::RetryPolicy;
use crate::worker::{run_cycle, CycleOutcome, SyncContext};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tandem_model::{BySystem, CycleReport, JobId, SyncDirection, SyncJob};
use tracing::{debug, info, warn};

/// How often `shutdown` re-checks the in-flight cycle.
const SHUTDOWN_POLL: Duration = Duration::from_millis(10);

/// Outcome of an on-demand trigger.
#[derive(Debug)]
pub enum TriggerOutcome {
    /// A cycle ran; these are its reports.
    Ran(Vec<CycleReport>),
    /// Too soon after the last cycle start, or a cycle is already running.
    /// The request is recorded and folded into the next cycle.
    Deferred,
}

/// Point-in-time view of the engine, shaped for a status surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    /// Configured sync mode.
    pub mode: SyncMode,
    /// Start time of the most recent cycle.
    pub last_cycle_at: Option<DateTime<Utc>>,
    /// Reports from the most recent cycle.
    pub last_results: Vec<CycleReport>,
    /// Open jobs in the queue.
    pub queue_depth: usize,
    /// Jobs parked in the dead-letter list.
    pub dead_letter_count: usize,
    /// Cycles run since the engine started.
    pub cycles_completed: u64,
    /// Whether a cycle is running right now.
    pub cycle_running: bool,
    /// The error that aborted the most recent cycle, if it aborted.
    pub last_error: Option<String>,
}

/// An on-demand trigger that arrived while a cycle could not start.
#[derive(Debug, Clone, Copy)]
struct DeferredTrigger {
    mode_override: Option<SyncMode>,
}

#[derive(Debug, Default)]
struct Schedule {
    last_cycle_started_at: Option<DateTime<Utc>>,
    deferred: Option<DeferredTrigger>,
}

/// Runs sync cycles against two systems and owns all engine state.
///
/// All methods take `&self`; wrap the orchestrator in an [`Arc`] to share it
/// between a scheduler thread and a trigger surface.
pub struct SyncOrchestrator {
    ctx: SyncContext,
    watermarks: Mutex<HashMap<SyncDirection, DateTime<Utc>>>,
    schedule: Mutex<Schedule>,
    last_results: Mutex<Vec<CycleReport>>,
    last_error: Mutex<Option<String>>,
    subscribers: Mutex<Vec<Sender<Vec<CycleReport>>>>,
    cycles_completed: AtomicU64,
    cycle_running: AtomicBool,
    shutting_down: AtomicBool,
}

impl SyncOrchestrator {
    /// Builds an orchestrator over explicit backends.
    pub fn new(
        config: EngineConfig,
        clients: BySystem<Arc<dyn SystemClient>>,
        cache: Arc<dyn ChangeCache>,
        queue: Arc<dyn SyncQueue>,
        mapper: FieldMapper,
    ) -> SyncOrchestrator {
        let mut watermarks = HashMap::new();
        for direction in SyncDirection::BOTH {
            watermarks.insert(direction, config.initial_watermark);
        }
        SyncOrchestrator {
            ctx: SyncContext {
                clients,
                cache,
                queue,
                mapper,
                config,
            },
            watermarks: Mutex::new(watermarks),
            schedule: Mutex::new(Schedule::default()),
            last_results: Mutex::new(Vec::new()),
            last_error: Mutex::new(None),
            subscribers: Mutex::new(Vec::new()),
            cycles_completed: AtomicU64::new(0),
            cycle_running: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Orchestrator on in-memory backends with the stock mapping tables.
    pub fn in_memory(
        config: EngineConfig,
        clients: BySystem<Arc<dyn SystemClient>>,
    ) -> SyncOrchestrator {
        let queue = MemorySyncQueue::new(config.queue.clone(), RetryPolicy::new(config.retry.clone()));
        SyncOrchestrator::new(
            config,
            clients,
            Arc::new(MemoryChangeCache::new()),
            Arc::new(queue),
            FieldMapper::with_defaults(),
        )
    }

    /// The engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    /// Requests an immediate cycle, optionally narrowed to one mode.
    ///
    /// Runs on the calling thread when the minimum gap since the last cycle
    /// start has elapsed and no cycle is in flight; otherwise the request is
    /// recorded and the next cycle serves it.
    pub fn trigger_cycle(&self, mode_override: Option<SyncMode>) -> SyncResult<TriggerOutcome> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        let now = Utc::now();
        {
            let mut schedule = self.schedule.lock();
            let gap_ok = match schedule.last_cycle_started_at {
                None => true,
                Some(start) => elapsed_at_least(now, start, self.ctx.config.trigger_gap()),
            };
            if !gap_ok || !self.claim_cycle() {
                schedule.deferred = Some(DeferredTrigger { mode_override });
                debug!("on-demand trigger deferred until the next cycle");
                return Ok(TriggerOutcome::Deferred);
            }
            schedule.last_cycle_started_at = Some(now);
            schedule.deferred = None;
        }
        let mode = mode_override.unwrap_or(self.ctx.config.mode);
        self.run_claimed_cycle(mode, now).map(TriggerOutcome::Ran)
    }

    /// Scheduled-path entry: runs a cycle when one is due.
    ///
    /// Due means the cycle interval has elapsed, or a deferred trigger is
    /// pending and the trigger gap has elapsed. Returns `Ok(None)` when
    /// nothing is due or a cycle is already running.
    pub fn tick(&self) -> SyncResult<Option<Vec<CycleReport>>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(SyncError::ShuttingDown);
        }
        let now = Utc::now();
        let mode;
        {
            let mut schedule = self.schedule.lock();
            let interval_due = match schedule.last_cycle_started_at {
                None => true,
                Some(start) => elapsed_at_least(now, start, self.ctx.config.cycle_interval()),
            };
            let deferred_due = schedule.deferred.is_some()
                && schedule.last_cycle_started_at.map_or(true, |start| {
                    elapsed_at_least(now, start, self.ctx.config.trigger_gap())
                });
            if !interval_due && !deferred_due {
                return Ok(None);
            }
            if !self.claim_cycle() {
                // Still running; this firing coalesces away. A pending
                // deferral stays recorded for the next tick.
                return Ok(None);
            }
            let deferred = schedule.deferred.take();
            mode = if interval_due {
                self.ctx.config.mode
            } else {
                deferred
                    .and_then(|t| t.mode_override)
                    .unwrap_or(self.ctx.config.mode)
            };
            schedule.last_cycle_started_at = Some(now);
        }
        self.run_claimed_cycle(mode, now).map(Some)
    }

    /// Blocking scheduler loop over [`tick`](Self::tick).
    ///
    /// Checks for due work every `poll` and returns once `shutdown` is
    /// called. Cycle failures are logged and the loop keeps going.
    pub fn run_until_shutdown(&self, poll: Duration) {
        info!(
            "scheduler running: cycle interval {:?}, poll {:?}",
            self.ctx.config.cycle_interval(),
            poll
        );
        loop {
            match self.tick() {
                Ok(_) => {}
                Err(SyncError::ShuttingDown) => break,
                Err(err) => warn!("cycle failed: {}", err),
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(poll);
        }
        debug!("scheduler stopped");
    }

    /// Current engine state.
    pub fn status(&self) -> SyncResult<EngineStatus> {
        Ok(EngineStatus {
            mode: self.ctx.config.mode,
            last_cycle_at: self.schedule.lock().last_cycle_started_at,
            last_results: self.last_results.lock().clone(),
            queue_depth: self.ctx.queue.depth()?,
            dead_letter_count: self.ctx.queue.dead_letter_count()?,
            cycles_completed: self.cycles_completed.load(Ordering::SeqCst),
            cycle_running: self.cycle_running.load(Ordering::SeqCst),
            last_error: self.last_error.lock().clone(),
        })
    }

    /// Jobs parked after permanent failures or exhausted retries.
    pub fn list_dead_letters(&self) -> SyncResult<Vec<SyncJob>> {
        self.ctx.queue.list_dead_letters()
    }

    /// Requeues a dead-lettered job with a fresh attempt budget.
    pub fn retry_dead_letter(&self, id: JobId) -> SyncResult<bool> {
        self.ctx.queue.retry_dead_letter(id)
    }

    /// Subscribes to cycle reports; each completed cycle sends one batch.
    ///
    /// Disconnected receivers are dropped at the next publish.
    pub fn subscribe(&self) -> Receiver<Vec<CycleReport>> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Stops accepting new cycles and waits up to `grace` for the in-flight
    /// one to finish.
    pub fn shutdown(&self, grace: Duration) {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + grace;
        while self.cycle_running.load(Ordering::SeqCst) {
            if Instant::now() >= deadline {
                warn!("shutdown grace of {:?} expired with a cycle still running", grace);
                return;
            }
            thread::sleep(SHUTDOWN_POLL);
        }
        info!("engine shut down cleanly");
    }

    fn claim_cycle(&self) -> bool {
        self.cycle_running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn directions_for(&self, mode: SyncMode) -> Vec<SyncDirection> {
        mode.directions()
            .iter()
            .copied()
            .filter(|d| self.ctx.config.direction(*d).enabled)
            .collect()
    }

    /// Runs a cycle the caller has already claimed, then releases the claim.
    ///
    /// State is recorded and reports are published even when the cycle
    /// aborted; the abort error is returned after that.
    fn run_claimed_cycle(
        &self,
        mode: SyncMode,
        started_at: DateTime<Utc>,
    ) -> SyncResult<Vec<CycleReport>> {
        let outcome = self.execute_cycle(mode, started_at);
        self.cycle_running.store(false, Ordering::SeqCst);
        match outcome.error {
            None => Ok(outcome.reports),
            Some(err) => Err(err),
        }
    }

    fn execute_cycle(&self, mode: SyncMode, started_at: DateTime<Utc>) -> CycleOutcome {
        let scans: Vec<(SyncDirection, DateTime<Utc>)> = {
            let watermarks = self.watermarks.lock();
            self.directions_for(mode)
                .into_iter()
                .map(|d| {
                    let since = watermarks
                        .get(&d)
                        .copied()
                        .unwrap_or(self.ctx.config.initial_watermark);
                    (d, since)
                })
                .collect()
        };
        info!("cycle starting: mode {}, {} scan(s)", mode, scans.len());

        let outcome = run_cycle(&self.ctx, &scans);

        // Clean scans advance to this cycle's start; aborted ones rescan
        // from the old watermark next time.
        {
            let mut watermarks = self.watermarks.lock();
            for direction in &outcome.clean_scans {
                watermarks.insert(*direction, started_at);
            }
        }
        *self.last_results.lock() = outcome.reports.clone();
        *self.last_error.lock() = outcome.error.as_ref().map(|e| e.to_string());
        self.cycles_completed.fetch_add(1, Ordering::SeqCst);
        self.publish(&outcome.reports);

        let written: u64 = outcome.reports.iter().map(|r| r.written()).sum();
        let failed: u64 = outcome.reports.iter().map(|r| r.failed).sum();
        info!("cycle finished: {} written, {} failed", written, failed);
        outcome
    }

    fn publish(&self, reports: &[CycleReport]) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(reports.to_vec()).is_ok());
    }
}

fn elapsed_at_least(now: DateTime<Utc>, since: DateTime<Utc>, at_least: Duration) -> bool {
    (now - since).to_std().map_or(false, |elapsed| elapsed >= at_least)
}
