//! # Tandem Engine
//!
//! Bidirectional synchronization engine between a field-service platform and
//! a CRM.
//!
//! This crate provides:
//! - Field mapping through declarative per-kind tables
//! - Hash-based change detection with echo suppression (`ChangeCache`)
//! - A coalescing sync queue with leases, retries, and a dead-letter list
//! - Scan/apply cycle workers over injected `SystemClient`s
//! - The orchestrator: modes, watermarks, scheduling, status, shutdown
//!
//! ## Architecture
//!
//! A cycle runs in two overlapping phases per direction:
//! 1. **Scan**: list records changed since the direction's watermark, map
//!    each into the target shape, and classify it against the change cache
//!    (unchanged, changed, or a bilateral conflict).
//! 2. **Apply**: a shared worker pool drains the queue, writes to the target
//!    system, links newly created counterparts, and marks the cache synced.
//!
//! In Hybrid mode both directions scan in a fixed order (field-service
//! first), so the second scan sees the cache as updated by the first and
//! conflict detection is deterministic.
//!
//! ## Key Invariants
//!
//! - The engine's own writes are recognized by digest on the next scan of
//!   the target and never echo back
//! - At most one open job per (entity, direction); newer changes coalesce
//! - A job is attempted at most `max_attempts` times, then dead-letters
//! - A direction's watermark only advances after a clean scan
//! - At most one cycle runs at a time; extra triggers coalesce or defer

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cache;
mod client;
mod config;
mod error;
mod mapper;
mod orchestrator;
mod queue;
mod retry;
mod worker;

pub use cache::{ChangeCache, ChangeVerdict, MemoryChangeCache, ObservedChange};
pub use client::{MockSystemClient, RecordStream, SystemClient};
pub use config::{DirectionConfig, EngineConfig, QueueConfig, RetryConfig, SyncMode};
pub use error::{SyncError, SyncResult};
pub use mapper::{FieldMapper, CRM_DATE_FORMAT, FIELD_DATE_FORMAT};
pub use orchestrator::{EngineStatus, SyncOrchestrator, TriggerOutcome};
pub use queue::{AckOutcome, MemorySyncQueue, NackOutcome, SyncQueue};
pub use retry::{RetryDecision, RetryPolicy};
