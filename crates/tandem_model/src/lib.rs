//! # Tandem Model
//!
//! Data model for the tandem sync engine.
//!
//! This crate provides:
//! - Entity identity (`EntityKind`, `SystemKind`, `SyncDirection`, `EntityRef`)
//! - Raw source records and canonical content digests
//! - Per-entity sync state (`SyncRecord`, `CanonicalKey`)
//! - Declarative field-mapping tables with a closed transform set
//! - Sync jobs with an explicit lifecycle state machine
//! - Conflict policies and per-cycle reports
//!
//! Pure types and side-effect-free logic only; no I/O.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod conflict;
mod entity;
mod job;
mod mapping;
mod record;
mod report;

pub use conflict::{ConflictPolicy, ConflictWinner};
pub use entity::{BySystem, EntityKind, EntityRef, SyncDirection, SystemKind};
pub use job::{JobId, JobStatus, NewJob, SyncJob};
pub use mapping::{FieldRule, FieldTransform, MapError, MappingTable};
pub use record::{CanonicalKey, ContentHash, SourceRecord, SyncRecord};
pub use report::CycleReport;
