//! Engine configuration.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tandem_model::{ConflictPolicy, EntityKind, SyncDirection};

/// Sync mode: which directions run each cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// Only field-service → CRM runs; the CRM is read-only for sync purposes.
    FieldLed,
    /// Only CRM → field-service runs.
    CrmLed,
    /// Both directions run, field side scanned first for deterministic
    /// conflict detection.
    Hybrid,
}

impl SyncMode {
    /// Directions active under this mode, in execution order.
    pub fn directions(&self) -> &'static [SyncDirection] {
        match self {
            SyncMode::FieldLed => &[SyncDirection::FieldToCrm],
            SyncMode::CrmLed => &[SyncDirection::CrmToField],
            SyncMode::Hybrid => &SyncDirection::BOTH,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncMode::FieldLed => "field_led",
            SyncMode::CrmLed => "crm_led",
            SyncMode::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SyncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-direction tuning.
#[derive(Debug, Clone)]
pub struct DirectionConfig {
    /// Whether this direction ever scans.
    pub enabled: bool,
    /// Scheduled cycle interval when this direction drives the cadence.
    pub interval: Duration,
    /// Queue jobs the apply pool takes per pull for this direction's load.
    pub batch_size: usize,
    /// Delivery attempts before a job dead-letters.
    pub max_attempts: u32,
}

impl Default for DirectionConfig {
    fn default() -> Self {
        DirectionConfig {
            enabled: true,
            interval: Duration::from_secs(300),
            batch_size: 50,
            max_attempts: 3,
        }
    }
}

impl DirectionConfig {
    /// Disabled direction.
    pub fn disabled() -> Self {
        DirectionConfig {
            enabled: false,
            ..Default::default()
        }
    }

    /// Sets the scheduled interval.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Sets the per-job attempt limit.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }
}

/// Backoff tuning for transient failures.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Ceiling for any single delay.
    pub max_delay: Duration,
    /// Whether to add ±25% jitter to each delay.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        RetryConfig {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Sets the base delay.
    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    /// Sets the delay ceiling.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Disables jitter (deterministic delays, mostly for tests).
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

/// Queue behavior.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Lease duration for in-flight jobs; an unacked job becomes deliverable
    /// again after this long.
    pub visibility_timeout: Duration,
    /// Completed jobs kept for inspection, newest first.
    pub done_archive: usize,
    /// Dead letters kept, newest first.
    pub dead_letter_archive: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig {
            visibility_timeout: Duration::from_secs(30),
            done_archive: 100,
            dead_letter_archive: 1000,
        }
    }
}

impl QueueConfig {
    /// Sets the visibility timeout.
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Which directions run.
    pub mode: SyncMode,
    /// Field-service → CRM tuning.
    pub field_to_crm: DirectionConfig,
    /// CRM → field-service tuning.
    pub crm_to_field: DirectionConfig,
    /// Backoff behavior for transient failures.
    pub retry: RetryConfig,
    /// Queue behavior.
    pub queue: QueueConfig,
    /// Resolution policy for bilateral edits.
    pub conflict_policy: ConflictPolicy,
    /// Apply-pool size.
    pub apply_workers: usize,
    /// Minimum gap between an on-demand trigger and the previous cycle start;
    /// `None` derives one fifth of the cycle interval.
    pub min_trigger_gap: Option<Duration>,
    /// Watermark used before a direction's first successful scan. The epoch
    /// default makes the first cycle a full sync.
    pub initial_watermark: DateTime<Utc>,
    /// Entity kinds scanned each cycle.
    pub kinds: Vec<EntityKind>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            mode: SyncMode::Hybrid,
            field_to_crm: DirectionConfig::default(),
            crm_to_field: DirectionConfig::default(),
            retry: RetryConfig::default(),
            queue: QueueConfig::default(),
            conflict_policy: ConflictPolicy::default(),
            apply_workers: 4,
            min_trigger_gap: None,
            initial_watermark: DateTime::UNIX_EPOCH,
            kinds: EntityKind::ALL.to_vec(),
        }
    }
}

impl EngineConfig {
    /// Configuration for `mode` with defaults everywhere else.
    pub fn new(mode: SyncMode) -> Self {
        EngineConfig {
            mode,
            ..Default::default()
        }
    }

    /// Sets the conflict policy.
    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.conflict_policy = policy;
        self
    }

    /// Sets retry behavior.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets queue behavior.
    pub fn with_queue(mut self, queue: QueueConfig) -> Self {
        self.queue = queue;
        self
    }

    /// Replaces one direction's tuning.
    pub fn with_direction(mut self, direction: SyncDirection, config: DirectionConfig) -> Self {
        match direction {
            SyncDirection::FieldToCrm => self.field_to_crm = config,
            SyncDirection::CrmToField => self.crm_to_field = config,
        }
        self
    }

    /// Sets the apply-pool size.
    pub fn with_apply_workers(mut self, workers: usize) -> Self {
        self.apply_workers = workers.max(1);
        self
    }

    /// Sets an explicit on-demand trigger gap.
    pub fn with_min_trigger_gap(mut self, gap: Duration) -> Self {
        self.min_trigger_gap = Some(gap);
        self
    }

    /// Sets the pre-first-scan watermark.
    pub fn with_initial_watermark(mut self, watermark: DateTime<Utc>) -> Self {
        self.initial_watermark = watermark;
        self
    }

    /// Restricts the scanned entity kinds.
    pub fn with_kinds(mut self, kinds: Vec<EntityKind>) -> Self {
        self.kinds = kinds;
        self
    }

    /// Tuning for `direction`.
    pub fn direction(&self, direction: SyncDirection) -> &DirectionConfig {
        match direction {
            SyncDirection::FieldToCrm => &self.field_to_crm,
            SyncDirection::CrmToField => &self.crm_to_field,
        }
    }

    /// Directions that actually run: the mode's directions minus disabled ones.
    pub fn active_directions(&self) -> Vec<SyncDirection> {
        self.mode
            .directions()
            .iter()
            .copied()
            .filter(|d| self.direction(*d).enabled)
            .collect()
    }

    /// The scheduled cycle cadence.
    ///
    /// Single-direction modes use that direction's interval; Hybrid uses the
    /// shorter of the two so neither side goes staler than configured.
    pub fn cycle_interval(&self) -> Duration {
        match self.mode {
            SyncMode::FieldLed => self.field_to_crm.interval,
            SyncMode::CrmLed => self.crm_to_field.interval,
            SyncMode::Hybrid => self.field_to_crm.interval.min(self.crm_to_field.interval),
        }
    }

    /// Effective minimum gap for on-demand triggers.
    pub fn trigger_gap(&self) -> Duration {
        self.min_trigger_gap.unwrap_or(self.cycle_interval() / 5)
    }

    /// Jobs the apply pool takes per queue pull.
    pub fn apply_batch(&self) -> usize {
        let batch = self
            .active_directions()
            .iter()
            .map(|d| self.direction(*d).batch_size)
            .max()
            .unwrap_or(1);
        batch.max(1)
    }
}
