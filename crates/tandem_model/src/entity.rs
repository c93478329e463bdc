//! Entity identity: kinds, systems, directions, and references.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of records the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    /// A customer / contact record.
    Customer,
    /// A scheduled service appointment.
    Appointment,
}

impl EntityKind {
    /// All known kinds, in scan order.
    pub const ALL: [EntityKind; 2] = [EntityKind::Customer, EntityKind::Appointment];

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Customer => "customer",
            EntityKind::Appointment => "appointment",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two systems of record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemKind {
    /// The field-service management platform.
    FieldService,
    /// The CRM / marketing platform.
    Crm,
}

impl SystemKind {
    /// The counterpart system.
    pub fn other(&self) -> SystemKind {
        match self {
            SystemKind::FieldService => SystemKind::Crm,
            SystemKind::Crm => SystemKind::FieldService,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SystemKind::FieldService => "field_service",
            SystemKind::Crm => "crm",
        }
    }
}

impl fmt::Display for SystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A sync direction: which system is read and which is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    /// Field-service platform is the source, CRM the target.
    FieldToCrm,
    /// CRM is the source, field-service platform the target.
    CrmToField,
}

impl SyncDirection {
    /// Both directions in the fixed scan order (field side first).
    pub const BOTH: [SyncDirection; 2] = [SyncDirection::FieldToCrm, SyncDirection::CrmToField];

    /// The system records are read from.
    pub fn source(&self) -> SystemKind {
        match self {
            SyncDirection::FieldToCrm => SystemKind::FieldService,
            SyncDirection::CrmToField => SystemKind::Crm,
        }
    }

    /// The system records are written to.
    pub fn target(&self) -> SystemKind {
        self.source().other()
    }

    /// The reverse direction.
    pub fn opposite(&self) -> SyncDirection {
        match self {
            SyncDirection::FieldToCrm => SyncDirection::CrmToField,
            SyncDirection::CrmToField => SyncDirection::FieldToCrm,
        }
    }

    /// The direction whose source is `system`.
    pub fn from_source(system: SystemKind) -> SyncDirection {
        match system {
            SystemKind::FieldService => SyncDirection::FieldToCrm,
            SystemKind::Crm => SyncDirection::CrmToField,
        }
    }

    /// Stable lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::FieldToCrm => "field_to_crm",
            SyncDirection::CrmToField => "crm_to_field",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical record as known to one system. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity kind.
    pub kind: EntityKind,
    /// The system this reference belongs to.
    pub system: SystemKind,
    /// The record's id in that system.
    pub id: String,
}

impl EntityRef {
    /// Creates a reference.
    pub fn new(kind: EntityKind, system: SystemKind, id: impl Into<String>) -> EntityRef {
        EntityRef {
            kind,
            system,
            id: id.into(),
        }
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.system, self.id)
    }
}

/// A pair of per-system values, addressable by [`SystemKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BySystem<T> {
    /// Value for the field-service side.
    pub field_service: T,
    /// Value for the CRM side.
    pub crm: T,
}

impl<T> BySystem<T> {
    /// Builds a pair from both values.
    pub fn new(field_service: T, crm: T) -> BySystem<T> {
        BySystem { field_service, crm }
    }

    /// The value for `system`.
    pub fn get(&self, system: SystemKind) -> &T {
        match system {
            SystemKind::FieldService => &self.field_service,
            SystemKind::Crm => &self.crm,
        }
    }

    /// Mutable value for `system`.
    pub fn get_mut(&mut self, system: SystemKind) -> &mut T {
        match system {
            SystemKind::FieldService => &mut self.field_service,
            SystemKind::Crm => &mut self.crm,
        }
    }

    /// Replaces the value for `system`.
    pub fn set(&mut self, system: SystemKind, value: T) {
        *self.get_mut(system) = value;
    }
}
