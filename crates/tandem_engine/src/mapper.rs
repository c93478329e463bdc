//! Mapping-table registry.
//!
//! Holds one [`MappingTable`] per `(kind, direction)` and answers the two
//! questions the rest of the engine asks: "what does this record look like on
//! the other side" and "what digest will the other side show once this payload
//! lands". Ships default tables for both entity kinds; deployments replace
//! them per table.

use serde_json::Value;
use std::collections::HashMap;
use tandem_model::{
    ContentHash, EntityKind, FieldRule, FieldTransform, MapError, MappingTable, SyncDirection,
};

/// Timestamp layout used by the field-service platform.
pub const FIELD_DATE_FORMAT: &str = "%m/%d/%Y %H:%M";

/// CRM timestamps are RFC 3339.
pub const CRM_DATE_FORMAT: &str = "%+";

/// Registry of mapping tables, one per `(kind, direction)`.
#[derive(Debug, Clone)]
pub struct FieldMapper {
    tables: HashMap<(EntityKind, SyncDirection), MappingTable>,
}

impl Default for FieldMapper {
    fn default() -> Self {
        FieldMapper::new()
    }
}

impl FieldMapper {
    /// Empty registry; every `map` call fails until tables are set.
    pub fn new() -> FieldMapper {
        FieldMapper {
            tables: HashMap::new(),
        }
    }

    /// Registry preloaded with the stock Customer and Appointment tables.
    pub fn with_defaults() -> FieldMapper {
        let mut mapper = FieldMapper::new();
        mapper.set_table(
            EntityKind::Customer,
            SyncDirection::FieldToCrm,
            customer_to_crm(),
        );
        mapper.set_table(
            EntityKind::Customer,
            SyncDirection::CrmToField,
            customer_to_field(),
        );
        mapper.set_table(
            EntityKind::Appointment,
            SyncDirection::FieldToCrm,
            appointment_to_crm(),
        );
        mapper.set_table(
            EntityKind::Appointment,
            SyncDirection::CrmToField,
            appointment_to_field(),
        );
        mapper
    }

    /// Installs or replaces the table for `(kind, direction)`.
    pub fn set_table(&mut self, kind: EntityKind, direction: SyncDirection, table: MappingTable) {
        self.tables.insert((kind, direction), table);
    }

    /// The table for `(kind, direction)`, if configured.
    pub fn table(&self, kind: EntityKind, direction: SyncDirection) -> Option<&MappingTable> {
        self.tables.get(&(kind, direction))
    }

    /// Maps a source-shape record into the target side's shape.
    pub fn map(
        &self,
        kind: EntityKind,
        direction: SyncDirection,
        source: &Value,
    ) -> Result<Value, MapError> {
        let table = self
            .tables
            .get(&(kind, direction))
            .ok_or(MapError::NoTable { kind, direction })?;
        table.apply(source)
    }

    /// Digest the target side will show for `payload` once it is applied.
    ///
    /// Reverse-maps the payload through the opposite direction's table and
    /// hashes the result. `None` when the payload does not reverse-map; the
    /// engine's own write will then read as a fresh change on the next scan
    /// of the target, which costs one redundant cycle but loses nothing.
    pub fn expected_target_hash(
        &self,
        kind: EntityKind,
        direction: SyncDirection,
        payload: &Value,
    ) -> Option<ContentHash> {
        self.map(kind, direction.opposite(), payload)
            .ok()
            .map(|shaped| ContentHash::of(&shaped))
    }
}

fn renamed(source: &str) -> FieldTransform {
    FieldTransform::Rename {
        source: source.to_string(),
    }
}

fn reformatted(source: &str, from: &str, to: &str) -> FieldTransform {
    FieldTransform::DateReformat {
        source: source.to_string(),
        from: from.to_string(),
        to: to.to_string(),
    }
}

fn customer_to_crm() -> MappingTable {
    MappingTable::new(vec![
        FieldRule::required("firstName", renamed("first_name")),
        FieldRule::optional("lastName", renamed("last_name")),
        FieldRule::optional(
            "name",
            FieldTransform::Concatenate {
                sources: vec!["first_name".to_string(), "last_name".to_string()],
                separator: " ".to_string(),
            },
        ),
        FieldRule::optional("email", FieldTransform::Identity),
        FieldRule::optional("phone", FieldTransform::Identity),
        FieldRule::optional("address1", renamed("street")),
        FieldRule::optional("city", FieldTransform::Identity),
        FieldRule::optional("state", FieldTransform::Identity),
        FieldRule::optional("postalCode", renamed("postal_code")),
        FieldRule::optional(
            "leadSource",
            FieldTransform::Constant {
                value: Value::String("field-service".to_string()),
            },
        ),
    ])
}

// Explicit reverse: the concatenated display name and the lead-source tag
// stay on the CRM side.
fn customer_to_field() -> MappingTable {
    MappingTable::new(vec![
        FieldRule::required("first_name", renamed("firstName")),
        FieldRule::optional("last_name", renamed("lastName")),
        FieldRule::optional("email", FieldTransform::Identity),
        FieldRule::optional("phone", FieldTransform::Identity),
        FieldRule::optional("street", renamed("address1")),
        FieldRule::optional("city", FieldTransform::Identity),
        FieldRule::optional("state", FieldTransform::Identity),
        FieldRule::optional("postal_code", renamed("postalCode")),
    ])
}

fn appointment_to_crm() -> MappingTable {
    MappingTable::new(vec![
        FieldRule::required(
            "startTime",
            reformatted("scheduled_at", FIELD_DATE_FORMAT, CRM_DATE_FORMAT),
        ),
        FieldRule::optional("serviceType", renamed("service_code")),
        FieldRule::optional("notes", FieldTransform::Identity),
        FieldRule::optional("status", FieldTransform::Identity),
    ])
}

fn appointment_to_field() -> MappingTable {
    MappingTable::new(vec![
        FieldRule::required(
            "scheduled_at",
            reformatted("startTime", CRM_DATE_FORMAT, FIELD_DATE_FORMAT),
        ),
        FieldRule::optional("service_code", renamed("serviceType")),
        FieldRule::optional("notes", FieldTransform::Identity),
        FieldRule::optional("status", FieldTransform::Identity),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn default_customer_table_shapes_crm_contact() {
        let mapper = FieldMapper::with_defaults();
        let source = json!({
            "first_name": "Ada",
            "last_name": "Lovelace",
            "email": "ada@example.com",
            "street": "12 Analytical Way",
            "postal_code": "12345",
        });
        let mapped = mapper
            .map(EntityKind::Customer, SyncDirection::FieldToCrm, &source)
            .unwrap();
        assert_eq!(mapped.get("firstName"), Some(&json!("Ada")));
        assert_eq!(mapped.get("name"), Some(&json!("Ada Lovelace")));
        assert_eq!(mapped.get("address1"), Some(&json!("12 Analytical Way")));
        assert_eq!(mapped.get("postalCode"), Some(&json!("12345")));
        assert_eq!(mapped.get("leadSource"), Some(&json!("field-service")));
    }

    #[test]
    fn appointment_dates_reformat_both_ways() {
        let mapper = FieldMapper::with_defaults();
        let field_side = json!({"scheduled_at": "03/15/2024 14:30", "service_code": "LAWN"});
        let crm_side = mapper
            .map(EntityKind::Appointment, SyncDirection::FieldToCrm, &field_side)
            .unwrap();
        assert_eq!(crm_side.get("startTime"), Some(&json!("2024-03-15T14:30:00+00:00")));
        assert_eq!(crm_side.get("serviceType"), Some(&json!("LAWN")));

        let back = mapper
            .map(EntityKind::Appointment, SyncDirection::CrmToField, &crm_side)
            .unwrap();
        assert_eq!(back, field_side);
    }

    #[test]
    fn missing_table_is_reported() {
        let mapper = FieldMapper::new();
        let err = mapper
            .map(EntityKind::Customer, SyncDirection::FieldToCrm, &json!({}))
            .unwrap_err();
        assert_eq!(
            err,
            MapError::NoTable {
                kind: EntityKind::Customer,
                direction: SyncDirection::FieldToCrm,
            }
        );
    }

    #[test]
    fn expected_hash_matches_reverse_mapped_payload() {
        let mapper = FieldMapper::with_defaults();
        let payload = json!({"firstName": "Ada", "lastName": "Lovelace", "email": "ada@example.com"});
        let expected = mapper
            .expected_target_hash(EntityKind::Customer, SyncDirection::FieldToCrm, &payload)
            .unwrap();
        let reverse_shaped = mapper
            .map(EntityKind::Customer, SyncDirection::CrmToField, &payload)
            .unwrap();
        assert_eq!(expected, ContentHash::of(&reverse_shaped));
    }

    #[test]
    fn expected_hash_is_none_without_reverse_table() {
        let mut mapper = FieldMapper::new();
        mapper.set_table(
            EntityKind::Customer,
            SyncDirection::FieldToCrm,
            MappingTable::new(vec![FieldRule::required("firstName", renamed("first_name"))]),
        );
        let payload = json!({"firstName": "Ada"});
        assert_eq!(
            mapper.expected_target_hash(EntityKind::Customer, SyncDirection::FieldToCrm, &payload),
            None
        );
    }

    proptest! {
        #[test]
        fn default_customer_mapping_is_deterministic(
            first in "[A-Za-z]{1,12}",
            last in proptest::option::of("[A-Za-z]{1,12}"),
            email in proptest::option::of("[a-z]{1,8}@[a-z]{1,8}\\.com"),
        ) {
            let mapper = FieldMapper::with_defaults();
            let mut source = serde_json::Map::new();
            source.insert("first_name".to_string(), json!(first));
            if let Some(last) = &last {
                source.insert("last_name".to_string(), json!(last));
            }
            if let Some(email) = &email {
                source.insert("email".to_string(), json!(email));
            }
            let source = Value::Object(source);
            let once = mapper
                .map(EntityKind::Customer, SyncDirection::FieldToCrm, &source)
                .unwrap();
            let twice = mapper
                .map(EntityKind::Customer, SyncDirection::FieldToCrm, &source)
                .unwrap();
            prop_assert_eq!(&once, &twice);
            prop_assert_eq!(ContentHash::of(&once), ContentHash::of(&twice));
        }
    }
}
