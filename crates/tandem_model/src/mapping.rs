//! Declarative field-mapping tables.
//!
//! A table describes how to build a target-shape record from a source-shape
//! record, one rule per target field. Transforms are a closed set dispatched
//! by tag; nothing here evaluates configured code.

use crate::entity::{EntityKind, SyncDirection};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use thiserror::Error;

/// Why a record could not be mapped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MapError {
    /// A required source field is absent or null.
    #[error("missing required field `{field}`")]
    MissingField {
        /// The source field that was required.
        field: String,
    },
    /// A date value did not parse or render under the configured patterns.
    #[error("bad date in `{field}`: {reason}")]
    BadDate {
        /// The source field holding the date.
        field: String,
        /// Parse or render failure detail.
        reason: String,
    },
    /// The source record body is not a JSON object.
    #[error("source record is not an object")]
    NotAnObject,
    /// No table is configured for the requested kind and direction.
    #[error("no mapping table for {kind} {direction}")]
    NoTable {
        /// Entity kind requested.
        kind: EntityKind,
        /// Direction requested.
        direction: SyncDirection,
    },
}

/// One field transform, dispatched by tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum FieldTransform {
    /// Copy the source field with the same name as the target.
    Identity,
    /// Copy from a differently named source field.
    Rename {
        /// Source field name.
        source: String,
    },
    /// Parse a date under `from` and render it under `to`.
    ///
    /// Patterns are chrono format strings; `%+` means RFC 3339. Values
    /// without an offset are interpreted as UTC.
    DateReformat {
        /// Source field name.
        source: String,
        /// Input pattern.
        from: String,
        /// Output pattern.
        to: String,
    },
    /// Emit a fixed value regardless of the source record.
    Constant {
        /// The value to emit.
        value: Value,
    },
    /// Join several source fields with a separator, skipping absent ones.
    Concatenate {
        /// Source field names, in order.
        sources: Vec<String>,
        /// Separator between present parts.
        separator: String,
    },
}

/// One target field in a mapping table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldRule {
    /// Target field name.
    pub target: String,
    /// How the value is produced.
    pub transform: FieldTransform,
    /// Whether an absent source value fails the whole record.
    #[serde(default)]
    pub required: bool,
}

impl FieldRule {
    /// Rule that fails the record when its source value is absent.
    pub fn required(target: impl Into<String>, transform: FieldTransform) -> FieldRule {
        FieldRule {
            target: target.into(),
            transform,
            required: true,
        }
    }

    /// Rule whose target field is simply omitted when the source is absent.
    pub fn optional(target: impl Into<String>, transform: FieldTransform) -> FieldRule {
        FieldRule {
            target: target.into(),
            transform,
            required: false,
        }
    }

    /// Evaluates the rule against a source object.
    ///
    /// `Ok(None)` means the optional field is absent from the output.
    fn evaluate(&self, source: &Map<String, Value>) -> Result<Option<Value>, MapError> {
        match &self.transform {
            FieldTransform::Identity => self.copy_from(source, &self.target),
            FieldTransform::Rename { source: from } => self.copy_from(source, from),
            FieldTransform::DateReformat {
                source: from,
                from: in_pattern,
                to: out_pattern,
            } => match present(source, from) {
                Some(Value::String(raw)) => {
                    let rendered =
                        reformat_date(raw, in_pattern, out_pattern).map_err(|reason| {
                            MapError::BadDate {
                                field: from.clone(),
                                reason,
                            }
                        })?;
                    Ok(Some(Value::String(rendered)))
                }
                Some(_) => Err(MapError::BadDate {
                    field: from.clone(),
                    reason: "not a string".to_string(),
                }),
                None => self.absent(from),
            },
            FieldTransform::Constant { value } => Ok(Some(value.clone())),
            FieldTransform::Concatenate { sources, separator } => {
                let mut parts = Vec::new();
                for name in sources {
                    match present(source, name) {
                        Some(value) => parts.push(scalar_text(value)),
                        None if self.required => {
                            return Err(MapError::MissingField { field: name.clone() })
                        }
                        None => {}
                    }
                }
                if parts.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(Value::String(parts.join(separator))))
                }
            }
        }
    }

    fn copy_from(&self, source: &Map<String, Value>, name: &str) -> Result<Option<Value>, MapError> {
        match present(source, name) {
            Some(value) => Ok(Some(value.clone())),
            None => self.absent(name),
        }
    }

    fn absent(&self, name: &str) -> Result<Option<Value>, MapError> {
        if self.required {
            Err(MapError::MissingField {
                field: name.to_string(),
            })
        } else {
            Ok(None)
        }
    }
}

/// Null counts as absent.
fn present<'a>(source: &'a Map<String, Value>, name: &str) -> Option<&'a Value> {
    match source.get(name) {
        None | Some(Value::Null) => None,
        Some(value) => Some(value),
    }
}

fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn reformat_date(raw: &str, from: &str, to: &str) -> Result<String, String> {
    let parsed: DateTime<Utc> = if from == "%+" {
        DateTime::parse_from_rfc3339(raw)
            .map_err(|e| e.to_string())?
            .with_timezone(&Utc)
    } else if pattern_has_offset(from) {
        DateTime::parse_from_str(raw, from)
            .map_err(|e| e.to_string())?
            .with_timezone(&Utc)
    } else if let Ok(naive) = NaiveDateTime::parse_from_str(raw, from) {
        naive.and_utc()
    } else {
        let date = NaiveDate::parse_from_str(raw, from).map_err(|e| e.to_string())?;
        match date.and_hms_opt(0, 0, 0) {
            Some(naive) => naive.and_utc(),
            None => return Err("date has no midnight".to_string()),
        }
    };
    if to == "%+" {
        return Ok(parsed.to_rfc3339());
    }
    // format() defers errors to render time, so collect through write!
    let mut rendered = String::new();
    write!(rendered, "{}", parsed.format(to)).map_err(|_| format!("bad output pattern `{to}`"))?;
    Ok(rendered)
}

fn pattern_has_offset(pattern: &str) -> bool {
    ["%z", "%:z", "%#z", "%Z"]
        .iter()
        .any(|spec| pattern.contains(spec))
}

/// An ordered set of field rules producing a target-shape record.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MappingTable {
    /// Rules evaluated in order; a later rule overwrites an earlier target.
    pub rules: Vec<FieldRule>,
}

impl MappingTable {
    /// Table from rules.
    pub fn new(rules: Vec<FieldRule>) -> MappingTable {
        MappingTable { rules }
    }

    /// Applies every rule to `source`, producing the target-shape object.
    ///
    /// Fails on the first violated rule; a partial record is never produced.
    /// Deterministic and side-effect free.
    pub fn apply(&self, source: &Value) -> Result<Value, MapError> {
        let object = source.as_object().ok_or(MapError::NotAnObject)?;
        let mut out = Map::new();
        for rule in &self.rules {
            if let Some(value) = rule.evaluate(object)? {
                out.insert(rule.target.clone(), value);
            }
        }
        Ok(Value::Object(out))
    }

    /// Derives the reverse-direction table where rules are invertible.
    ///
    /// `Constant` and `Concatenate` have no inverse and are dropped; a
    /// deployment that needs those fields reversed configures an explicit
    /// table for the other direction instead.
    pub fn inverse(&self) -> MappingTable {
        let mut rules = Vec::new();
        for rule in &self.rules {
            match &rule.transform {
                FieldTransform::Identity => rules.push(rule.clone()),
                FieldTransform::Rename { source } => rules.push(FieldRule {
                    target: source.clone(),
                    transform: FieldTransform::Rename {
                        source: rule.target.clone(),
                    },
                    required: rule.required,
                }),
                FieldTransform::DateReformat { source, from, to } => rules.push(FieldRule {
                    target: source.clone(),
                    transform: FieldTransform::DateReformat {
                        source: rule.target.clone(),
                        from: to.clone(),
                        to: from.clone(),
                    },
                    required: rule.required,
                }),
                FieldTransform::Constant { .. } | FieldTransform::Concatenate { .. } => {}
            }
        }
        MappingTable { rules }
    }

    /// True when every rule survives inversion.
    pub fn is_invertible(&self) -> bool {
        self.rules.iter().all(|rule| {
            !matches!(
                rule.transform,
                FieldTransform::Constant { .. } | FieldTransform::Concatenate { .. }
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn customer_table() -> MappingTable {
        MappingTable::new(vec![
            FieldRule::required(
                "firstName",
                FieldTransform::Rename {
                    source: "first_name".to_string(),
                },
            ),
            FieldRule::optional(
                "lastName",
                FieldTransform::Rename {
                    source: "last_name".to_string(),
                },
            ),
            FieldRule::optional("email", FieldTransform::Identity),
            FieldRule::optional(
                "name",
                FieldTransform::Concatenate {
                    sources: vec!["first_name".to_string(), "last_name".to_string()],
                    separator: " ".to_string(),
                },
            ),
            FieldRule::optional(
                "source",
                FieldTransform::Constant {
                    value: json!("field-service"),
                },
            ),
        ])
    }

    #[test]
    fn maps_rename_identity_concat_constant() {
        let source = json!({"first_name": "Ada", "last_name": "Lovelace", "email": "ada@example.com"});
        let mapped = customer_table().apply(&source).unwrap();
        assert_eq!(
            mapped,
            json!({
                "firstName": "Ada",
                "lastName": "Lovelace",
                "email": "ada@example.com",
                "name": "Ada Lovelace",
                "source": "field-service",
            })
        );
    }

    #[test]
    fn missing_required_field_fails_whole_record() {
        let source = json!({"last_name": "Lovelace"});
        let err = customer_table().apply(&source).unwrap_err();
        assert_eq!(
            err,
            MapError::MissingField {
                field: "first_name".to_string()
            }
        );
    }

    #[test]
    fn missing_optional_field_is_omitted() {
        let source = json!({"first_name": "Ada"});
        let mapped = customer_table().apply(&source).unwrap();
        assert_eq!(mapped.get("lastName"), None);
        assert_eq!(mapped.get("name"), Some(&json!("Ada")));
    }

    #[test]
    fn null_counts_as_absent() {
        let source = json!({"first_name": "Ada", "email": null});
        let mapped = customer_table().apply(&source).unwrap();
        assert_eq!(mapped.get("email"), None);
    }

    #[test]
    fn non_object_source_is_rejected() {
        let err = customer_table().apply(&json!(["not", "an", "object"])).unwrap_err();
        assert_eq!(err, MapError::NotAnObject);
    }

    #[test]
    fn date_reformat_local_to_rfc3339() {
        let table = MappingTable::new(vec![FieldRule::required(
            "startTime",
            FieldTransform::DateReformat {
                source: "scheduled_at".to_string(),
                from: "%m/%d/%Y %H:%M".to_string(),
                to: "%+".to_string(),
            },
        )]);
        let mapped = table.apply(&json!({"scheduled_at": "03/15/2024 14:30"})).unwrap();
        assert_eq!(mapped, json!({"startTime": "2024-03-15T14:30:00+00:00"}));
    }

    #[test]
    fn date_reformat_rfc3339_to_local() {
        let table = MappingTable::new(vec![FieldRule::required(
            "scheduled_at",
            FieldTransform::DateReformat {
                source: "startTime".to_string(),
                from: "%+".to_string(),
                to: "%m/%d/%Y %H:%M".to_string(),
            },
        )]);
        let mapped = table
            .apply(&json!({"startTime": "2024-03-15T14:30:00-04:00"}))
            .unwrap();
        // normalized to UTC before rendering
        assert_eq!(mapped, json!({"scheduled_at": "03/15/2024 18:30"}));
    }

    #[test]
    fn unparsable_date_reports_field() {
        let table = MappingTable::new(vec![FieldRule::required(
            "startTime",
            FieldTransform::DateReformat {
                source: "scheduled_at".to_string(),
                from: "%m/%d/%Y %H:%M".to_string(),
                to: "%+".to_string(),
            },
        )]);
        let err = table.apply(&json!({"scheduled_at": "soon"})).unwrap_err();
        match err {
            MapError::BadDate { field, .. } => assert_eq!(field, "scheduled_at"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn date_only_pattern_parses_at_midnight() {
        let table = MappingTable::new(vec![FieldRule::required(
            "startTime",
            FieldTransform::DateReformat {
                source: "scheduled_at".to_string(),
                from: "%m/%d/%Y".to_string(),
                to: "%+".to_string(),
            },
        )]);
        let mapped = table.apply(&json!({"scheduled_at": "03/15/2024"})).unwrap();
        assert_eq!(mapped, json!({"startTime": "2024-03-15T00:00:00+00:00"}));
    }

    #[test]
    fn inverse_swaps_renames_and_date_patterns() {
        let table = MappingTable::new(vec![
            FieldRule::required(
                "firstName",
                FieldTransform::Rename {
                    source: "first_name".to_string(),
                },
            ),
            FieldRule::optional(
                "startTime",
                FieldTransform::DateReformat {
                    source: "scheduled_at".to_string(),
                    from: "%m/%d/%Y %H:%M".to_string(),
                    to: "%+".to_string(),
                },
            ),
            FieldRule::optional(
                "source",
                FieldTransform::Constant {
                    value: json!("field-service"),
                },
            ),
        ]);
        assert!(!table.is_invertible());
        let inverse = table.inverse();
        assert_eq!(inverse.rules.len(), 2);
        assert_eq!(inverse.rules[0].target, "first_name");
        assert_eq!(
            inverse.rules[0].transform,
            FieldTransform::Rename {
                source: "firstName".to_string()
            }
        );
        match &inverse.rules[1].transform {
            FieldTransform::DateReformat { source, from, to } => {
                assert_eq!(source, "startTime");
                assert_eq!(from, "%+");
                assert_eq!(to, "%m/%d/%Y %H:%M");
            }
            other => panic!("unexpected transform: {other:?}"),
        }
    }

    #[test]
    fn symmetric_table_roundtrips_record() {
        let forward = MappingTable::new(vec![
            FieldRule::required(
                "firstName",
                FieldTransform::Rename {
                    source: "first_name".to_string(),
                },
            ),
            FieldRule::optional("email", FieldTransform::Identity),
        ]);
        let source = json!({"first_name": "Ada", "email": "ada@example.com"});
        let there = forward.apply(&source).unwrap();
        let back = forward.inverse().apply(&there).unwrap();
        assert_eq!(back, source);
    }

    #[test]
    fn tables_deserialize_from_config_json() {
        let raw = json!({
            "rules": [
                {"target": "firstName", "transform": {"op": "rename", "source": "first_name"}, "required": true},
                {"target": "email", "transform": {"op": "identity"}},
                {"target": "source", "transform": {"op": "constant", "value": "crm"}}
            ]
        });
        let table: MappingTable = serde_json::from_value(raw).unwrap();
        assert_eq!(table.rules.len(), 3);
        assert!(table.rules[0].required);
        assert!(!table.rules[1].required);
    }
}
