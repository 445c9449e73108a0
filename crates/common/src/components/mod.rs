//! Component inspection partitions
//!
//! Each component has its own partition of inspection records. Names taken
//! from a question are validated and resolved against a registry before any
//! store access, so only registered partitions are ever queried.

use crate::catalog::{DefectCatalog, DefectCategory, ResolvedDefect};
use crate::db::models::instant_from_value;
use crate::errors::{AppError, Result};
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use tracing::{debug, warn};

/// Longest accepted component name
pub const MAX_NAME_LEN: usize = 64;

/// Shown in place of a timestamp no known encoding could parse
pub const INVALID_TIMESTAMP: &str = "Invalid timestamp";

const COMPONENT_DECISIONS: &[&str] = &["OK", "NG", "Maybe", "Rework", "Unknown"];
const IMAGE_DECISIONS: &[&str] = &["OK", "NG", "Maybe"];

/// A registered component partition. Only obtainable from [`ComponentRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    name: String,
}

impl Partition {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Check that a name is usable as a partition key
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty".to_string())
    } else if name.chars().count() > MAX_NAME_LEN {
        Some(format!("name is longer than {MAX_NAME_LEN} characters"))
    } else {
        name.chars()
            .find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '-'))
            .map(|c| format!("character '{c}' is not allowed"))
    };

    match reason {
        Some(reason) => Err(AppError::MalformedName {
            name: name.to_string(),
            reason,
        }),
        None => Ok(()),
    }
}

/// Known component identifiers
#[derive(Debug, Clone, Default)]
pub struct ComponentRegistry {
    names: BTreeSet<String>,
}

impl ComponentRegistry {
    /// Build from configured names; an invalid configured name is a configuration error.
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut registry = Self::default();
        for name in names {
            let name = name.into();
            validate_name(&name).map_err(|e| AppError::Configuration {
                message: format!("Invalid entry in components.known: {e}"),
            })?;
            registry.names.insert(name);
        }
        Ok(registry)
    }

    /// Add partitions found in the store. Names that fail validation are skipped.
    pub fn extend_discovered(&mut self, names: Vec<String>) {
        for name in names {
            match validate_name(&name) {
                Ok(()) => {
                    self.names.insert(name);
                }
                Err(e) => warn!(error = %e, "Skipping discovered partition"),
            }
        }
        debug!(partitions = self.names.len(), "Component registry updated");
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Validate, then resolve exact match, then case-insensitive match.
    pub fn resolve(&self, raw: &str) -> Result<Partition> {
        let name = raw.trim();
        validate_name(name)?;

        if let Some(exact) = self.names.get(name) {
            return Ok(Partition {
                name: exact.clone(),
            });
        }

        self.names
            .iter()
            .find(|known| known.eq_ignore_ascii_case(name))
            .map(|known| Partition {
                name: known.clone(),
            })
            .ok_or_else(|| AppError::PartitionNotFound {
                name: name.to_string(),
            })
    }
}

/// Message for a registered partition with no records
pub fn empty_partition_message(partition: &Partition) -> String {
    format!(
        "Component '{}' exists but has no inspection records.",
        partition.name()
    )
}

/// Label for a component-level decision code
pub fn component_decision(code: Option<&Value>) -> String {
    decision_label(COMPONENT_DECISIONS, code)
}

/// Label for an image-level decision code
pub fn image_decision(code: Option<&Value>) -> String {
    decision_label(IMAGE_DECISIONS, code)
}

fn decision_label(table: &[&str], code: Option<&Value>) -> String {
    let numeric = code.and_then(|v| match v {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    });

    match numeric {
        Some(n) if n >= 0 && (n as usize) < table.len() => table[n as usize].to_string(),
        Some(n) => format!("Unknown ({n})"),
        None => match code {
            Some(Value::String(s)) => format!("Unknown ({s})"),
            Some(other) => format!("Unknown ({other})"),
            None => "Unknown (null)".to_string(),
        },
    }
}

/// Any of the four timestamp encodings as RFC 3339, else [`INVALID_TIMESTAMP`]
pub fn normalize_timestamp(value: Option<&Value>) -> String {
    value
        .and_then(instant_from_value)
        .map(|at| at.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| INVALID_TIMESTAMP.to_string())
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawInspection {
    component_id: Option<Value>,
    batch_id: Option<Value>,
    timestamp: Option<Value>,
    decision: Option<Value>,
    subtype: Option<Value>,
    controller_id: Option<Value>,
    config_audit_id: Option<Value>,
    images: Vec<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawImage {
    image_id: Option<Value>,
    decision: Option<Value>,
    object_detection: Option<RawDefectBlock>,
    ocr: Option<RawDefectBlock>,
    dimensional: Option<RawDefectBlock>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDefectBlock {
    detections: Vec<RawDetection>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct RawDetection {
    defect_id: Option<u32>,
    confidence: Option<f64>,
    bbox: Option<Value>,
}

/// One normalized inspection record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectionView {
    pub component_id: Option<String>,
    pub batch_id: Option<String>,
    pub timestamp: String,
    pub decision: String,
    pub subtype: Option<String>,
    pub controller_id: Option<String>,
    pub config_audit_id: Option<String>,
    pub images: Vec<ImageView>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageView {
    pub image_id: Option<String>,
    pub decision: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_detection: Option<Vec<DetectionView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ocr: Option<Vec<DetectionView>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimensional: Option<Vec<DetectionView>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionView {
    pub defect_id: Option<u32>,
    pub label: String,
    pub description: String,
    pub is_acceptable: bool,
    pub category: DefectCategory,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bbox: Option<Value>,
}

/// Normalize raw inspection documents. Malformed documents degrade to
/// "Unknown"/"Invalid timestamp" fields instead of failing.
pub fn normalize_inspections(raw: &[Value], catalog: &DefectCatalog) -> Vec<InspectionView> {
    raw.iter().map(|doc| normalize_inspection(doc, catalog)).collect()
}

fn normalize_inspection(doc: &Value, catalog: &DefectCatalog) -> InspectionView {
    let record: RawInspection = serde_json::from_value(doc.clone()).unwrap_or_else(|e| {
        warn!(error = %e, "Inspection record has an unexpected shape");
        RawInspection::default()
    });

    InspectionView {
        component_id: record.component_id.as_ref().and_then(text),
        batch_id: record.batch_id.as_ref().and_then(text),
        timestamp: normalize_timestamp(record.timestamp.as_ref()),
        decision: component_decision(record.decision.as_ref()),
        subtype: record.subtype.as_ref().and_then(text),
        controller_id: record.controller_id.as_ref().and_then(text),
        config_audit_id: record.config_audit_id.as_ref().and_then(text),
        images: record
            .images
            .iter()
            .map(|image| normalize_image(image, catalog))
            .collect(),
    }
}

fn normalize_image(doc: &Value, catalog: &DefectCatalog) -> ImageView {
    let image: RawImage = serde_json::from_value(doc.clone()).unwrap_or_else(|e| {
        warn!(error = %e, "Inspection image has an unexpected shape");
        RawImage::default()
    });

    let group = |block: Option<RawDefectBlock>, category: DefectCategory| -> Option<Vec<DetectionView>> {
        block.map(|b| {
            b.detections
                .into_iter()
                .map(|d| detection(d, category, catalog))
                .collect()
        })
    };

    ImageView {
        image_id: image.image_id.as_ref().and_then(text),
        decision: image_decision(image.decision.as_ref()),
        object_detection: group(image.object_detection, DefectCategory::ObjectDetection),
        ocr: group(image.ocr, DefectCategory::Ocr),
        dimensional: group(image.dimensional, DefectCategory::Dimensional),
    }
}

fn detection(raw: RawDetection, category: DefectCategory, catalog: &DefectCatalog) -> DetectionView {
    let resolved = match raw.defect_id {
        Some(id) => catalog.resolve(id),
        None => ResolvedDefect {
            label: "Unknown_Defect".to_string(),
            description: "Unknown defect type".to_string(),
            is_acceptable: false,
        },
    };

    DetectionView {
        defect_id: raw.defect_id,
        label: resolved.label,
        description: resolved.description,
        is_acceptable: resolved.is_acceptable,
        category,
        confidence: raw.confidence,
        bbox: raw.bbox,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::DefectDefinition;
    use serde_json::json;

    fn registry() -> ComponentRegistry {
        ComponentRegistry::from_names(["ABC_1", "GEAR-12"]).unwrap()
    }

    fn catalog() -> DefectCatalog {
        DefectCatalog::from_definitions(vec![DefectDefinition {
            id: 2,
            class_name: "Dent".to_string(),
            description: "Surface dent".to_string(),
            is_acceptable: false,
            defect_type: "visual".to_string(),
        }])
    }

    #[test]
    fn test_resolve_exact_then_case_insensitive() {
        let registry = registry();
        assert_eq!(registry.resolve("ABC_1").unwrap().name(), "ABC_1");
        assert_eq!(registry.resolve("gear-12").unwrap().name(), "GEAR-12");
    }

    #[test]
    fn test_unknown_and_malformed_are_distinct() {
        let registry = registry();

        let missing = registry.resolve("XYZ_9").unwrap_err();
        assert!(matches!(missing, AppError::PartitionNotFound { .. }));

        let malformed = registry.resolve("ABC_1; drop").unwrap_err();
        assert!(matches!(malformed, AppError::MalformedName { .. }));

        let too_long = registry.resolve(&"A".repeat(MAX_NAME_LEN + 1)).unwrap_err();
        assert!(matches!(too_long, AppError::MalformedName { .. }));

        assert_ne!(missing.user_message(), malformed.user_message());
    }

    #[test]
    fn test_invalid_configured_name_is_configuration_error() {
        let err = ComponentRegistry::from_names(["ok_name", "bad name"]).unwrap_err();
        assert!(matches!(err, AppError::Configuration { .. }));
    }

    #[test]
    fn test_discovered_names_skip_invalid() {
        let mut registry = registry();
        registry.extend_discovered(vec!["NEW_3".to_string(), "$bad".to_string()]);
        assert_eq!(registry.len(), 3);
        assert!(registry.resolve("NEW_3").is_ok());
    }

    #[test]
    fn test_decision_tables() {
        assert_eq!(component_decision(Some(&json!(3))), "Rework");
        assert_eq!(component_decision(Some(&json!(4))), "Unknown");
        assert_eq!(component_decision(Some(&json!(7))), "Unknown (7)");
        assert_eq!(image_decision(Some(&json!(2))), "Maybe");
        assert_eq!(image_decision(Some(&json!(3))), "Unknown (3)");
        assert_eq!(image_decision(Some(&json!("1"))), "NG");
        assert_eq!(image_decision(None), "Unknown (null)");
    }

    #[test]
    fn test_timestamp_encodings() {
        let expected = "2025-02-24T10:00:00.000Z";
        let millis = 1_740_391_200_000_i64;

        assert_eq!(
            normalize_timestamp(Some(&json!({"$date": {"$numberLong": millis.to_string()}}))),
            expected
        );
        assert_eq!(
            normalize_timestamp(Some(&json!({"$date": "2025-02-24T10:00:00Z"}))),
            expected
        );
        assert_eq!(normalize_timestamp(Some(&json!(millis))), expected);
        assert_eq!(normalize_timestamp(Some(&json!("2025-02-24T10:00:00Z"))), expected);
        assert_eq!(normalize_timestamp(Some(&json!("garbage"))), INVALID_TIMESTAMP);
        assert_eq!(normalize_timestamp(None), INVALID_TIMESTAMP);
    }

    #[test]
    fn test_defect_groups_only_when_present() {
        let raw = vec![json!({
            "componentId": 17,
            "batchId": "B-1",
            "timestamp": "2025-02-24T10:00:00Z",
            "decision": 1,
            "subtype": "front",
            "images": [
                {
                    "imageId": "img-1",
                    "decision": 1,
                    "objectDetection": {"detections": [
                        {"defectId": 2, "confidence": 0.91, "bbox": [1, 2, 3, 4]},
                        {"defectId": 40}
                    ]}
                },
                {"imageId": "img-2", "decision": 0}
            ]
        })];

        let views = normalize_inspections(&raw, &catalog());
        let view = &views[0];
        assert_eq!(view.component_id.as_deref(), Some("17"));
        assert_eq!(view.decision, "NG");
        assert_eq!(view.controller_id, None);

        let first = &view.images[0];
        assert_eq!(first.decision, "NG");
        let detections = first.object_detection.as_ref().unwrap();
        assert_eq!(detections[0].label, "Dent");
        assert_eq!(detections[1].label, "Unknown_Defect_40");
        assert!(first.ocr.is_none());
        assert!(first.dimensional.is_none());

        let second = serde_json::to_value(&view.images[1]).unwrap();
        assert_eq!(second, json!({"imageId": "img-2", "decision": "OK"}));
    }

    #[test]
    fn test_malformed_record_degrades() {
        let views = normalize_inspections(&[json!({"images": "not a list"})], &catalog());
        assert_eq!(views[0].timestamp, INVALID_TIMESTAMP);
        assert_eq!(views[0].decision, "Unknown (null)");
        assert!(views[0].images.is_empty());
    }
}
