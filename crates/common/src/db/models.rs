//! Document models
//!
//! Report documents are stored as JSON objects with camelCase field names.
//! These types give them a typed shape once they leave the store.

use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// A stored document
pub type Document = Value;

/// Field names of report documents
pub mod fields {
    pub const BATCH_ID: &str = "batchId";
    pub const COMPONENT_NAME: &str = "componentName";
    pub const DATE: &str = "date";
    pub const ACTUAL_PRODUCTION: &str = "actualProduction";
    pub const PLANNED_QUANTITY: &str = "plannedQuantity";
    pub const OK_PARTS: &str = "okParts";
    pub const NG_PARTS: &str = "ngParts";
    pub const DEFECT_OCCURRENCES: &str = "defectOccurrences";
    pub const OCR_DEFECT_OCCURRENCES: &str = "ocrDefectOccurrences";
    pub const DIMENSIONAL_DEFECT_OCCURRENCES: &str = "dimensionalDefectOccurrences";
    pub const QUALITY: &str = "quality";
    pub const PERFORMANCE: &str = "performance";
    pub const AVAILABILITY: &str = "availability";

    // Outputs of the component summary group stage
    pub const COUNT: &str = "count";
    pub const TOTAL_PRODUCTION: &str = "totalProduction";
    pub const LATEST_DATE: &str = "latestDate";
}

/// Per-batch, per-component production report
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReportRecord {
    #[serde(deserialize_with = "scalar_text")]
    pub batch_id: Option<String>,
    #[serde(deserialize_with = "scalar_text")]
    pub component_name: Option<String>,
    pub date: Option<Value>,
    pub actual_production: Option<f64>,
    pub planned_quantity: Option<f64>,
    pub ok_parts: Option<f64>,
    pub ng_parts: Option<f64>,
    #[serde(deserialize_with = "occurrence_counts")]
    pub defect_occurrences: Vec<u64>,
    #[serde(deserialize_with = "occurrence_counts")]
    pub ocr_defect_occurrences: Vec<u64>,
    #[serde(deserialize_with = "occurrence_counts")]
    pub dimensional_defect_occurrences: Vec<u64>,
    pub quality: Option<f64>,
    pub performance: Option<f64>,
    pub availability: Option<f64>,
}

/// Identifiers stored as numbers or booleans read as their text
fn scalar_text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

/// Anything but an array reads as no occurrences. Entries keep their
/// position; ones that are not a count read as zero.
fn occurrence_counts<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u64>, D::Error> {
    Ok(match Value::deserialize(deserializer)? {
        Value::Array(items) => items.iter().map(occurrence_count).collect(),
        _ => Vec::new(),
    })
}

fn occurrence_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n
            .as_u64()
            .or_else(|| {
                n.as_f64()
                    .filter(|f| f.is_finite() && *f >= 0.0)
                    .map(|f| f.round() as u64)
            })
            .unwrap_or(0),
        Value::String(s) => s.trim().parse().unwrap_or(0),
        _ => 0,
    }
}

/// One row of the component summary pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ComponentSummary {
    pub component_name: Option<String>,
    pub count: u64,
    pub total_production: f64,
    pub latest_date: Option<Value>,
}

/// Read an instant from any of the encodings documents use for time:
/// `{"$date": {"$numberLong": "..."}}`, `{"$date": "..."}`, epoch
/// milliseconds, or a date string.
pub fn instant_from_value(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Object(map) => {
            let inner = map.get("$date")?;
            match inner {
                Value::Object(long) => {
                    let millis = match long.get("$numberLong")? {
                        Value::String(s) => s.trim().parse::<i64>().ok()?,
                        Value::Number(n) => n.as_i64()?,
                        _ => return None,
                    };
                    Utc.timestamp_millis_opt(millis).single()
                }
                other => instant_from_value(other),
            }
        }
        Value::Number(n) => {
            let millis = n.as_i64().or_else(|| n.as_f64().map(|f| f as i64))?;
            Utc.timestamp_millis_opt(millis).single()
        }
        Value::String(s) => parse_date_string(s),
        _ => None,
    }
}

fn parse_date_string(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| Utc.from_utc_datetime(&naive))
}
