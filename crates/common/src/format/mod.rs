//! Result formatting
//!
//! Projects store documents onto the stable shapes handed to the language
//! model, and renders the fixed textual payload that wraps them.

use crate::catalog::{DefectCatalog, DefectCategory, MappedDefect};
use crate::components::InspectionView;
use crate::db::models::{instant_from_value, ComponentSummary, Document, ReportRecord};
use crate::query::conditions::number_value;
use crate::query::QueryIntent;
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use tracing::warn;

/// A report with its occurrence arrays replaced by named defects
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedReport {
    pub batch_id: Option<String>,
    pub component_name: Option<String>,
    pub date: Option<Value>,
    pub actual_production: Option<Value>,
    pub planned_quantity: Option<Value>,
    pub ok_parts: Option<Value>,
    pub ng_parts: Option<Value>,
    pub defect_occurrences: BTreeMap<String, MappedDefect>,
    pub ocr_defect_occurrences: BTreeMap<String, MappedDefect>,
    pub dimensional_defect_occurrences: BTreeMap<String, MappedDefect>,
    pub quality: Option<Value>,
    pub performance: Option<Value>,
    pub availability: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SummaryView {
    pub component_name: Option<String>,
    pub count: u64,
    pub total_production: Value,
    pub latest_date: Option<Value>,
}

/// Projects documents, resolving defects against one catalog load
pub struct ResultFormatter<'a> {
    catalog: &'a DefectCatalog,
}

impl<'a> ResultFormatter<'a> {
    pub fn new(catalog: &'a DefectCatalog) -> Self {
        Self { catalog }
    }

    /// Documents that do not fit the report shape are logged and skipped
    pub fn reports(&self, docs: &[Document]) -> Vec<EnrichedReport> {
        docs.iter()
            .filter_map(|doc| match serde_json::from_value::<ReportRecord>(doc.clone()) {
                Ok(record) => Some(self.enrich(record)),
                Err(e) => {
                    warn!(error = %e, "Skipping report with unexpected shape");
                    None
                }
            })
            .collect()
    }

    fn enrich(&self, record: ReportRecord) -> EnrichedReport {
        let map = |counts: &[u64], category: DefectCategory| {
            self.catalog.map_occurrences(counts, category)
        };

        EnrichedReport {
            defect_occurrences: map(&record.defect_occurrences, DefectCategory::ObjectDetection),
            ocr_defect_occurrences: map(&record.ocr_defect_occurrences, DefectCategory::Ocr),
            dimensional_defect_occurrences: map(
                &record.dimensional_defect_occurrences,
                DefectCategory::Dimensional,
            ),
            batch_id: record.batch_id,
            component_name: record.component_name,
            date: record.date.as_ref().map(display_date),
            actual_production: record.actual_production.map(number_value),
            planned_quantity: record.planned_quantity.map(number_value),
            ok_parts: record.ok_parts.map(number_value),
            ng_parts: record.ng_parts.map(number_value),
            quality: record.quality.map(number_value),
            performance: record.performance.map(number_value),
            availability: record.availability.map(number_value),
        }
    }
}

/// Grouped component rows; no catalog needed
pub fn summaries(docs: &[Document]) -> Vec<SummaryView> {
    docs.iter()
        .filter_map(|doc| match serde_json::from_value::<ComponentSummary>(doc.clone()) {
            Ok(row) => Some(SummaryView {
                component_name: row.component_name,
                count: row.count,
                total_production: number_value(row.total_production),
                latest_date: row.latest_date.as_ref().map(display_date),
            }),
            Err(e) => {
                warn!(error = %e, "Skipping summary row with unexpected shape");
                None
            }
        })
        .collect()
}

/// Dates as RFC 3339 when readable, otherwise unchanged
fn display_date(value: &Value) -> Value {
    instant_from_value(value)
        .map(|at| Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true)))
        .unwrap_or_else(|| value.clone())
}

/// Where the records of a payload came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataSource {
    /// Generic report store, with the route that produced the records
    Reports { route: &'static str },
    /// One component's inspection partition
    Partition { name: String },
}

impl std::fmt::Display for DataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Reports { route } => write!(f, "production reports ({route})"),
            Self::Partition { name } => write!(f, "inspection records of component '{name}'"),
        }
    }
}

/// Formatted records ready to embed into a prompt
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPayload {
    pub question: String,
    pub intent: QueryIntent,
    pub source: DataSource,
    pub query: Value,
    pub record_count: usize,
    pub data: Value,
}

impl QueryPayload {
    pub fn reports(
        question: &str,
        intent: QueryIntent,
        route: &'static str,
        query: Value,
        records: Vec<EnrichedReport>,
    ) -> Self {
        let source = DataSource::Reports { route };
        Self::build(question, intent, source, query, records.len(), &records)
    }

    pub fn summaries(
        question: &str,
        intent: QueryIntent,
        route: &'static str,
        query: Value,
        rows: Vec<SummaryView>,
    ) -> Self {
        let source = DataSource::Reports { route };
        Self::build(question, intent, source, query, rows.len(), &rows)
    }

    pub fn inspections(
        question: &str,
        intent: QueryIntent,
        name: &str,
        records: Vec<InspectionView>,
    ) -> Self {
        let query = serde_json::json!({ "component": name });
        let source = DataSource::Partition {
            name: name.to_string(),
        };
        Self::build(question, intent, source, query, records.len(), &records)
    }

    fn build<T: Serialize>(
        question: &str,
        intent: QueryIntent,
        source: DataSource,
        query: Value,
        record_count: usize,
        records: &T,
    ) -> Self {
        Self {
            question: question.to_string(),
            intent,
            source,
            query,
            record_count,
            data: serde_json::to_value(records).unwrap_or(Value::Null),
        }
    }

    /// The fixed-shape text embedded into the model prompt
    pub fn render(&self) -> String {
        let flag = |on: bool| if on { "yes" } else { "no" };
        let pretty = |v: &Value| serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string());

        let mut text = String::new();
        let _ = writeln!(text, "Question: {}", self.question);
        let _ = writeln!(text);
        let _ = writeln!(text, "Query analysis:");
        let _ = writeln!(text, "- NG query: {}", flag(self.intent.is_ng_query));
        let _ = writeln!(text, "- Needs aggregation: {}", flag(self.intent.needs_aggregation));
        let _ = writeln!(text, "- Comparative: {}", flag(self.intent.is_comparative));
        let _ = writeln!(text, "- Component list: {}", flag(self.intent.is_component_list));
        let _ = writeln!(text, "- General query: {}", flag(self.intent.is_general_query));
        let _ = writeln!(text);
        let _ = writeln!(text, "Data source: {}", self.source);
        let _ = writeln!(text, "Query: {}", self.query);
        let _ = writeln!(text, "Records found: {}", self.record_count);
        let _ = writeln!(text);
        let _ = writeln!(text, "Data:");
        text.push_str(&pretty(&self.data));
        text
    }
}
