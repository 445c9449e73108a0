//! Query conditions
//!
//! The predicate model shared by both store backends, and the builder that
//! assembles it from a question. Conditions are built once and never
//! mutated afterwards; the pipeline router takes them by value.

use super::dates::DateRangeResolver;
use super::entities::EntityExtractor;
use super::intent::QueryIntent;
use crate::db::models::fields;
use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// A comparable literal
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    Text(String),
    Number(f64),
    Instant(DateTime<Utc>),
}

impl Scalar {
    pub fn to_document(&self) -> Value {
        match self {
            Self::Text(s) => Value::String(s.clone()),
            Self::Number(n) => number_value(*n),
            Self::Instant(at) => json!({ "$date": at.to_rfc3339_opts(SecondsFormat::Millis, true) }),
        }
    }
}

/// Render a number as an integer when it has no fractional part
pub fn number_value(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Constraint on a single field
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    Equals(Scalar),
    Matches {
        pattern: String,
        case_insensitive: bool,
    },
    /// Field present (`true`) or absent (`false`)
    Exists(bool),
    /// Field present and not null
    NotNull,
    Range {
        gt: Option<Scalar>,
        gte: Option<Scalar>,
        lt: Option<Scalar>,
        lte: Option<Scalar>,
    },
    All(Vec<Predicate>),
}

impl Predicate {
    /// Case-insensitive substring match on literal text
    pub fn contains_ci(text: &str) -> Self {
        Self::Matches {
            pattern: regex_lite::escape(text),
            case_insensitive: true,
        }
    }

    pub fn between(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self::Range {
            gt: None,
            gte: Some(Scalar::Instant(start)),
            lt: None,
            lte: Some(Scalar::Instant(end)),
        }
    }

    pub fn at_least(n: f64) -> Self {
        Self::Range {
            gt: None,
            gte: Some(Scalar::Number(n)),
            lt: None,
            lte: None,
        }
    }

    pub fn greater_than(n: f64) -> Self {
        Self::Range {
            gt: Some(Scalar::Number(n)),
            gte: None,
            lt: None,
            lte: None,
        }
    }

    /// Present and strictly positive
    pub fn positive() -> Self {
        Self::All(vec![Self::Exists(true), Self::greater_than(0.0)])
    }

    pub fn to_document(&self) -> Value {
        match self {
            Self::Equals(value) => value.to_document(),
            Self::Matches {
                pattern,
                case_insensitive,
            } => {
                if *case_insensitive {
                    json!({ "$regex": pattern, "$options": "i" })
                } else {
                    json!({ "$regex": pattern })
                }
            }
            Self::Exists(present) => json!({ "$exists": present }),
            Self::NotNull => json!({ "$ne": null }),
            Self::Range { gt, gte, lt, lte } => {
                let mut doc = Map::new();
                for (op, bound) in [("$gt", gt), ("$gte", gte), ("$lt", lt), ("$lte", lte)] {
                    if let Some(bound) = bound {
                        doc.insert(op.to_string(), bound.to_document());
                    }
                }
                Value::Object(doc)
            }
            Self::All(parts) => {
                let mut doc = Map::new();
                for part in parts {
                    match part.to_document() {
                        Value::Object(ops) => doc.extend(ops),
                        literal => {
                            doc.insert("$eq".to_string(), literal);
                        }
                    }
                }
                Value::Object(doc)
            }
        }
    }
}

/// Field predicates joined by AND, plus disjunction groups
///
/// Absence of a field means no constraint on it. Each `any_of` group holds
/// when at least one of its `(field, predicate)` pairs holds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryConditions {
    fields: BTreeMap<String, Predicate>,
    any_of: Vec<Vec<(String, Predicate)>>,
}

impl QueryConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.any_of.is_empty()
    }

    /// Set the predicate for a field, replacing any earlier one
    pub fn insert(&mut self, field: &str, predicate: Predicate) {
        self.fields.insert(field.to_string(), predicate);
    }

    pub fn with(mut self, field: &str, predicate: Predicate) -> Self {
        self.insert(field, predicate);
        self
    }

    pub fn add_any_of(&mut self, group: Vec<(String, Predicate)>) {
        if !group.is_empty() {
            self.any_of.push(group);
        }
    }

    pub fn get(&self, field: &str) -> Option<&Predicate> {
        self.fields.get(field)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &Predicate)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn any_of(&self) -> &[Vec<(String, Predicate)>] {
        &self.any_of
    }

    pub fn to_document(&self) -> Value {
        let mut doc: Map<String, Value> = self
            .fields
            .iter()
            .map(|(field, predicate)| (field.clone(), predicate.to_document()))
            .collect();

        let groups: Vec<Value> = self
            .any_of
            .iter()
            .map(|group| {
                Value::Array(
                    group
                        .iter()
                        .map(|(field, predicate)| json!({ field: predicate.to_document() }))
                        .collect(),
                )
            })
            .collect();

        match groups.len() {
            0 => {}
            1 => {
                doc.insert("$or".to_string(), groups.into_iter().next().unwrap_or_default());
            }
            _ => {
                let clauses = groups.into_iter().map(|g| json!({ "$or": g })).collect();
                doc.insert("$and".to_string(), Value::Array(clauses));
            }
        }

        Value::Object(doc)
    }
}

/// Assembles conditions from a question and its classified intent
#[derive(Debug, Clone, Default)]
pub struct ConditionBuilder {
    resolver: DateRangeResolver,
    extractor: EntityExtractor,
}

impl ConditionBuilder {
    pub fn new(resolver: DateRangeResolver) -> Self {
        Self {
            resolver,
            extractor: EntityExtractor,
        }
    }

    pub fn build(&self, question: &str, intent: &QueryIntent, now: DateTime<Utc>) -> QueryConditions {
        // Listing and summary questions are shaped by the pipeline alone
        if intent.is_general_query || intent.is_component_list {
            return QueryConditions::new();
        }

        let entities = self.extractor.extract(question);
        let mut conditions = QueryConditions::new();

        if let Some(batch) = entities.batch {
            let predicate = if batch.contains(['_', ':', '-']) {
                Predicate::Equals(Scalar::Text(batch))
            } else {
                Predicate::contains_ci(&batch)
            };
            conditions.insert(fields::BATCH_ID, predicate);
        }

        if let Some(component) = entities.component {
            conditions.insert(fields::COMPONENT_NAME, Predicate::contains_ci(&component));
        }

        if let Some(range) = entities
            .date
            .as_ref()
            .and_then(|expr| self.resolver.resolve_expression(expr, now))
        {
            conditions.insert(fields::DATE, Predicate::between(range.start, range.end));
        }

        if intent.is_ng_query {
            conditions.insert(fields::NG_PARTS, Predicate::positive());
        }

        if entities.mentions_metrics {
            conditions.add_any_of(vec![
                (fields::PERFORMANCE.to_string(), Predicate::NotNull),
                (fields::QUALITY.to_string(), Predicate::NotNull),
            ]);
        }

        if let Some(threshold) = entities.production_threshold {
            let minimum = threshold as f64;
            conditions.add_any_of(vec![
                (fields::ACTUAL_PRODUCTION.to_string(), Predicate::at_least(minimum)),
                (fields::PLANNED_QUANTITY.to_string(), Predicate::at_least(minimum)),
            ]);
        }

        conditions
    }
}
