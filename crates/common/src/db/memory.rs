//! In-memory store
//!
//! Holds report, defect and inspection documents in process and evaluates
//! conditions and pipelines with the same semantics as the SQL backend.
//! Used for demos and for running the full pipeline in tests.

use super::models::{fields, instant_from_value, Document};
use super::{session_closed, ProductionStore, StoreSession};
use crate::catalog::DefectDefinition;
use crate::components::Partition;
use crate::errors::{AppError, Result};
use crate::query::conditions::number_value;
use crate::query::{AccumulatorOp, GroupSpec, Pipeline, Predicate, QueryConditions, Scalar, SortOrder, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex_lite::RegexBuilder;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Fixture file layout
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Fixture {
    reports: Vec<Document>,
    defects: Vec<DefectDefinition>,
    components: BTreeMap<String, Vec<Document>>,
}

#[derive(Debug, Default)]
struct Shared {
    data: RwLock<Fixture>,
    unreachable: AtomicBool,
    opened: AtomicUsize,
    closed: AtomicUsize,
}

impl Shared {
    fn read(&self) -> RwLockReadGuard<'_, Fixture> {
        self.data.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Fixture> {
        self.data.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Cloneable handle; clones share the same documents and counters
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_fixture_file(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| AppError::Configuration {
            message: format!("Cannot read fixtures at {path}: {e}"),
        })?;
        Self::from_fixture_str(&raw)
    }

    pub fn from_fixture_str(raw: &str) -> Result<Self> {
        let fixture: Fixture = serde_json::from_str(raw)?;
        let store = Self::new();
        *store.shared.write() = fixture;
        Ok(store)
    }

    pub fn with_reports(self, reports: Vec<Document>) -> Self {
        self.shared.write().reports = reports;
        self
    }

    pub fn with_defects(self, defects: Vec<DefectDefinition>) -> Self {
        self.set_defects(defects);
        self
    }

    pub fn with_partition(self, name: &str, records: Vec<Document>) -> Self {
        self.shared.write().components.insert(name.to_string(), records);
        self
    }

    pub fn set_defects(&self, defects: Vec<DefectDefinition>) {
        self.shared.write().defects = defects;
    }

    /// Make `connect` fail as if the store were down
    pub fn set_unreachable(&self, unreachable: bool) {
        self.shared.unreachable.store(unreachable, AtomicOrdering::SeqCst);
    }

    pub fn sessions_opened(&self) -> usize {
        self.shared.opened.load(AtomicOrdering::SeqCst)
    }

    pub fn sessions_closed(&self) -> usize {
        self.shared.closed.load(AtomicOrdering::SeqCst)
    }
}

#[async_trait]
impl ProductionStore for MemoryStore {
    async fn connect(&self) -> Result<Box<dyn StoreSession>> {
        if self.shared.unreachable.load(AtomicOrdering::SeqCst) {
            return Err(AppError::Connection {
                message: "in-memory store marked unreachable".to_string(),
            });
        }
        self.shared.opened.fetch_add(1, AtomicOrdering::SeqCst);
        Ok(Box::new(MemorySession {
            shared: Arc::clone(&self.shared),
            open: true,
        }))
    }

    fn backend(&self) -> &'static str {
        "memory"
    }
}

struct MemorySession {
    shared: Arc<Shared>,
    open: bool,
}

impl MemorySession {
    fn data(&self) -> Result<RwLockReadGuard<'_, Fixture>> {
        if self.open {
            Ok(self.shared.read())
        } else {
            Err(session_closed())
        }
    }
}

#[async_trait]
impl StoreSession for MemorySession {
    async fn find_reports(&mut self, conditions: &QueryConditions, limit: usize) -> Result<Vec<Document>> {
        let data = self.data()?;
        Ok(data
            .reports
            .iter()
            .filter(|doc| matches_conditions(doc, conditions))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn aggregate_reports(&mut self, pipeline: &Pipeline) -> Result<Vec<Document>> {
        let data = self.data()?;
        Ok(run_pipeline(data.reports.clone(), pipeline))
    }

    async fn load_defects(&mut self) -> Result<Vec<DefectDefinition>> {
        Ok(self.data()?.defects.clone())
    }

    async fn find_inspections(&mut self, partition: &Partition, limit: usize) -> Result<Vec<Document>> {
        let data = self.data()?;
        Ok(data
            .components
            .get(partition.name())
            .map(|records| records.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    async fn list_partitions(&mut self) -> Result<Vec<String>> {
        Ok(self.data()?.components.keys().cloned().collect())
    }

    async fn ping(&mut self) -> Result<()> {
        self.data().map(|_| ())
    }

    async fn close(&mut self) -> Result<()> {
        if self.open {
            self.open = false;
            self.shared.closed.fetch_add(1, AtomicOrdering::SeqCst);
        }
        Ok(())
    }
}

/// Every field predicate holds and every disjunction group has a match
pub(crate) fn matches_conditions(doc: &Document, conditions: &QueryConditions) -> bool {
    conditions
        .fields()
        .all(|(field, predicate)| matches_predicate(doc.get(field), predicate))
        && conditions.any_of().iter().all(|group| {
            group
                .iter()
                .any(|(field, predicate)| matches_predicate(doc.get(field), predicate))
        })
}

/// A missing field fails every predicate except `Exists(false)`
fn matches_predicate(value: Option<&Value>, predicate: &Predicate) -> bool {
    match (predicate, value) {
        (Predicate::Exists(present), value) => value.is_some() == *present,
        (Predicate::All(parts), value) => parts.iter().all(|p| matches_predicate(value, p)),
        (_, None) => false,
        (Predicate::Equals(expected), Some(value)) => compare(value, expected) == Some(Ordering::Equal),
        (
            Predicate::Matches {
                pattern,
                case_insensitive,
            },
            Some(value),
        ) => value.as_str().is_some_and(|text| {
            RegexBuilder::new(pattern)
                .case_insensitive(*case_insensitive)
                .build()
                .is_ok_and(|re| re.is_match(text))
        }),
        (Predicate::NotNull, Some(value)) => !value.is_null(),
        (Predicate::Range { gt, gte, lt, lte }, Some(value)) => {
            let holds = |bound: &Option<Scalar>, accept: fn(Ordering) -> bool| {
                bound
                    .as_ref()
                    .map_or(true, |b| compare(value, b).is_some_and(accept))
            };
            holds(gt, Ordering::is_gt)
                && holds(gte, Ordering::is_ge)
                && holds(lt, Ordering::is_lt)
                && holds(lte, Ordering::is_le)
        }
    }
}

/// Compare a document value against a literal of the same kind
fn compare(value: &Value, bound: &Scalar) -> Option<Ordering> {
    match bound {
        Scalar::Number(n) => value.as_f64()?.partial_cmp(n),
        Scalar::Text(s) => Some(value.as_str()?.cmp(s.as_str())),
        Scalar::Instant(at) => match value {
            Value::String(_) | Value::Object(_) | Value::Number(_) => {
                Some(instant_from_value(value)?.cmp(at))
            }
            _ => None,
        },
    }
}

/// Ordering used by sort and max: missing < number < text < instant
#[derive(Debug, Clone, PartialEq, PartialOrd)]
enum SortKey {
    Missing,
    Number(f64),
    Text(String),
    Instant(DateTime<Utc>),
}

fn sort_key(field: &str, value: Option<&Value>) -> SortKey {
    match value {
        Some(v @ Value::Number(_)) if is_date_field(field) => {
            instant_from_value(v).map_or(SortKey::Missing, SortKey::Instant)
        }
        Some(Value::Number(n)) => n.as_f64().map_or(SortKey::Missing, SortKey::Number),
        Some(v @ Value::String(s)) => match instant_from_value(v) {
            Some(at) => SortKey::Instant(at),
            None => SortKey::Text(s.clone()),
        },
        Some(v @ Value::Object(_)) => instant_from_value(v).map_or(SortKey::Missing, SortKey::Instant),
        _ => SortKey::Missing,
    }
}

/// Fields whose numbers are epoch milliseconds
fn is_date_field(field: &str) -> bool {
    field == fields::DATE || field == fields::LATEST_DATE
}

fn cmp_keys(a: &SortKey, b: &SortKey) -> Ordering {
    a.partial_cmp(b).unwrap_or(Ordering::Equal)
}

pub(crate) fn run_pipeline(mut docs: Vec<Document>, pipeline: &Pipeline) -> Vec<Document> {
    for stage in pipeline.stages() {
        docs = match stage {
            Stage::Match(conditions) => docs
                .into_iter()
                .filter(|doc| matches_conditions(doc, conditions))
                .collect(),
            Stage::Group(spec) => group(&docs, spec),
            Stage::Sort { field, order } => {
                docs.sort_by(|a, b| {
                    let ordering = cmp_keys(&sort_key(field, a.get(field)), &sort_key(field, b.get(field)));
                    match order {
                        SortOrder::Asc => ordering,
                        SortOrder::Desc => ordering.reverse(),
                    }
                });
                docs
            }
            Stage::Limit(n) => {
                docs.truncate(*n);
                docs
            }
        };
    }
    docs
}

fn group(docs: &[Document], spec: &GroupSpec) -> Vec<Document> {
    let mut groups: Vec<(Value, Vec<&Document>)> = Vec::new();
    for doc in docs {
        let key = doc.get(&spec.by).cloned().unwrap_or(Value::Null);
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some((_, members)) => members.push(doc),
            None => groups.push((key, vec![doc])),
        }
    }

    groups
        .into_iter()
        .map(|(key, members)| {
            let mut out = Map::new();
            out.insert(spec.by.clone(), key);
            for acc in &spec.accumulators {
                let value = match &acc.op {
                    AccumulatorOp::Count => Value::from(members.len()),
                    AccumulatorOp::Sum(field) => number_value(
                        members
                            .iter()
                            .filter_map(|d| d.get(field).and_then(Value::as_f64))
                            .sum(),
                    ),
                    AccumulatorOp::Max(field) => members
                        .iter()
                        .filter_map(|d| d.get(field))
                        .filter(|v| sort_key(field, Some(v)) != SortKey::Missing)
                        .max_by(|a, b| cmp_keys(&sort_key(field, Some(a)), &sort_key(field, Some(b))))
                        .cloned()
                        .unwrap_or(Value::Null),
                };
                out.insert(acc.output.clone(), value);
            }
            Value::Object(out)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::components::ComponentRegistry;
    use crate::query::{AggregationRouter, IntentClassifier, QueryIntent};
    use serde_json::json;

    fn reports() -> Vec<Document> {
        vec![
            json!({"batchId": "B-1", "componentName": "Gear", "date": "2025-03-10T08:00:00Z", "actualProduction": 500, "ngParts": 4}),
            json!({"batchId": "B-2", "componentName": "Shaft", "date": "2025-03-11T08:00:00Z", "actualProduction": 800, "ngParts": 0}),
            json!({"batchId": "B-3", "componentName": "Gear", "date": "2025-03-12T08:00:00Z", "actualProduction": 300, "ngParts": 9}),
            json!({"batchId": "B-4", "componentName": "Shaft", "actualProduction": 100}),
        ]
    }

    fn routed(question: &str) -> Pipeline {
        let intent = IntentClassifier.classify(question);
        AggregationRouter.route(&intent, QueryConditions::new())
    }

    fn batch_ids(docs: &[Document]) -> Vec<&str> {
        docs.iter().filter_map(|d| d["batchId"].as_str()).collect()
    }

    #[test]
    fn test_missing_field_fails_comparisons() {
        let doc = json!({"batchId": "B-4"});
        assert!(!matches_predicate(doc.get("ngParts"), &Predicate::positive()));
        assert!(!matches_predicate(doc.get("ngParts"), &Predicate::NotNull));
        assert!(matches_predicate(doc.get("ngParts"), &Predicate::Exists(false)));
    }

    #[test]
    fn test_date_range_compares_instants() {
        let start = "2025-03-11T00:00:00Z".parse().unwrap();
        let end = "2025-03-11T23:59:59.999Z".parse().unwrap();
        let conditions = QueryConditions::new().with("date", Predicate::between(start, end));

        let matched: Vec<_> = reports()
            .into_iter()
            .filter(|d| matches_conditions(d, &conditions))
            .collect();
        assert_eq!(batch_ids(&matched), vec!["B-2"]);
    }

    #[test]
    fn test_case_insensitive_contains() {
        let conditions = QueryConditions::new().with("componentName", Predicate::contains_ci("gea"));
        let count = reports()
            .iter()
            .filter(|d| matches_conditions(d, &conditions))
            .count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_any_of_groups() {
        let mut conditions = QueryConditions::new();
        conditions.add_any_of(vec![
            ("actualProduction".to_string(), Predicate::at_least(600.0)),
            ("plannedQuantity".to_string(), Predicate::at_least(600.0)),
        ]);
        let matched: Vec<_> = reports()
            .into_iter()
            .filter(|d| matches_conditions(d, &conditions))
            .collect();
        assert_eq!(batch_ids(&matched), vec!["B-2"]);
    }

    #[test]
    fn test_ng_ranking_pipeline() {
        let docs = run_pipeline(reports(), &routed("most ng"));
        assert_eq!(batch_ids(&docs), vec!["B-3", "B-1"]);
    }

    #[test]
    fn test_recent_sorts_missing_dates_last() {
        let docs = run_pipeline(reports(), &routed("show me what you have"));
        assert_eq!(batch_ids(&docs), vec!["B-3", "B-2", "B-1", "B-4"]);
    }

    #[test]
    fn test_component_summary_pipeline() {
        let docs = run_pipeline(reports(), &routed("list components"));
        assert_eq!(
            docs,
            vec![
                json!({"componentName": "Shaft", "count": 2, "totalProduction": 900, "latestDate": "2025-03-11T08:00:00Z"}),
                json!({"componentName": "Gear", "count": 2, "totalProduction": 800, "latestDate": "2025-03-12T08:00:00Z"}),
            ]
        );
    }

    #[tokio::test]
    async fn test_sessions_are_counted_and_closed() {
        let store = MemoryStore::new().with_reports(reports());
        let mut session = store.connect().await.unwrap();

        let found = session
            .find_reports(&QueryConditions::new(), 2)
            .await
            .unwrap();
        assert_eq!(found.len(), 2);

        session.close().await.unwrap();
        assert_eq!(store.sessions_opened(), 1);
        assert_eq!(store.sessions_closed(), 1);
        assert!(session.ping().await.is_err());
    }

    #[tokio::test]
    async fn test_unreachable_store() {
        let store = MemoryStore::new();
        store.set_unreachable(true);
        let err = store.connect().await.err().unwrap();
        assert!(matches!(err, AppError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_fixture_partitions() {
        let store = MemoryStore::from_fixture_str(
            r#"{"components": {"ABC_1": [{"decision": 0}], "EMPTY_2": []}}"#,
        )
        .unwrap();
        let registry = ComponentRegistry::from_names(["ABC_1", "EMPTY_2"]).unwrap();
        let mut session = store.connect().await.unwrap();

        assert_eq!(session.list_partitions().await.unwrap(), vec!["ABC_1", "EMPTY_2"]);
        let partition = registry.resolve("abc_1").unwrap();
        assert_eq!(session.find_inspections(&partition, 20).await.unwrap().len(), 1);
        let empty = registry.resolve("EMPTY_2").unwrap();
        assert!(session.find_inspections(&empty, 20).await.unwrap().is_empty());

        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_demo_fixture_loads() {
        let store =
            MemoryStore::from_fixture_str(include_str!("../../../../config/fixtures/demo.json")).unwrap();
        let mut session = store.connect().await.unwrap();

        let all = session.find_reports(&QueryConditions::new(), 20).await.unwrap();
        assert_eq!(all.len(), 4);
        assert_eq!(session.load_defects().await.unwrap().len(), 5);
        assert_eq!(session.list_partitions().await.unwrap(), vec!["ABC_2", "GEAR_7"]);

        session.close().await.unwrap();
    }

    #[test]
    fn test_epoch_millis_dates_sort_with_strings() {
        let docs = vec![
            json!({"batchId": "B-1", "date": "2025-03-10T08:00:00Z"}),
            json!({"batchId": "B-2", "date": 1741680000000_i64}),
            json!({"batchId": "B-3", "date": {"$date": "2025-03-09T08:00:00Z"}}),
        ];
        let newest_first = AggregationRouter.route(&QueryIntent::default(), QueryConditions::new());
        let recent = run_pipeline(docs.clone(), &newest_first);
        assert_eq!(batch_ids(&recent), vec!["B-2", "B-1", "B-3"]);

        let range = QueryConditions::new().with(
            fields::DATE,
            Predicate::between(
                "2025-03-11T00:00:00Z".parse().unwrap(),
                "2025-03-11T23:59:59.999Z".parse().unwrap(),
            ),
        );
        let matched: Vec<_> = docs.iter().filter(|d| matches_conditions(d, &range)).collect();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0]["batchId"], json!("B-2"));
    }
}
