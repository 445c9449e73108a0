//! Aggregation pipelines
//!
//! A pipeline is an ordered list of match/group/sort/limit stages. The
//! router picks exactly one of four fixed shapes from the classified intent.

use super::conditions::{Predicate, QueryConditions};
use super::intent::QueryIntent;
use crate::db::models::fields;
use serde_json::{json, Map, Value};

const NG_RANKING_LIMIT: usize = 10;
const TOP_PRODUCTION_LIMIT: usize = 10;
const RECENT_LIMIT: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Asc,
    Desc,
}

impl SortOrder {
    fn as_document(&self) -> Value {
        match self {
            Self::Asc => json!(1),
            Self::Desc => json!(-1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccumulatorOp {
    Count,
    Sum(String),
    Max(String),
}

/// One computed output field of a group stage
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accumulator {
    pub output: String,
    pub op: AccumulatorOp,
}

impl Accumulator {
    fn new(output: &str, op: AccumulatorOp) -> Self {
        Self {
            output: output.to_string(),
            op,
        }
    }
}

/// Group documents by one field. Output documents carry the key under
/// the same field name, followed by each accumulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSpec {
    pub by: String,
    pub accumulators: Vec<Accumulator>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    Match(QueryConditions),
    Group(GroupSpec),
    Sort { field: String, order: SortOrder },
    Limit(usize),
}

impl Stage {
    fn sort_desc(field: &str) -> Self {
        Self::Sort {
            field: field.to_string(),
            order: SortOrder::Desc,
        }
    }

    pub fn to_document(&self) -> Value {
        match self {
            Self::Match(conditions) => json!({ "$match": conditions.to_document() }),
            Self::Group(spec) => {
                let mut group = Map::new();
                group.insert("_id".to_string(), json!(format!("${}", spec.by)));
                for acc in &spec.accumulators {
                    let expr = match &acc.op {
                        AccumulatorOp::Count => json!({ "$sum": 1 }),
                        AccumulatorOp::Sum(field) => json!({ "$sum": format!("${field}") }),
                        AccumulatorOp::Max(field) => json!({ "$max": format!("${field}") }),
                    };
                    group.insert(acc.output.clone(), expr);
                }
                json!({ "$group": group })
            }
            Self::Sort { field, order } => json!({ "$sort": { field: order.as_document() } }),
            Self::Limit(n) => json!({ "$limit": n }),
        }
    }
}

/// The four fixed pipeline shapes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineShape {
    NgRanking,
    ComponentSummary,
    TopProduction,
    Recent,
}

impl PipelineShape {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NgRanking => "ng_ranking",
            Self::ComponentSummary => "component_summary",
            Self::TopProduction => "top_production",
            Self::Recent => "recent",
        }
    }
}

/// An immutable, routed pipeline
#[derive(Debug, Clone, PartialEq)]
pub struct Pipeline {
    shape: PipelineShape,
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn shape(&self) -> PipelineShape {
        self.shape
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Whether output documents are component summaries rather than reports
    pub fn is_grouped(&self) -> bool {
        self.stages.iter().any(|s| matches!(s, Stage::Group(_)))
    }

    pub fn to_document(&self) -> Value {
        Value::Array(self.stages.iter().map(Stage::to_document).collect())
    }
}

/// Chooses a pipeline shape by priority: NG, component list, aggregation, default
#[derive(Debug, Clone, Copy, Default)]
pub struct AggregationRouter;

impl AggregationRouter {
    /// Non-empty conditions narrow the chosen shape: they merge into the NG
    /// match stage, or become a leading match stage for the other shapes.
    pub fn route(&self, intent: &QueryIntent, conditions: QueryConditions) -> Pipeline {
        if intent.is_ng_query {
            let matched = conditions.with(fields::NG_PARTS, Predicate::positive());
            return Pipeline {
                shape: PipelineShape::NgRanking,
                stages: vec![
                    Stage::Match(matched),
                    Stage::sort_desc(fields::NG_PARTS),
                    Stage::Limit(NG_RANKING_LIMIT),
                ],
            };
        }

        let mut stages = Vec::new();
        if !conditions.is_empty() {
            stages.push(Stage::Match(conditions));
        }

        let shape = if intent.is_component_list {
            stages.push(Stage::Group(GroupSpec {
                by: fields::COMPONENT_NAME.to_string(),
                accumulators: vec![
                    Accumulator::new(fields::COUNT, AccumulatorOp::Count),
                    Accumulator::new(
                        fields::TOTAL_PRODUCTION,
                        AccumulatorOp::Sum(fields::ACTUAL_PRODUCTION.to_string()),
                    ),
                    Accumulator::new(
                        fields::LATEST_DATE,
                        AccumulatorOp::Max(fields::DATE.to_string()),
                    ),
                ],
            }));
            stages.push(Stage::sort_desc(fields::TOTAL_PRODUCTION));
            PipelineShape::ComponentSummary
        } else if intent.needs_aggregation {
            stages.push(Stage::sort_desc(fields::ACTUAL_PRODUCTION));
            stages.push(Stage::Limit(TOP_PRODUCTION_LIMIT));
            PipelineShape::TopProduction
        } else {
            stages.push(Stage::sort_desc(fields::DATE));
            stages.push(Stage::Limit(RECENT_LIMIT));
            PipelineShape::Recent
        };

        Pipeline { shape, stages }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::conditions::{ConditionBuilder, Scalar};
    use crate::query::intent::IntentClassifier;
    use chrono::{TimeZone, Utc};

    fn route(question: &str) -> Pipeline {
        let intent = IntentClassifier.classify(question);
        let now = Utc.with_ymd_and_hms(2025, 3, 12, 15, 30, 0).unwrap();
        let conditions = ConditionBuilder::default().build(question, &intent, now);
        AggregationRouter.route(&intent, conditions)
    }

    #[test]
    fn test_most_ng_parts_ranks_ng() {
        let pipeline = route("show batches with most ng parts");

        assert_eq!(pipeline.shape(), PipelineShape::NgRanking);
        assert_eq!(
            pipeline.to_document(),
            json!([
                {"$match": {"ngParts": {"$exists": true, "$gt": 0}}},
                {"$sort": {"ngParts": -1}},
                {"$limit": 10}
            ])
        );
    }

    #[test]
    fn test_component_summary() {
        let pipeline = route("what components were produced");

        assert_eq!(pipeline.shape(), PipelineShape::ComponentSummary);
        assert!(pipeline.is_grouped());
        assert_eq!(
            pipeline.to_document(),
            json!([
                {"$group": {
                    "_id": "$componentName",
                    "count": {"$sum": 1},
                    "totalProduction": {"$sum": "$actualProduction"},
                    "latestDate": {"$max": "$date"}
                }},
                {"$sort": {"totalProduction": -1}}
            ])
        );
    }

    #[test]
    fn test_top_production() {
        let pipeline = route("highest output");
        assert_eq!(
            pipeline.to_document(),
            json!([{"$sort": {"actualProduction": -1}}, {"$limit": 10}])
        );
    }

    #[test]
    fn test_general_defaults_to_recent() {
        let pipeline = route("what data do you have");
        assert_eq!(pipeline.shape(), PipelineShape::Recent);
        assert_eq!(
            pipeline.to_document(),
            json!([{"$sort": {"date": -1}}, {"$limit": 20}])
        );
    }

    #[test]
    fn test_conditions_narrow_the_shape() {
        let pipeline = route("total production of lot B17");

        assert_eq!(pipeline.shape(), PipelineShape::TopProduction);
        match &pipeline.stages()[0] {
            Stage::Match(conditions) => {
                assert_eq!(conditions.get(fields::BATCH_ID), Some(&Predicate::contains_ci("B17")));
            }
            other => panic!("expected a match stage, got {other:?}"),
        }
        assert_eq!(pipeline.stages().len(), 3);
    }

    #[test]
    fn test_ng_match_merges_conditions() {
        let intent = IntentClassifier.classify("rejects");
        let conditions = QueryConditions::new()
            .with(fields::BATCH_ID, Predicate::Equals(Scalar::Text("B-1".to_string())));
        let pipeline = AggregationRouter.route(&intent, conditions);

        assert_eq!(
            pipeline.stages()[0].to_document(),
            json!({"$match": {"batchId": "B-1", "ngParts": {"$exists": true, "$gt": 0}}})
        );
    }
}
