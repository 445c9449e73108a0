//! Question-to-query translation
//!
//! Pure functions of the question text (and a supplied "now"):
//! - `intent`: independent boolean flags over fixed vocabularies
//! - `entities`: batch ids, component names, dates, thresholds
//! - `dates`: relative and absolute date expressions to instant ranges
//! - `conditions`: the predicate model and the condition builder
//! - `pipeline`: aggregation stages and the shape router

pub mod conditions;
pub mod dates;
pub mod entities;
pub mod intent;
pub mod pipeline;

pub use conditions::{ConditionBuilder, Predicate, QueryConditions, Scalar};
pub use dates::{DateExpression, DateRange, DateRangeResolver, RelativePeriod};
pub use entities::{extract_component_name, EntityExtractor, ExtractedEntities};
pub use intent::{IntentClassifier, IntentFlag, QueryIntent};
pub use pipeline::{
    Accumulator, AccumulatorOp, AggregationRouter, GroupSpec, Pipeline, PipelineShape, SortOrder,
    Stage,
};
