//! LineSight Common Library
//!
//! Shared code for the LineSight services including:
//! - The question-to-query pipeline (intent, entities, conditions, dates, pipelines)
//! - Defect catalog enrichment and component inspection partitions
//! - Storage backends (PostgreSQL JSONB and in-memory)
//! - Language-model facade and the outward `answer` entry point
//! - Error types, configuration, and metrics

pub mod assistant;
pub mod catalog;
pub mod components;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod format;
pub mod llm;
pub mod metrics;
pub mod query;

// Re-export commonly used types
pub use assistant::Assistant;
pub use config::AppConfig;
pub use engine::{EngineOutcome, QueryEngine};
pub use errors::{AppError, Result};

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returned whenever a query path produces no records.
pub const NO_RESULTS_MESSAGE: &str = "No production reports found matching your query.";
