//! Query engine
//!
//! Sequences one question through the pipeline:
//! classify → delimited component (short-circuit) → conditions or pipeline
//! → store → defect enrichment → format.
//!
//! Exactly one store session is acquired per question and it is closed on
//! every exit path, including failures inside the body.

use crate::catalog::{CatalogProvider, StoreCatalog};
use crate::components::{empty_partition_message, normalize_inspections, ComponentRegistry, Partition};
use crate::config::QueryConfig;
use crate::db::{ProductionStore, StoreSession};
use crate::errors::Result;
use crate::format::{self, QueryPayload, ResultFormatter};
use crate::metrics;
use crate::query::{
    AggregationRouter, ConditionBuilder, DateRangeResolver, IntentClassifier, QueryIntent,
};
use crate::NO_RESULTS_MESSAGE;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

const COMPONENT_ROUTE: &str = "component";
const FIND_ROUTE: &str = "find";

/// What a question produced
#[derive(Debug, Clone, PartialEq)]
pub enum EngineOutcome {
    /// Records to be summarised by the language model
    Records(QueryPayload),
    /// A final answer that needs no model call
    Message(String),
}

impl EngineOutcome {
    fn label(&self) -> &'static str {
        match self {
            Self::Records(_) => "records",
            Self::Message(_) => "message",
        }
    }
}

/// Engine behaviour switches
#[derive(Debug, Clone, Copy)]
pub struct EngineFeatures {
    /// Route delimited component names to their inspection partition.
    /// When off, the engine behaves as the generic-only pipeline.
    pub component_routing: bool,
    pub find_limit: usize,
    pub partition_limit: usize,
}

impl Default for EngineFeatures {
    fn default() -> Self {
        Self {
            component_routing: true,
            find_limit: 20,
            partition_limit: 20,
        }
    }
}

pub struct QueryEngine {
    store: Arc<dyn ProductionStore>,
    catalog: Arc<dyn CatalogProvider>,
    registry: Arc<ComponentRegistry>,
    classifier: IntentClassifier,
    builder: ConditionBuilder,
    router: AggregationRouter,
    features: EngineFeatures,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn ProductionStore>, registry: Arc<ComponentRegistry>) -> Self {
        Self {
            store,
            catalog: Arc::new(StoreCatalog),
            registry,
            classifier: IntentClassifier,
            builder: ConditionBuilder::default(),
            router: AggregationRouter,
            features: EngineFeatures::default(),
        }
    }

    /// Build from the `query` configuration section
    pub fn from_config(
        store: Arc<dyn ProductionStore>,
        registry: Arc<ComponentRegistry>,
        config: &QueryConfig,
    ) -> Result<Self> {
        let resolver = DateRangeResolver::new(config.utc_offset()?, config.week_start_day()?);
        Ok(Self::new(store, registry)
            .with_resolver(resolver)
            .with_features(EngineFeatures {
                component_routing: config.component_routing,
                find_limit: config.find_limit,
                partition_limit: config.partition_limit,
            }))
    }

    pub fn with_catalog(mut self, catalog: Arc<dyn CatalogProvider>) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn with_resolver(mut self, resolver: DateRangeResolver) -> Self {
        self.builder = ConditionBuilder::new(resolver);
        self
    }

    pub fn with_features(mut self, features: EngineFeatures) -> Self {
        self.features = features;
        self
    }

    pub fn store(&self) -> &Arc<dyn ProductionStore> {
        &self.store
    }

    pub async fn run(&self, question: &str) -> Result<EngineOutcome> {
        self.run_at(question, Utc::now()).await
    }

    /// Run against an explicit "now" for relative dates
    pub async fn run_at(&self, question: &str, now: DateTime<Utc>) -> Result<EngineOutcome> {
        let start = Instant::now();
        let intent = self.classifier.classify(question);
        debug!(flags = ?intent.flags(), component = ?intent.component_name, "Question classified");

        // Unregistered or malformed names are rejected before any store access
        let partition = match (&intent.component_name, self.features.component_routing) {
            (Some(name), true) => Some(self.registry.resolve(name)?),
            _ => None,
        };

        let mut session = self.store.connect().await?;
        let result = match &partition {
            Some(partition) => self.inspect(session.as_mut(), question, &intent, partition).await,
            None => self.query_reports(session.as_mut(), question, &intent, now).await,
        };
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close store session");
        }

        let route = match &result {
            Ok((route, _)) => *route,
            Err(_) => "error",
        };
        let outcome = result.map(|(_, outcome)| outcome);
        let label = outcome.as_ref().map_or("error", EngineOutcome::label);
        metrics::record_question(start.elapsed().as_secs_f64(), route, label);
        info!(route, outcome = label, elapsed_ms = start.elapsed().as_millis() as u64, "Question processed");

        outcome
    }

    async fn inspect(
        &self,
        session: &mut dyn StoreSession,
        question: &str,
        intent: &QueryIntent,
        partition: &Partition,
    ) -> Result<(&'static str, EngineOutcome)> {
        let timer = Instant::now();
        let docs = session
            .find_inspections(partition, self.features.partition_limit)
            .await?;
        metrics::record_store_query(timer.elapsed().as_secs_f64(), "find_inspections");

        if docs.is_empty() {
            return Ok((COMPONENT_ROUTE, EngineOutcome::Message(empty_partition_message(partition))));
        }

        let catalog = self.catalog.refresh(session).await?;
        let records = normalize_inspections(&docs, &catalog);
        debug!(component = partition.name(), records = records.len(), "Inspection records normalized");

        let payload = QueryPayload::inspections(question, intent.clone(), partition.name(), records);
        Ok((COMPONENT_ROUTE, EngineOutcome::Records(payload)))
    }

    async fn query_reports(
        &self,
        session: &mut dyn StoreSession,
        question: &str,
        intent: &QueryIntent,
        now: DateTime<Utc>,
    ) -> Result<(&'static str, EngineOutcome)> {
        let conditions = self.builder.build(question, intent, now);
        let timer = Instant::now();

        if !intent.wants_pipeline() {
            let query = conditions.to_document();
            debug!(%query, "Finding reports");
            let docs = session.find_reports(&conditions, self.features.find_limit).await?;
            metrics::record_store_query(timer.elapsed().as_secs_f64(), "find_reports");

            if docs.is_empty() {
                return Ok((FIND_ROUTE, EngineOutcome::Message(NO_RESULTS_MESSAGE.to_string())));
            }
            let catalog = self.catalog.refresh(session).await?;
            let reports = ResultFormatter::new(&catalog).reports(&docs);
            if reports.is_empty() {
                return Ok((FIND_ROUTE, EngineOutcome::Message(NO_RESULTS_MESSAGE.to_string())));
            }
            let payload = QueryPayload::reports(question, intent.clone(), FIND_ROUTE, query, reports);
            return Ok((FIND_ROUTE, EngineOutcome::Records(payload)));
        }

        let pipeline = self.router.route(intent, conditions);
        let route = pipeline.shape().as_str();
        let query = pipeline.to_document();
        debug!(route, %query, "Aggregating reports");

        let docs = session.aggregate_reports(&pipeline).await?;
        metrics::record_store_query(timer.elapsed().as_secs_f64(), "aggregate_reports");

        if docs.is_empty() {
            return Ok((route, EngineOutcome::Message(NO_RESULTS_MESSAGE.to_string())));
        }

        let payload = if pipeline.is_grouped() {
            let rows = format::summaries(&docs);
            (!rows.is_empty()).then(|| QueryPayload::summaries(question, intent.clone(), route, query, rows))
        } else {
            let catalog = self.catalog.refresh(session).await?;
            let reports = ResultFormatter::new(&catalog).reports(&docs);
            (!reports.is_empty()).then(|| QueryPayload::reports(question, intent.clone(), route, query, reports))
        };

        // Projection may drop every document
        let outcome = match payload {
            Some(payload) => EngineOutcome::Records(payload),
            None => EngineOutcome::Message(NO_RESULTS_MESSAGE.to_string()),
        };
        Ok((route, outcome))
    }
}
