//! Storage layer for LineSight
//!
//! Provides:
//! - The `ProductionStore` / `StoreSession` seam used by the query engine
//! - A PostgreSQL JSONB backend built on sqlx
//! - An in-memory backend loaded from JSON fixtures
//! - Document models shared by both

pub mod memory;
pub mod models;
pub mod postgres;

pub use memory::MemoryStore;
pub use models::{fields, Document};
pub use postgres::PgStore;

use crate::catalog::DefectDefinition;
use crate::components::Partition;
use crate::config::{DatabaseConfig, StoreBackend};
use crate::errors::{AppError, Result};
use crate::query::{Pipeline, QueryConditions};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

/// A store that hands out one scoped session per question
#[async_trait]
pub trait ProductionStore: Send + Sync {
    /// Acquire a session. Fails with `AppError::Connection` when unreachable.
    async fn connect(&self) -> Result<Box<dyn StoreSession>>;

    /// Backend name for logs and metrics
    fn backend(&self) -> &'static str;
}

/// One acquired connection
///
/// `close` must be called on every exit path; the engine does so after the
/// question body regardless of its outcome. Operations after `close` fail.
#[async_trait]
pub trait StoreSession: Send {
    /// Report documents matching the conditions, in storage order
    async fn find_reports(&mut self, conditions: &QueryConditions, limit: usize) -> Result<Vec<Document>>;

    /// Run a pipeline over the report documents
    async fn aggregate_reports(&mut self, pipeline: &Pipeline) -> Result<Vec<Document>>;

    /// The full defect catalog
    async fn load_defects(&mut self) -> Result<Vec<DefectDefinition>>;

    /// Inspection documents of one registered partition
    async fn find_inspections(&mut self, partition: &Partition, limit: usize) -> Result<Vec<Document>>;

    /// Names of the partitions the store knows about
    async fn list_partitions(&mut self) -> Result<Vec<String>>;

    async fn ping(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Build the configured store backend
pub async fn connect_store(config: &DatabaseConfig) -> Result<Arc<dyn ProductionStore>> {
    match config.backend {
        StoreBackend::Postgres => {
            let url = config.url.as_deref().ok_or_else(|| AppError::Configuration {
                message: "database.url is required for the postgres backend".to_string(),
            })?;
            let store = PgStore::connect_pool(url, config).await?;
            if config.run_migrations {
                store.migrate().await?;
            }
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            let path = config.fixtures_path.as_deref().ok_or_else(|| AppError::Configuration {
                message: "database.fixtures_path is required for the memory backend".to_string(),
            })?;
            let store = MemoryStore::from_fixture_file(path)?;
            info!(path = %path, "Loaded in-memory store fixtures");
            Ok(Arc::new(store))
        }
    }
}

fn session_closed() -> AppError {
    AppError::Store {
        message: "store session is already closed".to_string(),
    }
}
