//! PostgreSQL backend
//!
//! Report and inspection documents live in JSONB columns. Conditions and
//! pipelines compile to parameterised SQL; field names and literals are
//! always bound, never spliced into the statement text.

use super::models::Document;
use super::{session_closed, ProductionStore, StoreSession};
use crate::catalog::DefectDefinition;
use crate::components::Partition;
use crate::config::DatabaseConfig;
use crate::errors::{AppError, Result};
use crate::query::{AccumulatorOp, GroupSpec, Pipeline, Predicate, QueryConditions, Scalar, SortOrder, Stage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Postgres;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Connection pool over the LineSight schema
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a pool from configuration
    pub async fn connect_pool(url: &str, config: &DatabaseConfig) -> Result<Self> {
        info!("Connecting to PostgreSQL...");

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(Duration::from_secs(config.connect_timeout_secs))
            .connect(url)
            .await
            .map_err(|e| AppError::Connection {
                message: format!("Failed to connect to PostgreSQL: {}", e),
            })?;

        info!("Database connection established");
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded schema migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl ProductionStore for PgStore {
    async fn connect(&self) -> Result<Box<dyn StoreSession>> {
        let conn = self.pool.acquire().await.map_err(|e| AppError::Connection {
            message: format!("Failed to acquire connection: {}", e),
        })?;
        Ok(Box::new(PgSession { conn: Some(conn) }))
    }

    fn backend(&self) -> &'static str {
        "postgres"
    }
}

/// Holds one pooled connection until closed or dropped
struct PgSession {
    conn: Option<PoolConnection<Postgres>>,
}

impl PgSession {
    fn conn(&mut self) -> Result<&mut PoolConnection<Postgres>> {
        self.conn.as_mut().ok_or_else(session_closed)
    }

    async fn fetch_documents(&mut self, statement: Statement) -> Result<Vec<Document>> {
        let start = Instant::now();
        debug!(sql = %statement.sql, params = statement.params.len(), "Executing document query");

        let mut query = sqlx::query_scalar::<_, Document>(&statement.sql);
        for param in statement.params {
            query = match param {
                SqlParam::Text(s) => query.bind(s),
                SqlParam::Number(n) => query.bind(n),
                SqlParam::Instant(at) => query.bind(at),
                SqlParam::Int(i) => query.bind(i),
            };
        }

        let docs = query.fetch_all(&mut **self.conn()?).await?;
        debug!(rows = docs.len(), elapsed_ms = start.elapsed().as_millis() as u64, "Document query finished");
        Ok(docs)
    }
}

#[derive(sqlx::FromRow)]
struct DefectRow {
    id: i32,
    class_name: String,
    description: Option<String>,
    is_acceptable: bool,
    defect_type: Option<String>,
}

impl From<DefectRow> for DefectDefinition {
    fn from(row: DefectRow) -> Self {
        Self {
            id: row.id.max(0) as u32,
            class_name: row.class_name,
            description: row.description.unwrap_or_default(),
            is_acceptable: row.is_acceptable,
            defect_type: row.defect_type.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl StoreSession for PgSession {
    async fn find_reports(&mut self, conditions: &QueryConditions, limit: usize) -> Result<Vec<Document>> {
        let mut statement = Statement::default();
        let predicate = statement.conditions(conditions);
        let limit = statement.bind(SqlParam::Int(limit as i64));
        statement.sql = format!(
            "SELECT doc FROM production_reports WHERE {predicate} ORDER BY id LIMIT {limit}"
        );
        self.fetch_documents(statement).await
    }

    async fn aggregate_reports(&mut self, pipeline: &Pipeline) -> Result<Vec<Document>> {
        self.fetch_documents(compile_pipeline(pipeline)).await
    }

    async fn load_defects(&mut self) -> Result<Vec<DefectDefinition>> {
        let rows = sqlx::query_as::<_, DefectRow>(
            "SELECT id, class_name, description, is_acceptable, defect_type FROM defect_definitions ORDER BY id",
        )
        .fetch_all(&mut **self.conn()?)
        .await?;
        Ok(rows.into_iter().map(DefectDefinition::from).collect())
    }

    async fn find_inspections(&mut self, partition: &Partition, limit: usize) -> Result<Vec<Document>> {
        let docs = sqlx::query_scalar::<_, Document>(
            "SELECT doc FROM component_inspections WHERE component = $1 ORDER BY id LIMIT $2",
        )
        .bind(partition.name())
        .bind(limit as i64)
        .fetch_all(&mut **self.conn()?)
        .await?;
        Ok(docs)
    }

    async fn list_partitions(&mut self) -> Result<Vec<String>> {
        let names = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT component FROM component_inspections ORDER BY component",
        )
        .fetch_all(&mut **self.conn()?)
        .await?;
        Ok(names)
    }

    async fn ping(&mut self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&mut **self.conn()?).await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        // Returning the connection to the pool is the release
        self.conn.take();
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SqlParam {
    Text(String),
    Number(f64),
    Instant(DateTime<Utc>),
    Int(i64),
}

/// SQL text plus its positional parameters
#[derive(Debug, Default)]
struct Statement {
    sql: String,
    params: Vec<SqlParam>,
}

impl Statement {
    /// Push a parameter and return its placeholder
    fn bind(&mut self, param: SqlParam) -> String {
        self.params.push(param);
        format!("${}", self.params.len())
    }

    fn text(&mut self, s: &str) -> String {
        self.bind(SqlParam::Text(s.to_string()))
    }

    fn conditions(&mut self, conditions: &QueryConditions) -> String {
        let mut clauses = Vec::new();

        for (field, predicate) in conditions.fields() {
            let f = self.text(field);
            clauses.push(self.predicate(&f, predicate));
        }

        for group in conditions.any_of() {
            let alternatives: Vec<String> = group
                .iter()
                .map(|(field, predicate)| {
                    let f = self.text(field);
                    self.predicate(&f, predicate)
                })
                .collect();
            clauses.push(format!("({})", alternatives.join(" OR ")));
        }

        if clauses.is_empty() {
            "TRUE".to_string()
        } else {
            clauses.join(" AND ")
        }
    }

    /// `f` is the placeholder holding the field name
    fn predicate(&mut self, f: &str, predicate: &Predicate) -> String {
        match predicate {
            Predicate::Equals(value) => self.comparison(f, "=", value),
            Predicate::Matches {
                pattern,
                case_insensitive,
            } => {
                let p = self.text(pattern);
                let op = if *case_insensitive { "~*" } else { "~" };
                format!("(doc->>{f} {op} {p})")
            }
            Predicate::Exists(true) => format!("(doc ? {f})"),
            Predicate::Exists(false) => format!("(NOT (doc ? {f}))"),
            Predicate::NotNull => format!("(doc ? {f} AND jsonb_typeof(doc->{f}) <> 'null')"),
            Predicate::Range { gt, gte, lt, lte } => {
                let bounds: Vec<String> = [(">", gt), (">=", gte), ("<", lt), ("<=", lte)]
                    .into_iter()
                    .filter_map(|(op, bound)| bound.as_ref().map(|b| (op, b)))
                    .map(|(op, bound)| self.comparison(f, op, bound))
                    .collect();
                match bounds.len() {
                    0 => "TRUE".to_string(),
                    1 => bounds.concat(),
                    _ => format!("({})", bounds.join(" AND ")),
                }
            }
            Predicate::All(parts) => {
                let parts: Vec<String> = parts.iter().map(|p| self.predicate(f, p)).collect();
                if parts.is_empty() {
                    "TRUE".to_string()
                } else {
                    format!("({})", parts.join(" AND "))
                }
            }
        }
    }

    fn comparison(&mut self, f: &str, op: &str, value: &Scalar) -> String {
        match value {
            Scalar::Text(s) => {
                let v = self.text(s);
                format!("(doc->>{f} {op} {v})")
            }
            Scalar::Number(n) => {
                let v = self.bind(SqlParam::Number(*n));
                format!("({} {op} {v})", numeric(f))
            }
            Scalar::Instant(at) => {
                let v = self.bind(SqlParam::Instant(*at));
                format!("({} {op} {v})", instant(f))
            }
        }
    }
}

/// A field as double precision, NULL unless it holds a JSON number
fn numeric(f: &str) -> String {
    format!("(CASE WHEN jsonb_typeof(doc->{f}) = 'number' THEN (doc->>{f})::double precision END)")
}

/// A field as timestamptz across the stored date encodings. Unparseable
/// values read as NULL (see the `linesight_try_*` migration helpers).
fn instant(f: &str) -> String {
    format!(
        "(CASE jsonb_typeof(doc->{f}) \
         WHEN 'string' THEN linesight_try_timestamptz(doc->>{f}) \
         WHEN 'number' THEN linesight_try_epoch_millis(doc->>{f}) \
         WHEN 'object' THEN (CASE jsonb_typeof(doc->{f}->'$date') \
             WHEN 'string' THEN linesight_try_timestamptz(doc->{f}->>'$date') \
             WHEN 'number' THEN linesight_try_epoch_millis(doc->{f}->>'$date') \
             WHEN 'object' THEN linesight_try_epoch_millis(doc->{f}->'$date'->>'$numberLong') \
             END) \
         END)"
    )
}

fn compile_pipeline(pipeline: &Pipeline) -> Statement {
    let mut statement = Statement::default();
    let mut sql = "SELECT doc FROM production_reports".to_string();
    let mut stages = pipeline.stages().iter().enumerate().peekable();

    while let Some((i, stage)) = stages.next() {
        sql = match stage {
            Stage::Match(conditions) => {
                let predicate = statement.conditions(conditions);
                format!("SELECT doc FROM ({sql}) AS s{i} WHERE {predicate}")
            }
            Stage::Group(spec) => compile_group(&mut statement, &sql, i, spec),
            Stage::Sort { field, order } => {
                let f = statement.text(field);
                let direction = match order {
                    SortOrder::Asc => "ASC NULLS FIRST",
                    SortOrder::Desc => "DESC NULLS LAST",
                };
                let mut sorted = format!("SELECT doc FROM ({sql}) AS s{i} ORDER BY doc->{f} {direction}");
                if let Some((_, Stage::Limit(n))) = stages.peek() {
                    let limit = statement.bind(SqlParam::Int(*n as i64));
                    sorted.push_str(&format!(" LIMIT {limit}"));
                    stages.next();
                }
                sorted
            }
            Stage::Limit(n) => {
                let limit = statement.bind(SqlParam::Int(*n as i64));
                format!("SELECT doc FROM ({sql}) AS s{i} LIMIT {limit}")
            }
        };
    }

    statement.sql = sql;
    statement
}

fn compile_group(statement: &mut Statement, inner: &str, i: usize, spec: &GroupSpec) -> String {
    let key = statement.text(&spec.by);
    let mut pairs = vec![format!("{key}::text, gkey")];

    for acc in &spec.accumulators {
        let output = statement.text(&acc.output);
        let expr = match &acc.op {
            AccumulatorOp::Count => "count(*)".to_string(),
            AccumulatorOp::Sum(field) => {
                let f = statement.text(field);
                format!("coalesce(sum({}), 0)", numeric(&f))
            }
            AccumulatorOp::Max(field) => {
                let f = statement.text(field);
                format!("max(doc->>{f})")
            }
        };
        pairs.push(format!("{output}::text, {expr}"));
    }

    format!(
        "SELECT jsonb_build_object({}) AS doc FROM (SELECT doc->{key} AS gkey, doc FROM ({inner}) AS s{i}) AS g{i} GROUP BY gkey",
        pairs.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{AggregationRouter, IntentClassifier};

    fn pipeline(question: &str) -> Pipeline {
        let intent = IntentClassifier.classify(question);
        AggregationRouter.route(&intent, QueryConditions::new())
    }

    #[test]
    fn test_ng_ranking_sql() {
        let statement = compile_pipeline(&pipeline("show batches with most ng parts"));

        assert_eq!(
            statement.sql,
            "SELECT doc FROM (SELECT doc FROM (SELECT doc FROM production_reports) AS s0 \
             WHERE ((doc ? $1) AND ((CASE WHEN jsonb_typeof(doc->$1) = 'number' \
             THEN (doc->>$1)::double precision END) > $2))) AS s1 \
             ORDER BY doc->$3 DESC NULLS LAST LIMIT $4"
        );
        assert_eq!(
            statement.params,
            vec![
                SqlParam::Text("ngParts".to_string()),
                SqlParam::Number(0.0),
                SqlParam::Text("ngParts".to_string()),
                SqlParam::Int(10),
            ]
        );
    }

    #[test]
    fn test_group_binds_every_name() {
        let statement = compile_pipeline(&pipeline("list components"));

        assert!(statement.sql.contains("GROUP BY gkey"));
        assert!(statement.sql.contains("jsonb_build_object($1::text, gkey, $2::text, count(*)"));
        assert!(!statement.sql.contains("componentName"));
        assert_eq!(statement.params[0], SqlParam::Text("componentName".to_string()));
        assert_eq!(statement.params.len(), 7);
    }

    #[test]
    fn test_field_names_are_never_spliced() {
        let mut statement = Statement::default();
        let conditions = QueryConditions::new()
            .with("batchId'; DROP TABLE x; --", Predicate::contains_ci("B1"));
        let sql = statement.conditions(&conditions);

        assert_eq!(sql, "(doc->>$1 ~* $2)");
        assert!(!sql.contains("DROP"));
    }

    #[test]
    fn test_any_of_and_empty_conditions() {
        let mut statement = Statement::default();
        assert_eq!(statement.conditions(&QueryConditions::new()), "TRUE");

        let mut conditions = QueryConditions::new();
        conditions.add_any_of(vec![
            ("performance".to_string(), Predicate::NotNull),
            ("quality".to_string(), Predicate::NotNull),
        ]);
        let sql = statement.conditions(&conditions);
        assert_eq!(
            sql,
            "((doc ? $1 AND jsonb_typeof(doc->$1) <> 'null') OR (doc ? $2 AND jsonb_typeof(doc->$2) <> 'null'))"
        );
    }

    #[test]
    fn test_date_range_never_casts_raw_text() {
        let mut statement = Statement::default();
        let conditions = QueryConditions::new().with(
            "date",
            Predicate::between(
                "2025-03-11T00:00:00Z".parse().unwrap(),
                "2025-03-11T23:59:59.999Z".parse().unwrap(),
            ),
        );
        let sql = statement.conditions(&conditions);

        assert!(sql.contains("WHEN 'number' THEN linesight_try_epoch_millis(doc->>$1)"));
        assert!(sql.contains("WHEN 'string' THEN linesight_try_timestamptz(doc->>$1)"));
        assert!(sql.contains("linesight_try_epoch_millis(doc->$1->'$date'->>'$numberLong')"));
        assert!(!sql.contains("::timestamptz"));
        assert!(!sql.contains("::double precision / 1000"));
        assert_eq!(statement.params.len(), 3);
    }

    #[test]
    fn test_date_helpers_are_migrated() {
        let migration = include_str!("../../migrations/20250315000000_instant_helpers.sql");
        assert!(migration.contains("FUNCTION linesight_try_timestamptz(raw TEXT)"));
        assert!(migration.contains("FUNCTION linesight_try_epoch_millis(raw TEXT)"));
        assert_eq!(migration.matches("EXCEPTION WHEN others THEN").count(), 2);
    }
}

