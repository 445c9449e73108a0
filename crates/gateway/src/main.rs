//! LineSight HTTP Gateway
//!
//! Exposes the question entry point over JSON.
//! Handles:
//! - Startup validation and store connection
//! - Request routing
//! - Observability (logging, metrics, request ids)

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use linesight_common::{
    components::ComponentRegistry,
    config::AppConfig,
    db::{self, ProductionStore},
    llm::ChatCompletionsClient,
    metrics, Assistant, QueryEngine,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub assistant: Arc<Assistant>,
    pub store: Arc<dyn ProductionStore>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // APP_CONFIG_FILE replaces the layered config/ lookup with one file
    let config = match std::env::var("APP_CONFIG_FILE") {
        Ok(path) => AppConfig::from_file(&path)?,
        Err(_) => AppConfig::load()?,
    };
    init_tracing(&config);

    info!("Starting LineSight gateway v{}", linesight_common::VERSION);

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e.into());
    }
    let config = Arc::new(config);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new().with_http_listener(addr).install()?;
        info!(%addr, "Prometheus exporter listening");
    }
    metrics::register_metrics();

    info!(backend = ?config.database.backend, "Connecting to store...");
    let store = db::connect_store(&config.database).await?;

    let mut registry = ComponentRegistry::from_names(&config.components.known)?;
    if config.components.discover {
        let mut session = store.connect().await?;
        let discovered = session.list_partitions().await;
        if let Err(e) = session.close().await {
            warn!(error = %e, "Failed to close discovery session");
        }
        registry.extend_discovered(discovered?);
    }
    info!(components = registry.len(), "Component registry ready");

    let engine = QueryEngine::from_config(store.clone(), Arc::new(registry), &config.query)?;
    let model = ChatCompletionsClient::new(&config.llm)?;
    let assistant = Assistant::new(engine, Arc::new(model));

    let state = AppState {
        config: config.clone(),
        assistant: Arc::new(assistant),
        store,
    };

    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Requests running past server.request_timeout_secs get a 408
    let timeout = TimeoutLayer::new(state.config.request_timeout());

    let api_routes = Router::new().route("/ask", post(handlers::ask::ask));

    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(timeout)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(request_id)
        .layer(propagate_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::{memory_store, state};
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use serde_json::{json, Value};
    use tower::ServiceExt;

    async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    fn ask(body: Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/ask")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn test_ask_route() {
        let app = create_router(state(memory_store()));
        let (status, body) = send(app, ask(json!({"question": "which batch had the most ng parts"}))).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], "Batch B-7 had the most NG parts.");
        assert!(body["processing_time_ms"].is_u64());
    }

    #[tokio::test]
    async fn test_empty_question_is_rejected() {
        let app = create_router(state(memory_store()));
        let (status, body) = send(app, ask(json!({"question": ""}))).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["code"], "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_health_route() {
        let app = create_router(state(memory_store()));
        let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let (status, body) = send(app, request).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
    }

    struct SlowModel;

    #[async_trait::async_trait]
    impl linesight_common::llm::LanguageModel for SlowModel {
        async fn complete(&self, _prompt: &str) -> linesight_common::Result<String> {
            tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            Ok("too late".to_string())
        }

        fn model_name(&self) -> &str {
            "slow"
        }
    }

    #[tokio::test]
    async fn test_slow_question_times_out() {
        let mut config = AppConfig::default();
        config.server.request_timeout_secs = 1;

        let mut app_state = state(memory_store());
        let registry = ComponentRegistry::from_names(Vec::<String>::new()).unwrap();
        let engine = QueryEngine::new(app_state.store.clone(), Arc::new(registry));
        app_state.assistant = Arc::new(Assistant::new(engine, Arc::new(SlowModel)));
        app_state.config = Arc::new(config);

        let response = create_router(app_state)
            .oneshot(ask(json!({"question": "which batch had the most ng parts"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
    }
}
