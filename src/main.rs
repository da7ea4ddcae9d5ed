use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::oneshot;
use tracing::{info, warn};

mod config;
mod cors;
mod handlers;
mod routes;

use config::Config;
use cors::CorsPolicy;
use handlers::AppContext;
use revlens_core::error::{AppError, AppResult};
use revlens_core::{create_pool, run_migrations};
use revlens_services::services::extractor::{
    HttpExtractor, StatementExtractor, SubprocessExtractor,
};
use revlens_services::services::llm::{OpenAiClassifier, ReviewClassifier};
use revlens_services::services::orchestrator::AnalysisOrchestrator;
use revlens_services::services::registry::SessionRegistry;

/// Grace period for in-flight requests on shutdown
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> AppResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Starting revlens backend v{}", env!("CARGO_PKG_VERSION"));

    // the liveness endpoint reports uptime from this instant
    once_cell::sync::Lazy::force(&handlers::STARTED_AT);

    let config = Config::from_env().map_err(|e| {
        let error = AppError::ConfigError(format!("Failed to load configuration: {}", e));
        error.log_with_context("Startup configuration");
        error
    })?;

    info!("Configuration loaded:");
    info!("  - server: {}:{}", config.server.host, config.server.port);
    info!("  - CORS origins: {:?}", config.cors.allowed_origins);
    info!(
        "  - extractor: {}",
        match (&config.extractor.binary_path, &config.extractor.url) {
            (Some(path), _) => format!("subprocess ({})", path.display()),
            (None, Some(url)) => format!("http ({})", url),
            (None, None) => "unconfigured".to_string(),
        }
    );
    info!(
        "  - LLM classifier: {}",
        if config.llm.api_key.is_some() {
            "configured"
        } else {
            "disabled (ambiguous transactions will fail the session)"
        }
    );

    let pool = create_pool(&config.database_url).await.map_err(|e| {
        e.log_with_context("Startup database pool");
        e
    })?;

    run_migrations(&config.database_url).await.map_err(|e| {
        e.log_with_context("Startup migrations");
        e
    })?;

    let http_client = reqwest::Client::new();

    let extractor: Arc<dyn StatementExtractor> = match (
        config.extractor.binary_path.clone(),
        config.extractor.url.clone(),
    ) {
        (Some(path), _) => Arc::new(SubprocessExtractor::new(path)),
        (None, Some(url)) => Arc::new(HttpExtractor::new(http_client.clone(), url)),
        (None, None) => unreachable!("validated by Config::from_env"),
    };

    let reviewer: Option<Arc<dyn ReviewClassifier>> = config.llm.api_key.clone().map(|key| {
        let mut classifier = OpenAiClassifier::new(http_client.clone(), key)
            .with_timeout(Duration::from_millis(config.llm.timeout_ms))
            .with_max_retries(config.llm.max_retries);
        if let Some(base_url) = config.llm.base_url.clone() {
            classifier = classifier.with_base_url(base_url);
        }
        if let Some(model) = config.llm.model.clone() {
            classifier = classifier.with_model(model);
        }
        Arc::new(classifier) as Arc<dyn ReviewClassifier>
    });

    let registry = SessionRegistry::new();
    let orchestrator = Arc::new(AnalysisOrchestrator::new(
        pool.clone(),
        Arc::clone(&registry),
        Arc::clone(&extractor),
        reviewer.clone(),
    ));

    let ctx = AppContext {
        pool,
        registry,
        orchestrator,
        reviewer,
        max_file_size: config.limits.max_file_size,
    };

    let policy = Arc::new(CorsPolicy::new(config.cors.allowed_origins.clone()));
    let routes = routes::routes(ctx, policy);

    let host: IpAddr = config
        .server
        .host
        .parse()
        .map_err(|e| AppError::ConfigError(format!("Invalid SERVER_HOST: {}", e)))?;
    let addr = SocketAddr::new(host, config.server.port);

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (bound_addr, server) = warp::serve(routes).bind_with_graceful_shutdown(addr, async {
        shutdown_rx.await.ok();
    });
    let server_handle = tokio::spawn(server);

    info!("Server listening on http://{}", bound_addr);

    signal::ctrl_c()
        .await
        .map_err(|e| AppError::InternalError(format!("Failed to listen for ctrl+c: {}", e)))?;

    info!(
        "Shutdown signal received; draining in-flight requests for up to {}s",
        SHUTDOWN_DRAIN.as_secs()
    );
    let _ = shutdown_tx.send(());

    if tokio::time::timeout(SHUTDOWN_DRAIN, server_handle).await.is_err() {
        warn!("Drain window elapsed; exiting. Unfinished sessions stay `generating` and must be resubmitted.");
    }

    info!("Server shutdown complete");
    Ok(())
}
