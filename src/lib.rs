//! polyglot-chat: chat message translation over HTTP and WebSocket.
//! Main library: configuration, engine cache wiring, worker pool and server startup.

pub mod config;
pub mod engine;
pub mod history;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod translate;

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use config::AppConfig;
use engine::LexiconLoader;
use history::MessageStore;
use metrics::MetricsRegistry;
use scheduler::TranslationPool;
use server::AppState;
use translate::{EngineCache, Invoker, PairRegistry, TranslationService};

const DEFAULT_LOG_FILTER: &str = "polyglot_chat=debug,tower_http=info";

/// Build every long-lived component from `config`. Must run inside a tokio runtime.
pub fn build_state(config: &AppConfig) -> anyhow::Result<AppState> {
    let registry = match &config.registry_path {
        Some(path) => PairRegistry::load_from_file(path)
            .with_context(|| format!("loading pair registry from {}", path.display()))?,
        None => PairRegistry::builtin(),
    };
    info!(pairs = registry.len(), "pair registry ready");

    let metrics = Arc::new(MetricsRegistry::new());
    let service = Arc::new(TranslationService::new(
        Arc::new(registry),
        Arc::new(EngineCache::new(config.cache_capacity)),
        Arc::new(LexiconLoader::new(config.model_dir.clone())),
        Invoker::new(config.max_input_tokens, config.generation),
        Arc::clone(&metrics),
    ));
    info!(
        capacity = config.cache_capacity.get(),
        model_dir = %config.model_dir.display(),
        "engine cache ready"
    );

    let pool = TranslationPool::start(
        Arc::clone(&service),
        Arc::clone(&metrics),
        config.workers,
        config.queue_depth,
    )
    .context("starting translation workers")?;

    let store = match &config.database_path {
        Some(path) => Some(
            MessageStore::open(path)
                .with_context(|| format!("opening message store at {}", path.display()))?,
        ),
        None => {
            info!("message history disabled");
            None
        }
    };

    Ok(AppState {
        pool: Arc::new(pool),
        service,
        store,
        metrics,
    })
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    let result = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(e) = result {
        eprintln!("tracing already initialised: {e}");
    }
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::from_env().context("reading configuration")?;
    info!(?config, "polyglot-chat starting");

    let state = build_state(&config)?;
    let pool = Arc::clone(&state.pool);
    let app = server::router(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!(addr = %config.bind_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    match Arc::try_unwrap(pool) {
        Ok(pool) => {
            tokio::task::spawn_blocking(move || pool.shutdown())
                .await
                .context("joining translation workers")?;
        }
        Err(_) => warn!("translation pool still referenced at shutdown, workers left detached"),
    }
    info!("polyglot-chat stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
