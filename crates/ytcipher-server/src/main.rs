//! ytcipher service binary.

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ytcipher_common::AuthConfig;
use ytcipher_server::{
    AppState, BoaPreprocessor, Config, HttpServer, PlayerFileCache, SolverOrchestrator,
    WorkerPool, DEFAULT_PREPROCESSOR,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(
            EnvFilter::from_default_env()
                .add_directive("ytcipher=info".parse().expect("valid directive")),
        )
        .init();

    let config = Config::from_env();
    info!(
        host = %config.host,
        port = config.port,
        workers = config.max_threads,
        auth = config.api_token.is_some(),
        "starting ytcipher"
    );

    let metrics = ytcipher_metrics::init_metrics();

    let bundle: Arc<str> = match &config.preprocessor_path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(bundle) => {
                info!(path = %path.display(), "loaded preprocessor bundle");
                Arc::from(bundle)
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to read preprocessor bundle");
                std::process::exit(1);
            }
        },
        None => Arc::from(DEFAULT_PREPROCESSOR),
    };

    let player_cache = match PlayerFileCache::new(config.cache_dir.clone(), config.key_mode()) {
        Ok(cache) => cache,
        Err(e) => {
            error!(error = %e, "failed to initialize player cache");
            std::process::exit(1);
        }
    };
    match player_cache.sweep() {
        Ok(kept) => info!(entries = kept, dir = %config.cache_dir.display(), "player cache ready"),
        Err(e) => {
            error!(error = %e, "player cache sweep failed");
            std::process::exit(1);
        }
    }

    let pool = WorkerPool::new(config.pool_config(), BoaPreprocessor::factory(bundle));
    let orchestrator = SolverOrchestrator::new(pool, player_cache, config.cache_sizes());

    let auth = match &config.api_token {
        Some(token) => AuthConfig::with_token(token.clone()),
        None => AuthConfig::disabled(),
    };

    let addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(e) => {
            error!(host = %config.host, port = config.port, error = %e, "invalid bind address");
            std::process::exit(1);
        }
    };

    let state = Arc::new(AppState {
        auth,
        orchestrator,
        metrics,
    });

    if let Err(e) = HttpServer::new(state).run(addr).await {
        error!(error = %e, "server error");
        std::process::exit(1);
    }
}
