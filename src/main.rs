use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::services::ServeDir;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use gardiens::{abuse, api, events, llm, state::AppState, storage, types::GameConfig};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "gardiens=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Les Gardiens de la Lumière...");

    let game_config = GameConfig::from_env();
    let abuse_config = Arc::new(abuse::AbuseConfig::from_env());
    if let Some(limiter) = &abuse_config.rate_limiter {
        limiter.spawn_cleanup();
    }

    let storage_config = storage::StorageConfig::from_env();
    let blobs = storage_config.build_store();

    let llm_config = llm::LlmConfig::from_env();
    let provider = match llm_config.build_provider() {
        Ok(provider) => {
            tracing::info!("LLM provider '{}' initialized", provider.name());
            Some(provider)
        }
        Err(e) => {
            tracing::warn!(
                "Failed to initialize LLM provider: {}. Photo auto-validation and the guide chat are disabled.",
                e
            );
            None
        }
    };

    let state = Arc::new(
        AppState::new()
            .with_config(game_config)
            .with_blob_store(blobs)
            .with_llm(provider, llm_config),
    );

    events::spawn_score_refresher(state.clone());

    let mut app = api::router(state, abuse_config);
    if let Some(dir) = &storage_config.dir {
        app = app.nest_service("/storage", ServeDir::new(dir));
    }

    let port = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080u16);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Listening on http://{}", addr);

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            return;
        }
    };
    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
